//! Backing stores for an arena.
//!
//! A [`Region`] is a fixed-length byte range addressed by offsets starting at
//! zero. Every [`Address`](crate::Address) handed out by the allocator is such
//! an offset, so the rest of the crate never sees a native pointer.
//!
//! Two stores are provided:
//!
//! - [`MemoryRegion`]: one page-aligned heap block, the off-heap arena proper.
//!   Boundary tags live inside it and are accessed through
//!   [`InBandCodec`](crate::InBandCodec).
//! - [`FileRegion`]: a file of fixed length, used when the allocator manages
//!   disk extents. Its boundary tags live in a
//!   [`SideTableCodec`](crate::SideTableCodec).

use std::{
    alloc::{self, Layout},
    fmt,
    fs::File,
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
    ptr::{self, NonNull},
};

use parking_lot::Mutex;

/// Alignment of the base of a [`MemoryRegion`].
pub const REGION_ALIGNMENT: usize = 4096;

/// A fixed-length byte store that arena views copy data in and out of.
///
/// Callers of `read_at`/`write_at` guarantee that concurrent calls touch
/// disjoint ranges; the allocator ensures this by handing each live chunk to
/// exactly one view.
pub trait Region: Send + Sync + fmt::Debug {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> io::Result<()>;

    fn write_at(&self, offset: u64, src: &[u8]) -> io::Result<()>;
}

fn check_range(region_len: u64, offset: u64, len: usize) -> io::Result<()> {
    let end = offset.checked_add(len as u64);
    if end.is_none_or(|end| end > region_len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("range {offset}+{len} is outside a region of {region_len} bytes"),
        ));
    }
    Ok(())
}

/// A zero-initialized, page-aligned block of process memory.
pub struct MemoryRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is owned exclusively by this value and is only accessed
// through raw pointer copies on ranges the allocator keeps disjoint.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("base", &self.ptr)
            .field("len", &self.layout.size())
            .finish()
    }
}

impl MemoryRegion {
    pub fn new(len: u64) -> io::Result<Self> {
        let size = usize::try_from(len)
            .ok()
            .filter(|&size| size > 0)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot map a region of {len} bytes"),
                )
            })?;
        let layout = Layout::from_size_align(size, REGION_ALIGNMENT)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Self { ptr, layout })
    }

    /// Reads the metadata word stored at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the word is not entirely inside the region.
    pub(crate) fn load_word(&self, offset: u64) -> u64 {
        self.assert_word(offset);
        // SAFETY: bounds checked above; words may sit at any 4-byte boundary.
        unsafe { self.byte_ptr(offset).cast::<u64>().read_unaligned() }
    }

    /// Writes the metadata word stored at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the word is not entirely inside the region.
    pub(crate) fn store_word(&self, offset: u64, value: u64) {
        self.assert_word(offset);
        // SAFETY: bounds checked above; the allocator lock serializes every
        // metadata write and no live view covers a boundary tag.
        unsafe { self.byte_ptr(offset).cast::<u64>().write_unaligned(value) }
    }

    /// Pointer to byte `offset`; callers check `offset` against the length,
    /// which itself fits in `usize`.
    #[expect(clippy::cast_possible_truncation)]
    fn byte_ptr(&self, offset: u64) -> *mut u8 {
        self.ptr.as_ptr().wrapping_add(offset as usize)
    }

    fn assert_word(&self, offset: u64) {
        assert!(
            offset.checked_add(8).is_some_and(|end| end <= self.len()),
            "metadata word at {offset:#x} is outside the region"
        );
    }
}

impl Region for MemoryRegion {
    fn len(&self) -> u64 {
        self.layout.size() as u64
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> io::Result<()> {
        check_range(self.len(), offset, dst.len())?;
        // SAFETY: the source range is inside the block and cannot overlap a
        // caller-owned slice.
        unsafe {
            ptr::copy_nonoverlapping(self.byte_ptr(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> io::Result<()> {
        check_range(self.len(), offset, src.len())?;
        // SAFETY: as in `read_at`.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.byte_ptr(offset), src.len());
        }
        Ok(())
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// A file of fixed length used as an extent store.
#[derive(Debug)]
pub struct FileRegion {
    file: Mutex<File>,
    len: u64,
}

impl FileRegion {
    /// Takes ownership of `file` and sizes it to `len` bytes.
    pub fn new(file: File, len: u64) -> io::Result<Self> {
        file.set_len(len)?;
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl Region for FileRegion {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> io::Result<()> {
        check_range(self.len, offset, dst.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(dst)
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> io::Result<()> {
        check_range(self.len, offset, src.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(src)
    }
}
