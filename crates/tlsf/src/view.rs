//! Byte-range access to a live allocation.

use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
};

use snafu::{ResultExt as _, ensure};

use crate::{
    arena::Region,
    codec::Address,
    error::{BufferOverflowSnafu, BufferUnderflowSnafu, ExternalRangeSnafu, IoSnafu, ViewError},
    pool::Binding,
};

/// Scratch size used when streaming between a view and an external buffer.
const STREAM_CHUNK: usize = 8 * 1024;

/// Exclusive window over one allocated chunk.
///
/// A view is the only way to reach the bytes of its chunk. It is neither
/// `Clone` nor `Copy`; giving it back to the allocator consumes it, so a
/// released chunk cannot be touched through a stale view.
///
/// Offsets are relative to the start of the view. Ranges that do not fit in
/// [`size()`](Self::size) fail instead of being truncated.
///
/// # Example
///
/// ```rust
/// use tlsf::{ArenaConfig, BufferAllocator};
///
/// let allocator = BufferAllocator::new(ArenaConfig::for_testing()).unwrap();
/// let mut view = allocator.allocate(5).unwrap();
/// view.put(b"hello").unwrap();
/// assert_eq!(view.to_owned_array().unwrap(), b"hello");
/// allocator.release(view);
/// ```
pub struct BufferView {
    region: Arc<dyn Region>,
    binding: Box<Binding>,
}

impl fmt::Debug for BufferView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferView")
            .field("address", &self.binding.address)
            .field("size", &self.binding.size)
            .field("epoch", &self.binding.epoch)
            .finish_non_exhaustive()
    }
}

impl BufferView {
    pub(crate) fn new(region: Arc<dyn Region>, binding: Box<Binding>) -> Self {
        Self { region, binding }
    }

    pub(crate) fn into_binding(self) -> Box<Binding> {
        self.binding
    }

    /// Number of bytes accessible through this view.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.binding.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Address of the underlying chunk.
    #[must_use]
    pub fn address(&self) -> Address {
        self.binding.address
    }

    /// Allocation epoch the chunk was tagged with.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.binding.epoch
    }

    /// Turns the view into a plain value that can cross queues or FFI.
    ///
    /// The chunk stays allocated; give the result to
    /// [`BufferAllocator::release_raw`](crate::BufferAllocator::release_raw).
    #[must_use]
    pub fn into_raw(self) -> RawView {
        RawView {
            address: self.binding.address,
            size: self.binding.size,
            epoch: self.binding.epoch,
        }
    }

    fn check_read(&self, offset: u64, len: usize) -> Result<u64, ViewError> {
        let len = len as u64;
        let size = self.size();
        ensure!(
            offset.checked_add(len).is_some_and(|end| end <= size),
            BufferUnderflowSnafu { offset, len, size }
        );
        Ok(self.binding.address.payload() + offset)
    }

    fn check_write(&self, offset: u64, len: usize) -> Result<u64, ViewError> {
        let len = len as u64;
        let size = self.size();
        ensure!(
            offset.checked_add(len).is_some_and(|end| end <= size),
            BufferOverflowSnafu { offset, len, size }
        );
        Ok(self.binding.address.payload() + offset)
    }

    /// Fills `dst` from the start of the view.
    pub fn get(&self, dst: &mut [u8]) -> Result<(), ViewError> {
        self.get_at(0, dst)
    }

    /// Copies `len` bytes from the start of the view into `dst[dst_offset..]`.
    pub fn get_into(&self, dst: &mut [u8], dst_offset: usize, len: usize) -> Result<(), ViewError> {
        let dst = external_mut(dst, dst_offset, len)?;
        self.get_at(0, dst)
    }

    /// Fills `dst` from view offset `src_offset`.
    pub fn get_at(&self, src_offset: u64, dst: &mut [u8]) -> Result<(), ViewError> {
        let at = self.check_read(src_offset, dst.len())?;
        self.region.read_at(at, dst).context(IoSnafu)
    }

    /// Copies `len` bytes from view offset `src_offset` into
    /// `dst[dst_offset..]`.
    pub fn get_at_into(
        &self,
        src_offset: u64,
        dst: &mut [u8],
        dst_offset: usize,
        len: usize,
    ) -> Result<(), ViewError> {
        let dst = external_mut(dst, dst_offset, len)?;
        self.get_at(src_offset, dst)
    }

    /// Writes all of `src` at the start of the view.
    pub fn put(&mut self, src: &[u8]) -> Result<(), ViewError> {
        self.put_at(0, src)
    }

    /// Writes `src[src_offset..src_offset + len]` at the start of the view.
    pub fn put_from(&mut self, src: &[u8], src_offset: usize, len: usize) -> Result<(), ViewError> {
        let src = external(src, src_offset, len)?;
        self.put_at(0, src)
    }

    /// Writes all of `src` at view offset `dst_offset`.
    pub fn put_at(&mut self, dst_offset: u64, src: &[u8]) -> Result<(), ViewError> {
        let at = self.check_write(dst_offset, src.len())?;
        self.region.write_at(at, src).context(IoSnafu)
    }

    /// Writes `src[src_offset..src_offset + len]` at view offset `dst_offset`.
    pub fn put_at_from(
        &mut self,
        dst_offset: u64,
        src: &[u8],
        src_offset: usize,
        len: usize,
    ) -> Result<(), ViewError> {
        let src = external(src, src_offset, len)?;
        self.put_at(dst_offset, src)
    }

    /// Streams `len` bytes starting at view offset `src_offset` into `writer`.
    pub fn write_to<W>(&self, src_offset: u64, len: u64, writer: &mut W) -> Result<(), ViewError>
    where
        W: Write + ?Sized,
    {
        let _ = self.check_read(src_offset, usize::try_from(len).unwrap_or(usize::MAX))?;
        let mut scratch = vec![0; STREAM_CHUNK.min(usize::try_from(len).unwrap_or(usize::MAX))];
        let mut done = 0;
        while done < len {
            let step = scratch.len().min(usize::try_from(len - done).unwrap_or(usize::MAX));
            let buf = &mut scratch[..step];
            self.get_at(src_offset + done, buf)?;
            writer.write_all(buf).context(IoSnafu)?;
            done += step as u64;
        }
        Ok(())
    }

    /// Fills `len` bytes starting at view offset `dst_offset` from `reader`.
    ///
    /// Fails with an `UnexpectedEof` I/O error if the reader runs dry first.
    pub fn read_from<R>(&mut self, dst_offset: u64, len: u64, reader: &mut R) -> Result<(), ViewError>
    where
        R: Read + ?Sized,
    {
        let _ = self.check_write(dst_offset, usize::try_from(len).unwrap_or(usize::MAX))?;
        let mut scratch = vec![0; STREAM_CHUNK.min(usize::try_from(len).unwrap_or(usize::MAX))];
        let mut done = 0;
        while done < len {
            let step = scratch.len().min(usize::try_from(len - done).unwrap_or(usize::MAX));
            let buf = &mut scratch[..step];
            reader.read_exact(buf).context(IoSnafu)?;
            self.put_at(dst_offset + done, buf)?;
            done += step as u64;
        }
        Ok(())
    }

    /// Copies the whole view into a new vector.
    pub fn to_owned_array(&self) -> Result<Vec<u8>, ViewError> {
        let len = usize::try_from(self.size()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                "view does not fit in addressable memory",
            )
        });
        let mut buf = vec![0; len.context(IoSnafu)?];
        self.get(&mut buf)?;
        Ok(buf)
    }
}

fn external(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], ViewError> {
    let available = buf.len();
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| {
            ExternalRangeSnafu {
                offset,
                len,
                available,
            }
            .build()
        })
}

fn external_mut(buf: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ViewError> {
    let available = buf.len();
    offset
        .checked_add(len)
        .and_then(|end| buf.get_mut(offset..end))
        .ok_or_else(|| {
            ExternalRangeSnafu {
                offset,
                len,
                available,
            }
            .build()
        })
}

/// Detached description of a live allocation.
///
/// Carries no access to the arena. Releasing the same `RawView` twice, or a
/// `RawView` whose chunk has since been reallocated, fails with
/// [`ReleaseError::DoubleRelease`](crate::ReleaseError::DoubleRelease).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawView {
    pub address: Address,
    pub size: u64,
    pub epoch: u64,
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arena::MemoryRegion, codec::PAYLOAD_OFFSET};

    fn view(size: u64) -> (Arc<MemoryRegion>, BufferView) {
        let region = Arc::new(MemoryRegion::new(4096).unwrap());
        let binding = Box::new(Binding {
            address: Address::new(64),
            size,
            epoch: 1,
        });
        let view = BufferView::new(Arc::clone(&region) as Arc<dyn Region>, binding);
        (region, view)
    }

    #[test]
    fn test_put_then_get() {
        let (region, mut view) = view(16);
        view.put(b"0123456789abcdef").unwrap();
        let mut buf = [0u8; 16];
        view.get(&mut buf).unwrap();
        assert_eq!(&buf, b"0123456789abcdef");

        // bytes land right after the chunk header
        let mut raw = [0u8; 4];
        region.read_at(64 + PAYLOAD_OFFSET, &mut raw).unwrap();
        assert_eq!(&raw, b"0123");
    }

    #[test]
    fn test_offset_variants() {
        let (_region, mut view) = view(10);
        view.put_at_from(4, b"xxabcxx", 2, 3).unwrap();
        view.put_from(b"QRS", 1, 2).unwrap();

        let mut dst = [b'.'; 6];
        view.get_at_into(4, &mut dst, 1, 3).unwrap();
        assert_eq!(&dst, b".abc..");
        view.get_into(&mut dst, 4, 2).unwrap();
        assert_eq!(&dst, b".abcRS");

        let mut tail = [0u8; 3];
        view.get_at(4, &mut tail).unwrap();
        assert_eq!(&tail, b"abc");
    }

    #[test]
    fn test_read_past_end_underflows() {
        let (_region, view) = view(8);
        let mut buf = [0u8; 2];
        let err = view.get_at(7, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            ViewError::BufferUnderflow {
                offset: 7,
                len: 2,
                size: 8,
                ..
            }
        ));
        assert!(view.get_at(u64::MAX, &mut buf).is_err());
        view.get_at(6, &mut buf).unwrap();
    }

    #[test]
    fn test_write_past_end_overflows() {
        let (_region, mut view) = view(8);
        let err = view.put_at(4, b"12345").unwrap_err();
        assert!(matches!(err, ViewError::BufferOverflow { .. }));
        view.put_at(4, b"1234").unwrap();
    }

    #[test]
    fn test_external_range_is_checked() {
        let (_region, mut view) = view(8);
        let mut dst = [0u8; 4];
        let err = view.get_into(&mut dst, 2, 3).unwrap_err();
        assert!(matches!(err, ViewError::ExternalRange { available: 4, .. }));
        let err = view.put_from(b"ab", 1, 2).unwrap_err();
        assert!(matches!(err, ViewError::ExternalRange { .. }));
    }

    #[test]
    fn test_stream_through_io() {
        let (_region, mut view) = view(100);
        let data: Vec<u8> = (0..100).collect();
        view.read_from(0, 100, &mut data.as_slice()).unwrap();

        let mut out = Vec::new();
        view.write_to(10, 20, &mut out).unwrap();
        assert_eq!(out, &data[10..30]);

        let err = view.read_from(90, 10, &mut &data[..5]).unwrap_err();
        assert!(matches!(err, ViewError::Io { .. }));
        assert!(view.write_to(90, 11, &mut out).is_err());
    }

    #[test]
    fn test_to_owned_array_and_raw() {
        let (_region, mut view) = view(3);
        view.put(b"xyz").unwrap();
        assert_eq!(view.to_owned_array().unwrap(), b"xyz");
        let raw = view.into_raw();
        assert_eq!(
            raw,
            RawView {
                address: Address::new(64),
                size: 3,
                epoch: 1,
            }
        );
    }
}
