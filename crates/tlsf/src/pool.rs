//! Recycling of view handles.
//!
//! Every [`BufferView`](crate::BufferView) keeps its binding in a boxed
//! [`Binding`]. Released views hand their box back to a [`HandlePool`] so the
//! data path does not hit the global allocator on every allocate/release pair.

use crate::codec::{Address, TOMBSTONE};

/// Where a view points: one live chunk and the epoch it was tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Binding {
    pub(crate) address: Address,
    pub(crate) size: u64,
    pub(crate) epoch: u64,
}

impl Binding {
    const DETACHED: Self = Self {
        address: Address::NULL,
        size: 0,
        epoch: TOMBSTONE,
    };
}

/// A bounded stack of detached bindings.
#[derive(Debug)]
pub(crate) struct HandlePool {
    shells: Vec<Box<Binding>>,
    capacity: usize,
    reused: u64,
}

impl HandlePool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            shells: Vec::new(),
            capacity,
            reused: 0,
        }
    }

    /// Binds a recycled shell, or a fresh one if the pool is empty.
    pub(crate) fn take(&mut self, address: Address, size: u64, epoch: u64) -> Box<Binding> {
        let binding = Binding {
            address,
            size,
            epoch,
        };
        match self.shells.pop() {
            Some(mut shell) => {
                self.reused += 1;
                *shell = binding;
                shell
            }
            None => Box::new(binding),
        }
    }

    /// Detaches `shell` and keeps it if there is room.
    pub(crate) fn give(&mut self, mut shell: Box<Binding>) {
        *shell = Binding::DETACHED;
        if self.shells.len() < self.capacity {
            self.shells.push(shell);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.shells.len()
    }

    /// Number of `take` calls served from the pool.
    pub(crate) fn reused(&self) -> u64 {
        self.reused
    }
}
