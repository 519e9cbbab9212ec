//! Admission control for TLSF buffer arenas.
//!
//! An [`AdmissionGate`] turns the nominal capacity of a
//! [`tlsf::BufferAllocator`] into sector tokens. Callers wait, in arrival
//! order and for a bounded time, until enough sectors are free before the
//! allocator is asked for a chunk. This applies backpressure to writers of a
//! storage node instead of letting them fail as soon as the arena fills up.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use admission::{AdmissionGate, GateError};
//!
//! let gate = AdmissionGate::new(4 * 512, 512, "sdb").unwrap();
//! let view = gate.allocate(2048, Duration::ZERO).unwrap();
//!
//! let err = gate.allocate(512, Duration::from_millis(1)).unwrap_err();
//! assert!(matches!(err, GateError::Timeout { .. }));
//!
//! gate.release(view);
//! ```

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod config;
mod error;
mod gate;
mod semaphore;

pub use self::{
    config::{DEFAULT_SECTOR_SIZE, GateConfig},
    error::GateError,
    gate::{AdmissionGate, GateStats},
    semaphore::FairSemaphore,
};
