//! Solarflare SFC9xxx ("sfvmk") network adapter driver core.

pub mod adapter;
pub mod driver;
pub mod efx;
pub mod ev;
pub mod intr;
pub mod mcdi;
pub mod mgmt;
pub mod nvram;
pub mod port;
pub mod rx;
pub mod tx;
pub mod uplink;
pub mod vpd;

pub use adapter::Adapter;
pub use driver::{AdapterId, DriverConfig, DriverContext};

use core::sync::atomic::{AtomicU8, Ordering};

// Flush wait: 20 polls at 100ms
pub(crate) const FLUSH_POLL_INTERVAL_US: u32 = 100_000;
pub(crate) const FLUSH_POLL_COUNT: u32 = 20;

/// Lifecycle of a receive or transmit queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueState {
    Uninitialized,
    Initialized,
    Started,
}

/// Teardown flush progress of a receive or transmit queue.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushState {
    Done = 0,
    Required = 1,
    Pending = 2,
    Failed = 3,
}

/// Flush state shared between the stop path and event dispatch.
#[derive(Debug)]
pub struct AtomicFlushState(AtomicU8);

impl AtomicFlushState {
    pub const fn new(state: FlushState) -> AtomicFlushState {
        AtomicFlushState(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> FlushState {
        match self.0.load(Ordering::Acquire) {
            0 => FlushState::Done,
            1 => FlushState::Required,
            2 => FlushState::Pending,
            _ => FlushState::Failed,
        }
    }

    pub fn store(&self, state: FlushState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `current` to `new`; returns false if another context got there first.
    pub fn transition(&self, current: FlushState, new: FlushState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Snapshot of a ring's producer/consumer counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RingCounters {
    pub added: u32,
    pub pushed: u32,
    pub pending: u32,
    pub completed: u32,
    pub reaped: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub packets: u64,
    pub bytes: u64,
    pub drops: u64,
}
