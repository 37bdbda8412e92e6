//! stats
//!
//! Allocation counters for the three object classes the engine hands across
//! threads. The counters are monotonic so a snapshot can be compared against
//! an earlier baseline; at quiescence every alloc column equals its free
//! column.

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) static CHANNEL_ALLOCS: AtomicU64 = AtomicU64::new(0);
pub(crate) static CHANNEL_FREES: AtomicU64 = AtomicU64::new(0);
pub(crate) static BUFFER_ALLOCS: AtomicU64 = AtomicU64::new(0);
pub(crate) static BUFFER_FREES: AtomicU64 = AtomicU64::new(0);
pub(crate) static DATA_ALLOCS: AtomicU64 = AtomicU64::new(0);
pub(crate) static DATA_FREES: AtomicU64 = AtomicU64::new(0);

#[inline(always)]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A point-in-time copy of the six engine counters
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Stats {
    pub channel_allocs: u64,
    pub channel_frees: u64,
    pub buffer_allocs: u64,
    pub buffer_frees: u64,
    pub data_allocs: u64,
    pub data_frees: u64,
}

impl Stats {
    /// True when every alloc column matches its free column
    pub fn balanced(&self) -> bool {
        self.channel_allocs == self.channel_frees
            && self.buffer_allocs == self.buffer_frees
            && self.data_allocs == self.data_frees
    }

    /// Counter movement since an earlier snapshot
    pub fn since(&self, baseline: &Stats) -> Stats {
        Stats {
            channel_allocs: self.channel_allocs - baseline.channel_allocs,
            channel_frees: self.channel_frees - baseline.channel_frees,
            buffer_allocs: self.buffer_allocs - baseline.buffer_allocs,
            buffer_frees: self.buffer_frees - baseline.buffer_frees,
            data_allocs: self.data_allocs - baseline.data_allocs,
            data_frees: self.data_frees - baseline.data_frees,
        }
    }
}

/// Snapshot the engine allocation counters
pub fn stats() -> Stats {
    Stats {
        channel_allocs: CHANNEL_ALLOCS.load(Ordering::Relaxed),
        channel_frees: CHANNEL_FREES.load(Ordering::Relaxed),
        buffer_allocs: BUFFER_ALLOCS.load(Ordering::Relaxed),
        buffer_frees: BUFFER_FREES.load(Ordering::Relaxed),
        data_allocs: DATA_ALLOCS.load(Ordering::Relaxed),
        data_frees: DATA_FREES.load(Ordering::Relaxed),
    }
}
