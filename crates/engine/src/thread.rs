//! thread
//!
//! Per-host-thread state: the ready queue feeding that thread's event loop
//! and the waker used to alert the loop from other threads. A thread
//! acquires its state block on first use; channels owned by the thread hold
//! a counted reference to it, so the block outlives the thread and the
//! drain paths tolerate finding it orphaned.

use crate::{channel::Channel, queue::Fifo};
use parking_lot::Mutex;
use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::trace;

/// Identity of a host thread that has used the engine. Never reused.
pub type HostThreadId = u64;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Callback that wakes a host thread's event loop from another thread
pub type LoopWaker = Arc<dyn Fn() + Send + Sync>;

/// One entry on a thread's ready queue; owns a counted channel reference
/// that either moves into a queued event or is dropped at drain time.
pub(crate) struct ReadyEntry {
    pub channel: Arc<Channel>,
}

pub(crate) struct ThreadInner {
    /// None once the thread has exited; enqueuers drop their entries
    pub id: Option<HostThreadId>,
    pub ready: Fifo<ReadyEntry>,
    pub waker: Option<LoopWaker>,
}

/// Reference-counted per-thread block. The TSD lock guards the ready queue
/// and the identity; code holding it never takes a channel lock.
pub struct ThreadState {
    pub(crate) inner: Mutex<ThreadInner>,
}

thread_local! {
    static CURRENT: RefCell<Option<Registration>> = const { RefCell::new(None) };
}

struct Registration {
    id: HostThreadId,
    tsd: Arc<ThreadState>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        // Mark the block orphaned, then release the queued channel
        // references outside the TSD lock
        let dropped = {
            let mut t = self.tsd.inner.lock();
            t.id = None;
            t.waker = None;
            t.ready.take_all()
        };
        trace!(thread = self.id, dropped = dropped.len(), "thread state orphaned");
        drop(dropped);
    }
}

/// The current thread's identity and state block, initializing both on
/// first use
pub(crate) fn ensure_current() -> (HostThreadId, Arc<ThreadState>) {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let reg = slot.get_or_insert_with(|| {
            let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            trace!(thread = id, "thread state created");
            Registration {
                id,
                tsd: Arc::new(ThreadState {
                    inner: Mutex::new(ThreadInner {
                        id: Some(id),
                        ready: Fifo::new(),
                        waker: None,
                    }),
                }),
            }
        });
        (reg.id, Arc::clone(&reg.tsd))
    })
}

/// Install (or replace) the waker other threads use to alert this thread's
/// event loop
pub(crate) fn set_current_waker(waker: LoopWaker) -> (HostThreadId, Arc<ThreadState>) {
    let (id, tsd) = ensure_current();
    tsd.inner.lock().waker = Some(waker);
    (id, tsd)
}

/// Identity of the current thread, if it has used the engine
pub(crate) fn current_id() -> Option<HostThreadId> {
    CURRENT.with(|cell| cell.borrow().as_ref().map(|reg| reg.id))
}
