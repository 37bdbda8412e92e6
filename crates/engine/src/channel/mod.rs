//! channel

pub mod connect;
pub mod io;
pub mod ops;

use crate::{
    buffer::Buffer,
    queue::Fifo,
    stats::{self, CHANNEL_ALLOCS, CHANNEL_FREES},
    thread::{HostThreadId, ThreadState},
};
use bitflags::bitflags;
use self::ops::ChannelOps;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;

pub(crate) const DEFAULT_MAX_PENDING_READS: u32 = 3;
pub(crate) const DEFAULT_MAX_PENDING_WRITES: u32 = 3;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ChannelFlags: u32 {
        /// Host wants readable notifications
        const WATCH_INPUT = 1 << 0;
        /// Host wants writable notifications
        const WATCH_OUTPUT = 1 << 1;
        /// Listener accepts are being watched
        const WATCH_ACCEPT = 1 << 2;
        /// Write completions may produce writable notifications (set when
        /// the channel reaches OPEN)
        const NOTIFY_WRITES = 1 << 3;
        /// Non-blocking mode: input/output never wait on the condvar
        const NONBLOCKING = 1 << 4;
        /// Read side shut down; reads return EOF
        const READ_CLOSED = 1 << 5;
        /// Write side shut down
        const WRITE_CLOSED = 1 << 6;
        /// Peer closed or reset; reads return EOF
        const REMOTE_EOF = 1 << 7;
        /// A host thread is waiting on the condvar for a connect
        const BLOCKED_CONNECT = 1 << 8;
        /// A host thread is waiting on the condvar for input
        const BLOCKED_READ = 1 << 9;
        /// A host thread is waiting on the condvar for write room
        const BLOCKED_WRITE = 1 << 10;
        /// Write half-close requested while writes were still in flight;
        /// the worker finishes the shutdown when the last one completes
        const WRITE_CLOSE_PENDING = 1 << 11;
    }
}

impl ChannelFlags {
    pub(crate) const WATCH_ANY: ChannelFlags = ChannelFlags::WATCH_INPUT
        .union(ChannelFlags::WATCH_OUTPUT)
        .union(ChannelFlags::WATCH_ACCEPT);
}

bitflags! {
    /// Readiness mask handed to the host notifier
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

bitflags! {
    /// Direction set for shutdown, half-close and handle queries
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Directions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Listening,
    Connecting,
    ConnectRetry,
    Connected,
    Open,
    ConnectFailed,
    Disconnected,
    Closed,
}

impl ChannelState {
    /// Connection establishment has started but the channel is not yet
    /// usable for data
    pub fn connect_in_progress(&self) -> bool {
        matches!(
            self,
            ChannelState::Connecting | ChannelState::ConnectRetry | ChannelState::Connected
        )
    }
}

/// Per-channel host notification callback, invoked with the channel
/// unlocked
pub type Notifier = Arc<dyn Fn(Interest) + Send + Sync>;

/// The host thread a channel currently belongs to
pub(crate) struct Owner {
    pub id: HostThreadId,
    pub tsd: Arc<ThreadState>,
}

/// Everything the channel lock guards
pub struct ChannelInner {
    pub(crate) state: ChannelState,
    pub(crate) flags: ChannelFlags,
    pub(crate) pending_reads: u32,
    pub(crate) pending_writes: u32,
    pub(crate) max_pending_reads: u32,
    pub(crate) max_pending_writes: u32,
    /// Completed read buffers awaiting the host; doubles as the accept
    /// queue for listeners. Buffers in here carry no owner reference.
    pub(crate) input: Fifo<Box<Buffer>>,
    pub(crate) owner: Option<Owner>,
    /// Thread whose ready queue last received this channel; suppresses
    /// redundant enqueues
    pub(crate) ready_thread: Option<HostThreadId>,
    /// Thread whose event loop currently holds a queued event for this
    /// channel
    pub(crate) event_thread: Option<HostThreadId>,
    /// Raw platform code of the most recent failure
    pub(crate) last_error: u32,
    pub(crate) notifier: Option<Notifier>,
    pub(crate) ops: Box<dyn ChannelOps>,
}

/// A logical endpoint exposed to the host as a read/write stream.
///
/// Always handed around as `Arc<Channel>`: the kernel (through in-flight
/// buffers), the ready queues, queued events and the host handle each own
/// one counted reference. Every field lives behind the single channel lock;
/// paths that call out to the host unlock first and re-read state after
/// relocking.
pub struct Channel {
    inner: Mutex<ChannelInner>,
    pub(crate) cond: Condvar,
}

impl Channel {
    pub(crate) fn new(ops: Box<dyn ChannelOps>, state: ChannelState) -> Arc<Channel> {
        stats::bump(&CHANNEL_ALLOCS);
        Arc::new(Channel {
            inner: Mutex::new(ChannelInner {
                state,
                flags: ChannelFlags::empty(),
                pending_reads: 0,
                pending_writes: 0,
                max_pending_reads: DEFAULT_MAX_PENDING_READS,
                max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
                input: Fifo::new(),
                owner: None,
                ready_thread: None,
                event_thread: None,
                last_error: 0,
                notifier: None,
                ops,
            }),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Remaining input buffers and the family ops (which closes any OS
        // handles still open) go down with the inner state
        stats::bump(&CHANNEL_FREES);
    }
}

impl ChannelInner {
    /// Debug-only invariant sweep, run after worker dispatch
    #[inline]
    pub(crate) fn assert_invariants(&self) {
        debug_assert!(self.pending_reads <= self.max_pending_reads);
        debug_assert!(self.pending_writes <= self.max_pending_writes);
        debug_assert!(
            !matches!(
                self.state,
                ChannelState::Connecting | ChannelState::ConnectRetry
            ) || self.input.is_empty()
        );
    }
}
