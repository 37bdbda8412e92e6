//! driver
//!
//! The host-facing channel surface. Every entry point locks the channel,
//! holds the handle's counted reference for the duration, and unlocks
//! around anything that may call back into host code.

use crate::{
    channel::{
        io, Channel, ChannelFlags, ChannelInner, ChannelState, Directions, Interest, Notifier,
        Owner,
    },
    error::{ChannelError, INVALID_ARG},
    ready, thread,
};
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::debug;

/// Generic options served by the driver surface for every family
const GENERIC_OPTIONS: &[&str] = &[
    "maxpendingreads",
    "maxpendingwrites",
    "pendingreads",
    "pendingwrites",
];

/// Attach or detach the channel from the calling host thread
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadAction {
    Attach,
    Detach,
}

/// The host's handle to a channel. Owns one counted reference; cloning
/// takes another. Closing is explicit; dropping the handle only releases
/// the reference.
#[derive(Clone)]
pub struct ChannelHandle {
    chan: Arc<Channel>,
}

impl ChannelHandle {
    pub(crate) fn new(chan: Arc<Channel>) -> ChannelHandle {
        ChannelHandle { chan }
    }

    #[cfg(test)]
    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.chan
    }

    /// Read up to `out.len()` bytes. `Ok(0)` is remote EOF (or a read-shut
    /// channel). Non-blocking channels report [`ChannelError::WouldBlock`]
    /// instead of waiting.
    pub fn input(&self, out: &mut [u8]) -> Result<usize, ChannelError> {
        io::channel_input(&self.chan, out)
    }

    /// Write `data`, returning the byte count one posted operation covered
    pub fn output(&self, data: &[u8]) -> Result<usize, ChannelError> {
        io::channel_output(&self.chan, data)
    }

    /// Replace the watch-interest mask. Newly watched conditions that are
    /// already satisfied fire on the owning thread's next loop tick.
    pub fn watch(&self, interest: Interest) {
        let mut g = self.chan.lock();
        let readable = if g.state == ChannelState::Listening {
            ChannelFlags::WATCH_ACCEPT
        } else {
            ChannelFlags::WATCH_INPUT
        };
        g.flags.remove(ChannelFlags::WATCH_ANY);
        if interest.contains(Interest::READABLE) {
            g.flags.insert(readable);
        }
        if interest.contains(Interest::WRITABLE) {
            g.flags.insert(ChannelFlags::WATCH_OUTPUT);
        }
        if g.flags.intersects(ChannelFlags::WATCH_ANY) {
            ready::ready_enqueue(&self.chan, &mut g, true);
        }
    }

    /// Install the callback that delivers readiness notifications. Invoked
    /// with the channel unlocked.
    pub fn set_notifier<F>(&self, notify: F)
    where
        F: Fn(Interest) + Send + Sync + 'static,
    {
        self.chan.lock().notifier = Some(Arc::new(notify) as Notifier);
    }

    /// Blocking (default) or non-blocking mode
    pub fn set_blocking(&self, blocking: bool) {
        let mut g = self.chan.lock();
        if blocking {
            g.flags.remove(ChannelFlags::NONBLOCKING);
        } else {
            g.flags.insert(ChannelFlags::NONBLOCKING);
        }
    }

    pub fn state(&self) -> ChannelState {
        self.chan.lock().state
    }

    /// Raw platform code of the most recent failure, for diagnostics
    pub fn last_error(&self) -> Option<i32> {
        match self.chan.lock().last_error {
            0 => None,
            raw => Some(raw as i32),
        }
    }

    /// Move the channel onto or off the calling host thread
    pub fn thread_action(&self, action: ThreadAction) {
        let mut g = self.chan.lock();
        match action {
            ThreadAction::Attach => {
                attach_current(&mut g);
                // Completions delivered while detached are picked up here
                ready::nudge(&self.chan, &mut g, ChannelFlags::empty(), true);
            }
            ThreadAction::Detach => {
                debug!("channel detached");
                g.owner = None;
            }
        }
    }

    /// Close both directions. Idempotent; outstanding completions are
    /// discarded by the worker and the channel is freed once the last of
    /// them drains.
    pub fn close(&self) {
        let mut g = self.chan.lock();
        if g.state == ChannelState::Closed {
            return;
        }
        debug!(state = ?g.state, "closing channel");
        g.state = ChannelState::Closed;
        {
            let inner: &mut ChannelInner = &mut *g;
            inner.ops.shutdown(Directions::READ | Directions::WRITE);
        }
        let queued = g.input.take_all();
        g.owner = None;
        g.notifier = None;
        g.flags.remove(ChannelFlags::WATCH_ANY);
        // Anyone parked on the condvar re-reads the state and bails
        self.chan.cond.notify_all();
        drop(g);
        drop(queued);
    }

    /// Shut down one or both directions without closing the channel. A
    /// write half-close with writes still in flight completes after the
    /// last one drains.
    pub fn close_half(&self, dirs: Directions) {
        let mut g = self.chan.lock();
        if g.state == ChannelState::Closed {
            return;
        }
        if dirs.contains(Directions::READ) && !g.flags.contains(ChannelFlags::READ_CLOSED) {
            g.flags.insert(ChannelFlags::READ_CLOSED);
            let inner: &mut ChannelInner = &mut *g;
            inner.ops.shutdown(Directions::READ);
        }
        if dirs.contains(Directions::WRITE)
            && !g
                .flags
                .intersects(ChannelFlags::WRITE_CLOSED | ChannelFlags::WRITE_CLOSE_PENDING)
        {
            if g.pending_writes > 0 {
                debug!(pending = g.pending_writes, "write shutdown deferred");
                g.flags.insert(ChannelFlags::WRITE_CLOSE_PENDING);
            } else {
                g.flags.insert(ChannelFlags::WRITE_CLOSED);
                let inner: &mut ChannelInner = &mut *g;
                inner.ops.shutdown(Directions::WRITE);
            }
        }
    }

    /// Opaque OS handle for the given direction, when the family has one
    pub fn raw_handle(&self, dirs: Directions) -> Option<usize> {
        self.chan.lock().ops.raw_handle(dirs)
    }

    /// Generic option names followed by the family's
    pub fn option_names(&self) -> Vec<&'static str> {
        let g = self.chan.lock();
        let mut names = GENERIC_OPTIONS.to_vec();
        names.extend_from_slice(g.ops.option_names());
        names
    }

    pub fn get_option(&self, name: &str) -> Result<String, ChannelError> {
        let g = self.chan.lock();
        let value = match name {
            "maxpendingreads" => Some(g.max_pending_reads.to_string()),
            "maxpendingwrites" => Some(g.max_pending_writes.to_string()),
            "pendingreads" => Some(g.pending_reads.to_string()),
            "pendingwrites" => Some(g.pending_writes.to_string()),
            _ => g.ops.get_option(name),
        };
        value.ok_or(ChannelError::Os(INVALID_ARG as i32))
    }

    pub fn set_option(&self, name: &str, value: &str) -> Result<(), ChannelError> {
        let mut g = self.chan.lock();
        match name {
            // Caps cannot drop below what is already in flight
            "maxpendingreads" => {
                g.max_pending_reads = parse_cap(value, g.pending_reads)?;
                Ok(())
            }
            "maxpendingwrites" => {
                g.max_pending_writes = parse_cap(value, g.pending_writes)?;
                Ok(())
            }
            _ => {
                let inner: &mut ChannelInner = &mut *g;
                inner.ops.set_option(name, value)
            }
        }
    }
}

fn parse_cap(value: &str, floor: u32) -> Result<u32, ChannelError> {
    match value.parse::<u32>() {
        Ok(cap) if cap > 0 && cap >= floor => Ok(cap),
        _ => Err(ChannelError::Os(INVALID_ARG as i32)),
    }
}

/// Bind the channel to the calling thread, initializing that thread's
/// engine state on first use
pub(crate) fn attach_current(g: &mut MutexGuard<'_, ChannelInner>) {
    let (id, tsd) = thread::ensure_current();
    debug!(thread = id, "channel attached");
    g.owner = Some(Owner { id, tsd });
}
