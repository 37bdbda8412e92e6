//! ready
//!
//! Per-thread ready queue and the event-source hooks that bridge it into a
//! cooperative event loop. Completion handlers either wake a host thread
//! parked on the channel condvar or place the channel on its owning
//! thread's ready queue; the thread's `setup`/`check` hooks then turn
//! queued channels into discrete events the loop dispatches.

use crate::{
    channel::{connect, io, Channel, ChannelFlags, ChannelInner, ChannelState, Interest},
    driver::ChannelHandle,
    thread::{self, HostThreadId, LoopWaker, ReadyEntry, ThreadState},
};
use parking_lot::MutexGuard;
use std::{sync::Arc, time::Duration};
use tracing::{debug, trace};

/// Queue the channel on its owning thread's ready queue and alert that
/// thread. No-op for detached channels; unless forced, a channel already
/// queued there is not queued twice.
pub(crate) fn ready_enqueue(
    chan: &Arc<Channel>,
    g: &mut MutexGuard<'_, ChannelInner>,
    force: bool,
) {
    let Some(owner) = g.owner.as_ref() else {
        return;
    };
    let target = owner.id;
    if !force && g.ready_thread == Some(target) {
        return;
    }
    let tsd = Arc::clone(&owner.tsd);
    // Entry allocated before the TSD lock to keep the hold time short
    let entry = ReadyEntry {
        channel: Arc::clone(chan),
    };
    // Lock order: channel, then TSD
    let waker = {
        let mut t = tsd.inner.lock();
        if t.id.is_none() {
            // Thread exited; the entry (and its reference) just goes away
            return;
        }
        g.ready_thread = Some(target);
        t.ready.push(entry);
        t.waker.clone()
    };
    trace!(thread = target, "channel queued ready");
    if thread::current_id() != Some(target) {
        if let Some(wake) = waker {
            wake();
        }
    }
}

/// Wake-or-queue decision after a completion changes channel state: a host
/// thread parked for one of the `block` reasons is signalled and, unless
/// forced, nothing more happens; otherwise a watched (or forced) channel is
/// queued ready.
pub(crate) fn nudge(
    chan: &Arc<Channel>,
    g: &mut MutexGuard<'_, ChannelInner>,
    block: ChannelFlags,
    force: bool,
) {
    if g.flags.intersects(block) {
        g.flags.remove(block);
        chan.cond.notify_all();
        if !force {
            return;
        }
    }
    if force || g.flags.intersects(ChannelFlags::WATCH_ANY) {
        ready_enqueue(chan, g, force);
    }
}

/// The two event-loop hooks for one registered host thread.
///
/// The host calls [`EventSource::setup`] before its loop blocks and
/// [`EventSource::check`] after it wakes, queueing the produced events for
/// dispatch via [`ChannelEvent::service`].
pub struct EventSource {
    id: HostThreadId,
    tsd: Arc<ThreadState>,
}

impl EventSource {
    /// Register the current thread with the engine. `waker` is invoked from
    /// other threads whenever this thread's ready queue gains work while
    /// its loop may be blocked.
    pub fn register<W>(waker: W) -> EventSource
    where
        W: Fn() + Send + Sync + 'static,
    {
        let (id, tsd) = thread::set_current_waker(Arc::new(waker) as LoopWaker);
        EventSource { id, tsd }
    }

    /// Before the loop blocks: a non-empty ready queue means the loop
    /// should poll immediately instead of waiting.
    pub fn setup(&self) -> Option<Duration> {
        if self.tsd.inner.lock().ready.is_empty() {
            None
        } else {
            Some(Duration::ZERO)
        }
    }

    /// After the loop wakes: swap the ready queue out and convert entries
    /// into events. A channel no longer owned by this thread, or one that
    /// already has an event queued here, just drops its reference.
    pub fn check<F>(&self, mut sink: F)
    where
        F: FnMut(ChannelEvent),
    {
        let entries = self.tsd.inner.lock().ready.take_all();
        for entry in entries {
            let chan = entry.channel;
            let mut g = chan.lock();
            // Only clear our own mark; the channel may already be queued on
            // a new owner
            if g.ready_thread == Some(self.id) {
                g.ready_thread = None;
            }
            let owned_here = matches!(&g.owner, Some(owner) if owner.id == self.id);
            if owned_here && g.event_thread != Some(self.id) {
                g.event_thread = Some(self.id);
                drop(g);
                // The entry's reference moves into the event
                sink(ChannelEvent { channel: chan });
            }
        }
    }
}

/// One queued unit of channel attention, dispatched by the host loop
pub struct ChannelEvent {
    channel: Arc<Channel>,
}

impl ChannelEvent {
    /// Dispatch the event. Always consumes it; the reference it carried is
    /// released on return.
    pub fn service(self) -> bool {
        let chan = self.channel;
        let mut g = chan.lock();
        g.event_thread = None;
        match g.state {
            ChannelState::Listening => accept_ready(&chan, &mut g),
            state if state.connect_in_progress() => {
                connect::connection_step(&chan, &mut g, false)
            }
            ChannelState::Open | ChannelState::ConnectFailed | ChannelState::Disconnected => {
                notify_channel(&mut g)
            }
            state => trace!(?state, "event ignored"),
        }
        true
    }
}

/// Compute the readiness mask and deliver it through the channel's
/// notifier with the lock released.
fn notify_channel(g: &mut MutexGuard<'_, ChannelInner>) {
    let mut mask = Interest::empty();
    if g.flags.contains(ChannelFlags::WATCH_INPUT)
        && (!g.input.is_empty() || g.flags.contains(ChannelFlags::REMOTE_EOF))
    {
        mask |= Interest::READABLE;
    }
    if g.flags.contains(ChannelFlags::WATCH_OUTPUT)
        && g.flags.contains(ChannelFlags::NOTIFY_WRITES)
        && g.state == ChannelState::Open
        && g.pending_writes < g.max_pending_writes
    {
        mask |= Interest::WRITABLE;
    }
    if mask.is_empty() {
        return;
    }
    let Some(notify) = g.notifier.clone() else {
        return;
    };
    trace!(?mask, "notifying host");
    // State may have moved while unlocked; callers re-read after this
    MutexGuard::unlocked(g, || notify(mask));
}

/// Take one accepted connection off the listener queue, build the child and
/// hand it to the listener callback with the lock released.
fn accept_ready(chan: &Arc<Channel>, g: &mut MutexGuard<'_, ChannelInner>) {
    let Some(buf) = g.input.pop() else {
        return;
    };
    let accepted = {
        let inner: &mut ChannelInner = &mut *g;
        inner.ops.accept(buf)
    };
    // Keep the accept pipeline full regardless of how this one went
    let _ = io::post_reads(chan, g);
    match accepted {
        Err(e) => debug!(error = %e, "accept failed"),
        Ok(accepted) => {
            if !g.input.is_empty() {
                // One accept per event; more connections are waiting
                ready_enqueue(chan, g, true);
            }
            let notify = Arc::clone(&accepted.notify);
            let handle = ChannelHandle::new(accepted.channel);
            let peer = accepted.peer;
            MutexGuard::unlocked(g, || notify(handle, &peer));
        }
    }
}
