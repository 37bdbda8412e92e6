//! worker
//!
//! The completion worker: one long-running thread that blocks on the
//! engine's port, recovers the posted buffer from each completion and runs
//! the per-operation handler under the owning channel's lock. Mutual
//! exclusion per channel comes entirely from the channel lock, so the
//! design tolerates the port delivering completions in any order across
//! channels.

use crate::{
    buffer::{Buffer, OpKind},
    channel::{Channel, ChannelFlags, ChannelInner, ChannelState, Directions},
    port::{IoPort, PortEvent},
    ready,
};
use crossbeam::channel::Sender;
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, trace};

/// Worker main loop. Exits on the null-overlapped sentinel and acknowledges
/// through `ack` so shutdown can be bounded.
pub(crate) fn run(port: Arc<dyn IoPort>, ack: Sender<()>) {
    debug!("completion worker running");
    loop {
        match port.wait() {
            PortEvent::Shutdown => break,
            PortEvent::Packet(packet) => {
                // Safety: the pointer was leaked by Buffer::into_overlapped
                // when the operation was posted and is delivered exactly
                // once
                let mut buf = unsafe { Buffer::from_overlapped(packet.overlapped) };
                // A packet-level error wins; otherwise whatever the poster
                // recorded on the buffer stands
                if packet.error != 0 {
                    buf.error = packet.error;
                }
                if buf.error == 0 && matches!(buf.op, OpKind::Read | OpKind::Accept) {
                    // Safety: the kernel initialized this many bytes
                    unsafe { buf.set_filled(packet.bytes) };
                }
                dispatch(buf);
            }
        }
    }
    debug!("completion worker exiting");
    let _ = ack.send(());
}

fn dispatch(mut buf: Box<Buffer>) {
    let Some(chan) = buf.take_owner() else {
        // Orphaned operation; nothing left to tell
        trace!(op = ?buf.op, "completion without owner dropped");
        return;
    };
    let mut g = chan.lock();
    if buf.error != 0 {
        let refined = {
            let inner: &mut ChannelInner = &mut *g;
            inner.ops.translate_error(&buf)
        };
        buf.error = refined;
    }
    trace!(op = ?buf.op, error = buf.error, len = buf.data.len(), "dispatching completion");
    match buf.op {
        OpKind::Read => read_done(&chan, &mut g, buf),
        OpKind::Write => write_done(&chan, &mut g, buf),
        OpKind::Connect => connect_done(&chan, &mut g, buf),
        OpKind::Disconnect => disconnect_done(&chan, &mut g, buf),
        OpKind::Accept => accept_done(&chan, &mut g, buf),
    }
    finish_pending_half_close(&mut g);
    g.assert_invariants();
    // The guard drops first, then the worker's channel reference
}

fn read_done(chan: &Arc<Channel>, g: &mut MutexGuard<'_, ChannelInner>, buf: Box<Buffer>) {
    debug_assert!(g.pending_reads > 0);
    g.pending_reads -= 1;
    if g.state == ChannelState::Closed || g.flags.contains(ChannelFlags::READ_CLOSED) {
        // Closed (or read-shut) under pending reads: the buffer is
        // discarded and the worker's channel reference goes with it
        return;
    }
    // The input queue lives inside the channel, so the worker's counted
    // reference covers the move; the buffer itself carries none
    g.input.push(buf);
    ready::nudge(chan, g, ChannelFlags::BLOCKED_READ, false);
}

fn write_done(chan: &Arc<Channel>, g: &mut MutexGuard<'_, ChannelInner>, buf: Box<Buffer>) {
    debug_assert!(g.pending_writes > 0);
    g.pending_writes -= 1;
    if g.state == ChannelState::Closed {
        return;
    }
    if buf.error != 0 {
        debug!(error = buf.error, "write completion failed");
        g.last_error = buf.error;
    }
    ready::nudge(chan, g, ChannelFlags::BLOCKED_WRITE, false);
}

fn connect_done(chan: &Arc<Channel>, g: &mut MutexGuard<'_, ChannelInner>, buf: Box<Buffer>) {
    if g.state == ChannelState::Closed {
        return;
    }
    if g.state != ChannelState::Connecting {
        debug!(state = ?g.state, "stray connect completion");
        return;
    }
    if buf.error != 0 {
        g.last_error = buf.error;
        g.state = ChannelState::ConnectRetry;
    } else {
        g.state = ChannelState::Connected;
    }
    // Forced: the connect must progress even when nothing is watched yet
    ready::nudge(chan, g, ChannelFlags::BLOCKED_CONNECT, true);
}

fn disconnect_done(chan: &Arc<Channel>, g: &mut MutexGuard<'_, ChannelInner>, buf: Box<Buffer>) {
    drop(buf);
    if g.state == ChannelState::Closed {
        return;
    }
    // Flush acknowledgement for a graceful disconnect; wake anyone waiting
    // on the close
    ready::nudge(chan, g, ChannelFlags::empty(), true);
}

fn accept_done(chan: &Arc<Channel>, g: &mut MutexGuard<'_, ChannelInner>, buf: Box<Buffer>) {
    debug_assert!(g.pending_reads > 0);
    g.pending_reads -= 1;
    if g.state != ChannelState::Listening {
        return;
    }
    if buf.error != 0 {
        debug!(error = buf.error, "accept completion failed");
        g.last_error = buf.error;
        return;
    }
    g.input.push(buf);
    // Accept processing is not gated on a watch
    ready::nudge(chan, g, ChannelFlags::empty(), true);
}

/// A write half-close issued while writes were in flight finishes here,
/// once the last one completes.
fn finish_pending_half_close(g: &mut MutexGuard<'_, ChannelInner>) {
    if g.flags.contains(ChannelFlags::WRITE_CLOSE_PENDING) && g.pending_writes == 0 {
        debug!("finishing deferred write shutdown");
        g.flags.remove(ChannelFlags::WRITE_CLOSE_PENDING);
        g.flags.insert(ChannelFlags::WRITE_CLOSED);
        let inner: &mut ChannelInner = &mut *g;
        inner.ops.shutdown(Directions::WRITE);
    }
}
