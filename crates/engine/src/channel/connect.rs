//! Connection establishment state machine.
//!
//! The worker moves CONNECTING to CONNECTED or CONNECT_RETRY as
//! completions arrive; everything else happens here, driven by
//! [`connection_step`] from the event handler (non-blocking) or from a
//! host thread performing a blocking operation.

use super::{Channel, ChannelFlags, ChannelInner, ChannelState};
use crate::{channel::ops::ConnectVerdict, ready};
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::debug;

/// Advance the connection state machine one or more steps. With `blockable`
/// set the call may wait on the channel condvar; otherwise it never blocks.
/// Callers re-read the state afterwards and proceed based on what they
/// find.
pub(crate) fn connection_step(
    chan: &Arc<Channel>,
    g: &mut MutexGuard<'_, ChannelInner>,
    blockable: bool,
) {
    loop {
        match g.state {
            ChannelState::Connected => {
                exit_connected_state(chan, g);
                return;
            }
            ChannelState::Connecting if blockable => {
                // Wait for the worker to move the state, then keep stepping
                g.flags.insert(ChannelFlags::BLOCKED_CONNECT);
                while g.state == ChannelState::Connecting {
                    chan.cond.wait(g);
                }
                g.flags.remove(ChannelFlags::BLOCKED_CONNECT);
            }
            ChannelState::ConnectRetry if blockable => {
                let result = {
                    let inner: &mut ChannelInner = &mut *g;
                    inner.ops.blocking_connect()
                };
                match result {
                    Ok(()) => g.state = ChannelState::Connected,
                    Err(raw) => {
                        debug!(error = raw, "blocking connect exhausted addresses");
                        g.state = ChannelState::ConnectFailed;
                        g.flags.insert(ChannelFlags::REMOTE_EOF);
                        g.last_error = raw;
                    }
                }
                ready::ready_enqueue(chan, g, true);
            }
            ChannelState::ConnectRetry => {
                let verdict = {
                    let inner: &mut ChannelInner = &mut *g;
                    inner.ops.connect_failed(chan)
                };
                match verdict {
                    ConnectVerdict::Retry => {
                        debug!("connect retrying on next address");
                        g.state = ChannelState::Connecting;
                    }
                    ConnectVerdict::Failed => {
                        debug!(error = g.last_error, "connect failed");
                        g.state = ChannelState::ConnectFailed;
                        g.flags.insert(ChannelFlags::REMOTE_EOF);
                    }
                }
                return;
            }
            _ => return,
        }
    }
}

/// CONNECTED -> OPEN (or DISCONNECTED if the family rejects the
/// connection). Sets up write notifications and requests a local event poll
/// either way so the host observes the transition.
pub(crate) fn exit_connected_state(chan: &Arc<Channel>, g: &mut MutexGuard<'_, ChannelInner>) {
    let result = {
        let inner: &mut ChannelInner = &mut *g;
        inner.ops.connected()
    };
    match result {
        Err(raw) => {
            debug!(error = raw, "connected hook rejected the connection");
            g.state = ChannelState::Disconnected;
            g.last_error = raw;
            let inner: &mut ChannelInner = &mut *g;
            inner.ops.disconnected();
        }
        Ok(()) => {
            g.state = ChannelState::Open;
            g.last_error = 0;
            let _ = super::io::post_reads(chan, g);
        }
    }
    g.flags.insert(ChannelFlags::NOTIFY_WRITES);
    ready::ready_enqueue(chan, g, true);
}
