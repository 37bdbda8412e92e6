//! Read and write pipelines.
//!
//! Both entry points serialize on the channel lock, keep the channel alive
//! through the caller's counted reference, and in blocking mode park on the
//! channel condvar with a blocked-reason marker so the completion worker
//! knows to wake them instead of queueing a ready event.

use super::{Channel, ChannelFlags, ChannelInner, ChannelState};
use crate::error::{self, ChannelError};
use bytes::Buf;
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, trace};

/// Issue reads (accepts, for listeners) until the in-flight cap is reached
/// or a post fails. Success as long as at least one operation is
/// outstanding.
pub(crate) fn post_reads(
    chan: &Arc<Channel>,
    g: &mut MutexGuard<'_, ChannelInner>,
) -> Result<(), u32> {
    let mut post_error = None;
    while g.pending_reads < g.max_pending_reads {
        if !matches!(g.state, ChannelState::Open | ChannelState::Listening) {
            break;
        }
        if g
            .flags
            .intersects(ChannelFlags::READ_CLOSED | ChannelFlags::REMOTE_EOF)
        {
            break;
        }
        let posted = {
            let inner: &mut ChannelInner = &mut *g;
            inner.ops.post_read(chan)
        };
        match posted {
            Ok(()) => g.pending_reads += 1,
            Err(raw) => {
                debug!(error = raw, "posting read failed");
                post_error = Some(raw);
                break;
            }
        }
    }
    trace!(pending = g.pending_reads, "reads outstanding");
    if g.pending_reads > 0 {
        Ok(())
    } else {
        Err(post_error.unwrap_or(error::GENERIC_FAILURE))
    }
}

/// Read up to `out.len()` bytes from the channel. Remote EOF surfaces as
/// `Ok(0)`.
pub(crate) fn channel_input(chan: &Arc<Channel>, out: &mut [u8]) -> Result<usize, ChannelError> {
    let mut g = chan.lock();
    if g.state.connect_in_progress() {
        let blockable = !g.flags.contains(ChannelFlags::NONBLOCKING);
        super::connect::connection_step(chan, &mut g, blockable);
        if g.state.connect_in_progress() {
            return Err(ChannelError::WouldBlock);
        }
    }
    if g.state == ChannelState::ConnectFailed {
        return Err(connect_failure(&g));
    }
    if g.flags.contains(ChannelFlags::READ_CLOSED) {
        return Ok(0);
    }
    loop {
        let produced = drain_input(&mut g, out)?;
        if produced > 0 {
            // Top the pipeline back up; a post failure here is tolerated
            // because bytes were already delivered
            if g.state == ChannelState::Open && !g.flags.contains(ChannelFlags::REMOTE_EOF) {
                let _ = post_reads(chan, &mut g);
            }
            return Ok(produced);
        }
        if g.flags.contains(ChannelFlags::REMOTE_EOF) {
            return Ok(0);
        }
        if g.state != ChannelState::Open {
            return Err(ChannelError::NotConnected);
        }
        if g.flags.contains(ChannelFlags::NONBLOCKING) {
            return Err(ChannelError::WouldBlock);
        }
        post_reads(chan, &mut g).map_err(|raw| ChannelError::Os(raw as i32))?;
        g.flags.insert(ChannelFlags::BLOCKED_READ);
        chan.cond.wait(&mut g);
        g.flags.remove(ChannelFlags::BLOCKED_READ);
    }
}

/// Move queued bytes into `out`, honouring the buffer error protocol: data
/// queued ahead of an error is delivered first; the error buffer stays at
/// the head until a call finds it with nothing produced yet.
fn drain_input(g: &mut ChannelInner, out: &mut [u8]) -> Result<usize, ChannelError> {
    let mut produced = 0;
    while produced < out.len() {
        let Some(buf) = g.input.front_mut() else {
            break;
        };
        if buf.error != 0 {
            if produced > 0 {
                break;
            }
            let buf = g.input.pop().expect("error buffer at head");
            g.last_error = buf.error;
            if error::is_reset(buf.error) {
                // Reset-by-peer reads as EOF; the raw code stays recorded
                g.flags.insert(ChannelFlags::REMOTE_EOF);
                return Ok(0);
            }
            return Err(ChannelError::Os(buf.error as i32));
        }
        if buf.data.is_empty() {
            // Zero-length completion: the peer finished sending
            g.input.pop();
            g.flags.insert(ChannelFlags::REMOTE_EOF);
            break;
        }
        let take = (out.len() - produced).min(buf.data.len());
        out[produced..produced + take].copy_from_slice(&buf.data[..take]);
        buf.data.advance(take);
        produced += take;
        if buf.data.is_empty() {
            g.input.pop();
        }
    }
    Ok(produced)
}

/// Write `data` to the channel, returning how many bytes one posted
/// operation covered.
pub(crate) fn channel_output(chan: &Arc<Channel>, data: &[u8]) -> Result<usize, ChannelError> {
    let mut g = chan.lock();
    if g.state.connect_in_progress() {
        let blockable = !g.flags.contains(ChannelFlags::NONBLOCKING);
        super::connect::connection_step(chan, &mut g, blockable);
        if g.state.connect_in_progress() {
            return Err(ChannelError::WouldBlock);
        }
    }
    if data.is_empty() {
        return Ok(0);
    }
    if g.state == ChannelState::ConnectFailed {
        return Err(connect_failure(&g));
    }
    if g
        .flags
        .intersects(ChannelFlags::WRITE_CLOSED | ChannelFlags::WRITE_CLOSE_PENDING)
    {
        return Err(ChannelError::NotConnected);
    }
    while g.state == ChannelState::Open {
        let mut full = g.pending_writes >= g.max_pending_writes;
        if !full {
            let posted = {
                let inner: &mut ChannelInner = &mut *g;
                inner.ops.post_write(chan, data)
            };
            match posted {
                // Family-level would-block; same treatment as a full
                // pipeline
                Ok(0) => full = true,
                Ok(written) => {
                    g.pending_writes += 1;
                    return Ok(written);
                }
                Err(raw) => {
                    g.last_error = raw;
                    return Err(ChannelError::Os(raw as i32));
                }
            }
        }
        if full {
            if g.flags.contains(ChannelFlags::NONBLOCKING) {
                return Err(ChannelError::WouldBlock);
            }
            g.flags.insert(ChannelFlags::BLOCKED_WRITE);
            chan.cond.wait(&mut g);
            g.flags.remove(ChannelFlags::BLOCKED_WRITE);
        }
    }
    Err(ChannelError::NotConnected)
}

fn connect_failure(g: &ChannelInner) -> ChannelError {
    if g.last_error != 0 {
        ChannelError::Os(g.last_error as i32)
    } else {
        ChannelError::NotConnected
    }
}
