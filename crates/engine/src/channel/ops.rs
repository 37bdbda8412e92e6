//! ops
//!
//! The per-family operation table. One implementation exists per concrete
//! channel family (in-memory stream, TCP client, TCP listener); the engine
//! dispatches polymorphically through [`ChannelOps`].
//!
//! Every method is called with the channel lock held. Implementations must
//! never touch the channel lock themselves; anything they need from the
//! channel arrives as an argument.

use crate::{
    buffer::Buffer,
    channel::{Channel, Directions},
    driver::ChannelHandle,
    error::ChannelError,
};
use std::{io, sync::Arc};

/// Outcome of [`ChannelOps::connect_failed`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectVerdict {
    /// Another address was posted; the state machine returns to CONNECTING
    Retry,
    /// The address list is exhausted; the connect fails for good
    Failed,
}

/// Callback invoked (unlocked) for each connection taken off a listener
pub type AcceptFn = Arc<dyn Fn(ChannelHandle, &str) + Send + Sync>;

/// A child connection built from one accept buffer
pub struct Accepted {
    pub channel: Arc<Channel>,
    pub peer: String,
    pub notify: AcceptFn,
}

pub trait ChannelOps: Send {
    /// Close the underlying OS resources for the given direction set
    fn shutdown(&mut self, dirs: Directions);

    /// Consume one accept buffer and build the child channel. Only
    /// listeners implement this.
    fn accept(&mut self, buf: Box<Buffer>) -> io::Result<Accepted> {
        drop(buf);
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// The asynchronous connect completed; bind whatever the data path
    /// needs. A nonzero error drives the channel to DISCONNECTED.
    fn connected(&mut self) -> Result<(), u32> {
        Ok(())
    }

    /// Cycle through the remaining addresses synchronously. Ok leaves the
    /// channel CONNECTED, an error ends the attempt with CONNECT_FAILED.
    fn blocking_connect(&mut self) -> Result<(), u32> {
        Err(crate::error::CONN_REFUSED)
    }

    /// An asynchronous connect attempt failed; post the next address if one
    /// remains
    fn connect_failed(&mut self, chan: &Arc<Channel>) -> ConnectVerdict {
        let _ = chan;
        ConnectVerdict::Failed
    }

    /// Tear-down hook for the CONNECTED -> DISCONNECTED transition
    fn disconnected(&mut self) {}

    /// Post one overlapped read (or accept, for listeners). The pending
    /// counter is maintained by the caller.
    fn post_read(&mut self, chan: &Arc<Channel>) -> Result<(), u32>;

    /// Post one overlapped write covering `bytes`. `Ok(0)` means the family
    /// cannot take the write right now (would block, not an error).
    fn post_write(&mut self, chan: &Arc<Channel>, bytes: &[u8]) -> Result<usize, u32>;

    /// Refine a completion error before dispatch
    fn translate_error(&mut self, buf: &Buffer) -> u32 {
        buf.error
    }

    /// Opaque OS handle for the given direction, if the family has one
    fn raw_handle(&self, dirs: Directions) -> Option<usize> {
        let _ = dirs;
        None
    }

    /// Family-specific option names. Generic options (max pending
    /// reads/writes) are served by the driver surface itself.
    fn option_names(&self) -> &'static [&'static str] {
        &[]
    }

    fn get_option(&self, name: &str) -> Option<String> {
        let _ = name;
        None
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<(), ChannelError> {
        let _ = (name, value);
        Err(ChannelError::Os(crate::error::INVALID_ARG as i32))
    }
}
