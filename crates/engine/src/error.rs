//! error

use std::{error, fmt, io};

/// Raw platform code recorded when a failed completion reports no error of
/// its own
#[cfg(windows)]
pub(crate) const GENERIC_FAILURE: u32 = 31; // ERROR_GEN_FAILURE
#[cfg(not(windows))]
pub(crate) const GENERIC_FAILURE: u32 = 5; // EIO

#[cfg(windows)]
pub(crate) const CONN_RESET: u32 = 10054; // WSAECONNRESET
#[cfg(not(windows))]
pub(crate) const CONN_RESET: u32 = 104; // ECONNRESET

#[cfg(windows)]
pub(crate) const CONN_REFUSED: u32 = 10061; // WSAECONNREFUSED
#[cfg(not(windows))]
pub(crate) const CONN_REFUSED: u32 = 111; // ECONNREFUSED

#[cfg(windows)]
pub(crate) const OP_ABORTED: u32 = 995; // ERROR_OPERATION_ABORTED
#[cfg(not(windows))]
pub(crate) const OP_ABORTED: u32 = 125; // ECANCELED

#[cfg(windows)]
pub(crate) const INVALID_ARG: u32 = 87; // ERROR_INVALID_PARAMETER
#[cfg(not(windows))]
pub(crate) const INVALID_ARG: u32 = 22; // EINVAL

#[cfg(windows)]
pub(crate) const SHUT_DOWN: u32 = 10058; // WSAESHUTDOWN
#[cfg(not(windows))]
pub(crate) const SHUT_DOWN: u32 = 32; // EPIPE

/// Connection-reset kinds are remapped to remote-EOF at the input drain
/// boundary. All reset variants map uniformly; the raw code stays on the
/// channel for later introspection.
pub(crate) fn is_reset(raw: u32) -> bool {
    #[cfg(windows)]
    {
        // WSAECONNABORTED, WSAENETRESET, WSAECONNRESET
        raw == CONN_RESET || matches!(raw, 10053 | 10052)
    }
    #[cfg(not(windows))]
    {
        // ECONNABORTED, ENETRESET, ECONNRESET
        raw == CONN_RESET || matches!(raw, 103 | 102)
    }
}

/// Errors surfaced by the host-facing channel operations.
///
/// Remote EOF is not an error; reads against an EOF'd channel return
/// `Ok(0)`. A platform error carries the raw OS code, which is also kept in
/// the channel's last-error slot for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// A non-blocking operation found no data or no buffer space
    WouldBlock,
    /// Operation against a channel in a terminal state with no data
    NotConnected,
    /// A true I/O kernel error
    Os(i32),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "operation would block"),
            Self::NotConnected => write!(f, "channel not connected"),
            Self::Os(raw) => write!(f, "{}", io::Error::from_raw_os_error(*raw)),
        }
    }
}

impl error::Error for ChannelError {}

impl From<io::Error> for ChannelError {
    fn from(value: io::Error) -> Self {
        if value.kind() == io::ErrorKind::WouldBlock {
            return Self::WouldBlock;
        }
        match value.raw_os_error() {
            Some(raw) => Self::Os(raw),
            None => Self::Os(GENERIC_FAILURE as i32),
        }
    }
}

impl ChannelError {
    /// POSIX-style code for the host surface. The raw platform code is
    /// preserved in [`ChannelError::Os`]; this mapping is only the
    /// host-visible translation.
    pub fn errno(&self) -> i32 {
        match self {
            Self::WouldBlock => 11,    // EAGAIN
            Self::NotConnected => 107, // ENOTCONN
            Self::Os(raw) => map_os(*raw),
        }
    }
}

#[cfg(windows)]
fn map_os(raw: i32) -> i32 {
    match raw as u32 {
        10052 => 102,         // WSAENETRESET -> ENETRESET
        10053 => 103,         // WSAECONNABORTED -> ECONNABORTED
        10054 => 104,         // WSAECONNRESET -> ECONNRESET
        10057 => 107,         // WSAENOTCONN -> ENOTCONN
        10058 => 32,          // WSAESHUTDOWN -> EPIPE
        10060 => 110,         // WSAETIMEDOUT -> ETIMEDOUT
        10061 => 111,         // WSAECONNREFUSED -> ECONNREFUSED
        10065 => 113,         // WSAEHOSTUNREACH -> EHOSTUNREACH
        995 => 125,           // ERROR_OPERATION_ABORTED -> ECANCELED
        _ => 5,               // EIO
    }
}

#[cfg(not(windows))]
fn map_os(raw: i32) -> i32 {
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_kinds_remap_uniformly() {
        assert!(is_reset(CONN_RESET));
        assert!(!is_reset(CONN_REFUSED));
        assert!(!is_reset(0));
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(11, ChannelError::WouldBlock.errno());
        assert_eq!(107, ChannelError::NotConnected.errno());
        #[cfg(not(windows))]
        assert_eq!(104, ChannelError::Os(104).errno());
    }

    #[test]
    fn test_from_io_error() {
        let would_block = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(ChannelError::WouldBlock, ChannelError::from(would_block));
        let os = io::Error::from_raw_os_error(CONN_REFUSED as i32);
        assert_eq!(
            ChannelError::Os(CONN_REFUSED as i32),
            ChannelError::from(os)
        );
    }
}
