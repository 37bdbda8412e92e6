//! port
//!
//! Completion-port abstraction. The engine's worker blocks on an
//! [`IoPort`]; channel families post overlapped operations against the same
//! port. Two backends exist: the real I/O completion port on Windows and a
//! queue-backed port everywhere (used by the in-memory family and the test
//! suite).

#[cfg(windows)]
mod iocp;
mod mem;

#[cfg(windows)]
pub use iocp::IocpPort;
pub use mem::MemPort;

use crate::buffer::Overlapped;

/// One completed operation as reported by the kernel
#[derive(Debug)]
pub struct CompletionPacket {
    /// Header of the buffer the operation was posted with; recovered via
    /// [`crate::buffer::Buffer::from_overlapped`]
    pub overlapped: *mut Overlapped,
    /// Bytes transferred
    pub bytes: usize,
    /// Raw platform error, 0 on success
    pub error: u32,
}

// The packet only crosses from the posting thread to the worker; the
// pointer it carries was leaked by Buffer::into_overlapped.
unsafe impl Send for CompletionPacket {}

/// What a blocking port wait produced
pub enum PortEvent {
    Packet(CompletionPacket),
    /// Null-overlapped sentinel: the worker must exit
    Shutdown,
}

pub trait IoPort: Send + Sync {
    /// Block until a completion (or the shutdown sentinel) arrives
    fn wait(&self) -> PortEvent;

    /// Post a completion. Families that play the kernel role themselves
    /// (the in-memory family) complete their operations through here.
    fn post(&self, packet: CompletionPacket);

    /// Post the null-overlapped shutdown sentinel
    fn post_shutdown(&self);
}
