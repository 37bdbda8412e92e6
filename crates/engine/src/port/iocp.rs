//! I/O completion port
//!
//! https://learn.microsoft.com/en-us/windows/win32/api/ioapiset/nf-ioapiset-createiocompletionport
//! https://learn.microsoft.com/en-us/windows/win32/api/ioapiset/nf-ioapiset-getqueuedcompletionstatus
//! https://learn.microsoft.com/en-us/windows/win32/api/ioapiset/nf-ioapiset-postqueuedcompletionstatus

use super::{CompletionPacket, IoPort, PortEvent};
use crate::{buffer::Overlapped, error::GENERIC_FAILURE};
use std::io;
use tracing::{debug, warn};
use windows_sys::Win32::{
    Foundation::{CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE},
    System::{
        Threading::INFINITE,
        IO::{CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus},
    },
};

/// An owned I/O completion port. Closed on drop; the worker must have been
/// shut down first.
pub struct IocpPort(HANDLE);

// Windows handles can be shared across threads
unsafe impl Send for IocpPort {}
unsafe impl Sync for IocpPort {}

impl IocpPort {
    /// Create the port. Failure here is fatal to engine construction.
    pub fn new() -> io::Result<Self> {
        match unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 0) } {
            0 => Err(io::Error::last_os_error()),
            handle => Ok(IocpPort(handle)),
        }
    }

    /// Associate a socket or file handle with the port. Every overlapped
    /// operation on the handle will then complete through [`IoPort::wait`].
    pub fn attach(&self, handle: HANDLE) -> io::Result<()> {
        match unsafe { CreateIoCompletionPort(handle, self.0, 0, 0) } {
            0 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        }
    }
}

impl Drop for IocpPort {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

impl IoPort for IocpPort {
    fn wait(&self) -> PortEvent {
        let mut bytes = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut Overlapped = std::ptr::null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.0,
                &mut bytes,
                &mut key,
                &mut overlapped as *mut _ as *mut _,
                INFINITE,
            )
        };
        if overlapped.is_null() {
            if ok == 0 {
                // Port-level failure with no completion attached; treat as
                // shutdown rather than spinning on a dead port
                warn!(error = unsafe { GetLastError() }, "completion port wait failed");
            }
            return PortEvent::Shutdown;
        }
        let error = if ok == 0 {
            match unsafe { GetLastError() } {
                0 => GENERIC_FAILURE,
                raw => raw,
            }
        } else {
            0
        };
        debug!(bytes, error, "completion");
        PortEvent::Packet(CompletionPacket {
            overlapped,
            bytes: bytes as usize,
            error,
        })
    }

    fn post(&self, packet: CompletionPacket) {
        // Used to inject completions (e.g. aborted operations discovered
        // synchronously); the packet error rides in the buffer itself so
        // only the pointer needs to cross
        let ok = unsafe {
            PostQueuedCompletionStatus(self.0, packet.bytes as u32, 0, packet.overlapped as *const _)
        };
        if ok == 0 {
            warn!(error = unsafe { GetLastError() }, "post completion failed");
        }
    }

    fn post_shutdown(&self) {
        let ok = unsafe { PostQueuedCompletionStatus(self.0, 0, 0, std::ptr::null()) };
        if ok == 0 {
            warn!(error = unsafe { GetLastError() }, "post shutdown failed");
        }
    }
}
