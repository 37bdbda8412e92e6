//! buffer

use crate::{
    channel::Channel,
    stats::{self, BUFFER_ALLOCS, BUFFER_FREES, DATA_ALLOCS, DATA_FREES},
};
use bitflags::bitflags;
use bytes::BytesMut;
use std::sync::Arc;

/// Overlapped I/O header, layout-compatible with the OS `OVERLAPPED`
/// record. The kernel owns this memory while an operation is in flight.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Overlapped {
    pub internal: usize,
    pub internal_high: usize,
    pub offset: u32,
    pub offset_high: u32,
    pub hevent: isize,
}

impl Overlapped {
    pub fn zeroed() -> Self {
        Overlapped {
            internal: 0,
            internal_high: 0,
            offset: 0,
            offset_high: 0,
            hevent: 0,
        }
    }

    #[cfg(windows)]
    pub fn as_mut_ptr(&mut self) -> *mut windows_sys::Win32::System::IO::OVERLAPPED {
        self as *mut Self as *mut _
    }
}

/// Which operation a posted buffer belongs to. The completion worker
/// dispatches on this tag after recovering the buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Connect,
    Disconnect,
    Accept,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// Posted through the winsock overlapped entry points rather than
        /// the plain file ones
        const WINSOCK = 1 << 0;
    }
}

/// An in-flight I/O record.
///
/// The overlapped header MUST stay the first field: the kernel hands back a
/// pointer to the header and [`Buffer::from_overlapped`] recovers the whole
/// record from it.
#[repr(C)]
pub struct Buffer {
    header: Overlapped,
    /// Counted back-reference to the owning channel. Taken (not cloned) by
    /// the worker on completion; buffers sitting in a channel's input queue
    /// carry no reference because the queue lives inside the channel.
    owner: Option<Arc<Channel>>,
    pub op: OpKind,
    pub flags: BufferFlags,
    /// Byte region. Capacity is what was posted, the initialized length is
    /// what the kernel produced, and `advance` consumes from the front.
    pub data: BytesMut,
    /// Raw platform error slot, 0 on success
    pub error: u32,
    /// Family context word (e.g. the pre-created socket of a posted accept)
    pub ctx: usize,
    data_counted: bool,
}

impl Buffer {
    /// Allocate a buffer with `capacity` bytes of uninitialized region for
    /// the kernel to fill (reads, accepts).
    pub fn with_capacity(op: OpKind, owner: Option<Arc<Channel>>, capacity: usize) -> Box<Buffer> {
        Self::build(op, owner, BytesMut::with_capacity(capacity), capacity > 0)
    }

    /// Allocate a buffer around bytes to hand to the kernel (writes).
    pub fn with_data(op: OpKind, owner: Option<Arc<Channel>>, data: &[u8]) -> Box<Buffer> {
        Self::build(op, owner, BytesMut::from(data), !data.is_empty())
    }

    fn build(
        op: OpKind,
        owner: Option<Arc<Channel>>,
        data: BytesMut,
        data_counted: bool,
    ) -> Box<Buffer> {
        stats::bump(&BUFFER_ALLOCS);
        if data_counted {
            stats::bump(&DATA_ALLOCS);
        }
        Box::new(Buffer {
            header: Overlapped::zeroed(),
            owner,
            op,
            flags: BufferFlags::empty(),
            data,
            error: 0,
            ctx: 0,
            data_counted,
        })
    }

    /// Take the counted channel reference out of the buffer
    pub fn take_owner(&mut self) -> Option<Arc<Channel>> {
        self.owner.take()
    }

    /// Hand the buffer to the kernel. The box is leaked; ownership returns
    /// through [`Buffer::from_overlapped`] when the completion arrives.
    pub fn into_overlapped(self: Box<Buffer>) -> *mut Overlapped {
        Box::into_raw(self) as *mut Overlapped
    }

    /// Recover a buffer previously leaked by [`Buffer::into_overlapped`].
    ///
    /// Safety: `header` must be a pointer obtained from `into_overlapped`
    /// and must not have been recovered already. The cast relies on the
    /// header being the first field of the record.
    pub unsafe fn from_overlapped(header: *mut Overlapped) -> Box<Buffer> {
        Box::from_raw(header as *mut Buffer)
    }

    #[cfg(windows)]
    pub fn overlapped_mut(&mut self) -> *mut windows_sys::Win32::System::IO::OVERLAPPED {
        self.header.as_mut_ptr()
    }

    /// Mark the first `len` bytes of the region as initialized by the
    /// kernel.
    ///
    /// Safety: the kernel (or whatever played its role) must actually have
    /// written `len` bytes at the region start.
    pub unsafe fn set_filled(&mut self, len: usize) {
        debug_assert!(len <= self.data.capacity());
        self.data.set_len(len);
    }

    /// Raw region pointer/capacity handed to the kernel when posting
    pub fn region_mut(&mut self) -> (*mut u8, usize) {
        (self.data.as_mut_ptr(), self.data.capacity())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        stats::bump(&BUFFER_FREES);
        if self.data_counted {
            stats::bump(&DATA_FREES);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::stats;
    use bytes::Buf;
    use std::mem;

    #[test]
    fn test_overlapped_is_first_field() {
        let buf = Buffer::with_capacity(OpKind::Read, None, 8);
        let buf_addr = &*buf as *const Buffer as usize;
        let hdr_addr = &buf.header as *const Overlapped as usize;
        assert_eq!(buf_addr, hdr_addr);
        assert_eq!(0, mem::offset_of!(Buffer, header));
    }

    #[test]
    fn test_overlapped_round_trip() {
        let mut buf = Buffer::with_capacity(OpKind::Write, None, 4);
        buf.error = 42;
        buf.ctx = 7;
        let raw = buf.into_overlapped();
        let back = unsafe { Buffer::from_overlapped(raw) };
        assert_eq!(OpKind::Write, back.op);
        assert_eq!(42, back.error);
        assert_eq!(7, back.ctx);
    }

    #[test]
    fn test_region_window() {
        let mut buf = Buffer::with_capacity(OpKind::Read, None, 8);
        let (ptr, cap) = buf.region_mut();
        assert_eq!(8, cap);
        unsafe {
            std::slice::from_raw_parts_mut(ptr, cap).copy_from_slice(b"01234567");
            buf.set_filled(5);
        }
        assert_eq!(b"01234", &buf.data[..]);
        buf.data.advance(2);
        assert_eq!(b"234", &buf.data[..]);
    }

    #[test]
    fn test_alloc_counters_balance() {
        let before = stats();
        {
            let a = Buffer::with_capacity(OpKind::Read, None, 16);
            let b = Buffer::with_data(OpKind::Write, None, b"xyz");
            drop(a);
            drop(b);
        }
        let delta = stats().since(&before);
        assert_eq!(delta.buffer_allocs, delta.buffer_frees);
        assert_eq!(delta.data_allocs, delta.data_frees);
    }
}
