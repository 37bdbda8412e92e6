//! mem
//!
//! In-memory channel family driven through a [`MemPort`]. The far side of
//! each stream is a scriptable [`MemEndpoint`]: tests (or embedders wanting
//! a loopback transport) inject inbound bytes, decide when posted writes
//! complete, and script connect outcomes per address. The engine sees
//! exactly the contract the kernel families present: overlapped buffers
//! posted, completions delivered through the port.

use crate::{
    buffer::{Buffer, OpKind, Overlapped},
    channel::{
        connect, io,
        ops::{AcceptFn, Accepted, ChannelOps, ConnectVerdict},
        Channel, ChannelState, Directions,
    },
    driver::{self, ChannelHandle},
    error,
    port::{CompletionPacket, IoPort, MemPort},
};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tracing::trace;

const DEFAULT_READ_CAPACITY: usize = 4096;

/// A buffer currently "owned by the kernel", i.e. leaked to this fake one
struct RawBuf(*mut Overlapped);
unsafe impl Send for RawBuf {}

impl RawBuf {
    /// Safety: the pointer came from `Buffer::into_overlapped` and has not
    /// been recovered; the fake kernel is the only one touching it.
    unsafe fn buffer_mut(&self) -> &mut Buffer {
        &mut *(self.0 as *mut Buffer)
    }
}

enum Inbound {
    Bytes(Vec<u8>),
    Eof,
    Error(u32),
}

struct EndpointState {
    pending_reads: VecDeque<RawBuf>,
    inbound: VecDeque<Inbound>,
    held_writes: VecDeque<RawBuf>,
    hold_writes: bool,
    written: Vec<u8>,
    read_shut: bool,
    write_shut: bool,
}

impl Drop for EndpointState {
    fn drop(&mut self) {
        // Operations still posted against a vanishing endpoint can never
        // complete; reclaim their buffers (and the channel references they
        // carry)
        for raw in self
            .pending_reads
            .drain(..)
            .chain(self.held_writes.drain(..))
        {
            // Safety: leaked by post_read/post_write and never completed
            drop(unsafe { Buffer::from_overlapped(raw.0) });
        }
    }
}

/// The far side of an in-memory stream.
///
/// Clones share the endpoint. All methods are callable from any thread;
/// they never touch a channel lock, only post completions through the port.
#[derive(Clone)]
pub struct MemEndpoint {
    port: Arc<MemPort>,
    state: Arc<Mutex<EndpointState>>,
}

impl MemEndpoint {
    pub fn new(port: &Arc<MemPort>) -> MemEndpoint {
        MemEndpoint {
            port: Arc::clone(port),
            state: Arc::new(Mutex::new(EndpointState {
                pending_reads: VecDeque::new(),
                inbound: VecDeque::new(),
                held_writes: VecDeque::new(),
                hold_writes: false,
                written: Vec::new(),
                read_shut: false,
                write_shut: false,
            })),
        }
    }

    /// Deliver bytes to the channel. Fulfils posted reads in order; data
    /// beyond what is posted waits for the next read.
    pub fn push_bytes(&self, bytes: &[u8]) {
        let mut s = self.state.lock();
        s.inbound.push_back(Inbound::Bytes(bytes.to_vec()));
        self.pump_reads(&mut s);
    }

    /// Deliver end-of-stream: the next fulfilled read completes with zero
    /// bytes
    pub fn push_eof(&self) {
        let mut s = self.state.lock();
        s.inbound.push_back(Inbound::Eof);
        self.pump_reads(&mut s);
    }

    /// Deliver a read failure with the given raw platform code
    pub fn push_error(&self, raw: u32) {
        let mut s = self.state.lock();
        s.inbound.push_back(Inbound::Error(raw));
        self.pump_reads(&mut s);
    }

    /// Stop completing writes automatically; they queue until
    /// [`MemEndpoint::complete_write`]
    pub fn hold_writes(&self) {
        self.state.lock().hold_writes = true;
    }

    /// Complete the oldest held write successfully. False when none is
    /// held.
    pub fn complete_write(&self) -> bool {
        let mut s = self.state.lock();
        let Some(raw) = s.held_writes.pop_front() else {
            return false;
        };
        // Safety: held buffers were leaked by post_write
        let len = unsafe {
            let buf = raw.buffer_mut();
            s.written.extend_from_slice(&buf.data[..]);
            buf.data.len()
        };
        self.port.post(CompletionPacket {
            overlapped: raw.0,
            bytes: len,
            error: 0,
        });
        true
    }

    /// Fail the oldest held write with the given raw platform code
    pub fn fail_write(&self, raw: u32) -> bool {
        let mut s = self.state.lock();
        let Some(held) = s.held_writes.pop_front() else {
            return false;
        };
        self.port.post(CompletionPacket {
            overlapped: held.0,
            bytes: 0,
            error: raw,
        });
        true
    }

    /// Everything the channel has successfully written so far
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().written)
    }

    /// How many reads the channel currently has posted
    pub fn posted_reads(&self) -> usize {
        self.state.lock().pending_reads.len()
    }

    /// How many writes are held un-completed
    pub fn held_writes(&self) -> usize {
        self.state.lock().held_writes.len()
    }

    /// Fulfil pending reads from queued inbound items, preserving order
    fn pump_reads(&self, s: &mut EndpointState) {
        while !s.pending_reads.is_empty() && !s.inbound.is_empty() {
            let raw = s.pending_reads.pop_front().expect("pending read");
            let item = s.inbound.pop_front().expect("inbound item");
            let packet = match item {
                Inbound::Bytes(mut bytes) => {
                    // Safety: the buffer is kernel-owned until the packet
                    // lands
                    let copied = unsafe {
                        let buf = raw.buffer_mut();
                        let (ptr, cap) = buf.region_mut();
                        let n = bytes.len().min(cap);
                        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, n);
                        n
                    };
                    if copied < bytes.len() {
                        // Remainder waits for the next posted read
                        bytes.drain(..copied);
                        s.inbound.push_front(Inbound::Bytes(bytes));
                    }
                    CompletionPacket {
                        overlapped: raw.0,
                        bytes: copied,
                        error: 0,
                    }
                }
                Inbound::Eof => CompletionPacket {
                    overlapped: raw.0,
                    bytes: 0,
                    error: 0,
                },
                Inbound::Error(raw_err) => CompletionPacket {
                    overlapped: raw.0,
                    bytes: 0,
                    error: raw_err,
                },
            };
            self.port.post(packet);
        }
    }

    /// Family shutdown: abort whatever is still posted so the completions
    /// drain the way a cancelled kernel operation would
    fn shut(&self, dirs: Directions) {
        let mut s = self.state.lock();
        if dirs.contains(Directions::READ) {
            s.read_shut = true;
            while let Some(raw) = s.pending_reads.pop_front() {
                self.port.post(CompletionPacket {
                    overlapped: raw.0,
                    bytes: 0,
                    error: error::OP_ABORTED,
                });
            }
        }
        if dirs.contains(Directions::WRITE) {
            s.write_shut = true;
            while let Some(raw) = s.held_writes.pop_front() {
                self.port.post(CompletionPacket {
                    overlapped: raw.0,
                    bytes: 0,
                    error: error::OP_ABORTED,
                });
            }
        }
    }

    fn post_read(&self, chan: &Arc<Channel>, capacity: usize) -> Result<(), u32> {
        let mut s = self.state.lock();
        if s.read_shut {
            return Err(error::SHUT_DOWN);
        }
        let buf = Buffer::with_capacity(OpKind::Read, Some(Arc::clone(chan)), capacity);
        s.pending_reads.push_back(RawBuf(buf.into_overlapped()));
        trace!(posted = s.pending_reads.len(), "read posted");
        self.pump_reads(&mut s);
        Ok(())
    }

    fn post_write(&self, chan: &Arc<Channel>, bytes: &[u8]) -> Result<usize, u32> {
        let mut s = self.state.lock();
        if s.write_shut {
            return Err(error::SHUT_DOWN);
        }
        let buf = Buffer::with_data(OpKind::Write, Some(Arc::clone(chan)), bytes);
        let raw = RawBuf(buf.into_overlapped());
        if s.hold_writes {
            s.held_writes.push_back(raw);
        } else {
            s.written.extend_from_slice(bytes);
            self.port.post(CompletionPacket {
                overlapped: raw.0,
                bytes: bytes.len(),
                error: 0,
            });
        }
        Ok(bytes.len())
    }
}

/// Stream ops: everything delegates to the endpoint
struct MemStreamOps {
    ep: MemEndpoint,
    read_capacity: usize,
}

impl ChannelOps for MemStreamOps {
    fn shutdown(&mut self, dirs: Directions) {
        self.ep.shut(dirs);
    }

    fn post_read(&mut self, chan: &Arc<Channel>) -> Result<(), u32> {
        self.ep.post_read(chan, self.read_capacity)
    }

    fn post_write(&mut self, chan: &Arc<Channel>, bytes: &[u8]) -> Result<usize, u32> {
        self.ep.post_write(chan, bytes)
    }

    fn option_names(&self) -> &'static [&'static str] {
        &["outbytes"]
    }

    fn get_option(&self, name: &str) -> Option<String> {
        match name {
            "outbytes" => Some(self.ep.state.lock().written.len().to_string()),
            _ => None,
        }
    }
}

/// An open in-memory stream channel plus its scriptable far side. The
/// channel attaches to the calling thread and posts its initial reads.
pub fn pair(port: &Arc<MemPort>) -> (ChannelHandle, MemEndpoint) {
    let ep = MemEndpoint::new(port);
    let ops = Box::new(MemStreamOps {
        ep: ep.clone(),
        read_capacity: DEFAULT_READ_CAPACITY,
    });
    let chan = Channel::new(ops, ChannelState::Open);
    {
        let mut g = chan.lock();
        driver::attach_current(&mut g);
        let _ = io::post_reads(&chan, &mut g);
    }
    (ChannelHandle::new(chan), ep)
}

/// Scripted outcome for one address in a connect list
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The overlapped connect completes successfully
    Succeed,
    /// The overlapped connect posts, then completes with this code
    FailAsync(u32),
    /// Posting the connect itself fails with this code
    FailSync(u32),
}

/// One address of an in-memory connect list
pub struct MemTarget {
    name: String,
    outcome: ConnectOutcome,
    endpoint: MemEndpoint,
}

impl MemTarget {
    pub fn new<N: Into<String>>(name: N, outcome: ConnectOutcome, endpoint: MemEndpoint) -> Self {
        MemTarget {
            name: name.into(),
            outcome,
            endpoint,
        }
    }
}

struct MemClientOps {
    port: Arc<MemPort>,
    targets: Vec<MemTarget>,
    next: usize,
    bound: Option<MemEndpoint>,
    read_capacity: usize,
}

impl MemClientOps {
    /// Post the connect for the next address, skipping addresses that fail
    /// synchronously. Mirrors how a socket family walks its address list.
    fn start_connect(&mut self, chan: &Arc<Channel>) -> Result<(), u32> {
        let mut last = error::CONN_REFUSED;
        while self.next < self.targets.len() {
            let target = &self.targets[self.next];
            let outcome = target.outcome;
            trace!(target = %target.name, ?outcome, "connect attempt");
            self.next += 1;
            match outcome {
                ConnectOutcome::FailSync(raw) => last = raw,
                ConnectOutcome::Succeed | ConnectOutcome::FailAsync(_) => {
                    let buf = Buffer::with_capacity(OpKind::Connect, Some(Arc::clone(chan)), 0);
                    let raw_err = match outcome {
                        ConnectOutcome::FailAsync(raw) => raw,
                        _ => 0,
                    };
                    self.port.post(CompletionPacket {
                        overlapped: buf.into_overlapped(),
                        bytes: 0,
                        error: raw_err,
                    });
                    return Ok(());
                }
            }
        }
        Err(last)
    }
}

impl ChannelOps for MemClientOps {
    fn shutdown(&mut self, dirs: Directions) {
        if let Some(ep) = &self.bound {
            ep.shut(dirs);
        }
    }

    fn connected(&mut self) -> Result<(), u32> {
        // The address that completed is the one most recently attempted
        let target = &self.targets[self.next - 1];
        self.bound = Some(target.endpoint.clone());
        Ok(())
    }

    fn blocking_connect(&mut self) -> Result<(), u32> {
        let mut last = error::CONN_REFUSED;
        while self.next < self.targets.len() {
            let outcome = self.targets[self.next].outcome;
            self.next += 1;
            match outcome {
                ConnectOutcome::Succeed => return Ok(()),
                ConnectOutcome::FailAsync(raw) | ConnectOutcome::FailSync(raw) => last = raw,
            }
        }
        Err(last)
    }

    fn connect_failed(&mut self, chan: &Arc<Channel>) -> ConnectVerdict {
        match self.start_connect(chan) {
            Ok(()) => ConnectVerdict::Retry,
            Err(_) => ConnectVerdict::Failed,
        }
    }

    fn post_read(&mut self, chan: &Arc<Channel>) -> Result<(), u32> {
        match &self.bound {
            Some(ep) => ep.post_read(chan, self.read_capacity),
            None => Err(error::GENERIC_FAILURE),
        }
    }

    fn post_write(&mut self, chan: &Arc<Channel>, bytes: &[u8]) -> Result<usize, u32> {
        match &self.bound {
            Some(ep) => ep.post_write(chan, bytes),
            None => Err(error::GENERIC_FAILURE),
        }
    }

    fn option_names(&self) -> &'static [&'static str] {
        &["peer"]
    }

    fn get_option(&self, name: &str) -> Option<String> {
        match name {
            "peer" if self.next > 0 => Some(self.targets[self.next - 1].name.clone()),
            _ => None,
        }
    }
}

/// Begin connecting across an address list. The channel attaches to the
/// calling thread; progress is driven by the worker and the thread's event
/// loop (or a blocking read/write).
pub fn connect(port: &Arc<MemPort>, targets: Vec<MemTarget>) -> ChannelHandle {
    let ops = Box::new(MemClientOps {
        port: Arc::clone(port),
        targets,
        next: 0,
        bound: None,
        read_capacity: DEFAULT_READ_CAPACITY,
    });
    // The first address is posted through the same retry path later
    // attempts use
    let chan = Channel::new(ops, ChannelState::ConnectRetry);
    {
        let mut g = chan.lock();
        driver::attach_current(&mut g);
        connect::connection_step(&chan, &mut g, false);
    }
    ChannelHandle::new(chan)
}

struct ListenerCore {
    port: Arc<MemPort>,
    /// Peers that connected before an accept was posted
    waiting: VecDeque<(MemEndpoint, String)>,
    /// Posted accept buffers
    pending: VecDeque<RawBuf>,
    /// Fulfilled accepts awaiting the event handler
    ready_children: VecDeque<(MemEndpoint, String)>,
    on_accept: AcceptFn,
    read_capacity: usize,
    shut: bool,
}

impl Drop for ListenerCore {
    fn drop(&mut self) {
        for raw in self.pending.drain(..) {
            // Safety: leaked by post_read and never completed
            drop(unsafe { Buffer::from_overlapped(raw.0) });
        }
    }
}

struct MemListenerOps {
    core: Arc<Mutex<ListenerCore>>,
}

impl ChannelOps for MemListenerOps {
    fn shutdown(&mut self, _dirs: Directions) {
        let mut core = self.core.lock();
        core.shut = true;
        core.waiting.clear();
        core.ready_children.clear();
        while let Some(raw) = core.pending.pop_front() {
            core.port.post(CompletionPacket {
                overlapped: raw.0,
                bytes: 0,
                error: error::OP_ABORTED,
            });
        }
    }

    fn accept(&mut self, buf: Box<Buffer>) -> std::io::Result<Accepted> {
        drop(buf);
        let (ep, peer, notify, capacity) = {
            let mut core = self.core.lock();
            let (ep, peer) = core
                .ready_children
                .pop_front()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
            (ep, peer, Arc::clone(&core.on_accept), core.read_capacity)
        };
        let ops = Box::new(MemStreamOps {
            ep,
            read_capacity: capacity,
        });
        let chan = Channel::new(ops, ChannelState::Open);
        {
            let mut g = chan.lock();
            driver::attach_current(&mut g);
            let _ = io::post_reads(&chan, &mut g);
        }
        Ok(Accepted {
            channel: chan,
            peer,
            notify,
        })
    }

    fn post_read(&mut self, chan: &Arc<Channel>) -> Result<(), u32> {
        let mut core = self.core.lock();
        if core.shut {
            return Err(error::SHUT_DOWN);
        }
        let buf = Buffer::with_capacity(OpKind::Accept, Some(Arc::clone(chan)), 0);
        let raw = RawBuf(buf.into_overlapped());
        if let Some((ep, name)) = core.waiting.pop_front() {
            core.ready_children.push_back((ep, name));
            core.port.post(CompletionPacket {
                overlapped: raw.0,
                bytes: 0,
                error: 0,
            });
        } else {
            core.pending.push_back(raw);
        }
        Ok(())
    }

    fn post_write(&mut self, _chan: &Arc<Channel>, _bytes: &[u8]) -> Result<usize, u32> {
        Err(error::SHUT_DOWN)
    }
}

/// Test-facing side of an in-memory listener
pub struct MemListener {
    core: Arc<Mutex<ListenerCore>>,
}

impl MemListener {
    /// Simulate an inbound connection, returning the far side of the
    /// stream the accepted child channel will read from
    pub fn connect_peer<N: Into<String>>(&self, name: N) -> MemEndpoint {
        let mut core = self.core.lock();
        let ep = MemEndpoint::new(&core.port);
        if let Some(raw) = core.pending.pop_front() {
            core.ready_children.push_back((ep.clone(), name.into()));
            core.port.post(CompletionPacket {
                overlapped: raw.0,
                bytes: 0,
                error: 0,
            });
        } else {
            core.waiting.push_back((ep.clone(), name.into()));
        }
        ep
    }
}

/// An in-memory listener channel. `on_accept` runs (unlocked) on the
/// listener's owning thread for every accepted connection.
pub fn listen<F>(port: &Arc<MemPort>, on_accept: F) -> (ChannelHandle, MemListener)
where
    F: Fn(ChannelHandle, &str) + Send + Sync + 'static,
{
    let core = Arc::new(Mutex::new(ListenerCore {
        port: Arc::clone(port),
        waiting: VecDeque::new(),
        pending: VecDeque::new(),
        ready_children: VecDeque::new(),
        on_accept: Arc::new(on_accept) as AcceptFn,
        read_capacity: DEFAULT_READ_CAPACITY,
        shut: false,
    }));
    let ops = Box::new(MemListenerOps {
        core: Arc::clone(&core),
    });
    let chan = Channel::new(ops, ChannelState::Listening);
    {
        let mut g = chan.lock();
        driver::attach_current(&mut g);
        let _ = io::post_reads(&chan, &mut g);
    }
    (ChannelHandle::new(chan), MemListener { core })
}
