//! TCP channel family over overlapped winsock sockets.
//!
//! Clients establish through `ConnectEx` (loaded per socket via
//! `SIO_GET_EXTENSION_FUNCTION_POINTER`), cycling a resolved address list
//! through the engine's retry machinery. Listeners replenish `AcceptEx`
//! operations; the pre-created accept socket rides in the buffer's family
//! context word. Data moves with `WSARecv`/`WSASend`.
//!
//! https://learn.microsoft.com/en-us/windows/win32/api/mswsock/nc-mswsock-lpfn_connectex
//! https://learn.microsoft.com/en-us/windows/win32/api/mswsock/nf-mswsock-acceptex

use crate::{
    buffer::{Buffer, BufferFlags, OpKind},
    channel::{
        connect, io,
        ops::{AcceptFn, Accepted, ChannelOps, ConnectVerdict},
        Channel, ChannelState, Directions,
    },
    driver::{self, ChannelHandle},
    engine::Engine,
    port::IocpPort,
};
use std::{
    ffi::c_void,
    io::{Error, ErrorKind, Result},
    mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::windows::io::IntoRawSocket,
    sync::Arc,
};
use tracing::{debug, trace};
use windows_sys::Win32::{
    Foundation::FALSE,
    Networking::WinSock::{
        bind, closesocket, getpeername, getsockname, getsockopt, listen, setsockopt, shutdown,
        AcceptEx, GetAcceptExSockaddrs, WSAGetLastError, WSAIoctl, WSASocketW,
        AF_INET, AF_INET6, IN6_ADDR, INVALID_SOCKET, IN_ADDR, IPPROTO_TCP, LPFN_CONNECTEX,
        SD_RECEIVE, SD_SEND, SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKADDR, SOCKADDR_IN,
        SOCKADDR_IN6, SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, SOCK_STREAM, SOL_SOCKET,
        SO_KEEPALIVE, SO_UPDATE_ACCEPT_CONTEXT, SO_UPDATE_CONNECT_CONTEXT, TCP_NODELAY,
        WSABUF, WSAID_CONNECTEX, WSARecv, WSASend, WSA_FLAG_OVERLAPPED, WSA_IO_PENDING,
    },
    System::IO::OVERLAPPED,
};

const DEFAULT_READ_CAPACITY: usize = 4096;

/// Address block AcceptEx needs per side
const ACCEPT_ADDR_LEN: u32 = (mem::size_of::<SOCKADDR_STORAGE>() + 16) as u32;

/// Make sure winsock is started. The standard library runs `WSAStartup`
/// once on first socket use; creating one is the sanctioned way in.
fn init() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        drop(std::net::UdpSocket::bind("127.0.0.1:0"));
    });
}

/// An owned overlapped socket, closed on drop
struct TcpSock(SOCKET);

// Sockets are plain kernel handles
unsafe impl Send for TcpSock {}

impl TcpSock {
    fn overlapped(addr: &SocketAddr) -> Result<TcpSock> {
        init();
        let family = match addr {
            SocketAddr::V4(..) => AF_INET,
            SocketAddr::V6(..) => AF_INET6,
        };
        match unsafe {
            WSASocketW(
                family as i32,
                SOCK_STREAM as i32,
                IPPROTO_TCP,
                std::ptr::null(),
                0,
                WSA_FLAG_OVERLAPPED,
            )
        } {
            INVALID_SOCKET => Err(Error::from_raw_os_error(unsafe { WSAGetLastError() })),
            sock => Ok(TcpSock(sock)),
        }
    }

    fn bind(&self, addr: &SocketAddr) -> Result<()> {
        let (raw, len) = socket_addr(addr);
        match unsafe { bind(self.0, raw.as_ptr(), len) } {
            SOCKET_ERROR => Err(Error::from_raw_os_error(unsafe { WSAGetLastError() })),
            _ => Ok(()),
        }
    }

    fn listen(&self, backlog: i32) -> Result<()> {
        match unsafe { listen(self.0, backlog) } {
            SOCKET_ERROR => Err(Error::from_raw_os_error(unsafe { WSAGetLastError() })),
            _ => Ok(()),
        }
    }

    /// Load the socket's ConnectEx entry point
    fn connect_ex(&self) -> Result<LPFN_CONNECTEX> {
        let mut fnptr: LPFN_CONNECTEX = None;
        let mut bytes = 0u32;
        match unsafe {
            WSAIoctl(
                self.0,
                SIO_GET_EXTENSION_FUNCTION_POINTER,
                &WSAID_CONNECTEX as *const _ as *const c_void,
                mem::size_of_val(&WSAID_CONNECTEX) as u32,
                &mut fnptr as *mut _ as *mut c_void,
                mem::size_of_val(&fnptr) as u32,
                &mut bytes,
                std::ptr::null_mut(),
                None,
            )
        } {
            SOCKET_ERROR => Err(Error::from_raw_os_error(unsafe { WSAGetLastError() })),
            _ => Ok(fnptr),
        }
    }

    fn set_bool(&self, level: i32, option: i32, value: bool) -> Result<()> {
        let value: i32 = value as i32;
        match unsafe {
            setsockopt(
                self.0,
                level,
                option,
                &value as *const _ as *const u8,
                mem::size_of::<i32>() as i32,
            )
        } {
            SOCKET_ERROR => Err(Error::from_raw_os_error(unsafe { WSAGetLastError() })),
            _ => Ok(()),
        }
    }

    fn get_bool(&self, level: i32, option: i32) -> Result<bool> {
        let mut value: i32 = 0;
        let mut len = mem::size_of::<i32>() as i32;
        match unsafe { getsockopt(self.0, level, option, &mut value as *mut _ as *mut u8, &mut len) }
        {
            SOCKET_ERROR => Err(Error::from_raw_os_error(unsafe { WSAGetLastError() })),
            _ => Ok(value != 0),
        }
    }

    fn shutdown(&self, how: i32) {
        unsafe { shutdown(self.0, how) };
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
        match unsafe { getsockname(self.0, &mut storage as *mut _ as *mut SOCKADDR, &mut len) } {
            SOCKET_ERROR => Err(Error::from_raw_os_error(unsafe { WSAGetLastError() })),
            _ => from_storage(&storage),
        }
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
        match unsafe { getpeername(self.0, &mut storage as *mut _ as *mut SOCKADDR, &mut len) } {
            SOCKET_ERROR => Err(Error::from_raw_os_error(unsafe { WSAGetLastError() })),
            _ => from_storage(&storage),
        }
    }
}

impl Drop for TcpSock {
    fn drop(&mut self) {
        unsafe { closesocket(self.0) };
    }
}

/// C-layout socket address plus length, kept alive for the duration of the
/// call that borrows it
enum RawAddr {
    V4(SOCKADDR_IN),
    V6(SOCKADDR_IN6),
}

impl RawAddr {
    fn as_ptr(&self) -> *const SOCKADDR {
        match self {
            RawAddr::V4(a) => a as *const _ as *const SOCKADDR,
            RawAddr::V6(a) => a as *const _ as *const SOCKADDR,
        }
    }
}

fn socket_addr(addr: &SocketAddr) -> (RawAddr, i32) {
    match addr {
        SocketAddr::V4(v4) => {
            let mut raw: SOCKADDR_IN = unsafe { mem::zeroed() };
            raw.sin_family = AF_INET;
            raw.sin_port = v4.port().to_be();
            raw.sin_addr = IN_ADDR {
                S_un: windows_sys::Win32::Networking::WinSock::IN_ADDR_0 {
                    S_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
            };
            (RawAddr::V4(raw), mem::size_of::<SOCKADDR_IN>() as i32)
        }
        SocketAddr::V6(v6) => {
            let mut raw: SOCKADDR_IN6 = unsafe { mem::zeroed() };
            raw.sin6_family = AF_INET6;
            raw.sin6_port = v6.port().to_be();
            raw.sin6_addr = IN6_ADDR {
                u: windows_sys::Win32::Networking::WinSock::IN6_ADDR_0 {
                    Byte: v6.ip().octets(),
                },
            };
            raw.sin6_flowinfo = v6.flowinfo();
            raw.Anonymous.sin6_scope_id = v6.scope_id();
            (RawAddr::V6(raw), mem::size_of::<SOCKADDR_IN6>() as i32)
        }
    }
}

fn from_storage(storage: &SOCKADDR_STORAGE) -> Result<SocketAddr> {
    match storage.ss_family {
        AF_INET => {
            let v4 = unsafe { &*(storage as *const _ as *const SOCKADDR_IN) };
            let ip = Ipv4Addr::from(unsafe { v4.sin_addr.S_un.S_addr }.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(v4.sin_port))))
        }
        AF_INET6 => {
            let v6 = unsafe { &*(storage as *const _ as *const SOCKADDR_IN6) };
            let ip = Ipv6Addr::from(unsafe { v6.sin6_addr.u.Byte });
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(v6.sin6_port),
                v6.sin6_flowinfo,
                unsafe { v6.Anonymous.sin6_scope_id },
            )))
        }
        _ => Err(Error::from(ErrorKind::InvalidData)),
    }
}

fn inaddr_any(other: &SocketAddr) -> SocketAddr {
    match other {
        SocketAddr::V4(..) => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(..) => SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0)),
    }
}

/// Ops for TCP data channels: connecting clients (non-empty address list)
/// and accepted children (socket already bound)
struct TcpStreamOps {
    port: Arc<IocpPort>,
    socket: Option<TcpSock>,
    addrs: Vec<SocketAddr>,
    next: usize,
    read_capacity: usize,
}

impl TcpStreamOps {
    /// Post ConnectEx for the next address, skipping addresses whose setup
    /// fails synchronously
    fn start_connect(&mut self, chan: &Arc<Channel>) -> std::result::Result<(), u32> {
        let mut last = crate::error::CONN_REFUSED;
        while self.next < self.addrs.len() {
            let addr = self.addrs[self.next];
            self.next += 1;
            match self.post_connect(chan, &addr) {
                Ok(()) => return Ok(()),
                Err(raw) => {
                    debug!(%addr, error = raw, "connect post failed");
                    last = raw;
                }
            }
        }
        Err(last)
    }

    fn post_connect(&mut self, chan: &Arc<Channel>, addr: &SocketAddr) -> std::result::Result<(), u32> {
        let sock = TcpSock::overlapped(addr).map_err(raw_of)?;
        // ConnectEx requires a bound socket
        sock.bind(&inaddr_any(addr)).map_err(raw_of)?;
        self.port.attach(sock.0 as _).map_err(raw_of)?;
        let connect_ex = sock.connect_ex().map_err(raw_of)?;
        let Some(connect_ex) = connect_ex else {
            return Err(crate::error::GENERIC_FAILURE);
        };
        let mut buf = Buffer::with_capacity(OpKind::Connect, Some(Arc::clone(chan)), 0);
        buf.flags.insert(BufferFlags::WINSOCK);
        let overlapped = buf.overlapped_mut();
        let (raw, len) = socket_addr(addr);
        let mut sent = 0u32;
        let ok = unsafe {
            connect_ex(
                sock.0,
                raw.as_ptr(),
                len,
                std::ptr::null(),
                0,
                &mut sent,
                overlapped,
            )
        };
        if ok == FALSE {
            let raw_err = unsafe { WSAGetLastError() } as u32;
            if raw_err != WSA_IO_PENDING as u32 {
                // The buffer was never accepted by the kernel
                return Err(raw_err);
            }
        }
        // Completion owns the buffer now, synchronous success included
        let _ = buf.into_overlapped();
        self.socket = Some(sock);
        trace!(%addr, "connect posted");
        Ok(())
    }

    fn sock(&self) -> std::result::Result<&TcpSock, u32> {
        self.socket.as_ref().ok_or(crate::error::GENERIC_FAILURE)
    }
}

impl ChannelOps for TcpStreamOps {
    fn shutdown(&mut self, dirs: Directions) {
        if dirs.contains(Directions::READ | Directions::WRITE) {
            // Closing the socket cancels anything still in flight
            self.socket = None;
        } else if let Some(sock) = &self.socket {
            if dirs.contains(Directions::READ) {
                sock.shutdown(SD_RECEIVE as i32);
            }
            if dirs.contains(Directions::WRITE) {
                sock.shutdown(SD_SEND as i32);
            }
        }
    }

    fn connected(&mut self) -> std::result::Result<(), u32> {
        let sock = self.sock()?;
        // Make the socket usable for the normal socket calls
        match unsafe {
            setsockopt(
                sock.0,
                SOL_SOCKET as i32,
                SO_UPDATE_CONNECT_CONTEXT as i32,
                std::ptr::null(),
                0,
            )
        } {
            SOCKET_ERROR => Err(unsafe { WSAGetLastError() } as u32),
            _ => Ok(()),
        }
    }

    fn blocking_connect(&mut self) -> std::result::Result<(), u32> {
        let mut last = crate::error::CONN_REFUSED;
        while self.next < self.addrs.len() {
            let addr = self.addrs[self.next];
            self.next += 1;
            match std::net::TcpStream::connect(addr) {
                Ok(stream) => {
                    // std sockets are created overlapped-capable
                    let sock = TcpSock(stream.into_raw_socket() as SOCKET);
                    self.port.attach(sock.0 as _).map_err(raw_of)?;
                    self.socket = Some(sock);
                    return Ok(());
                }
                Err(e) => last = raw_of(e),
            }
        }
        Err(last)
    }

    fn connect_failed(&mut self, chan: &Arc<Channel>) -> ConnectVerdict {
        self.socket = None;
        match self.start_connect(chan) {
            Ok(()) => ConnectVerdict::Retry,
            Err(_) => ConnectVerdict::Failed,
        }
    }

    fn disconnected(&mut self) {
        self.socket = None;
    }

    fn post_read(&mut self, chan: &Arc<Channel>) -> std::result::Result<(), u32> {
        let capacity = self.read_capacity;
        let socket = self.sock()?.0;
        let mut buf = Buffer::with_capacity(OpKind::Read, Some(Arc::clone(chan)), capacity);
        buf.flags.insert(BufferFlags::WINSOCK);
        let (ptr, cap) = buf.region_mut();
        let wsabuf = WSABUF {
            len: cap as u32,
            buf: ptr,
        };
        let mut received = 0u32;
        let mut flags = 0u32;
        let overlapped = buf.overlapped_mut();
        let rc = unsafe {
            WSARecv(
                socket,
                &wsabuf,
                1,
                &mut received,
                &mut flags,
                overlapped as *mut OVERLAPPED,
                None,
            )
        };
        finish_post(buf, rc)
    }

    fn post_write(&mut self, chan: &Arc<Channel>, bytes: &[u8]) -> std::result::Result<usize, u32> {
        let socket = self.sock()?.0;
        let mut buf = Buffer::with_data(OpKind::Write, Some(Arc::clone(chan)), bytes);
        buf.flags.insert(BufferFlags::WINSOCK);
        let wsabuf = WSABUF {
            len: buf.data.len() as u32,
            buf: buf.data.as_mut_ptr(),
        };
        let mut sent = 0u32;
        let overlapped = buf.overlapped_mut();
        let rc = unsafe {
            WSASend(
                socket,
                &wsabuf,
                1,
                &mut sent,
                0,
                overlapped as *mut OVERLAPPED,
                None,
            )
        };
        finish_post(buf, rc).map(|()| bytes.len())
    }

    fn raw_handle(&self, _dirs: Directions) -> Option<usize> {
        self.socket.as_ref().map(|sock| sock.0)
    }

    fn option_names(&self) -> &'static [&'static str] {
        &["nodelay", "keepalive", "peername", "sockname"]
    }

    fn get_option(&self, name: &str) -> Option<String> {
        let sock = self.socket.as_ref()?;
        match name {
            "nodelay" => sock
                .get_bool(IPPROTO_TCP as i32, TCP_NODELAY as i32)
                .ok()
                .map(|on| (on as u8).to_string()),
            "keepalive" => sock
                .get_bool(SOL_SOCKET as i32, SO_KEEPALIVE as i32)
                .ok()
                .map(|on| (on as u8).to_string()),
            "peername" => sock.peer_addr().ok().map(|addr| addr.to_string()),
            "sockname" => sock.local_addr().ok().map(|addr| addr.to_string()),
            _ => None,
        }
    }

    fn set_option(&mut self, name: &str, value: &str) -> std::result::Result<(), crate::error::ChannelError> {
        let invalid = crate::error::ChannelError::Os(crate::error::INVALID_ARG as i32);
        let on = match value {
            "0" | "false" | "off" => false,
            "1" | "true" | "on" => true,
            _ => return Err(invalid),
        };
        let sock = self.socket.as_ref().ok_or(invalid)?;
        match name {
            "nodelay" => sock
                .set_bool(IPPROTO_TCP as i32, TCP_NODELAY as i32, on)
                .map_err(crate::error::ChannelError::from),
            "keepalive" => sock
                .set_bool(SOL_SOCKET as i32, SO_KEEPALIVE as i32, on)
                .map_err(crate::error::ChannelError::from),
            _ => Err(invalid),
        }
    }
}

/// Shared epilogue for overlapped posts: pending and synchronous success
/// both leave the buffer with the kernel (the completion is still posted);
/// anything else reclaims it and surfaces the code.
fn finish_post(buf: Box<Buffer>, rc: i32) -> std::result::Result<(), u32> {
    if rc == SOCKET_ERROR {
        let raw = unsafe { WSAGetLastError() } as u32;
        if raw != WSA_IO_PENDING as u32 {
            drop(buf);
            return Err(raw);
        }
    }
    let _ = buf.into_overlapped();
    Ok(())
}

fn raw_of(e: Error) -> u32 {
    e.raw_os_error().unwrap_or(crate::error::GENERIC_FAILURE as i32) as u32
}

/// Listener ops: AcceptEx replenishment plus child construction
struct TcpListenerOps {
    port: Arc<IocpPort>,
    listener: TcpSock,
    bound: SocketAddr,
    /// Accept sockets posted but not yet consumed, for cleanup
    inflight: Vec<SOCKET>,
    on_accept: AcceptFn,
    read_capacity: usize,
}

impl ChannelOps for TcpListenerOps {
    fn shutdown(&mut self, _dirs: Directions) {
        for sock in self.inflight.drain(..) {
            unsafe { closesocket(sock) };
        }
        // Dropping the listener socket aborts posted accepts
        self.listener.shutdown(SD_RECEIVE as i32);
    }

    fn accept(&mut self, buf: Box<Buffer>) -> Result<Accepted> {
        let accept_sock = TcpSock(buf.ctx as SOCKET);
        self.inflight.retain(|&s| s != accept_sock.0);
        // Tie the child to its listener so the usual socket calls work
        let listener = self.listener.0;
        let rc = unsafe {
            setsockopt(
                accept_sock.0,
                SOL_SOCKET as i32,
                SO_UPDATE_ACCEPT_CONTEXT as i32,
                &listener as *const _ as *const u8,
                mem::size_of::<SOCKET>() as i32,
            )
        };
        if rc == SOCKET_ERROR {
            return Err(Error::from_raw_os_error(unsafe { WSAGetLastError() }));
        }
        let peer = accept_peer(&buf);
        drop(buf);
        let ops = Box::new(TcpStreamOps {
            port: Arc::clone(&self.port),
            socket: Some(accept_sock),
            addrs: Vec::new(),
            next: 0,
            read_capacity: self.read_capacity,
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
            notify: Arc::clone(&self.on_accept),
        })
    }

    fn post_read(&mut self, chan: &Arc<Channel>) -> std::result::Result<(), u32> {
        let accept_sock = TcpSock::overlapped(&self.bound).map_err(raw_of)?;
        self.port.attach(accept_sock.0 as _).map_err(raw_of)?;
        let mut buf = Buffer::with_capacity(
            OpKind::Accept,
            Some(Arc::clone(chan)),
            2 * ACCEPT_ADDR_LEN as usize,
        );
        buf.flags.insert(BufferFlags::WINSOCK);
        buf.ctx = accept_sock.0;
        let (ptr, _) = buf.region_mut();
        let mut received = 0u32;
        let overlapped = buf.overlapped_mut();
        let ok = unsafe {
            AcceptEx(
                self.listener.0,
                accept_sock.0,
                ptr as *mut c_void,
                0,
                ACCEPT_ADDR_LEN,
                ACCEPT_ADDR_LEN,
                &mut received,
                overlapped as *mut OVERLAPPED,
            )
        };
        if ok == FALSE {
            let raw = unsafe { WSAGetLastError() } as u32;
            if raw != WSA_IO_PENDING as u32 {
                drop(buf);
                return Err(raw);
            }
        }
        self.inflight.push(accept_sock.0);
        // Both the buffer and the accept socket are the kernel's until the
        // completion lands
        mem::forget(accept_sock);
        let _ = buf.into_overlapped();
        Ok(())
    }

    fn post_write(&mut self, _chan: &Arc<Channel>, _bytes: &[u8]) -> std::result::Result<usize, u32> {
        Err(crate::error::SHUT_DOWN)
    }

    fn raw_handle(&self, _dirs: Directions) -> Option<usize> {
        Some(self.listener.0)
    }

    fn option_names(&self) -> &'static [&'static str] {
        &["sockname"]
    }

    fn get_option(&self, name: &str) -> Option<String> {
        match name {
            "sockname" => self.listener.local_addr().ok().map(|addr| addr.to_string()),
            _ => None,
        }
    }
}

/// Pull the remote address out of an AcceptEx address block
fn accept_peer(buf: &Buffer) -> String {
    let mut local: *mut SOCKADDR = std::ptr::null_mut();
    let mut local_len = 0i32;
    let mut remote: *mut SOCKADDR = std::ptr::null_mut();
    let mut remote_len = 0i32;
    unsafe {
        GetAcceptExSockaddrs(
            buf.data.as_ptr() as *const c_void,
            0,
            ACCEPT_ADDR_LEN,
            ACCEPT_ADDR_LEN,
            &mut local,
            &mut local_len,
            &mut remote,
            &mut remote_len,
        );
        if remote.is_null() {
            return String::new();
        }
        let storage = &*(remote as *const SOCKADDR_STORAGE);
        from_storage(storage)
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }
}

/// Begin connecting to the first reachable address of `addrs`. The channel
/// attaches to the calling thread; progress is driven by the worker and the
/// thread's event loop (or a blocking read/write).
pub fn connect(engine: &Engine, addrs: Vec<SocketAddr>) -> Result<ChannelHandle> {
    let port = engine
        .iocp()
        .ok_or_else(|| Error::from(ErrorKind::Unsupported))?;
    if addrs.is_empty() {
        return Err(Error::from(ErrorKind::InvalidInput));
    }
    let ops = Box::new(TcpStreamOps {
        port: Arc::clone(port),
        socket: None,
        addrs,
        next: 0,
        read_capacity: DEFAULT_READ_CAPACITY,
    });
    // The first address goes through the same retry path later attempts
    // use
    let chan = Channel::new(ops, ChannelState::ConnectRetry);
    {
        let mut g = chan.lock();
        driver::attach_current(&mut g);
        connect::connection_step(&chan, &mut g, false);
    }
    Ok(ChannelHandle::new(chan))
}

/// Listen on `addr`. `on_accept` runs (unlocked) on the listener's owning
/// thread for every accepted connection.
pub fn listen<F>(engine: &Engine, addr: SocketAddr, on_accept: F) -> Result<ChannelHandle>
where
    F: Fn(ChannelHandle, &str) + Send + Sync + 'static,
{
    let port = engine
        .iocp()
        .ok_or_else(|| Error::from(ErrorKind::Unsupported))?;
    let listener = TcpSock::overlapped(&addr)?;
    listener.bind(&addr)?;
    listener.listen(128)?;
    port.attach(listener.0 as _)?;
    let bound = listener.local_addr()?;
    let ops = Box::new(TcpListenerOps {
        port: Arc::clone(port),
        listener,
        bound,
        inflight: Vec::new(),
        on_accept: Arc::new(on_accept) as AcceptFn,
        read_capacity: DEFAULT_READ_CAPACITY,
    });
    let chan = Channel::new(ops, ChannelState::Listening);
    {
        let mut g = chan.lock();
        driver::attach_current(&mut g);
        let _ = io::post_reads(&chan, &mut g);
    }
    Ok(ChannelHandle::new(chan))
}
