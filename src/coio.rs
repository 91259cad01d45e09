//! Cooperative input/output.
//!
//! Every operation here follows one pattern: attempt the non-blocking
//! syscall; on "would block", arm an io watcher for the required direction
//! and yield with a timeout; when woken, stop the watcher, check for
//! cancellation, and retry. The watcher is owned by a scope guard so it is
//! stopped on every exit path — success, error, timeout or cancel.
//!
//! Timeouts of composite operations (a connect spanning several resolved
//! addresses, a write needing several syscalls) share a single deadline
//! computed at entry.

use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpListener, ToSocketAddrs, UdpSocket};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use mio::Interest;

use crate::clock;
use crate::coeio;
use crate::cord::cord;
use crate::error::{Error, Result};
use crate::ev::{self, Deadline};
use crate::fiber::{self, Builder};

/// Passing this as the host of [`CoioStream::connect`] routes the
/// connection to a Unix-domain socket; the service is the socket path.
pub const UNIX_HOST: &str = "unix/";

bitflags::bitflags! {
    /// Readiness events for [`wait`].
    pub struct CoioFlags: u32 {
        const READ = 1;
        const WRITE = 2;
    }
}

impl CoioFlags {
    fn interest(self) -> Interest {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            // READ is also the fallback for an empty mask.
            _ => Interest::READABLE,
        }
    }
}

/// Stops the io watcher when the wait scope ends, no matter how.
struct IoGuard {
    id: ev::IoWatcherId,
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        cord().ev.io_stop(self.id);
    }
}

/// Park the current fiber until `fd` is ready or `delay` elapses. Returns
/// whether the wait timed out. A cancellation point.
fn wait_inner(fd: RawFd, flags: CoioFlags, delay: f64) -> Result<bool> {
    let cord = cord();
    let id = cord
        .ev
        .io_start(fd, flags.interest(), fiber::current())
        .map_err(|source| Error::Socket {
            fd,
            op: "wait",
            source,
        })?;
    let guard = IoGuard { id };
    let timed_out = fiber::yield_timeout_seconds(delay);
    drop(guard);
    fiber::testcancel()?;
    Ok(timed_out)
}

/// Yield until a `READ` or `WRITE` event on `fd`, the public low-level
/// primitive for callers bringing their own socket machinery.
pub fn wait(fd: RawFd, flags: CoioFlags, timeout: Duration) -> Result<()> {
    if wait_inner(fd, flags, ev::to_seconds(timeout))? {
        return Err(Error::TimedOut);
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// fd helpers
////////////////////////////////////////////////////////////////////////////////

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn nonblocking_socket(family: libc::c_int) -> Result<RawFd> {
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::socket(-1, "socket"));
    }
    if let Err(source) = set_nonblocking(fd) {
        unsafe { libc::close(fd) };
        return Err(Error::Socket {
            fd,
            op: "fcntl",
            source,
        });
    }
    Ok(fd)
}

fn getsockopt_error(fd: RawFd) -> Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(Error::socket(fd, "getsockopt"));
    }
    Ok(err)
}

pub(crate) fn addr_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

pub(crate) unsafe fn sockaddr_to_addr(
    storage: *const libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Option<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
            let sin = &*(storage as *const libc::sockaddr_in);
            Some(SocketAddr::from((
                sin.sin_addr.s_addr.to_ne_bytes(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = &*(storage as *const libc::sockaddr_in6);
            Some(SocketAddr::from((
                sin6.sin6_addr.s6_addr,
                u16::from_be(sin6.sin6_port),
            )))
        }
        _ => None,
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoioStream
////////////////////////////////////////////////////////////////////////////////

/// A non-blocking stream socket whose operations park the calling fiber on
/// the cord's event loop instead of blocking the thread.
pub struct CoioStream {
    fd: RawFd,
}

impl CoioStream {
    /// Adopt an fd-like object, switching it to non-blocking mode.
    pub fn new<T: IntoRawFd>(inner: T) -> Result<CoioStream> {
        let fd = inner.into_raw_fd();
        match set_nonblocking(fd) {
            Ok(()) => Ok(CoioStream { fd }),
            Err(source) => {
                unsafe { libc::close(fd) };
                Err(Error::Socket {
                    fd,
                    op: "fcntl",
                    source,
                })
            }
        }
    }

    /// Resolve `host:service` and connect to the first address that
    /// accepts, trying the candidates in resolver order under one shared
    /// deadline. The magic host [`UNIX_HOST`] connects to the Unix-domain
    /// socket at path `service` instead.
    pub fn connect(host: &str, service: &str, timeout: Duration) -> Result<CoioStream> {
        let deadline = Deadline::new(ev::to_seconds(timeout));
        if host == UNIX_HOST {
            return Self::connect_unix(Path::new(service), &deadline);
        }
        let addrs = coeio::getaddrinfo(host, service, deadline.remaining_duration())?;
        for addr in &addrs {
            match Self::connect_addr_deadline(addr, &deadline) {
                Ok(stream) => return Ok(stream),
                Err(Error::TimedOut) => return Err(Error::TimedOut),
                Err(Error::FiberIsCancelled) => return Err(Error::FiberIsCancelled),
                Err(e) => log::error!("failed to connect to {}: {}", addr, e),
            }
        }
        Err(Error::Socket {
            fd: -1,
            op: "connect",
            source: io::Error::new(io::ErrorKind::AddrNotAvailable, "connection failed"),
        })
    }

    /// Connect to one address with a timeout.
    pub fn connect_addr(addr: &SocketAddr, timeout: Duration) -> Result<CoioStream> {
        let deadline = Deadline::new(ev::to_seconds(timeout));
        Self::connect_addr_deadline(addr, &deadline)
    }

    fn connect_addr_deadline(addr: &SocketAddr, deadline: &Deadline) -> Result<CoioStream> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let (storage, len) = addr_to_sockaddr(addr);
        Self::connect_raw(family, &storage as *const _ as *const libc::sockaddr, len, deadline)
    }

    fn connect_unix(path: &Path, deadline: &Deadline) -> Result<CoioStream> {
        let mut un: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        un.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = path.as_os_str().as_bytes();
        if bytes.len() >= un.sun_path.len() {
            return Err(Error::IllegalParams("unix socket path is too long".into()));
        }
        for (dst, src) in un.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        let len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        Self::connect_raw(
            libc::AF_UNIX,
            &un as *const _ as *const libc::sockaddr,
            len,
            deadline,
        )
    }

    fn connect_raw(
        family: libc::c_int,
        addr: *const libc::sockaddr,
        len: libc::socklen_t,
        deadline: &Deadline,
    ) -> Result<CoioStream> {
        let fd = nonblocking_socket(family)?;
        // Dropping the stream closes the socket on every failure path.
        let stream = CoioStream { fd };
        let rc = unsafe { libc::connect(fd, addr, len) };
        if rc == 0 {
            return Ok(stream);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(Error::Socket {
                fd,
                op: "connect",
                source: err,
            });
        }
        // Wait until the socket is ready for writing or the deadline hits.
        if wait_inner(fd, CoioFlags::WRITE, deadline.remaining())? {
            return Err(Error::TimedOut);
        }
        let so_error = getsockopt_error(fd)?;
        if so_error != 0 {
            return Err(Error::Socket {
                fd,
                op: "connect",
                source: io::Error::from_raw_os_error(so_error),
            });
        }
        Ok(stream)
    }

    /// Read once: at least one byte, or 0 on EOF.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.read_ahead(buf, 1, timeout)
    }

    /// Read at least `want` bytes, up to `buf.len()`, yielding between
    /// partial reads. EOF shows as a short (possibly zero) count; a
    /// deadline hit fails with [`Error::TimedOut`] and leaves whatever was
    /// read in `buf`.
    pub fn read_ahead(&self, buf: &mut [u8], want: usize, timeout: Duration) -> Result<usize> {
        if want > buf.len() {
            return Err(Error::IllegalParams(
                "read_ahead: want exceeds the buffer size".into(),
            ));
        }
        let deadline = Deadline::new(ev::to_seconds(timeout));
        let mut pos = 0;
        loop {
            // Sic: try the syscall first; the caller expects data.
            let n = unsafe {
                libc::read(
                    self.fd,
                    buf[pos..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - pos,
                )
            };
            if n > 0 {
                pos += n as usize;
                if pos >= want {
                    return Ok(pos);
                }
            } else if n == 0 {
                return Ok(pos);
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(Error::Socket {
                        fd: self.fd,
                        op: "read",
                        source: err,
                    });
                }
            }
            if wait_inner(self.fd, CoioFlags::READ, deadline.remaining())? {
                return Err(Error::TimedOut);
            }
        }
    }

    /// Fill `buf` completely; a premature EOF is an error.
    pub fn readn(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let want = buf.len();
        let n = self.read_ahead(buf, want, timeout)?;
        if n < want {
            return Err(Error::Socket {
                fd: self.fd,
                op: "read",
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected EOF when reading from socket",
                ),
            });
        }
        Ok(n)
    }

    /// Write the whole buffer, yielding while the socket is not ready.
    pub fn write_timeout(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        let deadline = Deadline::new(ev::to_seconds(timeout));
        let mut pos = 0;
        loop {
            let n = unsafe {
                libc::write(
                    self.fd,
                    buf[pos..].as_ptr() as *const libc::c_void,
                    buf.len() - pos,
                )
            };
            if n >= 0 {
                pos += n as usize;
                if pos >= buf.len() {
                    return Ok(pos);
                }
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(Error::Socket {
                        fd: self.fd,
                        op: "write",
                        source: err,
                    });
                }
            }
            if wait_inner(self.fd, CoioFlags::WRITE, deadline.remaining())? {
                return Err(Error::TimedOut);
            }
        }
    }

    /// Scatter-gather write of all bytes (or up to `size_hint` bytes if it
    /// is non-zero). The cursor over the slices is kept internally: the
    /// caller's buffers are never modified, partial progress across yields
    /// resumes mid-slice.
    pub fn writev(&self, bufs: &[IoSlice<'_>], size_hint: usize, timeout: Duration) -> Result<usize> {
        let deadline = Deadline::new(ev::to_seconds(timeout));
        let mut idx = 0;
        let mut off = 0;
        let mut total = 0;
        if bufs.is_empty() {
            return Ok(0);
        }
        // POSIX guarantees at least 1024 iovecs per writev.
        const IOV_MAX: usize = 1024;
        let mut iovs: Vec<libc::iovec> = Vec::with_capacity(bufs.len().min(IOV_MAX));
        loop {
            iovs.clear();
            for (i, slice) in bufs[idx..].iter().take(IOV_MAX).enumerate() {
                let skip = if i == 0 { off } else { 0 };
                iovs.push(libc::iovec {
                    iov_base: unsafe { slice.as_ptr().add(skip) } as *mut libc::c_void,
                    iov_len: slice.len() - skip,
                });
            }
            let n = unsafe { libc::writev(self.fd, iovs.as_ptr(), iovs.len() as libc::c_int) };
            if n >= 0 {
                let mut left = n as usize;
                total += left;
                // Advance the cursor past fully written slices.
                while left > 0 {
                    let avail = bufs[idx].len() - off;
                    if left >= avail {
                        left -= avail;
                        idx += 1;
                        off = 0;
                    } else {
                        off += left;
                        left = 0;
                    }
                }
                if size_hint > 0 && total >= size_hint {
                    return Ok(total);
                }
                if idx >= bufs.len() {
                    debug_assert_eq!(off, 0);
                    return Ok(total);
                }
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(Error::Socket {
                        fd: self.fd,
                        op: "writev",
                        source: err,
                    });
                }
            }
            if wait_inner(self.fd, CoioFlags::WRITE, deadline.remaining())? {
                return Err(Error::TimedOut);
            }
        }
    }

    /// One successful `write` syscall (may be partial); used by the
    /// [`Write`] impl, which is allowed to report partial progress.
    fn write_some(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        let deadline = Deadline::new(ev::to_seconds(timeout));
        loop {
            let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(Error::Socket {
                    fd: self.fd,
                    op: "write",
                    source: err,
                });
            }
            if wait_inner(self.fd, CoioFlags::WRITE, deadline.remaining())? {
                return Err(Error::TimedOut);
            }
        }
    }
}

fn to_io_error(e: Error) -> io::Error {
    match e {
        Error::TimedOut => io::ErrorKind::TimedOut.into(),
        Error::FiberIsCancelled => {
            io::Error::new(io::ErrorKind::Interrupted, "fiber is cancelled")
        }
        Error::Socket { source, .. } => source,
        Error::System(source) => source,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

impl Read for CoioStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_timeout(buf, clock::INFINITY).map_err(to_io_error)
    }
}

impl Write for CoioStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_some(buf, clock::INFINITY).map_err(to_io_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for CoioStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for CoioStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for CoioStream {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

impl std::fmt::Debug for CoioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoioStream").field("fd", &self.fd).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoioListener
////////////////////////////////////////////////////////////////////////////////

/// A TCP listener whose `accept` parks the calling fiber.
pub struct CoioListener {
    inner: TcpListener,
}

impl CoioListener {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<CoioListener> {
        let inner = TcpListener::bind(addr).map_err(Error::System)?;
        inner.set_nonblocking(true).map_err(Error::System)?;
        Ok(CoioListener { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().map_err(Error::System)
    }

    /// Accept one connection, waiting forever.
    pub fn accept(&self) -> Result<(CoioStream, SocketAddr)> {
        self.accept_timeout(clock::INFINITY)
    }

    /// Accept one connection within `timeout`. The accepted socket is
    /// switched to non-blocking mode with `TCP_NODELAY` set.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<(CoioStream, SocketAddr)> {
        let deadline = Deadline::new(ev::to_seconds(timeout));
        loop {
            // Assume a client is already waiting.
            match self.inner.accept() {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    stream.set_nonblocking(true).map_err(Error::System)?;
                    return Ok((CoioStream { fd: stream.into_raw_fd() }, addr));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    return Err(Error::Socket {
                        fd: self.inner.as_raw_fd(),
                        op: "accept",
                        source: e,
                    })
                }
            }
            if wait_inner(self.inner.as_raw_fd(), CoioFlags::READ, deadline.remaining())? {
                return Err(Error::TimedOut);
            }
        }
    }
}

impl TryFrom<TcpListener> for CoioListener {
    type Error = Error;

    fn try_from(value: TcpListener) -> Result<Self> {
        value.set_nonblocking(true).map_err(Error::System)?;
        Ok(Self { inner: value })
    }
}

impl AsRawFd for CoioListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoioDgram
////////////////////////////////////////////////////////////////////////////////

/// A UDP socket with fiber-blocking send/receive.
pub struct CoioDgram {
    fd: RawFd,
}

impl CoioDgram {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<CoioDgram> {
        let sock = UdpSocket::bind(addr).map_err(Error::System)?;
        sock.set_nonblocking(true).map_err(Error::System)?;
        Ok(CoioDgram {
            fd: sock.into_raw_fd(),
        })
    }

    /// Send one datagram; fails with [`Error::TimedOut`] if the socket
    /// stays unwritable for the whole `timeout`.
    pub fn send_to(&self, buf: &[u8], addr: &SocketAddr, timeout: Duration) -> Result<usize> {
        let deadline = Deadline::new(ev::to_seconds(timeout));
        let (storage, len) = addr_to_sockaddr(addr);
        loop {
            let n = unsafe {
                libc::sendto(
                    self.fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    0,
                    &storage as *const _ as *const libc::sockaddr,
                    len,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(Error::Socket {
                    fd: self.fd,
                    op: "sendto",
                    source: err,
                });
            }
            if wait_inner(self.fd, CoioFlags::WRITE, deadline.remaining())? {
                return Err(Error::TimedOut);
            }
        }
    }

    /// Receive one datagram of up to `buf.len()` bytes.
    pub fn recv_from(&self, buf: &mut [u8], timeout: Duration) -> Result<(usize, SocketAddr)> {
        let deadline = Deadline::new(ev::to_seconds(timeout));
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if n >= 0 {
                let addr = unsafe { sockaddr_to_addr(&storage, len) }.ok_or_else(|| {
                    Error::IllegalParams("datagram from an unsupported address family".into())
                })?;
                return Ok((n as usize, addr));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(Error::Socket {
                    fd: self.fd,
                    op: "recvfrom",
                    source: err,
                });
            }
            if wait_inner(self.fd, CoioFlags::READ, deadline.remaining())? {
                return Err(Error::TimedOut);
            }
        }
    }
}

impl CoioDgram {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc < 0 {
            return Err(Error::socket(self.fd, "getsockname"));
        }
        unsafe { sockaddr_to_addr(&storage, len) }
            .ok_or_else(|| Error::IllegalParams("socket of an unsupported address family".into()))
    }
}

impl AsRawFd for CoioDgram {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CoioDgram {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoioService
////////////////////////////////////////////////////////////////////////////////

/// An accept-loop service: binds and listens, and runs a dedicated
/// acceptor fiber that hands every incoming connection to a freshly
/// created, named worker fiber.
pub struct CoioService {
    addr: SocketAddr,
    acceptor: Option<fiber::UnitJoinHandle<'static>>,
}

impl CoioService {
    /// Bind to `addr` and start accepting. Each connection runs
    /// `handler(stream, peer)` in its own detached fiber named
    /// `"<name>/<peer>"`.
    pub fn start<F>(name: &str, addr: impl ToSocketAddrs, handler: F) -> Result<CoioService>
    where
        F: Fn(CoioStream, SocketAddr) + 'static,
    {
        let listener = CoioListener::bind(addr)?;
        let local = listener.local_addr()?;
        let name = name.to_string();
        let handler: Rc<F> = Rc::new(handler);
        let acceptor = Builder::new()
            .name(format!("{name}.acceptor"))
            .proc(move || accept_loop(&name, listener, handler))
            .start()?;
        Ok(CoioService {
            addr: local,
            acceptor: Some(acceptor),
        })
    }

    /// The bound address (useful with an ephemeral port).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Cancel the acceptor fiber and wait for it to exit. Connections
    /// already handed to worker fibers keep running.
    pub fn stop(mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.cancel();
            acceptor.join();
        }
    }
}

impl Drop for CoioService {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.cancel();
            // Drop may not yield; the acceptor observes the cancel at its
            // next accept and recycles itself.
            acceptor.detach();
        }
    }
}

fn accept_loop<F>(name: &str, listener: CoioListener, handler: Rc<F>)
where
    F: Fn(CoioStream, SocketAddr) + 'static,
{
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let handler = handler.clone();
                let spawned = Builder::new()
                    .name(format!("{name}/{peer}"))
                    .proc(move || handler(stream, peer))
                    .start_detached();
                if let Err(e) = spawned {
                    // `stream` was moved into the closure; a failed spawn
                    // drops the closure and with it the connection.
                    log::error!("{name}: can't create a handler fiber, dropping client connection: {e}");
                }
            }
            Err(Error::FiberIsCancelled) => return,
            Err(e) => {
                log::error!("{name}: accept failed: {e}");
                fiber::sleep(Duration::from_millis(100));
                if fiber::is_cancelled() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_to_interest() {
        assert!(CoioFlags::READ.interest().is_readable());
        assert!(CoioFlags::WRITE.interest().is_writable());
        let both = (CoioFlags::READ | CoioFlags::WRITE).interest();
        assert!(both.is_readable() && both.is_writable());
    }

    #[test]
    fn sockaddr_round_trip() {
        let addrs = [
            "127.0.0.1:3301".parse::<SocketAddr>().unwrap(),
            "[::1]:8080".parse::<SocketAddr>().unwrap(),
        ];
        for addr in addrs {
            let (storage, len) = addr_to_sockaddr(&addr);
            let back = unsafe { sockaddr_to_addr(&storage, len) }.unwrap();
            assert_eq!(back.ip(), addr.ip());
            assert_eq!(back.port(), addr.port());
        }
    }
}
