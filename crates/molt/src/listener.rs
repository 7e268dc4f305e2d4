//! Listener binding, inheritance, and reconciliation.
//!
//! Listeners are bound in the master before any worker exists and shared
//! with workers by fork. The set can be reconciled against a desired list
//! ([`ListenerSet::set_listeners`]): removed addresses are closed, retained
//! ones get their options re-applied, new ones are bound. Binding the same
//! address twice returns the existing listener untouched.
//!
//! On startup, already-bound sockets are picked up from two sources: the
//! `MOLT_FD` environment variable (comma-separated fd list, written by a
//! re-exec'ing master) and the systemd socket-activation pair
//! `LISTEN_FDS`/`LISTEN_PID` (fds 3..3+N).

use crate::error::Error;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable carrying inherited listener fds across exec.
pub const FD_ENV: &str = "MOLT_FD";

/// A parsed listener address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListenerAddress {
    /// TCP endpoint.
    Tcp(SocketAddr),
    /// UNIX domain socket path.
    Unix(PathBuf),
}

impl ListenerAddress {
    /// Parse the accepted address syntaxes: `PORT`, `HOST:PORT`
    /// (IPv4 or bracketed IPv6), `/path`, and `unix:/path`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        if let Ok(port) = s.parse::<u16>() {
            return Ok(Self::Tcp(SocketAddr::from(([0, 0, 0, 0], port))));
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Tcp(addr));
        }
        // Hostname: resolve and take the first address.
        let mut addrs = s.to_socket_addrs().map_err(|e| Error::Listener {
            address: s.to_string(),
            source: e,
        })?;
        addrs.next().map(Self::Tcp).ok_or_else(|| Error::Listener {
            address: s.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
        })
    }

    /// Canonical display form: `host:port` or the socket path.
    #[must_use]
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ListenerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Per-address socket options, applied at bind time and re-applied when
/// the listener set is reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerOptions {
    /// Listen backlog.
    pub backlog: i32,
    /// `SO_RCVBUF`, when set.
    pub rcvbuf: Option<usize>,
    /// `SO_SNDBUF`, when set.
    pub sndbuf: Option<usize>,
    /// `TCP_NODELAY` on accepted connections.
    pub tcp_nodelay: bool,
    /// `TCP_CORK` on accepted connections.
    pub tcp_nopush: bool,
    /// `IPV6_V6ONLY`, when set on an IPv6 listener.
    pub ipv6only: Option<bool>,
    /// `SO_REUSEPORT`.
    pub reuseport: bool,
    /// File-mode mask applied while binding a UNIX socket.
    pub umask: Option<u32>,
    /// `TCP_DEFER_ACCEPT` timeout in seconds, when set.
    pub tcp_defer_accept: Option<i32>,
    /// Bind attempts before giving up.
    pub tries: u32,
    /// Delay between bind attempts, in milliseconds.
    pub delay_ms: u64,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            backlog: 1024,
            rcvbuf: None,
            sndbuf: None,
            tcp_nodelay: true,
            tcp_nopush: false,
            ipv6only: None,
            reuseport: false,
            umask: None,
            tcp_defer_accept: Some(1),
            tries: 5,
            delay_ms: 500,
        }
    }
}

enum Sock {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// An accepted client connection.
pub enum Connection {
    /// From a TCP listener.
    Tcp(TcpStream),
    /// From a UNIX listener.
    Unix(UnixStream),
}

impl Connection {
    /// The peer address string for `REMOTE_ADDR`. UNIX peers report
    /// `127.0.0.1` in the CGI tradition.
    #[must_use]
    pub fn remote_addr(&self) -> String {
        match self {
            Self::Tcp(s) => s
                .peer_addr()
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            Self::Unix(_) => "127.0.0.1".to_string(),
        }
    }

    /// Clone the underlying socket handle (shared file description).
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Self::Tcp(s) => Self::Tcp(s.try_clone()?),
            Self::Unix(s) => Self::Unix(s.try_clone()?),
        })
    }

    /// Shut down the write half, flushing queued data to the peer.
    pub fn shutdown_write(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(std::net::Shutdown::Write),
            Self::Unix(s) => s.shutdown(std::net::Shutdown::Write),
        }
    }

    /// Best-effort liveness probe ahead of application dispatch.
    ///
    /// On Linux, `TCP_INFO` exposes the connection state without touching
    /// the data stream; a `CLOSE_WAIT` socket means the peer already sent
    /// its FIN. Non-TCP peers and probe failures report alive.
    #[must_use]
    pub fn client_gone(&self) -> bool {
        const TCP_STATE_CLOSE_WAIT: u8 = 8;
        let Self::Tcp(stream) = self else {
            return false;
        };
        let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                stream.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                std::ptr::addr_of_mut!(info).cast(),
                &mut len,
            )
        };
        ret == 0 && info.tcpi_state == TCP_STATE_CLOSE_WAIT
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(s) => write!(f, "Connection::Tcp({:?})", s.peer_addr().ok()),
            Self::Unix(_) => write!(f, "Connection::Unix"),
        }
    }
}

/// One bound server socket.
pub struct Listener {
    addr: ListenerAddress,
    sock: Sock,
    options: ListenerOptions,
    // Pid that bound the socket. Only that process unlinks a UNIX socket
    // path on drop; forked children share the fd but not path ownership.
    owner_pid: u32,
}

impl Listener {
    /// Bind with bounded retries per the options.
    pub fn bind(addr: &ListenerAddress, options: &ListenerOptions) -> Result<Self, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::bind_once(addr, options) {
                Ok(listener) => return Ok(listener),
                Err(source) if attempt < options.tries.max(1) => {
                    tracing::warn!(
                        address = %addr,
                        attempt,
                        error = %source,
                        "bind failed, retrying"
                    );
                    std::thread::sleep(Duration::from_millis(options.delay_ms));
                }
                Err(source) => {
                    return Err(Error::Listener {
                        address: addr.name(),
                        source,
                    })
                }
            }
        }
    }

    fn bind_once(addr: &ListenerAddress, options: &ListenerOptions) -> io::Result<Self> {
        match addr {
            ListenerAddress::Tcp(tcp_addr) => {
                let domain = Domain::for_address(*tcp_addr);
                let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
                socket.set_reuse_address(true)?;
                if options.reuseport {
                    socket.set_reuse_port(true)?;
                }
                if let Some(v6only) = options.ipv6only {
                    if domain == Domain::IPV6 {
                        socket.set_only_v6(v6only)?;
                    }
                }
                if let Some(rcvbuf) = options.rcvbuf {
                    socket.set_recv_buffer_size(rcvbuf)?;
                }
                if let Some(sndbuf) = options.sndbuf {
                    socket.set_send_buffer_size(sndbuf)?;
                }
                socket.bind(&(*tcp_addr).into())?;
                socket.listen(options.backlog)?;
                socket.set_nonblocking(true)?;
                let std_listener: TcpListener = socket.into();
                let listener = Self {
                    // Record the kernel-assigned port for port-0 binds.
                    addr: ListenerAddress::Tcp(std_listener.local_addr()?),
                    sock: Sock::Tcp(std_listener),
                    options: options.clone(),
                    owner_pid: std::process::id(),
                };
                listener.apply_options()?;
                Ok(listener)
            }
            ListenerAddress::Unix(path) => {
                if path.exists() && !unix_socket_is_live(path) {
                    tracing::info!(path = %path.display(), "removing stale socket");
                    std::fs::remove_file(path)?;
                }
                let old_mask = options.umask.map(|m| unsafe { libc::umask(m as libc::mode_t) });
                let bound = UnixListener::bind(path);
                if let Some(old) = old_mask {
                    unsafe { libc::umask(old) };
                }
                let listener = bound?;
                listener.set_nonblocking(true)?;
                Ok(Self {
                    addr: ListenerAddress::Unix(path.clone()),
                    sock: Sock::Unix(listener),
                    options: options.clone(),
                    owner_pid: std::process::id(),
                })
            }
        }
    }

    /// Re-apply the options that can change on a live socket.
    pub fn apply_options(&self) -> io::Result<()> {
        let fd = self.as_raw_fd();
        if let Sock::Tcp(_) = self.sock {
            if let Some(secs) = self.options.tcp_defer_accept {
                setsockopt_i32(fd, libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, secs)?;
            }
        }
        if let Some(rcvbuf) = self.options.rcvbuf {
            setsockopt_i32(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, rcvbuf as i32)?;
        }
        if let Some(sndbuf) = self.options.sndbuf {
            setsockopt_i32(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, sndbuf as i32)?;
        }
        Ok(())
    }

    /// Replace the stored options (listener retained across a reconcile).
    pub fn set_options(&mut self, options: ListenerOptions) -> io::Result<()> {
        self.options = options;
        self.apply_options()
    }

    /// The canonical address.
    #[must_use]
    pub fn address(&self) -> &ListenerAddress {
        &self.addr
    }

    /// Accept one pending connection, applying per-connection options.
    /// `None` when the queue is empty.
    pub fn accept(&self) -> io::Result<Option<Connection>> {
        match &self.sock {
            Sock::Tcp(listener) => match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    if self.options.tcp_nodelay {
                        stream.set_nodelay(true)?;
                    }
                    if self.options.tcp_nopush {
                        setsockopt_i32(stream.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_CORK, 1)?;
                    }
                    Ok(Some(Connection::Tcp(stream)))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            },
            Sock::Unix(listener) => match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    Ok(Some(Connection::Unix(stream)))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    /// Set or clear `FD_CLOEXEC`. Workers set it; the master clears it so
    /// a re-exec'd master keeps its sockets.
    pub fn set_cloexec(&self, enabled: bool) -> io::Result<()> {
        set_cloexec(self.as_raw_fd(), enabled)
    }

    /// Adopt an already-bound socket (inherited fd) without rebinding.
    fn from_inherited_fd(fd: RawFd) -> io::Result<Self> {
        let family = socket_family(fd)?;
        match family {
            libc::AF_INET | libc::AF_INET6 => {
                let listener = unsafe { TcpListener::from_raw_fd(fd) };
                listener.set_nonblocking(true)?;
                let addr = listener.local_addr()?;
                Ok(Self {
                    addr: ListenerAddress::Tcp(addr),
                    sock: Sock::Tcp(listener),
                    options: ListenerOptions::default(),
                    owner_pid: std::process::id(),
                })
            }
            libc::AF_UNIX => {
                let listener = unsafe { UnixListener::from_raw_fd(fd) };
                listener.set_nonblocking(true)?;
                let path = listener
                    .local_addr()
                    .ok()
                    .and_then(|a| a.as_pathname().map(PathBuf::from))
                    .unwrap_or_default();
                Ok(Self {
                    addr: ListenerAddress::Unix(path),
                    sock: Sock::Unix(listener),
                    options: ListenerOptions::default(),
                    owner_pid: std::process::id(),
                })
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("inherited fd {fd} has unsupported family {other}"),
            )),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match &self.sock {
            Sock::Tcp(l) => l.as_raw_fd(),
            Sock::Unix(l) => l.as_raw_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.owner_pid != std::process::id() {
            return;
        }
        if let (Sock::Unix(_), ListenerAddress::Unix(path)) = (&self.sock, &self.addr) {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({})", self.addr)
    }
}

/// The set of bound listeners, owned by the master.
#[derive(Debug, Default)]
pub struct ListenerSet {
    listeners: Vec<Listener>,
}

impl ListenerSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt sockets inherited through the environment, then return the set.
    pub fn inherit() -> io::Result<Self> {
        let mut set = Self::new();
        for fd in inherited_fds() {
            let listener = Listener::from_inherited_fd(fd)?;
            tracing::info!(fd, address = %listener.address(), "inherited listener");
            set.listeners.push(listener);
        }
        Ok(set)
    }

    /// Bind an address, or return the existing listener when already bound.
    pub fn bind_listen(
        &mut self,
        addr: &ListenerAddress,
        options: &ListenerOptions,
    ) -> Result<&Listener, Error> {
        if let Some(pos) = self.position(addr) {
            return Ok(&self.listeners[pos]);
        }
        let listener = Listener::bind(addr, options)?;
        tracing::info!(address = %listener.address(), "listening");
        self.listeners.push(listener);
        Ok(self.listeners.last().unwrap())
    }

    /// Reconcile against a desired set: close removed listeners, re-apply
    /// options to retained ones, bind new ones.
    pub fn set_listeners(
        &mut self,
        desired: &[(ListenerAddress, ListenerOptions)],
    ) -> Result<(), Error> {
        self.listeners.retain(|listener| {
            let keep = desired.iter().any(|(addr, _)| {
                addresses_match(listener.address(), addr)
            });
            if !keep {
                tracing::info!(address = %listener.address(), "closing removed listener");
            }
            keep
        });

        for (addr, options) in desired {
            match self.position(addr) {
                Some(pos) => {
                    self.listeners[pos]
                        .set_options(options.clone())
                        .map_err(|source| Error::Listener {
                            address: addr.name(),
                            source,
                        })?;
                }
                None => {
                    self.bind_listen(addr, options)?;
                }
            }
        }
        Ok(())
    }

    /// Canonical names of all bound listeners.
    #[must_use]
    pub fn listener_names(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.address().name()).collect()
    }

    /// All listeners.
    pub fn iter(&self) -> impl Iterator<Item = &Listener> {
        self.listeners.iter()
    }

    /// Raw fds of all listeners, in set order.
    #[must_use]
    pub fn fds(&self) -> Vec<RawFd> {
        self.listeners.iter().map(Listener::as_raw_fd).collect()
    }

    /// Number of listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// True when no listener is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Look up a listener by fd.
    #[must_use]
    pub fn by_fd(&self, fd: RawFd) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.as_raw_fd() == fd)
    }

    /// Set or clear close-on-exec on every listener.
    pub fn set_cloexec(&self, enabled: bool) -> io::Result<()> {
        for listener in &self.listeners {
            listener.set_cloexec(enabled)?;
        }
        Ok(())
    }

    /// Close all listeners. A stopping worker calls this so in-flight
    /// `accept` queues drain elsewhere.
    pub fn close_all(&mut self) {
        self.listeners.clear();
    }

    /// Serialize fds for the exec environment variable.
    #[must_use]
    pub fn fd_env_value(&self) -> String {
        self.fds()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn position(&self, addr: &ListenerAddress) -> Option<usize> {
        self.listeners
            .iter()
            .position(|l| addresses_match(l.address(), addr))
    }
}

/// Two addresses refer to the same endpoint. A desired port-0 TCP address
/// never matches (every bind of port 0 is a fresh socket).
fn addresses_match(bound: &ListenerAddress, desired: &ListenerAddress) -> bool {
    match (bound, desired) {
        (ListenerAddress::Tcp(a), ListenerAddress::Tcp(b)) => {
            b.port() != 0 && a == b
        }
        (ListenerAddress::Unix(a), ListenerAddress::Unix(b)) => a == b,
        _ => false,
    }
}

/// Collect inherited fds from `MOLT_FD` and systemd socket activation.
#[must_use]
pub fn inherited_fds() -> Vec<RawFd> {
    let mut fds = Vec::new();
    if let Ok(list) = std::env::var(FD_ENV) {
        for part in list.split(',').filter(|p| !p.is_empty()) {
            if let Ok(fd) = part.parse::<RawFd>() {
                fds.push(fd);
            }
        }
    }
    if let (Ok(count), Ok(pid)) = (std::env::var("LISTEN_FDS"), std::env::var("LISTEN_PID")) {
        let ours = pid.parse::<u32>() == Ok(std::process::id());
        if ours {
            if let Ok(count) = count.parse::<RawFd>() {
                // systemd passes fds starting at 3.
                fds.extend(3..3 + count);
            }
        }
    }
    fds.sort_unstable();
    fds.dedup();
    fds
}

fn unix_socket_is_live(path: &std::path::Path) -> bool {
    UnixStream::connect(path).is_ok()
}

fn socket_family(fd: RawFd) -> io::Result<libc::c_int> {
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, std::ptr::addr_of_mut!(addr).cast(), &mut len)
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(addr.ss_family as libc::c_int)
}

pub(crate) fn setsockopt_i32(
    fd: RawFd,
    level: libc::c_int,
    option: libc::c_int,
    value: i32,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            std::ptr::addr_of!(value).cast(),
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
