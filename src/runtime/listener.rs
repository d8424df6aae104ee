//! Listening endpoint setup.
//!
//! One listener per process, shared read-only by every worker. Each worker
//! keeps a single accept armed on it.

use crate::runtime::error::BindError;
use socket2::{Domain, SockAddr, Socket, Type};
use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Where to listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP `host:port`.
    Tcp(SocketAddr),
    /// Filesystem-backed local socket.
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = String;

    /// Accepts `host:port`, `unix:/path/to.sock` or an absolute path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err("empty socket path".to_string());
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(ListenAddr::Unix(PathBuf::from(s)));
        }
        s.parse::<SocketAddr>()
            .map(ListenAddr::Tcp)
            .map_err(|e| format!("invalid listen address '{}': {}", s, e))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{}", addr),
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A bound, listening, non-blocking server socket.
#[derive(Debug)]
pub struct Listener {
    socket: Socket,
    addr: ListenAddr,
}

/// Bind `addr` and start listening with the given backlog.
///
/// For local sockets a stale socket file is removed first and the new one
/// is made connectable by any local user (e.g. a reverse proxy).
pub fn bind_and_listen(addr: &ListenAddr, backlog: i32) -> Result<Listener, BindError> {
    let label = addr.to_string();
    let socket = match addr {
        ListenAddr::Tcp(sock_addr) => bind_tcp(*sock_addr, backlog),
        ListenAddr::Unix(path) => bind_unix(path, backlog),
    }
    .map_err(|e| BindError::from_io(label.as_str(), e))?;

    // Resolve port 0 to the port the kernel picked
    let addr = match addr {
        ListenAddr::Tcp(_) => socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .map(ListenAddr::Tcp)
            .unwrap_or_else(|| addr.clone()),
        ListenAddr::Unix(_) => addr.clone(),
    };

    debug!(addr = %addr, backlog, "Listener bound");
    Ok(Listener { socket, addr })
}

fn bind_tcp(addr: SocketAddr, backlog: i32) -> io::Result<Socket> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket)
}

fn bind_unix(path: &Path, backlog: i32) -> io::Result<Socket> {
    remove_stale_socket(path)?;

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::unix(path)?)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;
    socket.listen(backlog)?;

    Ok(socket)
}

/// Remove a socket file left over from a previous run.
///
/// Anything that is not a socket is left alone and reported as in use.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(path = %path.display(), "Removing stale socket");
            fs::remove_file(path)
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "path exists and is not a socket",
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl Listener {
    /// The bound address, with the actual port for TCP.
    pub fn local_addr(&self) -> &ListenAddr {
        &self.addr
    }

    /// Switch the listening socket between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.socket.set_nonblocking(nonblocking)
    }

    /// Duplicate the underlying socket handle.
    pub fn try_clone_socket(&self) -> io::Result<Socket> {
        self.socket.try_clone()
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let ListenAddr::Unix(path) = &self.addr {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}
