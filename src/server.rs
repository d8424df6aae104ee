//! Tokio backend.
//!
//! One task per connection on a multi-threaded Tokio runtime. Serves the
//! same `Respond` contract as the completion engine, so the two can be
//! compared on identical traffic.

use crate::config::Config;
use crate::runtime::listener::{ListenAddr, Listener};
use crate::runtime::protocol::{ProcessResult, ProtocolError, Respond};
use crate::runtime::stats::Stats;
use bytes::{Buf, BytesMut};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace};

/// How often the accept loop looks at the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

enum Acceptor {
    Tcp(TcpListener),
    Unix(UnixListener),
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Acceptor {
    async fn accept(&self) -> io::Result<Stream> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                debug!(peer = %addr, "New connection");
                Ok(Stream::Tcp(stream))
            }
            Acceptor::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                debug!("New local connection");
                Ok(Stream::Unix(stream))
            }
        }
    }
}

/// Server instance
pub struct Server<R: Respond> {
    listener: Arc<Listener>,
    responder: Arc<R>,
    stats: Arc<Stats>,
    connection_limit: Arc<Semaphore>,
    buffer_size: usize,
    shutdown: Arc<AtomicBool>,
}

impl<R: Respond> Server<R> {
    /// Create a new server instance
    pub fn new(
        config: &Config,
        listener: Arc<Listener>,
        responder: Arc<R>,
        stats: Arc<Stats>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Server {
            listener,
            responder,
            stats,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            buffer_size: config.buffer_size,
            shutdown,
        }
    }

    /// Accept connections until the shutdown flag is raised.
    ///
    /// Must run inside a Tokio runtime.
    pub async fn run(&self) -> io::Result<()> {
        let acceptor = self.acceptor()?;
        info!(address = %self.listener.local_addr(), "Server listening");

        while !self.shutdown.load(Ordering::Acquire) {
            // Wait for a connection slot, bounded so shutdown is still seen
            let permit = match tokio::time::timeout(
                SHUTDOWN_POLL,
                self.connection_limit.clone().acquire_owned(),
            )
            .await
            {
                Ok(permit) => permit.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
                Err(_) => continue,
            };

            let accepted = match tokio::time::timeout(SHUTDOWN_POLL, acceptor.accept()).await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };

            let stream = match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    self.stats.accept_error();
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            self.stats.connection_accepted();
            let responder = Arc::clone(&self.responder);
            let stats = Arc::clone(&self.stats);
            let buffer_size = self.buffer_size;

            tokio::spawn(async move {
                let result = match stream {
                    Stream::Tcp(s) => handle_connection(s, &*responder, &stats, buffer_size).await,
                    Stream::Unix(s) => handle_connection(s, &*responder, &stats, buffer_size).await,
                };
                if let Err(e) = result {
                    stats.io_error();
                    debug!(error = %e, "Connection error");
                }
                stats.connection_closed();
                drop(permit);
            });
        }

        info!("Server stopped");
        Ok(())
    }

    fn acceptor(&self) -> io::Result<Acceptor> {
        let socket = self.listener.try_clone_socket()?;
        socket.set_nonblocking(true)?;
        match self.listener.local_addr() {
            ListenAddr::Tcp(_) => Ok(Acceptor::Tcp(TcpListener::from_std(socket.into())?)),
            ListenAddr::Unix(_) => Ok(Acceptor::Unix(UnixListener::from_std(socket.into())?)),
        }
    }
}

/// Run the Tokio backend on a thread of its own.
///
/// The runtime is built before returning so that failing to create it is
/// reported to the caller.
pub fn spawn<R: Respond>(
    config: &Config,
    listener: Arc<Listener>,
    responder: Arc<R>,
    stats: Arc<Stats>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<io::Result<()>>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_count())
        .thread_name("tokio-worker")
        .enable_all()
        .build()?;
    let server = Server::new(config, listener, responder, stats, shutdown);

    thread::Builder::new()
        .name("tokio-runtime".to_string())
        .spawn(move || runtime.block_on(server.run()))
}

/// Handle a single client connection
pub async fn handle_connection<S, R>(
    mut stream: S,
    responder: &R,
    stats: &Stats,
    buffer_size: usize,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Respond,
{
    let mut buffer = BytesMut::with_capacity(buffer_size);

    loop {
        // Answer every complete request already buffered
        loop {
            match responder.respond(&buffer) {
                Ok(ProcessResult::NeedData) => break,
                Ok(ProcessResult::Reply(reply)) => {
                    buffer.advance(reply.consumed);
                    stream.write_all(&reply.response).await?;
                    stats.response_sent();
                    if !reply.keep_alive {
                        stream.shutdown().await?;
                        return Ok(());
                    }
                }
                Err(e) => {
                    stats.protocol_error();
                    debug!(error = %e, "Protocol error");
                    return Ok(());
                }
            }
        }

        if buffer.len() >= buffer_size {
            stats.protocol_error();
            debug!(error = %ProtocolError::RequestTooLarge(buffer_size), "Protocol error");
            return Ok(());
        }

        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            trace!("Connection closed by client");
            return Ok(());
        }
    }
}
