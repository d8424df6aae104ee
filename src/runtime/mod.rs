//! Completion-driven runtime for high-performance networking.
//!
//! Platform-specific drivers:
//! - Linux: io_uring completion queue (`uring`)
//! - Linux/macOS: mio readiness turned into completions (`mio`)
//!
//! Both sit behind the `Driver` trait and share the rest:
//! - `Op`: descriptor owning the memory of one in-flight operation
//! - `Connection`: per-socket state machine
//! - `BufferPool`: per-worker read buffers
//! - `Engine`: completion handler driving connections through their states
//!
//! Each worker thread owns one driver and one engine; all workers share
//! one listening socket and one set of counters.

pub mod buffer;
pub mod connection;
pub mod driver;
pub mod engine;
pub mod error;
pub mod listener;
pub mod op;
pub mod protocol;
pub mod stats;

#[cfg(test)]
pub(crate) mod mock;

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub mod mio;

#[cfg(target_os = "linux")]
pub mod uring;

pub use driver::{Completion, Driver};
pub use engine::{Engine, EngineConfig};
pub use error::{BindError, EngineError, SubmitError};
pub use listener::{bind_and_listen, ListenAddr, Listener};
pub use protocol::{ProcessResult, ProtocolError, Reply, Respond};
pub use stats::{Stats, StatsSnapshot};

use crate::config::{Config, RuntimeType};
use crate::protocols::http::HttpResponder;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// A running server: its workers and the means to stop them.
pub struct ServerHandle {
    local_addr: ListenAddr,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<io::Result<()>>>,
    stats: Arc<Stats>,
}

impl ServerHandle {
    /// Bound address, with the actual port when 0 was requested.
    pub fn local_addr(&self) -> &ListenAddr {
        &self.local_addr
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Ask every worker to stop after its current turn.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Wait for all workers to exit, returning the first failure.
    pub fn join(self) -> Result<(), EngineError> {
        join_all(self.workers)
    }
}

fn join_all(workers: Vec<JoinHandle<io::Result<()>>>) -> Result<(), EngineError> {
    let mut result = Ok(());
    for handle in workers {
        let outcome = match handle.join() {
            Ok(outcome) => outcome,
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "worker panicked")),
        };
        if let Err(e) = outcome {
            if result.is_ok() {
                result = Err(EngineError::Io(e));
            }
        }
    }
    result
}

/// Bind the listener and start the configured backend.
///
/// Binding and driver creation happen here, on the calling thread, so
/// either failing is reported before anything is served.
pub fn spawn<R: Respond>(
    config: &Config,
    responder: Arc<R>,
    stats: Arc<Stats>,
) -> Result<ServerHandle, EngineError> {
    let listener = Arc::new(bind_and_listen(&config.listen, config.backlog)?);
    let local_addr = listener.local_addr().clone();
    let shutdown = Arc::new(AtomicBool::new(false));

    info!(
        workers = config.worker_count(),
        addr = %local_addr,
        runtime = ?config.runtime,
        "Starting runtime"
    );

    let workers = match config.runtime {
        RuntimeType::Uring => spawn_uring(config, &listener, &responder, &stats, &shutdown)?,
        RuntimeType::Mio => spawn_mio(config, &listener, &responder, &stats, &shutdown)?,
        RuntimeType::Tokio => vec![crate::server::spawn(
            config,
            Arc::clone(&listener),
            responder,
            Arc::clone(&stats),
            Arc::clone(&shutdown),
        )?],
    };

    Ok(ServerHandle {
        local_addr,
        shutdown,
        workers,
        stats,
    })
}

/// Serve HTTP with the configured backend until every worker exits.
pub fn run(config: Config) -> Result<(), EngineError> {
    let stats = Arc::new(Stats::new());
    let responder = Arc::new(HttpResponder::from_config(&config, Arc::clone(&stats)));
    spawn(&config, responder, stats)?.join()
}

/// Whether the io_uring backend can run on this machine.
pub fn uring_supported() -> bool {
    #[cfg(target_os = "linux")]
    {
        uring::probe()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(target_os = "linux")]
fn spawn_uring<R: Respond>(
    config: &Config,
    listener: &Arc<Listener>,
    responder: &Arc<R>,
    stats: &Arc<Stats>,
    shutdown: &Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<io::Result<()>>>, EngineError> {
    // A non-blocking listener makes io_uring report EAGAIN instead of waiting
    listener.set_nonblocking(false)?;
    let (ring_size, batch_size) = (config.ring_size, config.batch_size);
    let capacity = config.max_connections + 1;
    spawn_workers(config, listener, responder, stats, shutdown, || {
        uring::UringDriver::new(ring_size, batch_size, capacity)
    })
}

#[cfg(not(target_os = "linux"))]
fn spawn_uring<R: Respond>(
    _config: &Config,
    _listener: &Arc<Listener>,
    _responder: &Arc<R>,
    _stats: &Arc<Stats>,
    _shutdown: &Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<io::Result<()>>>, EngineError> {
    Err(EngineError::Unsupported("io_uring"))
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn spawn_mio<R: Respond>(
    config: &Config,
    listener: &Arc<Listener>,
    responder: &Arc<R>,
    stats: &Arc<Stats>,
    shutdown: &Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<io::Result<()>>>, EngineError> {
    listener.set_nonblocking(true)?;
    let batch_size = config.batch_size;
    let capacity = config.max_connections + 1;
    spawn_workers(config, listener, responder, stats, shutdown, || {
        self::mio::MioDriver::new(batch_size, capacity)
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn spawn_mio<R: Respond>(
    _config: &Config,
    _listener: &Arc<Listener>,
    _responder: &Arc<R>,
    _stats: &Arc<Stats>,
    _shutdown: &Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<io::Result<()>>>, EngineError> {
    Err(EngineError::Unsupported("mio"))
}

/// Start one engine thread per worker, each with a driver from `make_driver`.
fn spawn_workers<D, R, F>(
    config: &Config,
    listener: &Arc<Listener>,
    responder: &Arc<R>,
    stats: &Arc<Stats>,
    shutdown: &Arc<AtomicBool>,
    make_driver: F,
) -> Result<Vec<JoinHandle<io::Result<()>>>, EngineError>
where
    D: Driver + Send + 'static,
    R: Respond,
    F: Fn() -> io::Result<D>,
{
    let num_workers = config.worker_count();
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let spawned = make_driver()
            .map_err(EngineError::DriverInit)
            .and_then(|driver| {
                spawn_worker(
                    worker_id,
                    driver,
                    EngineConfig::from_config(config, worker_id),
                    listener,
                    responder,
                    stats,
                    shutdown,
                )
                .map_err(EngineError::Io)
            });

        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                // Stop the workers already running before reporting
                shutdown.store(true, Ordering::Release);
                let _ = join_all(handles);
                return Err(e);
            }
        }
    }

    Ok(handles)
}

fn spawn_worker<D, R>(
    worker_id: usize,
    driver: D,
    engine_config: EngineConfig,
    listener: &Arc<Listener>,
    responder: &Arc<R>,
    stats: &Arc<Stats>,
    shutdown: &Arc<AtomicBool>,
) -> io::Result<JoinHandle<io::Result<()>>>
where
    D: Driver + Send + 'static,
    R: Respond,
{
    let listener = Arc::clone(listener);
    let responder = Arc::clone(responder);
    let stats = Arc::clone(stats);
    let shutdown = Arc::clone(shutdown);

    thread::Builder::new()
        .name(format!("worker-{}", worker_id))
        .spawn(move || {
            let mut engine = Engine::new(
                driver,
                listener.as_raw_fd(),
                responder,
                stats,
                engine_config,
            );
            let result = engine.run(&shutdown);
            if let Err(e) = &result {
                error!(worker = worker_id, error = %e, "Worker failed");
            }
            engine.shutdown();
            // Keeps the listening socket open until this engine is gone
            drop(listener);
            result
        })
}
