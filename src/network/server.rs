//! Connection Listener
//!
//! Accepts connections and hands each one to a new clerk thread.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::StagingClient;
use crate::clerk::{is_routine_exit, Clerk};
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Result, StageError};
use crate::transport::loopback;
use crate::transport::tcp::TcpChannel;
use crate::transport::{Channel, SpinPolicy};

/// How long the accept loop sleeps when no connection is pending
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Staging server
pub struct Server {
    config: Config,
    engine: Arc<Engine>,
    listener: TcpListener,

    /// Raised by `shutdown`; stops the accept loop and cancels clerk waits
    shutdown: Arc<AtomicBool>,

    /// Clerks currently running
    active: Arc<AtomicUsize>,
    next_id: AtomicU64,
    clerks: Mutex<Vec<JoinHandle<()>>>,
}

/// Decrements the active clerk count when a clerk thread exits
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Server {
    /// Bind the listen address
    pub fn bind(config: Config, engine: Arc<Engine>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).map_err(|e| {
            StageError::Transport(format!("cannot listen on {}: {}", config.listen_addr, e))
        })?;
        listener.set_nonblocking(true)?;
        tracing::info!("Listening on {}", listener.local_addr()?);

        Ok(Self {
            config,
            engine,
            listener,
            shutdown: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(0),
            clerks: Mutex::new(Vec::new()),
        })
    }

    /// Accept connections until `shutdown` is called
    pub fn run(&self) -> Result<()> {
        while !self.is_shutdown() {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    let channel = match TcpChannel::accept(
                        stream,
                        Arc::clone(self.engine.arena()),
                        self.config.message_size,
                    ) {
                        Ok(channel) => channel,
                        Err(e) => {
                            tracing::warn!("Handshake with {} failed: {}", addr, e);
                            continue;
                        }
                    };
                    if let Err(e) = self.serve(Box::new(channel)) {
                        tracing::warn!("Rejected {}: {}", addr, e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!("Accept loop stopped");
        Ok(())
    }

    /// Start a clerk for an already connected channel
    ///
    /// Returns the clerk's id. Fails when `max_connections` clerks are
    /// already running.
    pub fn serve(&self, channel: Box<dyn Channel>) -> Result<u64> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(StageError::Cancelled);
        }
        let previous = self.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard(Arc::clone(&self.active));
        if previous >= self.config.max_connections {
            return Err(StageError::Transport(format!(
                "connection limit of {} reached",
                self.config.max_connections
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let policy = SpinPolicy::unbounded()
            .with_timeout(self.config.request_timeout())
            .with_cancel(Arc::clone(&self.shutdown));
        let clerk = Clerk::new(id, channel, Arc::clone(&self.engine), policy);

        let handle = thread::Builder::new()
            .name(format!("clerk-{}", id))
            .spawn(move || {
                let _guard = guard;
                match clerk.run() {
                    Err(e) if !is_routine_exit(&e) => tracing::error!("Clerk {} failed: {}", id, e),
                    _ => {}
                }
            })?;

        let mut clerks = self.clerks.lock();
        clerks.retain(|handle| !handle.is_finished());
        clerks.push(handle);
        Ok(id)
    }

    /// Connect an in-process client to a fresh clerk
    pub fn connect_loopback(&self) -> Result<StagingClient> {
        let (clerk_end, client_end) =
            loopback::pair(Arc::clone(self.engine.arena()), self.config.message_size);
        self.serve(Box::new(clerk_end))?;

        let policy = SpinPolicy::unbounded().with_timeout(self.config.reply_timeout());
        StagingClient::new(Box::new(client_end), self.config.chunk_size, policy)
    }

    /// Stop accepting and cancel every waiting clerk
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Wait for every clerk thread to exit
    pub fn join(&self) {
        let clerks: Vec<_> = self.clerks.lock().drain(..).collect();
        for handle in clerks {
            if handle.join().is_err() {
                tracing::error!("A clerk thread panicked");
            }
        }
    }

    /// Number of clerks currently running
    pub fn active_clerks(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Fraction of chunk slots in use
    pub fn usage(&self) -> f32 {
        self.engine.usage()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}
