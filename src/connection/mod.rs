//! Connection Layer
//!
//! This module turns sockets into protocol sessions. The protocol state
//! machine ([`Session`]) is written once; four transports drive it with
//! different threading and I/O models.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            Listener                                  │
//! └───────────────┬───────────────────────┬──────────────────────┬──────┘
//!                 │                       │                      │
//!                 ▼                       ▼                      ▼
//! ┌──────────────────────┐ ┌───────────────────────┐ ┌──────────────────────┐
//! │   st_nonblocking     │ │    mt_nonblocking     │ │     mt_blocking      │
//! │ current-thread rt    │ │ multi-thread rt       │ │ acceptor thread      │
//! │ one local task per   │ │ reader + writer task  │ │ one Executor task    │
//! │ connection, no lock  │ │ per connection, Mutex │ │ per connection       │
//! └──────────┬───────────┘ └───────────┬───────────┘ └──────────┬───────────┘
//!            │                         │                        │
//!            └─────────────────────────┼────────────────────────┘
//!                                      ▼
//!                     ┌────────────────────────────────┐
//!                     │ Session: parse ─> execute ─>   │
//!                     │          output queue          │
//!                     └───────────────┬────────────────┘
//!                                     ▼
//!                              Arc<dyn Storage>
//! ```
//!
//! `st_coroutine` is the fourth flavor: one thread, one
//! [`Engine`](crate::coroutine::Engine) coroutine per connection, and an idle
//! hook that waits for socket readiness and unblocks ready coroutines.
//!
//! ## Lifecycle
//!
//! 1. Accept, count the connection in [`ConnectionStats`]
//! 2. Read whatever is available, feed it to the session
//! 3. Write queued responses (vectored, resuming partial writes)
//! 4. On EOF, flush what is left and close; on error, close at once
//!
//! A failure on one connection never affects the others.
//!
//! ## Example
//!
//! ```ignore
//! use lrukv::connection::{mt_nonblocking, Service};
//! use lrukv::storage::{self, StorageKind};
//! use tokio::net::TcpListener;
//!
//! let storage = storage::build(StorageKind::Striped, 1 << 20, 4)?;
//! let service = Service::new(storage).with_max_output_queue(64);
//!
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! mt_nonblocking::serve(listener, service, tokio::signal::ctrl_c()).await?;
//! ```

pub mod mt_blocking;
pub mod mt_nonblocking;
pub mod session;
pub mod st_coroutine;
pub mod st_nonblocking;

pub use mt_blocking::{BlockingOptions, BlockingServer};
pub use session::{Session, DEFAULT_MAX_ITEM_SIZE};

use crate::storage::Storage;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Size of the per-connection read buffer
pub(crate) const READ_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands executed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Current number of open connections.
    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Errors that end a single connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The peer stopped accepting data while responses were pending
    #[error("Client disconnected")]
    ClientDisconnected,
}

/// What every transport needs to create sessions.
#[derive(Clone)]
pub struct Service {
    storage: Arc<dyn Storage>,
    stats: Arc<ConnectionStats>,
    max_output_queue: Option<usize>,
    max_item_size: usize,
}

impl Service {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            stats: Arc::new(ConnectionStats::new()),
            max_output_queue: None,
            max_item_size: DEFAULT_MAX_ITEM_SIZE,
        }
    }

    /// Shares an existing stats block instead of a fresh one.
    pub fn with_stats(mut self, stats: Arc<ConnectionStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Stops reading from a connection once `max` responses are queued.
    ///
    /// Zero disables the bound.
    pub fn with_max_output_queue(mut self, max: usize) -> Self {
        self.max_output_queue = (max > 0).then_some(max);
        self
    }

    /// Answers storage commands carrying more than `max` bytes with
    /// `SERVER_ERROR object too large for cache`.
    pub fn with_max_item_size(mut self, max: usize) -> Self {
        self.max_item_size = max;
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Starts the protocol state for a new connection.
    pub fn session(&self) -> Session {
        Session::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.stats),
            self.max_output_queue,
        )
        .with_max_item_size(self.max_item_size)
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("stats", &self.stats)
            .field("max_output_queue", &self.max_output_queue)
            .field("max_item_size", &self.max_item_size)
            .finish()
    }
}

/// Logs how a connection ended.
pub(crate) fn log_closed(addr: &SocketAddr, result: &Result<(), ConnectionError>) {
    match result {
        Ok(()) => info!(client = %addr, "Client disconnected gracefully"),
        Err(ConnectionError::ClientDisconnected) => {
            debug!(client = %addr, "Client disconnected")
        }
        Err(ConnectionError::IoError(e))
            if matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
            ) =>
        {
            debug!(client = %addr, "Connection reset by client")
        }
        Err(e) => warn!(client = %addr, error = %e, "Connection error"),
    }
}
