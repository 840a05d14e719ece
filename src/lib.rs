//! # LruKV - An In-Memory LRU Cache Server
//!
//! LruKV is a memcached-style cache server written in Rust. It keeps keys and
//! values in memory under a fixed byte budget and evicts the least recently
//! used entries when the budget runs out.
//!
//! ## Features
//!
//! - **Bounded LRU**: capacity is accounted as key bytes + value bytes
//! - **Two Backends**: one lock around one cache, or striped shards with a
//!   lock each
//! - **Four Transports**: single-threaded reactor, multi-threaded reactor,
//!   blocking sockets on a thread pool, or one coroutine per connection
//! - **Text Protocol**: `set`/`add`/`replace`/`append`/`prepend`, `get`,
//!   `delete`, `incr`/`decr`, `version`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               LruKV                                     │
//! │                                                                         │
//! │  ┌──────────────┐    ┌─────────────┐    ┌─────────────┐                 │
//! │  │  Transport   │───>│  Session    │───>│  Command    │                 │
//! │  │ st / mt / co │    │ parse + out │    │  execute    │                 │
//! │  │ blocking     │    │   queue     │    └──────┬──────┘                 │
//! │  └──────┬───────┘    └─────────────┘           │                        │
//! │         │                                      ▼                        │
//! │  ┌──────┴───────┐    ┌───────────────────────────────────────────────┐  │
//! │  │   Executor   │    │              Arc<dyn Storage>                 │  │
//! │  │ (blocking    │    │  ThreadSafeLru  |  StripedLru                 │  │
//! │  │  transport)  │    │  Mutex<Lru>     |  [Mutex<Lru>; N]            │  │
//! │  └──────────────┘    └───────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use lrukv::connection::{mt_nonblocking, Service};
//! use lrukv::storage::{self, StorageKind};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = storage::build(StorageKind::Striped, 1 << 24, 4)?;
//!     let service = Service::new(storage).with_max_output_queue(64);
//!
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     mt_nonblocking::serve(listener, service, tokio::signal::ctrl_c()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: the LRU cache and its thread-safe wrappers
//! - [`protocol`]: incremental text protocol parser and commands
//! - [`connection`]: per-connection state machine and the four transports
//! - [`concurrency`]: bounded thread pool with watermarks
//! - [`coroutine`]: cooperative single-threaded coroutine engine
//! - [`config`]: command-line configuration
//!
//! ## Design Highlights
//!
//! ### Arena-Backed Recency List
//!
//! The LRU keeps its entries in a `Vec` and links them by index, so eviction
//! and promotion never allocate and never need `unsafe`.
//!
//! ### One State Machine, Many Transports
//!
//! Parsing, execution and output buffering live in [`connection::Session`].
//! Transports only move bytes in and out of it.

pub mod concurrency;
pub mod config;
pub mod connection;
pub mod coroutine;
pub mod protocol;
pub mod storage;

// Re-export commonly used types for convenience
pub use concurrency::{Executor, ExecutorConfig};
pub use config::{NetworkKind, ServerConfig};
pub use connection::{ConnectionStats, Service, Session};
pub use protocol::{Command, ParseError, Parser};
pub use storage::{SimpleLru, Storage, StorageKind, StripedLru, ThreadSafeLru};

/// The default port LruKV listens on
pub const DEFAULT_PORT: u16 = 8080;

/// The default host LruKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of LruKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
