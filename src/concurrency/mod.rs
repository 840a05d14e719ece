//! Worker Pools
//!
//! The blocking network layer runs one connection per pool task. The pool
//! lives here so it can be reused and tested without any sockets.
//!
//! ## Modules
//!
//! - `executor`: bounded thread pool with low/high watermarks

pub mod executor;

pub use executor::{Executor, ExecutorConfig, State};
