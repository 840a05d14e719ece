//! Cooperative Coroutines
//!
//! A single-threaded engine that interleaves sequential units of work at
//! explicit switch points only. The `st-coroutine` transport
//! ([`connection::st_coroutine`](crate::connection::st_coroutine)) runs one
//! coroutine per connection on it, with the idle hook waiting for socket
//! readiness.
//!
//! ## Modules
//!
//! - `engine`: the [`Engine`] driver loop, the [`Handle`] used from inside
//!   coroutines, and the [`Suspend`] future returned by every switch

pub mod engine;

pub use engine::{CoroutineId, Engine, Handle, Suspend};
