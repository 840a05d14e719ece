//! Text Protocol Implementation
//!
//! This module implements the memcached-style text protocol LruKV speaks.
//!
//! ## Overview
//!
//! Every request starts with a command line terminated by `\r\n`. Storage
//! commands declare the length of a raw data block that follows the line and
//! is itself terminated by `\r\n`:
//!
//! ```text
//! set <key> <flags> <exptime> <bytes>\r\n
//! <data block>\r\n
//! ```
//!
//! Responses are a line of text (possibly spanning several lines for `get`)
//! terminated by `\r\n`.
//!
//! ## Modules
//!
//! - `parser`: incremental line parser with `parse` / `build` / `reset`
//! - `command`: command objects executed against a [`Storage`](crate::storage::Storage)
//!
//! ## Example
//!
//! ```
//! use lrukv::protocol::Parser;
//! use lrukv::storage::ThreadSafeLru;
//!
//! let storage = ThreadSafeLru::new(1024);
//! let mut parser = Parser::new();
//!
//! let (consumed, ready) = parser.parse(b"set name 0 0 4\r\n");
//! assert_eq!((consumed, ready), (16, true));
//!
//! let (command, argument_len) = parser.build().unwrap();
//! assert_eq!(argument_len, 4);
//! assert_eq!(command.execute(&storage, b"Ariz"), "STORED");
//! ```

pub mod command;
pub mod parser;

// Re-export commonly used types for convenience
pub use command::{Command, StoreMode};
pub use parser::{ParseError, Parser, MAX_DATA_LENGTH, MAX_KEY_LENGTH, MAX_LINE_LENGTH};

/// The line terminator used by requests and responses
pub const CRLF: &[u8] = b"\r\n";
