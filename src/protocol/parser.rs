//! Incremental Command-Line Parser
//!
//! This module implements the parser that turns a byte stream into
//! [`Command`] objects. It is fed whatever the socket produced, in chunks of
//! any size, and keeps partial lines between calls.
//!
//! ## How the Parser Works
//!
//! The caller drives it through three steps:
//!
//! 1. `parse(buf)` consumes bytes up to and including the next `\n` and
//!    returns `(consumed, ready)`. Blank lines are skipped.
//! 2. Once `ready` is true, `build()` tokenizes the line and returns the
//!    command plus the number of raw argument bytes that follow it.
//! 3. After the command has run, `reset()` prepares for the next line.
//!
//! A line longer than [`MAX_LINE_LENGTH`] is discarded up to its terminator
//! and reported by `build()` as [`ParseError::LineTooLong`].

use crate::protocol::command::{Command, StoreMode};
use bytes::Bytes;
use thiserror::Error;

/// Maximum length of a command line, excluding the terminator
pub const MAX_LINE_LENGTH: usize = 2048;

/// Maximum key length (same as memcached)
pub const MAX_KEY_LENGTH: usize = 250;

/// Largest data block a storage command may announce
pub const MAX_DATA_LENGTH: usize = 1 << 30;

/// Errors that can occur while building a command from a line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The command name is not one we know
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Wrong number of tokens for the command
    #[error("bad command line format")]
    BadFormat,

    /// A numeric field did not parse
    #[error("invalid number: {0}")]
    InvalidNumber(String),

    /// Key is empty, too long or contains control characters
    #[error("invalid key")]
    InvalidKey,

    /// The command line exceeded the maximum length
    #[error("line too long")]
    LineTooLong,

    /// A storage command announced more than `MAX_DATA_LENGTH` bytes
    #[error("data block too large: {0} bytes")]
    DataTooLarge(u64),
}

impl ParseError {
    /// Renders the error as the in-band response line (without terminator).
    pub fn response(&self) -> Bytes {
        match self {
            ParseError::UnknownCommand(_) => Bytes::from_static(b"ERROR"),
            other => Bytes::from(format!("CLIENT_ERROR {}", other)),
        }
    }
}

/// An incremental, line-oriented command parser.
///
/// # Example
///
/// ```
/// use lrukv::protocol::Parser;
///
/// let mut parser = Parser::new();
/// assert_eq!(parser.parse(b"ge"), (2, false));
/// assert_eq!(parser.parse(b"t name\r\n"), (8, true));
///
/// let (command, argument_len) = parser.build().unwrap();
/// assert_eq!(command.name(), "get");
/// assert_eq!(argument_len, 0);
/// ```
#[derive(Debug, Default)]
pub struct Parser {
    /// The current (possibly partial) command line
    line: Vec<u8>,
    /// A complete line is waiting for `build()`
    ready: bool,
    /// The current line blew past `MAX_LINE_LENGTH` and is being skipped
    overflow: bool,
}

impl Parser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes to the parser.
    ///
    /// # Returns
    ///
    /// `(consumed, ready)`: how many bytes of `buf` were used, and whether a
    /// complete command line is now available to [`build`](Self::build).
    /// Bytes after the terminator are left for the caller.
    pub fn parse(&mut self, buf: &[u8]) -> (usize, bool) {
        if self.ready {
            return (0, true);
        }

        let mut consumed = 0;
        while consumed < buf.len() {
            let rest = &buf[consumed..];
            match rest.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.push(&rest[..pos]);
                    consumed += pos + 1;
                    if self.is_blank() {
                        self.reset();
                        continue;
                    }
                    self.ready = true;
                    return (consumed, true);
                }
                None => {
                    self.push(rest);
                    return (buf.len(), false);
                }
            }
        }

        (consumed, false)
    }

    /// Builds the command from the completed line.
    ///
    /// # Returns
    ///
    /// The command and the number of raw argument bytes the client will send
    /// after the line (not counting the trailing `\r\n` of the data block).
    pub fn build(&mut self) -> Result<(Command, usize), ParseError> {
        if self.overflow {
            return Err(ParseError::LineTooLong);
        }

        let line = match self.line.last() {
            Some(b'\r') => &self.line[..self.line.len() - 1],
            _ => &self.line[..],
        };

        let mut tokens = line.split(|&b| b == b' ').filter(|t| !t.is_empty());
        let name = match tokens.next() {
            Some(name) => name.to_ascii_lowercase(),
            None => return Err(ParseError::BadFormat),
        };
        let args: Vec<&[u8]> = tokens.collect();

        match name.as_slice() {
            b"set" => build_store(StoreMode::Set, &args),
            b"add" => build_store(StoreMode::Add, &args),
            b"replace" => build_store(StoreMode::Replace, &args),
            b"append" => build_store(StoreMode::Append, &args),
            b"prepend" => build_store(StoreMode::Prepend, &args),
            b"get" | b"gets" => {
                if args.is_empty() {
                    return Err(ParseError::BadFormat);
                }
                let keys = args
                    .iter()
                    .map(|k| parse_key(k))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((Command::Get { keys }, 0))
            }
            b"delete" => match args.as_slice() {
                [key] => Ok((Command::Delete { key: parse_key(key)? }, 0)),
                _ => Err(ParseError::BadFormat),
            },
            b"incr" | b"decr" => match args.as_slice() {
                [key, delta] => {
                    let key = parse_key(key)?;
                    let delta = parse_number(delta)?;
                    let command = if name == b"incr" {
                        Command::Incr { key, delta }
                    } else {
                        Command::Decr { key, delta }
                    };
                    Ok((command, 0))
                }
                _ => Err(ParseError::BadFormat),
            },
            b"version" if args.is_empty() => Ok((Command::Version, 0)),
            b"version" => Err(ParseError::BadFormat),
            _ => Err(ParseError::UnknownCommand(
                String::from_utf8_lossy(&name).into_owned(),
            )),
        }
    }

    /// Returns the command name of the completed line, for logging.
    pub fn name(&self) -> String {
        let name = self
            .line
            .split(|&b| b == b' ' || b == b'\r')
            .find(|t| !t.is_empty())
            .unwrap_or_default();
        String::from_utf8_lossy(name).into_owned()
    }

    /// Clears all state so the next line can be parsed.
    pub fn reset(&mut self) {
        self.line.clear();
        self.ready = false;
        self.overflow = false;
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.overflow {
            return;
        }
        if self.line.len() + chunk.len() > MAX_LINE_LENGTH + 1 {
            self.overflow = true;
            self.line.clear();
            return;
        }
        self.line.extend_from_slice(chunk);
    }

    fn is_blank(&self) -> bool {
        !self.overflow && (self.line.is_empty() || self.line == b"\r")
    }
}

/// `<key> <flags> <exptime> <bytes>`
fn build_store(mode: StoreMode, args: &[&[u8]]) -> Result<(Command, usize), ParseError> {
    match args {
        [key, flags, exptime, bytes] => {
            let key = parse_key(key)?;
            // Flags and expiry are validated but not stored
            parse_number(flags)?;
            parse_signed(exptime)?;
            let bytes = parse_number(bytes)?;
            let bytes = usize::try_from(bytes)
                .ok()
                .filter(|&n| n <= MAX_DATA_LENGTH)
                .ok_or(ParseError::DataTooLarge(bytes))?;
            Ok((Command::Store { mode, key }, bytes))
        }
        _ => Err(ParseError::BadFormat),
    }
}

fn parse_key(raw: &[u8]) -> Result<Bytes, ParseError> {
    if raw.is_empty() || raw.len() > MAX_KEY_LENGTH || raw.iter().any(|b| b.is_ascii_control()) {
        return Err(ParseError::InvalidKey);
    }
    Ok(Bytes::copy_from_slice(raw))
}

fn parse_number(raw: &[u8]) -> Result<u64, ParseError> {
    std::str::from_utf8(raw)
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ParseError::InvalidNumber(String::from_utf8_lossy(raw).into_owned()))
}

fn parse_signed(raw: &[u8]) -> Result<i64, ParseError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ParseError::InvalidNumber(String::from_utf8_lossy(raw).into_owned()))
}
