//! Command Objects
//!
//! A [`Command`] is what the [`Parser`](crate::protocol::Parser) builds out of
//! one request line. Executing it against a [`Storage`] produces the response
//! text; the connection appends the final `\r\n`.
//!
//! ## Responses
//!
//! | Command                         | Success             | Failure        |
//! |---------------------------------|---------------------|----------------|
//! | `set`/`add`/`replace`           | `STORED`            | `NOT_STORED`   |
//! | `append`/`prepend`              | `STORED`            | `NOT_STORED`   |
//! | `get k1 k2 ...`                 | `VALUE ...` + `END` | `END`          |
//! | `delete k`                      | `DELETED`           | `NOT_FOUND`    |
//! | `incr`/`decr`                   | new value           | `NOT_FOUND`    |
//! | `version`                       | `VERSION x.y.z`     |                |

use crate::storage::Storage;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

const STORED: &[u8] = b"STORED";
const NOT_STORED: &[u8] = b"NOT_STORED";
const DELETED: &[u8] = b"DELETED";
const NOT_FOUND: &[u8] = b"NOT_FOUND";
const END: &[u8] = b"END";
const NON_NUMERIC: &[u8] = b"CLIENT_ERROR cannot increment or decrement non-numeric value";

/// How a storage command writes its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Insert or overwrite
    Set,
    /// Insert only if absent
    Add,
    /// Overwrite only if present
    Replace,
    /// Append to an existing value
    Append,
    /// Prepend to an existing value
    Prepend,
}

/// A fully parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `set`, `add`, `replace`, `append`, `prepend`; the value is the argument
    Store { mode: StoreMode, key: Bytes },
    /// `get`/`gets` one or more keys
    Get { keys: Vec<Bytes> },
    /// `delete <key>`
    Delete { key: Bytes },
    /// `incr <key> <delta>`
    Incr { key: Bytes, delta: u64 },
    /// `decr <key> <delta>`
    Decr { key: Bytes, delta: u64 },
    /// `version`
    Version,
}

impl Command {
    /// Returns the protocol name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Store { mode, .. } => match mode {
                StoreMode::Set => "set",
                StoreMode::Add => "add",
                StoreMode::Replace => "replace",
                StoreMode::Append => "append",
                StoreMode::Prepend => "prepend",
            },
            Command::Get { .. } => "get",
            Command::Delete { .. } => "delete",
            Command::Incr { .. } => "incr",
            Command::Decr { .. } => "decr",
            Command::Version => "version",
        }
    }

    /// Executes the command and returns the response text, without the
    /// final line terminator.
    ///
    /// `argument` is the raw data block for storage commands (already stripped
    /// of its trailing `\r\n`) and empty for everything else.
    pub fn execute(&self, storage: &dyn Storage, argument: &[u8]) -> Bytes {
        debug!(command = self.name(), argument = argument.len(), "Executing command");

        match self {
            Command::Store { mode, key } => {
                let stored = store(storage, *mode, key.clone(), argument);
                Bytes::from_static(if stored { STORED } else { NOT_STORED })
            }
            Command::Get { keys } => get(storage, keys),
            Command::Delete { key } => {
                Bytes::from_static(if storage.delete(key) { DELETED } else { NOT_FOUND })
            }
            Command::Incr { key, delta } => {
                counter(storage, key, |current| current.wrapping_add(*delta))
            }
            Command::Decr { key, delta } => {
                counter(storage, key, |current| current.saturating_sub(*delta))
            }
            Command::Version => Bytes::from(format!("VERSION {}", crate::VERSION)),
        }
    }
}

fn store(storage: &dyn Storage, mode: StoreMode, key: Bytes, argument: &[u8]) -> bool {
    match mode {
        StoreMode::Set => storage.put(key, Bytes::copy_from_slice(argument)),
        StoreMode::Add => storage.put_if_absent(key, Bytes::copy_from_slice(argument)),
        StoreMode::Replace => storage.set(key, Bytes::copy_from_slice(argument)),
        StoreMode::Append | StoreMode::Prepend => {
            let Some(current) = storage.get(&key) else {
                return false;
            };
            let mut value = BytesMut::with_capacity(current.len() + argument.len());
            if mode == StoreMode::Append {
                value.put_slice(&current);
                value.put_slice(argument);
            } else {
                value.put_slice(argument);
                value.put_slice(&current);
            }
            storage.set(key, value.freeze())
        }
    }
}

fn get(storage: &dyn Storage, keys: &[Bytes]) -> Bytes {
    let mut out = BytesMut::new();
    for key in keys {
        if let Some(value) = storage.get(key) {
            out.put_slice(b"VALUE ");
            out.put_slice(key);
            out.put_slice(format!(" 0 {}\r\n", value.len()).as_bytes());
            out.put_slice(&value);
            out.put_slice(b"\r\n");
        }
    }
    out.put_slice(END);
    out.freeze()
}

fn counter(storage: &dyn Storage, key: &Bytes, apply: impl FnOnce(u64) -> u64) -> Bytes {
    let Some(current) = storage.get(key) else {
        return Bytes::from_static(NOT_FOUND);
    };

    let parsed = std::str::from_utf8(&current)
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse::<u64>().ok());

    match parsed {
        Some(n) => {
            let next = Bytes::from(apply(n).to_string());
            // The key may have been evicted or deleted since the read
            if storage.set(key.clone(), next.clone()) {
                next
            } else {
                Bytes::from_static(NOT_FOUND)
            }
        }
        None => Bytes::from_static(NON_NUMERIC),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ThreadSafeLru;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    fn store_cmd(mode: StoreMode, k: &str) -> Command {
        Command::Store { mode, key: key(k) }
    }

    #[test]
    fn test_set_and_get() {
        let storage = ThreadSafeLru::new(1024);
        assert_eq!(store_cmd(StoreMode::Set, "name").execute(&storage, b"Ariz"), "STORED");

        let get = Command::Get {
            keys: vec![key("name"), key("missing")],
        };
        assert_eq!(get.execute(&storage, b""), "VALUE name 0 4\r\nAriz\r\nEND");
    }

    #[test]
    fn test_get_nothing() {
        let storage = ThreadSafeLru::new(1024);
        let get = Command::Get { keys: vec![key("a")] };
        assert_eq!(get.execute(&storage, b""), "END");
    }

    #[test]
    fn test_add_and_replace() {
        let storage = ThreadSafeLru::new(1024);
        assert_eq!(store_cmd(StoreMode::Replace, "k").execute(&storage, b"1"), "NOT_STORED");
        assert_eq!(store_cmd(StoreMode::Add, "k").execute(&storage, b"1"), "STORED");
        assert_eq!(store_cmd(StoreMode::Add, "k").execute(&storage, b"2"), "NOT_STORED");
        assert_eq!(store_cmd(StoreMode::Replace, "k").execute(&storage, b"3"), "STORED");
        assert_eq!(storage.get(b"k"), Some(key("3")));
    }

    #[test]
    fn test_append_prepend() {
        let storage = ThreadSafeLru::new(1024);
        assert_eq!(store_cmd(StoreMode::Append, "k").execute(&storage, b"x"), "NOT_STORED");

        store_cmd(StoreMode::Set, "k").execute(&storage, b"mid");
        assert_eq!(store_cmd(StoreMode::Append, "k").execute(&storage, b">>"), "STORED");
        assert_eq!(store_cmd(StoreMode::Prepend, "k").execute(&storage, b"<<"), "STORED");
        assert_eq!(storage.get(b"k"), Some(key("<<mid>>")));
    }

    #[test]
    fn test_oversized_value_not_stored() {
        let storage = ThreadSafeLru::new(8);
        assert_eq!(store_cmd(StoreMode::Set, "k").execute(&storage, b"12345678"), "NOT_STORED");
    }

    #[test]
    fn test_delete() {
        let storage = ThreadSafeLru::new(1024);
        store_cmd(StoreMode::Set, "k").execute(&storage, b"v");
        let delete = Command::Delete { key: key("k") };
        assert_eq!(delete.execute(&storage, b""), "DELETED");
        assert_eq!(delete.execute(&storage, b""), "NOT_FOUND");
    }

    #[test]
    fn test_incr_decr() {
        let storage = ThreadSafeLru::new(1024);
        let incr = Command::Incr {
            key: key("n"),
            delta: 5,
        };
        assert_eq!(incr.execute(&storage, b""), "NOT_FOUND");

        store_cmd(StoreMode::Set, "n").execute(&storage, b"10");
        assert_eq!(incr.execute(&storage, b""), "15");

        let decr = Command::Decr {
            key: key("n"),
            delta: 100,
        };
        assert_eq!(decr.execute(&storage, b""), "0");

        store_cmd(StoreMode::Set, "n").execute(&storage, u64::MAX.to_string().as_bytes());
        let incr_one = Command::Incr {
            key: key("n"),
            delta: 1,
        };
        assert_eq!(incr_one.execute(&storage, b""), "0");
    }

    #[test]
    fn test_incr_non_numeric() {
        let storage = ThreadSafeLru::new(1024);
        store_cmd(StoreMode::Set, "n").execute(&storage, b"abc");
        let incr = Command::Incr {
            key: key("n"),
            delta: 1,
        };
        assert_eq!(
            incr.execute(&storage, b""),
            "CLIENT_ERROR cannot increment or decrement non-numeric value"
        );
    }

    #[test]
    fn test_version() {
        let storage = ThreadSafeLru::new(16);
        let response = Command::Version.execute(&storage, b"");
        assert_eq!(response, format!("VERSION {}", crate::VERSION).as_str());
    }
}
