//! Per-Connection Protocol State Machine
//!
//! [`Session`] owns everything a connection needs except the socket: the
//! incremental parser, the command waiting for its data block, and the queue
//! of responses not yet written. Every transport drives the same session.
//!
//! ## Read path
//!
//! ```text
//!   bytes ──> ┌─────────────┐ ready ┌─────────┐ argument ┌──────────┐
//!             │ parser.parse│──────>│  build  │─────────>│ argument │
//!             └─────────────┘       └────┬────┘          └────┬─────┘
//!                                        │ error              │ complete
//!                                        ▼                    ▼
//!                                 "CLIENT_ERROR ..."    execute(storage)
//!                                        │                    │
//!                                        └───────┬────────────┘
//!                                                ▼
//!                                        output queue (+ "\r\n")
//! ```
//!
//! ## Write path
//!
//! The output queue is drained with vectored writes. `head_offset` is how much
//! of the front item has already been sent, so partial writes resume exactly
//! where they stopped.
//!
//! ## Oversized items
//!
//! A data block longer than the session's item size limit is never buffered.
//! The client gets `SERVER_ERROR object too large for cache` and the block's
//! bytes are skipped as they arrive.
//!
//! ## Backpressure
//!
//! With a bound configured, [`wants_read`](Session::wants_read) turns false
//! once the queue holds that many responses, and true again after writes bring
//! it below the bound.

use crate::connection::ConnectionStats;
use crate::protocol::{Command, Parser, CRLF};
use crate::storage::Storage;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::Arc;
use tracing::{debug, trace};

/// Most slices handed to a single vectored write
const MAX_WRITE_SLICES: usize = 64;

const BAD_DATA_CHUNK: &[u8] = b"CLIENT_ERROR bad data chunk";

const TOO_LARGE: &[u8] = b"SERVER_ERROR object too large for cache";

/// Default limit on a single data block (same as memcached)
pub const DEFAULT_MAX_ITEM_SIZE: usize = 1 << 20;

/// Protocol state of one connection.
pub struct Session {
    storage: Arc<dyn Storage>,
    stats: Arc<ConnectionStats>,

    parser: Parser,

    /// Command built from a complete line, waiting for its data block
    command: Option<Command>,

    /// Data block bytes (including the trailing `\r\n`) still to arrive
    arg_remains: usize,

    argument: BytesMut,

    /// Bytes of a rejected data block still to be skipped
    discard: usize,

    /// Largest data block that is buffered
    max_item_size: usize,

    output: VecDeque<Bytes>,

    /// Bytes of the front output item already written
    head_offset: usize,

    /// Stop reading once this many responses are queued
    max_output: Option<usize>,

    read_closed: bool,
}

impl Session {
    pub fn new(
        storage: Arc<dyn Storage>,
        stats: Arc<ConnectionStats>,
        max_output: Option<usize>,
    ) -> Self {
        Self {
            storage,
            stats,
            parser: Parser::new(),
            command: None,
            arg_remains: 0,
            argument: BytesMut::new(),
            discard: 0,
            max_item_size: DEFAULT_MAX_ITEM_SIZE,
            output: VecDeque::new(),
            head_offset: 0,
            max_output,
            read_closed: false,
        }
    }

    /// Sets the largest data block a storage command may carry.
    pub fn with_max_item_size(mut self, max: usize) -> Self {
        self.max_item_size = max;
        self
    }

    /// Consumes freshly read bytes, executing every command they complete.
    ///
    /// Incomplete lines and data blocks are kept for the next call. Protocol
    /// errors are answered in-band and never stop processing.
    ///
    /// # Returns
    ///
    /// The number of commands executed.
    pub fn process(&mut self, mut data: &[u8]) -> usize {
        let mut executed = 0;

        while !data.is_empty() {
            if self.discard > 0 {
                let skip = self.discard.min(data.len());
                self.discard -= skip;
                data = &data[skip..];
                continue;
            }

            if self.command.is_none() {
                let (consumed, ready) = self.parser.parse(data);
                data = &data[consumed..];

                if !ready {
                    if consumed == 0 {
                        break;
                    }
                    continue;
                }

                match self.parser.build() {
                    Ok((command, argument_len)) => {
                        trace!(command = command.name(), argument = argument_len, "Parsed command");
                        let block = match argument_len {
                            0 => Some(0),
                            n => n.checked_add(CRLF.len()),
                        };
                        match block {
                            Some(block) if argument_len <= self.max_item_size => {
                                self.arg_remains = block;
                                self.command = Some(command);
                            }
                            _ => {
                                debug!(
                                    command = command.name(),
                                    bytes = argument_len,
                                    limit = self.max_item_size,
                                    "Rejecting oversized item"
                                );
                                self.discard = block.unwrap_or(usize::MAX);
                                self.enqueue(Bytes::from_static(TOO_LARGE));
                            }
                        }
                    }
                    Err(e) => {
                        debug!(command = %self.parser.name(), error = %e, "Bad command line");
                        self.enqueue(e.response());
                    }
                }
                self.parser.reset();
            }

            if self.command.is_some() && self.arg_remains > 0 {
                let take = self.arg_remains.min(data.len());
                self.argument.put_slice(&data[..take]);
                self.arg_remains -= take;
                data = &data[take..];
            }

            if self.command.is_some() && self.arg_remains == 0 {
                self.execute();
                executed += 1;
            }
        }

        executed
    }

    fn execute(&mut self) {
        let Some(command) = self.command.take() else {
            return;
        };

        let mut argument = self.argument.split().freeze();
        if !argument.is_empty() {
            if !argument.ends_with(CRLF) {
                debug!(command = command.name(), "Data block missing terminator");
                self.enqueue(Bytes::from_static(BAD_DATA_CHUNK));
                self.stats.command_processed();
                return;
            }
            argument.truncate(argument.len() - CRLF.len());
        }

        let response = command.execute(self.storage.as_ref(), &argument);
        self.stats.command_processed();
        self.enqueue(response);
    }

    fn enqueue(&mut self, response: Bytes) {
        let mut line = BytesMut::with_capacity(response.len() + CRLF.len());
        line.put_slice(&response);
        line.put_slice(CRLF);
        self.output.push_back(line.freeze());
    }

    /// Returns the unwritten output as slices, starting at the write cursor.
    pub fn write_slices(&self) -> Vec<IoSlice<'_>> {
        self.output
            .iter()
            .take(MAX_WRITE_SLICES)
            .enumerate()
            .map(|(i, item)| {
                let start = if i == 0 { self.head_offset } else { 0 };
                IoSlice::new(&item[start..])
            })
            .collect()
    }

    /// Records that `written` bytes of output reached the socket.
    pub fn advance(&mut self, mut written: usize) {
        while written > 0 {
            let Some(front) = self.output.front() else {
                break;
            };
            let remaining = front.len() - self.head_offset;
            if written >= remaining {
                written -= remaining;
                self.output.pop_front();
                self.head_offset = 0;
            } else {
                self.head_offset += written;
                written = 0;
            }
        }
    }

    /// Performs one vectored write into `writer` and advances the cursor.
    pub fn write_to<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        if self.output.is_empty() {
            return Ok(0);
        }
        let written = writer.write_vectored(&self.write_slices())?;
        self.advance(written);
        Ok(written)
    }

    /// True while the connection should keep reading.
    pub fn wants_read(&self) -> bool {
        !self.read_closed && self.max_output.map_or(true, |max| self.output.len() < max)
    }

    /// True while responses are waiting to be written.
    pub fn wants_write(&self) -> bool {
        !self.output.is_empty()
    }

    /// Records that the peer will send nothing more.
    pub fn close_read(&mut self) {
        self.read_closed = true;
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    /// True once the peer is done and every response has been written.
    pub fn is_finished(&self) -> bool {
        self.read_closed && self.output.is_empty()
    }

    /// Number of queued responses.
    pub fn queued_responses(&self) -> usize {
        self.output.len()
    }

    /// Number of output bytes not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.output.iter().map(Bytes::len).sum::<usize>() - self.head_offset
    }

    /// Removes and returns all queued output.
    #[cfg(test)]
    fn drain(&mut self) -> String {
        let mut out = Vec::new();
        for slice in self.write_slices() {
            out.extend_from_slice(&slice);
        }
        let n = out.len();
        self.advance(n);
        String::from_utf8(out).unwrap()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pending_command", &self.command)
            .field("arg_remains", &self.arg_remains)
            .field("discard", &self.discard)
            .field("queued", &self.output.len())
            .field("head_offset", &self.head_offset)
            .field("read_closed", &self.read_closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ThreadSafeLru;
    use std::sync::atomic::Ordering;

    fn session(max_output: Option<usize>) -> (Session, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(ThreadSafeLru::new(1024));
        let stats = Arc::new(ConnectionStats::new());
        (Session::new(Arc::clone(&storage), stats, max_output), storage)
    }

    #[test]
    fn test_single_set() {
        let (mut s, storage) = session(None);
        assert_eq!(s.process(b"set k 0 0 1\r\nv\r\n"), 1);
        assert_eq!(s.drain(), "STORED\r\n");
        assert_eq!(storage.get(b"k"), Some(Bytes::from("v")));
    }

    #[test]
    fn test_command_split_across_reads() {
        let (mut s, storage) = session(None);
        assert_eq!(s.process(b"se"), 0);
        assert!(!s.wants_write());
        assert_eq!(s.process(b"t k 0 0 1\r\nv\r\n"), 1);
        assert_eq!(s.drain(), "STORED\r\n");
        assert_eq!(storage.get(b"k"), Some(Bytes::from("v")));
    }

    #[test]
    fn test_argument_split_across_reads() {
        let (mut s, storage) = session(None);
        assert_eq!(s.process(b"set k 0 0 10\r\n0123"), 0);
        assert_eq!(s.process(b"456789\r"), 0);
        assert_eq!(s.process(b"\n"), 1);
        assert_eq!(storage.get(b"k"), Some(Bytes::from("0123456789")));
    }

    #[test]
    fn test_pipelined_commands() {
        let (mut s, _) = session(None);
        let executed = s.process(b"set a 0 0 1\r\n1\r\nset b 0 0 2\r\n22\r\nget a b c\r\ndelete a\r\n");
        assert_eq!(executed, 4);
        assert_eq!(
            s.drain(),
            "STORED\r\nSTORED\r\nVALUE a 0 1\r\n1\r\nVALUE b 0 2\r\n22\r\nEND\r\nDELETED\r\n"
        );
    }

    #[test]
    fn test_zero_length_value() {
        let (mut s, storage) = session(None);
        assert_eq!(s.process(b"set k 0 0 0\r\n\r\nget k\r\n"), 2);
        assert_eq!(s.drain(), "STORED\r\nVALUE k 0 0\r\n\r\nEND\r\n");
        assert_eq!(storage.get(b"k"), Some(Bytes::new()));
    }

    #[test]
    fn test_bad_data_chunk() {
        let (mut s, storage) = session(None);
        assert_eq!(s.process(b"set k 0 0 1\r\nvxx"), 1);
        assert_eq!(s.drain(), "CLIENT_ERROR bad data chunk\r\n");
        assert_eq!(storage.get(b"k"), None);
    }

    #[test]
    fn test_errors_are_answered_in_band() {
        let (mut s, _) = session(None);
        assert_eq!(s.process(b"bogus\r\nincr k x\r\nversion\r\n"), 1);

        let out = s.drain();
        let lines: Vec<&str> = out.split("\r\n").collect();
        assert_eq!(lines[0], "ERROR");
        assert!(lines[1].starts_with("CLIENT_ERROR"));
        assert!(lines[2].starts_with("VERSION "));
    }

    #[test]
    fn test_partial_write_resumes_at_cursor() {
        let (mut s, _) = session(None);
        s.process(b"set k 0 0 1\r\nv\r\nget k\r\n");
        let total = s.pending_bytes();
        assert_eq!(total, "STORED\r\n".len() + "VALUE k 0 1\r\nv\r\nEND\r\n".len());

        s.advance(3);
        assert_eq!(s.pending_bytes(), total - 3);
        assert_eq!(&*s.write_slices()[0], b"RED\r\n");

        // Finish the first item and cut into the second
        s.advance(7);
        assert_eq!(s.queued_responses(), 1);
        assert_eq!(s.drain(), "LUE k 0 1\r\nv\r\nEND\r\n");
        assert!(!s.wants_write());
    }

    #[test]
    fn test_write_to_vectored() {
        let (mut s, _) = session(None);
        s.process(b"version\r\nversion\r\n");

        let mut sink = Vec::new();
        while s.wants_write() {
            s.write_to(&mut sink).unwrap();
        }
        let text = String::from_utf8(sink).unwrap();
        assert_eq!(text.matches("VERSION ").count(), 2);
        assert_eq!(s.write_to(&mut Vec::new()).unwrap(), 0);
    }

    #[test]
    fn test_backpressure_toggles_reading() {
        let (mut s, _) = session(Some(2));
        assert!(s.wants_read());

        s.process(b"version\r\n");
        assert!(s.wants_read());
        s.process(b"version\r\n");
        assert!(!s.wants_read());

        let first = s.write_slices()[0].len();
        s.advance(first);
        assert!(s.wants_read());
    }

    #[test]
    fn test_close_read_and_finish() {
        let (mut s, _) = session(None);
        s.process(b"version\r\n");
        s.close_read();
        assert!(!s.wants_read());
        assert!(s.is_read_closed());
        assert!(!s.is_finished());

        s.drain();
        assert!(s.is_finished());
    }

    #[test]
    fn test_huge_announced_length_answered_in_band() {
        let (mut s, storage) = session(None);
        let line = format!("set k 0 0 {}\r\n", u64::MAX);
        assert_eq!(s.process(line.as_bytes()), 0);
        assert_eq!(s.process(b"version\r\n"), 1);

        let out = s.drain();
        assert!(out.starts_with("CLIENT_ERROR data block too large"));
        assert!(out.ends_with(&format!("VERSION {}\r\n", crate::VERSION)));
        assert_eq!(storage.get(b"k"), None);
    }

    #[test]
    fn test_oversized_item_is_skipped_unbuffered() {
        let (s, storage) = session(None);
        let mut s = s.with_max_item_size(1024);

        assert_eq!(s.process(b"set k 0 0 100000000\r\n"), 0);
        assert_eq!(s.drain(), "SERVER_ERROR object too large for cache\r\n");

        let chunk = vec![b'x'; 4096];
        let mut sent = 0;
        while sent + chunk.len() <= 100_000_000 {
            assert_eq!(s.process(&chunk), 0);
            assert!(s.argument.is_empty());
            sent += chunk.len();
        }

        // The rest of the block, its terminator, then a normal command
        let mut tail = vec![b'x'; 100_000_000 - sent];
        tail.extend_from_slice(b"\r\nset k 0 0 1\r\nv\r\n");
        assert_eq!(s.process(&tail), 1);
        assert_eq!(s.drain(), "STORED\r\n");
        assert_eq!(storage.get(b"k"), Some(Bytes::from("v")));
    }

    #[test]
    fn test_item_at_limit_is_stored() {
        let (s, storage) = session(None);
        let mut s = s.with_max_item_size(4);

        assert_eq!(s.process(b"set k 0 0 4\r\nabcd\r\nset j 0 0 5\r\nabcde\r\nget k j\r\n"), 2);
        assert_eq!(
            s.drain(),
            "STORED\r\nSERVER_ERROR object too large for cache\r\nVALUE k 0 4\r\nabcd\r\nEND\r\n"
        );
        assert_eq!(storage.get(b"j"), None);
    }

    #[test]
    fn test_commands_counted() {
        let storage: Arc<dyn Storage> = Arc::new(ThreadSafeLru::new(64));
        let stats = Arc::new(ConnectionStats::new());
        let mut s = Session::new(storage, Arc::clone(&stats), None);

        s.process(b"get a\r\nget b\r\nnope\r\n");
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 2);
    }
}
