//! Buffered channel: a growable byte buffer bound to one direction of a
//! non-blocking connection. Supports line extraction and fixed-length blobs.

use std::io;

use crate::state::ReadState;

/// Bytes requested from the socket per read attempt.
pub const READ_CHUNK_SIZE: usize = 4096;

/// A line longer than this without a terminator is treated as malformed.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Result of one non-blocking read into the channel.
#[derive(Debug)]
pub enum ChunkRead {
    /// This many bytes were appended.
    Data(usize),
    /// The peer shut down its side.
    Eof,
    /// The descriptor had nothing to give; wait for readiness again.
    Pending,
    Error(io::Error),
}

/// Result of one non-blocking write out of the channel.
#[derive(Debug)]
pub enum ChunkWrite {
    /// Everything staged has been written.
    Done,
    /// Some bytes remain; keep the write watcher armed.
    More,
    Error(io::Error),
}

/// Byte buffer with a cursor. For a receive channel the cursor marks consumed
/// input; for a send channel it marks bytes already written.
///
/// Invariant: `cursor <= buf.len()`, and line mode and blob mode are never
/// active together (`blob_wanted != 0` means blob mode).
#[derive(Debug, Default)]
pub struct BufferedChannel {
    buf: Vec<u8>,
    cursor: usize,
    blob_wanted: u64,
}

impl BufferedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes not yet consumed (receive) or not yet written (send).
    pub fn unconsumed(&self) -> &[u8] {
        &self.buf[self.cursor..]
    }

    pub fn pending(&self) -> usize {
        self.buf.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// `BufferNotEmpty` if unconsumed bytes remain, else `MustReadMore`.
    pub fn check_buffer(&self) -> ReadState {
        if self.is_empty() {
            ReadState::MustReadMore
        } else {
            ReadState::BufferNotEmpty
        }
    }

    /// Perform one read through `read`, appending to the unread tail. `read`
    /// must not block; `WouldBlock` maps to `Pending`.
    pub fn read_chunk<F>(&mut self, read: F) -> ChunkRead
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        self.compact();
        let filled = self.buf.len();
        self.buf.resize(filled + READ_CHUNK_SIZE, 0);
        let result = read(&mut self.buf[filled..]);
        match result {
            Ok(0) => {
                self.buf.truncate(filled);
                ChunkRead::Eof
            }
            Ok(n) => {
                self.buf.truncate(filled + n);
                ChunkRead::Data(n)
            }
            Err(e) => {
                self.buf.truncate(filled);
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted {
                    ChunkRead::Pending
                } else {
                    ChunkRead::Error(e)
                }
            }
        }
    }

    /// Write as much of the staged tail as `write` accepts.
    pub fn write_chunk<F>(&mut self, write: F) -> ChunkWrite
    where
        F: FnOnce(&[u8]) -> io::Result<usize>,
    {
        if self.is_empty() {
            self.clear();
            return ChunkWrite::Done;
        }
        match write(&self.buf[self.cursor..]) {
            Ok(n) => {
                self.cursor += n.min(self.pending());
                if self.is_empty() {
                    self.clear();
                    ChunkWrite::Done
                } else {
                    ChunkWrite::More
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                ChunkWrite::More
            }
            Err(e) => ChunkWrite::Error(e),
        }
    }

    /// Extract one LF (or CRLF) terminated line into `out`, without the
    /// terminator. Only valid in line mode.
    pub fn take_line(&mut self, out: &mut String) -> ReadState {
        if self.blob_wanted != 0 {
            return ReadState::ReadFail;
        }
        let tail = &self.buf[self.cursor..];
        let Some(pos) = tail.iter().position(|&b| b == b'\n') else {
            if tail.len() > MAX_LINE_LEN {
                return ReadState::ReadFail;
            }
            return ReadState::MustReadMore;
        };
        let mut line = &tail[..pos];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        out.clear();
        out.push_str(&String::from_utf8_lossy(line));
        self.cursor += pos + 1;
        if self.is_empty() {
            self.clear();
            ReadState::ReadSuccess
        } else {
            ReadState::BufferNotEmpty
        }
    }

    /// Switch to blob mode: the next `n` bytes are payload, not lines.
    pub fn begin_blob(&mut self, n: u64) {
        self.blob_wanted = n;
    }

    pub fn blob_wanted(&self) -> u64 {
        self.blob_wanted
    }

    /// True once every byte requested by `begin_blob` has been taken.
    pub fn blob_satisfied(&self) -> bool {
        self.blob_wanted == 0
    }

    /// Take up to the outstanding blob length from the buffer. Returns an
    /// empty slice when nothing is buffered or blob mode is off.
    pub fn take_blob(&mut self) -> &[u8] {
        let n = (self.pending() as u64).min(self.blob_wanted) as usize;
        let start = self.cursor;
        self.cursor += n;
        self.blob_wanted -= n as u64;
        &self.buf[start..start + n]
    }

    /// Replace staged output with `s`.
    pub fn set(&mut self, s: &str) {
        self.clear();
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Discard contents but keep the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.cursor = 0;
    }

    /// Drop contents and allocation; leaves the channel in line mode.
    pub fn release(&mut self) {
        self.buf = Vec::new();
        self.cursor = 0;
        self.blob_wanted = 0;
    }

    fn compact(&mut self) {
        if self.cursor > 0 {
            self.buf.drain(..self.cursor);
            self.cursor = 0;
        }
    }
}
