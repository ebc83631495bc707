//! Blob transfer bookkeeping: streams fixed-size chunks between a local file
//! and a connection, counting bytes per chunk and for the whole transfer.

use std::fs::File;
use std::io::{self, Read, Write};

use tracing::warn;

/// Largest slice pulled from the file per fill.
pub const FILE_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peer to local file.
    Download,
    /// Local file to peer.
    Upload,
}

/// A file bound to a connection for the length of one transfer.
#[derive(Debug)]
pub struct BlobTransfer {
    file: Option<File>,
    direction: Direction,
    total_size: u64,
    total_done: u64,
    chunk_size: u64,
    chunk_remain: u64,
}

impl BlobTransfer {
    pub fn new(file: File, direction: Direction, total_size: u64) -> Self {
        Self {
            file: Some(file),
            direction,
            total_size,
            total_done: 0,
            chunk_size: 0,
            chunk_remain: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn total_done(&self) -> u64 {
        self.total_done
    }

    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.total_done)
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_remain(&self) -> u64 {
        self.chunk_remain
    }

    pub fn is_complete(&self) -> bool {
        self.total_done >= self.total_size
    }

    /// Arm the next chunk. The peer announces its length in a status line.
    pub fn start_chunk(&mut self, size: u64) {
        self.chunk_size = size;
        self.chunk_remain = size;
    }

    pub fn chunk_done(&self) -> bool {
        self.chunk_remain == 0
    }

    /// Write received payload to the file. `bytes` must not exceed the
    /// outstanding chunk.
    pub fn absorb(&mut self, bytes: &[u8]) -> io::Result<()> {
        debug_assert!(bytes.len() as u64 <= self.chunk_remain);
        let file = self.file.as_mut().ok_or_else(closed)?;
        file.write_all(bytes)?;
        self.advance(bytes.len() as u64);
        Ok(())
    }

    /// Read the next slice of the current chunk from the file into `out`.
    /// Returns the number of bytes appended; zero means the chunk is done.
    pub fn fill(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let want = self.chunk_remain.min(FILE_CHUNK_SIZE as u64) as usize;
        if want == 0 {
            return Ok(0);
        }
        let file = self.file.as_mut().ok_or_else(closed)?;
        let start = out.len();
        out.resize(start + want, 0);
        let n = match file.read(&mut out[start..]) {
            Ok(n) => n,
            Err(e) => {
                out.truncate(start);
                return Err(e);
            }
        };
        out.truncate(start + n);
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "spool file shorter than announced",
            ));
        }
        self.advance(n as u64);
        Ok(n)
    }

    /// Close the file, flushing a download to disk first. Safe to call more
    /// than once; only the first call can fail.
    pub fn finish(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) if self.direction == Direction::Download => file.sync_all(),
            _ => Ok(()),
        }
    }

    /// Close the file on a path that discards the transfer anyway.
    pub fn close(&mut self) {
        if let Err(e) = self.finish() {
            warn!("cannot sync blob file: {}", e);
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn advance(&mut self, n: u64) {
        self.chunk_remain -= n;
        self.total_done += n;
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "blob file already closed")
}
