//! I/O context: the per-connection state bundle, and the callback contract a
//! protocol implements so the reactor can drive it.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::blob::{BlobTransfer, Direction};
use crate::channel::BufferedChannel;
use crate::state::{NextState, ReadState};

/// Where to connect. `host` may be an IP literal, in which case no lookup is
/// needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
    pub ipv6: bool,
    /// Filled in by DNS, or directly for IP literals.
    pub resolved: Option<SocketAddr>,
}

impl PeerAddr {
    pub fn new(host: &str, port: u16) -> Self {
        let literal = host.parse::<IpAddr>().ok();
        Self {
            host: host.to_string(),
            port,
            ipv6: matches!(literal, Some(IpAddr::V6(_))),
            resolved: literal.map(|ip| SocketAddr::new(ip, port)),
        }
    }

    pub fn is_ip(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }
}

/// Per-connection state. Owned by exactly one protocol session; the reactor
/// only borrows it through [`Protocol::io`].
#[derive(Debug)]
pub struct IoContext {
    pub id: u64,
    pub send: BufferedChannel,
    pub recv: BufferedChannel,
    /// Scratch buffer holding the most recently parsed line.
    pub line: String,
    pub next_state: NextState,
    pub err_msg: Option<String>,
    pub peer: PeerAddr,
    /// File bound to the connection while a blob phase is active.
    pub blob: Option<BlobTransfer>,
    status: &'static str,
    rw_timeout: Duration,
    timeout_generation: u64,
    torn_down: bool,
}

impl IoContext {
    pub fn new(id: u64, peer: PeerAddr, first_state: NextState, rw_timeout: Duration) -> Self {
        Self {
            id,
            send: BufferedChannel::new(),
            recv: BufferedChannel::new(),
            line: String::new(),
            next_state: first_state,
            err_msg: None,
            peer,
            blob: None,
            status: "",
            rw_timeout,
            timeout_generation: 0,
            torn_down: false,
        }
    }

    /// Rearm the read/write timer with a new duration. The reactor picks the
    /// change up before it next waits.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.rw_timeout = timeout;
        self.timeout_generation = self.timeout_generation.wrapping_add(1);
    }

    pub fn rw_timeout(&self) -> Duration {
        self.rw_timeout
    }

    /// Bumped on every `set_timeout`, so the reactor can tell a rearm apart
    /// from an unchanged duration.
    pub fn timeout_generation(&self) -> u64 {
        self.timeout_generation
    }

    /// Generic line extraction into the scratch buffer.
    pub fn take_line(&mut self) -> ReadState {
        self.recv.take_line(&mut self.line)
    }

    pub fn set_error(&mut self, msg: impl Into<String>) {
        self.err_msg = Some(msg.into());
    }

    pub fn error(&self) -> &str {
        self.err_msg.as_deref().unwrap_or("")
    }

    /// Human readable phase of the session, for operators.
    pub fn status(&self) -> &'static str {
        self.status
    }

    pub fn set_status(&mut self, status: &'static str) {
        if self.status != status {
            tracing::debug!(io = self.id, status, "session status");
            self.status = status;
        }
    }

    /// Move buffered download payload into the blob file. Returns true once
    /// the current chunk is complete.
    pub fn pump_download(&mut self) -> io::Result<bool> {
        let blob = match self.blob.as_mut() {
            Some(b) if b.direction() == Direction::Download => b,
            _ => return Err(no_blob()),
        };
        loop {
            let bytes = self.recv.take_blob();
            if bytes.is_empty() {
                break;
            }
            blob.absorb(bytes)?;
        }
        Ok(self.recv.blob_satisfied())
    }

    /// Stage the next slice of the upload chunk into the send channel.
    /// Returns true once the whole chunk has been staged.
    pub fn pump_upload(&mut self) -> io::Result<bool> {
        let blob = match self.blob.as_mut() {
            Some(b) if b.direction() == Direction::Upload => b,
            _ => return Err(no_blob()),
        };
        if !blob.chunk_done() {
            let mut staged = Vec::new();
            blob.fill(&mut staged)?;
            self.send.push_bytes(&staged);
        }
        Ok(blob.chunk_done())
    }

    /// Close the blob file and drop all buffers. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(mut blob) = self.blob.take() {
            blob.close();
        }
        self.send.release();
        self.recv.release();
        self.line = String::new();
    }

    /// Mark the context as torn down. Returns false if it already was, so the
    /// caller can skip a second teardown.
    pub fn begin_teardown(&mut self) -> bool {
        !std::mem::replace(&mut self.torn_down, true)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// IP literals connect directly; names go through the resolver first.
    pub fn entry(&self) -> Entry {
        if self.peer.resolved.is_some() {
            Entry::Connect
        } else {
            Entry::Lookup
        }
    }
}

fn no_blob() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "no blob transfer bound to context")
}

/// First step the reactor takes with a freshly queued context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// The peer address is known; connect right away.
    Connect,
    /// Resolve the host name first.
    Lookup,
}

/// Callbacks a protocol supplies. The reactor invokes at most one of them at a
/// time for a given context and re-arms watchers from the returned state.
pub trait Protocol: Send {
    fn io(&mut self) -> &mut IoContext;

    /// Span entered around every callback, so log lines carry the session.
    fn span(&self) -> tracing::Span {
        tracing::Span::none()
    }

    /// The connection is up. The default waits for the peer to speak first.
    fn connected(&mut self) -> NextState {
        NextState::ReadMessage
    }

    /// A line (or a completed blob chunk) is ready; compute the next state.
    /// Returning a send state makes the reactor call `send_done` right away
    /// to stage the output.
    fn read_done(&mut self) -> NextState;

    /// Stage the next output. Also called after a `SendMore` flush and after
    /// each uploaded chunk.
    fn send_done(&mut self) -> NextState;

    /// The read/write timer fired or the connection failed mid-exchange.
    fn timeout(&mut self) -> NextState;

    fn conn_fail(&mut self) -> NextState;

    fn dns_fail(&mut self) -> NextState {
        self.conn_fail()
    }

    /// The peer closed its side. Defaults to the timeout path.
    fn peer_closed(&mut self) -> NextState {
        self.timeout()
    }

    /// Release everything the session owns. Called exactly once, last.
    fn terminate(&mut self);

    /// Process-wide shutdown reached this context; leave the filesystem
    /// consistent. Teardown follows.
    fn shutdown_abort(&mut self);

    /// Custom line reader. The default extracts one line in line states and
    /// fails in states that never read lines.
    fn line_reader(&mut self) -> ReadState {
        let io = self.io();
        if io.next_state.expects_line() || io.next_state.is_send() {
            io.take_line()
        } else {
            ReadState::ReadFail
        }
    }
}
