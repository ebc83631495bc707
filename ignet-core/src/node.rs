//! Node transfer session: the client side of one poll of a neighbor.
//!
//! `Greeting -> Auth -> NDOP/READ.../CLOS -> NUOP/WRIT.../UCLS -> QUIT`.
//! Each phase pairs a send step (stage the next command) with a read step
//! (interpret the reply). The reactor only sees [`Protocol`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::blob::{BlobTransfer, Direction};
use crate::context::{Entry, IoContext, PeerAddr, Protocol};
use crate::notify::{AdminNotice, Notifier};
use crate::registry::{TalkingGuard, TalkingTo};
use crate::spool::{self, InboundNames, SpoolDirs};
use crate::state::NextState;
use crate::wire::{token, Command, Status, StatusClass, AUTH_ALREADY_TALKING};

pub const DEFAULT_PORT: u16 = 504;

/// Subject of every notice a session raises.
pub const NOTICE_SUBJECT: &str = "Networker error";

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// One neighbor as configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub secret: String,
}

impl NodeConfig {
    /// Every field needed to authenticate is present.
    pub fn is_complete(&self) -> bool {
        !self.name.is_empty() && !self.host.is_empty() && !self.secret.is_empty() && self.port != 0
    }

    /// Complete, and not a placeholder address.
    pub fn is_pollable(&self) -> bool {
        self.is_complete() && self.host != "0.0.0.0"
    }
}

/// Durations applied per phase class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    /// Command/reply exchanges.
    pub line: Duration,
    /// Streaming a chunk of file payload.
    pub blob: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(100),
            line: Duration::from_secs(100),
            blob: Duration::from_secs(600),
        }
    }
}

/// Shared by every session of one process.
#[derive(Clone)]
pub struct SessionEnv {
    pub local_node: String,
    pub dirs: SpoolDirs,
    pub timeouts: Timeouts,
    pub notifier: Arc<dyn Notifier>,
    pub talking: TalkingTo,
    /// Set once when the process begins shutting down.
    pub shutting_down: Arc<AtomicBool>,
}

/// Operator-visible session status.
pub mod status {
    pub const LOOKING_UP: &str = "Looking up host";
    pub const CONNECTING: &str = "Connecting host";
    pub const CONN_FAILED: &str = "Failed to connect";
    pub const GREETING: &str = "Reading greeting";
    pub const AUTHENTICATING: &str = "Authenticating";
    pub const AUTH_BUSY: &str = "Auth failed (already talking)";
    pub const AUTH_FAILED: &str = "Auth failed";
    pub const DOWNLOADING: &str = "Downloading";
    pub const DOWNLOAD_DONE: &str = "Download done";
    pub const UPLOADING: &str = "Uploading spool file";
    pub const UPLOAD_DONE: &str = "Upload done";
    pub const FAILED: &str = "Failed";
}

/// Where the session is in the exchange. The send step of a phase stages its
/// command; the read step interprets the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Greeting,
    Auth,
    Ndop,
    Read,
    ReadBlob,
    Clos,
    Nuop,
    Writ,
    WriteBlob,
    Ucls,
    Quit,
}

impl Phase {
    fn is_blob(self) -> bool {
        matches!(self, Phase::ReadBlob | Phase::WriteBlob)
    }
}

pub struct NodeSession {
    io: IoContext,
    n: u64,
    node: NodeConfig,
    env: SessionEnv,
    phase: Phase,
    inbound: Option<InboundNames>,
    outbound: Option<PathBuf>,
    talking: Option<TalkingGuard>,
    span: tracing::Span,
}

impl NodeSession {
    /// Claim `node` in the registry and build a session for it. `None` when
    /// another session is already talking to that node.
    pub fn start(id: u64, n: u64, node: NodeConfig, env: &SessionEnv) -> Option<Self> {
        let talking = env.talking.try_enter(&node.name)?;
        let span = tracing::info_span!("nwc", io = id, node = %node.name, n);
        let peer = PeerAddr::new(&node.host, node.port);
        let mut io = IoContext::new(id, peer, NextState::Connect, env.timeouts.connect);
        io.set_status(if io.peer.is_ip() {
            status::CONNECTING
        } else {
            status::LOOKING_UP
        });
        Some(Self {
            io,
            n,
            node,
            env: env.clone(),
            phase: Phase::Greeting,
            inbound: None,
            outbound: None,
            talking: Some(talking),
            span,
        })
    }

    pub fn entry(&self) -> Entry {
        self.io.entry()
    }

    pub fn node(&self) -> &NodeConfig {
        &self.node
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session_number(&self) -> u64 {
        self.n
    }

    fn send(&mut self, cmd: Command) -> NextState {
        let line = cmd.to_string();
        match &cmd {
            Command::Netp { node, .. } => debug!("> NETP {}|********", node),
            _ => debug!("> {}", line.trim_end()),
        }
        self.io.send.set(&line);
        NextState::SendReply
    }

    /// Move to `phase`; the reactor runs its send step next.
    fn then_send(&mut self, phase: Phase) -> NextState {
        self.phase = phase;
        NextState::SendReply
    }

    fn notify(&self, body: String) {
        self.env.notifier.notify(AdminNotice {
            subject: NOTICE_SUBJECT.to_string(),
            node: self.node.name.clone(),
            body,
            io: self.io.id,
        });
    }

    fn fail(&mut self, msg: String) -> NextState {
        warn!("{}", msg);
        self.io.set_error(msg.clone());
        self.io.set_status(status::FAILED);
        self.notify(msg);
        NextState::Abort
    }

    fn drop_blob(&mut self) {
        if let Some(mut blob) = self.io.blob.take() {
            blob.close();
        }
    }

    fn apply_timeout(&mut self, rc: NextState) {
        if rc.is_terminal() {
            return;
        }
        let t = if rc.is_blob() || self.phase.is_blob() {
            self.env.timeouts.blob
        } else {
            self.env.timeouts.line
        };
        if t != self.io.rw_timeout() {
            self.io.set_timeout(t);
        }
    }

    // Read steps.

    fn read_greeting(&mut self) -> NextState {
        let line = self.io.line.clone();
        let Ok(reply) = Status::parse(&line) else {
            return self.fail(format!("Empty greeting from {}", self.node.host));
        };
        if !reply.is_ok() {
            return self.fail(format!("Connected to node \"{}\" but got: {}", self.node.name, line));
        }
        // "200 <node> ..."
        let remote = token(&line, 1);
        if remote != self.node.name {
            return self.fail(format!(
                "Connected to node \"{}\" but I was expecting to connect to node \"{}\".",
                remote, self.node.name
            ));
        }
        self.io.set_status(status::AUTHENTICATING);
        self.then_send(Phase::Auth)
    }

    fn read_auth_reply(&mut self) -> NextState {
        let line = self.io.line.clone();
        let reply = Status::parse(&line).ok();
        if reply.as_ref().is_some_and(Status::is_ok) {
            return self.then_send(Phase::Ndop);
        }
        if reply.and_then(|r| r.code) == Some(AUTH_ALREADY_TALKING) {
            info!("{} is already talking to us: {}", self.node.name, line);
            self.io.set_status(status::AUTH_BUSY);
            return NextState::Abort;
        }
        let rc = self.fail(format!("Connected to node \"{}\" but my secret wasn't accepted: {}", self.node.name, line));
        self.io.set_status(status::AUTH_FAILED);
        rc
    }

    fn read_ndop_reply(&mut self) -> NextState {
        let line = self.io.line.clone();
        let reply = match Status::parse(&line) {
            Ok(r) if r.is_ok() => r,
            _ => {
                warn!("NDOP refused: {}", line);
                self.io.set_status(status::FAILED);
                return NextState::Abort;
            }
        };
        let total = reply.size_arg();
        if total == 0 {
            debug!("nothing to download");
            return self.then_send(Phase::Nuop);
        }
        let names = self.env.dirs.inbound_names(&self.node.name);
        let file = match spool::create_exclusive(&names.temp) {
            Ok(f) => f,
            Err(e) => {
                error!("{}", e);
                self.io.set_error(e.to_string());
                self.io.set_status(status::FAILED);
                return NextState::Abort;
            }
        };
        debug!("downloading {} bytes to {}", total, names.temp.display());
        self.inbound = Some(names);
        self.io.blob = Some(BlobTransfer::new(file, Direction::Download, total));
        self.then_send(Phase::Read)
    }

    fn read_read_reply(&mut self) -> NextState {
        let line = self.io.line.clone();
        let remaining = self.io.blob.as_ref().map_or(0, BlobTransfer::remaining);
        let chunk = match Status::parse(&line) {
            Ok(r) if r.class == StatusClass::BinaryFollows => r.size_arg(),
            _ => {
                warn!("READ refused: {}", line);
                self.drop_blob();
                return NextState::Abort;
            }
        };
        if chunk == 0 || chunk > remaining {
            warn!("peer offered a {} byte chunk with {} bytes outstanding", chunk, remaining);
            self.drop_blob();
            return NextState::Abort;
        }
        if let Some(blob) = self.io.blob.as_mut() {
            blob.start_chunk(chunk);
        }
        self.io.recv.begin_blob(chunk);
        self.phase = Phase::ReadBlob;
        NextState::ReadFile
    }

    fn read_blob_done(&mut self) -> NextState {
        let complete = self.io.blob.as_ref().is_some_and(BlobTransfer::is_complete);
        if !complete {
            return self.then_send(Phase::Read);
        }
        if let Some(mut blob) = self.io.blob.take() {
            if let Err(e) = blob.finish() {
                // Not published; the temp file stays for inspection.
                error!("cannot sync download: {}", e);
                self.io.set_error(e.to_string());
                self.io.set_status(status::FAILED);
                self.inbound = None;
                return NextState::Abort;
            }
        }
        if let Some(names) = self.inbound.take() {
            match spool::publish(&names) {
                Ok(()) => info!("received {}", names.spool.display()),
                Err(e) => error!("{}", e),
            }
        }
        self.io.set_status(status::DOWNLOAD_DONE);
        self.then_send(Phase::Clos)
    }

    fn read_clos_reply(&mut self) -> NextState {
        let line = self.io.line.clone();
        match Status::parse(&line) {
            Ok(r) if r.is_ok() => self.then_send(Phase::Nuop),
            _ => {
                warn!("CLOS refused: {}", line);
                NextState::TerminateConnection
            }
        }
    }

    fn read_nuop_reply(&mut self) -> NextState {
        let line = self.io.line.clone();
        match Status::parse(&line) {
            Ok(r) if r.is_ok() => {
                self.io.set_status(status::UPLOADING);
                self.then_send(Phase::Writ)
            }
            _ => {
                warn!("NUOP refused: {}", line);
                self.drop_blob();
                self.outbound = None;
                NextState::Abort
            }
        }
    }

    fn read_writ_reply(&mut self) -> NextState {
        let line = self.io.line.clone();
        let remaining = self.io.blob.as_ref().map_or(0, BlobTransfer::remaining);
        let accepted = match Status::parse(&line) {
            Ok(r) if r.class == StatusClass::SendBinary => r.size_arg(),
            _ => {
                warn!("WRIT refused: {}", line);
                self.drop_blob();
                return NextState::Abort;
            }
        };
        if accepted == 0 {
            warn!("peer accepts no bytes with {} outstanding", remaining);
            self.drop_blob();
            return NextState::Abort;
        }
        if let Some(blob) = self.io.blob.as_mut() {
            blob.start_chunk(accepted.min(remaining));
        }
        self.phase = Phase::WriteBlob;
        NextState::SendFile
    }

    fn read_ucls_reply(&mut self) -> NextState {
        self.drop_blob();
        let line = self.io.line.clone();
        let accepted = Status::parse(&line).is_ok_and(|r| r.is_ok());
        info!("UCLS: {}", line);
        if let Some(path) = self.outbound.take() {
            if accepted {
                if let Err(e) = std::fs::remove_file(&path) {
                    error!("cannot remove {}: {}", path.display(), e);
                }
            }
        }
        self.io.set_status(status::UPLOAD_DONE);
        self.then_send(Phase::Quit)
    }

    // Send steps.

    fn send_read(&mut self) -> NextState {
        if self.env.shutting_down.load(Ordering::Acquire) {
            info!("shutting down mid-download");
            self.discard_download();
            return NextState::Abort;
        }
        let Some(blob) = self.io.blob.as_ref() else {
            return NextState::Abort;
        };
        let cmd = Command::Read {
            offset: blob.total_done(),
            total: blob.total_size(),
        };
        self.send(cmd)
    }

    fn send_nuop(&mut self) -> NextState {
        let path = self.env.dirs.outbound_path(&self.node.name);
        let size = match spool::outbound_size(&path) {
            Ok(Some(size)) => size,
            Ok(None) => {
                debug!("no outbound spool file");
                return self.send_quit();
            }
            Err(e) => {
                error!("{}", e);
                return self.send_quit();
            }
        };
        if size == 0 {
            debug!("outbound spool file is empty");
            return self.send_quit();
        }
        let file = match spool::open_outbound(&path) {
            Ok(f) => f,
            Err(e) => {
                error!("{}", e);
                return self.send_quit();
            }
        };
        self.io.blob = Some(BlobTransfer::new(file, Direction::Upload, size));
        self.outbound = Some(path);
        self.send(Command::Nuop)
    }

    fn send_writ(&mut self) -> NextState {
        let Some(blob) = self.io.blob.as_ref() else {
            return NextState::Abort;
        };
        let remaining = blob.remaining();
        self.send(Command::Writ { remaining })
    }

    fn write_blob_done(&mut self) -> NextState {
        let complete = self.io.blob.as_ref().is_some_and(BlobTransfer::is_complete);
        if complete {
            self.phase = Phase::Ucls;
            self.send(Command::Ucls)
        } else {
            self.phase = Phase::Writ;
            self.send_writ()
        }
    }

    fn send_quit(&mut self) -> NextState {
        self.phase = Phase::Quit;
        self.send(Command::Quit)
    }

    /// Drop a partial download: close it and remove the temp file.
    fn discard_download(&mut self) {
        let downloading = self
            .io
            .blob
            .as_ref()
            .is_some_and(|b| b.direction() == Direction::Download);
        if downloading {
            self.drop_blob();
        }
        if let Some(names) = self.inbound.take() {
            if let Err(e) = std::fs::remove_file(&names.temp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!("cannot remove {}: {}", names.temp.display(), e);
                }
            }
        }
    }
}

impl Protocol for NodeSession {
    fn io(&mut self) -> &mut IoContext {
        &mut self.io
    }

    fn span(&self) -> tracing::Span {
        self.span.clone()
    }

    /// The peer speaks first.
    fn connected(&mut self) -> NextState {
        self.io.set_status(status::GREETING);
        self.phase = Phase::Greeting;
        self.io.set_timeout(self.env.timeouts.line);
        self.io.next_state = NextState::ReadMessage;
        NextState::ReadMessage
    }

    fn read_done(&mut self) -> NextState {
        if !self.phase.is_blob() {
            debug!("< {}", self.io.line);
        }
        let rc = match self.phase {
            Phase::Greeting => self.read_greeting(),
            Phase::Auth => self.read_auth_reply(),
            Phase::Ndop => self.read_ndop_reply(),
            Phase::Read => self.read_read_reply(),
            Phase::ReadBlob => self.read_blob_done(),
            Phase::Clos => self.read_clos_reply(),
            Phase::Nuop => self.read_nuop_reply(),
            Phase::Writ => self.read_writ_reply(),
            Phase::Ucls => self.read_ucls_reply(),
            // Any reply to QUIT ends the session.
            Phase::Quit => NextState::Abort,
            Phase::WriteBlob => {
                warn!("unexpected input while uploading: {}", self.io.line);
                NextState::Abort
            }
        };
        self.apply_timeout(rc);
        rc
    }

    fn send_done(&mut self) -> NextState {
        let rc = match self.phase {
            Phase::Auth => {
                let cmd = Command::Netp {
                    node: self.env.local_node.clone(),
                    secret: self.node.secret.clone(),
                };
                self.send(cmd)
            }
            Phase::Ndop => {
                self.io.set_status(status::DOWNLOADING);
                self.send(Command::Ndop)
            }
            Phase::Read => self.send_read(),
            Phase::Clos => self.send(Command::Clos),
            Phase::Nuop => self.send_nuop(),
            Phase::Writ => self.send_writ(),
            Phase::WriteBlob => self.write_blob_done(),
            Phase::Ucls => self.send(Command::Ucls),
            Phase::Quit => self.send(Command::Quit),
            Phase::Greeting | Phase::ReadBlob => {
                warn!("nothing to send in phase {:?}", self.phase);
                NextState::Abort
            }
        };
        self.apply_timeout(rc);
        rc
    }

    fn timeout(&mut self) -> NextState {
        let msg = format!("Timeout while talking to {} during {:?}", self.node.host, self.phase);
        self.fail(msg)
    }

    fn conn_fail(&mut self) -> NextState {
        let msg = format!("failed to connect {}:{}", self.node.host, self.node.port);
        let rc = self.fail(msg);
        self.io.set_status(status::CONN_FAILED);
        rc
    }

    fn dns_fail(&mut self) -> NextState {
        let msg = format!("failed to look up {}", self.node.host);
        let rc = self.fail(msg);
        self.io.set_status(status::CONN_FAILED);
        rc
    }

    fn peer_closed(&mut self) -> NextState {
        if self.phase == Phase::Quit {
            debug!("peer closed after QUIT");
            return NextState::Abort;
        }
        let msg = format!("Connection closed by {} during {:?}", self.node.host, self.phase);
        self.fail(msg)
    }

    fn terminate(&mut self) {
        debug!(status = self.io.status(), "session ends");
        self.drop_blob();
        self.io.release();
        self.talking = None;
    }

    fn shutdown_abort(&mut self) {
        info!("aborting for shutdown in phase {:?}", self.phase);
        self.discard_download();
        self.io.set_status(status::FAILED);
    }
}
