//! Reactor side of one connection: lookup, connect, then move bytes between
//! the socket and the context's channels, calling the protocol on every state
//! change. Each connection is one local task on the client loop, so its
//! callbacks are strictly serialized.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ignet_core::{ChunkRead, ChunkWrite, Entry, IoContext, NextState, Protocol, ReadState};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn, Instrument};

use crate::dns::Resolve;
use crate::event_loop::{Job, LocalFuture, Shutdown};

/// Settings shared by every connection on the client loop.
pub struct Connector {
    pub resolver: Arc<dyn Resolve>,
    /// Local IPv4 address to bind before connecting.
    pub bind: Option<Ipv4Addr>,
    pub connect_timeout: Duration,
}

/// A protocol session queued for the client loop.
pub struct ClientJob<P> {
    proto: P,
    connector: Arc<Connector>,
}

impl<P: Protocol + 'static> ClientJob<P> {
    pub fn new(proto: P, connector: Arc<Connector>) -> Self {
        Self { proto, connector }
    }
}

impl<P: Protocol + 'static> Job for ClientJob<P> {
    fn run(self: Box<Self>, shutdown: Shutdown) -> LocalFuture {
        let ClientJob { mut proto, connector } = *self;
        Box::pin(async move {
            drive(&mut proto, &connector, shutdown).await;
        })
    }
}

/// Why the exchange loop stopped.
#[derive(Debug)]
enum Stop {
    /// A callback returned a terminal state.
    Finished,
    LookupFailed(io::Error),
    ConnectFailed(io::Error),
    Timeout,
    PeerClosed,
    /// The socket is gone; no protocol callback.
    ReadError(io::Error),
    WriteError(io::Error),
    Shutdown,
}

/// Socket and read/write timer of one connection.
struct Conn {
    stream: Option<TcpStream>,
    deadline: Instant,
    generation: u64,
}

impl Conn {
    fn new() -> Self {
        Self {
            stream: None,
            deadline: Instant::now(),
            generation: 0,
        }
    }

    /// Restart the timer from now.
    fn touch(&mut self, io: &IoContext) {
        self.deadline = Instant::now() + io.rw_timeout();
        self.generation = io.timeout_generation();
    }

    /// Pick up a `set_timeout` made by the last callback.
    fn sync(&mut self, io: &IoContext) {
        if io.timeout_generation() != self.generation {
            self.touch(io);
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket already closed"))
    }
}

/// Run `proto` from its entry point to teardown.
pub async fn drive<P: Protocol + ?Sized>(proto: &mut P, connector: &Connector, shutdown: Shutdown) {
    let span = proto.span();
    let mut conn = Conn::new();
    let stop = run_session(proto, connector, &mut conn, shutdown)
        .instrument(span.clone())
        .await;
    span.in_scope(|| finish(proto, &mut conn, stop));
}

async fn run_session<P: Protocol + ?Sized>(
    proto: &mut P,
    connector: &Connector,
    conn: &mut Conn,
    mut shutdown: Shutdown,
) -> Stop {
    let addr = match proto.io().entry() {
        Entry::Connect => proto.io().peer.resolved,
        Entry::Lookup => match lookup(proto, connector, &mut shutdown).await {
            Ok(addr) => Some(addr),
            Err(stop) => return stop,
        },
    };
    let Some(addr) = addr else {
        return Stop::LookupFailed(io::Error::new(io::ErrorKind::NotFound, "no address"));
    };

    proto.io().next_state = NextState::Connect;
    debug!(peer = %addr, "connecting");
    let stream = tokio::select! {
        r = connect(addr, connector.bind, connector.connect_timeout) => match r {
            Ok(s) => s,
            Err(e) => return Stop::ConnectFailed(e),
        },
        _ = shutdown.wait() => return Stop::Shutdown,
    };
    debug!(peer = %addr, "connected");
    conn.stream = Some(stream);
    let rc = proto.connected();
    proto.io().next_state = rc;
    conn.touch(proto.io());
    exchange(proto, conn, &mut shutdown).await
}

async fn lookup<P: Protocol + ?Sized>(
    proto: &mut P,
    connector: &Connector,
    shutdown: &mut Shutdown,
) -> Result<SocketAddr, Stop> {
    proto.io().next_state = NextState::SendDNSQuery;
    let (host, port, ipv6) = {
        let peer = &proto.io().peer;
        (peer.host.clone(), peer.port, peer.ipv6)
    };
    debug!(host = %host, "looking up");
    let query = connector.resolver.resolve(&host, port, ipv6);
    proto.io().next_state = NextState::ReadDNSReply;
    let answer = tokio::select! {
        r = tokio::time::timeout(connector.connect_timeout, query) => r,
        _ = shutdown.wait() => return Err(Stop::Shutdown),
    };
    match answer {
        Ok(Ok(addr)) => {
            proto.io().peer.resolved = Some(addr);
            Ok(addr)
        }
        Ok(Err(e)) => Err(Stop::LookupFailed(e)),
        Err(_) => Err(Stop::LookupFailed(io::Error::new(io::ErrorKind::TimedOut, "lookup timed out"))),
    }
}

async fn connect(addr: SocketAddr, bind: Option<Ipv4Addr>, limit: Duration) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    if let (Some(ip), true) = (bind, addr.is_ipv4()) {
        socket.bind(SocketAddr::new(ip.into(), 0))?;
    }
    match tokio::time::timeout(limit, socket.connect(addr)).await {
        Ok(r) => r,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    }
}

async fn exchange<P: Protocol + ?Sized>(proto: &mut P, conn: &mut Conn, shutdown: &mut Shutdown) -> Stop {
    loop {
        conn.sync(proto.io());
        let state = proto.io().next_state;
        let step = match state {
            NextState::TerminateConnection | NextState::Abort => return Stop::Finished,
            NextState::SendReply | NextState::SendMore => {
                flush(proto, conn, shutdown).await.map(|()| after_flush(proto, state))
            }
            NextState::SendFile => send_file(proto, conn, shutdown).await,
            NextState::ReadMessage | NextState::ReadMore | NextState::ReadFile | NextState::ReadPayload => {
                if handle_inbound(proto) {
                    conn.touch(proto.io());
                    Ok(())
                } else {
                    read_some(proto, conn, shutdown).await
                }
            }
            NextState::DBQuery => park(conn, shutdown).await,
            NextState::Connect | NextState::SendDNSQuery | NextState::ReadDNSReply => {
                warn!(?state, "unexpected state on a connected socket");
                proto.io().next_state = NextState::Abort;
                Ok(())
            }
        };
        if let Err(stop) = step {
            return stop;
        }
    }
}

/// Record `rc`; a send state asks the protocol to stage its output.
fn advance<P: Protocol + ?Sized>(proto: &mut P, rc: NextState) {
    proto.io().next_state = rc;
    if rc.is_send() {
        let rc = proto.send_done();
        proto.io().next_state = rc;
    }
}

/// `SendReply` waits for the answer; `SendMore` asks for the next output.
fn after_flush<P: Protocol + ?Sized>(proto: &mut P, flushed: NextState) {
    match flushed {
        NextState::SendReply => proto.io().next_state = NextState::ReadMessage,
        NextState::SendMore => {
            let rc = proto.send_done();
            proto.io().next_state = rc;
        }
        _ => {}
    }
}

/// Hand every complete unit already buffered to the protocol. Returns true if
/// any callback ran.
fn handle_inbound<P: Protocol + ?Sized>(proto: &mut P) -> bool {
    let mut progressed = false;
    loop {
        match proto.io().next_state {
            NextState::ReadFile => match proto.io().pump_download() {
                Ok(true) => {
                    let rc = proto.read_done();
                    advance(proto, rc);
                }
                Ok(false) => return progressed,
                Err(e) => {
                    // The partial file stays in place for inspection.
                    error!("cannot store download: {}", e);
                    if let Some(mut blob) = proto.io().blob.take() {
                        blob.close();
                    }
                    proto.io().next_state = NextState::Abort;
                    return true;
                }
            },
            NextState::ReadMessage | NextState::ReadMore | NextState::ReadPayload => {
                if proto.io().recv.is_empty() {
                    return progressed;
                }
                match proto.line_reader() {
                    ReadState::BufferNotEmpty | ReadState::ReadSuccess => {
                        let rc = proto.read_done();
                        advance(proto, rc);
                    }
                    ReadState::MustReadMore => return progressed,
                    ReadState::ReadFail => {
                        warn!("unparsable input from peer");
                        proto.io().next_state = NextState::Abort;
                        return true;
                    }
                }
            }
            _ => return progressed,
        }
        progressed = true;
    }
}

async fn read_some<P: Protocol + ?Sized>(proto: &mut P, conn: &mut Conn, shutdown: &mut Shutdown) -> Result<(), Stop> {
    let stream = conn.stream().map_err(Stop::ReadError)?;
    tokio::select! {
        r = stream.readable() => r.map_err(Stop::ReadError)?,
        _ = sleep_until(conn.deadline) => return Err(Stop::Timeout),
        _ = shutdown.wait() => return Err(Stop::Shutdown),
    }
    match proto.io().recv.read_chunk(|buf| stream.try_read(buf)) {
        ChunkRead::Data(_) => {
            conn.touch(proto.io());
            Ok(())
        }
        ChunkRead::Pending => Ok(()),
        ChunkRead::Eof => Err(Stop::PeerClosed),
        ChunkRead::Error(e) => Err(Stop::ReadError(e)),
    }
}

/// Write the staged send channel out completely.
async fn flush<P: Protocol + ?Sized>(proto: &mut P, conn: &mut Conn, shutdown: &mut Shutdown) -> Result<(), Stop> {
    loop {
        let before = proto.io().send.pending();
        if before == 0 {
            proto.io().send.clear();
            return Ok(());
        }
        let stream = conn.stream().map_err(Stop::WriteError)?;
        tokio::select! {
            r = stream.writable() => r.map_err(Stop::WriteError)?,
            _ = sleep_until(conn.deadline) => return Err(Stop::Timeout),
            _ = shutdown.wait() => return Err(Stop::Shutdown),
        }
        let written = proto.io().send.write_chunk(|buf| stream.try_write(buf));
        match written {
            ChunkWrite::Done => {
                conn.touch(proto.io());
                return Ok(());
            }
            ChunkWrite::More => {
                if proto.io().send.pending() < before {
                    conn.touch(proto.io());
                }
            }
            ChunkWrite::Error(e) => return Err(Stop::WriteError(e)),
        }
    }
}

/// Stream the armed upload chunk, then let the protocol stage what follows.
async fn send_file<P: Protocol + ?Sized>(proto: &mut P, conn: &mut Conn, shutdown: &mut Shutdown) -> Result<(), Stop> {
    loop {
        let staged_all = match proto.io().pump_upload() {
            Ok(done) => done,
            Err(e) => {
                error!("cannot read upload: {}", e);
                proto.io().next_state = NextState::Abort;
                return Ok(());
            }
        };
        flush(proto, conn, shutdown).await?;
        if staged_all {
            let rc = proto.send_done();
            proto.io().next_state = rc;
            return Ok(());
        }
    }
}

/// No socket traffic while another loop works for the session.
async fn park(conn: &mut Conn, shutdown: &mut Shutdown) -> Result<(), Stop> {
    tokio::select! {
        _ = sleep_until(conn.deadline) => Err(Stop::Timeout),
        _ = shutdown.wait() => Err(Stop::Shutdown),
    }
}

fn finish<P: Protocol + ?Sized>(proto: &mut P, conn: &mut Conn, stop: Stop) {
    let rc = match stop {
        Stop::Finished => None,
        Stop::LookupFailed(e) => {
            debug!("lookup failed: {}", e);
            Some(proto.dns_fail())
        }
        Stop::ConnectFailed(e) => {
            debug!("connect failed: {}", e);
            Some(proto.conn_fail())
        }
        Stop::Timeout => {
            conn.close();
            Some(proto.timeout())
        }
        Stop::PeerClosed => {
            conn.close();
            Some(proto.peer_closed())
        }
        Stop::WriteError(e) => {
            debug!("write failed: {}", e);
            conn.close();
            Some(proto.timeout())
        }
        Stop::ReadError(e) => {
            warn!("socket error: {}", e);
            None
        }
        Stop::Shutdown => {
            proto.shutdown_abort();
            None
        }
    };
    if let Some(rc) = rc {
        if !rc.is_terminal() {
            warn!(?rc, "connection is closed; aborting instead");
        }
        proto.io().next_state = NextState::Abort;
    }
    teardown(proto, conn);
}

/// Close the socket and let the protocol release what it owns. Runs once;
/// later calls return false.
fn teardown<P: Protocol + ?Sized>(proto: &mut P, conn: &mut Conn) -> bool {
    if !proto.io().begin_teardown() {
        return false;
    }
    conn.close();
    proto.terminate();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::fake::StaticResolver;
    use crate::event_loop::shutdown_pair;
    use ignet_core::{MemoryNotifier, NodeConfig, NodeSession, PeerAddr, SessionEnv, SpoolDirs, TalkingTo, Timeouts};
    use std::sync::atomic::AtomicBool;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn scratch_dirs() -> SpoolDirs {
        let root = std::env::temp_dir().join(format!("ignet-conn-{}", uuid::Uuid::new_v4()));
        let dirs = SpoolDirs {
            net_in: root.join("netin"),
            net_out: root.join("netout"),
            tmp: root.join("nettmp"),
        };
        dirs.create_all().unwrap();
        dirs
    }

    fn env(notices: &MemoryNotifier, line: Duration) -> SessionEnv {
        SessionEnv {
            local_node: "uncnsrd".to_string(),
            dirs: scratch_dirs(),
            timeouts: Timeouts {
                connect: Duration::from_secs(5),
                line,
                blob: Duration::from_secs(30),
            },
            notifier: Arc::new(notices.clone()),
            talking: TalkingTo::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    fn connector() -> Connector {
        Connector {
            resolver: Arc::new(StaticResolver::new().with("peer.test", "127.0.0.1".parse().unwrap())),
            bind: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    fn session(env: &SessionEnv, host: &str, port: u16) -> NodeSession {
        let node = NodeConfig {
            name: "peer".to_string(),
            host: host.to_string(),
            port,
            secret: "s3cret".to_string(),
        };
        NodeSession::start(1, 1, node, env).unwrap()
    }

    fn dir_len(path: &std::path::Path) -> usize {
        std::fs::read_dir(path).unwrap().count()
    }

    /// Scripted neighbor. Answers each command line and records it.
    async fn fake_peer(listener: TcpListener, upload_accept: u64) -> (Vec<String>, Vec<u8>) {
        let (sock, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = sock.into_split();
        let mut rd = BufReader::new(rd);
        wr.write_all(b"200 peer Citadel server ready\r\n").await.unwrap();
        let mut seen = Vec::new();
        let mut uploaded = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            if rd.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let cmd = line.trim_end().to_string();
            seen.push(cmd.clone());
            let verb = cmd.split(' ').next().unwrap_or("");
            match verb {
                "NETP" => wr.write_all(b"200 authenticated\r\n").await.unwrap(),
                "NDOP" => wr.write_all(b"226 1500\r\n").await.unwrap(),
                "READ" => {
                    wr.write_all(b"600 1500\r\n").await.unwrap();
                    wr.write_all(&[b'm'; 1500]).await.unwrap();
                }
                "CLOS" => wr.write_all(b"250 OK\r\n").await.unwrap(),
                "NUOP" => wr.write_all(b"200 ok\r\n").await.unwrap(),
                "WRIT" => {
                    let remaining: u64 = cmd[5..].parse().unwrap();
                    let n = remaining.min(upload_accept);
                    wr.write_all(format!("700 {}\r\n", n).as_bytes()).await.unwrap();
                    let mut buf = vec![0u8; n as usize];
                    rd.read_exact(&mut buf).await.unwrap();
                    uploaded.extend_from_slice(&buf);
                }
                "UCLS" => wr.write_all(b"200 queued\r\n").await.unwrap(),
                "QUIT" => {
                    wr.write_all(b"200 bye\r\n").await.unwrap();
                    break;
                }
                _ => wr.write_all(b"500 what?\r\n").await.unwrap(),
            }
        }
        (seen, uploaded)
    }

    #[tokio::test]
    async fn download_then_quit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(fake_peer(listener, 0));
        let notices = MemoryNotifier::new();
        let env = env(&notices, Duration::from_secs(5));
        let mut s = session(&env, "127.0.0.1", port);
        let (_trigger, shutdown) = shutdown_pair();

        drive(&mut s, &connector(), shutdown).await;

        let (seen, _) = peer.await.unwrap();
        assert_eq!(seen, vec!["NETP uncnsrd|s3cret", "NDOP", "READ 0|1500", "CLOS", "QUIT"]);
        let published: Vec<_> = std::fs::read_dir(&env.dirs.net_in).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(published.len(), 1);
        assert_eq!(std::fs::read(&published[0]).unwrap(), vec![b'm'; 1500]);
        assert_eq!(dir_len(&env.dirs.tmp), 0);
        assert!(notices.take().is_empty());
        assert!(!env.talking.is_talking("peer"));
        assert!(s.io().is_torn_down());
    }

    #[tokio::test]
    async fn upload_streams_spool_file_in_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(fake_peer(listener, 2048));
        let notices = MemoryNotifier::new();
        let env = env(&notices, Duration::from_secs(5));
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let out = env.dirs.outbound_path("peer");
        std::fs::write(&out, &payload).unwrap();
        let mut s = session(&env, "peer.test", port);
        let (_trigger, shutdown) = shutdown_pair();

        drive(&mut s, &connector(), shutdown).await;

        let (seen, uploaded) = peer.await.unwrap();
        assert_eq!(&seen[4..], ["NUOP", "WRIT 3000", "WRIT 952", "UCLS 1", "QUIT"]);
        assert_eq!(uploaded, payload);
        assert!(!out.exists());
        assert!(notices.take().is_empty());
    }

    #[tokio::test]
    async fn refused_connection_notifies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let notices = MemoryNotifier::new();
        let env = env(&notices, Duration::from_secs(5));
        let mut s = session(&env, "127.0.0.1", port);
        let (_trigger, shutdown) = shutdown_pair();

        drive(&mut s, &connector(), shutdown).await;

        let notices = notices.take();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].body.starts_with("failed to connect"));
        assert!(!env.talking.is_talking("peer"));
    }

    #[tokio::test]
    async fn unknown_host_notifies_lookup_failure() {
        let notices = MemoryNotifier::new();
        let env = env(&notices, Duration::from_secs(5));
        let mut s = session(&env, "nowhere.test", 504);
        let (_trigger, shutdown) = shutdown_pair();

        drive(&mut s, &connector(), shutdown).await;

        let notices = notices.take();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].body, "failed to look up nowhere.test");
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(sock);
        });
        let notices = MemoryNotifier::new();
        let env = env(&notices, Duration::from_millis(200));
        let mut s = session(&env, "127.0.0.1", port);
        let (_trigger, shutdown) = shutdown_pair();

        drive(&mut s, &connector(), shutdown).await;

        let notices = notices.take();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].body.starts_with("Timeout while talking to 127.0.0.1"));
        peer.abort();
    }

    #[tokio::test]
    async fn peer_close_is_reported_as_such() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = sock.into_split();
            let mut rd = BufReader::new(rd);
            wr.write_all(b"200 peer ready\r\n").await.unwrap();
            let mut line = String::new();
            rd.read_line(&mut line).await.unwrap();
        });
        let notices = MemoryNotifier::new();
        let env = env(&notices, Duration::from_secs(5));
        let mut s = session(&env, "127.0.0.1", port);
        let (_trigger, shutdown) = shutdown_pair();

        drive(&mut s, &connector(), shutdown).await;

        let notices = notices.take();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].body.starts_with("Connection closed by 127.0.0.1"));
    }

    #[tokio::test]
    async fn shutdown_mid_download_removes_temp_file() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = sock.into_split();
            let mut rd = BufReader::new(rd);
            wr.write_all(b"200 peer ready\r\n").await.unwrap();
            let mut line = String::new();
            for reply in ["200 ok\r\n", "226 100\r\n"] {
                line.clear();
                rd.read_line(&mut line).await.unwrap();
                wr.write_all(reply.as_bytes()).await.unwrap();
            }
            line.clear();
            rd.read_line(&mut line).await.unwrap();
            wr.write_all(b"600 100\r\n0123456789").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let notices = MemoryNotifier::new();
        let env = env(&notices, Duration::from_secs(5));
        let mut s = session(&env, "127.0.0.1", port);
        let (trigger, shutdown) = shutdown_pair();
        let tmp = env.dirs.tmp.clone();
        tokio::spawn(async move {
            while dir_len(&tmp) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.fire();
        });

        drive(&mut s, &connector(), shutdown).await;

        assert_eq!(dir_len(&env.dirs.tmp), 0);
        assert_eq!(dir_len(&env.dirs.net_in), 0);
        assert!(notices.take().is_empty());
        assert!(s.io().is_torn_down());
        peer.abort();
    }

    /// Counts callbacks and fails on re-entry.
    struct Recorder {
        io: IoContext,
        busy: bool,
        lines: Vec<String>,
        /// Failure callbacks: timeout, conn_fail, peer_closed.
        failures: usize,
        terminated: usize,
    }

    impl Recorder {
        fn new(port: u16) -> Self {
            Self {
                io: IoContext::new(9, PeerAddr::new("127.0.0.1", port), NextState::Connect, Duration::from_secs(5)),
                busy: false,
                lines: Vec::new(),
                failures: 0,
                terminated: 0,
            }
        }

        fn enter(&mut self) {
            assert!(!self.busy, "callback re-entered");
            self.busy = true;
        }
    }

    impl Protocol for Recorder {
        fn io(&mut self) -> &mut IoContext {
            &mut self.io
        }

        fn read_done(&mut self) -> NextState {
            self.enter();
            self.lines.push(self.io.line.clone());
            let rc = if self.lines.len() == 3 {
                NextState::Abort
            } else {
                NextState::ReadMore
            };
            self.busy = false;
            rc
        }

        fn send_done(&mut self) -> NextState {
            NextState::Abort
        }

        fn timeout(&mut self) -> NextState {
            self.failures += 1;
            NextState::Abort
        }

        fn conn_fail(&mut self) -> NextState {
            self.failures += 1;
            NextState::Abort
        }

        fn peer_closed(&mut self) -> NextState {
            self.failures += 1;
            NextState::Abort
        }

        fn terminate(&mut self) {
            self.enter();
            self.terminated += 1;
            self.io.release();
            self.busy = false;
        }

        fn shutdown_abort(&mut self) {}
    }

    #[tokio::test]
    async fn buffered_lines_are_delivered_one_callback_at_a_time() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"one\r\ntwo\nthree\r\nfour\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        let mut rec = Recorder::new(port);
        let (_trigger, shutdown) = shutdown_pair();

        drive(&mut rec, &connector(), shutdown).await;

        assert_eq!(rec.lines, ["one", "two", "three"]);
        assert_eq!(rec.terminated, 1);
    }

    #[test]
    fn teardown_runs_once() {
        let mut rec = Recorder::new(504);
        let mut conn = Conn::new();
        assert!(teardown(&mut rec, &mut conn));
        assert!(!teardown(&mut rec, &mut conn));
        assert_eq!(rec.terminated, 1);
        assert!(conn.stream.is_none());
    }

    #[test]
    fn read_error_only_tears_down() {
        let mut rec = Recorder::new(504);
        let mut conn = Conn::new();
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        finish(&mut rec, &mut conn, Stop::ReadError(err));
        assert_eq!(rec.failures, 0);
        assert_eq!(rec.terminated, 1);
        assert!(rec.io.is_torn_down());
    }

    #[test]
    fn write_error_counts_as_timeout() {
        let mut rec = Recorder::new(504);
        let mut conn = Conn::new();
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe");
        finish(&mut rec, &mut conn, Stop::WriteError(err));
        assert_eq!(rec.failures, 1);
        assert_eq!(rec.terminated, 1);
    }

    #[tokio::test]
    async fn reset_by_peer_raises_no_notice() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            // Zero linger turns the close into a reset.
            #[allow(deprecated)]
            let linger = sock.set_linger(Some(Duration::ZERO));
            linger.unwrap();
            drop(sock);
        });
        let mut rec = Recorder::new(port);
        let (_trigger, shutdown) = shutdown_pair();

        drive(&mut rec, &connector(), shutdown).await;
        peer.await.unwrap();

        assert!(rec.lines.is_empty());
        assert_eq!(rec.failures, 0);
        assert_eq!(rec.terminated, 1);
    }

    #[test]
    fn store_failure_keeps_temp_file() {
        let notices = MemoryNotifier::new();
        let env = env(&notices, Duration::from_secs(5));
        let mut s = session(&env, "127.0.0.1", 504);
        s.connected();
        for (line, expect) in [
            ("200 peer ready", "NETP uncnsrd|s3cret\n"),
            ("200 authenticated", "NDOP\n"),
            ("226 100", "READ 0|100\n"),
        ] {
            s.io().recv.push_bytes(format!("{}\r\n", line).as_bytes());
            assert!(handle_inbound(&mut s));
            assert_eq!(s.io().next_state, NextState::SendReply);
            assert_eq!(s.io().send.unconsumed(), expect.as_bytes());
            s.io().send.clear();
            s.io().next_state = NextState::ReadMessage;
        }
        s.io().recv.push_bytes(b"600 100\r\n");
        assert!(handle_inbound(&mut s));
        assert_eq!(s.io().next_state, NextState::ReadFile);

        if let Some(blob) = s.io().blob.as_mut() {
            blob.close();
        }
        s.io().recv.push_bytes(&[b'x'; 100]);
        assert!(handle_inbound(&mut s));
        assert_eq!(s.io().next_state, NextState::Abort);
        assert!(s.io().blob.is_none());

        finish(&mut s, &mut Conn::new(), Stop::Finished);
        assert!(s.io().is_torn_down());
        assert_eq!(dir_len(&env.dirs.tmp), 1);
        assert_eq!(dir_len(&env.dirs.net_in), 0);
        assert!(notices.take().is_empty());
    }
}
