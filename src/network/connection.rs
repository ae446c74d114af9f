//! A TCP session with one peer
//!
//! Each connection owns its socket and runs its own read loop. Every received
//! line is first matched against what the connection is waiting for (see
//! [`Outstanding`]); anything else is handled as a fresh request.
//!
//! Lifecycle: `Idle -> Connecting -> Handshaking -> Active -> Terminated`.
//! Both ends send an unsolicited `BC` right after connecting, and the peer's
//! reply tells us its bank code. A terminated connection may be started again;
//! it then redials its remote address and runs a fresh session.

use crate::metrics::MetricsSink;
use crate::network::codec::{LineCodec, MAX_LINE_LENGTH};
use crate::network::handler::{Outcome, RequestHandler};
use crate::network::message::{MessageKind, Request, Response};
use crate::network::outstanding::{Classified, Outstanding};
use crate::network::segment::normalize_ip;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Default time to wait for a line before giving up on a peer
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time to wait for an outbound connect
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("No line received within {0:?}")]
    Timeout(Duration),
    #[error("Connecting to {0} timed out")]
    DialTimeout(SocketAddr),
    #[error("Peer closed the connection")]
    Closed,
    #[error("Connection cancelled")]
    Cancelled,
    #[error("Connection already started")]
    AlreadyStarted,
    #[error("Connection already terminated")]
    AlreadyTerminated,
    #[error("Connection not established")]
    NotConnected,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Handshaking,
    Active,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Events a connection reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Relay `request` to `bank` on behalf of the connection at `origin`
    ProxyRequest {
        origin: SocketAddr,
        bank: Ipv4Addr,
        request: Request,
    },
    /// Deliver the reply to a relayed request back to `origin`
    ProxyResponse {
        origin: SocketAddr,
        response: Response,
    },
    /// The connection is closed; emitted exactly once per session
    Terminated { id: u64 },
}

/// Settings and collaborators shared by every connection
pub struct ConnectionContext {
    pub handler: RequestHandler,
    pub metrics: MetricsSink,
    pub read_timeout: Duration,
    pub dial_timeout: Duration,
}

impl ConnectionContext {
    pub fn new(handler: RequestHandler, metrics: MetricsSink) -> Self {
        Self {
            handler,
            metrics,
            read_timeout: DEFAULT_READ_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// Public view of a connection, for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub remote: SocketAddr,
    pub bank_code: Option<Ipv4Addr>,
    pub direction: Direction,
    pub state: ConnectionState,
    pub expected_responses: usize,
    pub pending_proxies: usize,
}

type LineReader = FramedRead<OwnedReadHalf, LineCodec>;
type LineWriter = FramedWrite<OwnedWriteHalf, LineCodec>;

/// Map an IPv4-mapped IPv6 peer address to plain IPv4
fn normalize_addr(addr: SocketAddr) -> SocketAddr {
    match normalize_ip(addr.ip()) {
        Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
        None => addr,
    }
}

fn split(stream: TcpStream) -> (LineReader, LineWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, LineCodec::new()),
        FramedWrite::new(write_half, LineCodec::new()),
    )
}

/// One session with one peer
pub struct Connection {
    id: u64,
    remote: SocketAddr,
    direction: Direction,
    bank_ip: OnceLock<Ipv4Addr>,
    state: RwLock<ConnectionState>,
    reader: Mutex<Option<LineReader>>,
    writer: Mutex<Option<LineWriter>>,
    outstanding: Mutex<Outstanding>,
    ctx: Arc<ConnectionContext>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    shutdown: CancellationToken,
    /// Cancels the current session; replaced on restart
    cancel: Mutex<CancellationToken>,
    terminated: AtomicBool,
}

impl Connection {
    fn build(
        id: u64,
        remote: SocketAddr,
        direction: Direction,
        stream: Option<TcpStream>,
        ctx: Arc<ConnectionContext>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        let (reader, writer) = match stream.map(split) {
            Some((reader, writer)) => (Some(reader), Some(writer)),
            None => (None, None),
        };
        Arc::new(Self {
            id,
            remote: normalize_addr(remote),
            direction,
            bank_ip: OnceLock::new(),
            state: RwLock::new(ConnectionState::Idle),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            outstanding: Mutex::new(Outstanding::new()),
            ctx,
            events,
            shutdown: shutdown.clone(),
            cancel: Mutex::new(shutdown.child_token()),
            terminated: AtomicBool::new(false),
        })
    }

    /// Wrap an already connected socket
    pub fn from_stream(
        id: u64,
        stream: TcpStream,
        direction: Direction,
        ctx: Arc<ConnectionContext>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        shutdown: &CancellationToken,
    ) -> Result<Arc<Self>, ConnectionError> {
        let remote = stream.peer_addr()?;
        Ok(Self::build(
            id,
            remote,
            direction,
            Some(stream),
            ctx,
            events,
            shutdown,
        ))
    }

    /// A connection to `remote` that dials when started
    pub fn to_peer(
        id: u64,
        remote: SocketAddr,
        ctx: Arc<ConnectionContext>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        Self::build(
            id,
            remote,
            Direction::Outbound,
            None,
            ctx,
            events,
            shutdown,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Real remote address; together with the port this identifies the peer
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bank code learned from the peer's BC reply
    pub fn bank_ip(&self) -> Option<Ipv4Addr> {
        self.bank_ip.get().copied()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn info(&self) -> ConnectionInfo {
        let (expected_responses, pending_proxies) = {
            let outstanding = self.outstanding.lock().await;
            (outstanding.total_expected(), outstanding.pending_proxies())
        };
        ConnectionInfo {
            id: self.id,
            remote: self.remote,
            bank_code: self.bank_ip(),
            direction: self.direction,
            state: self.state().await,
            expected_responses,
            pending_proxies,
        }
    }

    fn label(&self) -> String {
        match self.bank_ip() {
            Some(ip) => format!("{} ({})", ip, self.remote),
            None => self.remote.to_string(),
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn token(&self) -> CancellationToken {
        self.cancel.lock().await.clone()
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Owner of connection {} is gone", self.label());
        }
    }

    /// Connect if needed, send the BC handshake and spawn the read loop
    ///
    /// Valid from `Idle` and from `Terminated`. Restarting a terminated
    /// connection clears what it was waiting for and dials its remote again.
    pub async fn start(self: &Arc<Self>) -> Result<(), ConnectionError> {
        {
            let mut state = self.state.write().await;
            match *state {
                ConnectionState::Idle => {}
                ConnectionState::Terminated => {
                    if self.shutdown.is_cancelled() {
                        return Err(ConnectionError::Cancelled);
                    }
                    *self.cancel.lock().await = self.shutdown.child_token();
                    *self.outstanding.lock().await = Outstanding::new();
                    self.terminated.store(false, Ordering::SeqCst);
                    log::info!("Restarting connection with {}", self.label());
                }
                _ => return Err(ConnectionError::AlreadyStarted),
            }
            *state = ConnectionState::Connecting;
        }

        if let Err(e) = self.handshake().await {
            log::warn!("Failed to start connection with {}: {}", self.label(), e);
            self.terminate().await;
            return Err(e);
        }

        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.run().await });
        Ok(())
    }

    async fn handshake(&self) -> Result<(), ConnectionError> {
        if self.writer.lock().await.is_none() {
            self.dial().await?;
        }

        self.set_state(ConnectionState::Handshaking).await;
        self.outstanding.lock().await.expect_bank_code();
        self.write_line(Request::BankCode.encode()).await?;

        self.set_state(ConnectionState::Active).await;
        log::info!("Started communication with {}", self.label());
        Ok(())
    }

    async fn dial(&self) -> Result<(), ConnectionError> {
        log::debug!("Dialing {}", self.remote);
        let cancel = self.token().await;
        let connect = tokio::time::timeout(self.ctx.dial_timeout, TcpStream::connect(self.remote));
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
            connected = connect => match connected {
                Ok(result) => result?,
                Err(_) => return Err(ConnectionError::DialTimeout(self.remote)),
            },
        };

        let (reader, writer) = split(stream);
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        Ok(())
    }

    /// Stop the connection; its read loop terminates it
    pub async fn stop(&self) {
        self.token().await.cancel();
        if self.state().await == ConnectionState::Idle {
            self.terminate().await;
        }
    }

    async fn run(self: Arc<Self>) {
        let reader = self.reader.lock().await.take();
        let reason = match reader {
            Some(mut reader) => self.read_loop(&mut reader).await,
            None => ConnectionError::NotConnected,
        };

        match reason {
            ConnectionError::Timeout(timeout) => {
                log::info!("Timeout with {} expired after {:?}", self.label(), timeout)
            }
            ConnectionError::Closed => log::info!("Peer {} disconnected", self.label()),
            ConnectionError::Cancelled => log::debug!("Connection with {} cancelled", self.label()),
            e => log::error!("Connection with {} failed: {}", self.label(), e),
        }
        self.terminate().await;
    }

    async fn read_loop(&self, reader: &mut LineReader) -> ConnectionError {
        let cancel = self.token().await;
        loop {
            let line = match self.read_line(reader, &cancel).await {
                Ok(line) => line,
                Err(e) => return e,
            };
            let result = if reader.decoder_mut().take_oversized() > 0 {
                self.reject_oversized().await
            } else if line.is_empty() {
                continue;
            } else {
                self.process_line(&line).await
            };
            if let Err(e) = result {
                return e;
            }
        }
    }

    async fn read_line(
        &self,
        reader: &mut LineReader,
        cancel: &CancellationToken,
    ) -> Result<String, ConnectionError> {
        let timeout = self.ctx.read_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
            next = tokio::time::timeout(timeout, reader.next()) => match next {
                Err(_) => Err(ConnectionError::Timeout(timeout)),
                Ok(None) => Err(ConnectionError::Closed),
                Ok(Some(line)) => Ok(line?),
            },
        }
    }

    async fn process_line(&self, line: &str) -> Result<(), ConnectionError> {
        let local = {
            let mut outstanding = self.outstanding.lock().await;
            match outstanding.classify(line) {
                None => None,
                Some(Classified::Local(response)) => Some(response),
                Some(Classified::Proxied { origin, response }) => {
                    log::info!(
                        "Received response from {} to message proxied for {} - {}",
                        self.label(),
                        origin,
                        response
                    );
                    // Still under the lock: the registration is gone only
                    // once the reply is on its way.
                    self.emit(ConnectionEvent::ProxyResponse { origin, response });
                    return Ok(());
                }
            }
        };

        match local {
            Some(response) => {
                self.handle_response(response);
                Ok(())
            }
            None => self.handle_request(line).await,
        }
    }

    async fn reject_oversized(&self) -> Result<(), ConnectionError> {
        log::warn!("Dropped a line longer than {} bytes from {}", MAX_LINE_LENGTH, self.label());
        self.ctx.metrics.command(None, false, Duration::ZERO);
        let text = format!("Message longer than {} bytes", MAX_LINE_LENGTH);
        self.write_line(Response::error(text).encode()).await
    }

    /// Replies are never answered, whatever happens here
    fn handle_response(&self, response: Response) {
        log::info!("Received response from {} - {}", self.label(), response);
        match response {
            Response::BankCode { ip } => match self.bank_ip.set(ip) {
                Ok(()) => log::info!("Peer {} has bank code {}", self.remote, ip),
                Err(_) if self.bank_ip() == Some(ip) => {}
                Err(_) => log::warn!(
                    "Ignoring bank code {} from {}; already known",
                    ip,
                    self.label()
                ),
            },
            Response::Error { text } => {
                log::warn!("{} reported an error: {}", self.label(), text)
            }
            _ => {}
        }
    }

    async fn handle_request(&self, line: &str) -> Result<(), ConnectionError> {
        log::info!("Received message from {} - {}", self.label(), line);
        let started = Instant::now();
        let kind = MessageKind::of_line(line);

        match self.ctx.handler.dispatch(line) {
            Ok(Outcome::Reply(response)) => {
                self.ctx.metrics.command(kind, true, started.elapsed());
                self.write_line(response.encode()).await
            }
            Ok(Outcome::Proxy { bank, request }) => {
                self.ctx.metrics.command(kind, true, started.elapsed());
                self.ctx.metrics.proxy();
                log::info!("Proxying {} from {} to bank {}", request, self.label(), bank);
                self.emit(ConnectionEvent::ProxyRequest {
                    origin: self.remote,
                    bank,
                    request,
                });
                Ok(())
            }
            Err(e) => {
                self.ctx.metrics.command(kind, false, started.elapsed());
                log::warn!("Request from {} failed: {}", self.label(), e);
                self.write_line(Response::error(e.to_string()).encode())
                    .await
            }
        }
    }

    /// Send a request of our own; its reply is handled locally
    pub async fn send_request(&self, request: Request) -> Result<(), ConnectionError> {
        if self.is_terminated() {
            return Err(ConnectionError::AlreadyTerminated);
        }
        self.outstanding.lock().await.expect(request.kind());
        self.write_line(request.encode()).await
    }

    /// Relay a request for the connection at `origin`; the reply goes back there
    pub async fn proxy(&self, origin: SocketAddr, request: Request) -> Result<(), ConnectionError> {
        if self.is_terminated() {
            return Err(ConnectionError::AlreadyTerminated);
        }
        self.outstanding
            .lock()
            .await
            .register_proxy(origin, request.kind());
        self.write_line(request.encode()).await
    }

    /// Deliver a reply that was received on another connection
    pub async fn send_proxy_response(&self, response: Response) -> Result<(), ConnectionError> {
        if self.is_terminated() {
            return Err(ConnectionError::AlreadyTerminated);
        }
        self.write_line(response.encode()).await
    }

    async fn write_line(&self, line: String) -> Result<(), ConnectionError> {
        let cancel = self.token().await;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
        tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
            sent = writer.send(line.clone()) => sent?,
        }
        log::info!("Sent to {} - {}", self.label(), line);
        Ok(())
    }

    /// Runs once per session
    async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        // Held until the session is torn down, so a restart waits for it
        let mut state = self.state.write().await;
        self.token().await.cancel();

        // Dropping both halves closes the socket
        self.writer.lock().await.take();
        self.reader.lock().await.take();

        let abandoned = self.outstanding.lock().await.abandon();
        if !abandoned.is_empty() {
            log::warn!(
                "Abandoning {} proxied request(s) on {}",
                abandoned.len(),
                self.label()
            );
        }

        *state = ConnectionState::Terminated;
        drop(state);
        self.emit(ConnectionEvent::Terminated { id: self.id });
        log::info!("Terminated connection with {}", self.label());
    }
}
