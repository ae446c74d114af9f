//! Connection pool and proxy routing
//!
//! The manager owns every live [`Connection`], accepts inbound sockets, dials
//! banks on demand and routes relayed traffic between connections. Connections
//! talk back to it through [`ConnectionEvent`]s.

use crate::network::connection::{
    Connection, ConnectionContext, ConnectionError, ConnectionEvent, ConnectionInfo, Direction,
};
use crate::network::discovery::PortScanner;
use crate::network::message::{Request, Response};
use crate::network::server::Server;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Pool of live bank connections
pub struct ConnectionManager {
    ctx: Arc<ConnectionContext>,
    pool: Mutex<HashMap<u64, Arc<Connection>>>,
    active: AtomicUsize,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    scanner: PortScanner,
    /// Serializes discovery so concurrent relays to one bank share connections
    discovery: Mutex<()>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Create the manager and spawn its event loop
    pub fn new(ctx: Arc<ConnectionContext>, shutdown: CancellationToken) -> Arc<Self> {
        let scanner = PortScanner::new(ctx.dial_timeout);
        Self::with_scanner(ctx, scanner, shutdown)
    }

    pub fn with_scanner(
        ctx: Arc<ConnectionContext>,
        scanner: PortScanner,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            ctx,
            pool: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            events,
            scanner,
            discovery: Mutex::new(()),
            shutdown,
        });

        tokio::spawn(Self::event_loop(Arc::downgrade(&manager), rx));
        manager
    }

    async fn event_loop(weak: Weak<Self>, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(manager) = weak.upgrade() else {
                break;
            };
            match event {
                ConnectionEvent::Terminated { id } => manager.remove(id).await,
                ConnectionEvent::ProxyRequest {
                    origin,
                    bank,
                    request,
                } => {
                    tokio::spawn(async move { manager.proxy(origin, bank, request).await });
                }
                ConnectionEvent::ProxyResponse { origin, response } => {
                    tokio::spawn(async move { manager.proxy_response(origin, response).await });
                }
            }
        }
        log::debug!("Connection manager event loop stopped");
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of connections in the pool
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.pool.lock().await.values().cloned().collect()
    }

    pub async fn connections_info(&self) -> Vec<ConnectionInfo> {
        let mut infos = Vec::new();
        for conn in self.connections().await {
            infos.push(conn.info().await);
        }
        infos.sort_by_key(|info| info.id);
        infos
    }

    async fn add(&self, conn: Arc<Connection>) {
        let mut pool = self.pool.lock().await;
        if pool.insert(conn.id(), conn).is_none() {
            self.active.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn remove(&self, id: u64) {
        let mut pool = self.pool.lock().await;
        // Restarted since it reported its termination
        if pool.get(&id).is_some_and(|conn| !conn.is_terminated()) {
            return;
        }
        if let Some(conn) = pool.remove(&id) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            log::debug!(
                "Removed connection {} with {} ({} left)",
                id,
                conn.remote(),
                pool.len()
            );
        }
    }

    fn wrap(
        &self,
        stream: TcpStream,
        direction: Direction,
    ) -> Result<Arc<Connection>, ConnectionError> {
        Connection::from_stream(
            self.next_id(),
            stream,
            direction,
            self.ctx.clone(),
            self.events.clone(),
            &self.shutdown,
        )
    }

    /// Accept connections until shutdown, then stop every connection
    pub async fn run(self: Arc<Self>, server: Server) {
        log::info!("Accepting bank connections on port {}", server.port());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = server.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::info!("Incoming connection from {}", addr);
                        self.accept_stream(stream).await;
                    }
                    Err(e) => log::error!("Accept error: {}", e),
                },
            }
        }
        self.stop_all().await;
        log::info!("Stopped accepting connections");
    }

    async fn accept_stream(&self, stream: TcpStream) {
        let conn = match self.wrap(stream, Direction::Inbound) {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Failed to set up inbound connection: {}", e);
                return;
            }
        };
        self.add(conn.clone()).await;
        tokio::spawn(async move {
            if let Err(e) = conn.start().await {
                log::debug!("Inbound connection {} did not start: {}", conn.id(), e);
            }
        });
    }

    /// Dial a peer and start a connection with it
    pub async fn connect(&self, addr: SocketAddr) -> Result<Arc<Connection>, ConnectionError> {
        log::info!("Connecting to peer: {}", addr);
        let conn = Connection::to_peer(
            self.next_id(),
            addr,
            self.ctx.clone(),
            self.events.clone(),
            &self.shutdown,
        );
        self.add(conn.clone()).await;
        conn.start().await?;
        Ok(conn)
    }

    /// Start a terminated connection again and put it back in the pool
    pub async fn restart(&self, conn: &Arc<Connection>) -> Result<(), ConnectionError> {
        self.add(conn.clone()).await;
        conn.start().await
    }

    /// Live connections that lead to `bank`
    ///
    /// A connection counts once it reported `bank` as its bank code, or when
    /// it was dialed at `bank` and has not answered the handshake yet.
    async fn known(&self, bank: Ipv4Addr) -> Vec<Arc<Connection>> {
        let pool = self.pool.lock().await;
        pool.values()
            .filter(|conn| !conn.is_terminated())
            .filter(|conn| match conn.bank_ip() {
                Some(ip) => ip == bank,
                None => {
                    conn.direction() == Direction::Outbound
                        && conn.remote().ip() == IpAddr::V4(bank)
                }
            })
            .cloned()
            .collect()
    }

    /// Connections to `bank`, discovering it by port scan if none are known
    pub async fn get_or_connect(&self, bank: Ipv4Addr) -> Vec<Arc<Connection>> {
        let _discovery = self.discovery.lock().await;
        let known = self.known(bank).await;
        if !known.is_empty() {
            return known;
        }

        let mut found = Vec::new();
        for stream in self.scanner.scan(bank).await {
            let conn = match self.wrap(stream, Direction::Outbound) {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Failed to set up connection to bank {}: {}", bank, e);
                    continue;
                }
            };
            self.add(conn.clone()).await;
            match conn.start().await {
                Ok(()) => found.push(conn),
                Err(e) => log::warn!("Connection to {} failed to start: {}", conn.remote(), e),
            }
        }
        found
    }

    /// Relay `request` from the connection at `origin` to every connection to `bank`
    pub async fn proxy(&self, origin: SocketAddr, bank: Ipv4Addr, request: Request) {
        let targets = self.get_or_connect(bank).await;
        if targets.is_empty() {
            log::warn!(
                "Bank {} is unreachable; dropping {} from {}",
                bank,
                request,
                origin
            );
            return;
        }

        for target in targets {
            if let Err(e) = target.proxy(origin, request.clone()).await {
                log::warn!(
                    "Failed to relay {} to {}: {}",
                    request,
                    target.remote(),
                    e
                );
            }
        }
    }

    /// Deliver a relayed reply to the connection it was requested from
    pub async fn proxy_response(&self, origin: SocketAddr, response: Response) {
        let direct = {
            let pool = self.pool.lock().await;
            pool.values()
                .find(|conn| conn.remote() == origin && !conn.is_terminated())
                .cloned()
        };

        let targets = match (direct, origin.ip()) {
            (Some(conn), _) => vec![conn],
            (None, IpAddr::V4(ip)) => {
                log::info!("Connection with {} is gone; routing reply by address", origin);
                self.get_or_connect(ip).await
            }
            (None, IpAddr::V6(_)) => Vec::new(),
        };

        if targets.is_empty() {
            log::warn!("No route back to {}; dropping {}", origin, response);
        }
        for target in targets {
            if let Err(e) = target.send_proxy_response(response.clone()).await {
                log::warn!("Failed to deliver {} to {}: {}", response, target.remote(), e);
            }
        }
    }

    /// Stop every connection in the pool
    pub async fn stop_all(&self) {
        for conn in self.connections().await {
            conn.stop().await;
        }
    }
}
