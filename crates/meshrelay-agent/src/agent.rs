// ============================================
// File: crates/meshrelay-agent/src/agent.rs
// ============================================
//! # Agent Orchestrator
//!
//! ## Creation Reason
//! Wires configuration, identity, route table, dispatcher and transport
//! into one running agent and owns its lifecycle.
//!
//! ## Main Functionality
//! - `Agent`: construction, peer attachment, background timers
//! - Peer listener and static peer dialers with reconnect
//! - Static TCP port forwards into the mesh
//! - Graceful shutdown
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Agent                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────────────┐ │
//! │  │ Peer listener│ │ Peer dialers │ │ Port forward servers │ │
//! │  └──────┬───────┘ └──────┬───────┘ └──────────┬───────────┘ │
//! │         │ attach_link    │                    │ open_stream │
//! │         ▼                ▼                    ▼             │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │                  RelayDispatcher                     │   │
//! │  │  RouteTable · StreamTable · AssociationTable · Peers │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │         ▲                         ▲                         │
//! │  ┌──────┴───────┐          ┌──────┴───────┐                 │
//! │  │  Advertiser  │          │   Sweeper    │                 │
//! │  └──────────────┘          └──────────────┘                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Exit prefixes are installed as local routes at construction and
//!   never expire
//! - Shutdown resets open streams before the links close, so neighbors
//!   hear about it
//! - Background tasks get 5 seconds to finish on shutdown
//!
//! ## Last Modified
//! v0.1.0 - Initial agent implementation

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use meshrelay_common::AgentId;
use meshrelay_core::protocol::TargetAddr;
use meshrelay_transport::{Dialer, PeerLink, TcpDialer, TcpPeerLink};

use crate::api::{ControlPlane, Ingress};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::handlers::{AgentStats, RelayDispatcher, StreamHandle, UdpAssociationHandle};
use crate::services::{PeerHandle, PeerRegistry, Route, RouteTable};

/// Time each background task gets to finish on shutdown.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================
// Agent
// ============================================

/// One mesh agent.
///
/// # Lifecycle
/// 1. Create with `Agent::new(config, id, dialer)` (or `with_tcp`)
/// 2. Start with `agent.run().await`
/// 3. Shutdown via Ctrl+C or [`Agent::shutdown`]
pub struct Agent {
    config: AgentConfig,
    id: AgentId,
    dispatcher: Arc<RelayDispatcher>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Agent {
    /// Creates an agent using `dialer` for exit connections.
    ///
    /// # Errors
    /// `ConfigInvalid` if the configuration fails validation.
    pub fn new(config: AgentConfig, id: AgentId, dialer: Arc<dyn Dialer>) -> Result<Self> {
        config.validate()?;

        let routes = Arc::new(RouteTable::new(id));
        for prefix in &config.exit.prefixes {
            routes.add_route(Route::local(*prefix, id))?;
            info!(prefix = %prefix, "Exit prefix installed");
        }

        let shutdown = CancellationToken::new();
        let dispatcher = RelayDispatcher::new(
            id,
            config.relay_settings(),
            routes,
            Arc::new(PeerRegistry::new()),
            dialer,
            shutdown.clone(),
        );

        Ok(Self {
            config,
            id,
            dispatcher,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Creates an agent that dials real TCP and binds real UDP sockets.
    ///
    /// # Errors
    /// As for [`Agent::new`].
    pub fn with_tcp(config: AgentConfig, id: AgentId) -> Result<Self> {
        let mut dialer = TcpDialer::new();
        if let Some(addr) = config.exit.udp_bind {
            dialer = dialer.with_udp_bind(addr);
        }
        Self::new(config, id, Arc::new(dialer))
    }

    /// This agent's id.
    #[must_use]
    pub const fn id(&self) -> AgentId {
        self.id
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Shared relay state.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<RelayDispatcher> {
        &self.dispatcher
    }

    /// Attaches an already connected link.
    ///
    /// # Errors
    /// See [`RelayDispatcher::attach_link`].
    pub async fn attach_peer(&self, link: Arc<dyn PeerLink>) -> Result<Arc<PeerHandle>> {
        self.dispatcher.attach_link(link).await
    }

    /// Opens a stream into the mesh.
    ///
    /// # Errors
    /// See [`RelayDispatcher::open_stream`].
    pub async fn open_stream(&self, target: TargetAddr) -> Result<StreamHandle> {
        self.dispatcher.open_stream(target).await
    }

    /// Opens a UDP association into the mesh.
    ///
    /// # Errors
    /// See [`RelayDispatcher::open_udp`].
    pub async fn open_udp(&self, hint: Option<TargetAddr>) -> Result<UdpAssociationHandle> {
        self.dispatcher.open_udp(hint).await
    }

    // ========================================
    // Run
    // ========================================

    /// Runs the agent until Ctrl+C or [`Agent::shutdown`].
    ///
    /// # Errors
    /// `StartupFailed` if a listener cannot be bound.
    pub async fn run(&self) -> Result<()> {
        info!(
            agent_id = %self.id,
            name = %self.config.agent.display_name,
            "Starting MeshRelay agent v{}",
            env!("CARGO_PKG_VERSION")
        );

        self.spawn_background_tasks();

        if let Some(addr) = self.config.peers.listen_addr {
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                AgentError::startup_failed(format!("peer listener on {addr}: {e}"))
            })?;
            info!("Accepting peer links on {}", addr);
            let dispatcher = Arc::clone(&self.dispatcher);
            self.track("peer-listener", tokio::spawn(run_peer_listener(dispatcher, listener)));
        }

        for &addr in &self.config.peers.connect {
            let dispatcher = Arc::clone(&self.dispatcher);
            let delay = self.config.peers.reconnect_delay();
            self.track(
                format!("peer-dialer {addr}"),
                tokio::spawn(maintain_peer(dispatcher, addr, delay)),
            );
        }

        for forward in &self.config.ingress.forwards {
            let target = forward.target_addr()?;
            let listener = TcpListener::bind(forward.listen).await.map_err(|e| {
                AgentError::startup_failed(format!("forward listener on {}: {e}", forward.listen))
            })?;
            info!("Forwarding {} → {}", forward.listen, target);
            self.spawn_forward(listener, target);
        }

        info!(
            exit_prefixes = self.config.exit.prefixes.len(),
            static_peers = self.config.peers.connect.len(),
            forwards = self.config.ingress.forwards.len(),
            "Agent started"
        );

        self.wait_for_shutdown().await;
        self.shutdown().await;
        Ok(())
    }

    /// Starts the advertiser and the sweeper.
    pub fn spawn_background_tasks(&self) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let interval = self.config.routing.advertise_interval();
        self.track(
            "advertiser",
            tokio::spawn(async move {
                let shutdown = dispatcher.shutdown_token().clone();
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            dispatcher.advertise_now();
                        }
                        () = dispatcher.advertise_requested() => {
                            dispatcher.advertise_now();
                        }
                    }
                }
                debug!("Advertiser task exiting");
            }),
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        let interval = self.config.routing.reap_interval();
        self.track(
            "sweeper",
            tokio::spawn(async move {
                let shutdown = dispatcher.shutdown_token().clone();
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            dispatcher.sweep(Instant::now()).await;
                            debug!(stats = ?dispatcher.stats(), "Sweep cycle complete");
                        }
                    }
                }
                debug!("Sweeper task exiting");
            }),
        );
    }

    /// Serves a static port forward: every connection accepted on
    /// `listener` becomes a stream to `target`.
    pub fn spawn_forward(&self, listener: TcpListener, target: TargetAddr) {
        let name = format!("forward {target}");
        let dispatcher = Arc::clone(&self.dispatcher);
        self.track(name, tokio::spawn(run_forward(dispatcher, listener, target)));
    }

    fn track(&self, name: impl Into<String>, task: JoinHandle<()>) {
        self.tasks.lock().push((name.into(), task));
    }

    async fn wait_for_shutdown(&self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    self.shutdown.cancelled().await;
                }
            },
            () = self.shutdown.cancelled() => {}
        }
    }

    /// Resets open streams, closes links and waits for background tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down agent...");
        self.dispatcher.close_all().await;
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, task) in tasks {
            match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!("Task '{}' completed", name),
                Ok(Err(e)) => warn!("Task '{}' failed: {}", name, e),
                Err(_) => warn!("Task '{}' timed out during shutdown", name),
            }
        }
        info!("Agent shutdown complete");
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("listen_addr", &self.config.peers.listen_addr)
            .field("exit_prefixes", &self.config.exit.prefixes)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Ingress for Agent {
    async fn open_stream(&self, target: TargetAddr) -> Result<StreamHandle> {
        Agent::open_stream(self, target).await
    }

    async fn open_udp(&self, hint: Option<TargetAddr>) -> Result<UdpAssociationHandle> {
        Agent::open_udp(self, hint).await
    }
}

impl ControlPlane for Agent {
    fn trigger_advertise(&self) {
        self.dispatcher.trigger_advertise();
    }

    fn stats(&self) -> AgentStats {
        self.dispatcher.stats()
    }

    fn route_snapshot(&self) -> Vec<Route> {
        RelayDispatcher::route_snapshot(&self.dispatcher)
    }
}

// ============================================
// Network Tasks
// ============================================

async fn run_peer_listener(dispatcher: Arc<RelayDispatcher>, listener: TcpListener) {
    let shutdown = dispatcher.shutdown_token().clone();
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Peer accept failed: {}", e);
                continue;
            }
        };
        let link = match TcpPeerLink::new(stream, dispatcher.codec()) {
            Ok(link) => link,
            Err(e) => {
                warn!(remote = %remote, error = %e, "Failed to set up peer link");
                continue;
            }
        };
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.attach_link(Arc::new(link)).await {
                warn!(remote = %remote, error = %e, "Inbound peer rejected");
            }
        });
    }
    debug!("Peer listener exiting");
}

/// Keeps a link to a static peer up, redialing after `delay`.
async fn maintain_peer(dispatcher: Arc<RelayDispatcher>, addr: SocketAddr, delay: Duration) {
    let shutdown = dispatcher.shutdown_token().clone();
    loop {
        let connect_timeout = dispatcher.settings().connect_timeout;
        match TcpPeerLink::connect(addr, dispatcher.codec(), connect_timeout).await {
            Ok(link) => match dispatcher.attach_link(Arc::new(link)).await {
                Ok(peer) => {
                    info!(addr = %addr, peer = %peer.id(), "Connected to static peer");
                    peer.cancel_token().cancelled().await;
                }
                Err(AgentError::PeerExists(id)) => {
                    debug!(addr = %addr, peer = %id, "Static peer already attached");
                }
                Err(e) => warn!(addr = %addr, error = %e, "Static peer handshake failed"),
            },
            Err(e) => debug!(addr = %addr, error = %e, "Static peer unreachable"),
        }

        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
    debug!(addr = %addr, "Peer dialer exiting");
}

async fn run_forward(dispatcher: Arc<RelayDispatcher>, listener: TcpListener, target: TargetAddr) {
    let shutdown = dispatcher.shutdown_token().clone();
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (mut client, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(target = %target, "Forward accept failed: {}", e);
                continue;
            }
        };
        let dispatcher = Arc::clone(&dispatcher);
        let target = target.clone();
        tokio::spawn(async move {
            let mut stream = match dispatcher.open_stream(target.clone()).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(client = %remote, target = %target, error = %e, "Forward open failed");
                    return;
                }
            };
            match tokio::io::copy_bidirectional(&mut client, &mut stream).await {
                Ok((up, down)) => debug!(
                    client = %remote,
                    target = %target,
                    up,
                    down,
                    "Forward connection finished"
                ),
                Err(e) => debug!(client = %remote, target = %target, error = %e, "Forward connection ended"),
            }
        });
    }
    debug!(target = %target, "Forward server exiting");
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use meshrelay_core::protocol::ErrorCode;
    use meshrelay_transport::{MemoryLink, MockDialer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn agent(prefixes: &[&str]) -> (Agent, Arc<MockDialer>) {
        agent_with(prefixes, |_| {})
    }

    fn agent_with(prefixes: &[&str], tweak: impl FnOnce(&mut AgentConfig)) -> (Agent, Arc<MockDialer>) {
        let mut config = AgentConfig::default();
        config.peers.listen_addr = None;
        config.exit.prefixes = prefixes.iter().map(|p| p.parse().unwrap()).collect();
        tweak(&mut config);
        let dialer = Arc::new(MockDialer::new());
        let agent = Agent::new(config, AgentId::generate(), Arc::clone(&dialer) as Arc<dyn Dialer>).unwrap();
        (agent, dialer)
    }

    async fn connect(a: &Agent, b: &Agent) -> (Arc<dyn PeerLink>, Arc<dyn PeerLink>) {
        let (la, lb) = MemoryLink::pair(a.id().short(), b.id().short(), 256);
        let la: Arc<dyn PeerLink> = Arc::new(la);
        let lb: Arc<dyn PeerLink> = Arc::new(lb);
        let (ra, rb) = tokio::join!(a.attach_peer(Arc::clone(&la)), b.attach_peer(Arc::clone(&lb)));
        ra.unwrap();
        rb.unwrap();
        (la, lb)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn has_route(agent: &Agent, ip: &str) -> bool {
        agent.dispatcher().routes().lookup(ip.parse().unwrap()).is_some()
    }

    /// A (exit 0/0) ── B ── C
    async fn chain() -> (Agent, Agent, Agent, Arc<MockDialer>) {
        let (a, dialer) = agent(&["0.0.0.0/0"]);
        let (b, _) = agent(&[]);
        let (c, _) = agent(&[]);
        connect(&a, &b).await;
        connect(&b, &c).await;
        a.dispatcher().advertise_now();
        wait_until(|| has_route(&c, "1.2.3.4")).await;
        (a, b, c, dialer)
    }

    #[tokio::test]
    async fn test_routes_flood_along_chain() {
        let (a, b, c, _) = chain().await;

        let at_b = b.dispatcher().routes().lookup("1.2.3.4".parse().unwrap()).unwrap();
        assert_eq!(at_b.next_hop, a.id());
        assert_eq!(at_b.metric, 1);

        let at_c = c.dispatcher().routes().lookup("1.2.3.4".parse().unwrap()).unwrap();
        assert_eq!(at_c.next_hop, b.id());
        assert_eq!(at_c.metric, 2);
        assert_eq!(at_c.origin, a.id());
        assert_eq!(at_c.seen_by, vec![a.id(), b.id(), c.id()]);
    }

    #[tokio::test]
    async fn test_stream_through_two_hops() {
        let (a, b, c, dialer) = chain().await;

        let mut handle = c.open_stream("1.2.3.4:80".parse().unwrap()).await.unwrap();
        let mut accepted = dialer.next_accepted().await.unwrap();
        assert_eq!(accepted.target, "1.2.3.4:80".parse().unwrap());
        assert_eq!(b.stats().streams, 1);

        handle.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let mut request = [0u8; 18];
        accepted.remote.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"GET / HTTP/1.0\r\n\r\n");

        accepted.remote.write_all(b"HTTP/1.0 200 OK").await.unwrap();
        let mut response = [0u8; 15];
        handle.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"HTTP/1.0 200 OK");

        // Half-close from the ingress, then the destination finishes.
        handle.shutdown().await.unwrap();
        let mut rest = Vec::new();
        accepted.remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(accepted);

        let mut tail = Vec::new();
        handle.read_to_end(&mut tail).await.unwrap();
        assert!(tail.is_empty());

        wait_until(|| a.stats().streams == 0 && b.stats().streams == 0 && c.stats().streams == 0)
            .await;
    }

    #[tokio::test]
    async fn test_large_transfer_is_chunked() {
        let (_a, _b, c, dialer) = chain().await;
        let mut handle = c.open_stream("1.2.3.4:80".parse().unwrap()).await.unwrap();
        let mut accepted = dialer.next_accepted().await.unwrap();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            handle.write_all(&payload).await.unwrap();
            handle
        });

        let mut received = vec![0u8; expected.len()];
        accepted.remote.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_over_slow_link() {
        use meshrelay_transport::{FaultConfig, FaultyLink};

        let (a, dialer) = agent(&["0.0.0.0/0"]);
        let (c, _) = agent(&[]);
        let (la, lc) = MemoryLink::pair("a", "c", 256);
        let slow = FaultConfig::none()
            .with_latency(Duration::from_millis(1), Duration::from_millis(5));
        let la: Arc<dyn PeerLink> = Arc::new(FaultyLink::new(Arc::new(la), slow));
        let lc: Arc<dyn PeerLink> = Arc::new(FaultyLink::new(Arc::new(lc), slow));
        let (ra, rc) = tokio::join!(a.attach_peer(la), c.attach_peer(lc));
        ra.unwrap();
        rc.unwrap();
        wait_until(|| has_route(&c, "1.2.3.4")).await;

        let mut handle = c.open_stream("1.2.3.4:80".parse().unwrap()).await.unwrap();
        let mut accepted = dialer.next_accepted().await.unwrap();
        for chunk in [&b"one "[..], b"two ", b"three"] {
            handle.write_all(chunk).await.unwrap();
        }
        let mut received = [0u8; 13];
        accepted.remote.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"one two three");
    }

    #[tokio::test]
    async fn test_stalled_destination_does_not_block_link() {
        let (a, dialer) = agent_with(&["0.0.0.0/0"], |config| {
            config.limits.stream_buffer_frames = 2;
        });
        let (c, _) = agent(&[]);
        connect(&a, &c).await;
        wait_until(|| has_route(&c, "1.2.3.4")).await;

        // The first destination never reads.
        let mut stalled = c.open_stream("1.2.3.4:80".parse().unwrap()).await.unwrap();
        let _stalled_remote = dialer.next_accepted().await.unwrap();
        let filler = tokio::spawn(async move {
            let block = vec![0u8; 1024 * 1024];
            let _ = stalled.write_all(&block).await;
            stalled
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut healthy = tokio::time::timeout(
            Duration::from_secs(2),
            c.open_stream("1.2.3.5:80".parse().unwrap()),
        )
        .await
        .unwrap()
        .unwrap();
        let mut remote = dialer.next_accepted().await.unwrap();
        healthy.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), remote.remote.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");

        remote.remote.write_all(b"pong").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), healthy.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"pong");

        assert_eq!(a.stats().peers, 1);
        assert_eq!(c.stats().peers, 1);
        assert_eq!(a.stats().streams, 2);
        filler.abort();
    }

    #[tokio::test]
    async fn test_exit_stream_limit() {
        let (a, dialer) = agent_with(&["0.0.0.0/0"], |config| config.limits.max_streams_total = 1);
        let (c, _) = agent(&[]);
        connect(&a, &c).await;
        wait_until(|| has_route(&c, "1.2.3.4")).await;

        let _first = c.open_stream("1.2.3.4:80".parse().unwrap()).await.unwrap();
        let _accepted = dialer.next_accepted().await.unwrap();

        let err = c.open_stream("1.2.3.4:81".parse().unwrap()).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ResourceLimit);
        wait_until(|| c.stats().streams == 1 && a.stats().streams == 1).await;
    }

    #[tokio::test]
    async fn test_open_refused_by_destination() {
        let (_a, _b, c, dialer) = chain().await;
        dialer.push_outcome(meshrelay_transport::DialOutcome::Refuse);

        let err = c.open_stream("1.2.3.4:80".parse().unwrap()).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Refused);
        wait_until(|| c.stats().streams == 0).await;
    }

    #[tokio::test]
    async fn test_peer_loss_resets_streams_and_withdraws_routes() {
        let (a, dialer) = agent(&["0.0.0.0/0"]);
        let (b, _) = agent(&[]);
        let (c, _) = agent(&[]);
        let (link_ab, _) = connect(&a, &b).await;
        connect(&b, &c).await;
        a.dispatcher().advertise_now();
        wait_until(|| has_route(&c, "1.2.3.4")).await;

        let mut handle = c.open_stream("1.2.3.4:80".parse().unwrap()).await.unwrap();
        let _accepted = dialer.next_accepted().await.unwrap();

        link_ab.close().await.unwrap();

        wait_until(|| b.stats().peers == 1 && !has_route(&b, "1.2.3.4")).await;
        wait_until(|| c.stats().streams == 0 && a.stats().streams == 0).await;

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(2), handle.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_longest_prefix_selects_exit() {
        let (a, dialer_a) = agent(&["10.0.0.0/8"]);
        let (b, dialer_b) = agent(&["10.1.0.0/16"]);
        let (c, _) = agent(&[]);
        connect(&a, &c).await;
        connect(&b, &c).await;
        wait_until(|| c.stats().routes == 2).await;

        let _near = c.open_stream("10.1.2.3:22".parse().unwrap()).await.unwrap();
        assert_eq!(dialer_b.next_accepted().await.unwrap().target, "10.1.2.3:22".parse().unwrap());

        let _far = c.open_stream("10.2.0.1:22".parse().unwrap()).await.unwrap();
        assert_eq!(dialer_a.next_accepted().await.unwrap().target, "10.2.0.1:22".parse().unwrap());

        let err = c.open_stream("192.168.1.1:22".parse().unwrap()).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::NoRoute);
    }

    #[tokio::test]
    async fn test_loop_does_not_pollute_tables() {
        let (a, _) = agent(&["10.0.0.0/8"]);
        let (b, _) = agent(&[]);
        let (c, _) = agent(&[]);
        connect(&a, &b).await;
        connect(&b, &c).await;
        connect(&c, &a).await;
        a.dispatcher().advertise_now();
        wait_until(|| has_route(&b, "10.0.0.1") && has_route(&c, "10.0.0.1")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(a.route_snapshot().iter().all(Route::is_local));
        let at_b = b.dispatcher().routes().lookup("10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(at_b.next_hop, a.id());
        assert_eq!(at_b.metric, 1);
        let at_c = c.dispatcher().routes().lookup("10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(at_c.next_hop, a.id());
        assert_eq!(at_c.metric, 1);
    }

    #[tokio::test]
    async fn test_learned_routes_expire_without_refresh() {
        let (a, _) = agent(&["10.0.0.0/8"]);
        let (b, _) = agent(&[]);
        connect(&a, &b).await;
        wait_until(|| has_route(&b, "10.0.0.1")).await;

        b.dispatcher()
            .sweep(Instant::now() + Duration::from_secs(3600))
            .await;
        assert!(!has_route(&b, "10.0.0.1"));
        // Own exits never expire.
        a.dispatcher()
            .sweep(Instant::now() + Duration::from_secs(3600))
            .await;
        assert!(has_route(&a, "10.0.0.1"));
    }

    #[tokio::test]
    async fn test_udp_through_mesh() {
        let (_a, _b, c, dialer) = chain().await;

        let mut handle = c.open_udp(None).await.unwrap();
        let socket = dialer.next_socket().await.unwrap();

        let dns: TargetAddr = "8.8.8.8:53".parse().unwrap();
        handle.send_to(b"query", &dns).await.unwrap();
        let sent = socket.next_sent().await.unwrap();
        assert_eq!(sent.target, dns);
        assert_eq!(sent.payload, b"query");

        let source: SocketAddr = "8.8.8.8:53".parse().unwrap();
        socket.inject(&b"answer"[..], source);
        let received = tokio::time::timeout(Duration::from_secs(2), handle.recv_from())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received.payload[..], b"answer");
        assert_eq!(received.from, TargetAddr::from(source));

        handle.close().await;
        wait_until(|| c.stats().associations == 0).await;
    }

    #[tokio::test]
    async fn test_udp_to_exit_without_default_route() {
        let (a, dialer) = agent(&["10.0.0.0/8"]);
        let (b, _) = agent(&[]);
        let (c, _) = agent(&[]);
        connect(&a, &b).await;
        connect(&b, &c).await;
        a.dispatcher().advertise_now();
        wait_until(|| has_route(&c, "10.1.2.3")).await;

        let target: TargetAddr = "10.1.2.3:53".parse().unwrap();
        let mut handle = c.open_udp(Some(target.clone())).await.unwrap();
        let socket = dialer.next_socket().await.unwrap();
        assert_eq!(b.stats().associations, 1);

        handle.send_to(b"query", &target).await.unwrap();
        let sent = socket.next_sent().await.unwrap();
        assert_eq!(sent.target, target);

        let err = c
            .open_udp(Some("192.0.2.1:53".parse().unwrap()))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::NoRoute);
    }

    #[tokio::test]
    async fn test_port_forward() {
        let (a, dialer) = agent(&["0.0.0.0/0"]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        a.spawn_forward(listener, "1.2.3.4:80".parse().unwrap());

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hi").await.unwrap();

        let mut accepted = dialer.next_accepted().await.unwrap();
        let mut buf = [0u8; 2];
        accepted.remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        accepted.remote.write_all(b"yo").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"yo");
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let (a, _) = agent(&["0.0.0.0/0"]);
        a.spawn_background_tasks();
        a.trigger_advertise();
        a.shutdown().await;

        let err = a.open_stream("1.2.3.4:80".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, AgentError::ShuttingDown));
    }
}
