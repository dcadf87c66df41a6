// ============================================
// File: crates/meshrelay-agent/src/config.rs
// ============================================
//! # Agent Configuration
//!
//! ## Creation Reason
//! Provides configuration management for a mesh agent, loaded from a
//! TOML file at startup.
//!
//! ## Main Functionality
//! - `AgentConfig`: Main configuration structure
//! - TOML file loading and parsing
//! - Configuration validation
//! - `RelaySettings`: the subset the relay core reads at runtime
//!
//! ## Configuration Sections
//! - `agent`: Identity file, display name
//! - `peers`: Listen address, static peers, link timers
//! - `exit`: Prefixes this agent exits
//! - `routing`: Flooding interval, route TTL, hop limit
//! - `limits`: Admission limits and buffer sizes
//! - `timeouts`: Dial, open, idle and write deadlines
//! - `ingress`: Static TCP port forwards
//! - `logging`: Log level and format
//!
//! ## Example Configuration
//! ```toml
//! [agent]
//! id_file = "/var/lib/meshrelay/agent_id.json"
//! display_name = "edge-1"
//!
//! [peers]
//! listen_addr = "0.0.0.0:7400"
//! connect = ["10.0.0.2:7400"]
//!
//! [exit]
//! prefixes = ["0.0.0.0/0"]
//!
//! [routing]
//! advertise_interval_secs = 30
//! route_ttl_secs = 90
//!
//! [[ingress.forwards]]
//! listen = "127.0.0.1:8080"
//! target = "example.com:80"
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - All config changes require an agent restart
//! - `route_ttl` must outlive `advertise_interval` or routes flap
//! - `max_hops` is capped by the `seen_by` wire limit
//!
//! ## Last Modified
//! v0.1.0 - Initial configuration implementation

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use meshrelay_common::Cidr;
use meshrelay_core::protocol::messages::MAX_SEEN_BY;
use meshrelay_core::protocol::{TargetAddr, DEFAULT_MAX_PAYLOAD_SIZE};
use meshrelay_core::crypto::SEAL_OVERHEAD;

use crate::error::{AgentError, Result};

/// Default peer listen port.
pub const DEFAULT_PEER_PORT: u16 = 7400;

// ============================================
// AgentConfig
// ============================================

/// Main agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Identity settings.
    #[serde(default)]
    pub agent: IdentityConfig,

    /// Peer link settings.
    #[serde(default)]
    pub peers: PeersConfig,

    /// Exit prefixes.
    #[serde(default)]
    pub exit: ExitConfig,

    /// Route flooding.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Deadlines.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Built-in ingress listeners.
    #[serde(default)]
    pub ingress: IngressConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        info!("Loading configuration from: {}", path_str);

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AgentError::config_load(&path_str, e.to_string()))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AgentError::config_load(&path_str, e.to_string()))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Loads configuration from a string.
    ///
    /// # Errors
    /// Returns error if the content cannot be parsed or validated.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AgentError::config_load("<string>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.peers.validate()?;
        self.routing.validate()?;
        self.limits.validate()?;
        self.timeouts.validate()?;
        self.ingress.validate()?;
        // A link reader may wait up to write_ms on a full queue; it must
        // still see the neighbor's keepalives in time.
        if self.timeouts.write_ms >= self.peers.peer_timeout_secs.saturating_mul(1000) {
            return Err(AgentError::config_invalid(
                "timeouts.write_ms",
                "must be shorter than peers.peer_timeout_secs",
            ));
        }
        Ok(())
    }

    /// Serializes configuration to a TOML string.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Runtime settings for the relay core.
    #[must_use]
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            display_name: self.agent.display_name.clone(),
            max_hops: self.routing.max_hops,
            route_ttl: Duration::from_secs(self.routing.route_ttl_secs),
            max_streams_total: self.limits.max_streams_total,
            max_streams_per_peer: self.limits.max_streams_per_peer,
            max_associations: self.limits.max_associations,
            max_frame_payload: self.limits.max_frame_payload,
            stream_buffer_frames: self.limits.stream_buffer_frames,
            peer_queue_frames: self.peers.outbound_queue_frames,
            handshake_timeout: self.peers.handshake_timeout(),
            keepalive_interval: self.peers.keepalive_interval(),
            peer_timeout: self.peers.peer_timeout(),
            connect_timeout: Duration::from_millis(self.timeouts.connect_ms),
            open_timeout: Duration::from_millis(self.timeouts.open_ms),
            idle_timeout: Duration::from_secs(self.timeouts.idle_secs),
            write_timeout: Duration::from_millis(self.timeouts.write_ms),
            udp_idle_timeout: Duration::from_secs(self.timeouts.udp_idle_secs),
        }
    }
}

// ============================================
// IdentityConfig
// ============================================

/// `[agent]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Path of the persisted identity file.
    #[serde(default = "default_id_file")]
    pub id_file: String,

    /// Name sent in `PEER_HELLO`.
    #[serde(default = "default_display_name")]
    pub display_name: String,
}

fn default_id_file() -> String {
    "meshrelay_id.json".to_string()
}

fn default_display_name() -> String {
    "meshrelay".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id_file: default_id_file(),
            display_name: default_display_name(),
        }
    }
}

// ============================================
// PeersConfig
// ============================================

/// `[peers]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersConfig {
    /// TCP address accepting peer links; `None` disables listening.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: Option<SocketAddr>,

    /// Peers dialed at startup.
    #[serde(default)]
    pub connect: Vec<SocketAddr>,

    /// Delay between redials of a lost static peer.
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,

    /// Interval between `KEEPALIVE` frames.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Silence after which a peer is declared lost.
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,

    /// Deadline for the `PEER_HELLO` exchange.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Frames buffered per peer before senders wait.
    #[serde(default = "default_outbound_queue_frames")]
    pub outbound_queue_frames: usize,
}

fn default_listen_addr() -> Option<SocketAddr> {
    Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PEER_PORT)))
}

fn default_reconnect_secs() -> u64 {
    5
}

fn default_keepalive_secs() -> u64 {
    10
}

fn default_peer_timeout_secs() -> u64 {
    35
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_outbound_queue_frames() -> usize {
    1024
}

impl PeersConfig {
    fn validate(&self) -> Result<()> {
        if self.listen_addr.is_some_and(|addr| addr.port() == 0) {
            return Err(AgentError::config_invalid(
                "peers.listen_addr",
                "port cannot be 0",
            ));
        }
        if self.keepalive_secs == 0 {
            return Err(AgentError::config_invalid(
                "peers.keepalive_secs",
                "must be greater than 0",
            ));
        }
        if self.peer_timeout_secs <= self.keepalive_secs {
            return Err(AgentError::config_invalid(
                "peers.peer_timeout_secs",
                "must exceed keepalive_secs",
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(AgentError::config_invalid(
                "peers.handshake_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.outbound_queue_frames == 0 {
            return Err(AgentError::config_invalid(
                "peers.outbound_queue_frames",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Keepalive interval.
    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Peer silence limit.
    #[must_use]
    pub const fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    /// Hello deadline.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Static peer redial delay.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect: Vec::new(),
            reconnect_secs: default_reconnect_secs(),
            keepalive_secs: default_keepalive_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            outbound_queue_frames: default_outbound_queue_frames(),
        }
    }
}

// ============================================
// ExitConfig
// ============================================

/// `[exit]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Prefixes this agent dials out to directly.
    #[serde(default)]
    pub prefixes: Vec<Cidr>,

    /// Local address for exit UDP sockets; dual-stack wildcard when unset.
    #[serde(default)]
    pub udp_bind: Option<SocketAddr>,
}

// ============================================
// RoutingConfig
// ============================================

/// `[routing]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Period of own-route advertisements.
    #[serde(default = "default_advertise_interval_secs")]
    pub advertise_interval_secs: u64,

    /// Lifetime of a learned route without refresh.
    #[serde(default = "default_route_ttl_secs")]
    pub route_ttl_secs: u64,

    /// Advertisements at this metric are not accepted.
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,

    /// Period of the expired-route and idle-stream sweep.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

fn default_advertise_interval_secs() -> u64 {
    30
}

fn default_route_ttl_secs() -> u64 {
    90
}

fn default_max_hops() -> u32 {
    16
}

fn default_reap_interval_secs() -> u64 {
    1
}

impl RoutingConfig {
    fn validate(&self) -> Result<()> {
        if self.advertise_interval_secs == 0 {
            return Err(AgentError::config_invalid(
                "routing.advertise_interval_secs",
                "must be greater than 0",
            ));
        }
        if self.route_ttl_secs <= self.advertise_interval_secs {
            return Err(AgentError::config_invalid(
                "routing.route_ttl_secs",
                "must exceed advertise_interval_secs",
            ));
        }
        #[allow(clippy::cast_possible_truncation)]
        if self.max_hops == 0 || self.max_hops >= MAX_SEEN_BY as u32 {
            return Err(AgentError::config_invalid(
                "routing.max_hops",
                format!("must be between 1 and {}", MAX_SEEN_BY - 1),
            ));
        }
        if self.reap_interval_secs == 0 {
            return Err(AgentError::config_invalid(
                "routing.reap_interval_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Advertisement period.
    #[must_use]
    pub const fn advertise_interval(&self) -> Duration {
        Duration::from_secs(self.advertise_interval_secs)
    }

    /// Sweep period.
    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            advertise_interval_secs: default_advertise_interval_secs(),
            route_ttl_secs: default_route_ttl_secs(),
            max_hops: default_max_hops(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

// ============================================
// LimitsConfig
// ============================================

/// `[limits]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Streams across all peers, every role.
    #[serde(default = "default_max_streams_total")]
    pub max_streams_total: usize,

    /// Streams opened by one neighbor.
    #[serde(default = "default_max_streams_per_peer")]
    pub max_streams_per_peer: usize,

    /// UDP associations across all peers.
    #[serde(default = "default_max_associations")]
    pub max_associations: usize,

    /// Largest frame payload accepted or sent.
    #[serde(default = "default_max_frame_payload")]
    pub max_frame_payload: usize,

    /// Frames buffered per stream toward its local endpoint.
    #[serde(default = "default_stream_buffer_frames")]
    pub stream_buffer_frames: usize,
}

fn default_max_streams_total() -> usize {
    4096
}

fn default_max_streams_per_peer() -> usize {
    1024
}

fn default_max_associations() -> usize {
    1024
}

fn default_max_frame_payload() -> usize {
    DEFAULT_MAX_PAYLOAD_SIZE
}

fn default_stream_buffer_frames() -> usize {
    64
}

impl LimitsConfig {
    fn validate(&self) -> Result<()> {
        if self.max_streams_total == 0 {
            return Err(AgentError::config_invalid(
                "limits.max_streams_total",
                "must be greater than 0",
            ));
        }
        if self.max_streams_per_peer == 0 {
            return Err(AgentError::config_invalid(
                "limits.max_streams_per_peer",
                "must be greater than 0",
            ));
        }
        if self.max_associations == 0 {
            return Err(AgentError::config_invalid(
                "limits.max_associations",
                "must be greater than 0",
            ));
        }
        if self.max_frame_payload <= SEAL_OVERHEAD + 512 {
            return Err(AgentError::config_invalid(
                "limits.max_frame_payload",
                format!("must exceed {} bytes", SEAL_OVERHEAD + 512),
            ));
        }
        if self.stream_buffer_frames == 0 {
            return Err(AgentError::config_invalid(
                "limits.stream_buffer_frames",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_streams_total: default_max_streams_total(),
            max_streams_per_peer: default_max_streams_per_peer(),
            max_associations: default_max_associations(),
            max_frame_payload: default_max_frame_payload(),
            stream_buffer_frames: default_stream_buffer_frames(),
        }
    }
}

// ============================================
// TimeoutsConfig
// ============================================

/// `[timeouts]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Outbound TCP connect at the exit.
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    /// Whole open exchange seen from the ingress.
    #[serde(default = "default_open_ms")]
    pub open_ms: u64,

    /// Stream inactivity limit.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,

    /// Wait for room in a full peer queue before resetting the stream
    /// that needed it.
    #[serde(default = "default_write_ms")]
    pub write_ms: u64,

    /// UDP association inactivity limit.
    #[serde(default = "default_udp_idle_secs")]
    pub udp_idle_secs: u64,
}

fn default_connect_ms() -> u64 {
    10_000
}

fn default_open_ms() -> u64 {
    15_000
}

fn default_idle_secs() -> u64 {
    300
}

fn default_write_ms() -> u64 {
    30_000
}

fn default_udp_idle_secs() -> u64 {
    60
}

impl TimeoutsConfig {
    fn validate(&self) -> Result<()> {
        let fields = [
            ("timeouts.connect_ms", self.connect_ms),
            ("timeouts.open_ms", self.open_ms),
            ("timeouts.idle_secs", self.idle_secs),
            ("timeouts.write_ms", self.write_ms),
            ("timeouts.udp_idle_secs", self.udp_idle_secs),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(AgentError::config_invalid(field, "must be greater than 0"));
            }
        }
        if self.open_ms < self.connect_ms {
            return Err(AgentError::config_invalid(
                "timeouts.open_ms",
                "must be at least connect_ms",
            ));
        }
        Ok(())
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            open_ms: default_open_ms(),
            idle_secs: default_idle_secs(),
            write_ms: default_write_ms(),
            udp_idle_secs: default_udp_idle_secs(),
        }
    }
}

// ============================================
// IngressConfig
// ============================================

/// `[ingress]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Static TCP port forwards.
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

/// One `[[ingress.forwards]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Local TCP listen address.
    pub listen: SocketAddr,
    /// Destination, `host:port`.
    pub target: String,
}

impl ForwardConfig {
    /// Parsed destination.
    ///
    /// # Errors
    /// `ConfigInvalid` for an unparsable target.
    pub fn target_addr(&self) -> Result<TargetAddr> {
        self.target
            .parse()
            .map_err(|e| AgentError::config_invalid("ingress.forwards.target", format!("{e}")))
    }
}

impl IngressConfig {
    fn validate(&self) -> Result<()> {
        for forward in &self.forwards {
            forward.target_addr()?;
        }
        Ok(())
    }
}

// ============================================
// LoggingConfig
// ============================================

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON output instead of human-readable lines.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============================================
// RelaySettings
// ============================================

/// Values the relay core consults while running.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Name sent in `PEER_HELLO`.
    pub display_name: String,
    /// Hop limit for accepted advertisements.
    pub max_hops: u32,
    /// Learned route lifetime.
    pub route_ttl: Duration,
    /// Streams across all peers.
    pub max_streams_total: usize,
    /// Streams opened by one neighbor.
    pub max_streams_per_peer: usize,
    /// UDP associations.
    pub max_associations: usize,
    /// Largest frame payload.
    pub max_frame_payload: usize,
    /// Per-stream endpoint buffer depth, also the receive window.
    pub stream_buffer_frames: usize,
    /// Per-peer outbound queue depth.
    pub peer_queue_frames: usize,
    /// `PEER_HELLO` exchange deadline.
    pub handshake_timeout: Duration,
    /// Period of `KEEPALIVE` frames.
    pub keepalive_interval: Duration,
    /// Silence after which a link is declared lost.
    pub peer_timeout: Duration,
    /// Exit-side dial deadline.
    pub connect_timeout: Duration,
    /// Ingress-side open deadline.
    pub open_timeout: Duration,
    /// Stream inactivity limit.
    pub idle_timeout: Duration,
    /// Full peer queue wait limit.
    pub write_timeout: Duration,
    /// Association inactivity limit.
    pub udp_idle_timeout: Duration,
}

impl RelaySettings {
    /// Plaintext bytes per `STREAM_DATA` frame.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.max_frame_payload.saturating_sub(SEAL_OVERHEAD).min(16 * 1024)
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        AgentConfig::default().relay_settings()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.peers.listen_addr,
            Some("0.0.0.0:7400".parse().unwrap())
        );
    }

    #[test]
    fn test_full_config_format() {
        let toml = r#"
            [agent]
            id_file = "/var/lib/meshrelay/id.json"
            display_name = "edge-1"

            [peers]
            listen_addr = "0.0.0.0:7500"
            connect = ["10.0.0.2:7400", "10.0.0.3:7400"]
            keepalive_secs = 5
            peer_timeout_secs = 20

            [exit]
            prefixes = ["0.0.0.0/0", "10.20.0.0/16"]

            [routing]
            advertise_interval_secs = 10
            route_ttl_secs = 30
            max_hops = 8

            [limits]
            max_streams_total = 100
            max_streams_per_peer = 10

            [timeouts]
            connect_ms = 2000
            open_ms = 4000
            write_ms = 10000

            [[ingress.forwards]]
            listen = "127.0.0.1:8080"
            target = "example.com:80"

            [logging]
            level = "debug"
            json = true
        "#;

        let config = AgentConfig::from_str(toml).unwrap();
        assert_eq!(config.agent.display_name, "edge-1");
        assert_eq!(config.peers.connect.len(), 2);
        assert_eq!(config.exit.prefixes[1], "10.20.0.0/16".parse().unwrap());
        assert_eq!(config.routing.max_hops, 8);
        assert_eq!(config.ingress.forwards.len(), 1);
        assert!(config.logging.json);

        let settings = config.relay_settings();
        assert_eq!(settings.max_streams_total, 100);
        assert_eq!(settings.route_ttl, Duration::from_secs(30));
        assert_eq!(settings.open_timeout, Duration::from_millis(4000));
    }

    #[test]
    fn test_rejects_short_route_ttl() {
        let toml = r"
            [routing]
            advertise_interval_secs = 30
            route_ttl_secs = 30
        ";
        let err = AgentConfig::from_str(toml).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_rejects_max_hops_over_wire_limit() {
        let mut config = AgentConfig::default();
        config.routing.max_hops = 64;
        assert!(config.validate().is_err());
        config.routing.max_hops = 63;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut config = AgentConfig::default();
        config.limits.max_streams_total = 0;
        assert!(matches!(
            config.validate(),
            Err(AgentError::ConfigInvalid { field, .. }) if field == "limits.max_streams_total"
        ));
    }

    #[test]
    fn test_write_timeout_must_undercut_peer_timeout() {
        let mut config = AgentConfig::default();
        config.timeouts.write_ms = config.peers.peer_timeout_secs * 1000;
        assert!(matches!(
            config.validate(),
            Err(AgentError::ConfigInvalid { field, .. }) if field == "timeouts.write_ms"
        ));
        config.timeouts.write_ms -= 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_forward_target() {
        let toml = r#"
            [[ingress.forwards]]
            listen = "127.0.0.1:8080"
            target = "no-port"
        "#;
        assert!(AgentConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_to_toml_round_trips() {
        let mut config = AgentConfig::default();
        config.exit.prefixes.push("10.0.0.0/8".parse().unwrap());
        let rendered = config.to_toml();
        let parsed = AgentConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.exit.prefixes, config.exit.prefixes);
        assert_eq!(parsed.peers.listen_addr, config.peers.listen_addr);
    }

    #[test]
    fn test_chunk_size_fits_frame() {
        let settings = RelaySettings::default();
        assert!(settings.chunk_size() + SEAL_OVERHEAD <= settings.max_frame_payload);
    }
}
