// ============================================
// File: crates/meshrelay-transport/src/fault.rs
// ============================================
//! # Fault Injection Decorators
//!
//! ## Creation Reason
//! Chaos testing without touching relay code: wrap any `PeerLink` or
//! `Dialer` and inject latency, errors and disconnects at configurable
//! probabilities.
//!
//! ## Main Functionality
//! - `FaultConfig`: latency window plus error/disconnect probabilities
//! - `FaultyLink`: `PeerLink` decorator
//! - `FaultyDialer`: `Dialer` decorator
//! - `FaultStats`: how many faults actually fired
//!
//! ## ⚠️ Important Note for Next Developer
//! - Decorators only; the relay never checks whether it is wrapped
//! - A fired disconnect closes the inner link for real
//!
//! ## Last Modified
//! v0.1.0 - Initial fault injection

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tracing::debug;

use meshrelay_core::protocol::TargetAddr;

use crate::error::{Result, TransportError};
use crate::traits::{DatagramSocket, DialedStream, Dialer, PeerLink};

// ============================================
// FaultConfig
// ============================================

/// Fault probabilities and latency window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultConfig {
    /// Minimum added latency per operation.
    pub min_latency: Duration,
    /// Maximum added latency per operation.
    pub max_latency: Duration,
    /// Probability (0.0..=1.0) that an operation fails.
    pub error_probability: f64,
    /// Probability (0.0..=1.0) that an operation tears the link down.
    pub disconnect_probability: f64,
}

impl FaultConfig {
    /// No faults at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            error_probability: 0.0,
            disconnect_probability: 0.0,
        }
    }

    /// Sets a latency window; bounds are swapped if given reversed.
    #[must_use]
    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.min_latency = min.min(max);
        self.max_latency = min.max(max);
        self
    }

    /// Sets the error probability, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_error_probability(mut self, p: f64) -> Self {
        self.error_probability = p.clamp(0.0, 1.0);
        self
    }

    /// Sets the disconnect probability, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_disconnect_probability(mut self, p: f64) -> Self {
        self.disconnect_probability = p.clamp(0.0, 1.0);
        self
    }

    fn roll(&self) -> Roll {
        let mut rng = rand::thread_rng();
        let latency = if self.max_latency > self.min_latency {
            rng.gen_range(self.min_latency..=self.max_latency)
        } else {
            self.min_latency
        };
        Roll {
            latency,
            disconnect: rng.gen::<f64>() < self.disconnect_probability,
            error: rng.gen::<f64>() < self.error_probability,
        }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::none()
    }
}

struct Roll {
    latency: Duration,
    disconnect: bool,
    error: bool,
}

/// Counters of fired faults.
#[derive(Debug, Default)]
pub struct FaultStats {
    /// Injected errors
    pub errors: AtomicU64,
    /// Injected disconnects
    pub disconnects: AtomicU64,
}

impl FaultStats {
    /// Total faults fired.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.errors.load(Ordering::Relaxed) + self.disconnects.load(Ordering::Relaxed)
    }
}

async fn delay(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

// ============================================
// FaultyLink
// ============================================

/// `PeerLink` decorator injecting faults.
pub struct FaultyLink {
    inner: Arc<dyn PeerLink>,
    config: FaultConfig,
    stats: Arc<FaultStats>,
}

impl FaultyLink {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn PeerLink>, config: FaultConfig) -> Self {
        Self {
            inner,
            config,
            stats: Arc::new(FaultStats::default()),
        }
    }

    /// Fault counters.
    #[must_use]
    pub fn stats(&self) -> Arc<FaultStats> {
        Arc::clone(&self.stats)
    }

    async fn disconnect(&self) {
        self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
        debug!(link = %self.inner.remote_label(), "Injecting disconnect");
        let _ = self.inner.close().await;
    }
}

#[async_trait]
impl PeerLink for FaultyLink {
    async fn send(&self, frame: Bytes) -> Result<()> {
        let roll = self.config.roll();
        delay(roll.latency).await;
        if roll.disconnect {
            self.disconnect().await;
            return Err(TransportError::LinkClosed);
        }
        if roll.error {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::injected("peer link send"));
        }
        self.inner.send(frame).await
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        let frame = self.inner.recv().await?;
        let roll = self.config.roll();
        delay(roll.latency).await;
        if roll.disconnect {
            self.disconnect().await;
            return Ok(None);
        }
        Ok(frame)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    fn remote_label(&self) -> String {
        format!("faulty+{}", self.inner.remote_label())
    }
}

// ============================================
// FaultyDialer
// ============================================

/// `Dialer` decorator injecting latency and dial failures.
pub struct FaultyDialer {
    inner: Arc<dyn Dialer>,
    config: FaultConfig,
    stats: Arc<FaultStats>,
}

impl FaultyDialer {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn Dialer>, config: FaultConfig) -> Self {
        Self {
            inner,
            config,
            stats: Arc::new(FaultStats::default()),
        }
    }

    /// Fault counters.
    #[must_use]
    pub fn stats(&self) -> Arc<FaultStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Dialer for FaultyDialer {
    async fn connect(&self, target: &TargetAddr, timeout: Duration) -> Result<DialedStream> {
        let roll = self.config.roll();
        if roll.latency >= timeout {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::timeout(format!("connect to {target}")));
        }
        delay(roll.latency).await;
        if roll.error || roll.disconnect {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::injected(format!("connect to {target}")));
        }
        self.inner.connect(target, timeout - roll.latency).await
    }

    async fn bind_udp(&self) -> Result<Arc<dyn DatagramSocket>> {
        let roll = self.config.roll();
        delay(roll.latency).await;
        if roll.error {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::injected("bind udp"));
        }
        self.inner.bind_udp().await
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLink;
    use crate::mock::MockDialer;

    fn link_pair() -> (Arc<dyn PeerLink>, Arc<dyn PeerLink>) {
        let (a, b) = MemoryLink::pair("a", "b", 8);
        (Arc::new(a), Arc::new(b))
    }

    #[tokio::test]
    async fn test_no_faults_is_transparent() {
        let (a, b) = link_pair();
        let faulty = FaultyLink::new(a, FaultConfig::none());

        faulty.send(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(Bytes::from_static(b"x")));
        assert_eq!(faulty.stats().total(), 0);
        assert!(faulty.remote_label().starts_with("faulty+"));
    }

    #[tokio::test]
    async fn test_certain_error() {
        let (a, _b) = link_pair();
        let faulty = FaultyLink::new(a, FaultConfig::none().with_error_probability(1.0));

        let err = faulty.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, TransportError::Injected { .. }));
        assert!(faulty.is_active());
        assert_eq!(faulty.stats().errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_certain_disconnect_closes_inner() {
        let (a, b) = link_pair();
        let faulty = FaultyLink::new(a, FaultConfig::none().with_disconnect_probability(1.0));

        assert!(faulty.send(Bytes::from_static(b"x")).await.is_err());
        assert!(!faulty.is_active());
        assert_eq!(b.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_latency_applied() {
        let (a, b) = link_pair();
        let latency = Duration::from_millis(30);
        let faulty = FaultyLink::new(a, FaultConfig::none().with_latency(latency, latency));

        let start = tokio::time::Instant::now();
        faulty.send(Bytes::from_static(b"x")).await.unwrap();
        assert!(start.elapsed() >= latency);
        assert!(b.recv().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_faulty_dialer() {
        let inner: Arc<dyn Dialer> = Arc::new(MockDialer::new());
        let target: TargetAddr = "1.2.3.4:80".parse().unwrap();

        let ok = FaultyDialer::new(Arc::clone(&inner), FaultConfig::none());
        assert!(ok.connect(&target, Duration::from_secs(1)).await.is_ok());

        let failing = FaultyDialer::new(inner, FaultConfig::none().with_error_probability(1.0));
        assert!(failing.connect(&target, Duration::from_secs(1)).await.is_err());
        assert_eq!(failing.stats().total(), 1);
    }

    #[test]
    fn test_probabilities_clamped() {
        let config = FaultConfig::none()
            .with_error_probability(7.0)
            .with_disconnect_probability(-1.0)
            .with_latency(Duration::from_millis(9), Duration::from_millis(3));
        assert!((config.error_probability - 1.0).abs() < f64::EPSILON);
        assert!(config.disconnect_probability.abs() < f64::EPSILON);
        assert!(config.min_latency <= config.max_latency);
    }
}
