//! Metrics for IPsec and IKE operations
//!
//! Provides counters for monitoring packet protection and negotiation.
//! All metrics use atomic operations for thread-safe updates; clones share
//! the same counters.
//!
//! # Example
//!
//! ```
//! use strata_proto::ipsec::metrics::IpsecMetrics;
//!
//! let metrics = IpsecMetrics::new();
//!
//! metrics.record_esp_encoded(1500);
//! metrics.record_phase1_completed();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.esp_packets_encoded, 1);
//! assert_eq!(snapshot.phase1_completed, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// IPsec metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct IpsecMetrics {
    /// ESP packets protected
    pub esp_packets_encoded: Arc<AtomicU64>,

    /// Bytes handed to ESP for protection
    pub esp_bytes_encoded: Arc<AtomicU64>,

    /// ESP packets verified and decrypted
    pub esp_packets_decoded: Arc<AtomicU64>,

    /// AH packets protected
    pub ah_packets_encoded: Arc<AtomicU64>,

    /// AH packets verified
    pub ah_packets_decoded: Arc<AtomicU64>,

    /// Packets passed without protection
    pub packets_bypassed: Arc<AtomicU64>,

    /// Packets discarded by policy or validation
    pub packets_discarded: Arc<AtomicU64>,

    /// Replayed sequence numbers rejected
    pub replay_rejected: Arc<AtomicU64>,

    /// ICV mismatches
    pub digest_failures: Arc<AtomicU64>,

    /// SAs installed
    pub sa_installed: Arc<AtomicU64>,

    /// SAs removed
    pub sa_removed: Arc<AtomicU64>,

    /// SA requests sent to IKE
    pub sa_requests: Arc<AtomicU64>,

    /// ISAKMP SAs established
    pub phase1_completed: Arc<AtomicU64>,

    /// Phase 1 exchanges aborted
    pub phase1_failed: Arc<AtomicU64>,

    /// Quick mode exchanges completed
    pub phase2_completed: Arc<AtomicU64>,

    /// Quick mode exchanges aborted
    pub phase2_failed: Arc<AtomicU64>,

    /// ISAKMP messages dropped on receipt
    pub messages_dropped: Arc<AtomicU64>,

    /// Informational notifications sent
    pub notifications_sent: Arc<AtomicU64>,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// ESP packets protected
    pub esp_packets_encoded: u64,
    /// Bytes handed to ESP for protection
    pub esp_bytes_encoded: u64,
    /// ESP packets verified and decrypted
    pub esp_packets_decoded: u64,
    /// AH packets protected
    pub ah_packets_encoded: u64,
    /// AH packets verified
    pub ah_packets_decoded: u64,
    /// Packets passed without protection
    pub packets_bypassed: u64,
    /// Packets discarded
    pub packets_discarded: u64,
    /// Replayed sequence numbers rejected
    pub replay_rejected: u64,
    /// ICV mismatches
    pub digest_failures: u64,
    /// SAs installed
    pub sa_installed: u64,
    /// SAs removed
    pub sa_removed: u64,
    /// SA requests sent to IKE
    pub sa_requests: u64,
    /// ISAKMP SAs established
    pub phase1_completed: u64,
    /// Phase 1 exchanges aborted
    pub phase1_failed: u64,
    /// Quick mode exchanges completed
    pub phase2_completed: u64,
    /// Quick mode exchanges aborted
    pub phase2_failed: u64,
    /// ISAKMP messages dropped on receipt
    pub messages_dropped: u64,
    /// Informational notifications sent
    pub notifications_sent: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl IpsecMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ESP packet protected
    ///
    /// # Arguments
    ///
    /// * `bytes` - Length of the packet before protection
    pub fn record_esp_encoded(&self, bytes: usize) {
        bump(&self.esp_packets_encoded);
        self.esp_bytes_encoded
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record an ESP packet verified and decrypted
    pub fn record_esp_decoded(&self) {
        bump(&self.esp_packets_decoded);
    }

    /// Record an AH packet protected
    pub fn record_ah_encoded(&self) {
        bump(&self.ah_packets_encoded);
    }

    /// Record an AH packet verified
    pub fn record_ah_decoded(&self) {
        bump(&self.ah_packets_decoded);
    }

    /// Record a packet passed in clear
    pub fn record_bypass(&self) {
        bump(&self.packets_bypassed);
    }

    /// Record a discarded packet
    pub fn record_discard(&self) {
        bump(&self.packets_discarded);
    }

    /// Record a replay rejection
    pub fn record_replay_rejected(&self) {
        bump(&self.replay_rejected);
    }

    /// Record an ICV mismatch
    pub fn record_digest_failure(&self) {
        bump(&self.digest_failures);
    }

    /// Record SAs installed
    pub fn record_sa_installed(&self, count: u64) {
        self.sa_installed.fetch_add(count, Ordering::Relaxed);
    }

    /// Record SAs removed
    pub fn record_sa_removed(&self, count: u64) {
        self.sa_removed.fetch_add(count, Ordering::Relaxed);
    }

    /// Record an SA request handed to IKE
    pub fn record_sa_request(&self) {
        bump(&self.sa_requests);
    }

    /// Record an ISAKMP SA established
    pub fn record_phase1_completed(&self) {
        bump(&self.phase1_completed);
    }

    /// Record an aborted phase 1 exchange
    pub fn record_phase1_failed(&self) {
        bump(&self.phase1_failed);
    }

    /// Record a completed Quick mode exchange
    pub fn record_phase2_completed(&self) {
        bump(&self.phase2_completed);
    }

    /// Record an aborted Quick mode exchange
    pub fn record_phase2_failed(&self) {
        bump(&self.phase2_failed);
    }

    /// Record an ISAKMP message dropped on receipt
    pub fn record_message_dropped(&self) {
        bump(&self.messages_dropped);
    }

    /// Record an informational notification sent
    pub fn record_notification_sent(&self) {
        bump(&self.notifications_sent);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &Arc<AtomicU64>| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            esp_packets_encoded: load(&self.esp_packets_encoded),
            esp_bytes_encoded: load(&self.esp_bytes_encoded),
            esp_packets_decoded: load(&self.esp_packets_decoded),
            ah_packets_encoded: load(&self.ah_packets_encoded),
            ah_packets_decoded: load(&self.ah_packets_decoded),
            packets_bypassed: load(&self.packets_bypassed),
            packets_discarded: load(&self.packets_discarded),
            replay_rejected: load(&self.replay_rejected),
            digest_failures: load(&self.digest_failures),
            sa_installed: load(&self.sa_installed),
            sa_removed: load(&self.sa_removed),
            sa_requests: load(&self.sa_requests),
            phase1_completed: load(&self.phase1_completed),
            phase1_failed: load(&self.phase1_failed),
            phase2_completed: load(&self.phase2_completed),
            phase2_failed: load(&self.phase2_failed),
            messages_dropped: load(&self.messages_dropped),
            notifications_sent: load(&self.notifications_sent),
        }
    }
}
