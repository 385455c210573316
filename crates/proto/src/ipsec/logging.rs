//! Structured logging for IPsec and IKE operations
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! All log messages include relevant context fields for debugging and monitoring.
//! Cookies are rendered as hex; SPIs as hex with a `0x` prefix.
//!
//! # Log Levels
//!
//! - **TRACE**: Wire-level details of ISAKMP messages
//! - **DEBUG**: AH/ESP packet processing, exchange state steps
//! - **INFO**: Phase 1 / phase 2 completion, SA installation
//! - **WARN**: Discarded packets, replays, retransmission exhaustion
//! - **ERROR**: Failed administrative operations
//!
//! # Example
//!
//! ```no_run
//! use strata_proto::ipsec::logging;
//!
//! // Initialize tracing subscriber (in tests or applications)
//! tracing_subscriber::fmt()
//!     .with_env_filter("strata_proto::ipsec=debug")
//!     .init();
//!
//! // Log IKE state transition
//! logging::log_ike_state_transition(
//!     &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
//!     &[0; 8],
//!     "main",
//!     1,
//!     3,
//! );
//! ```

use std::net::IpAddr;

use tracing::{debug, error, info, trace, warn};

/// Log an exchange state machine step
///
/// # Arguments
///
/// * `cookie_i` - Initiator cookie
/// * `cookie_r` - Responder cookie (zero before the first reply)
/// * `exchange` - "main", "aggressive", "quick" or "info"
/// * `old_state` - State before the step
/// * `new_state` - State after the step
pub fn log_ike_state_transition(
    cookie_i: &[u8],
    cookie_r: &[u8],
    exchange: &str,
    old_state: u8,
    new_state: u8,
) {
    debug!(
        cookie_i = %hex::encode(cookie_i),
        cookie_r = %hex::encode(cookie_r),
        exchange = exchange,
        state_from = old_state,
        state_to = new_state,
        "IKE exchange state transition"
    );
}

/// Log phase 1 completion
pub fn log_phase1_complete(peer: &IpAddr, cookie_i: &[u8], cookie_r: &[u8], mode: &str) {
    info!(
        peer = %peer,
        cookie_i = %hex::encode(cookie_i),
        cookie_r = %hex::encode(cookie_r),
        mode = mode,
        "ISAKMP SA established"
    );
}

/// Log phase 2 completion
pub fn log_phase2_complete(peer: &IpAddr, msg_id: u32, sa_pairs: usize) {
    info!(
        peer = %peer,
        msg_id = format_args!("{:#010x}", msg_id),
        sa_pairs = sa_pairs,
        "Quick mode complete"
    );
}

/// Log an exchange that was aborted
pub fn log_exchange_failed(peer: &IpAddr, exchange: &str, error: &str) {
    warn!(
        peer = %peer,
        exchange = exchange,
        error = error,
        "IKE exchange failed"
    );
}

/// Log the security protocols selected for a phase 2 exchange
pub fn log_phase2_selected(msg_id: u32, count: usize, first_spi: u32) {
    debug!(
        msg_id = format_args!("{:#010x}", msg_id),
        count = count,
        first_spi = format_args!("{:#010x}", first_spi),
        "Phase 2 security selected"
    );
}

/// Log installation of an SA pair
pub fn log_sa_pair_added(group: &str, protocol: &str, in_spi: u32, out_spi: u32) {
    info!(
        group = group,
        protocol = protocol,
        in_spi = format_args!("{:#010x}", in_spi),
        out_spi = format_args!("{:#010x}", out_spi),
        "IPsec SA pair installed"
    );
}

/// Log removal of an SA
pub fn log_sa_removed(spi: u32, reason: &str) {
    info!(
        spi = format_args!("{:#010x}", spi),
        reason = reason,
        "IPsec SA removed"
    );
}

/// Log SA lifetime expiry
pub fn log_lifetime_expired(spi: u32, hard: bool) {
    if hard {
        info!(spi = format_args!("{:#010x}", spi), "SA hard lifetime expired");
    } else {
        warn!(spi = format_args!("{:#010x}", spi), "SA soft lifetime expired");
    }
}

/// Log ESP packet processing
///
/// # Arguments
///
/// * `operation` - "encode" or "decode"
/// * `spi` - ESP Security Parameter Index
/// * `seq` - Sequence number (low 32 bits)
/// * `payload_len` - Payload length in bytes
pub fn log_esp_packet(operation: &str, spi: u32, seq: u32, payload_len: usize) {
    debug!(
        operation = operation,
        spi = format_args!("{:#010x}", spi),
        seq_num = seq,
        payload_len = payload_len,
        "ESP packet processed"
    );
}

/// Log AH packet processing
pub fn log_ah_packet(operation: &str, spi: u32, seq: u32, packet_len: usize) {
    debug!(
        operation = operation,
        spi = format_args!("{:#010x}", spi),
        seq_num = seq,
        packet_len = packet_len,
        "AH packet processed"
    );
}

/// Log a replayed or too old sequence number
pub fn log_replay_rejected(spi: u32, seq: u32) {
    warn!(
        spi = format_args!("{:#010x}", spi),
        seq_num = seq,
        "Replayed sequence number rejected"
    );
}

/// Log a discarded packet
///
/// Inbound data that fails validation is dropped; this is the only trace
/// it leaves.
pub fn log_packet_discard(context: &str, reason: &str) {
    warn!(context = context, reason = reason, "Packet discarded");
}

/// Log an ISAKMP message sent
pub fn log_message_send(exchange: &str, peer: &IpAddr, size_bytes: usize) {
    trace!(
        exchange = exchange,
        peer = %peer,
        size = size_bytes,
        "ISAKMP message sent"
    );
}

/// Log an ISAKMP message received
pub fn log_message_recv(exchange: u8, peer: &IpAddr, size_bytes: usize) {
    trace!(
        exchange = exchange,
        peer = %peer,
        size = size_bytes,
        "ISAKMP message received"
    );
}

/// Log a retransmission
pub fn log_retransmit(peer: &IpAddr, remaining: u8) {
    debug!(peer = %peer, remaining = remaining, "Retransmitting last message");
}

/// Log a notification sent or received
pub fn log_notify(direction: &str, peer: &IpAddr, notify_type: u16) {
    info!(
        direction = direction,
        peer = %peer,
        notify_type = notify_type,
        "ISAKMP notification"
    );
}

/// Log a failed administrative operation
pub fn log_error(context: &str, error: &str) {
    error!(context = context, error = error, "IPsec operation failed");
}
