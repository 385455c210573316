//! Anti-Replay Protection for IPsec AH and ESP
//!
//! Implements RFC 4303 Section 3.4.3 and Appendix A (Extended Sequence
//! Numbers).
//!
//! # Overview
//!
//! Each inbound SA keeps a sliding window of recently received sequence
//! numbers. Only the low 32 bits travel on the wire; with ESN the high 32
//! bits are inferred from the position of the candidate relative to the
//! window. The whole check is carried out in a single 64-bit sequence
//! space, so the "window straddles an epoch boundary" case needs no
//! separate bit arithmetic.
//!
//! # Algorithm
//!
//! ```text
//! Bitmap (window_bits = 64 * words):
//! ┌────────── word 1 ──────────┬────────── word 0 ──────────┐
//! │ 127 ...                 64 │ 63 ...                 1 0 │
//! └────────────────────────────┴────────────────────────────┘
//!   oldest                                      last_seq ──┘
//!
//! bit i set  <=>  sequence (last_seq - i) was received
//!
//! lower_bound = last_seq - (window_bits - 1)
//!
//! ESN epoch resolution for candidate c (Tl/Th = low/high of last_seq):
//!   Tl >= window_bits - 1:  c >= lower_bound.low ? Th : Th + 1
//!   Tl <  window_bits - 1:  c >= lower_bound.low ? Th - 1 : Th
//! ```
//!
//! # References
//!
//! - [RFC 4303 Section 3.4.3](https://datatracker.ietf.org/doc/html/rfc4303#section-3.4.3)
//! - [RFC 4303 Appendix A](https://datatracker.ietf.org/doc/html/rfc4303#appendix-A)

use super::{Error, Result};

/// Default number of 64-bit words in the bitmap (64 packets)
pub const DEFAULT_WINDOW_WORDS: usize = 1;

/// Largest supported bitmap (2048 packets)
pub const MAX_WINDOW_WORDS: usize = 32;

/// Sequence number split into its wire and derived halves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceNumber {
    /// Low-order 32 bits, carried in the AH/ESP header
    pub low: u32,
    /// High-order 32 bits, only meaningful with ESN
    pub high: u32,
    /// Extended Sequence Numbers negotiated for this SA
    pub esn: bool,
}

impl SequenceNumber {
    /// Zero sequence number
    pub fn new(esn: bool) -> Self {
        Self {
            low: 0,
            high: 0,
            esn,
        }
    }

    /// Build from a 64-bit logical value
    pub fn from_u64(value: u64, esn: bool) -> Self {
        Self {
            low: value as u32,
            high: (value >> 32) as u32,
            esn,
        }
    }

    /// The 64-bit logical value
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.high) << 32) | u64::from(self.low)
    }

    /// Advance to the next outbound sequence number
    ///
    /// # Errors
    ///
    /// Returns `Error::SequenceOverflow` when the 32-bit space is exhausted
    /// without ESN (the SA must be rekeyed), or the 64-bit space with ESN.
    pub fn increment(&mut self) -> Result<()> {
        if self.low == u32::MAX {
            if !self.esn || self.high == u32::MAX {
                return Err(Error::SequenceOverflow);
            }
            self.high += 1;
            self.low = 0;
        } else {
            self.low += 1;
        }
        Ok(())
    }
}

/// Outcome of a replay check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCheck {
    /// Candidate is acceptable; carries the resolved high-order 32 bits
    Accept(u32),
    /// Candidate is a duplicate or too old
    Reject,
}

impl ReplayCheck {
    /// Whether the candidate was accepted
    pub fn is_accept(self) -> bool {
        matches!(self, ReplayCheck::Accept(_))
    }
}

/// Anti-Replay Window
///
/// # Example
///
/// ```rust
/// use strata_proto::ipsec::replay::{ReplayCheck, ReplayWindow};
///
/// let mut window = ReplayWindow::new(1, false);
///
/// assert_eq!(window.check(5), ReplayCheck::Accept(0));
/// window.update(5);
///
/// // duplicate
/// assert_eq!(window.check(5), ReplayCheck::Reject);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayWindow {
    /// Bit 0 of word 0 corresponds to `last_seq`
    bitmap: Vec<u64>,
    last_seq: SequenceNumber,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_WORDS, false)
    }
}

impl ReplayWindow {
    /// Create a window of `words` 64-bit words (clamped to 1..=MAX_WINDOW_WORDS)
    pub fn new(words: usize, esn: bool) -> Self {
        let words = words.clamp(1, MAX_WINDOW_WORDS);
        Self {
            bitmap: vec![0; words],
            last_seq: SequenceNumber::new(esn),
        }
    }

    /// Number of sequence numbers tracked
    pub fn window_bits(&self) -> u64 {
        self.bitmap.len() as u64 * 64
    }

    /// Highest sequence number accepted so far
    pub fn last_seq(&self) -> SequenceNumber {
        self.last_seq
    }

    /// Whether ESN is in use
    pub fn is_esn(&self) -> bool {
        self.last_seq.esn
    }

    /// Raw bitmap words, word 0 first
    pub fn bitmap(&self) -> &[u64] {
        &self.bitmap
    }

    fn bit(&self, index: u64) -> bool {
        let word = (index / 64) as usize;
        word < self.bitmap.len() && self.bitmap[word] & (1u64 << (index % 64)) != 0
    }

    fn set_bit(&mut self, index: u64) {
        let word = (index / 64) as usize;
        if word < self.bitmap.len() {
            self.bitmap[word] |= 1u64 << (index % 64);
        }
    }

    /// Resolve the high-order bits for a wire sequence number.
    ///
    /// Returns `None` when the candidate would belong to an epoch before
    /// the first one.
    fn resolve_high(&self, candidate: u32) -> Option<u32> {
        if !self.last_seq.esn {
            return Some(0);
        }
        let span = (self.window_bits() - 1) as u32;
        let tl = self.last_seq.low;
        let th = self.last_seq.high;
        let lower_low = tl.wrapping_sub(span);

        if tl >= span {
            // window lies inside the current epoch
            if candidate >= lower_low {
                Some(th)
            } else {
                th.checked_add(1)
            }
        } else if candidate >= lower_low {
            // window straddles the epoch boundary
            th.checked_sub(1)
        } else {
            Some(th)
        }
    }

    /// Check a wire sequence number against the window without updating it
    pub fn check(&self, candidate: u32) -> ReplayCheck {
        let high = match self.resolve_high(candidate) {
            Some(high) => high,
            None => return ReplayCheck::Reject,
        };
        let full = (u64::from(high) << 32) | u64::from(candidate);

        // sequence number zero is never transmitted
        if full == 0 {
            return ReplayCheck::Reject;
        }

        let last = self.last_seq.as_u64();
        if full > last {
            return ReplayCheck::Accept(high);
        }

        let diff = last - full;
        if diff >= self.window_bits() || self.bit(diff) {
            ReplayCheck::Reject
        } else {
            ReplayCheck::Accept(high)
        }
    }

    /// Record a validated 64-bit sequence number
    pub fn update(&mut self, seq: u64) {
        let last = self.last_seq.as_u64();
        if seq > last {
            shift_left(&mut self.bitmap, seq - last);
            self.set_bit(0);
            self.last_seq = SequenceNumber::from_u64(seq, self.last_seq.esn);
        } else {
            let diff = last - seq;
            if diff < self.window_bits() {
                self.set_bit(diff);
            }
        }
    }

    /// Check and, if accepted, immediately record a wire sequence number
    ///
    /// Returns the resolved 64-bit sequence number.
    ///
    /// # Errors
    ///
    /// Returns `Error::ReplayDetected` if the number is rejected.
    pub fn check_and_update(&mut self, candidate: u32) -> Result<u64> {
        match self.check(candidate) {
            ReplayCheck::Accept(high) => {
                let full = (u64::from(high) << 32) | u64::from(candidate);
                self.update(full);
                Ok(full)
            }
            ReplayCheck::Reject => Err(Error::ReplayDetected(u64::from(candidate))),
        }
    }
}

/// Shift a multi-word bitmap towards higher bit indices by `n` bits
///
/// Word 0 holds bits 0..63. Bits shifted past the last word are lost; the
/// vacated low bits are cleared.
pub fn shift_left(bitmap: &mut [u64], n: u64) {
    let total = bitmap.len() as u64 * 64;
    if n == 0 {
        return;
    }
    if n >= total {
        bitmap.iter_mut().for_each(|w| *w = 0);
        return;
    }

    let words = (n / 64) as usize;
    let bits = (n % 64) as u32;

    if words > 0 {
        for i in (0..bitmap.len()).rev() {
            bitmap[i] = if i >= words { bitmap[i - words] } else { 0 };
        }
    }

    if bits > 0 {
        for i in (0..bitmap.len()).rev() {
            let carry = if i > 0 {
                bitmap[i - 1] >> (64 - bits)
            } else {
                0
            };
            bitmap[i] = (bitmap[i] << bits) | carry;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_sequence() {
        let mut window = ReplayWindow::new(1, false);
        let mut results = Vec::new();
        for seq in [5u32, 6, 6, 4, 50] {
            let verdict = window.check(seq);
            if let ReplayCheck::Accept(high) = verdict {
                window.update((u64::from(high) << 32) | u64::from(seq));
            }
            results.push(verdict.is_accept());
        }
        assert_eq!(results, vec![true, true, false, true, true]);
        assert_eq!(window.last_seq().low, 50);
        // 50 at bit 0, 6 at bit 44, 5 at bit 45, 4 at bit 46
        assert_eq!(window.bitmap()[0], 1 | (1 << 44) | (1 << 45) | (1 << 46));
    }

    #[test]
    fn test_zero_rejected() {
        let window = ReplayWindow::new(1, false);
        assert_eq!(window.check(0), ReplayCheck::Reject);
    }

    #[test]
    fn test_strictly_increasing_always_accepted() {
        let mut window = ReplayWindow::new(2, false);
        for seq in (1..1000u32).step_by(7) {
            assert!(window.check_and_update(seq).is_ok(), "seq {}", seq);
        }
    }

    #[test]
    fn test_update_then_check_rejects() {
        let mut window = ReplayWindow::new(1, false);
        for seq in [10u32, 3, 9, 70, 64] {
            if window.check(seq).is_accept() {
                window.update(u64::from(seq));
                assert_eq!(window.check(seq), ReplayCheck::Reject);
            }
        }
    }

    #[test]
    fn test_window_boundary() {
        let mut window = ReplayWindow::new(1, false);
        window.update(100);

        // lower bound = 100 - 63 = 37
        assert!(window.check(37).is_accept());
        assert_eq!(window.check(36), ReplayCheck::Reject);
    }

    #[test]
    fn test_multi_word_window() {
        let mut window = ReplayWindow::new(4, false);
        window.update(1000);
        assert_eq!(window.window_bits(), 256);

        assert!(window.check(1000 - 255).is_accept());
        assert_eq!(window.check(1000 - 256), ReplayCheck::Reject);

        window.update(800);
        assert_eq!(window.check(800), ReplayCheck::Reject);

        // shift by more than a word keeps the old bit at the right place
        window.update(1070);
        assert_eq!(window.check(800), ReplayCheck::Reject);
        assert_eq!(window.check(1000), ReplayCheck::Reject);
        assert!(window.check(999).is_accept());
    }

    #[test]
    fn test_esn_next_epoch() {
        let mut window = ReplayWindow::new(1, true);
        window.update(0xFFFF_FFF0);

        // far below the window means the low half wrapped
        assert_eq!(window.check(3), ReplayCheck::Accept(1));
        window.update((1u64 << 32) | 3);
        assert_eq!(window.last_seq().high, 1);
        assert_eq!(window.last_seq().low, 3);
    }

    #[test]
    fn test_esn_straddling_previous_epoch() {
        let mut window = ReplayWindow::new(1, true);
        window.update((1u64 << 32) | 10);

        // lower bound low half is 10 - 63 wrapped = 0xFFFF_FFCB
        assert_eq!(window.check(0xFFFF_FFD0), ReplayCheck::Accept(0));
        window.update(0xFFFF_FFD0);
        assert_eq!(window.check(0xFFFF_FFD0), ReplayCheck::Reject);

        // just below the lower bound belongs to the current epoch and is new
        assert_eq!(window.check(0xFFFF_FFCA), ReplayCheck::Accept(1));

        // same epoch, inside the window
        assert_eq!(window.check(5), ReplayCheck::Accept(1));
        assert_eq!(window.check(10), ReplayCheck::Reject);
    }

    #[test]
    fn test_esn_epoch_consistent_across_wrap() {
        let mut window = ReplayWindow::new(1, true);
        let mut seq = SequenceNumber::from_u64(0xFFFF_FF00, true);
        for _ in 0..600 {
            seq.increment().unwrap();
            let verdict = window.check(seq.low);
            assert_eq!(verdict, ReplayCheck::Accept(seq.high));
            window.update(seq.as_u64());
        }
        assert_eq!(window.last_seq().high, 1);
    }

    #[test]
    fn test_esn_straddling_bit_index() {
        let mut window = ReplayWindow::new(1, true);
        window.update((1u64 << 32) | 2);
        window.update(0xFFFF_FFFF);

        // 0xFFFF_FFFF sits 3 below last_seq: (0xFFFFFFFF - c) + low + 1
        assert_ne!(window.bitmap()[0] & (1 << 3), 0);
        assert_eq!(window.check(0xFFFF_FFFF), ReplayCheck::Reject);
    }

    #[test]
    fn test_shift_left_edges() {
        let mut bitmap = vec![0x8000_0000_0000_0001u64, 0x1];
        let before = bitmap.clone();
        shift_left(&mut bitmap, 0);
        assert_eq!(bitmap, before);

        shift_left(&mut bitmap, 1);
        assert_eq!(bitmap, vec![0x2, 0x3]);

        shift_left(&mut bitmap, 65);
        assert_eq!(bitmap, vec![0x0, 0x4]);

        shift_left(&mut bitmap, 128);
        assert_eq!(bitmap, vec![0, 0]);

        let mut bitmap = vec![u64::MAX; 3];
        shift_left(&mut bitmap, 500);
        assert!(bitmap.iter().all(|w| *w == 0));
    }

    #[test]
    fn test_sequence_increment() {
        let mut seq = SequenceNumber::from_u64(u64::from(u32::MAX), false);
        assert_eq!(seq.increment(), Err(Error::SequenceOverflow));

        let mut seq = SequenceNumber::from_u64(u64::from(u32::MAX), true);
        seq.increment().unwrap();
        assert_eq!((seq.high, seq.low), (1, 0));
    }
}
