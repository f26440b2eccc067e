//! Reliable send/receive state machine, §4.5 and §3 `Connection`.
//!
//! One `ReliableState` per established connection. Pure state machine: no
//! socket I/O here, so it is unit-testable without a network (§8 property 1,
//! 5, 6).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::bandwidth::{BandwidthLimiter, Priority};
use crate::error::ReliableError;
use crate::packet::{self, MAX_DATAGRAM_PAYLOAD};
use crate::sequence_list::SequenceList;

/// Initial retransmission timeout; doubles on each retry up to `rto_cap`.
const INITIAL_RTO: Duration = Duration::from_millis(300);

pub struct PendingSend {
    pub payload: Vec<u8>,
    pub last_sent_at: Option<Instant>,
    pub retries: u32,
    pub queued_at: Instant,
}

/// Outcome of a pump pass over `pending_out`: what to actually put on the
/// wire this cycle, plus any seqnums whose retry budget was exhausted.
pub struct PumpResult {
    pub to_send: Vec<(u32, Vec<u8>)>,
    pub timed_out: Vec<u32>,
}

pub struct ReliableConfig {
    pub rto_cap: Duration,
    pub retry_limit: u32,
    pub reorder_buffer_capacity: usize,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            rto_cap: Duration::from_secs(4),
            retry_limit: 12,
            reorder_buffer_capacity: 256,
        }
    }
}

/// Smoothed RTT estimator feeding the RTO, modeled on the classic
/// exponentially-weighted moving average (SRTT/RTTVAR) used for TCP-style
/// retransmission timing.
#[derive(Default)]
struct RttEstimator {
    srtt: Option<f64>,
    rttvar: f64,
}

impl RttEstimator {
    fn sample(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        match self.srtt {
            None => {
                self.srtt = Some(sample_ms);
                self.rttvar = sample_ms / 2.0;
            }
            Some(srtt) => {
                self.rttvar = 0.75 * self.rttvar + 0.25 * (srtt - sample_ms).abs();
                self.srtt = Some(0.875 * srtt + 0.125 * sample_ms);
            }
        }
    }

    fn rto(&self, cap: Duration) -> Duration {
        match self.srtt {
            None => INITIAL_RTO,
            Some(srtt) => {
                let rto_ms = srtt + 4.0 * self.rttvar;
                Duration::from_millis(rto_ms.max(50.0) as u64).min(cap)
            }
        }
    }
}

/// Per-connection reliable transport state: §3 `Connection` fields
/// `s2cn`, `c2sn`, `pending_out`, `reorder_buffer`.
pub struct ReliableState {
    config: ReliableConfig,
    s2cn: u32,
    c2sn: u32,
    pending_out: SequenceList<PendingSend>,
    reorder_buffer: BTreeMap<u32, Vec<u8>>,
    rtt: RttEstimator,
    pub rel_dups: u64,
    disconnect_requested: bool,
}

impl ReliableState {
    pub fn new(config: ReliableConfig) -> Self {
        Self {
            config,
            s2cn: 0,
            c2sn: 0,
            pending_out: SequenceList::new(),
            reorder_buffer: BTreeMap::new(),
            rtt: RttEstimator::default(),
            rel_dups: 0,
            disconnect_requested: false,
        }
    }

    pub fn should_disconnect(&self) -> bool {
        self.disconnect_requested
    }

    /// Queues `payload` for reliable delivery, allocating the next
    /// outgoing seqnum. Returns the seqnum assigned so the caller can track
    /// a completion callback against it.
    pub fn send_reliable(&mut self, now: Instant, payload: Vec<u8>) -> u32 {
        let seqnum = self.s2cn;
        self.s2cn = self.s2cn.wrapping_add(1);
        self.pending_out
            .try_insert_scan_from_back(
                seqnum,
                PendingSend {
                    payload,
                    last_sent_at: None,
                    retries: 0,
                    queued_at: now,
                },
            )
            .expect("s2cn is monotonic, cannot collide with an already-pending seqnum");
        seqnum
    }

    /// One reliable-pump cycle: walks `pending_out` in order, admits each
    /// unsent/overdue entry through the bandwidth limiter, and reports
    /// seqnums whose retry budget is exhausted (caller must then fail the
    /// connection's pending callbacks and disconnect it).
    pub fn pump(&mut self, now: Instant, limiter: &mut dyn BandwidthLimiter) -> PumpResult {
        limiter.iter(now);
        let mut to_send = Vec::new();
        let mut timed_out = Vec::new();
        let base_rto = self.rtt.rto(self.config.rto_cap);

        for (seqnum, pending) in self.pending_out.iter_mut() {
            // §4.5: RTO doubles on each retry, capped, on top of the
            // smoothed base estimate.
            let backoff = 1u32.checked_shl(pending.retries).unwrap_or(u32::MAX);
            let rto = base_rto.saturating_mul(backoff).min(self.config.rto_cap);
            let due = match pending.last_sent_at {
                None => true,
                Some(last) => now.saturating_duration_since(last) > rto,
            };
            if !due {
                continue;
            }
            let framed = packet::encode_reliable(*seqnum, &pending.payload);
            if framed.len() > MAX_DATAGRAM_PAYLOAD {
                // Oversized reliable sends are a caller bug (should have
                // gone through the sized-transfer path instead); still
                // bounds-checked rather than panicking.
                continue;
            }
            if !limiter.check(framed.len(), Priority::Reliable) {
                continue;
            }
            if pending.retries >= self.config.retry_limit {
                timed_out.push(*seqnum);
                continue;
            }
            if pending.last_sent_at.is_some() {
                pending.retries += 1;
                limiter.adjust_for_retry();
            }
            pending.last_sent_at = Some(now);
            to_send.push((*seqnum, framed));
        }

        if !timed_out.is_empty() {
            self.disconnect_requested = true;
        }

        PumpResult { to_send, timed_out }
    }

    /// Removes the acknowledged packet from `pending_out`, feeding RTT
    /// estimation and the bandwidth limiter. Returns `true` if this ACK
    /// corresponded to a packet we were still tracking (i.e. a real,
    /// first-time ACK rather than a duplicate — §8 property 5, E2).
    pub fn handle_ack(&mut self, now: Instant, seqnum: u32, limiter: &mut dyn BandwidthLimiter) -> bool {
        match self.pending_out.remove_scan_from_front(seqnum) {
            Some(pending) => {
                if let Some(sent_at) = pending.last_sent_at {
                    self.rtt.sample(now.saturating_duration_since(sent_at));
                }
                limiter.adjust_for_ack();
                true
            }
            None => false,
        }
    }

    /// Removes every pending send, returning their seqnums so the caller
    /// can fail any associated completion callbacks with `success=false`
    /// (connection teardown, §4.5 Cancellation).
    pub fn drain_pending(&mut self) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some((seq, _)) = self.pending_out.pop_front() {
            out.push(seq);
        }
        out
    }

    /// Processes an inbound reliable payload at `seqnum`. Returns the
    /// in-order payloads now ready for delivery (possibly more than one, if
    /// this packet fills a gap the reorder buffer was holding), and whether
    /// an ACK must be emitted (duplicates are still ACKed, §3 invariant).
    pub fn receive_reliable(&mut self, seqnum: u32, payload: Vec<u8>) -> ReceiveOutcome {
        use crate::wrapping::{sequence_greater_than, sequence_less_than};

        if seqnum == self.c2sn {
            let mut delivered = vec![payload];
            self.c2sn = self.c2sn.wrapping_add(1);
            while let Some(next) = self.reorder_buffer.remove(&self.c2sn) {
                delivered.push(next);
                self.c2sn = self.c2sn.wrapping_add(1);
            }
            ReceiveOutcome {
                delivered,
                should_ack: true,
                duplicate: false,
                buffered: false,
            }
        } else if sequence_greater_than(seqnum, self.c2sn) {
            if self.reorder_buffer.len() >= self.config.reorder_buffer_capacity {
                return ReceiveOutcome {
                    delivered: Vec::new(),
                    should_ack: false,
                    duplicate: false,
                    buffered: false,
                };
            }
            self.reorder_buffer.insert(seqnum, payload);
            ReceiveOutcome {
                delivered: Vec::new(),
                should_ack: false,
                duplicate: false,
                buffered: true,
            }
        } else {
            debug_assert!(sequence_less_than(seqnum, self.c2sn));
            self.rel_dups += 1;
            ReceiveOutcome {
                delivered: Vec::new(),
                should_ack: true,
                duplicate: true,
                buffered: false,
            }
        }
    }

    pub fn c2sn(&self) -> u32 {
        self.c2sn
    }

    pub fn s2cn(&self) -> u32 {
        self.s2cn
    }

    pub fn pending_count(&self) -> usize {
        self.pending_out.len()
    }

    pub fn try_disconnect_on_window_exhaustion(
        &mut self,
        limiter: &dyn BandwidthLimiter,
    ) -> Result<(), ReliableError> {
        if self.pending_out.len() > limiter.send_window_size() {
            self.disconnect_requested = true;
            return Err(ReliableError::WindowExhausted);
        }
        Ok(())
    }
}

pub struct ReceiveOutcome {
    pub delivered: Vec<Vec<u8>>,
    pub should_ack: bool,
    pub duplicate: bool,
    pub buffered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::TokenBucketLimiter;

    fn limiter() -> TokenBucketLimiter {
        TokenBucketLimiter::new(1_000_000, 1_000_000)
    }

    #[test]
    fn in_order_delivery_is_immediate() {
        let mut state = ReliableState::new(ReliableConfig::default());
        let outcome = state.receive_reliable(0, b"A".to_vec());
        assert_eq!(outcome.delivered, vec![b"A".to_vec()]);
        assert!(outcome.should_ack);
        assert_eq!(state.c2sn(), 1);
    }

    #[test]
    fn out_of_order_then_gap_fill_delivers_in_order() {
        // E1: sender emits A, B, C, D, E; B's first transmission is lost.
        let mut state = ReliableState::new(ReliableConfig::default());
        let a = state.receive_reliable(0, b"A".to_vec());
        assert_eq!(a.delivered, vec![b"A".to_vec()]);

        // C, D, E arrive before B's retransmit.
        let c = state.receive_reliable(2, b"C".to_vec());
        assert!(c.delivered.is_empty() && c.buffered);
        let d = state.receive_reliable(3, b"D".to_vec());
        assert!(d.delivered.is_empty());
        let e = state.receive_reliable(4, b"E".to_vec());
        assert!(e.delivered.is_empty());

        // B's retransmit arrives, draining C, D, E in order.
        let b = state.receive_reliable(1, b"B".to_vec());
        assert_eq!(
            b.delivered,
            vec![b"B".to_vec(), b"C".to_vec(), b"D".to_vec(), b"E".to_vec()]
        );
        assert_eq!(state.c2sn(), 5);
    }

    #[test]
    fn duplicate_is_acked_and_counted_not_redelivered() {
        // E2: three duplicate ACKs/receives for an already-delivered seqnum.
        let mut state = ReliableState::new(ReliableConfig::default());
        state.receive_reliable(0, b"A".to_vec());
        for _ in 0..3 {
            let outcome = state.receive_reliable(0, b"A".to_vec());
            assert!(outcome.delivered.is_empty());
            assert!(outcome.duplicate);
            assert!(outcome.should_ack);
        }
        assert_eq!(state.rel_dups, 3);
    }

    #[test]
    fn ack_removes_pending_and_duplicate_ack_is_a_noop() {
        let mut state = ReliableState::new(ReliableConfig::default());
        let mut lim = limiter();
        let now = Instant::now();
        let seq = state.send_reliable(now, b"payload".to_vec());
        assert_eq!(state.pending_count(), 1);

        assert!(state.handle_ack(now, seq, &mut lim));
        assert_eq!(state.pending_count(), 0);

        // Duplicate ACK for a seqnum no longer in pending_out: no effect.
        assert!(!state.handle_ack(now, seq, &mut lim));
        for _ in 0..3 {
            assert!(!state.handle_ack(now, seq, &mut lim));
        }
    }

    #[test]
    fn retry_limit_flags_disconnect() {
        let mut state = ReliableState::new(ReliableConfig {
            rto_cap: Duration::from_millis(1),
            retry_limit: 2,
            reorder_buffer_capacity: 16,
        });
        let mut lim = limiter();
        let mut now = Instant::now();
        state.send_reliable(now, b"x".to_vec());

        for _ in 0..5 {
            now += Duration::from_millis(5);
            state.pump(now, &mut lim);
        }
        assert!(state.should_disconnect());
    }

    #[test]
    fn pending_out_stays_sorted_by_seqnum() {
        let mut state = ReliableState::new(ReliableConfig::default());
        let now = Instant::now();
        for _ in 0..10 {
            state.send_reliable(now, b"x".to_vec());
        }
        let seqnums: Vec<u32> = state.pending_out.iter().map(|(s, _)| *s).collect();
        let mut sorted = seqnums.clone();
        sorted.sort_unstable();
        assert_eq!(seqnums, sorted);
    }
}
