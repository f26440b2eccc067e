//! Per-player lag collection and query, §4.9.
//!
//! Writers (any thread touching the transport) call `LagStats::collect_*`;
//! readers (usually admin commands, on the mainloop) call the `query_*`
//! accessors. All storage is capacity-bounded ring buffers so a
//! misbehaving or long-lived connection cannot grow these unbounded.

use std::collections::VecDeque;

const DEFAULT_CAPACITY: usize = 120;

/// Histogram bucket upper bounds in milliseconds; the last bucket catches
/// everything at or above `PING_HISTOGRAM_BOUNDS_MS`'s final entry (§4.9
/// "min/avg/max plus a histogram"). Cumulative across the connection's
/// lifetime, unlike the ring-bounded min/avg/max.
pub const PING_HISTOGRAM_BOUNDS_MS: &[i64] = &[10, 20, 30, 40, 50, 75, 100, 150, 250, 500];

struct RingStats {
    capacity: usize,
    samples: VecDeque<i64>,
    histogram: Vec<u32>,
}

impl RingStats {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            histogram: vec![0; PING_HISTOGRAM_BOUNDS_MS.len() + 1],
        }
    }

    fn push(&mut self, value: i64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        let bucket = PING_HISTOGRAM_BOUNDS_MS
            .iter()
            .position(|&bound| value < bound)
            .unwrap_or(PING_HISTOGRAM_BOUNDS_MS.len());
        self.histogram[bucket] += 1;
    }

    fn min(&self) -> Option<i64> {
        self.samples.iter().copied().min()
    }

    fn max(&self) -> Option<i64> {
        self.samples.iter().copied().max()
    }

    fn avg(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<i64>() as f64 / self.samples.len() as f64)
        }
    }
}

/// `histogram[i]` counts samples falling in bucket `i` of
/// [`PING_HISTOGRAM_BOUNDS_MS`] (the last entry is the overflow bucket).
#[derive(Debug, Default, Clone)]
pub struct PingSummary {
    pub min: i64,
    pub avg: f64,
    pub max: i64,
    pub histogram: Vec<u32>,
}

/// Separate moving averages for S2C, C2S, and S2C-weapons packet loss
/// ratios (§4.9). Tracked as `(lost, total)` counters decayed by halving
/// periodically rather than an unbounded running count.
#[derive(Default)]
struct LossRatio {
    lost: f64,
    total: f64,
}

impl LossRatio {
    fn record(&mut self, lost: bool) {
        // Exponential decay keeps this a "moving" average without needing a
        // ring buffer of individual packet outcomes.
        const DECAY: f64 = 0.98;
        self.lost *= DECAY;
        self.total *= DECAY;
        self.total += 1.0;
        if lost {
            self.lost += 1.0;
        }
    }

    fn ratio(&self) -> f64 {
        if self.total <= 0.0 {
            0.0
        } else {
            self.lost / self.total
        }
    }
}

pub struct LagStats {
    position_ping: RingStats,
    reliable_ping: RingStats,
    client_ping: RingStats,
    s2c_loss: LossRatio,
    c2s_loss: LossRatio,
    s2c_weapons_loss: LossRatio,
    time_sync: VecDeque<(i64, i64)>,
    time_sync_capacity: usize,
}

impl LagStats {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            position_ping: RingStats::new(capacity),
            reliable_ping: RingStats::new(capacity),
            client_ping: RingStats::new(capacity),
            s2c_loss: LossRatio::default(),
            c2s_loss: LossRatio::default(),
            s2c_weapons_loss: LossRatio::default(),
            time_sync: VecDeque::with_capacity(16),
            time_sync_capacity: 16,
        }
    }

    pub fn collect_position_delay(&mut self, one_way_delay_ms: i64) {
        self.position_ping.push(one_way_delay_ms);
    }

    pub fn collect_reliable_rtt(&mut self, rtt_ms: i64) {
        self.reliable_ping.push(rtt_ms);
    }

    pub fn collect_client_ping(&mut self, ping_ms: i64) {
        self.client_ping.push(ping_ms);
    }

    pub fn collect_s2c_packet(&mut self, lost: bool) {
        self.s2c_loss.record(lost);
    }

    pub fn collect_c2s_packet(&mut self, lost: bool) {
        self.c2s_loss.record(lost);
    }

    pub fn collect_s2c_weapons_packet(&mut self, lost: bool) {
        self.s2c_weapons_loss.record(lost);
    }

    pub fn collect_time_sync(&mut self, server_time: i64, client_time: i64) {
        if self.time_sync.len() == self.time_sync_capacity {
            self.time_sync.pop_front();
        }
        self.time_sync.push_back((server_time, client_time));
    }

    pub fn query_position_ping(&self) -> PingSummary {
        summary(&self.position_ping)
    }

    pub fn query_reliable_ping(&self) -> PingSummary {
        summary(&self.reliable_ping)
    }

    pub fn query_client_ping(&self) -> PingSummary {
        summary(&self.client_ping)
    }

    pub fn query_s2c_loss(&self) -> f64 {
        self.s2c_loss.ratio()
    }

    pub fn query_c2s_loss(&self) -> f64 {
        self.c2s_loss.ratio()
    }

    pub fn query_s2c_weapons_loss(&self) -> f64 {
        self.s2c_weapons_loss.ratio()
    }

    /// Average drift (client_time - server_time) across the retained
    /// time-sync history.
    pub fn query_average_drift(&self) -> f64 {
        if self.time_sync.is_empty() {
            return 0.0;
        }
        let sum: i64 = self.time_sync.iter().map(|(s, c)| c - s).sum();
        sum as f64 / self.time_sync.len() as f64
    }
}

impl Default for LagStats {
    fn default() -> Self {
        Self::new()
    }
}

fn summary(ring: &RingStats) -> PingSummary {
    PingSummary {
        min: ring.min().unwrap_or(0),
        avg: ring.avg().unwrap_or(0.0),
        max: ring.max().unwrap_or(0),
        histogram: ring.histogram.clone(),
    }
}
