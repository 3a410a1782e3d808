//! Per-peer success/failure tracking, strike-based bans, and pruning of
//! chronically slow peers (spec §4.11).
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const STRIKE_LIMIT: u32 = 3;
const BAN_DURATION: Duration = Duration::from_secs(30 * 60);
const STRIKE_DECAY: Duration = Duration::from_secs(10 * 60);
const RTT_EWMA_ALPHA: f64 = 0.2;

/// Why a peer earned a strike. Three strikes bans it (spec §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrikeCause {
    InfoHashMismatch,
    HashVerificationFailure,
    MalformedMessage,
    OversizedFrame,
    InvalidUtMetadata,
    InvalidDhtToken,
}

#[derive(Debug, Clone)]
pub struct PeerHealth {
    successes: u64,
    failures: u64,
    ewma_rtt: Option<Duration>,
    strikes: u32,
    last_strike_at: Option<Instant>,
    banned_until: Option<Instant>,
    recent_outcomes: VecDeque<bool>,
}

impl Default for PeerHealth {
    fn default() -> Self {
        Self {
            successes: 0,
            failures: 0,
            ewma_rtt: None,
            strikes: 0,
            last_strike_at: None,
            banned_until: None,
            recent_outcomes: VecDeque::with_capacity(32),
        }
    }
}

impl PeerHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, rtt: Duration) {
        self.successes += 1;
        self.push_outcome(true);
        self.ewma_rtt = Some(match self.ewma_rtt {
            None => rtt,
            Some(prev) => {
                let prev_secs = prev.as_secs_f64();
                let rtt_secs = rtt.as_secs_f64();
                Duration::from_secs_f64(RTT_EWMA_ALPHA * rtt_secs + (1.0 - RTT_EWMA_ALPHA) * prev_secs)
            }
        });
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        self.push_outcome(false);
    }

    fn push_outcome(&mut self, ok: bool) {
        if self.recent_outcomes.len() == self.recent_outcomes.capacity() {
            self.recent_outcomes.pop_front();
        }
        self.recent_outcomes.push_back(ok);
    }

    pub fn success_rate(&self) -> Option<f64> {
        let total = self.successes + self.failures;
        if total == 0 {
            None
        } else {
            Some(self.successes as f64 / total as f64)
        }
    }

    pub fn total_failures(&self) -> u64 {
        self.failures
    }

    pub fn ewma_rtt(&self) -> Option<Duration> {
        self.ewma_rtt
    }

    /// Records a strike; strikes older than [`STRIKE_DECAY`] are forgotten
    /// before counting this one, so a peer that behaves for ten minutes gets
    /// a clean slate.
    pub fn strike(&mut self, _cause: StrikeCause, now: Instant) -> bool {
        if let Some(last) = self.last_strike_at {
            if now.duration_since(last) >= STRIKE_DECAY {
                self.strikes = 0;
            }
        }
        self.strikes += 1;
        self.last_strike_at = Some(now);
        if self.strikes >= STRIKE_LIMIT {
            self.banned_until = Some(now + BAN_DURATION);
            true
        } else {
            false
        }
    }

    pub fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| now < until)
    }

    /// Pruning rule: slow (avg RTT > 5s) AND low success rate (< 0.3) over
    /// at least 10 samples (spec §4.11).
    pub fn should_prune(&self) -> bool {
        if self.recent_outcomes.len() < 10 {
            return false;
        }
        let slow = self.ewma_rtt.is_some_and(|rtt| rtt > Duration::from_secs(5));
        let successes = self.recent_outcomes.iter().filter(|&&ok| ok).count();
        let rate = successes as f64 / self.recent_outcomes.len() as f64;
        slow && rate < 0.3
    }
}

/// Backoff schedule for reconnecting a non-banned peer with fewer than 3
/// total failures: `5s * 2^(attempt-1)`, capped at 5 min, giving up after 5
/// attempts (spec §4.11). `attempt` is 1-based.
pub fn reconnect_delay(attempt: u32) -> Option<Duration> {
    const MAX_ATTEMPTS: u32 = 5;
    const CAP: Duration = Duration::from_secs(5 * 60);
    if attempt == 0 || attempt > MAX_ATTEMPTS {
        return None;
    }
    let secs = 5u64.saturating_mul(1u64 << (attempt - 1).min(16));
    Some(Duration::from_secs(secs).min(CAP))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_tracks_ratio() {
        let mut h = PeerHealth::new();
        assert_eq!(h.success_rate(), None);
        h.record_success(Duration::from_millis(50));
        h.record_failure();
        assert_eq!(h.success_rate(), Some(0.5));
    }

    #[test]
    fn third_strike_bans() {
        let mut h = PeerHealth::new();
        let t0 = Instant::now();
        assert!(!h.strike(StrikeCause::MalformedMessage, t0));
        assert!(!h.strike(StrikeCause::MalformedMessage, t0));
        assert!(h.strike(StrikeCause::MalformedMessage, t0));
        assert!(h.is_banned(t0));
        assert!(!h.is_banned(t0 + BAN_DURATION + Duration::from_secs(1)));
    }

    #[test]
    fn strikes_decay_after_ten_minutes() {
        let mut h = PeerHealth::new();
        let t0 = Instant::now();
        h.strike(StrikeCause::MalformedMessage, t0);
        h.strike(StrikeCause::MalformedMessage, t0);
        let later = t0 + STRIKE_DECAY + Duration::from_secs(1);
        assert!(!h.strike(StrikeCause::MalformedMessage, later));
        assert!(!h.is_banned(later));
    }

    #[test]
    fn reconnect_delay_grows_and_expires() {
        assert_eq!(reconnect_delay(1), Some(Duration::from_secs(5)));
        assert_eq!(reconnect_delay(2), Some(Duration::from_secs(10)));
        assert_eq!(reconnect_delay(3), Some(Duration::from_secs(20)));
        assert_eq!(reconnect_delay(6), None);
    }

    #[test]
    fn prune_requires_enough_samples() {
        let mut h = PeerHealth::new();
        for _ in 0..9 {
            h.record_failure();
        }
        assert!(!h.should_prune());
    }
}
