//! Round-trip latency probing over the session channel.
//!
//! A ping carries the wall-clock milliseconds at which it was sent; the relay
//! echoes the value back in a pong. Only the echo of the most recent ping is
//! accepted, so a late echo of an earlier ping never produces a sample.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::protocol::WireMessage;

/// Wall-clock milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One accepted round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    pub sent_at: u64,
    pub echoed_at: u64,
}

impl LatencySample {
    pub fn round_trip(&self) -> Duration {
        Duration::from_millis(self.echoed_at.saturating_sub(self.sent_at))
    }
}

#[derive(Debug, Default)]
pub struct LatencyProber {
    in_flight: Option<u64>,
}

impl LatencyProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new probe, superseding any unanswered one.
    pub fn issue(&mut self, now_ms: u64) -> WireMessage {
        self.in_flight = Some(now_ms);
        WireMessage::Ping { timestamp: now_ms }
    }

    /// Handle an echoed timestamp. Returns a sample only for the echo of
    /// the most recent ping; anything else is stale and ignored.
    pub fn on_pong(&mut self, timestamp: u64, now_ms: u64) -> Option<LatencySample> {
        if self.in_flight != Some(timestamp) {
            log::debug!("Ignoring stale pong for ping sent at {timestamp}");
            return None;
        }
        self.in_flight = None;
        Some(LatencySample {
            sent_at: timestamp,
            echoed_at: now_ms,
        })
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    /// Forget the outstanding probe (channel went away).
    pub fn reset(&mut self) {
        self.in_flight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_builds_ping() {
        let mut prober = LatencyProber::new();
        assert_eq!(prober.issue(1_000), WireMessage::Ping { timestamp: 1_000 });
        assert_eq!(prober.in_flight(), Some(1_000));
    }

    #[test]
    fn test_matching_pong_yields_sample() {
        let mut prober = LatencyProber::new();
        prober.issue(1_000);
        let sample = prober.on_pong(1_000, 1_042).unwrap();
        assert_eq!(sample.round_trip(), Duration::from_millis(42));
        assert_eq!(prober.in_flight(), None);
    }

    #[test]
    fn test_stale_pong_ignored() {
        let mut prober = LatencyProber::new();
        prober.issue(1_000);
        prober.issue(6_000);

        assert!(prober.on_pong(1_000, 6_010).is_none());
        let sample = prober.on_pong(6_000, 6_020).unwrap();
        assert_eq!(sample.round_trip(), Duration::from_millis(20));
    }

    #[test]
    fn test_duplicate_pong_ignored() {
        let mut prober = LatencyProber::new();
        prober.issue(500);
        assert!(prober.on_pong(500, 510).is_some());
        assert!(prober.on_pong(500, 520).is_none());
    }

    #[test]
    fn test_unsolicited_pong_ignored() {
        let mut prober = LatencyProber::new();
        assert!(prober.on_pong(123, 456).is_none());
    }

    #[test]
    fn test_reset_drops_in_flight() {
        let mut prober = LatencyProber::new();
        prober.issue(10);
        prober.reset();
        assert!(prober.on_pong(10, 20).is_none());
    }

    #[test]
    fn test_clock_skew_saturates() {
        let sample = LatencySample {
            sent_at: 100,
            echoed_at: 90,
        };
        assert_eq!(sample.round_trip(), Duration::ZERO);
    }

    #[test]
    fn test_epoch_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(epoch_millis() > 1_577_836_800_000);
    }
}
