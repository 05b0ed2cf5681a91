//! Periodic consistency check between the replica and the rendered view.
//!
//! The editor surface that renders the shared text can silently diverge
//! from the replica (a binding that stopped applying updates, a view stuck
//! on its placeholder). The monitor compares the two on every tick and
//! declares the session crashed when:
//!
//! 1. the view has shown nothing for more than `empty_stuck_checks`
//!    consecutive checks while the replica holds text,
//! 2. the view length differs from the replica length by more than
//!    `desync_slack` on two consecutive checks while the replica length
//!    has not moved, or
//! 3. the view cannot be probed at all.
//!
//! A crashed verdict is terminal for the monitor.

use thiserror::Error;

/// What the view currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderedState {
    /// Rendered text length in UTF-16 code units.
    pub len: usize,
    /// The view shows its empty-document placeholder.
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rendered view unavailable: {0}")]
pub struct ViewProbeError(pub String);

/// The editor surface, as seen by the health monitor.
pub trait RenderedView {
    fn probe(&self) -> Result<RenderedState, ViewProbeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Consecutive empty-view checks tolerated while the replica has text.
    pub empty_stuck_checks: u32,
    /// Allowed length difference before a check counts as a mismatch.
    pub desync_slack: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            empty_stuck_checks: 5,
            desync_slack: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashReason {
    EmptyStuck { checks: u32, replica_len: usize },
    SilentDesync { replica_len: usize, rendered_len: usize },
    ProbeFailed(String),
}

impl std::fmt::Display for CrashReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyStuck {
                checks,
                replica_len,
            } => write!(
                f,
                "view empty for {checks} checks while replica holds {replica_len} units"
            ),
            Self::SilentDesync {
                replica_len,
                rendered_len,
            } => write!(
                f,
                "view length {rendered_len} disagrees with replica length {replica_len}"
            ),
            Self::ProbeFailed(reason) => write!(f, "view probe failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// A first mismatch was seen; one more trips the monitor.
    Suspect,
    Crashed(CrashReason),
}

pub struct HealthMonitor {
    thresholds: HealthThresholds,
    empty_checks: u32,
    last_replica_len: Option<usize>,
    strike: bool,
    crashed: Option<CrashReason>,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            empty_checks: 0,
            last_replica_len: None,
            strike: false,
            crashed: None,
        }
    }

    /// Reset counters and remember the replica length at the start of
    /// monitoring, so the first check can already count as stable.
    pub fn prime(&mut self, replica_len: usize) {
        self.empty_checks = 0;
        self.strike = false;
        self.last_replica_len = Some(replica_len);
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.is_some()
    }

    pub fn check(
        &mut self,
        replica_len: usize,
        probe: Result<RenderedState, ViewProbeError>,
    ) -> HealthVerdict {
        if let Some(reason) = &self.crashed {
            return HealthVerdict::Crashed(reason.clone());
        }

        let rendered = match probe {
            Ok(rendered) => rendered,
            Err(e) => return self.trip(CrashReason::ProbeFailed(e.0)),
        };

        if replica_len > 0 && (rendered.placeholder || rendered.len == 0) {
            self.empty_checks += 1;
            if self.empty_checks > self.thresholds.empty_stuck_checks {
                return self.trip(CrashReason::EmptyStuck {
                    checks: self.empty_checks,
                    replica_len,
                });
            }
        } else {
            self.empty_checks = 0;
        }

        let stable = self.last_replica_len == Some(replica_len);
        self.last_replica_len = Some(replica_len);
        let mismatch = replica_len > 0
            && replica_len.abs_diff(rendered.len) > self.thresholds.desync_slack;

        if mismatch && stable {
            if self.strike {
                return self.trip(CrashReason::SilentDesync {
                    replica_len,
                    rendered_len: rendered.len,
                });
            }
            self.strike = true;
            log::warn!(
                "View length {} disagrees with replica length {replica_len}; rechecking",
                rendered.len
            );
            return HealthVerdict::Suspect;
        }

        self.strike = false;
        if self.empty_checks > 0 {
            HealthVerdict::Suspect
        } else {
            HealthVerdict::Healthy
        }
    }

    fn trip(&mut self, reason: CrashReason) -> HealthVerdict {
        log::error!("Session health check failed: {reason}");
        self.crashed = Some(reason.clone());
        HealthVerdict::Crashed(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shown(len: usize) -> Result<RenderedState, ViewProbeError> {
        Ok(RenderedState {
            len,
            placeholder: false,
        })
    }

    fn placeholder() -> Result<RenderedState, ViewProbeError> {
        Ok(RenderedState {
            len: 0,
            placeholder: true,
        })
    }

    fn tolerant() -> HealthThresholds {
        // Slack large enough that an empty view never counts as a mismatch.
        HealthThresholds {
            empty_stuck_checks: 5,
            desync_slack: 1_000,
        }
    }

    #[test]
    fn test_matching_view_is_healthy() {
        let mut monitor = HealthMonitor::new(HealthThresholds::default());
        monitor.prime(12);
        for _ in 0..10 {
            assert_eq!(monitor.check(12, shown(12)), HealthVerdict::Healthy);
        }
    }

    #[test]
    fn test_two_consecutive_mismatches_crash() {
        let mut monitor = HealthMonitor::new(HealthThresholds::default());
        monitor.prime(20);
        assert_eq!(monitor.check(20, shown(5)), HealthVerdict::Suspect);
        assert!(matches!(
            monitor.check(20, shown(5)),
            HealthVerdict::Crashed(CrashReason::SilentDesync {
                replica_len: 20,
                rendered_len: 5
            })
        ));
    }

    #[test]
    fn test_single_mismatch_recovers() {
        let mut monitor = HealthMonitor::new(HealthThresholds::default());
        monitor.prime(20);
        assert_eq!(monitor.check(20, shown(5)), HealthVerdict::Suspect);
        assert_eq!(monitor.check(20, shown(20)), HealthVerdict::Healthy);
        assert_eq!(monitor.check(20, shown(5)), HealthVerdict::Suspect);
        assert!(!monitor.is_crashed());
    }

    #[test]
    fn test_mismatch_while_replica_grows_is_ignored() {
        let mut monitor = HealthMonitor::new(HealthThresholds::default());
        monitor.prime(10);
        assert_eq!(monitor.check(11, shown(10)), HealthVerdict::Healthy);
        assert_eq!(monitor.check(12, shown(11)), HealthVerdict::Healthy);
        assert_eq!(monitor.check(13, shown(12)), HealthVerdict::Healthy);
    }

    #[test]
    fn test_unprimed_first_check_is_not_stable() {
        let mut monitor = HealthMonitor::new(HealthThresholds::default());
        assert_eq!(monitor.check(20, shown(5)), HealthVerdict::Healthy);
        assert_eq!(monitor.check(20, shown(5)), HealthVerdict::Suspect);
    }

    #[test]
    fn test_slack_tolerates_small_difference() {
        let mut monitor = HealthMonitor::new(HealthThresholds {
            empty_stuck_checks: 5,
            desync_slack: 2,
        });
        monitor.prime(20);
        assert_eq!(monitor.check(20, shown(18)), HealthVerdict::Healthy);
        assert_eq!(monitor.check(20, shown(18)), HealthVerdict::Healthy);
    }

    #[test]
    fn test_empty_stuck_trips_after_threshold() {
        let mut monitor = HealthMonitor::new(tolerant());
        monitor.prime(40);
        for _ in 0..5 {
            assert_eq!(monitor.check(40, placeholder()), HealthVerdict::Suspect);
        }
        assert!(matches!(
            monitor.check(40, placeholder()),
            HealthVerdict::Crashed(CrashReason::EmptyStuck { checks: 6, .. })
        ));
    }

    #[test]
    fn test_empty_view_for_empty_replica_is_fine() {
        let mut monitor = HealthMonitor::new(HealthThresholds::default());
        monitor.prime(0);
        for _ in 0..10 {
            assert_eq!(monitor.check(0, placeholder()), HealthVerdict::Healthy);
        }
    }

    #[test]
    fn test_empty_counter_resets_when_view_fills() {
        let mut monitor = HealthMonitor::new(tolerant());
        monitor.prime(40);
        for _ in 0..5 {
            monitor.check(40, placeholder());
        }
        assert_eq!(monitor.check(40, shown(40)), HealthVerdict::Healthy);
        for _ in 0..5 {
            assert_eq!(monitor.check(40, placeholder()), HealthVerdict::Suspect);
        }
    }

    #[test]
    fn test_probe_failure_crashes() {
        let mut monitor = HealthMonitor::new(HealthThresholds::default());
        let verdict = monitor.check(3, Err(ViewProbeError("detached".into())));
        assert_eq!(
            verdict,
            HealthVerdict::Crashed(CrashReason::ProbeFailed("detached".into()))
        );
    }

    #[test]
    fn test_crash_is_terminal() {
        let mut monitor = HealthMonitor::new(HealthThresholds::default());
        monitor.check(3, Err(ViewProbeError("detached".into())));
        assert!(matches!(
            monitor.check(3, shown(3)),
            HealthVerdict::Crashed(_)
        ));
        monitor.prime(3);
        assert!(monitor.is_crashed());
    }
}
