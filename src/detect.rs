//! Statistical detection of stale reads.
//!
//! After the fault sequence (or against an already-running cluster), the
//! detector reads the tracked key over and over and counts how often the
//! superseded value is still served. The resulting frequency is the
//! empirical exposure probability of the consistency hole.

use std::fmt;
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use tokio::time::sleep;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::sequence::Timestamp;
use crate::store::{ConsistencyLevel, Store};

/// One read attempt. Retained only when diagnostics capture is on.
#[derive(Debug, Clone, Serialize)]
pub struct Probe {
    pub sequence: u32,
    pub observed: Option<String>,
    pub at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    HoleFound,
    NoHole,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::HoleFound => write!(f, "hole found"),
            Verdict::NoHole => write!(f, "no hole"),
        }
    }
}

/// Aggregate outcome of one detection run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub attempts: u32,
    /// Probes that returned the stale value. Always `<= attempts`.
    pub matches: u32,
    /// Probes that failed outright (counted as non-matches).
    pub failed_probes: u32,
    /// Per-probe observations, present only when capture was requested.
    pub probes: Option<Vec<Probe>>,
}

impl RunResult {
    /// Fraction of probes that surfaced the stale value; undefined when
    /// no probes were issued.
    pub fn probability(&self) -> Option<f64> {
        if self.attempts == 0 {
            None
        } else {
            Some(f64::from(self.matches) / f64::from(self.attempts))
        }
    }

    /// A single observed stale read is enough to prove the hole.
    pub fn verdict(&self) -> Verdict {
        if self.matches > 0 {
            Verdict::HoleFound
        } else {
            Verdict::NoHole
        }
    }

    /// Human-readable outcome line, probability at two decimals.
    pub fn summary(&self) -> String {
        match self.probability() {
            Some(p) if self.matches > 0 => format!("Hole found! Probability: {:.2}", p),
            _ => "No hole found".to_string(),
        }
    }
}

/// Probes the store for a value that should have been superseded.
pub struct HoleDetector {
    key: String,
    /// Weaker than the replication factor is what makes a divergent
    /// replica's data reachable.
    read_consistency: ConsistencyLevel,
    /// Spacing between probes. Zero samples the recovery window right after
    /// the node restarts; a positive delay stretches sampling across the
    /// store's repair interval.
    probe_delay: Duration,
    capture_probes: bool,
}

impl HoleDetector {
    pub fn new(config: &HarnessConfig) -> Self {
        HoleDetector {
            key: config.key.clone(),
            read_consistency: config.read_consistency,
            probe_delay: config.probe_delay,
            capture_probes: config.capture_probes,
        }
    }

    /// Issue `attempts` reads and tally how many returned `expected_stale`.
    ///
    /// Individual probe failures are tolerated and counted as non-matches;
    /// the run only fails when every single probe failed.
    pub async fn detect<S>(
        &self,
        store: &mut S,
        expected_stale: &str,
        attempts: u32,
    ) -> Result<RunResult>
    where
        S: Store,
    {
        info!(
            "probing key `{}` {} times at {} for stale value `{}`",
            self.key, attempts, self.read_consistency, expected_stale
        );

        let mut matches = 0u32;
        let mut failed = 0u32;
        let mut first_failure: Option<HarnessError> = None;
        let mut probes = if self.capture_probes {
            Some(Vec::with_capacity(attempts as usize))
        } else {
            None
        };

        for sequence in 1..=attempts {
            let observed = match store.read(&self.key, self.read_consistency).await {
                Ok(value) => value,
                Err(err) => {
                    // Intermittent failures are expected while the cluster
                    // is still converging; count as a non-match and move on.
                    debug!("probe {} failed: {}", sequence, err);
                    failed += 1;
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                    None
                }
            };

            if observed.as_deref() == Some(expected_stale) {
                matches += 1;
                debug!("stale value observed ({}/{})", matches, sequence);
            }

            if let Some(list) = probes.as_mut() {
                list.push(Probe {
                    sequence,
                    observed,
                    at: Timestamp::now(),
                });
            }

            if !self.probe_delay.is_zero() && sequence < attempts {
                sleep(self.probe_delay).await;
            }
        }

        if attempts > 0 && failed == attempts {
            let detail = first_failure
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no probe detail".to_string());
            return Err(HarnessError::read(
                format!("key `{}` (all {} probes failed)", self.key, attempts),
                format!("first failure: {}", detail),
            ));
        }

        info!(
            "{} of {} probes returned the stale value ({} failed)",
            matches, attempts, failed
        );

        Ok(RunResult {
            attempts,
            matches,
            failed_probes: failed,
            probes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(attempts: u32, matches: u32) -> RunResult {
        RunResult {
            attempts,
            matches,
            failed_probes: 0,
            probes: None,
        }
    }

    #[test]
    fn test_probability_is_undefined_without_probes() {
        assert_eq!(result(0, 0).probability(), None);
    }

    #[test]
    fn test_probability_stays_within_unit_interval() {
        for (attempts, matches) in [(1, 0), (1, 1), (1000, 32), (1000, 1000)] {
            let p = result(attempts, matches).probability().unwrap();
            assert!((0.0..=1.0).contains(&p), "p = {} out of range", p);
        }
    }

    #[test]
    fn test_single_match_is_a_hole() {
        assert_eq!(result(1000, 0).verdict(), Verdict::NoHole);
        assert_eq!(result(1000, 1).verdict(), Verdict::HoleFound);
    }

    #[test]
    fn test_summary_prints_two_decimals() {
        assert_eq!(
            result(1000, 320).summary(),
            "Hole found! Probability: 0.32"
        );
        assert_eq!(result(1000, 0).summary(), "No hole found");
        assert_eq!(result(0, 0).summary(), "No hole found");
    }

    #[test]
    fn test_verdict_display_is_terse() {
        assert_eq!(Verdict::HoleFound.to_string(), "hole found");
        assert_eq!(Verdict::NoHole.to_string(), "no hole");
    }
}
