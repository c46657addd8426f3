//! Refresh timing policy
//!
//! Safety margin, retry backoff and the escalation floor. Deserializable
//! from millisecond fields so a TOML `[refresh]` table maps onto it
//! directly; every field has a default.

use std::time::Duration;

use rand::RngExt;
use serde::Deserialize;

use crate::error::{Error, Result};

/// How far ahead of expiry the proactive refresh fires.
pub const DEFAULT_MARGIN: Duration = Duration::from_secs(60);

/// First retry delay after a failed fetch.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Retry delay cap.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Remaining lifetime below which failures escalate instead of retrying.
pub const DEFAULT_SAFETY_FLOOR: Duration = Duration::from_secs(5);

/// Timing parameters of the refresh cycle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawPolicy")]
pub struct RefreshPolicy {
    pub margin: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub safety_floor: Duration,
    /// Extra random delay added to each backoff, as a fraction of it (0..=1).
    pub jitter: f64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            margin: DEFAULT_MARGIN,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            safety_floor: DEFAULT_SAFETY_FLOOR,
            jitter: 0.0,
        }
    }
}

impl RefreshPolicy {
    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_safety_floor(mut self, floor: Duration) -> Self {
        self.safety_floor = floor;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Reject policies that cannot drive a sane refresh cycle.
    pub fn validate(&self) -> Result<()> {
        if self.backoff_base.is_zero() {
            return Err(Error::InvalidPolicy("backoff base must be non-zero".into()));
        }
        if self.backoff_base > self.backoff_max {
            return Err(Error::InvalidPolicy(format!(
                "backoff base ({:?}) exceeds backoff max ({:?})",
                self.backoff_base, self.backoff_max
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::InvalidPolicy(format!(
                "jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        if self.safety_floor >= self.margin {
            return Err(Error::InvalidPolicy(format!(
                "safety floor ({:?}) must be shorter than the margin ({:?})",
                self.safety_floor, self.margin
            )));
        }
        Ok(())
    }

    /// Deterministic delay before retry number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .map_or(self.backoff_max, |d| d.min(self.backoff_max))
    }

    /// [`backoff`](Self::backoff) plus jitter. Jitter only lengthens the
    /// delay, and never beyond `backoff_max`.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range(0.0..=self.jitter);
        delay.mul_f64(1.0 + factor).min(self.backoff_max.max(delay))
    }
}

/// Wire shape of [`RefreshPolicy`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPolicy {
    #[serde(default = "default_margin_ms")]
    margin_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    backoff_max_ms: u64,
    #[serde(default = "default_safety_floor_ms")]
    safety_floor_ms: u64,
    #[serde(default)]
    jitter_ratio: f64,
}

fn default_margin_ms() -> u64 {
    DEFAULT_MARGIN.as_millis() as u64
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE.as_millis() as u64
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX.as_millis() as u64
}

fn default_safety_floor_ms() -> u64 {
    DEFAULT_SAFETY_FLOOR.as_millis() as u64
}

impl From<RawPolicy> for RefreshPolicy {
    fn from(raw: RawPolicy) -> Self {
        Self {
            margin: Duration::from_millis(raw.margin_ms),
            backoff_base: Duration::from_millis(raw.backoff_base_ms),
            backoff_max: Duration::from_millis(raw.backoff_max_ms),
            safety_floor: Duration::from_millis(raw.safety_floor_ms),
            jitter: raw.jitter_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let policy = RefreshPolicy::default();
        policy.validate().unwrap();
        assert_eq!(policy.margin, Duration::from_secs(60));
        assert_eq!(policy.safety_floor, Duration::from_secs(5));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RefreshPolicy::default();
        let delays: Vec<u64> = (1..=8).map(|a| policy.backoff(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_never_shortens_or_exceeds_cap() {
        let policy = RefreshPolicy::default().with_jitter(0.5);
        policy.validate().unwrap();
        for attempt in 1..=10 {
            let base = policy.backoff(attempt);
            for _ in 0..20 {
                let jittered = policy.backoff_with_jitter(attempt);
                assert!(jittered >= base, "attempt {attempt}: {jittered:?} < {base:?}");
                assert!(jittered <= policy.backoff_max);
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.backoff_with_jitter(3), Duration::from_secs(4));
    }

    #[test]
    fn validate_rejects_broken_policies() {
        let cases = [
            RefreshPolicy::default().with_backoff(Duration::ZERO, Duration::from_secs(1)),
            RefreshPolicy::default().with_backoff(Duration::from_secs(10), Duration::from_secs(1)),
            RefreshPolicy::default().with_jitter(1.5),
            RefreshPolicy::default().with_jitter(-0.1),
            RefreshPolicy::default().with_safety_floor(Duration::from_secs(60)),
        ];
        for policy in cases {
            assert!(
                matches!(policy.validate(), Err(Error::InvalidPolicy(_))),
                "expected rejection for {policy:?}"
            );
        }
    }

    #[test]
    fn deserializes_from_millisecond_fields() {
        let policy: RefreshPolicy = toml::from_str(
            r#"
margin_ms = 120000
backoff_base_ms = 500
jitter_ratio = 0.2
"#,
        )
        .unwrap();
        assert_eq!(policy.margin, Duration::from_secs(120));
        assert_eq!(policy.backoff_base, Duration::from_millis(500));
        assert_eq!(policy.backoff_max, DEFAULT_BACKOFF_MAX);
        assert_eq!(policy.safety_floor, DEFAULT_SAFETY_FLOOR);
        assert_eq!(policy.jitter, 0.2);
    }

    #[test]
    fn empty_table_yields_defaults() {
        let policy: RefreshPolicy = toml::from_str("").unwrap();
        assert_eq!(policy, RefreshPolicy::default());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: std::result::Result<RefreshPolicy, _> = toml::from_str("margin_secs = 60");
        assert!(result.is_err());
    }
}
