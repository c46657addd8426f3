//! Credential value types and refresh schedule computation
//!
//! A [`TokenGrant`] is what a fetcher hands back: unvalidated, possibly
//! without an issuance time. A [`Credential`] is the validated, immutable
//! form held by the store. Refreshing produces a new `Credential`; existing
//! ones are never mutated.

use std::time::Duration;

use crate::clock::{Timestamp, duration_ms};
use crate::error::{Error, Result};
use crate::secret::Secret;

/// Validated short-lived credential.
///
/// Invariant: `expires_at > issued_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    value: Secret,
    issued_at: Timestamp,
    expires_at: Timestamp,
}

impl Credential {
    pub fn new(value: impl Into<Secret>, issued_at: Timestamp, expires_at: Timestamp) -> Result<Self> {
        if expires_at <= issued_at {
            return Err(Error::InvalidCredential(format!(
                "expires_at ({expires_at}) must be after issued_at ({issued_at})"
            )));
        }
        Ok(Self {
            value: value.into(),
            issued_at,
            expires_at,
        })
    }

    pub fn value(&self) -> &Secret {
        &self.value
    }

    pub fn issued_at(&self) -> Timestamp {
        self.issued_at
    }

    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    /// Total validity window.
    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.expires_at - self.issued_at)
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: Timestamp) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now))
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Credential as produced by a fetcher, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub value: Secret,
    /// Issuance time; the store stamps its own clock reading when absent.
    pub issued_at: Option<Timestamp>,
    pub expires_at: Timestamp,
}

impl TokenGrant {
    pub fn new(value: impl Into<Secret>, expires_at: Timestamp) -> Self {
        Self {
            value: value.into(),
            issued_at: None,
            expires_at,
        }
    }

    /// Grant issued at `now` and valid for `ttl`, the shape of token
    /// endpoints that answer with a relative `expires_in`.
    pub fn expiring_in(value: impl Into<Secret>, now: Timestamp, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            issued_at: Some(now),
            expires_at: now.saturating_add(duration_ms(ttl)),
        }
    }

    pub fn with_issued_at(mut self, issued_at: Timestamp) -> Self {
        self.issued_at = Some(issued_at);
        self
    }

    /// Validate into a [`Credential`], stamping `now` as issuance time when
    /// the grant carries none.
    pub fn into_credential(self, now: Timestamp) -> Result<Credential> {
        if self.value.is_empty() {
            return Err(Error::InvalidCredential("empty token value".into()));
        }
        Credential::new(self.value, self.issued_at.unwrap_or(now), self.expires_at)
    }
}

impl From<Credential> for TokenGrant {
    fn from(credential: Credential) -> Self {
        Self {
            value: credential.value,
            issued_at: Some(credential.issued_at),
            expires_at: credential.expires_at,
        }
    }
}

/// When the next proactive refresh fires.
///
/// Invariant: `next_fire_at = max(expires_at - margin, now)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSchedule {
    pub next_fire_at: Timestamp,
    pub margin: Duration,
}

impl RefreshSchedule {
    pub fn compute(expires_at: Timestamp, margin: Duration, now: Timestamp) -> Self {
        let target = expires_at.saturating_sub(duration_ms(margin));
        Self {
            next_fire_at: target.max(now),
            margin,
        }
    }

    /// Like [`compute`](Self::compute), but never sooner than `min_gap`
    /// after `now` and never later than `expires_at`.
    pub fn paced(expires_at: Timestamp, margin: Duration, min_gap: Duration, now: Timestamp) -> Self {
        let mut schedule = Self::compute(expires_at, margin, now);
        let earliest = now.saturating_add(duration_ms(min_gap)).min(expires_at.max(now));
        schedule.next_fire_at = schedule.next_fire_at.max(earliest);
        schedule
    }

    pub fn for_credential(credential: &Credential, margin: Duration, now: Timestamp) -> Self {
        Self::compute(credential.expires_at(), margin, now)
    }

    /// Timer delay from `now`; zero means fire immediately.
    pub fn delay(&self, now: Timestamp) -> Duration {
        Duration::from_millis(self.next_fire_at.saturating_sub(now))
    }

    pub fn is_immediate(&self, now: Timestamp) -> bool {
        self.next_fire_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn credential_requires_expiry_after_issuance() {
        assert!(Credential::new("t", 1_000, 2_000).is_ok());
        assert!(matches!(
            Credential::new("t", 2_000, 2_000),
            Err(Error::InvalidCredential(_))
        ));
        assert!(matches!(
            Credential::new("t", 2_000, 1_000),
            Err(Error::InvalidCredential(_))
        ));
    }

    #[test]
    fn grant_without_issuance_is_stamped() {
        let cred = TokenGrant::new("t", 10_000).into_credential(4_000).unwrap();
        assert_eq!(cred.issued_at(), 4_000);
        assert_eq!(cred.lifetime(), Duration::from_secs(6));

        let cred = TokenGrant::new("t", 10_000)
            .with_issued_at(1_000)
            .into_credential(4_000)
            .unwrap();
        assert_eq!(cred.issued_at(), 1_000);
    }

    #[test]
    fn empty_grant_is_invalid() {
        let result = TokenGrant::new("", 10_000).into_credential(0);
        assert!(matches!(result, Err(Error::InvalidCredential(_))));
    }

    #[test]
    fn expiring_in_is_relative_to_now() {
        let grant = TokenGrant::expiring_in("t", 5_000, Duration::from_secs(900));
        assert_eq!(grant.issued_at, Some(5_000));
        assert_eq!(grant.expires_at, 905_000);
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let cred = Credential::new("t", 0, 1_000).unwrap();
        assert_eq!(cred.remaining(400), Duration::from_millis(600));
        assert_eq!(cred.remaining(5_000), Duration::ZERO);
        assert!(!cred.is_expired(999));
        assert!(cred.is_expired(1_000));
    }

    #[test]
    fn schedule_fires_margin_before_expiry() {
        // 15 minute token, 1 minute margin.
        let schedule = RefreshSchedule::compute(900_000, MINUTE, 0);
        assert_eq!(schedule.next_fire_at, 840_000);
        assert_eq!(schedule.delay(0), Duration::from_millis(840_000));
        assert!(!schedule.is_immediate(0));

        // Recomputed later in the credential's life, the delay shrinks accordingly.
        assert_eq!(schedule.delay(800_000), Duration::from_millis(40_000));
    }

    #[test]
    fn schedule_delay_matches_remaining_minus_margin() {
        for (now, expires_at) in [(0, 61_001), (12_345, 500_000), (1_700_000_000_000, 1_700_003_600_000)] {
            let schedule = RefreshSchedule::compute(expires_at, MINUTE, now);
            assert_eq!(
                schedule.delay(now),
                Duration::from_millis(expires_at - 60_000 - now)
            );
            assert!(schedule.next_fire_at > now);
        }
    }

    #[test]
    fn schedule_within_margin_is_immediate() {
        for (now, expires_at) in [(0, 60_000), (0, 30_000), (10_000, 5_000), (0, 0)] {
            let schedule = RefreshSchedule::compute(expires_at, MINUTE, now);
            assert_eq!(schedule.next_fire_at, now);
            assert!(schedule.is_immediate(now));
            assert_eq!(schedule.delay(now), Duration::ZERO);
        }
    }

    #[test]
    fn paced_schedule_holds_off_inside_margin() {
        // 30s token, 60s margin: compute says now, pacing says 15s from now.
        let schedule = RefreshSchedule::paced(30_000, MINUTE, Duration::from_secs(15), 0);
        assert_eq!(schedule.next_fire_at, 15_000);

        // Outside the margin pacing changes nothing.
        let schedule = RefreshSchedule::paced(900_000, MINUTE, Duration::from_secs(15), 0);
        assert_eq!(schedule.next_fire_at, 840_000);

        // Never past expiry.
        let schedule = RefreshSchedule::paced(2_000, MINUTE, Duration::from_secs(15), 0);
        assert_eq!(schedule.next_fire_at, 2_000);
    }
}
