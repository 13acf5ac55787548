use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub const DEFAULT_RENEWAL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_DURATION_SECS: u64 = 90;

/// Renewal interval and duration, in seconds, granted to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseTerms {
    pub renewal_interval_secs: u64,
    pub duration_secs: u64,
}

impl Default for LeaseTerms {
    fn default() -> Self {
        Self {
            renewal_interval_secs: DEFAULT_RENEWAL_INTERVAL_SECS,
            duration_secs: DEFAULT_DURATION_SECS,
        }
    }
}

/// A time-bounded promise that a registration will be renewed.
///
/// A lease is expired once more than `duration` has elapsed since the last
/// renewal. Renewal never touches the registered data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    terms: LeaseTerms,
    last_renewal: Instant,
}

impl Lease {
    pub fn new(terms: LeaseTerms) -> Self {
        Self {
            terms,
            last_renewal: Instant::now(),
        }
    }

    pub fn terms(&self) -> LeaseTerms {
        self.terms
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.terms.renewal_interval_secs)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.terms.duration_secs)
    }

    pub fn last_renewal(&self) -> Instant {
        self.last_renewal
    }

    pub fn renew(&mut self) {
        self.last_renewal = Instant::now();
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_renewal) > self.duration()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_strictly_after_duration() {
        let lease = Lease::new(LeaseTerms {
            renewal_interval_secs: 1,
            duration_secs: 3,
        });

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!lease.is_expired());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(lease.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_restarts_the_clock() {
        let mut lease = Lease::new(LeaseTerms::default());
        tokio::time::advance(Duration::from_secs(80)).await;
        lease.renew();
        tokio::time::advance(Duration::from_secs(80)).await;
        assert!(!lease.is_expired());
    }
}
