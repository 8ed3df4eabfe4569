use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::provider::{FetchError, SnapshotProvider};
use crate::types::MarketSnapshot;

/// Retry policy for a single poll cycle's fetch.
///
/// Delays are fixed, not exponential, matching the upstream navigation
/// behavior of a constant pause between attempts and a constant settle
/// pause after a page load. Worst-case cycle duration is bounded by
/// `max_attempts * (settle + attempt_timeout + retry_delay)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigatorConfig {
    /// Fetch attempts per cycle before giving up. Clamped to at least 1.
    pub max_attempts: u32,
    /// Upper bound on one provider call.
    pub attempt_timeout_secs: u64,
    /// Fixed pause between failed attempts.
    pub retry_delay_secs: u64,
    /// Fixed settle pause before each attempt, giving the upstream page
    /// time to finish rendering between navigation and extraction.
    pub settle_delay_secs: u64,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_secs: 30,
            retry_delay_secs: 5,
            settle_delay_secs: 2,
        }
    }
}

impl NavigatorConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

/// Wraps a provider's flaky fetch in bounded retries, turning it into a
/// best-effort call that either yields a snapshot or a terminal error for
/// the cycle. Never panics past its boundary; the controller treats a
/// terminal error as "no data this cycle".
pub struct RetryNavigator<P> {
    provider: P,
    config: NavigatorConfig,
}

impl<P: SnapshotProvider> RetryNavigator<P> {
    pub fn new(provider: P, config: NavigatorConfig) -> Self {
        Self { provider, config }
    }

    /// Fetch with retries. Every sleep in here is a plain await, so the
    /// whole call can be cancelled promptly by dropping the future (the
    /// controller races it against the shutdown channel).
    pub async fn fetch(&self) -> Result<MarketSnapshot, FetchError> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_err: Option<FetchError> = None;

        for attempt in 1..=attempts {
            let settle = self.config.settle_delay();
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }

            match tokio::time::timeout(self.config.attempt_timeout(), self.provider.fetch()).await
            {
                Ok(Ok(snapshot)) => {
                    info!(
                        "Fetch attempt {attempt}/{attempts} succeeded — {} entities",
                        snapshot.len()
                    );
                    return Ok(snapshot);
                }
                Ok(Err(e)) => {
                    warn!("Fetch attempt {attempt}/{attempts} failed: {e}");
                    last_err = Some(e);
                }
                Err(_) => {
                    warn!(
                        "Fetch attempt {attempt}/{attempts} timed out after {}s",
                        self.config.attempt_timeout_secs
                    );
                    last_err = Some(FetchError::Timeout);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        Err(last_err
            .unwrap_or_else(|| FetchError::Network("no fetch attempts were made".to_string())))
    }
}
