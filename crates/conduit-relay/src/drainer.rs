//! Outbox drainer.
//!
//! Sweeps pending outbox rows oldest-first and forwards them to the
//! bus. Individual row failures are bookkept on the row (attempts,
//! last error, next attempt time) and never abort a sweep; only a
//! failure of the outbox storage itself propagates.

use std::{sync::Arc, time::Duration};

use conduit_bus::EventBus;
use conduit_core::{Clock, SystemClock};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    outbox::{OutboxEntry, OutboxStore},
};

/// Tuning for the drainer loop.
#[derive(Debug, Clone)]
pub struct DrainerConfig {
    /// Pause between sweeps when the backlog is empty.
    pub poll_interval: Duration,
    /// Rows claimed per sweep.
    pub batch_size: usize,
    /// Attempts before a row is marked terminally failed.
    pub max_attempts: i32,
    /// Backoff for the first retry; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on the retry backoff.
    pub backoff_cap: Duration,
    /// Wall-clock budget for one background sweep.
    pub sweep_budget: Duration,
    /// Age at which a `publishing` claim is presumed orphaned by a
    /// dead drainer and released back to `pending`.
    pub stale_claim_timeout: Duration,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 32,
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            sweep_budget: Duration::from_secs(30),
            stale_claim_timeout: Duration::from_secs(300),
        }
    }
}

/// Forwards pending outbox rows to the bus.
pub struct OutboxDrainer {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    config: DrainerConfig,
    clock: Arc<dyn Clock>,
}

impl OutboxDrainer {
    /// Creates a drainer over the given store and bus.
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<dyn EventBus>, config: DrainerConfig) -> Self {
        Self::with_clock(store, bus, config, Arc::new(SystemClock))
    }

    /// Creates a drainer with an explicit clock, for tests.
    pub fn with_clock(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        config: DrainerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, bus, config, clock }
    }

    /// Runs one sweep, bounded by `timeout` of wall-clock time.
    ///
    /// Returns the number of rows successfully published. The full
    /// backlog is not guaranteed to drain; whatever did not fit in the
    /// budget stays pending for the next sweep.
    ///
    /// # Errors
    ///
    /// Propagates outbox storage failures. Per-row publish failures are
    /// recorded on the row instead.
    pub async fn drain(&self, timeout: Duration) -> Result<u64> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut published = 0u64;

        // A drainer that died between claiming and settling leaves
        // rows stuck in `publishing`; release any whose claim has
        // outlived the timeout before claiming fresh work.
        let cutoff = self.clock.now_utc()
            - chrono::Duration::from_std(self.config.stale_claim_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let released = self.store.release_stale(cutoff).await?;
        if released > 0 {
            warn!(released, "released stale outbox claims");
        }

        loop {
            let batch =
                self.store.claim_due(self.clock.now_utc(), self.config.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let mut batch = batch.into_iter();
            while let Some(entry) = batch.next() {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    // Out of budget; release this and every remaining
                    // claimed row so the next sweep picks them up
                    // without counting an attempt.
                    for unclaimed in std::iter::once(entry).chain(batch) {
                        self.store
                            .mark_retry(
                                unclaimed.id,
                                unclaimed.attempts,
                                "sweep budget exhausted",
                                self.clock.now_utc(),
                            )
                            .await?;
                    }
                    return Ok(published);
                }

                if self.publish_one(&entry, remaining).await? {
                    published += 1;
                }
            }

            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        debug!(published, "outbox sweep complete");
        Ok(published)
    }

    /// Publishes one claimed row; returns whether it was published.
    async fn publish_one(&self, entry: &OutboxEntry, budget: Duration) -> Result<bool> {
        let envelope = match entry.envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                // Undecodable rows can never publish; fail them
                // terminally rather than retrying forever.
                warn!(id = entry.id, error = %e, "outbox row failed to decode");
                self.store.mark_failed(entry.id, entry.attempts, &e.to_string()).await?;
                return Ok(false);
            },
        };

        let outcome = tokio::time::timeout(budget, self.bus.publish(envelope)).await;
        match outcome {
            Ok(Ok(_)) => {
                self.store.mark_published(entry.id, self.clock.now_utc()).await?;
                Ok(true)
            },
            Ok(Err(e)) => {
                self.record_failure(entry, &e.to_string()).await?;
                Ok(false)
            },
            Err(_) => {
                self.record_failure(entry, "publish timed out").await?;
                Ok(false)
            },
        }
    }

    async fn record_failure(&self, entry: &OutboxEntry, error: &str) -> Result<()> {
        let attempts = entry.attempts + 1;
        if attempts >= self.config.max_attempts {
            warn!(
                id = entry.id,
                topic = %entry.topic,
                attempts,
                error,
                "outbox row failed terminally"
            );
            self.store.mark_failed(entry.id, attempts, error).await
        } else {
            let delay = self.backoff(attempts);
            debug!(
                id = entry.id,
                topic = %entry.topic,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error,
                "outbox publish failed, will retry"
            );
            let next_attempt_at = self.clock.now_utc()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.store.mark_retry(entry.id, attempts, error, next_attempt_at).await
        }
    }

    fn backoff(&self, attempts: i32) -> Duration {
        retry_delay(self.config.backoff_base, self.config.backoff_cap, attempts)
    }

    /// Spawns the background sweep loop until the token is cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("outbox drainer started");
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        info!("outbox drainer stopping");
                        break;
                    }
                    () = self.clock.sleep(self.config.poll_interval) => {
                        match self.drain(self.config.sweep_budget).await {
                            Ok(0) => {},
                            Ok(published) => debug!(published, "outbox drained"),
                            Err(e) => error!(error = %e, "outbox sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

/// Exponential backoff with jitter, capped.
fn retry_delay(base: Duration, cap: Duration, attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16) as u32;
    let uncapped = base.saturating_mul(2u32.saturating_pow(exponent));
    let capped = uncapped.min(cap);
    let jitter: f64 = rand::rng().random_range(0.8..1.2);
    capped.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn delay_doubles_per_attempt_until_the_cap() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);

        assert!(retry_delay(base, cap, 1) < Duration::from_secs(2));
        assert!(retry_delay(base, cap, 3) >= Duration::from_millis(3_200));
        assert!(retry_delay(base, cap, 3) < Duration::from_millis(4_800));
        // 2^9 seconds blows past the cap.
        assert!(retry_delay(base, cap, 10) <= cap.mul_f64(1.2));
    }

    proptest! {
        #[test]
        fn delay_stays_within_the_jittered_cap(
            base_ms in 1u64..10_000,
            cap_ms in 1u64..600_000,
            attempts in 1i32..1_000,
        ) {
            let base = Duration::from_millis(base_ms);
            let cap = Duration::from_millis(cap_ms);
            let delay = retry_delay(base, cap, attempts);

            prop_assert!(delay <= cap.mul_f64(1.2));
            prop_assert!(delay >= base.min(cap).mul_f64(0.8));
        }

        #[test]
        fn first_attempt_delay_brackets_the_base(base_ms in 1u64..10_000) {
            let base = Duration::from_millis(base_ms);
            let delay = retry_delay(base, Duration::from_secs(600), 1);

            prop_assert!(delay >= base.mul_f64(0.8));
            prop_assert!(delay <= base.mul_f64(1.2));
        }
    }
}
