//! Per-domain politeness limiter.
//!
//! Each hostname gets its own semaphore, created on first use, so two
//! portals sharing a host never exceed `per_domain_max` concurrent runs.
//! Acquisition also spreads traffic with a randomized delay, release is
//! delayed by the cooldown, and rate-block markers map to a linear backoff.

use dashmap::DashMap;
use log::{debug, info};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::IpSafetyConfig;

use super::stop::{StopToken, sleep_with_stop};

/// Text fragments that indicate an IP/rate block rather than a plain error.
const BLOCK_MARKERS: &[&str] = &[
    "429",
    "503",
    "too many requests",
    "rate limit",
    "temporarily blocked",
    "captcha",
];

/// A held domain slot. Call `release` to apply the cooldown before the
/// permit frees up; dropping the guard frees the slot immediately.
pub struct DomainSlot {
    permit: OwnedSemaphorePermit,
    domain: String,
    cooldown: Duration,
}

impl DomainSlot {
    /// Release the slot after the configured cooldown. The cooldown is
    /// skipped when a stop has been requested.
    pub async fn release(self, stop: &StopToken) {
        if !self.cooldown.is_zero() && !stop.is_set() {
            debug!(
                "Cooldown {}s before releasing domain slot for {}",
                self.cooldown.as_secs(),
                self.domain
            );
            sleep_with_stop(self.cooldown, stop).await;
        }
        drop(self.permit);
    }
}

/// Per-hostname concurrency limiter with politeness delays.
pub struct DomainLimiter {
    semaphores: DashMap<String, Arc<Semaphore>>,
    config: IpSafetyConfig,
}

impl DomainLimiter {
    #[must_use]
    pub fn new(config: IpSafetyConfig) -> Self {
        Self {
            semaphores: DashMap::new(),
            config: config.clamped(),
        }
    }

    /// Block until a slot for `domain` is available, then sleep the
    /// randomized IP-safety delay. Returns `None` when stopped while
    /// waiting.
    pub async fn acquire(&self, domain: &str, stop: &StopToken) -> Option<DomainSlot> {
        let semaphore = self
            .semaphores
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_domain_max)))
            .clone();

        debug!(
            "Waiting for domain slot (domain={domain}, per-domain max={})",
            self.config.per_domain_max
        );
        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit.ok()?,
            () = wait_for_stop(stop) => return None,
        };
        debug!("Acquired domain slot for {domain}");

        let delay = self.jitter_delay();
        if !delay.is_zero() {
            info!("IP safety delay {:.1}s for {domain}", delay.as_secs_f64());
            if !sleep_with_stop(delay, stop).await {
                return None;
            }
        }

        Some(DomainSlot {
            permit,
            domain: domain.to_string(),
            cooldown: Duration::from_secs(self.config.cooldown_sec),
        })
    }

    /// Uniform random delay inside the configured min/max window.
    #[must_use]
    pub fn jitter_delay(&self) -> Duration {
        let min = self.config.min_delay_sec;
        let max = self.config.max_delay_sec;
        if max <= 0.0 {
            return Duration::ZERO;
        }
        let secs = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// True iff the error text looks like an IP/rate block.
    #[must_use]
    pub fn is_probable_block(&self, error_text: &str) -> bool {
        let text = error_text.to_lowercase();
        BLOCK_MARKERS.iter().any(|marker| text.contains(marker))
    }

    /// Backoff before retry `attempt` (0-based): `max(cooldown, 5) *
    /// (attempt + 1)` seconds.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.cooldown_sec.max(5);
        Duration::from_secs(base * u64::from(attempt + 1))
    }

    /// Retry budget for probable blocks.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Available permits for a domain, mainly for tests and diagnostics.
    #[must_use]
    pub fn available_slots(&self, domain: &str) -> Option<usize> {
        self.semaphores
            .get(domain)
            .map(|sem| sem.available_permits())
    }
}

async fn wait_for_stop(stop: &StopToken) {
    while !stop.is_set() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
