/* src/ratelimit.rs */

use crate::models::{RateKey, RateLimitRule};
use anyhow::{Result, bail};
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Resolved token-bucket parameters for one route.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitParams {
    /// Maximum tokens the bucket holds. 0 disables the limit.
    pub capacity: u32,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
    pub key: RateKey,
}

impl RateLimitParams {
    /// Derives bucket parameters from a config rule: the sustained rate is
    /// `requests / period`, the capacity is the burst if given, else
    /// `requests`.
    pub fn from_rule(rule: &RateLimitRule) -> Result<RateLimitParams> {
        let period = parse_period(&rule.period)?;
        let refill_per_sec = if rule.requests == 0 {
            0.0
        } else {
            f64::from(rule.requests) / period.as_secs_f64()
        };
        Ok(RateLimitParams {
            capacity: rule.burst.unwrap_or(rule.requests),
            refill_per_sec,
            key: rule.key,
        })
    }
}

/// Parses a human-friendly period like `500ms`, `1s`, `2m`, `1h`.
pub fn parse_period(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (value, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => bail!("Period '{}' is missing a unit (ms, s, m, h)", raw),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| anyhow::anyhow!("Period '{}' has no numeric value", raw))?;
    if value == 0 {
        bail!("Period '{}' must be greater than zero", raw);
    }
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => bail!("Unknown period unit '{}' in '{}'", other, raw),
    };
    Ok(duration)
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-key token buckets. The map shards the keys; each check locks only
/// its own bucket, so one hot route cannot serialize the others.
pub struct RateLimiterStore {
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl Default for RateLimiterStore {
    fn default() -> Self {
        RateLimiterStore::new()
    }
}

impl RateLimiterStore {
    pub fn new() -> RateLimiterStore {
        RateLimiterStore {
            buckets: DashMap::new(),
        }
    }

    /// Refills the key's bucket for elapsed time (capped at capacity), then
    /// takes one token if available. Refill and take happen under a single
    /// lock so concurrent checks on the same key cannot double-spend.
    pub fn check(&self, key: &str, params: &RateLimitParams) -> bool {
        if params.capacity == 0 {
            return true;
        }

        let entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: f64::from(params.capacity),
                last_refill: Instant::now(),
            })
        });

        let mut bucket = match entry.lock() {
            Ok(guard) => guard,
            // A poisoned bucket only means a panic mid-check; the state is
            // still a pair of plain numbers, so keep serving.
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * params.refill_per_sec).min(f64::from(params.capacity));
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
