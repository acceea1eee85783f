//! Cart engine configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! All optional:
//! - `FARMSTAND_CART_STORAGE_KEY` - Durable storage key for the cart snapshot (default: farmstand-cart)
//! - `FARMSTAND_OVERLAY_PREFIX` - Session storage key prefix for buy-now entries (default: buy-now:)
//! - `FARMSTAND_OVERLAY_TTL_SECS` - Age after which a buy-now entry is stale (default: 1800)
//! - `FARMSTAND_VISIBILITY_MAX_WAIT_MS` - Ceiling for the checkout item wait (default: 3000)
//! - `FARMSTAND_VISIBILITY_POLL_MS` - First poll interval of that wait (default: 100)
//! - `FARMSTAND_VISIBILITY_MAX_POLL_MS` - Largest poll interval after backoff (default: 800)
//! - `FARMSTAND_MAX_LINE_QUANTITY` - Per-line cap for lines that declare none (default: unset)

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_STORAGE_KEY: &str = "farmstand-cart";
pub const DEFAULT_OVERLAY_PREFIX: &str = "buy-now:";
pub const DEFAULT_OVERLAY_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Bounded backoff used while waiting for a buy-now item to reach the checkout view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityPolicy {
    pub max_wait: Duration,
    pub initial_poll: Duration,
    pub max_poll: Duration,
}

impl Default for VisibilityPolicy {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_millis(3_000),
            initial_poll: Duration::from_millis(100),
            max_poll: Duration::from_millis(800),
        }
    }
}

impl VisibilityPolicy {
    /// Delay before poll number `attempt` (0-based): doubled each time, capped at `max_poll`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_poll
            .checked_mul(factor)
            .unwrap_or(self.max_poll)
            .min(self.max_poll)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartConfig {
    pub storage_key: String,
    pub overlay_prefix: String,
    pub overlay_ttl: Duration,
    pub visibility: VisibilityPolicy,
    pub max_line_quantity: Option<u32>,
}

impl Default for CartConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            overlay_prefix: DEFAULT_OVERLAY_PREFIX.to_string(),
            overlay_ttl: DEFAULT_OVERLAY_TTL,
            visibility: VisibilityPolicy::default(),
            max_line_quantity: None,
        }
    }
}

impl CartConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let storage_key = lookup("FARMSTAND_CART_STORAGE_KEY")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.storage_key);
        let overlay_prefix = lookup("FARMSTAND_OVERLAY_PREFIX")
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.overlay_prefix);

        let overlay_ttl = parse_var::<u64, _>(&lookup, "FARMSTAND_OVERLAY_TTL_SECS")?
            .map_or(defaults.overlay_ttl, Duration::from_secs);

        let visibility = VisibilityPolicy {
            max_wait: parse_var::<u64, _>(&lookup, "FARMSTAND_VISIBILITY_MAX_WAIT_MS")?
                .map_or(defaults.visibility.max_wait, Duration::from_millis),
            initial_poll: parse_var::<u64, _>(&lookup, "FARMSTAND_VISIBILITY_POLL_MS")?
                .map_or(defaults.visibility.initial_poll, Duration::from_millis),
            max_poll: parse_var::<u64, _>(&lookup, "FARMSTAND_VISIBILITY_MAX_POLL_MS")?
                .map_or(defaults.visibility.max_poll, Duration::from_millis),
        };
        if visibility.initial_poll.is_zero() {
            return Err(ConfigError::InvalidEnvVar(
                "FARMSTAND_VISIBILITY_POLL_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if visibility.max_poll < visibility.initial_poll {
            return Err(ConfigError::InvalidEnvVar(
                "FARMSTAND_VISIBILITY_MAX_POLL_MS".to_string(),
                "must not be smaller than FARMSTAND_VISIBILITY_POLL_MS".to_string(),
            ));
        }

        let max_line_quantity =
            parse_var::<u32, _>(&lookup, "FARMSTAND_MAX_LINE_QUANTITY")?.filter(|m| *m > 0);

        Ok(Self {
            storage_key,
            overlay_prefix,
            overlay_ttl,
            visibility,
            max_line_quantity,
        })
    }

    pub fn overlay_ttl_ms(&self) -> u64 {
        u64::try_from(self.overlay_ttl.as_millis()).unwrap_or(u64::MAX)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar(name.to_string(), e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = CartConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, CartConfig::default());
        assert_eq!(config.overlay_ttl_ms(), 1_800_000);
    }

    #[test]
    fn reads_every_variable() {
        let config = CartConfig::from_lookup(lookup_from(&[
            ("FARMSTAND_CART_STORAGE_KEY", "market-cart"),
            ("FARMSTAND_OVERLAY_PREFIX", "instant:"),
            ("FARMSTAND_OVERLAY_TTL_SECS", "60"),
            ("FARMSTAND_VISIBILITY_MAX_WAIT_MS", "5000"),
            ("FARMSTAND_VISIBILITY_POLL_MS", "50"),
            ("FARMSTAND_VISIBILITY_MAX_POLL_MS", "400"),
            ("FARMSTAND_MAX_LINE_QUANTITY", "12"),
        ]))
        .unwrap();
        assert_eq!(config.storage_key, "market-cart");
        assert_eq!(config.overlay_prefix, "instant:");
        assert_eq!(config.overlay_ttl, Duration::from_secs(60));
        assert_eq!(config.visibility.max_wait, Duration::from_millis(5000));
        assert_eq!(config.visibility.initial_poll, Duration::from_millis(50));
        assert_eq!(config.visibility.max_poll, Duration::from_millis(400));
        assert_eq!(config.max_line_quantity, Some(12));
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = CartConfig::from_lookup(lookup_from(&[("FARMSTAND_OVERLAY_TTL_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("FARMSTAND_OVERLAY_TTL_SECS"));
    }

    #[test]
    fn rejects_inverted_poll_bounds() {
        let result = CartConfig::from_lookup(lookup_from(&[
            ("FARMSTAND_VISIBILITY_POLL_MS", "500"),
            ("FARMSTAND_VISIBILITY_MAX_POLL_MS", "100"),
        ]));
        assert!(result.is_err());
        let result = CartConfig::from_lookup(lookup_from(&[("FARMSTAND_VISIBILITY_POLL_MS", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn zero_line_cap_means_uncapped() {
        let config =
            CartConfig::from_lookup(lookup_from(&[("FARMSTAND_MAX_LINE_QUANTITY", "0")])).unwrap();
        assert_eq!(config.max_line_quantity, None);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = VisibilityPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(9), Duration::from_millis(800));
        assert_eq!(policy.delay_for(64), Duration::from_millis(800));
    }
}
