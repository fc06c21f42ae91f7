//! Configuration
//!
//! One YAML document configures every component. Missing sections and
//! fields fall back to the defaults below. Durations are plain integers with
//! the unit in the field name.
//!
//! ```yaml
//! filter:
//!   expected_insertions: 1000000
//!   false_positive_rate: 0.01
//! reader:
//!   cache_ttl_secs: 1800
//!   lock_ttl_secs: 10
//!   negative_ttl_secs: 120      # omit to disable negative caching
//!   retry:
//!     max_attempts: 200
//!     base_delay_ms: 50
//!     jitter_ms: 25
//! id:
//!   epoch_seconds: 1640995200
//! seckill:
//!   lock_mode: distributed      # or local
//!   lock_ttl_secs: 30
//!   order_key: order
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::{FilterConfig, ReaderConfig, RetryPolicy, CACHE_SHOP_TTL, LOCK_SHOP_TTL};
use crate::error::Result;
use crate::idgen::IdConfig;
use crate::seckill::{SeckillConfig, UserLockMode};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub filter: FilterSection,
    pub reader: ReaderSection,
    pub id: IdConfig,
    pub seckill: SeckillSection,
    /// Redis URL. The in-memory cache store is used when unset.
    pub redis_url: Option<String>,
}

impl GuardConfig {
    /// Load and validate a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.filter_config().validate()?;
        self.reader_config().validate()?;
        self.id.validate()?;
        self.seckill_config().validate()
    }

    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig {
            expected_insertions: self.filter.expected_insertions,
            false_positive_rate: self.filter.false_positive_rate,
        }
    }

    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            cache_ttl: Duration::from_secs(self.reader.cache_ttl_secs),
            lock_ttl: Duration::from_secs(self.reader.lock_ttl_secs),
            retry: self.reader.retry.policy(),
            negative_ttl: self.reader.negative_ttl_secs.map(Duration::from_secs),
        }
    }

    pub fn seckill_config(&self) -> SeckillConfig {
        SeckillConfig {
            lock_mode: self.seckill.lock_mode,
            lock_ttl: Duration::from_secs(self.seckill.lock_ttl_secs),
            lock_retry: self.seckill.retry.policy(),
            order_key: self.seckill.order_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FilterSection {
    pub expected_insertions: u64,
    pub false_positive_rate: f64,
}

impl Default for FilterSection {
    fn default() -> Self {
        let defaults = FilterConfig::default();
        Self {
            expected_insertions: defaults.expected_insertions,
            false_positive_rate: defaults.false_positive_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
}

impl RetrySection {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }

    fn from_policy(policy: &RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            jitter_ms: policy.jitter.as_millis() as u64,
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self::from_policy(&RetryPolicy::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReaderSection {
    pub cache_ttl_secs: u64,
    pub lock_ttl_secs: u64,
    pub negative_ttl_secs: Option<u64>,
    pub retry: RetrySection,
}

impl Default for ReaderSection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: CACHE_SHOP_TTL.as_secs(),
            lock_ttl_secs: LOCK_SHOP_TTL.as_secs(),
            negative_ttl_secs: None,
            retry: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SeckillSection {
    pub lock_mode: UserLockMode,
    pub lock_ttl_secs: u64,
    pub order_key: String,
    pub retry: RetrySection,
}

impl Default for SeckillSection {
    fn default() -> Self {
        let defaults = SeckillConfig::default();
        Self {
            lock_mode: defaults.lock_mode,
            lock_ttl_secs: defaults.lock_ttl.as_secs(),
            order_key: defaults.order_key,
            retry: RetrySection::from_policy(&defaults.lock_retry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = GuardConfig::from_yaml("{}").unwrap();
        assert_eq!(config, GuardConfig::default());
        assert_eq!(config.reader_config(), ReaderConfig::default());
        assert_eq!(config.seckill_config(), SeckillConfig::default());
        assert_eq!(config.filter_config(), FilterConfig::default());
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_partial_override() {
        let yaml = r#"
reader:
  negative_ttl_secs: 120
  retry:
    max_attempts: 5
seckill:
  lock_mode: distributed
redis_url: redis://cache:6379
"#;
        let config = GuardConfig::from_yaml(yaml).unwrap();
        let reader = config.reader_config();
        assert_eq!(reader.negative_ttl, Some(Duration::from_secs(120)));
        assert_eq!(reader.retry.max_attempts, 5);
        assert_eq!(reader.retry.base_delay, Duration::from_millis(50));
        assert_eq!(reader.cache_ttl, CACHE_SHOP_TTL);
        assert_eq!(config.seckill_config().lock_mode, UserLockMode::Distributed);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_rate = "filter:\n  false_positive_rate: 2.0\n";
        assert_matches!(GuardConfig::from_yaml(bad_rate), Err(Error::Config(_)));

        let no_attempts = "reader:\n  retry:\n    max_attempts: 0\n";
        assert_matches!(GuardConfig::from_yaml(no_attempts), Err(Error::Config(_)));
    }

    #[test]
    fn test_malformed_yaml() {
        assert_matches!(
            GuardConfig::from_yaml("seckill:\n  lock_mode: sometimes\n"),
            Err(Error::ConfigParse(_))
        );
    }
}
