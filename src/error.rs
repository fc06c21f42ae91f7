//! Error types for Flashguard
//!
//! Business outcomes (entity not found, seckill rejections) are values, not
//! errors. Everything in this enum is a fault that the caller must see.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache guard and the admission pipeline
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Lock Errors
    // =========================================================================
    /// A mutex could not be acquired within the retry budget
    #[error("Lock '{key}' not acquired after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    // =========================================================================
    // Storage Faults
    // =========================================================================
    /// Relational store failure (unreachable, transaction failure, ...)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cache store failure
    #[error("Cache store error: {0}")]
    Cache(String),

    /// Uniqueness constraint violated in the relational store
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Cached or stored value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    // =========================================================================
    // Configuration / Runtime
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for faults of the cache or relational store.
    ///
    /// These are never reported to users as "not found".
    pub fn is_storage_fault(&self) -> bool {
        match self {
            Error::Storage(_) | Error::Cache(_) | Error::Serialization(_) => true,
            #[cfg(feature = "redis")]
            Error::Redis(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_message() {
        let err = Error::LockTimeout {
            key: "lock:shop:1".to_string(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Lock 'lock:shop:1' not acquired after 3 attempts"
        );
        assert!(!err.is_storage_fault());
    }

    #[test]
    fn test_storage_fault_classification() {
        assert!(Error::Storage("down".into()).is_storage_fault());
        assert!(Error::Cache("down".into()).is_storage_fault());
        assert!(!Error::Conflict("dup".into()).is_storage_fault());
        assert!(!Error::Config("bad".into()).is_storage_fault());
    }
}
