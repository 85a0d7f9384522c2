use crate::compile::sql::Dialect;
use crate::{Error, Result};
use std::time::Duration;

/// What the document compiler does with a subquery it cannot translate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubqueryPolicy {
    /// Replace the predicate with the always-true filter, log a warning and
    /// record a degradation on the compiled output
    #[default]
    Permissive,
    /// Fail compilation with a Validation error
    Strict,
}

/// Encoding of records stored in a key-value store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordCodec {
    #[default]
    Json,
    Bincode,
}

/// Repository configuration
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// SQL dialect used by the relational compiler
    pub dialect: Dialect,

    pub subquery_policy: SubqueryPolicy,

    /// Namespace prefix for key-value records (`<prefix><entity>:<id>`)
    pub key_prefix: String,

    /// Keys fetched per batch during a key-value scan
    pub scan_batch_size: usize,

    /// Upper bound on keys visited by one key-value scan
    pub max_scan_keys: usize,

    pub record_codec: RecordCodec,

    /// Applied when the caller's context carries no deadline (None = no limit)
    pub default_timeout: Option<Duration>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::Sqlite,
            subquery_policy: SubqueryPolicy::Permissive,
            key_prefix: String::new(),
            scan_batch_size: 100,
            max_scan_keys: 100_000,
            record_codec: RecordCodec::Json,
            default_timeout: None,
        }
    }
}

impl RepositoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_subquery_policy(mut self, policy: SubqueryPolicy) -> Self {
        self.subquery_policy = policy;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_scan_batch_size(mut self, size: usize) -> Self {
        self.scan_batch_size = size;
        self
    }

    pub fn with_max_scan_keys(mut self, max: usize) -> Self {
        self.max_scan_keys = max;
        self
    }

    pub fn with_record_codec(mut self, codec: RecordCodec) -> Self {
        self.record_codec = codec;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.scan_batch_size == 0 {
            return Err(Error::invalid_argument("scan_batch_size must be greater than 0"));
        }

        if self.max_scan_keys == 0 {
            return Err(Error::invalid_argument("max_scan_keys must be greater than 0"));
        }

        if self.key_prefix.contains(['*', '?', '[']) {
            return Err(Error::invalid_argument("key_prefix must not contain glob characters"));
        }

        if let Some(timeout) = self.default_timeout {
            if timeout.is_zero() {
                return Err(Error::invalid_argument("default_timeout must be greater than 0 when set"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RepositoryConfig::default();
        assert_eq!(config.dialect, Dialect::Sqlite);
        assert_eq!(config.subquery_policy, SubqueryPolicy::Permissive);
        assert_eq!(config.record_codec, RecordCodec::Json);
        assert!(config.default_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = RepositoryConfig::new()
            .with_dialect(Dialect::Postgres)
            .with_subquery_policy(SubqueryPolicy::Strict)
            .with_key_prefix("app:")
            .with_scan_batch_size(10)
            .with_max_scan_keys(50)
            .with_record_codec(RecordCodec::Bincode)
            .with_default_timeout(Duration::from_secs(2));

        assert_eq!(config.dialect, Dialect::Postgres);
        assert_eq!(config.key_prefix, "app:");
        assert_eq!(config.scan_batch_size, 10);
        assert_eq!(config.max_scan_keys, 50);
        assert_eq!(config.default_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        assert!(RepositoryConfig::new().with_scan_batch_size(0).validate().is_err());
        assert!(RepositoryConfig::new().with_max_scan_keys(0).validate().is_err());
        assert!(RepositoryConfig::new()
            .with_default_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_glob_prefix() {
        assert!(RepositoryConfig::new().with_key_prefix("app*").validate().is_err());
    }
}
