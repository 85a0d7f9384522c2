use bytes::Bytes;
use pstore_core::KvFailure;
use std::time::Duration;

pub type KvResult<T> = std::result::Result<T, KvFailure>;

/// Expiry state of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    NoExpiry,
    Remaining(Duration),
}

/// Key-value store client with Redis-like semantics.
///
/// Expired keys behave as missing everywhere.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> KvResult<Option<Bytes>>;

    /// Unconditional write; `ttl` of `None` clears any expiry
    fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> KvResult<()>;

    /// Write only if the key is absent; returns whether it was written
    fn set_nx(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> KvResult<bool>;

    /// Overwrite only if the key exists, keeping its expiry; returns whether
    /// it was written
    fn set_xx(&self, key: &str, value: Bytes) -> KvResult<bool>;

    /// Returns whether a key was removed
    fn delete(&self, key: &str) -> KvResult<bool>;

    /// One step of a cursor scan over keys matching the glob `pattern`.
    ///
    /// Start with cursor 0; a returned cursor of 0 ends the scan. `count` is
    /// a hint, and a key may be reported more than once.
    fn scan(&self, cursor: u64, pattern: &str, count: usize) -> KvResult<(u64, Vec<String>)>;

    /// Returns whether the key existed
    fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;

    fn ttl(&self, key: &str) -> KvResult<KeyTtl>;
}
