use super::store::{KeyTtl, KvResult, KvStore};
use bytes::Bytes;
use parking_lot::RwLock;
use pstore_core::KvFailure;
use regex::Regex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const NUM_STRIPES: usize = 256;

/// Stripe owning `key`
fn stripe_id(key: &str) -> usize {
    crc32fast::hash(key.as_bytes()) as usize % NUM_STRIPES
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory stripe
struct Stripe {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl Stripe {
    fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

/// In-process key-value store.
///
/// Keys are spread over 256 stripes by CRC32 so writers to different keys
/// rarely contend. Expired entries are dropped lazily on access or by
/// [`MemoryKvStore::purge_expired`]. Scan cursors are stripe indexes.
pub struct MemoryKvStore {
    stripes: Vec<Stripe>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            stripes: (0..NUM_STRIPES).map(|_| Stripe::new()).collect(),
        }
    }

    fn stripe(&self, key: &str) -> &Stripe {
        &self.stripes[stripe_id(key)]
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.stripes
            .iter()
            .map(|s| s.entries.read().values().filter(|e| e.live(now)).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.stripes
            .iter()
            .map(|s| {
                let mut entries = s.entries.write();
                let before = entries.len();
                entries.retain(|_, e| e.live(now));
                before - entries.len()
            })
            .sum()
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expiry(now: Instant, ttl: Option<Duration>) -> KvResult<Option<Instant>> {
    match ttl {
        Some(d) if d.is_zero() => Err(KvFailure::new("ERR invalid expire time in 'set' command")),
        Some(d) => Ok(Some(now + d)),
        None => Ok(None),
    }
}

/// Translate a Redis glob (`*`, `?`, `[...]`, `\` escapes) to an anchored regex
fn glob_regex(pattern: &str) -> KvResult<Regex> {
    let mut re = String::from("(?s)^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                re.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    re.push('^');
                }
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    if matches!(c, '\\' | '[' | '&' | '~') {
                        re.push('\\');
                    }
                    re.push(c);
                }
                if !closed {
                    return Err(KvFailure::new(format!("ERR unterminated class in pattern '{}'", pattern)));
                }
                re.push(']');
            }
            '\\' => match chars.next() {
                Some(next) => re.push_str(&regex::escape(next.encode_utf8(&mut [0; 4]))),
                None => re.push_str(r"\\"),
            },
            other => re.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| KvFailure::new(format!("ERR bad pattern '{}': {}", pattern, e)))
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> KvResult<Option<Bytes>> {
        let now = Instant::now();
        let entries = self.stripe(key).entries.read();
        Ok(entries
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> KvResult<()> {
        let now = Instant::now();
        let expires_at = expiry(now, ttl)?;
        self.stripe(key)
            .entries
            .write()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    fn set_nx(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> KvResult<bool> {
        let now = Instant::now();
        let expires_at = expiry(now, ttl)?;
        let mut entries = self.stripe(key).entries.write();
        if entries.get(key).is_some_and(|e| e.live(now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(true)
    }

    fn set_xx(&self, key: &str, value: Bytes) -> KvResult<bool> {
        let now = Instant::now();
        let mut entries = self.stripe(key).entries.write();
        match entries.get(key).map(|e| e.live(now)) {
            Some(true) => {
                if let Some(entry) = entries.get_mut(key) {
                    entry.value = value;
                }
                Ok(true)
            }
            Some(false) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn delete(&self, key: &str) -> KvResult<bool> {
        let now = Instant::now();
        let removed = self.stripe(key).entries.write().remove(key);
        Ok(removed.is_some_and(|e| e.live(now)))
    }

    fn scan(&self, cursor: u64, pattern: &str, count: usize) -> KvResult<(u64, Vec<String>)> {
        let mut stripe = usize::try_from(cursor)
            .ok()
            .filter(|&c| c < NUM_STRIPES)
            .ok_or_else(|| KvFailure::new("ERR invalid cursor"))?;
        let regex = glob_regex(pattern)?;
        let now = Instant::now();

        let mut keys = Vec::new();
        while stripe < NUM_STRIPES && keys.len() < count.max(1) {
            let entries = self.stripes[stripe].entries.read();
            keys.extend(
                entries
                    .iter()
                    .filter(|(k, e)| e.live(now) && regex.is_match(k))
                    .map(|(k, _)| k.clone()),
            );
            stripe += 1;
        }

        let next = if stripe >= NUM_STRIPES { 0 } else { stripe as u64 };
        Ok((next, keys))
    }

    fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let now = Instant::now();
        let mut entries = self.stripe(key).entries.write();
        match entries.get(key).map(|e| e.live(now)) {
            Some(true) => {
                if ttl.is_zero() {
                    entries.remove(key);
                } else if let Some(entry) = entries.get_mut(key) {
                    entry.expires_at = Some(now + ttl);
                }
                Ok(true)
            }
            Some(false) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn ttl(&self, key: &str) -> KvResult<KeyTtl> {
        let now = Instant::now();
        let entries = self.stripe(key).entries.read();
        Ok(match entries.get(key).filter(|e| e.live(now)) {
            None => KeyTtl::Missing,
            Some(Entry { expires_at: None, .. }) => KeyTtl::NoExpiry,
            Some(Entry {
                expires_at: Some(at), ..
            }) => KeyTtl::Remaining(at.saturating_duration_since(now)),
        })
    }
}
