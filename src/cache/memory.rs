use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use super::CacheStore;
use crate::error::CacheError;

// In-process cache with Redis glob semantics for SCAN MATCH. A scan
// snapshots the matching keys on cursor 0 and hands them out in batches, so
// keys deleted between steps never shift the remaining ones. A scan the
// caller abandons (an error between steps) is forgotten once its cursor has
// been idle for the scan TTL.

/// Idle time after which an unfinished scan cursor is dropped.
pub const SCAN_CURSOR_TTL: Duration = Duration::from_secs(60);

struct PendingScan {
    keys: VecDeque<String>,
    touched: Instant,
}

pub struct MemoryCache {
    entries: RwLock<BTreeMap<String, (String, Option<Instant>)>>,
    scans: Mutex<HashMap<u64, PendingScan>>,
    last_cursor: AtomicU64,
    scan_ttl: Duration,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            scans: Mutex::new(HashMap::new()),
            last_cursor: AtomicU64::new(0),
            scan_ttl: SCAN_CURSOR_TTL,
        }
    }

    pub fn with_scan_ttl(mut self, ttl: Duration) -> Self {
        self.scan_ttl = ttl;
        self
    }

    /// Unfinished scans still holding a cursor.
    pub async fn pending_scans(&self) -> usize {
        self.scans.lock().await.len()
    }

    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, (_, expires))| expires.map_or(true, |at| at > now))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Translate a Redis glob into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, CacheError> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push_str(&regex::escape(&next.to_string()));
                }
            }
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('^');
                }
                for inner in chars.by_ref() {
                    match inner {
                        ']' => break,
                        '-' => out.push('-'),
                        other => out.push_str(&regex::escape(&other.to_string())),
                    }
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| CacheError::InvalidKey(format!("{}: {}", pattern, e)))
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).and_then(|(value, expires)| match expires {
            Some(at) if *at <= Instant::now() => None,
            _ => Some(value.clone()),
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let expires = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut entries = self.entries.write().await;
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count() as u64)
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError> {
        let mut scans = self.scans.lock().await;
        let ttl = self.scan_ttl;
        scans.retain(|_, scan| scan.touched.elapsed() < ttl);

        let mut remaining = if cursor == 0 {
            let matcher = glob_to_regex(pattern)?;
            let now = Instant::now();
            self.entries
                .read()
                .await
                .iter()
                .filter(|(k, (_, expires))| {
                    expires.map_or(true, |at| at > now) && matcher.is_match(k)
                })
                .map(|(k, _)| k.clone())
                .collect::<VecDeque<String>>()
        } else {
            scans
                .remove(&cursor)
                .map(|scan| scan.keys)
                .ok_or_else(|| CacheError::InvalidKey(format!("unknown scan cursor {}", cursor)))?
        };

        let take = count.max(1).min(remaining.len());
        let batch: Vec<String> = remaining.drain(..take).collect();
        if remaining.is_empty() {
            return Ok((0, batch));
        }

        let next = self.last_cursor.fetch_add(1, Ordering::SeqCst) + 1;
        scans.insert(
            next,
            PendingScan {
                keys: remaining,
                touched: Instant::now(),
            },
        );
        Ok((next, batch))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_translation() {
        let re = glob_to_regex("tenant:t1:products:list:*").unwrap();
        assert!(re.is_match("tenant:t1:products:list:1:20"));
        assert!(!re.is_match("tenant:t12:products:list:1:20"));

        let escaped = glob_to_regex("tenant:t\\*:*").unwrap();
        assert!(escaped.is_match("tenant:t*:x"));
        assert!(!escaped.is_match("tenant:tX:x"));

        let class = glob_to_regex("k[ab]?").unwrap();
        assert!(class.is_match("ka1"));
        assert!(!class.is_match("kc1"));
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_millis(10)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_walks_whole_key_space() {
        let cache = MemoryCache::new();
        for i in 0..250 {
            cache.set(&format!("tenant:t1:k{}", i), "v", Duration::ZERO).await.unwrap();
        }
        cache.set("tenant:t2:k1", "v", Duration::ZERO).await.unwrap();

        let mut cursor = 0;
        let mut found = Vec::new();
        loop {
            let (next, keys) = cache.scan("tenant:t1:*", cursor, 100).await.unwrap();
            found.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(found.len(), 250);
        assert_eq!(cache.pending_scans().await, 0);
    }

    #[tokio::test]
    async fn test_abandoned_scan_cursor_expires() {
        let cache = MemoryCache::new().with_scan_ttl(Duration::from_millis(20));
        for i in 0..150 {
            cache.set(&format!("tenant:t1:k{}", i), "v", Duration::ZERO).await.unwrap();
        }

        // First step only, as when a delete fails halfway through an invalidation.
        let (abandoned, keys) = cache.scan("tenant:t1:*", 0, 100).await.unwrap();
        assert_ne!(abandoned, 0);
        assert_eq!(keys.len(), 100);
        assert_eq!(cache.pending_scans().await, 1);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let (next, _) = cache.scan("tenant:t2:*", 0, 100).await.unwrap();
        assert_eq!(next, 0);
        assert_eq!(cache.pending_scans().await, 0);
        assert!(matches!(
            cache.scan("tenant:t1:*", abandoned, 100).await,
            Err(CacheError::InvalidKey(_))
        ));
    }
}
