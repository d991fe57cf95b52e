//! Thought-signature cache bridging a `tool_use` block emitted on one turn
//! to the (often signature-less) copy the client echoes back on the next.
//!
//! Process-lifetime, bounded, TTL-swept — no cross-process sharing (§9).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::ModelFamily;

const DEFAULT_CAPACITY: usize = 4096;
const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const MIN_SIGNATURE_LENGTH: usize = 8;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct SignatureCache {
    by_tool_use_id: Mutex<HashMap<String, Entry<String>>>,
    by_signature: Mutex<HashMap<String, Entry<ModelFamily>>>,
    capacity: usize,
    ttl: Duration,
}

impl SignatureCache {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_CAPACITY, DEFAULT_TTL)
    }

    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            by_tool_use_id: Mutex::new(HashMap::new()),
            by_signature: Mutex::new(HashMap::new()),
            capacity,
            ttl,
        }
    }

    pub fn record(&self, tool_use_id: &str, signature: &str, family: ModelFamily) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        let now = Instant::now();
        {
            let mut map = self.by_tool_use_id.lock().unwrap();
            sweep_and_cap(&mut map, self.ttl, self.capacity, now);
            map.insert(tool_use_id.to_string(), Entry { value: signature.to_string(), inserted_at: now });
        }
        {
            let mut map = self.by_signature.lock().unwrap();
            sweep_and_cap(&mut map, self.ttl, self.capacity, now);
            map.insert(signature.to_string(), Entry { value: family, inserted_at: now });
        }
    }

    pub fn signature_for_tool_use(&self, tool_use_id: &str) -> Option<String> {
        let map = self.by_tool_use_id.lock().unwrap();
        map.get(tool_use_id)
            .filter(|e| e.inserted_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    /// A signature is valid if it meets the minimum length and (when known)
    /// was previously recorded for this process.
    pub fn is_valid(&self, signature: &str) -> bool {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return false;
        }
        let map = self.by_signature.lock().unwrap();
        map.get(signature).map(|e| e.inserted_at.elapsed() < self.ttl).unwrap_or(true)
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new()
    }
}

fn sweep_and_cap<V>(map: &mut HashMap<String, Entry<V>>, ttl: Duration, capacity: usize, now: Instant) {
    map.retain(|_, entry| now.duration_since(entry.inserted_at) < ttl);
    while map.len() >= capacity {
        let Some(oldest_key) = map
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(k, _)| k.clone())
        else {
            break;
        };
        map.remove(&oldest_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_signature_by_tool_use_id() {
        let cache = SignatureCache::new();
        cache.record("toolu_1", "a-long-enough-signature", ModelFamily::Claude);
        assert_eq!(cache.signature_for_tool_use("toolu_1").as_deref(), Some("a-long-enough-signature"));
    }

    #[test]
    fn rejects_signatures_below_minimum_length() {
        let cache = SignatureCache::new();
        cache.record("toolu_1", "short", ModelFamily::Claude);
        assert_eq!(cache.signature_for_tool_use("toolu_1"), None);
        assert!(!cache.is_valid("short"));
    }

    #[test]
    fn expires_entries_past_ttl() {
        let cache = SignatureCache::with_limits(16, Duration::from_millis(10));
        cache.record("toolu_1", "a-long-enough-signature", ModelFamily::Claude);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.signature_for_tool_use("toolu_1"), None);
    }

    #[test]
    fn evicts_oldest_entry_past_capacity() {
        let cache = SignatureCache::with_limits(2, Duration::from_secs(3600));
        cache.record("toolu_1", "signature-number-one", ModelFamily::Claude);
        cache.record("toolu_2", "signature-number-two", ModelFamily::Claude);
        cache.record("toolu_3", "signature-number-three", ModelFamily::Claude);
        assert_eq!(cache.signature_for_tool_use("toolu_1"), None);
        assert!(cache.signature_for_tool_use("toolu_3").is_some());
    }
}
