//! Subprocess-path result cache.
//!
//! Keying and eviction policy are resolved here (see `DESIGN.md`): entries are
//! keyed by the normalized `(code, context, permission set)` triple, since
//! that triple is exactly what determines a subprocess run's output for
//! side-effect-free snippets, which is the population this cache is worth
//! applying to; entries older than `ttl_seconds` are treated as absent, and
//! insertion evicts the oldest entry once `max_entries` is reached. The
//! isolate path is cheap enough per-run that it is never consulted here
//!.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use cellrun_protocol::ExecutionResult;
use cellrun_protocol::PermissionSet;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    code: String,
    context: String,
    permission_set: String,
}

fn cache_key(code: &str, context: &HashMap<String, Value>, permission_set: PermissionSet) -> CacheKey {
    let mut entries: Vec<(&String, &Value)> = context.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    let context = serde_json::to_string(&entries).unwrap_or_default();
    CacheKey {
        code: code.to_string(),
        context,
        permission_set: format!("{permission_set:?}"),
    }
}

struct Entry {
    result: ExecutionResult,
    inserted_at: Instant,
    insertion_order: u64,
}

pub struct SubprocessResultCache {
    max_entries: usize,
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, Entry>>,
    next_order: Mutex<u64>,
}

impl SubprocessResultCache {
    pub fn new(max_entries: usize, ttl_seconds: u64) -> Self {
        Self {
            max_entries,
            ttl: Duration::from_secs(ttl_seconds),
            entries: Mutex::new(HashMap::new()),
            next_order: Mutex::new(0),
        }
    }

    pub fn get(
        &self,
        code: &str,
        context: &HashMap<String, Value>,
        permission_set: PermissionSet,
    ) -> Option<ExecutionResult> {
        let key = cache_key(code, context, permission_set);
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(&key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.result.clone())
    }

    pub fn put(
        &self,
        code: &str,
        context: &HashMap<String, Value>,
        permission_set: PermissionSet,
        result: ExecutionResult,
    ) {
        if self.max_entries == 0 {
            return;
        }
        let key = cache_key(code, context, permission_set);
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.insertion_order)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&oldest_key);
            }
        }
        let insertion_order = {
            let Ok(mut next_order) = self.next_order.lock() else {
                return;
            };
            let order = *next_order;
            *next_order += 1;
            order
        };
        entries.insert(
            key,
            Entry {
                result,
                inserted_at: Instant::now(),
                insertion_order,
            },
        );
    }
}
