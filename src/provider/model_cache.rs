// src/provider/model_cache.rs — In-memory /models caching and aggregation
//
// Each provider caches its upstream model list for a few minutes so /models
// fan-out does not hammer upstreams. The gateway-level union dedupes by id,
// keeping the entry from the higher-priority provider.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

const CACHE_TTL: Duration = Duration::from_secs(300);

pub struct ModelCache {
    ttl: Duration,
    state: Mutex<Option<(Instant, Vec<Value>)>>,
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new(CACHE_TTL)
    }
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(None),
        }
    }

    /// The cached list, unless missing or expired. An empty cached list is
    /// treated as a miss so a transiently-empty upstream answer heals.
    pub fn get(&self) -> Option<Vec<Value>> {
        let state = self.state.lock().unwrap();
        match *state {
            Some((at, ref models))
                if at.elapsed() <= self.ttl && !models.is_empty() =>
            {
                Some(models.clone())
            }
            _ => None,
        }
    }

    pub fn put(&self, models: Vec<Value>) {
        *self.state.lock().unwrap() = Some((Instant::now(), models));
    }
}

/// Union model lists from providers in priority order, deduped by `id`.
/// The first (highest-priority) provider's entry wins for a duplicate id.
pub fn union(per_provider: Vec<Vec<Value>>) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for models in per_provider {
        for model in models {
            let Some(id) = model["id"].as_str() else {
                continue;
            };
            if seen.insert(id.to_string()) {
                merged.push(model);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_cache_roundtrip() {
        let cache = ModelCache::default();
        assert!(cache.get().is_none());

        cache.put(vec![json!({"id": "gpt-4o"})]);
        let models = cache.get().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0]["id"], json!("gpt-4o"));
    }

    #[test]
    fn test_cache_expires() {
        let cache = ModelCache::new(Duration::from_secs(0));
        cache.put(vec![json!({"id": "gpt-4o"})]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_empty_list_is_a_miss() {
        let cache = ModelCache::default();
        cache.put(vec![]);
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_union_prefers_higher_priority() {
        let copilot = vec![
            json!({"id": "gpt-4o", "object": "model", "owned_by": "copilot"}),
            json!({"id": "o3-mini", "object": "model"}),
        ];
        let compat = vec![
            json!({"id": "gpt-4o", "object": "model", "owned_by": "compat"}),
            json!({"id": "llama-3.3-70b", "object": "model"}),
        ];

        let merged = union(vec![copilot, compat]);
        assert_eq!(merged.len(), 3);
        // The higher-priority provider's metadata survives the dedupe
        let gpt4o = merged.iter().find(|m| m["id"] == json!("gpt-4o")).unwrap();
        assert_eq!(gpt4o["owned_by"], json!("copilot"));
    }

    #[test]
    fn test_union_skips_entries_without_id() {
        let merged = union(vec![vec![json!({"object": "model"}), json!({"id": "a"})]]);
        assert_eq!(merged.len(), 1);
    }
}
