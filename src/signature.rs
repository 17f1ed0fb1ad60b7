use serde_json::Value;
use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Mutex,
};

/// Normalizes a message body for stable hashing: whitespace stripped from
/// strings, object keys visited in sorted order, arrays concatenated.
pub fn normalize_content(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.split_whitespace().collect(),
        Value::Array(items) => items.iter().map(normalize_content).collect(),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = String::new();
            for key in keys {
                out.push_str(key);
                out.push_str(&normalize_content(&map[key]));
            }
            out
        }
    }
}

/// 32-bit rolling hash over the normalized content, rendered as lowercase
/// hex. Only internal consistency matters: the same message must always
/// produce the same cache key.
pub fn hash_message(value: &Value) -> String {
    let normalized = normalize_content(value);
    let mut hash: i32 = 0;
    for unit in normalized.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(unit as i32);
    }
    format!("{:x}", (hash as i64).abs())
}

struct Inner {
    map: HashMap<String, String>,
    last: Option<String>,
}

/// Durable message-hash -> thought-signature map plus a single "last
/// observed" fallback. Written in full on every update; concurrent requests
/// race on it and last-write-wins is accepted (a stale entry only degrades
/// signature injection to a weaker hint).
pub struct SignatureStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl SignatureStore {
    pub fn load(path: PathBuf) -> Self {
        let map = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<HashMap<String, String>>(&contents) {
                Ok(map) => map,
                Err(err) => {
                    tracing::warn!(error = %err, path = %path.display(), "signature cache unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        tracing::debug!(entries = map.len(), path = %path.display(), "signature cache loaded");
        Self {
            path,
            inner: Mutex::new(Inner { map, last: None }),
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::load(std::env::temp_dir().join(format!(
            "pollinations-proxy-test-signatures-{}-{n}.json",
            std::process::id()
        )))
    }

    pub fn lookup(&self, hash: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("signature lock poisoned")
            .map
            .get(hash)
            .cloned()
    }

    pub fn last(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("signature lock poisoned")
            .last
            .clone()
    }

    /// Lookup by prior-message hash, falling back to the last signature seen
    /// anywhere in this process.
    pub fn lookup_or_last(&self, hash: Option<&str>) -> Option<String> {
        let inner = self.inner.lock().expect("signature lock poisoned");
        hash.and_then(|h| inner.map.get(h).cloned())
            .or_else(|| inner.last.clone())
    }

    pub fn record(&self, hash: &str, signature: &str) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("signature lock poisoned");
            inner.map.insert(hash.to_string(), signature.to_string());
            inner.last = Some(signature.to_string());
            inner.map.clone()
        };
        self.persist(&snapshot);
    }

    fn persist(&self, map: &HashMap<String, String>) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(map).unwrap_or_else(|_| "{}".to_string());
            fs::write(&self.path, contents)
        };
        if let Err(err) = write() {
            tracing::warn!(error = %err, path = %self.path.display(), "failed to persist signature cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_collapses_whitespace_and_sorts_keys() {
        let a = json!({"role": "user", "content": "hello   world"});
        let b = json!({"content": "helloworld", "role": "user"});
        assert_eq!(normalize_content(&a), normalize_content(&b));
        assert_eq!(normalize_content(&a), "contenthelloworldroleuser");
    }

    #[test]
    fn normalize_concatenates_arrays_in_order() {
        let value = json!(["a b", {"k": "c"}, "d"]);
        assert_eq!(normalize_content(&value), "abkcd");
    }

    #[test]
    fn hash_is_stable_across_equivalent_messages() {
        let a = json!({"role": "tool", "content": "result:  42"});
        let b = json!({"content": "result:42", "role": "tool"});
        assert_eq!(hash_message(&a), hash_message(&b));
        assert_ne!(
            hash_message(&a),
            hash_message(&json!({"role": "tool", "content": "result: 43"}))
        );
    }

    #[test]
    fn record_updates_map_and_last() {
        let dir = tempfile::tempdir().unwrap();
        let store = SignatureStore::load(dir.path().join("sigs.json"));
        assert!(store.lookup("abc").is_none());
        assert!(store.last().is_none());

        store.record("abc", "sig-1");
        assert_eq!(store.lookup("abc").as_deref(), Some("sig-1"));
        assert_eq!(store.last().as_deref(), Some("sig-1"));

        store.record("def", "sig-2");
        assert_eq!(store.lookup("abc").as_deref(), Some("sig-1"));
        assert_eq!(store.last().as_deref(), Some("sig-2"));
    }

    #[test]
    fn lookup_or_last_prefers_exact_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = SignatureStore::load(dir.path().join("sigs.json"));
        store.record("abc", "sig-1");
        store.record("def", "sig-2");
        assert_eq!(store.lookup_or_last(Some("abc")).as_deref(), Some("sig-1"));
        assert_eq!(store.lookup_or_last(Some("zzz")).as_deref(), Some("sig-2"));
        assert_eq!(store.lookup_or_last(None).as_deref(), Some("sig-2"));
    }

    #[test]
    fn cache_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sigs.json");
        {
            let store = SignatureStore::load(path.clone());
            store.record("abc", "persisted");
        }
        let store = SignatureStore::load(path);
        assert_eq!(store.lookup("abc").as_deref(), Some("persisted"));
        // The last-observed fallback is process-local, not persisted.
        assert!(store.last().is_none());
    }

    #[test]
    fn corrupt_cache_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sigs.json");
        std::fs::write(&path, "not json at all").unwrap();
        let store = SignatureStore::load(path);
        assert!(store.lookup("anything").is_none());
    }
}
