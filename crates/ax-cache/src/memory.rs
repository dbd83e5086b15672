use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.map(|t| t <= Instant::now()).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// MemoryCache
// ---------------------------------------------------------------------------

/// In-process stand-in for the shared cache.
///
/// Keys carry per-entry TTLs; reads treat expired entries as absent and the
/// sweeper (run on a background interval by the server) reclaims them.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().expect("memory cache lock poisoned")
    }

    pub fn set_text(&self, key: &str, value: String, ttl: Duration) {
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    pub fn get_text(&self, key: &str) -> Option<String> {
        let map = self.lock();
        match map.get(key) {
            Some(e) if !e.expired() => match &e.value {
                Value::Text(s) => Some(s.clone()),
                Value::List(_) => None,
            },
            _ => None,
        }
    }

    /// Append to a text key, creating it when absent; resets the TTL.
    pub fn append_text(&self, key: &str, chunk: &str, ttl: Duration) {
        let mut map = self.lock();
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Text(String::new()),
            expires_at: None,
        });
        if entry.expired() {
            entry.value = Value::Text(String::new());
        }
        if let Value::Text(s) = &mut entry.value {
            s.push_str(chunk);
        }
        entry.expires_at = Some(Instant::now() + ttl);
    }

    pub fn push_list(&self, key: &str, item: String, ttl: Duration) {
        let mut map = self.lock();
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(Vec::new()),
            expires_at: None,
        });
        if entry.expired() {
            entry.value = Value::List(Vec::new());
        }
        if let Value::List(items) = &mut entry.value {
            items.push(item);
        }
        entry.expires_at = Some(Instant::now() + ttl);
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        let map = self.lock();
        match map.get(key) {
            Some(e) if !e.expired() => match &e.value {
                Value::List(items) => items.clone(),
                Value::Text(_) => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Extend a key's TTL without touching the value.
    pub fn touch(&self, key: &str, ttl: Duration) {
        if let Some(entry) = self.lock().get_mut(key) {
            if !entry.expired() {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
    }

    pub fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, e| !e.expired());
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
