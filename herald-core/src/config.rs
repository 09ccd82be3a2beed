//! # Herald Configuration
//!
//! A minimal string key/value store. Feature crates read their typed
//! settings (`BusConfig`, `SchedulerConfig`) out of a [`HeraldConfigSnapshot`]
//! and fall back to their own defaults for anything missing.
//!
//! ```rust
//! use herald_core::HeraldConfig;
//!
//! let mut cfg = HeraldConfig::new();
//! cfg.set("bus.max_delivery_count", "5");
//!
//! let snap = cfg.snapshot();
//! assert_eq!(snap.get_u64("bus.max_delivery_count"), Some(5));
//! ```
//!
//! ## Environment overrides
//! [`HeraldConfig::load_env`] maps `PREFIX__A__B=value` onto `a.b`:
//!
//! ```bash
//! export HERALD__BUS__LOCK_DURATION_MS=30000   # bus.lock_duration_ms
//! ```

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct HeraldConfig {
    values: HashMap<String, String>,
}

impl HeraldConfig {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Set a configuration key to a string value.
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Copy every `PREFIX__SECTION__KEY` variable of the process environment
    /// into the store as `section.key`.
    pub fn load_env(&mut self, prefix: &str) -> usize {
        self.load_vars(prefix, std::env::vars())
    }

    /// Same as [`load_env`](Self::load_env) over an explicit variable list.
    pub fn load_vars<I>(&mut self, prefix: &str, vars: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let head = format!("{prefix}__");
        let mut loaded = 0;
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(&head) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                if normalized.is_empty() {
                    continue;
                }
                self.values.insert(normalized, value);
                loaded += 1;
            }
        }
        loaded
    }

    pub fn snapshot(&self) -> HeraldConfigSnapshot {
        HeraldConfigSnapshot::new(self.values.clone())
    }
}

/// Immutable view handed to components at construction time.
#[derive(Debug, Clone, Default)]
pub struct HeraldConfigSnapshot {
    map: HashMap<String, String>,
}

impl HeraldConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.trim().parse::<bool>().ok())
    }

    /// Millisecond value as a `Duration`.
    pub fn get_duration_ms(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }
}
