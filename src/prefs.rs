//! Persisted runtime preferences.
//!
//! A small JSON key-value file for broker-wide flags that survive restarts,
//! consulted when connections are established.

use std::path::PathBuf;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::warn;

/// Whether new connections default to REPL mirroring.
pub const MIRROR_DEFAULT: &str = "mirror_default";

pub struct Preferences {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl Preferences {
    /// Load the store, starting empty when the file is absent or damaged.
    pub fn load(path: PathBuf) -> Self {
        let values = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Map<String, Value>>(&bytes).ok())
            .unwrap_or_default();
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.lock().get(key).and_then(Value::as_bool)
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        let mut values = self.values.lock();
        values.insert(key.to_string(), Value::Bool(value));
        self.save(&values);
    }

    pub fn mirror_default(&self) -> bool {
        self.get_bool(MIRROR_DEFAULT).unwrap_or(false)
    }

    fn save(&self, values: &Map<String, Value>) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec_pretty(values) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    warn!(path = %self.path.display(), error = %e, "could not persist preferences");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize preferences"),
        }
    }
}
