//! Single-use nonces for the editor response endpoint.
//!
//! A nonce is issued against a request id, consumed at most once, and
//! swept when it outlives the configured age.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

struct NonceEntry {
    request_id: String,
    issued_at: Instant,
}

/// In-memory store of outstanding nonces.
#[derive(Default)]
pub struct NonceStore {
    entries: Mutex<HashMap<String, NonceEntry>>,
}

impl NonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh nonce correlated to `request_id`.
    pub fn issue(&self, request_id: impl Into<String>) -> String {
        let nonce = format!("{:032x}", rand::rng().random::<u128>());
        self.entries.lock().insert(
            nonce.clone(),
            NonceEntry {
                request_id: request_id.into(),
                issued_at: Instant::now(),
            },
        );
        nonce
    }

    /// Consume a nonce, returning the correlated request id. Each nonce
    /// works exactly once.
    pub fn consume(&self, nonce: &str) -> Option<String> {
        self.entries
            .lock()
            .remove(nonce)
            .map(|entry| entry.request_id)
    }

    /// Drop nonces older than `max_age`.
    pub fn sweep(&self, max_age: Duration) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.issued_at.elapsed() <= max_age);
        let swept = before - entries.len();
        if swept > 0 {
            debug!(swept, "swept expired nonces");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
