use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;

use crate::utils::billing::Usage;

pub mod ollama;
pub mod openai_compat;

/// Round-robin pool of upstream credentials. Rotation spreads load across
/// keys and lets a retry reach for a different credential than the one that
/// just failed.
pub struct KeyPool {
    keys: Vec<String>,
    cursor: AtomicUsize,
}

impl KeyPool {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Next credential in rotation order, or None when the pool is empty.
    pub fn next(&self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        Some(self.keys[index].clone())
    }
}

/// Pulls the `usage` object out of an upstream response body, tolerating its
/// absence. The normalized result always satisfies total = prompt + completion.
pub(crate) fn parse_usage(body: &Value) -> Usage {
    body.get("usage")
        .and_then(|usage| serde_json::from_value::<Usage>(usage.clone()).ok())
        .unwrap_or_default()
        .normalized()
}
