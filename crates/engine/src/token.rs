//! TokenEstimator (C2, SPEC_FULL.md §4.2).
//!
//! A cheap, deterministic heuristic (~4 characters per token, adjusted for
//! whitespace) — accuracy matters less than determinism, since these numbers
//! only back-fill `Stats` when a provider omits `usage`.

use std::collections::HashMap;

use parking_lot::Mutex;
use sa_domain::tool::{canonical_json, Message, ToolDefinition};

const CHARS_PER_TOKEN: f64 = 4.0;

/// Estimate the token count of a single string.
pub fn estimate(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let non_whitespace = text.chars().filter(|c| !c.is_whitespace()).count() as f64;
    let whitespace = text.chars().filter(|c| c.is_whitespace()).count() as f64;
    // Whitespace is cheap (often merges into the surrounding token), so it
    // only counts a quarter as much as a printable character.
    let weighted = non_whitespace + whitespace * 0.25;
    (weighted / CHARS_PER_TOKEN).ceil().max(1.0) as u64
}

fn estimate_message(msg: &Message) -> u64 {
    let mut total = estimate(&msg.content.extract_all_text());
    if let Some(calls) = &msg.tool_calls {
        for call in calls {
            total += estimate(&call.name) + estimate(&call.arguments_json);
        }
    }
    total
}

fn hash_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Memoizing estimator. Messages are memoized by their position within the
/// history (a message is sealed and immutable once appended, so a given
/// index's estimate never needs to be recomputed); tool definitions are
/// memoized by a hash of their canonical JSON encoding, mirroring the
/// original's `hash(tools_definitions_json)` cache key.
pub struct TokenEstimator {
    message_cache: Mutex<HashMap<usize, u64>>,
    tool_def_cache: Mutex<HashMap<u64, u64>>,
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self {
            message_cache: Mutex::new(HashMap::new()),
            tool_def_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Estimate the total token count of a history, memoizing per-index.
    pub fn estimate_messages(&self, history: &[Message]) -> u64 {
        let mut cache = self.message_cache.lock();
        let mut total = 0u64;
        for (idx, msg) in history.iter().enumerate() {
            let tokens = *cache
                .entry(idx)
                .or_insert_with(|| estimate_message(msg));
            total += tokens;
        }
        total
    }

    /// Estimate the total token count of a set of tool definitions.
    pub fn estimate_tool_definitions(&self, defs: &[ToolDefinition]) -> u64 {
        let mut cache = self.tool_def_cache.lock();
        let mut total = 0u64;
        for def in defs {
            let key = hash_str(&canonical_json(&serde_json::json!({
                "name": def.name,
                "description": def.description,
                "json_schema": def.json_schema,
            })));
            let tokens = *cache.entry(key).or_insert_with(|| {
                estimate(&def.name) + estimate(&def.description) + estimate(&def.json_schema.to_string())
            });
            total += tokens;
        }
        total
    }

    /// Invalidate the message cache. Called by `HistoryStore::reset`, since
    /// indices are reused after a reset.
    pub fn clear_message_cache(&self) {
        self.message_cache.lock().clear();
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}
