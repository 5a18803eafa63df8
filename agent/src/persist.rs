//! # Persisted warm-start state
//!
//! Spec §6: "Last known server address may be cached to disk to skip
//! the first Wake on warm start. No other durable state." A missing or
//! corrupt file is never fatal — it just means a cold start.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedState {
    pub public_ip: Option<String>,
}

pub fn load(path: &Path) -> PersistedState {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "ignoring corrupt persisted state");
            PersistedState::default()
        }),
        Err(_) => PersistedState::default(),
    }
}

pub fn save(path: &Path, state: &PersistedState) {
    let Ok(text) = serde_json::to_string(state) else { return };
    if let Err(e) = std::fs::write(path, text) {
        warn!(path = %path.display(), error = %e, "failed to persist warm-start state");
    }
}
