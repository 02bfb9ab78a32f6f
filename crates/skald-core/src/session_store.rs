// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use skald_memory::SensoryState;
use skald_model::Message;

/// One stored session: message log plus free-form metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Session persistence contract.  Failures are `session_error`: callers log
/// them as warnings and keep running — persistence never aborts a turn.
pub trait SessionStore: Send + Sync {
    fn save(
        &self,
        session_id: &str,
        messages: &[Message],
        meta: &serde_json::Value,
    ) -> anyhow::Result<()>;
    fn load(&self, session_id: &str) -> Option<SessionRecord>;
    fn find_latest(&self) -> Option<String>;
    fn list(&self) -> Vec<SessionMeta>;
    fn save_sensory_state(&self, session_id: &str, state: &SensoryState) -> anyhow::Result<()>;
    fn load_sensory_state(&self, session_id: &str) -> Option<SensoryState>;
}

/// Reference implementation: one JSON file per session under a directory.
pub struct JsonSessionStore {
    dir: PathBuf,
}

impl JsonSessionStore {
    pub fn new(dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "cannot create session dir");
        }
        Self { dir }
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn sensory_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.sensory.json"))
    }
}

impl SessionStore for JsonSessionStore {
    fn save(
        &self,
        session_id: &str,
        messages: &[Message],
        meta: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let record = SessionRecord {
            id: session_id.to_string(),
            updated_at: Utc::now(),
            messages: messages.to_vec(),
            meta: meta.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        std::fs::write(self.session_path(session_id), bytes)?;
        Ok(())
    }

    fn load(&self, session_id: &str) -> Option<SessionRecord> {
        let text = std::fs::read_to_string(self.session_path(session_id)).ok()?;
        match serde_json::from_str(&text) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(session = session_id, error = %e, "unreadable session file");
                None
            }
        }
    }

    fn find_latest(&self) -> Option<String> {
        self.list().into_iter().next().map(|m| m.id)
    }

    fn list(&self) -> Vec<SessionMeta> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") || name.ends_with(".sensory.json") {
                continue;
            }
            if let Ok(text) = std::fs::read_to_string(&path) {
                if let Ok(r) = serde_json::from_str::<SessionRecord>(&text) {
                    out.push(SessionMeta {
                        id: r.id,
                        updated_at: r.updated_at,
                        message_count: r.messages.len(),
                    });
                }
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    fn save_sensory_state(&self, session_id: &str, state: &SensoryState) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        std::fs::write(self.sensory_path(session_id), bytes)?;
        Ok(())
    }

    fn load_sensory_state(&self, session_id: &str) -> Option<SensoryState> {
        let text = std::fs::read_to_string(self.sensory_path(session_id)).ok()?;
        serde_json::from_str(&text).ok()
    }
}

/// Discards everything; used when persistence is disabled and in tests.
pub struct NullSessionStore;

impl SessionStore for NullSessionStore {
    fn save(&self, _: &str, _: &[Message], _: &serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
    fn load(&self, _: &str) -> Option<SessionRecord> {
        None
    }
    fn find_latest(&self) -> Option<String> {
        None
    }
    fn list(&self) -> Vec<SessionMeta> {
        Vec::new()
    }
    fn save_sensory_state(&self, _: &str, _: &SensoryState) -> anyhow::Result<()> {
        Ok(())
    }
    fn load_sensory_state(&self, _: &str) -> Option<SensoryState> {
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().to_path_buf());
        let msgs = vec![Message::user("hello"), Message::assistant("hi")];
        store
            .save("s1", &msgs, &serde_json::json!({"rounds": 2}))
            .unwrap();
        let r = store.load("s1").unwrap();
        assert_eq!(r.messages, msgs);
        assert_eq!(r.meta["rounds"], 2);
    }

    #[test]
    fn load_missing_session_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().to_path_buf());
        assert!(store.load("ghost").is_none());
    }

    #[test]
    fn find_latest_prefers_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().to_path_buf());
        store.save("older", &[], &serde_json::Value::Null).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        store.save("newer", &[], &serde_json::Value::Null).unwrap();
        assert_eq!(store.find_latest().as_deref(), Some("newer"));
    }

    #[test]
    fn sensory_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().to_path_buf());
        let state = SensoryState {
            notes: "a note".into(),
            ..Default::default()
        };
        store.save_sensory_state("s1", &state).unwrap();
        assert_eq!(store.load_sensory_state("s1").unwrap(), state);
    }

    #[test]
    fn sensory_files_are_not_listed_as_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().to_path_buf());
        store.save("s1", &[], &serde_json::Value::Null).unwrap();
        store
            .save_sensory_state("s1", &SensoryState::default())
            .unwrap();
        assert_eq!(store.list().len(), 1);
    }
}
