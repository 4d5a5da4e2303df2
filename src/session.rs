//! `CouncilSession` persistence contract. The real store (SQL, document DB)
//! lives with the external HTTP/RPC adapter; this crate only depends on the
//! trait below plus an in-memory reference implementation used for local
//! development and tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::CouncilError;
use crate::model::{AssistantMessage, CouncilSession, Message, Turn};

/// Backend trait for session persistence, following this codebase's pattern
/// of abstracting providers/backends behind an `async_trait` object rather
/// than parameterizing every caller over a concrete type.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, user_id: &str) -> Result<CouncilSession, CouncilError>;
    async fn get(&self, user_id: &str, session_id: &str) -> Result<Option<CouncilSession>, CouncilError>;
    /// Atomically appends the user turn together with its paired assistant
    /// message, persisting the whole session document in one write. This is
    /// the only durability boundary the orchestrator relies on: a user turn
    /// is never written on its own, so a session can never end up with an
    /// orphaned `Turn::User` that has no matching assistant turn.
    async fn append_assistant_message(
        &self,
        user_id: &str,
        session_id: &str,
        user_message: Message,
        message: AssistantMessage,
    ) -> Result<(), CouncilError>;
    async fn set_title(&self, user_id: &str, session_id: &str, title: String) -> Result<(), CouncilError>;
    async fn count_for_user(&self, user_id: &str) -> Result<usize, CouncilError>;
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Reference `SessionStore`: an in-process map guarded by a single mutex,
/// with an optional atomic temp-file-then-rename snapshot to disk on every
/// assistant-message append, mirroring this codebase's persist-then-rename
/// idiom for research/review results.
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<(String, String), CouncilSession>>,
    snapshot_dir: Option<PathBuf>,
    write_counter: AtomicU64,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()), snapshot_dir: None, write_counter: AtomicU64::new(0) }
    }

    pub fn with_snapshot_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            snapshot_dir: Some(dir.into()),
            write_counter: AtomicU64::new(0),
        }
    }

    fn snapshot(&self, session: &CouncilSession) {
        let Some(dir) = &self.snapshot_dir else { return };
        if std::fs::create_dir_all(dir).is_err() {
            return;
        }
        let seq = self.write_counter.fetch_add(1, Ordering::SeqCst);
        let final_path = dir.join(format!("{}_{}.json", session.user_id, session.session_id));
        let tmp_path = dir.join(format!(".tmp_{seq}_{}", session.session_id));
        let Ok(json) = serde_json::to_vec_pretty(session) else { return };
        if write_then_rename(&tmp_path, &final_path, &json).is_err() {
            tracing::warn!(session_id = %session.session_id, "failed to snapshot session to disk");
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn write_then_rename(tmp: &Path, dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(tmp, bytes)?;
    std::fs::rename(tmp, dest)
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, user_id: &str) -> Result<CouncilSession, CouncilError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        let session = CouncilSession {
            user_id: user_id.to_string(),
            session_id: session_id.clone(),
            title: "New conversation".to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let mut guard = self.sessions.lock().expect("session store mutex poisoned");
        guard.insert((user_id.to_string(), session_id), session.clone());
        Ok(session)
    }

    async fn get(&self, user_id: &str, session_id: &str) -> Result<Option<CouncilSession>, CouncilError> {
        let guard = self.sessions.lock().expect("session store mutex poisoned");
        Ok(guard.get(&(user_id.to_string(), session_id.to_string())).cloned())
    }

    async fn append_assistant_message(
        &self,
        user_id: &str,
        session_id: &str,
        user_message: Message,
        message: AssistantMessage,
    ) -> Result<(), CouncilError> {
        let snapshot = {
            let mut guard = self.sessions.lock().expect("session store mutex poisoned");
            let session = guard
                .get_mut(&(user_id.to_string(), session_id.to_string()))
                .ok_or_else(|| CouncilError::SessionNotFound(session_id.to_string()))?;
            session.messages.push(Turn::User(user_message));
            session.messages.push(Turn::Assistant(message));
            session.updated_at = now_millis();
            session.clone()
        };
        self.snapshot(&snapshot);
        Ok(())
    }

    async fn set_title(&self, user_id: &str, session_id: &str, title: String) -> Result<(), CouncilError> {
        let mut guard = self.sessions.lock().expect("session store mutex poisoned");
        let session = guard
            .get_mut(&(user_id.to_string(), session_id.to_string()))
            .ok_or_else(|| CouncilError::SessionNotFound(session_id.to_string()))?;
        session.title = title;
        session.updated_at = now_millis();
        Ok(())
    }

    async fn count_for_user(&self, user_id: &str) -> Result<usize, CouncilError> {
        let guard = self.sessions.lock().expect("session store mutex poisoned");
        Ok(guard.keys().filter(|(u, _)| u == user_id).count())
    }
}
