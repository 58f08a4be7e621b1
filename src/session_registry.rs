/*!
 * @file session_registry.rs
 * @brief Logical session table and kill semantics
 */

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cursor_registry::UserId;

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: Uuid,
    pub user: Option<UserId>,
    pub created_at: Instant,
    pub last_refresh: Instant,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a server-chosen session for `startSession`.
    pub fn start(&self, user: Option<UserId>) -> Uuid {
        let id = Uuid::new_v4();
        self.insert(id, user);
        id
    }

    /// Registers a client-chosen lsid on first sight. MongoDB drivers mint
    /// session ids locally, so most sessions enter this way.
    pub fn ensure(&self, id: Uuid, user: Option<UserId>) {
        let mut sessions = self.sessions.lock();
        sessions.entry(id).or_insert_with(|| SessionEntry {
            id,
            user,
            created_at: Instant::now(),
            last_refresh: Instant::now(),
        });
    }

    fn insert(&self, id: Uuid, user: Option<UserId>) {
        self.sessions.lock().insert(
            id,
            SessionEntry {
                id,
                user,
                created_at: Instant::now(),
                last_refresh: Instant::now(),
            },
        );
    }

    pub fn get(&self, id: &Uuid) -> Option<SessionEntry> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Removes the listed sessions; unknown ids are a no-op so the operation
    /// is idempotent. Returns the sessions that were actually live.
    pub fn kill(&self, ids: &[Uuid]) -> Vec<Uuid> {
        let mut sessions = self.sessions.lock();
        ids.iter()
            .filter(|id| sessions.remove(id).is_some())
            .copied()
            .collect()
    }

    pub fn end(&self, ids: &[Uuid]) -> Vec<Uuid> {
        self.kill(ids)
    }

    pub fn refresh(&self, ids: &[Uuid]) {
        let mut sessions = self.sessions.lock();
        for id in ids {
            if let Some(entry) = sessions.get_mut(id) {
                entry.last_refresh = Instant::now();
            }
        }
    }

    pub fn kill_for_user(&self, user: &UserId) -> Vec<Uuid> {
        let mut sessions = self.sessions.lock();
        let ids: Vec<Uuid> = sessions
            .values()
            .filter(|s| s.user.as_ref() == Some(user))
            .map(|s| s.id)
            .collect();
        for id in &ids {
            sessions.remove(id);
        }
        ids
    }

    pub fn kill_for_uid(&self, uid: &str) -> Vec<Uuid> {
        let mut sessions = self.sessions.lock();
        let ids: Vec<Uuid> = sessions
            .values()
            .filter(|s| {
                s.user
                    .as_ref()
                    .map(|u| user_uid(u) == uid)
                    .unwrap_or(false)
            })
            .map(|s| s.id)
            .collect();
        for id in &ids {
            sessions.remove(id);
        }
        ids
    }

    pub fn kill_all(&self) -> Vec<Uuid> {
        let mut sessions = self.sessions.lock();
        let ids: Vec<Uuid> = sessions.keys().copied().collect();
        sessions.clear();
        ids
    }
}

/// The uid a `killAllSessionsByPattern` pattern may match on: the SHA-256
/// digest of "db.user", hex encoded.
pub fn user_uid(user: &UserId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}.{}", user.0, user.1).as_bytes());
    hex::encode(hasher.finalize())
}
