/*!
 * @file cursor_registry.rs
 * @brief Server-side cursor table: allocation, batch pumping, expiry
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::Document;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::backend::{Backend, ResultStream};
use crate::error::CommandError;
use crate::wire_protocol::MAX_BSON_OBJECT_SIZE;

/// Owner identity a cursor is checked against when resumed from another
/// connection: authentication database and user name.
pub type UserId = (String, String);

pub struct CursorEntry {
    pub id: i64,
    pub db: String,
    pub coll: String,
    pub session: Option<Uuid>,
    pub user: Option<UserId>,
    pub connection_id: u64,
    created_at: Instant,
    last_touch: Mutex<Instant>,
    killed: AtomicBool,
    connection_closed: AtomicBool,
    // The per-cursor batch lock: two concurrent getMores must not both pull.
    stream: tokio::sync::Mutex<Option<Box<dyn ResultStream>>>,
}

impl CursorEntry {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the creating connection has gone away. Such a cursor is only
    /// resumable by a connection authenticated as the same user.
    pub fn orphaned(&self) -> bool {
        self.connection_closed.load(Ordering::Acquire)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    NotFound,
    Unauthorized,
}

pub struct Batch {
    pub docs: Vec<Document>,
    pub exhausted: bool,
}

/// Pulls up to `batch_size` documents (0 means "all remaining", still capped
/// at one BSON object's worth of bytes per batch). Honors a deadline derived
/// from maxTimeMS.
pub async fn pull_batch(
    stream: &mut Box<dyn ResultStream>,
    batch_size: i64,
    deadline: Option<Instant>,
) -> Result<Batch, CommandError> {
    let mut docs = Vec::new();
    let mut bytes: usize = 0;
    loop {
        if batch_size > 0 && docs.len() as i64 >= batch_size {
            return Ok(Batch {
                docs,
                exhausted: false,
            });
        }
        if let Some(deadline) = deadline {
            if Instant::now() > deadline {
                return Err(CommandError::max_time_expired());
            }
        }
        match stream.next().await? {
            Some(doc) => {
                bytes += bson::to_vec(&doc).map(|v| v.len()).unwrap_or(0);
                docs.push(doc);
                if bytes >= MAX_BSON_OBJECT_SIZE as usize {
                    return Ok(Batch {
                        docs,
                        exhausted: false,
                    });
                }
            }
            None => {
                return Ok(Batch {
                    docs,
                    exhausted: true,
                })
            }
        }
    }
}

pub struct CursorRegistry {
    cursors: Mutex<HashMap<i64, Arc<CursorEntry>>>,
    counter: AtomicI64,
    prefix: i64,
    idle_timeout: Duration,
}

impl CursorRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            counter: AtomicI64::new(1),
            prefix: rand::random::<i64>(),
            idle_timeout,
        }
    }

    /// Allocates a non-zero id that is never reused while the process runs:
    /// a monotonic counter XORed with a per-process random prefix.
    fn allocate_id(&self) -> i64 {
        loop {
            let id = self.counter.fetch_add(1, Ordering::Relaxed) ^ self.prefix;
            if id != 0 {
                return id;
            }
        }
    }

    pub fn create(
        &self,
        stream: Box<dyn ResultStream>,
        db: &str,
        coll: &str,
        session: Option<Uuid>,
        user: Option<UserId>,
        connection_id: u64,
    ) -> i64 {
        let id = self.allocate_id();
        let entry = Arc::new(CursorEntry {
            id,
            db: db.to_string(),
            coll: coll.to_string(),
            session,
            user,
            connection_id,
            created_at: Instant::now(),
            last_touch: Mutex::new(Instant::now()),
            killed: AtomicBool::new(false),
            connection_closed: AtomicBool::new(false),
            stream: tokio::sync::Mutex::new(Some(stream)),
        });
        self.cursors.lock().insert(id, entry);
        metrics::gauge!("doppeldb_cursors_open").increment(1.0);
        id
    }

    pub fn open_count(&self) -> usize {
        self.cursors.lock().len()
    }

    /// Continues a cursor. Validation order matches the reference: existence,
    /// namespace, ownership, batch lock, source liveness.
    pub async fn get_more(
        &self,
        id: i64,
        db: &str,
        requested_coll: &str,
        batch_size: i64,
        user: Option<&UserId>,
        backend: &dyn Backend,
        deadline: Option<Instant>,
    ) -> Result<(Vec<Document>, i64, String), CommandError> {
        let entry = self
            .cursors
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| CommandError::cursor_not_found(id))?;

        if entry.coll != requested_coll || entry.db != db {
            return Err(CommandError::unauthorized(format!(
                "Requested getMore on namespace '{}.{}', but cursor belongs to a different namespace {}.{}",
                db, requested_coll, entry.db, entry.coll
            )));
        }

        if entry.user.as_ref() != user {
            return Err(CommandError::unauthorized(format!(
                "cursor id {} was created by a different user",
                id
            )));
        }

        let mut guard = entry
            .stream
            .try_lock()
            .map_err(|_| CommandError::cursor_in_use(id))?;

        if !backend.collection_exists(&entry.db, &entry.coll).await? {
            drop(guard);
            self.remove(id);
            return Err(CommandError::query_plan_killed(
                "collection dropped between getMore calls",
            ));
        }

        let stream = match guard.as_mut() {
            Some(stream) => stream,
            None => {
                drop(guard);
                self.remove(id);
                return Err(CommandError::cursor_not_found(id));
            }
        };

        let batch = pull_batch(stream, batch_size, deadline).await?;
        *entry.last_touch.lock() = Instant::now();
        let ns = format!("{}.{}", entry.db, entry.coll);

        if batch.exhausted || entry.killed.load(Ordering::Acquire) {
            *guard = None;
            drop(guard);
            self.remove(id);
            return Ok((batch.docs, 0, ns));
        }
        Ok((batch.docs, id, ns))
    }

    pub fn kill(&self, id: i64, user: Option<&UserId>) -> KillOutcome {
        let entry = match self.cursors.lock().get(&id).cloned() {
            Some(entry) => entry,
            None => return KillOutcome::NotFound,
        };
        if entry.user.as_ref() != user {
            return KillOutcome::Unauthorized;
        }
        self.remove(id);
        KillOutcome::Killed
    }

    pub fn kill_by_session(&self, session: &Uuid) -> Vec<i64> {
        let ids: Vec<i64> = self
            .cursors
            .lock()
            .values()
            .filter(|c| c.session.as_ref() == Some(session))
            .map(|c| c.id)
            .collect();
        for id in &ids {
            self.remove(*id);
        }
        ids
    }

    pub fn kill_by_user(&self, user: &UserId) -> Vec<i64> {
        let ids: Vec<i64> = self
            .cursors
            .lock()
            .values()
            .filter(|c| c.user.as_ref() == Some(user))
            .map(|c| c.id)
            .collect();
        for id in &ids {
            self.remove(*id);
        }
        ids
    }

    pub fn kill_all(&self) -> Vec<i64> {
        let ids: Vec<i64> = self.cursors.lock().keys().copied().collect();
        for id in &ids {
            self.remove(*id);
        }
        ids
    }

    /// On disconnect cursors survive; they may be resumed from another
    /// connection by the same user. The flag is bookkeeping only.
    pub fn mark_connection_closed(&self, connection_id: u64) {
        for entry in self.cursors.lock().values() {
            if entry.connection_id == connection_id {
                entry.connection_closed.store(true, Ordering::Release);
            }
        }
    }

    /// Time-driven maintenance: destroys cursors idle past the timeout.
    /// A cursor mid-batch is only marked; destruction happens when the
    /// in-flight pull returns.
    pub fn tick(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<CursorEntry>> = self
            .cursors
            .lock()
            .values()
            .filter(|c| now.duration_since(*c.last_touch.lock()) > self.idle_timeout)
            .cloned()
            .collect();

        let mut destroyed = 0;
        for entry in expired {
            match entry.stream.try_lock() {
                Ok(mut guard) => {
                    *guard = None;
                    drop(guard);
                    self.remove(entry.id);
                    destroyed += 1;
                }
                Err(_) => {
                    entry.killed.store(true, Ordering::Release);
                }
            }
        }
        destroyed
    }

    fn remove(&self, id: i64) {
        if self.cursors.lock().remove(&id).is_some() {
            metrics::gauge!("doppeldb_cursors_open").decrement(1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VecStream;
    use bson::doc;

    fn stream_of(n: i32) -> Box<dyn ResultStream> {
        Box::new(VecStream::new(
            (0..n).map(|i| doc! {"_id": i}).collect::<Vec<_>>(),
        ))
    }

    #[test]
    fn ids_are_unique_and_non_zero() {
        let reg = CursorRegistry::new(Duration::from_secs(600));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = reg.create(stream_of(0), "db", "c", None, None, 1);
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
    }

    #[tokio::test]
    async fn get_more_checks_namespace_and_exhausts() {
        let reg = CursorRegistry::new(Duration::from_secs(600));
        let backend = crate::sqlite_backend::SqliteBackend::open_in_memory().unwrap();
        backend.create_collection_sync("db", "c").unwrap();

        let id = reg.create(stream_of(3), "db", "c", None, None, 1);

        let err = reg
            .get_more(id, "db", "other", 1, None, &backend, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::code::UNAUTHORIZED);
        assert!(err.message.contains("db.other"));
        assert!(err.message.contains("db.c"));

        let (docs, next_id, ns) = reg
            .get_more(id, "db", "c", 3, None, &backend, None)
            .await
            .unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(next_id, id);
        assert_eq!(ns, "db.c");

        let (docs, next_id, _) = reg
            .get_more(id, "db", "c", 1, None, &backend, None)
            .await
            .unwrap();
        assert!(docs.is_empty());
        assert_eq!(next_id, 0);

        let err = reg
            .get_more(id, "db", "c", 1, None, &backend, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::code::CURSOR_NOT_FOUND);
        assert_eq!(err.message, format!("cursor id {} not found", id));
    }

    #[tokio::test]
    async fn wrong_user_is_unauthorized() {
        let reg = CursorRegistry::new(Duration::from_secs(600));
        let backend = crate::sqlite_backend::SqliteBackend::open_in_memory().unwrap();
        backend.create_collection_sync("db", "c").unwrap();

        let owner = ("admin".to_string(), "u1".to_string());
        let intruder = ("admin".to_string(), "u2".to_string());
        let id = reg.create(stream_of(3), "db", "c", None, Some(owner), 1);

        let err = reg
            .get_more(id, "db", "c", 1, Some(&intruder), &backend, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::code::UNAUTHORIZED);
    }

    #[test]
    fn expiry_tick_removes_idle_cursors() {
        let reg = CursorRegistry::new(Duration::from_millis(0));
        let id = reg.create(stream_of(3), "db", "c", None, None, 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(reg.tick(), 1);
        assert_eq!(reg.kill(id, None), KillOutcome::NotFound);
    }
}
