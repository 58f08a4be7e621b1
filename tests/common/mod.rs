/*!
 * Shared fixtures for the integration tests: an in-process server context
 * over the SQLite memory backend, driven straight through the dispatcher.
 */

use std::sync::atomic::{AtomicI64, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::Document;

use doppeldb::authentication::{Role, UserStore};
use doppeldb::command_processor::{dispatch, CommandRegistry, ConnectionState, ServerContext};
use doppeldb::config::Config;
use doppeldb::cursor_registry::CursorRegistry;
use doppeldb::session_registry::SessionRegistry;
use doppeldb::sqlite_backend::SqliteBackend;

pub fn test_context(auth: bool) -> Arc<ServerContext> {
    let mut config = Config::default();
    config.backend.sqlite_url = Some("sqlite::memory:".to_string());
    config.auth = auth;

    let users = UserStore::default();
    if auth {
        users.create_user("admin", "u1", "pw1", vec![Role::Root]);
        users.create_user("admin", "u2", "pw2", vec![Role::Root]);
    }

    Arc::new(ServerContext {
        config: Arc::new(config),
        backend: Arc::new(SqliteBackend::open_in_memory().expect("sqlite memory backend")),
        cursors: Arc::new(CursorRegistry::new(Duration::from_secs(600))),
        sessions: Arc::new(SessionRegistry::new()),
        users: Arc::new(users),
        registry: CommandRegistry::new(),
        start_time: Instant::now(),
        connections_current: AtomicI64::new(0),
        connections_total: AtomicU64::new(0),
    })
}

pub fn connection(id: u64) -> ConnectionState {
    ConnectionState::new(id, format!("127.0.0.1:{}", 40000 + id))
}

pub async fn run(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    cmd: Document,
) -> Document {
    dispatch(ctx, conn, cmd).await
}

/// Asserts the error-document shape of spec'd failures.
pub fn assert_error(reply: &Document, code: i32, code_name: &str) {
    assert_eq!(reply.get_f64("ok").unwrap(), 0.0, "reply: {:?}", reply);
    assert_eq!(reply.get_i32("code").unwrap(), code, "reply: {:?}", reply);
    assert_eq!(
        reply.get_str("codeName").unwrap(),
        code_name,
        "reply: {:?}",
        reply
    );
}

pub fn assert_ok(reply: &Document) {
    assert_eq!(reply.get_f64("ok").unwrap_or(0.0), 1.0, "reply: {:?}", reply);
    assert!(!reply.contains_key("errmsg"), "reply: {:?}", reply);
}
