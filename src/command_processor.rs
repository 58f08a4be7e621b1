/*!
 * @file command_processor.rs
 * @brief Command dispatch table, shape validation and reply shaping
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::spec::BinarySubtype;
use bson::{doc, Bson, Document};
use futures::FutureExt;
use uuid::Uuid;

use crate::authentication::{CommandKind, ScramConversation, UserStore};
use crate::backend::Backend;
use crate::config::Config;
use crate::cursor_registry::{CursorRegistry, UserId};
use crate::error::{CommandError, CommandResult};
use crate::ordering::type_name;
use crate::session_registry::SessionRegistry;
use crate::{admin_commands, index_commands, query_commands, session_commands, write_commands};

/// Shared server state handed to every handler. Built once at startup and
/// passed by reference; no process-wide singletons.
pub struct ServerContext {
    pub config: Arc<Config>,
    pub backend: Arc<dyn Backend>,
    pub cursors: Arc<CursorRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub users: Arc<UserStore>,
    pub registry: CommandRegistry,
    pub start_time: Instant,
    pub connections_current: AtomicI64,
    pub connections_total: AtomicU64,
}

/// Per-connection mutable state: the auth machine and the active session.
pub struct ConnectionState {
    pub id: u64,
    pub peer: String,
    pub user: Option<UserId>,
    pub sasl: Option<ScramConversation>,
    pub session: Option<Uuid>,
}

impl ConnectionState {
    pub fn new(id: u64, peer: String) -> Self {
        Self {
            id,
            peer,
            user: None,
            sasl: None,
            session: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub kind: CommandKind,
}

/// The dispatch table: command name to authorization class. Built at startup;
/// the handlers themselves are matched in `execute` so their signatures stay
/// plain async fns.
pub struct CommandRegistry {
    commands: HashMap<&'static str, CommandSpec>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            commands: HashMap::new(),
        };
        // Query
        registry.register("find", CommandKind::Read);
        registry.register("getMore", CommandKind::Read);
        registry.register("killCursors", CommandKind::Read);
        registry.register("count", CommandKind::Read);
        registry.register("distinct", CommandKind::Read);
        registry.register("aggregate", CommandKind::Read);
        registry.register("explain", CommandKind::Read);
        // Write
        registry.register("insert", CommandKind::Write);
        registry.register("update", CommandKind::Write);
        registry.register("delete", CommandKind::Write);
        registry.register("findAndModify", CommandKind::Write);
        // Index
        registry.register("createIndexes", CommandKind::Admin);
        registry.register("dropIndexes", CommandKind::Admin);
        registry.register("listIndexes", CommandKind::Read);
        // Admin / meta
        registry.register("hello", CommandKind::Always);
        registry.register("isMaster", CommandKind::Always);
        registry.register("ismaster", CommandKind::Always);
        registry.register("buildInfo", CommandKind::Always);
        registry.register("ping", CommandKind::Always);
        registry.register("whatsmyuri", CommandKind::Always);
        registry.register("serverStatus", CommandKind::Read);
        registry.register("dbStats", CommandKind::Read);
        registry.register("collStats", CommandKind::Read);
        registry.register("connectionStatus", CommandKind::Always);
        registry.register("getParameter", CommandKind::Always);
        registry.register("listDatabases", CommandKind::Read);
        registry.register("listCollections", CommandKind::Read);
        registry.register("create", CommandKind::Write);
        registry.register("drop", CommandKind::Write);
        registry.register("dropDatabase", CommandKind::Write);
        registry.register("renameCollection", CommandKind::Admin);
        // Auth & session
        registry.register("saslStart", CommandKind::Always);
        registry.register("saslContinue", CommandKind::Always);
        registry.register("logout", CommandKind::Always);
        registry.register("startSession", CommandKind::Always);
        registry.register("endSessions", CommandKind::Always);
        registry.register("killSessions", CommandKind::Always);
        registry.register("killAllSessions", CommandKind::Always);
        registry.register("killAllSessionsByPattern", CommandKind::Always);
        registry.register("refreshSessions", CommandKind::Always);
        registry
    }

    fn register(&mut self, name: &'static str, kind: CommandKind) {
        self.commands.insert(name, CommandSpec { name, kind });
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Entry point for one command document. Always returns a reply document;
/// errors are shaped, panics are contained, the connection survives.
pub async fn dispatch(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    cmd: Document,
) -> Document {
    let Some(name) = cmd.keys().next().cloned() else {
        return CommandError::bad_value("empty command document").to_document();
    };

    let db = match cmd.get("$db") {
        None => "admin".to_string(),
        Some(Bson::String(s)) => s.clone(),
        Some(other) => {
            return CommandError::type_mismatch(format!(
                "BSON field '$db' is the wrong type '{}', expected type 'string'",
                type_name(other)
            ))
            .to_document()
        }
    };

    let Some(spec) = ctx.registry.get(&name) else {
        return CommandError::command_not_found(&name).to_document();
    };

    if let Err(e) = ctx
        .users
        .authorize(ctx.config.auth, conn.user.as_ref(), &db, spec.kind, &name)
    {
        return e.to_document();
    }

    // Bind the client-chosen logical session before the handler runs, so the
    // cursors the handler registers are linked to it.
    if let Some(lsid) = cmd.get_document("lsid").ok().and_then(|d| d.get("id")) {
        if let Some(session_id) = binary_uuid(lsid) {
            ctx.sessions.ensure(session_id, conn.user.clone());
            conn.session = Some(session_id);
        }
    }

    metrics::counter!("doppeldb_commands_total").increment(1);

    let result = std::panic::AssertUnwindSafe(execute(ctx, conn, &db, &name, &cmd))
        .catch_unwind()
        .await;
    match result {
        Ok(Ok(mut reply)) => {
            if !reply.contains_key("ok") {
                reply.insert("ok", 1.0);
            }
            reply
        }
        Ok(Err(e)) => e.to_document(),
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(command = %name, db = %db, panic = %detail, "command handler panicked");
            CommandError::internal(format!("command {} failed unexpectedly", name)).to_document()
        }
    }
}

async fn execute(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    db: &str,
    name: &str,
    cmd: &Document,
) -> CommandResult {
    match name {
        "find" => query_commands::find(ctx, conn, db, cmd).await,
        "getMore" => query_commands::get_more(ctx, conn, db, cmd).await,
        "killCursors" => query_commands::kill_cursors(ctx, conn, db, cmd).await,
        "count" => query_commands::count(ctx, db, cmd).await,
        "distinct" => query_commands::distinct(ctx, db, cmd).await,
        "aggregate" => query_commands::aggregate(ctx, conn, db, cmd).await,
        "explain" => query_commands::explain(ctx, db, cmd).await,

        "insert" => write_commands::insert(ctx, db, cmd).await,
        "update" => write_commands::update(ctx, db, cmd).await,
        "delete" => write_commands::delete(ctx, db, cmd).await,
        "findAndModify" => write_commands::find_and_modify(ctx, db, cmd).await,

        "createIndexes" => index_commands::create_indexes(ctx, db, cmd).await,
        "dropIndexes" => index_commands::drop_indexes(ctx, db, cmd).await,
        "listIndexes" => index_commands::list_indexes(ctx, db, cmd).await,

        "hello" => admin_commands::hello(ctx, conn, true).await,
        "isMaster" | "ismaster" => admin_commands::hello(ctx, conn, false).await,
        "buildInfo" => admin_commands::build_info().await,
        "ping" => Ok(doc! {"ok": 1.0}),
        "whatsmyuri" => admin_commands::whatsmyuri(conn).await,
        "serverStatus" => admin_commands::server_status(ctx).await,
        "dbStats" => admin_commands::db_stats(ctx, db).await,
        "collStats" => admin_commands::coll_stats(ctx, db, cmd).await,
        "connectionStatus" => admin_commands::connection_status(ctx, conn, cmd).await,
        "getParameter" => admin_commands::get_parameter(cmd).await,
        "listDatabases" => admin_commands::list_databases(ctx).await,
        "listCollections" => admin_commands::list_collections(ctx, db, cmd).await,
        "create" => admin_commands::create(ctx, db, cmd).await,
        "drop" => admin_commands::drop(ctx, db, cmd).await,
        "dropDatabase" => admin_commands::drop_database(ctx, db).await,
        "renameCollection" => admin_commands::rename_collection(ctx, cmd).await,

        "saslStart" => session_commands::sasl_start(ctx, conn, db, cmd).await,
        "saslContinue" => session_commands::sasl_continue(conn, db, cmd).await,
        "logout" => session_commands::logout(conn).await,
        "startSession" => session_commands::start_session(ctx, conn).await,
        "endSessions" => session_commands::end_sessions(ctx, cmd).await,
        "killSessions" => session_commands::kill_sessions(ctx, conn, cmd).await,
        "killAllSessions" => session_commands::kill_all_sessions(ctx, conn, cmd).await,
        "killAllSessionsByPattern" => {
            session_commands::kill_all_sessions_by_pattern(ctx, conn, cmd).await
        }
        "refreshSessions" => session_commands::refresh_sessions(ctx, cmd).await,

        other => Err(CommandError::command_not_found(other)),
    }
}

// --- shared argument shape helpers ---

/// The collection name every namespaced command carries as its first value.
pub fn collection_name(cmd: &Document, command: &str) -> Result<String, CommandError> {
    match cmd.get(command) {
        Some(Bson::String(s)) => Ok(s.clone()),
        Some(other) => Err(CommandError::type_mismatch(format!(
            "collection name has invalid type {}",
            type_name(other)
        ))),
        None => Err(CommandError::missing_field(command, command)),
    }
}

pub fn optional_document<'a>(
    cmd: &'a Document,
    command: &str,
    field: &str,
) -> Result<Option<&'a Document>, CommandError> {
    match cmd.get(field) {
        None => Ok(None),
        Some(Bson::Document(d)) => Ok(Some(d)),
        Some(other) => Err(CommandError::type_mismatch(format!(
            "BSON field '{}.{}' is the wrong type '{}', expected type 'object'",
            command,
            field,
            type_name(other)
        ))),
    }
}

pub fn optional_bool(cmd: &Document, command: &str, field: &str) -> Result<Option<bool>, CommandError> {
    match cmd.get(field) {
        None => Ok(None),
        Some(Bson::Boolean(b)) => Ok(Some(*b)),
        Some(v) => match crate::ordering::numeric_value(v) {
            Some(n) => Ok(Some(n != 0.0)),
            None => Err(CommandError::type_mismatch(format!(
                "BSON field '{}.{}' is the wrong type '{}', expected types '[bool, long, int, decimal, double]'",
                command,
                field,
                type_name(v)
            ))),
        },
    }
}

/// `maxTimeMS` per the reference: a number in [0, INT32_MAX]; whole-valued
/// doubles accepted, fractional ones rejected, with exact message templates.
pub fn parse_max_time_ms(cmd: &Document) -> Result<u64, CommandError> {
    let value = match cmd.get("maxTimeMS") {
        None => return Ok(0),
        Some(v) => v,
    };
    let n: i64 = match value {
        Bson::Int32(i) => *i as i64,
        Bson::Int64(i) => *i,
        Bson::Double(d) => {
            if d.fract() != 0.0 {
                return Err(CommandError::bad_value("maxTimeMS has non-integral value"));
            }
            if *d < i64::MIN as f64 || *d > i64::MAX as f64 {
                return Err(CommandError::bad_value(format!(
                    "{} value for maxTimeMS is out of range [-2147483648, 2147483647]",
                    d
                )));
            }
            *d as i64
        }
        other => {
            return Err(CommandError::bad_value(format!(
                "maxTimeMS must be a number, got {}",
                type_name(other)
            )))
        }
    };
    if !(0..=i32::MAX as i64).contains(&n) {
        return Err(CommandError::bad_value(format!(
            "{} value for maxTimeMS is out of range [-2147483648, 2147483647]",
            n
        )));
    }
    Ok(n as u64)
}

/// A zero maxTimeMS means "no limit".
pub fn deadline_from(max_time_ms: u64) -> Option<Instant> {
    if max_time_ms == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(max_time_ms))
    }
}

/// `batchSize`: number >= 0; negative values and wrong types have their own
/// canonical codes.
pub fn parse_batch_size(
    cmd: &Document,
    command: &str,
    default: i64,
) -> Result<i64, CommandError> {
    let value = match cmd.get("batchSize") {
        None => return Ok(default),
        Some(v) => v,
    };
    let n = match crate::ordering::numeric_value(value) {
        Some(n) if n.fract() == 0.0 => n as i64,
        Some(_) => {
            return Err(CommandError::location(
                51024,
                format!(
                    "BSON field '{}.batchSize' value must be >= 0, actual value '{}'",
                    command, value
                ),
            ))
        }
        None => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field '{}.batchSize' is the wrong type '{}', expected types '[long, int, decimal, double]'",
                command,
                type_name(value)
            )))
        }
    };
    if n < 0 {
        return Err(CommandError::location(
            51024,
            format!(
                "BSON field '{}.batchSize' value must be >= 0, actual value '{}'",
                command, n
            ),
        ));
    }
    Ok(n)
}

/// The `{cursor: {id, ns, firstBatch|nextBatch}, ok: 1.0}` envelope.
pub fn cursor_reply(ns: &str, id: i64, docs: Vec<Document>, first: bool) -> Document {
    let batch: Vec<Bson> = docs.into_iter().map(Bson::Document).collect();
    let key = if first { "firstBatch" } else { "nextBatch" };
    let mut cursor = Document::new();
    cursor.insert("id", Bson::Int64(id));
    cursor.insert("ns", ns);
    cursor.insert(key, Bson::Array(batch));
    doc! {"cursor": cursor, "ok": 1.0}
}

/// Extracts a 16-byte uuid from a BSON binary with the uuid subtype.
pub fn binary_uuid(v: &Bson) -> Option<Uuid> {
    match v {
        Bson::Binary(bin)
            if bin.subtype == BinarySubtype::Uuid && bin.bytes.len() == 16 =>
        {
            Uuid::from_slice(&bin.bytes).ok()
        }
        _ => None,
    }
}

pub fn uuid_to_binary(id: Uuid) -> Bson {
    Bson::Binary(bson::Binary {
        subtype: BinarySubtype::Uuid,
        bytes: id.as_bytes().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_time_ms_templates() {
        let err = parse_max_time_ms(&doc! {"maxTimeMS": -1}).unwrap_err();
        assert_eq!(err.code, crate::error::code::BAD_VALUE);
        assert_eq!(
            err.message,
            "-1 value for maxTimeMS is out of range [-2147483648, 2147483647]"
        );

        let err = parse_max_time_ms(&doc! {"maxTimeMS": 1.5}).unwrap_err();
        assert_eq!(err.message, "maxTimeMS has non-integral value");

        assert_eq!(parse_max_time_ms(&doc! {"maxTimeMS": 2.0}).unwrap(), 2);
        assert_eq!(parse_max_time_ms(&doc! {}).unwrap(), 0);
        assert!(parse_max_time_ms(&doc! {"maxTimeMS": (i32::MAX as i64 + 1)}).is_err());
    }

    #[test]
    fn batch_size_codes() {
        let err = parse_batch_size(&doc! {"batchSize": -1}, "getMore", 0).unwrap_err();
        assert_eq!(err.code, 51024);
        let err = parse_batch_size(&doc! {"batchSize": "x"}, "getMore", 0).unwrap_err();
        assert_eq!(err.code, crate::error::code::TYPE_MISMATCH);
        assert_eq!(parse_batch_size(&doc! {}, "getMore", 101).unwrap(), 101);
    }

    #[test]
    fn registry_covers_core_commands() {
        let registry = CommandRegistry::new();
        for name in [
            "find",
            "getMore",
            "aggregate",
            "insert",
            "update",
            "delete",
            "findAndModify",
            "createIndexes",
            "hello",
            "saslStart",
            "killAllSessions",
        ] {
            assert!(registry.get(name).is_some(), "missing {}", name);
        }
        assert!(registry.get("mapReduce").is_none());
    }
}
