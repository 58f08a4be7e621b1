/*!
 * @file admin_commands.rs
 * @brief Handshake, server metadata and namespace administration commands
 */

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bson::{doc, Bson, Document};

use crate::backend::CappedSpec;
use crate::command_processor::{
    collection_name, cursor_reply, optional_document, ConnectionState, ServerContext,
};
use crate::error::{code, CommandError, CommandResult};
use crate::ordering::{numeric_value, type_name};

pub const SERVER_VERSION: &str = "5.0.42";
pub const MAX_WIRE_VERSION: i32 = 17;

pub async fn hello(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    modern: bool,
) -> CommandResult {
    let mut reply = Document::new();
    if modern {
        reply.insert("isWritablePrimary", true);
    } else {
        reply.insert("ismaster", true);
    }
    if let Some(set_name) = &ctx.config.repl_set_name {
        reply.insert("setName", set_name.clone());
    }
    reply.insert(
        "maxBsonObjectSize",
        crate::wire_protocol::MAX_BSON_OBJECT_SIZE,
    );
    reply.insert("maxMessageSizeBytes", crate::wire_protocol::MAX_MESSAGE_SIZE);
    reply.insert(
        "maxWriteBatchSize",
        crate::wire_protocol::MAX_WRITE_BATCH_SIZE,
    );
    reply.insert(
        "localTime",
        Bson::DateTime(bson::DateTime::from_chrono(chrono::Utc::now())),
    );
    reply.insert("logicalSessionTimeoutMinutes", 30);
    reply.insert("connectionId", conn.id as i64);
    reply.insert("minWireVersion", 0);
    reply.insert("maxWireVersion", MAX_WIRE_VERSION);
    reply.insert("readOnly", false);
    reply.insert("ok", 1.0);
    Ok(reply)
}

pub async fn build_info() -> CommandResult {
    Ok(doc! {
        "version": SERVER_VERSION,
        "gitVersion": env!("CARGO_PKG_VERSION"),
        "versionArray": [5, 0, 42, 0],
        "modules": Bson::Array(vec![]),
        "sysInfo": "deprecated",
        "bits": 64,
        "debug": false,
        "maxBsonObjectSize": crate::wire_protocol::MAX_BSON_OBJECT_SIZE,
        "doppeldb": {
            "version": env!("CARGO_PKG_VERSION"),
        },
        "ok": 1.0,
    })
}

pub async fn whatsmyuri(conn: &ConnectionState) -> CommandResult {
    Ok(doc! {"you": conn.peer.clone(), "ok": 1.0})
}

pub async fn server_status(ctx: &Arc<ServerContext>) -> CommandResult {
    let uptime = ctx.start_time.elapsed().as_secs() as i64;
    Ok(doc! {
        "host": hostname(),
        "version": SERVER_VERSION,
        "process": "doppeldb",
        "pid": std::process::id() as i64,
        "uptime": uptime as f64,
        "uptimeMillis": (ctx.start_time.elapsed().as_millis() as i64),
        "localTime": Bson::DateTime(bson::DateTime::from_chrono(chrono::Utc::now())),
        "connections": {
            "current": ctx.connections_current.load(Ordering::Relaxed) as i32,
            "totalCreated": ctx.connections_total.load(Ordering::Relaxed) as i32,
            "available": 1000i32,
        },
        "catalogStats": {
            "cursors": ctx.cursors.open_count() as i32,
            "sessions": ctx.sessions.count() as i32,
        },
        "ok": 1.0,
    })
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

pub async fn db_stats(ctx: &Arc<ServerContext>, db: &str) -> CommandResult {
    let stats = ctx.backend.database_stats(db).await?;
    let avg_obj_size = if stats.objects > 0 {
        stats.data_size as f64 / stats.objects as f64
    } else {
        0.0
    };
    Ok(doc! {
        "db": db,
        "collections": stats.collections as i32,
        "views": 0,
        "objects": stats.objects as i32,
        "avgObjSize": avg_obj_size,
        "dataSize": stats.data_size as f64,
        "indexes": stats.collections as i32,
        "totalSize": stats.data_size as f64,
        "scaleFactor": 1.0,
        "ok": 1.0,
    })
}

pub async fn coll_stats(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let coll = collection_name(cmd, "collStats")?;
    let stats = ctx.backend.collection_stats(db, &coll).await?;
    let avg_obj_size = if stats.count > 0 {
        stats.size_bytes as f64 / stats.count as f64
    } else {
        0.0
    };
    let mut reply = doc! {
        "ns": format!("{}.{}", db, coll),
        "count": stats.count as i32,
        "size": stats.size_bytes as f64,
        "avgObjSize": avg_obj_size,
        "storageSize": stats.size_bytes as f64,
        "nindexes": 1,
        "scaleFactor": 1,
        "capped": stats.capped.is_some(),
    };
    if let Some(capped) = stats.capped {
        reply.insert("max", capped.max.unwrap_or(0));
        reply.insert("maxSize", capped.size);
    }
    reply.insert("ok", 1.0);
    Ok(reply)
}

pub async fn connection_status(
    ctx: &Arc<ServerContext>,
    conn: &ConnectionState,
    cmd: &Document,
) -> CommandResult {
    let show_privileges = cmd.get_bool("showPrivileges").unwrap_or(false);
    let mut authenticated_users: Vec<Bson> = Vec::new();
    let mut authenticated_roles: Vec<Bson> = Vec::new();
    if let Some((db, name)) = &conn.user {
        authenticated_users.push(Bson::Document(doc! {"user": name.clone(), "db": db.clone()}));
        if let Some(stored) = ctx.users.get(db, name) {
            for role in &stored.roles {
                authenticated_roles.push(Bson::Document(
                    doc! {"role": role.as_str(), "db": db.clone()},
                ));
            }
        }
    }
    let mut auth_info = doc! {
        "authenticatedUsers": authenticated_users,
        "authenticatedUserRoles": authenticated_roles,
    };
    if show_privileges {
        auth_info.insert("authenticatedUserPrivileges", Bson::Array(vec![]));
    }
    Ok(doc! {"authInfo": auth_info, "ok": 1.0})
}

pub async fn get_parameter(cmd: &Document) -> CommandResult {
    let all = matches!(cmd.get("getParameter"), Some(Bson::String(s)) if s == "*");
    let known: &[(&str, Bson)] = &[
        (
            "featureCompatibilityVersion",
            Bson::Document(doc! {"version": "5.0"}),
        ),
        ("quiet", Bson::Boolean(false)),
        ("authSchemaVersion", Bson::Int32(5)),
    ];

    let mut reply = Document::new();
    if all {
        for (name, value) in known {
            reply.insert(name.to_string(), value.clone());
        }
    } else {
        for (name, value) in known {
            if cmd.contains_key(*name) {
                reply.insert(name.to_string(), value.clone());
            }
        }
        if reply.is_empty() {
            return Err(CommandError::new(
                code::INVALID_OPTIONS,
                "no option found to get",
            ));
        }
    }
    reply.insert("ok", 1.0);
    Ok(reply)
}

pub async fn list_databases(ctx: &Arc<ServerContext>) -> CommandResult {
    let names = ctx.backend.list_databases().await?;
    let mut databases: Vec<Bson> = Vec::new();
    let mut total: i64 = 0;
    for name in names {
        let stats = ctx.backend.database_stats(&name).await?;
        total += stats.data_size;
        databases.push(Bson::Document(doc! {
            "name": name,
            "sizeOnDisk": stats.data_size,
            "empty": stats.objects == 0,
        }));
    }
    Ok(doc! {
        "databases": databases,
        "totalSize": total,
        "totalSizeMb": total / (1024 * 1024),
        "ok": 1.0,
    })
}

pub async fn list_collections(
    ctx: &Arc<ServerContext>,
    db: &str,
    cmd: &Document,
) -> CommandResult {
    let filter = optional_document(cmd, "listCollections", "filter")?.cloned();
    let infos = ctx.backend.list_collections(db).await?;

    let mut docs = Vec::with_capacity(infos.len());
    for info in infos {
        let mut options = Document::new();
        if let Some(capped) = &info.capped {
            options.insert("capped", true);
            options.insert("size", capped.size);
            if let Some(max) = capped.max {
                options.insert("max", max);
            }
        }
        let entry = doc! {
            "name": info.name.clone(),
            "type": "collection",
            "options": options,
            "info": {
                "readOnly": false,
                "uuid": crate::command_processor::uuid_to_binary(info.uuid),
            },
            "idIndex": {
                "v": 2,
                "key": {"_id": 1},
                "name": "_id_",
            },
        };
        let keep = match &filter {
            Some(f) if !f.is_empty() => crate::filter::matches(&entry, f)?,
            _ => true,
        };
        if keep {
            docs.push(entry);
        }
    }

    let ns = format!("{}.$cmd.listCollections", db);
    Ok(cursor_reply(&ns, 0, docs, true))
}

pub async fn create(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let coll = collection_name(cmd, "create")?;
    crate::backend::validate_namespace(db, &coll)?;

    let capped = match cmd.get("capped") {
        Some(Bson::Boolean(true)) => {
            let size = match cmd.get("size").and_then(numeric_value) {
                Some(n) if n > 0.0 => n as i64,
                _ => {
                    return Err(CommandError::new(
                        code::INVALID_OPTIONS,
                        "the 'size' field is required when 'capped' is true",
                    ))
                }
            };
            let max = cmd.get("max").and_then(numeric_value).map(|n| n as i64);
            Some(CappedSpec { size, max })
        }
        _ => None,
    };

    let created = ctx.backend.create_collection(db, &coll, capped).await?;
    if !created {
        return Err(CommandError::namespace_exists(&format!("{}.{}", db, coll)));
    }
    Ok(doc! {"ok": 1.0})
}

pub async fn drop(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let coll = collection_name(cmd, "drop")?;
    let dropped = ctx.backend.drop_collection(db, &coll).await?;
    if !dropped {
        return Err(CommandError::namespace_not_found("ns not found"));
    }
    Ok(doc! {"ns": format!("{}.{}", db, coll), "nIndexesWas": 1, "ok": 1.0})
}

pub async fn drop_database(ctx: &Arc<ServerContext>, db: &str) -> CommandResult {
    let existed = ctx.backend.drop_database(db).await?;
    let mut reply = Document::new();
    if existed {
        reply.insert("dropped", db);
    }
    reply.insert("ok", 1.0);
    Ok(reply)
}

pub async fn rename_collection(ctx: &Arc<ServerContext>, cmd: &Document) -> CommandResult {
    let source = match cmd.get("renameCollection") {
        Some(Bson::String(s)) => s.clone(),
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'renameCollection.renameCollection' is the wrong type '{}', expected type 'string'",
                type_name(other)
            )))
        }
        None => return Err(CommandError::missing_field("renameCollection", "renameCollection")),
    };
    let target = match cmd.get("to") {
        Some(Bson::String(s)) => s.clone(),
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'renameCollection.to' is the wrong type '{}', expected type 'string'",
                type_name(other)
            )))
        }
        None => return Err(CommandError::missing_field("renameCollection", "to")),
    };
    let drop_target = cmd.get_bool("dropTarget").unwrap_or(false);

    let (from_db, from_coll) = split_namespace(&source)?;
    let (to_db, to_coll) = split_namespace(&target)?;

    if drop_target {
        ctx.backend.drop_collection(&to_db, &to_coll).await?;
    }
    ctx.backend
        .rename_collection(&from_db, &from_coll, &to_db, &to_coll)
        .await?;
    Ok(doc! {"ok": 1.0})
}

fn split_namespace(ns: &str) -> Result<(String, String), CommandError> {
    match ns.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => {
            Ok((db.to_string(), coll.to_string()))
        }
        _ => Err(CommandError::invalid_namespace(format!(
            "Invalid namespace specified '{}'",
            ns
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_splitting() {
        assert_eq!(
            split_namespace("db.coll.sub").unwrap(),
            ("db".to_string(), "coll.sub".to_string())
        );
        assert!(split_namespace("nodot").is_err());
        assert!(split_namespace(".coll").is_err());
    }
}
