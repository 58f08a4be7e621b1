/*!
 * @file session_commands.rs
 * @brief SASL authentication and logical session commands
 */

use std::sync::Arc;

use bson::spec::BinarySubtype;
use bson::{doc, Bson, Document};
use uuid::Uuid;

use crate::authentication::{ScramConversation, ScramMechanism};
use crate::command_processor::{binary_uuid, uuid_to_binary, ConnectionState, ServerContext};
use crate::cursor_registry::UserId;
use crate::error::{CommandError, CommandResult};
use crate::ordering::type_name;

fn payload_bytes(cmd: &Document, command: &str) -> Result<Vec<u8>, CommandError> {
    match cmd.get("payload") {
        Some(Bson::Binary(bin)) => Ok(bin.bytes.clone()),
        Some(Bson::String(s)) => Ok(s.as_bytes().to_vec()),
        Some(other) => Err(CommandError::type_mismatch(format!(
            "BSON field '{}.payload' is the wrong type '{}', expected type 'binData'",
            command,
            type_name(other)
        ))),
        None => Err(CommandError::missing_field(command, "payload")),
    }
}

fn payload_reply(payload: Vec<u8>, done: bool) -> Document {
    doc! {
        "conversationId": 1,
        "done": done,
        "payload": Bson::Binary(bson::Binary {
            subtype: BinarySubtype::Generic,
            bytes: payload,
        }),
        "ok": 1.0,
    }
}

pub async fn sasl_start(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    db: &str,
    cmd: &Document,
) -> CommandResult {
    let mechanism = match cmd.get("mechanism") {
        Some(Bson::String(name)) => ScramMechanism::from_name(name).ok_or_else(|| {
            CommandError::bad_value(format!(
                "Received authentication for mechanism {} which is not supported",
                name
            ))
        })?,
        _ => return Err(CommandError::missing_field("saslStart", "mechanism")),
    };
    let payload = payload_bytes(cmd, "saslStart")?;

    let (conversation, reply) =
        ScramConversation::start(ctx.users.as_ref(), db, mechanism, &payload)?;
    conn.sasl = Some(conversation);
    conn.user = None;
    Ok(payload_reply(reply, false))
}

pub async fn sasl_continue(
    conn: &mut ConnectionState,
    db: &str,
    cmd: &Document,
) -> CommandResult {
    let payload = payload_bytes(cmd, "saslContinue")?;
    let Some(conversation) = conn.sasl.as_mut() else {
        return Err(CommandError::location(17, "No SASL session state found"));
    };
    if conversation.db != db {
        return Err(CommandError::authentication_failed());
    }

    let (reply, done) = match conversation.continue_with(&payload) {
        Ok(out) => out,
        Err(e) => {
            conn.sasl = None;
            conn.user = None;
            return Err(e);
        }
    };
    if conversation.verified() {
        conn.user = Some((conversation.db.clone(), conversation.username.clone()));
    }
    if done {
        conn.sasl = None;
    }
    Ok(payload_reply(reply, done))
}

pub async fn logout(conn: &mut ConnectionState) -> CommandResult {
    conn.user = None;
    conn.sasl = None;
    Ok(doc! {"ok": 1.0})
}

pub async fn start_session(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
) -> CommandResult {
    let id = ctx.sessions.start(conn.user.clone());
    conn.session = Some(id);
    Ok(doc! {
        "id": {"id": uuid_to_binary(id)},
        "timeoutMinutes": 30,
        "ok": 1.0,
    })
}

/// Parses `[{id: <uuid>}, ...]` as used by endSessions/killSessions/refresh.
fn parse_session_ids(
    cmd: &Document,
    command: &str,
    struct_name: &str,
) -> Result<Vec<Uuid>, CommandError> {
    let list = match cmd.get(command) {
        Some(Bson::Array(a)) => a,
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field '{}.{}' is the wrong type '{}', expected type 'array'",
                struct_name,
                command,
                type_name(other)
            )))
        }
        None => return Err(CommandError::missing_field(struct_name, command)),
    };

    let mut ids = Vec::with_capacity(list.len());
    for (i, element) in list.iter().enumerate() {
        let Bson::Document(entry) = element else {
            return Err(CommandError::type_mismatch(format!(
                "BSON field '{}.{}.{}' is the wrong type '{}', expected type 'object'",
                struct_name,
                command,
                i,
                type_name(element)
            )));
        };
        let id = entry
            .get("id")
            .and_then(binary_uuid)
            .ok_or_else(|| CommandError::missing_field("SessionsCollectionSessionId", "id"))?;
        ids.push(id);
    }
    Ok(ids)
}

pub async fn end_sessions(ctx: &Arc<ServerContext>, cmd: &Document) -> CommandResult {
    let ids = parse_session_ids(cmd, "endSessions", "EndSessionsCmd")?;
    for id in ctx.sessions.end(&ids) {
        ctx.cursors.kill_by_session(&id);
    }
    Ok(doc! {"ok": 1.0})
}

pub async fn refresh_sessions(ctx: &Arc<ServerContext>, cmd: &Document) -> CommandResult {
    let ids = parse_session_ids(cmd, "refreshSessions", "RefreshSessionsCmd")?;
    ctx.sessions.refresh(&ids);
    Ok(doc! {"ok": 1.0})
}

fn caller_is_admin(ctx: &Arc<ServerContext>, conn: &ConnectionState) -> bool {
    if !ctx.config.auth {
        return true;
    }
    conn.user
        .as_ref()
        .and_then(|(db, name)| ctx.users.get(db, name))
        .map(|u| u.is_cluster_admin())
        .unwrap_or(false)
}

pub async fn kill_sessions(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    cmd: &Document,
) -> CommandResult {
    let ids = parse_session_ids(cmd, "killSessions", "KillSessionsCmd")?;
    let admin = caller_is_admin(ctx, conn);

    for id in ids {
        // Non-admin callers only reach their own sessions.
        if !admin {
            match ctx.sessions.get(&id) {
                Some(entry) if entry.user == conn.user => {}
                Some(_) => continue,
                None => {}
            }
        }
        ctx.sessions.kill(&[id]);
        ctx.cursors.kill_by_session(&id);
    }
    // Killing a dead session is a no-op, so the reply is always ok.
    Ok(doc! {"ok": 1.0})
}

/// Parses `[{db, user}, ...]` with the struct-path error wording shared by
/// the kill-all commands.
fn parse_kill_all_users(cmd: &Document) -> Result<Vec<UserId>, CommandError> {
    let list = match cmd.get("killAllSessions") {
        Some(Bson::Array(a)) => a,
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'KillAllSessionsCmd.killAllSessions' is the wrong type '{}', expected type 'array'",
                type_name(other)
            )))
        }
        None => {
            return Err(CommandError::missing_field(
                "KillAllSessionsCmd",
                "killAllSessions",
            ))
        }
    };

    let mut users = Vec::with_capacity(list.len());
    for (i, element) in list.iter().enumerate() {
        let Bson::Document(entry) = element else {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'KillAllSessionsCmd.killAllSessions.{}' is the wrong type '{}', expected type 'object'",
                i,
                type_name(element)
            )));
        };
        let db = match entry.get("db") {
            Some(Bson::String(s)) => s.clone(),
            Some(other) => {
                return Err(CommandError::type_mismatch(format!(
                    "BSON field 'KillAllSessionsUser.db' is the wrong type '{}', expected type 'string'",
                    type_name(other)
                )))
            }
            None => return Err(CommandError::missing_field("KillAllSessionsUser", "db")),
        };
        let user = match entry.get("user") {
            Some(Bson::String(s)) => s.clone(),
            Some(other) => {
                return Err(CommandError::type_mismatch(format!(
                    "BSON field 'KillAllSessionsUser.user' is the wrong type '{}', expected type 'string'",
                    type_name(other)
                )))
            }
            None => return Err(CommandError::missing_field("KillAllSessionsUser", "user")),
        };
        users.push((db, user));
    }
    Ok(users)
}

pub async fn kill_all_sessions(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    cmd: &Document,
) -> CommandResult {
    let users = parse_kill_all_users(cmd)?;
    let admin = caller_is_admin(ctx, conn);

    if users.is_empty() {
        // An empty array targets every session of every user.
        if admin {
            ctx.sessions.kill_all();
            ctx.cursors.kill_all();
        } else if let Some(user) = &conn.user {
            ctx.sessions.kill_for_user(user);
            ctx.cursors.kill_by_user(user);
        }
        return Ok(doc! {"ok": 1.0});
    }

    for user in users {
        if !admin && Some(&user) != conn.user.as_ref() {
            continue;
        }
        ctx.sessions.kill_for_user(&user);
        ctx.cursors.kill_by_user(&user);
    }
    Ok(doc! {"ok": 1.0})
}

pub async fn kill_all_sessions_by_pattern(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    cmd: &Document,
) -> CommandResult {
    let list = match cmd.get("killAllSessionsByPattern") {
        Some(Bson::Array(a)) => a,
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'KillAllSessionsByPatternCmd.killAllSessionsByPattern' is the wrong type '{}', expected type 'array'",
                type_name(other)
            )))
        }
        None => {
            return Err(CommandError::missing_field(
                "KillAllSessionsByPatternCmd",
                "killAllSessionsByPattern",
            ))
        }
    };
    let admin = caller_is_admin(ctx, conn);

    for (i, element) in list.iter().enumerate() {
        let Bson::Document(pattern) = element else {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'KillAllSessionsByPatternCmd.killAllSessionsByPattern.{}' is the wrong type '{}', expected type 'object'",
                i,
                type_name(element)
            )));
        };
        if pattern.is_empty() {
            if admin {
                ctx.sessions.kill_all();
                ctx.cursors.kill_all();
            }
            continue;
        }
        if let Some(Bson::String(uid)) = pattern.get("uid") {
            for id in ctx.sessions.kill_for_uid(uid) {
                ctx.cursors.kill_by_session(&id);
            }
            continue;
        }
        if let (Some(Bson::String(db)), Some(Bson::String(user))) =
            (pattern.get("db"), pattern.get("user"))
        {
            let target = (db.clone(), user.clone());
            if admin || Some(&target) == conn.user.as_ref() {
                ctx.sessions.kill_for_user(&target);
                ctx.cursors.kill_by_user(&target);
            }
            continue;
        }
        return Err(CommandError::bad_value(
            "pattern must contain either 'uid' or both 'db' and 'user'",
        ));
    }
    Ok(doc! {"ok": 1.0})
}

#[cfg(test)]
mod tests {
    use crate::session_registry::user_uid;

    #[test]
    fn uid_helper_matches_registry() {
        let user = ("admin".to_string(), "u1".to_string());
        assert_eq!(user_uid(&user).len(), 64);
    }
}
