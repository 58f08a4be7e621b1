/*!
 * @file connection.rs
 * @brief Per-connection message loop and reply routing
 */

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bson::Document;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::command_processor::{dispatch, ConnectionState, ServerContext};
use crate::config::Mode;
use crate::error::CommandError;
use crate::proxy::{self, AsyncStream, ProxyClient};
use crate::wire_protocol::{
    self, OpMsg, OpQuery, OP_MSG, OP_QUERY,
};

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

pub fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Runs one client conversation to completion. Commands are handled strictly
/// in arrival order; a shutdown signal lets the in-flight command finish and
/// then stops the loop.
pub async fn handle_connection<S>(
    ctx: Arc<ServerContext>,
    mut stream: S,
    peer: String,
    conn_id: u64,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncStream,
{
    let mut conn = ConnectionState::new(conn_id, peer.clone());
    let mut upstream: Option<ProxyClient> = None;

    ctx.connections_current
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    ctx.connections_total
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    metrics::counter!("doppeldb_connections_total").increment(1);
    debug!(connection = conn_id, peer = %peer, "client connected");

    loop {
        let message = tokio::select! {
            message = wire_protocol::read_message(&mut stream) => message,
            _ = shutdown.recv() => break,
        };
        let (header, payload) = match message {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                // Framing errors are unrecoverable for this connection.
                warn!(connection = conn_id, error = %e, "terminating connection");
                break;
            }
        };

        match header.op_code {
            OP_MSG => {
                let msg = match OpMsg::parse(&payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        // The frame was sound but its body was not: answer
                        // with an error document and keep the connection.
                        let err = CommandError::bad_value(format!("invalid OP_MSG: {}", e));
                        if write_op_msg(&mut stream, &err.to_document(), header.request_id)
                            .await
                            .is_err()
                        {
                            break;
                        }
                        continue;
                    }
                };
                let fire_and_forget = msg.more_to_come();
                let cmd = msg.into_command();
                let reply = route(&ctx, &mut conn, &mut upstream, cmd).await;
                if !fire_and_forget
                    && write_op_msg(&mut stream, &reply, header.request_id)
                        .await
                        .is_err()
                {
                    break;
                }
            }
            OP_QUERY => {
                let query = match OpQuery::parse(&payload) {
                    Ok(q) => q,
                    Err(e) => {
                        warn!(connection = conn_id, error = %e, "bad OP_QUERY");
                        break;
                    }
                };
                // Legacy opcodes are tolerated for the handshake only.
                if !query.is_handshake() {
                    warn!(connection = conn_id, "OP_QUERY outside handshake, closing");
                    break;
                }
                let mut cmd = query.query.clone();
                if let Some(db) = query.full_collection_name.strip_suffix(".$cmd") {
                    cmd.insert("$db", db);
                }
                let reply = dispatch(&ctx, &mut conn, cmd).await;
                let bytes = match wire_protocol::encode_op_reply(
                    &reply,
                    next_request_id(),
                    header.request_id,
                ) {
                    Ok(bytes) => bytes,
                    Err(_) => break,
                };
                if wire_protocol::write_message(&mut stream, &bytes).await.is_err() {
                    break;
                }
            }
            other => {
                warn!(connection = conn_id, opcode = other, "unknown opcode, closing");
                break;
            }
        }
    }

    // Cursors survive the disconnect; the same user may resume them from
    // another connection. Transient state goes with the handler.
    ctx.cursors.mark_connection_closed(conn_id);
    ctx.connections_current
        .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    debug!(connection = conn_id, "client disconnected");
}

async fn write_op_msg<S>(
    stream: &mut S,
    reply: &Document,
    response_to: i32,
) -> crate::error::Result<()>
where
    S: AsyncStream,
{
    let bytes = wire_protocol::encode_op_msg(reply, next_request_id(), response_to)?;
    wire_protocol::write_message(stream, &bytes).await
}

/// Sends the command to the local engine, the reference server, or both,
/// according to the configured mode.
async fn route(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    upstream: &mut Option<ProxyClient>,
    cmd: Document,
) -> Document {
    let mode = ctx.config.mode;
    if mode == Mode::Normal {
        return dispatch(ctx, conn, cmd).await;
    }

    let remote = match forward(ctx, upstream, &cmd).await {
        Ok(reply) => Some(reply),
        Err(e) => {
            warn!(error = %e, "proxy forward failed");
            None
        }
    };

    let local = match mode {
        Mode::Proxy => None,
        _ => Some(dispatch(ctx, conn, cmd.clone()).await),
    };

    if let (Some(local), Some(remote)) = (&local, &remote) {
        let differing = proxy::diff_replies(local, remote);
        if !differing.is_empty() {
            let command = cmd.keys().next().cloned().unwrap_or_default();
            warn!(
                command = %command,
                fields = ?differing,
                "reply differs from reference server"
            );
        }
    }

    proxy::choose_reply(mode, local, remote)
}

async fn forward(
    ctx: &Arc<ServerContext>,
    upstream: &mut Option<ProxyClient>,
    cmd: &Document,
) -> crate::error::Result<Document> {
    if upstream.is_none() {
        *upstream = Some(ProxyClient::connect(&ctx.config.proxy).await?);
    }
    match upstream.as_mut().unwrap().call(cmd).await {
        Ok(reply) => Ok(reply),
        Err(e) => {
            // One reconnect attempt; the upstream may have idled out.
            *upstream = Some(ProxyClient::connect(&ctx.config.proxy).await?);
            match upstream.as_mut().unwrap().call(cmd).await {
                Ok(reply) => Ok(reply),
                Err(_) => Err(e),
            }
        }
    }
}
