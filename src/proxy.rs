/*!
 * @file proxy.rs
 * @brief Differential proxy to a reference MongoDB server
 */

use bson::{Bson, Document};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::{Mode, ProxyConfig};
use crate::error::{DoppelError, Result};
use crate::ordering::values_equal;
use crate::wire_protocol::{self, OpMsg, OP_MSG};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// One upstream connection to the reference server, owned by the client
/// connection it shadows. Requests are serialized, matching the local side.
pub struct ProxyClient {
    stream: Box<dyn AsyncStream>,
    request_id: i32,
}

impl ProxyClient {
    pub async fn connect(config: &ProxyConfig) -> Result<Self> {
        let addr = config
            .addr
            .as_ref()
            .ok_or_else(|| DoppelError::Config("proxy-addr is not configured".to_string()))?;
        let tcp = TcpStream::connect(addr).await?;
        let stream: Box<dyn AsyncStream> = if config.tls {
            let tls_config = crate::ssl::load_client_config(config.tls_ca_file.as_deref())?;
            let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(tls_config));
            let host = addr.split(':').next().unwrap_or("localhost").to_string();
            let server_name = rustls::ServerName::try_from(host.as_str())
                .map_err(|e| DoppelError::Tls(format!("invalid proxy host name: {}", e)))?;
            Box::new(connector.connect(server_name, tcp).await?)
        } else {
            Box::new(tcp)
        };
        Ok(Self {
            stream,
            request_id: 1,
        })
    }

    /// Sends one command and reads its reply.
    pub async fn call(&mut self, cmd: &Document) -> Result<Document> {
        self.request_id = self.request_id.wrapping_add(1);
        let bytes = wire_protocol::encode_op_msg(cmd, self.request_id, 0)?;
        wire_protocol::write_message(&mut self.stream, &bytes).await?;

        let (header, payload) = wire_protocol::read_message(&mut self.stream)
            .await?
            .ok_or_else(|| {
                DoppelError::WireProtocol("proxy connection closed mid-reply".to_string())
            })?;
        if header.op_code != OP_MSG {
            return Err(DoppelError::WireProtocol(format!(
                "unexpected opcode {} from proxy",
                header.op_code
            )));
        }
        Ok(OpMsg::parse(&payload)?.into_command())
    }
}

/// Reply fields that legitimately differ between servers and are excluded
/// from the diff.
const VOLATILE_FIELDS: &[&str] = &[
    "localTime",
    "connectionId",
    "uptime",
    "uptimeMillis",
    "uptimeEstimate",
    "operationTime",
    "$clusterTime",
    "topologyVersion",
    "electionId",
    "opTime",
    "host",
    "pid",
    "version",
    "gitVersion",
    "versionArray",
    "doppeldb",
];

/// Compares a local and a reference reply, returning the top-level fields
/// that disagree. Cursor ids are server-local and are not compared.
pub fn diff_replies(local: &Document, remote: &Document) -> Vec<String> {
    let mut differing = Vec::new();
    let mut keys: Vec<&str> = local.keys().map(String::as_str).collect();
    for key in remote.keys() {
        if !keys.contains(&key.as_str()) {
            keys.push(key);
        }
    }

    for key in keys {
        if VOLATILE_FIELDS.contains(&key) {
            continue;
        }
        let (a, b) = (local.get(key), remote.get(key));
        let equal = match (a, b) {
            (Some(Bson::Document(da)), Some(Bson::Document(db))) if key == "cursor" => {
                cursor_equal(da, db)
            }
            (Some(a), Some(b)) => values_equal(a, b),
            _ => false,
        };
        if !equal {
            differing.push(key.to_string());
        }
    }
    differing
}

fn cursor_equal(a: &Document, b: &Document) -> bool {
    let batches_equal = match (
        a.get("firstBatch").or_else(|| a.get("nextBatch")),
        b.get("firstBatch").or_else(|| b.get("nextBatch")),
    ) {
        (Some(x), Some(y)) => values_equal(x, y),
        (None, None) => true,
        _ => false,
    };
    let ns_equal = a.get("ns") == b.get("ns");
    let exhaustion_equal = match (a.get_i64("id"), b.get_i64("id")) {
        (Ok(x), Ok(y)) => (x == 0) == (y == 0),
        _ => false,
    };
    batches_equal && ns_equal && exhaustion_equal
}

/// Which reply the client sees for a given mode.
pub fn choose_reply(mode: Mode, local: Option<Document>, remote: Option<Document>) -> Document {
    let fallback = || {
        crate::error::CommandError::internal("proxy backend unavailable").to_document()
    };
    match mode {
        Mode::Normal | Mode::DiffNormal => local.unwrap_or_else(fallback),
        Mode::Proxy | Mode::DiffProxy => remote.unwrap_or_else(fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn identical_replies_have_no_diff() {
        let a = doc! {"n": 5, "ok": 1.0, "localTime": "x"};
        let b = doc! {"n": 5, "ok": 1.0, "localTime": "y"};
        assert!(diff_replies(&a, &b).is_empty());
    }

    #[test]
    fn differing_field_is_reported() {
        let a = doc! {"n": 5, "ok": 1.0};
        let b = doc! {"n": 6, "ok": 1.0};
        assert_eq!(diff_replies(&a, &b), vec!["n".to_string()]);
    }

    #[test]
    fn cursor_ids_do_not_count_as_differences() {
        let a = doc! {"cursor": {"id": 123i64, "ns": "db.c", "firstBatch": [{"x": 1}]}, "ok": 1.0};
        let b = doc! {"cursor": {"id": 456i64, "ns": "db.c", "firstBatch": [{"x": 1}]}, "ok": 1.0};
        assert!(diff_replies(&a, &b).is_empty());
    }
}
