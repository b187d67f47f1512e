use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{SyncInfo, SyncRange, SyncReplica};
use crate::db::Row;
use crate::error::{Error, Result};
use crate::socket::ClientSocket;

/// Replica held by a socket client.
///
/// Requests are sent on the session channel as `onSyncRequest`,
/// `onPullRequest` and `data` messages; the client answers each with the
/// matching payload.
pub struct SocketReplica {
    socket: Arc<dyn ClientSocket>,
    channel: String,
}

impl fmt::Debug for SocketReplica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketReplica")
            .field("socket", &self.socket.id())
            .field("channel", &self.channel)
            .finish()
    }
}

impl SocketReplica {
    /// Replica of `socket` on `channel`.
    #[must_use]
    pub fn new(socket: Arc<dyn ClientSocket>, channel: impl Into<String>) -> Self {
        Self {
            socket,
            channel: channel.into(),
        }
    }
}

fn row_field(reply: &Value, key: &str) -> Result<Option<Row>> {
    match reply.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(row)) => Ok(Some(row.clone())),
        Some(other) => Err(Error::Validation(format!(
            "sync reply field '{key}' must be an object, got {other}"
        ))),
    }
}

#[async_trait]
impl SyncReplica for SocketReplica {
    async fn info(&self, from_synced: Option<&Value>, end_offset: Option<u64>) -> Result<SyncInfo> {
        let reply = self
            .socket
            .request(
                &self.channel,
                json!({ "onSyncRequest": { "from_synced": from_synced, "end_offset": end_offset } }),
            )
            .await?;
        Ok(SyncInfo {
            first: row_field(&reply, "c_fr")?,
            last: row_field(&reply, "c_lr")?,
            count: reply.get("c_count").and_then(Value::as_u64).unwrap_or(0),
        })
    }

    async fn pull(&self, range: &SyncRange) -> Result<Vec<Row>> {
        let reply = self
            .socket
            .request(&self.channel, json!({ "onPullRequest": range }))
            .await?;
        let data = match reply {
            Value::Object(mut map) => map.remove("data").unwrap_or(Value::Array(Vec::new())),
            other => other,
        };
        match data {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(row) => Ok(row),
                    other => Err(Error::Validation(format!(
                        "pulled rows must be objects, got {other}"
                    ))),
                })
                .collect(),
            other => Err(Error::Validation(format!(
                "pull reply must be an array of rows, got {other}"
            ))),
        }
    }

    async fn push(&self, rows: Vec<Row>) -> Result<()> {
        self.socket
            .request(&self.channel, json!({ "data": rows }))
            .await?;
        Ok(())
    }
}
