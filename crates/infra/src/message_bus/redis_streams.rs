//! Redis Streams-backed message bus.
//!
//! - **send**: `XADD` to the dispatch stream; the generated stream id is the
//!   transport id of the receipt.
//! - **drain**: `XREADGROUP ... COUNT n` with no `BLOCK`, so an empty stream
//!   returns immediately. Drained entries are acknowledged with `XACK` before
//!   they are handed out (a message is consumed at most once per group).
//!
//! Stream key defaults to `claimflow:dispatch`, consumer group to
//! `claimflow.validator`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use tracing::{instrument, warn};

use claimflow_messaging::{BusError, ConsumedMessage, DispatchEnvelope, DispatchReceipt, MessageBus};

const DEFAULT_STREAM_KEY: &str = "claimflow:dispatch";
const DEFAULT_GROUP: &str = "claimflow.validator";

#[derive(Debug, Clone)]
pub struct RedisStreamsMessageBus {
    client: Arc<redis::Client>,
    stream_key: String,
    group_name: String,
    consumer_name: String,
}

impl RedisStreamsMessageBus {
    /// Create a bus over `redis_url`.
    ///
    /// The consumer name is unique per process; pass a stable one with
    /// [`Self::with_consumer`] when several workers share a group.
    pub fn new(redis_url: impl AsRef<str>, stream_key: Option<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BusError::Unreachable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            group_name: DEFAULT_GROUP.to_string(),
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
        })
    }

    pub fn with_consumer(mut self, group_name: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        self.group_name = group_name.into();
        self.consumer_name = consumer_name.into();
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BusError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Unreachable(e.to_string()))
    }

    /// Ensure the consumer group exists (idempotent).
    ///
    /// `MKSTREAM` creates the stream too; starting id `0` so entries written
    /// before the group existed are still delivered.
    pub async fn ensure_consumer_group(&self) -> Result<(), BusError> {
        let mut conn = self.connection().await?;

        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BusError::Unreachable(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    async fn acknowledge(&self, conn: &mut MultiplexedConnection, ids: &[String]) -> Result<(), BusError> {
        if ids.is_empty() {
            return Ok(());
        }

        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg(ids)
            .query_async(conn)
            .await
            .map_err(|e| BusError::Unreachable(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageBus for RedisStreamsMessageBus {
    #[instrument(
        skip(self, envelope),
        fields(
            stream_key = %self.stream_key,
            message_id = %envelope.message_id(),
            entry_id = %envelope.queue_entry_id()
        ),
        err
    )]
    async fn send(&self, envelope: DispatchEnvelope) -> Result<DispatchReceipt, BusError> {
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut conn = self.connection().await?;

        let stream_id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("queue_entry_id")
            .arg(envelope.queue_entry_id().to_string())
            .arg("ian")
            .arg(envelope.ian().as_str())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Rejected(format!("XADD failed: {e}")))?;

        Ok(DispatchReceipt {
            message_id: envelope.message_id(),
            transport_id: stream_id,
            accepted_at: Utc::now(),
        })
    }

    #[instrument(skip(self), fields(stream_key = %self.stream_key, group = %self.group_name), err)]
    async fn drain(&self, max: usize) -> Result<Vec<ConsumedMessage>, BusError> {
        if max == 0 {
            return Ok(vec![]);
        }
        self.ensure_consumer_group().await?;
        let mut conn = self.connection().await?;

        // No BLOCK: an empty stream answers nil right away.
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group_name)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(max)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Unreachable(format!("XREADGROUP failed: {e}")))?;

        let entries = stream_entries(reply, &self.stream_key)?;
        let mut ids = Vec::with_capacity(entries.len());
        let mut messages = Vec::with_capacity(entries.len());

        for entry in entries {
            match parse_stream_entry(entry) {
                Ok(message) => {
                    ids.push(message.delivery_id.clone());
                    messages.push(message);
                }
                Err((Some(id), e)) => {
                    warn!(delivery_id = %id, error = %e, "dropping undecodable stream entry");
                    ids.push(id);
                }
                Err((None, e)) => warn!(error = %e, "skipping malformed stream entry"),
            }
        }

        self.acknowledge(&mut conn, &ids).await?;
        Ok(messages)
    }
}

/// Entries of `stream_key` in an `XREADGROUP` reply.
///
/// Reply format: `[[stream_key, [entry, ...]], ...]` or nil when nothing is pending.
fn stream_entries(reply: redis::Value, stream_key: &str) -> Result<Vec<redis::Value>, BusError> {
    let streams = match reply {
        redis::Value::Nil => return Ok(vec![]),
        redis::Value::Bulk(streams) => streams,
        other => {
            return Err(BusError::Serialization(format!(
                "unexpected XREADGROUP reply: {other:?}"
            )));
        }
    };

    for stream in streams {
        let redis::Value::Bulk(mut parts) = stream else {
            continue;
        };
        if parts.len() != 2 {
            continue;
        }
        let entries = parts.pop();
        let key = parts.pop();
        if let (Some(redis::Value::Data(key)), Some(redis::Value::Bulk(entries))) = (key, entries) {
            if key == stream_key.as_bytes() {
                return Ok(entries);
            }
        }
    }
    Ok(vec![])
}

/// Parse one stream entry (`[id, [field, value, ...]]`).
///
/// On failure the entry id is returned when it could be read, so the caller
/// can still acknowledge the poison entry.
fn parse_stream_entry(entry: redis::Value) -> Result<ConsumedMessage, (Option<String>, BusError)> {
    let parts = match entry {
        redis::Value::Bulk(parts) if parts.len() >= 2 => parts,
        _ => return Err((None, BusError::Serialization("invalid entry format".to_string()))),
    };

    let delivery_id = match &parts[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        _ => return Err((None, BusError::Serialization("invalid entry id".to_string()))),
    };

    let fields: HashMap<String, String> = match &parts[1] {
        redis::Value::Bulk(values) => values
            .chunks(2)
            .filter_map(|chunk| match chunk {
                [redis::Value::Data(k), redis::Value::Data(v)] => Some((
                    String::from_utf8_lossy(k).to_string(),
                    String::from_utf8_lossy(v).to_string(),
                )),
                _ => None,
            })
            .collect(),
        _ => {
            return Err((
                Some(delivery_id),
                BusError::Serialization("invalid entry fields".to_string()),
            ));
        }
    };

    let Some(payload) = fields.get("payload") else {
        return Err((
            Some(delivery_id),
            BusError::Serialization("missing payload field".to_string()),
        ));
    };

    match serde_json::from_str::<DispatchEnvelope>(payload) {
        Ok(envelope) => Ok(ConsumedMessage {
            delivery_id,
            envelope,
            delivered_at: Utc::now(),
        }),
        Err(e) => Err((
            Some(delivery_id),
            BusError::Serialization(format!("failed to decode envelope: {e}")),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claimflow_core::{QueueEntryId, WorkItemId};
    use serde_json::json;

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, payload: &str) -> redis::Value {
        redis::Value::Bulk(vec![
            data(id),
            redis::Value::Bulk(vec![data("payload"), data(payload)]),
        ])
    }

    #[test]
    fn nil_reply_means_nothing_pending() {
        assert!(stream_entries(redis::Value::Nil, "s").unwrap().is_empty());
    }

    #[test]
    fn entries_decode_into_consumed_messages() {
        let envelope = DispatchEnvelope::new(
            QueueEntryId::new(),
            WorkItemId::new("A1").unwrap(),
            json!({"ians": ["A1"]}),
        );
        let payload = serde_json::to_string(&envelope).unwrap();
        let reply = redis::Value::Bulk(vec![redis::Value::Bulk(vec![
            data("s"),
            redis::Value::Bulk(vec![entry("1-0", &payload)]),
        ])]);

        let entries = stream_entries(reply, "s").unwrap();
        let message = parse_stream_entry(entries.into_iter().next().unwrap()).unwrap();
        assert_eq!(message.delivery_id, "1-0");
        assert_eq!(message.correlation(), envelope.queue_entry_id());
    }

    #[test]
    fn undecodable_payload_keeps_its_id_for_ack() {
        let err = parse_stream_entry(entry("2-0", "not json")).unwrap_err();
        assert_eq!(err.0.as_deref(), Some("2-0"));
    }
}
