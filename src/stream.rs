//! Job stream consumer on top of redis consumer groups.
//!
//! Every entry is delivered to exactly one member of the group and stays in
//! the group's pending list until acknowledged.

use std::{
    collections::HashMap,
    time::Duration,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use redis::{
    aio::MultiplexedConnection,
    AsyncConnectionConfig,
    Value,
    Value::BulkString,
};

use crate::error::StreamError;

/// field of a stream entry holding the job document
pub const TASK_FIELD: &str = "task";

// headroom on top of the BLOCK duration before the client gives up on a reply
const RESPONSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub id: String,

    pub fields: HashMap<String, Vec<u8>>,
}

impl StreamMessage {
    pub fn task(&self) -> Option<&[u8]> {
        self.fields.get(TASK_FIELD).map(Vec::as_slice)
    }
}

#[async_trait]
pub trait JobStream: Send {
    /// Creates the consumer group (and the stream) if missing.
    async fn ensure_group(&mut self) -> Result<(), StreamError>;

    /// Waits up to `block` for new entries; an empty batch means timeout.
    async fn claim(&mut self, block: Duration) -> Result<Vec<StreamMessage>, StreamError>;

    async fn ack(&mut self, id: &str) -> Result<(), StreamError>;

    /// Takes over entries another consumer left pending for at least
    /// `min_idle`.
    async fn reclaim_stale(&mut self, min_idle: Duration) -> Result<Vec<StreamMessage>, StreamError>;
}

pub struct RedisStream {
    con: MultiplexedConnection,

    stream: String,
    group: String,
    consumer: String,

    batch: usize,
}

impl RedisStream {
    pub async fn connect(
        url: &str,
        stream: &str,
        group: &str,
        consumer: &str,
        batch: usize,
        block: Duration,
    ) -> Result<Self, StreamError> {
        let client = redis::Client::open(url)?;
        let config = AsyncConnectionConfig::new()
            .set_response_timeout(block + RESPONSE_GRACE);
        let con = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;
        info!("Connected to stream `{stream}` as `{consumer}` of group `{group}`.");
        Ok(Self {
            con: con,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            batch: batch.max(1),
        })
    }
}

#[async_trait]
impl JobStream for RedisStream {
    async fn ensure_group(&mut self) -> Result<(), StreamError> {
        let result: Result<Value, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut self.con)
            .await;
        match result {
            Ok(_) => {
                info!("Created consumer group `{}` on `{}`.", self.group, self.stream);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group `{}` already exists.", self.group);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim(&mut self, block: Duration) -> Result<Vec<StreamMessage>, StreamError> {
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP").arg(&self.group).arg(&self.consumer)
            .arg("COUNT").arg(self.batch)
            .arg("BLOCK").arg(block.as_millis() as u64)
            .arg("STREAMS").arg(&self.stream).arg(">")
            .query_async(&mut self.con)
            .await?;
        parse_read_reply(&reply)
    }

    async fn ack(&mut self, id: &str) -> Result<(), StreamError> {
        let acked: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(id)
            .query_async(&mut self.con)
            .await?;
        if acked == 0 {
            warn!("Entry `{id}` was not pending, nothing acknowledged.");
        }
        Ok(())
    }

    async fn reclaim_stale(&mut self, min_idle: Duration) -> Result<Vec<StreamMessage>, StreamError> {
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT").arg(self.batch)
            .query_async(&mut self.con)
            .await?;
        parse_autoclaim_reply(&reply)
    }
}

/// Parses an XREADGROUP reply: nil on timeout, otherwise
/// `[[stream, [[id, [field, value, ...]], ...]], ...]`.
pub fn parse_read_reply(reply: &Value) -> Result<Vec<StreamMessage>, StreamError> {
    let streams: Vec<(&Value, &Value)> = match reply {
        Value::Nil => return Ok(Vec::new()),

        Value::Array(items) => items
            .iter()
            .map(|item| match item.as_sequence() {
                Some([name, entries]) => Ok((name, entries)),
                _ => Err(protocol("stream reply item is not a [name, entries] pair")),
            })
            .collect::<Result<_, _>>()?,

        // RESP3 servers answer with a map of stream name to entries
        Value::Map(pairs) => pairs.iter().map(|(k, v)| (k, v)).collect(),

        other => return Err(protocol(&format!("unexpected XREADGROUP reply `{other:?}`"))),
    };
    let mut messages = Vec::new();
    for (_name, entries) in streams {
        messages.extend(parse_entries(entries)?);
    }
    Ok(messages)
}

/// Parses an XAUTOCLAIM reply: `[next-cursor, [entries], [deleted-ids]]`.
pub fn parse_autoclaim_reply(reply: &Value) -> Result<Vec<StreamMessage>, StreamError> {
    match reply.as_sequence() {
        Some([_cursor, entries, ..]) => parse_entries(entries),
        _ => Err(protocol("XAUTOCLAIM reply is not [cursor, entries, ...]")),
    }
}

fn parse_entries(entries: &Value) -> Result<Vec<StreamMessage>, StreamError> {
    let entries = match entries {
        Value::Nil => return Ok(Vec::new()),
        other => other
            .as_sequence()
            .ok_or_else(|| protocol("stream entries are not an array"))?,
    };
    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        let items = entry
            .as_sequence()
            .ok_or_else(|| protocol("stream entry is not an array"))?;
        let id = match items.first() {
            Some(BulkString(bs)) => String::from_utf8_lossy(bs).into_owned(),
            Some(Value::SimpleString(s)) => s.clone(),
            _ => return Err(protocol("stream entry has no id")),
        };
        let mut fields = HashMap::new();
        match items.get(1) {
            // entries deleted while pending come back with nil fields
            None | Some(Value::Nil) => {}

            Some(Value::Map(pairs)) => {
                for (k, v) in pairs {
                    fields.insert(bytes_to_string(k)?, value_bytes(v)?);
                }
            }

            Some(other) => {
                let flat = other
                    .as_sequence()
                    .ok_or_else(|| protocol("stream entry fields are not an array"))?;
                for pair in flat.chunks(2) {
                    if let [k, v] = pair {
                        fields.insert(bytes_to_string(k)?, value_bytes(v)?);
                    } else {
                        warn!("Entry `{id}` has a dangling field, ignored.");
                    }
                }
            }
        }
        messages.push(StreamMessage { id: id, fields: fields });
    }
    Ok(messages)
}

fn value_bytes(value: &Value) -> Result<Vec<u8>, StreamError> {
    match value {
        BulkString(bs) => Ok(bs.clone()),
        Value::SimpleString(s) => Ok(s.clone().into_bytes()),
        Value::Int(i) => Ok(i.to_string().into_bytes()),
        other => Err(protocol(&format!("unexpected field value `{other:?}`"))),
    }
}

fn bytes_to_string(value: &Value) -> Result<String, StreamError> {
    value_bytes(value).map(|bs| String::from_utf8_lossy(&bs).into_owned())
}

fn protocol(message: &str) -> StreamError {
    StreamError::Protocol(message.to_string())
}
