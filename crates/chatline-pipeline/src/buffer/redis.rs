//! Redis Primary Buffer
//!
//! Messages are kept in Redis lists sharded by chat room: producers push on
//! the left, workers pop from the right, so the right end of a shard is always
//! its oldest entry. Messages of one room always land in the same shard and
//! keep their order.
//!
//! ## Layout
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `{key}:{shard}` | list | `"<sequence>|<json payload>"` entries |
//! | `{key}:{shard}:inflight:{node}` | list | entries drained by `node`, not yet acknowledged |
//! | `{key}:seq` | string | last issued sequence (`INCR`), shared by all shards |
//! | `{key}:room:{chatroom_id}:recent` | list | newest `history_len` payloads of a room |
//!
//! `shard = chatroom_id mod redis_shards`.
//!
//! ## Operations
//!
//! - **enqueue**: one Lua script checks the shard's `LLEN` against `max_len`,
//!   takes a sequence with `INCR`, `LPUSH`es the entry, records the payload in
//!   the room's recent history and refreshes the TTLs. A full shard is refused
//!   with [`BufferError::Full`].
//! - **drain**: a script pops the oldest entries of a shard and parks them in
//!   the node's in-flight list in the same step. Shards are visited round-robin
//!   so one busy room cannot starve the others.
//! - **acknowledge**: removes handled entries from the in-flight list.
//! - **requeue**: a script `RPUSH`es retries (in reverse) so they sit at the
//!   right end of their shard and are popped next.
//!
//! A drain that times out may still have moved entries on the server. Nothing
//! is lost: before the next drain (and before the first one of a process) the
//! in-flight lists are moved back to the right end of their shards. Entries
//! can therefore be delivered twice, which the idempotent store insert absorbs.
//!
//! Every call is bounded by `command_timeout`. Connection failures, command
//! errors and timeouts all surface as [`BufferError::Unavailable`]. The
//! connection is established lazily and re-established by the connection
//! manager, so a process can start while Redis is still down.
//!
//! The key TTL (`key_ttl`) is only a safety net for abandoned keys. Message
//! age is enforced by the worker, which dead-letters entries older than its
//! retention.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chatline_core::{codec, BufferedMessage, MessageId, MessageRecord};
use redis::aio::ConnectionManager;
use redis::{RedisResult, Script};
use tokio::sync::Mutex;

use super::{MessageBuffer, RawEntry};
use crate::config::BufferConfig;
use crate::error::BufferError;

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('LLEN', KEYS[1]) >= tonumber(ARGV[2]) then
  redis.call('EXPIRE', KEYS[1], ARGV[3])
  return -1
end
local seq = redis.call('INCR', KEYS[2])
redis.call('LPUSH', KEYS[1], seq .. '|' .. ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[3])
local history = tonumber(ARGV[4])
if history > 0 then
  redis.call('LPUSH', KEYS[3], ARGV[1])
  redis.call('LTRIM', KEYS[3], 0, history - 1)
  redis.call('EXPIRE', KEYS[3], ARGV[3])
end
return seq
"#;

const DRAIN_SCRIPT: &str = r#"
local items = redis.call('RPOP', KEYS[1], ARGV[1])
if not items then
  return {}
end
for i = 1, #items do
  redis.call('LPUSH', KEYS[2], items[i])
end
redis.call('EXPIRE', KEYS[2], ARGV[2])
return items
"#;

const ACK_SCRIPT: &str = r#"
local removed = 0
for i = 1, #ARGV do
  removed = removed + redis.call('LREM', KEYS[1], 1, ARGV[i])
end
return removed
"#;

const REQUEUE_SCRIPT: &str = r#"
for i = 2, #ARGV do
  local seq = redis.call('INCR', KEYS[2])
  redis.call('RPUSH', KEYS[1], seq .. '|' .. ARGV[i])
end
redis.call('EXPIRE', KEYS[1], ARGV[1])
return #ARGV - 1
"#;

// Newest in-flight entry first, so the oldest ends up rightmost again
const RECOVER_SCRIPT: &str = r#"
local moved = 0
while redis.call('LMOVE', KEYS[2], KEYS[1], 'LEFT', 'RIGHT') do
  moved = moved + 1
end
if moved > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return moved
"#;

struct Shard {
    list: String,
    in_flight: String,
}

struct DrainState {
    /// Shard the next drain starts with
    cursor: usize,
    /// Drained, not yet acknowledged entries with their shard index
    pending: Vec<(usize, RawEntry)>,
    /// In-flight lists may hold entries no one will acknowledge
    recover: bool,
}

pub struct RedisBuffer {
    name: String,
    client: redis::Client,
    conn: Mutex<Option<ConnectionManager>>,
    key: String,
    seq_key: String,
    shards: Vec<Shard>,
    max_len: u64,
    ttl_secs: u64,
    history_len: usize,
    command_timeout: Duration,
    enqueue_script: Script,
    drain_script: Script,
    ack_script: Script,
    requeue_script: Script,
    recover_script: Script,
    /// Serializes drains, acknowledgements and recovery
    drain: Mutex<DrainState>,
}

impl RedisBuffer {
    /// Build the buffer without connecting. Fails only on a malformed URL.
    ///
    /// In-flight lists belong to node 0 until [`RedisBuffer::with_node`] is
    /// called.
    pub fn new(name: impl Into<String>, config: &BufferConfig) -> Result<Self, BufferError> {
        let name = name.into();
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| BufferError::unavailable(&name, e))?;
        let shard_count = config.redis_shards.max(1);

        Ok(Self {
            client,
            conn: Mutex::new(None),
            seq_key: format!("{}:seq", config.redis_key),
            shards: shards(&config.redis_key, shard_count, 0),
            key: config.redis_key.clone(),
            max_len: config.redis_max_len,
            ttl_secs: config.key_ttl.as_secs().max(1),
            history_len: config.history_len,
            command_timeout: config.command_timeout,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            drain_script: Script::new(DRAIN_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            requeue_script: Script::new(REQUEUE_SCRIPT),
            recover_script: Script::new(RECOVER_SCRIPT),
            drain: Mutex::new(DrainState {
                cursor: 0,
                pending: Vec::new(),
                recover: true,
            }),
            name,
        })
    }

    /// Keep in-flight entries under this node's own keys
    pub fn with_node(mut self, node: u16) -> Self {
        self.shards = shards(&self.key, self.shards.len(), node);
        self
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// List key of the shard holding `chatroom_id`
    pub fn shard_key(&self, chatroom_id: i64) -> &str {
        &self.shards[shard_index(chatroom_id, self.shards.len())].list
    }

    /// Newest buffered messages of a room, newest first.
    ///
    /// The history is written on enqueue and survives the drain, so it also
    /// holds messages that are already persisted.
    pub async fn recent(
        &self,
        chatroom_id: i64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, BufferError> {
        let limit = limit.min(self.history_len);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(history_key(&self.key, chatroom_id))
            .arg(0)
            .arg(limit as i64 - 1);
        let payloads: Vec<Vec<u8>> = self.bounded(cmd.query_async(&mut conn)).await?;

        Ok(payloads
            .iter()
            .filter_map(|payload| match codec::decode(payload) {
                Ok(message) => Some(message.record),
                Err(e) => {
                    tracing::debug!(buffer = %self.name, chatroom_id, error = %e, "Skipping unreadable history entry");
                    None
                }
            })
            .collect())
    }

    /// Look a message up in its room's recent history
    pub async fn find(
        &self,
        chatroom_id: i64,
        id: MessageId,
    ) -> Result<Option<MessageRecord>, BufferError> {
        let recent = self.recent(chatroom_id, self.history_len).await?;
        Ok(recent.into_iter().find(|record| record.id == id))
    }

    async fn connection(&self) -> Result<ConnectionManager, BufferError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let manager = tokio::time::timeout(
            self.command_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await
        .map_err(|_| BufferError::unavailable(&self.name, "connect timed out"))?
        .map_err(|e| BufferError::unavailable(&self.name, e))?;

        tracing::info!(
            buffer = %self.name,
            key = %self.key,
            shards = self.shards.len(),
            "Connected to Redis"
        );
        *slot = Some(manager.clone());
        Ok(manager)
    }

    async fn bounded<T, F>(&self, command: F) -> Result<T, BufferError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, command).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(BufferError::unavailable(&self.name, e)),
            Err(_) => Err(BufferError::unavailable(&self.name, "command timed out")),
        }
    }

    /// Move every in-flight entry of this node back to its shard
    async fn recover(
        &self,
        conn: &mut ConnectionManager,
        state: &mut DrainState,
    ) -> Result<(), BufferError> {
        let mut moved = 0u64;
        for shard in &self.shards {
            let mut invocation = self.recover_script.key(&shard.list);
            invocation.key(&shard.in_flight).arg(self.ttl_secs);
            let n: u64 = self.bounded(invocation.invoke_async(conn)).await?;
            moved += n;
        }

        state.pending.clear();
        state.recover = false;
        if moved > 0 {
            tracing::warn!(
                buffer = %self.name,
                moved = moved,
                "Returned unacknowledged entries to the buffer"
            );
        }
        Ok(())
    }
}

fn shards(key: &str, count: usize, node: u16) -> Vec<Shard> {
    (0..count)
        .map(|i| Shard {
            list: format!("{}:{}", key, i),
            in_flight: format!("{}:{}:inflight:{}", key, i, node),
        })
        .collect()
}

fn shard_index(chatroom_id: i64, count: usize) -> usize {
    chatroom_id.rem_euclid(count.max(1) as i64) as usize
}

fn history_key(key: &str, chatroom_id: i64) -> String {
    format!("{}:room:{}:recent", key, chatroom_id)
}

/// Split a stored `"<sequence>|<payload>"` entry.
///
/// Entries without a valid prefix are passed on whole with sequence 0; the
/// decoder then reports them as corrupt.
fn parse_entry(raw: Vec<u8>) -> RawEntry {
    if let Some(pos) = raw.iter().position(|b| *b == b'|') {
        let sequence = std::str::from_utf8(&raw[..pos])
            .ok()
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(sequence) = sequence {
            let payload = Bytes::from(raw).slice(pos + 1..);
            return RawEntry { sequence, payload };
        }
    }
    RawEntry {
        sequence: 0,
        payload: Bytes::from(raw),
    }
}

/// Inverse of [`parse_entry`]. Issued sequences start at 1, so 0 marks an
/// entry that had no prefix.
fn stored_form(entry: &RawEntry) -> Vec<u8> {
    if entry.sequence == 0 {
        return entry.payload.to_vec();
    }
    let mut raw = format!("{}|", entry.sequence).into_bytes();
    raw.extend_from_slice(&entry.payload);
    raw
}

#[async_trait]
impl MessageBuffer for RedisBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, message: &BufferedMessage) -> Result<u64, BufferError> {
        let payload = codec::encode(message)?;
        let chatroom_id = message.record.chatroom_id;
        let mut conn = self.connection().await?;

        let mut invocation = self.enqueue_script.key(self.shard_key(chatroom_id));
        invocation
            .key(&self.seq_key)
            .key(history_key(&self.key, chatroom_id))
            .arg(payload.as_ref())
            .arg(self.max_len)
            .arg(self.ttl_secs)
            .arg(self.history_len);

        let seq: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        if seq < 0 {
            return Err(BufferError::Full {
                buffer: self.name.clone(),
                capacity: self.max_len,
            });
        }
        Ok(seq as u64)
    }

    async fn drain_up_to(&self, max: usize) -> Result<Vec<RawEntry>, BufferError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.drain.lock().await;
        let mut conn = self.connection().await?;
        if state.recover {
            self.recover(&mut conn, &mut state).await?;
        }

        let start = state.cursor;
        state.cursor = (start + 1) % self.shards.len();

        let mut drained = Vec::new();
        for offset in 0..self.shards.len() {
            let remaining = max - drained.len();
            if remaining == 0 {
                break;
            }
            let index = (start + offset) % self.shards.len();
            let shard = &self.shards[index];

            let mut invocation = self.drain_script.key(&shard.list);
            invocation
                .key(&shard.in_flight)
                .arg(remaining)
                .arg(self.ttl_secs);
            let popped: Vec<Vec<u8>> = match self.bounded(invocation.invoke_async(&mut conn)).await
            {
                Ok(popped) => popped,
                Err(e) => {
                    // Anything already moved is returned by the next recovery
                    state.recover = true;
                    return Err(e);
                }
            };

            for raw in popped {
                let entry = parse_entry(raw);
                state.pending.push((index, entry.clone()));
                drained.push(entry);
            }
        }

        Ok(drained)
    }

    async fn acknowledge(&self, entries: &[RawEntry]) -> Result<(), BufferError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut state = self.drain.lock().await;
        let mut by_shard: Vec<Vec<Vec<u8>>> = vec![Vec::new(); self.shards.len()];
        for entry in entries {
            if let Some(pos) = state.pending.iter().position(|(_, e)| e == entry) {
                let (index, entry) = state.pending.swap_remove(pos);
                by_shard[index].push(stored_form(&entry));
            }
        }

        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                state.recover = true;
                return Err(e);
            }
        };
        for (index, raws) in by_shard.iter().enumerate() {
            if raws.is_empty() {
                continue;
            }
            let mut invocation = self.ack_script.key(&self.shards[index].in_flight);
            for raw in raws {
                invocation.arg(raw.as_slice());
            }
            let removed: Result<i64, _> = self.bounded(invocation.invoke_async(&mut conn)).await;
            if let Err(e) = removed {
                state.recover = true;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn requeue_front(&self, messages: Vec<BufferedMessage>) -> Result<(), BufferError> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut groups: Vec<Vec<Bytes>> = vec![Vec::new(); self.shards.len()];
        for message in &messages {
            let index = shard_index(message.record.chatroom_id, self.shards.len());
            groups[index].push(codec::encode(message)?);
        }
        let mut conn = self.connection().await?;

        for (index, payloads) in groups.iter().enumerate() {
            if payloads.is_empty() {
                continue;
            }
            let mut invocation = self.requeue_script.key(&self.shards[index].list);
            invocation.key(&self.seq_key).arg(self.ttl_secs);
            for payload in payloads.iter().rev() {
                invocation.arg(payload.as_ref());
            }
            let _pushed: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        }
        Ok(())
    }

    async fn size(&self) -> Result<u64, BufferError> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for shard in &self.shards {
            pipe.cmd("LLEN").arg(&shard.list);
        }
        let lengths: Vec<u64> = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(lengths.iter().sum())
    }

    async fn is_healthy(&self) -> bool {
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(_) => return false,
        };
        let cmd = redis::cmd("PING");
        let pong: Result<String, _> = self.bounded(cmd.query_async(&mut conn)).await;
        pong.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entry_splits_sequence() {
        let entry = parse_entry(b"42|{\"kind\":\"chat\"}".to_vec());
        assert_eq!(entry.sequence, 42);
        assert_eq!(entry.payload.as_ref(), b"{\"kind\":\"chat\"}");
    }

    #[test]
    fn test_parse_entry_keeps_pipes_in_payload() {
        let entry = parse_entry(b"7|a|b".to_vec());
        assert_eq!(entry.sequence, 7);
        assert_eq!(entry.payload.as_ref(), b"a|b");
    }

    #[test]
    fn test_parse_entry_without_prefix() {
        let entry = parse_entry(b"{\"kind\":\"chat\",\"body\":\"x|y\"}".to_vec());
        assert_eq!(entry.sequence, 0);
        assert!(entry.payload.starts_with(b"{"));
    }

    #[test]
    fn test_stored_form_restores_raw_entry() {
        for raw in [&b"42|{\"a\":1}"[..], b"7|a|b", b"no prefix at all"] {
            assert_eq!(stored_form(&parse_entry(raw.to_vec())), raw);
        }
    }

    #[test]
    fn test_rooms_map_to_stable_shards() {
        assert_eq!(shard_index(0, 4), 0);
        assert_eq!(shard_index(9, 4), 1);
        assert_eq!(shard_index(-1, 4), 3);
        assert_eq!(shard_index(123, 1), 0);
        assert_eq!(shard_index(5, 0), 0);
    }

    #[test]
    fn test_keys_are_sharded_per_node() {
        let config = BufferConfig {
            redis_key: "chat:buffer".to_string(),
            redis_shards: 3,
            ..BufferConfig::default()
        };
        let buffer = RedisBuffer::new("redis", &config).unwrap().with_node(7);

        assert_eq!(buffer.shard_count(), 3);
        assert_eq!(buffer.shard_key(10), "chat:buffer:1");
        assert_eq!(buffer.shards[2].in_flight, "chat:buffer:2:inflight:7");
        assert_eq!(history_key("chat:buffer", 10), "chat:buffer:room:10:recent");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let config = BufferConfig {
            redis_url: "not a url".to_string(),
            ..BufferConfig::default()
        };
        assert!(RedisBuffer::new("redis", &config).is_err());
    }
}
