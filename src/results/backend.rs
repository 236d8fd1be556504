//! Key-value backends holding result records

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{Error, Result};

/// Default lifetime of a record after its most recent write
pub const RESULT_TTL: Duration = Duration::from_secs(3600);

/// Storage for result records keyed by request id
///
/// `append` must be atomic per key: concurrent appends to the same request
/// id never lose a payload.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Append a payload and reset the record's TTL
    ///
    /// An absent record becomes `[payload]`; a list gains `payload` at the
    /// end; any other stored value becomes `[old, payload]`.
    async fn append(&self, request_id: &str, payload: Value, ttl: Duration) -> Result<()>;

    /// Current record, if present and not expired
    async fn get(&self, request_id: &str) -> Result<Option<Value>>;
}

fn appended(existing: Option<Value>, payload: Value) -> Value {
    match existing {
        None => Value::Array(vec![payload]),
        Some(Value::Array(mut items)) => {
            items.push(payload);
            Value::Array(items)
        }
        Some(other) => Value::Array(vec![other, payload]),
    }
}

/// In-process backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, (Value, Instant)>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw value, replacing any record
    pub async fn insert_raw(&self, request_id: &str, value: Value, ttl: Duration) {
        self.records
            .lock()
            .await
            .insert(request_id.to_string(), (value, Instant::now() + ttl));
    }
}

#[async_trait]
impl ResultBackend for MemoryBackend {
    async fn append(&self, request_id: &str, payload: Value, ttl: Duration) -> Result<()> {
        let mut records = self.records.lock().await;
        let now = Instant::now();
        let existing = records
            .remove(request_id)
            .filter(|(_, expires)| *expires > now)
            .map(|(value, _)| value);
        records.insert(request_id.to_string(), (appended(existing, payload), now + ttl));
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<Value>> {
        let mut records = self.records.lock().await;
        match records.get(request_id) {
            Some((_, expires)) if *expires <= Instant::now() => {
                records.remove(request_id);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }
}

/// Appends on the server so concurrent writers cannot interleave
const APPEND_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
local payload = ARGV[1]
local value
if not current then
  value = '[' .. payload .. ']'
else
  local ok, decoded = pcall(cjson.decode, current)
  if ok and type(decoded) == 'table' and string.sub(current, 1, 1) == '[' then
    if string.match(current, '^%[%s*%]$') then
      value = '[' .. payload .. ']'
    else
      value = string.sub(current, 1, -2) .. ',' .. payload .. ']'
    end
  else
    value = '[' .. current .. ',' .. payload .. ']'
  end
end
redis.call('SET', KEYS[1], value, 'EX', tonumber(ARGV[2]))
return 1
";

/// Redis backend
#[derive(Clone)]
pub struct RedisBackend {
    connection: redis::aio::MultiplexedConnection,
    script: redis::Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to the given Redis URL
    ///
    /// # Errors
    ///
    /// Returns a storage error if the server cannot be reached
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        tracing::info!("connected to redis result store");
        Ok(Self {
            connection,
            script: redis::Script::new(APPEND_SCRIPT),
        })
    }
}

#[async_trait]
impl ResultBackend for RedisBackend {
    async fn append(&self, request_id: &str, payload: Value, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let encoded = serde_json::to_string(&payload)?;
        let _: i64 = self
            .script
            .key(request_id)
            .arg(encoded)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<Value>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(request_id)
            .query_async(&mut conn)
            .await?;
        raw.map(|s| decode_record(request_id, &s)).transpose()
    }
}

/// Parse a stored record; a record that no longer parses is a storage fault
fn decode_record(request_id: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Storage(format!("corrupt record for {request_id}: {e}")))
}
