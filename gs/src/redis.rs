//! Redis store implementation
//!
//! Every transition runs as one server-side Lua script, so concurrent
//! processes see each operation atomically: claims flip state and move the
//! running gauge in the same step, token takes refill-check-decrement all
//! buckets against the server clock, cancels only ever hit still-queued
//! records. Retention rides on key TTLs; `purge_expired` reaps the index
//! ghosts TTL expiry leaves behind.
//!
//! Connections are established lazily and re-established by the connection
//! manager, so a process starts (and can immediately degrade) while the
//! store is down.
//!
//! Key shape under the configured prefix:
//! `{p}:job:{id}` record hash, `{p}:queued:{kind}` claim-order zset,
//! `{p}:counts:{kind}` gauge hash, `{p}:bucket:{key}` bucket hash.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;
use tracing::debug;

use crate::bucket::{Bucket, TakeResult};
use crate::record::{JobKind, JobOutcome, JobRecord, now_ms};
use crate::store::{BucketTake, JobCounts, Store, StoreError};

/// Keeps priority bands from colliding with enqueue timestamps in zset
/// scores; safe until unix millis outgrow 10^13 (year 2286)
const PRIORITY_STRIDE: f64 = 1e13;

/// Atomically persist a queued job: record fields, TTL, index entry, gauge
const PUT_JOB_SCRIPT: &str = r#"
redis.call('HSET', KEYS[1], unpack(ARGV, 4))
redis.call('PEXPIRE', KEYS[1], ARGV[3])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
redis.call('HINCRBY', KEYS[3], 'queued', 1)
return 1
"#;

/// Claim the best queued job if the running gauge is under the limit.
/// Index entries whose record TTL already fired are ghosts: drop them and
/// keep looking.
const CLAIM_SCRIPT: &str = r#"
local running = tonumber(redis.call('HGET', KEYS[2], 'running') or '0')
if running >= tonumber(ARGV[1]) then
  return false
end
while true do
  local ids = redis.call('ZRANGE', KEYS[1], 0, 0)
  if #ids == 0 then
    return false
  end
  local key = ARGV[3] .. ids[1]
  redis.call('ZREM', KEYS[1], ids[1])
  local state = redis.call('HGET', key, 'state')
  if state == 'queued' then
    redis.call('HSET', key, 'state', 'running', 'started_at', ARGV[2])
    redis.call('HINCRBY', KEYS[2], 'queued', -1)
    redis.call('HINCRBY', KEYS[2], 'running', 1)
    return redis.call('HGETALL', key)
  end
  if not state then
    redis.call('HINCRBY', KEYS[2], 'queued', -1)
  end
end
"#;

/// Write a terminal outcome. The running slot is released whenever the
/// worker actually held one: on a clean write, and also when the record
/// lapsed out of retention mid-run. A record in any other state releases
/// nothing and writes nothing.
const FINISH_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state and state ~= 'running' then
  return 0
end
if state == 'running' then
  redis.call('HSET', KEYS[1], 'state', ARGV[2], 'completed_at', ARGV[1], ARGV[3], ARGV[4])
  redis.call('HINCRBY', KEYS[2], ARGV[2], 1)
end
local running = redis.call('HINCRBY', KEYS[2], 'running', -1)
if running < 0 then
  redis.call('HSET', KEYS[2], 'running', 0)
end
if state then
  return 1
end
return 0
"#;

/// Atomic queued-to-cancelled. Kind is read off the record to locate the
/// index and gauges (single-node deployment assumption, as everywhere here).
const CANCEL_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state ~= 'queued' then
  return 0
end
local kind = redis.call('HGET', KEYS[1], 'kind')
local id = redis.call('HGET', KEYS[1], 'id')
redis.call('HSET', KEYS[1], 'state', 'cancelled', 'completed_at', ARGV[1])
redis.call('ZREM', ARGV[2] .. ':queued:' .. kind, id)
local counts = ARGV[2] .. ':counts:' .. kind
redis.call('HINCRBY', counts, 'queued', -1)
redis.call('HINCRBY', counts, 'cancelled', 1)
return 1
"#;

/// Refill-check-decrement across all listed buckets, all-or-nothing,
/// against the server clock so every process refills identically. Mirrors
/// `bucket::Bucket::take`. Refill watermarks are persisted even on denial.
const TAKE_TOKENS_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
local granted = true
local wait = 0
local levels = {}
for i = 1, #KEYS do
  local base = (i - 1) * 3
  local capacity = tonumber(ARGV[base + 1])
  local rate = tonumber(ARGV[base + 2])
  local cost = tonumber(ARGV[base + 3])
  local state = redis.call('HMGET', KEYS[i], 'tokens', 'refilled_at')
  local tokens = tonumber(state[1])
  local at = tonumber(state[2])
  if tokens == nil then
    tokens = capacity
    at = now
  end
  if now > at then
    tokens = math.min(capacity, tokens + (now - at) / 1000.0 * rate)
    at = now
  end
  if tokens + 1e-9 < cost then
    granted = false
    if rate > 0 then
      local w = math.ceil((cost - tokens) / rate * 1000.0)
      if w > wait then
        wait = w
      end
    else
      wait = 9e15
    end
  end
  levels[i] = {tokens, at, cost}
end
for i = 1, #KEYS do
  local tokens = levels[i][1]
  if granted then
    tokens = tokens - levels[i][3]
    if tokens < 0 then
      tokens = 0
    end
  end
  redis.call('HSET', KEYS[i], 'tokens', tostring(tokens), 'refilled_at', tostring(levels[i][2]))
end
if granted then
  return {1, 0}
end
return {0, wait}
"#;

/// Reap index ghosts for one kind (records whose TTL fired while queued)
const PURGE_SCRIPT: &str = r#"
local purged = 0
local ids = redis.call('ZRANGE', KEYS[1], 0, -1)
for i = 1, #ids do
  if redis.call('EXISTS', ARGV[1] .. ids[i]) == 0 then
    redis.call('ZREM', KEYS[1], ids[i])
    redis.call('HINCRBY', KEYS[2], 'queued', -1)
    purged = purged + 1
  end
end
return purged
"#;

struct Scripts {
    put_job: Script,
    claim: Script,
    finish: Script,
    cancel: Script,
    take_tokens: Script,
    purge: Script,
}

/// Shared-store client backed by Redis
pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<Option<ConnectionManager>>,
    prefix: String,
    scripts: Scripts,
}

// Manual impl: `ConnectionManager` is not `Debug`, so this can't be derived
impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("client", &self.client)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Build a client for `url` under `prefix`. No connection is attempted
    /// here; the first operation establishes one (and fails soft into
    /// degraded mode if the store is down).
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            prefix: prefix.into(),
            scripts: Scripts {
                put_job: Script::new(PUT_JOB_SCRIPT),
                claim: Script::new(CLAIM_SCRIPT),
                finish: Script::new(FINISH_SCRIPT),
                cancel: Script::new(CANCEL_SCRIPT),
                take_tokens: Script::new(TAKE_TOKENS_SCRIPT),
                purge: Script::new(PURGE_SCRIPT),
            },
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, StoreError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        debug!("RedisStore::conn: establishing connection");
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn queued_key(&self, kind: JobKind) -> String {
        format!("{}:queued:{}", self.prefix, kind)
    }

    fn counts_key(&self, kind: JobKind) -> String {
        format!("{}:counts:{}", self.prefix, kind)
    }

    fn bucket_key(&self, key: &str) -> String {
        format!("{}:bucket:{}", self.prefix, key)
    }
}

/// Zset score encoding claim order: band first, enqueue time second
fn claim_score(band: u8, created_at_ms: i64) -> f64 {
    band as f64 * PRIORITY_STRIDE + created_at_ms as f64
}

/// HGETALL through Lua comes back as a flat field/value array
fn fields_from_pairs(pairs: Vec<String>) -> Result<HashMap<String, String>, StoreError> {
    if pairs.len() % 2 != 0 {
        return Err(StoreError::Backend(format!(
            "odd hash reply length {}",
            pairs.len()
        )));
    }
    let mut map = HashMap::with_capacity(pairs.len() / 2);
    let mut iter = pairs.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        map.insert(field, value);
    }
    Ok(map)
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let score = claim_score(job.priority.band(), job.created_at);
        let ttl_ms = (job.expires_at - now_ms()).max(1);
        let flat: Vec<String> = job
            .to_fields()
            .into_iter()
            .flat_map(|(field, value)| [field.to_string(), value])
            .collect();

        debug!(id = %job.id, kind = %job.kind, score, ttl_ms, "RedisStore::put_job: called");
        let _: i64 = self
            .scripts
            .put_job
            .key(self.job_key(&job.id))
            .key(self.queued_key(job.kind))
            .key(self.counts_key(job.kind))
            .arg(&job.id)
            .arg(score)
            .arg(ttl_ms)
            .arg(flat)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(self.job_key(id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(JobRecord::from_fields(&map)?))
    }

    async fn claim_next(&self, kind: JobKind, limit: u32) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let reply: Option<Vec<String>> = self
            .scripts
            .claim
            .key(self.queued_key(kind))
            .key(self.counts_key(kind))
            .arg(limit)
            .arg(now_ms())
            .arg(self.job_key_prefix())
            .invoke_async(&mut conn)
            .await?;

        let Some(pairs) = reply else {
            return Ok(None);
        };
        let record = JobRecord::from_fields(&fields_from_pairs(pairs)?)?;
        debug!(id = %record.id, %kind, "RedisStore::claim_next: claimed");
        Ok(Some(record))
    }

    async fn finish_job(&self, id: &str, kind: JobKind, outcome: &JobOutcome) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let (state, value_field, value) = match outcome {
            JobOutcome::Completed(result) => ("completed", "result", result.to_string()),
            JobOutcome::Failed(message) => ("failed", "error", message.clone()),
        };

        debug!(%id, %kind, state, "RedisStore::finish_job: called");
        let wrote: i64 = self
            .scripts
            .finish
            .key(self.job_key(id))
            .key(self.counts_key(kind))
            .arg(now_ms())
            .arg(state)
            .arg(value_field)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(wrote == 1)
    }

    async fn cancel_job(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let cancelled: i64 = self
            .scripts
            .cancel
            .key(self.job_key(id))
            .arg(now_ms())
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await?;
        debug!(%id, cancelled, "RedisStore::cancel_job: done");
        Ok(cancelled == 1)
    }

    async fn counts(&self, kind: JobKind) -> Result<JobCounts, StoreError> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(self.counts_key(kind)).await?;
        // Gauges can transiently read negative between script steps seen
        // from outside; clamp rather than wrap
        let get = |field: &str| {
            map.get(field)
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0)
                .max(0) as u64
        };
        Ok(JobCounts {
            queued: get("queued"),
            running: get("running"),
            completed: get("completed"),
            failed: get("failed"),
            cancelled: get("cancelled"),
        })
    }

    async fn take_tokens(&self, takes: &[BucketTake]) -> Result<TakeResult, StoreError> {
        if takes.is_empty() {
            return Ok(TakeResult::granted());
        }
        let mut conn = self.conn().await?;
        let mut invocation = self.scripts.take_tokens.prepare_invoke();
        for take in takes {
            invocation.key(self.bucket_key(&take.key));
        }
        for take in takes {
            invocation
                .arg(take.params.capacity)
                .arg(take.params.refill_per_sec)
                .arg(take.cost);
        }
        let (granted, wait_ms): (i64, i64) = invocation.invoke_async(&mut conn).await?;
        debug!(buckets = takes.len(), granted, wait_ms, "RedisStore::take_tokens");
        Ok(if granted == 1 {
            TakeResult::granted()
        } else {
            TakeResult::denied(wait_ms.max(0) as u64)
        })
    }

    async fn peek_bucket(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let mut conn = self.conn().await?;
        let pair: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.bucket_key(key))
            .arg("tokens")
            .arg("refilled_at")
            .query_async(&mut conn)
            .await?;
        let (Some(Some(tokens)), Some(Some(refilled_at))) = (pair.first(), pair.get(1)) else {
            return Ok(None);
        };
        let tokens: f64 = tokens
            .parse()
            .map_err(|_| StoreError::Backend(format!("bad bucket level for {}", key)))?;
        let refilled_at_ms: f64 = refilled_at
            .parse()
            .map_err(|_| StoreError::Backend(format!("bad bucket watermark for {}", key)))?;
        Ok(Some(Bucket {
            tokens,
            refilled_at_ms: refilled_at_ms as i64,
        }))
    }

    /// Record TTLs do the real purging server-side; this reaps the
    /// claim-index ghosts expiry leaves and fixes the queued gauges
    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let mut purged = 0u64;
        for kind in JobKind::ALL {
            let n: i64 = self
                .scripts
                .purge
                .key(self.queued_key(kind))
                .key(self.counts_key(kind))
                .arg(self.job_key_prefix())
                .invoke_async(&mut conn)
                .await?;
            purged += n.max(0) as u64;
        }
        if purged > 0 {
            debug!(purged, "RedisStore::purge_expired: ghosts reaped");
        }
        Ok(purged)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketParams;
    use crate::record::{JobState, Priority};
    use serde_json::json;

    #[test]
    fn test_key_shapes() {
        let store = RedisStore::new("redis://127.0.0.1:6379", "gate").unwrap();
        assert_eq!(store.job_key("abc"), "gate:job:abc");
        assert_eq!(store.queued_key(JobKind::Analysis), "gate:queued:analysis");
        assert_eq!(store.counts_key(JobKind::Report), "gate:counts:report");
        assert_eq!(store.bucket_key("acme:gpt:requests"), "gate:bucket:acme:gpt:requests");
    }

    #[test]
    fn test_claim_score_orders_band_before_time() {
        let early_low = claim_score(3, 1_000);
        let late_high = claim_score(1, 2_000_000_000_000);
        assert!(late_high < early_low, "band dominates enqueue time");

        let earlier = claim_score(2, 1_000);
        let later = claim_score(2, 1_001);
        assert!(earlier < later, "FIFO within a band");
    }

    #[test]
    fn test_fields_from_pairs() {
        let map = fields_from_pairs(vec![
            "id".to_string(),
            "j1".to_string(),
            "state".to_string(),
            "queued".to_string(),
        ])
        .unwrap();
        assert_eq!(map.get("id").map(String::as_str), Some("j1"));
        assert_eq!(map.get("state").map(String::as_str), Some("queued"));

        assert!(fields_from_pairs(vec!["dangling".to_string()]).is_err());
    }

    #[test]
    fn test_bad_url_is_connection_error() {
        let err = RedisStore::new("not a url", "gate").unwrap_err();
        assert!(err.is_unavailable());
    }

    // Live round trips against a local server. Run with:
    //   cargo test -p gatestore -- --ignored
    fn live_store() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let prefix = format!("gate-test-{}", uuid::Uuid::now_v7());
        RedisStore::new(&url, prefix).unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a local redis"]
    async fn test_live_job_lifecycle() {
        let store = live_store();
        let job = JobRecord::new(JobKind::Analysis, Priority::High, json!({"url": "https://x.test"}), 2, 60_000);
        store.put_job(&job).await.unwrap();

        let claimed = store.claim_next(JobKind::Analysis, 4).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.state, JobState::Running);
        assert!(claimed.started_at.is_some());

        let wrote = store
            .finish_job(&job.id, JobKind::Analysis, &JobOutcome::Completed(json!({"score": 7})))
            .await
            .unwrap();
        assert!(wrote);

        let done = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.result, Some(json!({"score": 7})));

        let counts = store.counts(JobKind::Analysis).await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.running, 0);
    }

    #[tokio::test]
    #[ignore = "requires a local redis"]
    async fn test_live_cancel_and_ceiling() {
        let store = live_store();
        let a = JobRecord::new(JobKind::Report, Priority::Normal, json!(1), 1, 60_000);
        let b = JobRecord::new(JobKind::Report, Priority::Normal, json!(2), 1, 60_000);
        store.put_job(&a).await.unwrap();
        store.put_job(&b).await.unwrap();

        assert!(store.cancel_job(&a.id).await.unwrap());
        assert!(!store.cancel_job(&a.id).await.unwrap());

        let claimed = store.claim_next(JobKind::Report, 1).await.unwrap().unwrap();
        assert_eq!(claimed.id, b.id);
        assert!(store.claim_next(JobKind::Report, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a local redis"]
    async fn test_live_take_tokens() {
        let store = live_store();
        let take = |cost: f64| {
            vec![BucketTake {
                key: "acme:gpt:requests".to_string(),
                params: BucketParams::new(3.0, 1.0),
                cost,
            }]
        };
        assert!(store.take_tokens(&take(3.0)).await.unwrap().granted);
        let denied = store.take_tokens(&take(1.0)).await.unwrap();
        assert!(!denied.granted);
        assert!(denied.wait_ms > 0 && denied.wait_ms <= 1100);
    }
}
