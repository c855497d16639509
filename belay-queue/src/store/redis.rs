//! Redis-backed job store.
//!
//! Key layout under the configured prefix `p`:
//!
//! - `p:job:{id}`: hash holding the record, times as epoch milliseconds
//! - `p:scheduled`: pending jobs not yet promoted, scored by `run_at`
//! - `p:ready:{queue}`: due jobs of one queue, scored by priority
//! - `p:queues`: names of queues that may have a ready set
//! - `p:locked`: claimed jobs scored by `locked_at`
//! - `p:failed`: failed jobs scored by `failed_at`
//! - `p:owner:{len}:{type}:{id}`: the owner's jobs scored by insertion
//!   sequence; `len` is the byte length of `type`
//! - `p:seq`: insertion counter
//!
//! A claim first moves every due job from `scheduled` into its queue's ready
//! set, once per job. Ready members are `{run_at:016}:{seq:016}:{id}`, so
//! equal priorities fall back to byte order, which is run time then
//! insertion order. The head of each ready set is the queue's next job.
//!
//! Every state transition runs as one Lua script, so a claim or conditional
//! mutation is atomic across processes. The scripts compute keys from the
//! prefix, which keeps all keys on one node: this store is not Redis Cluster
//! safe.

use super::{JobStore, QueueFilter, QueueStats};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobUpdate, Owner, Payload, UpdateOutcome};
use crate::retry::Disposition;
use async_trait::async_trait;
use belay_log::{debug, info};
use chrono::{DateTime, Utc};
use ::redis::{AsyncCommands, Client, aio::ConnectionManager};
use std::collections::HashMap;
use uuid::Uuid;

/// Lua shared by every script. `ARGV[1]` is always the key prefix.
macro_rules! lua_prelude {
    () => {
        r#"
local prefix = ARGV[1]

local function job_key(id)
    return prefix .. 'job:' .. id
end

local function ready_key(queue)
    return prefix .. 'ready:' .. queue
end

local function unqueue(key, id)
    redis.call('ZREM', prefix .. 'scheduled', id)
    local fields = redis.call('HMGET', key, 'queue', 'ready_member')
    if fields[1] and fields[2] then
        redis.call('ZREM', ready_key(fields[1]), fields[2])
        redis.call('HDEL', key, 'ready_member')
    end
end

local function promote(now)
    local due = redis.call('ZRANGEBYSCORE', prefix .. 'scheduled', '-inf', now)
    for _, id in ipairs(due) do
        local key = job_key(id)
        local fields = redis.call('HMGET', key, 'queue', 'priority', 'run_at', 'seq')
        if fields[1] then
            local run_at = math.max(tonumber(fields[3]), 0)
            local member = string.format('%016d:%016d:%s', run_at, tonumber(fields[4]), id)
            redis.call('ZADD', ready_key(fields[1]), fields[2], member)
            redis.call('SADD', prefix .. 'queues', fields[1])
            redis.call('HSET', key, 'ready_member', member)
        end
        redis.call('ZREM', prefix .. 'scheduled', id)
    end
end
"#
    };
}

const INSERT_SCRIPT: &str = concat!(
    lua_prelude!(),
    r#"
local id = ARGV[2]
local key = job_key(id)
local seq = redis.call('INCR', prefix .. 'seq')
redis.call('HSET', key, 'seq', seq, unpack(ARGV, 5))
if ARGV[4] ~= '' then
    redis.call('HSET', key, 'owner_key', ARGV[4])
    redis.call('ZADD', ARGV[4], seq, id)
end
redis.call('ZADD', prefix .. 'scheduled', ARGV[3], id)
return seq
"#
);

const CLAIM_SCRIPT: &str = concat!(
    lua_prelude!(),
    r#"
local now = ARGV[2]
promote(now)

local queues
if #ARGV < 5 then
    queues = redis.call('SMEMBERS', prefix .. 'queues')
else
    queues = {}
    for i = 5, #ARGV do
        table.insert(queues, ARGV[i])
    end
end

local best_queue, best_member, best_priority
for _, queue in ipairs(queues) do
    local head = redis.call('ZRANGE', ready_key(queue), 0, 0, 'WITHSCORES')
    if #head == 0 then
        redis.call('SREM', prefix .. 'queues', queue)
    else
        local priority = tonumber(head[2])
        if best_member == nil
            or priority < best_priority
            or (priority == best_priority and head[1] < best_member) then
            best_queue, best_member, best_priority = queue, head[1], priority
        end
    end
end

if best_member == nil then
    return {}
end

-- past the 34-byte '{run_at}:{seq}:' head
local id = string.sub(best_member, 35)
local key = job_key(id)
redis.call('ZREM', ready_key(best_queue), best_member)
redis.call('HDEL', key, 'ready_member')
redis.call('ZADD', prefix .. 'locked', now, id)
redis.call('HSET', key, 'locked_at', now, 'locked_by', ARGV[3], 'lock_token', ARGV[4], 'updated_at', now)
return redis.call('HGETALL', key)
"#
);

const UPDATE_SCRIPT: &str = concat!(
    lua_prelude!(),
    r#"
local id = ARGV[2]
local key = job_key(id)
if redis.call('EXISTS', key) == 0 then
    return -1
end
if redis.call('HEXISTS', key, 'locked_at') == 1 or redis.call('HEXISTS', key, 'failed_at') == 1 then
    return 0
end
unqueue(key, id)
if ARGV[3] ~= '' then
    redis.call('HSET', key, 'run_at', ARGV[3])
end
if ARGV[4] ~= '' then
    redis.call('HSET', key, 'priority', ARGV[4])
end
if ARGV[5] ~= '' then
    redis.call('HSET', key, 'queue', ARGV[5])
end
redis.call('HSET', key, 'updated_at', ARGV[6])
redis.call('ZADD', prefix .. 'scheduled', redis.call('HGET', key, 'run_at'), id)
return 1
"#
);

const DELETE_SCRIPT: &str = concat!(
    lua_prelude!(),
    r#"
local id = ARGV[2]
local key = job_key(id)
if redis.call('EXISTS', key) == 0 then
    return 0
end
if ARGV[3] == '1' and (redis.call('HEXISTS', key, 'locked_at') == 1 or redis.call('HEXISTS', key, 'failed_at') == 1) then
    return -1
end
unqueue(key, id)
local owner_key = redis.call('HGET', key, 'owner_key')
if owner_key then
    redis.call('ZREM', owner_key, id)
end
redis.call('ZREM', prefix .. 'locked', id)
redis.call('ZREM', prefix .. 'failed', id)
redis.call('DEL', key)
return 1
"#
);

const RECORD_FAILURE_SCRIPT: &str = concat!(
    lua_prelude!(),
    r#"
local id = ARGV[2]
local key = job_key(id)
if redis.call('EXISTS', key) == 0 then
    return -1
end
local claim = redis.call('HMGET', key, 'locked_by', 'lock_token')
if ARGV[4] == '' or claim[1] ~= ARGV[3] or claim[2] ~= ARGV[4] then
    return 0
end
redis.call('HINCRBY', key, 'attempts', 1)
redis.call('HDEL', key, 'locked_at', 'locked_by', 'lock_token')
redis.call('HSET', key, 'last_error', ARGV[5], 'updated_at', ARGV[7])
redis.call('ZREM', prefix .. 'locked', id)
if ARGV[6] ~= '' then
    redis.call('HSET', key, 'run_at', ARGV[6])
    redis.call('ZADD', prefix .. 'scheduled', ARGV[6], id)
else
    redis.call('HSET', key, 'failed_at', ARGV[7])
    redis.call('ZADD', prefix .. 'failed', ARGV[7], id)
end
return 1
"#
);

const UNLOCK_EXPIRED_SCRIPT: &str = concat!(
    lua_prelude!(),
    r#"
local locked = prefix .. 'locked'
local expired = redis.call('ZRANGEBYSCORE', locked, '-inf', ARGV[2])
local released = {}
for _, id in ipairs(expired) do
    local key = job_key(id)
    redis.call('ZREM', locked, id)
    if redis.call('EXISTS', key) == 1 then
        local attempts = redis.call('HINCRBY', key, 'attempts', 1)
        redis.call('HDEL', key, 'locked_at', 'locked_by', 'lock_token')
        redis.call('HSET', key, 'last_error', ARGV[3], 'updated_at', ARGV[4])
        if attempts >= tonumber(redis.call('HGET', key, 'max_attempts')) then
            redis.call('HSET', key, 'failed_at', ARGV[4])
            redis.call('ZADD', prefix .. 'failed', ARGV[4], id)
        else
            redis.call('ZADD', prefix .. 'scheduled', redis.call('HGET', key, 'run_at'), id)
        end
        table.insert(released, id)
    end
end
return released
"#
);

const STATS_SCRIPT: &str = concat!(
    lua_prelude!(),
    r#"
local scheduled = prefix .. 'scheduled'
local pending = redis.call('ZCARD', scheduled)
local due = redis.call('ZCOUNT', scheduled, '-inf', ARGV[2])
for _, queue in ipairs(redis.call('SMEMBERS', prefix .. 'queues')) do
    local ready = redis.call('ZCARD', ready_key(queue))
    pending = pending + ready
    due = due + ready
end
return {pending, due, redis.call('ZCARD', prefix .. 'locked'), redis.call('ZCARD', prefix .. 'failed')}
"#
);

/// Redis store configuration.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,

    /// Prefix for every key the store writes
    pub key_prefix: String,
}

impl RedisStoreConfig {
    /// Create a configuration with the default `belay` prefix.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: "belay".to_string(),
        }
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn prefix(&self) -> String {
        format!("{}:", self.key_prefix)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.key_prefix, suffix)
    }

    /// The length of the type makes the key unique even when either part
    /// contains a colon.
    fn owner_key(&self, owner: &Owner) -> String {
        self.key(&format!(
            "owner:{}:{}:{}",
            owner.owner_type.len(),
            owner.owner_type,
            owner.owner_id
        ))
    }
}

/// Job store shared by every process pointed at the same Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
}

impl RedisStore {
    /// Connect with the default key prefix.
    pub async fn new(url: impl Into<String>) -> QueueResult<Self> {
        Self::with_config(RedisStoreConfig::new(url)).await
    }

    /// Connect with a custom configuration.
    pub async fn with_config(config: RedisStoreConfig) -> QueueResult<Self> {
        debug!("Connecting job store - prefix: {}", config.key_prefix);

        let client =
            Client::open(config.url.as_str()).map_err(|e| QueueError::Config(e.to_string()))?;
        let connection = ConnectionManager::new(client).await?;

        info!("Redis job store ready (prefix '{}')", config.key_prefix);
        Ok(Self { connection, config })
    }

    /// Store configuration.
    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn job_key(&self, id: JobId) -> String {
        self.config.key(&format!("job:{}", id))
    }

    fn failed_key(&self) -> String {
        self.config.key("failed")
    }

    /// Load several records in one round trip, skipping ids that vanished.
    async fn load_all(&self, ids: &[String]) -> QueueResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        for id in ids {
            pipe.hgetall(self.config.key(&format!("job:{}", id)));
        }

        let mut conn = self.connection.clone();
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
        rows.into_iter()
            .filter(|fields| !fields.is_empty())
            .map(decode_job)
            .collect()
    }

    async fn delete_with(&self, id: JobId, only_unclaimed: bool) -> QueueResult<i64> {
        let mut conn = self.connection.clone();
        let result: i64 = ::redis::Script::new(DELETE_SCRIPT)
            .arg(self.config.prefix())
            .arg(id.to_string())
            .arg(if only_unclaimed { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(result)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.config.key_prefix)
            .finish()
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn insert(&self, job: Job) -> QueueResult<JobId> {
        let id = job.id;
        let owner_key = job
            .owner
            .as_ref()
            .map(|owner| self.config.owner_key(owner))
            .unwrap_or_default();

        let script = ::redis::Script::new(INSERT_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .arg(self.config.prefix())
            .arg(id.to_string())
            .arg(to_millis(job.run_at))
            .arg(owner_key);
        for (field, value) in encode_job(&job)? {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.connection.clone();
        let _seq: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(id)
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(fields).map(Some)
    }

    async fn find_by_owner(&self, owner: &Owner) -> QueueResult<Vec<Job>> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn.zrange(self.config.owner_key(owner), 0, -1).await?;
        let mut jobs = self.load_all(&ids).await?;
        jobs.retain(|job| job.is_owned_by(owner));
        Ok(jobs)
    }

    async fn update(
        &self,
        id: JobId,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> QueueResult<UpdateOutcome> {
        let mut conn = self.connection.clone();
        let result: i64 = ::redis::Script::new(UPDATE_SCRIPT)
            .arg(self.config.prefix())
            .arg(id.to_string())
            .arg(update.run_at.map(|t| to_millis(t).to_string()).unwrap_or_default())
            .arg(update.priority.map(|p| p.to_string()).unwrap_or_default())
            .arg(update.queue.clone().unwrap_or_default())
            .arg(to_millis(now))
            .invoke_async(&mut conn)
            .await?;

        match result {
            -1 => Err(QueueError::NotFound(id)),
            0 => Ok(UpdateOutcome::Skipped),
            _ => Ok(UpdateOutcome::Applied),
        }
    }

    async fn delete(&self, id: JobId) -> QueueResult<()> {
        self.delete_with(id, false).await?;
        Ok(())
    }

    async fn delete_unclaimed(&self, id: JobId) -> QueueResult<bool> {
        Ok(self.delete_with(id, true).await? == 1)
    }

    async fn claim_next(
        &self,
        filter: &QueueFilter,
        worker: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        let script = ::redis::Script::new(CLAIM_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .arg(self.config.prefix())
            .arg(to_millis(now))
            .arg(worker)
            .arg(Uuid::new_v4().to_string());
        for queue in filter.queues() {
            invocation.arg(queue);
        }

        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = invocation.invoke_async(&mut conn).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(fields).map(Some)
    }

    async fn record_failure(
        &self,
        id: JobId,
        worker: &str,
        lock_token: Option<Uuid>,
        error: &str,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let retry_at = match disposition {
            Disposition::Retry { run_at } => to_millis(run_at).to_string(),
            Disposition::Fail => String::new(),
        };

        let mut conn = self.connection.clone();
        let result: i64 = ::redis::Script::new(RECORD_FAILURE_SCRIPT)
            .arg(self.config.prefix())
            .arg(id.to_string())
            .arg(worker)
            .arg(lock_token.map(|token| token.to_string()).unwrap_or_default())
            .arg(error)
            .arg(retry_at)
            .arg(to_millis(now))
            .invoke_async(&mut conn)
            .await?;

        match result {
            -1 => Err(QueueError::NotFound(id)),
            0 => Err(QueueError::ClaimConflict(id)),
            _ => Ok(()),
        }
    }

    async fn unlock_expired(
        &self,
        locked_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<JobId>> {
        let mut conn = self.connection.clone();
        let released: Vec<String> = ::redis::Script::new(UNLOCK_EXPIRED_SCRIPT)
            .arg(self.config.prefix())
            .arg(to_millis(locked_before))
            .arg(error)
            .arg(to_millis(now))
            .invoke_async(&mut conn)
            .await?;

        released.iter().map(|id| parse_id(id)).collect()
    }

    async fn failed(&self, limit: usize) -> QueueResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let ids: Vec<String> = conn.zrevrange(self.failed_key(), 0, stop).await?;
        self.load_all(&ids).await
    }

    async fn stats(&self, now: DateTime<Utc>) -> QueueResult<QueueStats> {
        let mut conn = self.connection.clone();
        let (pending, due, locked, failed): (u64, u64, u64, u64) =
            ::redis::Script::new(STATS_SCRIPT)
                .arg(self.config.prefix())
                .arg(to_millis(now))
                .invoke_async(&mut conn)
                .await?;

        Ok(QueueStats {
            pending,
            due,
            locked,
            failed,
        })
    }

    async fn clear(&self) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn.keys(self.config.key("*")).await?;

        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        debug!("Cleared job store '{}'", self.config.key_prefix);
        Ok(())
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn parse_id(raw: &str) -> QueueResult<JobId> {
    JobId::parse_str(raw)
        .map_err(|e| QueueError::Deserialization(format!("invalid job id '{}': {}", raw, e)))
}

/// Hash fields for a new record. `seq` is assigned by the insert script.
fn encode_job(job: &Job) -> QueueResult<Vec<(&'static str, String)>> {
    let args = serde_json::to_string(&job.payload.args)
        .map_err(|e| QueueError::Serialization(e.to_string()))?;

    let mut fields = vec![
        ("id", job.id.to_string()),
        ("kind", job.payload.kind.clone()),
        ("args", args),
        ("queue", job.queue.clone()),
        ("priority", job.priority.to_string()),
        ("run_at", to_millis(job.run_at).to_string()),
        ("attempts", job.attempts.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("created_at", to_millis(job.created_at).to_string()),
        ("updated_at", to_millis(job.updated_at).to_string()),
    ];

    if let Some(owner) = &job.owner {
        fields.push(("owner_type", owner.owner_type.clone()));
        fields.push(("owner_id", owner.owner_id.clone()));
    }
    if let Some(locked_at) = job.locked_at {
        fields.push(("locked_at", to_millis(locked_at).to_string()));
    }
    if let Some(locked_by) = &job.locked_by {
        fields.push(("locked_by", locked_by.clone()));
    }
    if let Some(lock_token) = job.lock_token {
        fields.push(("lock_token", lock_token.to_string()));
    }
    if let Some(last_error) = &job.last_error {
        fields.push(("last_error", last_error.clone()));
    }
    if let Some(failed_at) = job.failed_at {
        fields.push(("failed_at", to_millis(failed_at).to_string()));
    }

    Ok(fields)
}

fn decode_job(mut fields: HashMap<String, String>) -> QueueResult<Job> {
    fn required(fields: &mut HashMap<String, String>, name: &str) -> QueueResult<String> {
        fields
            .remove(name)
            .ok_or_else(|| QueueError::Deserialization(format!("missing field '{}'", name)))
    }

    fn number<T: std::str::FromStr>(raw: &str, name: &str) -> QueueResult<T> {
        raw.parse()
            .map_err(|_| QueueError::Deserialization(format!("invalid {} '{}'", name, raw)))
    }

    fn time(raw: &str, name: &str) -> QueueResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(number(raw, name)?)
            .ok_or_else(|| QueueError::Deserialization(format!("{} out of range", name)))
    }

    let id = parse_id(&required(&mut fields, "id")?)?;
    let args = serde_json::from_str(&required(&mut fields, "args")?)
        .map_err(|e| QueueError::Deserialization(e.to_string()))?;

    let owner = match (fields.remove("owner_type"), fields.remove("owner_id")) {
        (Some(owner_type), Some(owner_id)) => Some(Owner {
            owner_type,
            owner_id,
        }),
        _ => None,
    };

    Ok(Job {
        id,
        payload: Payload::new(required(&mut fields, "kind")?, args),
        owner,
        queue: required(&mut fields, "queue")?,
        priority: number(&required(&mut fields, "priority")?, "priority")?,
        run_at: time(&required(&mut fields, "run_at")?, "run_at")?,
        locked_at: fields
            .remove("locked_at")
            .map(|raw| time(&raw, "locked_at"))
            .transpose()?,
        locked_by: fields.remove("locked_by"),
        lock_token: fields
            .remove("lock_token")
            .map(|raw| {
                Uuid::parse_str(&raw).map_err(|e| {
                    QueueError::Deserialization(format!("invalid lock_token '{}': {}", raw, e))
                })
            })
            .transpose()?,
        attempts: number(&required(&mut fields, "attempts")?, "attempts")?,
        max_attempts: number(&required(&mut fields, "max_attempts")?, "max_attempts")?,
        last_error: fields.remove("last_error"),
        failed_at: fields
            .remove("failed_at")
            .map(|raw| time(&raw, "failed_at"))
            .transpose()?,
        created_at: time(&required(&mut fields, "created_at")?, "created_at")?,
        updated_at: time(&required(&mut fields, "updated_at")?, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    // Store tests against a live server are ignored by default.
    // Run with: cargo test -p belay-queue -- --ignored

    use super::*;
    use crate::job::{DEFAULT_QUEUE, NewJob};
    use chrono::Duration;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn as_hash(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }

    #[test]
    fn test_codec_preserves_record() {
        let mut job = NewJob::new("send_reminder", json!({"phone": "+15550100", "n": [1, 2]}))
            .owned_by(Owner::new("Appointment", 42))
            .on_queue("sms")
            .with_priority(-2)
            .build(DEFAULT_QUEUE, 0, 25, t0());
        job.locked_at = Some(t0() + Duration::seconds(3));
        job.locked_by = Some("host:1:0".into());
        job.lock_token = Some(Uuid::new_v4());
        job.last_error = Some("gateway timeout".into());

        let decoded = decode_job(as_hash(encode_job(&job).unwrap())).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_codec_without_owner() {
        let job = NewJob::new("cleanup", json!(null)).build(DEFAULT_QUEUE, 0, 25, t0());
        let fields = as_hash(encode_job(&job).unwrap());
        assert!(!fields.contains_key("owner_type"));
        assert!(!fields.contains_key("locked_at"));

        let decoded = decode_job(fields).unwrap();
        assert!(decoded.owner.is_none());
        assert!(decoded.is_pending());
    }

    #[test]
    fn test_decode_rejects_incomplete_record() {
        let job = NewJob::new("cleanup", json!({})).build(DEFAULT_QUEUE, 0, 25, t0());
        let mut fields = as_hash(encode_job(&job).unwrap());
        fields.remove("run_at");

        let err = decode_job(fields).unwrap_err();
        assert!(matches!(err, QueueError::Deserialization(_)));
    }

    #[test]
    fn test_key_layout() {
        let config = RedisStoreConfig::new("redis://localhost:6379").with_key_prefix("test");
        assert_eq!(config.key("scheduled"), "test:scheduled");
        assert_eq!(config.prefix(), "test:");
        assert_eq!(RedisStoreConfig::new("redis://x").key_prefix, "belay");
    }

    #[test]
    fn test_owner_keys_do_not_collide() {
        let config = RedisStoreConfig::new("redis://x");
        let left = config.owner_key(&Owner::new("A:B", "C"));
        let right = config.owner_key(&Owner::new("A", "B:C"));
        assert_ne!(left, right);
        assert_eq!(
            config.owner_key(&Owner::new("Appointment", 42)),
            "belay:owner:11:Appointment:42"
        );
    }

    async fn store() -> RedisStore {
        let config = RedisStoreConfig::new("redis://localhost:6379").with_key_prefix("belay-test");
        let store = RedisStore::with_config(config).await.unwrap();
        store.clear().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_claim_is_exclusive_and_ordered() {
        let store = store().await;
        let low = NewJob::new("a", json!({})).with_priority(5).build(DEFAULT_QUEUE, 0, 3, t0());
        let high = NewJob::new("b", json!({})).with_priority(-5).build(DEFAULT_QUEUE, 0, 3, t0());
        store.insert(low.clone()).await.unwrap();
        store.insert(high.clone()).await.unwrap();

        let filter = QueueFilter::any();
        let first = store.claim_next(&filter, "w1", t0()).await.unwrap().unwrap();
        let second = store.claim_next(&filter, "w2", t0()).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(second.id, low.id);
        assert!(store.claim_next(&filter, "w3", t0()).await.unwrap().is_none());
        assert_eq!(store.stats(t0()).await.unwrap().locked, 2);
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_owner_lookup_and_conditional_mutation() {
        let store = store().await;
        let owner = Owner::new("Appointment", 9);
        let job = NewJob::new("remind", json!({}))
            .owned_by(owner.clone())
            .schedule_at(t0() + Duration::hours(1))
            .build(DEFAULT_QUEUE, 0, 3, t0());
        let id = store.insert(job).await.unwrap();

        let found = store.find_by_owner(&owner).await.unwrap();
        assert_eq!(found.len(), 1);

        let outcome = store
            .update(id, &JobUpdate::run_at(t0()), t0())
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied);

        store.claim_next(&QueueFilter::any(), "w1", t0()).await.unwrap().unwrap();
        assert!(!store.delete_unclaimed(id).await.unwrap());

        store.delete(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        assert!(store.find_by_owner(&owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_failure_and_reap() {
        let store = store().await;
        let job = NewJob::new("a", json!({})).build(DEFAULT_QUEUE, 0, 2, t0());
        let id = store.insert(job).await.unwrap();

        let claimed = store.claim_next(&QueueFilter::any(), "w1", t0()).await.unwrap().unwrap();
        let conflict = store
            .record_failure(id, "w2", claimed.lock_token, "boom", Disposition::Fail, t0())
            .await;
        assert!(matches!(conflict, Err(QueueError::ClaimConflict(_))));

        store
            .record_failure(
                id,
                "w1",
                claimed.lock_token,
                "boom",
                Disposition::Retry { run_at: t0() },
                t0(),
            )
            .await
            .unwrap();
        store.claim_next(&QueueFilter::any(), "w1", t0()).await.unwrap();

        let released = store.unlock_expired(t0(), "expired", t0()).await.unwrap();
        assert_eq!(released, vec![id]);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert!(job.is_failed());
        assert_eq!(store.failed(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_claim_order_across_queues() {
        let store = store().await;
        let late = NewJob::new("a", json!({}))
            .on_queue("mail")
            .schedule_at(t0() - Duration::seconds(1))
            .build(DEFAULT_QUEUE, 0, 3, t0());
        let early = NewJob::new("b", json!({}))
            .on_queue("sms")
            .schedule_at(t0() - Duration::seconds(5))
            .build(DEFAULT_QUEUE, 0, 3, t0());
        let tied = NewJob::new("c", json!({}))
            .on_queue("sms")
            .schedule_at(t0() - Duration::seconds(5))
            .build(DEFAULT_QUEUE, 0, 3, t0());
        let future = NewJob::new("d", json!({}))
            .with_priority(-10)
            .schedule_at(t0() + Duration::hours(1))
            .build(DEFAULT_QUEUE, 0, 3, t0());
        for job in [&late, &early, &tied, &future] {
            store.insert(job.clone()).await.unwrap();
        }

        let stats = store.stats(t0()).await.unwrap();
        assert_eq!((stats.pending, stats.due), (4, 3));

        let any = QueueFilter::any();
        let mut order = Vec::new();
        while let Some(job) = store.claim_next(&any, "w", t0()).await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec![early.id, tied.id, late.id]);

        let stats = store.stats(t0()).await.unwrap();
        assert_eq!((stats.pending, stats.due, stats.locked), (1, 0, 3));
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_update_moves_promoted_job() {
        let store = store().await;
        let first = NewJob::new("a", json!({})).on_queue("sms").build(DEFAULT_QUEUE, 0, 3, t0());
        let second = NewJob::new("b", json!({})).on_queue("sms").build(DEFAULT_QUEUE, 0, 3, t0());
        store.insert(first.clone()).await.unwrap();
        store.insert(second.clone()).await.unwrap();

        // Promotes both into the sms ready set without claiming.
        let mail = QueueFilter::only(["mail"]);
        assert!(store.claim_next(&mail, "w", t0()).await.unwrap().is_none());

        store
            .update(first.id, &JobUpdate::default().on_queue("mail"), t0())
            .await
            .unwrap();
        store
            .update(second.id, &JobUpdate::run_at(t0() + Duration::hours(1)), t0())
            .await
            .unwrap();

        let sms = QueueFilter::only(["sms"]);
        assert!(store.claim_next(&sms, "w", t0()).await.unwrap().is_none());
        let claimed = store.claim_next(&mail, "w", t0()).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);

        let later = t0() + Duration::hours(1);
        let claimed = store.claim_next(&sms, "w", later).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_stale_report_after_same_name_reclaim() {
        let store = store().await;
        let job = NewJob::new("a", json!({})).build(DEFAULT_QUEUE, 0, 5, t0());
        let id = store.insert(job).await.unwrap();
        let any = QueueFilter::any();

        let first = store.claim_next(&any, "host:0", t0()).await.unwrap().unwrap();
        let reaped_at = t0() + Duration::hours(5);
        let released = store
            .unlock_expired(t0() + Duration::hours(1), "expired", reaped_at)
            .await
            .unwrap();
        assert_eq!(released, vec![id]);

        let second = store.claim_next(&any, "host:0", reaped_at).await.unwrap().unwrap();
        assert_ne!(first.lock_token, second.lock_token);

        let stale = store
            .record_failure(id, "host:0", first.lock_token, "late", Disposition::Fail, reaped_at)
            .await;
        assert!(matches!(stale, Err(QueueError::ClaimConflict(_))));

        let live = store.get(id).await.unwrap().unwrap();
        assert_eq!(live.lock_token, second.lock_token);
        assert_eq!(live.attempts, 1);
        assert!(!live.is_failed());

        store
            .record_failure(id, "host:0", second.lock_token, "boom", Disposition::Fail, reaped_at)
            .await
            .unwrap();
        let done = store.get(id).await.unwrap().unwrap();
        assert!(done.is_failed());
        assert!(done.lock_token.is_none());
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_colliding_owners_are_isolated() {
        let store = store().await;
        let left = Owner::new("A:B", "C");
        let right = Owner::new("A", "B:C");
        let left_job = NewJob::new("a", json!({}))
            .owned_by(left.clone())
            .build(DEFAULT_QUEUE, 0, 3, t0());
        let right_job = NewJob::new("a", json!({}))
            .owned_by(right.clone())
            .build(DEFAULT_QUEUE, 0, 3, t0());
        store.insert(left_job.clone()).await.unwrap();
        store.insert(right_job.clone()).await.unwrap();

        let found = store.find_by_owner(&left).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, left_job.id);

        store.delete(left_job.id).await.unwrap();
        assert!(store.find_by_owner(&left).await.unwrap().is_empty());
        let found = store.find_by_owner(&right).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, right_job.id);
    }
}
