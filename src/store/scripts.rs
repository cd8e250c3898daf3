//! Lua procedures executed atomically by Redis.
//!
//! [`MemoryStore`](super::MemoryStore) mirrors each of these step for step;
//! keep the two in sync when changing either.

use std::sync::OnceLock;

use redis::Script;

/// KEYS: jobs, waiting, id counter. ARGV: payload, unique ("true"/"false"), id.
///
/// Returns the id, or 0 when `unique` is set and the id already exists.
pub const ENQUEUE: &str = r#"
local jobId = ARGV[3]
if jobId == "" then
  jobId = tostring(redis.call("incr", KEYS[3]))
end

if ARGV[2] == "true" then
  if redis.call("hsetnx", KEYS[1], jobId, ARGV[1]) == 1 then
    redis.call("lpush", KEYS[2], jobId)
    return jobId
  end
  return 0
end

redis.call("hset", KEYS[1], jobId, ARGV[1])
redis.call("lpush", KEYS[2], jobId)
return jobId
"#;

/// KEYS: stallTime, stalling, waiting, active. ARGV: now (ms), interval (ms).
///
/// Returns the recovered ids, or 0 when the check ran too early.
pub const CHECK_STALLED: &str = r#"
local now = tonumber(ARGV[1])
local stallTime = tonumber(redis.call("get", KEYS[1]) or 0)

if now < stallTime then
  return 0
end

local stalling = redis.call("smembers", KEYS[2])
if #stalling > 0 then
  redis.call("rpush", KEYS[3], unpack(stalling))
  for i = 1, #stalling do
    redis.call("lrem", KEYS[4], 0, stalling[i])
  end
  redis.call("del", KEYS[2])
end

local actives = redis.call("lrange", KEYS[4], 0, -1)
if #actives > 0 then
  redis.call("sadd", KEYS[2], unpack(actives))
end

redis.call("set", KEYS[1], now + tonumber(ARGV[2]))

return stalling
"#;

/// KEYS: succeeded, failed, waiting, active, stalling, jobs. ARGV: id.
pub const REMOVE_JOB: &str = r#"
local jobId = ARGV[1]

if (redis.call("sismember", KEYS[1], jobId) + redis.call("sismember", KEYS[2], jobId)) == 0 then
  redis.call("lrem", KEYS[3], 0, jobId)
  redis.call("lrem", KEYS[4], 0, jobId)
end

redis.call("srem", KEYS[1], jobId)
redis.call("srem", KEYS[2], jobId)
redis.call("srem", KEYS[5], jobId)
redis.call("hdel", KEYS[6], jobId)
return 1
"#;

/// KEYS: counter. ARGV: limit, seconds. Returns {blocked, remaining, ttl}.
pub const THROTTLE: &str = r#"
local limit = tonumber(ARGV[1])
local count = redis.call("incr", KEYS[1])
local ttl = redis.call("ttl", KEYS[1])
local remaining = limit - count

if count == 1 or ttl == -1 then
  redis.call("expire", KEYS[1], ARGV[2])
end

if ttl == -1 then
  ttl = tonumber(ARGV[2])
end

if count > limit or remaining == 0 then
  return {1, 0, ttl}
end

return {0, remaining, ttl}
"#;

/// KEYS: counter. ARGV: limit, milliseconds. Returns {blocked, remaining, pttl}.
pub const PTHROTTLE: &str = r#"
local limit = tonumber(ARGV[1])
local count = redis.call("incr", KEYS[1])
local pttl = redis.call("pttl", KEYS[1])
local remaining = limit - count

if count == 1 or pttl == -1 then
  redis.call("pexpire", KEYS[1], ARGV[2])
end

if pttl == -1 then
  pttl = tonumber(ARGV[2])
end

if count > limit or remaining == 0 then
  return {1, 0, pttl}
end

return {0, remaining, pttl}
"#;

/// KEYS: counter. ARGV: limit, seconds. Returns 1 when the caller must wait.
pub const THROTTLE_NO_INCR: &str = r#"
if redis.call("exists", KEYS[1]) > 0 then
  if tonumber(redis.call("get", KEYS[1])) >= tonumber(ARGV[1]) then
    return 1
  end
  redis.call("incr", KEYS[1])
  return 0
end

redis.call("setex", KEYS[1], tonumber(ARGV[2]), 1)
return 0
"#;

/// KEYS: counter.
pub const THROTTLE_DECR: &str = r#"
if redis.call("exists", KEYS[1]) > 0 then
  redis.call("decr", KEYS[1])
end
return 1
"#;

/// Loaded scripts; `Script` caches the SHA and falls back to EVAL on NOSCRIPT.
pub struct Scripts {
    pub enqueue: Script,
    pub check_stalled: Script,
    pub remove_job: Script,
    pub throttle: Script,
    pub pthrottle: Script,
    pub throttle_no_incr: Script,
    pub throttle_decr: Script,
}

static SCRIPTS: OnceLock<Scripts> = OnceLock::new();

/// Returns the process-wide script set.
pub fn scripts() -> &'static Scripts {
    SCRIPTS.get_or_init(|| Scripts {
        enqueue: Script::new(ENQUEUE),
        check_stalled: Script::new(CHECK_STALLED),
        remove_job: Script::new(REMOVE_JOB),
        throttle: Script::new(THROTTLE),
        pthrottle: Script::new(PTHROTTLE),
        throttle_no_incr: Script::new(THROTTLE_NO_INCR),
        throttle_decr: Script::new(THROTTLE_DECR),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_have_distinct_hashes() {
        let s = scripts();
        let hashes = [
            s.enqueue.get_hash(),
            s.check_stalled.get_hash(),
            s.remove_job.get_hash(),
            s.throttle.get_hash(),
            s.pthrottle.get_hash(),
            s.throttle_no_incr.get_hash(),
            s.throttle_decr.get_hash(),
        ];
        let unique: std::collections::HashSet<_> = hashes.iter().collect();
        assert_eq!(unique.len(), hashes.len());
    }

    #[test]
    fn test_enqueue_script_respects_unique_flag() {
        assert!(ENQUEUE.contains("hsetnx"));
        assert!(ENQUEUE.contains("ARGV[2] == \"true\""));
    }
}
