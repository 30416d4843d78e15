// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

//! Lua bodies of the lock procedures.
//!
//! Redis runs each script atomically, which is what makes the read, decide,
//! write sequences below safe against every other client.

/// Pops queue heads whose deadline record is missing or reached.
///
/// Expects `queue_key`, `deadline_prefix` and `now` locals to be in scope.
macro_rules! purge_loop {
    () => {
        r#"
while true do
  local head = redis.call('LINDEX', queue_key, 0)
  if not head then
    break
  end
  local deadline = redis.call('GET', deadline_prefix .. head)
  if not deadline then
    redis.call('LPOP', queue_key)
  elseif now >= tonumber(deadline) then
    redis.call('DEL', deadline_prefix .. head)
    redis.call('LPOP', queue_key)
  else
    break
  end
end
"#
    };
}

/// KEYS: lock, queue. ARGV: owner, deadline prefix, wait ms, lease ms, now ms.
///
/// Returns 1 when acquired, 0 when queued and -1 when the caller's deadline
/// has lapsed.
pub const TRY_ACQUIRE: &str = concat!(
    r#"
local lock_key = KEYS[1]
local queue_key = KEYS[2]
local owner = ARGV[1]
local deadline_prefix = ARGV[2]
local wait_ms = tonumber(ARGV[3])
local lease_ms = tonumber(ARGV[4])
local now = tonumber(ARGV[5])
"#,
    purge_loop!(),
    r#"
local own_deadline_key = deadline_prefix .. owner
if redis.call('EXISTS', lock_key) == 0 then
  local head = redis.call('LINDEX', queue_key, 0)
  if (not head) or head == owner then
    if head then
      redis.call('LPOP', queue_key)
    end
    redis.call('DEL', own_deadline_key)
    redis.call('SET', lock_key, owner, 'PX', lease_ms)
    return 1
  end
end

local own_deadline = redis.call('GET', own_deadline_key)
if own_deadline then
  if now >= tonumber(own_deadline) then
    redis.call('DEL', own_deadline_key)
    return -1
  end
  return 0
end

redis.call('RPUSH', queue_key, owner)
redis.call('SET', own_deadline_key, string.format('%d', now + wait_ms))
return 0
"#
);

/// KEYS: lock. ARGV: owner, lease ms.
///
/// Returns 1 when refreshed, 2 when the lapsed record was recreated and 0
/// when another owner holds the lock.
pub const EXTEND: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 2
end
if current == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

/// KEYS: lock, queue. ARGV: owner, deadline prefix, notify prefix, lease ms,
/// now ms.
///
/// Returns 1 when released and 0 when another owner holds the lock.
pub const RELEASE: &str = concat!(
    r#"
local lock_key = KEYS[1]
local queue_key = KEYS[2]
local owner = ARGV[1]
local deadline_prefix = ARGV[2]
local notify_prefix = ARGV[3]
local now = tonumber(ARGV[5])
"#,
    purge_loop!(),
    r#"
local current = redis.call('GET', lock_key)
if current and current ~= owner then
  return 0
end
redis.call('DEL', lock_key)
local next_owner = redis.call('LINDEX', queue_key, 0)
if next_owner then
  redis.call('PUBLISH', notify_prefix .. next_owner, '1')
end
return 1
"#
);

/// KEYS: lock. ARGV: owner, lease ms.
///
/// Plain non-queued acquisition. Returns 1 when acquired.
pub const SIMPLE_ACQUIRE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
"#;

/// KEYS: lock. ARGV: owner, lease ms.
///
/// Refreshes a non-queued lock only while the caller still owns it.
pub const SIMPLE_EXTEND: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

/// KEYS: lock. ARGV: owner.
pub const SIMPLE_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;
