use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};

use crate::client::LockClient;
use crate::LockError;

/// Redis-backed lock client.
///
/// Acquisition uses an atomic `SET key value NX PX ttl`. `compare_and_delete`
/// runs a Lua script so the compare and the delete happen in one round trip.
#[derive(Clone)]
pub struct RedisLockClient {
    conn: MultiplexedConnection,
}

impl RedisLockClient {
    /// Create a new client from a Redis URL (e.g. "redis://127.0.0.1:6379").
    pub async fn new(url: &str) -> Result<Self, LockError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self { conn })
    }

    /// Create a new client from an existing multiplexed connection.
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

/// Deletes the key only if the stored value matches the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[async_trait]
impl LockClient for RedisLockClient {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        only_if_absent: bool,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if only_if_absent {
            cmd.arg("NX");
        }
        cmd.arg("PX").arg(millis);

        // NX で書き込めなかった場合は nil が返る
        let result: Option<String> = cmd.query_async(&mut conn).await.map_err(map_redis_error)?;
        Ok(result.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(map_redis_error)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(map_redis_error)?;
        Ok(removed > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let script = Script::new(RELEASE_SCRIPT);
        let result: i64 = script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(result == 1)
    }
}

fn map_redis_error(err: RedisError) -> LockError {
    if err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped() {
        LockError::Unavailable(err.to_string())
    } else {
        LockError::Internal(err.to_string())
    }
}
