//! Redis-backed coordination store.

use async_trait::async_trait;
use futures::StreamExt;
use mqttpool_common::{ClusterError, CoordinationStore, ExpirationStream, Result};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const EXPIRED_CHANNEL: &str = "__keyevent@*__:expired";

fn store_err(err: RedisError) -> ClusterError {
    ClusterError::store(err.to_string())
}

fn millis(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry
    (ttl.as_millis() as u64).max(1)
}

/// Coordination store on a single Redis deployment
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    release: Script,
}

impl RedisStore {
    /// Connect to `url` (for example `redis://127.0.0.1:6379/0`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(store_err)?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(store_err)?;

        info!("Connected to Redis coordination store");

        Ok(Self {
            client,
            manager,
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut con = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut con)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut con = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut con)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.conn();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut con)
            .await
            .map_err(store_err)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut con = self.conn();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut con)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut con = self.conn();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(expected)
            .invoke_async(&mut con)
            .await
            .map_err(store_err)?;
        Ok(deleted > 0)
    }

    async fn hash_set(&self, map: &str, field: &str, value: &str) -> Result<()> {
        let mut con = self.conn();
        let _: i64 = redis::cmd("HSET")
            .arg(map)
            .arg(field)
            .arg(value)
            .query_async(&mut con)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn hash_set_if_absent(&self, map: &str, field: &str, value: &str) -> Result<bool> {
        let mut con = self.conn();
        let written: i64 = redis::cmd("HSETNX")
            .arg(map)
            .arg(field)
            .arg(value)
            .query_async(&mut con)
            .await
            .map_err(store_err)?;
        Ok(written == 1)
    }

    async fn hash_get(&self, map: &str, field: &str) -> Result<Option<String>> {
        let mut con = self.conn();
        redis::cmd("HGET")
            .arg(map)
            .arg(field)
            .query_async(&mut con)
            .await
            .map_err(store_err)
    }

    async fn hash_get_all(&self, map: &str) -> Result<Vec<(String, String)>> {
        let mut con = self.conn();
        let all: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(map)
            .query_async(&mut con)
            .await
            .map_err(store_err)?;

        let mut pairs: Vec<(String, String)> = all.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(pairs)
    }

    async fn hash_delete(&self, map: &str, field: &str) -> Result<bool> {
        let mut con = self.conn();
        let removed: i64 = redis::cmd("HDEL")
            .arg(map)
            .arg(field)
            .query_async(&mut con)
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn hash_exists(&self, map: &str, field: &str) -> Result<bool> {
        let mut con = self.conn();
        let exists: i64 = redis::cmd("HEXISTS")
            .arg(map)
            .arg(field)
            .query_async(&mut con)
            .await
            .map_err(store_err)?;
        Ok(exists == 1)
    }

    async fn list_push(&self, list: &str, value: &str) -> Result<()> {
        let mut con = self.conn();
        let _: i64 = redis::cmd("RPUSH")
            .arg(list)
            .arg(value)
            .query_async(&mut con)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<()> {
        let mut con = self.conn();
        let _: i64 = redis::cmd("LREM")
            .arg(list)
            .arg(0)
            .arg(value)
            .query_async(&mut con)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>> {
        let mut con = self.conn();
        redis::cmd("LRANGE")
            .arg(list)
            .arg(0)
            .arg(-1)
            .query_async(&mut con)
            .await
            .map_err(store_err)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut con = self.conn();
        redis::cmd("INCR")
            .arg(key)
            .query_async(&mut con)
            .await
            .map_err(|e| counter_err(key, e))
    }

    async fn decrement(&self, key: &str) -> Result<i64> {
        let mut con = self.conn();
        redis::cmd("DECR")
            .arg(key)
            .query_async(&mut con)
            .await
            .map_err(|e| counter_err(key, e))
    }

    async fn subscribe_expirations(&self) -> Result<ExpirationStream> {
        let mut con = self.conn();
        let enabled: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut con)
            .await;
        if let Err(e) = enabled {
            // Managed deployments often forbid CONFIG; the setting may already be on
            warn!("Could not enable keyspace notifications: {}", e);
        }

        let mut pubsub = self.client.get_async_pubsub().await.map_err(store_err)?;
        pubsub
            .psubscribe(EXPIRED_CHANNEL)
            .await
            .map_err(store_err)?;

        info!("Subscribed to {}", EXPIRED_CHANNEL);

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(Box::pin(stream))
    }
}

fn counter_err(key: &str, err: RedisError) -> ClusterError {
    if err.kind() == redis::ErrorKind::ResponseError {
        // INCR/DECR on a non-integer value
        ClusterError::corrupt(key, err.to_string())
    } else {
        store_err(err)
    }
}
