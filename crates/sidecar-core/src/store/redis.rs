//! Redis-backed store

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::info;

use super::KeyValueStore;
use crate::error::Result;

/// Shared store on a Redis server
///
/// A single multiplexed connection is opened up front and cloned per
/// command; clones share the underlying socket.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the server at `url` (`redis://host:port`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to redis at {}", url);
        Ok(Self { conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    // redis rejects an expiry of zero
    ttl.as_secs().max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        let _: () = match ttl {
            Some(ttl) => {
                redis::cmd("SETEX")
                    .arg(key)
                    .arg(ttl_secs(ttl))
                    .arg(value)
                    .query_async(&mut conn)
                    .await?
            }
            None => redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await?,
        };
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        // SET .. NX replies OK when written and nil otherwise
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.as_deref() == Some("OK"))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let added: i64 = redis::cmd("SADD").arg(set).arg(member).query_async(&mut conn).await?;
        Ok(added > 0)
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("SREM").arg(set).arg(member).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn is_member_of_set(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let member: bool = redis::cmd("SISMEMBER")
            .arg(set)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(member)
    }

    async fn retrieve_set(&self, set: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(set).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str, key_ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(key_ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("HDEL").arg(key).arg(field).query_async(&mut conn).await?;
        Ok(())
    }
}
