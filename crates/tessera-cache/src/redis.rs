use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{VolatileError, VolatileStore};

/// Redis-backed volatile state, for deployments where several engine
/// instances or restarts must observe the same queues and leases.
pub struct RedisStore {
    conn: Arc<Mutex<::redis::aio::MultiplexedConnection>>,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, VolatileError> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Round-trip probe used by readiness checks.
    pub async fn ping(&self) -> Result<(), VolatileError> {
        let mut conn = self.conn.lock().await;
        let _: String = ::redis::cmd("PING")
            .query_async::<_, String>(&mut *conn)
            .await?;
        Ok(())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl VolatileStore for RedisStore {
    async fn push_right(&self, key: &str, value: &str) -> Result<(), VolatileError> {
        let mut conn = self.conn.lock().await;
        ::redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn push_left(&self, key: &str, value: &str) -> Result<(), VolatileError> {
        let mut conn = self.conn.lock().await;
        ::redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn pop_left(&self, key: &str) -> Result<Option<String>, VolatileError> {
        let mut conn = self.conn.lock().await;
        let value: Option<String> = ::redis::cmd("LPOP")
            .arg(key)
            .query_async::<_, Option<String>>(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn list_len(&self, key: &str) -> Result<u64, VolatileError> {
        let mut conn = self.conn.lock().await;
        let len: u64 = ::redis::cmd("LLEN")
            .arg(key)
            .query_async::<_, u64>(&mut *conn)
            .await?;
        Ok(len)
    }

    async fn list_contains(&self, key: &str, value: &str) -> Result<bool, VolatileError> {
        let mut conn = self.conn.lock().await;
        let position: Option<u64> = ::redis::cmd("LPOS")
            .arg(key)
            .arg(value)
            .query_async::<_, Option<u64>>(&mut *conn)
            .await?;
        Ok(position.is_some())
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, VolatileError> {
        let mut conn = self.conn.lock().await;
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, Option<String>>(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str) -> Result<(), VolatileError> {
        let mut conn = self.conn.lock().await;
        ::redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), VolatileError> {
        let mut conn = self.conn.lock().await;
        ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), VolatileError> {
        let mut conn = self.conn.lock().await;
        ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, VolatileError> {
        let mut conn = self.conn.lock().await;
        let value: Option<Vec<u8>> = ::redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<Vec<u8>>>(&mut *conn)
            .await?;
        Ok(value)
    }
}
