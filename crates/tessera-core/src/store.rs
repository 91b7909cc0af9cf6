// Capability surface over the durable store, so the engine can be exercised
// against fault-injecting stand-ins as well as the real database.

use async_trait::async_trait;
use tessera_db::messages::{PayloadRow, UnbatchedRow};
use tessera_db::{batches, messages, DbError, DbPool};
use tessera_merkle::Digest;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    /// The guarded linkage update touched fewer rows than the batch holds:
    /// another committer claimed some of these ids first. The transaction
    /// has been rolled back.
    #[error("batch commit raced another writer: linked {linked} of {expected} messages")]
    LinkageRace { expected: usize, linked: u64 },
    #[error("cannot commit an empty batch")]
    EmptyBatch,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message with a NULL `batch_id` and return the
    /// store-assigned id. Must not leave a partial row on failure.
    async fn insert_message(
        &self,
        chat_id: i64,
        user_id: i64,
        payload: &[u8],
        payload_hash: &Digest,
    ) -> Result<i64, StoreError>;

    /// Payloads in the positional order of `ids`; `None` marks a gap.
    async fn message_payloads(&self, ids: &[i64]) -> Result<Vec<Option<PayloadRow>>, StoreError>;

    /// Atomically insert the batch row and link every id to it. Any failure
    /// rolls the whole transaction back; `ids` must be non-empty and in the
    /// drained (ascending) order.
    async fn commit_batch(
        &self,
        chat_id: i64,
        root: &Digest,
        ids: &[i64],
    ) -> Result<i64, StoreError>;

    /// Root of the newest committed batch for the chat, if any.
    async fn latest_root(&self, chat_id: i64) -> Result<Option<Vec<u8>>, StoreError>;

    /// Unbatched messages older than `cutoff_millis`, oldest first.
    async fn unbatched_older_than(
        &self,
        cutoff_millis: i64,
        limit: i64,
    ) -> Result<Vec<UnbatchedRow>, StoreError>;

    /// The subset of `ids` that no batch references yet, ascending.
    async fn unbatched_of(&self, ids: &[i64]) -> Result<Vec<i64>, StoreError>;
}

/// The production store: sqlx over SQLite or PostgreSQL.
pub struct SqlStore {
    pool: DbPool,
}

impl SqlStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for SqlStore {
    async fn insert_message(
        &self,
        chat_id: i64,
        user_id: i64,
        payload: &[u8],
        payload_hash: &Digest,
    ) -> Result<i64, StoreError> {
        let row =
            messages::insert_message(&self.pool, chat_id, user_id, payload, payload_hash).await?;
        Ok(row.message_id)
    }

    async fn message_payloads(&self, ids: &[i64]) -> Result<Vec<Option<PayloadRow>>, StoreError> {
        Ok(messages::get_message_payloads(&self.pool, ids).await?)
    }

    async fn commit_batch(
        &self,
        chat_id: i64,
        root: &Digest,
        ids: &[i64],
    ) -> Result<i64, StoreError> {
        let (&from_id, &to_id) = match (ids.first(), ids.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(StoreError::EmptyBatch),
        };

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let batch_id = match batches::insert_batch_tx(&mut tx, chat_id, root, from_id, to_id).await
        {
            Ok(batch_id) => batch_id,
            Err(error) => {
                let _ = tx.rollback().await;
                return Err(error.into());
            }
        };

        let linked = match batches::link_messages_tx(&mut tx, ids, batch_id).await {
            Ok(linked) => linked,
            Err(error) => {
                let _ = tx.rollback().await;
                return Err(error.into());
            }
        };
        if linked != ids.len() as u64 {
            let _ = tx.rollback().await;
            return Err(StoreError::LinkageRace {
                expected: ids.len(),
                linked,
            });
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(batch_id)
    }

    async fn latest_root(&self, chat_id: i64) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(batches::latest_root(&self.pool, chat_id).await?)
    }

    async fn unbatched_older_than(
        &self,
        cutoff_millis: i64,
        limit: i64,
    ) -> Result<Vec<UnbatchedRow>, StoreError> {
        Ok(messages::unbatched_older_than(&self.pool, cutoff_millis, limit).await?)
    }

    async fn unbatched_of(&self, ids: &[i64]) -> Result<Vec<i64>, StoreError> {
        Ok(messages::unbatched_of(&self.pool, ids).await?)
    }
}
