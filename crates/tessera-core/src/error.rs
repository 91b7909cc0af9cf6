use tessera_cache::VolatileError;
use tessera_merkle::MerkleError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The durable store rejected or could not complete an operation. The
    /// caller must assume the message was not accepted and retry with the
    /// same idempotency key.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),

    /// The message is persisted but could not be placed in its chat's
    /// pending queue. It stays orphaned until the reconciliation sweep
    /// batches it; the assigned id travels with the error.
    #[error("message {message_id} persisted but not enqueued: {source}")]
    EnqueueFailed {
        message_id: i64,
        #[source]
        source: VolatileError,
    },

    /// The volatile backend failed mid-flush. Drained ids have been pushed
    /// back; the next trigger retries.
    #[error("volatile state unavailable: {0}")]
    QueueUnavailable(#[from] VolatileError),

    #[error(transparent)]
    Merkle(#[from] MerkleError),

    /// The queue referenced ids the store no longer returns, or a batch
    /// commit lost the linkage race. Nothing was committed here; drained
    /// ids that are still safe have been restored to the queue.
    #[error("chat {chat_id}: pending ids and stored messages disagree")]
    InconsistentStore { chat_id: i64 },
}
