use crate::{now_millis, DbError, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub message_id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub payload: Vec<u8>,
    pub payload_hash: Vec<u8>,
    pub batch_id: Option<i64>,
    pub created_at: i64,
}

/// The slice of a message a flush needs: payload bytes plus the hash
/// recorded at ingestion time.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PayloadRow {
    pub message_id: i64,
    pub payload: Vec<u8>,
    pub payload_hash: Vec<u8>,
}

/// A persisted message that no committed batch references yet.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct UnbatchedRow {
    pub message_id: i64,
    pub chat_id: i64,
}

/// Insert a message with a store-assigned id. `batch_id` starts NULL and is
/// set exactly once, inside the transaction that commits the owning batch.
pub async fn insert_message(
    pool: &DbPool,
    chat_id: i64,
    user_id: i64,
    payload: &[u8],
    payload_hash: &[u8],
) -> Result<MessageRow, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(
        "INSERT INTO messages (chat_id, user_id, payload, payload_hash, created_at)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING message_id, chat_id, user_id, payload, payload_hash, batch_id, created_at",
    )
    .bind(chat_id)
    .bind(user_id)
    .bind(payload)
    .bind(payload_hash)
    .bind(now_millis())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_message(pool: &DbPool, message_id: i64) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(
        "SELECT message_id, chat_id, user_id, payload, payload_hash, batch_id, created_at
         FROM messages WHERE message_id = $1",
    )
    .bind(message_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Fetch payloads for `ids`, preserving the positional order of the request.
/// An id with no row yields `None` in its position so callers can refuse to
/// batch across a gap.
pub async fn get_message_payloads(
    pool: &DbPool,
    ids: &[i64],
) -> Result<Vec<Option<PayloadRow>>, DbError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("${i}")).collect();
    let sql = format!(
        "SELECT message_id, payload, payload_hash FROM messages WHERE message_id IN ({})",
        placeholders.join(", ")
    );
    let mut query = sqlx::query_as::<_, PayloadRow>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;

    let mut by_id: std::collections::HashMap<i64, PayloadRow> =
        rows.into_iter().map(|row| (row.message_id, row)).collect();
    Ok(ids.iter().map(|id| by_id.remove(id)).collect())
}

/// Messages still awaiting a batch whose insert time is before `cutoff`
/// (epoch milliseconds), oldest first. Feeds the reconciliation sweep.
pub async fn unbatched_older_than(
    pool: &DbPool,
    cutoff_millis: i64,
    limit: i64,
) -> Result<Vec<UnbatchedRow>, DbError> {
    let rows = sqlx::query_as::<_, UnbatchedRow>(
        "SELECT message_id, chat_id FROM messages
         WHERE batch_id IS NULL AND created_at < $1
         ORDER BY message_id ASC LIMIT $2",
    )
    .bind(cutoff_millis)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Which of `ids` are still unlinked. Used when a commit loses the linkage
/// race and the flusher must decide what is safe to re-queue.
pub async fn unbatched_of(pool: &DbPool, ids: &[i64]) -> Result<Vec<i64>, DbError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("${i}")).collect();
    let sql = format!(
        "SELECT message_id FROM messages
         WHERE batch_id IS NULL AND message_id IN ({})
         ORDER BY message_id ASC",
        placeholders.join(", ")
    );
    let mut query = sqlx::query_scalar::<_, i64>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    Ok(query.fetch_all(pool).await?)
}

pub async fn messages_in_batch(pool: &DbPool, batch_id: i64) -> Result<Vec<MessageRow>, DbError> {
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT message_id, chat_id, user_id, payload, payload_hash, batch_id, created_at
         FROM messages WHERE batch_id = $1 ORDER BY message_id ASC",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_messages(pool: &DbPool) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn count_unbatched(pool: &DbPool) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE batch_id IS NULL")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};

    async fn test_pool() -> DbPool {
        let pool = create_pool("sqlite::memory:", 1).await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn insert_assigns_monotonic_ids_and_null_batch() {
        let pool = test_pool().await;
        let first = insert_message(&pool, 1, 42, b"a", &[0u8; 32]).await.unwrap();
        let second = insert_message(&pool, 1, 42, b"b", &[0u8; 32]).await.unwrap();
        assert!(second.message_id > first.message_id);
        assert_eq!(first.batch_id, None);
        assert!(first.created_at > 0);
    }

    #[tokio::test]
    async fn payload_fetch_is_positional_with_gaps() {
        let pool = test_pool().await;
        let m1 = insert_message(&pool, 1, 7, b"one", &[1u8; 32]).await.unwrap();
        let m2 = insert_message(&pool, 1, 7, b"two", &[2u8; 32]).await.unwrap();

        let missing = m2.message_id + 100;
        let rows = get_message_payloads(&pool, &[m2.message_id, missing, m1.message_id])
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].as_ref().unwrap().payload, b"two");
        assert!(rows[1].is_none());
        assert_eq!(rows[2].as_ref().unwrap().payload, b"one");
    }

    #[tokio::test]
    async fn unbatched_scan_respects_cutoff_and_order() {
        let pool = test_pool().await;
        let m1 = insert_message(&pool, 1, 7, b"a", &[0u8; 32]).await.unwrap();
        let m2 = insert_message(&pool, 2, 7, b"b", &[0u8; 32]).await.unwrap();

        let future_cutoff = m2.created_at + 1_000;
        let rows = unbatched_older_than(&pool, future_cutoff, 10).await.unwrap();
        assert_eq!(
            rows.iter().map(|r| r.message_id).collect::<Vec<_>>(),
            vec![m1.message_id, m2.message_id]
        );

        let past_cutoff = m1.created_at - 1_000;
        assert!(unbatched_older_than(&pool, past_cutoff, 10)
            .await
            .unwrap()
            .is_empty());
    }
}
