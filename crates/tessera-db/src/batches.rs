use crate::{now_millis, DbError, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BatchRow {
    pub batch_id: i64,
    pub chat_id: i64,
    pub root_hash: Vec<u8>,
    pub from_message_id: i64,
    pub to_message_id: i64,
    pub created_at: i64,
}

/// Insert the batch row inside an open transaction and return its
/// store-assigned id. Callers commit only after linking succeeds.
pub async fn insert_batch_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    chat_id: i64,
    root_hash: &[u8],
    from_message_id: i64,
    to_message_id: i64,
) -> Result<i64, DbError> {
    let batch_id: i64 = sqlx::query_scalar(
        "INSERT INTO merkle_batches (chat_id, root_hash, from_message_id, to_message_id, created_at)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING batch_id",
    )
    .bind(chat_id)
    .bind(root_hash)
    .bind(from_message_id)
    .bind(to_message_id)
    .bind(now_millis())
    .fetch_one(&mut **tx)
    .await?;
    Ok(batch_id)
}

/// Point every id at its batch. Only rows with a NULL `batch_id` are
/// touched, so the returned count doubles as a race detector: anything less
/// than `ids.len()` means another committer claimed some of these ids and
/// the transaction must roll back.
pub async fn link_messages_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    ids: &[i64],
    batch_id: i64,
) -> Result<u64, DbError> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders: Vec<String> = (2..=ids.len() + 1).map(|i| format!("${i}")).collect();
    let sql = format!(
        "UPDATE messages SET batch_id = $1
         WHERE batch_id IS NULL AND message_id IN ({})",
        placeholders.join(", ")
    );
    let mut query = sqlx::query(&sql).bind(batch_id);
    for id in ids {
        query = query.bind(id);
    }
    let result = query.execute(&mut **tx).await?;
    Ok(result.rows_affected())
}

/// Root of the most recently committed batch for a chat. Equal timestamps
/// resolve by greatest batch id so the scan is deterministic.
pub async fn latest_root(pool: &DbPool, chat_id: i64) -> Result<Option<Vec<u8>>, DbError> {
    let root: Option<Vec<u8>> = sqlx::query_scalar(
        "SELECT root_hash FROM merkle_batches WHERE chat_id = $1
         ORDER BY created_at DESC, batch_id DESC LIMIT 1",
    )
    .bind(chat_id)
    .fetch_optional(pool)
    .await?;
    Ok(root)
}

pub async fn get_batch(pool: &DbPool, batch_id: i64) -> Result<Option<BatchRow>, DbError> {
    let row = sqlx::query_as::<_, BatchRow>(
        "SELECT batch_id, chat_id, root_hash, from_message_id, to_message_id, created_at
         FROM merkle_batches WHERE batch_id = $1",
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn chat_batches(pool: &DbPool, chat_id: i64) -> Result<Vec<BatchRow>, DbError> {
    let rows = sqlx::query_as::<_, BatchRow>(
        "SELECT batch_id, chat_id, root_hash, from_message_id, to_message_id, created_at
         FROM merkle_batches WHERE chat_id = $1 ORDER BY batch_id ASC",
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_batches(pool: &DbPool) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM merkle_batches")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{insert_message, messages_in_batch};
    use crate::{create_pool, run_migrations};

    async fn test_pool() -> DbPool {
        let pool = create_pool("sqlite::memory:", 1).await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn commit_links_every_message_once() {
        let pool = test_pool().await;
        let m1 = insert_message(&pool, 1, 7, b"a", &[0u8; 32]).await.unwrap();
        let m2 = insert_message(&pool, 1, 7, b"b", &[0u8; 32]).await.unwrap();
        let ids = [m1.message_id, m2.message_id];

        let mut tx = pool.begin().await.unwrap();
        let batch_id = insert_batch_tx(&mut tx, 1, &[9u8; 32], ids[0], ids[1])
            .await
            .unwrap();
        let linked = link_messages_tx(&mut tx, &ids, batch_id).await.unwrap();
        assert_eq!(linked, 2);
        tx.commit().await.unwrap();

        let members = messages_in_batch(&pool, batch_id).await.unwrap();
        assert_eq!(
            members.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            ids.to_vec()
        );
        assert!(members.iter().all(|m| m.batch_id == Some(batch_id)));
    }

    #[tokio::test]
    async fn linking_skips_already_batched_ids() {
        let pool = test_pool().await;
        let m1 = insert_message(&pool, 1, 7, b"a", &[0u8; 32]).await.unwrap();
        let ids = [m1.message_id];

        let mut tx = pool.begin().await.unwrap();
        let first_batch = insert_batch_tx(&mut tx, 1, &[1u8; 32], ids[0], ids[0])
            .await
            .unwrap();
        assert_eq!(link_messages_tx(&mut tx, &ids, first_batch).await.unwrap(), 1);
        tx.commit().await.unwrap();

        // A straggler trying to claim the same id must observe zero rows.
        let mut tx = pool.begin().await.unwrap();
        let second_batch = insert_batch_tx(&mut tx, 1, &[2u8; 32], ids[0], ids[0])
            .await
            .unwrap();
        assert_eq!(
            link_messages_tx(&mut tx, &ids, second_batch).await.unwrap(),
            0
        );
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn latest_root_prefers_newest_batch() {
        let pool = test_pool().await;
        assert_eq!(latest_root(&pool, 1).await.unwrap(), None);

        let m1 = insert_message(&pool, 1, 7, b"a", &[0u8; 32]).await.unwrap();
        let m2 = insert_message(&pool, 1, 7, b"b", &[0u8; 32]).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        let b1 = insert_batch_tx(&mut tx, 1, &[1u8; 32], m1.message_id, m1.message_id)
            .await
            .unwrap();
        link_messages_tx(&mut tx, &[m1.message_id], b1).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        let b2 = insert_batch_tx(&mut tx, 1, &[2u8; 32], m2.message_id, m2.message_id)
            .await
            .unwrap();
        link_messages_tx(&mut tx, &[m2.message_id], b2).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(latest_root(&pool, 1).await.unwrap(), Some(vec![2u8; 32]));
        // Other chats are unaffected.
        assert_eq!(latest_root(&pool, 2).await.unwrap(), None);
    }
}
