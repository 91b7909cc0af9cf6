// The ingestion-and-batching engine: durable submit, per-chat pending
// queues, lease-guarded flushes and the background drivers that keep
// every chat's log collapsing into Merkle batches.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use tessera_cache::{keys, VolatileStore};
use tessera_merkle::{digest, merkle_root, Digest};

use crate::error::EngineError;
use crate::observability;
use crate::store::{MessageStore, StoreError};

/// Client idempotency window.
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on unbatched rows examined per reconciliation pass.
const RECONCILE_SCAN_LIMIT: i64 = 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum leaves per batch; also the size trigger threshold.
    pub batch_size: usize,
    /// Maximum staleness before an idle chat is flushed.
    pub batch_timeout: Duration,
    /// Flush lease expiry. Must exceed the worst-case flush duration.
    pub lock_ttl: Duration,
    /// Concurrent size-triggered flush tasks allowed at once.
    pub flush_concurrency: usize,
    /// How often the orphan sweep runs.
    pub reconcile_interval: Duration,
    /// Minimum age before an unbatched message counts as orphaned.
    /// Defaults to `batch_timeout + lock_ttl` when unset.
    pub reconcile_grace: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            batch_timeout: Duration::from_millis(300),
            lock_ttl: Duration::from_secs(5),
            flush_concurrency: 32,
            reconcile_interval: Duration::from_secs(30),
            reconcile_grace: None,
        }
    }
}

impl EngineConfig {
    fn reconcile_grace(&self) -> Duration {
        self.reconcile_grace
            .unwrap_or(self.batch_timeout + self.lock_ttl)
    }
}

/// What a successful flush committed.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch_id: i64,
    pub chat_id: i64,
    pub root: Digest,
    pub from_message_id: i64,
    pub to_message_id: i64,
    pub len: usize,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn MessageStore>,
    volatile: Arc<dyn VolatileStore>,
    /// chat id -> last submit time. Mutated only by the submit path and the
    /// timer scan, always under this one mutex.
    active_chats: Mutex<HashMap<i64, Instant>>,
    flush_permits: Arc<Semaphore>,
    shutdown: Notify,
    /// Set before `shutdown` notifies, so a driver that has not reached its
    /// first await yet still observes the stop request.
    stopping: AtomicBool,
    drivers: Mutex<Vec<JoinHandle<()>>>,
    /// Handle back to the owning `Arc`, for spawning detached tasks.
    weak_self: Weak<Engine>,
}

impl Engine {
    /// Build an engine without background drivers. Flushes still happen via
    /// the size trigger and explicit `flush_chat` calls.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn MessageStore>,
        volatile: Arc<dyn VolatileStore>,
    ) -> Arc<Self> {
        let flush_permits = Arc::new(Semaphore::new(config.flush_concurrency.max(1)));
        Arc::new_cyclic(|weak_self| Self {
            config,
            store,
            volatile,
            active_chats: Mutex::new(HashMap::new()),
            flush_permits,
            shutdown: Notify::new(),
            stopping: AtomicBool::new(false),
            drivers: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Build an engine and start the timer and reconciliation drivers.
    pub fn start(
        config: EngineConfig,
        store: Arc<dyn MessageStore>,
        volatile: Arc<dyn VolatileStore>,
    ) -> Arc<Self> {
        let engine = Self::new(config, store, volatile);
        engine.spawn_drivers();
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Record a message, enqueue it for batching and return its id.
    ///
    /// Steps, in order: idempotency short-circuit (best-effort), durable
    /// insert, idempotency record (best-effort), enqueue, activity mark,
    /// size-trigger probe. A repeated `idempotency_key` returns the id of
    /// the first submission without touching the store or the queue.
    pub async fn submit_message(
        &self,
        chat_id: i64,
        user_id: i64,
        payload: &[u8],
        idempotency_key: Option<&str>,
    ) -> Result<i64, EngineError> {
        let idempotency_key = idempotency_key.filter(|key| !key.is_empty());

        if let Some(key) = idempotency_key {
            match self.volatile.get(&keys::idempotency(key)).await {
                Ok(Some(stored)) => {
                    if let Some(message_id) = parse_ascii_id(&stored) {
                        observability::record_deduplicated();
                        return Ok(message_id);
                    }
                    tracing::warn!(key, "ignoring malformed idempotency entry");
                }
                Ok(None) => {}
                Err(error) => {
                    // Never block ingestion on the cache; a miss only risks
                    // a duplicate row, which the caller's key still covers
                    // for subsequent retries.
                    tracing::warn!(key, %error, "idempotency lookup failed, treating as miss");
                }
            }
        }

        let payload_hash = digest(payload);
        let message_id = self
            .store
            .insert_message(chat_id, user_id, payload, &payload_hash)
            .await?;

        if let Some(key) = idempotency_key {
            if let Err(error) = self
                .volatile
                .set_with_ttl(
                    &keys::idempotency(key),
                    message_id.to_string().as_bytes(),
                    IDEMPOTENCY_TTL,
                )
                .await
            {
                tracing::warn!(key, message_id, %error, "failed to record idempotency entry");
            }
        }

        let pending_key = keys::pending(chat_id);
        if let Err(source) = self
            .volatile
            .push_right(&pending_key, &message_id.to_string())
            .await
        {
            // The message is durable but orphaned; the reconciliation
            // sweep picks it up. The id travels with the error.
            return Err(EngineError::EnqueueFailed { message_id, source });
        }

        self.mark_active(chat_id);
        observability::record_submit();

        match self.volatile.list_len(&pending_key).await {
            Ok(len) if len as usize >= self.config.batch_size => self.spawn_flush(chat_id),
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(chat_id, %error, "queue length probe failed, timer flush will cover");
            }
        }

        Ok(message_id)
    }

    /// Latest committed root for a chat: cache first, store as fallback,
    /// re-warming the cache on a miss.
    pub async fn latest_root(&self, chat_id: i64) -> Result<Option<Vec<u8>>, EngineError> {
        let cache_key = keys::latest_root(chat_id);
        match self.volatile.get(&cache_key).await {
            Ok(Some(root)) => return Ok(Some(root)),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(chat_id, %error, "latest-root cache read failed, falling back to store");
            }
        }

        let Some(root) = self.store.latest_root(chat_id).await? else {
            return Ok(None);
        };
        if let Err(error) = self.volatile.set(&cache_key, &root).await {
            tracing::debug!(chat_id, %error, "latest-root cache warm failed");
        }
        Ok(Some(root))
    }

    /// Collapse up to `batch_size` pending messages of one chat into a
    /// committed batch. Returns `Ok(None)` when another flusher holds the
    /// chat's lease or the queue is empty.
    pub async fn flush_chat(&self, chat_id: i64) -> Result<Option<BatchSummary>, EngineError> {
        let lock_key = keys::lock(chat_id);
        if !self
            .volatile
            .try_acquire(&lock_key, self.config.lock_ttl)
            .await?
        {
            return Ok(None);
        }

        let result = self.flush_locked(chat_id).await;
        if result.is_err() {
            observability::record_flush_failure();
        }
        if let Err(error) = self.volatile.release(&lock_key).await {
            tracing::warn!(chat_id, %error, "flush lease release failed, TTL will expire it");
        }
        result
    }

    async fn flush_locked(&self, chat_id: i64) -> Result<Option<BatchSummary>, EngineError> {
        let pending_key = keys::pending(chat_id);

        let mut ids: Vec<i64> = Vec::with_capacity(self.config.batch_size);
        while ids.len() < self.config.batch_size {
            match self.volatile.pop_left(&pending_key).await {
                Ok(Some(raw)) => match raw.parse::<i64>() {
                    Ok(id) => ids.push(id),
                    Err(_) => {
                        tracing::error!(chat_id, value = %raw, "dropping malformed queue entry");
                    }
                },
                Ok(None) => break,
                Err(error) => {
                    // Ids drained so far are in neither the queue nor a
                    // batch; put them back before surfacing the failure.
                    self.requeue_reverse(&pending_key, &ids).await;
                    return Err(error.into());
                }
            }
        }
        if ids.is_empty() {
            return Ok(None);
        }

        let rows = match self.store.message_payloads(&ids).await {
            Ok(rows) => rows,
            Err(error) => {
                self.requeue_reverse(&pending_key, &ids).await;
                return Err(error.into());
            }
        };

        let mut payloads: Vec<&[u8]> = Vec::with_capacity(rows.len());
        for row in &rows {
            match row {
                Some(row) => payloads.push(row.payload.as_slice()),
                None => {
                    // A queued id the store cannot produce. Refuse to
                    // batch across the gap and restore the queue as-is.
                    self.requeue_reverse(&pending_key, &ids).await;
                    return Err(EngineError::InconsistentStore { chat_id });
                }
            }
        }

        let root = merkle_root(payloads)?;

        match self.store.commit_batch(chat_id, &root, &ids).await {
            Ok(batch_id) => {
                observability::record_batch(ids.len());
                self.publish_root(chat_id, &root).await;
                Ok(Some(BatchSummary {
                    batch_id,
                    chat_id,
                    root,
                    from_message_id: ids[0],
                    to_message_id: ids[ids.len() - 1],
                    len: ids.len(),
                }))
            }
            Err(StoreError::LinkageRace { expected, linked }) => {
                tracing::error!(
                    chat_id,
                    expected,
                    linked,
                    "batch commit lost the linkage race"
                );
                // Restoring an id another writer committed would wedge the
                // queue on a permanently unlinkable entry, so only ids that
                // are still unbatched go back.
                match self.store.unbatched_of(&ids).await {
                    Ok(still_unbatched) => {
                        self.requeue_reverse(&pending_key, &still_unbatched).await;
                    }
                    Err(error) => {
                        tracing::error!(chat_id, %error, "could not filter drained ids, restoring all");
                        self.requeue_reverse(&pending_key, &ids).await;
                    }
                }
                Err(EngineError::InconsistentStore { chat_id })
            }
            Err(error) => {
                self.requeue_reverse(&pending_key, &ids).await;
                Err(error.into())
            }
        }
    }

    /// Push drained ids back so the next drain pops them in the original
    /// order: with a left-pop queue that means pushing in reverse.
    async fn requeue_reverse(&self, pending_key: &str, ids: &[i64]) {
        for id in ids.iter().rev() {
            if let Err(error) = self.volatile.push_left(pending_key, &id.to_string()).await {
                tracing::error!(
                    pending_key,
                    message_id = *id,
                    %error,
                    "failed to restore id to pending queue, reconciliation will recover it"
                );
            }
        }
        observability::record_requeued(ids.len());
    }

    async fn publish_root(&self, chat_id: i64, root: &Digest) {
        if let Err(error) = self.volatile.set(&keys::latest_root(chat_id), root).await {
            // The store can always rebuild the cache, so this never fails
            // the flush.
            tracing::warn!(chat_id, %error, "latest-root cache update failed");
        }
    }

    /// One pass of the orphan sweep: batch every unbatched message older
    /// than the grace window that is not sitting in its pending queue.
    /// Returns how many messages were reconciled.
    pub async fn reconcile_once(&self) -> Result<usize, EngineError> {
        let grace = self.config.reconcile_grace();
        let cutoff = chrono::Utc::now().timestamp_millis() - grace.as_millis() as i64;
        let orphans = self
            .store
            .unbatched_older_than(cutoff, RECONCILE_SCAN_LIMIT)
            .await?;
        if orphans.is_empty() {
            return Ok(0);
        }

        let mut by_chat: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for row in orphans {
            by_chat.entry(row.chat_id).or_default().push(row.message_id);
        }

        let mut reconciled = 0;
        for (chat_id, candidates) in by_chat {
            let lock_key = keys::lock(chat_id);
            if !self
                .volatile
                .try_acquire(&lock_key, self.config.lock_ttl)
                .await?
            {
                continue;
            }
            let outcome = self.reconcile_chat_locked(chat_id, &candidates).await;
            if let Err(error) = self.volatile.release(&lock_key).await {
                tracing::warn!(chat_id, %error, "reconcile lease release failed, TTL will expire it");
            }
            match outcome {
                Ok(count) => reconciled += count,
                Err(error) => {
                    tracing::warn!(chat_id, %error, "orphan reconciliation failed");
                }
            }
        }
        Ok(reconciled)
    }

    async fn reconcile_chat_locked(
        &self,
        chat_id: i64,
        candidates: &[i64],
    ) -> Result<usize, EngineError> {
        let pending_key = keys::pending(chat_id);

        // Anything still in the queue belongs to the normal flush path.
        let mut orphaned = Vec::with_capacity(candidates.len());
        for id in candidates {
            if !self
                .volatile
                .list_contains(&pending_key, &id.to_string())
                .await?
            {
                orphaned.push(*id);
            }
        }

        let mut committed = 0;
        for chunk in orphaned.chunks(self.config.batch_size.max(1)) {
            let rows = self.store.message_payloads(chunk).await?;
            let payloads: Option<Vec<&[u8]>> = rows
                .iter()
                .map(|row| row.as_ref().map(|r| r.payload.as_slice()))
                .collect();
            let Some(payloads) = payloads else {
                tracing::error!(chat_id, "orphaned ids vanished from the store, skipping chunk");
                continue;
            };

            let root = merkle_root(payloads)?;
            match self.store.commit_batch(chat_id, &root, chunk).await {
                Ok(batch_id) => {
                    committed += chunk.len();
                    observability::record_reconciled(chunk.len());
                    tracing::info!(
                        chat_id,
                        batch_id,
                        count = chunk.len(),
                        "reconciled orphaned messages into a batch"
                    );
                    self.publish_root(chat_id, &root).await;
                }
                Err(StoreError::LinkageRace { .. }) => {
                    tracing::warn!(chat_id, "another writer claimed orphaned ids, skipping");
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(committed)
    }

    fn mark_active(&self, chat_id: i64) {
        let mut active = self.active_chats.lock().expect("active chat map poisoned");
        active.insert(chat_id, Instant::now());
    }

    /// Remove and return every chat idle for at least `batch_timeout`.
    fn take_idle_chats(&self) -> Vec<i64> {
        let now = Instant::now();
        let mut active = self.active_chats.lock().expect("active chat map poisoned");
        let idle: Vec<i64> = active
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= self.config.batch_timeout)
            .map(|(chat_id, _)| *chat_id)
            .collect();
        for chat_id in &idle {
            active.remove(chat_id);
        }
        idle
    }

    /// Detached, semaphore-bounded flush used by the size trigger so a
    /// burst of submissions cannot multiply flush tasks without limit.
    fn spawn_flush(&self, chat_id: i64) {
        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        let Ok(permit) = Arc::clone(&self.flush_permits).try_acquire_owned() else {
            // Saturated. The queue stays above threshold, so the next
            // submit or the timer driver retries.
            return;
        };
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(error) = engine.flush_chat(chat_id).await {
                tracing::warn!(chat_id, %error, "size-triggered flush failed");
            }
        });
    }

    /// Start the timer driver and the reconciliation sweep.
    pub fn spawn_drivers(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let timer = {
            let engine = Arc::clone(&this);
            tokio::spawn(async move {
                let period = (engine.config.batch_timeout / 2).max(Duration::from_millis(10));
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let stop = engine.shutdown.notified();
                tokio::pin!(stop);
                loop {
                    if engine.stopping.load(Ordering::Relaxed) {
                        break;
                    }
                    tokio::select! {
                        _ = &mut stop => break,
                        _ = ticker.tick() => {
                            for chat_id in engine.take_idle_chats() {
                                if let Err(error) = engine.flush_chat(chat_id).await {
                                    tracing::warn!(chat_id, %error, "timer-triggered flush failed");
                                }
                            }
                        }
                    }
                }
                tracing::debug!("timer driver stopped");
            })
        };

        let reconciler = {
            let engine = Arc::clone(&this);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(engine.config.reconcile_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let stop = engine.shutdown.notified();
                tokio::pin!(stop);
                loop {
                    if engine.stopping.load(Ordering::Relaxed) {
                        break;
                    }
                    tokio::select! {
                        _ = &mut stop => break,
                        _ = ticker.tick() => {
                            match engine.reconcile_once().await {
                                Ok(0) => {}
                                Ok(count) => tracing::info!(count, "reconciliation sweep recovered orphans"),
                                Err(error) => tracing::warn!(%error, "reconciliation sweep failed"),
                            }
                        }
                    }
                }
                tracing::debug!("reconciliation driver stopped");
            })
        };

        let mut drivers = self.drivers.lock().expect("driver list poisoned");
        drivers.push(timer);
        drivers.push(reconciler);
    }

    /// Cooperative shutdown: signal the drivers and wait for them to finish
    /// the tick they are in. In-flight submits and detached flushes run to
    /// completion on the runtime.
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();
        let handles: Vec<JoinHandle<()>> = {
            let mut drivers = self.drivers.lock().expect("driver list poisoned");
            drivers.drain(..).collect()
        };
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "engine driver exited abnormally");
            }
        }
    }
}

fn parse_ascii_id(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}
