// Process-local engine counters, rendered by the /metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

static MESSAGES_SUBMITTED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_DEDUPLICATED: AtomicU64 = AtomicU64::new(0);
static BATCHES_COMMITTED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_BATCHED: AtomicU64 = AtomicU64::new(0);
static FLUSH_FAILURES: AtomicU64 = AtomicU64::new(0);
static IDS_REQUEUED: AtomicU64 = AtomicU64::new(0);
static ORPHANS_RECONCILED: AtomicU64 = AtomicU64::new(0);

pub(crate) fn record_submit() {
    MESSAGES_SUBMITTED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_deduplicated() {
    MESSAGES_DEDUPLICATED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_batch(len: usize) {
    BATCHES_COMMITTED.fetch_add(1, Ordering::Relaxed);
    MESSAGES_BATCHED.fetch_add(len as u64, Ordering::Relaxed);
}

pub(crate) fn record_flush_failure() {
    FLUSH_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_requeued(count: usize) {
    IDS_REQUEUED.fetch_add(count as u64, Ordering::Relaxed);
}

pub(crate) fn record_reconciled(count: usize) {
    ORPHANS_RECONCILED.fetch_add(count as u64, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy)]
pub struct CounterSnapshot {
    pub messages_submitted: u64,
    pub messages_deduplicated: u64,
    pub batches_committed: u64,
    pub messages_batched: u64,
    pub flush_failures: u64,
    pub ids_requeued: u64,
    pub orphans_reconciled: u64,
}

pub fn snapshot() -> CounterSnapshot {
    CounterSnapshot {
        messages_submitted: MESSAGES_SUBMITTED.load(Ordering::Relaxed),
        messages_deduplicated: MESSAGES_DEDUPLICATED.load(Ordering::Relaxed),
        batches_committed: BATCHES_COMMITTED.load(Ordering::Relaxed),
        messages_batched: MESSAGES_BATCHED.load(Ordering::Relaxed),
        flush_failures: FLUSH_FAILURES.load(Ordering::Relaxed),
        ids_requeued: IDS_REQUEUED.load(Ordering::Relaxed),
        orphans_reconciled: ORPHANS_RECONCILED.load(Ordering::Relaxed),
    }
}
