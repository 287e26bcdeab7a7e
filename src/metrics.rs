//! Lightweight global metrics for GristMR.
//!
//! Потокобезопасные атомарные счётчики подсистем:
//! - Spill I/O контейнеров (страницы и байты в обе стороны)
//! - Spool (merge-sort scratch)
//! - Irregular exchange (раунды и перемещённые записи/байты)
//!
//! Счётчики глобальны на процесс (один ранг = один процесс в SPMD-модели);
//! снимаются снапшотом, сбрасываются явно.

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Container spill I/O -----
static SPILL_PAGES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static SPILL_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static SPILL_PAGES_READ: AtomicU64 = AtomicU64::new(0);
static SPILL_BYTES_READ: AtomicU64 = AtomicU64::new(0);

// ----- Spool -----
static SPOOL_PAGES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static SPOOL_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);

// ----- Irregular exchange -----
static XCHG_ROUNDS: AtomicU64 = AtomicU64::new(0);
static XCHG_RECORDS_SENT: AtomicU64 = AtomicU64::new(0);
static XCHG_BYTES_SENT: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub spill_pages_written: u64,
    pub spill_bytes_written: u64,
    pub spill_pages_read: u64,
    pub spill_bytes_read: u64,

    pub spool_pages_written: u64,
    pub spool_bytes_written: u64,

    pub xchg_rounds: u64,
    pub xchg_records_sent: u64,
    pub xchg_bytes_sent: u64,
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        spill_pages_written: SPILL_PAGES_WRITTEN.load(Ordering::Relaxed),
        spill_bytes_written: SPILL_BYTES_WRITTEN.load(Ordering::Relaxed),
        spill_pages_read: SPILL_PAGES_READ.load(Ordering::Relaxed),
        spill_bytes_read: SPILL_BYTES_READ.load(Ordering::Relaxed),
        spool_pages_written: SPOOL_PAGES_WRITTEN.load(Ordering::Relaxed),
        spool_bytes_written: SPOOL_BYTES_WRITTEN.load(Ordering::Relaxed),
        xchg_rounds: XCHG_ROUNDS.load(Ordering::Relaxed),
        xchg_records_sent: XCHG_RECORDS_SENT.load(Ordering::Relaxed),
        xchg_bytes_sent: XCHG_BYTES_SENT.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    SPILL_PAGES_WRITTEN.store(0, Ordering::Relaxed);
    SPILL_BYTES_WRITTEN.store(0, Ordering::Relaxed);
    SPILL_PAGES_READ.store(0, Ordering::Relaxed);
    SPILL_BYTES_READ.store(0, Ordering::Relaxed);
    SPOOL_PAGES_WRITTEN.store(0, Ordering::Relaxed);
    SPOOL_BYTES_WRITTEN.store(0, Ordering::Relaxed);
    XCHG_ROUNDS.store(0, Ordering::Relaxed);
    XCHG_RECORDS_SENT.store(0, Ordering::Relaxed);
    XCHG_BYTES_SENT.store(0, Ordering::Relaxed);
}

// ----- increment helpers (crate-internal) -----

pub(crate) fn record_spill_write(bytes: u64) {
    SPILL_PAGES_WRITTEN.fetch_add(1, Ordering::Relaxed);
    SPILL_BYTES_WRITTEN.fetch_add(bytes, Ordering::Relaxed);
}

pub(crate) fn record_spill_read(bytes: u64) {
    SPILL_PAGES_READ.fetch_add(1, Ordering::Relaxed);
    SPILL_BYTES_READ.fetch_add(bytes, Ordering::Relaxed);
}

pub(crate) fn record_spool_write(bytes: u64) {
    SPOOL_PAGES_WRITTEN.fetch_add(1, Ordering::Relaxed);
    SPOOL_BYTES_WRITTEN.fetch_add(bytes, Ordering::Relaxed);
}

pub(crate) fn record_exchange(records: u64, bytes: u64) {
    XCHG_ROUNDS.fetch_add(1, Ordering::Relaxed);
    XCHG_RECORDS_SENT.fetch_add(records, Ordering::Relaxed);
    XCHG_BYTES_SENT.fetch_add(bytes, Ordering::Relaxed);
}
