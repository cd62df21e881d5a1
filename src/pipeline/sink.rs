//! Batched, deduplicating persistence for one cycle.

use crate::models::{NaturalKey, Record};
use crate::storage::Repository;
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Where flushed batches go. One call is one transaction.
pub trait RecordStore: Send + Sync {
    /// Returns the number of records that did not exist before.
    fn upsert_batch(&self, records: &[Record]) -> Result<usize>;
}

impl RecordStore for Repository {
    fn upsert_batch(&self, records: &[Record]) -> Result<usize> {
        self.upsert_records(records)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    /// Distinct records accepted this cycle.
    pub accepted: usize,
    /// Records that were new to the store.
    pub stored: usize,
    pub flushes: usize,
}

/// Pending records are flushed when either threshold is reached: record
/// count or completed logical units (threads, pages, feeds). Whatever is
/// left goes out in [`BatchUpsertSink::finish`].
pub struct BatchUpsertSink {
    store: Arc<dyn RecordStore>,
    batch_size: usize,
    unit_threshold: usize,
    pending: Vec<Record>,
    seen: HashSet<NaturalKey>,
    units: usize,
    stats: SinkStats,
}

impl BatchUpsertSink {
    pub fn new(store: Arc<dyn RecordStore>, batch_size: usize, unit_threshold: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            unit_threshold: unit_threshold.max(1),
            pending: Vec::new(),
            seen: HashSet::new(),
            units: 0,
            stats: SinkStats::default(),
        }
    }

    /// Queue a record. Returns `false` when its key was already seen this
    /// cycle and the record was dropped.
    pub fn accumulate(&mut self, record: Record) -> Result<bool> {
        if !self.seen.insert(record.natural_key()) {
            return Ok(false);
        }
        self.pending.push(record);
        self.stats.accepted += 1;
        if self.pending.len() >= self.batch_size {
            debug!("Record threshold reached ({})", self.batch_size);
            self.flush()?;
        }
        Ok(true)
    }

    /// Mark one logical unit as done.
    pub fn end_unit(&mut self) -> Result<()> {
        self.units += 1;
        if self.units >= self.unit_threshold && !self.pending.is_empty() {
            debug!("Unit threshold reached ({})", self.unit_threshold);
            self.flush()?;
        }
        Ok(())
    }

    /// Write the pending batch. A failed write drops that batch only.
    pub fn flush(&mut self) -> Result<usize> {
        self.units = 0;
        if self.pending.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.pending);
        let stored = self.store.upsert_batch(&batch)?;
        self.stats.stored += stored;
        self.stats.flushes += 1;
        info!("Flushed {} records, {} new", batch.len(), stored);
        Ok(stored)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn finish(mut self) -> Result<SinkStats> {
        self.flush()?;
        Ok(self.stats)
    }
}
