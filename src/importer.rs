// 📥 Reconciliation Importer
//
// Normalize a batch of raw records, then upsert the survivors in fixed-size
// chunks. A chunk that fails to write is counted as errors and skipped; the
// run carries on with the next chunk.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::model::{CanonicalResult, RawRecord};
use crate::normalizer::{DropReason, RecordNormalizer};
use crate::store::{ReconciliationStore, UpsertCounts};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    /// Raw records handed in
    pub read: usize,
    /// Records that survived normalization
    pub normalized: usize,
    pub dropped: BTreeMap<DropReason, usize>,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Normalized records whose batch failed to write
    pub errors: usize,
    pub batches: usize,
    pub failed_batches: usize,
    /// Message of the first batch that failed to write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_error: Option<String>,
}

impl ImportReport {
    pub fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }

    /// Rows written or confirmed unchanged
    pub fn imported(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportPreview {
    pub read: usize,
    pub normalized: usize,
    pub dropped: BTreeMap<DropReason, usize>,
    pub sample: Vec<CanonicalResult>,
}

pub struct Importer<'a, S: ReconciliationStore + ?Sized> {
    store: &'a S,
    normalizer: RecordNormalizer,
    batch_size: usize,
}

impl<'a, S: ReconciliationStore + ?Sized> Importer<'a, S> {
    pub fn new(store: &'a S, source: impl Into<String>, batch_size: usize) -> Self {
        Self {
            store,
            normalizer: RecordNormalizer::new(source),
            batch_size: batch_size.max(1),
        }
    }

    pub fn import(&self, records: &[RawRecord]) -> ImportReport {
        let normalized = self.normalizer.normalize_batch(records);
        self.write(records.len(), normalized.results, normalized.dropped)
    }

    /// Write results that were normalized elsewhere (e.g. by a sync that
    /// attached athlete ids), with the same batching and error accounting
    pub fn import_normalized(&self, results: Vec<CanonicalResult>) -> ImportReport {
        self.write(results.len(), results, BTreeMap::new())
    }

    fn write(
        &self,
        read: usize,
        results: Vec<CanonicalResult>,
        dropped: BTreeMap<DropReason, usize>,
    ) -> ImportReport {
        let mut report = ImportReport {
            read,
            normalized: results.len(),
            dropped,
            ..Default::default()
        };
        let mut totals = UpsertCounts::default();

        for (index, chunk) in results.chunks(self.batch_size).enumerate() {
            report.batches += 1;
            match self.store.upsert_results(chunk) {
                Ok(counts) => totals.absorb(counts),
                Err(err) => {
                    report.failed_batches += 1;
                    report.errors += chunk.len();
                    if report.first_error.is_none() {
                        report.first_error = Some(err.to_string());
                    }
                    warn!(batch = index, size = chunk.len(), error = %err, "result batch failed");
                }
            }
        }

        report.inserted = totals.inserted;
        report.updated = totals.updated;
        report.unchanged = totals.unchanged;

        info!(
            source = self.normalizer.source(),
            read = report.read,
            dropped = report.dropped_total(),
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            errors = report.errors,
            "import finished"
        );
        report
    }
}

/// Normalize without writing; no store involved
pub fn preview(
    normalizer: &RecordNormalizer,
    records: &[RawRecord],
    sample_size: usize,
) -> ImportPreview {
    let mut normalized = normalizer.normalize_batch(records);
    let count = normalized.results.len();
    normalized.results.truncate(sample_size);
    ImportPreview {
        read: records.len(),
        normalized: count,
        dropped: normalized.dropped,
        sample: normalized.results,
    }
}
