// 🔄 Per-athlete sync
//
// Pull one athlete's results from the foreign system (keyed by the
// `foreign_id` stored on their CONFIRMED mapping), normalize them with the
// athlete id already attached and upsert. The mapping's metadata carries the
// sync state: IN_PROGRESS while running, then SUCCESS or ERROR. A fetch error
// or any result that fails to write leaves the mapping in ERROR.

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::error::{ReconcileError, Result};
use crate::importer::Importer;
use crate::model::{EntityKind, Event, ExternalEntityMapping, MappingStatus};
use crate::normalizer::{DropReason, RecordNormalizer};
use crate::sources::{AthleteResultSource, SyncWindow};
use crate::store::ReconciliationStore;

pub const SYNC_ACTOR: &str = "sync";

/// Default look-back when a sync is requested without a start date
const DEFAULT_WINDOW_DAYS: i64 = 730;

const PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    InProgress,
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::InProgress => "IN_PROGRESS",
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub athlete_id: String,
    pub athlete_name: String,
    pub foreign_id: String,
    pub window: SyncWindow,
    /// Raw records returned by the source
    pub total_results: usize,
    pub new_results: usize,
    pub existing_results: usize,
    pub dropped: BTreeMap<DropReason, usize>,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub athlete_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncAllReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub new_results: usize,
    pub failures: Vec<SyncFailure>,
}

pub struct AthleteSync<'a, S: ReconciliationStore + ?Sized, R: AthleteResultSource + ?Sized> {
    store: &'a S,
    remote: &'a R,
    /// Provenance tag written on synced results
    result_source: String,
    /// Restrict to mappings created by this source (None = any)
    mapping_source: Option<String>,
    batch_size: usize,
}

impl<'a, S, R> AthleteSync<'a, S, R>
where
    S: ReconciliationStore + ?Sized,
    R: AthleteResultSource + ?Sized,
{
    pub fn new(store: &'a S, remote: &'a R, result_source: impl Into<String>) -> Self {
        Self {
            store,
            remote,
            result_source: result_source.into(),
            mapping_source: None,
            batch_size: 500,
        }
    }

    pub fn with_mapping_source(mut self, source: Option<String>) -> Self {
        self.mapping_source = source;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Missing `from` defaults to two years back; an inverted window is rejected
    fn resolve_window(window: SyncWindow) -> Result<SyncWindow> {
        let from = window
            .from
            .or_else(|| Some(Utc::now().date_naive() - Duration::days(DEFAULT_WINDOW_DAYS)));
        if let (Some(from), Some(to)) = (from, window.to) {
            if from > to {
                return Err(ReconcileError::InvalidInput(format!(
                    "sync window starts after it ends ({from} > {to})"
                )));
            }
        }
        Ok(SyncWindow { from, to: window.to })
    }

    pub fn sync_athlete(&self, athlete_id: &str, window: SyncWindow) -> Result<SyncReport> {
        let window = Self::resolve_window(window)?;

        let mapping = self
            .store
            .find_confirmed_mapping(EntityKind::Athlete, athlete_id, self.mapping_source.as_deref())?
            .ok_or_else(|| ReconcileError::not_found("confirmed mapping for athlete", athlete_id))?;
        let foreign_id = mapping.foreign_id().ok_or_else(|| {
            ReconcileError::InvalidInput(format!(
                "mapping {} carries no foreign_id in its metadata",
                mapping.id
            ))
        })?;
        let athlete = self
            .store
            .get_entity(EntityKind::Athlete, athlete_id)?
            .ok_or_else(|| ReconcileError::not_found("athlete", athlete_id))?;

        self.mark(&mapping, SyncStatus::InProgress, |_| {})?;

        let fetched = match self.remote.fetch_athlete_records(&foreign_id, &window) {
            Ok(records) => records,
            Err(err) => {
                let message = err.to_string();
                warn!(athlete_id, foreign_id = %foreign_id, error = %message, "athlete sync failed");
                // compensating step: the fetch error is what the caller sees
                if let Err(mark_err) = self.mark(&mapping, SyncStatus::Error, |meta| {
                    meta.insert("sync_error".into(), Value::String(message.clone()));
                }) {
                    warn!(athlete_id, error = %mark_err, "could not record sync failure on mapping");
                }
                return Err(match err {
                    ReconcileError::Upstream(_) => err,
                    other => ReconcileError::Upstream(other.to_string()),
                });
            }
        };

        let mut records = fetched;
        for record in &mut records {
            let has_name = record
                .swimmer_name
                .as_deref()
                .map_or(false, |n| !n.trim().is_empty());
            if !has_name {
                record.swimmer_name = Some(athlete.name.clone());
            }
        }

        let batch = RecordNormalizer::new(self.result_source.as_str()).normalize_batch(&records);
        let results = batch
            .results
            .into_iter()
            .map(|mut result| {
                result.athlete_id = Some(athlete_id.to_string());
                result
            })
            .collect();
        let written = Importer::new(self.store, self.result_source.as_str(), self.batch_size)
            .import_normalized(results);

        let total_results = records.len();
        if written.errors > 0 {
            let message = format!(
                "{} of {} results failed to write: {}",
                written.errors,
                written.normalized,
                written.first_error.as_deref().unwrap_or("unknown error")
            );
            warn!(athlete_id, foreign_id = %foreign_id, error = %message, "athlete sync failed");
            if let Err(mark_err) = self.mark(&mapping, SyncStatus::Error, |meta| {
                meta.insert("sync_error".into(), Value::String(message.clone()));
            }) {
                warn!(athlete_id, error = %mark_err, "could not record sync failure on mapping");
            }
            return Err(ReconcileError::Upstream(message));
        }

        self.mark(&mapping, SyncStatus::Success, |meta| {
            meta.insert("last_synced_at".into(), json!(Utc::now().to_rfc3339()));
            meta.insert("results_count".into(), json!(total_results));
            meta.insert("sync_error".into(), Value::Null);
        })?;

        let report = SyncReport {
            athlete_id: athlete_id.to_string(),
            athlete_name: athlete.name,
            foreign_id,
            window,
            total_results,
            new_results: written.inserted,
            existing_results: written.updated + written.unchanged,
            dropped: batch.dropped,
            errors: written.errors,
        };

        let event = Event::new(
            "athlete_synced",
            EntityKind::Athlete.as_str(),
            athlete_id,
            json!({
                "mapping_id": mapping.id,
                "foreign_id": report.foreign_id,
                "total_results": report.total_results,
                "new_results": report.new_results,
                "errors": report.errors,
            }),
            SYNC_ACTOR,
        );
        if let Err(err) = self.store.record_event(&event) {
            warn!(athlete_id, error = %err, "failed to record sync event");
        }

        info!(
            athlete_id,
            foreign_id = %report.foreign_id,
            total = report.total_results,
            new = report.new_results,
            "athlete synced"
        );
        Ok(report)
    }

    /// Sync every athlete with a CONFIRMED mapping; one failure never stops the run
    pub fn sync_all(&self, window: SyncWindow) -> Result<SyncAllReport> {
        let window = Self::resolve_window(window)?;
        let mut report = SyncAllReport::default();

        for athlete_id in self.confirmed_athletes()? {
            report.total += 1;
            match self.sync_athlete(&athlete_id, window) {
                Ok(synced) => {
                    report.successful += 1;
                    report.new_results += synced.new_results;
                }
                Err(err) => {
                    report.failed += 1;
                    report.failures.push(SyncFailure {
                        athlete_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            "sync-all finished"
        );
        Ok(report)
    }

    fn confirmed_athletes(&self) -> Result<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        let mut offset = 0;
        loop {
            let page = self.store.list_mappings(
                EntityKind::Athlete,
                MappingStatus::Confirmed,
                PAGE_SIZE,
                offset,
            )?;
            let fetched = page.items.len();
            ids.extend(
                page.items
                    .into_iter()
                    .filter(|m| {
                        self.mapping_source
                            .as_deref()
                            .map_or(true, |source| m.source == source)
                    })
                    .filter_map(|m| m.internal_id),
            );
            offset += fetched;
            if fetched == 0 || offset >= page.total {
                return Ok(ids);
            }
        }
    }

    fn mark(
        &self,
        mapping: &ExternalEntityMapping,
        status: SyncStatus,
        extra: impl FnOnce(&mut std::collections::HashMap<String, Value>),
    ) -> Result<()> {
        // re-read so concurrent metadata edits between steps are kept
        let current = self
            .store
            .get_mapping(EntityKind::Athlete, &mapping.id)?
            .ok_or_else(|| ReconcileError::not_found("mapping", mapping.id.as_str()))?;
        let mut metadata = current.metadata;
        metadata.insert("sync_status".into(), Value::String(status.as_str().into()));
        extra(&mut metadata);
        self.store
            .update_mapping_metadata(EntityKind::Athlete, &mapping.id, &metadata)
    }
}
