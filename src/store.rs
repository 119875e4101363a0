// 🗄️ Persistent store interface
//
// Everything the core needs from storage, expressed against the domain types.
// The lifecycle and import code only ever see `&dyn ReconciliationStore` (or a
// generic `S: ReconciliationStore`), so the SQLite backend in `db.rs` is one
// implementation, not an assumption.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::error::Result;
use crate::model::{
    CanonicalResult, EntityKind, Event, ExternalEntityMapping, Gender, InternalEntity,
    MappingStatus,
};

/// Outcome of one idempotent upsert batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertCounts {
    pub fn absorb(&mut self, other: UpsertCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }
}

/// Canonical results with vs. without an athlete reference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkCounts {
    pub linked: usize,
    pub unlinked: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub confirmed: usize,
    pub rejected: usize,
}

/// One page of a listing plus the unpaginated total
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub total: usize,
    pub items: Vec<T>,
}

/// Conditional status change: applied only while the row is still in `from`
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: MappingStatus,
    pub to: MappingStatus,
    /// Value written to the internal-id column (None clears it)
    pub internal_id: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// A distinct external swimmer name with no athlete reference yet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmatchedSwimmer {
    pub swimmer_name: String,
    pub swimmer_name_norm: String,
    pub gender: Gender,
    pub team_code: Option<String>,
    pub result_count: usize,
}

/// A team code seen on results, with the club it is linked to (if any)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamCodeStatus {
    pub team_code: String,
    pub result_count: usize,
    pub unlinked_results: usize,
    pub club_id: Option<String>,
    pub club_name: Option<String>,
}

impl TeamCodeStatus {
    pub fn is_linked(&self) -> bool {
        self.club_id.is_some()
    }
}

/// Distinct unlinked swimmers under one team code (None = results without a code)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamUnmatchedCounts {
    pub team_code: Option<String>,
    pub swimmers: usize,
    pub male: usize,
    pub female: usize,
}

pub trait ReconciliationStore {
    // ------------------------------------------------------------------
    // canonical results
    // ------------------------------------------------------------------

    /// Insert-or-update keyed on the identity hash. Atomic per call.
    fn upsert_results(&self, batch: &[CanonicalResult]) -> Result<UpsertCounts>;

    /// Point every unlinked result with this normalized name at `athlete_id`
    fn link_results(&self, name_norm: &str, athlete_id: &str) -> Result<usize>;

    fn result_link_counts(&self) -> Result<LinkCounts>;

    fn count_results(&self) -> Result<usize>;

    /// Ordered by result count desc, then name
    fn unmatched_swimmers(
        &self,
        team_code: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UnmatchedSwimmer>>;

    /// `unmatched_swimmers` restricted to any of the given team codes
    fn unmatched_swimmers_in(
        &self,
        team_codes: &[String],
        limit: usize,
    ) -> Result<Vec<UnmatchedSwimmer>>;

    /// Ordered by team code, results without a code last
    fn unmatched_team_counts(&self) -> Result<Vec<TeamUnmatchedCounts>>;

    // ------------------------------------------------------------------
    // club team codes
    // ------------------------------------------------------------------

    /// Distinct non-empty result team codes, ordered by code
    fn team_codes(&self) -> Result<Vec<TeamCodeStatus>>;

    /// Codes owned by a club through CONFIRMED team-code mappings
    fn club_team_codes(&self, club_id: &str) -> Result<Vec<String>>;

    /// The CONFIRMED club mapping owning a team code
    fn team_code_link(&self, team_code: &str) -> Result<Option<ExternalEntityMapping>>;

    // ------------------------------------------------------------------
    // internal entities (read-only)
    // ------------------------------------------------------------------

    /// Active entities in stable insertion order
    fn fetch_entities(
        &self,
        kind: EntityKind,
        scope: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InternalEntity>>;

    fn get_entity(&self, kind: EntityKind, id: &str) -> Result<Option<InternalEntity>>;

    // ------------------------------------------------------------------
    // mappings
    // ------------------------------------------------------------------

    fn insert_mapping(&self, mapping: &ExternalEntityMapping) -> Result<()>;

    fn get_mapping(&self, kind: EntityKind, id: &str) -> Result<Option<ExternalEntityMapping>>;

    fn find_mapping_by_name(
        &self,
        kind: EntityKind,
        name_norm: &str,
    ) -> Result<Option<ExternalEntityMapping>>;

    /// Compare-and-swap on status. Returns false when the row was not in
    /// `transition.from` (already decided, or decided concurrently).
    fn transition_mapping(&self, kind: EntityKind, id: &str, transition: &Transition)
        -> Result<bool>;

    /// Ordered by confidence desc
    fn list_mappings(
        &self,
        kind: EntityKind,
        status: MappingStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Page<ExternalEntityMapping>>;

    fn mapping_status_counts(&self, kind: EntityKind) -> Result<StatusCounts>;

    /// PENDING, with a suggested internal id, confidence ≥ floor
    fn auto_confirm_candidates(
        &self,
        kind: EntityKind,
        min_confidence: f64,
    ) -> Result<Vec<ExternalEntityMapping>>;

    /// Most recently reviewed CONFIRMED mapping for an internal entity
    fn find_confirmed_mapping(
        &self,
        kind: EntityKind,
        internal_id: &str,
        source: Option<&str>,
    ) -> Result<Option<ExternalEntityMapping>>;

    fn update_mapping_metadata(
        &self,
        kind: EntityKind,
        id: &str,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // audit trail
    // ------------------------------------------------------------------

    fn record_event(&self, event: &Event) -> Result<()>;

    /// Newest first
    fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>>;
}
