// 🔗 Mapping Lifecycle Manager
//
// PENDING → CONFIRMED | REJECTED. Terminal states stay terminal: asking to
// decide an already-decided mapping is an InvalidTransition, never a no-op.
//
// Every status write is a compare-and-swap on the status the caller observed,
// so two concurrent confirmations cannot both succeed. Confirming an athlete
// mapping backfills the athlete id onto unlinked results with the same
// normalized name; if that backfill fails the confirmation is reverted.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::clamp_auto_confirm;
use crate::error::{ReconcileError, Result};
use crate::matcher::{validate_similarity, CandidateMatcher, MatchQuery};
use crate::model::{
    EntityKind, Event, ExternalEntityMapping, MappingStatus, NewMapping, TEAM_CODE_KEY,
};
use crate::parser::normalize_name;
use crate::store::{
    LinkCounts, Page, ReconciliationStore, StatusCounts, TeamCodeStatus, Transition,
};

/// Actor recorded on events written by the sweep
pub const AUTO_CONFIRM_ACTOR: &str = "auto-confirm";
const DEFAULT_ACTOR: &str = "system";

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmOutcome {
    pub mapping: ExternalEntityMapping,
    pub results_linked: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AutoConfirmReport {
    /// Nothing written; `matches` is exactly what a real run would confirm
    DryRun {
        min_confidence: f64,
        would_confirm: usize,
        matches: Vec<ExternalEntityMapping>,
    },
    Applied {
        min_confidence: f64,
        confirmed: usize,
        failed: usize,
        total_candidates: usize,
        results_linked: usize,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MappingStats {
    pub mappings: StatusCounts,
    pub results: LinkCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposeReport {
    pub created: Vec<ExternalEntityMapping>,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamCodeReport {
    pub total: usize,
    pub linked: usize,
    pub unlinked: usize,
    pub team_codes: Vec<TeamCodeStatus>,
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct MappingManager<'a, S: ReconciliationStore + ?Sized> {
    store: &'a S,
    default_source: String,
    fetch_factor: usize,
}

impl<'a, S: ReconciliationStore + ?Sized> MappingManager<'a, S> {
    pub fn new(store: &'a S, default_source: impl Into<String>) -> Self {
        Self {
            store,
            default_source: default_source.into(),
            fetch_factor: 3,
        }
    }

    pub fn with_fetch_factor(mut self, fetch_factor: usize) -> Self {
        self.fetch_factor = fetch_factor.max(1);
        self
    }

    // ------------------------------------------------------------------
    // create
    // ------------------------------------------------------------------

    /// Insert a PENDING mapping. The suggested internal id is optional but,
    /// when given, must reference an existing entity.
    pub fn create(
        &self,
        kind: EntityKind,
        input: NewMapping,
        actor: Option<&str>,
    ) -> Result<ExternalEntityMapping> {
        if !(0.0..=1.0).contains(&input.confidence_score) {
            return Err(ReconcileError::InvalidInput(format!(
                "confidence_score must be within [0, 1], got {}",
                input.confidence_score
            )));
        }
        if let Some(id) = &input.internal_id {
            self.require_entity(kind, id)?;
        }

        let mapping = ExternalEntityMapping::pending(kind, input, &self.default_source);
        if mapping.external_name_norm.is_empty() {
            return Err(ReconcileError::InvalidInput(
                "external_name is empty after normalization".to_string(),
            ));
        }

        self.store.insert_mapping(&mapping)?;
        self.audit(
            kind,
            "mapping_created",
            &mapping.id,
            json!({
                "external_name": mapping.external_name,
                "suggested_id": mapping.internal_id,
                "confidence_score": mapping.confidence_score,
                "source": mapping.source,
            }),
            actor,
        );

        debug!(kind = %kind, id = %mapping.id, name = %mapping.external_name_norm, "mapping created");
        Ok(mapping)
    }

    // ------------------------------------------------------------------
    // confirm / reject
    // ------------------------------------------------------------------

    pub fn confirm(
        &self,
        kind: EntityKind,
        mapping_id: &str,
        internal_id: &str,
        reviewed_by: Option<&str>,
    ) -> Result<ConfirmOutcome> {
        self.confirm_as(kind, mapping_id, internal_id, reviewed_by, reviewed_by)
    }

    fn confirm_as(
        &self,
        kind: EntityKind,
        mapping_id: &str,
        internal_id: &str,
        reviewed_by: Option<&str>,
        actor: Option<&str>,
    ) -> Result<ConfirmOutcome> {
        let mapping = self.decidable(kind, mapping_id, MappingStatus::Confirmed)?;
        self.require_entity(kind, internal_id)?;

        let transition = Transition {
            from: MappingStatus::Pending,
            to: MappingStatus::Confirmed,
            internal_id: Some(internal_id.to_string()),
            reviewed_by: reviewed_by.map(str::to_string),
            reviewed_at: Some(Utc::now()),
        };
        self.swap(kind, &mapping, &transition)?;

        let results_linked = if kind.backfills_results() {
            match self
                .store
                .link_results(&mapping.external_name_norm, internal_id)
            {
                Ok(n) => n,
                Err(err) => {
                    warn!(kind = %kind, id = mapping_id, error = %err, "backfill failed, reverting confirmation");
                    self.revert_confirmation(kind, &mapping, actor);
                    return Err(err);
                }
            }
        } else {
            0
        };

        self.audit(
            kind,
            "mapping_confirmed",
            mapping_id,
            json!({
                "internal_id": internal_id,
                "previous_suggestion": mapping.internal_id,
                "results_linked": results_linked,
            }),
            actor,
        );
        if results_linked > 0 {
            self.record(Event::new(
                "results_linked",
                kind.as_str(),
                internal_id,
                json!({
                    "mapping_id": mapping_id,
                    "swimmer_name_norm": mapping.external_name_norm,
                    "count": results_linked,
                }),
                actor.unwrap_or(DEFAULT_ACTOR),
            ));
        }

        info!(kind = %kind, id = mapping_id, internal_id, results_linked, "mapping confirmed");

        let mut confirmed = mapping;
        confirmed.status = transition.to;
        confirmed.internal_id = transition.internal_id;
        confirmed.reviewed_by = transition.reviewed_by;
        confirmed.reviewed_at = transition.reviewed_at;
        Ok(ConfirmOutcome {
            mapping: confirmed,
            results_linked,
        })
    }

    pub fn reject(
        &self,
        kind: EntityKind,
        mapping_id: &str,
        reviewed_by: Option<&str>,
    ) -> Result<ExternalEntityMapping> {
        let mapping = self.decidable(kind, mapping_id, MappingStatus::Rejected)?;

        let transition = Transition {
            from: MappingStatus::Pending,
            to: MappingStatus::Rejected,
            internal_id: mapping.internal_id.clone(),
            reviewed_by: reviewed_by.map(str::to_string),
            reviewed_at: Some(Utc::now()),
        };
        self.swap(kind, &mapping, &transition)?;

        self.audit(
            kind,
            "mapping_rejected",
            mapping_id,
            json!({ "suggested_id": mapping.internal_id }),
            reviewed_by,
        );
        info!(kind = %kind, id = mapping_id, "mapping rejected");

        let mut rejected = mapping;
        rejected.status = transition.to;
        rejected.reviewed_by = transition.reviewed_by;
        rejected.reviewed_at = transition.reviewed_at;
        Ok(rejected)
    }

    // ------------------------------------------------------------------
    // sweep
    // ------------------------------------------------------------------

    /// Confirm every PENDING mapping with a suggestion at or above the
    /// (clamped) floor. One failed confirmation is counted, not fatal.
    pub fn auto_confirm(
        &self,
        kind: EntityKind,
        min_confidence: f64,
        dry_run: bool,
    ) -> Result<AutoConfirmReport> {
        let floor = clamp_auto_confirm(min_confidence);
        let candidates = self.store.auto_confirm_candidates(kind, floor)?;

        if dry_run {
            info!(kind = %kind, floor, would_confirm = candidates.len(), "auto-confirm dry run");
            return Ok(AutoConfirmReport::DryRun {
                min_confidence: floor,
                would_confirm: candidates.len(),
                matches: candidates,
            });
        }

        let total_candidates = candidates.len();
        let mut confirmed = 0;
        let mut failed = 0;
        let mut results_linked = 0;

        for candidate in &candidates {
            let Some(internal_id) = candidate.internal_id.as_deref() else {
                failed += 1;
                continue;
            };
            match self.confirm_as(
                kind,
                &candidate.id,
                internal_id,
                None,
                Some(AUTO_CONFIRM_ACTOR),
            ) {
                Ok(outcome) => {
                    confirmed += 1;
                    results_linked += outcome.results_linked;
                }
                Err(err) => {
                    failed += 1;
                    warn!(kind = %kind, id = %candidate.id, error = %err, "auto-confirm skipped mapping");
                }
            }
        }

        info!(kind = %kind, floor, confirmed, failed, total_candidates, "auto-confirm sweep finished");
        Ok(AutoConfirmReport::Applied {
            min_confidence: floor,
            confirmed,
            failed,
            total_candidates,
            results_linked,
        })
    }

    // ------------------------------------------------------------------
    // read side
    // ------------------------------------------------------------------

    pub fn stats(&self, kind: EntityKind) -> Result<MappingStats> {
        Ok(MappingStats {
            mappings: self.store.mapping_status_counts(kind)?,
            results: self.store.result_link_counts()?,
        })
    }

    /// Review queue, most confident first
    pub fn pending(
        &self,
        kind: EntityKind,
        limit: usize,
        offset: usize,
    ) -> Result<Page<ExternalEntityMapping>> {
        if limit == 0 {
            return Err(ReconcileError::InvalidInput("limit must be at least 1".into()));
        }
        self.store
            .list_mappings(kind, MappingStatus::Pending, limit, offset)
    }

    pub fn get(&self, kind: EntityKind, mapping_id: &str) -> Result<ExternalEntityMapping> {
        self.store
            .get_mapping(kind, mapping_id)?
            .ok_or_else(|| ReconcileError::not_found("mapping", mapping_id))
    }

    pub fn history(&self, kind: EntityKind, mapping_id: &str) -> Result<Vec<Event>> {
        self.store.events_for(kind.audit_entity(), mapping_id)
    }

    /// One PENDING mapping per distinct new name, pre-filled with the best
    /// candidate (or no suggestion and confidence 0 when nothing clears the
    /// floor). Names that already have a mapping of any status are skipped.
    pub fn propose(
        &self,
        kind: EntityKind,
        names: &[String],
        min_similarity: f64,
        actor: Option<&str>,
    ) -> Result<ProposeReport> {
        validate_similarity(min_similarity)?;
        let matcher = CandidateMatcher::new(self.store, self.fetch_factor);

        let mut seen = HashSet::new();
        let mut created = Vec::new();
        let mut skipped = 0;

        for name in names {
            let norm = normalize_name(name);
            if norm.is_empty() || !seen.insert(norm.clone()) {
                skipped += 1;
                continue;
            }
            if self.store.find_mapping_by_name(kind, &norm)?.is_some() {
                skipped += 1;
                continue;
            }

            let best = matcher
                .find_matches(
                    kind,
                    &MatchQuery {
                        external_name: name,
                        scope: None,
                        min_similarity,
                        limit: 1,
                    },
                )?
                .into_iter()
                .next();

            let input = NewMapping {
                external_name: name.trim().to_string(),
                confidence_score: best.as_ref().map_or(0.0, |c| c.similarity_score),
                internal_id: best.map(|c| c.internal_id),
                ..Default::default()
            };
            created.push(self.create(kind, input, actor)?);
        }

        info!(kind = %kind, created = created.len(), skipped, "proposed mappings");
        Ok(ProposeReport { created, skipped })
    }

    // ------------------------------------------------------------------
    // club team codes
    // ------------------------------------------------------------------

    /// Every team code seen on results, with the club that owns it
    pub fn team_codes(&self) -> Result<TeamCodeReport> {
        let team_codes = self.store.team_codes()?;
        let linked = team_codes.iter().filter(|t| t.is_linked()).count();
        Ok(TeamCodeReport {
            total: team_codes.len(),
            linked,
            unlinked: team_codes.len() - linked,
            team_codes,
        })
    }

    pub fn club_team_codes(&self, club_id: &str) -> Result<Vec<String>> {
        self.require_entity(EntityKind::Club, club_id)?;
        self.store.club_team_codes(club_id)
    }

    /// Link a result team code to a club. The link is a CONFIRMED club
    /// mapping carrying the code in its metadata; a code has one owner.
    pub fn link_team_code(
        &self,
        club_id: &str,
        team_code: &str,
        reviewed_by: Option<&str>,
    ) -> Result<ExternalEntityMapping> {
        let code = team_code.trim();
        if code.is_empty() {
            return Err(ReconcileError::InvalidInput("team_code is empty".to_string()));
        }
        self.require_entity(EntityKind::Club, club_id)?;
        if let Some(owner) = self.store.team_code_link(code)? {
            return Err(already_linked(code, &owner));
        }

        let mut mapping = ExternalEntityMapping::pending(
            EntityKind::Club,
            NewMapping {
                external_name: code.to_string(),
                internal_id: Some(club_id.to_string()),
                confidence_score: 1.0,
                source: None,
                metadata: HashMap::from([(TEAM_CODE_KEY.to_string(), json!(code))]),
            },
            &self.default_source,
        );
        mapping.status = MappingStatus::Confirmed;
        mapping.reviewed_by = reviewed_by.map(str::to_string);
        mapping.reviewed_at = Some(Utc::now());

        if let Err(err) = self.store.insert_mapping(&mapping) {
            // the owner index rejects a link that raced ours
            if let Some(owner) = self.store.team_code_link(code)? {
                return Err(already_linked(code, &owner));
            }
            return Err(err);
        }

        self.audit(
            EntityKind::Club,
            "team_code_linked",
            &mapping.id,
            json!({ "club_id": club_id, "team_code": code }),
            reviewed_by,
        );
        info!(club_id, team_code = code, id = %mapping.id, "team code linked");
        Ok(mapping)
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    /// Load a mapping that may still move to `to`
    fn decidable(
        &self,
        kind: EntityKind,
        mapping_id: &str,
        to: MappingStatus,
    ) -> Result<ExternalEntityMapping> {
        let mapping = self.get(kind, mapping_id)?;
        if !kind.allows(mapping.status, to) {
            return Err(ReconcileError::InvalidTransition {
                mapping_id: mapping_id.to_string(),
                from: mapping.status,
                to,
            });
        }
        Ok(mapping)
    }

    fn require_entity(&self, kind: EntityKind, id: &str) -> Result<()> {
        match self.store.get_entity(kind, id)? {
            Some(_) => Ok(()),
            None => Err(ReconcileError::not_found(kind.as_str(), id)),
        }
    }

    /// Apply a CAS transition; a lost race reports the status that won
    fn swap(
        &self,
        kind: EntityKind,
        mapping: &ExternalEntityMapping,
        transition: &Transition,
    ) -> Result<()> {
        if self.store.transition_mapping(kind, &mapping.id, transition)? {
            return Ok(());
        }
        let current = self.get(kind, &mapping.id)?;
        Err(ReconcileError::InvalidTransition {
            mapping_id: mapping.id.clone(),
            from: current.status,
            to: transition.to,
        })
    }

    /// Compensating action for a failed backfill. Its own failure is logged
    /// and never replaces the backfill error.
    fn revert_confirmation(
        &self,
        kind: EntityKind,
        original: &ExternalEntityMapping,
        actor: Option<&str>,
    ) {
        let revert = Transition {
            from: MappingStatus::Confirmed,
            to: MappingStatus::Pending,
            internal_id: original.internal_id.clone(),
            reviewed_by: original.reviewed_by.clone(),
            reviewed_at: original.reviewed_at,
        };
        match self.store.transition_mapping(kind, &original.id, &revert) {
            Ok(true) => self.audit(
                kind,
                "mapping_reverted",
                &original.id,
                json!({ "reason": "backfill failed" }),
                actor,
            ),
            Ok(false) => {
                warn!(kind = %kind, id = %original.id, "revert skipped: mapping no longer CONFIRMED")
            }
            Err(err) => {
                warn!(kind = %kind, id = %original.id, error = %err, "failed to revert confirmation")
            }
        }
    }

    fn audit(
        &self,
        kind: EntityKind,
        event_type: &str,
        mapping_id: &str,
        data: serde_json::Value,
        actor: Option<&str>,
    ) {
        self.record(Event::new(
            event_type,
            kind.audit_entity(),
            mapping_id,
            data,
            actor.unwrap_or(DEFAULT_ACTOR),
        ));
    }

    /// Audit writes never fail the operation they describe
    fn record(&self, event: Event) {
        if let Err(err) = self.store.record_event(&event) {
            warn!(event_type = %event.event_type, entity_id = %event.entity_id, error = %err, "audit event not recorded");
        }
    }
}

fn already_linked(code: &str, owner: &ExternalEntityMapping) -> ReconcileError {
    ReconcileError::Conflict(format!(
        "team code '{code}' is already linked to club {}",
        owner.internal_id.as_deref().unwrap_or_default()
    ))
}

// ============================================================================
// TESTS
// ============================================================================
