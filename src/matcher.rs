// 🎯 Candidate Matcher
//
// Scores a bounded superset of internal entities against one external name
// and keeps the best. The superset is `limit × fetch_factor` active entities,
// optionally scoped (athletes by club).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

use crate::error::{ReconcileError, Result};
use crate::model::{EntityKind, Gender, UnknownVariant};
use crate::parser::normalize_name;
use crate::similarity::{round2, score_normalized};
use crate::store::{ReconciliationStore, UnmatchedSwimmer};

/// Candidates returned per name in batch suggestions
pub const SUGGESTION_LIMIT: usize = 3;

/// Grouping key for names with no team code
pub const NO_TEAM: &str = "UNATTACHED";

#[derive(Debug, Clone)]
pub struct MatchQuery<'a> {
    pub external_name: &'a str,
    pub scope: Option<&'a str>,
    pub min_similarity: f64,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub internal_id: String,
    pub name: String,
    pub scope_id: Option<String>,
    /// Rounded to two decimals
    pub similarity_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub external_name: String,
    pub matches: Vec<Candidate>,
    pub best_match: Option<Candidate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    #[default]
    Team,
    Gender,
    Both,
}

impl FromStr for GroupBy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "team" => Ok(GroupBy::Team),
            "gender" => Ok(GroupBy::Gender),
            "both" => Ok(GroupBy::Both),
            other => Err(UnknownVariant { kind: "group_by", value: other.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum UnmatchedGroups {
    Team(BTreeMap<String, Vec<UnmatchedSwimmer>>),
    Gender(BTreeMap<Gender, Vec<UnmatchedSwimmer>>),
    Both(BTreeMap<String, BTreeMap<Gender, Vec<UnmatchedSwimmer>>>),
}

#[derive(Debug, Clone, Serialize)]
pub struct UnmatchedReport {
    pub total: usize,
    pub group_by: GroupBy,
    pub groups: UnmatchedGroups,
}

/// Unlinked swimmers under one team code
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamSummary {
    pub team_code: String,
    pub swimmer_count: usize,
    pub male_count: usize,
    pub female_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnmatchedSummary {
    pub total_teams: usize,
    pub total_swimmers: usize,
    pub teams: Vec<TeamSummary>,
}

/// Unlinked swimmers under the team codes a club owns
#[derive(Debug, Clone, Serialize)]
pub struct ClubUnmatched {
    pub club_id: String,
    pub team_codes: Vec<String>,
    pub swimmers: Vec<UnmatchedSwimmer>,
}

pub struct CandidateMatcher<'a, S: ReconciliationStore + ?Sized> {
    store: &'a S,
    fetch_factor: usize,
}

impl<'a, S: ReconciliationStore + ?Sized> CandidateMatcher<'a, S> {
    pub fn new(store: &'a S, fetch_factor: usize) -> Self {
        Self {
            store,
            fetch_factor: fetch_factor.max(1),
        }
    }

    /// Ranked candidates for one external name, best first.
    /// Equal scores keep the store's order.
    pub fn find_matches(&self, kind: EntityKind, query: &MatchQuery<'_>) -> Result<Vec<Candidate>> {
        validate_similarity(query.min_similarity)?;
        if query.limit == 0 {
            return Err(ReconcileError::InvalidInput("limit must be at least 1".into()));
        }

        let target = normalize_name(query.external_name);
        let fetch = query.limit.saturating_mul(self.fetch_factor);
        let entities = self.store.fetch_entities(kind, query.scope, fetch)?;

        let mut scored: Vec<(f64, Candidate)> = entities
            .into_iter()
            .filter_map(|entity| {
                let raw = score_normalized(&target, &normalize_name(&entity.name));
                (raw >= query.min_similarity).then(|| {
                    (
                        raw,
                        Candidate {
                            internal_id: entity.id,
                            name: entity.name,
                            scope_id: entity.scope_id,
                            similarity_score: round2(raw),
                        },
                    )
                })
            })
            .collect();

        // stable: ties stay in fetch order
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(query.limit);

        debug!(
            kind = %kind,
            name = query.external_name,
            fetched = fetch,
            kept = scored.len(),
            "scored candidates"
        );

        Ok(scored.into_iter().map(|(_, c)| c).collect())
    }

    /// Top candidates per external name, plus the single best one
    pub fn suggest_batch(
        &self,
        kind: EntityKind,
        names: &[String],
        min_similarity: f64,
    ) -> Result<Vec<Suggestion>> {
        names
            .iter()
            .map(|name| {
                let matches = self.find_matches(
                    kind,
                    &MatchQuery {
                        external_name: name,
                        scope: None,
                        min_similarity,
                        limit: SUGGESTION_LIMIT,
                    },
                )?;
                Ok(Suggestion {
                    external_name: name.clone(),
                    best_match: matches.first().cloned(),
                    matches,
                })
            })
            .collect()
    }

    /// Distinct swimmer names still lacking an athlete reference
    pub fn unmatched_names(
        &self,
        team_code: Option<&str>,
        limit: usize,
        group_by: GroupBy,
    ) -> Result<UnmatchedReport> {
        let swimmers = self.store.unmatched_swimmers(team_code, limit)?;
        let total = swimmers.len();

        let groups = match group_by {
            GroupBy::Team => {
                let mut groups: BTreeMap<String, Vec<UnmatchedSwimmer>> = BTreeMap::new();
                for s in swimmers {
                    groups.entry(team_key(&s)).or_default().push(s);
                }
                UnmatchedGroups::Team(groups)
            }
            GroupBy::Gender => {
                let mut groups = gender_buckets();
                for s in swimmers {
                    groups.entry(s.gender).or_default().push(s);
                }
                UnmatchedGroups::Gender(groups)
            }
            GroupBy::Both => {
                let mut groups: BTreeMap<String, BTreeMap<Gender, Vec<UnmatchedSwimmer>>> =
                    BTreeMap::new();
                for s in swimmers {
                    groups
                        .entry(team_key(&s))
                        .or_insert_with(gender_buckets)
                        .entry(s.gender)
                        .or_default()
                        .push(s);
                }
                UnmatchedGroups::Both(groups)
            }
        };

        Ok(UnmatchedReport { total, group_by, groups })
    }

    /// Per team code: how many distinct swimmers still lack an athlete
    pub fn unmatched_summary(&self) -> Result<UnmatchedSummary> {
        let teams: Vec<TeamSummary> = self
            .store
            .unmatched_team_counts()?
            .into_iter()
            .map(|t| TeamSummary {
                team_code: t.team_code.unwrap_or_else(|| NO_TEAM.to_string()),
                swimmer_count: t.swimmers,
                male_count: t.male,
                female_count: t.female,
            })
            .collect();

        Ok(UnmatchedSummary {
            total_teams: teams.len(),
            total_swimmers: teams.iter().map(|t| t.swimmer_count).sum(),
            teams,
        })
    }

    /// Unmatched swimmers across every team code linked to the club.
    /// A club with no linked codes has nothing to show.
    pub fn club_unmatched(&self, club_id: &str, limit: usize) -> Result<ClubUnmatched> {
        if limit == 0 {
            return Err(ReconcileError::InvalidInput("limit must be at least 1".into()));
        }
        if self.store.get_entity(EntityKind::Club, club_id)?.is_none() {
            return Err(ReconcileError::not_found("club", club_id));
        }

        let team_codes = self.store.club_team_codes(club_id)?;
        let swimmers = self.store.unmatched_swimmers_in(&team_codes, limit)?;
        debug!(club_id, codes = team_codes.len(), swimmers = swimmers.len(), "club unmatched swimmers");

        Ok(ClubUnmatched {
            club_id: club_id.to_string(),
            team_codes,
            swimmers,
        })
    }
}

pub fn validate_similarity(min_similarity: f64) -> Result<()> {
    if (0.0..=1.0).contains(&min_similarity) {
        Ok(())
    } else {
        Err(ReconcileError::InvalidInput(format!(
            "min_similarity must be within [0, 1], got {min_similarity}"
        )))
    }
}

fn team_key(swimmer: &UnmatchedSwimmer) -> String {
    swimmer
        .team_code
        .clone()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| NO_TEAM.to_string())
}

fn gender_buckets() -> BTreeMap<Gender, Vec<UnmatchedSwimmer>> {
    BTreeMap::from([(Gender::M, Vec::new()), (Gender::F, Vec::new())])
}
