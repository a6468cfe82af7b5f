//! Persisted engine state: phase, cursors, counters, error log, progress.
//!
//! Everything that must survive between ticks lives here and round-trips
//! through the state store as one JSON value. Ticks may land on different
//! processes, so nothing import-critical is held only in memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Hard cap on the persisted error log; oldest entries are dropped first.
const MAX_ERROR_ENTRIES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPhase {
    Bootstrap,
    Moves,
    Creatures,
    Evolutions,
    Types,
    Finalize,
}

impl ImportPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportPhase::Bootstrap => "bootstrap",
            ImportPhase::Moves => "moves",
            ImportPhase::Creatures => "creatures",
            ImportPhase::Evolutions => "evolutions",
            ImportPhase::Types => "types",
            ImportPhase::Finalize => "finalize",
        }
    }

    /// Successor in the fixed phase order; `None` past `finalize`.
    pub fn next(&self) -> Option<ImportPhase> {
        match self {
            ImportPhase::Bootstrap => Some(ImportPhase::Moves),
            ImportPhase::Moves => Some(ImportPhase::Creatures),
            ImportPhase::Creatures => Some(ImportPhase::Evolutions),
            ImportPhase::Evolutions => Some(ImportPhase::Types),
            ImportPhase::Types => Some(ImportPhase::Finalize),
            ImportPhase::Finalize => None,
        }
    }
}

impl std::fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Error,
}

/// Ordered linking sub-steps of the evolutions phase. Each runs over its own
/// record list with the shared `cursors.links` sub-cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkStep {
    CreatureTypes,
    MoveTypes,
    CreatureMoves,
    EvolutionEdges,
}

impl LinkStep {
    pub const ALL: [LinkStep; 4] = [
        LinkStep::CreatureTypes,
        LinkStep::MoveTypes,
        LinkStep::CreatureMoves,
        LinkStep::EvolutionEdges,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStep::CreatureTypes => "creature-types",
            LinkStep::MoveTypes => "move-types",
            LinkStep::CreatureMoves => "creature-moves",
            LinkStep::EvolutionEdges => "evolution-edges",
        }
    }
}

/// Forward-only offsets, one per batch phase, plus the evolutions sub-step
/// pointer. `links` resets to zero each time `link_step` advances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseCursors {
    pub moves: usize,
    pub creatures: usize,
    pub link_step: usize,
    pub links: usize,
    pub types: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EntityCounts {
    pub inserted: u64,
    pub updated: u64,
}

impl EntityCounts {
    pub fn record(&mut self, was_insert: bool) {
        if was_insert {
            self.inserted += 1;
        } else {
            self.updated += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub moves: EntityCounts,
    pub creatures: EntityCounts,
    pub derived: EntityCounts,
    pub forms: EntityCounts,
    pub types: EntityCounts,
    pub edges_linked: u64,
    pub edges_skipped: u64,
    pub links_synced: u64,
    /// Invalid records dropped at the validation boundary, keyed by phase or
    /// sub-step label. Assigned per tick, never accumulated, so re-extraction
    /// on later ticks stays idempotent.
    pub records_skipped: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub phase: String,
    pub message: String,
}

/// Externally visible progress marker. Percent never decreases during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMark {
    pub phase: String,
    pub percent: u8,
}

impl ProgressMark {
    pub fn advance(&mut self, phase: ImportPhase, percent: u8) {
        self.phase = phase.as_str().to_string();
        if percent > self.percent {
            self.percent = percent;
        }
    }
}

impl Default for ProgressMark {
    fn default() -> Self {
        Self {
            phase: ImportPhase::Bootstrap.as_str().to_string(),
            percent: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportState {
    pub document_path: String,
    pub force: bool,
    pub phase: ImportPhase,
    pub status: RunStatus,
    pub cursors: PhaseCursors,
    /// Derived slugs already synthesized this run. Persisted so resumption on
    /// another process cannot synthesize the same derived creature twice.
    pub synthesized: BTreeSet<String>,
    pub counters: RunCounters,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub doc_modified_at: Option<DateTime<Utc>>,
    pub errors: Vec<ErrorEntry>,
    pub progress: ProgressMark,
}

impl ImportState {
    pub fn new(document_path: &str, force: bool, doc_modified_at: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        Self {
            document_path: document_path.to_string(),
            force,
            phase: ImportPhase::Bootstrap,
            status: RunStatus::Queued,
            cursors: PhaseCursors::default(),
            synthesized: BTreeSet::new(),
            counters: RunCounters::default(),
            started_at: now,
            updated_at: now,
            doc_modified_at,
            errors: Vec::new(),
            progress: ProgressMark::default(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(ErrorEntry {
            at: Utc::now(),
            phase: self.phase.as_str().to_string(),
            message: message.into(),
        });
        if self.errors.len() > MAX_ERROR_ENTRIES {
            let overflow = self.errors.len() - MAX_ERROR_ENTRIES;
            self.errors.drain(..overflow);
        }
        self.status = RunStatus::Error;
        self.touch();
    }

    pub fn latest_error(&self) -> Option<&ErrorEntry> {
        self.errors.last()
    }
}

/// Durable record of the last completed run; outlives the cleared phase state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub document_path: String,
    pub doc_modified_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counters: RunCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_json() {
        let mut state = ImportState::new("/tmp/dump.json", false, None);
        state.phase = ImportPhase::Evolutions;
        state.status = RunStatus::Running;
        state.cursors.link_step = 2;
        state.cursors.links = 17;
        state.synthesized.insert("mega-venusaur".into());
        state.counters.creatures.record(true);
        state.counters.records_skipped.insert("moves".into(), 3);
        state.progress.advance(ImportPhase::Evolutions, 72);

        let raw = serde_json::to_value(&state).unwrap();
        assert_eq!(raw["phase"], "evolutions");
        let back: ImportState = serde_json::from_value(raw).unwrap();
        assert_eq!(back.cursors.links, 17);
        assert!(back.synthesized.contains("mega-venusaur"));
        assert_eq!(back.counters.creatures.inserted, 1);
        assert_eq!(back.progress.percent, 72);
    }

    #[test]
    fn unknown_phase_value_fails_deserialization() {
        let mut raw = serde_json::to_value(ImportState::new("/tmp/d.json", false, None)).unwrap();
        raw["phase"] = serde_json::json!("reticulating");
        assert!(serde_json::from_value::<ImportState>(raw).is_err());
    }

    #[test]
    fn progress_is_monotone() {
        let mut mark = ProgressMark::default();
        mark.advance(ImportPhase::Moves, 10);
        mark.advance(ImportPhase::Moves, 8);
        assert_eq!(mark.percent, 10);
        mark.advance(ImportPhase::Creatures, 25);
        assert_eq!(mark.percent, 25);
    }

    #[test]
    fn error_log_is_bounded_and_sets_error_status() {
        let mut state = ImportState::new("/tmp/d.json", false, None);
        for i in 0..(MAX_ERROR_ENTRIES + 10) {
            state.record_error(format!("boom {i}"));
        }
        assert_eq!(state.errors.len(), MAX_ERROR_ENTRIES);
        assert_eq!(state.status, RunStatus::Error);
        assert!(state.latest_error().unwrap().message.ends_with("59"));
    }

    #[test]
    fn phase_order_is_fixed() {
        let mut phase = ImportPhase::Bootstrap;
        let mut seen = vec![phase.as_str()];
        while let Some(next) = phase.next() {
            phase = next;
            seen.push(phase.as_str());
        }
        assert_eq!(
            seen,
            vec!["bootstrap", "moves", "creatures", "evolutions", "types", "finalize"]
        );
    }
}
