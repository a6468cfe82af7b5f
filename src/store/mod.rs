//! Storage contracts consumed by the import engine.
//!
//! The engine never issues queries itself; it speaks three narrow contracts:
//! natural-key upserts, replace-all link syncs, and a key-value state cell
//! for the phase/cursor record, the advisory lock, and the last-run summary.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::import::state::{ImportState, RunSummary};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Field set written by one upsert call. Only the keys present are written;
/// absent keys never clobber previously-populated columns or payload fields.
pub type FieldMap = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Creature,
    Move,
    ElementType,
    FormVariant,
    EvolutionEdge,
}

impl EntityKind {
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Creature => "creatures",
            EntityKind::Move => "moves",
            EntityKind::ElementType => "element_types",
            EntityKind::FormVariant => "form_variants",
            EntityKind::EvolutionEdge => "evolution_edges",
        }
    }
}

/// Many-to-many link families. All are synced with replace-all semantics:
/// a target removed from the dump disappears from storage on the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    CreatureTypes,
    MoveTypes,
    CreatureMoves,
    TypeWeaknesses,
    TypeResistances,
}

impl LinkKind {
    /// (table, owning column, target column) for the relational realization.
    pub fn table_spec(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            LinkKind::CreatureTypes => ("creature_types", "creature_id", "type_id"),
            LinkKind::MoveTypes => ("move_types", "move_id", "type_id"),
            LinkKind::CreatureMoves => ("creature_moves", "creature_id", "move_id"),
            LinkKind::TypeWeaknesses => ("type_weaknesses", "type_id", "target_type_id"),
            LinkKind::TypeResistances => ("type_resistances", "type_id", "target_type_id"),
        }
    }
}

/// Gameplay context a move stat row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameContext {
    Pve,
    Pvp,
}

impl GameContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameContext::Pve => "pve",
            GameContext::Pvp => "pvp",
        }
    }
}

/// One (move, context) performance row. The full set for a move is replaced
/// wholesale on every import so stale fields from an older dump schema cannot
/// linger.
#[derive(Debug, Clone)]
pub struct MoveStatRow {
    pub context: GameContext,
    pub power: f64,
    pub energy_delta: i32,
    pub duration_ms: Option<i64>,
    pub turns: Option<i64>,
}

/// Result of one find-or-upsert call; feeds the run counters.
#[derive(Debug, Clone, Copy)]
pub struct UpsertOutcome {
    pub id: i64,
    pub was_insert: bool,
}

/// Storage identity of a creature resolved by its dump-native key.
#[derive(Debug, Clone)]
pub struct ResolvedEntity {
    pub creature_id: i64,
    pub slug: String,
    pub form_variant_id: Option<i64>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Look up by natural key; update only the fields present in `fields`,
    /// or insert a new row. Idempotent: the same call twice yields one row.
    async fn find_or_upsert(
        &self,
        kind: EntityKind,
        natural_key: &str,
        fields: FieldMap,
    ) -> Result<UpsertOutcome>;

    /// Replace the full link set of `entity_id` for the given family.
    async fn sync_links(&self, kind: LinkKind, entity_id: i64, target_ids: &[i64]) -> Result<()>;

    /// Replace all per-context stat rows of a move.
    async fn replace_move_stats(&self, move_id: i64, rows: Vec<MoveStatRow>) -> Result<()>;

    /// Find a creature by `(species proto id, form qualifier)`. No fallback
    /// logic here; the natural-key index layers default-form fallback on top.
    async fn resolve_entity(
        &self,
        species_id: &str,
        form: Option<&str>,
    ) -> Result<Option<ResolvedEntity>>;

    /// Find a move's storage id by slug.
    async fn resolve_move(&self, slug: &str) -> Result<Option<i64>>;
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_state(&self) -> Result<Option<ImportState>>;
    async fn save_state(&self, state: &ImportState) -> Result<()>;
    async fn clear_state(&self) -> Result<()>;

    /// Set the advisory lock marker unless an unexpired one exists. Returns
    /// false when another tick is in flight; callers treat that as "skip",
    /// never as an error. An expired marker is replaced.
    async fn try_lock(&self, ttl: Duration) -> Result<bool>;

    /// Unconditionally clear the lock marker.
    async fn unlock(&self) -> Result<()>;

    async fn load_last_run(&self) -> Result<Option<RunSummary>>;
    async fn save_last_run(&self, summary: &RunSummary) -> Result<()>;
}
