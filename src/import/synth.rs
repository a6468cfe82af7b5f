//! Derived-entity synthesis.
//!
//! A creature that is its species' default form and carries temporary
//! evolution override blocks yields one additional creature row per override.
//! The derived row is computed, never present as a top-level dump record.
//! Move/type links are reused verbatim from the base record; the linking
//! sub-steps emit rows for each derived qualifier, so no link work happens
//! here. Deletion is out of scope: a vanished override leaves its derived
//! row behind.

use anyhow::Result;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::debug;

use crate::dump::{slugify, BaseStats, SpeciesRecord, TempEvoOverride};
use crate::import::index::NaturalKeyIndex;
use crate::import::state::RunCounters;
use crate::store::{CatalogStore, EntityKind, ResolvedEntity};

/// Combat-power multipliers at the standard breakpoint levels.
const BREAKPOINT_CPM: [(u8, f64); 8] = [
    (10, 0.4225),
    (20, 0.5974),
    (25, 0.667_934),
    (30, 0.7317),
    (35, 0.761_56),
    (40, 0.7903),
    (45, 0.815_29),
    (50, 0.840_29),
];

pub fn combat_power(stats: &BaseStats, cpm: f64) -> u32 {
    let raw = stats.attack as f64
        * (stats.defense as f64).sqrt()
        * (stats.stamina as f64).sqrt()
        * cpm
        * cpm
        / 10.0;
    (raw.floor() as u32).max(10)
}

/// Combat-power thresholds across the level grid, recomputed from whichever
/// stat triple the row carries.
pub fn stat_breakpoints(stats: &BaseStats) -> Value {
    let rows: Vec<Value> = BREAKPOINT_CPM
        .iter()
        .map(|(level, cpm)| {
            serde_json::json!({
                "level": level,
                "combat_power": combat_power(stats, *cpm),
            })
        })
        .collect();
    Value::Array(rows)
}

pub fn max_combat_power(stats: &BaseStats) -> u32 {
    let (_, cpm) = BREAKPOINT_CPM[BREAKPOINT_CPM.len() - 1];
    combat_power(stats, cpm)
}

/// Extension payload for a creature row: the dump's free-form block plus the
/// derived stat table. Computed keys win over identically-named dump keys.
pub fn creature_extension(stats: &BaseStats, dump_extension: &Map<String, Value>) -> Map<String, Value> {
    let mut ext = dump_extension.clone();
    ext.insert("stat_breakpoints".into(), stat_breakpoints(stats));
    ext.insert("max_combat_power".into(), Value::from(max_combat_power(stats)));
    ext
}

/// "MEGA" -> "Mega", "PRIMAL_REVERSION" -> "Primal Reversion".
fn humanize(proto: &str) -> String {
    proto
        .split(['_', '-'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn derived_name(base_name: &str, ov: &TempEvoOverride) -> String {
    match &ov.suffix {
        Some(suffix) => format!(
            "{} {} {}",
            humanize(&ov.temp_evo_id),
            base_name,
            suffix.to_ascii_uppercase()
        ),
        None => format!("{} {}", humanize(&ov.temp_evo_id), base_name),
    }
}

/// Synthesize every override of `base` into its own creature row. The
/// `synthesized` set is run-scoped (persisted in the import state): a derived
/// slug already present is skipped silently, so two raw records describing
/// the same override cannot produce the row twice within one run.
pub async fn synthesize_overrides<S: CatalogStore>(
    store: &S,
    index: &mut NaturalKeyIndex,
    base: &SpeciesRecord,
    synthesized: &mut BTreeSet<String>,
    counters: &mut RunCounters,
) -> Result<()> {
    for ov in &base.temp_evo_overrides {
        let slug = ov.derived_slug(&base.species_slug());
        if !synthesized.insert(slug.clone()) {
            debug!(slug, "derived creature already synthesized this run");
            continue;
        }
        let qualifier = ov.qualifier();

        let mut form_fields = Map::new();
        form_fields.insert("name".into(), Value::from(humanize(&ov.temp_evo_id)));
        form_fields.insert("category".into(), Value::from("temporary"));
        form_fields.insert("group_tag".into(), Value::from(slugify(&ov.temp_evo_id)));
        let form = store
            .find_or_upsert(EntityKind::FormVariant, &qualifier, form_fields)
            .await?;
        counters.forms.record(form.was_insert);

        let mut fields = Map::new();
        fields.insert("species_id".into(), Value::from(base.species_id.clone()));
        fields.insert("form".into(), Value::from(qualifier.clone()));
        fields.insert("name".into(), Value::from(derived_name(&base.name, ov)));
        fields.insert("dex_number".into(), Value::from(base.dex_number));
        fields.insert("attack".into(), Value::from(ov.stats.attack));
        fields.insert("defense".into(), Value::from(ov.stats.defense));
        fields.insert("stamina".into(), Value::from(ov.stats.stamina));
        fields.insert("is_default_form".into(), Value::from(false));
        fields.insert("form_variant_id".into(), Value::from(form.id));
        fields.insert(
            "extension".into(),
            Value::Object(creature_extension(&ov.stats, &ov.extension)),
        );
        let up = store.find_or_upsert(EntityKind::Creature, &slug, fields).await?;
        counters.derived.record(up.was_insert);

        index.register_creature(
            &base.species_id,
            Some(&qualifier),
            ResolvedEntity {
                creature_id: up.id,
                slug,
                form_variant_id: Some(form.id),
            },
        );
    }
    Ok(())
}
