//! Per-phase extractors: pure functions over the parsed document.
//!
//! Every extractor returns the full ordered record list for its phase; the
//! orchestrator slices it by cursor. Records failing validation at this
//! boundary are dropped with a warning and counted as skipped — they are not
//! consumed by the cursor and never reach the upsert path.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

use crate::dump::{
    slugify, DumpDocument, FormDecl, FormListRecord, MoveRecord, SpeciesRecord, TypeChartRecord,
};
use crate::import::state::LinkStep;

pub struct Extraction<T> {
    pub records: Vec<T>,
    pub skipped: usize,
}

fn typed_records<T: DeserializeOwned>(doc: &DumpDocument, key: &str) -> Extraction<T> {
    let mut records = Vec::new();
    let mut skipped = 0usize;
    for template in &doc.templates {
        match template.typed_section::<T>(key) {
            None => {}
            Some(Ok(record)) => records.push(record),
            Some(Err(err)) => {
                warn!(template = %template.template_id, error = %err, "skipping invalid record");
                skipped += 1;
            }
        }
    }
    Extraction { records, skipped }
}

pub fn moves(doc: &DumpDocument) -> Extraction<MoveRecord> {
    let mut ex = typed_records::<MoveRecord>(doc, "move");
    retain_with_key(&mut ex, |m: &MoveRecord| !m.slug().is_empty());
    ex
}

pub fn species(doc: &DumpDocument) -> Extraction<SpeciesRecord> {
    let mut ex = typed_records::<SpeciesRecord>(doc, "species");
    retain_with_key(&mut ex, |s: &SpeciesRecord| !s.species_slug().is_empty());
    ex
}

pub fn type_chart(doc: &DumpDocument) -> Extraction<TypeChartRecord> {
    let mut ex = typed_records::<TypeChartRecord>(doc, "typeChart");
    retain_with_key(&mut ex, |t: &TypeChartRecord| !t.slug().is_empty());
    ex
}

/// Records whose natural key is empty are skipped, not counted as processed.
fn retain_with_key<T>(ex: &mut Extraction<T>, keep: impl Fn(&T) -> bool) {
    let before = ex.records.len();
    ex.records.retain(|r| keep(r));
    ex.skipped += before - ex.records.len();
}

/// Per-species form declarations, keyed by species proto id. Consulted while
/// upserting form variants during the creatures phase.
pub fn form_lists(doc: &DumpDocument) -> HashMap<String, Vec<FormDecl>> {
    let ex = typed_records::<FormListRecord>(doc, "forms");
    let mut out: HashMap<String, Vec<FormDecl>> = HashMap::new();
    for record in ex.records {
        out.entry(record.species_id).or_default().extend(record.forms);
    }
    out
}

/// One record of an evolutions-phase linking sub-step.
#[derive(Debug, Clone)]
pub enum LinkRecord {
    CreatureTypes {
        species_id: String,
        qualifier: Option<String>,
        types: Vec<String>,
    },
    MoveType {
        move_uid: String,
        move_type: String,
    },
    CreatureMoves {
        species_id: String,
        qualifier: Option<String>,
        moves: Vec<String>,
    },
    Edge {
        from_species: String,
        from_form: Option<String>,
        to_species: String,
        to_form: Option<String>,
        condition: Map<String, Value>,
    },
}

/// Ordered record list for one linking sub-step. Derived creatures reuse the
/// base record's move/type sets verbatim, so each override contributes its own
/// link rows under the derived qualifier.
pub fn link_records(doc: &DumpDocument, step: LinkStep) -> Extraction<LinkRecord> {
    match step {
        LinkStep::CreatureTypes => {
            let ex = species(doc);
            let mut records = Vec::new();
            for sp in &ex.records {
                records.push(LinkRecord::CreatureTypes {
                    species_id: sp.species_id.clone(),
                    qualifier: sp.form_slug(),
                    types: sp.types.clone(),
                });
                if sp.is_default {
                    for ov in &sp.temp_evo_overrides {
                        records.push(LinkRecord::CreatureTypes {
                            species_id: sp.species_id.clone(),
                            qualifier: Some(ov.qualifier()),
                            types: sp.types.clone(),
                        });
                    }
                }
            }
            Extraction {
                records,
                skipped: ex.skipped,
            }
        }
        LinkStep::MoveTypes => {
            let ex = moves(doc);
            let records = ex
                .records
                .iter()
                .map(|m| LinkRecord::MoveType {
                    move_uid: m.unique_id.clone(),
                    move_type: m.move_type.clone(),
                })
                .collect();
            Extraction {
                records,
                skipped: ex.skipped,
            }
        }
        LinkStep::CreatureMoves => {
            let ex = species(doc);
            let mut records = Vec::new();
            for sp in &ex.records {
                records.push(LinkRecord::CreatureMoves {
                    species_id: sp.species_id.clone(),
                    qualifier: sp.form_slug(),
                    moves: sp.all_move_ids(),
                });
                if sp.is_default {
                    for ov in &sp.temp_evo_overrides {
                        records.push(LinkRecord::CreatureMoves {
                            species_id: sp.species_id.clone(),
                            qualifier: Some(ov.qualifier()),
                            moves: sp.all_move_ids(),
                        });
                    }
                }
            }
            Extraction {
                records,
                skipped: ex.skipped,
            }
        }
        LinkStep::EvolutionEdges => {
            let ex = species(doc);
            let mut records = Vec::new();
            for sp in &ex.records {
                for branch in &sp.evolutions {
                    let mut condition = branch.extension.clone();
                    if let Some(candy) = branch.candy_cost {
                        condition.insert("candy_cost".into(), Value::from(candy));
                    }
                    if let Some(item) = &branch.item {
                        condition.insert("item".into(), Value::from(item.clone()));
                    }
                    records.push(LinkRecord::Edge {
                        from_species: sp.species_id.clone(),
                        from_form: sp.form_slug(),
                        to_species: branch.species_id.clone(),
                        to_form: branch.form.as_deref().map(slugify),
                        condition,
                    });
                }
            }
            Extraction {
                records,
                skipped: ex.skipped,
            }
        }
    }
}
