//! Catalog dump loading and the typed record boundary.
//!
//! The dump is a single JSON document with a flat `templates` list. Each
//! template carries at most one typed section (`move`, `species`, `typeChart`,
//! `forms`); sections stay as raw JSON until an extractor asks for the typed
//! shape, so one malformed record never poisons the whole document.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// Parsed dump document. Re-obtained each tick; parse cost is bounded by the
/// per-run document cache in the orchestrator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpDocument {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub templates: Vec<DumpTemplate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpTemplate {
    pub template_id: String,
    #[serde(flatten)]
    pub sections: Map<String, Value>,
}

impl DumpTemplate {
    /// Typed view of one section. `None` when the template does not carry the
    /// section at all; `Some(Err(..))` when it does but fails validation.
    pub fn typed_section<T: DeserializeOwned>(&self, key: &str) -> Option<Result<T>> {
        let raw = self.sections.get(key)?;
        Some(
            serde_json::from_value(raw.clone())
                .with_context(|| format!("template {}: invalid `{key}` section", self.template_id)),
        )
    }
}

/// Load and parse the dump. A missing file or unparsable JSON is fatal for
/// the run; there is no partial-document recovery.
pub fn load_document(path: &Path) -> Result<DumpDocument> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("dump file not readable: {}", path.display()))?;
    let doc: DumpDocument = serde_json::from_str(&raw)
        .with_context(|| format!("dump file not parsable as JSON: {}", path.display()))?;
    Ok(doc)
}

/// Filesystem mtime of the dump, used for the unchanged-reimport short-circuit.
pub fn document_modified_at(path: &Path) -> Result<DateTime<Utc>> {
    let meta = fs::metadata(path)
        .with_context(|| format!("dump file not accessible: {}", path.display()))?;
    let modified = meta
        .modified()
        .with_context(|| format!("dump file has no mtime: {}", path.display()))?;
    Ok(DateTime::<Utc>::from(modified))
}

// ---------------------------------------------------------------------------
// Typed records (one per entity kind)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveKind {
    Quick,
    Charged,
}

impl MoveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveKind::Quick => "quick",
            MoveKind::Charged => "charged",
        }
    }
}

/// Per-context numeric profile for a move (PvE or PvP).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveStats {
    #[serde(default)]
    pub power: f64,
    #[serde(default)]
    pub energy_delta: i32,
    #[serde(default)]
    pub duration_ms: Option<u32>,
    #[serde(default)]
    pub turns: Option<u32>,
}

/// Section key `"move"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRecord {
    pub move_id: u32,
    pub unique_id: String,
    pub name: String,
    pub kind: MoveKind,
    #[serde(rename = "type")]
    pub move_type: String,
    #[serde(default)]
    pub pve: Option<MoveStats>,
    #[serde(default)]
    pub pvp: Option<MoveStats>,
}

impl MoveRecord {
    pub fn slug(&self) -> String {
        slugify(&self.unique_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseStats {
    pub attack: u16,
    pub defense: u16,
    pub stamina: u16,
}

/// One directed evolution branch out of a species+form.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionBranch {
    pub species_id: String,
    #[serde(default)]
    pub form: Option<String>,
    #[serde(default)]
    pub candy_cost: Option<u32>,
    #[serde(default)]
    pub item: Option<String>,
    #[serde(default)]
    pub extension: Map<String, Value>,
}

/// Embedded override block describing a temporary combat form of the species.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempEvoOverride {
    pub temp_evo_id: String,
    #[serde(default)]
    pub suffix: Option<String>,
    pub stats: BaseStats,
    #[serde(default)]
    pub extension: Map<String, Value>,
}

impl TempEvoOverride {
    /// Form qualifier the derived creature is indexed under, e.g. `mega`
    /// or `mega-x`.
    pub fn qualifier(&self) -> String {
        match &self.suffix {
            Some(suffix) => format!("{}-{}", slugify(&self.temp_evo_id), slugify(suffix)),
            None => slugify(&self.temp_evo_id),
        }
    }

    /// Derived slug: prefix + base species slug + optional suffix,
    /// e.g. `mega-charizard-x`.
    pub fn derived_slug(&self, species_slug: &str) -> String {
        match &self.suffix {
            Some(suffix) => format!(
                "{}-{}-{}",
                slugify(&self.temp_evo_id),
                species_slug,
                slugify(suffix)
            ),
            None => format!("{}-{}", slugify(&self.temp_evo_id), species_slug),
        }
    }
}

/// Section key `"species"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeciesRecord {
    pub species_id: String,
    pub dex_number: u32,
    pub name: String,
    #[serde(default)]
    pub form: Option<String>,
    #[serde(default = "default_true")]
    pub is_default: bool,
    #[serde(default)]
    pub types: Vec<String>,
    pub stats: BaseStats,
    #[serde(default)]
    pub quick_moves: Vec<String>,
    #[serde(default)]
    pub charged_moves: Vec<String>,
    #[serde(default)]
    pub evolutions: Vec<EvolutionBranch>,
    #[serde(default)]
    pub temp_evo_overrides: Vec<TempEvoOverride>,
    #[serde(default)]
    pub extension: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl SpeciesRecord {
    /// Slug of the species itself, without any form suffix.
    pub fn species_slug(&self) -> String {
        slugify(&self.species_id)
    }

    pub fn form_slug(&self) -> Option<String> {
        self.form.as_deref().map(slugify)
    }

    /// Natural key of this creature row: species slug plus optional form
    /// suffix. The only stable join key across repeated imports.
    pub fn slug(&self) -> String {
        match self.form_slug() {
            Some(form) => format!("{}-{}", self.species_slug(), form),
            None => self.species_slug(),
        }
    }

    pub fn all_move_ids(&self) -> Vec<String> {
        let mut out = self.quick_moves.clone();
        out.extend(self.charged_moves.iter().cloned());
        out
    }
}

/// Section key `"typeChart"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeChartRecord {
    #[serde(rename = "type")]
    pub type_id: String,
    pub name: String,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub resistances: Vec<String>,
}

impl TypeChartRecord {
    pub fn slug(&self) -> String {
        slugify(&self.type_id)
    }
}

/// Section key `"forms"`: per-species list of known shape descriptors.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormListRecord {
    pub species_id: String,
    #[serde(default)]
    pub forms: Vec<FormDecl>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormDecl {
    pub form: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

impl FormDecl {
    pub fn slug(&self) -> String {
        slugify(&self.form)
    }
}

/// Lowercase, alnum-and-dash slug. Underscores and any other separators
/// collapse into single dashes.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_dash = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("VINE_WHIP"), "vine-whip");
        assert_eq!(slugify("MEGA_X"), "mega-x");
        assert_eq!(slugify("  Mr. Mime  "), "mr-mime");
        assert_eq!(slugify("VENUSAUR"), "venusaur");
    }

    #[test]
    fn parses_document_with_mixed_sections() {
        let raw = serde_json::json!({
            "version": "2026.08.01",
            "templates": [
                {"templateId": "MOVE_V0013", "move": {
                    "moveId": 13, "uniqueId": "WRAP", "name": "Wrap",
                    "kind": "charged", "type": "normal",
                    "pve": {"power": 60.0, "energyDelta": -33, "durationMs": 2900},
                    "pvp": {"power": 60.0, "energyDelta": -45}
                }},
                {"templateId": "SPECIES_V0003", "species": {
                    "speciesId": "VENUSAUR", "dexNumber": 3, "name": "Venusaur",
                    "types": ["grass", "poison"],
                    "stats": {"attack": 198, "defense": 189, "stamina": 190}
                }},
                {"templateId": "NOISE", "somethingElse": {"a": 1}}
            ]
        });
        let doc: DumpDocument = serde_json::from_value(raw).unwrap();
        assert_eq!(doc.templates.len(), 3);

        let mv: MoveRecord = doc.templates[0]
            .typed_section("move")
            .unwrap()
            .unwrap();
        assert_eq!(mv.slug(), "wrap");
        assert_eq!(mv.kind, MoveKind::Charged);
        assert_eq!(mv.pve.as_ref().unwrap().duration_ms, Some(2900));

        let sp: SpeciesRecord = doc.templates[1]
            .typed_section("species")
            .unwrap()
            .unwrap();
        assert_eq!(sp.slug(), "venusaur");
        assert!(sp.is_default);
        assert!(doc.templates[2].typed_section::<MoveRecord>("move").is_none());
    }

    #[test]
    fn malformed_section_is_an_error_not_a_panic() {
        let raw = serde_json::json!({
            "templates": [
                {"templateId": "BAD_MOVE", "move": {"name": "No Ids Here"}}
            ]
        });
        let doc: DumpDocument = serde_json::from_value(raw).unwrap();
        let parsed = doc.templates[0].typed_section::<MoveRecord>("move").unwrap();
        assert!(parsed.is_err());
    }

    #[test]
    fn derived_slug_and_qualifier_composition() {
        let ov = TempEvoOverride {
            temp_evo_id: "MEGA".into(),
            suffix: Some("X".into()),
            stats: BaseStats { attack: 1, defense: 2, stamina: 3 },
            extension: Default::default(),
        };
        assert_eq!(ov.qualifier(), "mega-x");
        assert_eq!(ov.derived_slug("charizard"), "mega-charizard-x");

        let plain = TempEvoOverride {
            temp_evo_id: "MEGA".into(),
            suffix: None,
            stats: BaseStats { attack: 1, defense: 2, stamina: 3 },
            extension: Default::default(),
        };
        assert_eq!(plain.derived_slug("venusaur"), "mega-venusaur");
    }

    #[test]
    fn load_document_missing_file_is_fatal() {
        let err = load_document(Path::new("/nonexistent/dump.json")).unwrap_err();
        assert!(err.to_string().contains("not readable"));
    }

    #[test]
    fn load_document_reads_from_disk() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{}", serde_json::json!({"templates": []})).unwrap();
        let doc = load_document(f.path()).unwrap();
        assert!(doc.templates.is_empty());
        assert!(document_modified_at(f.path()).is_ok());
    }
}
