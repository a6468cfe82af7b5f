//! In-memory store: test double for Postgres and the `--memory` dry-run
//! backend. Same contracts, same field-preservation semantics, no SQL.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::import::state::{ImportState, RunSummary};
use crate::store::{
    CatalogStore, EntityKind, FieldMap, LinkKind, MoveStatRow, ResolvedEntity, StateStore,
    UpsertOutcome,
};

#[derive(Debug, Clone)]
pub struct StoredRow {
    pub id: i64,
    pub natural_key: String,
    pub fields: FieldMap,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    tables: HashMap<EntityKind, Vec<StoredRow>>,
    links: HashMap<(LinkKind, i64), Vec<i64>>,
    move_stats: HashMap<i64, Vec<MoveStatRow>>,
    // Raw JSON cell so tests can inject corrupted state the way a bad writer
    // could in the real key-value table.
    state: Option<Value>,
    lock_expires_at: Option<DateTime<Utc>>,
    last_run: Option<RunSummary>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shallow field merge: present keys overwrite, the extension payload
    /// merges key-by-key so an absent sub-field survives and an explicit null
    /// clears. Mirrors `payload || excluded.payload` on the Postgres side.
    fn apply_fields(existing: &mut FieldMap, incoming: FieldMap) {
        for (key, value) in incoming {
            if key == "extension" {
                let target = existing
                    .entry("extension")
                    .or_insert_with(|| Value::Object(Default::default()));
                if let (Value::Object(target), Value::Object(incoming)) = (target, value) {
                    for (k, v) in incoming {
                        target.insert(k, v);
                    }
                }
            } else {
                existing.insert(key, value);
            }
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn find_or_upsert(
        &self,
        kind: EntityKind,
        natural_key: &str,
        fields: FieldMap,
    ) -> Result<UpsertOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let table = inner.tables.entry(kind).or_default();
        if let Some(row) = table.iter_mut().find(|r| r.natural_key == natural_key) {
            let id = row.id;
            Self::apply_fields(&mut row.fields, fields);
            return Ok(UpsertOutcome {
                id,
                was_insert: false,
            });
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.tables.entry(kind).or_default().push(StoredRow {
            id,
            natural_key: natural_key.to_string(),
            fields,
        });
        Ok(UpsertOutcome {
            id,
            was_insert: true,
        })
    }

    async fn sync_links(&self, kind: LinkKind, entity_id: i64, target_ids: &[i64]) -> Result<()> {
        let mut targets: Vec<i64> = target_ids.to_vec();
        targets.sort_unstable();
        targets.dedup();
        let mut inner = self.inner.lock().unwrap();
        inner.links.insert((kind, entity_id), targets);
        Ok(())
    }

    async fn replace_move_stats(&self, move_id: i64, rows: Vec<MoveStatRow>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.move_stats.insert(move_id, rows);
        Ok(())
    }

    async fn resolve_entity(
        &self,
        species_id: &str,
        form: Option<&str>,
    ) -> Result<Option<ResolvedEntity>> {
        let inner = self.inner.lock().unwrap();
        let Some(table) = inner.tables.get(&EntityKind::Creature) else {
            return Ok(None);
        };
        let hit = table.iter().find(|row| {
            let row_species = row.fields.get("species_id").and_then(Value::as_str);
            let row_form = row.fields.get("form").and_then(Value::as_str);
            row_species == Some(species_id) && row_form == form
        });
        Ok(hit.map(|row| ResolvedEntity {
            creature_id: row.id,
            slug: row.natural_key.clone(),
            form_variant_id: row.fields.get("form_variant_id").and_then(Value::as_i64),
        }))
    }

    async fn resolve_move(&self, slug: &str) -> Result<Option<i64>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tables
            .get(&EntityKind::Move)
            .and_then(|t| t.iter().find(|r| r.natural_key == slug))
            .map(|r| r.id))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_state(&self) -> Result<Option<ImportState>> {
        let inner = self.inner.lock().unwrap();
        match &inner.state {
            None => Ok(None),
            Some(raw) => {
                let state = serde_json::from_value(raw.clone())
                    .context("corrupted persisted import state")?;
                Ok(Some(state))
            }
        }
    }

    async fn save_state(&self, state: &ImportState) -> Result<()> {
        let raw = serde_json::to_value(state)?;
        self.inner.lock().unwrap().state = Some(raw);
        Ok(())
    }

    async fn clear_state(&self) -> Result<()> {
        self.inner.lock().unwrap().state = None;
        Ok(())
    }

    async fn try_lock(&self, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        if let Some(expires_at) = inner.lock_expires_at {
            if expires_at > now {
                return Ok(false);
            }
        }
        inner.lock_expires_at =
            Some(now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero()));
        Ok(true)
    }

    async fn unlock(&self) -> Result<()> {
        self.inner.lock().unwrap().lock_expires_at = None;
        Ok(())
    }

    async fn load_last_run(&self) -> Result<Option<RunSummary>> {
        Ok(self.inner.lock().unwrap().last_run.clone())
    }

    async fn save_last_run(&self, summary: &RunSummary) -> Result<()> {
        self.inner.lock().unwrap().last_run = Some(summary.clone());
        Ok(())
    }
}

#[cfg(test)]
impl MemoryStore {
    pub fn rows(&self, kind: EntityKind) -> Vec<StoredRow> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row_by_key(&self, kind: EntityKind, natural_key: &str) -> Option<StoredRow> {
        self.rows(kind)
            .into_iter()
            .find(|r| r.natural_key == natural_key)
    }

    pub fn links_of(&self, kind: LinkKind, entity_id: i64) -> Vec<i64> {
        self.inner
            .lock()
            .unwrap()
            .links
            .get(&(kind, entity_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn move_stats_of(&self, move_id: i64) -> Vec<MoveStatRow> {
        self.inner
            .lock()
            .unwrap()
            .move_stats
            .get(&move_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn inject_raw_state(&self, raw: Value) {
        self.inner.lock().unwrap().state = Some(raw);
    }
}
