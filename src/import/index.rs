//! Run-scoped natural-key index.
//!
//! Maps the dump's native identifiers (species proto id + optional form
//! qualifier, move proto id) to the storage ids assigned during this run.
//! Ticks are not pinned to one process, so the map is only a memo: a miss
//! falls back to the store's resolve contracts and caches the answer either
//! way. Misses against the exact form fall back to the species' default-form
//! entry; a full miss is "unresolved" and the caller skips the record.

use anyhow::Result;
use std::collections::HashMap;

use crate::dump::slugify;
use crate::store::{CatalogStore, ResolvedEntity};

#[derive(Default)]
pub struct NaturalKeyIndex {
    creatures: HashMap<(String, Option<String>), Option<ResolvedEntity>>,
    moves: HashMap<String, Option<i64>>,
}

impl NaturalKeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.creatures.clear();
        self.moves.clear();
    }

    /// Record a creature written during the creatures phase (including
    /// synthesized derived entries).
    pub fn register_creature(
        &mut self,
        species_id: &str,
        qualifier: Option<&str>,
        entity: ResolvedEntity,
    ) {
        self.creatures.insert(
            (species_id.to_string(), qualifier.map(str::to_string)),
            Some(entity),
        );
    }

    pub fn register_move(&mut self, slug: &str, move_id: i64) {
        self.moves.insert(slug.to_string(), Some(move_id));
    }

    /// Resolve `(species, form qualifier)` with default-form fallback.
    pub async fn resolve_creature<S: CatalogStore>(
        &mut self,
        store: &S,
        species_id: &str,
        qualifier: Option<&str>,
    ) -> Result<Option<ResolvedEntity>> {
        if let Some(hit) = self.lookup_exact(store, species_id, qualifier).await? {
            return Ok(Some(hit));
        }
        if qualifier.is_some() {
            // Exact form unknown: fall back to the species' default form.
            return self.lookup_exact(store, species_id, None).await;
        }
        Ok(None)
    }

    async fn lookup_exact<S: CatalogStore>(
        &mut self,
        store: &S,
        species_id: &str,
        qualifier: Option<&str>,
    ) -> Result<Option<ResolvedEntity>> {
        let key = (species_id.to_string(), qualifier.map(str::to_string));
        if let Some(cached) = self.creatures.get(&key) {
            return Ok(cached.clone());
        }
        let resolved = store.resolve_entity(species_id, qualifier).await?;
        self.creatures.insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Resolve a move by its dump proto id (slugified for the lookup).
    pub async fn resolve_move<S: CatalogStore>(
        &mut self,
        store: &S,
        move_uid: &str,
    ) -> Result<Option<i64>> {
        let slug = slugify(move_uid);
        if let Some(cached) = self.moves.get(&slug) {
            return Ok(*cached);
        }
        let resolved = store.resolve_move(&slug).await?;
        self.moves.insert(slug, resolved);
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntityKind, MemoryStore};
    use serde_json::json;

    fn fields(v: serde_json::Value) -> crate::store::FieldMap {
        v.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn registered_entries_resolve_without_store_hits() {
        let store = MemoryStore::new();
        let mut index = NaturalKeyIndex::new();
        index.register_creature(
            "VENUSAUR",
            None,
            ResolvedEntity {
                creature_id: 11,
                slug: "venusaur".into(),
                form_variant_id: None,
            },
        );
        let hit = index
            .resolve_creature(&store, "VENUSAUR", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.creature_id, 11);
    }

    #[tokio::test]
    async fn store_fallback_populates_the_memo() {
        let store = MemoryStore::new();
        store
            .find_or_upsert(
                EntityKind::Creature,
                "rattata-alola",
                fields(json!({"species_id": "RATTATA", "form": "alola"})),
            )
            .await
            .unwrap();
        let mut index = NaturalKeyIndex::new();
        let hit = index
            .resolve_creature(&store, "RATTATA", Some("alola"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.slug, "rattata-alola");
        // Second resolve is served from the memo (same answer).
        let again = index
            .resolve_creature(&store, "RATTATA", Some("alola"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.creature_id, hit.creature_id);
    }

    #[tokio::test]
    async fn unknown_form_falls_back_to_default_entry() {
        let store = MemoryStore::new();
        store
            .find_or_upsert(
                EntityKind::Creature,
                "eevee",
                fields(json!({"species_id": "EEVEE", "form": null})),
            )
            .await
            .unwrap();
        let mut index = NaturalKeyIndex::new();
        let hit = index
            .resolve_creature(&store, "EEVEE", Some("flower-crown"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.slug, "eevee");
    }

    #[tokio::test]
    async fn full_miss_is_unresolved_not_an_error() {
        let store = MemoryStore::new();
        let mut index = NaturalKeyIndex::new();
        assert!(index
            .resolve_creature(&store, "MISSINGNO", Some("mega"))
            .await
            .unwrap()
            .is_none());
        assert!(index.resolve_move(&store, "UNKNOWN_MOVE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn move_lookup_slugifies_the_proto_id() {
        let store = MemoryStore::new();
        store
            .find_or_upsert(EntityKind::Move, "vine-whip", fields(json!({})))
            .await
            .unwrap();
        let mut index = NaturalKeyIndex::new();
        let id = index.resolve_move(&store, "VINE_WHIP").await.unwrap();
        assert!(id.is_some());
    }
}
