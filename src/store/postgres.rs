//! Postgres store over sqlx.
//!
//! Plain bound queries with `.persistent(false)` so the importer stays safe
//! behind PgBouncer transaction pooling. Upserts key on the slug column;
//! the extension payload merges shallowly so reimports never clobber fields
//! a pass did not write.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::import::state::{ImportState, RunSummary};
use crate::store::{
    CatalogStore, EntityKind, FieldMap, LinkKind, MoveStatRow, ResolvedEntity, StateStore,
    UpsertOutcome,
};
use crate::util::env::env_flag;

const STATE_KEY: &str = "import.state";
const LOCK_KEY: &str = "import.lock";
const LAST_RUN_KEY: &str = "import.last_run";

#[derive(Clone)]
pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let use_prepared = env_flag("USE_PREPARED", false);
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        // Ensure TLS is enabled when the DSN asks for it.
        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !use_prepared {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");

        // Auto-migrate gate (default: OFF); legacy/partial schemas must keep
        // working without surprise DDL. Enable explicitly with AUTO_MIGRATE=1.
        if env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on)");
            Self::run_migrations(&pool).await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(Self { pool })
    }

    // Lightweight migration runner: numbered `NNNN_name.sql` files under
    // ./migrations, tracked in _mondex_migrations, non-numeric names ignored.
    async fn run_migrations(pool: &PgPool) -> Result<()> {
        use std::{fs, path::Path};
        let dir = Path::new("./migrations");
        if !dir.exists() {
            return Ok(());
        }
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _mondex_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(pool)
        .await?;
        let applied_rows = sqlx::raw_sql("SELECT version FROM _mondex_migrations")
            .fetch_all(pool)
            .await?;
        let mut applied = std::collections::HashSet::new();
        for row in applied_rows {
            applied.insert(row.try_get::<i64, _>(0)?);
        }

        let mut candidates: Vec<(i64, String, std::path::PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if !fname.ends_with(".sql") {
                continue;
            }
            let num: String = fname.chars().take_while(|c| c.is_ascii_digit()).collect();
            let Ok(version) = num.parse::<i64>() else {
                continue;
            };
            let desc = fname
                .trim_start_matches(&num)
                .trim_start_matches('_')
                .trim_end_matches(".sql")
                .to_string();
            candidates.push((version, desc, path));
        }
        candidates.sort_by_key(|(v, _, _)| *v);
        for (version, desc, path) in candidates {
            if applied.contains(&version) {
                continue;
            }
            let sql = fs::read_to_string(&path)?;
            info!(version, file = ?path, "applying migration");
            sqlx::raw_sql(&sql).execute(pool).await?;
            sqlx::query("INSERT INTO _mondex_migrations(version, description) VALUES ($1, $2)")
                .persistent(false)
                .bind(version)
                .bind(&desc)
                .execute(pool)
                .await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColType {
    Text,
    Int,
    BigInt,
    Bool,
    Json,
}

/// Typed columns per entity table. Field-map keys outside this list are
/// ignored on the Postgres side rather than risking injection via dynamic
/// column names.
fn column_spec(kind: EntityKind) -> &'static [(&'static str, ColType)] {
    match kind {
        EntityKind::Creature => &[
            ("species_id", ColType::Text),
            ("form", ColType::Text),
            ("name", ColType::Text),
            ("dex_number", ColType::Int),
            ("attack", ColType::Int),
            ("defense", ColType::Int),
            ("stamina", ColType::Int),
            ("is_default_form", ColType::Bool),
            ("form_variant_id", ColType::BigInt),
            ("extension", ColType::Json),
        ],
        EntityKind::Move => &[
            ("proto_id", ColType::Text),
            ("move_id", ColType::Int),
            ("name", ColType::Text),
            ("kind", ColType::Text),
            ("extension", ColType::Json),
        ],
        EntityKind::ElementType => &[("name", ColType::Text)],
        EntityKind::FormVariant => &[
            ("name", ColType::Text),
            ("category", ColType::Text),
            ("group_tag", ColType::Text),
        ],
        EntityKind::EvolutionEdge => &[
            ("from_creature_id", ColType::BigInt),
            ("to_creature_id", ColType::BigInt),
            ("extension", ColType::Json),
        ],
    }
}

fn push_typed(qb: &mut QueryBuilder<'_, Postgres>, ty: ColType, value: &Value) {
    match ty {
        ColType::Text => {
            qb.push_bind(value.as_str().map(str::to_string));
        }
        ColType::Int => {
            qb.push_bind(value.as_i64().map(|v| v as i32));
        }
        ColType::BigInt => {
            qb.push_bind(value.as_i64());
        }
        ColType::Bool => {
            qb.push_bind(value.as_bool());
        }
        ColType::Json => {
            qb.push_bind(value.clone());
        }
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn find_or_upsert(
        &self,
        kind: EntityKind,
        natural_key: &str,
        fields: FieldMap,
    ) -> Result<UpsertOutcome> {
        let table = kind.table();
        let spec = column_spec(kind);

        let existing: Option<i64> =
            sqlx::query_scalar(&format!("SELECT id FROM {table} WHERE slug = $1"))
                .persistent(false)
                .bind(natural_key)
                .fetch_optional(&self.pool)
                .await?;

        if let Some(id) = existing {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new(format!("UPDATE {table} SET updated_at = now()"));
            for (col, ty) in spec {
                let Some(value) = fields.get(*col) else {
                    continue;
                };
                if *ty == ColType::Json {
                    // Shallow merge: present payload keys overwrite, absent
                    // keys survive, explicit null clears.
                    qb.push(format!(", {col} = COALESCE({col}, '{{}}'::jsonb) || "));
                    qb.push_bind(value.clone());
                } else {
                    qb.push(format!(", {col} = "));
                    push_typed(&mut qb, *ty, value);
                }
            }
            qb.push(" WHERE id = ");
            qb.push_bind(id);
            qb.build().persistent(false).execute(&self.pool).await?;
            return Ok(UpsertOutcome {
                id,
                was_insert: false,
            });
        }

        let present: Vec<(&str, ColType)> = spec
            .iter()
            .filter(|(col, _)| fields.contains_key(*col))
            .map(|(col, ty)| (*col, *ty))
            .collect();
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("INSERT INTO {table} (slug"));
        for (col, _) in &present {
            qb.push(format!(", {col}"));
        }
        qb.push(") VALUES (");
        qb.push_bind(natural_key.to_string());
        for (col, ty) in &present {
            qb.push(", ");
            push_typed(&mut qb, *ty, &fields[*col]);
        }
        // Conflict target keeps concurrent ticks idempotent on the slug key.
        qb.push(") ON CONFLICT (slug) DO UPDATE SET slug = EXCLUDED.slug RETURNING id");
        let id: i64 = qb
            .build_query_scalar()
            .persistent(false)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("insert into {table} failed for key {natural_key}"))?;
        Ok(UpsertOutcome {
            id,
            was_insert: true,
        })
    }

    async fn sync_links(&self, kind: LinkKind, entity_id: i64, target_ids: &[i64]) -> Result<()> {
        let (table, owner, target) = kind.table_spec();
        let mut targets: Vec<i64> = target_ids.to_vec();
        targets.sort_unstable();
        targets.dedup();

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {table} WHERE {owner} = $1"))
            .persistent(false)
            .bind(entity_id)
            .execute(&mut *tx)
            .await?;
        if !targets.is_empty() {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new(format!("INSERT INTO {table} ({owner}, {target}) "));
            qb.push_values(&targets, |mut b, id| {
                b.push_bind(entity_id).push_bind(*id);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            qb.build().persistent(false).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_move_stats(&self, move_id: i64, rows: Vec<MoveStatRow>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM move_stats WHERE move_id = $1")
            .persistent(false)
            .bind(move_id)
            .execute(&mut *tx)
            .await?;
        if !rows.is_empty() {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO move_stats (move_id, context, power, energy_delta, duration_ms, turns) ",
            );
            qb.push_values(&rows, |mut b, row| {
                b.push_bind(move_id)
                    .push_bind(row.context.as_str())
                    .push_bind(row.power)
                    .push_bind(row.energy_delta)
                    .push_bind(row.duration_ms)
                    .push_bind(row.turns);
            });
            qb.build().persistent(false).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn resolve_entity(
        &self,
        species_id: &str,
        form: Option<&str>,
    ) -> Result<Option<ResolvedEntity>> {
        let row = sqlx::query(
            "SELECT id, slug, form_variant_id FROM creatures \
             WHERE species_id = $1 AND form IS NOT DISTINCT FROM $2",
        )
        .persistent(false)
        .bind(species_id)
        .bind(form)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ResolvedEntity {
            creature_id: r.get("id"),
            slug: r.get("slug"),
            form_variant_id: r.get("form_variant_id"),
        }))
    }

    async fn resolve_move(&self, slug: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar("SELECT id FROM moves WHERE slug = $1")
            .persistent(false)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }
}

impl PgStore {
    async fn kv_get(&self, key: &str) -> Result<Option<Value>> {
        let value: Option<Value> = sqlx::query_scalar("SELECT value FROM import_kv WHERE key = $1")
            .persistent(false)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn kv_put(&self, key: &str, value: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO import_kv(key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .persistent(false)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM import_kv WHERE key = $1")
            .persistent(false)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn load_state(&self) -> Result<Option<ImportState>> {
        match self.kv_get(STATE_KEY).await? {
            None => Ok(None),
            Some(raw) => Ok(Some(
                serde_json::from_value(raw).context("corrupted persisted import state")?,
            )),
        }
    }

    async fn save_state(&self, state: &ImportState) -> Result<()> {
        self.kv_put(STATE_KEY, &serde_json::to_value(state)?).await
    }

    async fn clear_state(&self) -> Result<()> {
        self.kv_delete(STATE_KEY).await
    }

    async fn try_lock(&self, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let marker = json!({
            "acquired_at": now,
            "expires_at": now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        });
        // Single atomic statement: the conditional DO UPDATE only fires when
        // the existing marker is stale, so exactly one contender wins.
        let acquired = sqlx::query(
            "INSERT INTO import_kv(key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now() \
             WHERE (import_kv.value->>'expires_at')::timestamptz <= now() \
             RETURNING key",
        )
        .persistent(false)
        .bind(LOCK_KEY)
        .bind(&marker)
        .fetch_optional(&self.pool)
        .await?;
        Ok(acquired.is_some())
    }

    async fn unlock(&self) -> Result<()> {
        self.kv_delete(LOCK_KEY).await
    }

    async fn load_last_run(&self) -> Result<Option<RunSummary>> {
        match self.kv_get(LAST_RUN_KEY).await? {
            None => Ok(None),
            Some(raw) => Ok(Some(
                serde_json::from_value(raw).context("corrupted last-run record")?,
            )),
        }
    }

    async fn save_last_run(&self, summary: &RunSummary) -> Result<()> {
        self.kv_put(LAST_RUN_KEY, &serde_json::to_value(summary)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_engine_field_key_has_a_typed_column() {
        // Field maps built by the engine must not silently drop keys.
        for (kind, keys) in [
            (
                EntityKind::Creature,
                vec![
                    "species_id",
                    "form",
                    "name",
                    "dex_number",
                    "attack",
                    "defense",
                    "stamina",
                    "is_default_form",
                    "form_variant_id",
                    "extension",
                ],
            ),
            (EntityKind::Move, vec!["proto_id", "move_id", "name", "kind"]),
            (EntityKind::ElementType, vec!["name"]),
            (EntityKind::FormVariant, vec!["name", "category", "group_tag"]),
            (
                EntityKind::EvolutionEdge,
                vec!["from_creature_id", "to_creature_id", "extension"],
            ),
        ] {
            let spec = column_spec(kind);
            for key in keys {
                assert!(
                    spec.iter().any(|(col, _)| *col == key),
                    "{key} missing from {kind:?} column spec"
                );
            }
        }
    }

    #[test]
    fn link_tables_are_fully_specified() {
        for kind in [
            LinkKind::CreatureTypes,
            LinkKind::MoveTypes,
            LinkKind::CreatureMoves,
            LinkKind::TypeWeaknesses,
            LinkKind::TypeResistances,
        ] {
            let (table, owner, target) = kind.table_spec();
            assert!(!table.is_empty() && !owner.is_empty() && !target.is_empty());
        }
    }
}
