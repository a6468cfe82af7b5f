//! Phase orchestrator: the tick state machine.
//!
//! One tick = lock, load state, run one bounded batch of the current phase,
//! persist, unlock, maybe re-enqueue. Ticks carry no memory of each other
//! beyond the persisted state record and may land on different processes.

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::dump::{self, slugify, DumpDocument, FormDecl, MoveRecord, SpeciesRecord, TypeChartRecord};
use crate::import::extract::{self, LinkRecord};
use crate::import::index::NaturalKeyIndex;
use crate::import::lock::{LockManager, DEFAULT_LOCK_TTL};
use crate::import::progress;
use crate::import::scheduler::{Scheduler, TICK_JOB_ID};
use crate::import::state::{
    ImportPhase, ImportState, LinkStep, PhaseCursors, RunCounters, RunStatus,
};
use crate::import::synth;
use crate::store::{CatalogStore, EntityKind, GameContext, LinkKind, MoveStatRow, StateStore};

pub const DEFAULT_BATCH_SIZE: usize = 250;
pub const DEFAULT_TICK_BUDGET: Duration = Duration::from_secs(10);
pub const DEFAULT_TICK_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max records consumed per tick.
    pub batch_size: usize,
    /// Soft wall-clock budget per tick, checked between records only.
    pub tick_budget: Duration,
    /// Advisory lock TTL; bounds a crashed holder.
    pub lock_ttl: Duration,
    /// Delay requested when re-enqueueing the next tick.
    pub tick_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            tick_budget: DEFAULT_TICK_BUDGET,
            lock_ttl: DEFAULT_LOCK_TTL,
            tick_delay: DEFAULT_TICK_DELAY,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        use crate::util::env::env_parse;
        Self {
            batch_size: env_parse("IMPORT_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            tick_budget: Duration::from_millis(env_parse(
                "IMPORT_TICK_BUDGET_MS",
                DEFAULT_TICK_BUDGET.as_millis() as u64,
            )),
            lock_ttl: Duration::from_secs(env_parse(
                "IMPORT_LOCK_TTL_SECS",
                DEFAULT_LOCK_TTL.as_secs(),
            )),
            tick_delay: Duration::from_millis(env_parse(
                "IMPORT_TICK_DELAY_MS",
                DEFAULT_TICK_DELAY.as_millis() as u64,
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Batch done, more work left; a follow-up tick was enqueued.
    Continue,
    /// Run finalized; phase state cleared, last-run record written.
    Finished,
    /// Advisory lock held by another tick; nothing was touched.
    Locked,
    /// No persisted state; nothing to do.
    Idle,
    /// Run is in (or entered) terminal error state; a fresh start() is needed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Document unchanged since the last completed run and `force` not set.
    Unchanged,
    AlreadyRunning,
}

/// Poll-safe status triple for an external progress surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: String,
    pub phase: Option<String>,
    pub percent: u8,
    pub message: String,
}

enum PhaseOutcome {
    Continue,
    Finished,
}

struct CachedDoc {
    path: PathBuf,
    modified_at: chrono::DateTime<Utc>,
    doc: Arc<DumpDocument>,
}

pub struct ImportEngine<S> {
    store: Arc<S>,
    scheduler: Arc<dyn Scheduler>,
    config: EngineConfig,
    lock: LockManager<S>,
    /// Run-scoped memo; correctness never depends on it surviving a process
    /// switch (the index falls back to the store on miss).
    index: Mutex<NaturalKeyIndex>,
    /// Parsed-document cache keyed by (path, mtime), per run.
    doc_cache: Mutex<Option<CachedDoc>>,
}

impl<S> ImportEngine<S>
where
    S: CatalogStore + StateStore + 'static,
{
    pub fn new(store: Arc<S>, scheduler: Arc<dyn Scheduler>, config: EngineConfig) -> Self {
        let lock = LockManager::new(store.clone(), config.lock_ttl);
        Self {
            store,
            scheduler,
            config,
            lock,
            index: Mutex::new(NaturalKeyIndex::new()),
            doc_cache: Mutex::new(None),
        }
    }

    /// Queue a fresh import of `path`. Returns immediately; ticks do the work.
    #[instrument(skip(self))]
    pub async fn start(&self, path: &str, force: bool) -> Result<StartOutcome> {
        if path.trim().is_empty() {
            bail!("document path must not be empty");
        }
        // Probe the advisory lock: a held lock means a tick is mid-flight and
        // clobbering its state would corrupt the run.
        if !self.lock.acquire().await? {
            info!("another import tick is in flight; not starting");
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.lock.release().await?;

        let modified_at = dump::document_modified_at(Path::new(path)).ok();
        if !force {
            if let Some(last) = self.store.load_last_run().await? {
                if last.document_path == path
                    && modified_at.is_some()
                    && last.doc_modified_at == modified_at
                {
                    info!(path, "document unchanged since last run; skipping (set force to reimport)");
                    return Ok(StartOutcome::Unchanged);
                }
            }
        }

        self.index.lock().await.clear();
        *self.doc_cache.lock().await = None;
        let state = ImportState::new(path, force, modified_at);
        self.store.save_state(&state).await?;
        self.scheduler
            .enqueue(TICK_JOB_ID, json!({"path": path}), Duration::ZERO)
            .await?;
        info!(path, force, "import queued");
        Ok(StartOutcome::Started)
    }

    /// One bounded unit of work. Safe against concurrent invocation: the
    /// second caller gets `Locked` and touches nothing.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickOutcome> {
        if !self.lock.acquire().await? {
            debug!("advisory lock held; skipping tick");
            return Ok(TickOutcome::Locked);
        }
        let result = self.tick_locked().await;
        // Release on every path, success or failure, before surfacing.
        let released = self.lock.release().await;
        let outcome = result?;
        released?;
        if outcome == TickOutcome::Continue {
            self.scheduler
                .enqueue(TICK_JOB_ID, json!({}), self.config.tick_delay)
                .await?;
        }
        Ok(outcome)
    }

    async fn tick_locked(&self) -> Result<TickOutcome> {
        let state = match self.store.load_state().await {
            Ok(state) => state,
            Err(err) => {
                // Corrupted persisted state (e.g. unknown phase). Never
                // silently recovered; a fresh start() must overwrite it.
                error!(error = format!("{err:#}"), "persisted state unreadable; refusing to tick");
                return Ok(TickOutcome::Failed);
            }
        };
        let Some(mut state) = state else {
            debug!("no import state; nothing to do");
            return Ok(TickOutcome::Idle);
        };
        if state.status == RunStatus::Error {
            debug!("previous run ended in error; a fresh start() is required");
            return Ok(TickOutcome::Failed);
        }
        state.status = RunStatus::Running;
        let phase = state.phase;
        match self.run_phase(&mut state).await {
            Ok(PhaseOutcome::Continue) => {
                state.touch();
                self.store.save_state(&state).await?;
                Ok(TickOutcome::Continue)
            }
            // Finalize already wrote the last-run record and cleared state.
            Ok(PhaseOutcome::Finished) => Ok(TickOutcome::Finished),
            Err(err) => {
                warn!(phase = %phase, error = format!("{err:#}"), "tick failed");
                state.record_error(format!("{err:#}"));
                self.store.save_state(&state).await?;
                Ok(TickOutcome::Failed)
            }
        }
    }

    async fn run_phase(&self, state: &mut ImportState) -> Result<PhaseOutcome> {
        match state.phase {
            ImportPhase::Bootstrap => self.run_bootstrap(state).await,
            ImportPhase::Moves => self.run_moves(state).await,
            ImportPhase::Creatures => self.run_creatures(state).await,
            ImportPhase::Evolutions => self.run_evolutions(state).await,
            ImportPhase::Types => self.run_types(state).await,
            ImportPhase::Finalize => self.run_finalize(state).await,
        }
    }

    async fn run_bootstrap(&self, state: &mut ImportState) -> Result<PhaseOutcome> {
        let doc = self.obtain_document(&state.document_path).await?;
        state.doc_modified_at = dump::document_modified_at(Path::new(&state.document_path)).ok();
        info!(
            templates = doc.templates.len(),
            version = ?doc.version,
            "dump loaded and validated"
        );
        state.cursors = PhaseCursors::default();
        state.synthesized.clear();
        state.phase = ImportPhase::Moves;
        state
            .progress
            .advance(ImportPhase::Bootstrap, progress::band(ImportPhase::Bootstrap).1);
        Ok(PhaseOutcome::Continue)
    }

    async fn run_moves(&self, state: &mut ImportState) -> Result<PhaseOutcome> {
        let doc = self.obtain_document(&state.document_path).await?;
        let ex = extract::moves(&doc);
        state
            .counters
            .records_skipped
            .insert("moves".into(), ex.skipped as u64);
        let total = ex.records.len();
        let base = state.cursors.moves;
        let deadline = Instant::now() + self.config.tick_budget;
        let mut done = 0usize;
        while base + done < total && done < self.config.batch_size {
            if done > 0 && Instant::now() >= deadline {
                break;
            }
            self.apply_move(&ex.records[base + done], &mut state.counters)
                .await?;
            done += 1;
        }
        state.cursors.moves = base + done;
        state.progress.advance(
            ImportPhase::Moves,
            progress::phase_percent(ImportPhase::Moves, base + done, total),
        );
        if base + done >= total {
            info!(processed = total, "moves phase complete");
            state.phase = ImportPhase::Creatures;
        }
        Ok(PhaseOutcome::Continue)
    }

    async fn run_creatures(&self, state: &mut ImportState) -> Result<PhaseOutcome> {
        let doc = self.obtain_document(&state.document_path).await?;
        let ex = extract::species(&doc);
        let form_decls = extract::form_lists(&doc);
        state
            .counters
            .records_skipped
            .insert("creatures".into(), ex.skipped as u64);
        let total = ex.records.len();
        let base = state.cursors.creatures;
        let deadline = Instant::now() + self.config.tick_budget;
        let mut done = 0usize;
        while base + done < total && done < self.config.batch_size {
            if done > 0 && Instant::now() >= deadline {
                break;
            }
            let ImportState {
                counters,
                synthesized,
                ..
            } = state;
            self.apply_species(&ex.records[base + done], &form_decls, counters, synthesized)
                .await?;
            done += 1;
        }
        state.cursors.creatures = base + done;
        state.progress.advance(
            ImportPhase::Creatures,
            progress::phase_percent(ImportPhase::Creatures, base + done, total),
        );
        if base + done >= total {
            info!(processed = total, "creatures phase complete");
            state.phase = ImportPhase::Evolutions;
        }
        Ok(PhaseOutcome::Continue)
    }

    async fn run_evolutions(&self, state: &mut ImportState) -> Result<PhaseOutcome> {
        let steps = LinkStep::ALL;
        if state.cursors.link_step >= steps.len() {
            state.phase = ImportPhase::Types;
            return Ok(PhaseOutcome::Continue);
        }
        let step = steps[state.cursors.link_step];
        let doc = self.obtain_document(&state.document_path).await?;
        let ex = extract::link_records(&doc, step);
        state
            .counters
            .records_skipped
            .insert(step.as_str().to_string(), ex.skipped as u64);
        let total = ex.records.len();
        let base = state.cursors.links;
        let deadline = Instant::now() + self.config.tick_budget;
        let mut done = 0usize;
        while base + done < total && done < self.config.batch_size {
            if done > 0 && Instant::now() >= deadline {
                break;
            }
            self.apply_link(&ex.records[base + done], &mut state.counters)
                .await?;
            done += 1;
        }
        state.cursors.links = base + done;
        state.progress.advance(
            ImportPhase::Evolutions,
            progress::substep_percent(state.cursors.link_step, steps.len(), base + done, total),
        );
        if base + done >= total {
            info!(step = step.as_str(), processed = total, "linking sub-step complete");
            state.cursors.link_step += 1;
            state.cursors.links = 0;
            if state.cursors.link_step >= steps.len() {
                state.phase = ImportPhase::Types;
            }
        }
        Ok(PhaseOutcome::Continue)
    }

    async fn run_types(&self, state: &mut ImportState) -> Result<PhaseOutcome> {
        let doc = self.obtain_document(&state.document_path).await?;
        let ex = extract::type_chart(&doc);
        state
            .counters
            .records_skipped
            .insert("types".into(), ex.skipped as u64);
        let total = ex.records.len();
        let base = state.cursors.types;
        let deadline = Instant::now() + self.config.tick_budget;
        let mut done = 0usize;
        while base + done < total && done < self.config.batch_size {
            if done > 0 && Instant::now() >= deadline {
                break;
            }
            self.apply_type(&ex.records[base + done], &mut state.counters)
                .await?;
            done += 1;
        }
        state.cursors.types = base + done;
        state.progress.advance(
            ImportPhase::Types,
            progress::phase_percent(ImportPhase::Types, base + done, total),
        );
        if base + done >= total {
            info!(processed = total, "types phase complete");
            state.phase = ImportPhase::Finalize;
        }
        Ok(PhaseOutcome::Continue)
    }

    async fn run_finalize(&self, state: &mut ImportState) -> Result<PhaseOutcome> {
        let summary = crate::import::state::RunSummary {
            document_path: state.document_path.clone(),
            doc_modified_at: state.doc_modified_at,
            started_at: state.started_at,
            finished_at: Utc::now(),
            counters: state.counters.clone(),
        };
        self.store.save_last_run(&summary).await?;
        // Clear phase state so a stale record can never read as progress.
        self.store.clear_state().await?;
        self.index.lock().await.clear();
        *self.doc_cache.lock().await = None;
        info!(
            moves = summary.counters.moves.total(),
            creatures = summary.counters.creatures.total(),
            derived = summary.counters.derived.total(),
            edges = summary.counters.edges_linked,
            "import finished"
        );
        Ok(PhaseOutcome::Finished)
    }

    // -- per-record application ---------------------------------------------

    async fn apply_move(&self, rec: &MoveRecord, counters: &mut RunCounters) -> Result<()> {
        let slug = rec.slug();
        let mut fields = Map::new();
        fields.insert("proto_id".into(), Value::from(rec.unique_id.clone()));
        fields.insert("move_id".into(), Value::from(rec.move_id));
        fields.insert("name".into(), Value::from(rec.name.clone()));
        fields.insert("kind".into(), Value::from(rec.kind.as_str()));
        let up = self
            .store
            .find_or_upsert(EntityKind::Move, &slug, fields)
            .await?;
        counters.moves.record(up.was_insert);

        let mut stats = Vec::new();
        if let Some(pve) = &rec.pve {
            stats.push(MoveStatRow {
                context: GameContext::Pve,
                power: pve.power,
                energy_delta: pve.energy_delta,
                duration_ms: pve.duration_ms.map(i64::from),
                turns: pve.turns.map(i64::from),
            });
        }
        if let Some(pvp) = &rec.pvp {
            stats.push(MoveStatRow {
                context: GameContext::Pvp,
                power: pvp.power,
                energy_delta: pvp.energy_delta,
                duration_ms: pvp.duration_ms.map(i64::from),
                turns: pvp.turns.map(i64::from),
            });
        }
        self.store.replace_move_stats(up.id, stats).await?;
        self.index.lock().await.register_move(&slug, up.id);
        Ok(())
    }

    async fn apply_species(
        &self,
        rec: &SpeciesRecord,
        form_decls: &HashMap<String, Vec<FormDecl>>,
        counters: &mut RunCounters,
        synthesized: &mut std::collections::BTreeSet<String>,
    ) -> Result<()> {
        let form_variant_id = match rec.form_slug() {
            Some(form_slug) => {
                let decl = form_decls
                    .get(&rec.species_id)
                    .and_then(|list| list.iter().find(|d| d.slug() == form_slug));
                let mut fields = Map::new();
                if let Some(name) = decl.and_then(|d| d.name.clone()) {
                    fields.insert("name".into(), Value::from(name));
                }
                fields.insert(
                    "category".into(),
                    Value::from(
                        decl.and_then(|d| d.category.clone())
                            .unwrap_or_else(|| "variant".to_string()),
                    ),
                );
                if let Some(group) = decl.and_then(|d| d.group.clone()) {
                    fields.insert("group_tag".into(), Value::from(group));
                }
                let up = self
                    .store
                    .find_or_upsert(EntityKind::FormVariant, &form_slug, fields)
                    .await?;
                counters.forms.record(up.was_insert);
                Some(up.id)
            }
            None => None,
        };

        let slug = rec.slug();
        let qualifier = rec.form_slug();
        let mut fields = Map::new();
        fields.insert("species_id".into(), Value::from(rec.species_id.clone()));
        fields.insert(
            "form".into(),
            qualifier.clone().map(Value::from).unwrap_or(Value::Null),
        );
        fields.insert("name".into(), Value::from(rec.name.clone()));
        fields.insert("dex_number".into(), Value::from(rec.dex_number));
        fields.insert("attack".into(), Value::from(rec.stats.attack));
        fields.insert("defense".into(), Value::from(rec.stats.defense));
        fields.insert("stamina".into(), Value::from(rec.stats.stamina));
        fields.insert("is_default_form".into(), Value::from(rec.is_default));
        if let Some(id) = form_variant_id {
            fields.insert("form_variant_id".into(), Value::from(id));
        }
        fields.insert(
            "extension".into(),
            Value::Object(synth::creature_extension(&rec.stats, &rec.extension)),
        );
        let up = self
            .store
            .find_or_upsert(EntityKind::Creature, &slug, fields)
            .await?;
        counters.creatures.record(up.was_insert);

        let mut index = self.index.lock().await;
        index.register_creature(
            &rec.species_id,
            qualifier.as_deref(),
            crate::store::ResolvedEntity {
                creature_id: up.id,
                slug,
                form_variant_id,
            },
        );
        if rec.is_default && !rec.temp_evo_overrides.is_empty() {
            synth::synthesize_overrides(
                self.store.as_ref(),
                &mut index,
                rec,
                synthesized,
                counters,
            )
            .await?;
        }
        Ok(())
    }

    async fn apply_link(&self, record: &LinkRecord, counters: &mut RunCounters) -> Result<()> {
        let mut index = self.index.lock().await;
        match record {
            LinkRecord::CreatureTypes {
                species_id,
                qualifier,
                types,
            } => {
                let Some(creature) = index
                    .resolve_creature(self.store.as_ref(), species_id, qualifier.as_deref())
                    .await?
                else {
                    warn!(species = %species_id, form = ?qualifier, "type link target unresolved; skipped");
                    return Ok(());
                };
                let ids = self.ensure_types(types).await?;
                self.store
                    .sync_links(LinkKind::CreatureTypes, creature.creature_id, &ids)
                    .await?;
                counters.links_synced += 1;
            }
            LinkRecord::MoveType {
                move_uid,
                move_type,
            } => {
                let Some(move_id) = index.resolve_move(self.store.as_ref(), move_uid).await? else {
                    warn!(move_uid = %move_uid, "move unresolved for type link; skipped");
                    return Ok(());
                };
                let ids = self
                    .ensure_types(std::slice::from_ref(move_type))
                    .await?;
                self.store
                    .sync_links(LinkKind::MoveTypes, move_id, &ids)
                    .await?;
                counters.links_synced += 1;
            }
            LinkRecord::CreatureMoves {
                species_id,
                qualifier,
                moves,
            } => {
                let Some(creature) = index
                    .resolve_creature(self.store.as_ref(), species_id, qualifier.as_deref())
                    .await?
                else {
                    warn!(species = %species_id, form = ?qualifier, "move link target unresolved; skipped");
                    return Ok(());
                };
                let mut ids = Vec::with_capacity(moves.len());
                for uid in moves {
                    match index.resolve_move(self.store.as_ref(), uid).await? {
                        Some(id) => ids.push(id),
                        None => {
                            debug!(move_uid = %uid, "learnable move unresolved; dropped from link set")
                        }
                    }
                }
                self.store
                    .sync_links(LinkKind::CreatureMoves, creature.creature_id, &ids)
                    .await?;
                counters.links_synced += 1;
            }
            LinkRecord::Edge {
                from_species,
                from_form,
                to_species,
                to_form,
                condition,
            } => {
                let from = index
                    .resolve_creature(self.store.as_ref(), from_species, from_form.as_deref())
                    .await?;
                let to = index
                    .resolve_creature(self.store.as_ref(), to_species, to_form.as_deref())
                    .await?;
                let (Some(from), Some(to)) = (from, to) else {
                    counters.edges_skipped += 1;
                    warn!(from = %from_species, to = %to_species, "evolution endpoint unresolved; edge skipped");
                    return Ok(());
                };
                let key = format!("{}->{}", from.slug, to.slug);
                let mut fields = Map::new();
                fields.insert("from_creature_id".into(), Value::from(from.creature_id));
                fields.insert("to_creature_id".into(), Value::from(to.creature_id));
                fields.insert("extension".into(), Value::Object(condition.clone()));
                self.store
                    .find_or_upsert(EntityKind::EvolutionEdge, &key, fields)
                    .await?;
                counters.edges_linked += 1;
            }
        }
        Ok(())
    }

    async fn apply_type(&self, rec: &TypeChartRecord, counters: &mut RunCounters) -> Result<()> {
        let mut fields = Map::new();
        fields.insert("name".into(), Value::from(rec.name.clone()));
        let up = self
            .store
            .find_or_upsert(EntityKind::ElementType, &rec.slug(), fields)
            .await?;
        counters.types.record(up.was_insert);
        let weaknesses = self.ensure_types(&rec.weaknesses).await?;
        self.store
            .sync_links(LinkKind::TypeWeaknesses, up.id, &weaknesses)
            .await?;
        let resistances = self.ensure_types(&rec.resistances).await?;
        self.store
            .sync_links(LinkKind::TypeResistances, up.id, &resistances)
            .await?;
        counters.links_synced += 2;
        Ok(())
    }

    /// Ensure a type row exists per name. The empty field map means an
    /// existing row (and any enrichment the types phase wrote) is untouched.
    async fn ensure_types(&self, names: &[String]) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let slug = slugify(name);
            if slug.is_empty() {
                continue;
            }
            let up = self
                .store
                .find_or_upsert(EntityKind::ElementType, &slug, Map::new())
                .await?;
            ids.push(up.id);
        }
        Ok(ids)
    }

    async fn obtain_document(&self, path: &str) -> Result<Arc<DumpDocument>> {
        let p = Path::new(path);
        let modified_at = dump::document_modified_at(p)?;
        let mut cache = self.doc_cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.path == p && cached.modified_at == modified_at {
                return Ok(cached.doc.clone());
            }
        }
        let doc = Arc::new(dump::load_document(p)?);
        *cache = Some(CachedDoc {
            path: p.to_path_buf(),
            modified_at,
            doc: doc.clone(),
        });
        Ok(doc)
    }

    /// Status poll. Safe at any time, including before the first run ever.
    pub async fn status(&self) -> Result<StatusReport> {
        let state = match self.store.load_state().await {
            Ok(state) => state,
            Err(err) => {
                return Ok(StatusReport {
                    state: "error".into(),
                    phase: None,
                    percent: 0,
                    message: format!("persisted state unreadable: {err:#}"),
                });
            }
        };
        if let Some(state) = state {
            let label = match state.status {
                RunStatus::Queued => "queued",
                RunStatus::Running => "running",
                RunStatus::Error => "error",
            };
            let message = match state.status {
                RunStatus::Error => state
                    .latest_error()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "import failed".into()),
                _ => format!("{} at {}%", state.progress.phase, state.progress.percent),
            };
            return Ok(StatusReport {
                state: label.into(),
                phase: Some(state.progress.phase.clone()),
                percent: state.progress.percent,
                message,
            });
        }
        if let Some(last) = self.store.load_last_run().await? {
            return Ok(StatusReport {
                state: "done".into(),
                phase: None,
                percent: 100,
                message: format!(
                    "last run finished at {} ({} creatures, {} moves)",
                    last.finished_at.to_rfc3339(),
                    last.counters.creatures.total() + last.counters.derived.total(),
                    last.counters.moves.total()
                ),
            });
        }
        Ok(StatusReport {
            state: "idle".into(),
            phase: None,
            percent: 0,
            message: "no import has run".into(),
        })
    }

    pub async fn last_run(&self) -> Result<Option<crate::import::state::RunSummary>> {
        self.store.load_last_run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::scheduler::QueueScheduler;
    use crate::store::MemoryStore;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn three_record_dump() -> serde_json::Value {
        json!({
            "version": "2026.08.01",
            "templates": [
                {"templateId": "MOVE_VINE_WHIP", "move": {
                    "moveId": 214, "uniqueId": "VINE_WHIP", "name": "Vine Whip",
                    "kind": "quick", "type": "grass",
                    "pve": {"power": 7.0, "energyDelta": 6, "durationMs": 600},
                    "pvp": {"power": 5.0, "energyDelta": 8, "turns": 2}
                }},
                {"templateId": "SPECIES_VENUSAUR", "species": {
                    "speciesId": "VENUSAUR", "dexNumber": 3, "name": "Venusaur",
                    "types": ["grass", "poison"],
                    "stats": {"attack": 198, "defense": 189, "stamina": 190},
                    "quickMoves": ["VINE_WHIP"],
                    "tempEvoOverrides": [
                        {"tempEvoId": "MEGA", "stats": {"attack": 241, "defense": 246, "stamina": 190}}
                    ]
                }},
                {"templateId": "TYPE_GRASS", "typeChart": {
                    "type": "GRASS", "name": "Grass", "weaknesses": ["FIRE"], "resistances": ["WATER"]
                }}
            ]
        })
    }

    fn write_dump(value: &serde_json::Value) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "{value}").unwrap();
        f.flush().unwrap();
        f
    }

    fn engine_with(store: Arc<MemoryStore>, batch_size: usize) -> ImportEngine<MemoryStore> {
        let config = EngineConfig {
            batch_size,
            ..EngineConfig::default()
        };
        ImportEngine::new(store, Arc::new(QueueScheduler::new()), config)
    }

    async fn drive(engine: &ImportEngine<MemoryStore>) -> TickOutcome {
        for _ in 0..200 {
            match engine.tick().await.unwrap() {
                TickOutcome::Continue => {}
                outcome => return outcome,
            }
        }
        panic!("import did not converge within 200 ticks");
    }

    #[tokio::test]
    async fn end_to_end_three_record_dump() {
        let dump = write_dump(&three_record_dump());
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), 250);

        let started = engine
            .start(dump.path().to_str().unwrap(), false)
            .await
            .unwrap();
        assert_eq!(started, StartOutcome::Started);
        assert_eq!(drive(&engine).await, TickOutcome::Finished);

        let status = engine.status().await.unwrap();
        assert_eq!(status.state, "done");
        assert_eq!(status.percent, 100);

        let moves = store.rows(EntityKind::Move);
        assert_eq!(moves.len(), 1);
        let creatures = store.rows(EntityKind::Creature);
        assert_eq!(creatures.len(), 2);
        let base = store.row_by_key(EntityKind::Creature, "venusaur").unwrap();
        let derived = store
            .row_by_key(EntityKind::Creature, "mega-venusaur")
            .unwrap();
        assert_eq!(base.fields["is_default_form"], json!(true));
        assert_eq!(derived.fields["is_default_form"], json!(false));

        // Both creatures carry their declared type links; the derived form
        // reuses the base set verbatim.
        assert_eq!(store.links_of(LinkKind::CreatureTypes, base.id).len(), 2);
        assert_eq!(
            store.links_of(LinkKind::CreatureTypes, base.id),
            store.links_of(LinkKind::CreatureTypes, derived.id)
        );
        assert_eq!(store.links_of(LinkKind::CreatureMoves, base.id).len(), 1);
        assert_eq!(store.move_stats_of(moves[0].id).len(), 2);

        let summary = engine.last_run().await.unwrap().unwrap();
        assert_eq!(summary.counters.moves.inserted, 1);
        assert_eq!(summary.counters.creatures.inserted, 1);
        assert_eq!(summary.counters.derived.inserted, 1);
    }

    #[tokio::test]
    async fn second_import_of_same_dump_inserts_nothing() {
        let dump = write_dump(&three_record_dump());
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), 250);
        let path = dump.path().to_str().unwrap().to_string();

        engine.start(&path, false).await.unwrap();
        drive(&engine).await;
        let first = engine.last_run().await.unwrap().unwrap();
        let creature_rows = store.rows(EntityKind::Creature).len();

        // Unchanged file short-circuits; force bypasses it.
        assert_eq!(
            engine.start(&path, false).await.unwrap(),
            StartOutcome::Unchanged
        );
        assert_eq!(
            engine.start(&path, true).await.unwrap(),
            StartOutcome::Started
        );
        drive(&engine).await;
        let second = engine.last_run().await.unwrap().unwrap();

        assert_eq!(second.counters.moves.inserted, 0);
        assert_eq!(second.counters.creatures.inserted, 0);
        assert_eq!(second.counters.derived.inserted, 0);
        assert_eq!(second.counters.creatures.updated, 1);
        assert_eq!(store.rows(EntityKind::Creature).len(), creature_rows);
        assert_eq!(
            first.counters.creatures.total(),
            second.counters.creatures.total()
        );
    }

    #[tokio::test]
    async fn resumes_from_persisted_cursor_on_a_fresh_engine() {
        // Several species so a batch size of 1 leaves work between ticks.
        let mut dump_value = three_record_dump();
        for i in 0..4 {
            dump_value["templates"].as_array_mut().unwrap().push(json!({
                "templateId": format!("SPECIES_EXTRA_{i}"),
                "species": {
                    "speciesId": format!("EXTRA_{i}"), "dexNumber": 100 + i,
                    "name": format!("Extra {i}"), "types": ["normal"],
                    "stats": {"attack": 100, "defense": 100, "stamina": 100}
                }
            }));
        }
        let dump = write_dump(&dump_value);
        let path = dump.path().to_str().unwrap().to_string();
        let store = Arc::new(MemoryStore::new());

        let first = engine_with(store.clone(), 1);
        first.start(&path, false).await.unwrap();
        // bootstrap + moves + two creature records, then the process "dies".
        for _ in 0..4 {
            assert_eq!(first.tick().await.unwrap(), TickOutcome::Continue);
        }
        drop(first);

        // A fresh engine (new index, new cache) picks up mid-phase.
        let resumed = engine_with(store.clone(), 250);
        assert_eq!(drive(&resumed).await, TickOutcome::Finished);

        let summary = resumed.last_run().await.unwrap().unwrap();
        assert_eq!(summary.counters.creatures.total(), 5);
        assert_eq!(summary.counters.creatures.inserted, 5);
        assert_eq!(store.rows(EntityKind::Creature).len(), 6);
    }

    #[tokio::test]
    async fn held_lock_skips_the_tick_without_touching_state() {
        let dump = write_dump(&three_record_dump());
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), 250);
        engine
            .start(dump.path().to_str().unwrap(), false)
            .await
            .unwrap();

        // Simulate a tick in flight on another process.
        assert!(store.try_lock(Duration::from_secs(60)).await.unwrap());
        let before = store.load_state().await.unwrap().unwrap();
        assert_eq!(engine.tick().await.unwrap(), TickOutcome::Locked);
        let after = store.load_state().await.unwrap().unwrap();
        assert_eq!(before.phase, after.phase);
        assert_eq!(before.updated_at, after.updated_at);

        store.unlock().await.unwrap();
        assert_eq!(drive(&engine).await, TickOutcome::Finished);
    }

    #[tokio::test]
    async fn progress_never_decreases_and_hits_100_only_at_done() {
        let dump = write_dump(&three_record_dump());
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), 1);
        engine
            .start(dump.path().to_str().unwrap(), false)
            .await
            .unwrap();

        let mut last = 0u8;
        for _ in 0..200 {
            let outcome = engine.tick().await.unwrap();
            let status = engine.status().await.unwrap();
            assert!(status.percent >= last, "progress went backwards");
            last = status.percent;
            match outcome {
                TickOutcome::Continue => assert!(status.percent < 100),
                TickOutcome::Finished => {
                    assert_eq!(status.percent, 100);
                    return;
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        panic!("import did not converge");
    }

    #[tokio::test]
    async fn missing_document_fails_the_run_and_releases_the_lock() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), 250);
        engine.start("/nonexistent/dump.json", false).await.unwrap();

        assert_eq!(engine.tick().await.unwrap(), TickOutcome::Failed);
        let status = engine.status().await.unwrap();
        assert_eq!(status.state, "error");
        assert!(status.message.contains("not accessible"));

        // Lock must not leak from the failed tick.
        assert!(store.try_lock(Duration::from_secs(1)).await.unwrap());
        store.unlock().await.unwrap();

        // Terminal: further ticks no-op until a fresh start().
        assert_eq!(engine.tick().await.unwrap(), TickOutcome::Failed);
    }

    #[tokio::test]
    async fn corrupted_phase_value_is_fatal_not_recovered() {
        let store = Arc::new(MemoryStore::new());
        store.inject_raw_state(json!({"phase": "reticulating"}));
        let engine = engine_with(store.clone(), 250);
        assert_eq!(engine.tick().await.unwrap(), TickOutcome::Failed);
        let status = engine.status().await.unwrap();
        assert_eq!(status.state, "error");
        assert!(status.message.contains("unreadable"));
    }

    #[tokio::test]
    async fn tick_without_state_is_idle_and_empty_path_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), 250);
        assert_eq!(engine.tick().await.unwrap(), TickOutcome::Idle);
        assert!(engine.start("  ", false).await.is_err());
        let status = engine.status().await.unwrap();
        assert_eq!(status.state, "idle");
        assert_eq!(status.percent, 0);
    }

    #[tokio::test]
    async fn unresolved_evolution_endpoint_is_skipped_not_fatal() {
        let mut dump_value = three_record_dump();
        dump_value["templates"].as_array_mut().unwrap().push(json!({
            "templateId": "SPECIES_ORPHAN",
            "species": {
                "speciesId": "ORPHAN", "dexNumber": 999, "name": "Orphan",
                "types": ["normal"],
                "stats": {"attack": 1, "defense": 1, "stamina": 1},
                "evolutions": [{"speciesId": "NOT_IN_DUMP"}]
            }
        }));
        let dump = write_dump(&dump_value);
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), 250);
        engine
            .start(dump.path().to_str().unwrap(), false)
            .await
            .unwrap();
        assert_eq!(drive(&engine).await, TickOutcome::Finished);
        let summary = engine.last_run().await.unwrap().unwrap();
        assert_eq!(summary.counters.edges_skipped, 1);
        assert_eq!(summary.counters.edges_linked, 0);
    }

    #[tokio::test]
    async fn shrunk_type_set_replaces_links_on_reimport() {
        let dump = write_dump(&three_record_dump());
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), 250);
        let path = dump.path().to_str().unwrap().to_string();
        engine.start(&path, false).await.unwrap();
        drive(&engine).await;

        let base = store.row_by_key(EntityKind::Creature, "venusaur").unwrap();
        assert_eq!(store.links_of(LinkKind::CreatureTypes, base.id).len(), 2);

        // Same dump minus the poison typing.
        let mut shrunk = three_record_dump();
        shrunk["templates"][1]["species"]["types"] = json!(["grass"]);
        let dump2 = write_dump(&shrunk);
        engine
            .start(dump2.path().to_str().unwrap(), false)
            .await
            .unwrap();
        drive(&engine).await;
        assert_eq!(store.links_of(LinkKind::CreatureTypes, base.id).len(), 1);
    }
}
