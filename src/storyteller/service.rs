//! Per-chapter storyteller loop.
//!
//! Each chapter is gated by its `input_hash` (cache hit → skip), run
//! through the DAG, and committed by `state_update` in one session.
//! A prefetch window runs entity extraction and memory retrieval for
//! upcoming chapters concurrently; unconsumed prefetch tasks are
//! aborted on the way out so cancellation never touches persistent
//! state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::hashing::sha256_text;
use crate::llm::LlmClient;
use crate::retrieval::MemoryRetriever;
use crate::storage::{ChapterRow, Store};

use super::graph::{GraphContext, GraphError, NarrationMeta, StorytellerGraph};
use super::nodes::{entity_extract, memory_retrieve};
use super::prompts::NARRATION_PROMPT_VERSION;
use super::state::StorytellerState;
use super::tiering::{build_tier_overrides, decide_tier};

/// Model identity used when no narration client could be built.
pub const STORYTELLER_FALLBACK_MODEL: &str = "storyteller-fallback";

/// Everything the storyteller services need, assembled once by the
/// controller.
#[derive(Clone)]
pub struct StorytellerRuntime {
    pub store: Arc<Store>,
    pub config: Arc<AppConfig>,
    pub entity_llm: Option<Arc<LlmClient>>,
    pub narration_llm: Option<Arc<LlmClient>>,
    pub refine_llm: Option<Arc<LlmClient>>,
    pub memory: Option<Arc<dyn MemoryRetriever>>,
}

impl StorytellerRuntime {
    pub fn model_identifier(&self) -> String {
        self.narration_llm
            .as_ref()
            .map(|client| client.model_identifier.clone())
            .unwrap_or_else(|| STORYTELLER_FALLBACK_MODEL.to_string())
    }

    fn graph_context(&self, book_id: i64, narration_meta: Option<NarrationMeta>) -> GraphContext {
        GraphContext {
            book_id,
            config: self.config.clone(),
            store: Some(self.store.clone()),
            entity_llm: self.entity_llm.clone(),
            narration_llm: self.narration_llm.clone(),
            refine_llm: self.refine_llm.clone(),
            memory: self.memory.clone(),
            narration_meta,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StorytellStats {
    pub book_id: i64,
    pub chapters_total: usize,
    pub chapters_processed: usize,
    pub chapters_skipped: usize,
    pub llm_calls_estimated: u64,
    pub refine_llm_calls_estimated: u64,
    pub llm_cache_hits: u64,
    pub llm_cache_misses: u64,
    pub input_tokens_estimated: u64,
    pub output_tokens_estimated: u64,
    pub refine_input_tokens_estimated: u64,
    pub refine_output_tokens_estimated: u64,
    pub consistency_warnings: u64,
    pub consistency_actions: u64,
    pub evidence_supported_claims: u64,
    pub evidence_unsupported_claims: u64,
    pub runtime_seconds: f64,
}

impl StorytellStats {
    fn absorb(&mut self, state: &StorytellerState) {
        let telemetry = &state.telemetry;
        let calls = u64::from(telemetry.entity_llm_calls)
            + u64::from(telemetry.narration_llm_calls)
            + u64::from(telemetry.refine_llm_calls);
        self.llm_calls_estimated += calls;
        self.refine_llm_calls_estimated += u64::from(telemetry.refine_llm_calls);
        if telemetry.entity_llm_cache_hit {
            self.llm_cache_hits += u64::from(telemetry.entity_llm_calls);
        }
        if telemetry.narration_llm_cache_hit {
            self.llm_cache_hits += u64::from(telemetry.narration_llm_calls);
        }
        if telemetry.refine_llm_cache_hit {
            self.llm_cache_hits += u64::from(telemetry.refine_llm_calls);
        }
        self.input_tokens_estimated += telemetry.input_tokens_estimated;
        self.output_tokens_estimated += telemetry.output_tokens_estimated;
        self.refine_input_tokens_estimated += telemetry.refine_input_tokens_estimated;
        self.refine_output_tokens_estimated += telemetry.refine_output_tokens_estimated;
        self.consistency_warnings += state.consistency_warnings.len() as u64;
        self.consistency_actions += state.consistency_actions.len() as u64;
        if let Some(report) = &state.evidence_report {
            self.evidence_supported_claims += report.supported_claims as u64;
            self.evidence_unsupported_claims += report.unsupported_claims as u64;
        }
    }

    fn finish(&mut self, started: Instant) {
        self.runtime_seconds = started.elapsed().as_secs_f64();
        self.llm_cache_misses = self.llm_calls_estimated.saturating_sub(self.llm_cache_hits);
    }
}

/// Everything that influenced this chapter's generation, folded into
/// one hash: text, style, tier knobs, and the route names in play.
pub fn chapter_input_hash(
    config: &AppConfig,
    chapter_id: i64,
    chapter_idx: i64,
    chapter_text: &str,
    tier: crate::config::Tier,
    overrides_json: &str,
) -> String {
    let routes = &config.llm.routes;
    let narration_route = routes
        .storyteller_narration_chat
        .as_deref()
        .unwrap_or(&routes.storyteller_chat);
    let refine_route = routes
        .storyteller_refine_chat
        .as_deref()
        .or(routes.storyteller_narration_chat.as_deref())
        .unwrap_or(&routes.storyteller_chat);
    sha256_text(&format!(
        "{chapter_id}:{chapter_idx}:{chapter_text}:{}:{}:{overrides_json}:{narration_route}:{refine_route}",
        config.storyteller.style,
        tier.as_str(),
    ))
}

/// Build the pre-graph state for a chapter: text, tier, entities and
/// memories. Used inline and by the prefetch tasks.
async fn prefetch_state(
    runtime: StorytellerRuntime,
    book_id: i64,
    chapter: ChapterRow,
) -> StorytellerState {
    let text = match runtime.store.read(|sess| sess.chapter_text(chapter.id)) {
        Ok(text) => text,
        Err(err) => {
            log::warn!("Chapter text read failed chapter_idx={}: {err}", chapter.idx);
            String::new()
        }
    };

    let tier = decide_tier(chapter.idx, &chapter.title, &text, &runtime.config);
    let overrides = build_tier_overrides(tier, &runtime.config);
    let mut state = StorytellerState {
        book_id,
        chapter_id: chapter.id,
        chapter_idx: chapter.idx,
        chapter_title: chapter.title,
        chapter_text: text,
        tier,
        overrides,
        ..Default::default()
    };
    if state.chapter_text.is_empty() {
        return state;
    }

    let ctx = runtime.graph_context(book_id, None);
    if let Err(err) = entity_extract::run(&mut state, &ctx).await {
        log::warn!(
            "Prefetch entity extraction failed chapter_idx={}: {err}",
            state.chapter_idx
        );
    }
    if let Err(err) = memory_retrieve::run(&mut state, &ctx).await {
        log::warn!(
            "Prefetch memory retrieval failed chapter_idx={}: {err}",
            state.chapter_idx
        );
    }
    state
}

/// Run one chapter through the full DAG. Returns `None` when the
/// chapter was skipped (empty text, cache hit, or empty narration).
pub(crate) async fn process_chapter(
    runtime: &StorytellerRuntime,
    book_id: i64,
    chapter: &ChapterRow,
    prefetched: Option<StorytellerState>,
) -> Result<Option<StorytellerState>, GraphError> {
    let mut state = match prefetched {
        Some(state) if !state.chapter_text.is_empty() => state,
        _ => prefetch_state(runtime.clone(), book_id, chapter.clone()).await,
    };
    if state.chapter_text.is_empty() {
        log::warn!("Chapter text empty chapter_idx={}; skipped", chapter.idx);
        return Ok(None);
    }

    let overrides_json = serde_json::to_string(&state.overrides)?;
    let input_hash = chapter_input_hash(
        &runtime.config,
        chapter.id,
        chapter.idx,
        &state.chapter_text,
        state.tier,
        &overrides_json,
    );
    let model_identifier = runtime.model_identifier();

    let existing = runtime.store.read(|sess| {
        sess.get_narration(chapter.id, NARRATION_PROMPT_VERSION, &model_identifier, &input_hash)
    })?;
    if existing.is_some() {
        log::info!(
            "Narration already exists for current input hash chapter_idx={}; skipped",
            chapter.idx
        );
        return Ok(None);
    }

    let ctx = runtime.graph_context(
        book_id,
        Some(NarrationMeta {
            prompt_version: NARRATION_PROMPT_VERSION.to_string(),
            model: model_identifier,
            input_hash,
        }),
    );
    log::debug!(
        "Invoking storyteller graph chapter_idx={} tier={}",
        chapter.idx,
        state.tier.as_str()
    );
    StorytellerGraph::chapter().invoke(&mut state, &ctx).await?;

    if state.narration.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(state))
}

/// The chapter loop: prefetch ahead, process in order, accumulate
/// statistics.
pub async fn storytell_book(
    runtime: &StorytellerRuntime,
    book_id: i64,
    from_chapter: Option<i64>,
    to_chapter: Option<i64>,
) -> Result<StorytellStats, GraphError> {
    let started = Instant::now();
    let mut stats = StorytellStats {
        book_id,
        ..Default::default()
    };

    let chapters: Vec<ChapterRow> = runtime
        .store
        .read(|sess| sess.list_chapters(book_id))?
        .into_iter()
        .filter(|chapter| from_chapter.map_or(true, |from| chapter.idx >= from))
        .filter(|chapter| to_chapter.map_or(true, |to| chapter.idx <= to))
        .collect();
    stats.chapters_total = chapters.len();
    log::info!(
        "Storyteller chapter loop started book_id={book_id} chapters_selected={}",
        chapters.len()
    );

    let prefetch_window = runtime.config.storyteller.prefetch_window;
    let mut prefetch_tasks: HashMap<i64, tokio::task::JoinHandle<StorytellerState>> =
        HashMap::new();

    for position in 0..chapters.len() {
        // Keep the lookahead window full.
        if prefetch_window > 0 {
            for offset in 1..=prefetch_window {
                let Some(target) = chapters.get(position + offset) else {
                    break;
                };
                if prefetch_tasks.contains_key(&target.id) {
                    continue;
                }
                let runtime_clone = runtime.clone();
                let target_clone = target.clone();
                prefetch_tasks.insert(
                    target.id,
                    tokio::spawn(prefetch_state(runtime_clone, book_id, target_clone)),
                );
            }
        }

        let chapter = &chapters[position];
        let prefetched = match prefetch_tasks.remove(&chapter.id) {
            Some(task) => match task.await {
                Ok(state) => Some(state),
                Err(err) => {
                    log::warn!(
                        "Prefetch task failed chapter_idx={}, fallback to synchronous path: {err}",
                        chapter.idx
                    );
                    None
                }
            },
            None => None,
        };

        match process_chapter(runtime, book_id, chapter, prefetched).await? {
            Some(state) => {
                stats.absorb(&state);
                stats.chapters_processed += 1;
                log::info!(
                    "Chapter narration persisted chapter_idx={} key_events={} warnings={} actions={}",
                    chapter.idx,
                    state.key_events.len(),
                    state.consistency_warnings.len(),
                    state.consistency_actions.len()
                );
            }
            None => stats.chapters_skipped += 1,
        }
    }

    // Tear down any prefetch still in flight; nothing durable happens
    // before state_update, so aborting is safe.
    for (_, task) in prefetch_tasks.drain() {
        task.abort();
    }

    stats.finish(started);
    Ok(stats)
}
