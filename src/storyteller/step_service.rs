//! Step executor: batched generation with checkpointed world-state.
//!
//! A step is `step_size` consecutive chapters generated as one unit
//! against the baseline world-state at the step boundary. Before each
//! step the executor makes the database match that baseline (restore
//! from a checkpoint, or replay committed payloads); after the step
//! it snapshots the world-state into a checkpoint. A step whose
//! `input_hash` already has a narration replays its stored payload
//! instead of calling the LLM.

use std::time::Instant;

use serde_json::json;

use crate::config::{StepAlign, StepMemoryMode, StepResumeMode};
use crate::hashing::sha256_text;
use crate::retrieval::{MemoryHit, MemoryQuery};
use crate::storage::{ChapterRow, NarrationOutputRow};
use crate::storyteller::nodes::generate_step::{self, StepGenerateOutput};
use crate::storyteller::nodes::state_update::{self, StateMutations};
use crate::storyteller::nodes::{consistency, entity_extract, evidence};
use crate::storyteller::prompts::STEP_NARRATION_PROMPT_VERSION;
use crate::storyteller::state::{NarrationPayload, StorytellerState};
use crate::storyteller::step::{align_from_chapter, align_to_chapter, iter_step_ranges};
use crate::storyteller::tiering::{build_tier_overrides, decide_tier};

use super::graph::GraphError;
use super::service::{process_chapter, StorytellerRuntime};

#[derive(Debug, Clone, Default)]
pub struct StepStats {
    pub book_id: i64,
    pub step_size: i64,
    pub steps_total: usize,
    pub steps_processed: usize,
    pub steps_cached: usize,
    pub steps_skipped: usize,
    pub chapters_covered: usize,
    pub checkpoints_written: usize,
    pub llm_calls_estimated: u64,
    pub llm_cache_hits: u64,
    pub llm_cache_misses: u64,
    pub input_tokens_estimated: u64,
    pub output_tokens_estimated: u64,
    pub consistency_warnings: u64,
    pub consistency_actions: u64,
    pub evidence_supported_claims: u64,
    pub evidence_unsupported_claims: u64,
    pub runtime_seconds: f64,
}

/// Baseline view at a step boundary, hashed for the step identity.
struct Baseline {
    view: serde_json::Value,
    hash: String,
    characters: Vec<crate::storage::CharacterRow>,
    recent_events: Vec<crate::storage::PlotEventRow>,
}

fn build_baseline(
    runtime: &StorytellerRuntime,
    book_id: i64,
    step_start: i64,
) -> Result<Baseline, GraphError> {
    let window = runtime.config.storyteller.recent_events_window;
    let (characters, items, recent_events, world_facts) = runtime.store.read(|sess| {
        let characters = sess.list_character_states(book_id, None)?;
        let items = sess.list_item_states(book_id, None)?;
        let recent_events =
            sess.list_recent_plot_events(book_id, Some(step_start), window, 20)?;
        let world_facts = sess.list_world_facts(book_id, 500)?;
        Ok((characters, items, recent_events, world_facts))
    })?;

    let view = json!({
        "character_states": &characters,
        "item_states": &items,
        "recent_events": &recent_events,
        "world_facts": &world_facts,
    });
    let hash = sha256_text(&serde_json::to_string(&view)?);
    Ok(Baseline {
        view,
        hash,
        characters,
        recent_events,
    })
}

fn parse_payload(output: &NarrationOutputRow) -> Option<NarrationPayload> {
    match serde_json::from_str::<NarrationPayload>(&output.payload_json) {
        Ok(payload) => Some(payload),
        Err(err) => {
            log::warn!(
                "Narration output payload unreadable narration_id={}: {err}",
                output.narration_id
            );
            None
        }
    }
}

fn apply_payload(
    runtime: &StorytellerRuntime,
    book_id: i64,
    chapter_idx: i64,
    payload: &NarrationPayload,
) -> Result<(), GraphError> {
    runtime.store.session(|sess| {
        state_update::apply(
            sess,
            book_id,
            chapter_idx,
            &StateMutations {
                key_events: &payload.key_events,
                character_updates: &payload.character_updates,
                new_items: &payload.new_items,
                entities_mentioned: &payload.entities_mentioned,
            },
        )?;
        Ok(())
    })?;
    Ok(())
}

/// Rebuild world-state across `[from_idx, to_idx]`, preferring stored
/// payloads (anchors cover their whole step) and falling back to a
/// full graph invocation for uncovered chapters.
async fn replay_range(
    runtime: &StorytellerRuntime,
    book_id: i64,
    from_idx: i64,
    to_idx: i64,
) -> Result<(), GraphError> {
    if from_idx > to_idx {
        return Ok(());
    }
    log::info!("Replaying world-state book_id={book_id} chapters={from_idx}..={to_idx}");

    let chapters: Vec<ChapterRow> = runtime
        .store
        .read(|sess| sess.list_chapters(book_id))?
        .into_iter()
        .filter(|chapter| chapter.idx >= from_idx && chapter.idx <= to_idx)
        .collect();

    // (anchor idx, payload) pairs, ascending by anchor.
    let mut anchors: Vec<(i64, NarrationPayload)> = Vec::new();
    for chapter in &chapters {
        let output = runtime
            .store
            .read(|sess| sess.get_latest_narration_output_for_chapter(chapter.id))?;
        if let Some(output) = output {
            if let Some(payload) = parse_payload(&output) {
                anchors.push((chapter.idx, payload));
            }
        }
    }
    anchors.sort_by_key(|(idx, _)| *idx);

    let mut idx = from_idx;
    while idx <= to_idx {
        let covering = anchors.iter().find(|(anchor, payload)| {
            *anchor >= idx
                && *anchor <= to_idx
                && payload.step_start_chapter_idx.unwrap_or(*anchor) <= idx
        });
        match covering {
            Some((anchor, payload)) => {
                apply_payload(runtime, book_id, *anchor, payload)?;
                idx = anchor + 1;
            }
            None => {
                match chapters.iter().find(|chapter| chapter.idx == idx) {
                    Some(chapter) => {
                        process_chapter(runtime, book_id, chapter, None).await?;
                    }
                    None => {
                        log::warn!("Replay found no chapter at idx={idx}; skipped");
                    }
                }
                idx += 1;
            }
        }
    }
    Ok(())
}

/// Make the database's world-state equal the boundary state at
/// `step_start - 1`.
async fn ensure_baseline_state(
    runtime: &StorytellerRuntime,
    book_id: i64,
    step_start: i64,
) -> Result<(), GraphError> {
    if runtime.config.storyteller.step_resume_mode != StepResumeMode::Restore {
        return Ok(());
    }

    let boundary = step_start - 1;
    if boundary < 1 {
        runtime
            .store
            .session(|sess| sess.clear_world_state_for_book(book_id))?;
        return Ok(());
    }

    let checkpoint = runtime
        .store
        .read(|sess| sess.get_latest_checkpoint_at_or_before(book_id, boundary))?;
    let replay_from = match &checkpoint {
        Some(checkpoint) => {
            log::info!(
                "Restoring world-state checkpoint book_id={book_id} chapter_idx={} snapshot={}",
                checkpoint.chapter_idx,
                crate::hashing::short_hash(&checkpoint.snapshot_hash)
            );
            let row = checkpoint.clone();
            runtime
                .store
                .session(|sess| sess.restore_world_state_checkpoint(&row))?;
            checkpoint.chapter_idx + 1
        }
        None => {
            runtime
                .store
                .session(|sess| sess.clear_world_state_for_book(book_id))?;
            1
        }
    };
    replay_range(runtime, book_id, replay_from, boundary).await
}

/// Collect the per-chapter pre-states for one step: text, tier,
/// entities, and memories per the configured step memory mode.
async fn build_step_states(
    runtime: &StorytellerRuntime,
    book_id: i64,
    chapters: &[ChapterRow],
) -> Result<Vec<StorytellerState>, GraphError> {
    let mut states = Vec::with_capacity(chapters.len());
    let ctx = super::graph::GraphContext {
        book_id,
        config: runtime.config.clone(),
        store: Some(runtime.store.clone()),
        entity_llm: runtime.entity_llm.clone(),
        narration_llm: None,
        refine_llm: None,
        memory: None,
        narration_meta: None,
    };

    for chapter in chapters {
        let text = runtime.store.read(|sess| sess.chapter_text(chapter.id))?;
        if text.is_empty() {
            log::warn!("Chapter text empty chapter_idx={}; skipped from step", chapter.idx);
            continue;
        }
        let tier = decide_tier(chapter.idx, &chapter.title, &text, &runtime.config);
        let mut state = StorytellerState {
            book_id,
            chapter_id: chapter.id,
            chapter_idx: chapter.idx,
            chapter_title: chapter.title.clone(),
            chapter_text: text,
            tier,
            overrides: build_tier_overrides(tier, &runtime.config),
            ..Default::default()
        };
        entity_extract::run(&mut state, &ctx).await?;
        states.push(state);
    }
    if states.is_empty() {
        return Ok(states);
    }

    match runtime.config.storyteller.step_memory_mode {
        StepMemoryMode::Off => {
            for state in &mut states {
                state.awakened_memories = Some(Vec::new());
            }
        }
        StepMemoryMode::PerChapter => {
            if let Some(memory) = &runtime.memory {
                let queries: Vec<MemoryQuery> = states
                    .iter()
                    .map(super::nodes::memory_retrieve::build_memory_query)
                    .collect();
                let results = memory.retrieve_batch(&queries).await;
                for (state, result) in states.iter_mut().zip(results) {
                    state.awakened_memories = Some(match result {
                        Ok(hits) => hits,
                        Err(err) => {
                            log::warn!(
                                "Step memory retrieval failed chapter_idx={}: {err}",
                                state.chapter_idx
                            );
                            Vec::new()
                        }
                    });
                }
            } else {
                for state in &mut states {
                    state.awakened_memories = Some(Vec::new());
                }
            }
        }
        StepMemoryMode::PerStepShared => {
            let step_start = states[0].chapter_idx;
            let shared = if let Some(memory) = &runtime.memory {
                let mut keyword_terms: Vec<String> = Vec::new();
                for state in &states {
                    keyword_terms.extend(state.entities_mentioned.iter().cloned());
                    keyword_terms.extend(state.items_mentioned.iter().cloned());
                }
                let head: String = states[0].chapter_text.chars().take(2000).collect();
                let query = MemoryQuery {
                    book_id,
                    query_text: format!(
                        "第{step_start}章 {} {head}",
                        keyword_terms.join(" ")
                    ),
                    top_k: states[0].overrides.memory_top_k,
                    current_chapter_idx: Some(step_start),
                    keyword_terms,
                };
                match memory.retrieve(&query).await {
                    Ok(hits) => hits,
                    Err(err) => {
                        log::warn!("Shared step memory retrieval failed: {err}");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
            for state in &mut states {
                state.awakened_memories = Some(shared.clone());
            }
        }
    }

    Ok(states)
}

fn merged_memories(states: &[StorytellerState]) -> Vec<MemoryHit> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for state in states {
        for hit in state.memories() {
            if seen.insert((hit.source_type.clone(), hit.source_id)) {
                merged.push(hit.clone());
            }
        }
    }
    merged
}

/// The step identity: baseline hash, chapter payloads (texts,
/// constraints, memories), style, step size, and the narration route.
fn step_input_hash(
    runtime: &StorytellerRuntime,
    baseline: &Baseline,
    states: &[StorytellerState],
) -> Result<String, GraphError> {
    let ordered: Vec<&StorytellerState> = states.iter().collect();
    let chapters = generate_step::chapters_payload(&ordered)?;
    let routes = &runtime.config.llm.routes;
    let narration_route = routes
        .storyteller_narration_chat
        .as_deref()
        .unwrap_or(&routes.storyteller_chat);
    let payload = json!({
        "base_hash": baseline.hash,
        "chapters": chapters,
        "style": runtime.config.storyteller.style,
        "step_size": runtime.config.storyteller.step_size,
        "narration_route": narration_route,
    });
    Ok(sha256_text(&serde_json::to_string(&payload)?))
}

fn write_checkpoint(
    runtime: &StorytellerRuntime,
    book_id: i64,
    anchor_idx: i64,
) -> Result<(), GraphError> {
    let step_size = runtime.config.storyteller.step_size;
    runtime.store.session(|sess| {
        let snapshot = sess.build_world_state_snapshot(book_id)?;
        let snapshot_json = snapshot.to_canonical_json()?;
        let snapshot_hash = snapshot.content_hash()?;
        sess.upsert_world_state_checkpoint(
            book_id,
            anchor_idx,
            step_size,
            &snapshot_json,
            &snapshot_hash,
        )?;
        Ok(())
    })?;
    Ok(())
}

/// The step loop.
pub async fn storytell_book_steps(
    runtime: &StorytellerRuntime,
    book_id: i64,
    from_chapter: Option<i64>,
    to_chapter: Option<i64>,
) -> Result<StepStats, GraphError> {
    let started = Instant::now();
    let storyteller = &runtime.config.storyteller;
    let step_size = storyteller.step_size;
    let mut stats = StepStats {
        book_id,
        step_size,
        ..Default::default()
    };

    let max_chapter_idx = runtime.store.read(|sess| sess.max_chapter_idx(book_id))?;
    if max_chapter_idx == 0 {
        return Ok(stats);
    }

    let mut from = from_chapter.unwrap_or(1).max(1);
    let mut to = to_chapter.unwrap_or(max_chapter_idx).min(max_chapter_idx);
    if storyteller.step_align == StepAlign::Auto {
        from = align_from_chapter(from, step_size);
        to = align_to_chapter(to, step_size, max_chapter_idx);
    }
    if from > to {
        return Ok(stats);
    }

    let ranges = iter_step_ranges(from, to, step_size);
    stats.steps_total = ranges.len();
    let model_identifier = runtime.model_identifier();
    log::info!(
        "Step executor started book_id={book_id} steps={} range={from}..={to} step_size={step_size}",
        ranges.len()
    );

    for (step_start, step_end) in ranges {
        ensure_baseline_state(runtime, book_id, step_start).await?;
        let baseline = build_baseline(runtime, book_id, step_start)?;

        let chapters: Vec<ChapterRow> = runtime
            .store
            .read(|sess| sess.list_chapters(book_id))?
            .into_iter()
            .filter(|chapter| chapter.idx >= step_start && chapter.idx <= step_end)
            .collect();
        if chapters.is_empty() {
            log::warn!("Step {step_start}..={step_end} has no chapters; skipped");
            stats.steps_skipped += 1;
            continue;
        }

        let states = build_step_states(runtime, book_id, &chapters).await?;
        if states.is_empty() {
            stats.steps_skipped += 1;
            continue;
        }
        let anchor = states
            .last()
            .map(|state| (state.chapter_id, state.chapter_idx))
            .expect("non-empty states");
        let input_hash = step_input_hash(runtime, &baseline, &states)?;

        // Cache hit: rebuild state from the stored payload, then
        // checkpoint. No LLM call.
        let existing = runtime.store.read(|sess| {
            sess.get_narration(anchor.0, STEP_NARRATION_PROMPT_VERSION, &model_identifier, &input_hash)
        })?;
        if let Some(existing) = existing {
            let output = runtime
                .store
                .read(|sess| sess.get_narration_output(existing.id))?;
            if let Some(payload) = output.as_ref().and_then(parse_payload) {
                log::info!(
                    "Step narration already exists step={step_start}..={step_end}; replaying payload"
                );
                apply_payload(runtime, book_id, anchor.1, &payload)?;
                if storyteller.step_checkpoint_enabled {
                    write_checkpoint(runtime, book_id, anchor.1)?;
                    stats.checkpoints_written += 1;
                }
                stats.steps_cached += 1;
                stats.chapters_covered += states.len();
                continue;
            }
            log::warn!(
                "Cached step narration has no payload step={step_start}..={step_end}; regenerating"
            );
        }

        let output: StepGenerateOutput = generate_step::run_batch(
            &states,
            &runtime.config,
            runtime.narration_llm.as_deref(),
            &baseline.view,
            &input_hash,
        )
        .await?;
        if output.narration.trim().is_empty() {
            log::warn!("Step produced no narration step={step_start}..={step_end}; skipped");
            stats.steps_skipped += 1;
            continue;
        }

        // One consistency + evidence pass over the aggregate.
        let combined_text = states
            .iter()
            .map(|state| state.chapter_text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut aggregate = StorytellerState {
            book_id,
            chapter_id: anchor.0,
            chapter_idx: anchor.1,
            chapter_title: states.last().expect("non-empty").chapter_title.clone(),
            chapter_text: combined_text,
            character_states: baseline.characters.clone(),
            recent_events: baseline.recent_events.clone(),
            awakened_memories: Some(merged_memories(&states)),
            narration: output.narration.clone(),
            key_events: output.key_events.clone(),
            character_updates: output.character_updates.clone(),
            new_items: output.new_items.clone(),
            entities_mentioned: output.entities_mentioned.clone(),
            ..Default::default()
        };
        consistency::run(&mut aggregate);
        evidence::run(&mut aggregate, &runtime.config);

        let payload = NarrationPayload {
            entities_mentioned: aggregate.entities_mentioned.clone(),
            key_events: aggregate.key_events.clone(),
            character_updates: aggregate.character_updates.clone(),
            new_items: aggregate.new_items.clone(),
            step_start_chapter_idx: Some(step_start),
            step_end_chapter_idx: Some(anchor.1),
        };
        let payload_json = serde_json::to_string(&payload)?;
        let key_events_json = serde_json::to_string(&aggregate.key_events)?;
        let narration_text = aggregate.narration.clone();
        let mutations = StateMutations {
            key_events: &aggregate.key_events,
            character_updates: &aggregate.character_updates,
            new_items: &aggregate.new_items,
            entities_mentioned: &aggregate.entities_mentioned,
        };

        runtime.store.session(|sess| {
            state_update::apply(sess, book_id, anchor.1, &mutations)?;
            let narration = sess.upsert_narration(
                book_id,
                anchor.0,
                anchor.1,
                &narration_text,
                Some(&key_events_json),
                STEP_NARRATION_PROMPT_VERSION,
                &model_identifier,
                &input_hash,
            )?;
            sess.upsert_narration_output(
                narration.id,
                book_id,
                anchor.0,
                anchor.1,
                STEP_NARRATION_PROMPT_VERSION,
                &model_identifier,
                &input_hash,
                &payload_json,
            )?;
            Ok(())
        })?;

        if storyteller.step_checkpoint_enabled {
            write_checkpoint(runtime, book_id, anchor.1)?;
            stats.checkpoints_written += 1;
        }

        stats.steps_processed += 1;
        stats.chapters_covered += states.len();
        stats.llm_calls_estimated += u64::from(output.llm_calls)
            + states
                .iter()
                .map(|s| u64::from(s.telemetry.entity_llm_calls))
                .sum::<u64>();
        if output.cache_hit {
            stats.llm_cache_hits += u64::from(output.llm_calls);
        }
        stats.input_tokens_estimated += output.input_tokens_estimated;
        stats.output_tokens_estimated += output.output_tokens_estimated;
        stats.consistency_warnings += aggregate.consistency_warnings.len() as u64;
        stats.consistency_actions += aggregate.consistency_actions.len() as u64;
        if let Some(report) = &aggregate.evidence_report {
            stats.evidence_supported_claims += report.supported_claims as u64;
            stats.evidence_unsupported_claims += report.unsupported_claims as u64;
        }
        log::info!(
            "Step committed step={step_start}..={step_end} anchor_idx={} key_events={} warnings={}",
            anchor.1,
            aggregate.key_events.len(),
            aggregate.consistency_warnings.len()
        );
    }

    stats.runtime_seconds = started.elapsed().as_secs_f64();
    stats.llm_cache_misses = stats
        .llm_calls_estimated
        .saturating_sub(stats.llm_cache_hits);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::storage::Store;
    use std::sync::Arc;

    fn step_runtime(store: Arc<Store>, step_size: i64, restore: bool) -> StorytellerRuntime {
        let mut config = AppConfig::default();
        config.storyteller.step_size = step_size;
        config.storyteller.step_resume_mode = if restore {
            StepResumeMode::Restore
        } else {
            StepResumeMode::Continue
        };
        StorytellerRuntime {
            store,
            config: Arc::new(config),
            entity_llm: None,
            narration_llm: None,
            refine_llm: None,
            memory: None,
        }
    }

    fn seed_book(store: &Store, chapter_count: i64) -> i64 {
        store
            .session(|sess| {
                let book = sess.get_or_create_book(Some("凡人修仙传"), None, "bh", "x.txt")?;
                for idx in 1..=chapter_count {
                    let text = format!("第{idx}章正文，韩立的经历第{idx}段，情节推进。");
                    let chapter = sess.upsert_chapter(
                        book.id,
                        idx,
                        &format!("第{idx}章"),
                        &format!("ch{idx}"),
                        0,
                        0,
                    )?;
                    sess.upsert_chunk(
                        chapter.id,
                        1,
                        &format!("k{idx}"),
                        &text,
                        text.chars().count() as i64,
                        0,
                        text.chars().count() as i64,
                        None,
                    )?;
                }
                Ok(book.id)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn step_run_persists_anchor_narrations_and_checkpoints() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let book_id = seed_book(&store, 4);
        let runtime = step_runtime(store.clone(), 2, false);

        let stats = storytell_book_steps(&runtime, book_id, None, None)
            .await
            .unwrap();
        assert_eq!(stats.steps_total, 2);
        assert_eq!(stats.steps_processed, 2);
        assert_eq!(stats.checkpoints_written, 2);
        assert_eq!(stats.chapters_covered, 4);

        store
            .read(|sess| {
                // Anchors are chapters 2 and 4.
                let narrations = sess.list_latest_narrations_by_book(book_id)?;
                let anchors: Vec<i64> = narrations.iter().map(|n| n.chapter_idx).collect();
                assert_eq!(anchors, vec![2, 4]);
                for narration in &narrations {
                    assert_eq!(narration.prompt_version, STEP_NARRATION_PROMPT_VERSION);
                    let output = sess.get_narration_output(narration.id)?.unwrap();
                    let payload: NarrationPayload = serde_json::from_str(&output.payload_json)?;
                    assert!(payload.step_start_chapter_idx.is_some());
                }
                assert!(sess.get_checkpoint(book_id, 2, 2)?.is_some());
                assert!(sess.get_checkpoint(book_id, 4, 2)?.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn rerun_is_cache_hits_with_no_new_rows() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let book_id = seed_book(&store, 4);
        let runtime = step_runtime(store.clone(), 2, true);

        let first = storytell_book_steps(&runtime, book_id, None, None)
            .await
            .unwrap();
        assert_eq!(first.steps_processed, 2);

        let second = storytell_book_steps(&runtime, book_id, None, None)
            .await
            .unwrap();
        assert_eq!(second.steps_processed, 0);
        assert_eq!(second.steps_cached, 2);

        store
            .read(|sess| {
                assert_eq!(sess.list_narrations_by_book(book_id)?.len(), 2);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn bounds_are_aligned_to_step_boundaries() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let book_id = seed_book(&store, 10);
        let runtime = step_runtime(store.clone(), 5, false);

        let stats = storytell_book_steps(&runtime, book_id, Some(7), Some(7))
            .await
            .unwrap();
        // 7 aligns down to 6 and up to 10: one full step.
        assert_eq!(stats.steps_total, 1);
        assert_eq!(stats.chapters_covered, 5);
        store
            .read(|sess| {
                let narrations = sess.list_latest_narrations_by_book(book_id)?;
                assert_eq!(narrations.len(), 1);
                assert_eq!(narrations[0].chapter_idx, 10);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn restore_mode_replays_to_a_clean_baseline() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let book_id = seed_book(&store, 4);
        let runtime = step_runtime(store.clone(), 2, true);

        storytell_book_steps(&runtime, book_id, None, None)
            .await
            .unwrap();

        // Pollute world-state after the run.
        store
            .session(|sess| {
                sess.insert_plot_event(book_id, 3, "污染事件", None, None, None)?;
                Ok(())
            })
            .unwrap();

        // Re-running the second step restores the checkpoint at 2
        // first, wiping the pollution.
        storytell_book_steps(&runtime, book_id, Some(3), Some(4))
            .await
            .unwrap();
        store
            .read(|sess| {
                let events = sess.list_plot_events_by_book(book_id)?;
                assert!(events.iter().all(|e| e.event_summary != "污染事件"));
                Ok(())
            })
            .unwrap();
    }
}
