//! Legacy v1 map-reduce summaries.
//!
//! Kept for the `summarize` command and the legacy export path: one
//! summary per chapter, then a book-level reduce producing the
//! summary, character table, timeline and story payloads. Every row
//! is content-addressed in the `summaries` table, so re-running with
//! unchanged inputs writes nothing.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tera::{Context, Tera};

use crate::config::AppConfig;
use crate::hashing::{make_cache_key, sha256_text};
use crate::llm::{LlmClient, LogContext};
use crate::storage::Store;
use crate::storyteller::GraphError;

pub const CHAPTER_PROMPT_VERSION: &str = "v1-chapter";
pub const BOOK_PROMPT_VERSION: &str = "v1-book";

const CHAPTER_SYSTEM: &str =
    "你是一个严谨的小说章节摘要助手。只输出严格有效 JSON，不要输出 markdown。";
const CHAPTER_USER: &str = r#"语言：{{ language }}
风格：{{ style }}
请为以下章节生成 {{ words_low }}~{{ words_high }} 字的摘要，输出 JSON：
{% raw %}{"summary": "string", "events": [], "characters": []}{% endraw %}

章节标题：{{ chapter_title }}
<chapter_text>
{{ chapter_text }}
</chapter_text>
"#;

const BOOK_SYSTEM: &str =
    "你是一个严谨的整本书汇总助手。只输出严格有效 JSON，不要输出 markdown。";
const BOOK_USER: &str = r#"语言：{{ language }}
风格：{{ style }}
以下是各章节摘要（JSON 数组），请汇总输出 {{ words_low }}~{{ words_high }} 字的全书总结，
并给出人物表与时间线。输出 JSON：
{% raw %}{"summary": "string", "characters": [{"name":"string","aliases":[],"relationships":"string","motivation":"string","changes":"string"}], "timeline": [{"chapter_idx":1,"event":"string","impact":"string"}], "story": "string"}{% endraw %}

<chapter_summaries>
{{ chapter_summaries }}
</chapter_summaries>
"#;

#[derive(Debug, Default, Deserialize)]
struct ChapterSummaryPayload {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    events: Vec<serde_json::Value>,
    #[serde(default)]
    characters: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct BookSummaryPayload {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    characters: Vec<serde_json::Value>,
    #[serde(default)]
    timeline: Vec<serde_json::Value>,
    #[serde(default)]
    story: String,
}

#[derive(Debug, Clone, Default)]
pub struct SummarizeStats {
    pub book_id: i64,
    pub chapters_total: usize,
    pub chapters_new: usize,
    pub book_summary_new: bool,
    pub characters_new: bool,
    pub timeline_new: bool,
    pub story_new: bool,
}

pub async fn summarize_book(
    store: &Store,
    config: &AppConfig,
    client: Arc<LlmClient>,
    book_id: i64,
) -> Result<SummarizeStats, GraphError> {
    let mut stats = SummarizeStats {
        book_id,
        ..Default::default()
    };
    let summarize = &config.summarize;
    let chapters = store.read(|sess| sess.list_chapters(book_id))?;
    stats.chapters_total = chapters.len();

    let mut chapter_summaries: Vec<serde_json::Value> = Vec::new();
    for chapter in &chapters {
        let text = store.read(|sess| sess.chapter_text(chapter.id))?;
        if text.is_empty() {
            continue;
        }
        let input_hash = sha256_text(&format!("{}::{}::{}", chapter.chapter_hash, summarize.style, text));

        let existing = store.read(|sess| {
            sess.get_summary(
                "chapter",
                chapter.id,
                "chapter_summary",
                CHAPTER_PROMPT_VERSION,
                &client.model_identifier,
                &input_hash,
            )
        })?;
        let payload = match existing {
            Some(row) => serde_json::from_str::<serde_json::Value>(&row.content)
                .unwrap_or_else(|_| json!({"summary": row.content})),
            None => {
                let mut context = Context::new();
                context.insert("language", &summarize.language);
                context.insert("style", &summarize.style);
                context.insert("words_low", &summarize.chapter_summary_words.0);
                context.insert("words_high", &summarize.chapter_summary_words.1);
                context.insert("chapter_title", &chapter.title);
                context.insert("chapter_text", &text);
                let user = Tera::one_off(CHAPTER_USER, &context, false)
                    .map_err(|err| GraphError::Prompt(err.to_string()))?;
                let cache_key = make_cache_key(&[
                    "summarize_chapter",
                    &client.model_identifier,
                    CHAPTER_PROMPT_VERSION,
                    &input_hash,
                ]);
                let log_ctx = LogContext::for_node("summarize_chapter", chapter.id, chapter.idx)
                    .with_input_hash(&input_hash);
                let (_, parsed): (_, ChapterSummaryPayload) = client
                    .complete_json(CHAPTER_SYSTEM, &user, &cache_key, &log_ctx)
                    .await?;
                let content = json!({
                    "summary": parsed.summary,
                    "events": parsed.events,
                    "characters": parsed.characters,
                    "chapter_idx": chapter.idx,
                    "chapter_title": chapter.title,
                });
                let inserted = store.session(|sess| {
                    sess.upsert_summary(
                        "chapter",
                        chapter.id,
                        "chapter_summary",
                        CHAPTER_PROMPT_VERSION,
                        &client.model_identifier,
                        &input_hash,
                        &serde_json::to_string(&content)?,
                        None,
                    )
                })?;
                if inserted.inserted {
                    stats.chapters_new += 1;
                }
                content
            }
        };
        chapter_summaries.push(payload);
    }

    if chapter_summaries.is_empty() {
        return Ok(stats);
    }

    let summaries_json = serde_json::to_string(&chapter_summaries)?;
    let book_input_hash = sha256_text(&format!("{}::{}", summarize.style, summaries_json));
    let existing = store.read(|sess| {
        sess.get_summary(
            "book",
            book_id,
            "book_summary",
            BOOK_PROMPT_VERSION,
            &client.model_identifier,
            &book_input_hash,
        )
    })?;
    if existing.is_some() {
        log::info!("Book summary already exists for current input hash; skipped");
        return Ok(stats);
    }

    let mut context = Context::new();
    context.insert("language", &summarize.language);
    context.insert("style", &summarize.style);
    context.insert("words_low", &summarize.book_summary_words.0);
    context.insert("words_high", &summarize.book_summary_words.1);
    context.insert("chapter_summaries", &summaries_json);
    let user = Tera::one_off(BOOK_USER, &context, false)
        .map_err(|err| GraphError::Prompt(err.to_string()))?;
    let cache_key = make_cache_key(&[
        "summarize_book",
        &client.model_identifier,
        BOOK_PROMPT_VERSION,
        &book_input_hash,
    ]);
    let log_ctx = LogContext {
        node: Some("summarize_book".to_string()),
        ..Default::default()
    };
    let (_, parsed): (_, BookSummaryPayload) = client
        .complete_json(BOOK_SYSTEM, &user, &cache_key, &log_ctx)
        .await?;

    let rows = [
        ("book_summary", json!({"summary": parsed.summary})),
        ("characters", json!({"characters": parsed.characters})),
        ("timeline", json!({"events": parsed.timeline})),
        ("story", json!({"story": parsed.story})),
    ];
    for (summary_type, content) in rows {
        let inserted = store.session(|sess| {
            sess.upsert_summary(
                "book",
                book_id,
                summary_type,
                BOOK_PROMPT_VERSION,
                &client.model_identifier,
                &book_input_hash,
                &serde_json::to_string(&content)?,
                None,
            )
        })?;
        match summary_type {
            "book_summary" => stats.book_summary_new = inserted.inserted,
            "characters" => stats.characters_new = inserted.inserted,
            "timeline" => stats.timeline_new = inserted.inserted,
            _ => stats.story_new = inserted.inserted,
        }
    }

    Ok(stats)
}
