//! Markdown export.
//!
//! Storyteller mode reads the latest narration per chapter (greatest
//! `created_at`, tie-broken by id — never all versions) and writes
//! the bundle: per-chapter files, `full_story.md`, `characters.md`,
//! `timeline.md`, `book_summary.md`, `world_state.json`. With no
//! narrations it falls back to the legacy summary tables.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::config::AppConfig;
use crate::storage::{BookRow, NarrationRow, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("book summary not found; run summarize first")]
    MissingLegacySummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    Storyteller,
    Legacy,
    Auto,
}

impl ExportMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "storyteller" => Some(Self::Storyteller),
            "legacy" => Some(Self::Legacy),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportResult {
    pub output_dir: PathBuf,
    pub mode: &'static str,
    pub files: Vec<PathBuf>,
}

/// Replace filesystem-hostile characters and collapse whitespace.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn write_file(path: &Path, content: &str) -> Result<(), ExportError> {
    std::fs::write(path, content).map_err(|source| ExportError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn chapter_file_name(idx: i64, title: &str) -> String {
    format!("{idx:03}_{}.md", sanitize_filename(title))
}

fn render_characters(characters: &[crate::storage::CharacterRow]) -> String {
    if characters.is_empty() {
        return "# 人物表\n\n暂无人物数据。\n".to_string();
    }
    let mut lines = vec![
        "# 人物表".to_string(),
        String::new(),
        "| 姓名 | 别名 | 状态 | 位置 | 首次出场 | 最近出场 |".to_string(),
        "| --- | --- | --- | --- | --- | --- |".to_string(),
    ];
    for character in characters {
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} |",
            character.canonical_name,
            character.aliases().join(", "),
            character.status,
            character.location.as_deref().unwrap_or(""),
            character
                .first_chapter_idx
                .map(|idx| idx.to_string())
                .unwrap_or_default(),
            character
                .last_chapter_idx
                .map(|idx| idx.to_string())
                .unwrap_or_default(),
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn render_timeline(events: &[crate::storage::PlotEventRow]) -> String {
    if events.is_empty() {
        return "# 时间线\n\n暂无事件数据。\n".to_string();
    }
    let mut lines = vec!["# 时间线".to_string(), String::new()];
    for (position, event) in events.iter().enumerate() {
        let mut line = format!(
            "{}. [第{}章] {}",
            position + 1,
            event.chapter_idx,
            event.event_summary
        );
        if let Some(impact) = event.impact.as_deref().filter(|s| !s.is_empty()) {
            line.push_str(&format!("（影响：{impact}）"));
        }
        lines.push(line);
    }
    lines.push(String::new());
    lines.join("\n")
}

fn legacy_content(store: &Store, book_id: i64, summary_type: &str) -> Result<Option<Value>, ExportError> {
    let row = store.read(|sess| sess.get_latest_summary("book", book_id, summary_type))?;
    match row {
        Some(row) => Ok(Some(
            serde_json::from_str(&row.content).unwrap_or(Value::String(row.content)),
        )),
        None => Ok(None),
    }
}

fn export_storyteller_bundle(
    store: &Store,
    book: &BookRow,
    narrations: &[NarrationRow],
    output_dir: &Path,
) -> Result<ExportResult, ExportError> {
    let chapters_dir = output_dir.join("chapters");
    std::fs::create_dir_all(&chapters_dir).map_err(|source| ExportError::Io {
        path: chapters_dir.display().to_string(),
        source,
    })?;

    let titles: std::collections::HashMap<i64, String> = store
        .read(|sess| sess.list_chapters(book.id))?
        .into_iter()
        .map(|chapter| (chapter.id, chapter.title))
        .collect();

    let mut files = Vec::new();
    let mut full_story = vec![format!(
        "# {}\n",
        book.title.as_deref().unwrap_or("(未命名)")
    )];

    for narration in narrations {
        let title = titles
            .get(&narration.chapter_id)
            .cloned()
            .unwrap_or_else(|| format!("第{}章", narration.chapter_idx));
        let chapter_path = chapters_dir.join(chapter_file_name(narration.chapter_idx, &title));
        write_file(
            &chapter_path,
            &format!("# {}\n\n{}\n", title, narration.narration_text),
        )?;
        files.push(chapter_path);
        full_story.push(format!("## {}\n\n{}\n", title, narration.narration_text));
    }

    let (characters, events, snapshot) = store.read(|sess| {
        let characters = sess.list_character_states(book.id, None)?;
        let events = sess.list_plot_events_by_book(book.id)?;
        let snapshot = sess.build_world_state_snapshot(book.id)?;
        Ok((characters, events, snapshot))
    })?;

    let full_story_path = output_dir.join("full_story.md");
    write_file(&full_story_path, &full_story.join("\n"))?;
    files.push(full_story_path);

    let characters_path = output_dir.join("characters.md");
    write_file(&characters_path, &render_characters(&characters))?;
    files.push(characters_path);

    let timeline_path = output_dir.join("timeline.md");
    write_file(&timeline_path, &render_timeline(&events))?;
    files.push(timeline_path);

    let summary_text = match legacy_content(store, book.id, "book_summary")? {
        Some(Value::Object(map)) => map
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some(Value::String(text)) => text,
        _ => format!(
            "共 {} 章已生成说书稿，登场人物 {} 位。",
            narrations.len(),
            characters.len()
        ),
    };
    let summary_path = output_dir.join("book_summary.md");
    write_file(
        &summary_path,
        &format!(
            "# {}\n\n{}\n",
            book.title.as_deref().unwrap_or("(未命名)"),
            summary_text
        ),
    )?;
    files.push(summary_path);

    let world_state_path = output_dir.join("world_state.json");
    let world_state_json = snapshot.to_canonical_json()?;
    write_file(&world_state_path, &world_state_json)?;
    files.push(world_state_path);

    Ok(ExportResult {
        output_dir: output_dir.to_path_buf(),
        mode: "storyteller",
        files,
    })
}

fn export_legacy_bundle(
    store: &Store,
    book: &BookRow,
    output_dir: &Path,
) -> Result<ExportResult, ExportError> {
    let summary = legacy_content(store, book.id, "book_summary")?
        .ok_or(ExportError::MissingLegacySummary)?;
    let summary_text = summary
        .get("summary")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| summary.to_string());

    let characters: Vec<Value> = legacy_content(store, book.id, "characters")?
        .and_then(|v| v.get("characters").cloned())
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    let events: Vec<Value> = legacy_content(store, book.id, "timeline")?
        .and_then(|v| v.get("events").cloned())
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    let story = legacy_content(store, book.id, "story")?
        .and_then(|v| v.get("story").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();

    let mut files = Vec::new();

    let summary_path = output_dir.join("book_summary.md");
    write_file(
        &summary_path,
        &format!(
            "# {}\n\n{}\n",
            book.title.as_deref().unwrap_or("(未命名)"),
            summary_text
        ),
    )?;
    files.push(summary_path);

    let characters_path = output_dir.join("characters.md");
    let characters_md = if characters.is_empty() {
        "# 人物表\n\n暂无人物数据。\n".to_string()
    } else {
        let mut lines = vec![
            "# 人物表".to_string(),
            String::new(),
            "| 姓名 | 别名 | 关系 | 动机/目标 | 变化 |".to_string(),
            "| --- | --- | --- | --- | --- |".to_string(),
        ];
        for item in &characters {
            let aliases = item
                .get("aliases")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            lines.push(format!(
                "| {} | {} | {} | {} | {} |",
                item.get("name").and_then(Value::as_str).unwrap_or(""),
                aliases,
                item.get("relationships").and_then(Value::as_str).unwrap_or(""),
                item.get("motivation").and_then(Value::as_str).unwrap_or(""),
                item.get("changes").and_then(Value::as_str).unwrap_or(""),
            ));
        }
        lines.push(String::new());
        lines.join("\n")
    };
    write_file(&characters_path, &characters_md)?;
    files.push(characters_path);

    let timeline_path = output_dir.join("timeline.md");
    let timeline_md = if events.is_empty() {
        "# 时间线\n\n暂无事件数据。\n".to_string()
    } else {
        let mut lines = vec!["# 时间线".to_string(), String::new()];
        for (position, event) in events.iter().enumerate() {
            let mut line = format!("{}. ", position + 1);
            if let Some(idx) = event.get("chapter_idx").and_then(Value::as_i64) {
                line.push_str(&format!("[第{idx}章] "));
            }
            line.push_str(event.get("event").and_then(Value::as_str).unwrap_or(""));
            if let Some(impact) = event.get("impact").and_then(Value::as_str) {
                if !impact.is_empty() {
                    line.push_str(&format!("（影响：{impact}）"));
                }
            }
            lines.push(line);
        }
        lines.push(String::new());
        lines.join("\n")
    };
    write_file(&timeline_path, &timeline_md)?;
    files.push(timeline_path);

    let story_path = output_dir.join("story.md");
    let story_md = if story.is_empty() {
        "# 说书稿\n\n暂无说书稿数据。\n".to_string()
    } else {
        format!("# 说书稿\n\n{story}\n")
    };
    write_file(&story_path, &story_md)?;
    files.push(story_path);

    Ok(ExportResult {
        output_dir: output_dir.to_path_buf(),
        mode: "legacy",
        files,
    })
}

pub fn export_book_markdown(
    store: &Store,
    config: &AppConfig,
    book_id: i64,
    mode: ExportMode,
) -> Result<ExportResult, ExportError> {
    let book = store.read(|sess| sess.get_book(book_id))?;
    let output_dir = config.app.output_dir.join(&book.book_hash);
    std::fs::create_dir_all(&output_dir).map_err(|source| ExportError::Io {
        path: output_dir.display().to_string(),
        source,
    })?;

    let narrations = store.read(|sess| sess.list_latest_narrations_by_book(book_id))?;
    match mode {
        ExportMode::Legacy => export_legacy_bundle(store, &book, &output_dir),
        ExportMode::Storyteller | ExportMode::Auto => {
            if narrations.is_empty() {
                log::info!("No narrations for book_id={book_id}; legacy export fallback");
                export_legacy_bundle(store, &book, &output_dir)
            } else {
                export_storyteller_bundle(store, &book, &narrations, &output_dir)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::world_state::CharacterUpsert;

    fn seeded_store() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let book_id = store
            .session(|sess| {
                let book =
                    sess.get_or_create_book(Some("凡人修仙传"), Some("忘语"), "bookhash", "x.txt")?;
                let ch1 = sess.upsert_chapter(book.id, 1, "第一章 山边小村", "c1", 0, 0)?;
                let ch2 = sess.upsert_chapter(book.id, 2, "第二章 七玄门?", "c2", 0, 0)?;
                sess.upsert_narration(book.id, ch1.id, 1, "第一章说书稿", None, "v", "m", "h1")?;
                sess.upsert_narration(book.id, ch1.id, 1, "第一章说书稿v2", None, "v", "m", "h1b")?;
                sess.upsert_narration(book.id, ch2.id, 2, "第二章说书稿", None, "v", "m", "h2")?;
                sess.upsert_character_state(
                    book.id,
                    &CharacterUpsert {
                        canonical_name: "韩立".into(),
                        first_chapter_idx: Some(1),
                        last_chapter_idx: Some(2),
                        ..Default::default()
                    },
                )?;
                sess.insert_plot_event(book.id, 1, "入门七玄门", None, None, Some("拜师"))?;
                Ok(book.id)
            })
            .unwrap();
        (store, book_id)
    }

    #[test]
    fn sanitize_replaces_hostile_chars_and_collapses_whitespace() {
        assert_eq!(sanitize_filename("第一章: 山边/小村?"), "第一章_ 山边_小村_");
        assert_eq!(sanitize_filename("a   b\t c"), "a b c");
    }

    #[test]
    fn storyteller_bundle_uses_latest_narrations_only() {
        let (store, book_id) = seeded_store();
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.app.output_dir = dir.path().to_path_buf();

        let result =
            export_book_markdown(&store, &config, book_id, ExportMode::Storyteller).unwrap();
        assert_eq!(result.mode, "storyteller");
        assert!(result.output_dir.ends_with("bookhash"));

        let chapter1 = std::fs::read_to_string(
            result.output_dir.join("chapters/001_第一章 山边小村.md"),
        )
        .unwrap();
        assert!(chapter1.contains("第一章说书稿v2"));
        assert!(!chapter1.contains("第一章说书稿\n"));

        // The hostile title char became an underscore.
        assert!(result.output_dir.join("chapters/002_第二章 七玄门_.md").exists());

        let full = std::fs::read_to_string(result.output_dir.join("full_story.md")).unwrap();
        assert!(full.contains("第二章说书稿"));

        let world_state =
            std::fs::read_to_string(result.output_dir.join("world_state.json")).unwrap();
        let value: Value = serde_json::from_str(&world_state).unwrap();
        assert_eq!(value["characters"][0]["canonical_name"], "韩立");

        let timeline = std::fs::read_to_string(result.output_dir.join("timeline.md")).unwrap();
        assert!(timeline.contains("[第1章] 入门七玄门（影响：拜师）"));
    }

    #[test]
    fn auto_mode_falls_back_to_legacy_and_errors_without_summaries() {
        let store = Store::open_in_memory().unwrap();
        let book_id = store
            .session(|sess| Ok(sess.get_or_create_book(Some("t"), None, "bh2", "x")?.id))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.app.output_dir = dir.path().to_path_buf();

        let err = export_book_markdown(&store, &config, book_id, ExportMode::Auto).unwrap_err();
        assert!(matches!(err, ExportError::MissingLegacySummary));

        store
            .session(|sess| {
                sess.upsert_summary(
                    "book",
                    book_id,
                    "book_summary",
                    "v1",
                    "m",
                    "h",
                    r#"{"summary": "全书总结"}"#,
                    None,
                )?;
                Ok(())
            })
            .unwrap();
        let result = export_book_markdown(&store, &config, book_id, ExportMode::Auto).unwrap();
        assert_eq!(result.mode, "legacy");
        let summary =
            std::fs::read_to_string(result.output_dir.join("book_summary.md")).unwrap();
        assert!(summary.contains("全书总结"));
    }
}
