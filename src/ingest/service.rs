//! Ingest pipeline: file → normalized text → chapters → chunks →
//! rows, persisted in one session.

use std::path::Path;

use crate::config::AppConfig;
use crate::hashing::{book_hash, chapter_hash, chunk_hash};
use crate::storage::Store;

use super::parser::{load_text_auto, normalize_text, parse_chapters};
use super::splitter::split_text;
use super::IngestError;

#[derive(Debug, Clone)]
pub struct IngestStats {
    pub book_id: i64,
    pub book_hash: String,
    pub encoding: String,
    pub encoding_confidence: f64,
    pub chapters_total: usize,
    pub chapters_inserted: usize,
    pub chunks_total: usize,
    pub chunks_inserted: usize,
}

pub fn ingest_book(
    store: &Store,
    config: &AppConfig,
    input_path: &Path,
    title: Option<&str>,
    author: Option<&str>,
    chapter_regex_override: Option<&str>,
) -> Result<IngestStats, IngestError> {
    log::info!("Reading novel text from {}", input_path.display());
    let chapter_regex = chapter_regex_override
        .or(config.ingest.chapter_regex.as_deref());

    let loaded = load_text_auto(input_path, &config.ingest.encoding, chapter_regex)?;
    if loaded.autodetected {
        log::info!(
            "Encoding autodetected encoding={} confidence={:.2} replace_fallback={}",
            loaded.encoding,
            loaded.confidence,
            loaded.used_replace_fallback
        );
    }

    let normalized = normalize_text(&loaded.text, &config.ingest.cleanup);
    if normalized.is_empty() {
        return Err(IngestError::EmptyText {
            path: input_path.display().to_string(),
        });
    }

    let book_hash_value = book_hash(&normalized);
    let chapters = parse_chapters(
        &normalized,
        chapter_regex,
        config.ingest.fallback_chapter_chars,
    )?;
    log::info!("Parsed {} chapters", chapters.len());

    let split_params = config.split.params_string();
    let mut chapters_inserted = 0_usize;
    let mut chunks_inserted = 0_usize;
    let mut chunks_total = 0_usize;

    let book_id = store.session(|sess| {
        let book = sess.get_or_create_book(
            title,
            author,
            &book_hash_value,
            &input_path.display().to_string(),
        )?;

        for chapter in &chapters {
            let chapter_hash_value = chapter_hash(&book_hash_value, &chapter.title, &chapter.text);
            let chapter_row = sess.upsert_chapter(
                book.id,
                chapter.idx,
                &chapter.title,
                &chapter_hash_value,
                chapter.start_pos,
                chapter.end_pos,
            )?;
            if chapter_row.inserted {
                chapters_inserted += 1;
            }

            let chunks = split_text(
                &chapter.text,
                config.split.chunk_size_tokens,
                config.split.chunk_overlap_tokens,
                config.split.min_chunk_tokens,
            );
            chunks_total += chunks.len();

            for chunk in &chunks {
                let chunk_hash_value = chunk_hash(&chapter_hash_value, &chunk.text, &split_params);
                let chunk_row = sess.upsert_chunk(
                    chapter_row.id,
                    chunk.idx,
                    &chunk_hash_value,
                    &chunk.text,
                    chunk.token_count,
                    chunk.start_pos,
                    chunk.end_pos,
                    None,
                )?;
                if chunk_row.inserted {
                    chunks_inserted += 1;
                }
            }
        }
        Ok(book.id)
    })?;

    Ok(IngestStats {
        book_id,
        book_hash: book_hash_value,
        encoding: loaded.encoding,
        encoding_confidence: loaded.confidence,
        chapters_total: chapters.len(),
        chapters_inserted,
        chunks_total,
        chunks_inserted,
    })
}
