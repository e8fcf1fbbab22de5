//! Hybrid memory retrieval.
//!
//! Dense candidates (chunk and narration vectors, rank-normalized)
//! fuse with FTS keyword candidates under a linear score
//! `α·vector + (1-α)·keyword + β·proximity`. The causal filter is
//! mandatory: no hit at or after the querying chapter survives.
//! This module also owns the retrieval-assets builder that embeds
//! new rows and rebuilds the book-scoped FTS indexes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::llm::{EmbeddingProvider, LlmError};
use crate::storage::{SearchHitRow, Store, StoreError};
use crate::vector::{VectorRecord, VectorStore, VectorStoreError, VectorTableKind};

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vector(#[from] VectorStoreError),

    #[error(transparent)]
    Embedding(#[from] LlmError),
}

/// One retrieved memory, ready for prompt injection and evidence use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub source_type: String,
    pub source_id: i64,
    pub chapter_idx: i64,
    pub chapter_title: String,
    pub text: String,
    pub vector_rank_score: f64,
    pub keyword_rank_score: f64,
    pub proximity_score: f64,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct MemoryQuery {
    pub book_id: i64,
    pub query_text: String,
    pub top_k: usize,
    pub current_chapter_idx: Option<i64>,
    pub keyword_terms: Vec<String>,
}

/// Seam used by the storyteller graph; swapped for a stub in tests.
#[async_trait]
pub trait MemoryRetriever: Send + Sync {
    async fn retrieve(&self, query: &MemoryQuery) -> Result<Vec<MemoryHit>, RetrievalError>;

    /// Batched variant sharing the store handles; causal filtering
    /// stays per-query.
    async fn retrieve_batch(
        &self,
        queries: &[MemoryQuery],
    ) -> Vec<Result<Vec<MemoryHit>, RetrievalError>> {
        let futures = queries.iter().map(|query| self.retrieve(query));
        join_all(futures).await
    }
}

static KEYWORD_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\u{4e00}-\u{9fff}A-Za-z0-9_]{2,20}").expect("static regex"));

const MAX_KEYWORD_TERMS: usize = 8;
const SNIPPET_MAX_CHARS: usize = 800;

fn extract_keyword_terms(query_text: &str, terms: &[String]) -> Vec<String> {
    let mut values: Vec<String> = terms.iter().map(|t| t.trim().to_string()).collect();
    values.extend(
        KEYWORD_TOKEN
            .find_iter(query_text)
            .map(|m| m.as_str().to_string()),
    );

    let mut seen = std::collections::HashSet::new();
    let mut output = Vec::new();
    for value in values {
        if value.is_empty() || !seen.insert(value.clone()) {
            continue;
        }
        output.push(value);
        if output.len() >= MAX_KEYWORD_TERMS {
            break;
        }
    }
    output
}

fn build_fts_query(terms: &[String]) -> String {
    let quoted: Vec<String> = terms
        .iter()
        .map(|term| term.replace('"', ""))
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{term}\""))
        .collect();
    quoted.join(" OR ")
}

fn norm_rank(rank: usize, size: usize) -> f64 {
    if size == 0 {
        return 0.0;
    }
    (1.0 - (rank as f64 - 1.0) / size as f64).max(0.0)
}

fn proximity_score(current_chapter_idx: Option<i64>, source_chapter_idx: i64) -> f64 {
    match current_chapter_idx {
        Some(current) if source_chapter_idx < current => {
            1.0 / (1.0 + (current - source_chapter_idx) as f64)
        }
        _ => 0.0,
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

struct Candidate {
    source_type: &'static str,
    source_id: i64,
    chapter_idx: i64,
    chapter_title: String,
    text: String,
    vector_rank_score: f64,
    keyword_rank_score: f64,
}

pub struct HybridRetriever {
    store: Arc<Store>,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    pub alpha: f64,
    pub beta: f64,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<Store>,
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
            alpha: 0.7,
            beta: 0.2,
        }
    }

    async fn vector_candidates(
        &self,
        book_id: i64,
        kind: VectorTableKind,
        source_type: &'static str,
        query_vector: &[f32],
        fetch: usize,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let hits = self.vectors.query(book_id, kind, query_vector, fetch)?;
        let size = hits.len();
        Ok(hits
            .into_iter()
            .enumerate()
            .map(|(i, hit)| Candidate {
                source_type,
                source_id: hit.source_id,
                chapter_idx: hit.chapter_idx,
                chapter_title: hit.chapter_title,
                text: hit.text,
                vector_rank_score: norm_rank(i + 1, size),
                keyword_rank_score: 0.0,
            })
            .collect())
    }

    fn keyword_candidates(
        &self,
        query: &MemoryQuery,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let terms = extract_keyword_terms(&query.query_text, &query.keyword_terms);
        let fts_query = build_fts_query(&terms);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let (chunk_hits, narration_hits) = self.store.read(|sess| {
            let chunk_hits = sess.search_chunks_fts(
                query.book_id,
                &fts_query,
                query.current_chapter_idx,
                (query.top_k * 3).max(query.top_k) as i64,
            )?;
            let narration_hits = sess.search_narrations_fts(
                query.book_id,
                &fts_query,
                query.current_chapter_idx,
                (query.top_k * 2).max(query.top_k) as i64,
            )?;
            Ok((chunk_hits, narration_hits))
        })?;

        let merged: Vec<SearchHitRow> = chunk_hits.into_iter().chain(narration_hits).collect();
        let size = merged.len();
        Ok(merged
            .into_iter()
            .enumerate()
            .map(|(i, hit)| Candidate {
                source_type: hit.source_type,
                source_id: hit.source_id,
                chapter_idx: hit.chapter_idx,
                chapter_title: hit.chapter_title,
                text: hit.text,
                vector_rank_score: 0.0,
                keyword_rank_score: norm_rank(i + 1, size),
            })
            .collect())
    }
}

#[async_trait]
impl MemoryRetriever for HybridRetriever {
    async fn retrieve(&self, query: &MemoryQuery) -> Result<Vec<MemoryHit>, RetrievalError> {
        if query.top_k == 0 {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<Candidate> = Vec::new();

        match self.embedder.embed_query(&query.query_text).await {
            Ok(query_vector) => {
                match self
                    .vector_candidates(
                        query.book_id,
                        VectorTableKind::Chunks,
                        "chunk",
                        &query_vector,
                        (query.top_k * 3).max(query.top_k),
                    )
                    .await
                {
                    Ok(hits) => candidates.extend(hits),
                    Err(err) => log::warn!("Chunk vector retrieval failed: {err}"),
                }
                match self
                    .vector_candidates(
                        query.book_id,
                        VectorTableKind::Narrations,
                        "narration",
                        &query_vector,
                        (query.top_k * 2).max(query.top_k),
                    )
                    .await
                {
                    Ok(hits) => candidates.extend(hits),
                    Err(err) => log::warn!("Narration vector retrieval failed: {err}"),
                }
            }
            Err(err) => log::warn!("Query embedding failed, keyword-only retrieval: {err}"),
        }

        match self.keyword_candidates(query) {
            Ok(hits) => candidates.extend(hits),
            Err(err) => log::warn!("FTS retrieval failed: {err}"),
        }

        // Fuse by (source_type, source_id): max of each component.
        let mut fused: HashMap<(String, i64), MemoryHit> = HashMap::new();
        for candidate in candidates {
            if let Some(current) = query.current_chapter_idx {
                if candidate.chapter_idx >= current {
                    continue;
                }
            }
            let key = (candidate.source_type.to_string(), candidate.source_id);
            let entry = fused.entry(key).or_insert_with(|| MemoryHit {
                source_type: candidate.source_type.to_string(),
                source_id: candidate.source_id,
                chapter_idx: candidate.chapter_idx,
                chapter_title: candidate.chapter_title.clone(),
                text: truncate_chars(&candidate.text, SNIPPET_MAX_CHARS),
                vector_rank_score: 0.0,
                keyword_rank_score: 0.0,
                proximity_score: 0.0,
                score: 0.0,
            });
            entry.vector_rank_score = entry.vector_rank_score.max(candidate.vector_rank_score);
            entry.keyword_rank_score = entry.keyword_rank_score.max(candidate.keyword_rank_score);
        }

        let mut results: Vec<MemoryHit> = fused
            .into_values()
            .map(|mut hit| {
                hit.proximity_score = proximity_score(query.current_chapter_idx, hit.chapter_idx);
                hit.score = self.alpha * hit.vector_rank_score
                    + (1.0 - self.alpha) * hit.keyword_rank_score
                    + self.beta * hit.proximity_score;
                hit
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        results.truncate(query.top_k);
        Ok(results)
    }
}

// ─── Retrieval asset build ──────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RetrievalAssetsStats {
    pub book_id: i64,
    pub chunk_vectors_embedded: usize,
    pub narration_vectors_embedded: usize,
    pub chunk_fts_rows: i64,
    pub narration_fts_rows: i64,
}

/// Embed all chunks that do not yet have vectors. O(new rows).
pub async fn embed_book_chunks(
    store: &Store,
    vectors: &VectorStore,
    embedder: &dyn EmbeddingProvider,
    book_id: i64,
    batch_size: usize,
) -> Result<usize, RetrievalError> {
    let existing = vectors.list_existing_ids(book_id, VectorTableKind::Chunks)?;

    let mut pending: Vec<(i64, i64, String, String)> = Vec::new();
    store.read(|sess| {
        for chapter in sess.list_chapters(book_id)? {
            for chunk in sess.list_chunks(chapter.id)? {
                if existing.contains(&chunk.id) {
                    continue;
                }
                pending.push((chunk.id, chapter.idx, chapter.title.clone(), chunk.text));
            }
        }
        Ok(())
    })?;

    let mut embedded = 0_usize;
    for batch in pending.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|(_, _, _, text)| text.clone()).collect();
        let embeddings = embedder.embed_documents(&texts).await?;
        let records: Vec<VectorRecord> = batch
            .iter()
            .zip(embeddings)
            .map(|((id, chapter_idx, title, text), vector)| VectorRecord {
                source_id: *id,
                chapter_idx: *chapter_idx,
                chapter_title: title.clone(),
                text: text.clone(),
                vector,
            })
            .collect();
        embedded += vectors.append(book_id, VectorTableKind::Chunks, &records)?;
    }
    log::info!(
        "Chunk embedding complete book_id={book_id} embedded={embedded} skipped={}",
        existing.len()
    );
    Ok(embedded)
}

/// Embed all narrations without vectors.
pub async fn embed_book_narrations(
    store: &Store,
    vectors: &VectorStore,
    embedder: &dyn EmbeddingProvider,
    book_id: i64,
    batch_size: usize,
) -> Result<usize, RetrievalError> {
    let existing = vectors.list_existing_ids(book_id, VectorTableKind::Narrations)?;

    let mut pending: Vec<(i64, i64, String, String)> = Vec::new();
    store.read(|sess| {
        let titles: HashMap<i64, String> = sess
            .list_chapters(book_id)?
            .into_iter()
            .map(|chapter| (chapter.id, chapter.title))
            .collect();
        for narration in sess.list_narrations_by_book(book_id)? {
            if existing.contains(&narration.id) {
                continue;
            }
            let title = titles
                .get(&narration.chapter_id)
                .cloned()
                .unwrap_or_default();
            pending.push((
                narration.id,
                narration.chapter_idx,
                title,
                narration.narration_text,
            ));
        }
        Ok(())
    })?;

    let mut embedded = 0_usize;
    for batch in pending.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|(_, _, _, text)| text.clone()).collect();
        let embeddings = embedder.embed_documents(&texts).await?;
        let records: Vec<VectorRecord> = batch
            .iter()
            .zip(embeddings)
            .map(|((id, chapter_idx, title, text), vector)| VectorRecord {
                source_id: *id,
                chapter_idx: *chapter_idx,
                chapter_title: title.clone(),
                text: text.clone(),
                vector,
            })
            .collect();
        embedded += vectors.append(book_id, VectorTableKind::Narrations, &records)?;
    }
    log::info!("Narration embedding complete book_id={book_id} embedded={embedded}");
    Ok(embedded)
}

/// Build everything retrieval needs: vectors for new rows, and the
/// two book-scoped FTS indexes.
pub async fn prepare_retrieval_assets(
    store: &Store,
    vectors: &VectorStore,
    embedder: &dyn EmbeddingProvider,
    book_id: i64,
    batch_size: usize,
) -> Result<RetrievalAssetsStats, RetrievalError> {
    let chunk_vectors_embedded =
        embed_book_chunks(store, vectors, embedder, book_id, batch_size).await?;
    let narration_vectors_embedded =
        embed_book_narrations(store, vectors, embedder, book_id, batch_size).await?;

    let (chunk_fts_rows, narration_fts_rows) = match store.session(|sess| {
        let chunk_rows = sess.rebuild_chunks_fts_for_book(book_id)?;
        let narration_rows = sess.rebuild_narrations_fts_for_book(book_id)?;
        Ok((chunk_rows, narration_rows))
    }) {
        Ok(rows) => rows,
        Err(err) => {
            log::warn!("FTS index rebuild skipped: {err}");
            (0, 0)
        }
    };

    Ok(RetrievalAssetsStats {
        book_id,
        chunk_vectors_embedded,
        narration_vectors_embedded,
        chunk_fts_rows,
        narration_fts_rows,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic embedder for retrieval tests.

    use super::*;

    /// Maps known texts to fixed vectors; unknown texts get a zero
    /// vector of the same dimension.
    pub struct FixedEmbedder {
        pub dimension: usize,
        pub table: HashMap<String, Vec<f32>>,
    }

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts
                .iter()
                .map(|text| {
                    self.table
                        .get(text)
                        .cloned()
                        .unwrap_or_else(|| vec![0.0; self.dimension])
                })
                .collect())
        }

        fn model_identifier(&self) -> String {
            "test/fixed/embedder".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedEmbedder;
    use super::*;
    use crate::vector::VectorRecord;

    fn seeded_retriever() -> HybridRetriever {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let vectors = Arc::new(VectorStore::open_in_memory().unwrap());
        // Similarity order for the query: ch2 > ch1 > ch3 > ch8.
        vectors
            .append(
                1,
                VectorTableKind::Chunks,
                &[
                    VectorRecord {
                        source_id: 11,
                        chapter_idx: 1,
                        chapter_title: "第1章".into(),
                        text: "chapter one text".into(),
                        vector: vec![0.9, 0.1],
                    },
                    VectorRecord {
                        source_id: 13,
                        chapter_idx: 3,
                        chapter_title: "第3章".into(),
                        text: "chapter three text".into(),
                        vector: vec![0.5, 0.5],
                    },
                    VectorRecord {
                        source_id: 18,
                        chapter_idx: 8,
                        chapter_title: "第8章".into(),
                        text: "chapter eight text".into(),
                        vector: vec![0.0, 1.0],
                    },
                    VectorRecord {
                        source_id: 12,
                        chapter_idx: 2,
                        chapter_title: "第2章".into(),
                        text: "chapter two text".into(),
                        vector: vec![1.0, 0.0],
                    },
                ],
            )
            .unwrap();

        let mut table = HashMap::new();
        table.insert("query".to_string(), vec![1.0_f32, 0.0]);
        let embedder = Arc::new(FixedEmbedder {
            dimension: 2,
            table,
        });
        HybridRetriever::new(store, vectors, embedder)
    }

    #[tokio::test]
    async fn causal_filter_drops_current_and_future_chapters() {
        let retriever = seeded_retriever();
        let query = MemoryQuery {
            book_id: 1,
            query_text: "query".into(),
            top_k: 2,
            current_chapter_idx: Some(3),
            keyword_terms: Vec::new(),
        };
        let hits = retriever.retrieve(&query).await.unwrap();
        let indexes: Vec<i64> = hits.iter().map(|h| h.chapter_idx).collect();
        assert_eq!(indexes, vec![2, 1]);
        for hit in &hits {
            assert!(hit.chapter_idx < 3);
        }
    }

    #[tokio::test]
    async fn no_current_chapter_means_no_filter() {
        let retriever = seeded_retriever();
        let query = MemoryQuery {
            book_id: 1,
            query_text: "query".into(),
            top_k: 10,
            current_chapter_idx: None,
            keyword_terms: Vec::new(),
        };
        let hits = retriever.retrieve(&query).await.unwrap();
        assert_eq!(hits.len(), 4);
        // Pure vector ranking with no proximity bias.
        assert_eq!(hits[0].chapter_idx, 2);
        assert!(hits.iter().all(|h| h.proximity_score == 0.0));
    }

    #[tokio::test]
    async fn batched_queries_keep_per_query_filters() {
        let retriever = seeded_retriever();
        let queries = vec![
            MemoryQuery {
                book_id: 1,
                query_text: "query".into(),
                top_k: 10,
                current_chapter_idx: Some(2),
                keyword_terms: Vec::new(),
            },
            MemoryQuery {
                book_id: 1,
                query_text: "query".into(),
                top_k: 10,
                current_chapter_idx: Some(9),
                keyword_terms: Vec::new(),
            },
        ];
        let results = retriever.retrieve_batch(&queries).await;
        let first = results[0].as_ref().unwrap();
        let second = results[1].as_ref().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].chapter_idx, 1);
        assert_eq!(second.len(), 4);
    }

    #[test]
    fn keyword_terms_are_deduped_quoted_and_capped() {
        let provided: Vec<String> = (0..6).map(|i| format!("term{i}")).collect();
        let terms = extract_keyword_terms("韩立 韩立 青牛镇 extra words here", &provided);
        assert_eq!(terms.len(), MAX_KEYWORD_TERMS);
        assert_eq!(terms[0], "term0");
        let fts = build_fts_query(&terms);
        assert!(fts.contains("\"term0\" OR "));
        assert!(!fts.contains("韩立\" OR \"韩立"));
    }

    #[test]
    fn rank_normalization_and_proximity() {
        assert_eq!(norm_rank(1, 4), 1.0);
        assert_eq!(norm_rank(4, 4), 0.25);
        assert_eq!(norm_rank(1, 0), 0.0);
        assert_eq!(proximity_score(Some(3), 2), 0.5);
        assert_eq!(proximity_score(Some(3), 3), 0.0);
        assert_eq!(proximity_score(None, 1), 0.0);
    }
}
