//! Content-addressed identity.
//!
//! Every persisted artifact — book, chapter, chunk, narration input,
//! step aggregate, LLM call — is keyed by a SHA-256 over the inputs
//! that should invalidate it. Composite keys join their parts with
//! `"::"` before hashing. Twelve-character short forms exist only for
//! log correlation, never for storage.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a UTF-8 string.
pub fn sha256_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Identity of a book: hash of its normalized text.
pub fn book_hash(normalized_text: &str) -> String {
    sha256_text(normalized_text)
}

/// Identity of a chapter within a book.
pub fn chapter_hash(book_hash_value: &str, title: &str, text: &str) -> String {
    sha256_text(&format!("{book_hash_value}::{title}::{text}"))
}

/// Identity of a chunk within a chapter. `split_params` pins the
/// window/overlap/min settings so re-chunking with different knobs
/// produces distinct rows.
pub fn chunk_hash(chapter_hash_value: &str, text: &str, split_params: &str) -> String {
    sha256_text(&format!("{chapter_hash_value}::{split_params}::{text}"))
}

/// Cache key for an LLM call: the `"::"`-joined parts, hashed.
pub fn make_cache_key(parts: &[&str]) -> String {
    sha256_text(&parts.join("::"))
}

/// First 12 chars of a hash, for log lines. `-` when absent.
pub fn short_hash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        &value[..value.len().min(12)]
    }
}
