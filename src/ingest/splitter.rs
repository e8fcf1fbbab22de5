//! Sliding-window chunking.
//!
//! Windows are measured in estimated tokens; the estimator counts
//! characters, which is the right granularity for CJK-heavy text. A
//! trailing segment shorter than `min_chunk_tokens` is merged into
//! the previous chunk and terminates the scan.

#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub idx: i64,
    pub text: String,
    pub start_pos: i64,
    pub end_pos: i64,
    pub token_count: i64,
}

fn estimate_tokens(text: &str) -> i64 {
    text.chars().count() as i64
}

pub fn split_text(
    text: &str,
    chunk_size_tokens: usize,
    chunk_overlap_tokens: usize,
    min_chunk_tokens: usize,
) -> Vec<TextChunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let length = chars.len();
    if length <= chunk_size_tokens {
        return vec![TextChunk {
            idx: 1,
            text: text.to_string(),
            start_pos: 0,
            end_pos: length as i64,
            token_count: estimate_tokens(text),
        }];
    }

    let mut chunks: Vec<TextChunk> = Vec::new();
    let mut start = 0_usize;
    let mut idx = 1_i64;
    while start < length {
        let end = (start + chunk_size_tokens).min(length);
        let segment: String = chars[start..end].iter().collect();
        let token_count = estimate_tokens(&segment);

        if (token_count as usize) < min_chunk_tokens && !chunks.is_empty() {
            let prev = chunks.last_mut().expect("non-empty");
            prev.text.push_str(&segment);
            prev.end_pos = end as i64;
            prev.token_count = estimate_tokens(&prev.text);
            break;
        }

        chunks.push(TextChunk {
            idx,
            text: segment,
            start_pos: start as i64,
            end_pos: end as i64,
            token_count,
        });
        idx += 1;
        if end == length {
            break;
        }
        start = end.saturating_sub(chunk_overlap_tokens);
        if start == end {
            start = end + 1;
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_returns_empty() {
        assert!(split_text("", 4, 1, 2).is_empty());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = split_text("abcd", 10, 2, 2);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "abcd");
        assert_eq!(chunks[0].start_pos, 0);
        assert_eq!(chunks[0].end_pos, 4);
    }

    #[test]
    fn overlap_and_short_tail_merge() {
        let chunks = split_text("abcdefghi", 4, 1, 4);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "abcd");
        assert_eq!(chunks[1].text, "defgghi");
        assert_eq!(chunks[1].start_pos, 3);
        assert_eq!(chunks[1].end_pos, 9);
    }

    #[test]
    fn positions_count_characters_not_bytes() {
        let text = "一二三四五六七八九";
        let chunks = split_text(text, 4, 1, 4);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "一二三四");
        assert_eq!(chunks[1].text, "四五六七八九");
        assert_eq!(chunks[1].start_pos, 3);
        assert_eq!(chunks[1].end_pos, 9);
        assert_eq!(chunks[1].token_count, 6);
    }
}
