//! Text loading with encoding autodetection, normalization, and
//! chapter segmentation.
//!
//! All positions in this module are character offsets into the
//! normalized text (the chunker slices by character as well, so the
//! two layers agree for CJK-heavy sources).

use std::path::Path;

use encoding_rs::Encoding;
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::config::schema::IngestCleanup;

use super::IngestError;

#[derive(Debug, Clone)]
pub struct ParsedChapter {
    pub idx: i64,
    pub title: String,
    pub text: String,
    pub start_pos: i64,
    pub end_pos: i64,
}

#[derive(Debug, Clone)]
pub struct TextLoadResult {
    pub text: String,
    pub encoding: String,
    pub autodetected: bool,
    pub confidence: f64,
    pub used_replace_fallback: bool,
}

static DEFAULT_CHAPTER_TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^第[0-9一二三四五六七八九十百千]+章.*$").expect("static regex")
});

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

fn is_cjk(codepoint: u32) -> bool {
    matches!(
        codepoint,
        0x4E00..=0x9FFF
            | 0x3400..=0x4DBF
            | 0xF900..=0xFAFF
            | 0x20000..=0x2A6DF
            | 0x2A700..=0x2B73F
            | 0x2B740..=0x2B81F
            | 0x2B820..=0x2CEAF
    )
}

fn is_cjk_punctuation(codepoint: u32) -> bool {
    matches!(codepoint, 0x3000..=0x303F | 0xFF00..=0xFFEF)
}

fn is_expected_text_char(ch: char) -> bool {
    if matches!(ch, '\n' | '\r' | '\t') {
        return true;
    }
    if ch.is_ascii() && !ch.is_ascii_control() {
        return true;
    }
    let codepoint = ch as u32;
    is_cjk(codepoint) || is_cjk_punctuation(codepoint)
}

/// Weighted score of a decoded candidate: proportion of expected
/// characters, CJK density, chapter-title hits, minus control noise.
fn score_decoded_text(text: &str, chapter_regex: Option<&str>) -> f64 {
    if text.is_empty() {
        return -1e9;
    }
    let sample: String = text.chars().take(120_000).collect();
    let total = sample.chars().count() as f64;
    let mut expected = 0_f64;
    let mut cjk = 0_f64;
    let mut control = 0_f64;
    for ch in sample.chars() {
        if is_expected_text_char(ch) {
            expected += 1.0;
            if is_cjk(ch as u32) {
                cjk += 1.0;
            }
        } else if ch.is_control() {
            control += 1.0;
        }
    }

    let chapter_hits = match chapter_regex {
        Some(pattern) => regex::RegexBuilder::new(pattern)
            .multi_line(true)
            .build()
            .map(|re| re.find_iter(&sample).count())
            .unwrap_or(0),
        None => DEFAULT_CHAPTER_TITLE.find_iter(&sample).count(),
    };

    (expected / total) * 100.0 + (cjk / total) * 20.0 + (chapter_hits.min(300) as f64) * 0.5
        - (control / total) * 200.0
}

/// Candidate order matters: a stable sort keeps the earlier candidate
/// on score ties.
fn decode_candidates(raw: &[u8]) -> Vec<(String, String)> {
    let mut candidates = Vec::new();

    if raw.starts_with(UTF8_BOM) {
        if let Ok(text) = std::str::from_utf8(&raw[UTF8_BOM.len()..]) {
            candidates.push(("utf-8-sig".to_string(), text.to_string()));
        }
    }
    if let Ok(text) = std::str::from_utf8(raw) {
        candidates.push(("utf-8".to_string(), text.to_string()));
    }
    for (name, encoding) in [
        ("gb18030", encoding_rs::GB18030),
        ("big5", encoding_rs::BIG5),
        ("utf-16-le", encoding_rs::UTF_16LE),
        ("utf-16-be", encoding_rs::UTF_16BE),
    ] {
        if let Some(text) = decode_strict(encoding, raw) {
            candidates.push((name.to_string(), text));
        }
    }
    candidates
}

fn decode_strict(encoding: &'static Encoding, raw: &[u8]) -> Option<String> {
    let (text, had_errors) = encoding.decode_without_bom_handling(raw);
    if had_errors {
        return None;
    }
    Some(text.trim_start_matches('\u{FEFF}').to_string())
}

fn decode_named_lossy(name: &str, raw: &[u8]) -> (String, bool) {
    let normalized = name.trim().to_lowercase();
    let decoded = match normalized.as_str() {
        "utf-8" | "utf8" | "utf-8-sig" => {
            let body = raw.strip_prefix(UTF8_BOM).unwrap_or(raw);
            String::from_utf8_lossy(body).into_owned()
        }
        other => match Encoding::for_label(other.as_bytes()) {
            Some(encoding) => encoding.decode_without_bom_handling(raw).0.into_owned(),
            None => {
                log::warn!("Unknown encoding '{name}', decoding as utf-8");
                String::from_utf8_lossy(raw).into_owned()
            }
        },
    };
    let used_replace = decoded.contains('\u{FFFD}');
    (decoded, used_replace)
}

/// Load a file, autodetecting the encoding when configured as
/// `auto`. Detection scores each strict-decodable candidate;
/// confidence is the clamped, scaled gap between the top two scores.
pub fn load_text_auto(
    path: &Path,
    encoding: &str,
    chapter_regex: Option<&str>,
) -> Result<TextLoadResult, IngestError> {
    let raw = std::fs::read(path).map_err(|source| IngestError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;

    let normalized_choice = encoding.trim().to_lowercase();
    if normalized_choice != "auto" {
        let (text, used_replace_fallback) = decode_named_lossy(encoding, &raw);
        return Ok(TextLoadResult {
            text,
            encoding: encoding.to_string(),
            autodetected: false,
            confidence: 1.0,
            used_replace_fallback,
        });
    }

    let mut scored: Vec<(f64, String, String)> = decode_candidates(&raw)
        .into_iter()
        .map(|(name, text)| (score_decoded_text(&text, chapter_regex), name, text))
        .collect();

    if scored.is_empty() {
        let text = String::from_utf8_lossy(&raw).into_owned();
        return Ok(TextLoadResult {
            text,
            encoding: "utf-8".to_string(),
            autodetected: true,
            confidence: 0.0,
            used_replace_fallback: true,
        });
    }

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let best_score = scored[0].0;
    let second_score = if scored.len() > 1 { scored[1].0 } else { best_score };
    let confidence = if scored.len() == 1 {
        1.0
    } else {
        ((best_score - second_score) / 30.0).clamp(0.0, 1.0)
    };
    let (_, encoding_name, text) = scored.into_iter().next().expect("non-empty candidates");

    Ok(TextLoadResult {
        text,
        encoding: encoding_name,
        autodetected: true,
        confidence,
        used_replace_fallback: false,
    })
}

/// CRLF → LF, optional NFKC, optional blank-line removal, final trim.
pub fn normalize_text(text: &str, cleanup: &IngestCleanup) -> String {
    let mut normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    if cleanup.normalize_fullwidth {
        normalized = normalized.nfkc().collect();
    }
    if cleanup.strip_blank_lines {
        let lines: Vec<&str> = normalized
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .collect();
        normalized = lines.join("\n");
    }
    normalized.trim().to_string()
}

fn fallback_split(text: &str, max_chars: usize) -> Vec<ParsedChapter> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let mut chapters = Vec::new();
    let mut idx = 1_i64;
    let mut start = 0_usize;
    while start < chars.len() {
        let end = (start + max_chars.max(1)).min(chars.len());
        let block: String = chars[start..end].iter().collect();
        chapters.push(ParsedChapter {
            idx,
            title: format!("第{idx}章"),
            text: block.trim().to_string(),
            start_pos: start as i64,
            end_pos: end as i64,
        });
        idx += 1;
        start = end;
    }
    chapters
}

/// Split into chapters on the given title regex. Text before the
/// first match becomes a preface chapter; with no regex (or no
/// matches) the text is windowed into fixed-size chapters.
pub fn parse_chapters(
    text: &str,
    chapter_regex: Option<&str>,
    fallback_chapter_chars: usize,
) -> Result<Vec<ParsedChapter>, IngestError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let Some(pattern) = chapter_regex else {
        return Ok(fallback_split(text, fallback_chapter_chars));
    };

    let re = regex::RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map_err(|source| IngestError::BadRegex {
            pattern: pattern.to_string(),
            source,
        })?;

    let matches: Vec<regex::Match<'_>> = re.find_iter(text).collect();
    if matches.is_empty() {
        return Ok(fallback_split(text, fallback_chapter_chars));
    }

    // One pass converting byte offsets to char offsets.
    let byte_to_char = {
        let mut cache: Vec<(usize, i64)> = Vec::with_capacity(matches.len() * 2 + 2);
        let mut boundaries: Vec<usize> = matches
            .iter()
            .flat_map(|m| [m.start(), m.end()])
            .chain([0, text.len()])
            .collect();
        boundaries.sort_unstable();
        boundaries.dedup();
        let mut chars_seen = 0_i64;
        let mut last_byte = 0_usize;
        for boundary in boundaries {
            chars_seen += text[last_byte..boundary].chars().count() as i64;
            last_byte = boundary;
            cache.push((boundary, chars_seen));
        }
        move |byte_offset: usize| -> i64 {
            cache
                .iter()
                .find(|(b, _)| *b == byte_offset)
                .map(|(_, c)| *c)
                .unwrap_or(0)
        }
    };

    let mut chapters = Vec::new();
    let mut idx = 1_i64;

    if matches[0].start() > 0 {
        let preface = text[..matches[0].start()].trim();
        if !preface.is_empty() {
            chapters.push(ParsedChapter {
                idx,
                title: "序章".to_string(),
                text: preface.to_string(),
                start_pos: 0,
                end_pos: byte_to_char(matches[0].start()),
            });
            idx += 1;
        }
    }

    for (i, m) in matches.iter().enumerate() {
        let start = m.start();
        let end = matches
            .get(i + 1)
            .map(|next| next.start())
            .unwrap_or(text.len());
        let block = text[start..end].trim();
        let title = m.as_str().trim().to_string();

        // Drop the title line when it is exactly the block's first line.
        let mut content = match block.split_once('\n') {
            Some((first_line, rest)) if first_line.trim() == title => rest.trim().to_string(),
            _ => block.to_string(),
        };
        if content.is_empty() {
            content = block.to_string();
        }

        chapters.push(ParsedChapter {
            idx,
            title,
            text: content,
            start_pos: byte_to_char(start),
            end_pos: byte_to_char(end),
        });
        idx += 1;
    }

    Ok(chapters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn default_cleanup() -> IngestCleanup {
        IngestCleanup {
            strip_blank_lines: true,
            normalize_fullwidth: true,
        }
    }

    #[test]
    fn gb18030_is_autodetected() {
        let source = "序章\n第一章山边小村\n韩立出门。";
        let (encoded, _, had_errors) = encoding_rs::GB18030.encode(source);
        assert!(!had_errors);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&encoded).unwrap();

        let result = load_text_auto(file.path(), "auto", Some(r"^第[一二三四五六七八九十0-9]+章.*$"))
            .unwrap();
        assert_eq!(result.encoding, "gb18030");
        assert!(result.text.contains("韩立"));
        assert!(result.autodetected);
        assert!(!result.used_replace_fallback);
    }

    #[test]
    fn explicit_encoding_skips_detection() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all("plain utf-8 text".as_bytes()).unwrap();
        let result = load_text_auto(file.path(), "utf-8", None).unwrap();
        assert!(!result.autodetected);
        assert_eq!(result.confidence, 1.0);
        assert!(!result.used_replace_fallback);
    }

    #[test]
    fn utf8_bom_is_stripped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\xEF\xBB\xBF\xE7\xAC\xAC\xE4\xB8\x80\xE7\xAB\xA0").unwrap();
        let result = load_text_auto(file.path(), "auto", None).unwrap();
        assert!(!result.text.starts_with('\u{FEFF}'));
        assert!(result.text.starts_with('第'));
    }

    #[test]
    fn normalize_strips_crlf_and_blank_lines() {
        let cleanup = default_cleanup();
        let text = "line one\r\n\r\n  \r\nline two  \r\n";
        assert_eq!(normalize_text(text, &cleanup), "line one\nline two");
    }

    #[test]
    fn normalize_folds_fullwidth_forms() {
        let cleanup = default_cleanup();
        assert_eq!(normalize_text("ＡＢＣ１２３", &cleanup), "ABC123");
    }

    #[test]
    fn parse_chapters_with_preface_and_title_lines() {
        let text = "开篇引子\n第一章 山边小村\n韩立出生。\n第二章 青牛镇\n韩立赶集。";
        let chapters =
            parse_chapters(text, Some(r"^第[一二三四五六七八九十0-9]+章.*$"), 20_000).unwrap();
        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].title, "序章");
        assert_eq!(chapters[0].text, "开篇引子");
        assert_eq!(chapters[1].title, "第一章 山边小村");
        assert_eq!(chapters[1].text, "韩立出生。");
        assert_eq!(chapters[2].idx, 3);
        assert_eq!(chapters[2].text, "韩立赶集。");
    }

    #[test]
    fn parse_chapters_falls_back_to_windows() {
        let text = "a".repeat(25);
        let chapters = parse_chapters(&text, None, 10).unwrap();
        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].title, "第1章");
        assert_eq!(chapters[2].start_pos, 20);
        assert_eq!(chapters[2].end_pos, 25);
    }

    #[test]
    fn bad_regex_is_reported() {
        let err = parse_chapters("text", Some("第[章"), 100).unwrap_err();
        assert!(matches!(err, IngestError::BadRegex { .. }));
    }
}
