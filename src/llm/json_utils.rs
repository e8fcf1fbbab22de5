//! Lenient JSON recovery for model output.
//!
//! Models wrap JSON in code fences, leave trailing commas, or embed
//! control characters. Recovery order: strip fences, scrub, parse;
//! if that fails, retry on the outermost brace/bracket span.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum JsonRecoveryError {
    #[error("empty JSON text")]
    Empty,

    #[error("expected JSON object")]
    NotObject,

    #[error("expected JSON array")]
    NotArray,

    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

static CONTROL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F]").expect("static regex"));
static TRAILING_COMMAS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*([}\]])").expect("static regex"));

fn strip_code_fence(text: &str) -> &str {
    let stripped = text.trim();
    if stripped.starts_with("```") && stripped.ends_with("```") {
        let lines: Vec<&str> = stripped.lines().collect();
        if lines.len() >= 2 {
            let start = stripped.find('\n').map(|i| i + 1).unwrap_or(0);
            let end = stripped.rfind("```").unwrap_or(stripped.len());
            if start <= end {
                return stripped[start..end].trim();
            }
        }
    }
    stripped
}

fn sanitize_json_text(text: &str) -> String {
    let cleaned = text.replace("\r\n", "\n").replace('\r', "\n");
    let cleaned = CONTROL_CHARS.replace_all(&cleaned, "");
    TRAILING_COMMAS.replace_all(&cleaned, "$1").into_owned()
}

/// Parse a JSON object, recovering from fences and stray prose.
pub fn safe_load_json_object(text: &str) -> Result<Value, JsonRecoveryError> {
    if text.trim().is_empty() {
        return Err(JsonRecoveryError::Empty);
    }
    let candidate = sanitize_json_text(strip_code_fence(text));
    let value = match serde_json::from_str::<Value>(&candidate) {
        Ok(value) => value,
        Err(err) => {
            let start = candidate.find('{');
            let end = candidate.rfind('}');
            match (start, end) {
                (Some(start), Some(end)) if end > start => {
                    serde_json::from_str::<Value>(&candidate[start..=end])?
                }
                _ => return Err(err.into()),
            }
        }
    };
    if !value.is_object() {
        return Err(JsonRecoveryError::NotObject);
    }
    Ok(value)
}

/// Parse a JSON array with the same recovery strategy.
pub fn safe_load_json_array(text: &str) -> Result<Value, JsonRecoveryError> {
    if text.trim().is_empty() {
        return Err(JsonRecoveryError::Empty);
    }
    let candidate = sanitize_json_text(strip_code_fence(text));
    let value = match serde_json::from_str::<Value>(&candidate) {
        Ok(value) => value,
        Err(err) => {
            let start = candidate.find('[');
            let end = candidate.rfind(']');
            match (start, end) {
                (Some(start), Some(end)) if end > start => {
                    serde_json::from_str::<Value>(&candidate[start..=end])?
                }
                _ => return Err(err.into()),
            }
        }
    };
    if !value.is_array() {
        return Err(JsonRecoveryError::NotArray);
    }
    Ok(value)
}

/// Recover an object and deserialize it into `T`.
pub fn parse_object_as<T: DeserializeOwned>(text: &str) -> Result<T, JsonRecoveryError> {
    let value = safe_load_json_object(text)?;
    Ok(serde_json::from_value(value)?)
}

/// `line=…, column=…` from a serde error, when available.
pub fn error_location(err: &JsonRecoveryError) -> Option<String> {
    match err {
        JsonRecoveryError::Parse(parse_err) => {
            Some(format!("line={}, column={}", parse_err.line(), parse_err.column()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let value = safe_load_json_object("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn recovers_object_inside_prose() {
        let value = safe_load_json_object("Here you go: {\"a\": 1} hope that helps").unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn scrubs_trailing_commas_and_control_chars() {
        let value = safe_load_json_object("{\"a\": [1, 2,],\u{0001}}").unwrap();
        assert_eq!(value["a"], serde_json::json!([1, 2]));
    }

    #[test]
    fn rejects_empty_and_non_object() {
        assert!(matches!(
            safe_load_json_object("   "),
            Err(JsonRecoveryError::Empty)
        ));
        assert!(matches!(
            safe_load_json_object("[1, 2]"),
            Err(JsonRecoveryError::NotObject)
        ));
    }

    #[test]
    fn array_recovery() {
        let value = safe_load_json_array("```\n[1, 2, 3,]\n```").unwrap();
        assert_eq!(value, serde_json::json!([1, 2, 3]));
    }
}
