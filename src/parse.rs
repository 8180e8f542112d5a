//! Recovery of the backend's JSON result from stdout.
//!
//! The backend is supposed to print exactly one JSON document, but
//! progress text sometimes leaks onto stdout ahead of it. Parsing never
//! fails: when nothing parses, the raw text is handed back instead.

use serde::Serialize;
use serde_json::Value;

/// Outcome of parsing backend stdout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParsedResult {
    /// A JSON document was recovered.
    Structured(Value),
    /// No JSON could be isolated; carries the trimmed output.
    Raw { raw: String },
}

impl ParsedResult {
    pub const fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }

    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Structured(value) => Some(value),
            Self::Raw { .. } => None,
        }
    }

    /// JSON form for callers that always want a value: the fallback becomes
    /// `{"raw": "..."}`.
    pub fn into_value(self) -> Value {
        match self {
            Self::Structured(value) => value,
            Self::Raw { raw } => serde_json::json!({ "raw": raw }),
        }
    }
}

/// Parse backend stdout into a structured value, tolerating leading noise.
///
/// The whole trimmed text is tried first. Failing that, every `{` or `[`
/// offset is tried as a start, from the last one backwards, and the first
/// suffix that parses completely wins. Noise that happens to contain a
/// parseable bracketed fragment after the real document start can be picked
/// up instead; that is accepted.
pub fn parse_result(stdout: &str) -> ParsedResult {
    let trimmed = stdout.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return ParsedResult::Structured(value);
    }

    let starts: Vec<usize> = trimmed
        .match_indices(|c: char| c == '{' || c == '[')
        .map(|(offset, _)| offset)
        .collect();

    for &start in starts.iter().rev() {
        if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..]) {
            return ParsedResult::Structured(value);
        }
    }

    ParsedResult::Raw {
        raw: trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_output_fast_path() {
        assert_eq!(
            parse_result("  {\"count\": 3}\n"),
            ParsedResult::Structured(json!({"count": 3}))
        );
    }

    #[test]
    fn recovers_object_after_progress_text() {
        let parsed = parse_result("Scanning...\nDone.\n{\"count\":3}");
        assert_eq!(parsed, ParsedResult::Structured(json!({"count": 3})));
    }

    #[test]
    fn recovers_nested_object_not_inner_fragment() {
        let stdout = "Crawling [1/2]\nCrawling [2/2]\n{\n  \"files\": [{\"path\": \"a.pdf\"}],\n  \"stats\": {\"new\": 1}\n}\n";
        let parsed = parse_result(stdout);
        assert_eq!(
            parsed,
            ParsedResult::Structured(json!({
                "files": [{"path": "a.pdf"}],
                "stats": {"new": 1}
            }))
        );
    }

    #[test]
    fn recovers_trailing_array() {
        let parsed = parse_result("[INFO] loading index\n[1, 2, {\"x\": [3]}]");
        assert_eq!(parsed, ParsedResult::Structured(json!([1, 2, {"x": [3]}])));
    }

    #[test]
    fn no_json_falls_back_to_raw() {
        let parsed = parse_result("  Something went sideways {not json\n");
        assert_eq!(
            parsed,
            ParsedResult::Raw {
                raw: "Something went sideways {not json".to_string()
            }
        );
        assert!(!parsed.is_structured());
        assert_eq!(
            parsed.into_value(),
            json!({"raw": "Something went sideways {not json"})
        );
    }

    #[test]
    fn empty_output_is_raw() {
        assert_eq!(
            parse_result("\n\n"),
            ParsedResult::Raw { raw: String::new() }
        );
    }

    #[test]
    fn handles_multibyte_prefix() {
        let parsed = parse_result("Indexing “Résumé.docx” ✓\n{\"ok\": true}");
        assert_eq!(parsed.as_value(), Some(&json!({"ok": true})));
    }

    #[test]
    fn serializes_untagged() {
        let structured = serde_json::to_value(ParsedResult::Structured(json!({"a": 1}))).unwrap();
        assert_eq!(structured, json!({"a": 1}));

        let raw = serde_json::to_value(ParsedResult::Raw {
            raw: "text".to_string(),
        })
        .unwrap();
        assert_eq!(raw, json!({"raw": "text"}));
    }
}
