//! # Pipeline Repair Parser
//!
//! Turns a hand-authored `db.<collection>.aggregate([...])` script into a
//! collection name and a list of stage documents.
//!
//! Scripts are usually pasted from a database shell, so they are rarely
//! strict JSON. Parsing is two-phase:
//!
//! 1. strict `serde_json` parse of the bracketed pipeline text;
//! 2. only if that fails, run [`REPAIR_RULES`] in order and parse again.
//!
//! Every rule only rewrites text outside string literals, so `//`, `:`,
//! commas, brackets and whitespace inside values survive repair.
//!
//! ```text
//! db.Readings.aggregate([{$group:{_id:'$day',avg:{$avg:'$value'}}},])
//! ```

use crate::error::{CoreError, CoreResult};
use regex::Regex;
use serde_json::Value;
use std::ops::Range;
use std::sync::LazyLock;

/// Token every script must start with.
pub const CALL_PREFIX: &str = "db.";

static COLLECTION_RE: LazyLock<Regex> = LazyLock::new(|| pattern(r"^db\.(\w+)\.aggregate\("));

static PIPELINE_RE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?s)\.aggregate\(\s*(\[.*\])\s*\)"));

static BARE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| pattern(r"([{,]\s*)(\$?\w+)\s*:"));

static TRAILING_COMMA_RE: LazyLock<Regex> = LazyLock::new(|| pattern(r",\s*([\]}])"));

fn pattern(re: &str) -> Regex {
    Regex::new(re).expect("static pattern is valid")
}

/// Result of parsing a pipeline script.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPipeline {
    pub collection: String,
    pub stages: Vec<Value>,
}

/// One named normalization step of the fallback parse.
#[derive(Clone, Copy)]
pub struct RepairRule {
    pub name: &'static str,
    pub apply: fn(&str) -> String,
}

impl std::fmt::Debug for RepairRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RepairRule").field(&self.name).finish()
    }
}

/// Applied in this order by the fallback parse.
pub const REPAIR_RULES: &[RepairRule] = &[
    RepairRule {
        name: "collapse_whitespace",
        apply: collapse_whitespace,
    },
    RepairRule {
        name: "single_to_double_quotes",
        apply: single_to_double_quotes,
    },
    RepairRule {
        name: "quote_bare_keys",
        apply: quote_bare_keys,
    },
    RepairRule {
        name: "strip_trailing_commas",
        apply: strip_trailing_commas,
    },
    RepairRule {
        name: "wrap_in_array",
        apply: wrap_in_array,
    },
];

/// Parse a pipeline script into its target collection and stages.
pub fn parse_pipeline_script(script: &str) -> CoreResult<ParsedPipeline> {
    let script = script.trim();
    if !script.starts_with(CALL_PREFIX) {
        return Err(CoreError::InvalidScriptFormat(format!(
            "expected '{}' at the start of '{}'",
            CALL_PREFIX,
            fragment(script)
        )));
    }

    // Comments go before extraction so a trailing `// ...])` cannot extend the match.
    let script = strip_line_comments(script);
    let script = script.as_str();

    let collection = COLLECTION_RE
        .captures(script)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            CoreError::InvalidAggregationSyntax(format!(
                "expected 'db.<collection>.aggregate(' in '{}'",
                fragment(script)
            ))
        })?;

    let body = PIPELINE_RE
        .captures(script)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| {
            CoreError::InvalidPipelineFormat(format!(
                "expected '[...]' inside aggregate() in '{}'",
                fragment(script)
            ))
        })?;

    let value = match serde_json::from_str::<Value>(body) {
        Ok(value) => value,
        Err(strict) => {
            tracing::debug!(
                collection = %collection,
                error = %strict,
                "Strict parse failed, repairing pipeline text"
            );
            let repaired = repair(body);
            serde_json::from_str::<Value>(&repaired)
                .map_err(|e| CoreError::InvalidAggregationPipeline(e.to_string()))?
        }
    };

    Ok(ParsedPipeline {
        collection,
        stages: into_stages(value)?,
    })
}

/// Run every rule of [`REPAIR_RULES`] in order.
pub fn repair(text: &str) -> String {
    REPAIR_RULES
        .iter()
        .fold(text.to_string(), |acc, rule| (rule.apply)(&acc))
}

fn into_stages(value: Value) -> CoreResult<Vec<Value>> {
    let stages = match value {
        Value::Array(stages) => stages,
        obj @ Value::Object(_) => vec![obj],
        other => {
            let msg = format!("expected an array of stages, found {}", other);
            return Err(CoreError::InvalidAggregationPipeline(msg));
        }
    };
    if let Some(pos) = stages.iter().position(|s| !s.is_object()) {
        let msg = format!("stage {} is not an object", pos);
        return Err(CoreError::InvalidAggregationPipeline(msg));
    }
    Ok(stages)
}

fn fragment(text: &str) -> String {
    const MAX: usize = 60;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let head: String = text.chars().take(MAX).collect();
        format!("{}...", head)
    }
}

// =============================================================================
// Literal-aware scanning
// =============================================================================

/// End (exclusive) of the quoted literal opening at `start`. An unterminated
/// literal runs to the end of the text.
fn literal_end(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() && bytes[i] != quote {
        if bytes[i] == b'\\' {
            i += 1;
        }
        i += 1;
    }
    (i + 1).min(bytes.len())
}

/// Byte ranges of `"..."` and `'...'` literals, quotes included.
fn literal_spans(text: &str) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'"' || bytes[i] == b'\'' {
            let end = literal_end(bytes, i);
            spans.push(i..end);
            i = end;
        } else {
            i += 1;
        }
    }
    spans
}

/// Apply `rewrite` to every stretch of text between literals.
fn rewrite_code(text: &str, rewrite: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut code_start = 0;
    for span in literal_spans(text) {
        out.push_str(&rewrite(&text[code_start..span.start]));
        out.push_str(&text[span.clone()]);
        code_start = span.end;
    }
    out.push_str(&rewrite(&text[code_start..]));
    out
}

/// Remove `//` line comments. The newline itself is kept.
pub fn strip_line_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => i = literal_end(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                out.push_str(&text[copied..i]);
                i = text[i..].find('\n').map_or(bytes.len(), |nl| i + nl);
                copied = i;
            }
            _ => i += 1,
        }
    }
    out.push_str(&text[copied..]);
    out
}

// =============================================================================
// Repair rules
// =============================================================================

/// Collapse every whitespace run (newlines included) to one space.
pub fn collapse_whitespace(text: &str) -> String {
    rewrite_code(text, |code| {
        let mut out = String::with_capacity(code.len());
        let mut in_run = false;
        for c in code.chars() {
            if c.is_whitespace() {
                if !in_run {
                    out.push(' ');
                }
                in_run = true;
            } else {
                out.push(c);
                in_run = false;
            }
        }
        out
    })
}

/// Rewrite `'...'` literals as JSON strings.
pub fn single_to_double_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut code_start = 0;
    for span in literal_spans(text) {
        out.push_str(&text[code_start..span.start]);
        let literal = &text[span.clone()];
        if literal.starts_with('\'') {
            out.push_str(&requote(literal));
        } else {
            out.push_str(literal);
        }
        code_start = span.end;
    }
    out.push_str(&text[code_start..]);
    out
}

fn requote(literal: &str) -> String {
    let inner = literal
        .strip_prefix('\'')
        .map(|s| s.strip_suffix('\'').unwrap_or(s))
        .unwrap_or(literal);
    let mut out = String::with_capacity(inner.len() + 2);
    out.push('"');
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\'') => out.push('\''),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push_str("\\\\"),
            },
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Quote object keys written as bare words or `$word`.
pub fn quote_bare_keys(text: &str) -> String {
    rewrite_code(text, |code| {
        BARE_KEY_RE.replace_all(code, "${1}\"${2}\":").into_owned()
    })
}

/// Drop a comma that directly precedes `]` or `}`.
pub fn strip_trailing_commas(text: &str) -> String {
    rewrite_code(text, |code| {
        TRAILING_COMMA_RE.replace_all(code, "${1}").into_owned()
    })
}

/// Wrap the text in `[ ... ]` unless it already is an array literal.
pub fn wrap_in_array(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with('[') {
        trimmed.to_string()
    } else {
        format!("[{}]", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stages(script: &str) -> Vec<Value> {
        parse_pipeline_script(script).unwrap().stages
    }

    fn parse_err(script: &str) -> CoreError {
        parse_pipeline_script(script).unwrap_err()
    }

    #[test]
    fn test_well_formed_script_parses_strictly() {
        let body = r#"[{"$match": {"site": "A"}}, {"$sort": {"Timestamp": -1}}]"#;
        let script = format!("db.Readings.aggregate({})", body);
        let parsed = parse_pipeline_script(&script).unwrap();
        let expected: Vec<Value> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.collection, "Readings");
        assert_eq!(parsed.stages, expected);
    }

    #[test]
    fn test_shell_snippet_is_repaired() {
        let script = "db.Readings.aggregate([{$group:{_id:'$day',avg:{$avg:'$value'}}}])";
        let parsed = parse_pipeline_script(script).unwrap();
        let expected = json!({"$group": {"_id": "$day", "avg": {"$avg": "$value"}}});
        assert_eq!(parsed.collection, "Readings");
        assert_eq!(parsed.stages, vec![expected]);
    }

    #[test]
    fn test_mangled_script_repairs_to_original() {
        let valid = r#"db.m.aggregate([{"$match": {"Id": 4, "F": ["a", "b"]}}, {"$limit": 5}])"#;
        let mangled = r#"db.m.aggregate([{$match: {Id: 4, F: ["a", "b",],},}, {$limit: 5},])"#;
        assert_eq!(stages(mangled), stages(valid));
    }

    #[test]
    fn test_multiline_script_with_comments() {
        let script = r#"
            db.Readings.aggregate([
                // only plant 7
                { $match: { PlantId: 7 } },   // trailing note
                { $sort: { Timestamp: 1 } },
            ]);
        "#;
        assert_eq!(
            stages(script),
            vec![
                json!({"$match": {"PlantId": 7}}),
                json!({"$sort": {"Timestamp": 1}}),
            ]
        );
    }

    #[test]
    fn test_trailing_comment_after_call() {
        let script = "db.Readings.aggregate([\n  {$match: {a: 1}}\n]); // daily rollup";
        let parsed = parse_pipeline_script(script).unwrap();
        assert_eq!(parsed.collection, "Readings");
        assert_eq!(parsed.stages, vec![json!({"$match": {"a": 1}})]);

        let script = "db.Readings.aggregate([{$limit: 2}]) // was aggregate([{$limit: 9}])";
        assert_eq!(stages(script), vec![json!({"$limit": 2})]);
    }

    #[test]
    fn test_chained_call_after_pipeline() {
        let script = "db.Readings.aggregate([{$match: {a: 1}}]).toArray()";
        assert_eq!(stages(script), vec![json!({"$match": {"a": 1}})]);
    }

    #[test]
    fn test_string_contents_survive_repair() {
        let script = r#"db.L.aggregate([{$match: {u: "http://h:80/a,  b", n: 'it\'s: "x"'},}])"#;
        let expected = json!({"$match": {"u": "http://h:80/a,  b", "n": "it's: \"x\""}});
        assert_eq!(stages(script), vec![expected]);
    }

    #[test]
    fn test_bad_prefix() {
        let err = parse_err("Readings.aggregate([])");
        assert!(matches!(err, CoreError::InvalidScriptFormat(_)));
    }

    #[test]
    fn test_missing_aggregate_call() {
        let err = parse_err("db.Readings.find({})");
        assert!(matches!(err, CoreError::InvalidAggregationSyntax(_)));
    }

    #[test]
    fn test_missing_brackets() {
        let err = parse_err("db.Readings.aggregate({$match: {}})");
        assert!(matches!(err, CoreError::InvalidPipelineFormat(_)));
    }

    #[test]
    fn test_unrepairable_text_reports_parse_error() {
        let err = parse_err("db.Readings.aggregate([{$match: {a: }}])");
        assert!(matches!(err, CoreError::InvalidAggregationPipeline(msg) if !msg.is_empty()));
    }

    #[test]
    fn test_non_object_stage_is_rejected() {
        let err = parse_err("db.Readings.aggregate([1, 2])");
        assert!(matches!(err, CoreError::InvalidAggregationPipeline(_)));
    }

    #[test]
    fn test_single_object_becomes_one_stage() {
        let stages = into_stages(json!({"$limit": 1})).unwrap();
        assert_eq!(stages, vec![json!({"$limit": 1})]);
    }

    #[test]
    fn test_rule_order() {
        let names: Vec<&str> = REPAIR_RULES.iter().map(|r| r.name).collect();
        assert_eq!(
            names,
            [
                "collapse_whitespace",
                "single_to_double_quotes",
                "quote_bare_keys",
                "strip_trailing_commas",
                "wrap_in_array",
            ]
        );
    }

    #[test]
    fn test_collapse_whitespace_skips_literals() {
        assert_eq!(
            collapse_whitespace("{ a :\n\t 1, b: \"x   y\" }"),
            "{ a : 1, b: \"x   y\" }"
        );
    }

    #[test]
    fn test_single_quotes_become_double() {
        assert_eq!(
            single_to_double_quotes(r#"{a: 'x', b: "y's"}"#),
            r#"{a: "x", b: "y's"}"#
        );
        assert_eq!(single_to_double_quotes(r#"'say "hi"'"#), r#""say \"hi\"""#);
    }

    #[test]
    fn test_quote_bare_keys() {
        assert_eq!(
            quote_bare_keys(r#"{$avg: "$v", _id: 1, "done": 2, t: "a:b"}"#),
            r#"{"$avg": "$v", "_id": 1, "done": 2, "t": "a:b"}"#
        );
    }

    #[test]
    fn test_strip_trailing_commas() {
        assert_eq!(
            strip_trailing_commas(r#"[{"a": [1, 2, ], "b": ",]"}, ]"#),
            r#"[{"a": [1, 2], "b": ",]"}]"#
        );
    }

    #[test]
    fn test_wrap_in_array() {
        assert_eq!(wrap_in_array(" {\"a\": 1} "), "[{\"a\": 1}]");
        assert_eq!(wrap_in_array("[1]"), "[1]");
    }

    #[test]
    fn test_comment_markers_inside_strings_are_kept() {
        assert_eq!(
            strip_line_comments("{\"u\": \"http://x\"} // gone\n{'v': '//y'}"),
            "{\"u\": \"http://x\"} \n{'v': '//y'}"
        );
    }
}
