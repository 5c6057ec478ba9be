//! Input transforms for chain steps
//!
//! A transform is a template where `{{ previous }}` expands to the prior
//! step's result and `{{ previous.field.0 }}` walks into a structured result
//! (text results are parsed as JSON first). `{{ initial }}` expands to the
//! chain's initial input. Everything outside placeholders is copied verbatim.

use crate::run::AgentResult;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;

/// Transform parse or render failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// A `{{` or `}}` without its partner
    #[error("unbalanced braces near '{0}'")]
    Unbalanced(String),
    /// Placeholder root other than `previous` or `initial`
    #[error("unknown placeholder '{0}'")]
    UnknownRoot(String),
    /// Empty or malformed path segment
    #[error("invalid path segment in '{0}'")]
    InvalidSegment(String),
    /// Path did not resolve against the previous result
    #[error("path '{0}' not found in previous result")]
    MissingPath(String),
    /// Path used on a text result that is not JSON
    #[error("previous result is not structured, cannot resolve '{0}'")]
    NotStructured(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Previous(Vec<String>),
    Initial,
}

/// Parsed input-transform expression
#[derive(Debug, Clone, PartialEq)]
pub struct InputTransform {
    segments: Vec<Segment>,
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("placeholder pattern is valid")
    })
}

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-]+$").expect("segment pattern is valid"))
}

impl InputTransform {
    /// Parse an expression
    pub fn parse(expression: &str) -> Result<Self, TransformError> {
        let mut segments = Vec::new();
        let mut cursor = 0;

        for captures in placeholder_pattern().captures_iter(expression) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            push_literal(&mut segments, &expression[cursor..whole.start()])?;
            segments.push(parse_placeholder(&captures[1])?);
            cursor = whole.end();
        }
        push_literal(&mut segments, &expression[cursor..])?;

        Ok(Self { segments })
    }

    /// Produce the step input from the previous result and the chain's initial input
    pub fn render(&self, previous: &AgentResult, initial: &str) -> Result<String, TransformError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Initial => out.push_str(initial),
                Segment::Previous(path) if path.is_empty() => out.push_str(&previous.as_text()),
                Segment::Previous(path) => out.push_str(&resolve_path(previous, path)?),
            }
        }
        Ok(out)
    }
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) -> Result<(), TransformError> {
    if text.contains("{{") || text.contains("}}") {
        return Err(TransformError::Unbalanced(text.to_string()));
    }
    if !text.is_empty() {
        segments.push(Segment::Literal(text.to_string()));
    }
    Ok(())
}

fn parse_placeholder(inner: &str) -> Result<Segment, TransformError> {
    let mut parts = inner.split('.');
    let root = parts.next().unwrap_or_default();
    let path: Vec<String> = parts.map(str::to_string).collect();

    if path.iter().any(|p| !segment_pattern().is_match(p)) {
        return Err(TransformError::InvalidSegment(inner.to_string()));
    }

    match root {
        "previous" | "input" => Ok(Segment::Previous(path)),
        "initial" if path.is_empty() => Ok(Segment::Initial),
        "initial" => Err(TransformError::InvalidSegment(inner.to_string())),
        other => Err(TransformError::UnknownRoot(other.to_string())),
    }
}

fn resolve_path(previous: &AgentResult, path: &[String]) -> Result<String, TransformError> {
    let dotted = path.join(".");
    let parsed;
    let root = match previous {
        AgentResult::Structured(value) => value,
        AgentResult::Text(text) | AgentResult::Error(text) => {
            parsed = serde_json::from_str::<Value>(text)
                .map_err(|_| TransformError::NotStructured(dotted.clone()))?;
            &parsed
        }
    };

    let mut current = root;
    for key in path {
        let next = match current {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| TransformError::MissingPath(dotted.clone()))?;
    }

    Ok(match current {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_text_passes_through() {
        let transform = InputTransform::parse("no placeholders here").unwrap();
        let out = transform.render(&AgentResult::text("ignored"), "init").unwrap();
        assert_eq!(out, "no placeholders here");
    }

    #[test]
    fn test_previous_and_initial_expand() {
        let transform = InputTransform::parse("Task: {{initial}}\nDraft: {{ previous }}").unwrap();
        let out = transform.render(&AgentResult::text("hello"), "write").unwrap();
        assert_eq!(out, "Task: write\nDraft: hello");
    }

    #[test]
    fn test_path_into_structured_result() {
        let transform = InputTransform::parse("Fix {{ previous.issues.0.title }} ({{ previous.count }})").unwrap();
        let previous = AgentResult::structured(json!({
            "issues": [{"title": "null deref"}],
            "count": 3
        }));
        assert_eq!(transform.render(&previous, "").unwrap(), "Fix null deref (3)");
    }

    #[test]
    fn test_path_into_json_text() {
        let transform = InputTransform::parse("{{ previous.verdict }}").unwrap();
        let previous = AgentResult::text(r#"{"verdict": "approve"}"#);
        assert_eq!(transform.render(&previous, "").unwrap(), "approve");
    }

    #[test]
    fn test_render_errors() {
        let transform = InputTransform::parse("{{ previous.missing }}").unwrap();
        assert_eq!(
            transform.render(&AgentResult::structured(json!({})), ""),
            Err(TransformError::MissingPath("missing".to_string()))
        );
        assert_eq!(
            transform.render(&AgentResult::text("plain words"), ""),
            Err(TransformError::NotStructured("missing".to_string()))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(InputTransform::parse("{{ previous"), Err(TransformError::Unbalanced(_))));
        assert!(matches!(InputTransform::parse("previous }}"), Err(TransformError::Unbalanced(_))));
        assert!(matches!(InputTransform::parse("{{ output }}"), Err(TransformError::UnknownRoot(_))));
        assert!(matches!(InputTransform::parse("{{ previous..a }}"), Err(TransformError::InvalidSegment(_))));
        assert!(matches!(InputTransform::parse("{{ initial.x }}"), Err(TransformError::InvalidSegment(_))));
    }
}
