//! Advisory client: semantic assessment behind a trait.
//!
//! The executor asks an advisory service either to assess the artifact or to
//! suggest a fix. Backends:
//!
//! | Backend          | Transport                                   |
//! |------------------|---------------------------------------------|
//! | `StubAdvisor`    | deterministic, scripted; used in tests      |
//! | `CommandAdvisor` | spawns a CLI, JSON request on stdin         |
//! | `HttpAdvisor`    | JSON POST                                   |
//!
//! Responses are JSON objects. Fenced code blocks and surrounding prose are
//! tolerated; see [`parse_response`].

mod command;
mod http;
mod stub;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use command::CommandAdvisor;
pub use http::HttpAdvisor;
pub use stub::StubAdvisor;

use crate::errors::AdvisoryError;
use crate::gates::CheckSpec;

/// What the advisory service is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdvisoryMode {
    Assess,
    FixSuggest,
}

impl AdvisoryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AdvisoryMode::Assess => "assess",
            AdvisoryMode::FixSuggest => "fix-suggest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryRequest {
    pub content: String,
    pub output_schema: Value,
    pub mode: AdvisoryMode,
    /// Gate the request is made for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_id: Option<String>,
    /// Fix instruction; only set in fix-suggest mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

impl AdvisoryRequest {
    pub fn assess(gate_id: &str, content: &str, output_schema: Option<&Value>) -> Self {
        Self {
            content: content.to_string(),
            output_schema: output_schema.cloned().unwrap_or_else(default_assess_schema),
            mode: AdvisoryMode::Assess,
            gate_id: Some(gate_id.to_string()),
            instruction: None,
        }
    }

    pub fn fix_suggest(gate_id: &str, content: &str, instruction: String) -> Self {
        Self {
            content: content.to_string(),
            output_schema: default_fix_schema(),
            mode: AdvisoryMode::FixSuggest,
            gate_id: Some(gate_id.to_string()),
            instruction: Some(instruction),
        }
    }
}

fn default_assess_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "required": ["confidence", "issues"],
        "properties": {
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "issues": {"type": "array", "items": {"type": "string"}},
            "structured_fields": {"type": "object"}
        }
    })
}

fn default_fix_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "required": ["structured_fields"],
        "properties": {
            "issues": {"type": "array", "items": {"type": "string"}},
            "structured_fields": {
                "type": "object",
                "properties": {"revised_content": {"type": "string"}}
            }
        }
    })
}

/// A learning surfaced by the advisory service, before it gets an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfacedLearning {
    pub observation: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryResponse {
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub structured_fields: Map<String, Value>,
}

impl AdvisoryResponse {
    pub fn with_confidence(confidence: f64) -> Self {
        Self {
            confidence: Some(confidence),
            ..Self::default()
        }
    }

    pub fn with_issues(mut self, issues: &[&str]) -> Self {
        self.issues = issues.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_revised_content(mut self, content: &str) -> Self {
        self.structured_fields
            .insert("revised_content".into(), Value::String(content.into()));
        self
    }

    pub fn with_learning(mut self, learning: SurfacedLearning) -> Self {
        let entry = self
            .structured_fields
            .entry("learnings")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let (Value::Array(items), Ok(value)) = (entry, serde_json::to_value(learning)) {
            items.push(value);
        }
        self
    }

    /// Revised artifact text from a fix-suggest response.
    pub fn revised_content(&self) -> Option<&str> {
        self.structured_fields
            .get("revised_content")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Learnings listed under `structured_fields.learnings`.
    ///
    /// Entries that do not parse, or whose confidence is outside [0, 1], are
    /// dropped.
    pub fn learnings(&self) -> Vec<SurfacedLearning> {
        let Some(Value::Array(items)) = self.structured_fields.get("learnings") else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|v| serde_json::from_value::<SurfacedLearning>(v.clone()).ok())
            .filter(|l| (0.0..=1.0).contains(&l.confidence) && !l.observation.trim().is_empty())
            .collect()
    }
}

/// Semantic assessment service.
#[async_trait]
pub trait AdvisoryClient: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    async fn advise(&self, request: &AdvisoryRequest) -> Result<AdvisoryResponse, AdvisoryError>;
}

/// Parse a raw advisory reply.
///
/// Accepts a bare JSON object, a fenced ```json block, or an object embedded
/// in prose. Empty output, non-object JSON and out-of-range confidence are
/// malformed.
pub fn parse_response(raw: &str) -> Result<AdvisoryResponse, AdvisoryError> {
    if raw.trim().is_empty() {
        return Err(AdvisoryError::Malformed("empty response".into()));
    }
    let json = extract_json(raw)
        .ok_or_else(|| AdvisoryError::Malformed("no JSON object in response".into()))?;
    let value: Value = serde_json::from_str(&json)
        .map_err(|e| AdvisoryError::Malformed(format!("invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(AdvisoryError::Malformed("response is not a JSON object".into()));
    }
    let response: AdvisoryResponse = serde_json::from_value(value)
        .map_err(|e| AdvisoryError::Malformed(format!("unexpected shape: {}", e)))?;
    if let Some(c) = response.confidence
        && !(0.0..=1.0).contains(&c)
    {
        return Err(AdvisoryError::Malformed(format!(
            "confidence {} outside [0, 1]",
            c
        )));
    }
    Ok(response)
}

fn extract_json(response: &str) -> Option<String> {
    if let Some(start) = response.find("```json") {
        let after_marker = &response[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return Some(after_marker[..end].trim().to_string());
        }
    }

    if let Some(start) = response.find("```") {
        let after_marker = &response[start + 3..];
        if let Some(end) = after_marker.find("```")
            && let Some(json_start) = after_marker[..end].find('{')
        {
            return Some(after_marker[json_start..end].trim().to_string());
        }
    }

    let start = response.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in response[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(response[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_object() {
        let resp = parse_response(r#"{"confidence": 0.9, "issues": ["vague"]}"#).unwrap();
        assert_eq!(resp.confidence, Some(0.9));
        assert_eq!(resp.issues, vec!["vague".to_string()]);
    }

    #[test]
    fn test_parse_fenced_block_with_prose() {
        let raw = "Here is my verdict:\n```json\n{\"confidence\": 0.4, \"issues\": []}\n```\nThanks";
        assert_eq!(parse_response(raw).unwrap().confidence, Some(0.4));
    }

    #[test]
    fn test_parse_embedded_object_with_braces_in_strings() {
        let raw = r#"Result: {"issues": ["use {placeholders}"], "confidence": 1.0} done"#;
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.issues, vec!["use {placeholders}".to_string()]);
    }

    #[test]
    fn test_parse_empty_is_malformed() {
        assert!(matches!(parse_response("  \n"), Err(AdvisoryError::Malformed(_))));
    }

    #[test]
    fn test_parse_no_json_is_malformed() {
        assert!(matches!(
            parse_response("I cannot help with that"),
            Err(AdvisoryError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_out_of_range_confidence_is_malformed() {
        let err = parse_response(r#"{"confidence": 1.5}"#).unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn test_parse_wrong_field_type_is_malformed() {
        assert!(parse_response(r#"{"confidence": "high"}"#).is_err());
    }

    #[test]
    fn test_revised_content_and_learnings() {
        let resp = AdvisoryResponse::default()
            .with_revised_content("# New")
            .with_learning(SurfacedLearning {
                observation: "Specs need an Errors section".into(),
                confidence: 0.85,
                scope: None,
                check: None,
            });
        assert_eq!(resp.revised_content(), Some("# New"));
        assert_eq!(resp.learnings().len(), 1);
    }

    #[test]
    fn test_bad_learnings_are_dropped() {
        let resp = parse_response(
            r#"{"structured_fields": {"learnings": [
                {"observation": "ok", "confidence": 0.6},
                {"observation": "too sure", "confidence": 3.0},
                {"confidence": 0.9}
            ]}}"#,
        )
        .unwrap();
        let learnings = resp.learnings();
        assert_eq!(learnings.len(), 1);
        assert_eq!(learnings[0].observation, "ok");
    }

    #[test]
    fn test_blank_revised_content_is_none() {
        let resp = AdvisoryResponse::default().with_revised_content("   ");
        assert!(resp.revised_content().is_none());
    }

    #[test]
    fn test_request_serializes_mode_kebab_case() {
        let req = AdvisoryRequest::fix_suggest("g1", "text", "fix it".into());
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["mode"], "fix-suggest");
        assert_eq!(json["instruction"], "fix it");
    }
}
