//! Classification protocol: request payload, tolerant response parsing, and
//! the `Classifier` port the HTTP adapter implements.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::domain::{ChatId, Label};

#[derive(Clone, Debug, PartialEq)]
pub struct ClassifyRequest {
    pub chat_id: ChatId,
    pub chatflow_id: String,
    pub text: String,
    /// Rendered few-shot block.
    pub examples: String,
    pub is_reply: bool,
    pub has_contact: bool,
}

/// What the backend said. A label the protocol does not know reads as `None`
/// (never an ad).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Verdict {
    pub label: Option<Label>,
    pub score: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassifyError {
    #[error("missing_chatflow_or_base_url")]
    MissingConfig,
    #[error("unexpected_response_shape")]
    UnexpectedShape,
    #[error("invalid_json_text")]
    InvalidJsonText,
    #[error("parsed_text_not_object")]
    ParsedTextNotObject,
    /// Network, timeout, non-2xx or an undecodable body.
    #[error("exception:{0}")]
    Transport(String),
}

impl ClassifyError {
    /// Reason code persisted with the decision.
    pub fn reason_code(&self) -> String {
        self.to_string()
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Single attempt, never panics, never retries.
    async fn classify(&self, req: &ClassifyRequest) -> Result<Verdict, ClassifyError>;
}

/// JSON body for `POST /api/v1/prediction/{chatflow_id}`.
pub fn build_payload(req: &ClassifyRequest) -> Value {
    json!({
        "question": "",
        "overrideConfig": {
            "sessionId": format!("ads_{}", req.chat_id.0),
            "returnSourceDocuments": false,
            "vars": {
                "text": req.text,
                "examples": req.examples,
                "is_reply": req.is_reply,
                "has_contact": req.has_contact,
            }
        }
    })
}

/// Parse a backend response. Tries, in order: a top-level label (or a
/// top-level `json` object), `result.json`, then a JSON object encoded in
/// `text` / `result.text` / `result[0].text`, optionally code-fenced.
pub fn parse_response(data: &Value) -> Result<Verdict, ClassifyError> {
    let Value::Object(top) = data else {
        return Err(ClassifyError::UnexpectedShape);
    };

    if let Some(v) = labelled(top) {
        return Ok(v);
    }

    let result = top.get("result");
    if let Some(v) = result
        .and_then(|r| r.get("json"))
        .and_then(Value::as_object)
        .and_then(labelled)
    {
        return Ok(v);
    }

    let text = non_empty_text(top.get("text"))
        .or_else(|| non_empty_text(result.and_then(|r| r.get("text"))))
        .or_else(|| {
            non_empty_text(
                result
                    .and_then(Value::as_array)
                    .and_then(|a| a.first())
                    .and_then(|first| first.get("text")),
            )
        });

    let Some(text) = text else {
        return Err(ClassifyError::UnexpectedShape);
    };

    let parsed: Value = serde_json::from_str(strip_code_fences(&text))
        .map_err(|_| ClassifyError::InvalidJsonText)?;
    match parsed {
        Value::Object(obj) => Ok(labelled(&obj).unwrap_or_else(|| loose(&obj))),
        _ => Err(ClassifyError::ParsedTextNotObject),
    }
}

fn labelled(obj: &Map<String, Value>) -> Option<Verdict> {
    if present(obj, "label").is_some() {
        return Some(loose(obj));
    }

    let nested = obj.get("json")?.as_object()?;
    present(nested, "label")?;
    let outer = loose(obj);
    let inner = loose(nested);
    Some(Verdict {
        label: inner.label,
        score: inner.score.or(outer.score),
        reason: inner.reason.or(outer.reason),
    })
}

fn loose(obj: &Map<String, Value>) -> Verdict {
    Verdict {
        label: present(obj, "label")
            .and_then(Value::as_str)
            .and_then(Label::parse),
        score: present(obj, "score").and_then(score_value),
        reason: present(obj, "reason").map(|r| match r {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
    }
}

/// `key`, `Key` or `KEY`, ignoring nulls.
fn present<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let capitalized = {
        let mut c = key.chars();
        c.next()
            .map(|f| f.to_uppercase().collect::<String>() + c.as_str())
            .unwrap_or_default()
    };
    [key.to_string(), capitalized, key.to_uppercase()]
        .iter()
        .filter_map(|k| obj.get(k))
        .find(|v| !v.is_null())
}

fn score_value(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn non_empty_text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Null | Value::Bool(false) | Value::String(_) => None,
        other => Some(other.to_string()),
    }
}

fn strip_code_fences(s: &str) -> &str {
    let mut s = s.trim();
    if s.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("```json")) {
        s = &s[7..];
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}
