//! Layered validation of structured model output:
//! parse as JSON → validate against a Draft 2020-12 schema → require a
//! top-level object. Each layer produces an actionable message carrying a
//! short snippet of the offending payload.

use jsonschema::Draft;
use serde_json::Value;
use thiserror::Error;

const SNIPPET_LIMIT: usize = 240;

/// Grammar-check failures, ordered by severity.
#[derive(Debug, Clone, Error)]
pub enum GrammarError {
    #[error("json parse failed: {message}")]
    JsonParse {
        message: String,
        snippet: Option<String>,
    },

    #[error("schema validate failed: {message}")]
    SchemaValidate {
        message: String,
        snippet: Option<String>,
    },

    #[error("top-level output must be object")]
    OutputShape { snippet: Option<String> },
}

fn snippet_of(raw: &str) -> Option<String> {
    let collapsed: String = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(SNIPPET_LIMIT).collect())
}

/// Parse raw model text as JSON.
pub fn parse_payload(raw: &str) -> Result<Value, GrammarError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(GrammarError::JsonParse {
            message: "empty json content".to_string(),
            snippet: snippet_of(raw),
        });
    }
    serde_json::from_str(text).map_err(|err| GrammarError::JsonParse {
        message: err.to_string(),
        snippet: snippet_of(raw),
    })
}

/// Validate a payload against a JSON Schema (Draft 2020-12), collecting every
/// violation into one message.
pub fn validate_schema(payload: &Value, schema: &Value) -> Result<(), GrammarError> {
    let validator = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|err| GrammarError::SchemaValidate {
            message: format!("invalid schema: {err}"),
            snippet: None,
        })?;

    let errors: Vec<String> = validator
        .iter_errors(payload)
        .map(|err| {
            let path = err.instance_path.to_string();
            if path.is_empty() {
                err.to_string()
            } else {
                format!("at '{path}': {err}")
            }
        })
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(GrammarError::SchemaValidate {
            message: errors.join("; "),
            snippet: snippet_of(&payload.to_string()),
        })
    }
}

/// Require a top-level JSON object.
pub fn ensure_object(payload: Value) -> Result<Value, GrammarError> {
    if payload.is_object() {
        Ok(payload)
    } else {
        Err(GrammarError::OutputShape {
            snippet: snippet_of(&payload.to_string()),
        })
    }
}

/// Full pipeline: parse, validate, shape-check.
pub fn validate_structured_output(raw: &str, schema: &Value) -> Result<Value, GrammarError> {
    let parsed = parse_payload(raw)?;
    validate_schema(&parsed, schema)?;
    ensure_object(parsed)
}
