//! HTTP transport for the chat-completions endpoint.
//!
//! Two call shapes over the same endpoint: a non-stream request (structured
//! JSON) and an SSE stream consumed line-wise with per-delta callbacks and
//! cooperative cancellation.

use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const STRICT_SYSTEM_PROMPT: &str = "Return STRICT JSON. No markdown. No explanation.";
const RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(200), Duration::from_millis(500)];

/// Transport-level failures.
#[derive(Debug, Clone, Error)]
pub enum LlmCallError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("chat/completions non-200: {status}: {body}")]
    Status { status: u16, body: String },

    #[error("missing choices[0].message.content")]
    MissingContent,

    #[error("empty model content")]
    EmptyContent,

    #[error("invalid streamed json chunk")]
    InvalidStreamChunk,

    #[error("stream interrupted after first byte: {0}")]
    StreamInterrupted(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("chat completions failed after retries: {0}")]
    RetriesExhausted(String),
}

/// One configured endpoint + model.
#[derive(Debug, Clone)]
pub struct ChatChannel {
    pub api_key: String,
    pub base_url: String,
    pub path: String,
    pub model: String,
    pub timeout: Duration,
}

impl ChatChannel {
    pub fn endpoint_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

fn prepend_strict_system(messages: &[Value]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(json!({"role": "system", "content": STRICT_SYSTEM_PROMPT}));
    out.extend(
        messages
            .iter()
            .filter(|message| {
                message.get("content").and_then(Value::as_str) != Some(STRICT_SYSTEM_PROMPT)
            })
            .cloned(),
    );
    out
}

fn extract_message_content(data: &Value) -> Result<String, LlmCallError> {
    let content = data
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .ok_or(LlmCallError::MissingContent)?;
    if content.trim().is_empty() {
        return Err(LlmCallError::EmptyContent);
    }
    Ok(content.to_string())
}

pub(crate) fn extract_stream_chunk_text(chunk: &Value, ignore_reasoning: bool) -> String {
    let Some(delta) = chunk
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("delta"))
    else {
        return String::new();
    };

    let mut fragments = String::new();
    if !ignore_reasoning {
        if let Some(reasoning) = delta.get("reasoning_content").and_then(Value::as_str) {
            fragments.push_str(reasoning);
        }
    }
    if let Some(content) = delta.get("content").and_then(Value::as_str) {
        fragments.push_str(content);
    }
    fragments
}

async fn post_chat_completions(
    http: &reqwest::Client,
    channel: &ChatChannel,
    messages: &[Value],
    response_format: Option<&Value>,
) -> Result<Value, LlmCallError> {
    let mut body = json!({
        "model": channel.model,
        "messages": messages,
        "temperature": 0,
    });
    if let Some(format) = response_format {
        body["response_format"] = format.clone();
    }

    let response = http
        .post(channel.endpoint_url())
        .timeout(channel.timeout)
        .header("Authorization", format!("Bearer {}", channel.api_key))
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|err| LlmCallError::Transport(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(LlmCallError::Status {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json()
        .await
        .map_err(|err| LlmCallError::Transport(err.to_string()))
}

/// Non-stream structured call. Retries up to `max_attempts` with short
/// backoff; the strict-JSON system message is prepended when a response
/// format is requested.
pub async fn call_chat_completions(
    http: &reqwest::Client,
    channel: &ChatChannel,
    messages: &[Value],
    response_format: &Value,
    max_attempts: u32,
    cancel: &CancellationToken,
) -> Result<String, LlmCallError> {
    let messages = prepend_strict_system(messages);
    let attempts = max_attempts.max(1);
    let mut last_error: Option<LlmCallError> = None;

    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(LlmCallError::Cancelled);
        }
        let call = post_chat_completions(http, channel, &messages, Some(response_format));
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmCallError::Cancelled),
            outcome = call => outcome,
        };
        match outcome.and_then(|data| extract_message_content(&data)) {
            Ok(content) => return Ok(content),
            Err(err) => {
                tracing::debug!(attempt, error = %err, "structured chat call failed");
                last_error = Some(err);
                if attempt + 1 < attempts {
                    let delay = RETRY_DELAYS[(attempt as usize).min(RETRY_DELAYS.len() - 1)];
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(LlmCallError::RetriesExhausted(
        last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    ))
}

/// Streaming text call. Retries only before the first byte; once streaming
/// has begun any error is fatal so partial output is never accepted. Each
/// non-empty text fragment is handed to `on_delta`.
pub async fn call_chat_completions_stream_text(
    http: &reqwest::Client,
    channel: &ChatChannel,
    messages: &[Value],
    ignore_reasoning: bool,
    mut on_delta: impl FnMut(&str),
    cancel: &CancellationToken,
) -> Result<String, LlmCallError> {
    let mut last_error: Option<LlmCallError> = None;

    for attempt in 0..3u32 {
        if cancel.is_cancelled() {
            return Err(LlmCallError::Cancelled);
        }
        match stream_once(http, channel, messages, ignore_reasoning, &mut on_delta, cancel).await {
            Ok(text) => {
                if text.trim().is_empty() {
                    last_error = Some(LlmCallError::EmptyContent);
                } else {
                    return Ok(text);
                }
            }
            Err(StreamAttemptError::BeforeFirstByte(err)) => {
                tracing::debug!(attempt, error = %err, "narration stream failed before first byte");
                last_error = Some(err);
            }
            Err(StreamAttemptError::AfterFirstByte(err)) => return Err(err),
        }
        if attempt < 2 {
            let delay = RETRY_DELAYS[(attempt as usize).min(RETRY_DELAYS.len() - 1)];
            tokio::time::sleep(delay).await;
        }
    }

    Err(LlmCallError::RetriesExhausted(
        last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    ))
}

enum StreamAttemptError {
    BeforeFirstByte(LlmCallError),
    AfterFirstByte(LlmCallError),
}

async fn stream_once(
    http: &reqwest::Client,
    channel: &ChatChannel,
    messages: &[Value],
    ignore_reasoning: bool,
    on_delta: &mut impl FnMut(&str),
    cancel: &CancellationToken,
) -> Result<String, StreamAttemptError> {
    let body = json!({
        "model": channel.model,
        "messages": messages,
        "temperature": 0,
        "stream": true,
    });

    let response = http
        .post(channel.endpoint_url())
        .timeout(channel.timeout)
        .header("Authorization", format!("Bearer {}", channel.api_key))
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|err| {
            StreamAttemptError::BeforeFirstByte(LlmCallError::Transport(err.to_string()))
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(StreamAttemptError::BeforeFirstByte(LlmCallError::Status {
            status: status.as_u16(),
            body,
        }));
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut accumulated = String::new();
    let mut started = false;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(StreamAttemptError::AfterFirstByte(LlmCallError::Cancelled));
            }
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let bytes = chunk.map_err(|err| {
            let call_err = LlmCallError::StreamInterrupted(err.to_string());
            if started {
                StreamAttemptError::AfterFirstByte(call_err)
            } else {
                StreamAttemptError::BeforeFirstByte(LlmCallError::Transport(err.to_string()))
            }
        })?;
        started = true;
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.drain(..=newline);
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload.is_empty() {
                continue;
            }
            if payload == "[DONE]" {
                return Ok(accumulated);
            }
            let chunk: Value = serde_json::from_str(payload).map_err(|_| {
                StreamAttemptError::AfterFirstByte(LlmCallError::InvalidStreamChunk)
            })?;
            let fragment = extract_stream_chunk_text(&chunk, ignore_reasoning);
            if !fragment.is_empty() {
                on_delta(&fragment);
                accumulated.push_str(&fragment);
            }
        }
    }

    Ok(accumulated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_joins_cleanly() {
        let channel = ChatChannel {
            api_key: "k".to_string(),
            base_url: "https://api.example.com/v1/".to_string(),
            path: "/chat/completions".to_string(),
            model: "m".to_string(),
            timeout: Duration::from_secs(8),
        };
        assert_eq!(
            channel.endpoint_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn strict_system_is_prepended_once() {
        let messages = vec![
            json!({"role": "system", "content": STRICT_SYSTEM_PROMPT}),
            json!({"role": "user", "content": "hi"}),
        ];
        let out = prepend_strict_system(&messages);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["content"], STRICT_SYSTEM_PROMPT);
        assert_eq!(out[1]["role"], "user");
    }

    #[test]
    fn extract_content_requires_non_empty() {
        let ok = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_message_content(&ok).unwrap(), "hello");

        let empty = json!({"choices": [{"message": {"content": "  "}}]});
        assert!(matches!(
            extract_message_content(&empty),
            Err(LlmCallError::EmptyContent)
        ));

        let missing = json!({"choices": []});
        assert!(matches!(
            extract_message_content(&missing),
            Err(LlmCallError::MissingContent)
        ));
    }

    #[test]
    fn stream_chunk_extraction_honors_reasoning_flag() {
        let chunk = json!({
            "choices": [{"delta": {"reasoning_content": "thinking...", "content": "out"}}]
        });
        assert_eq!(extract_stream_chunk_text(&chunk, true), "out");
        assert_eq!(extract_stream_chunk_text(&chunk, false), "thinking...out");
        assert_eq!(extract_stream_chunk_text(&json!({"choices": []}), true), "");
    }
}
