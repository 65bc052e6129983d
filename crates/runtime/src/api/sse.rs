//! Streaming step endpoint.
//!
//! The pipeline runs in a spawned task; phase and delta hooks forward frames
//! through a bounded channel into the SSE body. When the client stops
//! consuming the response, sends fail, the cancellation token fires, and the
//! pipeline unwinds without committing.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::routes::idempotency_key;
use super::middleware::resolve_actor;
use super::types::AppState;
use crate::pipeline::{StepHooks, StepRequest, StepResponse};
use crate::types::{EngineError, SessionId};

/// Frames produced by a streaming step.
#[derive(Debug, Clone)]
pub enum SseFrame {
    Meta { session_id: String },
    Phase { name: String, payload: Option<serde_json::Value> },
    Delta(String),
    Replay,
    Final(Box<StepResponse>),
    Error { code: String, message: String },
    Done,
}

impl SseFrame {
    /// Render a frame as an SSE event.
    pub fn to_event(&self) -> Event {
        match self {
            SseFrame::Meta { session_id } => Event::default().event("meta").data(
                json!({"session_id": session_id, "stream": "step"}).to_string(),
            ),
            SseFrame::Phase { name, payload } => Event::default().event("phase").data(
                json!({"phase": name, "payload": payload}).to_string(),
            ),
            SseFrame::Delta(text) => Event::default()
                .event("narrative_delta")
                .data(json!({"text": text}).to_string()),
            SseFrame::Replay => Event::default()
                .event("replay")
                .data(json!({"replay": true}).to_string()),
            SseFrame::Final(response) => Event::default().event("final").data(
                serde_json::to_string(response.as_ref()).unwrap_or_else(|_| "{}".to_string()),
            ),
            SseFrame::Error { code, message } => Event::default().event("error").data(
                json!({"code": code, "message": message}).to_string(),
            ),
            SseFrame::Done => Event::default().event("done").data("{}"),
        }
    }
}

fn send_frame(tx: &mpsc::Sender<SseFrame>, cancel: &CancellationToken, frame: SseFrame) {
    // A full or closed channel means the client is gone; flip the abort
    // signal so the pipeline stops at its next checkpoint.
    if tx.try_send(frame).is_err() {
        cancel.cancel();
    }
}

/// Execute one step, streaming phases and narrative deltas as SSE.
pub async fn step_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(payload): Json<StepRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let started = Instant::now();
    let session_id = SessionId::from(session_id);
    let (tx, rx) = mpsc::channel::<SseFrame>(64);
    let cancel = CancellationToken::new();

    let key_result = idempotency_key(&headers);
    let actor_result = resolve_actor(&state, &headers).await;

    let task_tx = tx.clone();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        send_frame(
            &task_tx,
            &task_cancel,
            SseFrame::Meta {
                session_id: session_id.0.clone(),
            },
        );

        let outcome = async {
            let key = key_result?;
            let actor = actor_result?;

            let phase_tx = task_tx.clone();
            let phase_cancel = task_cancel.clone();
            let delta_tx = task_tx.clone();
            let delta_cancel = task_cancel.clone();
            let hooks = StepHooks {
                on_phase: Some(Arc::new(move |name: &str, payload: Option<&serde_json::Value>| {
                    send_frame(
                        &phase_tx,
                        &phase_cancel,
                        SseFrame::Phase {
                            name: name.to_string(),
                            payload: payload.cloned(),
                        },
                    );
                })),
                on_delta: Some(Arc::new(move |text: &str| {
                    send_frame(&delta_tx, &delta_cancel, SseFrame::Delta(text.to_string()));
                })),
                cancel: task_cancel.clone(),
            };

            state
                .pipeline
                .run_step(&session_id, &payload, &key, actor.as_ref(), &hooks)
                .await
        }
        .await;

        match outcome {
            Ok((response, replayed)) => {
                if replayed {
                    send_frame(&task_tx, &task_cancel, SseFrame::Replay);
                } else {
                    state.telemetry.record_step_success(
                        started.elapsed().as_secs_f64() * 1000.0,
                        response.fallback_used,
                        response.ending_id.as_deref(),
                    );
                }
                send_frame(&task_tx, &task_cancel, SseFrame::Final(Box::new(response)));
            }
            Err(err) => {
                state.telemetry.record_step_failure(err.code());
                if !matches!(err, EngineError::StreamAborted) {
                    tracing::debug!(error = %err, "streaming step failed");
                }
                // The channel may already be dead on abort; flushing the
                // terminating frame is best-effort.
                send_frame(
                    &task_tx,
                    &task_cancel,
                    SseFrame::Error {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    },
                );
            }
        }
        send_frame(&task_tx, &task_cancel, SseFrame::Done);
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok(frame.to_event()), rx))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_render_expected_event_names() {
        let meta = SseFrame::Meta {
            session_id: "s1".to_string(),
        };
        let phase = SseFrame::Phase {
            name: "selection_start".to_string(),
            payload: Some(json!({"selection_mode": "free_input"})),
        };
        let delta = SseFrame::Delta("chunk".to_string());
        let error = SseFrame::Error {
            code: "LLM_UNAVAILABLE".to_string(),
            message: "down".to_string(),
        };
        // Event does not expose its fields; rendering without panicking and
        // the debug formatting carrying the event name is what we can check.
        for (frame, name) in [
            (meta, "meta"),
            (phase, "phase"),
            (delta, "narrative_delta"),
            (error, "error"),
            (SseFrame::Replay, "replay"),
            (SseFrame::Done, "done"),
        ] {
            let event = frame.to_event();
            assert!(format!("{event:?}").contains(name));
        }
    }

    #[test]
    fn send_frame_cancels_on_closed_channel() {
        let (tx, rx) = mpsc::channel::<SseFrame>(1);
        drop(rx);
        let cancel = CancellationToken::new();
        send_frame(&tx, &cancel, SseFrame::Done);
        assert!(cancel.is_cancelled());
    }
}
