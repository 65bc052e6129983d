//! Shared test fixtures: an engine wired with the in-memory store, the
//! built-in story, and the fake model boundary.
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use fabula_runtime::llm::boundary::{
    DeltaSink, LlmBoundary, ModelBoundary, NarrativePrompt, SelectionMappingRequest,
};
use fabula_runtime::llm::schemas::{EndingBundleOutput, NarrativeOutput, SelectionMappingV3};
use fabula_runtime::story::catalog::StoryCatalog;
use fabula_runtime::{
    EngineError, EngineResult, RuntimeConfig, SqliteStore, StepPipeline, TelemetryStore,
};
use tokio_util::sync::CancellationToken;

pub struct TestEngine {
    pub pipeline: Arc<StepPipeline>,
    pub telemetry: Arc<TelemetryStore>,
    pub config: Arc<RuntimeConfig>,
}

/// Engine with the fake (deterministic) boundary.
pub fn fake_engine() -> TestEngine {
    let config = Arc::new(RuntimeConfig::default());
    let boundary: Arc<dyn ModelBoundary> = Arc::new(LlmBoundary::from_config(&config));
    engine_with_boundary(config, boundary)
}

pub fn engine_with_boundary(
    config: Arc<RuntimeConfig>,
    boundary: Arc<dyn ModelBoundary>,
) -> TestEngine {
    let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory store"));
    let catalog = Arc::new(StoryCatalog::with_builtin());
    let pipeline = Arc::new(StepPipeline::new(
        store,
        catalog,
        boundary,
        Arc::clone(&config),
    ));
    TestEngine {
        pipeline,
        telemetry: Arc::new(TelemetryStore::new()),
        config,
    }
}

/// A boundary whose every call fails, for rollback tests.
pub struct FailingBoundary;

#[async_trait]
impl ModelBoundary for FailingBoundary {
    async fn map_free_input_v3(
        &self,
        _request: SelectionMappingRequest,
        _cancel: &CancellationToken,
    ) -> EngineResult<SelectionMappingV3> {
        Err(EngineError::LlmUnavailable("provider down".to_string()))
    }

    async fn narrative(
        &self,
        _prompt: NarrativePrompt,
        _on_delta: Option<DeltaSink>,
        _cancel: &CancellationToken,
    ) -> EngineResult<NarrativeOutput> {
        Err(EngineError::LlmUnavailable("provider down".to_string()))
    }

    async fn ending_bundle(
        &self,
        _profile_id: &str,
        _slots: serde_json::Map<String, serde_json::Value>,
        _cancel: &CancellationToken,
    ) -> EngineResult<EndingBundleOutput> {
        Err(EngineError::LlmUnavailable("provider down".to_string()))
    }

    fn provider_trace_label(&self) -> &'static str {
        "failing"
    }
}

/// A boundary that parks narration on a barrier so two steps can be held
/// in-flight past their version snapshots.
pub struct BarrierBoundary {
    pub barrier: Arc<tokio::sync::Barrier>,
}

#[async_trait]
impl ModelBoundary for BarrierBoundary {
    async fn map_free_input_v3(
        &self,
        _request: SelectionMappingRequest,
        _cancel: &CancellationToken,
    ) -> EngineResult<SelectionMappingV3> {
        Err(EngineError::LlmUnavailable("not used".to_string()))
    }

    async fn narrative(
        &self,
        _prompt: NarrativePrompt,
        _on_delta: Option<DeltaSink>,
        _cancel: &CancellationToken,
    ) -> EngineResult<NarrativeOutput> {
        self.barrier.wait().await;
        Ok(NarrativeOutput {
            narrative_text: "The scene shifts.".to_string(),
        })
    }

    async fn ending_bundle(
        &self,
        _profile_id: &str,
        _slots: serde_json::Map<String, serde_json::Value>,
        _cancel: &CancellationToken,
    ) -> EngineResult<EndingBundleOutput> {
        Err(EngineError::LlmUnavailable("not used".to_string()))
    }

    fn provider_trace_label(&self) -> &'static str {
        "barrier"
    }
}
