//! Fabula Runtime
//!
//! The step execution engine of the Fabula interactive-fiction platform:
//! it turns player input into deterministic decisions, mutates session state
//! under optimistic-concurrency guarantees, and produces narrative output
//! through a schema-enforced model boundary.

pub mod api;
pub mod config;
pub mod hashing;
pub mod kernel;
pub mod llm;
pub mod pipeline;
pub mod selection;
pub mod story;
pub mod store;
pub mod telemetry;
pub mod time;
pub mod types;

// Re-export commonly used types
pub use api::{AppState, HttpApiConfig, HttpApiServer};
pub use config::{ConfigError, RuntimeConfig};
pub use kernel::{apply_range_effects, apply_transition, normalize_state, StoryState};
pub use llm::{LlmBoundary, ModelBoundary};
pub use pipeline::{StepHooks, StepPipeline, StepRequest, StepResponse};
pub use story::{StoryCatalog, StoryPack};
pub use store::{RuntimeStore, SqliteStore};
pub use telemetry::{TelemetrySnapshot, TelemetryStore};
pub use types::{EngineError, EngineResult, SessionId, SessionStatus, UserId};
