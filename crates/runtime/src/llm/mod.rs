//! LLM boundary: schema-enforced structured calls and streaming narration
//! over one chat-completions endpoint, with a deterministic fake mode when
//! no API key is configured.

pub mod boundary;
pub mod client;
pub mod grammar;
pub mod prompts;
pub mod schemas;

pub use boundary::{
    DeltaSink, LlmBoundary, ModelBoundary, NarrativePrompt, SelectionMappingRequest,
};
pub use client::{ChatChannel, LlmCallError};
pub use grammar::{validate_structured_output, GrammarError};
pub use schemas::{
    DecisionCode, EndingBundleOutput, EndingReport, NarrativeOutput, SelectionCandidate,
    SelectionMappingV3, TargetType, ENDING_BUNDLE_SCHEMA_NAME, NARRATIVE_SCHEMA_NAME,
    SELECTION_MAPPING_V3_SCHEMA_NAME,
};
