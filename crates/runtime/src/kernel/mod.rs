//! Pure state kernel: normalization, range effects, transitions, and
//! ending resolution. No I/O, no clocks.

pub mod effects;
pub mod endings;
pub mod state;

pub use effects::{
    apply_range_effects, apply_transition, effective_intensity_tier, AppliedEffect, StateDelta,
};
pub use endings::{resolve_run_ending, EndingResolution, TIMEOUT_ENDING_ID};
pub use state::{
    build_npc_state_from_defs, default_state, normalize_state, NpcEntry, NudgeTier, RunState,
    StoryState, TimeSlot,
};
