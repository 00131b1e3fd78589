// ============================================================================
// reactive-core - Core Module
// Fundamental types, traits, and the tracking context
// ============================================================================

pub mod constants;
pub mod context;
pub mod error;
pub mod types;

pub use constants::*;
pub use context::{
    enter_tracking, is_batching, is_tracking, is_untracking, with_context,
    OutsideDerivationPolicy, ReactiveContext, Tracking, TrackingGuard,
};
pub use error::{Result, SignalError};
pub use types::{
    default_equals, Activity, AnyReaction, AnySource, DependentsList, EqualsFn, NodeFlags,
    PermanentHandle, PossiblyInvalidMap, Scheduled,
};
