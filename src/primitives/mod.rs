// ============================================================================
// reactive-core - Primitives Module
// The three reactive node kinds: State, Derived, Effect
// ============================================================================

pub mod derived;
pub mod effect;
pub mod flatten;
pub mod state;

pub use derived::{derived, derived_with_equals, now, Derived, DerivedInner};
pub use effect::{effect, effect_anchored, effect_persistent, Effect, EffectFn, EffectLifetime};
pub use state::{state, state_with_equals, State};
