// ============================================================================
// reactive-core - Tracking Context
// The process-wide (here: thread-local) "currently running derivation" slot
// ============================================================================
//
// Ports spec §4.1. Rust has no implicit single mutable global, so this is a
// thread-local, exactly as §9's "in a multi-threaded port, make it
// thread-local" instructs — taken literally even in the single-threaded
// default build, since a `thread_local!` is the closest stand-in for a
// process-wide slot in a language without one.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::types::Activity;

// =============================================================================
// TRACKING: THE THREE STATES OF `current`
// =============================================================================

/// The three states `current` can take (spec §4.1).
#[derive(Clone)]
pub enum Tracking {
    /// A derivation is actively evaluating; reads should register against
    /// its activity.
    Active(Rc<Activity>),
    /// Reads are being deliberately ignored (`now`/`untracked`/internal
    /// revalidation walks).
    Ignored,
    /// Outside of any derivation; governed by `OutsideDerivationPolicy`.
    Outside,
}

// =============================================================================
// THE "USE OUTSIDE A DERIVATION" PENALTY KNOB
// =============================================================================

/// What to do when a reactive read happens with `current == Outside` (spec
/// §4.1, §6's "Penalty knobs").
#[derive(Clone)]
pub enum OutsideDerivationPolicy {
    /// Silently do nothing; the read simply registers no dependency.
    Allow,
    /// Raise `SignalError::UseOutsideDerivation`.
    Throw,
    /// Run a callback (for example, to log a warning) and then proceed as
    /// `Allow`.
    Custom(Rc<dyn Fn()>),
}

impl Default for OutsideDerivationPolicy {
    fn default() -> Self {
        OutsideDerivationPolicy::Allow
    }
}

// =============================================================================
// REACTIVE CONTEXT
// =============================================================================

pub struct ReactiveContext {
    current: RefCell<Tracking>,
    used: Cell<bool>,
    outside_policy: RefCell<OutsideDerivationPolicy>,
    batch_depth: Cell<u32>,
}

impl ReactiveContext {
    fn new() -> Self {
        Self {
            current: RefCell::new(Tracking::Outside),
            used: Cell::new(false),
            outside_policy: RefCell::new(OutsideDerivationPolicy::default()),
            batch_depth: Cell::new(0),
        }
    }

    pub fn current_activity(&self) -> Option<Rc<Activity>> {
        match &*self.current.borrow() {
            Tracking::Active(activity) => Some(activity.clone()),
            Tracking::Ignored | Tracking::Outside => None,
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(&*self.current.borrow(), Tracking::Ignored)
    }

    pub fn is_outside(&self) -> bool {
        matches!(&*self.current.borrow(), Tracking::Outside)
    }

    pub fn mark_used(&self) {
        self.used.set(true);
    }

    pub fn was_used(&self) -> bool {
        self.used.get()
    }

    pub fn outside_policy(&self) -> OutsideDerivationPolicy {
        self.outside_policy.borrow().clone()
    }

    pub fn set_outside_policy(&self, policy: OutsideDerivationPolicy) {
        *self.outside_policy.borrow_mut() = policy;
    }

    pub fn enter_batch(&self) -> u32 {
        let depth = self.batch_depth.get() + 1;
        self.batch_depth.set(depth);
        depth
    }

    pub fn exit_batch(&self) -> u32 {
        let depth = self.batch_depth.get().saturating_sub(1);
        self.batch_depth.set(depth);
        depth
    }

    pub fn is_batching(&self) -> bool {
        self.batch_depth.get() > 0
    }
}

impl Default for ReactiveContext {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CONTEXT: ReactiveContext = ReactiveContext::new();
}

/// Access the thread-local reactive context.
pub fn with_context<R>(f: impl FnOnce(&ReactiveContext) -> R) -> R {
    CONTEXT.with(f)
}

// =============================================================================
// GUARANTEED-RELEASE SCOPES
// =============================================================================
//
// "All entry points save and restore `current` and `used` in a
// guaranteed-release scope on both normal return and failure" (spec §4.1).
// `TrackingGuard`'s `Drop` is that guarantee: even if the caller's closure
// unwinds, the previous `current`/`used` are restored.
// =============================================================================

pub struct TrackingGuard {
    prev: Option<Tracking>,
    prev_used: bool,
}

impl TrackingGuard {
    /// Whether a read registered a dependency during this scope. Must be
    /// read before the guard drops (it reflects the about-to-be-superseded
    /// `used` flag).
    pub fn used(&self) -> bool {
        with_context(|ctx| ctx.used.get())
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            with_context(|ctx| {
                ctx.current.replace(prev);
                ctx.used.set(self.prev_used);
            });
        }
    }
}

/// Enter a new tracking state, returning a guard that restores the previous
/// state (and `used` flag) when dropped.
pub fn enter_tracking(new_state: Tracking) -> TrackingGuard {
    with_context(|ctx| {
        let prev = ctx.current.replace(new_state);
        let prev_used = ctx.used.replace(false);
        TrackingGuard {
            prev: Some(prev),
            prev_used,
        }
    })
}

/// True if a derivation is currently evaluating (`current` is `Active`).
pub fn is_tracking() -> bool {
    with_context(|ctx| ctx.current_activity().is_some())
}

/// True if reads are currently being ignored (`now`/`untracked`).
pub fn is_untracking() -> bool {
    with_context(|ctx| ctx.is_ignored())
}

/// True if at least one `batch` scope is currently open.
pub fn is_batching() -> bool {
    with_context(|ctx| ctx.is_batching())
}

/// Set the process-wide penalty policy for reads that happen with `current
/// == Outside` (spec §6's "Penalty knobs").
pub fn set_outside_derivation_policy(policy: OutsideDerivationPolicy) {
    with_context(|ctx| ctx.set_outside_policy(policy));
}

/// The currently configured outside-derivation penalty policy.
pub fn outside_derivation_policy() -> OutsideDerivationPolicy {
    with_context(|ctx| ctx.outside_policy())
}
