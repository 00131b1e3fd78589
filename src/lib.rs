// ============================================================================
// reactive-core - A Fine-Grained Reactive Computation Engine
// ============================================================================
//
// Three reactive node kinds, cooperating through a shared dependency graph:
//
//   - `State<T>`   a writable cell (§4.2)
//   - `Derived<T>`  a lazily computed, memoized value (§4.3)
//   - `Effect`      a side-effecting reaction, deferred to the next `tick()`
//                   (§4.4)
//
// Reads inside a `Derived`/`Effect` body register a dependency edge
// automatically; writes to a `State` invalidate every live dependent,
// transitively. Nothing ever re-runs synchronously from a write - effects
// are coalesced onto a microtask-queue substitute and only actually execute
// when the host calls `tick()` (or a registered scheduler callback decides
// to drain it). See `core` for the node model and tracking context, and
// `reactivity` for invalidation, scheduling, batching and equality.
// ============================================================================

pub mod core;
pub mod primitives;
pub mod reactivity;

pub use core::error::{Result, SignalError};
pub use core::context::{
    is_batching, is_tracking, is_untracking, set_outside_derivation_policy,
    outside_derivation_policy, with_context, OutsideDerivationPolicy, ReactiveContext, Tracking,
};
pub use core::types::{default_equals, AnyReaction, AnySource, EqualsFn, Scheduled};

pub use primitives::derived::{derived, derived_with_equals, now, Derived, DerivedInner};
pub use primitives::effect::{
    effect, effect_anchored, effect_persistent, Effect, EffectFn, EffectLifetime,
};
pub use primitives::state::{state, state_with_equals, State};

pub use reactivity::batching::{batch, peek, untrack};
pub use reactivity::equality::StructuralEq;
pub use reactivity::propagate::{invalidate_set, propagate_from};
pub use reactivity::scheduling::{
    clear_microtask_scheduler, flush_sync, request_drain, set_microtask_scheduler, tick,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    // =========================================================================
    // §8 scenario 1: a derived re-reads exactly once per real upstream change
    // =========================================================================

    #[test]
    fn derived_caches_and_only_recomputes_on_real_change() {
        let calls = Rc::new(Cell::new(0));
        let a = state(1);
        let d = {
            let calls = calls.clone();
            let a = a.clone();
            derived(move || {
                calls.set(calls.get() + 1);
                a.get() * 2
            })
        };

        assert_eq!(d.get(), 2);
        assert_eq!(d.get(), 2);
        assert_eq!(calls.get(), 1, "second read must hit the cache");

        a.set(1); // no real change
        assert_eq!(d.get(), 2);
        assert_eq!(calls.get(), 1);

        a.set(5);
        assert_eq!(d.get(), 10);
        assert_eq!(calls.get(), 2);
    }

    // =========================================================================
    // §8 scenario 2: a chain whose middle link absorbs the change never
    // propagates the recompute past it
    // =========================================================================

    #[test]
    fn chain_absorbs_a_change_that_does_not_affect_the_downstream_value() {
        let calls_c = Rc::new(Cell::new(0));
        let a = state(0);

        let b = {
            let a = a.clone();
            derived(move || a.get().clamp(0, 10))
        };

        let c = {
            let b = b.clone();
            let calls_c = calls_c.clone();
            derived(move || {
                calls_c.set(calls_c.get() + 1);
                b.get() * 100
            })
        };

        assert_eq!(c.get(), 0);
        assert_eq!(calls_c.get(), 1);

        a.set(-5); // clamps to 0 too: b's value is unchanged
        assert_eq!(c.get(), 0);
        assert_eq!(calls_c.get(), 1, "b's output didn't actually change, so c must not recompute");

        a.set(7);
        assert_eq!(c.get(), 700);
        assert_eq!(calls_c.get(), 2);
    }

    // =========================================================================
    // Diamond dependency: D depends on both B and C, which both depend on A
    // =========================================================================

    #[test]
    fn diamond_dependency_reads_the_latest_value_from_both_branches() {
        let a = state(1);
        let b = {
            let a = a.clone();
            derived(move || a.get() + 10)
        };
        let c = {
            let a = a.clone();
            derived(move || a.get() * 10)
        };
        let d = {
            let b = b.clone();
            let c = c.clone();
            derived(move || b.get() + c.get())
        };

        assert_eq!(d.get(), 21);
        a.set(2);
        assert_eq!(d.get(), 32);
    }

    // =========================================================================
    // Effects: coalesced scheduling and batching
    // =========================================================================

    #[test]
    fn batched_writes_produce_a_single_coalesced_effect_run() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = state(1);
        let b = state(2);

        let _e = {
            let log = log.clone();
            let a = a.clone();
            let b = b.clone();
            effect(move |_| log.borrow_mut().push(a.get() + b.get()))
        };
        tick();
        assert_eq!(*log.borrow(), vec![3]);

        batch(|| {
            a.set(10);
            b.set(20);
        });
        tick();
        assert_eq!(*log.borrow(), vec![3, 30], "batch collapses both writes into one run");
    }

    #[test]
    fn untrack_inside_an_effect_body_does_not_create_a_dependency() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let tracked = state(1);
        let silent = state(100);

        let _e = {
            let log = log.clone();
            let tracked = tracked.clone();
            let silent = silent.clone();
            effect(move |_| {
                let t = tracked.get();
                let s = untrack(|| silent.get());
                log.borrow_mut().push(t + s);
            })
        };
        tick();
        assert_eq!(*log.borrow(), vec![101]);

        silent.set(999);
        tick();
        assert_eq!(*log.borrow(), vec![101], "a write to an untracked read must not reschedule");

        tracked.set(2);
        tick();
        assert_eq!(*log.borrow(), vec![101, 1001], "picks up silent's latest value on an unrelated rerun");
    }

    // =========================================================================
    // peek
    // =========================================================================

    #[test]
    fn peek_reads_without_registering_a_dependency() {
        let calls = Rc::new(Cell::new(0));
        let s = state(1);
        let d = {
            let calls = calls.clone();
            let s = s.clone();
            derived(move || {
                calls.set(calls.get() + 1);
                peek(|| s.get())
            })
        };

        assert_eq!(d.get(), 1);
        assert_eq!(calls.get(), 1);

        s.set(2);
        // d never registered a dependency on s, so it will not recompute on
        // its own and a fresh read still returns the stale cached value.
        assert_eq!(d.get(), 1);
        assert_eq!(calls.get(), 1);
    }
}
