// ============================================================================
// reactive-core - Dependency Tracking
// `useDerived(set)` (spec §4.1) and the read-side of the tracking contract
// ============================================================================

use std::rc::Rc;

use crate::core::context::{with_context, OutsideDerivationPolicy};
use crate::core::error::SignalError;
use crate::core::types::DependentsList;

/// The `useDerived(set)` contract from spec §4.1.
///
/// Called by every source's `read()`/`now()`-adjacent path with its own
/// dependents set. If a derivation is active, registers the current
/// activity and marks the context as "used" (enabling const-folding when a
/// derivator never calls this). If tracking is `Ignored`, this is a no-op.
/// If `Outside`, consults the configured penalty policy.
pub fn use_derived(dependents: &DependentsList) -> crate::core::error::Result<()> {
    with_context(|ctx| {
        if let Some(activity) = ctx.current_activity() {
            dependents.add(Rc::downgrade(&activity));
            ctx.mark_used();
            return Ok(());
        }

        if ctx.is_ignored() {
            return Ok(());
        }

        // Outside any derivation.
        match ctx.outside_policy() {
            OutsideDerivationPolicy::Allow => Ok(()),
            OutsideDerivationPolicy::Throw => Err(SignalError::UseOutsideDerivation),
            OutsideDerivationPolicy::Custom(callback) => {
                callback();
                Ok(())
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::{enter_tracking, OutsideDerivationPolicy, Tracking};
    use crate::core::types::{Activity, AnyReaction, PermanentHandle};
    use std::any::Any;
    use std::cell::Cell;

    struct DummyReaction {
        flags: Cell<u32>,
    }
    impl AnyReaction for DummyReaction {
        fn flags(&self) -> u32 {
            self.flags.get()
        }
        fn set_flags(&self, flags: u32) {
            self.flags.set(flags);
        }
        fn current_activity(&self) -> Option<Rc<Activity>> {
            None
        }
        fn invalidate(&self, _transitive: bool) {}
        fn insert_possibly_invalid(&self, _dep: PermanentHandle, _last_seen: Box<dyn Any>) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn registers_dependent_when_active() {
        let reaction: Rc<dyn AnyReaction> = Rc::new(DummyReaction {
            flags: Cell::new(0),
        });
        let activity = Activity::new(Rc::downgrade(&reaction));
        let guard = enter_tracking(Tracking::Active(activity));

        let dependents = DependentsList::new();
        assert!(dependents.is_empty());
        use_derived(&dependents).unwrap();
        assert!(!dependents.is_empty());
        assert!(guard.used());
    }

    #[test]
    fn ignored_scope_registers_nothing() {
        let _guard = enter_tracking(Tracking::Ignored);
        let dependents = DependentsList::new();
        use_derived(&dependents).unwrap();
        assert!(dependents.is_empty());
    }

    #[test]
    fn outside_allow_is_default() {
        let dependents = DependentsList::new();
        assert!(use_derived(&dependents).is_ok());
        assert!(dependents.is_empty());
    }

    #[test]
    fn outside_throw_raises() {
        with_context(|ctx| ctx.set_outside_policy(OutsideDerivationPolicy::Throw));
        let dependents = DependentsList::new();
        let result = use_derived(&dependents);
        with_context(|ctx| ctx.set_outside_policy(OutsideDerivationPolicy::Allow));
        assert!(matches!(result, Err(SignalError::UseOutsideDerivation)));
    }

    #[test]
    fn outside_custom_runs_callback_then_allows() {
        use std::cell::RefCell;
        let called = Rc::new(RefCell::new(false));
        let called2 = called.clone();
        with_context(|ctx| {
            ctx.set_outside_policy(OutsideDerivationPolicy::Custom(Rc::new(move || {
                *called2.borrow_mut() = true;
            })))
        });
        let dependents = DependentsList::new();
        let result = use_derived(&dependents);
        with_context(|ctx| ctx.set_outside_policy(OutsideDerivationPolicy::Allow));
        assert!(result.is_ok());
        assert!(*called.borrow());
    }
}
