// ============================================================================
// reactive-core - Invalidation Propagator
// Spec §4.5: `invalidate` / `invalidateSet`
// ============================================================================
//
// The generic "walk D, mark dependents possibly-invalid, recurse" logic
// lives here as free functions, shared by `State::set` and `Derived`'s own
// `invalidate` (its transitive tail) rather than duplicated per node kind,
// per SPEC_FULL §10.
// ============================================================================

use std::rc::Rc;

use crate::core::types::{AnySource, DependentsList};

/// Walk `source`'s dependents set, marking every live one possibly-invalid
/// and recursing transitively.
///
/// Mirrors spec §4.5's `invalidate` body for the case where `node` is a
/// source with a dependents set to drain (i.e. every case that reaches past
/// the Effect short-circuit). The recursion guard (`on_stack`) defends
/// against re-entrant graphs even though a dead activity already silently
/// drops most stale edges.
pub fn propagate_from(source: &Rc<dyn AnySource>) {
    if source.on_stack() {
        return;
    }
    if source.dependents_is_empty() {
        return;
    }

    source.set_on_stack(true);

    let dependents = source.drain_dependents();
    let permanent = source.permanent_handle();

    for weak_activity in dependents {
        let Some(activity) = weak_activity.upgrade() else {
            continue; // stale: the owning evaluation has since moved on
        };
        let Some(owner) = activity.owner() else {
            continue; // the reaction itself has been dropped
        };

        let snapshot = source.snapshot_any();
        owner.insert_possibly_invalid(permanent.clone(), snapshot);
        owner.invalidate(true);
    }

    source.set_on_stack(false);
}

/// `invalidateSet(S)` from spec §4.5: used by out-of-scope collaborators
/// (reactive containers) when a specific key changes rather than a whole
/// node's value. Snapshots and clears `dependents`, then directly
/// (non-transitively) invalidates every dependent still reachable.
pub fn invalidate_set(dependents: &DependentsList) {
    let drained = dependents.drain();
    for weak_activity in drained {
        let Some(activity) = weak_activity.upgrade() else {
            continue;
        };
        let Some(owner) = activity.owner() else {
            continue;
        };
        owner.invalidate(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        Activity, AnyReaction, DependentsList, NodeFlags, PermanentHandle, PossiblyInvalidMap,
    };
    use std::any::Any;
    use std::cell::RefCell;
    use std::rc::Weak;

    struct TestSource {
        flags: NodeFlags,
        dependents: DependentsList,
        value: RefCell<i32>,
    }

    impl AnySource for TestSource {
        fn flags(&self) -> u32 {
            self.flags.get()
        }
        fn set_flags(&self, flags: u32) {
            self.flags.set(flags)
        }
        fn permanent_handle(&self) -> PermanentHandle {
            unreachable!("not exercised in this test")
        }
        fn add_dependent(&self, activity: Weak<Activity>) {
            self.dependents.add(activity)
        }
        fn drain_dependents(&self) -> Vec<Weak<Activity>> {
            self.dependents.drain()
        }
        fn dependents_is_empty(&self) -> bool {
            self.dependents.is_empty()
        }
        fn snapshot_any(&self) -> Box<dyn Any> {
            Box::new(*self.value.borrow())
        }
        fn poll_unchanged(&self, recorded: &dyn Any) -> crate::core::error::Result<bool> {
            Ok(*self.value.borrow() == *recorded.downcast_ref::<i32>().unwrap())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct TestReaction {
        flags: NodeFlags,
        invalidated: RefCell<Vec<bool>>,
        possibly_invalid: PossiblyInvalidMap,
        activity: RefCell<Option<Rc<Activity>>>,
    }

    impl TestReaction {
        fn new() -> Rc<Self> {
            Rc::new_cyclic(|weak_self| {
                let activity = Activity::new(weak_self.clone() as Weak<dyn AnyReaction>);
                Self {
                    flags: NodeFlags::new(0),
                    invalidated: RefCell::new(Vec::new()),
                    possibly_invalid: PossiblyInvalidMap::new(),
                    activity: RefCell::new(Some(activity)),
                }
            })
        }
    }

    impl AnyReaction for TestReaction {
        fn flags(&self) -> u32 {
            self.flags.get()
        }
        fn set_flags(&self, flags: u32) {
            self.flags.set(flags)
        }
        fn current_activity(&self) -> Option<Rc<Activity>> {
            self.activity.borrow().clone()
        }
        fn invalidate(&self, transitive: bool) {
            self.invalidated.borrow_mut().push(transitive);
        }
        fn insert_possibly_invalid(&self, dep: PermanentHandle, last_seen: Box<dyn Any>) {
            self.possibly_invalid.insert_if_absent(dep, last_seen);
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn propagate_from_invalidates_live_dependents_transitively() {
        let source: Rc<dyn AnySource> = Rc::new(TestSource {
            flags: NodeFlags::new(0),
            dependents: DependentsList::new(),
            value: RefCell::new(1),
        });
        let reaction = TestReaction::new();
        let weak_activity = Rc::downgrade(reaction.current_activity().as_ref().unwrap());
        source.add_dependent(weak_activity);

        propagate_from(&source);

        assert_eq!(*reaction.invalidated.borrow(), vec![true]);
        assert_eq!(reaction.possibly_invalid.take().len(), 1);
    }

    #[test]
    fn propagate_from_skips_dead_activities() {
        let source: Rc<dyn AnySource> = Rc::new(TestSource {
            flags: NodeFlags::new(0),
            dependents: DependentsList::new(),
            value: RefCell::new(1),
        });
        let reaction = TestReaction::new();
        let weak_activity = Rc::downgrade(reaction.current_activity().as_ref().unwrap());
        source.add_dependent(weak_activity);

        // Drop the activity by moving the reaction to a new one (simulating re-evaluation).
        *reaction.activity.borrow_mut() = None;

        propagate_from(&source);
        assert!(reaction.invalidated.borrow().is_empty());
    }

    #[test]
    fn propagate_from_is_a_noop_on_empty_dependents() {
        let source: Rc<dyn AnySource> = Rc::new(TestSource {
            flags: NodeFlags::new(0),
            dependents: DependentsList::new(),
            value: RefCell::new(1),
        });
        propagate_from(&source); // must not panic
    }

    #[test]
    fn invalidate_set_invalidates_directly_not_transitively() {
        let dependents = DependentsList::new();
        let reaction = TestReaction::new();
        let weak_activity = Rc::downgrade(reaction.current_activity().as_ref().unwrap());
        dependents.add(weak_activity);

        invalidate_set(&dependents);

        assert_eq!(*reaction.invalidated.borrow(), vec![false]);
    }
}
