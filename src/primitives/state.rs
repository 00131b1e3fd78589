// ============================================================================
// reactive-core - State
// `State<T>` (spec §4.2), renamed from the teacher's `Signal<T>`
// ============================================================================
//
// A writable reactive cell. Structurally just a value plus a dependents set
// (`D`) — unlike `Derived`/`Effect` a `State` is never itself invalid, so it
// carries no `W`/`P`/derivator at all. `set` implements spec §4.2 literally:
// compare under the equality relation, and on a real change drain `D` and
// invalidate every live dependent *directly* (`transitive = false`) — the
// dependent just read this exact value changing under it, so there is
// nothing "possible" about its invalidity, unlike the possibly-invalid tail
// a `Derived`'s own `invalidate` walks into (see `reactivity::propagate`).
// ============================================================================

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::core::error::Result;
use crate::core::types::{
    default_equals, Activity, AnySource, DependentsList, EqualsFn, NodeFlags, PermanentHandle,
};
use crate::reactivity::batching::untrack;
use crate::reactivity::tracking::use_derived;

struct StateInner<T> {
    flags: NodeFlags,
    value: RefCell<T>,
    equals: EqualsFn<T>,
    dependents: DependentsList,
    permanent: PermanentHandle,
}

impl<T: 'static> StateInner<T> {
    fn new(value: T, equals: EqualsFn<T>) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            flags: NodeFlags::new(0),
            value: RefCell::new(value),
            equals,
            dependents: DependentsList::new(),
            permanent: PermanentHandle::new(weak_self.clone() as Weak<dyn AnySource>),
        })
    }
}

impl<T: 'static + Clone> AnySource for StateInner<T> {
    fn flags(&self) -> u32 {
        self.flags.get()
    }

    fn set_flags(&self, flags: u32) {
        self.flags.set(flags)
    }

    fn permanent_handle(&self) -> PermanentHandle {
        self.permanent.clone()
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
        Box::new(self.value.borrow().clone())
    }

    fn poll_unchanged(&self, recorded: &dyn Any) -> Result<bool> {
        let recorded = recorded
            .downcast_ref::<T>()
            .expect("possibly-invalid map entry type mismatch");
        Ok((self.equals)(&self.value.borrow(), recorded))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A writable reactive cell (spec §4.2).
pub struct State<T> {
    inner: Rc<StateInner<T>>,
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static + Clone> State<T> {
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self {
            inner: StateInner::new(value, default_equals),
        }
    }

    pub fn new_with_equals(value: T, equals: EqualsFn<T>) -> Self {
        Self {
            inner: StateInner::new(value, equals),
        }
    }

    /// §4.2 `read()`: register the caller (if any) as a dependent, then
    /// return the current value. Panics if the outside-derivation policy is
    /// `Throw` and this is called outside any derivation; see `try_get`.
    pub fn get(&self) -> T {
        self.try_get()
            .unwrap_or_else(|e| panic!("State::get: {e}"))
    }

    /// Fallible form of `get`, surfacing `SignalError::UseOutsideDerivation`
    /// instead of panicking.
    pub fn try_get(&self) -> Result<T> {
        use_derived(&self.inner.dependents)?;
        Ok(self.inner.value.borrow().clone())
    }

    /// §4.2 `now()`: read the current value without registering a
    /// dependency, regardless of the ambient tracking context.
    pub fn now(&self) -> T {
        untrack(|| self.inner.value.borrow().clone())
    }

    /// §4.2 `set(v)`: overwrite under the equality relation and, on a real
    /// change, directly invalidate every live dependent. Returns whether the
    /// value actually changed.
    pub fn set(&self, value: T) -> bool {
        let changed = {
            let mut current = self.inner.value.borrow_mut();
            if (self.inner.equals)(&current, &value) {
                false
            } else {
                *current = value;
                true
            }
        };
        if changed {
            self.notify_dependents();
        }
        changed
    }

    /// §4.2 `mut(fn)`: apply `f` to the current value in place, then
    /// propagate exactly as `set` would if the result differs under the
    /// equality relation.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        let changed = {
            let mut current = self.inner.value.borrow_mut();
            let before = current.clone();
            f(&mut current);
            !(self.inner.equals)(&before, &current)
        };
        if changed {
            self.notify_dependents();
        }
        changed
    }

    fn notify_dependents(&self) {
        let dependents = self.inner.dependents.drain();
        for weak_activity in dependents {
            let Some(activity) = weak_activity.upgrade() else {
                continue;
            };
            let Some(owner) = activity.owner() else {
                continue;
            };
            // Direct, not transitive: this dependent read exactly the value
            // that just changed, so it is definitely (not possibly) invalid.
            owner.invalidate(false);
        }
    }

    /// Expose this state as a type-erased `AnySource`, for collaborators
    /// (spec §6) that want to hold a dependency on it without knowing `T`.
    pub fn as_any_source(&self) -> Rc<dyn AnySource> {
        self.inner.clone()
    }
}

impl<T: std::fmt::Debug + 'static + Clone> std::fmt::Debug for State<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State").field("value", &self.now()).finish()
    }
}

/// Construct a `State<T>` using `T`'s `PartialEq` for change detection.
pub fn state<T: 'static + Clone + PartialEq>(value: T) -> State<T> {
    State::new(value)
}

/// Construct a `State<T>` with a custom equality function.
pub fn state_with_equals<T: 'static + Clone>(value: T, equals: EqualsFn<T>) -> State<T> {
    State::new_with_equals(value, equals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::{enter_tracking, OutsideDerivationPolicy, Tracking};
    use crate::core::context::{set_outside_derivation_policy, with_context};
    use crate::core::types::AnyReaction;
    use std::cell::Cell;

    #[test]
    fn get_returns_current_value() {
        let s = state(1);
        assert_eq!(s.get(), 1);
    }

    #[test]
    fn set_no_op_on_equal_value_does_not_notify() {
        let s = state(1);
        assert!(!s.set(1));
    }

    #[test]
    fn set_returns_true_on_real_change() {
        let s = state(1);
        assert!(s.set(2));
        assert_eq!(s.now(), 2);
    }

    #[test]
    fn update_mutates_in_place() {
        let s = state(vec![1, 2, 3]);
        assert!(s.update(|v| v.push(4)));
        assert_eq!(s.now(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn now_does_not_register_dependency() {
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

        let reaction: Rc<dyn AnyReaction> = Rc::new(DummyReaction {
            flags: Cell::new(0),
        });
        let activity = Activity::new(Rc::downgrade(&reaction));
        let _guard = enter_tracking(Tracking::Active(activity));

        let s = state(1);
        assert_eq!(s.now(), 1);
        assert!(s.inner.dependents.is_empty());
    }

    #[test]
    fn try_get_throws_outside_policy() {
        set_outside_derivation_policy(OutsideDerivationPolicy::Throw);
        let s = state(1);
        let result = s.try_get();
        with_context(|ctx| ctx.set_outside_policy(OutsideDerivationPolicy::Allow));
        assert!(result.is_err());
    }
}
