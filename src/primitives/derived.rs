// ============================================================================
// reactive-core - Derived
// `Derived<T>` (spec §4.3), the memoized computation at the heart of the graph
// ============================================================================
//
// A Derived is both an `AnySource` (something that can be read and have
// dependents) and an `AnyReaction` (something that reads other sources and
// can be invalidated). Its read path is spec §4.3 Steps A-D, implemented
// here almost literally:
//
//   A. derivator nulled (const-folded)  -> return cache directly
//   B. register the caller             -> `use_derived(&self.dependents)`
//   C. `W` non-null                    -> cache present?  P empty? walk P
//   D. evaluation loop (bounded retries, fresh `W` per attempt)
//
// Unlike the teacher's write-version counters, validity here is decided by
// actually re-reading each possibly-invalid dependency and comparing its
// fresh value against the one recorded when this node went possibly-invalid
// (see DESIGN.md divergence #2).
// ============================================================================

use std::any::Any;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::core::context::{enter_tracking, Tracking};
use crate::core::error::{Result, SignalError};
use crate::core::types::{
    default_equals, Activity, AnyReaction, AnySource, DependentsList, EqualsFn, NodeFlags,
    PermanentHandle, PossiblyInvalidMap,
};
use crate::reactivity::propagate::propagate_from;
use crate::reactivity::tracking::use_derived;

use crate::core::constants::MAX_REPEATS;

/// Lazily computed, memoized reactive value.
///
/// See spec §4.3 for the read algorithm this implements step by step.
pub struct DerivedInner<T> {
    flags: NodeFlags,

    /// The derivator. `None` once const-folded (it read nothing on its last
    /// evaluation and can never change), matching §4.3 Step A.
    fn_: RefCell<Option<Box<dyn Fn() -> T>>>,

    /// Cached value. `None` only transiently during evaluation (the
    /// "currently deriving" marker invariant 1 describes) or before the
    /// first-ever evaluation.
    value: RefCell<Option<T>>,

    equals: EqualsFn<T>,

    /// `W`: the activity handle of this node's current (still valid, or
    /// possibly-invalid) evaluation. `None` means definitively invalidated.
    activity: RefCell<Option<Rc<Activity>>>,

    /// `D`: evaluations that read this node.
    dependents: DependentsList,

    /// `P`: dependencies to revalidate before trusting the cache.
    possibly_invalid: PossiblyInvalidMap,

    permanent: PermanentHandle,
    self_weak: RefCell<Option<Weak<DerivedInner<T>>>>,
}

impl<T: 'static + Clone> DerivedInner<T> {
    fn new_with_equals<F>(fn_: F, equals: EqualsFn<T>) -> Rc<Self>
    where
        F: Fn() -> T + 'static,
    {
        Rc::new_cyclic(|weak_self| {
            let permanent = PermanentHandle::new(weak_self.clone() as Weak<dyn AnySource>);
            Self {
                flags: NodeFlags::new(0),
                fn_: RefCell::new(Some(Box::new(fn_))),
                value: RefCell::new(None),
                equals,
                activity: RefCell::new(None),
                dependents: DependentsList::new(),
                possibly_invalid: PossiblyInvalidMap::new(),
                permanent,
                self_weak: RefCell::new(Some(weak_self.clone())),
            }
        })
    }

    fn self_rc(&self) -> Rc<Self> {
        self.self_weak
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("derived self-reference dropped while still executing")
    }

    fn as_reaction_weak(&self) -> Weak<dyn AnyReaction> {
        Rc::downgrade(&self.self_rc()) as Weak<dyn AnyReaction>
    }

    /// §4.3 in full: the read algorithm shared by `Derived::get`,
    /// `Derived::try_get`, and `AnySource::poll_unchanged` (a dependent
    /// revalidating against this node recurses back in here, under its own
    /// ignore-scope, which is why Step B's `use_derived` call is safe to
    /// leave unconditional - it simply no-ops when tracking is `Ignored`).
    fn read(&self) -> Result<T> {
        // Step A: const-folded, short-circuit.
        if self.fn_.borrow().is_none() {
            return Ok(self
                .value
                .borrow()
                .as_ref()
                .expect("const-folded derived has no cached value")
                .clone());
        }

        // Step B: register the caller as a dependent of this node.
        use_derived(&self.dependents)?;

        // Step C: validity check, only meaningful once this node has run at
        // least once (`W` non-null).
        if self.activity.borrow().is_some() {
            if self.value.borrow().is_none() {
                return Err(SignalError::CircularDependency);
            }

            if self.possibly_invalid.is_empty() {
                return Ok(self.value.borrow().as_ref().unwrap().clone());
            }

            let entries = self.possibly_invalid.take();
            let mut truly_invalid = false;
            // `propagate_from` drained every dependency's `D` on the way to
            // marking us possibly-invalid (reactivity::propagate::propagate_from),
            // so a dependency that turns out unchanged must have our activity
            // re-added to its `D` here - otherwise invariant 2 breaks the
            // moment that dependency changes again: with no edge left, no
            // future `propagate_from` walk ever reaches us again, and we'd
            // keep returning this stale cache forever instead of merely
            // until the next real change.
            let self_activity = self.activity.borrow().as_ref().map(Rc::downgrade);
            {
                // Revalidating a dependency must not register a new edge on
                // the dependency's own dependencies (no nested tracking) -
                // it's only our edge on `dep` itself that gets restored.
                let _guard = enter_tracking(Tracking::Ignored);
                for (dep_handle, last_seen) in &entries {
                    let Some(dep) = dep_handle.upgrade() else {
                        continue; // dependency collected: drop the entry
                    };
                    if !dep.poll_unchanged(last_seen.as_ref())? {
                        truly_invalid = true;
                        break;
                    }
                    if let Some(activity) = &self_activity {
                        dep.add_dependent(activity.clone());
                    }
                }
            }

            if !truly_invalid {
                // Every dependency reproduced its recorded value: P stays
                // cleared (already drained above) and the cache still holds.
                return Ok(self.value.borrow().as_ref().unwrap().clone());
            }
            // Fall through to Step D: this node is genuinely invalid.
        }

        self.evaluate()
    }

    /// Step D: the bounded retry loop.
    fn evaluate(&self) -> Result<T> {
        self.possibly_invalid.clear();
        let value_before = self.value.borrow().clone();

        for _attempt in 0..MAX_REPEATS {
            let activity = Activity::new(self.as_reaction_weak());
            self.activity.replace(Some(activity.clone()));

            // Mark "currently deriving" for the circular-dependency check.
            let prior_value = self.value.replace(None);

            let guard = enter_tracking(Tracking::Active(activity.clone()));
            // A reentrant read of this same node (Step C/A) only ever takes
            // further immutable borrows of `fn_`, which `RefCell` allows
            // concurrently with this one; only a *mutable* borrow (taken
            // only after this call returns) would conflict.
            let fn_borrow = self.fn_.borrow();
            let outcome = catch_unwind(AssertUnwindSafe(|| (fn_borrow.as_ref().unwrap())()));
            drop(fn_borrow);

            let used = guard.used();
            drop(guard);

            let new_value = match outcome {
                Ok(v) => v,
                Err(payload) => {
                    // Restore prior cache and activity; surface as an error
                    // rather than unwinding through the reactive graph.
                    self.value.replace(prior_value);
                    self.activity.replace(None);
                    let message = panic_message(&payload);
                    log::warn!("derived evaluation panicked: {message}");
                    return Err(SignalError::DerivatorException(message));
                }
            };

            let still_fresh = self
                .activity
                .borrow()
                .as_ref()
                .is_some_and(|w| Rc::ptr_eq(w, &activity));

            if !still_fresh {
                // `W` was nulled mid-evaluation: the derivator wrote to a
                // state it had already read. Legal; retry with a fresh `W`.
                self.value.replace(prior_value);
                log::trace!("derived self-invalidated mid-evaluation, retrying");
                continue;
            }

            self.value.replace(Some(new_value.clone()));
            if !used {
                // Read nothing: fold to a constant, short-circuiting future
                // reads at Step A.
                self.fn_.replace(None);
            }

            let changed = match &value_before {
                Some(prev) => !(self.equals)(prev, &new_value),
                None => true,
            };
            if changed {
                let source: Rc<dyn AnySource> = self.self_rc();
                propagate_from(&source);
            }

            return Ok(new_value);
        }

        Err(SignalError::DerivationRepeatLimit(MAX_REPEATS))
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "derivator panicked with a non-string payload".to_string()
    }
}

impl<T: 'static + Clone> AnySource for DerivedInner<T> {
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
        Box::new(
            self.value
                .borrow()
                .clone()
                .expect("snapshot requested before first evaluation"),
        )
    }

    fn poll_unchanged(&self, recorded: &dyn Any) -> Result<bool> {
        let recorded = recorded
            .downcast_ref::<T>()
            .expect("possibly-invalid map entry type mismatch");
        let fresh = self.read()?;
        Ok((self.equals)(&fresh, recorded))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: 'static + Clone> AnyReaction for DerivedInner<T> {
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
        if !transitive {
            self.activity.replace(None);
        }
        let source: Rc<dyn AnySource> = self.self_rc();
        propagate_from(&source);
    }

    fn insert_possibly_invalid(&self, dep: PermanentHandle, last_seen: Box<dyn Any>) {
        self.possibly_invalid.insert_if_absent(dep, last_seen);
    }

    fn as_source(&self) -> Option<Rc<dyn AnySource>> {
        Some(self.self_rc())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A lazily computed, memoized reactive value (spec §4.3).
pub struct Derived<T> {
    inner: Rc<DerivedInner<T>>,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for Derived<T> {
    /// Two handles are equal iff they name the same underlying node (§4.7's
    /// identity relation - `Derived<T>` never implements the `T: PartialEq`
    /// structural half of §4.7 itself, since two different nodes that
    /// happen to cache equal values are still distinct reactive identities).
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: 'static + Clone> Derived<T> {
    pub(crate) fn from_inner(inner: Rc<DerivedInner<T>>) -> Self {
        Self { inner }
    }

    /// §4.3's read algorithm. Panics with the underlying `SignalError` on
    /// `CircularDependency`, `DerivationRepeatLimit`, or a derivator panic;
    /// see `try_get` for the fallible form.
    pub fn get(&self) -> T {
        self.try_get().unwrap_or_else(|e| panic!("Derived::get: {e}"))
    }

    pub fn try_get(&self) -> Result<T> {
        self.inner.read()
    }

    /// §6 `node.now()`: read the current value, re-evaluating if necessary,
    /// without registering a dependency on the caller.
    pub fn now(&self) -> T {
        let _guard = enter_tracking(Tracking::Ignored);
        self.get()
    }

    pub fn as_any_source(&self) -> Rc<dyn AnySource> {
        self.inner.clone()
    }

    pub fn as_any_reaction(&self) -> Rc<dyn AnyReaction> {
        self.inner.clone()
    }
}

impl<T: 'static + Clone + PartialEq> Derived<T> {
    /// A `Derived` whose derivator simply returns a fixed value. It
    /// const-folds on its first read exactly as any derivator that reads
    /// nothing would (§6 "Derived.from(v) ... otherwise returns a constant
    /// Derived") - no special-casing needed beyond Step D's existing
    /// const-folding rule.
    pub fn constant(value: T) -> Self {
        derived(move || value.clone())
    }
}

impl<T: std::fmt::Debug + 'static + Clone> std::fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derived").field("value", &self.now()).finish()
    }
}

/// Run `f` with reads ignored, unwrapping `T` directly (spec §6
/// `Derived.now(fn)` - the free-function form, as opposed to
/// `derived.now()` which re-reads a specific node).
pub fn now<R>(f: impl FnOnce() -> R) -> R {
    let _guard = enter_tracking(Tracking::Ignored);
    f()
}

/// Create a `Derived<T>` using `T`'s `PartialEq` for change detection.
pub fn derived<T, F>(fn_: F) -> Derived<T>
where
    T: 'static + Clone + PartialEq,
    F: Fn() -> T + 'static,
{
    Derived::from_inner(DerivedInner::new_with_equals(fn_, default_equals))
}

/// Create a `Derived<T>` with a custom equality function.
pub fn derived_with_equals<T, F>(fn_: F, equals: EqualsFn<T>) -> Derived<T>
where
    T: 'static + Clone,
    F: Fn() -> T + 'static,
{
    Derived::from_inner(DerivedInner::new_with_equals(fn_, equals))
}
