// ============================================================================
// reactive-core - Node Model
// Type-erased traits, weak-handle protocol, and the graph's own storage
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use super::constants::*;

// =============================================================================
// ACTIVITY: THE "CURRENT EVALUATION" WEAK HANDLE
// =============================================================================
//
// Every time a derivation or effect runs its body, it mints a fresh
// `Activity` and hands out `Weak<Activity>` to every source it reads during
// that run. A source's dependents list is therefore not "the reactions that
// depend on me" but "the evaluations that depended on me" - if the owning
// reaction re-evaluates, it mints a new Activity and the old one is simply
// never upgraded again, which is what lets invalidation tell a live
// registration from one left behind by an abandoned or superseded run.
// =============================================================================

/// One evaluation of a derivation or effect body.
///
/// Dependencies read during this evaluation hold a `Weak<Activity>`; the
/// reaction that owns the evaluation holds the `Rc<Activity>` (indirectly,
/// through its own "current activity" slot). When the reaction evaluates
/// again it drops that `Rc`, and every `Weak<Activity>` handed out during
/// the old run becomes permanently dead.
pub struct Activity {
    owner: Weak<dyn AnyReaction>,
}

impl Activity {
    pub fn new(owner: Weak<dyn AnyReaction>) -> Rc<Self> {
        Rc::new(Self { owner })
    }

    pub fn owner(&self) -> Option<Rc<dyn AnyReaction>> {
        self.owner.upgrade()
    }
}

// =============================================================================
// PERMANENT HANDLE: THE STABLE NODE IDENTITY
// =============================================================================

/// A stable, weak identity for a source node, used as the key in a
/// dependent's possibly-invalid map. Unlike `Activity`, this handle's
/// validity tracks the node's own lifetime, not any one evaluation of it.
#[derive(Clone)]
pub struct PermanentHandle(Weak<dyn AnySource>);

impl PermanentHandle {
    pub fn new(inner: Weak<dyn AnySource>) -> Self {
        Self(inner)
    }

    pub fn upgrade(&self) -> Option<Rc<dyn AnySource>> {
        self.0.upgrade()
    }

    pub fn same_node(&self, other: &PermanentHandle) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

// =============================================================================
// ANY SOURCE: THINGS THAT CAN BE DEPENDED ON
// =============================================================================
//
// Implemented by `State<T>` and `Derived<T>`. A source tracks its own
// dependents as weak activities (see above), exposes a stable permanent
// handle for dependents' possibly-invalid maps, and can snapshot/compare its
// current value without the caller needing to know its concrete type `T`.
// =============================================================================

pub trait AnySource: Any {
    fn flags(&self) -> u32;
    fn set_flags(&self, flags: u32);

    /// Recursion guard: is this node currently being walked by the
    /// invalidation propagator or its own revalidation?
    fn on_stack(&self) -> bool {
        self.flags() & ON_STACK != 0
    }
    fn set_on_stack(&self, value: bool) {
        let f = self.flags();
        self.set_flags(if value { f | ON_STACK } else { f & !ON_STACK });
    }

    /// A stable weak identity for this node.
    fn permanent_handle(&self) -> PermanentHandle;

    /// Record that `activity` read this node during its evaluation.
    fn add_dependent(&self, activity: Weak<Activity>);

    /// Remove and return every dependent activity registered on this node.
    fn drain_dependents(&self) -> Vec<Weak<Activity>>;

    fn dependents_is_empty(&self) -> bool;

    /// Snapshot the current value as a type-erased box, for storage in a
    /// dependent's possibly-invalid map.
    fn snapshot_any(&self) -> Box<dyn Any>;

    /// Re-derive (or re-read) this node's current value without creating a
    /// dependency edge, and compare it against a previously recorded
    /// snapshot. Returns `true` if unchanged.
    ///
    /// For a `Derived` this recurses through its own §4.3 read algorithm
    /// (transparently revalidating it too), so the `Result` carries whatever
    /// that recursive read could fail with (`CircularDependency`,
    /// `DerivationRepeatLimit`, `DerivatorException`).
    fn poll_unchanged(&self, recorded: &dyn Any) -> super::error::Result<bool>;

    fn as_any(&self) -> &dyn Any;
}

// =============================================================================
// ANY REACTION: THINGS THAT DEPEND ON SOURCES
// =============================================================================
//
// Implemented by `Derived<T>` and `Effect`. A reaction has a "current
// activity" it hands to its dependencies while evaluating, a possibly-invalid
// map (`P`) of dependencies it must revalidate before deciding whether to
// actually recompute, and an `invalidate` entry point the propagator calls.
// =============================================================================

pub trait AnyReaction: Any {
    fn flags(&self) -> u32;
    fn set_flags(&self, flags: u32);

    fn on_stack(&self) -> bool {
        self.flags() & ON_STACK != 0
    }
    fn set_on_stack(&self, value: bool) {
        let f = self.flags();
        self.set_flags(if value { f | ON_STACK } else { f & !ON_STACK });
    }

    /// The activity of this reaction's current (still live) evaluation, if any.
    fn current_activity(&self) -> Option<Rc<Activity>>;

    /// Mark this reaction invalid. `transitive` is true when the
    /// invalidation arrived indirectly (through a dependency's dependency)
    /// rather than from a direct write, matching spec's
    /// definitely-invalid/possibly-invalid distinction.
    fn invalidate(&self, transitive: bool);

    /// Record a dependency's last-seen value in this reaction's possibly
    /// invalid map, to be checked before the reaction next re-runs.
    fn insert_possibly_invalid(&self, dep: PermanentHandle, last_seen: Box<dyn Any>);

    /// Deriveds are also sources; effects are not.
    fn as_source(&self) -> Option<Rc<dyn AnySource>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

// =============================================================================
// SCHEDULED: EFFECTS THAT CAN SIT IN THE MICROTASK QUEUE
// =============================================================================
//
// Keeping this as its own trait (rather than reaching into `AnyReaction`
// through `dyn Any::downcast`) sidesteps the problem of recovering a
// concrete `Rc<EffectInner>` from an `Rc<dyn AnyReaction>`: a trait method
// taking `self: Rc<Self>` dispatches through the vtable directly, no
// downcast required.
// =============================================================================

pub trait Scheduled: Any {
    /// Run the scheduler closure described in the effect construction steps:
    /// consume the scheduling state, revalidate if the task was transitive,
    /// and re-run the user function if still warranted.
    fn run_scheduled(self: Rc<Self>);
}

// =============================================================================
// EQUALITY
// =============================================================================

/// A value-comparison function used to decide whether a node's new value
/// counts as a change (and should propagate) or not.
pub type EqualsFn<T> = fn(&T, &T) -> bool;

pub fn default_equals<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

// =============================================================================
// POSSIBLY-INVALID MAP
// =============================================================================

/// `P` from the data model: the dependencies a reaction must revalidate
/// before deciding whether a possibly-invalid mark really means "recompute".
///
/// Implemented as a small linear-scan vector rather than a hash map: entries
/// are keyed on a trait object's pointer identity (`PermanentHandle`), which
/// has no natural `Hash` impl, and the list is bounded by a single
/// evaluation's dependency count, which is small in practice.
#[derive(Default)]
pub struct PossiblyInvalidMap {
    entries: RefCell<Vec<(PermanentHandle, Box<dyn Any>)>>,
}

impl PossiblyInvalidMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `last_seen` for `handle` unless an entry already exists.
    ///
    /// Spec §4.5: "insert ... into dep.P *if absent*" — the first value
    /// recorded for a dependency must survive until the dependent is
    /// actually revalidated, even if that dependency invalidates again
    /// (and produces yet another value) before the revalidation happens.
    /// Overwriting here would let an intermediate change hide behind a
    /// later one that happens to match the original.
    pub fn insert_if_absent(&self, handle: PermanentHandle, last_seen: Box<dyn Any>) {
        let mut entries = self.entries.borrow_mut();
        if !entries.iter().any(|(h, _)| h.same_node(&handle)) {
            entries.push((handle, last_seen));
        }
    }

    pub fn take(&self) -> Vec<(PermanentHandle, Box<dyn Any>)> {
        self.entries.replace(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

// =============================================================================
// DEPENDENTS LIST
// =============================================================================

/// Storage shared by every `AnySource` impl for its weak-activity dependents.
#[derive(Default)]
pub struct DependentsList {
    activities: RefCell<Vec<Weak<Activity>>>,
}

impl DependentsList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, activity: Weak<Activity>) {
        self.activities.borrow_mut().push(activity);
    }

    pub fn drain(&self) -> Vec<Weak<Activity>> {
        self.activities.replace(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        // Cheap liveness check: prune dead entries lazily on read.
        let mut activities = self.activities.borrow_mut();
        activities.retain(|a| a.strong_count() > 0);
        activities.is_empty()
    }
}

// =============================================================================
// NODE STATE: SHARED FLAG STORAGE
// =============================================================================

/// Shared flag-cell storage, reused by `State<T>`, `DerivedInner<T>` and
/// `EffectInner`.
pub struct NodeFlags(Cell<u32>);

impl NodeFlags {
    pub fn new(initial: u32) -> Self {
        Self(Cell::new(initial))
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }

    pub fn set(&self, value: u32) {
        self.0.set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    struct DummyReaction;
    impl AnyReaction for DummyReaction {
        fn flags(&self) -> u32 {
            0
        }
        fn set_flags(&self, _flags: u32) {}
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
    fn activity_owner_dies_with_reaction() {
        let reaction: Rc<dyn AnyReaction> = Rc::new(DummyReaction);
        let activity = Activity::new(Rc::downgrade(&reaction));
        assert!(activity.owner().is_some());
        drop(reaction);
        assert!(activity.owner().is_none());
    }

    #[test]
    fn dependents_list_prunes_dead_activities() {
        let reaction: Rc<dyn AnyReaction> = Rc::new(DummyReaction);
        let activity = Activity::new(Rc::downgrade(&reaction));
        let list = DependentsList::new();
        list.add(Rc::downgrade(&activity));
        assert!(!list.is_empty());
        drop(activity);
        assert!(list.is_empty());
    }

    #[test]
    fn possibly_invalid_map_dedupes_by_node_identity() {
        struct DummySource;
        impl AnySource for DummySource {
            fn flags(&self) -> u32 {
                0
            }
            fn set_flags(&self, _flags: u32) {}
            fn permanent_handle(&self) -> PermanentHandle {
                unreachable!()
            }
            fn add_dependent(&self, _activity: Weak<Activity>) {}
            fn drain_dependents(&self) -> Vec<Weak<Activity>> {
                Vec::new()
            }
            fn dependents_is_empty(&self) -> bool {
                true
            }
            fn snapshot_any(&self) -> Box<dyn Any> {
                Box::new(())
            }
            fn poll_unchanged(&self, _recorded: &dyn Any) -> super::super::error::Result<bool> {
                Ok(true)
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let source: Rc<dyn AnySource> = Rc::new(DummySource);
        let weak: Weak<dyn AnySource> = Rc::downgrade(&source);
        let handle = PermanentHandle::new(weak);

        let map = PossiblyInvalidMap::new();
        map.insert_if_absent(handle.clone(), Box::new(1i32));
        map.insert_if_absent(handle.clone(), Box::new(2i32));

        let entries = map.take();
        assert_eq!(entries.len(), 1);
        let value = entries[0].1.downcast_ref::<i32>().unwrap();
        assert_eq!(*value, 1, "first-recorded value must survive, not be overwritten");
    }
}
