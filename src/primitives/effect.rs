// ============================================================================
// reactive-core - Effect
// `Effect` (spec §4.4), the reactive leaf that re-runs on a microtask
// ============================================================================
//
// Structurally an `Effect` is a `Derived` with no cached value, plus
// scheduling state: the tri-state `affect-task` (spec's `undefined`/`null`/
// `true`/`false`), an `initializing` flag, and a lifetime policy that pins
// it against garbage collection (persistent / anchored / weak - see §3's
// ownership paragraph).
//
// Effects are never a dependency (`AnyReaction::as_source` returns `None`),
// so they carry no dependents set `D` and no permanent handle: nothing ever
// needs to record "I depend on this effect".
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::context::{enter_tracking, Tracking};
use crate::core::types::{
    Activity, AnyReaction, NodeFlags, PermanentHandle, PossiblyInvalidMap, Scheduled,
};
use crate::reactivity::scheduling::enqueue;

/// The user function an effect runs. Takes the owning `Effect` handle so the
/// body can call `clear`/`trigger`/`run` on itself or read `initializing`
/// (spec §4.4's scheduler-closure step).
pub type EffectFn = Box<dyn Fn(&Effect)>;

/// Spec §4.4's `affect-task` tri-state, spelled out as a Rust enum instead
/// of JS's `undefined | null | true | false`:
/// `undefined` -> `Cleared`, `null` -> `Idle`, `true` -> `ScheduledTransitive`,
/// `false` -> `ScheduledDefinite`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AffectTask {
    Cleared,
    Idle,
    ScheduledTransitive,
    ScheduledDefinite,
}

/// §3's ownership paragraph: how an `Effect` is kept alive.
pub enum EffectLifetime {
    /// Held by a process-wide pin set until `clear()`.
    Persistent,
    /// Held by a pin set keyed on `anchor`'s lifetime; dropped once the
    /// anchor is collected (checked lazily, on the next pin-list touch) or
    /// `clear()` runs.
    Anchored(Rc<dyn Any>),
    /// Not pinned at all; the caller's own `Effect` handle is the only
    /// thing keeping it alive.
    Weak,
}

thread_local! {
    static PERSISTENT_PINS: RefCell<Vec<Rc<EffectInner>>> = RefCell::new(Vec::new());
    static ANCHORED_PINS: RefCell<Vec<(Weak<dyn Any>, Rc<EffectInner>)>> = RefCell::new(Vec::new());
}

fn pin_persistent(inner: Rc<EffectInner>) {
    PERSISTENT_PINS.with(|pins| pins.borrow_mut().push(inner));
}

fn pin_anchored(anchor: Rc<dyn Any>, inner: Rc<EffectInner>) {
    ANCHORED_PINS.with(|pins| {
        let mut pins = pins.borrow_mut();
        pins.retain(|(a, _)| a.strong_count() > 0);
        pins.push((Rc::downgrade(&anchor), inner));
    });
}

fn unpin(inner: &Rc<EffectInner>) {
    let ptr = Rc::as_ptr(inner);
    PERSISTENT_PINS.with(|pins| {
        pins.borrow_mut().retain(|p| !Rc::ptr_eq(p, inner));
    });
    ANCHORED_PINS.with(|pins| {
        pins.borrow_mut().retain(|(_, p)| Rc::as_ptr(p) != ptr);
    });
}

/// The internal data for an effect. See the module doc for the field-level
/// mapping to spec §3/§4.4.
pub struct EffectInner {
    flags: NodeFlags,
    fn_: RefCell<Option<EffectFn>>,

    /// `W`: the activity of this effect's currently-running body, installed
    /// while the user function executes so dependencies it reads can record
    /// an edge back to it.
    activity: RefCell<Option<Rc<Activity>>>,

    /// `P`: dependencies to revalidate before a transitively-scheduled run
    /// decides whether to actually re-run the body.
    possibly_invalid: PossiblyInvalidMap,

    affect_task: Cell<AffectTask>,
    initializing: Cell<bool>,

    self_weak: RefCell<Option<Weak<EffectInner>>>,
}

impl EffectInner {
    fn schedule(&self, transitive: bool) {
        let task = if transitive {
            AffectTask::ScheduledTransitive
        } else {
            AffectTask::ScheduledDefinite
        };
        self.affect_task.set(task);
        let weak: Weak<dyn Scheduled> = self.self_weak.borrow().as_ref().unwrap().clone();
        enqueue(weak);
        log::debug!(
            "effect scheduled ({})",
            if transitive { "transitive" } else { "definite" }
        );
    }

    fn run_user_fn(self: &Rc<Self>) {
        let activity = Activity::new(Rc::downgrade(self) as Weak<dyn AnyReaction>);
        self.activity.replace(Some(activity.clone()));
        let guard = enter_tracking(Tracking::Active(activity));
        let handle = Effect::from_inner(self.clone());
        if let Some(f) = self.fn_.borrow().as_ref() {
            f(&handle);
        }
        drop(guard);
        if self.initializing.get() {
            self.initializing.set(false);
        }
    }
}

impl AnyReaction for EffectInner {
    fn flags(&self) -> u32 {
        self.flags.get()
    }

    fn set_flags(&self, flags: u32) {
        self.flags.set(flags)
    }

    fn current_activity(&self) -> Option<Rc<Activity>> {
        self.activity.borrow().clone()
    }

    /// Spec §4.5's Effect branch of `invalidate`: a state machine over
    /// `affect-task`, not the generic null-`W`-then-walk-`D` path (an
    /// effect has no dependents to walk).
    fn invalidate(&self, transitive: bool) {
        match self.affect_task.get() {
            AffectTask::Cleared => {}
            AffectTask::Idle => self.schedule(transitive),
            AffectTask::ScheduledTransitive => {
                if !transitive {
                    self.affect_task.set(AffectTask::ScheduledDefinite);
                }
            }
            AffectTask::ScheduledDefinite => {}
        }
    }

    fn insert_possibly_invalid(&self, dep: PermanentHandle, last_seen: Box<dyn Any>) {
        self.possibly_invalid.insert_if_absent(dep, last_seen);
    }

    fn as_source(&self) -> Option<Rc<dyn crate::core::types::AnySource>> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Scheduled for EffectInner {
    /// The scheduler closure from spec §4.4: consume the scheduling state,
    /// and, if this run arrived transitively, revalidate before deciding
    /// whether to actually re-run the body.
    fn run_scheduled(self: Rc<Self>) {
        let task = self.affect_task.get();
        if !matches!(
            task,
            AffectTask::ScheduledTransitive | AffectTask::ScheduledDefinite
        ) {
            return; // cleared or idle: nothing to do
        }
        self.affect_task.set(AffectTask::Idle);

        if task == AffectTask::ScheduledTransitive {
            let entries = self.possibly_invalid.take();
            let mut truly_changed = false;
            // Same re-subscription this node's own `Derived` dependencies
            // need in their Step C (see primitives::derived): `propagate_from`
            // already drained our activity out of every dependency's `D` to
            // get here, so an unchanged dependency must have it put back or
            // this effect goes permanently deaf to that dependency.
            let self_activity = self.activity.borrow().as_ref().map(Rc::downgrade);
            {
                let _guard = enter_tracking(Tracking::Ignored);
                for (dep_handle, last_seen) in &entries {
                    let Some(dep) = dep_handle.upgrade() else {
                        continue;
                    };
                    match dep.poll_unchanged(last_seen.as_ref()) {
                        Ok(true) => {
                            if let Some(activity) = &self_activity {
                                dep.add_dependent(activity.clone());
                            }
                        }
                        Ok(false) => truly_changed = true,
                        Err(e) => {
                            log::warn!("effect revalidation failed: {e}");
                            truly_changed = true;
                        }
                    }
                }
            }
            if !truly_changed {
                log::trace!("effect run skipped: no dependency actually changed");
                return;
            }
        }

        self.possibly_invalid.clear();
        self.run_user_fn();
    }
}

/// A reactive leaf: re-runs its function whenever a transitive dependency
/// changes, deferred to the next `tick()` (spec §4.4).
pub struct Effect {
    inner: Rc<EffectInner>,
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Effect {
    fn from_inner(inner: Rc<EffectInner>) -> Self {
        Self { inner }
    }

    fn construct(f: impl Fn(&Effect) + 'static, lifetime: EffectLifetime) -> Self {
        // Steps 1-2: allocate, install the scheduler closure bound to the
        // object (the object itself implements `Scheduled`).
        let inner = Rc::new_cyclic(|weak_self| EffectInner {
            flags: NodeFlags::new(0),
            fn_: RefCell::new(Some(Box::new(f))),
            activity: RefCell::new(None),
            possibly_invalid: PossiblyInvalidMap::new(),
            affect_task: Cell::new(AffectTask::Cleared),
            initializing: Cell::new(true),
            self_weak: RefCell::new(Some(weak_self.clone())),
        });

        // Step 3: scheduled, definite.
        inner.affect_task.set(AffectTask::ScheduledDefinite);
        // Step 4: enqueue on the microtask queue.
        enqueue(Rc::downgrade(&inner) as Weak<dyn Scheduled>);

        // Step 5: register with the pinning policy.
        match lifetime {
            EffectLifetime::Persistent => pin_persistent(inner.clone()),
            EffectLifetime::Anchored(anchor) => pin_anchored(anchor, inner.clone()),
            EffectLifetime::Weak => {}
        }

        log::debug!("effect constructed, initial run scheduled");
        Self { inner }
    }

    /// True iff `affect-task !== undefined` (spec §4.4's `active` property).
    pub fn active(&self) -> bool {
        self.inner.affect_task.get() != AffectTask::Cleared
    }

    /// True until this effect's first run has completed.
    pub fn initializing(&self) -> bool {
        self.inner.initializing.get()
    }

    /// Runs the scheduler's tear-down once and marks this effect cleared.
    ///
    /// Idempotent (spec §8). The open question in spec §9 about whether
    /// `clear` should re-invoke the user function even on an effect that
    /// never ran is resolved here as "no": `clear` only ever transitions
    /// scheduling state and drops pins, it never executes user code. A
    /// dispose callback that must run teardown logic should do so inside
    /// the effect body itself (checking `initializing`/reading `self`)
    /// rather than relying on `clear` to invoke it - see DESIGN.md.
    pub fn clear(&self) {
        if self.inner.affect_task.get() == AffectTask::Cleared {
            return;
        }
        self.inner.affect_task.set(AffectTask::Cleared);
        self.inner.possibly_invalid.clear();
        self.inner.activity.replace(None);
        unpin(&self.inner);
        log::debug!("effect cleared");
    }

    /// Forces the next run to be treated as definitely-invalid; schedules
    /// one if idle. A no-op on a cleared effect (spec §8).
    pub fn trigger(&self) {
        match self.inner.affect_task.get() {
            AffectTask::Cleared => {}
            AffectTask::Idle => self.inner.schedule(false),
            AffectTask::ScheduledTransitive => {
                self.inner.affect_task.set(AffectTask::ScheduledDefinite);
            }
            AffectTask::ScheduledDefinite => {}
        }
    }

    /// If active, synchronously runs the body now (bypassing the
    /// possibly-invalid walk a transitive scheduled run would otherwise do -
    /// an explicit `run()` always executes).
    pub fn run(&self) {
        if !self.active() {
            return;
        }
        self.inner.affect_task.set(AffectTask::Idle);
        self.inner.possibly_invalid.clear();
        self.inner.run_user_fn();
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("active", &self.active())
            .field("initializing", &self.initializing())
            .finish()
    }
}

/// Construct a weakly-held effect: scheduled for its first run immediately,
/// kept alive only by the returned handle (spec §4.4, §3 "weak mode,
/// lifetime = caller").
pub fn effect<F: Fn(&Effect) + 'static>(f: F) -> Effect {
    Effect::construct(f, EffectLifetime::Weak)
}

/// Construct a persistently-held effect: kept alive by a process-wide pin
/// set until `clear()` (spec §6 `Effect.Persistent(fn)`).
pub fn effect_persistent<F: Fn(&Effect) + 'static>(f: F) -> Effect {
    Effect::construct(f, EffectLifetime::Persistent)
}

/// Construct an effect anchored to `anchor`'s lifetime (spec §6
/// `Effect(anchor, fn)`): held alive as long as `anchor` is, or until
/// `clear()`.
pub fn effect_anchored<A: Any, F: Fn(&Effect) + 'static>(anchor: &Rc<A>, f: F) -> Effect {
    Effect::construct(f, EffectLifetime::Anchored(anchor.clone()))
}
