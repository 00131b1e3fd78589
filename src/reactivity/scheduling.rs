// ============================================================================
// reactive-core - Scheduling
// The microtask queue substitute (spec §5, §9)
// ============================================================================
//
// Rust has no built-in microtask primitive. Per SPEC_FULL §10 this module
// owns a `VecDeque<Weak<dyn Scheduled>>` pending-effect queue that is never
// auto-drained by `State::set` or the invalidation propagator — only
// `tick()` (or a host-registered scheduler callback) drains it. This is the
// "substitute a run-loop that drains a queue between user calls" stand-in
// spec §9 anticipates for a host with no microtask queue.
// ============================================================================

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::core::types::Scheduled;

thread_local! {
    static QUEUE: RefCell<VecDeque<Weak<dyn Scheduled>>> = RefCell::new(VecDeque::new());
    static HOST_SCHEDULER: RefCell<Option<Rc<dyn Fn()>>> = RefCell::new(None);
}

/// Bound on how many effects a single `tick()` will drain before giving up,
/// guarding against an effect that perpetually re-schedules itself.
const MAX_DRAIN_ITERATIONS: u32 = 10_000;

/// Push an effect onto the pending queue. Does not itself run anything;
/// only `tick()` (or the registered host scheduler, via `request_drain`)
/// does that.
pub fn enqueue(effect: Weak<dyn Scheduled>) {
    QUEUE.with(|q| q.borrow_mut().push_back(effect));
    log::trace!("scheduling: effect enqueued");
}

/// Register a callback an embedding application can use to request that a
/// drain happen soon (an async executor waking a task, a GUI event loop
/// scheduling an idle callback). By default no scheduler is registered and
/// `tick()` is the only way effects run.
pub fn set_microtask_scheduler(f: impl Fn() + 'static) {
    HOST_SCHEDULER.with(|s| *s.borrow_mut() = Some(Rc::new(f)));
}

/// Remove any previously registered host scheduler.
pub fn clear_microtask_scheduler() {
    HOST_SCHEDULER.with(|s| *s.borrow_mut() = None);
}

/// Ask the registered host scheduler (if any) to arrange a drain. A no-op
/// when no scheduler has been registered.
pub fn request_drain() {
    HOST_SCHEDULER.with(|s| {
        if let Some(cb) = s.borrow().as_ref() {
            cb();
        }
    });
}

/// Drain the pending-effect queue, running each effect's scheduler closure
/// in FIFO order. New effects scheduled by a run (because it wrote to a
/// state another effect reads) are picked up in the same drain, matching
/// "effects run in microtask-queue order after the current task."
pub fn tick() {
    let mut iterations: u32 = 0;
    loop {
        let next = QUEUE.with(|q| q.borrow_mut().pop_front());
        let Some(weak) = next else { break };

        iterations += 1;
        if iterations > MAX_DRAIN_ITERATIONS {
            log::warn!(
                "tick(): exceeded {MAX_DRAIN_ITERATIONS} scheduled runs in one drain; \
                 an effect is likely re-scheduling itself unconditionally"
            );
            break;
        }

        if let Some(scheduled) = weak.upgrade() {
            scheduled.run_scheduled();
        }
    }
}

/// Alias for `tick()`: drain every pending effect synchronously. Provided
/// under the name used by the wider pack's comparable crates for an
/// explicit, immediate flush.
pub fn flush_sync() {
    tick();
}

/// True if the pending queue currently holds at least one effect.
#[cfg(test)]
pub fn pending_count() -> usize {
    QUEUE.with(|q| q.borrow().len())
}
