// ============================================================================
// reactive-core - Flatten
// `Derived<Derived<T>>::flatten()`, Rust's stand-in for nested derivation
// unwrap (SPEC_FULL §10 "Supplementary features")
// ============================================================================
//
// The original's dynamically-typed reactive value lets a derivator return
// either a plain `T` or another derivation, transparently unwrapped on read.
// Rust's `Derived<T>` has no such union: a derivator's return type is fixed
// at construction. `flatten` is the idiomatic replacement - a derived-of-a-
// derived collapses into a single derived that tracks both levels, reading
// the outer derivation (picking up structural changes to *which* inner
// derivation is current) and then the inner one (picking up changes to its
// value) in the same evaluation.
// ============================================================================

use super::derived::derived;
use super::derived::Derived;

impl<T: 'static + Clone + PartialEq> Derived<Derived<T>> {
    /// Collapse a derivation of a derivation into one derivation of `T`.
    ///
    /// Each read of the result depends on both levels: a change to the outer
    /// derivation's current inner `Derived<T>`, or a change to that inner
    /// derivation's own value, invalidates it.
    pub fn flatten(&self) -> Derived<T> {
        let outer = self.clone();
        derived(move || outer.get().get())
    }
}
