// ============================================================================
// Equality relation (spec §4.7)
// ============================================================================
//
// Two values compare equal when either they are the same under identity, or
// both are structurally equal: same shape, every corresponding field equal
// under the same relation, chased recursively. `EqualsFn<T>` (defined in
// `core::types`, defaulting to `PartialEq`) is layer one and covers nearly
// every `State`/`Derived` construction. `StructuralEq` below is layer two,
// for composite types that want identity-first, bounded-recursion,
// cycle-guarded comparison instead of relying on a derived `PartialEq`.

use std::collections::HashSet;

/// A type that wants §4.7's "identity first, structural fallback, bounded
/// and cycle-guarded" comparison instead of plain `PartialEq`.
///
/// Implement `identity_eq` for O(1) pointer/tag comparison (e.g.
/// `Rc::ptr_eq`) and `fields_eq` for the one-level structural comparison of
/// this type's own data (not its children — recursion into children is
/// handled by the default `structural_eq`, which calls `StructuralEq`
/// recursively on anything `fields_eq` itself delegates to).
pub trait StructuralEq {
    /// O(1) identity check; if this returns `true`, the two values are
    /// equal without needing to look at their fields at all.
    fn identity_eq(&self, other: &Self) -> bool;

    /// Compare `self` and `other` bounded to `STRUCTURAL_EQ_DEPTH_BOUND`
    /// levels of recursion; beyond that, a guard set keyed on the pair's
    /// addresses prevents cycles in self-referential structures from
    /// diverging (they compare unequal instead).
    fn structural_eq(&self, other: &Self, depth: u32) -> bool
    where
        Self: Sized,
    {
        if self.identity_eq(other) {
            return true;
        }
        if depth >= crate::core::constants::STRUCTURAL_EQ_DEPTH_BOUND {
            let mut guard = HashSet::new();
            return self.structural_eq_guarded(other, &mut guard);
        }
        self.fields_eq(other, depth + 1)
    }

    /// One level of field-by-field comparison; implementors recurse into
    /// child fields via `StructuralEq::structural_eq(&child_a, &child_b,
    /// depth)`, not via `fields_eq` directly.
    fn fields_eq(&self, other: &Self, depth: u32) -> bool;

    /// Same as `structural_eq` past the recursion bound: tracks
    /// already-visited address pairs so a self-referential structure
    /// terminates (comparing unequal) rather than recursing forever.
    fn structural_eq_guarded(
        &self,
        other: &Self,
        guard: &mut HashSet<(usize, usize)>,
    ) -> bool
    where
        Self: Sized,
    {
        if self.identity_eq(other) {
            return true;
        }
        let key = (self as *const Self as usize, other as *const Self as usize);
        if !guard.insert(key) {
            return false; // already in progress: self-referential, give up as unequal
        }
        self.fields_eq(other, crate::core::constants::STRUCTURAL_EQ_DEPTH_BOUND)
    }
}
