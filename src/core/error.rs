// ============================================================================
// reactive-core - Error Types
// ============================================================================

use std::fmt;

/// Errors the reactive core can surface at its API boundary.
///
/// Most of the graph's own bookkeeping (invalidation, revalidation, retries)
/// never produces an `Err` — it is resolved internally by nulling an
/// activity handle and retrying. These variants cover the cases where the
/// graph genuinely cannot proceed and must report back to the caller.
#[derive(thiserror::Error)]
pub enum SignalError {
    /// A value read back from storage didn't downcast to the expected type.
    ///
    /// This should not be reachable through the public API (every handle is
    /// generic over its value type), but type-erased storage means the
    /// invariant is enforced at runtime, not by the type system, so callers
    /// that reach into the `dyn Any` layer directly can still trip it.
    #[error("value did not match the expected type")]
    TypeMismatch,

    /// A dependency cycle was detected while reading a node.
    ///
    /// Raised when a node's own evaluation, directly or transitively, reads
    /// itself before that evaluation has produced a value.
    #[error("circular dependency detected")]
    CircularDependency,

    /// A derivation kept invalidating itself on every retry and exceeded the
    /// bounded retry limit without converging to a stable value.
    #[error("derivation did not converge after {0} attempts")]
    DerivationRepeatLimit(u32),

    /// A reactive primitive (`State::set`, dependency registration) was used
    /// outside of any derivation or effect, and the configured penalty for
    /// that is `throw` rather than `allow`.
    #[error("reactive primitive used outside of a derivation")]
    UseOutsideDerivation,

    /// A derivator or effect body panicked while running.
    #[error("derivator panicked: {0}")]
    DerivatorException(String),
}

impl fmt::Debug for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Convenience alias for the core's fallible operations (§7).
pub type Result<T> = std::result::Result<T, SignalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_descriptive() {
        assert_eq!(
            SignalError::TypeMismatch.to_string(),
            "value did not match the expected type"
        );
        assert_eq!(
            SignalError::DerivationRepeatLimit(50).to_string(),
            "derivation did not converge after 50 attempts"
        );
    }
}
