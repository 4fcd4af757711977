//! Contract checks.
//!
//! Two tiers: `check` compiles out of release builds, `ensure` always fires.
//! A failed `ensure` means the scheduler state machine is corrupt; the process
//! aborts instead of continuing with broken state.

/// Debug-only invariant check.
#[inline(always)]
pub(crate) fn check(condition: bool, msg: &str) {
    #[cfg(debug_assertions)]
    if !condition {
        contract_violation(msg);
    }
    #[cfg(not(debug_assertions))]
    let _ = (condition, msg);
}

/// Invariant check that survives release builds.
#[inline(always)]
pub(crate) fn ensure(condition: bool, msg: &str) {
    if !condition {
        contract_violation(msg);
    }
}

/// Cold failure path: panic in debug builds, log and abort in release.
#[cold]
#[inline(never)]
pub(crate) fn contract_violation(msg: &str) -> ! {
    #[cfg(debug_assertions)]
    panic!("contract violation: {msg}");

    #[cfg(not(debug_assertions))]
    {
        tracing::error!("contract violation: {msg}");
        std::process::abort();
    }
}
