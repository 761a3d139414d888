//! Structured events for pool and controller activity.
//!
//! When the `tracing` feature is enabled these functions emit `tracing`
//! events; otherwise they compile to nothing.

#[cfg(feature = "tracing")]
mod internal {
    use std::time::Duration;

    /// A pending list was moved onto the free list.
    pub(crate) fn pending_transferred(pool: &str, count: usize) {
        tracing::trace!(pool = pool, count = count, "pending_transferred");
    }

    /// `reduce_free_list` destroyed `removed` segments.
    pub(crate) fn free_list_reduced(pool: &str, removed: usize, remaining: usize) {
        tracing::debug!(
            pool = pool,
            removed = removed,
            remaining = remaining,
            "free_list_reduced"
        );
    }

    pub(crate) fn state_change(from: &str, to: &str) {
        tracing::trace!(from = from, to = to, "controller_state_change");
    }

    /// Per category outcome of the usage calculation.
    pub(crate) fn return_plan(pool: &str, free: usize, used: usize, keep: usize) {
        tracing::trace!(
            pool = pool,
            free = free,
            used = used,
            keep = keep,
            "return_plan"
        );
    }

    pub(crate) fn step_finished(elapsed: Duration, state: &str, more_work: bool) {
        tracing::trace!(
            elapsed_us = elapsed.as_micros() as u64,
            state = state,
            more_work = more_work,
            "controller_step"
        );
    }

    #[allow(dead_code)]
    pub(crate) fn service_started(name: &str) {
        tracing::debug!(thread = name, "reclamation_service_started");
    }

    #[allow(dead_code)]
    pub(crate) fn service_stopped(name: &str, cycles: usize) {
        tracing::debug!(thread = name, cycles = cycles, "reclamation_service_stopped");
    }
}

#[cfg(not(feature = "tracing"))]
mod internal {
    use std::time::Duration;

    #[inline(always)]
    pub(crate) fn pending_transferred(_pool: &str, _count: usize) {}

    #[inline(always)]
    pub(crate) fn free_list_reduced(_pool: &str, _removed: usize, _remaining: usize) {}

    #[inline(always)]
    pub(crate) fn state_change(_from: &str, _to: &str) {}

    #[inline(always)]
    pub(crate) fn return_plan(_pool: &str, _free: usize, _used: usize, _keep: usize) {}

    #[inline(always)]
    pub(crate) fn step_finished(_elapsed: Duration, _state: &str, _more_work: bool) {}

    #[inline(always)]
    #[allow(dead_code)]
    pub(crate) fn service_started(_name: &str) {}

    #[inline(always)]
    #[allow(dead_code)]
    pub(crate) fn service_stopped(_name: &str, _cycles: usize) {}
}

pub(crate) use internal::*;
