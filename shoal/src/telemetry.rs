//! Tracing instrumentation helpers.
//!
//! Span constructors for the task lifecycle, so the runtime and any
//! embedding application record the same fields at the same points.

use tracing::{info_span, Span};

/// Span for a task submission.
#[must_use]
pub fn task_submit_span(task_id: impl AsRef<str>, group: impl AsRef<str>) -> Span {
    info_span!(
        "shoal.submit",
        task_id = %task_id.as_ref(),
        group = %group.as_ref(),
    )
}

/// Span for a claim attempt against a group.
#[must_use]
pub fn task_claim_span(group: impl AsRef<str>, slot: impl AsRef<str>) -> Span {
    info_span!(
        "shoal.claim",
        group = %group.as_ref(),
        slot = %slot.as_ref(),
    )
}

/// Span for one handler execution.
#[must_use]
pub fn task_dispatch_span(
    task_id: impl AsRef<str>,
    method: impl AsRef<str>,
    attempt: u32,
) -> Span {
    info_span!(
        "shoal.dispatch",
        task_id = %task_id.as_ref(),
        method = %method.as_ref(),
        attempt,
    )
}

/// Span for finalizing a task after execution.
#[must_use]
pub fn task_finalize_span(task_id: impl AsRef<str>, outcome: impl AsRef<str>) -> Span {
    info_span!(
        "shoal.finalize",
        task_id = %task_id.as_ref(),
        outcome = %outcome.as_ref(),
    )
}
