//! Named, timed steps for observability.

use std::time::Instant;

use tracing::{debug, info, info_span, warn};

use crate::error::Result;

/// Run `f` inside a span named after the step, logging its duration and outcome.
/// The result is returned untouched.
pub fn run<T>(name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let span = info_span!("task", name);
    let _entered = span.enter();

    let started = Instant::now();
    debug!("task started");
    let result = f();
    let duration_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => info!(duration_ms, "task succeeded"),
        Err(e) => warn!(duration_ms, error = %e, "task failed"),
    }
    result
}

/// Turn `f` into a function running every call as the step `name`.
pub fn wrap<'a, A, T>(
    name: &'a str,
    f: impl Fn(A) -> Result<T> + 'a,
) -> impl Fn(A) -> Result<T> + 'a {
    move |arg| run(name, || f(arg))
}
