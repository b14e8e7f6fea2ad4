#![allow(dead_code)]

use linked_uring::{
    io::{Ring, RingConfig},
    scenario::ScenarioError,
    verify::Verdict,
    RingError,
};
use tracing_subscriber::EnvFilter;

/// Installs a compact subscriber that writes through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .without_time()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Returns true, after saying so, if the error means this kernel or sandbox has no `io_uring`.
pub fn unsupported(err: &RingError) -> bool {
    if err.is_unsupported() {
        eprintln!("skipping: io_uring is not available here ({err})");
        return true;
    }
    false
}

/// Creates a ring, or returns `None` if `io_uring` is not available.
pub fn ring(config: RingConfig) -> Option<Ring> {
    init_tracing();
    match Ring::with_config(config) {
        Ok(ring) => Some(ring),
        Err(e) if unsupported(&e) => None,
        Err(e) => panic!("failed to create ring: {e}"),
    }
}

/// Unwraps a scenario result, or returns `None` if `io_uring` is not available.
pub fn verdict(result: Result<Verdict, ScenarioError>) -> Option<Verdict> {
    match result {
        Ok(verdict) => Some(verdict),
        Err(ScenarioError::Ring(e)) if unsupported(&e) => None,
        Err(e) => panic!("scenario failed: {e}"),
    }
}
