//! Test doubles and fixtures for `ensembler`.

mod fixtures;
mod mock;

pub use fixtures::*;
pub use mock::{AutoReport, MockDriver, RejectingValidator};

/// Install a test subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
