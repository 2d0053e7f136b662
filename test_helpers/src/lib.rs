//! Helpers shared by the workspace's test suites.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_docs)]

use std::{env, sync::Once};
use tracing_subscriber::EnvFilter;

static START_LOGGING: Once = Once::new();

/// Install a `tracing` subscriber writing to stderr, filtered by `RUST_LOG`
/// and defaulting to `debug`. Idempotent within one test binary.
pub fn start_logging() {
    START_LOGGING.call_once(|| {
        if env::var("RUST_LOG").is_err() {
            env::set_var("RUST_LOG", "debug");
        }
        tracing_log::LogTracer::init().expect("installed exactly once");
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    });
}

/// Start logging only when `RUST_LOG` is explicitly set, so a plain test run
/// stays quiet. Call at the top of a test to get logs on demand.
pub fn maybe_start_logging() {
    if env::var("RUST_LOG").is_ok() {
        start_logging();
    }
}

/// Assert that `haystack` contains `needle`, with a readable failure.
#[macro_export]
macro_rules! assert_contains {
    ($haystack:expr, $needle:expr) => {{
        let haystack_value: String = $haystack.to_string();
        let needle_value: String = $needle.to_string();
        assert!(
            haystack_value.contains(&needle_value),
            "can not find {needle_value:?} in {haystack_value:?}",
        );
    }};
}
