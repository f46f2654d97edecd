//! Logging and log configuration for tally.
//!
//! All crates in the workspace log through the macros re-exported here, so that
//! the subscriber configured in [`init`] is the single place controlling output
//! format and filtering. Binaries call [`init`] once early in `main`; libraries
//! only use the macros.

mod setup;

pub use setup::*;

// Re-export the tracing macros and common types so that callers do not need a
// direct tracing dependency.
pub use tracing::{debug, error, info, trace, warn, Level};

/// Initializes logging for tests with output capturing.
///
/// No-ops if a global subscriber is already installed.
pub fn init_test() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let subscriber = tracing_subscriber::registry().with(
        fmt::layer()
            .with_test_writer()
            .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG),
    );

    subscriber.try_init().ok();
}
