// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A `#[test]` replacement that routes `tracing` output from the code under
//! test into the test harness, so it shows up alongside a failing test.
//!
//! ```ignore
//! use test_with_tracing::test;
//!
//! #[test]
//! fn my_test() {
//!     tracing::info!("visible when the test fails");
//! }
//! ```

#![forbid(unsafe_code)]

pub use test_with_tracing_macro::test;

use std::sync::Once;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the process-wide subscriber. Called by the generated test
/// wrapper; repeated calls are no-ops.
///
/// The filter is taken from `RUST_LOG` when it parses as a list of targets,
/// otherwise everything at `DEBUG` and above is shown.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let targets = std::env::var("RUST_LOG")
            .ok()
            .and_then(|filter| filter.parse::<Targets>().ok())
            .unwrap_or_else(|| Targets::new().with_default(LevelFilter::DEBUG));

        let fmt = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_test_writer()
            .log_internal_errors(true);

        // Another harness may already have installed a subscriber.
        let _ = tracing_subscriber::registry()
            .with(fmt.with_filter(targets))
            .try_init();
    });
}
