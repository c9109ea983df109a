//! # Structured Logging
//!
//! Tracing initialization shared by the binary and the test suites. Safe to
//! call more than once; only the first call installs the subscriber.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing with an env-filterable fmt layer.
///
/// `RUST_LOG` wins when set; the default keeps the operator's own spans at
/// debug and everything else at info.
pub fn init_tracing() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,sim_operator=debug"));

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_filter(filter),
        );

        // A subscriber may already be installed by a test harness.
        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }
    });
}
