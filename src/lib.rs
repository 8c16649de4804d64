//! Hazard reporter offline layer
//!
//! Re-exports the offline store and provides the logging bootstrap hosts call
//! at startup.

#![warn(missing_docs)]

pub use offline_store::*;

use anyhow::Context;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// Honors `RUST_LOG`; defaults to `warn` for dependencies and `info` for the
/// offline store. Fails if a subscriber is already installed.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,offline_store=info,hazard_offline=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}
