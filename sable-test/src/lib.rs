//! Miscellaneous test code for sable.

use std::sync::Once;

use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub mod vectors;

static INIT: Once = Once::new();

/// Initialize global settings for tests: a tracing subscriber reading
/// `RUST_LOG`, span-aware error reports, and color-eyre panic hooks.
///
/// Callable from every test; only the first call has any effect.
pub fn init() {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer().with_target(false);
        let filter_layer = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .expect("the fallback filter directive parses");

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(ErrorLayer::default())
            .init();

        color_eyre::install().expect("color-eyre installs exactly once");
    })
}
