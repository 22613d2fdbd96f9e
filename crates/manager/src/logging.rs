//! provides logging helpers

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

const LOG_LEVEL_ENV_VAR: &str = "VGPU_LOG_LEVEL";

/// initiate the global tracing subscriber
pub fn init() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    let fmt_layer = layer().with_writer(std::io::stdout).with_target(true);

    registry().with(fmt_layer.with_filter(env_filter)).init();
}
