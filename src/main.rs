use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod core;
mod daemon;
mod platform;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| core::config::DEFAULT_CONFIG_PATH.to_string());
    let settings = core::config::Settings::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.daemon.log_level));
    let timer = tracing_subscriber::fmt::time::UtcTime::new(
        time::format_description::parse("[hour]:[minute]:[second]").unwrap(),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_timer(timer)
                .with_writer(std::io::stderr),
        )
        .init();

    let table = settings.build_table()?;
    tracing::info!(
        "g3dgov v{} started ({} levels, {}-{} MHz, tick={}ms, ASV={})",
        env!("CARGO_PKG_VERSION"),
        table.len(),
        table.level(0).clock_mhz,
        table.level(table.max_step()).clock_mhz,
        settings.daemon.tick_interval_ms,
        if settings.asv.enabled { "on" } else { "off" }
    );

    daemon::run::run(&settings).await
}
