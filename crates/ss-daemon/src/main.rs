//! starscout daemon — runs the discovery/analysis scheduler and serves
//! the HTTP facade.

use anyhow::{Context, Result};
use tracing::info;

use ss_core::config::Config;
use ss_daemon::daemon::Daemon;
use ss_telemetry::logging::{self, LogFormat};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config().context("loading configuration")?;
    logging::init(
        "ss-daemon",
        &config.general.log_level,
        LogFormat::from_config(&config.general.log_format),
    );

    info!(version = env!("CARGO_PKG_VERSION"), "starscout daemon starting");

    let daemon = Daemon::new(config).await.context("building daemon")?;

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            shutdown.trigger();
        }
    });

    daemon.run().await
}

/// Load config from `--config <path>` when given, else the default
/// location (falling back to built-in defaults).
fn load_config() -> Result<Config> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            let path = args
                .next()
                .context("--config requires a path argument")?;
            return Config::load_from(&path)
                .with_context(|| format!("reading config from {path}"));
        }
    }
    Config::load().context("reading default config")
}
