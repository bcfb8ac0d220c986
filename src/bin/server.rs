//! The Wallace server binary.
//!
//! Loads settings (default `config/wallace.toml`, overridable with
//! `--config <path>` and `WALLACE_*` environment variables), installs
//! tracing, and serves until interrupted.

use std::path::PathBuf;
use wallace::Settings;

fn config_path_from_args() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config"
            && let Some(path) = args.next()
        {
            return PathBuf::from(path);
        }
    }
    PathBuf::from("config/wallace.toml")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load(&config_path_from_args())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(settings.server.log_level.clone())
            }),
        )
        .init();

    tracing::info!("wallace server starting");

    wallace::app::run(settings).await.map_err(|e| {
        tracing::error!("server exited with error: {e}");
        anyhow::anyhow!("wallace server failed: {e}")
    })?;

    tracing::info!("wallace server shut down cleanly");
    Ok(())
}
