use std::path::PathBuf;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialise tracing for the linking client.
///
/// `default_level` applies when `RUST_LOG` is not set. With a `log_dir`
/// the output goes to a daily-rolling file in that directory instead of
/// stdout. Fails if a global subscriber is already installed.
pub fn init_tracing(default_level: &str, log_dir: Option<PathBuf>) -> Result<()> {
    dotenvy::dotenv().ok();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_dir {
        Some(dir) => {
            let file = tracing_appender::rolling::daily(dir, "nestlink.log");
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false)
                .try_init()
                .map_err(|err| anyhow::anyhow!("could not install logger: {err}"))?;
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .map_err(|err| anyhow::anyhow!("could not install logger: {err}"))?;
        }
    }
    Ok(())
}
