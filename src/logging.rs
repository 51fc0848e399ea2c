use anyhow::Context as _;

/// Env var consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "PAGEWRIGHT_LOG";

/// Installs the stderr subscriber. `PAGEWRIGHT_LOG` wins over `RUST_LOG`;
/// without either, `info`.
pub fn init() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
