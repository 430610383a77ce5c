#![warn(missing_docs)]

//! Standalone replication daemon: runs one replication domain and reports
//! its status periodically. Configuration comes from environment variables;
//! `DIRMESH_REPLICA_ID` is required, everything else has defaults.

use anyhow::{Context, Result};
use dirmesh_repl::assured::AssuredMode;
use dirmesh_repl::domain::{DomainConfig, ReplicationDomain};
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("invalid {key}")),
        Err(_) => Ok(default),
    }
}

fn config_from_env() -> Result<DomainConfig> {
    let replica_id = std::env::var("DIRMESH_REPLICA_ID")
        .context("DIRMESH_REPLICA_ID is required")?
        .parse()
        .context("invalid DIRMESH_REPLICA_ID")?;
    let mut config = DomainConfig::new(
        replica_id,
        env_parse("DIRMESH_GROUP_ID", 1u8)?,
        env_parse("DIRMESH_GENERATION_ID", 0u64)?,
    );
    config.assured_mode = match std::env::var("DIRMESH_ASSURED_MODE").as_deref() {
        Ok("safe-read") => AssuredMode::SafeRead,
        Ok("safe-data") => AssuredMode::SafeData(env_parse("DIRMESH_SAFE_DATA_LEVEL", 1u8)?),
        Ok("none") | Err(_) => AssuredMode::None,
        Ok(other) => anyhow::bail!("unknown DIRMESH_ASSURED_MODE {other:?}"),
    };
    config.assured_timeout =
        Duration::from_millis(env_parse("DIRMESH_ASSURED_TIMEOUT_MS", 2000u64)?);
    config.history_purge_limit = env_parse("DIRMESH_HISTORY_PURGE_LIMIT", 100usize)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = config_from_env()?;
    tracing::info!(
        replica_id = config.replica_id,
        group_id = config.group_id,
        "dirmesh replication daemon starting"
    );

    let domain = ReplicationDomain::new(config);
    domain.start();

    let status_interval =
        Duration::from_millis(env_parse("DIRMESH_STATUS_INTERVAL_MS", 10_000u64)?);
    let mut ticker = tokio::time::interval(status_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = domain.status_snapshot();
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for shutdown signal")?;
                tracing::info!("shutting down");
                domain.shutdown().await;
                return Ok(());
            }
        }
    }
}
