// Postgres pool for organisation membership lookups.

use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use tracing::info;

use crate::config::DatabaseConfig;

pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let options = config
        .url
        .parse::<PgConnectOptions>()
        .context("CALLBOARD_RELAY_DATABASE_URL is not a valid PostgreSQL URL")?;
    require_tls(&options)?;

    let host = options.get_host().to_owned();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to membership database at {host}"))?;
    ping(&pool).await?;

    info!(host = %host, max_connections = config.max_connections, "membership database connected");
    Ok(pool)
}

pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .context("membership database health check failed")?;
    Ok(())
}

/// Remote databases must use TLS. Loopback hosts and unix sockets are exempt
/// so a local Postgres works without certificates.
fn require_tls(options: &PgConnectOptions) -> Result<()> {
    if is_local_host(options.get_host()) {
        return Ok(());
    }
    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => Ok(()),
        mode => bail!(
            "membership database at {} must require TLS (got sslmode={mode:?})",
            options.get_host()
        ),
    }
}

fn is_local_host(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    host.starts_with('/')
        || bare.eq_ignore_ascii_case("localhost")
        || bare.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
