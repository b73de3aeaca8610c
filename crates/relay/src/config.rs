// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::{net::SocketAddr, time::Duration};

use callboard_common::types::{OrganisationId, UserId};

const DEV_JWT_SECRET: &str = "callboard_local_development_jwt_secret_must_be_32_chars";
const DEFAULT_OUTBOUND_QUEUE: usize = 256;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Membership database settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for access tokens.
    pub jwt_secret: String,
    /// Membership database. Without it, membership is kept in memory.
    pub database: Option<DatabaseConfig>,
    /// Log filter directive (e.g. `info`, `callboard_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Capacity of each connection's outbound queue before it is considered dead.
    pub outbound_queue: usize,
    /// `(organisation, user)` pairs seeded into the in-memory membership store.
    pub dev_members: Vec<(OrganisationId, UserId)>,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CALLBOARD_RELAY_HOST` | `0.0.0.0` |
    /// | `CALLBOARD_RELAY_PORT` | `8080` |
    /// | `CALLBOARD_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `CALLBOARD_RELAY_DATABASE_URL` | *(none, in-memory membership)* |
    /// | `CALLBOARD_RELAY_DB_MAX_CONNECTIONS` | `8` |
    /// | `CALLBOARD_RELAY_DB_ACQUIRE_TIMEOUT_SECS` | `5` |
    /// | `CALLBOARD_RELAY_LOG_FILTER` | `info` |
    /// | `CALLBOARD_RELAY_LOG_FORMAT` | `text` |
    /// | `CALLBOARD_RELAY_OUTBOUND_QUEUE` | `256` |
    /// | `CALLBOARD_RELAY_DEV_MEMBERS` | *(none)*, e.g. `1:10,1:11` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("CALLBOARD_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("CALLBOARD_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("CALLBOARD_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let database = env("CALLBOARD_RELAY_DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|url| DatabaseConfig {
                url,
                max_connections: env("CALLBOARD_RELAY_DB_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse::<u32>().ok())
                    .filter(|max| *max > 0)
                    .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
                acquire_timeout: Duration::from_secs(
                    env("CALLBOARD_RELAY_DB_ACQUIRE_TIMEOUT_SECS")
                        .ok()
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS),
                ),
            });

        let log_filter = env("CALLBOARD_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("CALLBOARD_RELAY_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let outbound_queue = env("CALLBOARD_RELAY_OUTBOUND_QUEUE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|capacity| *capacity > 0)
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE);

        let dev_members = env("CALLBOARD_RELAY_DEV_MEMBERS")
            .map(|raw| parse_member_pairs(&raw))
            .unwrap_or_default();

        Self {
            listen_addr,
            jwt_secret,
            database,
            log_filter,
            log_format,
            outbound_queue,
            dev_members,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

/// Parses `org:user` pairs separated by commas. Malformed entries are skipped.
fn parse_member_pairs(raw: &str) -> Vec<(OrganisationId, UserId)> {
    raw.split(',')
        .filter_map(|entry| {
            let (organisation_id, user_id) = entry.trim().split_once(':')?;
            Some((organisation_id.trim().parse().ok()?, user_id.trim().parse().ok()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.outbound_queue, 256);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("CALLBOARD_RELAY_HOST", "127.0.0.1");
        m.insert("CALLBOARD_RELAY_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("CALLBOARD_RELAY_PORT", "not_a_number");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("CALLBOARD_RELAY_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn blank_database_url_means_in_memory() {
        let mut m = HashMap::new();
        m.insert("CALLBOARD_RELAY_DATABASE_URL", "  ");
        m.insert("CALLBOARD_RELAY_DB_MAX_CONNECTIONS", "4");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database.is_none());
    }

    #[test]
    fn database_settings_fall_back_per_field() {
        let mut m = HashMap::new();
        m.insert("CALLBOARD_RELAY_DATABASE_URL", "postgres://u:p@host/db?sslmode=require");
        m.insert("CALLBOARD_RELAY_DB_MAX_CONNECTIONS", "0");
        m.insert("CALLBOARD_RELAY_DB_ACQUIRE_TIMEOUT_SECS", "30");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(
            cfg.database,
            Some(DatabaseConfig {
                url: "postgres://u:p@host/db?sslmode=require".into(),
                max_connections: 8,
                acquire_timeout: Duration::from_secs(30),
            })
        );
    }

    #[test]
    fn json_log_format_is_case_insensitive() {
        let mut m = HashMap::new();
        m.insert("CALLBOARD_RELAY_LOG_FORMAT", "JSON");
        m.insert("CALLBOARD_RELAY_LOG_FILTER", "debug,callboard_relay=trace");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.log_filter, "debug,callboard_relay=trace");
    }

    #[test]
    fn zero_outbound_queue_falls_back_to_default() {
        let mut m = HashMap::new();
        m.insert("CALLBOARD_RELAY_OUTBOUND_QUEUE", "0");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.outbound_queue, 256);

        let mut m = HashMap::new();
        m.insert("CALLBOARD_RELAY_OUTBOUND_QUEUE", "8");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.outbound_queue, 8);
    }

    #[test]
    fn dev_members_parse_pairs_and_skip_garbage() {
        let mut m = HashMap::new();
        m.insert("CALLBOARD_RELAY_DEV_MEMBERS", "1:10, 1:11,bogus,2:x,3:30");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.dev_members, vec![(1, 10), (1, 11), (3, 30)]);

        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert!(cfg.dev_members.is_empty());
    }
}
