//! Server configuration loaded from environment variables.
//!
//! Everything but the JWT secret has a development default.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

use parley_gateway::GatewayConfig;

/// Secrets that ship in sample `.env` files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["", "changeme", "change-me", "secret", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `PARLEY_HOST`, `PARLEY_PORT`
    /// Default: `0.0.0.0:3000`
    pub addr: SocketAddr,

    /// Env: `PARLEY_DB_PATH`
    /// Default: `parley.db`
    pub db_path: PathBuf,

    /// HS256 key for client tokens.
    /// Env: `PARLEY_JWT_SECRET` (required)
    pub jwt_secret: String,

    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let host = lookup("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_or("PARLEY_PORT", &lookup, 3000)?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let db_path = PathBuf::from(lookup("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into()));

        let jwt_secret = lookup("PARLEY_JWT_SECRET").context("PARLEY_JWT_SECRET must be set")?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.trim()) {
            bail!("PARLEY_JWT_SECRET is a placeholder value, set a real secret");
        }

        let defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            handshake_timeout: Duration::from_secs(parse_or(
                "PARLEY_HANDSHAKE_TIMEOUT_SECS",
                &lookup,
                defaults.handshake_timeout.as_secs(),
            )?),
            outbound_capacity: parse_or("PARLEY_OUTBOUND_CAPACITY", &lookup, defaults.outbound_capacity)?,
            heartbeat_interval: Duration::from_secs(parse_or(
                "PARLEY_HEARTBEAT_SECS",
                &lookup,
                defaults.heartbeat_interval.as_secs(),
            )?),
            history_page_max: parse_or("PARLEY_HISTORY_PAGE_MAX", &lookup, defaults.history_page_max)?,
            ..defaults
        };
        if gateway.outbound_capacity == 0 {
            bail!("PARLEY_OUTBOUND_CAPACITY must be at least 1");
        }

        Ok(Self {
            addr,
            db_path,
            jwt_secret,
            gateway,
        })
    }
}

fn parse_or<T>(key: &str, lookup: &impl Fn(&str) -> Option<String>, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
