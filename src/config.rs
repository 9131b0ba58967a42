//! Process configuration read from the environment.
//!
//! A `.env` file is honored when present (loaded by the binary through
//! `dotenvy`). Unset variables fall back to defaults; set-but-invalid
//! variables are a startup error.

use std::{env, fmt::Display, net::IpAddr, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_FEED_URL: &str = "wss://24data.ptfs.app/wss";
pub const DEFAULT_CONTROLLERS_URL: &str = "https://24data.ptfs.app/controllers";
pub const DEFAULT_ATIS_URL: &str = "https://24data.ptfs.app/atis";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Discord OAuth application credentials.
#[derive(Clone, Debug)]
pub struct DiscordConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub feed_url: String,
    pub controllers_url: String,
    pub atis_url: String,
    pub feed_reconnect_delay: Duration,
    pub fetch_timeout: Duration,
    pub discord: Option<DiscordConfig>,
    pub frontend_url: String,
    pub super_admin_discord_id: Option<String>,
    pub secure_cookies: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: 5000,
            database_url: None,
            database_max_connections: 10,
            feed_url: DEFAULT_FEED_URL.to_string(),
            controllers_url: DEFAULT_CONTROLLERS_URL.to_string(),
            atis_url: DEFAULT_ATIS_URL.to_string(),
            feed_reconnect_delay: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(15),
            discord: None,
            frontend_url: "http://localhost:8000".to_string(),
            super_admin_discord_id: None,
            secure_cookies: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let discord = match (var("DISCORD_CLIENT_ID"), var("DISCORD_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(DiscordConfig {
                client_id,
                client_secret,
                redirect_uri: var("DISCORD_REDIRECT_URI").unwrap_or_else(|| {
                    "http://localhost:5000/auth/discord/callback".to_string()
                }),
            }),
            _ => {
                info!("Discord OAuth credentials not set, login disabled");
                None
            }
        };

        Ok(Self {
            bind_addr: parse_or(&var, "BIND_ADDR", defaults.bind_addr)?,
            port: parse_or(&var, "PORT", defaults.port)?,
            database_url: var("DATABASE_URL"),
            database_max_connections: parse_or(
                &var,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            feed_url: var("FEED_URL").unwrap_or(defaults.feed_url),
            controllers_url: var("CONTROLLERS_URL").unwrap_or(defaults.controllers_url),
            atis_url: var("ATIS_URL").unwrap_or(defaults.atis_url),
            feed_reconnect_delay: Duration::from_secs(parse_or(
                &var,
                "FEED_RECONNECT_SECS",
                defaults.feed_reconnect_delay.as_secs(),
            )?),
            fetch_timeout: Duration::from_secs(parse_or(
                &var,
                "FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )?),
            discord,
            frontend_url: var("FRONTEND_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.frontend_url),
            super_admin_discord_id: var("SUPER_ADMIN_DISCORD_ID"),
            secure_cookies: parse_or(&var, "SECURE_COOKIES", defaults.secure_cookies)?,
        })
    }
}

fn parse_or<T, F>(var: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        None => {
            debug!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}
