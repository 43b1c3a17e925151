//! Gateway configuration module
//!
//! Handles loading configuration from environment variables.

use crate::error::GatewayError;
use crate::manager::ManagerConfig;
use crate::retry::RetryPolicy;
use std::env;
use std::time::Duration;
use twilight_gateway::Intents;

/// Most privileged intents a deployment may request by name
pub const MAX_PRIVILEGED_INTENTS: usize = 3;

/// Intents that require approval in the developer portal
const PRIVILEGED: Intents = Intents::GUILD_MEMBERS
    .union(Intents::GUILD_PRESENCES)
    .union(Intents::MESSAGE_CONTENT);

/// Intents requested by name in `INTENTS_PRIVILEGED`
const NAMED_INTENTS: &[(&str, Intents)] = &[
    ("guilds", Intents::GUILDS),
    ("guildMessages", Intents::GUILD_MESSAGES),
    ("directMessages", Intents::DIRECT_MESSAGES),
];

/// Which gateway intents the bot asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentsConfig {
    /// Request every intent that needs no approval
    pub unprivileged: bool,
    /// Additional intents by name
    pub privileged: Vec<String>,
}

impl Default for IntentsConfig {
    fn default() -> Self {
        Self {
            unprivileged: true,
            privileged: Vec::new(),
        }
    }
}

impl IntentsConfig {
    /// Check the privileged list, reporting every problem at once
    pub fn validate(&self) -> Result<(), GatewayError> {
        let mut problems = Vec::new();

        if self.privileged.len() > MAX_PRIVILEGED_INTENTS {
            problems.push(format!(
                "at most {MAX_PRIVILEGED_INTENTS} privileged intents allowed, got {}",
                self.privileged.len()
            ));
        }

        for name in &self.privileged {
            if lookup_intent(name).is_none() {
                problems.push(format!("unknown privileged intent {name:?}"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Config(problems.join("; ")))
        }
    }

    /// Resolve to gateway intent flags; unknown names are ignored
    pub fn intents(&self) -> Intents {
        let base = if self.unprivileged {
            Intents::all().difference(PRIVILEGED)
        } else {
            Intents::empty()
        };

        self.privileged
            .iter()
            .filter_map(|name| lookup_intent(name))
            .fold(base, |acc, intent| acc | intent)
    }
}

fn lookup_intent(name: &str) -> Option<Intents> {
    NAMED_INTENTS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, intent)| *intent)
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Fixed shard count; `None` uses the gateway's recommendation
    pub shard_count: Option<u32>,

    pub intents: IntentsConfig,

    /// Pacing between shard identifies
    pub identify_interval: Duration,

    /// Budget for disconnecting every shard
    pub shutdown_timeout: Duration,

    /// Connect attempts per shard
    pub connect_attempts: u32,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let discord_token = lookup("DISCORD_TOKEN")
            .or_else(|| lookup("DISCORD_BOT_TOKEN"))
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        let shard_count = match lookup("SHARD_COUNT") {
            Some(raw) => {
                let count: u32 = parse_var("SHARD_COUNT", &raw)?;
                if count == 0 {
                    return Err(GatewayError::Config(
                        "SHARD_COUNT must be at least 1".to_string(),
                    ));
                }
                Some(count)
            }
            None => None,
        };

        let intents = IntentsConfig {
            unprivileged: match lookup("INTENTS_UNPRIVILEGED") {
                Some(raw) => parse_var("INTENTS_UNPRIVILEGED", &raw)?,
                None => true,
            },
            privileged: lookup("INTENTS_PRIVILEGED")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        };
        intents.validate()?;

        let identify_interval = Duration::from_millis(var_or(&lookup, "IDENTIFY_INTERVAL_MS", 5000)?);
        let shutdown_timeout = Duration::from_secs(var_or(&lookup, "SHUTDOWN_TIMEOUT_SECS", 20)?);
        if shutdown_timeout.is_zero() {
            return Err(GatewayError::Config(
                "SHUTDOWN_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }

        let connect_attempts = var_or(&lookup, "CONNECT_ATTEMPTS", 3)?;
        if connect_attempts == 0 {
            return Err(GatewayError::Config(
                "CONNECT_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let http_port = var_or(&lookup, "HTTP_PORT", 9090)?;
        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            discord_token,
            shard_count,
            intents,
            identify_interval,
            shutdown_timeout,
            connect_attempts,
            http_port,
            log_level,
        })
    }

    /// Timing and retry settings for the shard manager
    pub fn manager_config(&self) -> ManagerConfig {
        let defaults = ManagerConfig::default();
        ManagerConfig {
            identify_interval: self.identify_interval,
            shutdown_timeout: self.shutdown_timeout,
            connect_retry: RetryPolicy {
                max_attempts: self.connect_attempts,
                ..defaults.connect_retry
            },
            ..defaults
        }
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T, GatewayError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| GatewayError::Config(format!("{key} is invalid: {e}")))
}

fn var_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, GatewayError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => parse_var(key, &raw),
        None => Ok(default),
    }
}
