use price_feed::producer::{ConfigError as ProducerConfigError, ProducerConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BIND_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080);
pub const DEFAULT_CALENDAR_PATH: &str = "coefficients/schedule.ics";
pub const DEFAULT_JOURNAL_DIR: &str = "data/journal";
pub const DEFAULT_TICK_MS: u64 = 1000;
pub const DEFAULT_BACKOFF_SECS: u64 = 60;
pub const DEFAULT_CLIENT_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Producer(#[from] ProducerConfigError),
}

/// Runtime settings, read from `FEED_*` environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub calendar_path: PathBuf,
    pub journal_dir: PathBuf,
    pub producer: ProducerConfig,
    /// Per-client outbound queue; a client that falls this far behind is dropped.
    pub client_queue: usize,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = parse_var(&lookup, "FEED_BIND_ADDR", DEFAULT_BIND_ADDR)?;
        let calendar_path = lookup("FEED_CALENDAR_PATH")
            .unwrap_or_else(|| DEFAULT_CALENDAR_PATH.to_string())
            .into();
        let journal_dir = lookup("FEED_JOURNAL_DIR")
            .unwrap_or_else(|| DEFAULT_JOURNAL_DIR.to_string())
            .into();
        let tick_ms: u64 = parse_var(&lookup, "FEED_TICK_MS", DEFAULT_TICK_MS)?;
        let backoff_secs: u64 = parse_var(&lookup, "FEED_BACKOFF_SECS", DEFAULT_BACKOFF_SECS)?;
        let client_queue: usize = parse_var(&lookup, "FEED_CLIENT_QUEUE", DEFAULT_CLIENT_QUEUE)?;

        if client_queue == 0 {
            return Err(ConfigError::Invalid {
                var: "FEED_CLIENT_QUEUE",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let producer = ProducerConfig {
            tick_interval: Duration::from_millis(tick_ms),
            backoff: Duration::from_secs(backoff_secs),
            ..ProducerConfig::default()
        };
        producer.validate()?;

        Ok(Self {
            bind_addr,
            calendar_path,
            journal_dir,
            producer,
            client_queue,
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: err.to_string(),
    })
}
