//! Configuration loader.
//!
//! Loads configuration from an optional `.env` file followed by environment
//! variables. Values already present in the process environment win over the
//! `.env` file, which matches dotenv semantics.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use super::dto::{
    ApnsConfig, CredentialConfig, DatabaseConfig, FcmConfig, HttpConfig, LoggingConfig,
    MetricsConfig, PushConfig, ReaperConfig, RetryConfig, ServerConfig, SocketConfig,
};
use super::error::{ConfigError, Result};

/// Loads [`ServerConfig`] from the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    env_file_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(env_file_path: Option<PathBuf>) -> Self {
        Self { env_file_path }
    }

    /// Load and validate the full server configuration.
    pub fn load(&self) -> Result<ServerConfig> {
        if let Some(path) = &self.env_file_path {
            dotenv::from_path(path).map_err(|e| ConfigError::EnvFileLoad {
                path: path.clone(),
                source: e,
            })?;
        } else {
            // Best effort: a missing .env in the working directory is fine.
            let _ = dotenv::dotenv();
        }

        let config = ServerConfig {
            http: HttpConfig {
                port: env_parse("COURIER_PORT", 8080)?,
                shutdown_grace: env_secs("COURIER_SHUTDOWN_GRACE_SECS", 30)?,
            },
            database: DatabaseConfig {
                url: env_required("COURIER_DATABASE_URL")?,
                schema: env_string("COURIER_DATABASE_SCHEMA", "courier"),
                max_connections: env_parse("COURIER_DATABASE_MAX_CONNECTIONS", 10)?,
                connect_timeout: env_secs("COURIER_DATABASE_CONNECT_TIMEOUT_SECS", 30)?,
            },
            credentials: CredentialConfig {
                signing_secret: env_required("COURIER_SIGNING_SECRET")?,
                permanent_ttl: env_secs("COURIER_PERMANENT_TTL_SECS", 24 * 60 * 60)?,
                temporary_ttl: env_secs("COURIER_TEMPORARY_TTL_SECS", 30 * 60)?,
            },
            socket: SocketConfig {
                keepalive_interval: env_secs("COURIER_WS_KEEPALIVE_SECS", 54)?,
                pong_wait: env_secs("COURIER_WS_PONG_WAIT_SECS", 60)?,
                write_wait: env_secs("COURIER_WS_WRITE_WAIT_SECS", 10)?,
                max_frame_size: env_parse("COURIER_WS_MAX_FRAME_SIZE", 4096)?,
                outbound_buffer: env_parse("COURIER_WS_OUTBOUND_BUFFER", 256)?,
            },
            retry: RetryConfig {
                max_retries: env_parse("COURIER_RETRY_MAX", 5)?,
                base_interval: env_millis("COURIER_RETRY_BASE_MS", 500)?,
                multiplier: env_parse("COURIER_RETRY_MULTIPLIER", 2.0)?,
                max_interval: env_secs("COURIER_RETRY_MAX_INTERVAL_SECS", 60)?,
                jitter: env_parse("COURIER_RETRY_JITTER", 0.2)?,
                poll_interval: env_secs("COURIER_RETRY_POLL_SECS", 60)?,
                dlq_capacity: env_parse("COURIER_DLQ_CAPACITY", 1024)?,
                dlq_retention: env_secs("COURIER_DLQ_RETENTION_SECS", 0)?,
            },
            reaper: ReaperConfig {
                interval: env_secs("COURIER_REAPER_INTERVAL_SECS", 60)?,
                inactivity_threshold: env_secs(
                    "COURIER_INACTIVITY_THRESHOLD_SECS",
                    env_parse("COURIER_WS_PONG_WAIT_SECS", 60u64)?,
                )?,
            },
            push: PushConfig {
                apns: ApnsConfig {
                    enabled: env_parse("COURIER_APNS_ENABLED", false)?,
                    endpoint: env_string(
                        "COURIER_APNS_ENDPOINT",
                        "https://api.push.apple.com/3/device",
                    ),
                    topic: env_string("COURIER_APNS_TOPIC", ""),
                    auth_token: env_string("COURIER_APNS_AUTH_TOKEN", ""),
                },
                fcm: FcmConfig {
                    enabled: env_parse("COURIER_FCM_ENABLED", false)?,
                    endpoint: env_string(
                        "COURIER_FCM_ENDPOINT",
                        "https://fcm.googleapis.com/fcm/send",
                    ),
                    api_key: env_string("COURIER_FCM_API_KEY", ""),
                },
                request_timeout: env_secs("COURIER_PUSH_TIMEOUT_SECS", 10)?,
            },
            metrics: MetricsConfig {
                enabled: env_parse("COURIER_METRICS_ENABLED", true)?,
                port: env_parse("COURIER_METRICS_PORT", 9090)?,
            },
            logging: LoggingConfig {
                level: env_string("COURIER_LOG_LEVEL", "info"),
            },
        };

        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &ServerConfig) -> Result<()> {
    if config.credentials.signing_secret.is_empty() {
        return Err(ConfigError::Validation(
            "signing secret must not be empty".to_string(),
        ));
    }
    if config.retry.multiplier < 1.0 {
        return Err(ConfigError::Validation(
            "retry multiplier must be >= 1.0".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.retry.jitter) {
        return Err(ConfigError::Validation(
            "retry jitter must be within 0.0..=1.0".to_string(),
        ));
    }
    if config.socket.outbound_buffer == 0 {
        return Err(ConfigError::Validation(
            "socket outbound buffer must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| ConfigError::MissingRequired {
        var: key.to_string(),
    })
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            var: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default_secs)?))
}

fn env_millis(key: &str, default_ms: u64) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(key, default_ms)?))
}
