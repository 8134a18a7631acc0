use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::batcher::BatchingOptions;
use crate::event::Level;

pub const DEFAULT_OUTPUT_TEMPLATE: &str =
    "[{Level}] {Timestamp:yyyy-MM-dd HH:mm:ss} {SourceContext} {Message}{NewLine}{Exception}";
pub const DEFAULT_BASE_URL: &str = "https://oapi.dingtalk.com/robot/send?access_token=";
pub const DEFAULT_BATCH_SIZE_LIMIT: usize = 100;
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(3);
pub const DEFAULT_QUEUE_LIMIT: usize = 10_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

const ENV_PREFIX: &str = "DINGTALK_SINK_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("robot token is required but was empty")]
    TokenMissing,

    #[error("robot secret is required but was empty")]
    SecretMissing,

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("{0} has invalid value: {1} (expected \"true\" or \"false\")")]
    InvalidBool(String, String),

    #[error("{0} must be greater than zero")]
    ZeroLimit(String),

    #[error("DINGTALK_SINK_MINIMUM_LEVEL has invalid value: {0}")]
    InvalidLevel(String),

    #[error("DINGTALK_SINK_BASE_URL is not a valid URL: {0}")]
    InvalidBaseUrl(String),

    #[error("invalid output template: {0}")]
    InvalidTemplate(String),

    #[error("HTTP client could not be configured: {0}")]
    Client(String),
}

/// Everything a sink needs at construction. Built once per sink; there are
/// no process-wide defaults beyond the constants above.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub token: String,
    pub secret: String,
    pub output_template: String,
    /// Locale tag, e.g. `zh-CN`. Carried for callers; rendering is culture-invariant.
    pub format_provider: Option<String>,
    pub batching: BatchingOptions,
    pub base_url: String,
    pub send_timeout: Duration,
    /// Opt-out of TLS certificate validation. Off unless set explicitly.
    pub accept_invalid_certs: bool,
}

impl SinkConfig {
    /// Credentials plus defaults for everything else.
    pub fn new(token: impl Into<String>, secret: impl Into<String>) -> Result<Self, ConfigError> {
        let token = token.into();
        let secret = secret.into();
        if token.is_empty() {
            return Err(ConfigError::TokenMissing);
        }
        if secret.is_empty() {
            return Err(ConfigError::SecretMissing);
        }

        Ok(Self {
            token,
            secret,
            output_template: DEFAULT_OUTPUT_TEMPLATE.to_owned(),
            format_provider: None,
            batching: BatchingOptions::default(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            accept_invalid_certs: false,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self::parse(&vars)
    }

    fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let token = vars.get("DINGTALK_SINK_TOKEN").cloned().unwrap_or_default();
        let secret = vars.get("DINGTALK_SINK_SECRET").cloned().unwrap_or_default();
        let mut config = Self::new(token, secret)?;

        if let Some(template) = vars
            .get("DINGTALK_SINK_OUTPUT_TEMPLATE")
            .filter(|s| !s.is_empty())
        {
            config.output_template = template.clone();
        }
        config.format_provider = vars
            .get("DINGTALK_SINK_FORMAT_PROVIDER")
            .filter(|s| !s.is_empty())
            .cloned();
        config.base_url = parse_base_url(vars)?;
        config.send_timeout =
            parse_duration_ms(vars, "DINGTALK_SINK_SEND_TIMEOUT_MS", DEFAULT_SEND_TIMEOUT)?;
        config.accept_invalid_certs = parse_bool(vars, "DINGTALK_SINK_ACCEPT_INVALID_CERTS")?;

        config.batching = BatchingOptions {
            batch_size_limit: parse_limit(
                vars,
                "DINGTALK_SINK_BATCH_SIZE_LIMIT",
                DEFAULT_BATCH_SIZE_LIMIT,
            )?,
            period: parse_duration_ms(vars, "DINGTALK_SINK_PERIOD_MS", DEFAULT_PERIOD)?,
            queue_limit: parse_limit(vars, "DINGTALK_SINK_QUEUE_LIMIT", DEFAULT_QUEUE_LIMIT)?,
            eagerly_emit_first: parse_bool(vars, "DINGTALK_SINK_EAGERLY_EMIT_FIRST")?,
            shutdown_timeout: parse_duration_ms(
                vars,
                "DINGTALK_SINK_SHUTDOWN_TIMEOUT_MS",
                DEFAULT_SHUTDOWN_TIMEOUT,
            )?,
            minimum_level: parse_level(vars)?,
        };
        config.validate()?;

        Ok(config)
    }

    /// Checks that hold regardless of how the config was assembled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.is_empty() {
            return Err(ConfigError::TokenMissing);
        }
        if self.secret.is_empty() {
            return Err(ConfigError::SecretMissing);
        }
        if self.batching.batch_size_limit == 0 {
            return Err(ConfigError::ZeroLimit("batch_size_limit".into()));
        }
        if self.batching.queue_limit == 0 {
            return Err(ConfigError::ZeroLimit("queue_limit".into()));
        }
        if self.batching.period.is_zero() {
            return Err(ConfigError::ZeroLimit("period".into()));
        }
        Ok(())
    }
}

fn parse_base_url(vars: &HashMap<String, String>) -> Result<String, ConfigError> {
    match vars.get("DINGTALK_SINK_BASE_URL").filter(|s| !s.is_empty()) {
        Some(raw) => {
            Url::parse(raw).map_err(|_| ConfigError::InvalidBaseUrl(raw.clone()))?;
            Ok(raw.clone())
        }
        None => Ok(DEFAULT_BASE_URL.to_owned()),
    }
}

fn parse_limit(
    vars: &HashMap<String, String>,
    name: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    match vars.get(name) {
        Some(val) => {
            let limit: usize = val
                .parse()
                .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone()))?;
            if limit == 0 {
                return Err(ConfigError::ZeroLimit(name.to_owned()));
            }
            Ok(limit)
        }
        None => Ok(default),
    }
}

fn parse_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match vars.get(name) {
        Some(val) => {
            let ms: u64 = val
                .parse()
                .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone()))?;
            Ok(Duration::from_millis(ms))
        }
        None => Ok(default),
    }
}

fn parse_bool(vars: &HashMap<String, String>, name: &str) -> Result<bool, ConfigError> {
    match vars.get(name).map(|s| s.to_ascii_lowercase()) {
        None => Ok(false),
        Some(val) => match val.as_str() {
            "" | "false" | "0" => Ok(false),
            "true" | "1" => Ok(true),
            _ => Err(ConfigError::InvalidBool(name.to_owned(), val)),
        },
    }
}

fn parse_level(vars: &HashMap<String, String>) -> Result<Level, ConfigError> {
    match vars
        .get("DINGTALK_SINK_MINIMUM_LEVEL")
        .filter(|s| !s.is_empty())
    {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidLevel(raw.clone())),
        None => Ok(Level::MINIMUM),
    }
}
