//! Configuration module for the Gunsole client.
//!
//! A [`ClientConfig`] is what the caller hands over; [`ClientConfig::resolve`]
//! validates it and fills in every default, producing the immutable
//! [`ResolvedConfig`] the client runs with. Nothing here performs I/O except
//! [`ClientConfig::from_env`], which only reads environment variables.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

use crate::entry::is_reserved_tag_key;
use crate::hooks::ErrorSurface;
use crate::transport::HttpSender;

/// Default endpoint for the desktop app collector
pub const DESKTOP_ENDPOINT: &str = "http://localhost:8787";

/// Default endpoint for a locally running collector
pub const LOCAL_ENDPOINT: &str = "http://localhost:17655";

/// Default endpoint for the hosted collector
pub const CLOUD_ENDPOINT: &str = "https://api.gunsole.com";

/// Default batch size (number of logs per batch)
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default flush interval in milliseconds
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;

/// Maximum allowed batch size to prevent memory issues
const MAX_BATCH_SIZE: usize = 10_000;

/// Maximum flush interval to ensure reasonable data freshness
const MAX_FLUSH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Deployment target selecting the default collector endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientMode {
    Local,
    Desktop,
    #[default]
    Cloud,
}

impl ClientMode {
    /// The collector endpoint used when no override is configured.
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ClientMode::Local => LOCAL_ENDPOINT,
            ClientMode::Desktop => DESKTOP_ENDPOINT,
            ClientMode::Cloud => CLOUD_ENDPOINT,
        }
    }
}

impl fmt::Display for ClientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientMode::Local => write!(f, "local"),
            ClientMode::Desktop => write!(f, "desktop"),
            ClientMode::Cloud => write!(f, "cloud"),
        }
    }
}

impl FromStr for ClientMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ClientMode::Local),
            "desktop" => Ok(ClientMode::Desktop),
            "cloud" => Ok(ClientMode::Cloud),
            other => Err(ConfigError::InvalidValue {
                field: "mode".to_string(),
                message: format!("'{}' is not one of local, desktop, cloud", other),
            }),
        }
    }
}

/// Errors raised while building a client. These indicate programmer error
/// and are the only errors the SDK ever returns to its caller.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("projectId is required")]
    MissingProjectId,

    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("bucket name \"{0}\" conflicts with a reserved client method")]
    ReservedBucketName(String),

    #[error("tag key \"{0}\" conflicts with a log record field")]
    ReservedTagKey(String),

    #[error("bucket names must not be empty")]
    EmptyBucketName,

    #[error("client must be created inside a tokio runtime")]
    NoRuntime,
}

/// User-supplied client configuration.
///
/// Everything except `project_id` is optional; see [`ClientConfig::resolve`]
/// for the defaults.
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// Project identifier (required, non-empty)
    pub project_id: String,

    /// API key sent as a bearer token when present
    pub api_key: Option<String>,

    /// Deployment target selecting the default endpoint
    pub mode: ClientMode,

    /// Collector base URL, overrides the mode default
    pub endpoint: Option<String>,

    /// Environment name (e.g. "production")
    pub env: Option<String>,

    /// Application name
    pub app_name: Option<String>,

    /// Application version
    pub app_version: Option<String>,

    /// Tags applied to every log; per-call tags win on conflict
    pub default_tags: BTreeMap<String, String>,

    /// Number of buffered logs that triggers a flush
    pub batch_size: Option<usize>,

    /// Period of the background flush timer
    pub flush_interval: Option<Duration>,

    /// Sends uncompressed payloads and surfaces internal errors at warn level
    pub debug: bool,

    /// Custom HTTP implementation (defaults to reqwest)
    pub http_sender: Option<Arc<dyn HttpSender>>,

    /// Host error-reporting surface used by the global error handlers
    pub error_surface: Option<Arc<dyn ErrorSurface>>,

    /// Bucket names that get a dedicated sub-logger
    pub buckets: Vec<String>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("project_id", &self.project_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("mode", &self.mode)
            .field("endpoint", &self.endpoint)
            .field("env", &self.env)
            .field("app_name", &self.app_name)
            .field("app_version", &self.app_version)
            .field("default_tags", &self.default_tags)
            .field("batch_size", &self.batch_size)
            .field("flush_interval", &self.flush_interval)
            .field("debug", &self.debug)
            .field("buckets", &self.buckets)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Create a configuration for the given project with every other
    /// field left at its default.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `GUNSOLE_PROJECT_ID`: project identifier
    /// - `GUNSOLE_API_KEY`: bearer token
    /// - `GUNSOLE_MODE`: `local`, `desktop` or `cloud` (default: cloud)
    /// - `GUNSOLE_ENDPOINT`: collector URL override
    /// - `GUNSOLE_ENV`, `GUNSOLE_APP_NAME`, `GUNSOLE_APP_VERSION`: metadata
    /// - `GUNSOLE_BATCH_SIZE`: logs per batch (default: 10)
    /// - `GUNSOLE_FLUSH_INTERVAL_MS`: milliseconds between flushes (default: 5000)
    /// - `GUNSOLE_DEBUG`: `true`/`1` to disable compression
    ///
    /// Unset variables are left at their defaults; the result still has to go
    /// through [`resolve`](Self::resolve).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the variable when a numeric,
    /// boolean or mode value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode = match read_var("GUNSOLE_MODE") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                field: "GUNSOLE_MODE".to_string(),
                message: format!("'{}' is not one of local, desktop, cloud", value),
            })?,
            None => ClientMode::default(),
        };

        let batch_size = parse_var::<usize>("GUNSOLE_BATCH_SIZE")?;
        let flush_interval =
            parse_var::<u64>("GUNSOLE_FLUSH_INTERVAL_MS")?.map(Duration::from_millis);
        let debug = parse_bool_var("GUNSOLE_DEBUG")?.unwrap_or(false);

        Ok(Self {
            project_id: read_var("GUNSOLE_PROJECT_ID").unwrap_or_default(),
            api_key: read_var("GUNSOLE_API_KEY"),
            mode,
            endpoint: read_var("GUNSOLE_ENDPOINT"),
            env: read_var("GUNSOLE_ENV"),
            app_name: read_var("GUNSOLE_APP_NAME"),
            app_version: read_var("GUNSOLE_APP_VERSION"),
            batch_size,
            flush_interval,
            debug,
            ..Self::default()
        })
    }

    /// Validate and normalize into a complete configuration record.
    ///
    /// # Errors
    ///
    /// - `MissingProjectId` if `project_id` is empty
    /// - `InvalidEndpoint` if the resolved endpoint is not an absolute http(s) URL
    /// - `ReservedTagKey` if a default tag would shadow a record field
    /// - `InvalidValue` if batch size or flush interval are out of range
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let project_id = self.project_id.trim();
        if project_id.is_empty() {
            return Err(ConfigError::MissingProjectId);
        }

        if let Some(key) = self.default_tags.keys().find(|key| is_reserved_tag_key(key)) {
            return Err(ConfigError::ReservedTagKey(key.clone()));
        }

        let endpoint = resolve_endpoint(self.mode, self.endpoint.as_deref())?;
        let batch_size = validate_batch_size(self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE))?;
        let flush_interval = validate_flush_interval(
            self.flush_interval
                .unwrap_or(Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS)),
        )?;

        Ok(ResolvedConfig {
            project_id: project_id.to_string(),
            api_key: self.api_key.clone().filter(|key| !key.is_empty()),
            mode: self.mode,
            endpoint,
            env: self.env.clone().unwrap_or_default(),
            app_name: self.app_name.clone().unwrap_or_default(),
            app_version: self.app_version.clone().unwrap_or_default(),
            default_tags: self.default_tags.clone(),
            batch_size,
            flush_interval,
            debug: self.debug,
            buckets: self.buckets.clone(),
        })
    }
}

/// Fully-populated, immutable client configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub project_id: String,
    pub api_key: Option<String>,
    pub mode: ClientMode,
    /// Collector base URL without a trailing slash
    pub endpoint: String,
    pub env: String,
    pub app_name: String,
    pub app_version: String,
    pub default_tags: BTreeMap<String, String>,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub debug: bool,
    pub buckets: Vec<String>,
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("project_id", &self.project_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("mode", &self.mode)
            .field("endpoint", &self.endpoint)
            .field("env", &self.env)
            .field("app_name", &self.app_name)
            .field("app_version", &self.app_version)
            .field("default_tags", &self.default_tags)
            .field("batch_size", &self.batch_size)
            .field("flush_interval", &self.flush_interval)
            .field("debug", &self.debug)
            .field("buckets", &self.buckets)
            .finish()
    }
}

impl ResolvedConfig {
    /// Full URL of the log ingestion route.
    pub fn logs_url(&self) -> String {
        format!("{}/logs", self.endpoint)
    }
}

/// Resolve the collector base URL: an explicit override wins over the mode
/// default. The result carries no trailing slash.
pub fn resolve_endpoint(mode: ClientMode, custom: Option<&str>) -> Result<String, ConfigError> {
    let raw = match custom.map(str::trim) {
        Some(endpoint) if !endpoint.is_empty() => endpoint,
        _ => mode.default_endpoint(),
    };
    let endpoint = raw.trim_end_matches('/');

    let url = Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
        endpoint: raw.to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(ConfigError::InvalidEndpoint {
            endpoint: raw.to_string(),
            reason: "expected an absolute http(s) URL".to_string(),
        });
    }

    Ok(endpoint.to_string())
}

fn validate_batch_size(batch_size: usize) -> Result<usize, ConfigError> {
    if batch_size == 0 {
        return Err(ConfigError::InvalidValue {
            field: "batch_size".to_string(),
            message: "batch size must be greater than 0".to_string(),
        });
    }

    if batch_size > MAX_BATCH_SIZE {
        return Err(ConfigError::InvalidValue {
            field: "batch_size".to_string(),
            message: format!(
                "batch size {} exceeds maximum allowed ({})",
                batch_size, MAX_BATCH_SIZE
            ),
        });
    }

    Ok(batch_size)
}

fn validate_flush_interval(interval: Duration) -> Result<Duration, ConfigError> {
    if interval.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: "flush_interval".to_string(),
            message: "flush interval must be greater than 0".to_string(),
        });
    }

    if interval > MAX_FLUSH_INTERVAL {
        return Err(ConfigError::InvalidValue {
            field: "flush_interval".to_string(),
            message: format!(
                "flush interval {}ms exceeds maximum ({}ms)",
                interval.as_millis(),
                MAX_FLUSH_INTERVAL.as_millis()
            ),
        });
    }

    Ok(interval)
}

/// Read a variable, treating empty values as unset.
fn read_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match read_var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                message: format!("'{}' is not a valid number", value),
            }),
        None => Ok(None),
    }
}

fn parse_bool_var(name: &str) -> Result<Option<bool>, ConfigError> {
    match read_var(name) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                field: name.to_string(),
                message: format!("'{}' is not a valid boolean", value),
            }),
        },
        None => Ok(None),
    }
}
