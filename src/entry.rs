//! Log record types and the entry builder.
//!
//! Logging calls arrive as [`LogOptions`]; [`LogEntry::build`] turns them into
//! the immutable internal record that is buffered and shipped inside a
//! [`BatchPayload`].

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::ResolvedConfig;

/// Tag keys that would shadow a record field on the collector side.
pub const RESERVED_TAG_KEYS: &[&str] = &[
    "bucket",
    "message",
    "level",
    "timestamp",
    "userId",
    "sessionId",
    "env",
    "appName",
    "appVersion",
];

pub fn is_reserved_tag_key(key: &str) -> bool {
    RESERVED_TAG_KEYS.contains(&key)
}

/// Log severity levels accepted by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Debug,
    Warn,
    Error,
}

impl LogLevel {
    /// Get all possible log levels.
    pub fn all() -> &'static [LogLevel] {
        &[LogLevel::Info, LogLevel::Debug, LogLevel::Warn, LogLevel::Error]
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Arguments of a single logging call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogOptions {
    /// Human-readable message
    pub message: String,

    /// Bucket/category for the log
    pub bucket: String,

    /// Additional structured context
    pub context: Option<HashMap<String, Value>>,

    /// Per-call tags, merged over the configured default tags. Keys listed
    /// in [`RESERVED_TAG_KEYS`] are dropped.
    pub tags: BTreeMap<String, String>,

    /// Trace ID for distributed tracing
    pub trace_id: Option<String>,
}

impl LogOptions {
    pub fn new(message: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Add a single context value.
    pub fn context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Replace the whole context map.
    pub fn with_context(mut self, context: HashMap<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add tags from a map or a list of single `(key, value)` entries.
    /// Later entries win over earlier ones with the same key.
    pub fn tags<I, K, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.tags
            .extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Information about the current user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Unique user identifier
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Additional user traits
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub traits: HashMap<String, Value>,
}

impl UserInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn trait_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.traits.insert(key.into(), value.into());
        self
    }
}

/// Identity copied into each record at creation time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    pub user: Option<UserInfo>,
    pub session_id: Option<String>,
}

/// A fully-populated log record as sent to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub bucket: String,
    pub message: String,
    pub level: LogLevel,

    /// Unix timestamp in milliseconds (wall clock)
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<HashMap<String, Value>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

impl LogEntry {
    /// Build a record from a logging call.
    ///
    /// The identity is copied, not referenced: later `set_user` calls do not
    /// touch records that are already queued. Empty metadata strings from the
    /// config are left out of the record entirely.
    pub fn build(
        level: LogLevel,
        options: LogOptions,
        config: &ResolvedConfig,
        identity: &Identity,
    ) -> Self {
        Self {
            bucket: options.bucket,
            message: options.message,
            level,
            timestamp: Utc::now().timestamp_millis(),
            context: options.context,
            tags: merge_tags(&config.default_tags, options.tags),
            trace_id: options.trace_id,
            user_id: identity.user.as_ref().map(|user| user.id.clone()),
            session_id: identity.session_id.clone(),
            env: non_empty(&config.env),
            app_name: non_empty(&config.app_name),
            app_version: non_empty(&config.app_version),
        }
    }
}

/// Default tags overlaid with per-call tags; per-call wins on key collision.
/// Per-call tags with a reserved key are dropped.
pub fn merge_tags(
    defaults: &BTreeMap<String, String>,
    per_call: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = defaults.clone();
    for (key, value) in per_call {
        if is_reserved_tag_key(&key) {
            debug!(tag = %key, "Dropping tag with reserved key");
            continue;
        }
        merged.insert(key, value);
    }
    merged
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Request body for `POST <endpoint>/logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub project_id: String,
    pub logs: Vec<LogEntry>,
}

impl BatchPayload {
    pub fn new(project_id: impl Into<String>, logs: Vec<LogEntry>) -> Self {
        Self {
            project_id: project_id.into(),
            logs,
        }
    }

    /// Get the number of logs in the batch.
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}
