//! Named sub-loggers bound to a fixed bucket.
//!
//! Bucket loggers are built once, when the client is created, and looked up
//! by name through [`Gunsole::bucket`](crate::Gunsole::bucket). Names that
//! would shadow a client method are rejected up front.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::client::ClientCore;
use crate::config::ConfigError;
use crate::entry::{LogLevel, LogOptions};

/// Bucket names that conflict with client methods.
pub const RESERVED_BUCKET_NAMES: &[&str] = &[
    "log",
    "info",
    "debug",
    "warn",
    "error",
    "setUser",
    "setSessionId",
    "flush",
    "destroy",
    "attachGlobalErrorHandlers",
    "detachGlobalErrorHandlers",
    "set_user",
    "set_session_id",
    "attach_global_error_handlers",
    "detach_global_error_handlers",
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_BUCKET_NAMES.contains(&name)
}

/// Check every requested bucket name, failing on the first bad one.
pub fn validate_bucket_names(names: &[String]) -> Result<(), ConfigError> {
    for name in names {
        if name.is_empty() {
            return Err(ConfigError::EmptyBucketName);
        }
        if is_reserved(name) {
            return Err(ConfigError::ReservedBucketName(name.clone()));
        }
    }
    Ok(())
}

/// Options for bucket logging calls; message and bucket are implied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketLogOptions {
    pub context: Option<HashMap<String, Value>>,
    pub tags: BTreeMap<String, String>,
    pub trace_id: Option<String>,
}

impl BucketLogOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    fn into_log_options(self, message: String, bucket: &str) -> LogOptions {
        LogOptions {
            message,
            bucket: bucket.to_string(),
            context: self.context,
            tags: self.tags,
            trace_id: self.trace_id,
        }
    }
}

/// A logger bound to one bucket.
#[derive(Clone)]
pub struct BucketLogger {
    name: String,
    core: Arc<ClientCore>,
}

impl BucketLogger {
    pub(crate) fn new(name: String, core: Arc<ClientCore>) -> Self {
        Self { name, core }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Log at info level.
    pub fn log(&self, message: impl Into<String>, options: impl Into<Option<BucketLogOptions>>) {
        self.log_at(LogLevel::Info, message.into(), options.into());
    }

    pub fn info(&self, message: impl Into<String>, options: impl Into<Option<BucketLogOptions>>) {
        self.log_at(LogLevel::Info, message.into(), options.into());
    }

    pub fn debug(&self, message: impl Into<String>, options: impl Into<Option<BucketLogOptions>>) {
        self.log_at(LogLevel::Debug, message.into(), options.into());
    }

    pub fn warn(&self, message: impl Into<String>, options: impl Into<Option<BucketLogOptions>>) {
        self.log_at(LogLevel::Warn, message.into(), options.into());
    }

    pub fn error(&self, message: impl Into<String>, options: impl Into<Option<BucketLogOptions>>) {
        self.log_at(LogLevel::Error, message.into(), options.into());
    }

    fn log_at(&self, level: LogLevel, message: String, options: Option<BucketLogOptions>) {
        let options = options.unwrap_or_default().into_log_options(message, &self.name);
        self.core.log(level, options);
    }
}

impl fmt::Debug for BucketLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketLogger").field("name", &self.name).finish()
    }
}
