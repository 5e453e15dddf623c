//! Gunsole client library
//!
//! Application code calls the logging methods on [`Gunsole`]; records are
//! buffered in memory and shipped as gzip-compressed batches to a collector.
//! Delivery is best-effort and a failure never reaches the host application.
//!
//! - **config**: Validated, defaulted client configuration (also from env)
//! - **entry**: Log records, tag merging and the wire payload
//! - **buffer**: Batch buffer with size and timer-driven flush triggers
//! - **transport**: HTTP delivery with retry, backoff and per-attempt timeout
//! - **hooks**: Host error surface used by the global error handlers
//! - **client**: The public facade and its error containment
//! - **buckets**: Named sub-loggers bound to a fixed bucket
//!
//! # Example
//!
//! ```no_run
//! use gunsole::{ClientConfig, ClientMode, Gunsole, LogLevel, LogOptions, UserInfo};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = ClientConfig::from_env().expect("Failed to load config");
//!
//!     let client = Gunsole::new(ClientConfig {
//!         mode: ClientMode::Local,
//!         ..config
//!     })
//!     .expect("Failed to create client");
//!
//!     client.set_user(UserInfo::new("user-42").email("user@example.com"));
//!     client.set_session_id("session-1");
//!     client.attach_global_error_handlers();
//!
//!     client.log(None, LogOptions::new("App started", "lifecycle"));
//!     client.log(LogLevel::Warn, LogOptions::new("Slow query", "db").context("ms", 950));
//!
//!     client.flush().await;
//!     client.destroy().await;
//! }
//! ```

// Module declarations
pub mod buckets;
pub mod buffer;
pub mod client;
pub mod config;
pub mod entry;
pub mod hooks;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use buckets::{BucketLogOptions, BucketLogger, RESERVED_BUCKET_NAMES};
pub use buffer::{BatchBuffer, BufferStats, FlushScheduler, FlushTrigger};
pub use client::{ClientError, ClientStats, Gunsole};
pub use config::{ClientConfig, ClientMode, ConfigError, ResolvedConfig};
pub use entry::{
    BatchPayload, Identity, LogEntry, LogLevel, LogOptions, UserInfo, RESERVED_TAG_KEYS,
};
pub use hooks::{
    report_unhandled_rejection, ErrorCategory, ErrorListener, ErrorReport, ErrorSurface,
    ListenerId, ProcessErrorSurface,
};
pub use transport::{
    DeliveryStats, HttpRequest, HttpResponse, HttpSender, ReqwestSender, RetryPolicy, Transport,
    TransportError,
};
