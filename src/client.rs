//! The public client facade.
//!
//! [`Gunsole`] composes the entry builder, the batch buffer, the flush timer
//! and the transport. Every public operation runs through one containment
//! wrapper: internal errors and panics are turned into diagnostic `tracing`
//! events and never reach the host application. Only configuration errors,
//! returned from [`Gunsole::new`], are surfaced.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buckets::{self, BucketLogger};
use crate::buffer::{BatchBuffer, BufferStats, FlushScheduler, FlushTrigger};
use crate::config::{ClientConfig, ConfigError, ResolvedConfig};
use crate::entry::{Identity, LogEntry, LogLevel, LogOptions, UserInfo};
use crate::hooks::{
    self, Contained, ErrorCategory, ErrorReport, ErrorSurface, ListenerId, ProcessErrorSurface,
};
use crate::transport::{DeliveryStats, HttpSender, ReqwestSender, Transport, TransportError};

/// Errors contained inside the client. They are reported to the diagnostic
/// channel, never returned.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("delivery failed: {0}")]
    Transport(#[from] TransportError),

    #[error("client has been destroyed")]
    Destroyed,

    #[error("internal panic: {0}")]
    Panicked(String),
}

/// Combined buffer and delivery statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub buffer: BufferStats,
    pub delivery: DeliveryStats,

    /// Logs currently waiting in the live buffer
    pub pending: usize,
}

#[derive(Default)]
struct GlobalHandlers {
    attached: bool,
    unhandled_rejection: Option<ListenerId>,
    uncaught_error: Option<ListenerId>,
}

/// Shared state behind a client and its bucket loggers.
pub(crate) struct ClientCore {
    config: ResolvedConfig,
    buffer: BatchBuffer,
    transport: Transport,
    identity: RwLock<Identity>,
    handlers: Mutex<GlobalHandlers>,
    surface: Arc<dyn ErrorSurface>,
    scheduler: OnceLock<FlushScheduler>,
    runtime: Handle,
    destroyed: AtomicBool,
}

impl ClientCore {
    /// Run a synchronous operation, containing both `Err` and panics.
    /// Contained panics are not seen by the global panic listeners.
    fn contain(&self, operation: &'static str, f: impl FnOnce() -> Result<(), ClientError>) {
        match hooks::contained(|| panic::catch_unwind(AssertUnwindSafe(f))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.report(operation, &e),
            Err(payload) => {
                self.report(operation, &ClientError::Panicked(panic_message(&*payload)))
            }
        }
    }

    /// The developer diagnostic channel. Debug mode raises the level so the
    /// event shows up under a default subscriber filter.
    fn report(&self, operation: &'static str, error: &ClientError) {
        if self.config.debug {
            warn!(operation = operation, error = %error, "[Gunsole] Error contained");
        } else {
            debug!(operation = operation, error = %error, "[Gunsole] Error contained");
        }
    }

    pub(crate) fn log(self: &Arc<Self>, level: LogLevel, options: LogOptions) {
        self.contain("log", || self.record(level, options));
    }

    /// Build a record, buffer it, and ship the batch if it just filled up.
    fn record(self: &Arc<Self>, level: LogLevel, options: LogOptions) -> Result<(), ClientError> {
        if self.destroyed.load(Ordering::Acquire) {
            self.buffer.record_discarded();
            return Err(ClientError::Destroyed);
        }

        let entry = {
            let identity = self.identity.read().unwrap_or_else(|e| e.into_inner());
            LogEntry::build(level, options, &self.config, &identity)
        };

        if let Some(batch) = self.buffer.push(entry) {
            self.dispatch(batch, "size_flush");
        }
        Ok(())
    }

    /// Send a detached batch on its own task. The returned handle may be
    /// awaited or dropped; the send runs to completion either way. A panic
    /// in the task is contained and never reaches the global listeners.
    fn dispatch(self: &Arc<Self>, batch: Vec<LogEntry>, operation: &'static str) -> JoinHandle<()> {
        let core = Arc::clone(self);
        self.runtime.spawn(Contained::new(async move {
            if let Err(e) = core.transport.send_batch(batch).await {
                core.report(operation, &ClientError::Transport(e));
            }
        }))
    }

    /// Detach the live buffer and wait for its delivery to finish.
    async fn flush(self: &Arc<Self>, trigger: FlushTrigger, operation: &'static str) {
        let mut batch = None;
        self.contain(operation, || {
            batch = self.buffer.drain(trigger);
            Ok(())
        });

        if let Some(batch) = batch {
            if let Err(e) = self.dispatch(batch, operation).await {
                self.report(operation, &ClientError::Panicked(e.to_string()));
            }
        }
    }

    fn on_timer_tick(self: &Arc<Self>) {
        self.contain("timer_flush", || {
            if let Some(batch) = self.buffer.drain(FlushTrigger::Timer) {
                self.dispatch(batch, "timer_flush");
            }
            Ok(())
        });
    }

    fn attach_global_error_handlers(self: &Arc<Self>) {
        self.contain("attach_global_error_handlers", || {
            let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            if handlers.attached {
                return Ok(());
            }

            let weak = Arc::downgrade(self);
            let rejection = self.surface.register(
                ErrorCategory::UnhandledRejection,
                Arc::new(move |report: &ErrorReport| {
                    if let Some(core) = weak.upgrade() {
                        core.log(
                            LogLevel::Error,
                            LogOptions::new("Unhandled async rejection", "unhandled_rejection")
                                .context("reason", report.message.clone()),
                        );
                    }
                }),
            );

            let weak = Arc::downgrade(self);
            let uncaught = self.surface.register(
                ErrorCategory::UncaughtError,
                Arc::new(move |report: &ErrorReport| {
                    if let Some(core) = weak.upgrade() {
                        let mut options =
                            LogOptions::new(report.message.clone(), "uncaught_exception");
                        if let Some(location) = &report.location {
                            options = options.context("location", location.clone());
                        }
                        core.log(LogLevel::Error, options);
                    }
                }),
            );

            *handlers = GlobalHandlers {
                attached: true,
                unhandled_rejection: Some(rejection),
                uncaught_error: Some(uncaught),
            };
            debug!("Global error handlers attached");
            Ok(())
        });
    }

    fn detach_global_error_handlers(&self) {
        self.contain("detach_global_error_handlers", || {
            self.detach_handlers();
            Ok(())
        });
    }

    fn stop_timer(&self) {
        if let Some(scheduler) = self.scheduler.get() {
            scheduler.stop();
        }
    }

    fn detach_handlers(&self) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if !handlers.attached {
            return;
        }

        if let Some(id) = handlers.unhandled_rejection.take() {
            self.surface.unregister(ErrorCategory::UnhandledRejection, id);
        }
        if let Some(id) = handlers.uncaught_error.take() {
            self.surface.unregister(ErrorCategory::UncaughtError, id);
        }
        *handlers = GlobalHandlers::default();
        debug!("Global error handlers detached");
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        self.stop_timer();
        self.detach_handlers();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Gunsole telemetry client.
///
/// Logging calls are synchronous and never block on the network: records
/// are buffered and shipped in batches when the buffer reaches the batch
/// size, when the flush timer ticks, or on [`flush`](Self::flush). Delivery
/// is best-effort; a batch that cannot be delivered is dropped.
///
/// # Example
///
/// ```no_run
/// use gunsole::{ClientConfig, ClientMode, Gunsole, LogOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), gunsole::ConfigError> {
///     let client = Gunsole::new(ClientConfig {
///         mode: ClientMode::Cloud,
///         api_key: Some("my-api-key".to_string()),
///         buckets: vec!["payment".to_string()],
///         ..ClientConfig::new("my-project")
///     })?;
///
///     client.info(LogOptions::new("User signed in", "auth").tag("plan", "pro"));
///     if let Some(payment) = client.bucket("payment") {
///         payment.error("Card declined", None);
///     }
///
///     client.destroy().await;
///     Ok(())
/// }
/// ```
pub struct Gunsole {
    core: Arc<ClientCore>,
    buckets: HashMap<String, BucketLogger>,
}

impl Gunsole {
    /// Create a client and start its flush timer.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid, a bucket name
    /// collides with a client method, no runtime is available, or the default
    /// HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let resolved = config.resolve()?;
        buckets::validate_bucket_names(&resolved.buckets)?;

        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        let sender: Arc<dyn HttpSender> = match config.http_sender {
            Some(sender) => sender,
            None => Arc::new(ReqwestSender::new().map_err(|e| ConfigError::InvalidValue {
                field: "http_sender".to_string(),
                message: e.to_string(),
            })?),
        };
        let surface: Arc<dyn ErrorSurface> = config
            .error_surface
            .unwrap_or_else(|| Arc::new(ProcessErrorSurface));

        let core = Arc::new(ClientCore {
            buffer: BatchBuffer::new(resolved.batch_size),
            transport: Transport::new(&resolved, sender),
            identity: RwLock::new(Identity::default()),
            handlers: Mutex::new(GlobalHandlers::default()),
            surface,
            scheduler: OnceLock::new(),
            runtime: runtime.clone(),
            destroyed: AtomicBool::new(false),
            config: resolved,
        });

        // Started only once the state is shared, so a failed upgrade always
        // means the client is gone.
        let timer_owner = Arc::downgrade(&core);
        let scheduler = FlushScheduler::start(&runtime, core.config.flush_interval, move || {
            match timer_owner.upgrade() {
                Some(core) => {
                    core.on_timer_tick();
                    true
                }
                None => false,
            }
        });
        let _ = core.scheduler.set(scheduler);

        let buckets = core
            .config
            .buckets
            .iter()
            .map(|name| (name.clone(), BucketLogger::new(name.clone(), core.clone())))
            .collect();

        info!(
            project_id = %core.config.project_id,
            endpoint = %core.config.endpoint,
            mode = %core.config.mode,
            batch_size = core.config.batch_size,
            flush_interval_ms = core.config.flush_interval.as_millis() as u64,
            "Gunsole client initialized"
        );

        Ok(Self { core, buckets })
    }

    /// Log at the given level; `None` means info.
    pub fn log(&self, level: impl Into<Option<LogLevel>>, options: LogOptions) {
        self.core.log(level.into().unwrap_or(LogLevel::Info), options);
    }

    pub fn info(&self, options: LogOptions) {
        self.core.log(LogLevel::Info, options);
    }

    pub fn debug(&self, options: LogOptions) {
        self.core.log(LogLevel::Debug, options);
    }

    pub fn warn(&self, options: LogOptions) {
        self.core.log(LogLevel::Warn, options);
    }

    pub fn error(&self, options: LogOptions) {
        self.core.log(LogLevel::Error, options);
    }

    /// Set the user attached to subsequent records.
    pub fn set_user(&self, user: UserInfo) {
        self.core.contain("set_user", || {
            self.core
                .identity
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .user = Some(user);
            Ok(())
        });
    }

    pub fn clear_user(&self) {
        self.core.contain("clear_user", || {
            self.core
                .identity
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .user = None;
            Ok(())
        });
    }

    /// Set the session id attached to subsequent records.
    pub fn set_session_id(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        self.core.contain("set_session_id", || {
            self.core
                .identity
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .session_id = Some(session_id);
            Ok(())
        });
    }

    pub fn clear_session_id(&self) {
        self.core.contain("clear_session_id", || {
            self.core
                .identity
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .session_id = None;
            Ok(())
        });
    }

    /// Snapshot of the identity that new records will carry.
    pub fn identity(&self) -> Identity {
        self.core
            .identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Ship everything buffered so far and wait for that delivery to finish.
    ///
    /// Never fails: delivery errors are contained. A flush on an empty buffer
    /// makes no network call. Dropping the returned future does not cancel
    /// a send that already started.
    pub async fn flush(&self) {
        self.core.flush(FlushTrigger::Manual, "flush").await;
    }

    /// Start recording panics and reported async failures as error logs.
    /// Calling it again while attached does nothing.
    pub fn attach_global_error_handlers(&self) {
        self.core.attach_global_error_handlers();
    }

    /// Remove exactly the listeners registered by
    /// [`attach_global_error_handlers`](Self::attach_global_error_handlers). Idempotent.
    pub fn detach_global_error_handlers(&self) {
        self.core.detach_global_error_handlers();
    }

    pub fn global_handlers_attached(&self) -> bool {
        self.core
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .attached
    }

    /// Tear the client down: stop the timer, detach global handlers, and
    /// deliver whatever is still buffered.
    ///
    /// Only this final batch is awaited; sends started by earlier flushes
    /// are not. The client is terminal afterwards and drops further logs.
    pub async fn destroy(&self) {
        let mut first_call = false;
        self.core.contain("destroy", || {
            first_call = !self.core.destroyed.swap(true, Ordering::AcqRel);
            if first_call {
                self.core.stop_timer();
                self.core.detach_handlers();
            }
            Ok(())
        });

        if first_call {
            self.core.flush(FlushTrigger::Teardown, "destroy").await;
            debug!("Gunsole client destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.destroyed.load(Ordering::Acquire)
    }

    /// The sub-logger for a configured bucket.
    pub fn bucket(&self, name: &str) -> Option<&BucketLogger> {
        self.buckets.get(name)
    }

    /// All configured bucket loggers.
    pub fn buckets(&self) -> impl Iterator<Item = &BucketLogger> {
        self.buckets.values()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            buffer: self.core.buffer.stats(),
            delivery: self.core.transport.stats(),
            pending: self.core.buffer.len(),
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.core.config
    }
}

impl std::fmt::Debug for Gunsole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gunsole")
            .field("config", &self.core.config)
            .field("buckets", &self.buckets.keys().collect::<Vec<_>>())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}
