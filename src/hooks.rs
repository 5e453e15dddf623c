//! Host error-reporting surface.
//!
//! The client's global error handlers register listeners here, one per
//! [`ErrorCategory`]. [`ProcessErrorSurface`] is the process-wide default:
//! panics are picked up by a chained panic hook, and failed detached async
//! work is reported explicitly through [`report_unhandled_rejection`].

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

/// Kind of host-level failure a listener is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Detached async work failed and nobody observed the failure
    UnhandledRejection,

    /// Synchronous failure escaping to the top level (a panic)
    UncaughtError,
}

/// What a listener is told about a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub message: String,

    /// `file:line:column` of a panic, when known
    pub location: Option<String>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }
}

pub type ErrorListener = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

/// Handle returned by [`ErrorSurface::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// For custom [`ErrorSurface`] implementations minting their own ids.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Registration point for host error listeners.
pub trait ErrorSurface: Send + Sync {
    fn register(&self, category: ErrorCategory, listener: ErrorListener) -> ListenerId;

    /// Remove a listener. Returns `false` if it was not registered.
    fn unregister(&self, category: ErrorCategory, id: ListenerId) -> bool;
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<ErrorCategory, Vec<(ListenerId, ErrorListener)>>,
    panic_hook_installed: bool,
}

impl Registry {
    fn insert(&mut self, category: ErrorCategory, listener: ErrorListener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.entry(category).or_default().push((id, listener));
        id
    }

    fn remove(&mut self, category: ErrorCategory, id: ListenerId) -> bool {
        let Some(listeners) = self.listeners.get_mut(&category) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn snapshot(&self, category: ErrorCategory) -> Vec<ErrorListener> {
        self.listeners
            .get(&category)
            .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }

    fn count(&self, category: ErrorCategory) -> usize {
        self.listeners.get(&category).map_or(0, Vec::len)
    }
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

fn with_registry<T>(f: impl FnOnce(&mut Registry) -> T) -> T {
    // A panicking listener must not disable the surface for everyone else.
    let mut guard = registry().lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

/// Process-wide error surface backed by the panic hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessErrorSurface;

impl ProcessErrorSurface {
    /// Number of listeners currently registered for a category.
    pub fn listener_count(category: ErrorCategory) -> usize {
        with_registry(|registry| registry.count(category))
    }
}

impl ErrorSurface for ProcessErrorSurface {
    fn register(&self, category: ErrorCategory, listener: ErrorListener) -> ListenerId {
        let (id, install_hook) = with_registry(|registry| {
            let id = registry.insert(category, listener);
            let install =
                category == ErrorCategory::UncaughtError && !registry.panic_hook_installed;
            if install {
                registry.panic_hook_installed = true;
            }
            (id, install)
        });

        if install_hook {
            init_panic_hook();
        }
        id
    }

    fn unregister(&self, category: ErrorCategory, id: ListenerId) -> bool {
        with_registry(|registry| registry.remove(category, id))
    }
}

/// Chain a hook in front of whatever hook is installed. It stays installed
/// for the life of the process; with no listeners it only forwards.
fn init_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "Box<dyn Any>".to_string());
        let report = ErrorReport {
            message,
            location: panic_info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
        };

        if !in_containment() {
            dispatch(ErrorCategory::UncaughtError, &report);
        }
        original_hook(panic_info);
    }));
}

thread_local! {
    static CONTAINMENT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn in_containment() -> bool {
    CONTAINMENT_DEPTH.with(|depth| depth.get() > 0)
}

struct ContainmentGuard;

impl ContainmentGuard {
    fn enter() -> Self {
        CONTAINMENT_DEPTH.with(|depth| depth.set(depth.get() + 1));
        ContainmentGuard
    }
}

impl Drop for ContainmentGuard {
    fn drop(&mut self) {
        CONTAINMENT_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Run `f` with panics on this thread hidden from `UncaughtError` listeners.
/// The caller is responsible for catching them; the previous hook still runs.
pub(crate) fn contained<T>(f: impl FnOnce() -> T) -> T {
    let _guard = ContainmentGuard::enter();
    f()
}

/// Future adapter applying [`contained`] to every poll, so a panic inside a
/// task whose `JoinError` the client observes is not reported as uncaught.
pub(crate) struct Contained<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Contained<F> {
    pub(crate) fn new(inner: F) -> Self {
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<F: Future> Future for Contained<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.as_mut();
        contained(|| inner.poll(cx))
    }
}

/// Report a failure of detached async work (for example a `JoinError` the
/// host did not otherwise handle) to the `UnhandledRejection` listeners.
pub fn report_unhandled_rejection(reason: impl fmt::Display) {
    dispatch(
        ErrorCategory::UnhandledRejection,
        &ErrorReport::new(reason.to_string()),
    );
}

fn dispatch(category: ErrorCategory, report: &ErrorReport) {
    // Listeners run outside the lock so they may register or unregister.
    let listeners = with_registry(|registry| registry.snapshot(category));
    for listener in listeners {
        listener(report);
    }
}
