//! Buffer module for accumulating log records and scheduling flushes.
//!
//! [`BatchBuffer`] holds the live batch. Detaching it for delivery is a
//! single swap under the lock, so records logged while a send is in flight
//! land in a fresh batch. [`FlushScheduler`] is the ticking task that drives
//! time-based flushes.

use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::entry::LogEntry;

/// What caused a batch to be detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Buffer reached the batch size threshold
    Size,
    /// Flush timer ticked
    Timer,
    /// Explicit `flush()` call
    Manual,
    /// Final drain during `destroy()`
    Teardown,
}

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Total number of logs accepted into the buffer
    pub logs_received: u64,

    /// Batches detached because the size threshold was reached
    pub size_flushes: u64,

    /// Batches detached by the flush timer
    pub timer_flushes: u64,

    /// Batches detached by `flush()` or `destroy()`
    pub manual_flushes: u64,

    /// Logs rejected because the client had been destroyed
    pub logs_discarded_after_destroy: u64,
}

#[derive(Default)]
struct BufferState {
    entries: Vec<LogEntry>,
    stats: BufferStats,
}

/// Ordered buffer of records awaiting delivery.
pub struct BatchBuffer {
    state: Mutex<BufferState>,
    batch_size: usize,
}

impl BatchBuffer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                entries: Vec::with_capacity(batch_size),
                stats: BufferStats::default(),
            }),
            batch_size,
        }
    }

    /// Append a record.
    ///
    /// When this push makes the buffer reach the batch size, the whole batch
    /// is detached and returned for delivery; the caller owns sending it.
    pub fn push(&self, entry: LogEntry) -> Option<Vec<LogEntry>> {
        let mut state = self.lock();
        state.stats.logs_received += 1;
        state.entries.push(entry);

        if state.entries.len() >= self.batch_size {
            state.stats.size_flushes += 1;
            debug!(
                batch_size = state.entries.len(),
                "Flushing buffer: batch size threshold reached"
            );
            return Some(self.take(&mut state));
        }
        None
    }

    /// Detach everything buffered so far.
    ///
    /// Returns `None` when the buffer is empty, which makes a flush on an
    /// empty buffer a no-op.
    pub fn drain(&self, trigger: FlushTrigger) -> Option<Vec<LogEntry>> {
        let mut state = self.lock();
        if state.entries.is_empty() {
            trace!(?trigger, "Flush skipped: buffer empty");
            return None;
        }

        match trigger {
            FlushTrigger::Size => state.stats.size_flushes += 1,
            FlushTrigger::Timer => state.stats.timer_flushes += 1,
            FlushTrigger::Manual | FlushTrigger::Teardown => state.stats.manual_flushes += 1,
        }
        debug!(batch_size = state.entries.len(), ?trigger, "Flushing buffer");
        Some(self.take(&mut state))
    }

    /// Count a record dropped because the owning client is terminal.
    pub fn record_discarded(&self) {
        self.lock().stats.logs_discarded_after_destroy += 1;
    }

    fn take(&self, state: &mut BufferState) -> Vec<LogEntry> {
        std::mem::replace(&mut state.entries, Vec::with_capacity(self.batch_size))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        // Every critical section is a push or a swap; a poisoned lock still
        // holds a consistent Vec.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the current number of logs in the buffer.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Get current buffer statistics.
    pub fn stats(&self) -> BufferStats {
        self.lock().stats.clone()
    }
}

/// Repeating flush timer running as a tokio task.
///
/// The first tick fires one full period after start. The task ends when
/// [`stop`](Self::stop) is called, when the scheduler is dropped, or when the
/// tick callback returns `false`.
pub struct FlushScheduler {
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    period: Duration,
}

impl FlushScheduler {
    pub fn start<F>(runtime: &Handle, period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Skip the first immediate tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !on_tick() {
                            debug!("Flush timer owner gone, stopping");
                            break;
                        }
                    }
                    _ = &mut stop_rx => {
                        debug!("Flush timer stopped");
                        break;
                    }
                }
            }
        });

        Self {
            stop_tx: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
            period,
        }
    }

    /// Stop the timer. Idempotent.
    pub fn stop(&self) {
        let stop_tx = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::entry::{Identity, LogLevel, LogOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn create_test_entry(message: &str) -> LogEntry {
        let config = ClientConfig::new("p").resolve().unwrap();
        LogEntry::build(
            LogLevel::Info,
            LogOptions::new(message, "test"),
            &config,
            &Identity::default(),
        )
    }

    #[test]
    fn test_push_detaches_at_threshold() {
        let buffer = BatchBuffer::new(3);

        assert!(buffer.push(create_test_entry("a")).is_none());
        assert!(buffer.push(create_test_entry("b")).is_none());
        let batch = buffer.push(create_test_entry("c")).expect("threshold reached");

        let messages: Vec<&str> = batch.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().size_flushes, 1);
    }

    #[test]
    fn test_threshold_crossed_once_per_batch() {
        let buffer = BatchBuffer::new(2);
        let detached: Vec<usize> = (0..7)
            .filter_map(|i| buffer.push(create_test_entry(&i.to_string())))
            .map(|batch| batch.len())
            .collect();

        assert_eq!(detached, vec![2, 2, 2]);
        assert_eq!(buffer.len(), 1);
        let stats = buffer.stats();
        assert_eq!(stats.logs_received, 7);
        assert_eq!(stats.size_flushes, 3);
    }

    #[test]
    fn test_drain_empty_is_noop() {
        let buffer = BatchBuffer::new(10);
        assert!(buffer.drain(FlushTrigger::Timer).is_none());
        assert_eq!(buffer.stats(), BufferStats::default());
    }

    #[test]
    fn test_drain_resets_buffer() {
        let buffer = BatchBuffer::new(10);
        buffer.push(create_test_entry("first"));
        let batch = buffer.drain(FlushTrigger::Manual).unwrap();
        assert_eq!(batch.len(), 1);

        // New records start a new batch, the detached one is untouched
        buffer.push(create_test_entry("second"));
        assert_eq!(batch[0].message, "first");
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.stats().manual_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_ticks_after_each_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();

        let period = Duration::from_millis(100);
        let scheduler = FlushScheduler::start(&Handle::current(), period, move || {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_running());

        scheduler.stop();
        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_exits_when_callback_declines() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();

        let period = Duration::from_millis(10);
        let _scheduler = FlushScheduler::start(&Handle::current(), period, move || {
            ticks_clone.fetch_add(1, Ordering::SeqCst) < 1
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }
}
