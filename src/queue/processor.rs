//! Worker draining an [`OperationQueue`]

use super::{OperationQueue, PendingOperation};
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info};

const PROCESSOR_THREAD_NAME: &str = "index-processor";

/// Interval at which `stop(true)` re-checks the state
const STOP_POLL: Duration = Duration::from_millis(10);

/// Lifecycle of a processor; each instance runs at most once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Ready,
    Running,
    StopRequested,
    Stopped,
}

/// Executes queued operations one at a time
pub struct OperationProcessor {
    queue: Arc<OperationQueue>,
    state: Mutex<ProcessorState>,
    worker: Mutex<Option<ThreadId>>,
    poll: Duration,
    executed: AtomicU64,
    failed: AtomicU64,
}

impl std::fmt::Debug for OperationProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationProcessor")
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .field("executed", &self.executed_count())
            .field("failed", &self.failed_count())
            .finish()
    }
}

impl OperationProcessor {
    /// Create a processor polling `queue` every `poll`
    pub fn new(queue: Arc<OperationQueue>, poll: Duration) -> Self {
        Self {
            queue,
            state: Mutex::new(ProcessorState::Ready),
            worker: Mutex::new(None),
            poll,
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn with_config(queue: Arc<OperationQueue>, cfg: &IndexConfig) -> Self {
        Self::new(queue, cfg.processor_poll())
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.lock()
    }

    /// Operations that completed without error
    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Operations that returned an error or panicked
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Process operations on the calling thread until a stop is requested.
    ///
    /// Fails with `Error::InvalidState` unless the processor is `Ready`.
    pub fn run(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ProcessorState::Ready {
                return Err(Error::InvalidState(format!(
                    "Operation processor cannot run in state {:?}",
                    *state
                )));
            }
            *state = ProcessorState::Running;
            *self.worker.lock() = Some(thread::current().id());
        }
        info!(poll_ms = self.poll.as_millis() as u64, "Operation processor started");

        while self.state() == ProcessorState::Running {
            if let Some(operation) = self.queue.dequeue(self.poll) {
                self.execute(operation);
            }
        }

        *self.state.lock() = ProcessorState::Stopped;
        info!(
            executed = self.executed_count(),
            failed = self.failed_count(),
            "Operation processor stopped"
        );
        Ok(())
    }

    fn execute(&self, operation: Box<dyn PendingOperation>) {
        let kind = operation.kind();
        match catch_unwind(AssertUnwindSafe(move || operation.execute())) {
            Ok(Ok(())) => {
                self.executed.fetch_add(1, Ordering::Relaxed);
                debug!(operation = kind, "Executed operation");
            }
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(operation = kind, error = %e, "Operation failed");
            }
            Err(panic) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(operation = kind, panic = %message, "Operation panicked");
            }
        }
    }

    /// Ask the processor to stop; with `wait`, block until it has stopped.
    ///
    /// Called from an operation on the processor thread, it never waits: the
    /// loop stops after that operation returns.
    pub fn stop(&self, wait: bool) {
        {
            let mut state = self.state.lock();
            match *state {
                ProcessorState::Running => *state = ProcessorState::StopRequested,
                ProcessorState::Ready => *state = ProcessorState::Stopped,
                ProcessorState::StopRequested | ProcessorState::Stopped => {}
            }
        }
        let on_worker = *self.worker.lock() == Some(thread::current().id());
        if wait && !on_worker {
            while self.state() != ProcessorState::Stopped {
                thread::sleep(STOP_POLL);
            }
        }
    }

    /// Run on a dedicated thread
    pub fn spawn(self: Arc<Self>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(PROCESSOR_THREAD_NAME.into())
            .spawn(move || {
                if let Err(e) = self.run() {
                    error!(error = %e, "Operation processor did not start");
                }
            })
            .map_err(|e| Error::Storage(format!("Failed to spawn processor thread: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Step {
        log: Arc<Mutex<Vec<usize>>>,
        n: usize,
    }

    impl PendingOperation for Step {
        fn kind(&self) -> &'static str {
            "step"
        }

        fn execute(self: Box<Self>) -> Result<()> {
            self.log.lock().push(self.n);
            Ok(())
        }
    }

    struct Failing {
        panic: bool,
        attempts: Arc<AtomicUsize>,
    }

    impl PendingOperation for Failing {
        fn kind(&self) -> &'static str {
            "failing"
        }

        fn execute(self: Box<Self>) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("operation blew up");
            }
            Err(Error::Storage("write refused".to_string()))
        }
    }

    fn wait_until_drained(processor: &OperationProcessor, expected: u64) {
        for _ in 0..500 {
            if processor.executed_count() + processor.failed_count() >= expected {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_executes_in_order_and_survives_failures() -> Result<()> {
        let queue = Arc::new(OperationQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::new(AtomicUsize::new(0));

        queue.enqueue(Box::new(Step { log: log.clone(), n: 1 }));
        queue.enqueue(Box::new(Failing {
            panic: false,
            attempts: attempts.clone(),
        }));
        queue.enqueue(Box::new(Step { log: log.clone(), n: 2 }));
        queue.enqueue(Box::new(Failing {
            panic: true,
            attempts: attempts.clone(),
        }));
        queue.enqueue(Box::new(Step { log: log.clone(), n: 3 }));

        let processor = Arc::new(OperationProcessor::new(queue, Duration::from_millis(5)));
        let handle = Arc::clone(&processor).spawn()?;
        wait_until_drained(&processor, 5);

        processor.stop(true);
        assert_eq!(processor.state(), ProcessorState::Stopped);
        handle.join().ok();

        assert_eq!(*log.lock(), vec![1, 2, 3]);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(processor.executed_count(), 3);
        assert_eq!(processor.failed_count(), 2);
        Ok(())
    }

    #[test]
    fn test_run_only_once() -> Result<()> {
        let processor = Arc::new(OperationProcessor::new(
            Arc::new(OperationQueue::new()),
            Duration::from_millis(5),
        ));
        let handle = Arc::clone(&processor).spawn()?;
        while processor.state() == ProcessorState::Ready {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(processor.run(), Err(Error::InvalidState(_))));

        processor.stop(true);
        handle.join().ok();
        assert!(matches!(processor.run(), Err(Error::InvalidState(_))));
        Ok(())
    }

    struct StopSelf {
        processor: Arc<Mutex<Option<Arc<OperationProcessor>>>>,
    }

    impl PendingOperation for StopSelf {
        fn kind(&self) -> &'static str {
            "stop-self"
        }

        fn execute(self: Box<Self>) -> Result<()> {
            if let Some(processor) = self.processor.lock().as_ref() {
                processor.stop(true);
            }
            Ok(())
        }
    }

    #[test]
    fn test_stop_from_own_operation() -> Result<()> {
        let queue = Arc::new(OperationQueue::new());
        let processor = Arc::new(OperationProcessor::new(
            Arc::clone(&queue),
            Duration::from_millis(5),
        ));
        let slot = Arc::new(Mutex::new(Some(Arc::clone(&processor))));
        queue.enqueue(Box::new(StopSelf {
            processor: Arc::clone(&slot),
        }));

        let handle = Arc::clone(&processor).spawn()?;
        handle.join().ok();
        slot.lock().take();

        assert_eq!(processor.state(), ProcessorState::Stopped);
        assert_eq!(processor.executed_count(), 1);
        Ok(())
    }

    #[test]
    fn test_stop_before_run() {
        let processor = OperationProcessor::new(Arc::new(OperationQueue::new()), Duration::from_millis(5));
        processor.stop(true);
        assert_eq!(processor.state(), ProcessorState::Stopped);
        assert!(processor.run().is_err());
    }
}
