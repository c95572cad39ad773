//! Threading backends: worker threads plus the mutex/condition pair that
//! hands reports from a handle's reader thread to its callers.

use crate::error::{Error, Result};
use crate::io_failure;
use crate::platform::ThreadModel;
use crate::poll::Timeout;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

pub mod native;
pub mod portable;

pub use native::NativeThreads;
pub use portable::PortableThreads;

/// Thread and synchronisation primitives behind one contract.
pub trait ThreadBackend: Send + Sync + std::fmt::Debug {
    fn model(&self) -> ThreadModel;

    /// Start a named worker thread.
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send + 'static>) -> Result<Worker>;

    /// Create a report queue guarded by this backend's lock and condition.
    fn mailbox(&self, capacity: usize) -> Arc<dyn Mailbox>;
}

/// Bounded FIFO of reports shared between a reader thread and callers.
///
/// Locking is exclusive and non-reentrant. A waiting `recv` releases the lock
/// atomically with going to sleep, so a `push` or `close` between the check
/// and the wait cannot be missed.
pub trait Mailbox: Send + Sync {
    /// Queue a report, dropping the oldest when full. Returns false once the
    /// mailbox is closed or failed.
    fn push(&self, report: Vec<u8>) -> bool;

    /// Take the oldest report. `Ok(None)` when the timeout elapses first.
    fn recv(&self, timeout: Timeout) -> Result<Option<Vec<u8>>>;

    /// Record a reader failure. Queued reports are still delivered; after
    /// them every `recv` returns the error.
    fn fail(&self, error: Error);

    /// Wake every waiter; all later `recv` calls fail with `HandleClosed`.
    fn close(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A running worker thread.
#[derive(Debug)]
pub struct Worker {
    name: String,
    handle: std::thread::JoinHandle<()>,
}

impl Worker {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when called from the worker thread itself.
    pub fn is_current(&self) -> bool {
        self.handle.thread().id() == std::thread::current().id()
    }

    /// Wait for the worker to finish. A panicked worker is an I/O failure.
    pub fn join(self) -> Result<()> {
        let name = self.name;
        self.handle
            .join()
            .map_err(|_| io_failure!("worker '{name}' panicked"))?;
        debug!(worker = %name, "Worker joined");
        Ok(())
    }
}

pub(crate) fn spawn_named(name: &str, body: Box<dyn FnOnce() + Send + 'static>) -> Result<Worker> {
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| io_failure!("spawn worker '{name}': {e}"))?;
    debug!(worker = name, "Worker started");
    Ok(Worker {
        name: name.to_string(),
        handle,
    })
}

/// Queue state shared by both mailbox implementations; only the lock and
/// condition around it differ.
#[derive(Debug)]
pub(crate) struct QueueState {
    reports: VecDeque<Vec<u8>>,
    capacity: usize,
    closed: bool,
    failure: Option<Error>,
    dropped: u64,
}

impl QueueState {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            reports: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
            failure: None,
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, report: Vec<u8>) -> bool {
        if self.closed || self.failure.is_some() {
            return false;
        }
        if self.reports.len() == self.capacity {
            self.reports.pop_front();
            self.dropped += 1;
            warn!(
                capacity = self.capacity,
                dropped = self.dropped,
                "Report queue full, dropped oldest report"
            );
        }
        self.reports.push_back(report);
        true
    }

    /// `None` means the caller has to wait.
    pub(crate) fn take(&mut self) -> Option<Result<Vec<u8>>> {
        if self.closed {
            return Some(Err(Error::HandleClosed));
        }
        if let Some(report) = self.reports.pop_front() {
            return Some(Ok(report));
        }
        self.failure.clone().map(Err)
    }

    pub(crate) fn fail(&mut self, error: Error) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.reports.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.reports.len()
    }
}

/// The backend of the given model. Both models are available on every host.
pub fn backend(model: ThreadModel) -> Arc<dyn ThreadBackend> {
    match model {
        ThreadModel::Posix => Arc::new(PortableThreads),
        ThreadModel::Native => Arc::new(NativeThreads),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn backends() -> Vec<Arc<dyn ThreadBackend>> {
        vec![backend(ThreadModel::Posix), backend(ThreadModel::Native)]
    }

    #[test]
    fn factory_returns_requested_model() {
        assert_eq!(backend(ThreadModel::Posix).model(), ThreadModel::Posix);
        assert_eq!(backend(ThreadModel::Native).model(), ThreadModel::Native);
    }

    #[test]
    fn mailbox_is_fifo() {
        for threads in backends() {
            let mailbox = threads.mailbox(8);
            for i in 0..5u8 {
                assert!(mailbox.push(vec![i]));
            }
            assert_eq!(mailbox.len(), 5);
            for i in 0..5u8 {
                assert_eq!(mailbox.recv(Timeout::Immediate).unwrap(), Some(vec![i]));
            }
            assert!(mailbox.is_empty());
        }
    }

    #[test]
    fn empty_recv_with_zero_timeout_returns_none() {
        for threads in backends() {
            let mailbox = threads.mailbox(4);
            let start = Instant::now();
            assert_eq!(mailbox.recv(Timeout::Immediate).unwrap(), None);
            assert!(start.elapsed() < Duration::from_millis(50));
        }
    }

    #[test]
    fn timed_recv_waits_full_timeout() {
        for threads in backends() {
            let mailbox = threads.mailbox(4);
            let start = Instant::now();
            let got = mailbox
                .recv(Timeout::After(Duration::from_millis(40)))
                .unwrap();
            assert_eq!(got, None);
            assert!(start.elapsed() >= Duration::from_millis(40));
        }
    }

    #[test]
    fn full_queue_drops_oldest() {
        for threads in backends() {
            let mailbox = threads.mailbox(3);
            for i in 0..5u8 {
                mailbox.push(vec![i]);
            }
            assert_eq!(mailbox.len(), 3);
            assert_eq!(mailbox.recv(Timeout::Immediate).unwrap(), Some(vec![2]));
        }
    }

    #[test]
    fn push_wakes_blocked_receiver() {
        for threads in backends() {
            let mailbox = threads.mailbox(4);
            let receiver = {
                let mailbox = Arc::clone(&mailbox);
                std::thread::spawn(move || mailbox.recv(Timeout::Infinite))
            };
            std::thread::sleep(Duration::from_millis(20));
            mailbox.push(vec![0xAB]);
            assert_eq!(receiver.join().unwrap().unwrap(), Some(vec![0xAB]));
        }
    }

    #[test]
    fn close_wakes_every_blocked_receiver() {
        for threads in backends() {
            let mailbox = threads.mailbox(4);
            let receivers: Vec<_> = (0..3)
                .map(|_| {
                    let mailbox = Arc::clone(&mailbox);
                    std::thread::spawn(move || mailbox.recv(Timeout::Infinite))
                })
                .collect();
            std::thread::sleep(Duration::from_millis(20));
            mailbox.close();

            for receiver in receivers {
                let err = receiver.join().unwrap().unwrap_err();
                assert_eq!(err.kind(), ErrorKind::HandleClosed);
            }
            assert!(!mailbox.push(vec![1]));
        }
    }

    #[test]
    fn close_discards_queued_reports() {
        for threads in backends() {
            let mailbox = threads.mailbox(4);
            mailbox.push(vec![1]);
            mailbox.close();
            assert_eq!(mailbox.recv(Timeout::Immediate).unwrap_err(), Error::HandleClosed);
        }
    }

    #[test]
    fn failure_surfaces_after_queued_reports() {
        for threads in backends() {
            let mailbox = threads.mailbox(4);
            mailbox.push(vec![1]);
            mailbox.fail(Error::Io("device unplugged".into()));

            assert_eq!(mailbox.recv(Timeout::Immediate).unwrap(), Some(vec![1]));
            for _ in 0..2 {
                let err = mailbox.recv(Timeout::Infinite).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::IoFailure);
            }
            assert!(!mailbox.push(vec![2]));
        }
    }

    #[test]
    fn spawn_and_join_runs_body() {
        for threads in backends() {
            let counter = Arc::new(AtomicUsize::new(0));
            let worker = {
                let counter = Arc::clone(&counter);
                threads
                    .spawn(
                        "test-worker",
                        Box::new(move || {
                            assert_eq!(std::thread::current().name(), Some("test-worker"));
                            counter.fetch_add(1, Ordering::SeqCst);
                        }),
                    )
                    .unwrap()
            };
            assert_eq!(worker.name(), "test-worker");
            assert!(!worker.is_current());
            worker.join().unwrap();
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn panicked_worker_is_io_failure() {
        let worker = backend(ThreadModel::Posix)
            .spawn("doomed", Box::new(|| panic!("worker body failed")))
            .unwrap();
        assert_eq!(worker.join().unwrap_err().kind(), ErrorKind::IoFailure);
    }
}
