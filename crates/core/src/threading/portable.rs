//! Portable backend: `parking_lot` lock and condition variable.

use super::{spawn_named, Mailbox, QueueState, ThreadBackend, Worker};
use crate::error::{Error, Result};
use crate::platform::ThreadModel;
use crate::poll::{Deadline, Timeout};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

/// [`ThreadModel::Posix`]: portable user-space primitives.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortableThreads;

impl ThreadBackend for PortableThreads {
    fn model(&self) -> ThreadModel {
        ThreadModel::Posix
    }

    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send + 'static>) -> Result<Worker> {
        spawn_named(name, body)
    }

    fn mailbox(&self, capacity: usize) -> Arc<dyn Mailbox> {
        Arc::new(PortableMailbox {
            state: Mutex::new(QueueState::new(capacity)),
            ready: Condvar::new(),
        })
    }
}

struct PortableMailbox {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Mailbox for PortableMailbox {
    fn push(&self, report: Vec<u8>) -> bool {
        let queued = self.state.lock().push(report);
        if queued {
            self.ready.notify_one();
        }
        queued
    }

    fn recv(&self, timeout: Timeout) -> Result<Option<Vec<u8>>> {
        let deadline = Deadline::after(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.take() {
                return outcome.map(Some);
            }
            match deadline.at() {
                None => self.ready.wait(&mut state),
                Some(at) => {
                    if Instant::now() >= at {
                        return Ok(None);
                    }
                    self.ready.wait_until(&mut state, at);
                }
            }
        }
    }

    fn fail(&self, error: Error) {
        self.state.lock().fail(error);
        self.ready.notify_all();
    }

    fn close(&self) {
        self.state.lock().close();
        self.ready.notify_all();
    }

    fn len(&self) -> usize {
        self.state.lock().len()
    }
}
