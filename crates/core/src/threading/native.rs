//! Native backend: the standard library's lock and condition variable, which
//! sit directly on the host OS objects (futex, SRWLOCK/CONDITION_VARIABLE,
//! pthread).

use super::{spawn_named, Mailbox, QueueState, ThreadBackend, Worker};
use crate::error::{Error, Result};
use crate::platform::ThreadModel;
use crate::poll::{Deadline, Timeout};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// [`ThreadModel::Native`]: host OS synchronisation objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeThreads;

impl ThreadBackend for NativeThreads {
    fn model(&self) -> ThreadModel {
        ThreadModel::Native
    }

    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send + 'static>) -> Result<Worker> {
        spawn_named(name, body)
    }

    fn mailbox(&self, capacity: usize) -> Arc<dyn Mailbox> {
        Arc::new(NativeMailbox {
            state: Mutex::new(QueueState::new(capacity)),
            ready: Condvar::new(),
        })
    }
}

struct NativeMailbox {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl NativeMailbox {
    // Queue state is only ever mutated through complete QueueState calls, so
    // a panic elsewhere cannot leave it half-updated.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Mailbox for NativeMailbox {
    fn push(&self, report: Vec<u8>) -> bool {
        let queued = self.lock().push(report);
        if queued {
            self.ready.notify_one();
        }
        queued
    }

    fn recv(&self, timeout: Timeout) -> Result<Option<Vec<u8>>> {
        let deadline = Deadline::after(timeout);
        let mut state = self.lock();
        loop {
            if let Some(outcome) = state.take() {
                return outcome.map(Some);
            }
            state = match deadline.at() {
                None => self
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return Ok(None);
                    }
                    self.ready
                        .wait_timeout(state, at - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn fail(&self, error: Error) {
        self.lock().fail(error);
        self.ready.notify_all();
    }

    fn close(&self) {
        self.lock().close();
        self.ready.notify_all();
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}
