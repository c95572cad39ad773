//! Polling backends: one wait-for-event contract over two OS I/O models.
//!
//! A [`Poller`] belongs to a single device handle. It waits on that handle's
//! [`Waitable`] and on a private wake primitive, so that closing the handle
//! can interrupt a wait in progress.

use crate::error::{Error, Result};
use crate::platform::PollModel;
use std::time::{Duration, Instant};

#[cfg(windows)]
pub mod completion;
#[cfg(unix)]
pub mod readiness;

/// How long a wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until ready.
    Infinite,
    /// Do not block.
    Immediate,
    After(Duration),
}

impl Timeout {
    /// hidapi convention: negative blocks forever, zero polls.
    pub fn from_millis(ms: i32) -> Self {
        match ms {
            ms if ms < 0 => Timeout::Infinite,
            0 => Timeout::Immediate,
            ms => Timeout::After(Duration::from_millis(ms as u64)),
        }
    }

    /// Milliseconds for `poll(2)`-style calls, rounded up so a short
    /// positive timeout never turns into a non-blocking poll.
    pub fn as_millis_i32(&self) -> i32 {
        match self {
            Timeout::Infinite => -1,
            Timeout::Immediate => 0,
            Timeout::After(d) => ceil_millis(*d).min(i32::MAX as u128) as i32,
        }
    }
}

fn ceil_millis(d: Duration) -> u128 {
    let ms = d.as_millis();
    if Duration::from_millis(ms as u64) < d {
        ms + 1
    } else {
        ms
    }
}

/// A point in time a wait must give up at.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Timeout) -> Self {
        match timeout {
            Timeout::Infinite => Deadline(None),
            Timeout::Immediate => Deadline(Some(Instant::now())),
            Timeout::After(d) => Deadline(Instant::now().checked_add(d)),
        }
    }

    /// Time left, as a timeout for the next wait.
    pub(crate) fn remaining(&self) -> Timeout {
        match self.0 {
            None => Timeout::Infinite,
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Timeout::Immediate
                } else {
                    Timeout::After(left)
                }
            }
        }
    }

    pub(crate) fn at(&self) -> Option<Instant> {
        self.0
    }
}

/// Outcome of a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// A read issued now will not block.
    Ready,
    /// Nothing became available within the timeout.
    TimedOut,
}

/// The OS object a poller waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waitable {
    /// A descriptor that becomes readable.
    #[cfg(unix)]
    Fd(std::os::fd::RawFd),
    /// An event object signalled when an overlapped read completes.
    #[cfg(windows)]
    Event(isize),
}

/// Wait-for-event contract shared by the readiness and completion backends.
pub trait Poller: Send + Sync {
    fn model(&self) -> PollModel;

    /// Wait until `target` is ready or `timeout` elapses.
    ///
    /// Fails with [`Error::HandleClosed`] once [`Poller::interrupt`] has been
    /// called, including for a wait already in progress.
    fn wait_for_event(&self, target: Waitable, timeout: Timeout) -> Result<WaitStatus>;

    /// Cancel current and future waits. Latched; cannot be undone.
    fn interrupt(&self) -> Result<()>;
}

/// Create a poller of the given model, if the host provides it.
pub fn new_poller(model: PollModel) -> Result<Box<dyn Poller>> {
    match model {
        #[cfg(unix)]
        PollModel::Readiness => Ok(Box::new(readiness::ReadinessPoller::new()?)),
        #[cfg(windows)]
        PollModel::Completion => Ok(Box::new(completion::CompletionPoller::new()?)),
        #[allow(unreachable_patterns)]
        other => Err(Error::Configuration(format!(
            "{other:?} polling is not available on this host"
        ))),
    }
}
