//! Completion polling over Win32 event objects.
//!
//! The source issues an overlapped read whose `OVERLAPPED::hEvent` is the
//! waitable; the OS signals that event once the read has finished, so `Ready`
//! means the data is already in the source's buffer.

use super::{Poller, Timeout, WaitStatus, Waitable};
use crate::error::{Error, Result};
use crate::io_failure;
use crate::platform::PollModel;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Threading::{CreateEventW, SetEvent, WaitForMultipleObjects, INFINITE};

/// An owned Win32 event object.
pub(crate) struct OwnedEvent(HANDLE);

// SAFETY: event handles are process-wide kernel objects; every Win32 call
// used on them is thread-safe.
unsafe impl Send for OwnedEvent {}
unsafe impl Sync for OwnedEvent {}

impl OwnedEvent {
    pub(crate) fn new(manual_reset: bool) -> Result<Self> {
        // SAFETY: no security attributes, unnamed event.
        let handle = unsafe { CreateEventW(None, manual_reset, false, PCWSTR::null()) }
            .map_err(|e| io_failure!("CreateEventW: {e}"))?;
        Ok(Self(handle))
    }

    pub(crate) fn handle(&self) -> HANDLE {
        self.0
    }

    pub(crate) fn waitable(&self) -> Waitable {
        Waitable::Event(self.0 .0 as isize)
    }

    pub(crate) fn set(&self) -> Result<()> {
        // SAFETY: the handle is owned and open.
        unsafe { SetEvent(self.0) }.map_err(|e| io_failure!("SetEvent: {e}"))
    }
}

impl Drop for OwnedEvent {
    fn drop(&mut self) {
        // SAFETY: the handle is owned and closed exactly once.
        let _ = unsafe { CloseHandle(self.0) };
    }
}

pub(crate) fn wait_millis(timeout: Timeout) -> u32 {
    match timeout {
        Timeout::Infinite => INFINITE,
        Timeout::Immediate => 0,
        after => (after.as_millis_i32() as u32).min(INFINITE - 1),
    }
}

/// Completion poller: waits on the target's completion event and a
/// manual-reset cancel event. Once set, the cancel event stays signalled, so
/// the cancellation is visible to every later wait.
pub struct CompletionPoller {
    cancel: OwnedEvent,
    interrupted: AtomicBool,
}

impl CompletionPoller {
    pub fn new() -> Result<Self> {
        let cancel = OwnedEvent::new(true)?;
        debug!("Completion poller created");
        Ok(Self {
            cancel,
            interrupted: AtomicBool::new(false),
        })
    }
}

impl Poller for CompletionPoller {
    fn model(&self) -> PollModel {
        PollModel::Completion
    }

    fn wait_for_event(&self, target: Waitable, timeout: Timeout) -> Result<WaitStatus> {
        if self.interrupted.load(Ordering::Acquire) {
            return Err(Error::HandleClosed);
        }
        let Waitable::Event(raw) = target;
        let handles = [HANDLE(raw as *mut _), self.cancel.handle()];

        // SAFETY: both handles are open event objects for the whole call.
        let result = unsafe { WaitForMultipleObjects(&handles, false, wait_millis(timeout)) };

        if result == WAIT_OBJECT_0 {
            if self.interrupted.load(Ordering::Acquire) {
                return Err(Error::HandleClosed);
            }
            Ok(WaitStatus::Ready)
        } else if result.0 == WAIT_OBJECT_0.0 + 1 {
            Err(Error::HandleClosed)
        } else if result == WAIT_TIMEOUT {
            Ok(WaitStatus::TimedOut)
        } else if result == WAIT_FAILED {
            Err(Error::last_os_error("WaitForMultipleObjects"))
        } else {
            Err(io_failure!("WaitForMultipleObjects returned 0x{:x}", result.0))
        }
    }

    fn interrupt(&self) -> Result<()> {
        if self.interrupted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.set()
    }
}
