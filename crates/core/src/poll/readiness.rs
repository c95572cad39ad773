//! Readiness polling over `poll(2)`.

use super::{Deadline, Poller, Timeout, WaitStatus, Waitable};
use crate::error::{Error, Result};
use crate::io_failure;
use crate::platform::PollModel;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Poll `fds`, resuming after signal interruptions with the time left.
/// Returns the number of entries with non-zero `revents`.
pub(crate) fn poll_fds(fds: &mut [libc::pollfd], timeout: Timeout) -> Result<usize> {
    let deadline = Deadline::after(timeout);
    loop {
        for entry in fds.iter_mut() {
            entry.revents = 0;
        }
        // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd.
        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                deadline.remaining().as_millis_i32(),
            )
        };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(io_failure!("poll: {err}"));
        }
        trace!("poll interrupted by signal, resuming");
    }
}

fn classify(fd: RawFd, revents: libc::c_short, wanted: libc::c_short) -> Result<WaitStatus> {
    if revents & wanted != 0 {
        return Ok(WaitStatus::Ready);
    }
    if revents & libc::POLLNVAL != 0 {
        return Err(io_failure!("fd {fd} is not open"));
    }
    if revents & (libc::POLLERR | libc::POLLHUP) != 0 {
        return Err(io_failure!("fd {fd} reported error or hang-up (revents=0x{revents:x})"));
    }
    Ok(WaitStatus::TimedOut)
}

fn wait_for(fd: RawFd, events: libc::c_short, timeout: Timeout) -> Result<WaitStatus> {
    let mut fds = [libc::pollfd {
        fd,
        events,
        revents: 0,
    }];
    if poll_fds(&mut fds, timeout)? == 0 {
        return Ok(WaitStatus::TimedOut);
    }
    classify(fd, fds[0].revents, events)
}

/// Wait for `fd` to become readable, without a cancellation channel.
pub(crate) fn wait_readable(fd: RawFd, timeout: Timeout) -> Result<WaitStatus> {
    wait_for(fd, libc::POLLIN, timeout)
}

/// Wait for `fd` to accept a write.
pub(crate) fn wait_writable(fd: RawFd, timeout: Timeout) -> Result<WaitStatus> {
    wait_for(fd, libc::POLLOUT, timeout)
}

/// Readiness poller: waits on the target descriptor and a private wake
/// socket. [`Poller::interrupt`] writes one byte to the socket and never
/// drains it, so the cancellation stays visible to every later wait.
pub struct ReadinessPoller {
    wake_rx: UnixStream,
    wake_tx: UnixStream,
    interrupted: AtomicBool,
}

impl ReadinessPoller {
    pub fn new() -> Result<Self> {
        let (wake_tx, wake_rx) =
            UnixStream::pair().map_err(|e| io_failure!("wake socket pair: {e}"))?;
        wake_tx
            .set_nonblocking(true)
            .map_err(|e| io_failure!("wake socket non-blocking: {e}"))?;
        debug!(wake_fd = wake_rx.as_raw_fd(), "Readiness poller created");
        Ok(Self {
            wake_rx,
            wake_tx,
            interrupted: AtomicBool::new(false),
        })
    }
}

impl Poller for ReadinessPoller {
    fn model(&self) -> PollModel {
        PollModel::Readiness
    }

    fn wait_for_event(&self, target: Waitable, timeout: Timeout) -> Result<WaitStatus> {
        if self.interrupted.load(Ordering::Acquire) {
            return Err(Error::HandleClosed);
        }
        let Waitable::Fd(fd) = target;

        let mut fds = [
            libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake_rx.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let ready = poll_fds(&mut fds, timeout)?;

        if fds[1].revents != 0 || self.interrupted.load(Ordering::Acquire) {
            return Err(Error::HandleClosed);
        }
        if ready == 0 {
            return Ok(WaitStatus::TimedOut);
        }
        classify(fd, fds[0].revents, libc::POLLIN)
    }

    fn interrupt(&self) -> Result<()> {
        if self.interrupted.load(Ordering::Acquire) {
            return Ok(());
        }
        // A full wake socket already holds a wake byte. Failing that, a
        // hang-up on the write side also wakes `wake_rx`.
        match (&self.wake_tx).write(&[1]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => match self.wake_tx.shutdown(Shutdown::Write) {
                Ok(()) => debug!(error = %e, "Wake write failed, hung up wake socket"),
                Err(hangup) if hangup.kind() == io::ErrorKind::NotConnected => {}
                Err(hangup) => return Err(io_failure!("wake poller: {e}; hang-up: {hangup}")),
            },
        }
        self.interrupted.store(true, Ordering::Release);
        Ok(())
    }
}
