//! Descriptor-backed source: a `hidraw` node, or any descriptor that yields
//! one report per `read(2)`.

use super::ReportSource;
use crate::error::{Error, Result};
use crate::io_failure;
use crate::poll::readiness::{wait_readable, wait_writable};
use crate::poll::{Deadline, Timeout, WaitStatus, Waitable};
use std::ffi::{CStr, OsStr};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{debug, trace};

/// A non-blocking device descriptor owned by this source.
#[derive(Debug)]
pub struct FdSource {
    fd: OwnedFd,
}

impl FdSource {
    /// Adopt an open descriptor and switch it to non-blocking mode.
    pub fn new(fd: OwnedFd) -> Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        debug!(fd = fd.as_raw_fd(), "Descriptor source ready");
        Ok(Self { fd })
    }

    /// Open a device node for reading and writing.
    pub fn open(path: &CStr) -> Result<Self> {
        let path = Path::new(OsStr::from_bytes(path.to_bytes()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| Error::from(e).context(&format!("open {}", path.display())))?;
        Self::new(OwnedFd::from(file))
    }

    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: F_GETFL/F_SETFL on a descriptor we own; no pointers involved.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os_error("fcntl(F_GETFL)"));
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::last_os_error("fcntl(F_SETFL)"));
    }
    Ok(())
}

impl ReportSource for FdSource {
    fn waitable(&self) -> Option<Waitable> {
        Some(Waitable::Fd(self.raw()))
    }

    fn read_report(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        let fd = self.raw();
        let deadline = Deadline::after(timeout);
        loop {
            // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                let n = n as usize;
                trace!(fd, len = n, report_hex = format_args!("{:02X?}", &buf[..n]), "HID RX");
                return Ok(n);
            }
            if n == 0 {
                if buf.is_empty() {
                    return Ok(0);
                }
                return Err(io_failure!("fd {fd}: end of stream, device disconnected"));
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => match deadline.remaining() {
                    Timeout::Immediate => return Ok(0),
                    remaining => {
                        if wait_readable(fd, remaining)? == WaitStatus::TimedOut {
                            return Ok(0);
                        }
                    }
                },
                _ => return Err(io_failure!("read fd {fd}: {err}")),
            }
        }
    }

    fn write_report(&self, data: &[u8], timeout: Timeout) -> Result<usize> {
        let fd = self.raw();
        let deadline = Deadline::after(timeout);
        trace!(fd, report_hex = format_args!("{:02X?}", data), "HID TX");
        loop {
            // SAFETY: `data` is valid for reads of `data.len()` bytes.
            let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => match deadline.remaining() {
                    Timeout::Immediate => return Ok(0),
                    remaining => {
                        if wait_writable(fd, remaining)? == WaitStatus::TimedOut {
                            return Ok(0);
                        }
                    }
                },
                _ => return Err(io_failure!("write fd {fd}: {err}")),
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn send_feature_report(&self, data: &[u8]) -> Result<()> {
        let fd = self.raw();
        // SAFETY: the ioctl reads `data.len()` bytes from `data`.
        let rc = unsafe { libc::ioctl(fd, hidioc(HIDIOC_SFEATURE, data.len()) as _, data.as_ptr()) };
        if rc < 0 {
            return Err(Error::last_os_error("ioctl(HIDIOCSFEATURE)"));
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.raw();
        // SAFETY: the ioctl writes at most `buf.len()` bytes into `buf`.
        let rc = unsafe { libc::ioctl(fd, hidioc(HIDIOC_GFEATURE, buf.len()) as _, buf.as_mut_ptr()) };
        if rc < 0 {
            return Err(Error::last_os_error("ioctl(HIDIOCGFEATURE)"));
        }
        Ok(rc as usize)
    }
}

#[cfg(target_os = "linux")]
const HIDIOC_SFEATURE: u8 = 0x06;
#[cfg(target_os = "linux")]
const HIDIOC_GFEATURE: u8 = 0x07;

/// `_IOC(_IOC_WRITE | _IOC_READ, 'H', nr, len)` from `<linux/hidraw.h>`.
#[cfg(target_os = "linux")]
fn hidioc(nr: u8, len: usize) -> libc::c_ulong {
    const IOC_READ_WRITE: libc::c_ulong = 3;
    (IOC_READ_WRITE << 30)
        | (((len as libc::c_ulong) & 0x3FFF) << 16)
        | ((b'H' as libc::c_ulong) << 8)
        | nr as libc::c_ulong
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;
    use std::time::{Duration, Instant};

    fn pair() -> (UnixDatagram, FdSource) {
        let (device, host) = UnixDatagram::pair().unwrap();
        (device, FdSource::new(OwnedFd::from(host)).unwrap())
    }

    #[test]
    fn immediate_read_with_nothing_pending_returns_zero() {
        let (_device, source) = pair();
        let mut buf = [0u8; 16];
        assert_eq!(source.read_report(&mut buf, Timeout::Immediate).unwrap(), 0);
    }

    #[test]
    fn timed_read_returns_zero_after_timeout() {
        let (_device, source) = pair();
        let mut buf = [0u8; 16];
        let start = Instant::now();
        let n = source
            .read_report(&mut buf, Timeout::After(Duration::from_millis(30)))
            .unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn reads_one_report_per_call() {
        let (device, source) = pair();
        device.send(&[0x01, 0xAA]).unwrap();
        device.send(&[0x01, 0xBB, 0xCC]).unwrap();

        let mut buf = [0u8; 16];
        let n = source.read_report(&mut buf, Timeout::Infinite).unwrap();
        assert_eq!(&buf[..n], &[0x01, 0xAA]);
        let n = source.read_report(&mut buf, Timeout::Infinite).unwrap();
        assert_eq!(&buf[..n], &[0x01, 0xBB, 0xCC]);
    }

    #[test]
    fn blocked_read_wakes_on_data() {
        let (device, source) = pair();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            device.send(&[0x42]).unwrap();
            device
        });
        let mut buf = [0u8; 4];
        let n = source.read_report(&mut buf, Timeout::Infinite).unwrap();
        assert_eq!(&buf[..n], &[0x42]);
        sender.join().unwrap();
    }

    #[test]
    fn write_reaches_device() {
        let (device, source) = pair();
        assert_eq!(source.write_report(&[0x00, 1, 2, 3], Timeout::Infinite).unwrap(), 4);
        let mut buf = [0u8; 8];
        let n = device.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x00, 1, 2, 3]);
    }

    #[test]
    fn write_to_full_peer_returns_zero_after_timeout() {
        let (_device, source) = pair();
        let report = [0u8; 256];
        while source.write_report(&report, Timeout::Immediate).unwrap() > 0 {}

        let start = Instant::now();
        let n = source
            .write_report(&report, Timeout::After(Duration::from_millis(30)))
            .unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn exposes_descriptor_waitable() {
        let (_device, source) = pair();
        assert_eq!(source.waitable(), Some(Waitable::Fd(source.raw())));
    }

    #[test]
    fn open_missing_node_is_device_not_found() {
        let path = c"/dev/hidport-no-such-node";
        let err = FdSource::open(path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DeviceNotFound);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn feature_ioctl_numbers_match_hidraw_header() {
        assert_eq!(hidioc(HIDIOC_SFEATURE, 8), 0xC008_4806);
        assert_eq!(hidioc(HIDIOC_GFEATURE, 64), 0xC040_4807);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn feature_reports_fail_on_non_hidraw_descriptor() {
        let (_device, source) = pair();
        let err = source.send_feature_report(&[0x01, 0x02]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IoFailure);
    }
}
