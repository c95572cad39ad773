//! Report sources: adapters from a platform HID SDK to raw report I/O.
//!
//! A source either exposes a [`Waitable`] a [`Poller`](crate::poll::Poller)
//! can wait on, or blocks inside its own `read_report` (hidapi devices).

use crate::error::{Error, Result};
use crate::platform::PollModel;
use crate::poll::{Timeout, Waitable};
use parking_lot::Mutex;
use std::ffi::CStr;
use tracing::{debug, trace};

#[cfg(unix)]
pub mod fd;
#[cfg(test)]
pub mod mock;
#[cfg(windows)]
pub mod overlapped;

#[cfg(unix)]
pub use fd::FdSource;
#[cfg(windows)]
pub use overlapped::OverlappedSource;

/// Raw report I/O on one open device.
pub trait ReportSource: Send + Sync {
    /// What a poller should wait on, or `None` if `read_report` waits itself.
    fn waitable(&self) -> Option<Waitable> {
        None
    }

    /// Arm an asynchronous read for completion-based sources. Readiness
    /// sources have nothing to arm.
    fn begin_read(&self) -> Result<()> {
        Ok(())
    }

    /// Read one report into `buf`. Returns 0 when nothing arrived within
    /// `timeout`; never blocks past it.
    fn read_report(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize>;

    /// Write one output report; the first byte is the report id. Returns 0
    /// when the device did not accept the report within `timeout`.
    fn write_report(&self, data: &[u8], timeout: Timeout) -> Result<usize>;

    fn send_feature_report(&self, _data: &[u8]) -> Result<()> {
        Err(Error::Unsupported("feature reports on this source".into()))
    }

    /// `buf[0]` holds the report id on entry.
    fn get_feature_report(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::Unsupported("feature reports on this source".into()))
    }

    /// The PnP container the device belongs to.
    #[cfg(windows)]
    fn container_id(&self) -> Result<windows::core::GUID> {
        Err(Error::Unsupported("container id on this source".into()))
    }
}

/// An `hidapi` device. hidapi does its own waiting, so this source has no
/// waitable and reads block inside hidapi for at most the given timeout.
pub struct HidapiSource {
    device: Mutex<hidapi::HidDevice>,
}

impl HidapiSource {
    pub fn new(device: hidapi::HidDevice) -> Self {
        Self {
            device: Mutex::new(device),
        }
    }
}

impl ReportSource for HidapiSource {
    fn read_report(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        let n = self
            .device
            .lock()
            .read_timeout(buf, timeout.as_millis_i32())
            .map_err(|e| Error::from(e).context("hid_read_timeout"))?;
        if n > 0 {
            trace!(len = n, report_hex = format_args!("{:02X?}", &buf[..n]), "HID RX");
        }
        Ok(n)
    }

    // hidapi writes take no timeout.
    fn write_report(&self, data: &[u8], _timeout: Timeout) -> Result<usize> {
        trace!(report_hex = format_args!("{:02X?}", data), "HID TX");
        self.device
            .lock()
            .write(data)
            .map_err(|e| Error::from(e).context("hid_write"))
    }

    fn send_feature_report(&self, data: &[u8]) -> Result<()> {
        self.device
            .lock()
            .send_feature_report(data)
            .map_err(|e| Error::from(e).context("hid_send_feature_report"))
    }

    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize> {
        self.device
            .lock()
            .get_feature_report(buf)
            .map_err(|e| Error::from(e).context("hid_get_feature_report"))
    }
}

/// Open `path` as the source a backend of `poll_model` can drive.
///
/// Completion backends get an overlapped handle; readiness backends get a
/// descriptor when the path is a device node; anything else, or no backend,
/// goes through hidapi.
pub fn open_path(
    api: &hidapi::HidApi,
    path: &CStr,
    poll_model: Option<PollModel>,
) -> Result<Box<dyn ReportSource>> {
    #[cfg(windows)]
    {
        if poll_model == Some(PollModel::Completion) {
            debug!(path = ?path, "Opening overlapped source");
            return Ok(Box::new(OverlappedSource::open(path)?));
        }
    }

    #[cfg(unix)]
    {
        if poll_model == Some(PollModel::Readiness) && path.to_bytes().starts_with(b"/dev/") {
            debug!(path = ?path, "Opening descriptor source");
            return Ok(Box::new(FdSource::open(path)?));
        }
    }

    debug!(path = ?path, ?poll_model, "Opening hidapi source");
    let device = api
        .open_path(path)
        .map_err(|e| Error::from(e).context("hid_open_path"))?;
    Ok(Box::new(HidapiSource::new(device)))
}
