//! Device I/O façade: enumeration, open, read, write, close.
//!
//! The façade only sees the injected [`Backends`]; which OS I/O model sits
//! behind them is decided once, from the [`PlatformProfile`].

use crate::config::{self, IoConfig};
use crate::error::{Error, Result};
use crate::platform::{PlatformProfile, PollModel, ThreadModel};
use crate::poll::{self, Deadline, Poller, Timeout, WaitStatus};
use crate::source::{self, ReportSource};
use crate::threading::{self, Mailbox, ThreadBackend, Worker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Information about an attached HID device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub release_number: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub usage_page: u16,
    pub usage: u16,
    pub interface_number: i32,
}

impl DeviceInfo {
    /// Info for a device known only by its path.
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            interface_number: -1,
            ..Default::default()
        }
    }

    /// Whether this device matches a vendor/product filter; 0 matches any id.
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        (vendor_id == 0 || self.vendor_id == vendor_id)
            && (product_id == 0 || self.product_id == product_id)
    }
}

impl From<&hidapi::DeviceInfo> for DeviceInfo {
    fn from(info: &hidapi::DeviceInfo) -> Self {
        Self {
            path: info.path().to_string_lossy().into_owned(),
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            serial_number: info.serial_number().map(str::to_string),
            release_number: info.release_number(),
            manufacturer: info.manufacturer_string().map(str::to_string),
            product: info.product_string().map(str::to_string),
            usage_page: info.usage_page(),
            usage: info.usage(),
            interface_number: info.interface_number(),
        }
    }
}

/// The backend pair a context hands to every handle it opens.
#[derive(Debug, Clone)]
pub enum Backends {
    /// A reader thread per handle waits in a poller of `poll` and hands
    /// reports over through a mailbox of `threads`.
    Worker {
        poll: PollModel,
        threads: Arc<dyn ThreadBackend>,
    },
    /// The driver does its own polling and threading; reads go straight to
    /// the source.
    SelfContained,
}

impl Backends {
    pub fn worker(poll: PollModel, thread: ThreadModel) -> Self {
        Backends::Worker {
            poll,
            threads: threading::backend(thread),
        }
    }

    pub fn for_profile(profile: &PlatformProfile) -> Result<Self> {
        match (profile.poll_model(), profile.thread_model()) {
            (Some(poll), Some(thread)) => Ok(Self::worker(poll, thread)),
            (None, None) => Ok(Backends::SelfContained),
            (poll, thread) => Err(Error::Configuration(format!(
                "incomplete backend pair: poll={poll:?} thread={thread:?}"
            ))),
        }
    }

    pub fn poll_model(&self) -> Option<PollModel> {
        match self {
            Backends::Worker { poll, .. } => Some(*poll),
            Backends::SelfContained => None,
        }
    }
}

/// Entry point: enumerates and opens devices with one backend pair.
pub struct HidContext {
    backends: Backends,
    config: IoConfig,
    api: Option<hidapi::HidApi>,
}

impl HidContext {
    /// Context for the compiled target's profile, with config from
    /// `HIDPORT_CONFIG` and an initialised hidapi.
    pub fn new() -> Result<Self> {
        let profile = PlatformProfile::current();
        let mut ctx = Self::with_backends(Backends::for_profile(profile)?, config::load_or_default()?)?;
        ctx.api()?;
        info!(
            poll_model = ?profile.poll_model(),
            thread_model = ?profile.thread_model(),
            "HID context initialised"
        );
        Ok(ctx)
    }

    /// Context with explicit backends. hidapi is initialised on first
    /// enumeration or open.
    pub fn with_backends(backends: Backends, config: IoConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backends,
            config,
            api: None,
        })
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn config(&self) -> &IoConfig {
        &self.config
    }

    fn api(&mut self) -> Result<&mut hidapi::HidApi> {
        if self.api.is_none() {
            let api = hidapi::HidApi::new().map_err(|e| Error::from(e).context("hid_init"))?;
            self.api = Some(api);
        }
        self.api
            .as_mut()
            .ok_or_else(|| Error::Io("hidapi not initialised".into()))
    }

    /// List attached devices. A zero vendor or product id matches any.
    pub fn enumerate(&mut self, vendor_id: u16, product_id: u16) -> Result<Vec<DeviceInfo>> {
        debug!("Starting HID device enumeration");
        let api = self.api()?;
        api.refresh_devices()
            .map_err(|e| Error::from(e).context("hid_enumerate"))?;

        let devices: Vec<DeviceInfo> = api
            .device_list()
            .map(DeviceInfo::from)
            .filter(|info| info.matches(vendor_id, product_id))
            .collect();

        debug!(count = devices.len(), "Device enumeration complete");
        Ok(devices)
    }

    /// Open the first device matching the ids and, if given, the serial.
    pub fn open(
        &mut self,
        vendor_id: u16,
        product_id: u16,
        serial: Option<&str>,
    ) -> Result<DeviceHandle> {
        let info = self
            .enumerate(vendor_id, product_id)?
            .into_iter()
            .find(|info| serial.is_none() || info.serial_number.as_deref() == serial)
            .ok_or_else(|| {
                Error::DeviceNotFound(format!(
                    "VID=0x{vendor_id:04X} PID=0x{product_id:04X}{}",
                    serial.map(|s| format!(" serial={s}")).unwrap_or_default()
                ))
            })?;
        self.open_info(&info)
    }

    /// Open a device by its platform path.
    pub fn open_path(&mut self, path: &str) -> Result<DeviceHandle> {
        let info = self
            .enumerate(0, 0)?
            .into_iter()
            .find(|info| info.path == path)
            .unwrap_or_else(|| DeviceInfo::from_path(path));
        self.open_info(&info)
    }

    /// Open a previously enumerated device.
    pub fn open_info(&mut self, info: &DeviceInfo) -> Result<DeviceHandle> {
        let path = CString::new(info.path.as_str())
            .map_err(|_| Error::InvalidInput(format!("device path contains NUL: {:?}", info.path)))?;
        let poll_model = self.backends.poll_model();
        let source = source::open_path(self.api()?, &path, poll_model)?;
        info!(
            vid = format_args!("0x{:04X}", info.vendor_id),
            pid = format_args!("0x{:04X}", info.product_id),
            path = %info.path,
            "Opened HID device"
        );
        self.attach(Arc::from(source), info.clone())
    }

    /// Drive an already open source with this context's backends.
    pub fn attach(&self, source: Arc<dyn ReportSource>, info: DeviceInfo) -> Result<DeviceHandle> {
        DeviceHandle::start(source, info, &self.backends, &self.config)
    }

    /// Adopt an open OS descriptor for a HID device (e.g. a `hidraw` node
    /// handed over by a privileged helper).
    #[cfg(unix)]
    pub fn wrap_sys_device(&self, fd: std::os::fd::OwnedFd) -> Result<DeviceHandle> {
        use std::os::fd::AsRawFd;
        let info = DeviceInfo::from_path(format!("fd:{}", fd.as_raw_fd()));
        let source = source::FdSource::new(fd)?;
        self.attach(Arc::new(source), info)
    }
}

enum Engine {
    Worker {
        poller: Arc<dyn Poller>,
        mailbox: Arc<dyn Mailbox>,
        worker: Mutex<Option<Worker>>,
    },
    Direct,
}

/// An open device. Exclusively owned by whoever opened it; `close` (or drop)
/// stops its reader and wakes any thread blocked in `read`.
pub struct DeviceHandle {
    info: DeviceInfo,
    source: Arc<dyn ReportSource>,
    closed: Arc<AtomicBool>,
    nonblocking: AtomicBool,
    report_len: usize,
    slice: Duration,
    engine: Engine,
}

impl DeviceHandle {
    fn start(
        source: Arc<dyn ReportSource>,
        info: DeviceInfo,
        backends: &Backends,
        config: &IoConfig,
    ) -> Result<Self> {
        let closed = Arc::new(AtomicBool::new(false));
        let engine = match backends {
            Backends::SelfContained => Engine::Direct,
            Backends::Worker { poll, threads } => {
                let poller: Arc<dyn Poller> = Arc::from(poll::new_poller(*poll)?);
                let mailbox = threads.mailbox(config.queue_capacity);
                let reader = Reader {
                    source: Arc::clone(&source),
                    poller: Arc::clone(&poller),
                    mailbox: Arc::clone(&mailbox),
                    closed: Arc::clone(&closed),
                    slice: config.read_slice(),
                    report_len: config.max_report_len,
                };
                let worker = threads.spawn(&config.worker_name, Box::new(move || reader.run()))?;
                Engine::Worker {
                    poller,
                    mailbox,
                    worker: Mutex::new(Some(worker)),
                }
            }
        };
        debug!(path = %info.path, self_contained = matches!(engine, Engine::Direct), "Device handle started");
        Ok(Self {
            info,
            source,
            closed,
            nonblocking: AtomicBool::new(false),
            report_len: config.max_report_len,
            slice: config.read_slice(),
            engine,
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True when the driver's own polling and threading serve this handle.
    pub fn is_self_contained(&self) -> bool {
        matches!(self.engine, Engine::Direct)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::HandleClosed)
        } else {
            Ok(())
        }
    }

    /// Make `read` return immediately when no report is pending.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.ensure_open()?;
        self.nonblocking.store(nonblocking, Ordering::Release);
        Ok(())
    }

    /// Read one input report, blocking unless non-blocking mode is set.
    /// Returns 0 if non-blocking and nothing is pending.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let timeout = if self.nonblocking.load(Ordering::Acquire) {
            Timeout::Immediate
        } else {
            Timeout::Infinite
        };
        self.read_timeout(buf, timeout)
    }

    /// Read one input report, waiting at most `timeout`. Returns 0 when none
    /// arrived. A report longer than `buf` is truncated.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        self.ensure_open()?;
        match &self.engine {
            Engine::Worker { mailbox, .. } => match mailbox.recv(timeout)? {
                Some(report) => {
                    let n = report.len().min(buf.len());
                    buf[..n].copy_from_slice(&report[..n]);
                    Ok(n)
                }
                None => Ok(0),
            },
            Engine::Direct => self.read_direct(buf, timeout),
        }
    }

    /// Take the next whole report, or `None` on timeout.
    pub fn next_report(&self, timeout: Timeout) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        match &self.engine {
            Engine::Worker { mailbox, .. } => mailbox.recv(timeout),
            Engine::Direct => {
                let mut buf = vec![0u8; self.report_len];
                let n = self.read_direct(&mut buf, timeout)?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(buf))
            }
        }
    }

    // Reads in slices so that a close from another thread is noticed within
    // one slice.
    fn read_direct(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        let deadline = Deadline::after(timeout);
        loop {
            self.ensure_open()?;
            let step = self.step(&deadline);
            let n = self.source.read_report(buf, step)?;
            self.ensure_open()?;
            if n > 0 || step == Timeout::Immediate {
                return Ok(n);
            }
        }
    }

    fn step(&self, deadline: &Deadline) -> Timeout {
        match deadline.remaining() {
            Timeout::Infinite => Timeout::After(self.slice),
            Timeout::After(left) => Timeout::After(left.min(self.slice)),
            Timeout::Immediate => Timeout::Immediate,
        }
    }

    /// Write an output report. The first byte is the report id (0 for
    /// devices without numbered reports). Blocks until the device accepts
    /// it or the handle is closed.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        if data.is_empty() {
            return Err(Error::InvalidInput("empty output report".into()));
        }
        loop {
            let n = self.source.write_report(data, Timeout::After(self.slice))?;
            self.ensure_open()?;
            if n > 0 {
                return Ok(n);
            }
        }
    }

    pub fn send_feature_report(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if data.is_empty() {
            return Err(Error::InvalidInput("empty feature report".into()));
        }
        self.source.send_feature_report(data)
    }

    /// Fetch a feature report; `buf[0]` must hold the report id.
    pub fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Err(Error::InvalidInput("empty feature report buffer".into()));
        }
        self.source.get_feature_report(buf)
    }

    /// Container id grouping this device with its siblings (Windows PnP).
    #[cfg(windows)]
    pub fn container_id(&self) -> Result<windows::core::GUID> {
        self.ensure_open()?;
        self.source.container_id()
    }

    /// Close the handle: wake blocked readers and writers, stop the reader
    /// thread. Closing again is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(path = %self.info.path, "Closing device handle");

        if let Engine::Worker {
            poller,
            mailbox,
            worker,
        } = &self.engine
        {
            mailbox.close();
            let worker = worker.lock().take();
            if let Err(e) = poller.interrupt() {
                // The reader cannot be woken; joining it would hang.
                warn!(path = %self.info.path, error = %e, "Detaching device reader");
                return Err(e);
            }
            if let Some(worker) = worker.filter(|w| !w.is_current()) {
                worker.join()?;
            }
        }
        Ok(())
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.info.path, error = %e, "Error closing device handle");
        }
    }
}

/// Per-handle reader thread body.
struct Reader {
    source: Arc<dyn ReportSource>,
    poller: Arc<dyn Poller>,
    mailbox: Arc<dyn Mailbox>,
    closed: Arc<AtomicBool>,
    slice: Duration,
    report_len: usize,
}

impl Reader {
    fn run(self) {
        let mut buf = vec![0u8; self.report_len];
        while !self.closed.load(Ordering::Acquire) {
            match self.next(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    if !self.mailbox.push(buf[..n].to_vec()) {
                        break;
                    }
                }
                Err(Error::HandleClosed) => break,
                Err(e) => {
                    if !self.closed.load(Ordering::Acquire) {
                        warn!(error = %e, "Device reader failed");
                        self.mailbox.fail(e.context("reader"));
                    }
                    break;
                }
            }
        }
        debug!("Device reader stopped");
    }

    fn next(&self, buf: &mut [u8]) -> Result<usize> {
        match self.source.waitable() {
            Some(target) => {
                self.source.begin_read()?;
                match self.poller.wait_for_event(target, Timeout::Infinite)? {
                    WaitStatus::Ready => self.source.read_report(buf, Timeout::Immediate),
                    WaitStatus::TimedOut => Ok(0),
                }
            }
            None => self.source.read_report(buf, Timeout::After(self.slice)),
        }
    }
}
