//! Overlapped-I/O source: a HID device path opened with `FILE_FLAG_OVERLAPPED`.
//!
//! One read is kept outstanding. Its `OVERLAPPED::hEvent` is the waitable the
//! completion poller waits on; once signalled, `read_report` collects the
//! bytes the OS has already placed in the read buffer.

use super::ReportSource;
use crate::error::{Error, Result};
use crate::io_failure;
use crate::poll::completion::{wait_millis, OwnedEvent};
use crate::poll::{Timeout, Waitable};
use parking_lot::Mutex;
use std::ffi::CStr;
use tracing::{debug, trace};
use windows::core::{GUID, PCWSTR};
use windows::Win32::Devices::DeviceAndDriverInstallation::{
    CM_Get_DevNode_PropertyW, CM_Get_Device_Interface_PropertyW, CM_Locate_DevNodeW,
    CM_LOCATE_DEVNODE_NORMAL, CR_SUCCESS,
};
use windows::Win32::Devices::HumanInterfaceDevice::{HidD_GetFeature, HidD_SetFeature};
use windows::Win32::Devices::Properties::{
    DEVPKEY_Device_ContainerId, DEVPKEY_Device_InstanceId, DEVPROPTYPE, DEVPROP_TYPE_GUID,
    DEVPROP_TYPE_STRING,
};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED, GENERIC_READ, GENERIC_WRITE, HANDLE,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE,
    OPEN_EXISTING,
};
use windows::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows::Win32::System::Threading::WaitForSingleObject;

/// Largest input report the read buffer accepts.
const READ_BUFFER_LEN: usize = 4096;

/// `MAX_DEVICE_ID_LEN` from `cfgmgr32.h`, plus the terminator.
const DEVICE_ID_LEN: usize = 201;

struct PendingRead {
    overlapped: Box<OVERLAPPED>,
    buf: Vec<u8>,
    pending: bool,
}

pub struct OverlappedSource {
    file: HANDLE,
    /// NUL-terminated device interface path.
    interface: Vec<u16>,
    read: Mutex<PendingRead>,
    read_event: OwnedEvent,
    write_event: OwnedEvent,
    write_lock: Mutex<()>,
}

// SAFETY: the file handle is a kernel object usable from any thread; the
// OVERLAPPED block and its buffer are only touched under `read`, and they
// stay at a fixed heap address while a read is outstanding.
unsafe impl Send for OverlappedSource {}
unsafe impl Sync for OverlappedSource {}

fn is_io_pending(e: &windows::core::Error) -> bool {
    e.code() == ERROR_IO_PENDING.to_hresult()
}

impl OverlappedSource {
    pub fn open(path: &CStr) -> Result<Self> {
        let wide: Vec<u16> = path
            .to_string_lossy()
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        // SAFETY: `wide` is a NUL-terminated UTF-16 string that outlives the call.
        let file = unsafe {
            CreateFileW(
                PCWSTR(wide.as_ptr()),
                (GENERIC_READ | GENERIC_WRITE).0,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                None,
            )
        }
        .map_err(|e| Error::DeviceNotFound(format!("CreateFileW {}: {e}", path.to_string_lossy())))?;

        debug!(path = %path.to_string_lossy(), "Overlapped source opened");
        Ok(Self {
            file,
            interface: wide,
            read: Mutex::new(PendingRead {
                overlapped: Box::default(),
                buf: vec![0; READ_BUFFER_LEN],
                pending: false,
            }),
            read_event: OwnedEvent::new(true)?,
            write_event: OwnedEvent::new(true)?,
            write_lock: Mutex::new(()),
        })
    }

    fn collect(&self, read: &mut PendingRead, out: &mut [u8]) -> Result<usize> {
        let mut transferred = 0u32;
        // SAFETY: the OVERLAPPED block belongs to the read issued on `file`.
        unsafe { GetOverlappedResult(self.file, &*read.overlapped, &mut transferred, false) }
            .map_err(|e| io_failure!("GetOverlappedResult(read): {e}"))?;
        read.pending = false;

        let n = (transferred as usize).min(out.len());
        out[..n].copy_from_slice(&read.buf[..n]);
        trace!(len = n, report_hex = format_args!("{:02X?}", &out[..n]), "HID RX");
        Ok(n)
    }
}

impl ReportSource for OverlappedSource {
    fn waitable(&self) -> Option<Waitable> {
        Some(self.read_event.waitable())
    }

    fn begin_read(&self) -> Result<()> {
        let mut guard = self.read.lock();
        let read = &mut *guard;
        if read.pending {
            return Ok(());
        }
        *read.overlapped = OVERLAPPED::default();
        read.overlapped.hEvent = self.read_event.handle();

        // SAFETY: buffer and OVERLAPPED live on the heap until the read is
        // collected or cancelled in Drop.
        match unsafe {
            ReadFile(
                self.file,
                Some(read.buf.as_mut_slice()),
                None,
                Some(&mut *read.overlapped),
            )
        } {
            Ok(()) => {}
            Err(e) if is_io_pending(&e) => {}
            Err(e) => return Err(io_failure!("ReadFile: {e}")),
        }
        read.pending = true;
        Ok(())
    }

    fn read_report(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        self.begin_read()?;
        // SAFETY: the event is owned and open.
        let waited = unsafe { WaitForSingleObject(self.read_event.handle(), wait_millis(timeout)) };
        if waited == WAIT_TIMEOUT {
            return Ok(0);
        }
        if waited != WAIT_OBJECT_0 {
            return Err(Error::last_os_error("WaitForSingleObject(read)"));
        }
        let mut read = self.read.lock();
        self.collect(&mut read, buf)
    }

    fn write_report(&self, data: &[u8], timeout: Timeout) -> Result<usize> {
        let _serial = self.write_lock.lock();
        let mut overlapped = OVERLAPPED {
            hEvent: self.write_event.handle(),
            ..Default::default()
        };
        trace!(report_hex = format_args!("{:02X?}", data), "HID TX");

        // SAFETY: `data` and `overlapped` outlive the write, which is waited
        // for below before returning.
        match unsafe { WriteFile(self.file, Some(data), None, Some(&mut overlapped)) } {
            Ok(()) => {}
            Err(e) if is_io_pending(&e) => {}
            Err(e) => return Err(io_failure!("WriteFile: {e}")),
        }

        // SAFETY: the event is owned and open.
        let waited = unsafe { WaitForSingleObject(self.write_event.handle(), wait_millis(timeout)) };
        let wait_failed = (waited != WAIT_OBJECT_0 && waited != WAIT_TIMEOUT)
            .then(|| Error::last_os_error("WaitForSingleObject(write)"));
        if waited != WAIT_OBJECT_0 {
            // SAFETY: cancels only our own write; the result is waited for
            // below, so `data` and `overlapped` outlive it.
            let _ = unsafe { CancelIoEx(self.file, Some(&overlapped)) };
        }

        let mut written = 0u32;
        // SAFETY: as above.
        let result = unsafe { GetOverlappedResult(self.file, &overlapped, &mut written, true) };
        if let Some(e) = wait_failed {
            return Err(e);
        }
        match result {
            Ok(()) => Ok(written as usize),
            Err(e) if e.code() == ERROR_OPERATION_ABORTED.to_hresult() => Ok(0),
            Err(e) => Err(io_failure!("GetOverlappedResult(write): {e}")),
        }
    }

    fn send_feature_report(&self, data: &[u8]) -> Result<()> {
        // SAFETY: `data` is valid for `data.len()` bytes.
        let ok: bool =
            unsafe { HidD_SetFeature(self.file, data.as_ptr().cast(), data.len() as u32) }.into();
        if !ok {
            return Err(Error::last_os_error("HidD_SetFeature"));
        }
        Ok(())
    }

    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize> {
        // SAFETY: `buf` is valid for `buf.len()` bytes.
        let ok: bool =
            unsafe { HidD_GetFeature(self.file, buf.as_mut_ptr().cast(), buf.len() as u32) }
                .into();
        if !ok {
            return Err(Error::last_os_error("HidD_GetFeature"));
        }
        Ok(buf.len())
    }

    fn container_id(&self) -> Result<GUID> {
        let mut prop_type = DEVPROPTYPE::default();
        let mut instance_id = [0u16; DEVICE_ID_LEN];
        let mut size = std::mem::size_of_val(&instance_id) as u32;
        // SAFETY: `interface` is NUL-terminated; the buffer holds `size` bytes.
        let cr = unsafe {
            CM_Get_Device_Interface_PropertyW(
                PCWSTR(self.interface.as_ptr()),
                &DEVPKEY_Device_InstanceId,
                &mut prop_type,
                Some(instance_id.as_mut_ptr().cast()),
                &mut size,
                0,
            )
        };
        if cr != CR_SUCCESS || prop_type != DEVPROP_TYPE_STRING {
            return Err(io_failure!("CM_Get_Device_Interface_PropertyW(InstanceId): {cr:?}"));
        }

        let mut dev_node = 0u32;
        // SAFETY: `instance_id` was NUL-terminated by the call above.
        let cr = unsafe {
            CM_Locate_DevNodeW(&mut dev_node, PCWSTR(instance_id.as_ptr()), CM_LOCATE_DEVNODE_NORMAL)
        };
        if cr != CR_SUCCESS {
            return Err(io_failure!("CM_Locate_DevNodeW: {cr:?}"));
        }

        let mut container = GUID::zeroed();
        let mut size = std::mem::size_of::<GUID>() as u32;
        // SAFETY: `container` is valid for `size` bytes.
        let cr = unsafe {
            CM_Get_DevNode_PropertyW(
                dev_node,
                &DEVPKEY_Device_ContainerId,
                &mut prop_type,
                Some((&mut container as *mut GUID).cast()),
                &mut size,
                0,
            )
        };
        if cr != CR_SUCCESS || prop_type != DEVPROP_TYPE_GUID {
            return Err(io_failure!("CM_Get_DevNode_PropertyW(ContainerId): {cr:?}"));
        }
        debug!(container = ?container, "Resolved device container id");
        Ok(container)
    }
}

impl Drop for OverlappedSource {
    fn drop(&mut self) {
        let read = self.read.get_mut();
        if read.pending {
            let mut transferred = 0u32;
            // SAFETY: cancel and wait out our own outstanding read so the OS
            // stops writing into the buffer before it is freed.
            unsafe {
                let _ = CancelIoEx(self.file, Some(&*read.overlapped));
                let _ = GetOverlappedResult(self.file, &*read.overlapped, &mut transferred, true);
            }
        }
        // SAFETY: the file handle is owned and closed exactly once.
        let _ = unsafe { CloseHandle(self.file) };
    }
}
