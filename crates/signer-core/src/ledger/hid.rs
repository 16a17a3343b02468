//! USB HID access through `hidapi`.
//!
//! Enabled with the `hidapi` cargo feature.

use core::time::Duration;
use std::ffi::CString;
use std::sync::{Mutex, PoisonError};

use hidapi::{HidApi, HidDevice, HidError};
use tracing::{debug, trace};

use super::framing::REPORT_SIZE;
use super::{DeviceBackend, DeviceInfo, Transport};
use crate::error::{Error, Result};

fn transport_error(e: &HidError) -> Error {
    Error::Transport(e.to_string())
}

/// Enumerates and opens HID devices with `hidapi`.
pub struct HidBackend {
    api: Mutex<HidApi>,
}

impl core::fmt::Debug for HidBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HidBackend").finish_non_exhaustive()
    }
}

impl HidBackend {
    /// Initializes the HID library.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if `hidapi` cannot be initialized.
    pub fn new() -> Result<Self> {
        let api = HidApi::new().map_err(|e| transport_error(&e))?;
        Ok(Self {
            api: Mutex::new(api),
        })
    }
}

impl DeviceBackend for HidBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let mut api = self.api.lock().unwrap_or_else(PoisonError::into_inner);
        api.refresh_devices().map_err(|e| transport_error(&e))?;

        let devices: Vec<DeviceInfo> = api
            .device_list()
            .map(|d| DeviceInfo {
                path: d.path().to_string_lossy().into_owned(),
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                usage_page: d.usage_page(),
                interface: d.interface_number(),
                product: d.product_string().map(str::to_string),
                serial: d.serial_number().map(str::to_string),
            })
            .collect();
        trace!(count = devices.len(), "enumerated HID devices");
        Ok(devices)
    }

    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn Transport>> {
        let path = CString::new(device.path.as_str())
            .map_err(|_| Error::DeviceNotFound(Some(device.path.clone())))?;
        let api = self.api.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = api.open_path(&path).map_err(|e| transport_error(&e))?;
        debug!(path = %device.path, "opened HID device");
        Ok(Box::new(HidTransport { device: handle }))
    }
}

/// An open Ledger HID interface.
pub struct HidTransport {
    device: HidDevice,
}

impl core::fmt::Debug for HidTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HidTransport").finish_non_exhaustive()
    }
}

impl Transport for HidTransport {
    fn write(&mut self, report: &[u8]) -> Result<()> {
        // hidapi expects the report id first; Ledger uses none
        let mut buf = [0u8; REPORT_SIZE + 1];
        let len = report.len().min(REPORT_SIZE);
        buf[1..=len].copy_from_slice(&report[..len]);

        let written = self.device.write(&buf).map_err(|e| transport_error(&e))?;
        if written < len {
            return Err(Error::Transport(format!(
                "short HID write of {written} bytes"
            )));
        }
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; REPORT_SIZE];
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX).max(1);
        let read = self
            .device
            .read_timeout(&mut buf, millis)
            .map_err(|e| transport_error(&e))?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(buf[..read].to_vec()))
    }
}
