//! Ledger device communication.
//!
//! This module talks to the Ethereum app of a Ledger hardware wallet over
//! USB HID. It is layered bottom-up:
//!
//! - [`framing`]: 64-byte HID reports carrying one message each way
//! - [`apdu`]: logical command/response APDUs and the status word taxonomy
//! - [`session`]: exclusive, bounded access to one open device
//! - [`app`]: the Ethereum app instructions (address, transaction, typed data)
//! - [`wallet`]: one device with its app version and derived accounts
//! - [`hub`]: discovery and reconciliation of attached devices
//!
//! # Transport Abstraction
//!
//! The [`Transport`] trait moves raw HID reports and nothing else, and the
//! [`DeviceBackend`] trait enumerates and opens devices. The `hidapi`
//! feature provides both for real hardware; tests plug in simulated ones.

pub mod apdu;
pub mod app;
pub mod framing;
pub mod hub;
pub mod session;
pub mod wallet;

#[cfg(feature = "hidapi")]
pub mod hid;

use core::time::Duration;

use serde::{Deserialize, Serialize};

pub use apdu::{Apdu, ApduResponse};
pub use app::{AppConfiguration, AppVersion};
pub use hub::{Hub, RefreshReport, RefresherHandle};
pub use session::{Exchange, Session};
pub use wallet::{LedgerWallet, WalletStatus};

#[cfg(feature = "hidapi")]
pub use hid::{HidBackend, HidTransport};

use crate::error::{Error, Result};

/// A raw HID report channel to one device.
///
/// Implementations only move bytes; framing, exclusivity and timeouts are
/// handled above this trait.
pub trait Transport: Send {
    /// Writes one 64-byte report.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the device cannot be written to.
    fn write(&mut self, report: &[u8]) -> Result<()>;

    /// Reads one report, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the device cannot be read from.
    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Releases the underlying handle. Called at most once per open.
    fn close(&mut self) {}

    /// Asks the device to drop a partially received command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedOperation`] when the transport has no
    /// way to do so, which is the default.
    fn abort(&mut self) -> Result<()> {
        Err(Error::UnsupportedOperation(
            "transport cannot abort an exchange".to_string(),
        ))
    }
}

/// An attached HID device as seen during enumeration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Platform path; the stable identity of a device while it stays plugged.
    pub path: String,
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// HID usage page, `0` when the platform does not report it.
    pub usage_page: u16,
    /// USB interface number, `-1` when unknown.
    pub interface: i32,
    /// Product string.
    pub product: Option<String>,
    /// Serial number string.
    pub serial: Option<String>,
}

/// Enumerates and opens devices.
pub trait DeviceBackend: Send + Sync {
    /// Lists every attached HID device. Filtering happens in the [`Hub`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if enumeration fails.
    fn enumerate(&self) -> Result<Vec<DeviceInfo>>;

    /// Opens a report channel to `device`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if the device went away, or
    /// [`Error::Transport`] if it cannot be opened.
    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn Transport>>;
}
