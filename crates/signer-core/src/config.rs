//! Hub configuration and per-request signing options.
//!
//! [`HubConfig`] decides which HID devices count as Ledgers and how long an
//! exchange may wait; [`SignOptions`] carries the bounds of one request.
//!
//! # Example
//!
//! ```
//! use ledger_evm_signer_core::HubConfig;
//!
//! let config = HubConfig::from_json(r#"{"exchangeTimeoutMs": 60000}"#).unwrap();
//! assert_eq!(config.vendor_id, 0x2c97);
//! assert_eq!(config.sign_options().timeout.as_secs(), 60);
//! ```

use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Ledger's USB vendor id.
pub const LEDGER_VENDOR_ID: u16 = 0x2c97;

/// HID usage page of the Ledger APDU interface.
pub const LEDGER_USAGE_PAGE: u16 = 0xffa0;

/// Device discovery and exchange settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubConfig {
    /// USB vendor id to match.
    pub vendor_id: u16,

    /// Legacy model ids. A model `m` matches a product id equal to `m`
    /// (legacy firmware) or one whose upper byte is `m << 4` (the `MMII`
    /// model/interface scheme, e.g. `0x40` for the Nano X).
    pub product_models: Vec<u16>,

    /// HID usage page of the APDU interface.
    pub usage_page: u16,

    /// USB interface number of the APDU interface.
    pub interface: i32,

    /// Upper bound on a single exchange, user confirmation included.
    pub exchange_timeout_ms: u64,

    /// How long a request waits for an in-flight exchange before giving up
    /// with `DeviceBusy`.
    pub busy_wait_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            vendor_id: LEDGER_VENDOR_ID,
            // Blue, Nano S, Nano X, Nano S Plus, Stax, Flex
            product_models: vec![0x00, 0x01, 0x04, 0x05, 0x06, 0x07],
            usage_page: LEDGER_USAGE_PAGE,
            interface: 0,
            exchange_timeout_ms: 300_000,
            busy_wait_ms: 0,
        }
    }
}

impl HubConfig {
    /// Returns `true` if a HID device with these ids belongs to a Ledger.
    ///
    /// # Example
    ///
    /// ```
    /// use ledger_evm_signer_core::HubConfig;
    ///
    /// let config = HubConfig::default();
    /// assert!(config.matches(0x2c97, 0x4011, 0xffa0, 0)); // Nano X
    /// assert!(config.matches(0x2c97, 0x5011, 0xffa0, 0)); // Nano S Plus
    /// assert!(config.matches(0x2c97, 0x0001, 0, 0)); // Nano S, legacy firmware
    /// assert!(!config.matches(0x2c97, 0x4011, 0xf1d0, 1)); // FIDO interface
    /// ```
    #[must_use]
    pub fn matches(&self, vendor_id: u16, product_id: u16, usage_page: u16, interface: i32) -> bool {
        if vendor_id != self.vendor_id {
            return false;
        }
        let model_matches = self
            .product_models
            .iter()
            .any(|&model| product_id == model || product_id >> 8 == model << 4);

        model_matches && (usage_page == self.usage_page || interface == self.interface)
    }

    /// Returns the default options for one signing request.
    #[must_use]
    pub fn sign_options(&self) -> SignOptions {
        SignOptions {
            timeout: Duration::from_millis(self.exchange_timeout_ms),
            busy_wait: Duration::from_millis(self.busy_wait_ms),
            cancel: None,
        }
    }

    /// Parses a configuration from JSON; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::JsonError`] if parsing fails.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the configuration to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::JsonError`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Bounds of a single device request.
#[derive(Debug, Clone)]
pub struct SignOptions {
    /// Upper bound on each exchange, including on-device confirmation.
    pub timeout: Duration,
    /// How long to wait for another request to release the device.
    pub busy_wait: Duration,
    /// Checked before every chunk is sent.
    pub cancel: Option<CancelToken>,
}

impl Default for SignOptions {
    fn default() -> Self {
        HubConfig::default().sign_options()
    }
}

impl SignOptions {
    /// Returns these options with a different exchange timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns these options with a different busy wait.
    #[must_use]
    pub const fn with_busy_wait(mut self, busy_wait: Duration) -> Self {
        self.busy_wait = busy_wait;
        self
    }

    /// Returns these options bound to a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

/// A shareable cancellation flag.
///
/// Cancellation takes effect before the next chunk is sent; a chunk already
/// on the wire is answered by the device regardless.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`CancelToken::cancel`] was called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = HubConfig::default();
        assert_eq!(config.vendor_id, 0x2c97);
        assert_eq!(config.usage_page, 0xffa0);
        assert_eq!(config.exchange_timeout_ms, 300_000);
        assert_eq!(config.busy_wait_ms, 0);

        let options = config.sign_options();
        assert_eq!(options.timeout, Duration::from_secs(300));
        assert_eq!(options.busy_wait, Duration::ZERO);
        assert!(!options.is_cancelled());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = HubConfig::from_json(r#"{"busyWaitMs": 250, "productModels": [4]}"#).unwrap();
        assert_eq!(config.busy_wait_ms, 250);
        assert_eq!(config.product_models, vec![4]);
        assert_eq!(config.vendor_id, LEDGER_VENDOR_ID);

        let back = HubConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn product_matching() {
        let config = HubConfig::default();

        // Nano S Plus on the MMII scheme, APDU interface
        assert!(config.matches(0x2c97, 0x5011, 0xffa0, 0));
        // interface number alone is enough when the usage page is not reported
        assert!(config.matches(0x2c97, 0x5011, 0, 0));
        // wrong vendor
        assert!(!config.matches(0x1234, 0x5011, 0xffa0, 0));
        // unknown model
        assert!(!config.matches(0x2c97, 0x2011, 0xffa0, 0));
        // a bare model byte is not a product id of either scheme
        assert!(!config.matches(0x2c97, 0x0511, 0xffa0, 0));
        // other interface of the same device
        assert!(!config.matches(0x2c97, 0x5011, 0xf1d0, 1));
    }

    #[test]
    fn default_models_match_every_current_device() {
        let config = HubConfig::default();

        // Nano S, Nano X, Nano S Plus, Stax, Flex on current firmware
        for product_id in [0x1011, 0x4011, 0x5011, 0x6011, 0x7011, 0x4015, 0x5000] {
            assert!(config.matches(0x2c97, product_id, 0xffa0, 0), "{product_id:#06x}");
        }
        // the same models on legacy firmware
        for product_id in [0x0000, 0x0001, 0x0004, 0x0005, 0x0006, 0x0007] {
            assert!(config.matches(0x2c97, product_id, 0xffa0, 0), "{product_id:#06x}");
        }
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let options = SignOptions::default().with_cancel(token.clone());
        assert!(!options.is_cancelled());
        token.cancel();
        assert!(options.is_cancelled());
    }
}
