//! Discovery of attached Ledger devices.
//!
//! The [`Hub`] owns one [`LedgerWallet`] per matching HID device. A
//! [`Hub::refresh`] pass enumerates devices, keeps wallets whose device is
//! still present, adds new ones closed, and closes and drops the ones whose
//! device went away. The new set is built aside and published in one swap,
//! so [`Hub::wallets`] always sees a whole set and never waits on USB.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use ledger_evm_signer_core::{HidBackend, Hub, HubConfig};
//!
//! let hub = Arc::new(Hub::new(Arc::new(HidBackend::new()?), HubConfig::default())?);
//! let refresher = hub.spawn_refresher(Duration::from_secs(1));
//!
//! for wallet in hub.wallets() {
//!     println!("{} {}", wallet.path(), wallet.status());
//! }
//! refresher.stop();
//! ```

use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use super::wallet::LedgerWallet;
use super::{DeviceBackend, DeviceInfo};
use crate::config::HubConfig;
use crate::error::{Error, Result};

/// Outcome of one [`Hub::refresh`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Paths of devices seen for the first time.
    pub added: Vec<String>,
    /// Paths of devices that went away.
    pub removed: Vec<String>,
}

impl RefreshReport {
    /// Returns `true` if the wallet set did not change.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

type WalletSet = Arc<Vec<Arc<LedgerWallet>>>;

/// Registry of attached Ledger wallets.
pub struct Hub {
    backend: Arc<dyn DeviceBackend>,
    config: HubConfig,
    wallets: RwLock<WalletSet>,
    refresh_lock: Mutex<()>,
}

impl core::fmt::Debug for Hub {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hub")
            .field("config", &self.config)
            .field("wallets", &self.wallets().len())
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Creates a hub and runs a first discovery pass.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if enumeration fails.
    pub fn new(backend: Arc<dyn DeviceBackend>, config: HubConfig) -> Result<Self> {
        let hub = Self {
            backend,
            config,
            wallets: RwLock::new(Arc::new(Vec::new())),
            refresh_lock: Mutex::new(()),
        };
        hub.refresh()?;
        Ok(hub)
    }

    /// Returns the configuration the hub was built with.
    #[must_use]
    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Returns the current wallets, ordered by device path.
    #[must_use]
    pub fn wallets(&self) -> WalletSet {
        Arc::clone(&self.wallets.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Returns the wallet at `index` in [`Hub::wallets`] order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if there is no such wallet.
    pub fn wallet(&self, index: usize) -> Result<Arc<LedgerWallet>> {
        self.wallets()
            .get(index)
            .cloned()
            .ok_or(Error::DeviceNotFound(None))
    }

    /// Returns the wallet of the device at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if no such device is attached.
    pub fn wallet_by_path(&self, path: &str) -> Result<Arc<LedgerWallet>> {
        self.wallets()
            .iter()
            .find(|wallet| wallet.path() == path)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(Some(path.to_string())))
    }

    /// Runs one discovery pass and publishes the result.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if enumeration fails; the published set
    /// is left as it was.
    pub fn refresh(&self) -> Result<RefreshReport> {
        let _guard = self
            .refresh_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let found: BTreeMap<String, DeviceInfo> = self
            .backend
            .enumerate()?
            .into_iter()
            .filter(|d| {
                self.config
                    .matches(d.vendor_id, d.product_id, d.usage_page, d.interface)
            })
            .map(|d| (d.path.clone(), d))
            .collect();

        let current = self.wallets();
        let mut report = RefreshReport::default();
        let mut removed = Vec::new();
        for wallet in current.iter() {
            if !found.contains_key(wallet.path()) {
                report.removed.push(wallet.path().to_string());
                removed.push(Arc::clone(wallet));
            }
        }

        let next: Vec<Arc<LedgerWallet>> = found
            .into_values()
            .map(|info| {
                current
                    .iter()
                    .find(|wallet| wallet.path() == info.path)
                    .cloned()
                    .unwrap_or_else(|| {
                        report.added.push(info.path.clone());
                        Arc::new(LedgerWallet::new(
                            info,
                            Arc::clone(&self.backend),
                            self.config.sign_options(),
                        ))
                    })
            })
            .collect();

        *self.wallets.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);

        for wallet in removed {
            wallet.close();
        }
        if report.is_unchanged() {
            debug!("device set unchanged");
        } else {
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                "device set changed"
            );
        }
        Ok(report)
    }

    /// Runs [`Hub::refresh`] every `interval` on a background thread until
    /// the returned handle is stopped or dropped.
    #[must_use]
    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration) -> RefresherHandle {
        let (stop, stopped) = mpsc::channel::<()>();
        let hub = Arc::clone(self);

        let thread = thread::spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = hub.refresh() {
                            warn!(error = %e, "device refresh failed");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("refresher stopped");
        });

        RefresherHandle {
            stop: Some(stop),
            thread: Some(thread),
        }
    }
}

/// Keeps a background refresher alive.
#[derive(Debug)]
pub struct RefresherHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RefresherHandle {
    /// Stops the refresher and waits for its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            // a send error means the thread is already gone
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("refresher thread panicked");
        }
    }
}

impl Drop for RefresherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
