//! One attached Ledger, driven through its Ethereum app.
//!
//! A [`LedgerWallet`] is created closed by the [`Hub`](super::Hub). Calling
//! [`LedgerWallet::open`] opens the HID device and runs the app
//! configuration handshake; from then on accounts can be derived and used to
//! sign. The wallet remembers every account it derived and refuses to sign
//! for any other, and it checks every signature it gets back against the
//! account it asked for.
//!
//! # Example
//!
//! ```ignore
//! use ledger_evm_signer_core::{DerivationPath, Hub, HubConfig};
//!
//! let hub = Hub::new(backend, HubConfig::default())?;
//! let wallet = hub.wallet(0)?;
//! wallet.open()?;
//!
//! let account = wallet.derive(&DerivationPath::ethereum(0), false)?;
//! let signed = wallet.sign_transaction(&account, &tx)?;
//! ```

use core::fmt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info};

use super::app::{self, AppConfiguration, AppVersion};
use super::session::Session;
use super::{DeviceBackend, DeviceInfo};
use crate::address::{Account, Address};
use crate::config::SignOptions;
use crate::crypto;
use crate::eip712::{self, TypedData};
use crate::error::{Error, Result};
use crate::path::DerivationPath;
use crate::signature::Signature;
use crate::transaction::{SignedTransaction, UnsignedTransaction};

/// What a wallet is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletStatus {
    /// Not open; only [`LedgerWallet::open`] is possible.
    Closed,
    /// Open and idle.
    Ready(AppVersion),
    /// Open, with a request in flight.
    Busy(AppVersion),
}

impl fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Ready(version) => write!(f, "Ethereum app v{version}, ready"),
            Self::Busy(version) => write!(f, "Ethereum app v{version}, busy"),
        }
    }
}

/// A Ledger device and the accounts derived on it.
pub struct LedgerWallet {
    info: DeviceInfo,
    backend: Arc<dyn DeviceBackend>,
    session: Session,
    open_lock: Mutex<()>,
    configuration: Mutex<Option<AppConfiguration>>,
    accounts: RwLock<BTreeMap<Address, Account>>,
    defaults: SignOptions,
}

impl fmt::Debug for LedgerWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerWallet")
            .field("path", &self.info.path)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl LedgerWallet {
    /// Creates a closed wallet for `info`.
    ///
    /// `defaults` bound every request made without explicit options.
    #[must_use]
    pub fn new(info: DeviceInfo, backend: Arc<dyn DeviceBackend>, defaults: SignOptions) -> Self {
        Self {
            info,
            backend,
            session: Session::new(),
            open_lock: Mutex::new(()),
            configuration: Mutex::new(None),
            accounts: RwLock::new(BTreeMap::new()),
            defaults,
        }
    }

    /// Returns the HID device this wallet drives.
    #[must_use]
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Returns the platform path of the device.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.info.path
    }

    /// Returns the options used when none are given.
    #[must_use]
    pub const fn default_options(&self) -> &SignOptions {
        &self.defaults
    }

    /// Opens the device and checks that the Ethereum app answers.
    ///
    /// Does nothing if the wallet is already open.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] or [`Error::Transport`] if the device
    ///   cannot be opened
    /// - [`Error::UnsupportedOperation`] if the Ethereum app is not running
    /// - [`Error::Timeout`] if the handshake is not answered
    pub fn open(&self) -> Result<()> {
        let _guard = self.open_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.session.is_open() {
            return Ok(());
        }

        let transport = self.backend.open(&self.info)?;
        self.session.attach(transport);

        let handshake = self
            .session
            .begin(self.defaults.busy_wait)
            .and_then(|mut exchange| app::get_configuration(&mut exchange, &self.defaults));

        match handshake {
            Ok(configuration) => {
                info!(
                    path = %self.info.path,
                    version = %configuration.version,
                    "wallet opened"
                );
                *self.lock_configuration() = Some(configuration);
                Ok(())
            }
            Err(e) => {
                debug!(path = %self.info.path, error = %e, "handshake failed");
                self.session.close();
                Err(e)
            }
        }
    }

    /// Closes the device and forgets the derived accounts. Safe to call
    /// any number of times.
    pub fn close(&self) {
        self.session.close();
        *self.lock_configuration() = None;
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Returns `true` while the device is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    /// Returns the wallet status.
    #[must_use]
    pub fn status(&self) -> WalletStatus {
        match self.app_version() {
            Err(_) => WalletStatus::Closed,
            Ok(version) if self.session.is_busy() => WalletStatus::Busy(version),
            Ok(version) => WalletStatus::Ready(version),
        }
    }

    /// Returns the Ethereum app version read when the wallet was opened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotOpen`] if the wallet is closed.
    pub fn app_version(&self) -> Result<AppVersion> {
        self.app_configuration().map(|c| c.version)
    }

    /// Returns the Ethereum app configuration read when the wallet was
    /// opened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotOpen`] if the wallet is closed.
    pub fn app_configuration(&self) -> Result<AppConfiguration> {
        if !self.session.is_open() {
            return Err(Error::NotOpen);
        }
        (*self.lock_configuration()).ok_or(Error::NotOpen)
    }

    fn lock_configuration(&self) -> std::sync::MutexGuard<'_, Option<AppConfiguration>> {
        self.configuration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Derives the account at `path` with the default options.
    ///
    /// # Errors
    ///
    /// See [`LedgerWallet::derive_with`].
    pub fn derive(&self, path: &DerivationPath, display: bool) -> Result<Account> {
        self.derive_with(path, display, &self.defaults)
    }

    /// Derives the account at `path` and remembers it for signing.
    ///
    /// With `display` set the user is asked to confirm the address on the
    /// device.
    ///
    /// # Errors
    ///
    /// - [`Error::NotOpen`] if the wallet is closed
    /// - [`Error::DeviceBusy`] if another request holds the device
    /// - [`Error::UserRejected`] if the user declines the address
    /// - transport and protocol errors
    pub fn derive_with(
        &self,
        path: &DerivationPath,
        display: bool,
        options: &SignOptions,
    ) -> Result<Account> {
        let account = {
            let mut exchange = self.session.begin(options.busy_wait)?;
            app::get_address(&mut exchange, path, display, options)?
        };

        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.address, account.clone());
        Ok(account)
    }

    /// Returns the derived accounts, ordered by path.
    #[must_use]
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self
            .accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.path.cmp(&b.path));
        accounts
    }

    /// Returns `true` if `address` was derived on this wallet.
    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(address)
    }

    fn derived_path(&self, account: &Account) -> Result<DerivationPath> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&account.address)
            .map(|known| known.path.clone())
            .ok_or_else(|| Error::UnknownAccount(account.address.to_string()))
    }

    /// Signs `tx` with the default options.
    ///
    /// # Errors
    ///
    /// See [`LedgerWallet::sign_transaction_with`].
    pub fn sign_transaction(
        &self,
        account: &Account,
        tx: &UnsignedTransaction,
    ) -> Result<SignedTransaction> {
        self.sign_transaction_with(account, tx, &self.defaults)
    }

    /// Signs `tx` with `account`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransaction`] if `tx` cannot be encoded
    /// - [`Error::NotOpen`] if the wallet is closed
    /// - [`Error::UnknownAccount`] if `account` was not derived here
    /// - [`Error::UnsupportedOperation`] if the app is too old for `tx`
    /// - [`Error::DeviceBusy`], [`Error::Timeout`], [`Error::Cancelled`]
    /// - [`Error::UserRejected`] if the user declines
    /// - [`Error::AccountMismatch`] if another key signed
    pub fn sign_transaction_with(
        &self,
        account: &Account,
        tx: &UnsignedTransaction,
        options: &SignOptions,
    ) -> Result<SignedTransaction> {
        tx.validate()?;
        let version = self.app_version()?;
        let path = self.derived_path(account)?;

        let signature = {
            let mut exchange = self.session.begin(options.busy_wait)?;
            app::sign_transaction(&mut exchange, &path, tx, options, version)?
        };

        crypto::verify_signer(&tx.signing_hash(), &signature, &account.address)?;
        debug!(address = %account.address, "transaction signed");
        Ok(SignedTransaction::new(tx.clone(), signature))
    }

    /// Signs `typed_data` with the default options.
    ///
    /// # Errors
    ///
    /// See [`LedgerWallet::sign_typed_data_with`].
    pub fn sign_typed_data(&self, account: &Account, typed_data: &TypedData) -> Result<Signature> {
        self.sign_typed_data_with(account, typed_data, &self.defaults)
    }

    /// Signs EIP-712 `typed_data` with `account`.
    ///
    /// The schema is checked and hashed before the device is touched.
    ///
    /// # Errors
    ///
    /// - [`Error::SchemaError`] if the schema or message is inconsistent
    /// - [`Error::NotOpen`], [`Error::UnknownAccount`]
    /// - [`Error::UnsupportedOperation`] if the app predates typed data
    /// - [`Error::DeviceBusy`], [`Error::Timeout`], [`Error::Cancelled`]
    /// - [`Error::UserRejected`] if the user declines
    /// - [`Error::AccountMismatch`] if another key signed
    pub fn sign_typed_data_with(
        &self,
        account: &Account,
        typed_data: &TypedData,
        options: &SignOptions,
    ) -> Result<Signature> {
        typed_data.validate()?;
        let domain_hash = typed_data.domain_hash()?;
        let message_hash = typed_data.message_hash()?;

        let version = self.app_version()?;
        let path = self.derived_path(account)?;

        let signature = {
            let mut exchange = self.session.begin(options.busy_wait)?;
            app::sign_typed_data(
                &mut exchange,
                &path,
                &domain_hash,
                &message_hash,
                options,
                version,
            )?
        };

        let digest = eip712::signing_hash(&domain_hash, &message_hash);
        crypto::verify_signer(&digest, &signature, &account.address)?;
        debug!(address = %account.address, "typed data signed");
        Ok(signature)
    }
}
