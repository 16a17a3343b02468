//! Ledger EVM Signer Core Library
//!
//! This crate derives Ethereum accounts on a Ledger hardware wallet and
//! signs transactions and EIP-712 typed data with them, talking to the
//! device's Ethereum app over USB HID.
//!
//! # Overview
//!
//! Private keys never leave the device. The host sends a derivation path and
//! the bytes to sign; the device shows them to the user, waits for approval
//! and answers with a signature. This library provides:
//!
//! - **Derivation paths**: BIP-32 path parsing and the device's binary encoding
//! - **Transactions**: legacy (with EIP-155 replay protection) and EIP-2930
//!   access-list transactions, chunked to the device and re-encoded signed
//! - **EIP-712**: schema validation and structured hashing before any I/O
//! - **Signatures**: one place that turns the device's recovery byte into `v`,
//!   and signer recovery to check the device signed with the right key
//! - **Devices**: HID framing, exclusive sessions, and a hub that tracks
//!   Ledgers as they are plugged and unplugged
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transaction  │   EIP-712    │   Address    │   Signature   │
//! │   Encoding    │   Hashing    │  Formatting  │   Recovery    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     Ledger Layer                            │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────────────┐ │
//! │  │   Hub   │  │ Wallet  │  │   App   │  │     Session     │ │
//! │  │         │  │         │  │  (APDU) │  │   (exclusive)   │ │
//! │  └─────────┘  └─────────┘  └─────────┘  └─────────────────┘ │
//! ├─────────────────────────────────────────────────────────────┤
//! │            Transport Layer (64-byte HID reports)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ## Building a Transaction
//!
//! ```rust
//! use alloy_primitives::U256;
//! use ledger_evm_signer_core::UnsignedTransaction;
//!
//! let tx = UnsignedTransaction::new_legacy(
//!     3,
//!     U256::from(10),
//!     10,
//!     "0x3535353535353535353535353535353535353535",
//!     U256::from(10),
//!     vec![],
//! )
//! .unwrap()
//! .with_chain_id(U256::from(1));
//!
//! // the digest the device will sign
//! let hash = tx.signing_hash();
//! # let _ = hash;
//! ```
//!
//! ## Hashing EIP-712 Typed Data
//!
//! ```rust
//! use alloy_primitives::U256;
//! use ledger_evm_signer_core::{Eip712Domain, TypedData};
//! use serde_json::json;
//!
//! let domain = Eip712Domain {
//!     name: Some("My DApp".to_string()),
//!     version: Some("1".to_string()),
//!     chain_id: Some(U256::from(1)),
//!     verifying_contract: None,
//!     salt: None,
//! };
//!
//! let types = json!({
//!     "Transfer": [
//!         {"name": "to", "type": "address"},
//!         {"name": "amount", "type": "uint256"}
//!     ]
//! });
//!
//! let message = json!({
//!     "to": "0x0000000000000000000000000000000000000001",
//!     "amount": "1000000000000000000"
//! });
//!
//! let typed_data = TypedData::new(domain, types, "Transfer".to_string(), message).unwrap();
//! let hash = typed_data.signing_hash().unwrap();
//! # let _ = hash;
//! ```
//!
//! ## Parsing a Derivation Path
//!
//! ```rust
//! use ledger_evm_signer_core::DerivationPath;
//!
//! let path: DerivationPath = "m/44'/60'/0'/0/0".parse().unwrap();
//! assert_eq!(path, DerivationPath::ethereum(0));
//! assert_eq!(path.to_bytes().len(), 1 + 5 * 4);
//! ```
//!
//! # Ledger Integration
//!
//! Devices are reached through a [`ledger::DeviceBackend`]. With the
//! `hidapi` feature, [`ledger::HidBackend`] talks to real hardware:
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use ledger_evm_signer_core::ledger::{HidBackend, Hub};
//! use ledger_evm_signer_core::{DerivationPath, HubConfig};
//!
//! let hub = Hub::new(Arc::new(HidBackend::new()?), HubConfig::default())?;
//! let wallet = hub.wallet(0)?;
//! wallet.open()?;
//!
//! // ask the user to confirm the address on the device
//! let account = wallet.derive(&DerivationPath::ethereum(0), true)?;
//!
//! // sign; the device waits for the user to approve
//! let signed = wallet.sign_transaction(&account, &tx)?;
//! let raw = signed.encoded();
//! ```
//!
//! # Feature Flags
//!
//! - `hidapi`: USB HID device access through the `hidapi` crate
//!
//! # Security Considerations
//!
//! - Private keys never leave the Ledger
//! - Every signature is checked against the account that was asked to sign
//! - Typed data is validated and hashed on the host before the device is
//!   contacted
//! - A request that fails halfway through a multi-chunk exchange closes the
//!   device session; it has to be reopened before the next request

// Modules
pub mod address;
pub mod config;
pub mod crypto;
pub mod eip712;
pub mod error;
pub mod ledger;
pub mod path;
pub mod signature;
pub mod transaction;

// Re-exports for convenience
pub use address::{Account, Address, PublicKey};
pub use config::{CancelToken, HubConfig, SignOptions};
pub use eip712::{Eip712Domain, TypeField, TypedData};
pub use error::{Error, Result};
pub use ledger::{DeviceBackend, DeviceInfo, Hub, LedgerWallet, Transport, WalletStatus};
pub use path::DerivationPath;
pub use signature::{Signature, SignatureKind};
pub use transaction::{AccessListEntry, SignedTransaction, UnsignedTransaction};

#[cfg(feature = "hidapi")]
pub use ledger::HidBackend;

// Re-export commonly used alloy types
pub use alloy_primitives::{B256, U256};

// Dev-dependencies used only by integration tests and the example
#[cfg(test)]
use bip39 as _;
#[cfg(test)]
use coins_bip32 as _;
#[cfg(test)]
use tracing_subscriber as _;
