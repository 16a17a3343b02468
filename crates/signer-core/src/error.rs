//! Error types for the Ledger EVM signer library.
//!
//! This module provides a single error type [`enum@Error`] covering every
//! failure mode between the caller and the Ledger Ethereum app.
//!
//! # Error Categories
//!
//! - **Local validation**: [`Error::InvalidPath`], [`Error::SchemaError`],
//!   [`Error::NotOpen`]. Raised before any device I/O and never worth retrying.
//! - **Device outcome**: [`Error::UserRejected`], [`Error::UnsupportedOperation`].
//!   Terminal for the request; surface them to the user as-is.
//! - **Contention**: [`Error::DeviceBusy`], [`Error::Timeout`]. Safe to retry
//!   once the in-flight exchange is over (after a timeout, reopen first).
//! - **Protocol**: [`Error::ProtocolError`] for malformed replies and status
//!   words the taxonomy does not recognize.
//!
//! # Example
//!
//! ```
//! use ledger_evm_signer_core::Error;
//!
//! let err = Error::DeviceBusy;
//! assert!(err.is_retryable());
//! assert!(!Error::UserRejected.is_retryable());
//! ```

use alloy_rlp::Error as AlloyRlpError;
use core::result::Result as CoreResult;
use hex::FromHexError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// The main error type for the Ledger EVM signer library.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Local validation errors
    // =========================================================================
    /// The derivation path is malformed.
    #[error("invalid derivation path: {0}")]
    InvalidPath(String),

    /// The session is not open.
    #[error("device session is not open")]
    NotOpen,

    /// The EIP-712 schema is inconsistent.
    #[error("typed data schema error: {0}")]
    SchemaError(String),

    /// An address string is malformed or fails its checksum.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The transaction cannot be signed as given.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// The account was never derived by this wallet.
    #[error("unknown account {0}")]
    UnknownAccount(String),

    // =========================================================================
    // Device errors
    // =========================================================================
    /// No matching wallet for the requested index or path.
    #[error("no Ledger device found{}", .0.as_deref().map(|d| format!(" at {d}")).unwrap_or_default())]
    DeviceNotFound(Option<String>),

    /// The user declined the request on the device.
    #[error("request rejected on the device")]
    UserRejected,

    /// The device or its firmware does not support the request.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Another exchange already holds the session.
    #[error("device is busy with another request")]
    DeviceBusy,

    /// No response within the caller's bound.
    #[error("device did not answer within {0:?}")]
    Timeout(core::time::Duration),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The device replied with something this library cannot interpret.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Reading from or writing to the HID device failed.
    #[error("transport error: {0}")]
    Transport(String),

    // =========================================================================
    // Cryptographic errors
    // =========================================================================
    /// The public key is invalid or malformed.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The signature is invalid or malformed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The device signature does not recover to the requested account.
    #[error("signature recovers to {recovered}, expected {expected}")]
    AccountMismatch {
        /// The account the caller asked to sign with.
        expected: String,
        /// The address recovered from the device signature.
        recovered: String,
    },

    // =========================================================================
    // Serialization errors
    // =========================================================================
    /// Failed to parse hex data.
    #[error("hex decoding failed: {0}")]
    HexDecodeFailed(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    JsonError(String),

    /// RLP encoding or decoding failed.
    #[error("RLP error: {0}")]
    RlpError(String),
}

impl Error {
    /// Returns `true` when retrying the same request later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceBusy | Self::Timeout(_))
    }

    /// Returns `true` for caller misuse detected before any device I/O.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath(_) | Self::SchemaError(_) | Self::NotOpen
        )
    }
}

impl From<FromHexError> for Error {
    fn from(err: FromHexError) -> Self {
        Error::HexDecodeFailed(err.to_string())
    }
}

impl From<SerdeJsonError> for Error {
    fn from(err: SerdeJsonError) -> Self {
        Error::JsonError(err.to_string())
    }
}

impl From<AlloyRlpError> for Error {
    fn from(err: AlloyRlpError) -> Self {
        Error::RlpError(err.to_string())
    }
}

/// A specialized [`Result`] type for Ledger EVM signer operations.
pub type Result<T> = CoreResult<T, Error>;
