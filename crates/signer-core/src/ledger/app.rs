//! The Ledger Ethereum app instruction set.
//!
//! Each function here runs one logical request on an [`Exchange`]:
//!
//! - [`get_configuration`]: app flags and version, used as the open handshake
//! - [`get_address`]: derive (and optionally show) the account at a path
//! - [`sign_transaction`]: stream a transaction in 255-byte chunks and sign it
//! - [`sign_typed_data`]: sign an EIP-712 digest pair
//!
//! Firmware too old for a request is refused with
//! [`Error::UnsupportedOperation`] before anything is sent.
//!
//! # Example
//!
//! ```
//! use ledger_evm_signer_core::DerivationPath;
//! use ledger_evm_signer_core::ledger::app::{TransactionChunk, transaction_chunks};
//!
//! let path = DerivationPath::ethereum(0);
//! let chunks = transaction_chunks(&path, &[0xAA; 300]);
//! assert_eq!(chunks.len(), 2);
//! assert!(matches!(chunks[0], TransactionChunk::First(_)));
//! ```

use core::fmt;

use alloy_primitives::B256;
use tracing::{debug, info, warn};

use super::apdu::Apdu;
use super::session::Exchange;
use crate::address::{Account, Address, PublicKey};
use crate::config::SignOptions;
use crate::error::{Error, Result};
use crate::path::DerivationPath;
use crate::signature::{Signature, SignatureKind};
use crate::transaction::UnsignedTransaction;

/// Class byte of the Ethereum app.
pub const CLA: u8 = 0xE0;

/// Ethereum app instruction codes.
pub mod ins {
    /// `GET_ADDRESS`: public key and address at a path.
    pub const GET_ADDRESS: u8 = 0x02;
    /// `SIGN`: sign an RLP-encoded transaction.
    pub const SIGN_TRANSACTION: u8 = 0x04;
    /// `GET_APP_CONFIGURATION`: flags and version.
    pub const GET_APP_CONFIGURATION: u8 = 0x06;
    /// `SIGN_EIP712`: sign a domain hash and message hash.
    pub const SIGN_TYPED_DATA: u8 = 0x0C;
}

mod p1 {
    pub(super) const SILENT: u8 = 0x00;
    pub(super) const DISPLAY: u8 = 0x01;
    pub(super) const FIRST_CHUNK: u8 = 0x00;
    pub(super) const MORE_CHUNKS: u8 = 0x80;
}

/// P2 for `GET_ADDRESS` without chain code, and for hashed-mode `SIGN_EIP712`.
const P2_NONE: u8 = 0x00;

/// Length of a `GET_ADDRESS` public key.
const PUBLIC_KEY_LEN: usize = 65;

/// Version of the Ethereum app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Patch version.
    pub patch: u8,
}

impl AppVersion {
    /// First version with EIP-155 signing.
    pub const EIP155: Self = Self::new(1, 0, 3);
    /// First version with EIP-712 hashed-mode signing.
    pub const TYPED_DATA: Self = Self::new(1, 5, 0);
    /// First version with EIP-2930 access-list transactions.
    pub const ACCESS_LIST: Self = Self::new(1, 9, 0);

    /// Creates a version.
    #[must_use]
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    fn require(self, min: Self, what: &str) -> Result<()> {
        if self < min {
            return Err(Error::UnsupportedOperation(format!(
                "{what} needs Ethereum app {min} or newer, device runs {self}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Reply to `GET_APP_CONFIGURATION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppConfiguration {
    /// Raw app flags.
    pub flags: u8,
    /// App version.
    pub version: AppVersion,
}

impl AppConfiguration {
    /// Returns `true` if the user enabled blind signing of contract data.
    #[must_use]
    pub const fn arbitrary_data_enabled(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// One `SIGN` APDU of a chunked transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionChunk {
    /// Carries the derivation path and the start of the payload.
    First(Vec<u8>),
    /// Carries the rest of the payload.
    Continuation(Vec<u8>),
}

impl TransactionChunk {
    /// Returns the chunk bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match self {
            Self::First(data) | Self::Continuation(data) => data,
        }
    }

    /// Builds the APDU for this chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolError`] if the chunk exceeds [`Apdu::MAX_DATA`].
    pub fn to_apdu(&self) -> Result<Apdu> {
        let p1 = match self {
            Self::First(_) => p1::FIRST_CHUNK,
            Self::Continuation(_) => p1::MORE_CHUNKS,
        };
        Apdu::new(CLA, ins::SIGN_TRANSACTION, p1, P2_NONE, self.data().to_vec())
    }
}

/// Splits `path || payload` into `SIGN` chunks of at most 255 bytes.
#[must_use]
pub fn transaction_chunks(path: &DerivationPath, payload: &[u8]) -> Vec<TransactionChunk> {
    let mut buf = path.to_bytes();
    buf.extend_from_slice(payload);

    buf.chunks(Apdu::MAX_DATA)
        .enumerate()
        .map(|(i, chunk)| {
            if i == 0 {
                TransactionChunk::First(chunk.to_vec())
            } else {
                TransactionChunk::Continuation(chunk.to_vec())
            }
        })
        .collect()
}

/// Reads the app flags and version.
///
/// # Errors
///
/// Transport errors, the mapped status word, or [`Error::ProtocolError`]
/// for a reply shorter than four bytes.
pub fn get_configuration(
    exchange: &mut Exchange<'_>,
    options: &SignOptions,
) -> Result<AppConfiguration> {
    let apdu = Apdu::new(CLA, ins::GET_APP_CONFIGURATION, 0x00, 0x00, vec![])?;
    let response = exchange.transmit(&apdu, options.timeout)?;
    response.check()?;

    match response.data() {
        [flags, major, minor, patch, ..] => Ok(AppConfiguration {
            flags: *flags,
            version: AppVersion::new(*major, *minor, *patch),
        }),
        short => Err(Error::ProtocolError(format!(
            "app configuration reply is {} bytes",
            short.len()
        ))),
    }
}

/// Derives the account at `path`, optionally asking the user to confirm the
/// address on the device.
///
/// # Errors
///
/// - [`Error::UserRejected`] if `display` is set and the user declines
/// - [`Error::ProtocolError`] if the reply is malformed or its address does
///   not belong to its public key
/// - transport errors from the exchange
pub fn get_address(
    exchange: &mut Exchange<'_>,
    path: &DerivationPath,
    display: bool,
    options: &SignOptions,
) -> Result<Account> {
    if options.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let p1 = if display { p1::DISPLAY } else { p1::SILENT };
    let apdu = Apdu::new(CLA, ins::GET_ADDRESS, p1, P2_NONE, path.to_bytes())?;
    if display {
        info!(%path, "confirm the address on the device");
    }
    let response = exchange.transmit(&apdu, options.timeout)?;
    response.check()?;

    let (public_key, address) = parse_address_reply(response.data())?;
    if public_key.address() != address {
        return Err(Error::ProtocolError(format!(
            "device address {address} does not match its public key"
        )));
    }
    debug!(%path, %address, "derived account");

    Ok(Account {
        address,
        public_key,
        path: path.clone(),
    })
}

fn parse_address_reply(data: &[u8]) -> Result<(PublicKey, Address)> {
    let malformed = || Error::ProtocolError(format!("address reply of {} bytes", data.len()));

    let (&key_len, rest) = data.split_first().ok_or_else(malformed)?;
    let key_len = usize::from(key_len);
    if key_len != PUBLIC_KEY_LEN || rest.len() < key_len + 1 {
        return Err(malformed());
    }
    let (key_bytes, rest) = rest.split_at(key_len);
    let (&addr_len, rest) = rest.split_first().ok_or_else(malformed)?;
    let ascii = rest.get(..usize::from(addr_len)).ok_or_else(malformed)?;

    let public_key = PublicKey::from_bytes(key_bytes)
        .map_err(|e| Error::ProtocolError(format!("device public key: {e}")))?;
    let text = core::str::from_utf8(ascii)
        .map_err(|_| Error::ProtocolError("device address is not ASCII".to_string()))?;
    let address = Address::from_hex(text)
        .map_err(|e| Error::ProtocolError(format!("device address: {e}")))?;

    Ok((public_key, address))
}

/// Signs `tx` with the key at `path`.
///
/// The transaction is streamed in chunks; the device holds its answer to the
/// last one until the user confirms, bounded by `options.timeout`.
/// Cancellation is honoured before each chunk. A failure after the first
/// chunk was accepted poisons the exchange, closing the session.
///
/// # Errors
///
/// - [`Error::UnsupportedOperation`] if `version` is too old for `tx`
/// - [`Error::UserRejected`] if the user declines
/// - [`Error::Cancelled`] if `options.cancel` fires between chunks
/// - transport and protocol errors from the exchange
pub fn sign_transaction(
    exchange: &mut Exchange<'_>,
    path: &DerivationPath,
    tx: &UnsignedTransaction,
    options: &SignOptions,
    version: AppVersion,
) -> Result<Signature> {
    tx.validate()?;
    if tx.is_typed() {
        version.require(AppVersion::ACCESS_LIST, "signing access list transactions")?;
    } else if !tx.chain_id.is_zero() {
        version.require(AppVersion::EIP155, "EIP-155 signing")?;
    }

    let chunks = transaction_chunks(path, &tx.signing_payload());
    let count = chunks.len();
    let mut reply = Vec::new();

    for (i, chunk) in chunks.iter().enumerate() {
        if options.is_cancelled() {
            if i > 0 {
                warn!(sent = i, total = count, "signing cancelled mid-sequence");
                exchange.abort();
            }
            return Err(Error::Cancelled);
        }

        let last = i + 1 == count;
        if last {
            info!(%path, "confirm the transaction on the device");
        }
        let response = exchange.transmit(&chunk.to_apdu()?, options.timeout)?;
        if !response.is_success() {
            if !last {
                warn!(
                    chunk = i,
                    total = count,
                    status = response.status_word(),
                    "device refused a chunk mid-sequence"
                );
                exchange.poison();
            }
            return Err(response.to_error());
        }
        if last {
            reply = response.into_data();
        }
    }

    Signature::from_device_reply(&reply, &tx.signature_kind())
}

/// Signs an EIP-712 message given its domain and message hashes.
///
/// # Errors
///
/// - [`Error::UnsupportedOperation`] if `version` predates typed data
/// - [`Error::UserRejected`] if the user declines
/// - [`Error::Cancelled`] if `options.cancel` is already set
/// - transport and protocol errors from the exchange
pub fn sign_typed_data(
    exchange: &mut Exchange<'_>,
    path: &DerivationPath,
    domain_hash: &B256,
    message_hash: &B256,
    options: &SignOptions,
    version: AppVersion,
) -> Result<Signature> {
    version.require(AppVersion::TYPED_DATA, "typed data signing")?;
    if options.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut data = path.to_bytes();
    data.extend_from_slice(domain_hash.as_slice());
    data.extend_from_slice(message_hash.as_slice());
    let apdu = Apdu::new(CLA, ins::SIGN_TYPED_DATA, 0x00, P2_NONE, data)?;

    info!(%path, "confirm the message on the device");
    let response = exchange.transmit(&apdu, options.timeout)?;
    response.check()?;

    Signature::from_device_reply(response.data(), &SignatureKind::TypedData)
}
