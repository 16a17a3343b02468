//! Ethereum addresses, uncompressed secp256k1 public keys, and accounts.
//!
//! Addresses are always rendered with the EIP-55 mixed-case checksum and
//! accepted case-insensitively on input. [`Address::parse_strict`] is the
//! opt-in mode that also rejects text whose casing disagrees with the
//! computed checksum.
//!
//! The address of a public key is derived the standard way:
//!
//! 1. Take the uncompressed public key (65 bytes: `0x04 || x || y`)
//! 2. Remove the `0x04` prefix to get 64 bytes (`x || y`)
//! 3. Compute the Keccak-256 hash of the 64 bytes
//! 4. Take the last 20 bytes of the hash as the address
//!
//! # Example
//!
//! ```
//! use ledger_evm_signer_core::Address;
//!
//! let addr: Address = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed".parse().unwrap();
//! assert_eq!(addr.to_string(), "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed");
//! ```

use core::fmt;
use core::str::FromStr;

use alloy_primitives::{Address as AlloyAddress, keccak256};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::{Error, Result};
use crate::path::DerivationPath;

/// An Ethereum address (20 bytes).
///
/// This is a wrapper around [`alloy_primitives::Address`] whose text form is
/// always the checksummed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(AlloyAddress);

impl Address {
    /// The length of an Ethereum address in bytes.
    pub const BYTE_LEN: usize = 20;

    /// Creates a new address from a 20-byte array.
    #[must_use]
    pub const fn new(bytes: [u8; Self::BYTE_LEN]) -> Self {
        Self(AlloyAddress::new(bytes))
    }

    /// Returns the zero address (`0x0000...0000`).
    #[must_use]
    pub const fn zero() -> Self {
        Self(AlloyAddress::ZERO)
    }

    /// Checks if this is the zero address.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Derives an Ethereum address from raw uncompressed public key bytes.
    ///
    /// # Arguments
    ///
    /// * `bytes` - Either 65 bytes (`0x04 || x || y`) or 64 bytes (`x || y`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPublicKey`] if:
    /// - The byte length is not 64 or 65
    /// - For 65-byte input, the first byte is not `0x04`
    pub fn from_public_key_bytes(bytes: &[u8]) -> Result<Self> {
        let coordinates = match bytes.len() {
            64 => bytes,
            65 => {
                if bytes[0] != 0x04 {
                    return Err(Error::InvalidPublicKey(
                        "65-byte public key must start with 0x04".to_string(),
                    ));
                }
                &bytes[1..]
            }
            len => {
                return Err(Error::InvalidPublicKey(format!(
                    "expected 64 or 65 bytes, got {len}"
                )));
            }
        };

        let hash = keccak256(coordinates);
        let mut address_bytes = [0u8; Self::BYTE_LEN];
        address_bytes.copy_from_slice(&hash[12..]);

        Ok(Self::new(address_bytes))
    }

    /// Returns the [`Address`] as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; Self::BYTE_LEN] {
        self.0.as_ref()
    }

    /// Returns the [`Address`] as a 20-byte array.
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; Self::BYTE_LEN] {
        self.0.0.0
    }

    /// Returns the [`Address`] as an EIP-55 checksummed hex string.
    ///
    /// # Example
    ///
    /// ```
    /// use ledger_evm_signer_core::Address;
    ///
    /// let addr = Address::new([0x35; 20]);
    /// assert_eq!(addr.to_checksum_hex(), "0x3535353535353535353535353535353535353535");
    /// ```
    #[must_use]
    pub fn to_checksum_hex(&self) -> String {
        self.0.to_checksum(None)
    }

    /// Returns the [`Address`] as a lowercase hex string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.as_bytes()))
    }

    /// Parses an [`Address`] from hex, ignoring letter case.
    ///
    /// # Arguments
    ///
    /// * `hex_str` - A hex string, optionally prefixed with `0x`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] for non-hex characters, an odd
    /// number of digits, or a decoded length other than 20 bytes.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let digits = strip_hex_prefix(hex_str.trim());
        let bytes = hex::decode(digits)
            .map_err(|e| Error::InvalidAddress(format!("{hex_str:?}: {e}")))?;

        let address_bytes: [u8; Self::BYTE_LEN] = bytes.as_slice().try_into().map_err(|_| {
            Error::InvalidAddress(format!(
                "{hex_str:?}: expected {} bytes, got {}",
                Self::BYTE_LEN,
                bytes.len()
            ))
        })?;

        Ok(Self::new(address_bytes))
    }

    /// Parses an [`Address`] and requires its casing to match the EIP-55
    /// checksum exactly.
    ///
    /// # Errors
    ///
    /// Everything [`Address::from_hex`] rejects, plus
    /// [`Error::InvalidAddress`] when the casing disagrees with the checksum.
    ///
    /// # Example
    ///
    /// ```
    /// use ledger_evm_signer_core::Address;
    ///
    /// assert!(Address::parse_strict("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").is_ok());
    /// assert!(Address::parse_strict("0x5AAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").is_err());
    /// ```
    pub fn parse_strict(hex_str: &str) -> Result<Self> {
        let address = Self::from_hex(hex_str)?;
        let checksum = address.to_checksum_hex();
        if strip_hex_prefix(hex_str.trim()) != &checksum[2..] {
            return Err(Error::InvalidAddress(format!(
                "{hex_str:?} does not match checksum {checksum}"
            )));
        }
        Ok(address)
    }

    /// Returns the inner [`alloy_primitives::Address`].
    #[must_use]
    pub const fn inner(&self) -> AlloyAddress {
        self.0
    }
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum_hex())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(de::Error::custom)
    }
}

impl From<AlloyAddress> for Address {
    fn from(addr: AlloyAddress) -> Self {
        Self(addr)
    }
}

impl From<Address> for AlloyAddress {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self::new(bytes)
    }
}

/// An uncompressed secp256k1 public key (`0x04 || X || Y`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PublicKey::BYTE_LEN]);

impl PublicKey {
    /// Length of the uncompressed point.
    pub const BYTE_LEN: usize = 65;

    /// Wraps raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPublicKey`] unless `bytes` is 65 bytes long and
    /// starts with `0x04`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; Self::BYTE_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                Self::BYTE_LEN,
                bytes.len()
            ))
        })?;
        if key[0] != 0x04 {
            return Err(Error::InvalidPublicKey(format!(
                "expected uncompressed prefix 0x04, got {:#04x}",
                key[0]
            )));
        }
        Ok(Self(key))
    }

    /// Parses a `0x`-prefixed (or bare) hex public key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HexDecodeFailed`] for invalid hex and
    /// [`Error::InvalidPublicKey`] for a malformed point encoding.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(strip_hex_prefix(hex_str.trim()))?;
        Self::from_bytes(&bytes)
    }

    /// Returns the raw 65 bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::BYTE_LEN] {
        &self.0
    }

    /// Returns the `0x`-prefixed lowercase hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Derives the Ethereum address of this key.
    #[must_use]
    pub fn address(&self) -> Address {
        let hash = keccak256(&self.0[1..]);
        let mut address_bytes = [0u8; Address::BYTE_LEN];
        address_bytes.copy_from_slice(&hash[12..]);
        Address::new(address_bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(de::Error::custom)
    }
}

/// An account derived on the device.
///
/// Only the signing pipeline builds these, from a device reply whose ASCII
/// address has been checked against the public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    /// Checksummed account address.
    pub address: Address,
    /// Uncompressed public key reported by the device.
    pub public_key: PublicKey,
    /// Path the account was derived at.
    pub path: DerivationPath,
}
