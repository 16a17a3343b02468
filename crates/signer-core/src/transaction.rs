//! Unsigned transactions, their device signing payload, and signed encodings.
//!
//! Two transaction variants are supported:
//!
//! - **Legacy**: `rlp([nonce, gasPrice, gasLimit, to, value, data])`, with
//!   `chainId, 0, 0` appended when the chain id is non-zero ([EIP-155]).
//! - **Access list** ([EIP-2930]): `0x01 || rlp([chainId, nonce, gasPrice,
//!   gasLimit, to, value, data, accessList])`.
//!
//! The variant is picked by the presence of an access list.
//!
//! # Signing Flow
//!
//! 1. Build an [`UnsignedTransaction`]
//! 2. The device receives [`UnsignedTransaction::signing_payload`] after the
//!    derivation path and signs `keccak256` of it
//! 3. The returned signature and the transaction form a [`SignedTransaction`]
//!    ready for broadcasting via [`SignedTransaction::encoded`]
//!
//! # Example
//!
//! ```
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
//! .unwrap();
//!
//! assert_eq!(tx.signing_payload()[0], 0xda);
//! ```
//!
//! [EIP-155]: https://eips.ethereum.org/EIPS/eip-155
//! [EIP-2930]: https://eips.ethereum.org/EIPS/eip-2930

use alloy_primitives::{B256, U256, keccak256};
use alloy_rlp::Encodable;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::crypto;
use crate::error::{Error, Result};
use crate::signature::{Signature, SignatureKind};

/// An access list entry for EIP-2930 transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessListEntry {
    /// The address being accessed.
    pub address: Address,

    /// The storage keys being accessed at this address.
    pub storage_keys: Vec<B256>,
}

/// A transaction as composed by the caller, before signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransaction {
    /// The transaction nonce.
    pub nonce: u64,

    /// The gas price in wei.
    pub gas_price: U256,

    /// The gas limit.
    pub gas_limit: u64,

    /// The recipient address, or `None` for contract creation.
    pub to: Option<Address>,

    /// The value to transfer in wei.
    pub value: U256,

    /// The transaction input data.
    #[serde(with = "hex_data", default)]
    pub data: Vec<u8>,

    /// The chain id; zero signs without replay protection.
    #[serde(default)]
    pub chain_id: U256,

    /// Present for EIP-2930 transactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_list: Option<Vec<AccessListEntry>>,
}

/// Serde helper for `0x`-prefixed hex byte strings.
mod hex_data {
    use hex::{decode, encode};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub(super) fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", encode(bytes)))
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        decode(s).map_err(de::Error::custom)
    }
}

impl UnsignedTransaction {
    /// The transaction type identifier for EIP-2930.
    pub const ACCESS_LIST_TX_TYPE: u8 = 0x01;

    /// Builds a legacy transaction on chain id zero, parsing `to` from text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] when `to` is not 20 bytes of hex.
    pub fn new_legacy(
        nonce: u64,
        gas_price: U256,
        gas_limit: u64,
        to: &str,
        value: U256,
        data: Vec<u8>,
    ) -> Result<Self> {
        Ok(Self {
            nonce,
            gas_price,
            gas_limit,
            to: Some(Address::from_hex(to)?),
            value,
            data,
            chain_id: U256::ZERO,
            access_list: None,
        })
    }

    /// Returns the transaction with its chain id replaced.
    #[must_use]
    pub fn with_chain_id(mut self, chain_id: U256) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// Returns the transaction turned into an EIP-2930 one.
    #[must_use]
    pub fn with_access_list(mut self, access_list: Vec<AccessListEntry>) -> Self {
        self.access_list = Some(access_list);
        self
    }

    /// Returns `true` for EIP-2930 (typed) transactions.
    #[must_use]
    pub const fn is_typed(&self) -> bool {
        self.access_list.is_some()
    }

    /// Returns how `v` is encoded for this transaction.
    #[must_use]
    pub const fn signature_kind(&self) -> SignatureKind {
        if self.is_typed() {
            SignatureKind::TypedTransaction
        } else {
            SignatureKind::Legacy {
                chain_id: self.chain_id,
            }
        }
    }

    /// Checks that the transaction can be encoded for signing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransaction`] for an access-list transaction
    /// without a chain id.
    pub fn validate(&self) -> Result<()> {
        if self.is_typed() && self.chain_id.is_zero() {
            return Err(Error::InvalidTransaction(
                "access list transactions require a chain id".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the bytes the device hashes and signs.
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.data.len());

        match &self.access_list {
            None => encode_rlp_list(&mut buf, |buf| {
                self.encode_legacy_fields(buf);
                if !self.chain_id.is_zero() {
                    self.chain_id.encode(buf);
                    0u8.encode(buf);
                    0u8.encode(buf);
                }
            }),
            Some(access_list) => {
                buf.push(Self::ACCESS_LIST_TX_TYPE);
                encode_rlp_list(&mut buf, |buf| {
                    self.encode_access_list_fields(access_list, buf);
                });
            }
        }

        buf
    }

    /// Returns the hash the device signs.
    #[must_use]
    pub fn signing_hash(&self) -> B256 {
        keccak256(self.signing_payload())
    }

    /// Parses a transaction from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::JsonError`] if parsing fails.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the transaction to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::JsonError`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn encode_legacy_fields(&self, out: &mut Vec<u8>) {
        self.nonce.encode(out);
        self.gas_price.encode(out);
        self.gas_limit.encode(out);
        encode_optional_address(self.to.as_ref(), out);
        self.value.encode(out);
        self.data.as_slice().encode(out);
    }

    fn encode_access_list_fields(&self, access_list: &[AccessListEntry], out: &mut Vec<u8>) {
        self.chain_id.encode(out);
        self.encode_legacy_fields(out);
        encode_access_list(access_list, out);
    }
}

/// A transaction together with the device signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// The transaction that was signed.
    pub tx: UnsignedTransaction,
    /// The device signature, `v` already in its final form.
    pub signature: Signature,
}

impl SignedTransaction {
    /// Pairs a transaction with its signature.
    #[must_use]
    pub const fn new(tx: UnsignedTransaction, signature: Signature) -> Self {
        Self { tx, signature }
    }

    /// Returns the network encoding, ready for `eth_sendRawTransaction`.
    #[must_use]
    pub fn encoded(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(192 + self.tx.data.len());
        let sig = &self.signature;

        match &self.tx.access_list {
            None => encode_rlp_list(&mut buf, |buf| {
                self.tx.encode_legacy_fields(buf);
                sig.v().encode(buf);
                sig.r().encode(buf);
                sig.s().encode(buf);
            }),
            Some(access_list) => {
                buf.push(UnsignedTransaction::ACCESS_LIST_TX_TYPE);
                encode_rlp_list(&mut buf, |buf| {
                    self.tx.encode_access_list_fields(access_list, buf);
                    sig.y_parity().encode(buf);
                    sig.r().encode(buf);
                    sig.s().encode(buf);
                });
            }
        }

        buf
    }

    /// Returns the transaction hash.
    #[must_use]
    pub fn hash(&self) -> B256 {
        keccak256(self.encoded())
    }

    /// Recovers the sender from the signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSignature`] if no key recovers.
    pub fn recover_sender(&self) -> Result<Address> {
        crypto::recover_address(&self.tx.signing_hash(), &self.signature)
    }
}

/// Encodes an RLP list using a closure to write elements.
fn encode_rlp_list<F>(out: &mut Vec<u8>, f: F)
where
    F: FnOnce(&mut Vec<u8>),
{
    let mut content = Vec::new();
    f(&mut content);

    let header = alloy_rlp::Header {
        list: true,
        payload_length: content.len(),
    };
    header.encode(out);
    out.extend_from_slice(&content);
}

/// Encodes an optional address; contract creation is the empty string.
fn encode_optional_address(addr: Option<&Address>, out: &mut Vec<u8>) {
    match addr {
        Some(a) => a.inner().encode(out),
        None => out.push(alloy_rlp::EMPTY_STRING_CODE),
    }
}

fn encode_access_list(access_list: &[AccessListEntry], out: &mut Vec<u8>) {
    encode_rlp_list(out, |out| {
        for entry in access_list {
            encode_rlp_list(out, |out| {
                entry.address.inner().encode(out);
                encode_rlp_list(out, |out| {
                    for key in &entry.storage_keys {
                        key.encode(out);
                    }
                });
            });
        }
    });
}
