//! Ethereum ECDSA signatures and the recovery-id rules.
//!
//! The Ledger Ethereum app answers a signing request with
//! `v (1 byte) || r (32 bytes) || s (32 bytes)`. What that first byte means
//! depends on the firmware and on what was signed, so every conversion from
//! "raw device byte" to "final `v`" goes through one place:
//! [`normalize_recovery_id`] followed by [`SignatureKind::final_v`].
//!
//! | What was signed          | Final `v`                      |
//! |--------------------------|--------------------------------|
//! | legacy tx, chain id 0    | `27 + recovery_id`             |
//! | legacy tx, chain id `c`  | `c * 2 + 35 + recovery_id`     |
//! | EIP-2930 tx              | `recovery_id` (y-parity)       |
//! | EIP-712 typed data       | `27 + recovery_id`             |
//!
//! # Example
//!
//! ```
//! use alloy_primitives::U256;
//! use ledger_evm_signer_core::signature::{chain_id_from_v, final_v};
//!
//! let v = final_v(1, U256::from(1));
//! assert_eq!(v, U256::from(38));
//! assert_eq!(chain_id_from_v(v), Some(U256::from(1)));
//! ```

use core::fmt;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Length of the `v || r || s` reply the device sends after signing.
pub const DEVICE_REPLY_LEN: usize = 65;

/// How the final `v` of a signature is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    /// Legacy transaction, with EIP-155 replay protection when `chain_id != 0`.
    Legacy {
        /// Chain id mixed into `v`; zero means pre-EIP-155.
        chain_id: U256,
    },
    /// Typed (EIP-2718) transaction; `v` is the y-parity.
    TypedTransaction,
    /// EIP-712 structured data; `v` is 27 or 28.
    TypedData,
}

impl SignatureKind {
    /// Turns a normalized recovery id into the final `v`.
    #[must_use]
    pub fn final_v(&self, recovery_id: u8) -> U256 {
        match self {
            Self::Legacy { chain_id } => final_v(recovery_id, *chain_id),
            Self::TypedTransaction => U256::from(recovery_id),
            Self::TypedData => U256::from(27 + recovery_id),
        }
    }
}

/// Maps the raw `v` byte sent by the device to a recovery id in `{0, 1}`.
///
/// Accepted inputs, tried in order:
///
/// - legacy with a non-zero chain id: the low byte of
///   `chain_id * 2 + 35 + rid` (the device only has one byte to answer with)
/// - `27` / `28`
/// - `0` / `1`
///
/// For chain ids congruent to 110 or 111 modulo 128 the EIP-155 low byte is
/// `0xff`/`0x00` or `0x01`/`0x02`, so a device answering with a bare parity
/// byte there is read as the EIP-155 form and gets the wrong recovery id.
/// The signer cross-check then reports [`Error::AccountMismatch`].
///
/// # Errors
///
/// Returns [`Error::ProtocolError`] for any other byte.
///
/// # Example
///
/// ```
/// use alloy_primitives::U256;
/// use ledger_evm_signer_core::signature::{SignatureKind, normalize_recovery_id};
///
/// let kind = SignatureKind::Legacy { chain_id: U256::from(1) };
/// assert_eq!(normalize_recovery_id(38, &kind).unwrap(), 1);
/// assert_eq!(normalize_recovery_id(28, &kind).unwrap(), 1);
/// assert!(normalize_recovery_id(40, &kind).is_err());
/// ```
pub fn normalize_recovery_id(raw: u8, kind: &SignatureKind) -> Result<u8> {
    if let SignatureKind::Legacy { chain_id } = kind
        && !chain_id.is_zero()
    {
        let base = low_byte(eip155_base(*chain_id));
        if raw == base {
            return Ok(0);
        }
        if raw == base.wrapping_add(1) {
            return Ok(1);
        }
    }

    match raw {
        27 | 28 => Ok(raw - 27),
        0 | 1 => Ok(raw),
        _ => Err(Error::ProtocolError(format!(
            "unexpected recovery byte {raw:#04x} for {kind:?}"
        ))),
    }
}

/// Computes the final `v` of a legacy transaction signature.
///
/// `27 + recovery_id` when `chain_id` is zero, `chain_id * 2 + 35 + recovery_id`
/// otherwise.
#[must_use]
pub fn final_v(recovery_id: u8, chain_id: U256) -> U256 {
    let rid = U256::from(recovery_id & 1);
    if chain_id.is_zero() {
        U256::from(27) + rid
    } else {
        eip155_base(chain_id).wrapping_add(rid)
    }
}

/// Recovers the chain id encoded in a legacy `v`.
///
/// Returns `None` for `v <= 28` (no replay protection) and for values that
/// cannot have come from EIP-155.
#[must_use]
pub fn chain_id_from_v(v: U256) -> Option<U256> {
    if v <= U256::from(28) {
        return None;
    }
    v.checked_sub(U256::from(35)).map(|x| x / U256::from(2))
}

fn eip155_base(chain_id: U256) -> U256 {
    chain_id
        .wrapping_mul(U256::from(2))
        .wrapping_add(U256::from(35))
}

fn low_byte(value: U256) -> u8 {
    value.to_le_bytes::<32>()[0]
}

/// An Ethereum ECDSA signature over secp256k1.
///
/// `v` is kept as an arbitrary-precision integer since EIP-155 folds the
/// chain id into it.
///
/// # Wire Format
///
/// [`Signature::to_bytes`] produces the 65-byte `r || s || v` form used by
/// `eth_signTypedData`, with `v` reduced to `27` / `28`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    r: U256,
    s: U256,
    v: U256,
}

impl Signature {
    /// The length of a serialized signature in bytes.
    pub const BYTE_LEN: usize = 65;

    /// Creates a signature from its components.
    #[must_use]
    pub const fn new(r: U256, s: U256, v: U256) -> Self {
        Self { r, s, v }
    }

    /// Parses the `v || r || s` reply of a signing request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolError`] if the reply is not exactly
    /// [`DEVICE_REPLY_LEN`] bytes or carries an unexpected recovery byte.
    pub fn from_device_reply(reply: &[u8], kind: &SignatureKind) -> Result<Self> {
        if reply.len() != DEVICE_REPLY_LEN {
            return Err(Error::ProtocolError(format!(
                "signature reply is {} bytes, expected {DEVICE_REPLY_LEN}",
                reply.len()
            )));
        }

        let recovery_id = normalize_recovery_id(reply[0], kind)?;
        let r = U256::from_be_slice(&reply[1..33]);
        let s = U256::from_be_slice(&reply[33..65]);

        Ok(Self::new(r, s, kind.final_v(recovery_id)))
    }

    /// Parses a 65-byte `r || s || v` signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSignature`] if the slice is not exactly 65 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::BYTE_LEN {
            return Err(Error::InvalidSignature(format!(
                "expected {} bytes, got {}",
                Self::BYTE_LEN,
                bytes.len()
            )));
        }

        Ok(Self::new(
            U256::from_be_slice(&bytes[0..32]),
            U256::from_be_slice(&bytes[32..64]),
            U256::from(bytes[64]),
        ))
    }

    /// Serializes to `r || s || v` with `v` as `27 + y_parity`.
    ///
    /// # Example
    ///
    /// ```
    /// use alloy_primitives::U256;
    /// use ledger_evm_signer_core::Signature;
    ///
    /// let sig = Signature::new(U256::from(1), U256::from(2), U256::from(38));
    /// let bytes = sig.to_bytes();
    /// assert_eq!(bytes[31], 1);
    /// assert_eq!(bytes[63], 2);
    /// assert_eq!(bytes[64], 28);
    /// ```
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut bytes = [0u8; Self::BYTE_LEN];
        bytes[0..32].copy_from_slice(&self.r.to_be_bytes::<32>());
        bytes[32..64].copy_from_slice(&self.s.to_be_bytes::<32>());
        bytes[64] = 27 + u8::from(self.y_parity());
        bytes
    }

    /// Returns the `0x`-prefixed hex of [`Signature::to_bytes`].
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_bytes()))
    }

    /// Returns the R component.
    #[must_use]
    pub const fn r(&self) -> U256 {
        self.r
    }

    /// Returns the S component.
    #[must_use]
    pub const fn s(&self) -> U256 {
        self.s
    }

    /// Returns the final `v`.
    #[must_use]
    pub const fn v(&self) -> U256 {
        self.v
    }

    /// Returns the y-parity encoded in `v`, whatever its convention.
    #[must_use]
    pub fn y_parity(&self) -> bool {
        let v = self.v;
        if v <= U256::from(1) {
            v == U256::from(1)
        } else if v <= U256::from(28) {
            v == U256::from(28)
        } else {
            // EIP-155: v = chain_id * 2 + 35 + parity
            !v.bit(0)
        }
    }

    /// Returns the chain id encoded in `v`, if any.
    #[must_use]
    pub fn chain_id(&self) -> Option<U256> {
        chain_id_from_v(self.v)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
