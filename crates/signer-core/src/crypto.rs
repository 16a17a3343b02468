//! secp256k1 signer recovery.
//!
//! The device is trusted to sign, not to sign with the right key. After each
//! signing exchange the pipeline recovers the signer from the digest and the
//! returned signature and compares it with the account it asked for.
//!
//! # Example
//!
//! ```
//! use alloy_primitives::{B256, U256};
//! use ledger_evm_signer_core::{Signature, crypto::recover_address};
//!
//! // r = 0 is never a valid signature
//! let sig = Signature::new(U256::ZERO, U256::from(1), U256::from(27));
//! assert!(recover_address(&B256::ZERO, &sig).is_err());
//! ```

use alloy_primitives::B256;
use k256::ecdsa::{RecoveryId, Signature as K256Signature, VerifyingKey};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::signature::Signature;

/// Recovers the address that produced `signature` over `prehash`.
///
/// High-S signatures are normalized first (and the parity flipped) so that a
/// device which does not enforce low-S still cross-checks.
///
/// # Errors
///
/// Returns [`Error::InvalidSignature`] if `r` or `s` is out of range or no
/// public key recovers.
pub fn recover_address(prehash: &B256, signature: &Signature) -> Result<Address> {
    let mut rs = [0u8; 64];
    rs[..32].copy_from_slice(&signature.r().to_be_bytes::<32>());
    rs[32..].copy_from_slice(&signature.s().to_be_bytes::<32>());

    let mut sig = K256Signature::from_slice(&rs)
        .map_err(|e| Error::InvalidSignature(format!("bad scalars: {e}")))?;
    let mut y_odd = signature.y_parity();

    if let Some(normalized) = sig.normalize_s() {
        sig = normalized;
        y_odd = !y_odd;
    }

    let key = VerifyingKey::recover_from_prehash(
        prehash.as_slice(),
        &sig,
        RecoveryId::new(y_odd, false),
    )
    .map_err(|e| Error::InvalidSignature(format!("recovery failed: {e}")))?;

    Address::from_public_key_bytes(key.to_encoded_point(false).as_bytes())
}

/// Checks that `signature` over `prehash` was produced by `expected`.
///
/// # Errors
///
/// Returns [`Error::AccountMismatch`] when another key signed, or the errors
/// of [`recover_address`].
pub fn verify_signer(prehash: &B256, signature: &Signature, expected: &Address) -> Result<()> {
    let recovered = recover_address(prehash, signature)?;
    if &recovered != expected {
        return Err(Error::AccountMismatch {
            expected: expected.to_string(),
            recovered: recovered.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{U256, keccak256};
    use k256::ecdsa::SigningKey;

    use super::*;

    fn signing_key() -> SigningKey {
        SigningKey::from_slice(&[0x11; 32]).unwrap()
    }

    fn address_of(key: &SigningKey) -> Address {
        Address::from_public_key_bytes(key.verifying_key().to_encoded_point(false).as_bytes())
            .unwrap()
    }

    fn sign(key: &SigningKey, prehash: &B256, v_base: u64) -> Signature {
        let (sig, rid) = key.sign_prehash_recoverable(prehash.as_slice()).unwrap();
        let bytes = sig.to_bytes();
        Signature::new(
            U256::from_be_slice(&bytes[..32]),
            U256::from_be_slice(&bytes[32..]),
            U256::from(v_base + u64::from(rid.is_y_odd())),
        )
    }

    #[test]
    fn recovers_signer_for_every_v_convention() {
        let key = signing_key();
        let prehash = keccak256(b"ledger");

        for v_base in [0u64, 27, 37, 309] {
            let sig = sign(&key, &prehash, v_base);
            assert_eq!(recover_address(&prehash, &sig).unwrap(), address_of(&key));
        }
    }

    #[test]
    fn high_s_still_recovers() {
        let key = signing_key();
        let prehash = keccak256(b"high s");
        let low = sign(&key, &prehash, 27);

        // n - s with the parity flipped is the same signature
        let n = U256::from_str_radix(
            "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141",
            16,
        )
        .unwrap();
        let flipped_v = if low.y_parity() { 27 } else { 28 };
        let high = Signature::new(low.r(), n - low.s(), U256::from(flipped_v));

        assert_eq!(recover_address(&prehash, &high).unwrap(), address_of(&key));
    }

    #[test]
    fn verify_signer_reports_mismatch() {
        let key = signing_key();
        let prehash = keccak256(b"mismatch");
        let sig = sign(&key, &prehash, 27);

        assert!(verify_signer(&prehash, &sig, &address_of(&key)).is_ok());

        let other = Address::new([0x35; 20]);
        assert!(matches!(
            verify_signer(&prehash, &sig, &other),
            Err(Error::AccountMismatch { .. })
        ));
    }

    #[test]
    fn rejects_zero_scalars() {
        let sig = Signature::new(U256::ZERO, U256::ZERO, U256::from(27));
        assert!(matches!(
            recover_address(&B256::ZERO, &sig),
            Err(Error::InvalidSignature(_))
        ));
    }
}
