//! BIP-340 Schnorr signatures with x-only public keys.
//!
//! Signing follows the reference nonce derivation (aux-randomness XOR,
//! tagged nonce hash, parity correction of both the secret key and the
//! nonce) and self-verifies before returning. Verification is the final
//! authority for every aggregate signature this crate produces.

use num_bigint::BigUint;

use crate::ec::{Secp256k1Point, Secp256k1Scalar, field_order, tagged_hash};
use crate::error::{Error, Result};

fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

fn seckey_scalar(seckey: &[u8; 32]) -> Result<Secp256k1Scalar> {
    let d = Secp256k1Scalar::from_bytes_be_strict(seckey)
        .ok_or_else(|| Error::CryptoVerification("secret key out of range".into()))?;
    if d.is_zero() {
        return Err(Error::CryptoVerification("secret key must be non-zero".into()));
    }
    Ok(d)
}

/// Derive the 32-byte x-only public key for a secret key in `[1, n-1]`.
pub fn pubkey_gen(seckey: &[u8; 32]) -> Result<[u8; 32]> {
    let d = seckey_scalar(seckey)?;
    let P = Secp256k1Point::generator() * &d;
    Ok(P.x_only_bytes())
}

/// Produce a 64-byte BIP-340 signature for `msg`.
///
/// `aux_rand` is the 32-byte auxiliary randomness mixed into the nonce;
/// any value is safe, all-zero included. The signature is checked with
/// [`schnorr_verify`] before being returned.
pub fn schnorr_sign(msg: &[u8], seckey: &[u8; 32], aux_rand: &[u8; 32]) -> Result<[u8; 64]> {
    let d0 = seckey_scalar(seckey)?;
    let P = Secp256k1Point::generator() * &d0;
    let d = if P.y_is_odd() { -d0 } else { d0 };

    let t = xor_bytes(&d.to_bytes_be(), &tagged_hash("BIP0340/aux", aux_rand));
    let mut nonce_input = Vec::with_capacity(64 + msg.len());
    nonce_input.extend_from_slice(&t);
    nonce_input.extend_from_slice(&P.x_only_bytes());
    nonce_input.extend_from_slice(msg);
    let k0 = Secp256k1Scalar::from_bytes_be(&tagged_hash("BIP0340/nonce", &nonce_input));
    if k0.is_zero() {
        // Happens only with negligible probability.
        return Err(Error::CryptoVerification("derived nonce is zero".into()));
    }

    let R = Secp256k1Point::generator() * &k0;
    let k = if R.y_is_odd() { -k0 } else { k0 };

    let e = challenge(&R.x_only_bytes(), &P.x_only_bytes(), msg);

    let mut sig = [0u8; 64];
    sig[..32].copy_from_slice(&R.x_only_bytes());
    sig[32..].copy_from_slice(&(k + &(&e * &d)).to_bytes_be());

    if !schnorr_verify(&P.x_only_bytes(), msg, &sig) {
        return Err(Error::CryptoVerification(
            "created signature does not pass verification".into(),
        ));
    }
    Ok(sig)
}

/// Verify a 64-byte signature against a 32-byte x-only public key.
pub fn schnorr_verify(pubkey: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> bool {
    let Some(P) = Secp256k1Point::lift_x(pubkey) else {
        return false;
    };
    let mut r_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&sig[..32]);
    let r = BigUint::from_bytes_be(&r_bytes);
    if r >= *field_order() {
        return false;
    }
    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&sig[32..]);
    let Some(s) = Secp256k1Scalar::from_bytes_be_strict(&s_bytes) else {
        return false;
    };

    let e = challenge(&r_bytes, pubkey, msg);
    let R = (Secp256k1Point::generator() * &s) + &(&P * &(-e));
    !R.is_infinity() && !R.y_is_odd() && R.x_only_bytes() == r_bytes
}

/// `e = H("BIP0340/challenge", r || pk || msg) mod n`.
pub(crate) fn challenge(r: &[u8; 32], pubkey: &[u8; 32], msg: &[u8]) -> Secp256k1Scalar {
    let mut buf = Vec::with_capacity(64 + msg.len());
    buf.extend_from_slice(r);
    buf.extend_from_slice(pubkey);
    buf.extend_from_slice(msg);
    Secp256k1Scalar::from_bytes_be(&tagged_hash("BIP0340/challenge", &buf))
}
