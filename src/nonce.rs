//! MuSig2 nonce handling: per-signer secret nonce pairs, their public
//! counterparts, and aggregation of all participants' public nonces.
//!
//! Every round-1 call draws two fresh scalars from OS entropy. A secret
//! nonce pair must never sign twice: [`SecNonce`] is deliberately not
//! `Clone`, and signing consumes it by value.

use rand::TryRngCore;
use rand::rngs::OsRng;
use thiserror::Error;

use crate::ec::{Secp256k1Point, Secp256k1Scalar};

/// Errors for nonce operations.
#[derive(Debug, Error, PartialEq)]
pub enum NonceError {
    /// Scalar reduced to zero (after retries).
    #[error("nonce scalar is zero")]
    ZeroScalar,
    /// Empty nonce list.
    #[error("empty nonce list")]
    NoNonces,
    /// Input point bytes were invalid or correspond to identity.
    #[error("invalid public nonce point")]
    InvalidPoint,
    /// Input bytes were of wrong length.
    #[error("wrong length")]
    WrongLength,
}

/// A signer's secret nonce pair (k1, k2). Single use.
pub struct SecNonce {
    k1: Secp256k1Scalar,
    k2: Secp256k1Scalar,
}

impl SecNonce {
    /// Draw a fresh secret nonce pair. Retries up to 5 times if either
    /// scalar reduces to zero, so an emitted nonce is never zero.
    pub fn generate() -> Result<Self, NonceError> {
        for _ in 0..5 {
            let mut buf = [0u8; 64];
            OsRng.try_fill_bytes(&mut buf).unwrap();
            let k1 = Secp256k1Scalar::from_bytes_be(&buf[..32]);
            let k2 = Secp256k1Scalar::from_bytes_be(&buf[32..]);
            if k1.is_zero() || k2.is_zero() {
                continue;
            }
            return Ok(SecNonce { k1, k2 });
        }
        Err(NonceError::ZeroScalar)
    }

    /// The public pair (R1, R2) = (k1·G, k2·G) to publish in round 1.
    pub fn public_nonce(&self) -> PubNonce {
        let g = Secp256k1Point::generator();
        PubNonce {
            R1: &g * &self.k1,
            R2: &g * &self.k2,
        }
    }

    pub(crate) fn into_scalars(self) -> (Secp256k1Scalar, Secp256k1Scalar) {
        (self.k1, self.k2)
    }

    #[cfg(test)]
    pub(crate) fn from_scalars(k1: Secp256k1Scalar, k2: Secp256k1Scalar) -> Self {
        SecNonce { k1, k2 }
    }
}

/// A participant's public nonce pair, 66 bytes on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubNonce {
    pub R1: Secp256k1Point,
    pub R2: Secp256k1Point,
}

impl PubNonce {
    /// Two concatenated compressed points.
    pub fn to_bytes(&self) -> [u8; 66] {
        let mut out = [0u8; 66];
        out[..33].copy_from_slice(&self.R1.to_bytes_compressed());
        out[33..].copy_from_slice(&self.R2.to_bytes_compressed());
        out
    }

    /// Parse exactly 66 bytes; both halves must be valid non-identity
    /// points.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NonceError> {
        if bytes.len() != 66 {
            return Err(NonceError::WrongLength);
        }
        let half1: [u8; 33] = bytes[..33].try_into().expect("length checked");
        let half2: [u8; 33] = bytes[33..].try_into().expect("length checked");
        let R1 = Secp256k1Point::from_bytes_compressed(&half1).ok_or(NonceError::InvalidPoint)?;
        let R2 = Secp256k1Point::from_bytes_compressed(&half2).ok_or(NonceError::InvalidPoint)?;
        Ok(PubNonce { R1, R2 })
    }
}

/// The sum of all participants' public nonces. Either half may be the
/// point at infinity (encoded as 33 zero bytes on the wire).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggNonce {
    pub R1: Secp256k1Point,
    pub R2: Secp256k1Point,
}

impl AggNonce {
    pub fn to_bytes(&self) -> [u8; 66] {
        let mut out = [0u8; 66];
        if !self.R1.is_infinity() {
            out[..33].copy_from_slice(&self.R1.to_bytes_compressed());
        }
        if !self.R2.is_infinity() {
            out[33..].copy_from_slice(&self.R2.to_bytes_compressed());
        }
        out
    }
}

/// Aggregate public nonces: `aggR1 = Σ R1_i`, `aggR2 = Σ R2_i`.
///
/// No parity normalization happens here; the sign correction for an
/// odd-Y effective nonce is applied consistently at signing time.
pub fn nonce_agg(nonces: &[PubNonce]) -> Result<AggNonce, NonceError> {
    if nonces.is_empty() {
        return Err(NonceError::NoNonces);
    }
    let mut agg1 = Secp256k1Point::identity();
    let mut agg2 = Secp256k1Point::identity();
    for nonce in nonces {
        agg1 = agg1 + &nonce.R1;
        agg2 = agg2 + &nonce.R2;
    }
    Ok(AggNonce { R1: agg1, R2: agg2 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_nonces_are_nonzero_and_fresh() {
        let a = SecNonce::generate().unwrap();
        let b = SecNonce::generate().unwrap();
        assert_ne!(
            a.public_nonce(),
            b.public_nonce(),
            "two draws must never produce the same nonce pair"
        );
        assert!(!a.public_nonce().R1.is_infinity());
        assert!(!a.public_nonce().R2.is_infinity());
    }

    #[test]
    fn pubnonce_wire_roundtrip() {
        let sec = SecNonce::generate().unwrap();
        let pubnonce = sec.public_nonce();
        let parsed = PubNonce::from_bytes(&pubnonce.to_bytes()).unwrap();
        assert_eq!(parsed, pubnonce);
    }

    #[test]
    fn pubnonce_rejects_bad_input() {
        assert_eq!(PubNonce::from_bytes(&[0u8; 33]), Err(NonceError::WrongLength));
        let mut bad = [0u8; 66];
        bad[0] = 0x05;
        assert_eq!(PubNonce::from_bytes(&bad), Err(NonceError::InvalidPoint));
    }

    #[test]
    fn aggregation_sums_each_half() {
        let a = SecNonce::generate().unwrap().public_nonce();
        let b = SecNonce::generate().unwrap().public_nonce();
        let agg = nonce_agg(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(agg.R1, a.R1.clone() + &b.R1);
        assert_eq!(agg.R2, a.R2.clone() + &b.R2);
    }

    #[test]
    fn empty_list_is_an_error() {
        assert_eq!(nonce_agg(&[]), Err(NonceError::NoNonces));
    }

    #[test]
    fn cancelling_halves_encode_as_zeros() {
        let k = Secp256k1Scalar::new(5u8.into());
        let g = Secp256k1Point::generator();
        let up = PubNonce {
            R1: &g * &k,
            R2: &g * &k,
        };
        let down = PubNonce {
            R1: -(&g * &k),
            R2: &g * &k,
        };
        let agg = nonce_agg(&[up, down]).unwrap();
        assert!(agg.R1.is_infinity());
        let bytes = agg.to_bytes();
        assert_eq!(&bytes[..33], &[0u8; 33]);
        assert_ne!(&bytes[33..], &[0u8; 33]);
    }
}
