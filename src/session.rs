//! A MuSig2 signing session for one message under one aggregate key.
//!
//! A session can only be constructed once every participant's public
//! nonce has been aggregated, which is what makes the two-round barrier
//! a type-level fact rather than a convention: the binding factor, the
//! effective nonce and the challenge all depend on the aggregate nonce.

use crate::ec::{Secp256k1Point, Secp256k1Scalar, tagged_hash};
use crate::error::{Error, Result};
use crate::keyagg::KeyAggContext;
use crate::nonce::{AggNonce, SecNonce};
use crate::schnorr::challenge;

/// A participant's 32-byte partial signature scalar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialSignature(Secp256k1Scalar);

impl PartialSignature {
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes_be()
    }

    /// Parse a partial signature, rejecting values ≥ n.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        Secp256k1Scalar::from_bytes_be_strict(bytes)
            .map(PartialSignature)
            .ok_or_else(|| Error::CryptoVerification("partial signature out of range".into()))
    }
}

/// Session state: aggregate key, aggregate nonce, binding factor b,
/// effective nonce R, and challenge e. Created at the start of round 2,
/// consumed once the final signature has been aggregated and verified.
pub struct MusigSession {
    key_ctx: KeyAggContext,
    b: Secp256k1Scalar,
    R: Secp256k1Point,
    e: Secp256k1Scalar,
}

impl MusigSession {
    /// Bind the aggregate nonce to the aggregate key and message.
    ///
    /// `b = H("MuSig/noncecoef", aggnonce || x(Q) || msg)`,
    /// `R = aggR1 + b·aggR2` (the generator if that sum is infinite),
    /// `e = H("BIP0340/challenge", x(R) || x(Q) || msg) mod n`.
    pub fn new(key_ctx: KeyAggContext, agg_nonce: &AggNonce, msg: &[u8]) -> Result<Self> {
        let mut buf = Vec::with_capacity(66 + 32 + msg.len());
        buf.extend_from_slice(&agg_nonce.to_bytes());
        buf.extend_from_slice(&key_ctx.xonly_bytes());
        buf.extend_from_slice(msg);
        let b = Secp256k1Scalar::from_bytes_be(&tagged_hash("MuSig/noncecoef", &buf));

        let R_sum = agg_nonce.R1.clone() + &(&agg_nonce.R2 * &b);
        let R = if R_sum.is_infinity() {
            // Degenerate aggregate nonce; the protocol continues with G.
            Secp256k1Point::generator()
        } else {
            R_sum
        };

        let e = challenge(&R.x_only_bytes(), &key_ctx.xonly_bytes(), msg);
        Ok(MusigSession { key_ctx, b, R, e })
    }

    /// x-coordinate of the effective nonce; the first half of the final
    /// signature.
    pub fn final_nonce_xonly(&self) -> [u8; 32] {
        self.R.x_only_bytes()
    }

    pub fn key_ctx(&self) -> &KeyAggContext {
        &self.key_ctx
    }

    /// Parity factor g of the (tweaked) aggregate key: 1 for even Y,
    /// n−1 for odd.
    fn key_parity(&self) -> Secp256k1Scalar {
        if self.key_ctx.aggregate_point().y_is_odd() {
            -Secp256k1Scalar::one()
        } else {
            Secp256k1Scalar::one()
        }
    }

    /// Produce this signer's partial signature, consuming the secret
    /// nonce so the pair can never sign twice.
    ///
    /// `s = k1 + b·k2 + e·a·d mod n`, with (k1, k2) sign-corrected by
    /// the parity of R and `d = g·gacc·d'` sign-corrected by the parity
    /// of the aggregate key. The result is checked against this
    /// signer's own public nonce before it is returned.
    pub fn partial_sign(
        &self,
        secnonce: SecNonce,
        seckey: &Secp256k1Scalar,
    ) -> Result<PartialSignature> {
        if seckey.is_zero() {
            return Err(Error::CryptoVerification("secret key must be non-zero".into()));
        }
        let pubnonce = secnonce.public_nonce();
        let (k1, k2) = secnonce.into_scalars();
        let (k1, k2) = if self.R.y_is_odd() { (-k1, -k2) } else { (k1, k2) };

        let P = Secp256k1Point::generator() * seckey;
        let a = self.key_ctx.coefficient(&P).ok_or_else(|| {
            Error::CryptoVerification("signer's key is not part of the aggregate".into())
        })?;
        let g = self.key_parity();
        let d = &(&g * self.key_ctx.gacc()) * seckey;

        let s = k1 + &(&self.b * &k2) + &(&(&self.e * a) * &d);
        let partial = PartialSignature(s);
        if !self.partial_verify(&partial, &pubnonce, &P) {
            return Err(Error::CryptoVerification(
                "generated partial signature does not pass verification".into(),
            ));
        }
        Ok(partial)
    }

    /// The single-signer verification equation, mandatory for every
    /// contribution before it may enter an aggregate:
    /// `s·G == Rₑ + (e·a·g·gacc)·P`, where `Rₑ = R1 + b·R2` is the
    /// participant's effective nonce point, sign-corrected by R's
    /// parity.
    pub fn partial_verify(
        &self,
        partial: &PartialSignature,
        pubnonce: &crate::nonce::PubNonce,
        pubkey: &Secp256k1Point,
    ) -> bool {
        let Some(a) = self.key_ctx.coefficient(pubkey) else {
            return false;
        };
        let Re = pubnonce.R1.clone() + &(&pubnonce.R2 * &self.b);
        let Re = if self.R.y_is_odd() { -Re } else { Re };

        let g_total = &self.key_parity() * self.key_ctx.gacc();
        let lhs = Secp256k1Point::generator() * &partial.0;
        let rhs = Re + &(pubkey * &(&(&self.e * a) * &g_total));
        lhs == rhs
    }

    /// Sum the partial signatures and fold in the accumulated tweaks:
    /// `s = Σ s_i + e·g·tacc mod n`; the signature is `(x(R), s)`.
    ///
    /// Callers re-verify the result as an ordinary BIP-340 signature
    /// against the tweaked key and the message; that check, not this
    /// sum, is the authoritative completion signal.
    pub fn aggregate(&self, partials: &[PartialSignature]) -> Result<[u8; 64]> {
        if partials.len() != self.key_ctx.pubkeys().len() {
            return Err(Error::ProtocolOrdering(format!(
                "aggregation needs {} partial signatures, got {}",
                self.key_ctx.pubkeys().len(),
                partials.len()
            )));
        }
        let mut s = Secp256k1Scalar::zero();
        for partial in partials {
            s = s + &partial.0;
        }
        s = s + &(&(&self.e * &self.key_parity()) * self.key_ctx.tacc());

        let mut sig = [0u8; 64];
        sig[..32].copy_from_slice(&self.R.x_only_bytes());
        sig[32..].copy_from_slice(&s.to_bytes_be());
        Ok(sig)
    }
}
