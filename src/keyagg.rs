//! MuSig2 public-key aggregation (BIP-327 KeyAgg).
//!
//! The aggregate context tracks everything later signing rounds need:
//! the aggregate point Q, the per-key coefficients, and the two tweak
//! accumulators `gacc`/`tacc` that record how BIP-32 child tweaks and
//! the taproot tweak were folded in.
//!
//! Aggregation is deterministic over the key list it is given. Callers
//! that want order-independence pass the lexicographically sorted set of
//! compressed keys; the policy-declared order is preserved elsewhere for
//! human-facing confirmation.

use num_bigint::BigUint;

use crate::ec::{Secp256k1Point, Secp256k1Scalar, group_order, tagged_hash};
use crate::error::{Error, Result};

/// Aggregate-key state for one musig group.
#[derive(Clone, Debug)]
pub struct KeyAggContext {
    Q: Secp256k1Point,
    gacc: Secp256k1Scalar,
    tacc: Secp256k1Scalar,
    pubkeys: Vec<Secp256k1Point>,
    coeffs: Vec<Secp256k1Scalar>,
}

impl KeyAggContext {
    /// Aggregate a list of compressed participant keys.
    ///
    /// 1. `L = H("KeyAgg list", P_1 || … || P_n)` over the input order.
    /// 2. The second key distinct from the first gets coefficient 1;
    ///    every other key gets `H("KeyAgg coefficient", L || P_i)`.
    /// 3. `Q = Σ a_i · P_i`.
    ///
    /// Q keeps its true parity; whether participants must negate their
    /// effective secret contributions is derived from it at signing
    /// time, so the exposed x-only key stays consistent.
    pub fn new(pubkeys: &[[u8; 33]]) -> Result<Self> {
        if pubkeys.is_empty() {
            return Err(Error::CryptoVerification("no public keys to aggregate".into()));
        }

        let mut points = Vec::with_capacity(pubkeys.len());
        for (i, bytes) in pubkeys.iter().enumerate() {
            let P = Secp256k1Point::from_bytes_compressed(bytes).ok_or_else(|| {
                Error::CryptoVerification(format!("participant key {i} is not a valid point"))
            })?;
            points.push(P);
        }

        let mut list_buf = Vec::with_capacity(pubkeys.len() * 33);
        for bytes in pubkeys {
            list_buf.extend_from_slice(bytes);
        }
        let L = tagged_hash("KeyAgg list", &list_buf);

        // The second distinct key gets coefficient 1, saving one scalar
        // multiplication for the most common contributor.
        let second = pubkeys.iter().skip(1).find(|b| **b != pubkeys[0]).copied();

        let mut coeffs = Vec::with_capacity(pubkeys.len());
        for bytes in pubkeys {
            let a = if Some(*bytes) == second {
                Secp256k1Scalar::one()
            } else {
                let mut buf = Vec::with_capacity(32 + 33);
                buf.extend_from_slice(&L);
                buf.extend_from_slice(bytes);
                Secp256k1Scalar::from_bytes_be(&tagged_hash("KeyAgg coefficient", &buf))
            };
            coeffs.push(a);
        }

        let mut Q = Secp256k1Point::identity();
        for (P, a) in points.iter().zip(&coeffs) {
            Q = Q + &(P * a);
        }
        if Q.is_infinity() {
            return Err(Error::CryptoVerification("aggregate key is the point at infinity".into()));
        }

        Ok(KeyAggContext {
            Q,
            gacc: Secp256k1Scalar::one(),
            tacc: Secp256k1Scalar::zero(),
            pubkeys: points,
            coeffs,
        })
    }

    /// The aggregate point Q with its true parity.
    pub fn aggregate_point(&self) -> &Secp256k1Point {
        &self.Q
    }

    pub fn compressed_bytes(&self) -> [u8; 33] {
        self.Q.to_bytes_compressed()
    }

    pub fn xonly_bytes(&self) -> [u8; 32] {
        self.Q.x_only_bytes()
    }

    /// Participant points, in aggregation order.
    pub fn pubkeys(&self) -> &[Secp256k1Point] {
        &self.pubkeys
    }

    /// The aggregation coefficient of one participant, if present.
    pub(crate) fn coefficient(&self, pubkey: &Secp256k1Point) -> Option<&Secp256k1Scalar> {
        self.pubkeys
            .iter()
            .position(|P| P == pubkey)
            .map(|i| &self.coeffs[i])
    }

    pub(crate) fn gacc(&self) -> &Secp256k1Scalar {
        &self.gacc
    }

    pub(crate) fn tacc(&self) -> &Secp256k1Scalar {
        &self.tacc
    }

    /// Fold in an unhardened BIP-32 child tweak: `Q' = Q + t·G`.
    pub fn apply_plain_tweak(&mut self, tweak: &[u8; 32]) -> Result<()> {
        self.apply_tweak(tweak, false)
    }

    /// Fold in an x-only (taproot) tweak: the current Q is first
    /// replaced by its even-Y representative.
    pub fn apply_xonly_tweak(&mut self, tweak: &[u8; 32]) -> Result<()> {
        self.apply_tweak(tweak, true)
    }

    fn apply_tweak(&mut self, tweak: &[u8; 32], is_xonly: bool) -> Result<()> {
        if BigUint::from_bytes_be(tweak) >= *group_order() {
            return Err(Error::CryptoVerification("tweak exceeds group order".into()));
        }
        let t = Secp256k1Scalar::from_bytes_be(tweak);
        let g = if is_xonly && self.Q.y_is_odd() {
            -Secp256k1Scalar::one()
        } else {
            Secp256k1Scalar::one()
        };
        let Q = (&self.Q * &g) + &(Secp256k1Point::generator() * &t);
        if Q.is_infinity() {
            return Err(Error::CryptoVerification("tweaked aggregate key is the point at infinity".into()));
        }
        self.gacc = &g * &self.gacc;
        self.tacc = t + &(&g * &self.tacc);
        self.Q = Q;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // BIP-327 key-aggregation vector: three participant keys in input
    // order, and the x-coordinate of their aggregate.
    const PKS: [&str; 3] = [
        "02F9308A019258C31049344F85F89D5229B531C845836F99B08601F113BCE036F9",
        "03DFF1D77F2A671C5F36183726DB2341BE58FEAE1DA2DECED843240F7B502BA659",
        "023590A94E768F8E1815C2F24B4D80A8E3149316C3518CE7B7AD338368D038CA66",
    ];
    const EXPECTED_X: &str = "90539EEDE565F5D054F32CC0C220126889ED1E5D193BAF15AEF344FE59D4610C";

    fn keys() -> Vec<[u8; 33]> {
        PKS.iter()
            .map(|s| hex::decode(s).unwrap().try_into().unwrap())
            .collect()
    }

    #[test]
    fn static_aggregation_vector() {
        let ctx = KeyAggContext::new(&keys()).unwrap();
        assert_eq!(hex::encode_upper(ctx.xonly_bytes()), EXPECTED_X);
    }

    #[test]
    fn aggregation_is_deterministic() {
        let a = KeyAggContext::new(&keys()).unwrap();
        let b = KeyAggContext::new(&keys()).unwrap();
        assert_eq!(a.compressed_bytes(), b.compressed_bytes());
    }

    #[test]
    fn second_distinct_key_has_unit_coefficient() {
        let ctx = KeyAggContext::new(&keys()).unwrap();
        let second = ctx.pubkeys()[1].clone();
        let first = ctx.pubkeys()[0].clone();
        assert_eq!(ctx.coefficient(&second), Some(&Secp256k1Scalar::one()));
        assert_ne!(ctx.coefficient(&first), Some(&Secp256k1Scalar::one()));
    }

    #[test]
    fn aggregate_matches_reconstruction() {
        let ctx = KeyAggContext::new(&keys()).unwrap();
        let mut rebuilt = Secp256k1Point::identity();
        for P in ctx.pubkeys() {
            let a = ctx.coefficient(P).unwrap();
            rebuilt = rebuilt + &(P * a);
        }
        assert_eq!(&rebuilt, ctx.aggregate_point());
    }

    #[test]
    fn plain_tweak_shifts_by_t() {
        let mut ctx = KeyAggContext::new(&keys()).unwrap();
        let before = ctx.aggregate_point().clone();
        let mut tweak = [0u8; 32];
        tweak[31] = 7;
        ctx.apply_plain_tweak(&tweak).unwrap();
        let t = Secp256k1Scalar::new(7u8.into());
        assert_eq!(
            ctx.aggregate_point(),
            &(before + &(Secp256k1Point::generator() * &t))
        );
        assert_eq!(ctx.tacc(), &t);
    }

    #[test]
    fn xonly_tweak_normalizes_parity_first() {
        let mut ctx = KeyAggContext::new(&keys()).unwrap();
        let even_before = ctx.aggregate_point().normalize_parity();
        let mut tweak = [0u8; 32];
        tweak[31] = 3;
        ctx.apply_xonly_tweak(&tweak).unwrap();
        let t = Secp256k1Scalar::new(3u8.into());
        assert_eq!(
            ctx.aggregate_point(),
            &(even_before + &(Secp256k1Point::generator() * &t))
        );
    }

    #[test]
    fn rejects_invalid_inputs() {
        assert!(KeyAggContext::new(&[]).is_err());
        let mut bad = keys();
        bad[0][0] = 0x04;
        assert!(KeyAggContext::new(&bad).is_err());
        let mut not_on_curve = [0u8; 33];
        not_on_curve[0] = 0x02;
        not_on_curve[1..].copy_from_slice(
            &hex::decode("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEFFFFFC2F")
                .unwrap(),
        );
        assert!(KeyAggContext::new(&[not_on_curve]).is_err());
    }
}
