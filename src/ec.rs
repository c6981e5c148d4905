//! secp256k1 field and group arithmetic.
//!
//! Scalars are integers modulo the group order n; points are affine
//! coordinate pairs with the point at infinity as a distinct variant,
//! never a coordinate pair. The arithmetic is plain big-integer math:
//! correctness and readability over speed, no constant-time claims.

use std::ops::{Add, Mul, Neg};
use std::sync::OnceLock;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::RngCore;
use sha2::{Digest, Sha256};

struct Curve {
    /// Prime field modulus p.
    p: BigUint,
    /// Group order n.
    n: BigUint,
    gx: BigUint,
    gy: BigUint,
    /// (p + 1) / 4, the square-root exponent for p ≡ 3 (mod 4).
    sqrt_exp: BigUint,
}

fn curve() -> &'static Curve {
    static CURVE: OnceLock<Curve> = OnceLock::new();
    CURVE.get_or_init(|| {
        let p = BigUint::parse_bytes(
            b"FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEFFFFFC2F",
            16,
        )
        .unwrap();
        let n = BigUint::parse_bytes(
            b"FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEBAAEDCE6AF48A03BBFD25E8CD0364141",
            16,
        )
        .unwrap();
        let gx = BigUint::parse_bytes(
            b"79BE667EF9DCBBAC55A06295CE870B07029BFCDB2DCE28D959F2815B16F81798",
            16,
        )
        .unwrap();
        let gy = BigUint::parse_bytes(
            b"483ADA7726A3C4655DA4FBFC0E1108A8FD17B448A68554199C47D08FFB10D4B8",
            16,
        )
        .unwrap();
        let sqrt_exp = (&p + BigUint::one()) >> 2;
        Curve {
            p,
            n,
            gx,
            gy,
            sqrt_exp,
        }
    })
}

/// The group order n as a big integer.
pub fn group_order() -> &'static BigUint {
    &curve().n
}

/// The field modulus p as a big integer.
pub fn field_order() -> &'static BigUint {
    &curve().p
}

/// `SHA256(SHA256(tag) || SHA256(tag) || msg)`, the domain-separated hash
/// used by BIP-340/341/327 everywhere a tagged hash is called for.
pub fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(msg);
    hasher.finalize().into()
}

fn big_to_32(v: &BigUint) -> [u8; 32] {
    let bytes = v.to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// An integer modulo the group order n.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Secp256k1Scalar(BigUint);

impl Secp256k1Scalar {
    pub fn new(value: BigUint) -> Self {
        Secp256k1Scalar(value % group_order())
    }

    pub fn zero() -> Self {
        Secp256k1Scalar(BigUint::zero())
    }

    pub fn one() -> Self {
        Secp256k1Scalar(BigUint::one())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn value(&self) -> &BigUint {
        &self.0
    }

    /// Interpret big-endian bytes as an integer and reduce mod n.
    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        Secp256k1Scalar(BigUint::from_bytes_be(bytes) % group_order())
    }

    /// Like [`from_bytes_be`](Self::from_bytes_be) but rejects values ≥ n
    /// instead of reducing them.
    pub fn from_bytes_be_strict(bytes: &[u8; 32]) -> Option<Self> {
        let v = BigUint::from_bytes_be(bytes);
        if v >= *group_order() {
            return None;
        }
        Some(Secp256k1Scalar(v))
    }

    pub fn to_bytes_be(&self) -> [u8; 32] {
        big_to_32(&self.0)
    }

    /// Draw a uniformly random non-zero scalar.
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        loop {
            let mut buf = [0u8; 32];
            rng.fill_bytes(&mut buf);
            let s = Self::from_bytes_be(&buf);
            if !s.is_zero() {
                return s;
            }
        }
    }
}

impl Add<&Secp256k1Scalar> for Secp256k1Scalar {
    type Output = Secp256k1Scalar;

    fn add(self, rhs: &Secp256k1Scalar) -> Secp256k1Scalar {
        Secp256k1Scalar((self.0 + &rhs.0) % group_order())
    }
}

impl Mul<&Secp256k1Scalar> for &Secp256k1Scalar {
    type Output = Secp256k1Scalar;

    fn mul(self, rhs: &Secp256k1Scalar) -> Secp256k1Scalar {
        Secp256k1Scalar((&self.0 * &rhs.0) % group_order())
    }
}

impl Mul<&Secp256k1Scalar> for Secp256k1Scalar {
    type Output = Secp256k1Scalar;

    fn mul(self, rhs: &Secp256k1Scalar) -> Secp256k1Scalar {
        Secp256k1Scalar((self.0 * &rhs.0) % group_order())
    }
}

impl Neg for Secp256k1Scalar {
    type Output = Secp256k1Scalar;

    fn neg(self) -> Secp256k1Scalar {
        if self.0.is_zero() {
            self
        } else {
            Secp256k1Scalar(group_order() - self.0)
        }
    }
}

/// A curve point: affine coordinates or the point at infinity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Secp256k1Point {
    Infinity,
    Affine { x: BigUint, y: BigUint },
}

impl Secp256k1Point {
    pub fn infinity() -> Self {
        Secp256k1Point::Infinity
    }

    /// Alias of [`infinity`](Self::infinity); the additive identity.
    pub fn identity() -> Self {
        Secp256k1Point::Infinity
    }

    pub fn generator() -> Self {
        let c = curve();
        Secp256k1Point::Affine {
            x: c.gx.clone(),
            y: c.gy.clone(),
        }
    }

    pub fn is_infinity(&self) -> bool {
        matches!(self, Secp256k1Point::Infinity)
    }

    /// Recover the even-Y point with the given x-coordinate, or `None` if
    /// `x ≥ p` or x³ + 7 is not a quadratic residue.
    pub fn lift_x(x_bytes: &[u8; 32]) -> Option<Self> {
        let c = curve();
        let x = BigUint::from_bytes_be(x_bytes);
        if x >= c.p {
            return None;
        }
        let y_sq = (x.modpow(&BigUint::from(3u8), &c.p) + BigUint::from(7u8)) % &c.p;
        let y = y_sq.modpow(&c.sqrt_exp, &c.p);
        if y.modpow(&BigUint::from(2u8), &c.p) != y_sq {
            return None;
        }
        let y = if y.bit(0) { &c.p - y } else { y };
        Some(Secp256k1Point::Affine { x, y })
    }

    /// Parse a 33-byte compressed point (0x02/0x03 prefix).
    pub fn from_bytes_compressed(bytes: &[u8; 33]) -> Option<Self> {
        if bytes[0] != 0x02 && bytes[0] != 0x03 {
            return None;
        }
        let mut x = [0u8; 32];
        x.copy_from_slice(&bytes[1..]);
        let even = Self::lift_x(&x)?;
        if bytes[0] == 0x02 {
            Some(even)
        } else {
            Some(-even)
        }
    }

    /// Compressed 33-byte serialization. Must not be called on infinity.
    pub fn to_bytes_compressed(&self) -> [u8; 33] {
        match self {
            Secp256k1Point::Infinity => panic!("cannot compress the point at infinity"),
            Secp256k1Point::Affine { x, y } => {
                let mut out = [0u8; 33];
                out[0] = if y.bit(0) { 0x03 } else { 0x02 };
                out[1..].copy_from_slice(&big_to_32(x));
                out
            }
        }
    }

    /// The 32-byte x-coordinate. Must not be called on infinity.
    pub fn x_only_bytes(&self) -> [u8; 32] {
        match self {
            Secp256k1Point::Infinity => panic!("the point at infinity has no x-coordinate"),
            Secp256k1Point::Affine { x, .. } => big_to_32(x),
        }
    }

    pub fn y_is_odd(&self) -> bool {
        match self {
            Secp256k1Point::Infinity => false,
            Secp256k1Point::Affine { y, .. } => y.bit(0),
        }
    }

    /// The even-Y representative sharing this point's x-coordinate.
    pub fn normalize_parity(&self) -> Self {
        if self.y_is_odd() {
            -self.clone()
        } else {
            self.clone()
        }
    }
}

impl Add<&Secp256k1Point> for Secp256k1Point {
    type Output = Secp256k1Point;

    fn add(self, rhs: &Secp256k1Point) -> Secp256k1Point {
        let c = curve();
        let (x1, y1) = match &self {
            Secp256k1Point::Infinity => return rhs.clone(),
            Secp256k1Point::Affine { x, y } => (x, y),
        };
        let (x2, y2) = match rhs {
            Secp256k1Point::Infinity => return self.clone(),
            Secp256k1Point::Affine { x, y } => (x, y),
        };
        if x1 == x2 && y1 != y2 {
            return Secp256k1Point::Infinity;
        }
        let lam = if x1 == x2 {
            if y1.is_zero() {
                return Secp256k1Point::Infinity;
            }
            // Doubling: λ = 3·x₁² / 2·y₁, inverse via Fermat.
            let num = (BigUint::from(3u8) * x1 * x1) % &c.p;
            let den_inv =
                ((BigUint::from(2u8) * y1) % &c.p).modpow(&(&c.p - BigUint::from(2u8)), &c.p);
            (num * den_inv) % &c.p
        } else {
            let num = ((&c.p + y2) - y1) % &c.p;
            let den_inv = (((&c.p + x2) - x1) % &c.p).modpow(&(&c.p - BigUint::from(2u8)), &c.p);
            (num * den_inv) % &c.p
        };
        let x3 = ((&lam * &lam) % &c.p + (&c.p + &c.p) - x1 - x2) % &c.p;
        let y3 = ((&lam * (((&c.p + x1) - &x3) % &c.p)) % &c.p + &c.p - y1) % &c.p;
        Secp256k1Point::Affine { x: x3, y: y3 }
    }
}

impl Mul<&Secp256k1Scalar> for &Secp256k1Point {
    type Output = Secp256k1Point;

    /// Double-and-add over the 256 bits of the scalar.
    fn mul(self, rhs: &Secp256k1Scalar) -> Secp256k1Point {
        let mut result = Secp256k1Point::Infinity;
        let mut addend = self.clone();
        for i in 0..256u64 {
            if rhs.value().bit(i) {
                result = result + &addend;
            }
            addend = addend.clone() + &addend;
        }
        result
    }
}

impl Mul<&Secp256k1Scalar> for Secp256k1Point {
    type Output = Secp256k1Point;

    fn mul(self, rhs: &Secp256k1Scalar) -> Secp256k1Point {
        &self * rhs
    }
}

impl Neg for Secp256k1Point {
    type Output = Secp256k1Point;

    fn neg(self) -> Secp256k1Point {
        let c = curve();
        match self {
            Secp256k1Point::Infinity => Secp256k1Point::Infinity,
            Secp256k1Point::Affine { x, y } => {
                if y.is_zero() {
                    Secp256k1Point::Affine { x, y }
                } else {
                    Secp256k1Point::Affine { x, y: &c.p - y }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // x(2·G), a value every secp256k1 implementation agrees on.
    const TWO_G_X: &str = "c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

    #[test]
    fn generator_is_on_curve() {
        let g = Secp256k1Point::generator();
        let lifted = Secp256k1Point::lift_x(&g.x_only_bytes()).expect("G.x must lift");
        assert_eq!(lifted, g, "G has even Y, lift_x must reproduce it");
    }

    #[test]
    fn doubling_matches_known_coordinate() {
        let g = Secp256k1Point::generator();
        let two = Secp256k1Scalar::new(2u8.into());
        let doubled = g.clone() + &g;
        let multiplied = &g * &two;
        assert_eq!(doubled, multiplied);
        assert_eq!(hex::encode(doubled.x_only_bytes()), TWO_G_X);
    }

    #[test]
    fn add_inverse_gives_infinity() {
        let g = Secp256k1Point::generator();
        let sum = g.clone() + &(-g);
        assert!(sum.is_infinity());
    }

    #[test]
    fn infinity_is_additive_identity() {
        let g = Secp256k1Point::generator();
        assert_eq!(g.clone() + &Secp256k1Point::identity(), g);
        assert_eq!(Secp256k1Point::identity() + &g, g);
    }

    #[test]
    fn scalar_mul_distributes_over_add() {
        let g = Secp256k1Point::generator();
        let a = Secp256k1Scalar::new(1234u32.into());
        let b = Secp256k1Scalar::new(98765u32.into());
        let lhs = &g * &(a.clone() + &b);
        let rhs = (&g * &a) + &(&g * &b);
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn mul_by_group_order_is_infinity() {
        let g = Secp256k1Point::generator();
        // n ≡ 0, so the scalar reduces to zero.
        let n_scalar = Secp256k1Scalar::new(group_order().clone());
        assert!(n_scalar.is_zero());
        assert!((&g * &n_scalar).is_infinity());
    }

    #[test]
    fn compressed_roundtrip_both_parities() {
        let g = Secp256k1Point::generator();
        let k = Secp256k1Scalar::new(7u8.into());
        let p = &g * &k;
        for candidate in [p.clone(), -p] {
            let bytes = candidate.to_bytes_compressed();
            let parsed = Secp256k1Point::from_bytes_compressed(&bytes).unwrap();
            assert_eq!(parsed, candidate);
        }
    }

    #[test]
    fn from_bytes_rejects_bad_prefix_and_bad_x() {
        let mut bytes = Secp256k1Point::generator().to_bytes_compressed();
        bytes[0] = 0x05;
        assert!(Secp256k1Point::from_bytes_compressed(&bytes).is_none());

        // x = p is out of range.
        let mut over = [0u8; 33];
        over[0] = 0x02;
        over[1..].copy_from_slice(&big_to_32(field_order()));
        assert!(Secp256k1Point::from_bytes_compressed(&over).is_none());
    }

    #[test]
    fn scalar_negation_cancels() {
        let a = Secp256k1Scalar::new(31337u32.into());
        let sum = a.clone() + &(-a);
        assert!(sum.is_zero());
        assert_eq!(-Secp256k1Scalar::zero(), Secp256k1Scalar::zero());
    }

    #[test]
    fn scalar_from_bytes_reduces_strict_rejects() {
        let n_bytes = big_to_32(group_order());
        assert!(Secp256k1Scalar::from_bytes_be(&n_bytes).is_zero());
        assert!(Secp256k1Scalar::from_bytes_be_strict(&n_bytes).is_none());
    }

    #[test]
    fn tagged_hash_matches_manual_construction() {
        let tag_hash = Sha256::digest(b"TapTweak");
        let mut h = Sha256::new();
        h.update(tag_hash);
        h.update(tag_hash);
        h.update(b"hello");
        let expected: [u8; 32] = h.finalize().into();
        assert_eq!(tagged_hash("TapTweak", b"hello"), expected);
    }

    #[test]
    fn normalize_parity_always_even() {
        let g = Secp256k1Point::generator();
        let k = Secp256k1Scalar::new(11u8.into());
        let p = &g * &k;
        assert!(!p.normalize_parity().y_is_odd());
        assert!(!(-p).normalize_parity().y_is_odd());
    }
}
