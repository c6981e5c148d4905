//! BIP-341 taproot: internal-key tweaking, tapleaf/tapbranch hashing,
//! script-tree reduction, and output-script construction.

use num_bigint::BigUint;

use crate::ec::{Secp256k1Point, Secp256k1Scalar, group_order, tagged_hash};
use crate::error::{Error, Result};

/// Leaf version for BIP-342 tapscript leaves.
pub const TAPROOT_LEAF_TAPSCRIPT: u8 = 0xc0;

/// Bitcoin compact-size integer, used to length-prefix scripts.
pub fn write_compact_size(out: &mut Vec<u8>, value: u64) {
    if value < 253 {
        out.push(value as u8);
    } else if value < 0x1_0000 {
        out.push(253);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value < 0x1_0000_0000 {
        out.push(254);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(255);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// `H("TapLeaf", version || compact_size(len(script)) || script)`.
pub fn tapleaf_hash(leaf_version: u8, script: &[u8]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(2 + script.len());
    buf.push(leaf_version);
    write_compact_size(&mut buf, script.len() as u64);
    buf.extend_from_slice(script);
    tagged_hash("TapLeaf", &buf)
}

/// `H("TapBranch", min(a,b) || max(a,b))`; order-independent by design
/// of the numeric ordering.
pub fn tapbranch_hash(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(64);
    if a <= b {
        buf.extend_from_slice(a);
        buf.extend_from_slice(b);
    } else {
        buf.extend_from_slice(b);
        buf.extend_from_slice(a);
    }
    tagged_hash("TapBranch", &buf)
}

/// A binary script tree: concrete leaves with their leaf version, or a
/// branch of two subtrees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TapTree {
    Leaf { version: u8, script: Vec<u8> },
    Branch(Box<TapTree>, Box<TapTree>),
}

impl TapTree {
    /// Reduce the tree to its merkle root.
    pub fn root_hash(&self) -> [u8; 32] {
        match self {
            TapTree::Leaf { version, script } => tapleaf_hash(*version, script),
            TapTree::Branch(left, right) => {
                tapbranch_hash(&left.root_hash(), &right.root_hash())
            }
        }
    }
}

/// Tweak an x-only public key by `t = H("TapTweak", P || h)`.
///
/// Returns `(odd_y, x(Q))` for `Q = P + t·G`. `h` is the merkle root of
/// the script tree, or empty for a keypath-only output.
pub fn tweak_pubkey(pubkey: &[u8; 32], h: &[u8]) -> Result<(bool, [u8; 32])> {
    let mut buf = Vec::with_capacity(32 + h.len());
    buf.extend_from_slice(pubkey);
    buf.extend_from_slice(h);
    let t_bytes = tagged_hash("TapTweak", &buf);
    if BigUint::from_bytes_be(&t_bytes) >= *group_order() {
        return Err(Error::CryptoVerification("taproot tweak exceeds group order".into()));
    }
    let t = Secp256k1Scalar::from_bytes_be(&t_bytes);
    let P = Secp256k1Point::lift_x(pubkey)
        .ok_or_else(|| Error::CryptoVerification("internal key is not a valid x-only point".into()))?;
    let Q = P + &(Secp256k1Point::generator() * &t);
    if Q.is_infinity() {
        return Err(Error::CryptoVerification("tweaked key is the point at infinity".into()));
    }
    Ok((Q.y_is_odd(), Q.x_only_bytes()))
}

/// Secret-side counterpart of [`tweak_pubkey`]: negates the secret if
/// its untweaked point has odd Y, then adds the tweak mod n.
pub fn tweak_seckey(seckey: &[u8; 32], h: &[u8]) -> Result<[u8; 32]> {
    let d0 = Secp256k1Scalar::from_bytes_be_strict(seckey)
        .filter(|d| !d.is_zero())
        .ok_or_else(|| Error::CryptoVerification("secret key out of range".into()))?;
    let P = Secp256k1Point::generator() * &d0;
    let d = if P.y_is_odd() { -d0 } else { d0 };
    let mut buf = Vec::with_capacity(32 + h.len());
    buf.extend_from_slice(&P.x_only_bytes());
    buf.extend_from_slice(h);
    let t_bytes = tagged_hash("TapTweak", &buf);
    if BigUint::from_bytes_be(&t_bytes) >= *group_order() {
        return Err(Error::CryptoVerification("taproot tweak exceeds group order".into()));
    }
    Ok((d + &Secp256k1Scalar::from_bytes_be(&t_bytes)).to_bytes_be())
}

/// `OP_1 OP_PUSH32 x(Q)` for the internal key tweaked by the tree root
/// (empty root when there is no script path).
pub fn output_script(internal_key: &[u8; 32], tree: Option<&TapTree>) -> Result<Vec<u8>> {
    let root = match tree {
        Some(t) => t.root_hash().to_vec(),
        None => Vec::new(),
    };
    let (_, output_key) = tweak_pubkey(internal_key, &root)?;
    let mut script = Vec::with_capacity(34);
    script.push(0x51);
    script.push(0x20);
    script.extend_from_slice(&output_key);
    Ok(script)
}
