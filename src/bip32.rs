//! BIP-32 extended keys: base58check serialization, public and secret
//! child derivation, neutering, fingerprints, and key-origin strings.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};

use crate::ec::{Secp256k1Point, Secp256k1Scalar, group_order};
use crate::error::{Error, Result};

type HmacSha512 = Hmac<Sha512>;

/// First hardened child index.
pub const HARDENED_INDEX: u32 = 0x8000_0000;

/// `RIPEMD160(SHA256(data))`.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    fn version(self, private: bool) -> u32 {
        match (self, private) {
            (Network::Mainnet, false) => 0x0488_B21E,
            (Network::Mainnet, true) => 0x0488_ADE4,
            (Network::Testnet, false) => 0x0435_87CF,
            (Network::Testnet, true) => 0x0435_8394,
        }
    }

    fn from_version(version: u32) -> Option<(Network, bool)> {
        match version {
            0x0488_B21E => Some((Network::Mainnet, false)),
            0x0488_ADE4 => Some((Network::Mainnet, true)),
            0x0435_87CF => Some((Network::Testnet, false)),
            0x0435_8394 => Some((Network::Testnet, true)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum KeyMaterial {
    Public(Secp256k1Point),
    Secret(Secp256k1Scalar),
}

/// An extended public or secret key plus its derivation metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedKey {
    pub network: Network,
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
    pub chain_code: [u8; 32],
    key: KeyMaterial,
}

impl ExtendedKey {
    /// Build a master secret key from a BIP-32 seed.
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self> {
        let mut mac = HmacSha512::new_from_slice(b"Bitcoin seed")
            .expect("HMAC accepts any key length");
        mac.update(seed);
        let out = mac.finalize().into_bytes();
        let k = Secp256k1Scalar::from_bytes_be_strict(out[..32].try_into().expect("32 bytes"))
            .filter(|k| !k.is_zero())
            .ok_or_else(|| Error::KeyDerivation("seed produces an invalid master key".into()))?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&out[32..]);
        Ok(ExtendedKey {
            network,
            depth: 0,
            parent_fingerprint: [0u8; 4],
            child_number: 0,
            chain_code,
            key: KeyMaterial::Secret(k),
        })
    }

    /// Build a public-only extended key from raw parts. Used for the
    /// synthetic musig aggregate keys.
    pub fn from_public_parts(
        network: Network,
        chain_code: [u8; 32],
        point: Secp256k1Point,
    ) -> Self {
        ExtendedKey {
            network,
            depth: 0,
            parent_fingerprint: [0u8; 4],
            child_number: 0,
            chain_code,
            key: KeyMaterial::Public(point),
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self.key, KeyMaterial::Secret(_))
    }

    /// The secret scalar, if this key carries one.
    pub fn secret_scalar(&self) -> Option<&Secp256k1Scalar> {
        match &self.key {
            KeyMaterial::Secret(k) => Some(k),
            KeyMaterial::Public(_) => None,
        }
    }

    /// The public point (computed from the secret for private keys).
    pub fn public_point(&self) -> Secp256k1Point {
        match &self.key {
            KeyMaterial::Public(P) => P.clone(),
            KeyMaterial::Secret(k) => Secp256k1Point::generator() * k,
        }
    }

    /// Compressed public key, 33 bytes.
    pub fn pubkey_bytes(&self) -> [u8; 33] {
        self.public_point().to_bytes_compressed()
    }

    /// `HASH160(pubkey)[..4]`, the fingerprint of this key.
    pub fn fingerprint(&self) -> [u8; 4] {
        hash160(&self.pubkey_bytes())[..4].try_into().expect("4 bytes")
    }

    /// Public-only projection; drops the secret, keeps the metadata.
    pub fn neuter(&self) -> ExtendedKey {
        ExtendedKey {
            network: self.network,
            depth: self.depth,
            parent_fingerprint: self.parent_fingerprint,
            child_number: self.child_number,
            chain_code: self.chain_code,
            key: KeyMaterial::Public(self.public_point()),
        }
    }

    /// One child-derivation step. Hardened indices need the secret key.
    pub fn derive_child(&self, index: u32) -> Result<ExtendedKey> {
        let hardened = index >= HARDENED_INDEX;
        let mut mac = HmacSha512::new_from_slice(&self.chain_code)
            .expect("HMAC accepts any key length");
        match &self.key {
            KeyMaterial::Secret(k) if hardened => {
                mac.update(&[0u8]);
                mac.update(&k.to_bytes_be());
            }
            _ if hardened => {
                return Err(Error::KeyDerivation(
                    "hardened derivation requires the secret key".into(),
                ));
            }
            _ => mac.update(&self.pubkey_bytes()),
        }
        mac.update(&index.to_be_bytes());
        let out = mac.finalize().into_bytes();

        if BigUint::from_bytes_be(&out[..32]) >= *group_order() {
            return Err(Error::KeyDerivation(format!(
                "child {index} tweak exceeds the group order"
            )));
        }
        let tweak = Secp256k1Scalar::from_bytes_be(&out[..32]);
        let key = match &self.key {
            KeyMaterial::Secret(k) => {
                let child = tweak + k;
                if child.is_zero() {
                    return Err(Error::KeyDerivation(format!("child {index} key is zero")));
                }
                KeyMaterial::Secret(child)
            }
            KeyMaterial::Public(P) => {
                let child = P.clone() + &(Secp256k1Point::generator() * &tweak);
                if child.is_infinity() {
                    return Err(Error::KeyDerivation(format!(
                        "child {index} key is the point at infinity"
                    )));
                }
                KeyMaterial::Public(child)
            }
        };
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&out[32..]);
        Ok(ExtendedKey {
            network: self.network,
            depth: self
                .depth
                .checked_add(1)
                .ok_or_else(|| Error::KeyDerivation("derivation path too deep".into()))?,
            parent_fingerprint: self.fingerprint(),
            child_number: index,
            chain_code,
            key,
        })
    }

    /// Derive along a path of child indices.
    pub fn derive_path(&self, path: &[u32]) -> Result<ExtendedKey> {
        let mut key = self.clone();
        for &index in path {
            key = key.derive_child(index)?;
        }
        Ok(key)
    }

    /// The per-step HMAC tweaks of an unhardened public derivation,
    /// without deriving the key itself. These are exactly the plain
    /// tweaks a musig aggregate-key context must absorb to sign for a
    /// derived child of the synthetic aggregate xpub.
    pub fn derive_pub_tweaks(&self, path: &[u32]) -> Result<Vec<[u8; 32]>> {
        let mut tweaks = Vec::with_capacity(path.len());
        let mut point = self.public_point();
        let mut chain_code = self.chain_code;
        for (step, &index) in path.iter().enumerate() {
            if index >= HARDENED_INDEX {
                return Err(Error::KeyDerivation(
                    "hardened step in a public-only derivation".into(),
                ));
            }
            let mut mac =
                HmacSha512::new_from_slice(&chain_code).expect("HMAC accepts any key length");
            mac.update(&point.to_bytes_compressed());
            mac.update(&index.to_be_bytes());
            let out = mac.finalize().into_bytes();
            if BigUint::from_bytes_be(&out[..32]) >= *group_order() {
                return Err(Error::KeyDerivation(format!(
                    "step {step} tweak exceeds the group order"
                )));
            }
            let tweak: [u8; 32] = out[..32].try_into().expect("32 bytes");
            chain_code.copy_from_slice(&out[32..]);
            if step < path.len() - 1 {
                let t = Secp256k1Scalar::from_bytes_be(&tweak);
                point = point + &(Secp256k1Point::generator() * &t);
            }
            tweaks.push(tweak);
        }
        Ok(tweaks)
    }

    fn to_payload(&self) -> [u8; 78] {
        let mut out = [0u8; 78];
        out[..4].copy_from_slice(&self.network.version(self.is_private()).to_be_bytes());
        out[4] = self.depth;
        out[5..9].copy_from_slice(&self.parent_fingerprint);
        out[9..13].copy_from_slice(&self.child_number.to_be_bytes());
        out[13..45].copy_from_slice(&self.chain_code);
        match &self.key {
            KeyMaterial::Secret(k) => {
                out[45] = 0x00;
                out[46..].copy_from_slice(&k.to_bytes_be());
            }
            KeyMaterial::Public(P) => out[45..].copy_from_slice(&P.to_bytes_compressed()),
        }
        out
    }
}

impl fmt::Display for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.to_payload()).with_check().into_string())
    }
}

impl FromStr for ExtendedKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let payload = bs58::decode(s)
            .with_check(None)
            .into_vec()
            .map_err(|e| Error::KeyDerivation(format!("invalid base58check: {e}")))?;
        if payload.len() != 78 {
            return Err(Error::KeyDerivation(format!(
                "extended key payload must be 78 bytes, got {}",
                payload.len()
            )));
        }
        let version = u32::from_be_bytes(payload[..4].try_into().expect("4 bytes"));
        let (network, private) = Network::from_version(version)
            .ok_or_else(|| Error::KeyDerivation(format!("unknown version bytes {version:#010x}")))?;
        let depth = payload[4];
        let parent_fingerprint: [u8; 4] = payload[5..9].try_into().expect("4 bytes");
        let child_number = u32::from_be_bytes(payload[9..13].try_into().expect("4 bytes"));
        let chain_code: [u8; 32] = payload[13..45].try_into().expect("32 bytes");
        let key = if private {
            if payload[45] != 0x00 {
                return Err(Error::KeyDerivation("secret key must be 0x00-prefixed".into()));
            }
            let k = Secp256k1Scalar::from_bytes_be_strict(
                payload[46..].try_into().expect("32 bytes"),
            )
            .filter(|k| !k.is_zero())
            .ok_or_else(|| Error::KeyDerivation("secret key out of range".into()))?;
            KeyMaterial::Secret(k)
        } else {
            let bytes: [u8; 33] = payload[45..].try_into().expect("33 bytes");
            let P = Secp256k1Point::from_bytes_compressed(&bytes)
                .ok_or_else(|| Error::KeyDerivation("public key is not a valid point".into()))?;
            KeyMaterial::Public(P)
        };
        Ok(ExtendedKey {
            network,
            depth,
            parent_fingerprint,
            child_number,
            chain_code,
            key,
        })
    }
}

/// Parse one derivation path component, `"48'"`, `"48h"`, or `"48"`.
fn parse_path_component(component: &str) -> Result<u32> {
    let (digits, hardened) = match component.strip_suffix(['\'', 'h']) {
        Some(digits) => (digits, true),
        None => (component, false),
    };
    let index: u32 = digits
        .parse()
        .map_err(|_| Error::KeyDerivation(format!("invalid path component '{component}'")))?;
    if index >= HARDENED_INDEX {
        return Err(Error::KeyDerivation(format!("child index {index} out of range")));
    }
    Ok(if hardened { index + HARDENED_INDEX } else { index })
}

/// Parse a `/`-separated derivation path without the leading `m`.
pub fn parse_path(path: &str) -> Result<Vec<u32>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    path.split('/').map(parse_path_component).collect()
}

/// A key's origin: the master fingerprint and the path from master.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyOriginInfo {
    pub fingerprint: [u8; 4],
    pub path: Vec<u32>,
}

impl fmt::Display for KeyOriginInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.fingerprint))?;
        for &index in &self.path {
            if index >= HARDENED_INDEX {
                write!(f, "/{}'", index - HARDENED_INDEX)?;
            } else {
                write!(f, "/{index}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for KeyOriginInfo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (fpr, rest) = match s.split_once('/') {
            Some((fpr, rest)) => (fpr, rest),
            None => (s, ""),
        };
        let bytes = hex::decode(fpr)
            .map_err(|_| Error::KeyDerivation(format!("invalid fingerprint '{fpr}'")))?;
        let fingerprint: [u8; 4] = bytes
            .try_into()
            .map_err(|_| Error::KeyDerivation("fingerprint must be 4 bytes".into()))?;
        Ok(KeyOriginInfo {
            fingerprint,
            path: parse_path(rest)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // BIP-32 test vector 1, seed 000102030405060708090a0b0c0d0e0f.
    const V1_SEED: &str = "000102030405060708090a0b0c0d0e0f";
    const V1_MASTER_XPRV: &str = "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi";
    const V1_MASTER_XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";
    const V1_M0H_XPRV: &str = "xprv9uHRZZhk6KAJC1avXpDAp4MDc3sQKNxDiPvvkX8Br5ngLNv1TxvUxt4cV1rGL5hj6KCesnDYUhd7oWgT11eZG7XnxHrnYeSvkzY7d2bhkJ7";
    const V1_M0H_XPUB: &str = "xpub68Gmy5EdvgibQVfPdqkBBCHxA5htiqg55crXYuXoQRKfDBFA1WEjWgP6LHhwBZeNK1VTsfTFUHCdrfp1bgwQ9xv5ski8PX9rL2dZXvgGDnw";

    // A pair of testnet keys whose public projections are fixed.
    const TPRV_1: &str = "tprv8gFWbQBTLFhbVcpeAJ1nGbPetqLo2a5Duqu3E5wXUFJ4auLcBAfwhJscGbPjzKNvpCdG3KK3BLCTLi8YKy4PXnA1hxdowdpTaMqTcF5ZpUz";
    const TPUB_1: &str = "tpubDCwYjpDhUdPGP5rS3wgNg13mTrrjBuG8V9VpWbyptX6TRPbNoZVXsoVUSkCjmQ8jJycjuDKBb9eataSymXakTTaGifxR6kmVsfFehH1ZgJT";
    const TPRV_2: &str = "tprv8gFWbQBTLFhbX3EK3cS7LmenwE3JjXbD9kN9yXfq7LcBm81RSf8vPGPqGPjZSeX41LX9ZN14St3z8YxW48aq5Yhr9pQZVAyuBthfi6quTCf";
    const TPUB_2: &str = "tpubDCwYjpDhUdPGQWG6wG6hkBJuWFZEtrn7j3xwG3i8XcQabcGC53xWZm1hSXrUPFS5UvZ3QhdPSjXWNfWmFGTioARHuG5J7XguEjgg7p8PxAm";

    #[test]
    fn bip32_vector1_master_and_first_hardened_child() {
        let seed = hex::decode(V1_SEED).unwrap();
        let master = ExtendedKey::from_seed(&seed, Network::Mainnet).unwrap();
        assert_eq!(master.to_string(), V1_MASTER_XPRV);
        assert_eq!(master.neuter().to_string(), V1_MASTER_XPUB);

        let child = master.derive_child(HARDENED_INDEX).unwrap();
        assert_eq!(child.to_string(), V1_M0H_XPRV);
        assert_eq!(child.neuter().to_string(), V1_M0H_XPUB);
    }

    #[test]
    fn neutered_testnet_keys_match_fixed_tpubs() {
        for (tprv, tpub) in [(TPRV_1, TPUB_1), (TPRV_2, TPUB_2)] {
            let key: ExtendedKey = tprv.parse().unwrap();
            assert!(key.is_private());
            assert_eq!(key.network, Network::Testnet);
            assert_eq!(key.neuter().to_string(), tpub);
        }
    }

    #[test]
    fn serialization_roundtrip() {
        let key: ExtendedKey = TPUB_1.parse().unwrap();
        assert_eq!(key.to_string(), TPUB_1);
        assert!(!key.is_private());
        assert!(key.secret_scalar().is_none());
    }

    #[test]
    fn public_and_secret_derivation_commute() {
        let secret: ExtendedKey = TPRV_1.parse().unwrap();
        let path = [0u32, 3];
        let via_secret = secret.derive_path(&path).unwrap().neuter();
        let via_public = secret.neuter().derive_path(&path).unwrap();
        assert_eq!(via_secret, via_public);
        assert_eq!(via_secret.depth, secret.depth + 2);
    }

    #[test]
    fn hardened_derivation_needs_the_secret() {
        let public: ExtendedKey = TPUB_1.parse().unwrap();
        let err = public.derive_child(HARDENED_INDEX).unwrap_err();
        assert!(matches!(err, Error::KeyDerivation(_)));
    }

    #[test]
    fn pub_tweaks_reproduce_path_derivation() {
        let key: ExtendedKey = TPUB_2.parse().unwrap();
        let path = [1u32, 5];
        let tweaks = key.derive_pub_tweaks(&path).unwrap();
        assert_eq!(tweaks.len(), 2);
        let mut point = key.public_point();
        for tweak in &tweaks {
            let t = Secp256k1Scalar::from_bytes_be(tweak);
            point = point + &(Secp256k1Point::generator() * &t);
        }
        assert_eq!(point, key.derive_path(&path).unwrap().public_point());
    }

    #[test]
    fn path_strings_roundtrip() {
        let origin: KeyOriginInfo = "f5acc2fd/48'/1'/0'/2'".parse().unwrap();
        assert_eq!(origin.fingerprint, [0xf5, 0xac, 0xc2, 0xfd]);
        assert_eq!(origin.path.len(), 4);
        assert!(origin.path.iter().all(|&i| i >= HARDENED_INDEX));
        assert_eq!(origin.to_string(), "f5acc2fd/48'/1'/0'/2'");

        assert_eq!(parse_path("48h/0/12").unwrap(), vec![48 + HARDENED_INDEX, 0, 12]);
        assert!(parse_path("not-a-number").is_err());
    }

    #[test]
    fn rejects_malformed_serializations() {
        assert!("xpub-definitely-not-base58".parse::<ExtendedKey>().is_err());
        // Valid base58check but wrong payload length.
        let short = bs58::encode(&[0u8; 40]).with_check().into_string();
        assert!(short.parse::<ExtendedKey>().is_err());
    }
}
