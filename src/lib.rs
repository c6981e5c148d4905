//! Multi-party Schnorr (MuSig2, BIP-327 style) signing for Taproot
//! (BIP-341) outputs, driven by wallet-policy descriptor templates that
//! mix ordinary keys and aggregated `musig()` key groups.
#![allow(non_snake_case)]
pub mod ec;
pub use ec::{Secp256k1Point, Secp256k1Scalar, tagged_hash};
pub mod schnorr;
pub use schnorr::{pubkey_gen, schnorr_sign, schnorr_verify};
pub mod taproot;
pub use taproot::{TapTree, output_script, tweak_pubkey, tweak_seckey};
pub mod keyagg;
pub use keyagg::KeyAggContext;
pub mod nonce;
pub use nonce::{AggNonce, NonceError, PubNonce, SecNonce, nonce_agg};
pub mod session;
pub use session::{MusigSession, PartialSignature};
pub mod bip32;
pub use bip32::{ExtendedKey, KeyOriginInfo, Network};
pub mod descriptor;
pub use descriptor::{KeyPlaceholder, TrDescriptorTemplate};
pub mod wallet;
pub use wallet::{WalletPolicy, WalletPolicyVersion, aggregate_musig_xpub};
pub mod psbt;
pub use psbt::{Psbt, Transaction, taproot_sighash};
pub mod cosigner;
pub use cosigner::{
    CancelToken, DeviceCosigner, Musig2Cosigner, SigningDevice, SoftwareCosigner,
    aggregate_signatures, sign_psbt,
};
pub mod error;
pub use error::{Error, Result};
