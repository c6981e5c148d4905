//! Cosigners and session orchestration.
//!
//! A cosigner is anything that can contribute public nonces (round 1)
//! and partial signatures (round 2) for the musig-relevant inputs of a
//! shared container: a software signer holding a raw extended secret
//! key, or an adapter around an external signing device. Orchestration
//! drives both rounds across all cosigners with a barrier in between,
//! then verifies and aggregates every input's contributions.
//!
//! Calls may block (user approval, device I/O). Cosigners mutate the
//! shared container in sequence; callers that run them concurrently
//! must serialize access themselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};

use crate::bip32::{ExtendedKey, HARDENED_INDEX};
use crate::descriptor::KeyPlaceholder;
use crate::ec::{Secp256k1Point, Secp256k1Scalar, tagged_hash};
use crate::error::{Error, Result};
use crate::keyagg::KeyAggContext;
use crate::nonce::{PubNonce, SecNonce, nonce_agg};
use crate::psbt::{Musig2EntryKey, Psbt, PsbtInput, taproot_sighash};
use crate::schnorr::schnorr_verify;
use crate::session::{MusigSession, PartialSignature};
use crate::taproot::{TAPROOT_LEAF_TAPSCRIPT, tapleaf_hash};
use crate::wallet::WalletPolicy;

/// Cooperative cancellation for blocking device calls.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A signing participant: produces public nonces and partial signatures
/// for every musig-relevant input of the shared container.
///
/// Round-1 calls are not idempotent: calling twice produces two
/// different, incompatible nonce sets. Call each round exactly once per
/// session per cosigner.
pub trait Musig2Cosigner {
    /// Compressed public key this cosigner contributes to its group.
    fn participant_pubkey(&self) -> [u8; 33];

    /// Round 1: write a fresh public nonce for every relevant input.
    fn generate_public_nonces(&mut self, psbt: &mut Psbt) -> Result<()>;

    /// Round 2: write this participant's partial signatures. Requires
    /// every participant's round-1 nonce to be present already.
    fn generate_partial_signatures(&mut self, psbt: &mut Psbt) -> Result<()>;
}

/// One (input, musig placeholder) pair that needs a signature, with its
/// fully-tweaked aggregate context and sighash message.
pub(crate) struct MusigItem {
    pub input_index: usize,
    pub leaf_hash: Option<[u8; 32]>,
    /// Compressed aggregate key before derivation tweaks; the map key
    /// of every nonce and partial-signature entry.
    pub aggregate_key: [u8; 33],
    /// Sorted participant set.
    pub participants: Vec<[u8; 33]>,
    pub key_ctx: KeyAggContext,
    pub message: [u8; 32],
}

/// Locate which (change, address_index) pair an input was derived with,
/// by matching the aggregate key's fingerprint in the input's key
/// origins against the placeholder's derivation steps.
fn locate_input(
    input: &PsbtInput,
    placeholder: &KeyPlaceholder,
    fingerprint: &[u8; 4],
) -> Option<(bool, u32)> {
    let num1 = placeholder.change_step(false);
    let num2 = placeholder.change_step(true);
    for (_, (_, origin)) in &input.tap.bip32_paths {
        if &origin.fingerprint == fingerprint
            && origin.path.len() == 2
            && origin.path.iter().all(|&step| step < HARDENED_INDEX)
            && (origin.path[0] == num1 || origin.path[0] == num2)
        {
            let is_change = num1 != num2 && origin.path[0] == num2;
            return Some((is_change, origin.path[1]));
        }
    }
    None
}

/// Resolve every musig-relevant signable item of the container: for
/// each musig placeholder, each input it covers, with the aggregate
/// context carrying the BIP-32 child tweaks and (for the keypath) the
/// taproot tweak.
pub(crate) fn musig_items(policy: &WalletPolicy, psbt: &Psbt) -> Result<Vec<MusigItem>> {
    let tmpl = policy.template()?;
    let mut items = Vec::new();
    for (placeholder, fragment) in tmpl.placeholders() {
        if !placeholder.is_musig() {
            continue;
        }
        let root = policy.placeholder_root_key(placeholder)?;
        let participants = root
            .participants
            .clone()
            .expect("a musig placeholder always resolves to a participant set");
        let aggregate_key = root.key.pubkey_bytes();
        let fingerprint = root.key.fingerprint();
        let is_keypath = placeholder == &tmpl.key;

        for (input_index, input) in psbt.inputs.iter().enumerate() {
            let Some((is_change, address_index)) =
                locate_input(input, placeholder, &fingerprint)
            else {
                continue;
            };

            let leaf_hash = match fragment {
                Some(fragment) => Some(tapleaf_hash(
                    TAPROOT_LEAF_TAPSCRIPT,
                    &policy.leaf_script(fragment, is_change, address_index)?,
                )),
                None => None,
            };

            let mut key_ctx = KeyAggContext::new(&participants)?;
            let subpath = [placeholder.change_step(is_change), address_index];
            for tweak in root.key.derive_pub_tweaks(&subpath)? {
                key_ctx.apply_plain_tweak(&tweak)?;
            }
            if is_keypath {
                let mut buf = Vec::with_capacity(64);
                buf.extend_from_slice(&key_ctx.xonly_bytes());
                if let Some(merkle_root) = policy.merkle_root(is_change, address_index)? {
                    buf.extend_from_slice(&merkle_root);
                }
                key_ctx.apply_xonly_tweak(&tagged_hash("TapTweak", &buf))?;
            }

            let message = taproot_sighash(psbt, input_index, leaf_hash.as_ref())?;
            items.push(MusigItem {
                input_index,
                leaf_hash,
                aggregate_key,
                participants: participants.clone(),
                key_ctx,
                message,
            });
        }
    }
    Ok(items)
}

fn entry_key(item: &MusigItem, participant: &[u8; 33]) -> Musig2EntryKey {
    Musig2EntryKey {
        aggregate_key: item.aggregate_key,
        participant_key: *participant,
        leaf_hash: item.leaf_hash,
    }
}

/// Read every participant's round-1 nonce for one item, in canonical
/// (sorted-participant) order.
fn collect_pubnonces(input: &PsbtInput, item: &MusigItem) -> Result<Vec<PubNonce>> {
    let mut nonces = Vec::with_capacity(item.participants.len());
    for participant in &item.participants {
        let bytes = input
            .musig2_pub_nonces
            .get(&entry_key(item, participant))
            .ok_or_else(|| {
                Error::ProtocolOrdering(format!(
                    "round-1 nonce of participant {} missing for input {}",
                    hex::encode(participant),
                    item.input_index
                ))
            })?;
        nonces.push(PubNonce::from_bytes(bytes)?);
    }
    Ok(nonces)
}

/// A fully automated cosigner holding a raw extended secret key.
///
/// The secret contributes at the musig group's root: per-address
/// derivation happens on the aggregate key, not on the participants.
pub struct SoftwareCosigner {
    policy: WalletPolicy,
    seckey: Secp256k1Scalar,
    pubkey: [u8; 33],
    /// Secret nonces by (input, aggregate key, leaf hash), inserted in
    /// round 1 and removed the moment they sign.
    secnonces: HashMap<(usize, [u8; 33], Option<[u8; 32]>), SecNonce>,
}

impl SoftwareCosigner {
    /// The extended key must carry secret material, and its public key
    /// must belong to at least one musig group of the policy.
    pub fn new(policy: WalletPolicy, xpriv: &ExtendedKey) -> Result<Self> {
        let seckey = xpriv.secret_scalar().cloned().ok_or_else(|| {
            Error::KeyDerivation("software cosigner needs an extended secret key".into())
        })?;
        let pubkey = xpriv.pubkey_bytes();

        let tmpl = policy.template()?;
        let mut member = false;
        for (placeholder, _) in tmpl.placeholders() {
            if !placeholder.is_musig() {
                continue;
            }
            for index in placeholder.key_indices() {
                if policy.key_info(index)?.key.pubkey_bytes() == pubkey {
                    member = true;
                }
            }
        }
        if !member {
            return Err(Error::MalformedDescriptor(
                "cosigner key does not belong to any musig group of the policy".into(),
            ));
        }
        Ok(SoftwareCosigner {
            policy,
            seckey,
            pubkey,
            secnonces: HashMap::new(),
        })
    }
}

impl Musig2Cosigner for SoftwareCosigner {
    fn participant_pubkey(&self) -> [u8; 33] {
        self.pubkey
    }

    fn generate_public_nonces(&mut self, psbt: &mut Psbt) -> Result<()> {
        for item in musig_items(&self.policy, psbt)? {
            if !item.participants.contains(&self.pubkey) {
                continue;
            }
            let secnonce = SecNonce::generate()?;
            psbt.inputs[item.input_index]
                .musig2_pub_nonces
                .insert(entry_key(&item, &self.pubkey), secnonce.public_nonce().to_bytes());
            self.secnonces
                .insert((item.input_index, item.aggregate_key, item.leaf_hash), secnonce);
            debug!("published nonce for input {}", item.input_index);
        }
        Ok(())
    }

    fn generate_partial_signatures(&mut self, psbt: &mut Psbt) -> Result<()> {
        for item in musig_items(&self.policy, psbt)? {
            if !item.participants.contains(&self.pubkey) {
                continue;
            }
            let pubnonces = collect_pubnonces(&psbt.inputs[item.input_index], &item)?;
            let session = MusigSession::new(item.key_ctx.clone(), &nonce_agg(&pubnonces)?, &item.message)?;
            let secnonce = self
                .secnonces
                .remove(&(item.input_index, item.aggregate_key, item.leaf_hash))
                .ok_or_else(|| {
                    Error::ProtocolOrdering(format!(
                        "no round-1 state for input {}; round 1 must run first",
                        item.input_index
                    ))
                })?;
            let partial = session.partial_sign(secnonce, &self.seckey)?;
            psbt.inputs[item.input_index]
                .musig2_partial_sigs
                .insert(entry_key(&item, &self.pubkey), partial.to_bytes());
            debug!("published partial signature for input {}", item.input_index);
        }
        Ok(())
    }
}

/// Round-1 artifact returned over a device channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonceArtifact {
    pub input_index: usize,
    pub participant_key: [u8; 33],
    pub aggregate_key: [u8; 33],
    pub leaf_hash: Option<[u8; 32]>,
    pub pub_nonce: [u8; 66],
}

/// Round-2 artifact returned over a device channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialSigArtifact {
    pub input_index: usize,
    pub participant_key: [u8; 33],
    pub aggregate_key: [u8; 33],
    pub leaf_hash: Option<[u8; 32]>,
    pub partial_sig: [u8; 32],
}

/// Capability interface of an external signing device. The transport
/// behind it (USB, an emulator, a test double) is swappable without
/// touching protocol logic. Calls may block on user approval and should
/// watch the cancellation token during long waits.
pub trait SigningDevice {
    fn master_fingerprint(&mut self, cancel: &CancelToken) -> Result<[u8; 4]>;

    fn extended_pubkey(&mut self, path: &[u32], cancel: &CancelToken) -> Result<ExtendedKey>;

    /// Register a wallet policy; the returned opaque value re-authorizes
    /// it on later signing requests.
    fn register_wallet(&mut self, policy: &WalletPolicy, cancel: &CancelToken)
    -> Result<[u8; 32]>;

    fn musig_round1(
        &mut self,
        psbt: &Psbt,
        policy: &WalletPolicy,
        wallet_hmac: Option<&[u8; 32]>,
        cancel: &CancelToken,
    ) -> Result<Vec<NonceArtifact>>;

    fn musig_round2(
        &mut self,
        psbt: &Psbt,
        policy: &WalletPolicy,
        wallet_hmac: Option<&[u8; 32]>,
        cancel: &CancelToken,
    ) -> Result<Vec<PartialSigArtifact>>;
}

/// A cosigner backed by an external signing device.
pub struct DeviceCosigner<D: SigningDevice> {
    device: D,
    policy: WalletPolicy,
    wallet_hmac: Option<[u8; 32]>,
    participant_key: [u8; 33],
    cancel: CancelToken,
}

impl<D: SigningDevice> DeviceCosigner<D> {
    /// Identify the device's key in the policy by its master
    /// fingerprint, then register the policy with the device.
    pub fn new(mut device: D, policy: WalletPolicy, cancel: CancelToken) -> Result<Self> {
        let fingerprint = device.master_fingerprint(&cancel)?;
        let mut participant_key = None;
        for index in 0..policy.keys_info.len() as u32 {
            let info = policy.key_info(index)?;
            if info.origin.as_ref().map(|o| o.fingerprint) == Some(fingerprint) {
                participant_key = Some(info.key.pubkey_bytes());
                break;
            }
        }
        let participant_key = participant_key.ok_or_else(|| {
            Error::MalformedDescriptor(format!(
                "no policy key has master fingerprint {}",
                hex::encode(fingerprint)
            ))
        })?;
        let wallet_hmac = Some(device.register_wallet(&policy, &cancel)?);
        info!("registered policy '{}' with device {}", policy.name, hex::encode(fingerprint));
        Ok(DeviceCosigner {
            device,
            policy,
            wallet_hmac,
            participant_key,
            cancel,
        })
    }

    pub fn wallet_hmac(&self) -> Option<&[u8; 32]> {
        self.wallet_hmac.as_ref()
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled("device signing was cancelled".into()))
        } else {
            Ok(())
        }
    }
}

impl<D: SigningDevice> Musig2Cosigner for DeviceCosigner<D> {
    fn participant_pubkey(&self) -> [u8; 33] {
        self.participant_key
    }

    fn generate_public_nonces(&mut self, psbt: &mut Psbt) -> Result<()> {
        self.ensure_not_cancelled()?;
        let artifacts =
            self.device
                .musig_round1(psbt, &self.policy, self.wallet_hmac.as_ref(), &self.cancel)?;
        for artifact in artifacts {
            let input = psbt.inputs.get_mut(artifact.input_index).ok_or_else(|| {
                Error::ProtocolOrdering(format!(
                    "device returned a nonce for unknown input {}",
                    artifact.input_index
                ))
            })?;
            input.musig2_pub_nonces.insert(
                Musig2EntryKey {
                    aggregate_key: artifact.aggregate_key,
                    participant_key: artifact.participant_key,
                    leaf_hash: artifact.leaf_hash,
                },
                artifact.pub_nonce,
            );
        }
        Ok(())
    }

    fn generate_partial_signatures(&mut self, psbt: &mut Psbt) -> Result<()> {
        self.ensure_not_cancelled()?;
        let artifacts =
            self.device
                .musig_round2(psbt, &self.policy, self.wallet_hmac.as_ref(), &self.cancel)?;
        for artifact in artifacts {
            let input = psbt.inputs.get_mut(artifact.input_index).ok_or_else(|| {
                Error::ProtocolOrdering(format!(
                    "device returned a partial signature for unknown input {}",
                    artifact.input_index
                ))
            })?;
            input.musig2_partial_sigs.insert(
                Musig2EntryKey {
                    aggregate_key: artifact.aggregate_key,
                    participant_key: artifact.participant_key,
                    leaf_hash: artifact.leaf_hash,
                },
                artifact.partial_sig,
            );
        }
        Ok(())
    }
}

/// Per-item outcome of a signing session.
#[derive(Debug)]
pub struct ItemOutcome {
    pub input_index: usize,
    pub leaf_hash: Option<[u8; 32]>,
    pub result: Result<[u8; 64]>,
}

/// Drive the full two-round protocol: round 1 for every cosigner, a
/// barrier, round 2 for every cosigner, then per-input verification and
/// aggregation. Within a round the cosigner order does not matter.
pub fn sign_psbt(
    psbt: &mut Psbt,
    policy: &WalletPolicy,
    cosigners: &mut [&mut dyn Musig2Cosigner],
) -> Result<Vec<ItemOutcome>> {
    info!("round 1: requesting public nonces from {} cosigners", cosigners.len());
    for cosigner in cosigners.iter_mut() {
        cosigner.generate_public_nonces(psbt)?;
    }
    // Round-1 barrier: every nonce above is committed before any
    // round-2 call below starts.
    info!("round 2: requesting partial signatures");
    for cosigner in cosigners.iter_mut() {
        cosigner.generate_partial_signatures(psbt)?;
    }
    aggregate_signatures(psbt, policy)
}

/// Verify every partial signature, aggregate per input, check the
/// result as an ordinary Schnorr signature against the tweaked key, and
/// write the final signature back. Items fail independently.
pub fn aggregate_signatures(psbt: &mut Psbt, policy: &WalletPolicy) -> Result<Vec<ItemOutcome>> {
    let items = musig_items(policy, psbt)?;
    let mut outcomes = Vec::with_capacity(items.len());
    for item in items {
        let result = aggregate_one(psbt, &item);
        match &result {
            Ok(_) => info!("input {}: aggregate signature verified", item.input_index),
            Err(e) => warn!("input {}: {e}", item.input_index),
        }
        outcomes.push(ItemOutcome {
            input_index: item.input_index,
            leaf_hash: item.leaf_hash,
            result,
        });
    }
    Ok(outcomes)
}

fn aggregate_one(psbt: &mut Psbt, item: &MusigItem) -> Result<[u8; 64]> {
    let input = &psbt.inputs[item.input_index];
    let pubnonces = collect_pubnonces(input, item)?;
    let session = MusigSession::new(item.key_ctx.clone(), &nonce_agg(&pubnonces)?, &item.message)?;

    let mut partials = Vec::with_capacity(item.participants.len());
    for (participant, pubnonce) in item.participants.iter().zip(&pubnonces) {
        let bytes = input
            .musig2_partial_sigs
            .get(&entry_key(item, participant))
            .ok_or_else(|| {
                Error::ProtocolOrdering(format!(
                    "round-2 partial signature of participant {} missing for input {}",
                    hex::encode(participant),
                    item.input_index
                ))
            })?;
        let partial = PartialSignature::from_bytes(bytes)?;
        let P = Secp256k1Point::from_bytes_compressed(participant).ok_or_else(|| {
            Error::CryptoVerification("participant key is not a valid point".into())
        })?;
        if !session.partial_verify(&partial, pubnonce, &P) {
            return Err(Error::PartialSignature {
                input_index: item.input_index,
                participant: hex::encode(participant),
            });
        }
        partials.push(partial);
    }

    let sig = session.aggregate(&partials)?;
    if !schnorr_verify(&session.key_ctx().xonly_bytes(), &item.message, &sig) {
        return Err(Error::CryptoVerification(format!(
            "aggregate signature failed final verification for input {}",
            item.input_index
        )));
    }

    let input = &mut psbt.inputs[item.input_index];
    match item.leaf_hash {
        Some(leaf_hash) => {
            input
                .tap_script_sigs
                .insert((session.key_ctx().xonly_bytes(), leaf_hash), sig);
        }
        None => input.tap_key_sig = Some(sig),
    }
    Ok(sig)
}
