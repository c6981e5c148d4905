//! The signing-metadata container: a minimal transaction model plus the
//! per-input/per-output fields the signing flow reads and writes. The
//! container does no synchronization of its own; concurrent writers
//! must be serialized externally.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::bip32::KeyOriginInfo;
use crate::ec::tagged_hash;
use crate::error::{Error, Result};
use crate::taproot::write_compact_size;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutPoint {
    pub txid: [u8; 32],
    pub vout: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub sequence: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub lock_time: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
}

/// Key of a per-participant musig entry (nonce or partial signature).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Musig2EntryKey {
    /// Compressed aggregate key of the group, before derivation tweaks.
    pub aggregate_key: [u8; 33],
    /// Compressed key of the contributing participant.
    pub participant_key: [u8; 33],
    /// Present when the group signs for a script leaf.
    pub leaf_hash: Option<[u8; 32]>,
}

/// Taproot key metadata shared by inputs and the change output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaprootFields {
    /// x-only internal key.
    pub internal_key: Option<[u8; 32]>,
    /// Script-tree merkle root, absent for keypath-only policies.
    pub merkle_root: Option<[u8; 32]>,
    /// Derived x-only pubkey → (leaf hashes, key origin).
    pub bip32_paths: BTreeMap<[u8; 32], (Vec<[u8; 32]>, KeyOriginInfo)>,
    /// Aggregate key → participant keys in sorted order.
    pub participant_pubkeys: BTreeMap<[u8; 33], Vec<[u8; 33]>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PsbtInput {
    pub witness_utxo: Option<TxOut>,
    pub tap: TaprootFields,
    /// Round-1 public nonces, 66 bytes each.
    pub musig2_pub_nonces: BTreeMap<Musig2EntryKey, [u8; 66]>,
    /// Round-2 partial signatures, 32 bytes each.
    pub musig2_partial_sigs: BTreeMap<Musig2EntryKey, [u8; 32]>,
    /// Final signatures for script-path leaves, keyed by
    /// (x-only key, leaf hash).
    pub tap_script_sigs: BTreeMap<([u8; 32], [u8; 32]), [u8; 64]>,
    /// Final keypath signature.
    pub tap_key_sig: Option<[u8; 64]>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PsbtOutput {
    pub tap: TaprootFields,
}

/// The shared container one signing session mutates: the unsigned
/// transaction plus one metadata entry per input and output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Psbt {
    pub tx: Transaction,
    pub inputs: Vec<PsbtInput>,
    pub outputs: Vec<PsbtOutput>,
}

impl Psbt {
    pub fn from_tx(tx: Transaction) -> Self {
        let inputs = tx.inputs.iter().map(|_| PsbtInput::default()).collect();
        let outputs = tx.outputs.iter().map(|_| PsbtOutput::default()).collect();
        Psbt { tx, inputs, outputs }
    }
}

fn serialize_txout(out: &mut Vec<u8>, txout: &TxOut) {
    out.extend_from_slice(&txout.value.to_le_bytes());
    write_compact_size(out, txout.script_pubkey.len() as u64);
    out.extend_from_slice(&txout.script_pubkey);
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// BIP-341 signature message (SIGHASH_DEFAULT) for one input.
///
/// `leaf_hash` selects the script-path message for that leaf; `None`
/// is the keypath message. Requires every input's witness utxo, since
/// the message commits to all spent amounts and scripts.
pub fn taproot_sighash(
    psbt: &Psbt,
    input_index: usize,
    leaf_hash: Option<&[u8; 32]>,
) -> Result<[u8; 32]> {
    if input_index >= psbt.tx.inputs.len() {
        return Err(Error::ProtocolOrdering(format!(
            "input index {input_index} out of range"
        )));
    }
    let mut spent = Vec::with_capacity(psbt.inputs.len());
    for (i, input) in psbt.inputs.iter().enumerate() {
        let utxo = input.witness_utxo.as_ref().ok_or_else(|| {
            Error::ProtocolOrdering(format!("witness utxo missing for input {i}"))
        })?;
        spent.push(utxo);
    }

    let mut prevouts = Vec::new();
    let mut amounts = Vec::new();
    let mut scripts = Vec::new();
    let mut sequences = Vec::new();
    for (txin, utxo) in psbt.tx.inputs.iter().zip(&spent) {
        prevouts.extend_from_slice(&txin.prevout.txid);
        prevouts.extend_from_slice(&txin.prevout.vout.to_le_bytes());
        amounts.extend_from_slice(&utxo.value.to_le_bytes());
        write_compact_size(&mut scripts, utxo.script_pubkey.len() as u64);
        scripts.extend_from_slice(&utxo.script_pubkey);
        sequences.extend_from_slice(&txin.sequence.to_le_bytes());
    }
    let mut outputs = Vec::new();
    for txout in &psbt.tx.outputs {
        serialize_txout(&mut outputs, txout);
    }

    // Epoch byte, then the SigMsg fields in BIP-341 order.
    let mut msg = Vec::with_capacity(212);
    msg.push(0x00);
    msg.push(0x00); // SIGHASH_DEFAULT
    msg.extend_from_slice(&psbt.tx.version.to_le_bytes());
    msg.extend_from_slice(&psbt.tx.lock_time.to_le_bytes());
    msg.extend_from_slice(&sha256(&prevouts));
    msg.extend_from_slice(&sha256(&amounts));
    msg.extend_from_slice(&sha256(&scripts));
    msg.extend_from_slice(&sha256(&sequences));
    msg.extend_from_slice(&sha256(&outputs));
    let spend_type: u8 = if leaf_hash.is_some() { 2 } else { 0 };
    msg.push(spend_type);
    msg.extend_from_slice(&(input_index as u32).to_le_bytes());
    if let Some(leaf_hash) = leaf_hash {
        msg.extend_from_slice(leaf_hash);
        msg.push(0x00); // key version
        msg.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // no OP_CODESEPARATOR
    }

    Ok(tagged_hash("TapSighash", &msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_psbt() -> Psbt {
        let tx = Transaction {
            version: 2,
            lock_time: 0,
            inputs: vec![
                TxIn {
                    prevout: OutPoint { txid: [0x11; 32], vout: 0 },
                    sequence: 0,
                },
                TxIn {
                    prevout: OutPoint { txid: [0x22; 32], vout: 3 },
                    sequence: 0,
                },
            ],
            outputs: vec![TxOut {
                value: 25_000,
                script_pubkey: vec![0x51, 0x20].into_iter().chain([0xAB; 32]).collect(),
            }],
        };
        let mut psbt = Psbt::from_tx(tx);
        for (i, input) in psbt.inputs.iter_mut().enumerate() {
            input.witness_utxo = Some(TxOut {
                value: 10_000 + 10_000 * i as u64,
                script_pubkey: vec![0x51, 0x20].into_iter().chain([i as u8; 32]).collect(),
            });
        }
        psbt
    }

    #[test]
    fn sighash_is_deterministic_and_input_specific() {
        let psbt = sample_psbt();
        let a0 = taproot_sighash(&psbt, 0, None).unwrap();
        let b0 = taproot_sighash(&psbt, 0, None).unwrap();
        let a1 = taproot_sighash(&psbt, 1, None).unwrap();
        assert_eq!(a0, b0);
        assert_ne!(a0, a1);
    }

    #[test]
    fn script_path_message_differs_from_keypath() {
        let psbt = sample_psbt();
        let keypath = taproot_sighash(&psbt, 0, None).unwrap();
        let leaf = [0x5A; 32];
        let scriptpath = taproot_sighash(&psbt, 0, Some(&leaf)).unwrap();
        assert_ne!(keypath, scriptpath);
    }

    #[test]
    fn sighash_commits_to_spent_amounts() {
        let psbt = sample_psbt();
        let before = taproot_sighash(&psbt, 0, None).unwrap();
        let mut changed = psbt.clone();
        changed.inputs[1].witness_utxo.as_mut().unwrap().value += 1;
        let after = taproot_sighash(&changed, 0, None).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn missing_witness_utxo_is_an_ordering_error() {
        let mut psbt = sample_psbt();
        psbt.inputs[1].witness_utxo = None;
        let err = taproot_sighash(&psbt, 0, None).unwrap_err();
        assert!(matches!(err, Error::ProtocolOrdering(_)));
        assert!(taproot_sighash(&sample_psbt(), 5, None).is_err());
    }
}
