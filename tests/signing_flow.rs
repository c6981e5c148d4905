//! End-to-end two-round signing flows over a shared container: one
//! software cosigner plus one device-backed cosigner driven through a
//! test transport, covering keypath and script-path musig policies,
//! ordering violations, and tampered contributions.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use taproot_musig2::bip32::parse_path;
use taproot_musig2::cosigner::{NonceArtifact, PartialSigArtifact};
use taproot_musig2::psbt::{OutPoint, TxIn, TxOut};
use taproot_musig2::wallet::parse_key_info;
use taproot_musig2::{
    CancelToken, DeviceCosigner, Error, ExtendedKey, Musig2Cosigner, Network, Psbt, Result,
    SigningDevice, SoftwareCosigner, Transaction, WalletPolicy, aggregate_signatures,
    schnorr_verify, sign_psbt, taproot_sighash,
};

const HOT_TPRV_1: &str = "tprv8gFWbQBTLFhbVcpeAJ1nGbPetqLo2a5Duqu3E5wXUFJ4auLcBAfwhJscGbPjzKNvpCdG3KK3BLCTLi8YKy4PXnA1hxdowdpTaMqTcF5ZpUz";
const HOT_TPRV_2: &str = "tprv8gFWbQBTLFhbX3EK3cS7LmenwE3JjXbD9kN9yXfq7LcBm81RSf8vPGPqGPjZSeX41LX9ZN14St3z8YxW48aq5Yhr9pQZVAyuBthfi6quTCf";
const DEVICE_PATH: &str = "48'/1'/0'/2'";
const CHANGE_ADDRESS_INDEX: u32 = 3;

/// A signing device simulated in-process: it owns a master key and
/// produces artifacts of exactly the shapes a hardware transport would
/// return.
struct TestDevice {
    master: ExtendedKey,
    signer: Option<SoftwareCosigner>,
}

impl TestDevice {
    fn new(seed: &[u8]) -> Self {
        TestDevice {
            master: ExtendedKey::from_seed(seed, Network::Testnet).unwrap(),
            signer: None,
        }
    }

    /// Build the internal signer from the policy key that carries this
    /// device's master fingerprint.
    fn ensure_signer(&mut self, policy: &WalletPolicy) -> Result<()> {
        if self.signer.is_some() {
            return Ok(());
        }
        let fingerprint = self.master.fingerprint();
        for key_info_str in &policy.keys_info {
            let info = parse_key_info(key_info_str)?;
            if let Some(origin) = &info.origin {
                if origin.fingerprint == fingerprint {
                    let xpriv = self.master.derive_path(&origin.path)?;
                    self.signer = Some(SoftwareCosigner::new(policy.clone(), &xpriv)?);
                    return Ok(());
                }
            }
        }
        Err(Error::MalformedDescriptor("policy does not include this device".into()))
    }
}

impl SigningDevice for TestDevice {
    fn master_fingerprint(&mut self, _cancel: &CancelToken) -> Result<[u8; 4]> {
        Ok(self.master.fingerprint())
    }

    fn extended_pubkey(&mut self, path: &[u32], _cancel: &CancelToken) -> Result<ExtendedKey> {
        Ok(self.master.derive_path(path)?.neuter())
    }

    fn register_wallet(&mut self, policy: &WalletPolicy, _cancel: &CancelToken) -> Result<[u8; 32]> {
        let mut mac = Hmac::<Sha256>::new_from_slice(b"test-device wallet registration key")
            .expect("HMAC accepts any key length");
        mac.update(&policy.id());
        Ok(mac.finalize().into_bytes().into())
    }

    fn musig_round1(
        &mut self,
        psbt: &Psbt,
        policy: &WalletPolicy,
        _wallet_hmac: Option<&[u8; 32]>,
        cancel: &CancelToken,
    ) -> Result<Vec<NonceArtifact>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("user rejected the request".into()));
        }
        self.ensure_signer(policy)?;
        let signer = self.signer.as_mut().expect("signer just built");
        let mut scratch = psbt.clone();
        signer.generate_public_nonces(&mut scratch)?;

        let mut artifacts = Vec::new();
        for (input_index, (before, after)) in
            psbt.inputs.iter().zip(&scratch.inputs).enumerate()
        {
            for (key, nonce) in &after.musig2_pub_nonces {
                if !before.musig2_pub_nonces.contains_key(key) {
                    artifacts.push(NonceArtifact {
                        input_index,
                        participant_key: key.participant_key,
                        aggregate_key: key.aggregate_key,
                        leaf_hash: key.leaf_hash,
                        pub_nonce: *nonce,
                    });
                }
            }
        }
        Ok(artifacts)
    }

    fn musig_round2(
        &mut self,
        psbt: &Psbt,
        policy: &WalletPolicy,
        _wallet_hmac: Option<&[u8; 32]>,
        cancel: &CancelToken,
    ) -> Result<Vec<PartialSigArtifact>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("user rejected the request".into()));
        }
        self.ensure_signer(policy)?;
        let signer = self.signer.as_mut().expect("signer built in round 1");
        let mut scratch = psbt.clone();
        signer.generate_partial_signatures(&mut scratch)?;

        let mut artifacts = Vec::new();
        for (input_index, (before, after)) in
            psbt.inputs.iter().zip(&scratch.inputs).enumerate()
        {
            for (key, partial) in &after.musig2_partial_sigs {
                if !before.musig2_partial_sigs.contains_key(key) {
                    artifacts.push(PartialSigArtifact {
                        input_index,
                        participant_key: key.participant_key,
                        aggregate_key: key.aggregate_key,
                        leaf_hash: key.leaf_hash,
                        partial_sig: *partial,
                    });
                }
            }
        }
        Ok(artifacts)
    }
}

/// The keypath policy of the demo flow: a Ledger-style device key with
/// its origin, and a hot cosigner's bare xpub.
fn device_and_hot_policy(device: &mut TestDevice) -> WalletPolicy {
    let cancel = CancelToken::new();
    let path = parse_path(DEVICE_PATH).unwrap();
    let fingerprint = device.master_fingerprint(&cancel).unwrap();
    let device_xpub = device.extended_pubkey(&path, &cancel).unwrap();
    let device_key_info = format!("[{}/{DEVICE_PATH}]{device_xpub}", hex::encode(fingerprint));

    let hot_xpub = HOT_TPRV_2.parse::<ExtendedKey>().unwrap().neuter();
    WalletPolicy::new(
        "musig for my ears",
        "tr(musig(@0,@1)/**)",
        vec![device_key_info, hot_xpub.to_string()],
    )
    .unwrap()
}

/// A container spending `in_amounts` from receive addresses 0, 1, …,
/// with one change output back to the wallet.
fn build_test_psbt(policy: &WalletPolicy, in_amounts: &[u64], change_index: usize) -> Psbt {
    let sum: u64 = in_amounts.iter().sum();
    let n_outs = 2;
    let mut outputs = Vec::with_capacity(n_outs);
    for i in 0..n_outs {
        let script_pubkey = if i == change_index {
            policy.script_pubkey(true, CHANGE_ADDRESS_INDEX).unwrap()
        } else {
            // Any unrelated taproot output works for the non-change slot.
            let mut script = vec![0x51, 0x20];
            script.extend_from_slice(&[0x77; 32]);
            script
        };
        outputs.push(TxOut {
            value: sum / n_outs as u64 - i as u64,
            script_pubkey,
        });
    }
    let tx = Transaction {
        version: 2,
        lock_time: 0,
        inputs: (0..in_amounts.len())
            .map(|i| TxIn {
                prevout: OutPoint {
                    txid: [i as u8 + 1; 32],
                    vout: i as u32,
                },
                sequence: 0,
            })
            .collect(),
        outputs,
    };

    let mut psbt = Psbt::from_tx(tx);
    for (i, (input, amount)) in psbt.inputs.iter_mut().zip(in_amounts).enumerate() {
        input.witness_utxo = Some(TxOut {
            value: *amount,
            script_pubkey: policy.script_pubkey(false, i as u32).unwrap(),
        });
        policy.fill_inout(&mut input.tap, false, i as u32).unwrap();
    }
    policy
        .fill_inout(&mut psbt.outputs[change_index].tap, true, CHANGE_ADDRESS_INDEX)
        .unwrap();
    psbt
}

#[test]
fn keypath_flow_with_device_and_hot_cosigner() {
    let mut device = TestDevice::new(b"an entirely deterministic seed.1");
    let policy = device_and_hot_policy(&mut device);
    let mut psbt = build_test_psbt(&policy, &[10_000, 20_000], 1);

    let cancel = CancelToken::new();
    let mut device_cosigner = DeviceCosigner::new(device, policy.clone(), cancel).unwrap();
    assert!(device_cosigner.wallet_hmac().is_some());
    let hot_xpriv: ExtendedKey = HOT_TPRV_2.parse().unwrap();
    let mut hot_cosigner = SoftwareCosigner::new(policy.clone(), &hot_xpriv).unwrap();

    let mut cosigners: Vec<&mut dyn Musig2Cosigner> =
        vec![&mut device_cosigner, &mut hot_cosigner];
    let outcomes = sign_psbt(&mut psbt, &policy, &mut cosigners).unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.result.is_ok()));

    for (i, input) in psbt.inputs.iter().enumerate() {
        let sig = input.tap_key_sig.expect("every input must carry a final signature");
        assert_eq!(sig.len(), 64);
        // Independently verify against the input's tweaked output key
        // and sighash message.
        let script = &input.witness_utxo.as_ref().unwrap().script_pubkey;
        let output_key: [u8; 32] = script[2..34].try_into().unwrap();
        let msg = taproot_sighash(&psbt, i, None).unwrap();
        assert!(schnorr_verify(&output_key, &msg, &sig), "input {i}");
    }
}

#[test]
fn script_path_leaf_flow_with_two_hot_cosigners() {
    // An internal key nobody holds the secret for, so only the script
    // path is usable.
    let internal = ExtendedKey::from_seed(b"unspendable internal key seed..9", Network::Testnet)
        .unwrap()
        .neuter();
    let key_1: ExtendedKey = HOT_TPRV_1.parse().unwrap();
    let key_2: ExtendedKey = HOT_TPRV_2.parse().unwrap();
    let policy = WalletPolicy::new(
        "musig in the script path",
        "tr(@0/**,pk(musig(@1,@2)/**))",
        vec![
            internal.to_string(),
            key_1.neuter().to_string(),
            key_2.neuter().to_string(),
        ],
    )
    .unwrap();
    let mut psbt = build_test_psbt(&policy, &[50_000], 1);

    let mut signer_1 = SoftwareCosigner::new(policy.clone(), &key_1).unwrap();
    let mut signer_2 = SoftwareCosigner::new(policy.clone(), &key_2).unwrap();
    let mut cosigners: Vec<&mut dyn Musig2Cosigner> = vec![&mut signer_1, &mut signer_2];
    let outcomes = sign_psbt(&mut psbt, &policy, &mut cosigners).unwrap();
    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    let leaf_hash = outcome.leaf_hash.expect("leaf placeholder signs for its leaf");

    let sig = *psbt.inputs[0]
        .tap_script_sigs
        .values()
        .next()
        .expect("leaf signature must be recorded");
    let msg = taproot_sighash(&psbt, 0, Some(&leaf_hash)).unwrap();
    let (xonly_key, _) = psbt.inputs[0]
        .tap_script_sigs
        .keys()
        .next()
        .copied()
        .unwrap();
    assert!(schnorr_verify(&xonly_key, &msg, &sig));
    assert!(psbt.inputs[0].tap_key_sig.is_none());
}

#[test]
fn round_two_before_round_one_is_an_ordering_error() {
    let key_1: ExtendedKey = HOT_TPRV_1.parse().unwrap();
    let key_2: ExtendedKey = HOT_TPRV_2.parse().unwrap();
    let policy = WalletPolicy::new(
        "eager signer",
        "tr(musig(@0,@1)/**)",
        vec![key_1.neuter().to_string(), key_2.neuter().to_string()],
    )
    .unwrap();
    let mut psbt = build_test_psbt(&policy, &[10_000], 0);

    let mut signer = SoftwareCosigner::new(policy.clone(), &key_1).unwrap();
    let err = signer.generate_partial_signatures(&mut psbt).unwrap_err();
    assert!(matches!(err, Error::ProtocolOrdering(_)));

    // Even with its own round 1 done, a cosigner must wait for every
    // other participant's nonce.
    signer.generate_public_nonces(&mut psbt).unwrap();
    let err = signer.generate_partial_signatures(&mut psbt).unwrap_err();
    assert!(matches!(err, Error::ProtocolOrdering(_)));
}

#[test]
fn tampered_partial_signature_fails_only_its_input() {
    let key_1: ExtendedKey = HOT_TPRV_1.parse().unwrap();
    let key_2: ExtendedKey = HOT_TPRV_2.parse().unwrap();
    let policy = WalletPolicy::new(
        "tamper check",
        "tr(musig(@0,@1)/**)",
        vec![key_1.neuter().to_string(), key_2.neuter().to_string()],
    )
    .unwrap();
    let mut psbt = build_test_psbt(&policy, &[10_000, 20_000], 0);

    let mut signer_1 = SoftwareCosigner::new(policy.clone(), &key_1).unwrap();
    let mut signer_2 = SoftwareCosigner::new(policy.clone(), &key_2).unwrap();
    for signer in [&mut signer_1, &mut signer_2] {
        signer.generate_public_nonces(&mut psbt).unwrap();
    }
    for signer in [&mut signer_1, &mut signer_2] {
        signer.generate_partial_signatures(&mut psbt).unwrap();
    }

    // Flip one bit of one participant's contribution on input 0.
    {
        let sigs = &mut psbt.inputs[0].musig2_partial_sigs;
        let key = sigs.keys().next().cloned().unwrap();
        let entry = sigs.get_mut(&key).unwrap();
        entry[31] ^= 0x01;
    }

    let outcomes = aggregate_signatures(&mut psbt, &policy).unwrap();
    assert_eq!(outcomes.len(), 2);
    match &outcomes[0].result {
        Err(Error::PartialSignature { input_index, participant }) => {
            assert_eq!(*input_index, 0);
            assert_eq!(participant.len(), 66);
        }
        other => panic!("expected a partial-signature failure, got {other:?}"),
    }
    assert!(outcomes[1].result.is_ok(), "untouched inputs are unaffected");
    assert!(psbt.inputs[0].tap_key_sig.is_none());
    assert!(psbt.inputs[1].tap_key_sig.is_some());
}

#[test]
fn cancelled_device_aborts_its_contribution() {
    let mut device = TestDevice::new(b"an entirely deterministic seed.2");
    let policy = device_and_hot_policy(&mut device);
    let mut psbt = build_test_psbt(&policy, &[10_000], 0);

    let cancel = CancelToken::new();
    let mut device_cosigner = DeviceCosigner::new(device, policy.clone(), cancel.clone()).unwrap();
    cancel.cancel();
    let err = device_cosigner.generate_public_nonces(&mut psbt).unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));
}
