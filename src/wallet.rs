//! Wallet policies: a named descriptor template plus its key
//! information, expanded per address into concrete scripts and signing
//! metadata. Musig groups are resolved into synthetic aggregate
//! extended keys so that any musig-unaware derivation engine can treat
//! them as ordinary keys.

use std::fmt::Write as _;

use log::debug;
use sha2::{Digest, Sha256};

use crate::bip32::{ExtendedKey, KeyOriginInfo};
use crate::descriptor::{KeyPlaceholder, ScriptFragment, TapTreeTemplate, TrDescriptorTemplate};
use crate::error::{Error, Result};
use crate::keyagg::KeyAggContext;
use crate::psbt::TaprootFields;
use crate::taproot::{self, TAPROOT_LEAF_TAPSCRIPT, TapTree, tapleaf_hash};

/// Chain code of every synthetic musig aggregate key: marks the key as
/// non-hardened-derivable, public-derivation-only, and synthetic.
pub const BIP_MUSIG_CHAINCODE: [u8; 32] = [
    0x86, 0x80, 0x87, 0xca, 0x02, 0xa6, 0xf9, 0x74, 0xc4, 0x59, 0x89, 0x24, 0xc3, 0x6b, 0x57,
    0x76, 0x2d, 0x32, 0xcb, 0x45, 0x71, 0x71, 0x67, 0xe3, 0x00, 0x62, 0x2c, 0x71, 0x67, 0xe3,
    0x89, 0x65,
];

/// Legacy policies carry the wildcard on each key-information string;
/// current ones carry it in the template.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalletPolicyVersion {
    V1,
    V2,
}

/// A parsed `[origin]xpub` key-information string.
#[derive(Clone, Debug)]
pub struct KeyInfo {
    pub origin: Option<KeyOriginInfo>,
    pub key: ExtendedKey,
}

/// Parse `xpub` or `[fingerprint/path]xpub`.
pub fn parse_key_info(s: &str) -> Result<KeyInfo> {
    if let Some(rest) = s.strip_prefix('[') {
        let (origin, xpub) = rest
            .split_once(']')
            .ok_or_else(|| Error::MalformedDescriptor("unterminated key origin".into()))?;
        Ok(KeyInfo {
            origin: Some(origin.parse()?),
            key: xpub.parse()?,
        })
    } else {
        Ok(KeyInfo {
            origin: None,
            key: s.parse()?,
        })
    }
}

/// Aggregate a musig group's extended keys into its synthetic xpub.
///
/// The raw compressed pubkeys are sorted before aggregation; the
/// returned list is that sorted participant set. The synthetic key
/// carries the sentinel chain code, zero depth, fingerprint, and child
/// number, and the network of the first group member.
pub fn aggregate_musig_xpub(keys: &[ExtendedKey]) -> Result<(ExtendedKey, Vec<[u8; 33]>)> {
    if keys.is_empty() {
        return Err(Error::MalformedDescriptor("empty musig group".into()));
    }
    let mut pubkeys: Vec<[u8; 33]> = keys.iter().map(|k| k.pubkey_bytes()).collect();
    pubkeys.sort_unstable();
    let ctx = KeyAggContext::new(&pubkeys)?;
    let synthetic = ExtendedKey::from_public_parts(
        keys[0].network,
        BIP_MUSIG_CHAINCODE,
        ctx.aggregate_point().clone(),
    );
    Ok((synthetic, pubkeys))
}

/// The root key a placeholder resolves to before per-address derivation.
#[derive(Clone, Debug)]
pub(crate) struct RootKey {
    pub key: ExtendedKey,
    pub origin: Option<KeyOriginInfo>,
    /// Sorted participant set, for musig placeholders only.
    pub participants: Option<Vec<[u8; 33]>>,
}

/// A named descriptor template with its ordered key information.
#[derive(Clone, Debug)]
pub struct WalletPolicy {
    pub name: String,
    pub descriptor_template: String,
    pub keys_info: Vec<String>,
    pub version: WalletPolicyVersion,
}

impl WalletPolicy {
    /// Create a policy, detecting its version from the template. V2
    /// templates must parse; V1 templates are only usable through the
    /// textual [`to_descriptor`](Self::to_descriptor) expansion.
    pub fn new(name: &str, descriptor_template: &str, keys_info: Vec<String>) -> Result<Self> {
        if !descriptor_template.starts_with("tr(") {
            return Err(Error::MalformedDescriptor(
                "only taproot wallet policies are supported".into(),
            ));
        }
        let version = if descriptor_template.contains("/**") || descriptor_template.contains("/<")
        {
            WalletPolicyVersion::V2
        } else {
            WalletPolicyVersion::V1
        };
        let policy = WalletPolicy {
            name: name.to_string(),
            descriptor_template: descriptor_template.to_string(),
            keys_info,
            version,
        };
        if version == WalletPolicyVersion::V2 {
            policy.template()?;
        }
        Ok(policy)
    }

    /// The parsed template AST. Requires a V2 policy: in a legacy
    /// policy the wildcard lives in the key information, which the AST
    /// pipeline does not model.
    pub fn template(&self) -> Result<TrDescriptorTemplate> {
        if self.version == WalletPolicyVersion::V1 {
            return Err(Error::MalformedDescriptor(
                "legacy policy: wildcards belong to the key information".into(),
            ));
        }
        TrDescriptorTemplate::parse(&self.descriptor_template)
    }

    /// A stable 32-byte policy id over the name, template, and keys.
    pub fn id(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update((self.name.len() as u32).to_le_bytes());
        hasher.update(self.name.as_bytes());
        hasher.update((self.descriptor_template.len() as u32).to_le_bytes());
        hasher.update(self.descriptor_template.as_bytes());
        hasher.update((self.keys_info.len() as u32).to_le_bytes());
        for key in &self.keys_info {
            hasher.update((key.len() as u32).to_le_bytes());
            hasher.update(key.as_bytes());
        }
        hasher.finalize().into()
    }

    pub(crate) fn key_info(&self, index: u32) -> Result<KeyInfo> {
        let s = self
            .keys_info
            .get(index as usize)
            .ok_or_else(|| Error::MalformedDescriptor(format!("policy has no key @{index}")))?;
        parse_key_info(s)
    }

    pub(crate) fn placeholder_root_key(&self, placeholder: &KeyPlaceholder) -> Result<RootKey> {
        match placeholder {
            KeyPlaceholder::Plain { key_index, .. } => {
                let info = self.key_info(*key_index)?;
                Ok(RootKey {
                    key: info.key,
                    origin: info.origin,
                    participants: None,
                })
            }
            KeyPlaceholder::Musig { key_indices, .. } => {
                let keys = key_indices
                    .iter()
                    .map(|&i| self.key_info(i).map(|info| info.key))
                    .collect::<Result<Vec<_>>>()?;
                let (synthetic, participants) = aggregate_musig_xpub(&keys)?;
                // The synthetic key is its own origin: aggregate
                // fingerprint, empty path.
                let origin = KeyOriginInfo {
                    fingerprint: synthetic.fingerprint(),
                    path: Vec::new(),
                };
                Ok(RootKey {
                    key: synthetic,
                    origin: Some(origin),
                    participants: Some(participants),
                })
            }
        }
    }

    /// Compile one leaf fragment at a concrete address.
    pub(crate) fn leaf_script(
        &self,
        fragment: &ScriptFragment,
        is_change: bool,
        address_index: u32,
    ) -> Result<Vec<u8>> {
        match fragment {
            ScriptFragment::Pk(placeholder) => {
                let root = self.placeholder_root_key(placeholder)?;
                let derived = root
                    .key
                    .derive_path(&[placeholder.change_step(is_change), address_index])?;
                let mut script = Vec::with_capacity(34);
                script.push(0x20);
                script.extend_from_slice(&derived.pubkey_bytes()[1..]);
                script.push(0xac); // OP_CHECKSIG
                Ok(script)
            }
        }
    }

    fn build_taptree(
        &self,
        template: &TapTreeTemplate,
        is_change: bool,
        address_index: u32,
    ) -> Result<TapTree> {
        match template {
            TapTreeTemplate::Leaf { version, fragment } => Ok(TapTree::Leaf {
                version: *version,
                script: self.leaf_script(fragment, is_change, address_index)?,
            }),
            TapTreeTemplate::Branch(left, right) => Ok(TapTree::Branch(
                Box::new(self.build_taptree(left, is_change, address_index)?),
                Box::new(self.build_taptree(right, is_change, address_index)?),
            )),
        }
    }

    /// Merkle root of the script tree at one address, if any.
    pub fn merkle_root(&self, is_change: bool, address_index: u32) -> Result<Option<[u8; 32]>> {
        let tmpl = self.template()?;
        match &tmpl.tree {
            Some(tree) => Ok(Some(
                self.build_taptree(tree, is_change, address_index)?.root_hash(),
            )),
            None => Ok(None),
        }
    }

    /// The 34-byte taproot output script at one address.
    pub fn script_pubkey(&self, is_change: bool, address_index: u32) -> Result<Vec<u8>> {
        let tmpl = self.template()?;
        let root = self.placeholder_root_key(&tmpl.key)?;
        let internal = root
            .key
            .derive_path(&[tmpl.key.change_step(is_change), address_index])?;
        let internal_xonly: [u8; 32] = internal.pubkey_bytes()[1..]
            .try_into()
            .expect("compressed key is 33 bytes");
        let tree = match &tmpl.tree {
            Some(t) => Some(self.build_taptree(t, is_change, address_index)?),
            None => None,
        };
        taproot::output_script(&internal_xonly, tree.as_ref())
    }

    /// Populate one signable item's metadata: internal key, merkle root
    /// (when a script tree exists), per-placeholder key origins and
    /// leaf hashes, and the participant set of every musig group.
    pub fn fill_inout(
        &self,
        fields: &mut TaprootFields,
        is_change: bool,
        address_index: u32,
    ) -> Result<()> {
        let tmpl = self.template()?;

        let keypath_root = self.placeholder_root_key(&tmpl.key)?;
        let keypath_derived = keypath_root
            .key
            .derive_path(&[tmpl.key.change_step(is_change), address_index])?;
        fields.internal_key = Some(
            keypath_derived.pubkey_bytes()[1..]
                .try_into()
                .expect("compressed key is 33 bytes"),
        );

        if let Some(tree) = &tmpl.tree {
            fields.merkle_root =
                Some(self.build_taptree(tree, is_change, address_index)?.root_hash());
        }

        for (placeholder, fragment) in tmpl.placeholders() {
            let root = self.placeholder_root_key(placeholder)?;
            if let Some(participants) = &root.participants {
                fields
                    .participant_pubkeys
                    .insert(root.key.pubkey_bytes(), participants.clone());
            }

            let subpath = [placeholder.change_step(is_change), address_index];
            let leaf_hashes = match fragment {
                Some(fragment) => vec![tapleaf_hash(
                    TAPROOT_LEAF_TAPSCRIPT,
                    &self.leaf_script(fragment, is_change, address_index)?,
                )],
                None => Vec::new(),
            };
            let derived = root.key.derive_path(&subpath)?;

            if let Some(origin) = &root.origin {
                let mut path = origin.path.clone();
                path.extend_from_slice(&subpath);
                fields.bip32_paths.insert(
                    derived.pubkey_bytes()[1..]
                        .try_into()
                        .expect("compressed key is 33 bytes"),
                    (
                        leaf_hashes,
                        KeyOriginInfo {
                            fingerprint: origin.fingerprint,
                            path,
                        },
                    ),
                );
            }
        }
        debug!(
            "filled signing metadata for policy '{}' (change={is_change}, index={address_index})",
            self.name
        );
        Ok(())
    }

    /// Textual expansion of the template into a concrete descriptor.
    ///
    /// Key tokens are substituted in descending index order, an
    /// explicit contract so that `@1` can never match inside `@12`.
    /// Wildcards then become `/0/*` or `/1/*`, and every musig group is
    /// replaced by its synthetic aggregate xpub, which is what makes
    /// the result digestible by a musig-unaware descriptor engine.
    pub fn to_descriptor(&self, is_change: bool) -> Result<String> {
        let mut desc = self.descriptor_template.clone();
        for (i, key_info) in self.keys_info.iter().enumerate().rev() {
            if self.version == WalletPolicyVersion::V1 && !key_info.ends_with("/**") {
                return Err(Error::MalformedDescriptor(format!(
                    "legacy policy key @{i} is missing its /** wildcard"
                )));
            }
            let token = format!("@{i}");
            if !desc.contains(&token) {
                return Err(Error::MalformedDescriptor(format!(
                    "policy does not use key @{i}"
                )));
            }
            desc = desc.replace(&token, key_info);
        }

        let branch = if is_change { "/1/*" } else { "/0/*" };
        desc = desc.replace("/**", branch);
        desc = expand_multipath(&desc, is_change)?;
        let desc = self.replace_musigs(&desc)?;
        debug!("expanded policy '{}' into {} descriptor", self.name, if is_change { "change" } else { "receive" });
        Ok(desc)
    }

    /// Replace each `musig(key,…)` group with its aggregate xpub.
    fn replace_musigs(&self, desc: &str) -> Result<String> {
        let mut desc = desc.to_string();
        while let Some(start) = desc.find("musig(") {
            let end = desc[start..]
                .find(')')
                .map(|i| i + start)
                .ok_or_else(|| Error::MalformedDescriptor("unterminated musig group".into()))?;
            let mut keys = Vec::new();
            for key_orig in desc[start + 6..end].split(',') {
                let xpub = match key_orig.find(']') {
                    Some(pos) => &key_orig[pos + 1..],
                    None => key_orig,
                };
                keys.push(xpub.parse::<ExtendedKey>()?);
            }
            let (aggregate, _) = aggregate_musig_xpub(&keys)?;
            let mut next = String::with_capacity(desc.len());
            next.push_str(&desc[..start]);
            write!(next, "{aggregate}").expect("writing to a String cannot fail");
            next.push_str(&desc[end + 1..]);
            desc = next;
        }
        Ok(desc)
    }
}

/// Resolve `/<n;m>/*` multipath steps to the receive or change branch.
fn expand_multipath(desc: &str, is_change: bool) -> Result<String> {
    let mut desc = desc.to_string();
    while let Some(start) = desc.find("/<") {
        let end = desc[start..]
            .find(">/*")
            .map(|i| i + start)
            .ok_or_else(|| Error::MalformedDescriptor("unterminated multipath step".into()))?;
        let (num1, num2) = desc[start + 2..end]
            .split_once(';')
            .ok_or_else(|| Error::MalformedDescriptor("multipath step needs two branches".into()))?;
        let step = if is_change { num2 } else { num1 };
        desc = format!("{}/{}/*{}", &desc[..start], step, &desc[end + 3..]);
    }
    Ok(desc)
}
