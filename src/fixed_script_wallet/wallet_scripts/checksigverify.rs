use crate::bitcoin::blockdata::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGVERIFY};
use crate::bitcoin::blockdata::script::Builder;
use crate::bitcoin::secp256k1::Secp256k1;
use crate::bitcoin::taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo};
use crate::bitcoin::{CompressedPublicKey, ScriptBuf, XOnlyPublicKey};
use crate::error::SignerError;
use crate::fixed_script_wallet::wallet_keys::PubTriple;

use super::bitgo_musig::{key_agg_bitgo_p2tr_legacy, key_agg_p2tr_musig2};

pub fn to_xonly_pubkey(key: &CompressedPublicKey) -> XOnlyPublicKey {
    key.0.x_only_public_key().0
}

/// `<x1> OP_CHECKSIGVERIFY <x2> OP_CHECKSIG ...`: every key must sign.
pub fn build_p2tr_ns_script(keys: &[CompressedPublicKey]) -> ScriptBuf {
    let mut builder = Builder::default();
    for (i, key) in keys.iter().enumerate() {
        builder = builder.push_slice(to_xonly_pubkey(key).serialize());
        if i == keys.len() - 1 {
            builder = builder.push_opcode(OP_CHECKSIG);
        } else {
            builder = builder.push_opcode(OP_CHECKSIGVERIFY);
        }
    }
    builder.into_script()
}

/// Key index pairs into `[user, backup, bitgo]`, one per leaf, with the leaf depth.
const P2TR_LEAVES: [([usize; 2], u8); 3] = [([0, 2], 1), ([0, 1], 2), ([1, 2], 2)];
const P2TR_MUSIG2_LEAVES: [([usize; 2], u8); 2] = [([0, 1], 1), ([1, 2], 1)];

#[derive(Debug, Clone)]
pub struct TapLeaf {
    pub signer_indices: [usize; 2],
    pub script: ScriptBuf,
    pub control_block: ControlBlock,
}

#[derive(Debug)]
pub struct ScriptP2tr {
    pub spend_info: TaprootSpendInfo,
    pub leaves: Vec<TapLeaf>,
}

impl ScriptP2tr {
    /// Legacy p2tr uses leaves user+bitgo (depth 1), user+backup and
    /// backup+bitgo (depth 2). p2trMusig2 moves user+bitgo to the key path and
    /// keeps the other two leaves at depth 1.
    pub fn new(keys: &PubTriple, p2tr_musig2: bool) -> Result<ScriptP2tr, SignerError> {
        let secp = Secp256k1::verification_only();
        let user_bitgo = [keys[0], keys[2]];
        let internal_key_bytes = if p2tr_musig2 {
            key_agg_p2tr_musig2(&user_bitgo)?
        } else {
            key_agg_bitgo_p2tr_legacy(&user_bitgo)?
        };
        let internal_key = XOnlyPublicKey::from_slice(&internal_key_bytes)
            .map_err(|e| SignerError::new(&format!("invalid internal key: {}", e)))?;

        let layout: &[([usize; 2], u8)] = if p2tr_musig2 {
            &P2TR_MUSIG2_LEAVES
        } else {
            &P2TR_LEAVES
        };

        let mut builder = TaprootBuilder::new();
        for (signers, depth) in layout {
            let script = build_p2tr_ns_script(&[keys[signers[0]], keys[signers[1]]]);
            builder = builder
                .add_leaf(*depth, script)
                .map_err(|e| SignerError::new(&format!("invalid tap leaf: {}", e)))?;
        }
        let spend_info = builder
            .finalize(&secp, internal_key)
            .map_err(|_| SignerError::new("incomplete taproot tree"))?;

        let leaves = layout
            .iter()
            .map(|(signers, _)| {
                let script = build_p2tr_ns_script(&[keys[signers[0]], keys[signers[1]]]);
                let control_block = spend_info
                    .control_block(&(script.clone(), LeafVersion::TapScript))
                    .ok_or_else(|| SignerError::new("missing control block for leaf"))?;
                Ok(TapLeaf {
                    signer_indices: *signers,
                    script,
                    control_block,
                })
            })
            .collect::<Result<Vec<_>, SignerError>>()?;

        Ok(ScriptP2tr { spend_info, leaves })
    }

    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.spend_info.internal_key()
    }

    pub fn output_key(&self) -> XOnlyPublicKey {
        self.spend_info.output_key().to_x_only_public_key()
    }

    pub fn output_script(&self) -> ScriptBuf {
        Builder::new()
            .push_int(1)
            .push_slice(self.output_key().serialize())
            .into_script()
    }

    /// Leaf whose script is signed by exactly the two given key indices.
    pub fn leaf_for_signers(&self, signer_indices: [usize; 2]) -> Option<&TapLeaf> {
        let mut sorted = signer_indices;
        sorted.sort();
        self.leaves.iter().find(|leaf| leaf.signer_indices == sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_script_wallet::wallet_keys::tests::get_test_wallet_keys;
    use crate::fixed_script_wallet::wallet_keys::to_pub_triple;

    #[test]
    fn test_ns_script_layout() {
        let keys = to_pub_triple(&get_test_wallet_keys("ns"));
        let script = build_p2tr_ns_script(&[keys[0], keys[2]]);
        let bytes = script.as_bytes();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 0x20);
        assert_eq!(&bytes[1..33], &to_xonly_pubkey(&keys[0]).serialize());
        assert_eq!(bytes[33], OP_CHECKSIGVERIFY.to_u8());
        assert_eq!(bytes[34], 0x20);
        assert_eq!(bytes[67], OP_CHECKSIG.to_u8());
    }

    #[test]
    fn test_legacy_leaves_and_control_blocks() {
        let keys = to_pub_triple(&get_test_wallet_keys("leaves"));
        let p2tr = ScriptP2tr::new(&keys, false).unwrap();
        assert_eq!(p2tr.leaves.len(), 3);
        let depths: Vec<usize> = p2tr
            .leaves
            .iter()
            .map(|l| l.control_block.merkle_branch.len())
            .collect();
        assert_eq!(depths, vec![1, 2, 2]);
        assert_eq!(p2tr.leaf_for_signers([2, 0]).unwrap().signer_indices, [0, 2]);
        for leaf in &p2tr.leaves {
            assert!(leaf.control_block.verify_taproot_commitment(
                &Secp256k1::verification_only(),
                p2tr.output_key(),
                &leaf.script
            ));
        }
    }

    #[test]
    fn test_musig2_leaves() {
        let keys = to_pub_triple(&get_test_wallet_keys("leaves"));
        let p2tr = ScriptP2tr::new(&keys, true).unwrap();
        assert_eq!(p2tr.leaves.len(), 2);
        assert!(p2tr.leaf_for_signers([0, 2]).is_none());
        assert!(p2tr
            .leaves
            .iter()
            .all(|l| l.control_block.merkle_branch.len() == 1));
        assert_eq!(
            p2tr.internal_key().serialize(),
            key_agg_p2tr_musig2(&[keys[0], keys[2]]).unwrap()
        );
    }
}
