//! PSBT builders for wallet tests.

use std::collections::BTreeMap;
use std::str::FromStr;

use super::wallet_keys::tests::{get_test_wallet_keys, get_test_wallet_xprvs, XprivTriple};
use super::wallet_keys::{to_pub_triple, RootWalletKeys, XpubTriple};
use super::wallet_scripts::{
    build_p2pk_script, to_xonly_pubkey, Chain, ScriptP2shP2pk, WalletScripts,
};
use crate::bitcoin::bip32::{DerivationPath, KeySource, Xpub};
use crate::bitcoin::locktime::absolute::LockTime;
use crate::bitcoin::psbt::{Input as PsbtInput, Output as PsbtOutput, Psbt};
use crate::bitcoin::taproot::{LeafVersion, TapLeafHash};
use crate::bitcoin::transaction::Version;
use crate::bitcoin::{
    Amount, CompressedPublicKey, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use crate::bitgo_psbt::p2tr_musig2_input::Musig2Participants;
use crate::networks::OutputScriptSupport;

pub fn wallet_path(chain: Chain, index: u32) -> DerivationPath {
    DerivationPath::from_str(&format!("m/0/0/{}/{}", chain as u32, index))
        .expect("invalid wallet path")
}

fn key_source(root: &Xpub, chain: Chain, index: u32) -> KeySource {
    (root.fingerprint(), wallet_path(chain, index))
}

fn wallet_scripts(xpubs: &XpubTriple, chain: Chain, index: u32) -> (WalletScripts, [CompressedPublicKey; 3]) {
    let derived = RootWalletKeys::new(*xpubs)
        .derive_for_chain_and_index(chain as u32, index)
        .expect("derivation failed");
    let pubs = to_pub_triple(&derived);
    let scripts = WalletScripts::new(&pubs, chain.script_type(), &OutputScriptSupport::all())
        .expect("could not build wallet scripts");
    (scripts, pubs)
}

/// Funding transaction with a single output; the lock time keeps txids apart.
fn funding_tx(prevout: TxOut, salt: u32) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(salt),
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![prevout],
    }
}

fn spend(prev_tx: &Transaction) -> TxIn {
    TxIn {
        previous_output: OutPoint::new(prev_tx.compute_txid(), 0),
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

/// Unsigned input spending the wallet output at `chain/index`, with the
/// metadata a BitGo PSBT carries for that script type.
///
/// p2trMusig2 inputs are set up for a key path spend by user and bitgo,
/// p2tr inputs for a script path spend of the user+bitgo leaf.
pub fn wallet_input(xpubs: &XpubTriple, chain: Chain, index: u32, value: u64) -> (TxIn, PsbtInput) {
    let (scripts, pubs) = wallet_scripts(xpubs, chain, index);
    let prevout = TxOut {
        value: Amount::from_sat(value),
        script_pubkey: scripts.output_script(),
    };
    let prev_tx = funding_tx(prevout.clone(), chain as u32 * 1000 + index);
    let tx_in = spend(&prev_tx);

    let mut input = PsbtInput::default();
    match &scripts {
        WalletScripts::P2sh(_) | WalletScripts::P2shP2wsh(_) | WalletScripts::P2wsh(_) => {
            if matches!(scripts, WalletScripts::P2sh(_)) {
                input.non_witness_utxo = Some(prev_tx);
            } else {
                input.witness_utxo = Some(prevout);
            }
            input.redeem_script = scripts.redeem_script().cloned();
            input.witness_script = scripts.witness_script().cloned();
            input.bip32_derivation = pubs
                .iter()
                .zip(xpubs.iter())
                .map(|(key, root)| (key.0, key_source(root, chain, index)))
                .collect();
        }
        WalletScripts::P2trLegacy(p2tr) => {
            input.witness_utxo = Some(prevout);
            let leaf = p2tr.leaf_for_signers([0, 2]).expect("missing user+bitgo leaf");
            let leaf_hash = TapLeafHash::from_script(&leaf.script, LeafVersion::TapScript);
            input.tap_scripts.insert(
                leaf.control_block.clone(),
                (leaf.script.clone(), LeafVersion::TapScript),
            );
            for i in [0, 2] {
                input.tap_key_origins.insert(
                    to_xonly_pubkey(&pubs[i]),
                    (vec![leaf_hash], key_source(&xpubs[i], chain, index)),
                );
            }
        }
        WalletScripts::P2trMusig2(p2tr) => {
            input.witness_utxo = Some(prevout);
            input.tap_internal_key = Some(p2tr.internal_key());
            input.tap_merkle_root = p2tr.spend_info.merkle_root();
            for i in [0, 2] {
                input.tap_key_origins.insert(
                    to_xonly_pubkey(&pubs[i]),
                    (vec![], key_source(&xpubs[i], chain, index)),
                );
            }
            let participants = Musig2Participants {
                tap_output_key: p2tr.output_key(),
                tap_internal_key: p2tr.internal_key(),
                participant_pub_keys: [pubs[0], pubs[2]],
            };
            let (key, value) = participants.to_key_value().to_key_value();
            input.proprietary.insert(key, value);
        }
    }
    (tx_in, input)
}

/// Replay protection input paying to `<key> OP_CHECKSIG` in p2sh.
pub fn p2sh_p2pk_input(key: CompressedPublicKey, value: u64) -> (TxIn, PsbtInput) {
    let prevout = TxOut {
        value: Amount::from_sat(value),
        script_pubkey: ScriptP2shP2pk::new(key).output_script(),
    };
    let prev_tx = funding_tx(prevout, 999_999);
    let tx_in = spend(&prev_tx);
    let input = PsbtInput {
        non_witness_utxo: Some(prev_tx),
        redeem_script: Some(build_p2pk_script(key)),
        ..Default::default()
    };
    (tx_in, input)
}

/// Output to the wallet at `chain/index` with derivation metadata.
pub fn wallet_output(xpubs: &XpubTriple, chain: Chain, index: u32, value: u64) -> (TxOut, PsbtOutput) {
    let (scripts, pubs) = wallet_scripts(xpubs, chain, index);
    let tx_out = TxOut {
        value: Amount::from_sat(value),
        script_pubkey: scripts.output_script(),
    };
    let mut output = PsbtOutput::default();
    match scripts.taproot() {
        Some(p2tr) => {
            output.tap_internal_key = Some(p2tr.internal_key());
            for (key, root) in pubs.iter().zip(xpubs.iter()) {
                output
                    .tap_key_origins
                    .insert(to_xonly_pubkey(key), (vec![], key_source(root, chain, index)));
            }
        }
        None => {
            output.redeem_script = scripts.redeem_script().cloned();
            output.witness_script = scripts.witness_script().cloned();
            output.bip32_derivation = pubs
                .iter()
                .zip(xpubs.iter())
                .map(|(key, root)| (key.0, key_source(root, chain, index)))
                .collect();
        }
    }
    (tx_out, output)
}

/// Output to a wallet built from a different seed, without metadata.
pub fn external_output(seed: &str, value: u64) -> (TxOut, PsbtOutput) {
    let xpubs = get_test_wallet_keys(seed);
    let (scripts, _) = wallet_scripts(&xpubs, Chain::P2wshExternal, 0);
    let tx_out = TxOut {
        value: Amount::from_sat(value),
        script_pubkey: scripts.output_script(),
    };
    (tx_out, PsbtOutput::default())
}

/// Composable function to create a test PSBT from inputs and outputs
pub fn create_test_psbt(
    xpubs: &XpubTriple,
    inputs: Vec<PsbtInput>,
    tx_inputs: Vec<TxIn>,
    outputs: Vec<PsbtOutput>,
    tx_outputs: Vec<TxOut>,
) -> Psbt {
    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: tx_inputs,
        output: tx_outputs,
    };

    Psbt {
        unsigned_tx: tx,
        version: 0,
        xpub: xpubs
            .iter()
            .map(|xpub| (*xpub, (xpub.fingerprint(), DerivationPath::master())))
            .collect(),
        proprietary: BTreeMap::new(),
        unknown: BTreeMap::new(),
        inputs,
        outputs,
    }
}

pub struct Musig2TestPsbt {
    pub psbt: Psbt,
    pub xprvs: XprivTriple,
    pub xpubs: XpubTriple,
}

/// One p2trMusig2 key path input (chain 40, index 0), a p2wsh change output
/// and an external output.
pub fn create_p2tr_musig2_psbt(seed: &str) -> Musig2TestPsbt {
    let xprvs = get_test_wallet_xprvs(seed);
    let xpubs = get_test_wallet_keys(seed);
    let (tx_in, input) = wallet_input(&xpubs, Chain::P2trMusig2Internal, 0, 100_000);
    let (change, change_meta) = wallet_output(&xpubs, Chain::P2wshInternal, 1, 60_000);
    let (external, external_meta) = external_output(&format!("{}/external", seed), 30_000);
    let psbt = create_test_psbt(
        &xpubs,
        vec![input],
        vec![tx_in],
        vec![change_meta, external_meta],
        vec![change, external],
    );
    Musig2TestPsbt { psbt, xprvs, xpubs }
}
