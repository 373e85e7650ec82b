//! Recover the `[user, backup, bitgo]` order of the global xpubs of a PSBT.
//!
//! Global xpubs carry no role. The order is found by deriving all three along
//! the path of one wallet input and trying every permutation until the wallet
//! scripts reproduce the script the input spends.

use thiserror::Error;
use tracing::{debug, trace};

use crate::bitcoin::bip32::{DerivationPath, Xpub};
use crate::bitcoin::psbt::{Input as PsbtInput, Psbt};
use crate::bitcoin::secp256k1::Secp256k1;
use crate::bitgo_psbt::get_input_prevout;
use crate::fixed_script_wallet::parse_input::{
    get_psbt_input_script_type, to_script_type_2of3s, ParsedScriptType,
};
use crate::fixed_script_wallet::wallet_keys::{to_pub_triple, RootWalletKeys, XpubTriple};
use crate::fixed_script_wallet::wallet_scripts::{derive_xpubs_with_path, WalletScripts};
use crate::networks::OutputScriptSupport;

const PERMUTATIONS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RootKeysError {
    #[error("expected 3 global xpubs, got {0}")]
    GlobalXpubCount(usize),
    #[error("no wallet input with derivation info found")]
    NoWalletInput,
    #[error("missing UTXO data for input {0}")]
    MissingUtxo(usize),
    #[error("failed to derive root keys: {0}")]
    Derivation(String),
    #[error("no permutation found")]
    NoPermutationFound,
}

/// Full derivation path of a wallet input. Tap key origins win over bip32
/// derivations.
pub(crate) fn input_derivation_path(input: &PsbtInput) -> Option<&DerivationPath> {
    input
        .tap_key_origins
        .values()
        .map(|(_, (_, path))| path)
        .next()
        .or_else(|| input.bip32_derivation.values().map(|(_, path)| path).next())
}

fn global_xpubs(psbt: &Psbt) -> Result<XpubTriple, RootKeysError> {
    let xpubs: Vec<Xpub> = psbt.xpub.keys().copied().collect();
    match xpubs.as_slice() {
        [a, b, c] => Ok([*a, *b, *c]),
        _ => Err(RootKeysError::GlobalXpubCount(xpubs.len())),
    }
}

/// First input that is a 2-of-3 wallet input with a derivation path.
fn find_wallet_input(psbt: &Psbt) -> Option<(usize, ParsedScriptType, &DerivationPath)> {
    psbt.inputs.iter().enumerate().find_map(|(i, input)| {
        let script_type = get_psbt_input_script_type(input).ok()?;
        if script_type == ParsedScriptType::P2shP2pk {
            return None;
        }
        Some((i, script_type, input_derivation_path(input)?))
    })
}

/// Order the three global xpubs of `psbt` as `[user, backup, bitgo]`.
pub fn get_sorted_root_keys(psbt: &Psbt) -> Result<RootWalletKeys, RootKeysError> {
    let xpubs = global_xpubs(psbt)?;
    let (input_index, parsed_type, path) =
        find_wallet_input(psbt).ok_or(RootKeysError::NoWalletInput)?;
    let prevout =
        get_input_prevout(psbt, input_index).ok_or(RootKeysError::MissingUtxo(input_index))?;

    let secp = Secp256k1::verification_only();
    let derived = derive_xpubs_with_path(&xpubs, &secp, path)
        .map_err(|e| RootKeysError::Derivation(e.to_string()))?;
    let derived = to_pub_triple(&derived);
    // p2shP2pk was skipped above
    let script_types = to_script_type_2of3s(parsed_type).unwrap_or_default();

    for permutation in PERMUTATIONS {
        let keys = permutation.map(|i| derived[i]);
        for script_type in &script_types {
            let Ok(scripts) = WalletScripts::new(&keys, *script_type, &OutputScriptSupport::all())
            else {
                continue;
            };
            if scripts.output_script() == prevout.script_pubkey {
                debug!(input = input_index, ?permutation, %script_type, "sorted root keys");
                return Ok(RootWalletKeys::new(permutation.map(|i| xpubs[i])));
            }
        }
        trace!(?permutation, "permutation does not match");
    }
    Err(RootKeysError::NoPermutationFound)
}
