//! Find the outputs of a PSBT that pay back to the wallet.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::bitcoin::bip32::DerivationPath;
use crate::bitcoin::psbt::{Output as PsbtOutput, Psbt};
use crate::fixed_script_wallet::parse_input::get_chain_and_index_from_path;
use crate::fixed_script_wallet::wallet_keys::{to_pub_triple, RootWalletKeys};
use crate::fixed_script_wallet::wallet_scripts::{ScriptType2Of3, WalletScripts};
use crate::networks::OutputScriptSupport;

/// Largest integer a JavaScript `number` holds exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

const SCRIPT_TYPES: [ScriptType2Of3; 5] = [
    ScriptType2Of3::P2sh,
    ScriptType2Of3::P2shP2wsh,
    ScriptType2Of3::P2wsh,
    ScriptType2Of3::P2tr,
    ScriptType2Of3::P2trMusig2,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletOutputError {
    #[error("Output index {index} out of range ({len} outputs)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("failed to derive wallet keys: {0}")]
    Derivation(String),
    #[error("output value {0} exceeds MAX_SAFE_INTEGER")]
    UnsafeAmount(u64),
}

/// Numeric representation the caller will convert amounts to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountType {
    /// Must stay below [`MAX_SAFE_INTEGER`]
    Number,
    BigInt,
}

/// Derivation path of an output. Tap key origins win over bip32 derivations.
fn output_derivation_path(output: &PsbtOutput) -> Option<&DerivationPath> {
    output
        .tap_key_origins
        .values()
        .map(|(_, (_, path))| path)
        .next()
        .or_else(|| output.bip32_derivation.values().map(|(_, path)| path).next())
}

/// Whether output `index` pays to a script of `root_keys`.
///
/// The keys are derived along the output's declared path and every script
/// type is tried. Outputs without derivation info are not wallet outputs.
pub fn is_wallet_output(
    psbt: &Psbt,
    index: usize,
    root_keys: &RootWalletKeys,
) -> Result<bool, WalletOutputError> {
    let (Some(tx_out), Some(output)) = (psbt.unsigned_tx.output.get(index), psbt.outputs.get(index))
    else {
        return Err(WalletOutputError::IndexOutOfRange {
            index,
            len: psbt.unsigned_tx.output.len(),
        });
    };
    let Some(path) = output_derivation_path(output) else {
        return Ok(false);
    };
    let Ok((chain, derivation_index)) = get_chain_and_index_from_path(path) else {
        return Ok(false);
    };

    let derived = root_keys
        .derive_for_chain_and_index(chain, derivation_index)
        .map_err(|e| WalletOutputError::Derivation(e.to_string()))?;
    let keys = to_pub_triple(&derived);
    let support = OutputScriptSupport::all();
    let is_wallet = SCRIPT_TYPES.iter().any(|script_type| {
        WalletScripts::new(&keys, *script_type, &support)
            .map(|scripts| scripts.output_script() == tx_out.script_pubkey)
            .unwrap_or(false)
    });
    trace!(index, chain, derivation_index, is_wallet, "checked output");
    Ok(is_wallet)
}

pub fn get_wallet_output_indices(
    psbt: &Psbt,
    root_keys: &RootWalletKeys,
) -> Result<Vec<usize>, WalletOutputError> {
    let mut indices = vec![];
    for index in 0..psbt.unsigned_tx.output.len() {
        if is_wallet_output(psbt, index, root_keys)? {
            indices.push(index);
        }
    }
    Ok(indices)
}

/// Sum of all wallet output values in satoshis.
pub fn get_wallet_output_value(
    psbt: &Psbt,
    root_keys: &RootWalletKeys,
    amount_type: AmountType,
) -> Result<u64, WalletOutputError> {
    let mut total: u64 = 0;
    for index in get_wallet_output_indices(psbt, root_keys)? {
        let value = psbt.unsigned_tx.output[index].value.to_sat();
        if amount_type == AmountType::Number && value > MAX_SAFE_INTEGER {
            return Err(WalletOutputError::UnsafeAmount(value));
        }
        total = total.saturating_add(value);
    }
    if amount_type == AmountType::Number && total > MAX_SAFE_INTEGER {
        return Err(WalletOutputError::UnsafeAmount(total));
    }
    Ok(total)
}
