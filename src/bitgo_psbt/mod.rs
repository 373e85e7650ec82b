//! BitGo wallet PSBTs.
//!
//! [`BitGoPsbt`] pairs a PSBT with its network and adds the wallet specific
//! operations: MuSig2 signing of p2trMusig2 key path inputs, finalization,
//! root key sorting, wallet output detection and per-key signature checks.

pub mod musig2_session;
pub mod nonce_store;
pub mod p2tr_musig2_input;
mod propkv;
pub mod psbt_input;
pub mod root_keys;
mod sighash;
pub mod wallet_outputs;

pub use musig2_session::Musig2SessionKey;
pub use nonce_store::{Musig2NonceStore, NonceHandle};
pub use p2tr_musig2_input::{
    parse_musig2_nonces, parse_musig2_partial_sigs, parse_musig2_participants, Musig2Context,
    Musig2Error, Musig2Input, Musig2InputState, Musig2PartialSig, Musig2Participants,
    Musig2PubNonce, Musig2SignOptions,
};
pub use propkv::{BitGoKeyValue, ProprietaryKeySubtype, BITGO};
pub use psbt_input::{
    extract_p2ms_half_signed_tx, parse_psbt_input, signature_validation_array,
    validate_input_signatures, InputSignature, ParsedPsbtInput, PsbtInputError, ScriptPathInfo,
};
pub use root_keys::{get_sorted_root_keys, RootKeysError};
pub use sighash::{default_sighash_types, validate_sighash_type};
pub use wallet_outputs::{AmountType, WalletOutputError};

use miniscript::bitcoin::{psbt::Psbt, secp256k1, Transaction, TxOut};
use thiserror::Error;
use tracing::debug;

use crate::bitcoin::bip32::Xpriv;
use crate::fixed_script_wallet::parse_input::{get_psbt_input_script_type, ParsedScriptType};
use crate::fixed_script_wallet::wallet_keys::RootWalletKeys;
use crate::networks::Network;
use crate::SignerError;

#[derive(Debug, Error)]
pub enum DeserializeError {
    #[error(transparent)]
    Psbt(#[from] miniscript::bitcoin::psbt::Error),
    #[error("{0}")]
    Network(String),
}

/// The output spent by input `index`, from `witness_utxo` or
/// `non_witness_utxo`.
pub fn get_input_prevout(psbt: &Psbt, index: usize) -> Option<TxOut> {
    let input = psbt.inputs.get(index)?;
    if let Some(witness_utxo) = &input.witness_utxo {
        return Some(witness_utxo.clone());
    }
    let vout = psbt.unsigned_tx.input.get(index)?.previous_output.vout;
    input
        .non_witness_utxo
        .as_ref()?
        .output
        .get(vout as usize)
        .cloned()
}

#[derive(Debug, Clone, PartialEq)]
pub struct BitGoPsbt {
    psbt: Psbt,
    network: Network,
}

impl BitGoPsbt {
    pub fn new(psbt: Psbt, network: Network) -> BitGoPsbt {
        BitGoPsbt { psbt, network }
    }

    /// Zcash PSBTs use the overwintered transaction format and are rejected.
    pub fn deserialize(psbt_bytes: &[u8], network: Network) -> Result<BitGoPsbt, DeserializeError> {
        if network.mainnet() == Network::Zcash {
            return Err(DeserializeError::Network(format!(
                "PSBT format of network {} is not supported",
                network
            )));
        }
        Ok(BitGoPsbt::new(Psbt::deserialize(psbt_bytes)?, network))
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.psbt.serialize()
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn into_psbt(self) -> Psbt {
        self.psbt
    }

    pub fn input_script_type(&self, input_index: usize) -> Result<ParsedScriptType, SignerError> {
        let input = self
            .psbt
            .inputs
            .get(input_index)
            .ok_or_else(|| SignerError::new(&format!("no input at index {}", input_index)))?;
        Ok(get_psbt_input_script_type(input)?)
    }

    pub fn parse_input(&self, input_index: usize) -> Result<ParsedPsbtInput, PsbtInputError> {
        let input = self.psbt.inputs.get(input_index).ok_or(
            PsbtInputError::InputIndexOutOfRange {
                index: input_index,
                len: self.psbt.inputs.len(),
            },
        )?;
        parse_psbt_input(input)
    }

    /// `[user, backup, bitgo]` flags for valid signatures on one input.
    pub fn validate_input_signatures(
        &self,
        input_index: usize,
        root_keys: &RootWalletKeys,
    ) -> Result<[bool; 3], PsbtInputError> {
        validate_input_signatures(&self.psbt, input_index, root_keys, self.network)
    }

    pub fn signature_validation_array(
        &self,
        root_keys: &RootWalletKeys,
    ) -> Result<Vec<[bool; 3]>, PsbtInputError> {
        signature_validation_array(&self.psbt, root_keys, self.network)
    }

    pub fn extract_p2ms_half_signed_tx(&self) -> Result<Transaction, PsbtInputError> {
        extract_p2ms_half_signed_tx(&self.psbt)
    }

    /// Sign options with the sighash whitelist of this PSBT's network.
    pub fn sign_options(&self) -> Musig2SignOptions {
        Musig2SignOptions::for_network(self.network)
    }

    pub fn musig2_context(&mut self, input_index: usize) -> Result<Musig2Context<'_>, Musig2Error> {
        Musig2Context::new(&mut self.psbt, input_index)
    }

    /// Add the partial signature of `xpriv` to a p2trMusig2 key path input.
    ///
    /// With `options.deterministic` the cosigner derives its nonce from the
    /// user nonce. Otherwise the signer's nonce on the input must come from
    /// `store`.
    pub fn sign_musig2_input(
        &mut self,
        input_index: usize,
        xpriv: &Xpriv,
        store: &mut Musig2NonceStore,
        options: &Musig2SignOptions,
    ) -> Result<(), Musig2Error> {
        let mut ctx = self.musig2_context(input_index)?;
        if options.deterministic {
            return ctx.sign_deterministic(xpriv, options);
        }
        let handle = ctx.signer_nonce_handle(store, xpriv)?;
        ctx.sign(store, handle, xpriv, options)
    }

    pub fn finalize_input<C: secp256k1::Verification>(
        &mut self,
        secp: &secp256k1::Secp256k1<C>,
        input_index: usize,
    ) -> Result<(), String> {
        use miniscript::psbt::PsbtExt;

        let input = self
            .psbt
            .inputs
            .get(input_index)
            .ok_or_else(|| format!("no input at index {}", input_index))?;
        if Musig2Input::is_musig2_input(input) {
            return Musig2Input::finalize_input(&mut self.psbt, secp, input_index)
                .map_err(|e| e.to_string());
        }
        self.psbt
            .finalize_inp_mut(secp, input_index)
            .map_err(|e| e.to_string())
    }

    /// Finalize all inputs, attempting each input even if some fail.
    pub fn finalize_mut<C: secp256k1::Verification>(
        &mut self,
        secp: &secp256k1::Secp256k1<C>,
    ) -> Result<(), Vec<String>> {
        let errors: Vec<String> = (0..self.psbt.inputs.len())
            .filter_map(|index| {
                self.finalize_input(secp, index)
                    .err()
                    .map(|e| format!("Input {}: {}", index, e))
            })
            .collect();
        if errors.is_empty() {
            debug!(inputs = self.psbt.inputs.len(), "finalized psbt");
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn finalize<C: secp256k1::Verification>(
        mut self,
        secp: &secp256k1::Secp256k1<C>,
    ) -> Result<Psbt, String> {
        match self.finalize_mut(secp) {
            Ok(()) => Ok(self.into_psbt()),
            Err(errors) => Err(format!(
                "Failed to finalize {} input(s): {}",
                errors.len(),
                errors.join("; ")
            )),
        }
    }

    pub fn sorted_root_keys(&self) -> Result<RootWalletKeys, RootKeysError> {
        get_sorted_root_keys(&self.psbt)
    }

    pub fn wallet_output_indices(
        &self,
        root_keys: &RootWalletKeys,
    ) -> Result<Vec<usize>, WalletOutputError> {
        wallet_outputs::get_wallet_output_indices(&self.psbt, root_keys)
    }

    pub fn wallet_output_value(
        &self,
        root_keys: &RootWalletKeys,
        amount_type: AmountType,
    ) -> Result<u64, WalletOutputError> {
        wallet_outputs::get_wallet_output_value(&self.psbt, root_keys, amount_type)
    }
}
