//! Wallet view of unfinalized PSBT inputs.
//!
//! [`parse_psbt_input`] reads the pub script and the signatures collected so
//! far from the PSBT metadata. [`validate_input_signatures`] checks them per
//! wallet key and [`extract_p2ms_half_signed_tx`] turns a PSBT with one
//! signature per 2-of-3 multisig input into a half-signed transaction.

use miniscript::bitcoin::hashes::Hash;
use miniscript::bitcoin::psbt::{Input as PsbtInput, Psbt};
use miniscript::bitcoin::secp256k1::{self, Message, Secp256k1};
use thiserror::Error;
use tracing::{debug, trace};

use crate::bitcoin::script::{Builder, PushBytesBuf};
use crate::bitcoin::sighash::{Prevouts, SighashCache};
use crate::bitcoin::taproot::{LeafVersion, TapLeafHash};
use crate::bitcoin::{CompressedPublicKey, PublicKey, Script, ScriptBuf, Transaction, Witness};
use crate::bitgo_psbt::get_input_prevout;
use crate::bitgo_psbt::p2tr_musig2_input::{
    collect_prevouts, parse_musig2_partial_sigs, parse_musig2_participants, Musig2Context,
    Musig2Error,
};
use crate::bitgo_psbt::root_keys::input_derivation_path;
use crate::fixed_script_wallet::parse_input::{
    control_block_leaf_version, control_block_script_path_level, get_chain_and_index_from_path,
    get_psbt_input_script_type, parse_pub_script, ParseInputError, ParsedPubScript,
    ParsedScriptType,
};
use crate::fixed_script_wallet::wallet_keys::{to_pub_triple, RootWalletKeys};
use crate::fixed_script_wallet::wallet_scripts::to_xonly_pubkey;
use crate::networks::Network;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PsbtInputError {
    #[error("Finalized PSBT parsing is not supported")]
    Finalized,
    #[error("Invalid PSBT state for {0}. Missing required fields.")]
    MissingFields(ParsedScriptType),
    #[error("unexpected signature count {0}")]
    SignatureCount(usize),
    #[error("signature by {0} does not belong to a key of the pub script")]
    UnknownSignatureKey(String),
    #[error("unsupported script type {0}")]
    UnsupportedScriptType(ParsedScriptType),
    #[error("signature sighash does not match input sighash type")]
    SighashMismatch,
    #[error("empty inputs or outputs")]
    EmptyTransaction,
    #[error("Input index {index} out of range ({len} inputs)")]
    InputIndexOutOfRange { index: usize, len: usize },
    #[error("Missing UTXO data for input {0}")]
    MissingUtxo(usize),
    #[error("input has no wallet derivation path")]
    MissingDerivation,
    #[error("could not derive wallet keys: {0}")]
    Derivation(String),
    #[error("Failed to compute sighash: {0}")]
    Sighash(String),
    #[error("signature validation is not supported on network {0}")]
    UnsupportedNetwork(Network),
    #[error("could not build script sig: {0}")]
    ScriptSig(String),
    #[error(transparent)]
    Parse(#[from] ParseInputError),
    #[error(transparent)]
    Musig2(#[from] Musig2Error),
}

/// A signature on a PSBT input and the key that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSignature {
    /// 32 bytes for script path signatures, 33 bytes otherwise.
    pub public_key: Vec<u8>,
    /// Serialized with its sighash byte. MuSig2 partial signatures only
    /// carry one for a non-default sighash type.
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPathInfo {
    pub control_block: Vec<u8>,
    pub leaf_version: u8,
    /// Depth of the leaf in the tap tree
    pub script_path_level: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPsbtInput {
    pub script_type: ParsedScriptType,
    pub pub_script: ParsedPubScript,
    /// In the order of the keys in the pub script, or of the MuSig2
    /// participants for a key path spend.
    pub signatures: Vec<InputSignature>,
    pub participant_pub_keys: Option<[CompressedPublicKey; 2]>,
    pub script_path: Option<ScriptPathInfo>,
}

impl ParsedPsbtInput {
    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }
}

fn index_error(psbt: &Psbt, index: usize) -> PsbtInputError {
    PsbtInputError::InputIndexOutOfRange {
        index,
        len: psbt.inputs.len(),
    }
}

fn sighash_error(e: impl std::fmt::Display) -> PsbtInputError {
    PsbtInputError::Sighash(e.to_string())
}

/// Output script of a key path input. Without a witness utxo it is rebuilt
/// from the internal key and merkle root.
fn key_path_output_script(input: &PsbtInput) -> Option<ScriptBuf> {
    if let Some(utxo) = &input.witness_utxo {
        return Some(utxo.script_pubkey.clone());
    }
    let secp = Secp256k1::verification_only();
    Some(ScriptBuf::new_p2tr(
        &secp,
        input.tap_internal_key?,
        input.tap_merkle_root,
    ))
}

fn order_by_keys(
    signatures: impl Iterator<Item = (Vec<u8>, Vec<u8>)>,
    public_keys: &[&[u8]],
) -> Result<Vec<InputSignature>, PsbtInputError> {
    let mut positioned = signatures
        .map(|(public_key, signature)| {
            let position = public_keys
                .iter()
                .position(|key| *key == public_key.as_slice())
                .ok_or_else(|| PsbtInputError::UnknownSignatureKey(hex::encode(&public_key)))?;
            Ok((position, InputSignature { public_key, signature }))
        })
        .collect::<Result<Vec<_>, PsbtInputError>>()?;
    positioned.sort_by_key(|(position, _)| *position);
    Ok(positioned.into_iter().map(|(_, sig)| sig).collect())
}

fn ecdsa_signatures(
    input: &PsbtInput,
    public_keys: &[&[u8]],
) -> Result<Vec<InputSignature>, PsbtInputError> {
    order_by_keys(
        input
            .partial_sigs
            .iter()
            .map(|(key, sig)| (key.to_bytes(), sig.to_vec())),
        public_keys,
    )
}

fn script_path_signatures(
    input: &PsbtInput,
    public_keys: &[[u8; 32]; 2],
) -> Result<Vec<InputSignature>, PsbtInputError> {
    order_by_keys(
        input
            .tap_script_sigs
            .iter()
            .map(|((key, _), sig)| (key.serialize().to_vec(), sig.to_vec())),
        &[&public_keys[0][..], &public_keys[1][..]],
    )
}

fn script_path_info(input: &PsbtInput) -> Result<ScriptPathInfo, PsbtInputError> {
    let control_block = input
        .tap_scripts
        .keys()
        .next()
        .ok_or(PsbtInputError::MissingFields(
            ParsedScriptType::TaprootScriptPathSpend,
        ))?
        .serialize();
    Ok(ScriptPathInfo {
        script_path_level: control_block_script_path_level(&control_block)?,
        leaf_version: control_block_leaf_version(&control_block)?,
        control_block,
    })
}

type KeyPathSignatures = (Vec<InputSignature>, Option<[CompressedPublicKey; 2]>);

fn key_path_signatures(input: &PsbtInput) -> Result<KeyPathSignatures, PsbtInputError> {
    let partial_sigs = parse_musig2_partial_sigs(input)?;
    let Some(participants) = parse_musig2_participants(input)? else {
        if partial_sigs.is_empty() {
            return Ok((vec![], None));
        }
        return Err(PsbtInputError::MissingFields(
            ParsedScriptType::TaprootKeyPathSpend,
        ));
    };
    let keys = participants.participant_pub_keys.map(|key| key.to_bytes());
    let signatures = order_by_keys(
        partial_sigs.iter().map(|sig| {
            let mut signature = sig.partial_sig.serialize().to_vec();
            if sig.sighash_type != 0 {
                signature.push(sig.sighash_type);
            }
            (sig.participant_pub_key.to_bytes().to_vec(), signature)
        }),
        &[&keys[0][..], &keys[1][..]],
    )?;
    Ok((signatures, Some(participants.participant_pub_keys)))
}

/// Parse the pub script and signatures of an unfinalized wallet input.
///
/// The pub script comes from the redeem script (p2sh, p2shP2pk), the witness
/// script (p2shP2wsh, p2wsh), the single tap leaf script (script path) or the
/// output script (key path).
pub fn parse_psbt_input(input: &PsbtInput) -> Result<ParsedPsbtInput, PsbtInputError> {
    if input.final_script_sig.is_some() || input.final_script_witness.is_some() {
        return Err(PsbtInputError::Finalized);
    }
    let script_type = get_psbt_input_script_type(input)?;
    let pub_script = match script_type {
        ParsedScriptType::P2sh | ParsedScriptType::P2shP2pk => input.redeem_script.clone(),
        ParsedScriptType::P2shP2wsh | ParsedScriptType::P2wsh => input.witness_script.clone(),
        ParsedScriptType::TaprootScriptPathSpend => input
            .tap_scripts
            .values()
            .next()
            .map(|(script, _)| script.clone()),
        ParsedScriptType::TaprootKeyPathSpend => key_path_output_script(input),
    }
    .ok_or(PsbtInputError::MissingFields(script_type))?;

    let mut pub_script = parse_pub_script(&pub_script, script_type)?;
    if let ParsedPubScript::P2ms {
        script_type: ParsedScriptType::P2shP2wsh,
        redeem_script,
        ..
    } = &mut pub_script
    {
        *redeem_script = input.redeem_script.clone();
    }

    let mut participant_pub_keys = None;
    let mut script_path = None;
    let signatures = match &pub_script {
        ParsedPubScript::P2ms { public_keys, .. } => {
            let keys: Vec<&[u8]> = public_keys.iter().map(Vec::as_slice).collect();
            ecdsa_signatures(input, &keys)?
        }
        ParsedPubScript::P2shP2pk { public_key, .. } => {
            ecdsa_signatures(input, &[public_key.as_slice()])?
        }
        ParsedPubScript::TaprootScriptPath { public_keys, .. } => {
            script_path = Some(script_path_info(input)?);
            script_path_signatures(input, public_keys)?
        }
        ParsedPubScript::TaprootKeyPath { .. } => {
            let (signatures, participants) = key_path_signatures(input)?;
            participant_pub_keys = participants;
            signatures
        }
    };

    let max_signatures = if script_type == ParsedScriptType::P2shP2pk { 1 } else { 2 };
    if signatures.len() > max_signatures {
        return Err(PsbtInputError::SignatureCount(signatures.len()));
    }

    Ok(ParsedPsbtInput {
        script_type,
        pub_script,
        signatures,
        participant_pub_keys,
        script_path,
    })
}

fn verify_ecdsa_signature<C: secp256k1::Verification>(
    secp: &Secp256k1<C>,
    psbt: &Psbt,
    input_index: usize,
    script_type: ParsedScriptType,
    script: &Script,
    key: &CompressedPublicKey,
) -> Result<bool, PsbtInputError> {
    let input = psbt
        .inputs
        .get(input_index)
        .ok_or_else(|| index_error(psbt, input_index))?;
    let Some(signature) = input.partial_sigs.get(&PublicKey::from(*key)) else {
        return Ok(false);
    };

    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let sighash = if script_type == ParsedScriptType::P2sh {
        cache
            .legacy_signature_hash(input_index, script, signature.sighash_type.to_u32())
            .map_err(sighash_error)?
            .to_byte_array()
    } else {
        let prevout = get_input_prevout(psbt, input_index)
            .ok_or(PsbtInputError::MissingUtxo(input_index))?;
        cache
            .p2wsh_signature_hash(input_index, script, prevout.value, signature.sighash_type)
            .map_err(sighash_error)?
            .to_byte_array()
    };
    let message = Message::from_digest(sighash);
    Ok(secp
        .verify_ecdsa(&message, &signature.signature, &key.0)
        .is_ok())
}

fn verify_script_path_signature<C: secp256k1::Verification>(
    secp: &Secp256k1<C>,
    psbt: &Psbt,
    input_index: usize,
    leaf_script: &Script,
    key: &CompressedPublicKey,
) -> Result<bool, PsbtInputError> {
    let input = psbt
        .inputs
        .get(input_index)
        .ok_or_else(|| index_error(psbt, input_index))?;
    let xonly = to_xonly_pubkey(key);
    let leaf_hash = TapLeafHash::from_script(leaf_script, LeafVersion::TapScript);
    let Some(signature) = input.tap_script_sigs.get(&(xonly, leaf_hash)) else {
        return Ok(false);
    };

    let prevouts = collect_prevouts(psbt)?;
    let sighash = SighashCache::new(&psbt.unsigned_tx)
        .taproot_script_spend_signature_hash(
            input_index,
            &Prevouts::All(&prevouts),
            leaf_hash,
            signature.sighash_type,
        )
        .map_err(sighash_error)?;
    let message = Message::from_digest(sighash.to_byte_array());
    Ok(secp
        .verify_schnorr(&signature.signature, &message, &xonly)
        .is_ok())
}

fn verify_musig2_partial_signature(
    psbt: &mut Psbt,
    input_index: usize,
    key: &CompressedPublicKey,
) -> Result<bool, PsbtInputError> {
    let ctx = Musig2Context::new(psbt, input_index)?;
    match ctx.validate_signatures(Some(key)) {
        Ok(valid) => Ok(valid),
        Err(Musig2Error::NoSignatures | Musig2Error::NoSignaturesForPubkey) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Whether the input carries a valid signature of each wallet key, in the
/// order `[user, backup, bitgo]`.
///
/// Keys are derived from `root_keys` along the input's derivation path.
/// p2shP2pk inputs are not signed by wallet keys and report `[false; 3]`.
/// FORKID networks commit to the FORKID sighash algorithm, which the
/// transaction sighash cache does not implement, and are rejected.
pub fn validate_input_signatures(
    psbt: &Psbt,
    input_index: usize,
    root_keys: &RootWalletKeys,
    network: Network,
) -> Result<[bool; 3], PsbtInputError> {
    if network.uses_forkid() {
        return Err(PsbtInputError::UnsupportedNetwork(network));
    }
    let input = psbt
        .inputs
        .get(input_index)
        .ok_or_else(|| index_error(psbt, input_index))?;
    let parsed = parse_psbt_input(input)?;
    if parsed.script_type == ParsedScriptType::P2shP2pk {
        return Ok([false; 3]);
    }

    let path = input_derivation_path(input).ok_or(PsbtInputError::MissingDerivation)?;
    let (chain, index) = get_chain_and_index_from_path(path)?;
    let keys = to_pub_triple(
        &root_keys
            .derive_for_chain_and_index(chain, index)
            .map_err(|e| PsbtInputError::Derivation(e.to_string()))?,
    );

    let secp = Secp256k1::verification_only();
    let mut musig2_psbt = None;
    let mut valid = [false; 3];
    for (result, key) in valid.iter_mut().zip(keys.iter()) {
        *result = match &parsed.pub_script {
            ParsedPubScript::P2ms {
                script_type,
                pub_script,
                ..
            } => verify_ecdsa_signature(&secp, psbt, input_index, *script_type, pub_script, key)?,
            ParsedPubScript::TaprootScriptPath { pub_script, .. } => {
                verify_script_path_signature(&secp, psbt, input_index, pub_script, key)?
            }
            ParsedPubScript::TaprootKeyPath { .. } => {
                let psbt = musig2_psbt.get_or_insert_with(|| psbt.clone());
                verify_musig2_partial_signature(psbt, input_index, key)?
            }
            ParsedPubScript::P2shP2pk { .. } => false,
        };
    }
    trace!(
        input = input_index,
        script_type = %parsed.script_type,
        ?valid,
        "validated input signatures"
    );
    Ok(valid)
}

/// [`validate_input_signatures`] for every input.
pub fn signature_validation_array(
    psbt: &Psbt,
    root_keys: &RootWalletKeys,
    network: Network,
) -> Result<Vec<[bool; 3]>, PsbtInputError> {
    (0..psbt.inputs.len())
        .map(|index| validate_input_signatures(psbt, index, root_keys, network))
        .collect()
}

fn push_only_script(elements: &[Vec<u8>]) -> Result<ScriptBuf, PsbtInputError> {
    elements
        .iter()
        .try_fold(Builder::new(), |builder, element| {
            if element.is_empty() {
                return Ok(builder.push_int(0));
            }
            let bytes = PushBytesBuf::try_from(element.clone())
                .map_err(|e| PsbtInputError::ScriptSig(e.to_string()))?;
            Ok(builder.push_slice(bytes))
        })
        .map(Builder::into_script)
}

/// Build the half-signed transaction of a PSBT whose inputs are all 2-of-3
/// multisig inputs with exactly one signature.
///
/// Missing signatures are empty placeholders, so the result parses as a
/// half-signed input. Each signature's sighash type must equal the input's.
pub fn extract_p2ms_half_signed_tx(psbt: &Psbt) -> Result<Transaction, PsbtInputError> {
    if psbt.inputs.is_empty() || psbt.unsigned_tx.output.is_empty() {
        return Err(PsbtInputError::EmptyTransaction);
    }

    let mut tx = psbt.unsigned_tx.clone();
    for (index, (input, tx_in)) in psbt.inputs.iter().zip(tx.input.iter_mut()).enumerate() {
        let parsed = parse_psbt_input(input)?;
        let ParsedPubScript::P2ms {
            script_type,
            public_keys,
            redeem_script,
            witness_script,
            ..
        } = &parsed.pub_script
        else {
            return Err(PsbtInputError::UnsupportedScriptType(parsed.script_type));
        };
        let [signature] = parsed.signatures.as_slice() else {
            return Err(PsbtInputError::SignatureCount(parsed.signatures.len()));
        };
        let signature_sighash = input
            .partial_sigs
            .values()
            .next()
            .map(|sig| sig.sighash_type.to_u32());
        if input.sighash_type.map(|t| t.to_u32()) != signature_sighash {
            return Err(PsbtInputError::SighashMismatch);
        }

        let mut stack = vec![vec![]];
        stack.extend(public_keys.iter().map(|key| {
            if *key == signature.public_key {
                signature.signature.clone()
            } else {
                vec![]
            }
        }));
        let missing = || PsbtInputError::MissingFields(*script_type);
        match script_type {
            ParsedScriptType::P2sh => {
                stack.push(redeem_script.as_ref().ok_or_else(missing)?.to_bytes());
                tx_in.script_sig = push_only_script(&stack)?;
            }
            _ => {
                if let Some(redeem_script) = redeem_script {
                    tx_in.script_sig = push_only_script(&[redeem_script.to_bytes()])?;
                }
                stack.push(witness_script.as_ref().ok_or_else(missing)?.to_bytes());
                tx_in.witness = Witness::from_slice(&stack);
            }
        }
        trace!(input = index, script_type = %script_type, "extracted half-signed input");
    }
    debug!(inputs = tx.input.len(), "extracted half-signed transaction");
    Ok(tx)
}
