//! Classify transaction inputs of fixed-script wallets.
//!
//! `parse_signature_script` recovers the script type, public keys and
//! (possibly placeholder) signatures from a script sig and witness.
//! `parse_pub_script` does the same for a redeem, witness, leaf or output
//! script when the script type is already known.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bitcoin::bip32::{ChildNumber, DerivationPath};
use crate::bitcoin::blockdata::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_PUSHNUM_1, OP_PUSHNUM_2, OP_PUSHNUM_3,
};
use crate::bitcoin::psbt::Input as PsbtInput;
use crate::bitcoin::{Script, ScriptBuf, Witness};
use crate::fixed_script_wallet::script_matcher::{
    decompile, match_script, match_script_some, witness_elements, Captures, Element, MatchError,
    NestedScript, Pattern, SignatureSlot,
};
use crate::fixed_script_wallet::wallet_scripts::ScriptType2Of3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseInputError {
    #[error("could not parse input")]
    CouldNotParseInput,
    #[error("invalid taproot key path signature")]
    KeyPathPlaceholder,
    #[error("unexpected control block length {0}")]
    ControlBlockLength(usize),
    #[error("unexpected leafVersion")]
    LeafVersion,
    #[error("unexpected pubkey count")]
    UnexpectedPubkeyCount,
    #[error("invalid signature count {0}")]
    InvalidSignatureCount(usize),
    #[error("invalid script type {0}")]
    InvalidScriptType(ParsedScriptType),
    #[error("invalid path \"{0}\"")]
    InvalidPath(String),
    #[error("chain and index must be unhardened in path \"{0}\"")]
    HardenedPath(String),
    #[error("Found both {0} and {1} PSBT metadata.")]
    ConflictingMetadata(ParsedScriptType, &'static str),
    #[error("Bitgo only supports a single tap leaf script per input.")]
    MultipleTapLeafScripts,
    #[error(transparent)]
    Match(#[from] MatchError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParsedScriptType {
    P2sh,
    P2shP2wsh,
    P2wsh,
    /// Only implemented for p2trMusig2
    TaprootKeyPathSpend,
    /// Either p2tr or p2trMusig2
    TaprootScriptPathSpend,
    P2shP2pk,
}

impl ParsedScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParsedScriptType::P2sh => "p2sh",
            ParsedScriptType::P2shP2wsh => "p2shP2wsh",
            ParsedScriptType::P2wsh => "p2wsh",
            ParsedScriptType::TaprootKeyPathSpend => "taprootKeyPathSpend",
            ParsedScriptType::TaprootScriptPathSpend => "taprootScriptPathSpend",
            ParsedScriptType::P2shP2pk => "p2shP2pk",
        }
    }

    fn is_p2ms(&self) -> bool {
        matches!(
            self,
            ParsedScriptType::P2sh | ParsedScriptType::P2shP2wsh | ParsedScriptType::P2wsh
        )
    }
}

impl fmt::Display for ParsedScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output script types a parsed input can be spending from.
///
/// A script path spend is possible for both taproot variants, a key path
/// spend only for p2trMusig2. p2shP2pk is not a 2-of-3 script type.
pub fn to_script_type_2of3s(
    script_type: ParsedScriptType,
) -> Result<Vec<ScriptType2Of3>, ParseInputError> {
    Ok(match script_type {
        ParsedScriptType::P2sh => vec![ScriptType2Of3::P2sh],
        ParsedScriptType::P2shP2wsh => vec![ScriptType2Of3::P2shP2wsh],
        ParsedScriptType::P2wsh => vec![ScriptType2Of3::P2wsh],
        ParsedScriptType::TaprootScriptPathSpend => {
            vec![ScriptType2Of3::P2trMusig2, ScriptType2Of3::P2tr]
        }
        ParsedScriptType::TaprootKeyPathSpend => vec![ScriptType2Of3::P2trMusig2],
        ParsedScriptType::P2shP2pk => {
            return Err(ParseInputError::InvalidScriptType(script_type))
        }
    })
}

const MULTISIG_2_OF_3: &[Pattern] = &[
    Pattern::Op(OP_PUSHNUM_2),
    Pattern::PubKey,
    Pattern::PubKey,
    Pattern::PubKey,
    Pattern::Op(OP_PUSHNUM_3),
    Pattern::Op(OP_CHECKMULTISIG),
];

/// `OP_0 <sig> <sig> <script>` for fully signed inputs.
const P2MS_FULLY_SIGNED: &[Pattern] = &[
    Pattern::Zero,
    Pattern::Signature,
    Pattern::Signature,
    Pattern::Script(MULTISIG_2_OF_3),
];

/// Half-signed inputs keep a placeholder for each missing signature.
const P2MS_WITH_PLACEHOLDERS: &[Pattern] = &[
    Pattern::Zero,
    Pattern::Signature,
    Pattern::Signature,
    Pattern::Signature,
    Pattern::Script(MULTISIG_2_OF_3),
];

const TAPROOT_LEAF: &[Pattern] = &[
    Pattern::PubKeyXOnly,
    Pattern::Op(OP_CHECKSIGVERIFY),
    Pattern::PubKeyXOnly,
    Pattern::Op(OP_CHECKSIG),
];

/// Assumes no annex.
const TAPROOT_SCRIPT_PATH: &[Pattern] = &[
    Pattern::Signature,
    Pattern::Signature,
    Pattern::Script(TAPROOT_LEAF),
    Pattern::ControlBlock,
];

const TAPROOT_KEY_PATH: &[Pattern] = &[Pattern::Signature];

const TAPROOT_OUTPUT: &[Pattern] = &[Pattern::Op(OP_PUSHNUM_1), Pattern::PubKeyXOnly];

const P2PK: &[Pattern] = &[Pattern::PubKey, Pattern::Op(OP_CHECKSIG)];

const P2SH_P2PK: &[Pattern] = &[Pattern::Signature, Pattern::Script(P2PK)];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignatureScriptP2ms {
    pub script_type: ParsedScriptType,
    pub public_keys: [Vec<u8>; 3],
    /// Two entries when fully signed, three (with placeholders) otherwise.
    pub signatures: Vec<SignatureSlot>,
    pub pub_script: ScriptBuf,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignatureScriptTaprootScriptPath {
    pub public_keys: [[u8; 32]; 2],
    pub signatures: [SignatureSlot; 2],
    pub control_block: Vec<u8>,
    pub leaf_version: u8,
    /// Depth of the leaf in the tap tree
    pub script_path_level: u8,
    pub pub_script: ScriptBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSignatureScript {
    P2shP2pk {
        public_key: Vec<u8>,
        signature: SignatureSlot,
    },
    P2ms(ParsedSignatureScriptP2ms),
    TaprootKeyPath {
        signature: Vec<u8>,
    },
    TaprootScriptPath(ParsedSignatureScriptTaprootScriptPath),
}

impl ParsedSignatureScript {
    pub fn script_type(&self) -> ParsedScriptType {
        match self {
            ParsedSignatureScript::P2shP2pk { .. } => ParsedScriptType::P2shP2pk,
            ParsedSignatureScript::P2ms(p) => p.script_type,
            ParsedSignatureScript::TaprootKeyPath { .. } => ParsedScriptType::TaprootKeyPathSpend,
            ParsedSignatureScript::TaprootScriptPath(_) => ParsedScriptType::TaprootScriptPathSpend,
        }
    }

    pub fn signatures(&self) -> Vec<SignatureSlot> {
        match self {
            ParsedSignatureScript::P2shP2pk { signature, .. } => vec![signature.clone()],
            ParsedSignatureScript::P2ms(p) => p.signatures.clone(),
            ParsedSignatureScript::TaprootKeyPath { signature } => {
                vec![SignatureSlot::Signature(signature.clone())]
            }
            ParsedSignatureScript::TaprootScriptPath(p) => p.signatures.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPubScript {
    P2ms {
        script_type: ParsedScriptType,
        public_keys: [Vec<u8>; 3],
        pub_script: ScriptBuf,
        redeem_script: Option<ScriptBuf>,
        witness_script: Option<ScriptBuf>,
    },
    /// The 34-byte output script and its tap output key
    TaprootKeyPath {
        public_key: [u8; 32],
        pub_script: ScriptBuf,
    },
    TaprootScriptPath {
        public_keys: [[u8; 32]; 2],
        pub_script: ScriptBuf,
    },
    P2shP2pk {
        public_key: Vec<u8>,
        pub_script: ScriptBuf,
        redeem_script: ScriptBuf,
    },
}

/// The script sig and witness of an input, with empty ones treated as absent.
struct InputScripts<'a> {
    script: Option<Vec<Element<'a>>>,
    witness: Option<Vec<Element<'a>>>,
}

impl InputScripts<'_> {
    fn legacy(&self) -> Option<&[Element<'_>]> {
        match (&self.script, &self.witness) {
            (Some(script), None) => Some(script),
            _ => None,
        }
    }

    fn wrapped_segwit(&self) -> Option<(&[Element<'_>], &[Element<'_>])> {
        match (&self.script, &self.witness) {
            (Some(script), Some(witness)) => Some((script, witness)),
            _ => None,
        }
    }

    fn native_segwit(&self) -> Option<&[Element<'_>]> {
        match (&self.script, &self.witness) {
            (None, Some(witness)) => Some(witness),
            _ => None,
        }
    }
}

pub fn control_block_script_path_level(control_block: &[u8]) -> Result<u8, ParseInputError> {
    match control_block.len() {
        65 => Ok(1),
        97 => Ok(2),
        len => Err(ParseInputError::ControlBlockLength(len)),
    }
}

pub fn control_block_leaf_version(control_block: &[u8]) -> Result<u8, ParseInputError> {
    control_block
        .first()
        .map(|b| b & 0xfe)
        .ok_or(ParseInputError::LeafVersion)
}

fn single_nested<'a, 'c>(captures: &'c Captures<'a>) -> Result<&'c NestedScript<'a>, ParseInputError> {
    captures
        .scripts
        .first()
        .ok_or(ParseInputError::Match(MatchError::ExpectedPush))
}

fn pubkey_triple(keys: &[&[u8]]) -> Result<[Vec<u8>; 3], ParseInputError> {
    match keys {
        [a, b, c] => Ok([a.to_vec(), b.to_vec(), c.to_vec()]),
        _ => Err(ParseInputError::UnexpectedPubkeyCount),
    }
}

fn xonly_pair(keys: &[&[u8]]) -> Result<[[u8; 32]; 2], ParseInputError> {
    let to_array = |k: &[u8]| -> Result<[u8; 32], ParseInputError> {
        k.try_into()
            .map_err(|_| ParseInputError::UnexpectedPubkeyCount)
    };
    match keys {
        [a, b] => Ok([to_array(a)?, to_array(b)?]),
        _ => Err(ParseInputError::UnexpectedPubkeyCount),
    }
}

fn parse_p2ms(
    elements: &[Element<'_>],
    script_type: ParsedScriptType,
) -> Result<ParsedSignatureScriptP2ms, ParseInputError> {
    let captures = match_script_some(elements, &[P2MS_FULLY_SIGNED, P2MS_WITH_PLACEHOLDERS])?;
    let nested = single_nested(&captures)?;
    let pub_script = ScriptBuf::from_bytes(nested.bytes.to_vec());
    Ok(ParsedSignatureScriptP2ms {
        script_type,
        public_keys: pubkey_triple(&nested.captures.pubkeys)?,
        signatures: captures.signatures.clone(),
        redeem_script: (script_type == ParsedScriptType::P2sh).then(|| pub_script.clone()),
        witness_script: (script_type != ParsedScriptType::P2sh).then(|| pub_script.clone()),
        pub_script,
    })
}

fn parse_p2sh_2of3(input: &InputScripts<'_>) -> Result<ParsedSignatureScript, ParseInputError> {
    let script = input
        .legacy()
        .ok_or(ParseInputError::CouldNotParseInput)?;
    Ok(ParsedSignatureScript::P2ms(parse_p2ms(
        script,
        ParsedScriptType::P2sh,
    )?))
}

fn parse_p2sh_p2wsh_2of3(
    input: &InputScripts<'_>,
) -> Result<ParsedSignatureScript, ParseInputError> {
    let (script, witness) = input
        .wrapped_segwit()
        .ok_or(ParseInputError::CouldNotParseInput)?;
    let mut parsed = parse_p2ms(witness, ParsedScriptType::P2shP2wsh)?;
    parsed.redeem_script = match script.first() {
        Some(Element::Push(bytes)) => Some(ScriptBuf::from_bytes(bytes.to_vec())),
        _ => None,
    };
    Ok(ParsedSignatureScript::P2ms(parsed))
}

fn parse_p2wsh_2of3(input: &InputScripts<'_>) -> Result<ParsedSignatureScript, ParseInputError> {
    let witness = input
        .native_segwit()
        .ok_or(ParseInputError::CouldNotParseInput)?;
    Ok(ParsedSignatureScript::P2ms(parse_p2ms(
        witness,
        ParsedScriptType::P2wsh,
    )?))
}

fn parse_taproot_key_path(
    input: &InputScripts<'_>,
) -> Result<ParsedSignatureScript, ParseInputError> {
    let witness = input
        .native_segwit()
        .ok_or(ParseInputError::CouldNotParseInput)?;
    let captures = match_script(witness, TAPROOT_KEY_PATH)?;
    match captures.signatures.into_iter().next() {
        Some(SignatureSlot::Signature(signature)) => {
            Ok(ParsedSignatureScript::TaprootKeyPath { signature })
        }
        _ => Err(ParseInputError::KeyPathPlaceholder),
    }
}

fn parse_taproot_script_path(
    input: &InputScripts<'_>,
) -> Result<ParsedSignatureScript, ParseInputError> {
    let witness = input
        .native_segwit()
        .ok_or(ParseInputError::CouldNotParseInput)?;
    let captures = match_script(witness, TAPROOT_SCRIPT_PATH)?;
    let nested = single_nested(&captures)?;
    let control_block = captures
        .control_blocks
        .first()
        .ok_or(ParseInputError::ControlBlockLength(0))?;
    let script_path_level = control_block_script_path_level(control_block)?;
    let leaf_version = control_block_leaf_version(control_block)?;
    let signatures = match captures.signatures.as_slice() {
        [a, b] => [a.clone(), b.clone()],
        other => return Err(ParseInputError::InvalidSignatureCount(other.len())),
    };
    Ok(ParsedSignatureScript::TaprootScriptPath(
        ParsedSignatureScriptTaprootScriptPath {
            public_keys: xonly_pair(&nested.captures.pubkeys_xonly)?,
            signatures,
            control_block: control_block.to_vec(),
            leaf_version,
            script_path_level,
            pub_script: ScriptBuf::from_bytes(nested.bytes.to_vec()),
        },
    ))
}

fn parse_p2sh_p2pk(input: &InputScripts<'_>) -> Result<ParsedSignatureScript, ParseInputError> {
    let script = input
        .legacy()
        .ok_or(ParseInputError::CouldNotParseInput)?;
    let captures = match_script(script, P2SH_P2PK)?;
    let nested = single_nested(&captures)?;
    let public_key = match nested.captures.pubkeys.as_slice() {
        [key] => key.to_vec(),
        _ => return Err(ParseInputError::UnexpectedPubkeyCount),
    };
    let signature = captures
        .signatures
        .first()
        .cloned()
        .ok_or(ParseInputError::InvalidSignatureCount(0))?;
    Ok(ParsedSignatureScript::P2shP2pk {
        public_key,
        signature,
    })
}

type InputParser = fn(&InputScripts<'_>) -> Result<ParsedSignatureScript, ParseInputError>;

const INPUT_PARSERS: [InputParser; 6] = [
    parse_p2sh_2of3,
    parse_p2sh_p2wsh_2of3,
    parse_p2wsh_2of3,
    parse_taproot_key_path,
    parse_taproot_script_path,
    parse_p2sh_p2pk,
];

/// Parse an input's script sig and witness.
///
/// Parsers are tried in order and the first match wins. A taproot key path
/// witness with a placeholder signature and a script path witness with a
/// malformed control block are errors rather than mismatches.
pub fn parse_signature_script(
    script_sig: &Script,
    witness: &Witness,
) -> Result<ParsedSignatureScript, ParseInputError> {
    let script = decompile(script_sig).ok().filter(|e| !e.is_empty());
    let witness = Some(witness_elements(witness)).filter(|e| !e.is_empty());
    let input = InputScripts { script, witness };

    for parser in INPUT_PARSERS {
        match parser(&input) {
            Ok(parsed) => return Ok(parsed),
            Err(
                e @ (ParseInputError::KeyPathPlaceholder
                | ParseInputError::ControlBlockLength(_)
                | ParseInputError::LeafVersion),
            ) => return Err(e),
            Err(_) => continue,
        }
    }
    Err(ParseInputError::CouldNotParseInput)
}

/// Like [`parse_signature_script`] but rejects p2shP2pk inputs.
pub fn parse_signature_script_2of3(
    script_sig: &Script,
    witness: &Witness,
) -> Result<ParsedSignatureScript, ParseInputError> {
    let parsed = parse_signature_script(script_sig, witness)?;
    match parsed.script_type() {
        ParsedScriptType::P2shP2pk => Err(ParseInputError::InvalidScriptType(
            ParsedScriptType::P2shP2pk,
        )),
        _ => Ok(parsed),
    }
}

/// 0 for unsigned, 1 for half-signed and 2 for fully signed inputs.
pub fn get_strict_signature_count(
    script_sig: &Script,
    witness: &Witness,
) -> Result<u8, ParseInputError> {
    if script_sig.is_empty() && witness.is_empty() {
        return Ok(0);
    }
    let parsed = parse_signature_script(script_sig, witness)?;
    if parsed.script_type() == ParsedScriptType::TaprootKeyPathSpend {
        return Ok(2);
    }
    let count = parsed
        .signatures()
        .iter()
        .filter(|s| !s.is_placeholder())
        .count();
    match count {
        0..=2 => Ok(count as u8),
        _ => Err(ParseInputError::InvalidSignatureCount(count)),
    }
}

fn match_pub_script<'a>(
    pub_script: &'a Script,
    pattern: &'static [Pattern],
) -> Result<NestedScript<'a>, ParseInputError> {
    let elements = [Element::Push(pub_script.as_bytes())];
    let mut captures = match_script(&elements, &[Pattern::Script(pattern)])?;
    captures
        .scripts
        .pop()
        .ok_or(ParseInputError::Match(MatchError::ExpectedPush))
}

/// Parse a redeem script, witness script, tap leaf script or taproot output
/// script for a known script type.
pub fn parse_pub_script(
    pub_script: &Script,
    script_type: ParsedScriptType,
) -> Result<ParsedPubScript, ParseInputError> {
    match script_type {
        ParsedScriptType::P2shP2pk => {
            let nested = match_pub_script(pub_script, P2PK)?;
            let public_key = match nested.captures.pubkeys.as_slice() {
                [key] => key.to_vec(),
                _ => return Err(ParseInputError::UnexpectedPubkeyCount),
            };
            Ok(ParsedPubScript::P2shP2pk {
                public_key,
                pub_script: pub_script.to_owned(),
                redeem_script: pub_script.to_owned(),
            })
        }
        ParsedScriptType::TaprootKeyPathSpend => {
            let nested = match_pub_script(pub_script, TAPROOT_OUTPUT)?;
            let public_key = match nested.captures.pubkeys_xonly.as_slice() {
                [key] => (*key)
                    .try_into()
                    .map_err(|_| ParseInputError::UnexpectedPubkeyCount)?,
                _ => return Err(ParseInputError::UnexpectedPubkeyCount),
            };
            Ok(ParsedPubScript::TaprootKeyPath {
                public_key,
                pub_script: pub_script.to_owned(),
            })
        }
        ParsedScriptType::TaprootScriptPathSpend => {
            let nested = match_pub_script(pub_script, TAPROOT_LEAF)?;
            Ok(ParsedPubScript::TaprootScriptPath {
                public_keys: xonly_pair(&nested.captures.pubkeys_xonly)?,
                pub_script: pub_script.to_owned(),
            })
        }
        t if t.is_p2ms() => {
            let nested = match_pub_script(pub_script, MULTISIG_2_OF_3)?;
            Ok(ParsedPubScript::P2ms {
                script_type: t,
                public_keys: pubkey_triple(&nested.captures.pubkeys)?,
                pub_script: pub_script.to_owned(),
                redeem_script: (t == ParsedScriptType::P2sh).then(|| pub_script.to_owned()),
                witness_script: (t != ParsedScriptType::P2sh).then(|| pub_script.to_owned()),
            })
        }
        t => Err(ParseInputError::InvalidScriptType(t)),
    }
}

/// Script type of a PSBT input, judged from its metadata alone.
///
/// Redeem and witness scripts identify the p2ms variants and p2shP2pk. A tap
/// leaf script means a script path spend, a tap internal key a key path
/// spend. Metadata for more than one kind is rejected.
pub fn get_psbt_input_script_type(input: &PsbtInput) -> Result<ParsedScriptType, ParseInputError> {
    let mut script_type = match (&input.redeem_script, &input.witness_script) {
        (Some(_), Some(_)) => Some(ParsedScriptType::P2shP2wsh),
        (Some(redeem_script), None) => {
            if match_pub_script(redeem_script, P2PK).is_ok() {
                Some(ParsedScriptType::P2shP2pk)
            } else {
                Some(ParsedScriptType::P2sh)
            }
        }
        (None, Some(_)) => Some(ParsedScriptType::P2wsh),
        (None, None) => None,
    };

    if !input.tap_scripts.is_empty() {
        if let Some(found) = script_type {
            return Err(ParseInputError::ConflictingMetadata(found, "taprootScriptPath"));
        }
        if input.tap_scripts.len() > 1 {
            return Err(ParseInputError::MultipleTapLeafScripts);
        }
        script_type = Some(ParsedScriptType::TaprootScriptPathSpend);
    }
    if input.tap_internal_key.is_some() {
        if let Some(found) = script_type {
            return Err(ParseInputError::ConflictingMetadata(found, "taprootKeyPath"));
        }
        script_type = Some(ParsedScriptType::TaprootKeyPathSpend);
    }
    script_type.ok_or(ParseInputError::CouldNotParseInput)
}

/// Chain and index are the last two components of a wallet derivation path.
pub fn get_chain_and_index_from_path(path: &DerivationPath) -> Result<(u32, u32), ParseInputError> {
    let components: &[ChildNumber] = path.as_ref();
    match components {
        [.., ChildNumber::Normal { index: chain }, ChildNumber::Normal { index }] => {
            Ok((*chain, *index))
        }
        [.., _, _] => Err(ParseInputError::HardenedPath(path.to_string())),
        _ => Err(ParseInputError::InvalidPath(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;
    use crate::bitcoin::script::{Builder, PushBytesBuf};
    use crate::fixed_script_wallet::wallet_keys::tests::get_test_wallet_keys;
    use crate::fixed_script_wallet::test_utils::{p2sh_p2pk_input, wallet_input};
    use crate::fixed_script_wallet::wallet_keys::to_pub_triple;
    use crate::fixed_script_wallet::wallet_scripts::{
        build_multisig_script_2_of_3, build_p2pk_script, Chain, ScriptP2tr,
    };

    fn push(bytes: &[u8]) -> PushBytesBuf {
        PushBytesBuf::try_from(bytes.to_vec()).unwrap()
    }

    fn sig(n: u8) -> Vec<u8> {
        vec![n; 72]
    }

    fn multisig() -> ScriptBuf {
        build_multisig_script_2_of_3(&to_pub_triple(&get_test_wallet_keys("parse")))
    }

    #[test]
    fn test_parse_p2sh_half_signed() {
        let redeem = multisig();
        let script_sig = Builder::new()
            .push_int(0)
            .push_slice(push(&sig(1)))
            .push_int(0)
            .push_int(0)
            .push_slice(push(redeem.as_bytes()))
            .into_script();
        let parsed = parse_signature_script(&script_sig, &Witness::new()).unwrap();
        let ParsedSignatureScript::P2ms(p2ms) = &parsed else {
            panic!("expected p2ms, got {:?}", parsed);
        };
        assert_eq!(p2ms.script_type, ParsedScriptType::P2sh);
        assert_eq!(p2ms.redeem_script.as_ref(), Some(&redeem));
        assert!(p2ms.witness_script.is_none());
        assert_eq!(
            p2ms.signatures,
            vec![
                SignatureSlot::Signature(sig(1)),
                SignatureSlot::Placeholder,
                SignatureSlot::Placeholder
            ]
        );
        assert_eq!(
            get_strict_signature_count(&script_sig, &Witness::new()).unwrap(),
            1
        );
    }

    #[test]
    fn test_parse_p2wsh_and_wrapped_fully_signed() {
        let witness_script = multisig();
        let witness = Witness::from_slice(&[
            vec![],
            sig(1),
            sig(2),
            witness_script.to_bytes(),
        ]);

        let native = parse_signature_script(Script::new(), &witness).unwrap();
        assert_eq!(native.script_type(), ParsedScriptType::P2wsh);

        let redeem = witness_script.to_p2wsh();
        let script_sig = Builder::new().push_slice(push(redeem.as_bytes())).into_script();
        let wrapped = parse_signature_script(&script_sig, &witness).unwrap();
        let ParsedSignatureScript::P2ms(p2ms) = &wrapped else {
            panic!("expected p2ms, got {:?}", wrapped);
        };
        assert_eq!(p2ms.script_type, ParsedScriptType::P2shP2wsh);
        assert_eq!(p2ms.redeem_script.as_ref(), Some(&redeem));
        assert_eq!(p2ms.witness_script.as_ref(), Some(&witness_script));
        assert_eq!(get_strict_signature_count(&script_sig, &witness).unwrap(), 2);
    }

    #[test]
    fn test_parse_taproot_script_path() {
        let keys = to_pub_triple(&get_test_wallet_keys("parse"));
        let p2tr = ScriptP2tr::new(&keys, false).unwrap();
        for leaf in &p2tr.leaves {
            let witness = Witness::from_slice(&[
                vec![7; 64],
                vec![],
                leaf.script.to_bytes(),
                leaf.control_block.serialize(),
            ]);
            let parsed = parse_signature_script(Script::new(), &witness).unwrap();
            let ParsedSignatureScript::TaprootScriptPath(sp) = &parsed else {
                panic!("expected script path, got {:?}", parsed);
            };
            assert_eq!(
                sp.script_path_level as usize,
                leaf.control_block.merkle_branch.len()
            );
            assert_eq!(sp.leaf_version, 0xc0);
            assert_eq!(sp.pub_script, leaf.script);
            assert_eq!(sp.signatures[1], SignatureSlot::Placeholder);
            assert_eq!(get_strict_signature_count(Script::new(), &witness).unwrap(), 1);
        }
    }

    #[test]
    fn test_parse_taproot_key_path() {
        let witness = Witness::from_slice(&[vec![9; 64]]);
        let parsed = parse_signature_script(Script::new(), &witness).unwrap();
        assert_eq!(
            parsed,
            ParsedSignatureScript::TaprootKeyPath {
                signature: vec![9; 64]
            }
        );
        assert_eq!(get_strict_signature_count(Script::new(), &witness).unwrap(), 2);

        let placeholder = Witness::from_slice(&[Vec::<u8>::new()]);
        assert_eq!(
            parse_signature_script(Script::new(), &placeholder),
            Err(ParseInputError::KeyPathPlaceholder)
        );
    }

    #[test]
    fn test_parse_p2sh_p2pk() {
        let keys = to_pub_triple(&get_test_wallet_keys("parse"));
        let redeem = build_p2pk_script(keys[2]);
        let script_sig = Builder::new()
            .push_slice(push(&sig(3)))
            .push_slice(push(redeem.as_bytes()))
            .into_script();
        let parsed = parse_signature_script(&script_sig, &Witness::new()).unwrap();
        assert_eq!(
            parsed,
            ParsedSignatureScript::P2shP2pk {
                public_key: keys[2].to_bytes().to_vec(),
                signature: SignatureSlot::Signature(sig(3)),
            }
        );
        assert_eq!(
            parse_signature_script_2of3(&script_sig, &Witness::new()).unwrap_err(),
            ParseInputError::InvalidScriptType(ParsedScriptType::P2shP2pk)
        );
    }

    #[test]
    fn test_unparseable_inputs() {
        assert_eq!(get_strict_signature_count(Script::new(), &Witness::new()), Ok(0));
        let witness = Witness::from_slice(&[vec![1; 10], vec![2; 10]]);
        assert_eq!(
            parse_signature_script(Script::new(), &witness)
                .unwrap_err()
                .to_string(),
            "could not parse input"
        );
    }

    #[rstest]
    #[case::too_long(129)]
    #[case::no_merkle_path(33)]
    fn test_parse_taproot_script_path_control_block_length(#[case] len: usize) {
        let keys = to_pub_triple(&get_test_wallet_keys("parse"));
        let p2tr = ScriptP2tr::new(&keys, false).unwrap();
        let leaf = &p2tr.leaves[0];
        let mut control_block = leaf.control_block.serialize();
        control_block.resize(len, 0);
        let witness = Witness::from_slice(&[
            vec![7; 64],
            vec![8; 64],
            leaf.script.to_bytes(),
            control_block,
        ]);
        assert_eq!(
            parse_signature_script(Script::new(), &witness),
            Err(ParseInputError::ControlBlockLength(len))
        );
        assert_eq!(
            get_strict_signature_count(Script::new(), &witness),
            Err(ParseInputError::ControlBlockLength(len))
        );
    }

    #[rstest]
    #[case(65, Ok(1))]
    #[case(97, Ok(2))]
    #[case(33, Err(ParseInputError::ControlBlockLength(33)))]
    #[case(129, Err(ParseInputError::ControlBlockLength(129)))]
    fn test_control_block_script_path_level(
        #[case] len: usize,
        #[case] expected: Result<u8, ParseInputError>,
    ) {
        assert_eq!(control_block_script_path_level(&vec![0xc1; len]), expected);
    }

    #[test]
    fn test_leaf_version() {
        assert_eq!(control_block_leaf_version(&[0xc1, 0x00]), Ok(0xc0));
        assert_eq!(control_block_leaf_version(&[]), Err(ParseInputError::LeafVersion));
    }

    #[test]
    fn test_parse_pub_scripts() {
        let keys = to_pub_triple(&get_test_wallet_keys("pub"));
        let ms = build_multisig_script_2_of_3(&keys);
        match parse_pub_script(&ms, ParsedScriptType::P2wsh).unwrap() {
            ParsedPubScript::P2ms {
                public_keys,
                redeem_script,
                witness_script,
                ..
            } => {
                assert_eq!(public_keys[1], keys[1].to_bytes().to_vec());
                assert!(redeem_script.is_none());
                assert_eq!(witness_script, Some(ms.clone()));
            }
            other => panic!("unexpected {:?}", other),
        }

        let p2tr = ScriptP2tr::new(&keys, true).unwrap();
        match parse_pub_script(&p2tr.output_script(), ParsedScriptType::TaprootKeyPathSpend)
            .unwrap()
        {
            ParsedPubScript::TaprootKeyPath { public_key, .. } => {
                assert_eq!(public_key, p2tr.output_key().serialize())
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            parse_pub_script(&p2tr.leaves[0].script, ParsedScriptType::TaprootScriptPathSpend),
            Ok(ParsedPubScript::TaprootScriptPath { .. })
        ));
        assert!(matches!(
            parse_pub_script(&build_p2pk_script(keys[0]), ParsedScriptType::P2shP2pk),
            Ok(ParsedPubScript::P2shP2pk { .. })
        ));
        assert!(parse_pub_script(&ms, ParsedScriptType::TaprootScriptPathSpend).is_err());
    }

    fn multisig_with(quorum: i64, keys: &[&[u8]], total: i64) -> ScriptBuf {
        keys.iter()
            .fold(Builder::new().push_int(quorum), |b, key| b.push_slice(push(key)))
            .push_int(total)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script()
    }

    #[rstest]
    #[case::wrong_quorum(multisig_with(1, &[&[2; 33], &[2; 33], &[3; 33]], 3))]
    #[case::wrong_total(multisig_with(2, &[&[2; 33], &[2; 33], &[3; 33]], 4))]
    #[case::two_keys(multisig_with(2, &[&[2; 33], &[3; 33]], 3))]
    #[case::short_key(multisig_with(2, &[&[0; 10], &[2; 33], &[3; 33]], 3))]
    #[case::xonly_key(multisig_with(2, &[&[2; 32], &[2; 33], &[3; 33]], 3))]
    #[case::trailing_op(ScriptBuf::from_bytes([multisig().to_bytes(), vec![0x51]].concat()))]
    fn test_parse_pub_script_rejects_malformed_multisig(#[case] script: ScriptBuf) {
        for script_type in [
            ParsedScriptType::P2sh,
            ParsedScriptType::P2shP2wsh,
            ParsedScriptType::P2wsh,
        ] {
            assert!(
                parse_pub_script(&script, script_type).is_err(),
                "accepted {} as {}",
                script,
                script_type
            );
        }
    }

    #[test]
    fn test_to_script_type_2of3s() {
        assert_eq!(
            to_script_type_2of3s(ParsedScriptType::TaprootScriptPathSpend).unwrap(),
            vec![ScriptType2Of3::P2trMusig2, ScriptType2Of3::P2tr]
        );
        assert_eq!(
            to_script_type_2of3s(ParsedScriptType::TaprootKeyPathSpend).unwrap(),
            vec![ScriptType2Of3::P2trMusig2]
        );
        assert_eq!(
            to_script_type_2of3s(ParsedScriptType::P2shP2wsh).unwrap(),
            vec![ScriptType2Of3::P2shP2wsh]
        );
        assert!(to_script_type_2of3s(ParsedScriptType::P2shP2pk).is_err());
    }

    #[rstest]
    #[case("m/0/0/20/5", Ok((20, 5)))]
    #[case("m/45'/0/0/41/1000", Ok((41, 1000)))]
    #[case("m/0/1", Ok((0, 1)))]
    #[case("m/7", Err(ParseInputError::InvalidPath("m/7".to_string())))]
    #[case("m/0/0/1'/2", Err(ParseInputError::HardenedPath("m/0/0/1'/2".to_string())))]
    fn test_get_chain_and_index_from_path(
        #[case] path: &str,
        #[case] expected: Result<(u32, u32), ParseInputError>,
    ) {
        let path = DerivationPath::from_str(path).unwrap();
        assert_eq!(get_chain_and_index_from_path(&path), expected);
    }

    #[test]
    fn test_parsed_script_type_serde() {
        assert_eq!(
            serde_json::to_string(&ParsedScriptType::TaprootKeyPathSpend).unwrap(),
            "\"taprootKeyPathSpend\""
        );
    }

    #[rstest]
    #[case::p2sh(Chain::P2shExternal, ParsedScriptType::P2sh)]
    #[case::p2sh_p2wsh(Chain::P2shP2wshInternal, ParsedScriptType::P2shP2wsh)]
    #[case::p2wsh(Chain::P2wshExternal, ParsedScriptType::P2wsh)]
    #[case::p2tr(Chain::P2trInternal, ParsedScriptType::TaprootScriptPathSpend)]
    #[case::p2tr_musig2(Chain::P2trMusig2External, ParsedScriptType::TaprootKeyPathSpend)]
    fn test_psbt_input_script_type(#[case] chain: Chain, #[case] expected: ParsedScriptType) {
        let xpubs = get_test_wallet_keys("input type");
        let (_, input) = wallet_input(&xpubs, chain, 0, 1_000);
        assert_eq!(get_psbt_input_script_type(&input).unwrap(), expected);
    }

    #[test]
    fn test_psbt_input_script_type_p2sh_p2pk() {
        let key = to_pub_triple(&get_test_wallet_keys("replay"))[0];
        let (_, input) = p2sh_p2pk_input(key, 1_000);
        assert_eq!(
            get_psbt_input_script_type(&input).unwrap(),
            ParsedScriptType::P2shP2pk
        );
    }

    #[test]
    fn test_psbt_input_script_type_rejects_mixed_metadata() {
        let xpubs = get_test_wallet_keys("input type");
        let (_, p2wsh) = wallet_input(&xpubs, Chain::P2wshExternal, 0, 1_000);
        let (_, p2tr) = wallet_input(&xpubs, Chain::P2trExternal, 0, 1_000);
        let (_, musig2) = wallet_input(&xpubs, Chain::P2trMusig2External, 0, 1_000);

        let mut mixed = p2wsh;
        mixed.tap_internal_key = musig2.tap_internal_key;
        assert_eq!(
            get_psbt_input_script_type(&mixed),
            Err(ParseInputError::ConflictingMetadata(
                ParsedScriptType::P2wsh,
                "taprootKeyPath"
            ))
        );

        let mut both_paths = p2tr.clone();
        both_paths.tap_internal_key = musig2.tap_internal_key;
        assert_eq!(
            get_psbt_input_script_type(&both_paths),
            Err(ParseInputError::ConflictingMetadata(
                ParsedScriptType::TaprootScriptPathSpend,
                "taprootKeyPath"
            ))
        );

        let (_, other_leaf) = wallet_input(&xpubs, Chain::P2trExternal, 1, 1_000);
        let mut two_leaves = p2tr;
        two_leaves.tap_scripts.extend(other_leaf.tap_scripts);
        assert_eq!(
            get_psbt_input_script_type(&two_leaves),
            Err(ParseInputError::MultipleTapLeafScripts)
        );

        assert_eq!(
            get_psbt_input_script_type(&PsbtInput::default()),
            Err(ParseInputError::CouldNotParseInput)
        );
    }
}
