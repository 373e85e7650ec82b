//! MuSig2 state of a p2trMusig2 key path input.
//!
//! The protocol state is kept in BitGo proprietary records on the PSBT input:
//!
//! | record            | key                                  | value                         |
//! |-------------------|--------------------------------------|-------------------------------|
//! | participants      | `<tapOutputKey><tapInternalKey>`     | `<userKey><bitgoKey>`         |
//! | public nonce      | `<participantKey><tapOutputKey>`     | `<pubNonce>` (66 bytes)       |
//! | partial signature | `<participantKey><tapOutputKey>`     | `<sig>` (32 bytes, 33 with a non-default sighash byte) |
//!
//! [`Musig2Context`] drives one input through the states of
//! [`Musig2InputState`].

use miniscript::bitcoin::hashes::Hash;
use miniscript::bitcoin::{psbt::Input, secp256k1, Psbt};
use musig2::{PartialSignature, PubNonce};
use thiserror::Error;
use tracing::{debug, trace};

use crate::bitcoin::bip32::{Xpriv, Xpub};
use crate::bitcoin::secp256k1::{SecretKey, XOnlyPublicKey};
use crate::bitcoin::sighash::{Prevouts, SighashCache, TapSighash, TapSighashType};
use crate::bitcoin::{CompressedPublicKey, TxOut};
use crate::bitgo_psbt::musig2_session::{
    aggregate_internal_key, aggregate_nonce, aggregate_sigs, deterministic_nonce,
    deterministic_sign, output_key, partial_sign, partial_verify, start_session, verify_schnorr,
    Musig2SessionKey,
};
use crate::bitgo_psbt::nonce_store::{Musig2NonceStore, NonceHandle};
use crate::bitgo_psbt::propkv::{find_kv, is_musig2_key, BitGoKeyValue, ProprietaryKeySubtype};
use crate::bitgo_psbt::get_input_prevout;
use crate::bitgo_psbt::sighash::default_sighash_types;
use crate::networks::Network;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Musig2Error {
    #[error("Invalid identifier, expected BITGO")]
    InvalidIdentifier,
    #[error("Unknown BitGo proprietary key subtype: {0}")]
    UnknownSubtype(u8),
    #[error("Invalid subtype: expected {expected}, got {got}")]
    InvalidSubtype { expected: u8, got: u8 },
    #[error("Invalid keydata length: expected {expected}, got {got}")]
    InvalidKeydataLength { expected: usize, got: usize },
    #[error("Invalid value length: expected {expected}, got {got}")]
    InvalidValueLength { expected: &'static str, got: usize },
    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("Invalid {field} size: expected {expected}, got {got}")]
    InvalidSize {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Invalid sessionId size {0}")]
    InvalidSessionIdSize(usize),
    #[error("Invalid partial signature sighash byte {0}")]
    InvalidSighashByte(u8),
    #[error("Duplicate participant public keys found")]
    DuplicateParticipantKeys,
    #[error("Duplicate nonce participant public keys found")]
    DuplicateNonceKeys,
    #[error("Too many key-values: expected up to {expected}, got {got}")]
    TooManyKeyValues { expected: usize, got: usize },
    #[error("Found {got} matching participant key value instead of 1")]
    ParticipantCount { got: usize },
    #[error("Found {got} matching nonce key value instead of 2")]
    NonceCount { got: usize },
    #[error("tapInternalKey and aggregated participant pub keys does not match")]
    InternalKeyMismatch,
    #[error("tapOutputKey and tweaked tapInternalKey does not match")]
    OutputKeyMismatch,
    #[error("nonce tapOutputKey does not match participants tapOutputKey")]
    NonceOutputKeyMismatch,
    #[error("Nonce participant pub key {0} is not a participant")]
    UnknownParticipant(String),
    #[error("inconsistent sighash type")]
    InconsistentSighashType,
    #[error("Sighash type is not allowed. Retry the sign method passing the sighashTypes array of whitelisted types. Sighash type: {0}")]
    SighashNotAllowed(u32),
    #[error("both tapInternalKey and tapMerkleRoot are required")]
    MissingTaprootData,
    #[error("tapInternalKey is required to create nonce")]
    MissingInternalKeyForNonce,
    #[error("tapMerkleRoot is required to create nonce")]
    MissingMerkleRootForNonce,
    #[error("not a taproot musig2 input")]
    NotMusig2Input,
    #[error("missing required input data")]
    MissingInputData,
    #[error("no tap key origin matches the signer key")]
    NoMatchingDerivation,
    #[error("participant plain pub key should match one bip32Derivation plain pub key")]
    ParticipantKeyNotDerived,
    #[error("signer pub key should match one of participant pub keys")]
    SignerNotParticipant,
    #[error("can only add a deterministic signature on the cosigner")]
    DeterministicSignerNotCosigner,
    #[error("Only the cosigner's nonce can be set deterministically")]
    DeterministicNonceNotCosigner,
    #[error("could not find the user nonce")]
    MissingUserNonce,
    #[error("signer nonce must be set if cosigner nonce is to be derived deterministically")]
    MissingSignerNonceForDeterministic,
    #[error("No nonces found on input #{0}")]
    NoNonces(usize),
    #[error("pubNonce is missing. retry signing process")]
    MissingSignerNonce,
    #[error("unknown nonce handle {0}")]
    UnknownNonceHandle(usize),
    #[error("nonce handle {0} was already used")]
    NonceConsumed(usize),
    #[error("No signatures to validate")]
    NoSignatures,
    #[error("No signatures for this pubkey")]
    NoSignaturesForPubkey,
    #[error("Found no pub nonce for pubkey")]
    MissingPubNonce,
    #[error("invalid number of partial signatures {0} to finalize")]
    PartialSigCount(usize),
    #[error("Input index {index} out of range ({len} inputs)")]
    InputIndexOutOfRange { index: usize, len: usize },
    #[error("Missing UTXO data for input {0}")]
    MissingUtxo(usize),
    #[error("Failed to compute sighash: {0}")]
    Sighash(String),
    #[error("Key aggregation failed: {0}")]
    KeyAggregation(String),
    #[error("Key derivation failed: {0}")]
    Derivation(String),
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error("Signature aggregation error: {0}")]
    SignatureAggregation(String),
    #[error("Finalization failed: {0}")]
    Finalization(String),
}

fn invalid_field(field: &'static str) -> impl Fn(secp256k1::Error) -> Musig2Error {
    move |e| Musig2Error::InvalidField {
        field,
        reason: e.to_string(),
    }
}

fn parse_xonly(bytes: &[u8], field: &'static str) -> Result<XOnlyPublicKey, Musig2Error> {
    XOnlyPublicKey::from_slice(bytes).map_err(invalid_field(field))
}

fn parse_compressed(bytes: &[u8], field: &'static str) -> Result<CompressedPublicKey, Musig2Error> {
    CompressedPublicKey::from_slice(bytes).map_err(|e| Musig2Error::InvalidField {
        field,
        reason: e.to_string(),
    })
}

fn assert_keydata_length(kv: &BitGoKeyValue, expected: usize) -> Result<(), Musig2Error> {
    if kv.key.len() != expected {
        return Err(Musig2Error::InvalidKeydataLength {
            expected,
            got: kv.key.len(),
        });
    }
    Ok(())
}

/// Maps `<tapOutputKey><tapInternalKey>` to `<participantKey1><participantKey2>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Musig2Participants {
    pub tap_output_key: XOnlyPublicKey,
    pub tap_internal_key: XOnlyPublicKey,
    pub participant_pub_keys: [CompressedPublicKey; 2],
}

/// Maps `<participantPubKey><tapOutputKey>` to `<pubNonce>`.
#[derive(Debug, Clone)]
pub struct Musig2PubNonce {
    pub participant_pub_key: CompressedPublicKey,
    pub tap_output_key: XOnlyPublicKey,
    pub pub_nonce: PubNonce,
}

impl PartialEq for Musig2PubNonce {
    fn eq(&self, other: &Self) -> bool {
        self.participant_pub_key == other.participant_pub_key
            && self.tap_output_key == other.tap_output_key
            && self.pub_nonce.serialize() == other.pub_nonce.serialize()
    }
}

impl Eq for Musig2PubNonce {}

/// Maps `<participantPubKey><tapOutputKey>` to `<partialSig>`.
///
/// `sighash_type` is 0 (`SIGHASH_DEFAULT`) for 32-byte values; any other type
/// is stored as a 33rd byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Musig2PartialSig {
    pub participant_pub_key: CompressedPublicKey,
    pub tap_output_key: XOnlyPublicKey,
    pub partial_sig: PartialSignature,
    pub sighash_type: u8,
}

fn participant_key_field(participant: &CompressedPublicKey, tap_output_key: &XOnlyPublicKey) -> Vec<u8> {
    let mut key = Vec::with_capacity(65);
    key.extend_from_slice(&participant.to_bytes());
    key.extend_from_slice(&tap_output_key.serialize());
    key
}

fn parse_participant_key_field(
    kv: &BitGoKeyValue,
) -> Result<(CompressedPublicKey, XOnlyPublicKey), Musig2Error> {
    assert_keydata_length(kv, 65)?;
    Ok((
        parse_compressed(&kv.key[..33], "participant pub key")?,
        parse_xonly(&kv.key[33..], "tap output key")?,
    ))
}

impl Musig2Participants {
    pub fn to_key_value(&self) -> BitGoKeyValue {
        let mut key = Vec::with_capacity(64);
        key.extend_from_slice(&self.tap_output_key.serialize());
        key.extend_from_slice(&self.tap_internal_key.serialize());

        let mut value = Vec::with_capacity(66);
        value.extend_from_slice(&self.participant_pub_keys[0].to_bytes());
        value.extend_from_slice(&self.participant_pub_keys[1].to_bytes());

        BitGoKeyValue::new(ProprietaryKeySubtype::Musig2ParticipantPubKeys, key, value)
    }

    pub fn from_key_value(kv: &BitGoKeyValue) -> Result<Self, Musig2Error> {
        kv.expect_subtype(ProprietaryKeySubtype::Musig2ParticipantPubKeys)?;
        assert_keydata_length(kv, 64)?;
        if kv.value.len() != 66 {
            return Err(Musig2Error::InvalidValueLength {
                expected: "66",
                got: kv.value.len(),
            });
        }

        let participants = Self {
            tap_output_key: parse_xonly(&kv.key[..32], "tap output key")?,
            tap_internal_key: parse_xonly(&kv.key[32..], "tap internal key")?,
            participant_pub_keys: [
                parse_compressed(&kv.value[..33], "participant pub key")?,
                parse_compressed(&kv.value[33..], "participant pub key")?,
            ],
        };
        if participants.participant_pub_keys[0] == participants.participant_pub_keys[1] {
            return Err(Musig2Error::DuplicateParticipantKeys);
        }
        Ok(participants)
    }

    pub fn contains(&self, pubkey: &CompressedPublicKey) -> bool {
        self.participant_pub_keys.contains(pubkey)
    }
}

impl Musig2PubNonce {
    pub fn to_key_value(&self) -> BitGoKeyValue {
        BitGoKeyValue::new(
            ProprietaryKeySubtype::Musig2PubNonce,
            participant_key_field(&self.participant_pub_key, &self.tap_output_key),
            self.pub_nonce.serialize().to_vec(),
        )
    }

    pub fn from_key_value(kv: &BitGoKeyValue) -> Result<Self, Musig2Error> {
        kv.expect_subtype(ProprietaryKeySubtype::Musig2PubNonce)?;
        let (participant_pub_key, tap_output_key) = parse_participant_key_field(kv)?;
        if kv.value.len() != 66 {
            return Err(Musig2Error::InvalidValueLength {
                expected: "66",
                got: kv.value.len(),
            });
        }
        let pub_nonce = PubNonce::try_from(&kv.value[..]).map_err(|e| Musig2Error::InvalidField {
            field: "public nonce",
            reason: e.to_string(),
        })?;
        Ok(Self {
            participant_pub_key,
            tap_output_key,
            pub_nonce,
        })
    }
}

impl Musig2PartialSig {
    pub fn to_key_value(&self) -> BitGoKeyValue {
        let mut value = self.partial_sig.serialize().to_vec();
        if self.sighash_type != TapSighashType::Default as u8 {
            value.push(self.sighash_type);
        }
        BitGoKeyValue::new(
            ProprietaryKeySubtype::Musig2PartialSig,
            participant_key_field(&self.participant_pub_key, &self.tap_output_key),
            value,
        )
    }

    pub fn from_key_value(kv: &BitGoKeyValue) -> Result<Self, Musig2Error> {
        kv.expect_subtype(ProprietaryKeySubtype::Musig2PartialSig)?;
        let (participant_pub_key, tap_output_key) = parse_participant_key_field(kv)?;
        let sighash_type = match kv.value.len() {
            32 => TapSighashType::Default as u8,
            33 => match kv.value[32] {
                0 => return Err(Musig2Error::InvalidSighashByte(0)),
                byte => byte,
            },
            got => {
                return Err(Musig2Error::InvalidValueLength {
                    expected: "32 or 33",
                    got,
                })
            }
        };
        let partial_sig = PartialSignature::from_slice(&kv.value[..32]).map_err(|e| {
            Musig2Error::InvalidField {
                field: "partial signature",
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            participant_pub_key,
            tap_output_key,
            partial_sig,
            sighash_type,
        })
    }
}

fn parse_records<T>(
    input: &Input,
    subtype: ProprietaryKeySubtype,
    max: usize,
    parse: impl Fn(&BitGoKeyValue) -> Result<T, Musig2Error>,
) -> Result<Vec<T>, Musig2Error> {
    let kvs: Vec<_> = find_kv(subtype, &input.proprietary).collect();
    if kvs.len() > max {
        return Err(Musig2Error::TooManyKeyValues {
            expected: max,
            got: kvs.len(),
        });
    }
    kvs.iter().map(parse).collect()
}

/// Returns `None` if the input has no participants record.
pub fn parse_musig2_participants(input: &Input) -> Result<Option<Musig2Participants>, Musig2Error> {
    let mut participants = parse_records(
        input,
        ProprietaryKeySubtype::Musig2ParticipantPubKeys,
        1,
        Musig2Participants::from_key_value,
    )?;
    Ok(participants.pop())
}

pub fn parse_musig2_nonces(input: &Input) -> Result<Vec<Musig2PubNonce>, Musig2Error> {
    parse_records(
        input,
        ProprietaryKeySubtype::Musig2PubNonce,
        2,
        Musig2PubNonce::from_key_value,
    )
}

pub fn parse_musig2_partial_sigs(input: &Input) -> Result<Vec<Musig2PartialSig>, Musig2Error> {
    parse_records(
        input,
        ProprietaryKeySubtype::Musig2PartialSig,
        2,
        Musig2PartialSig::from_key_value,
    )
}

/// Cross-check the participants record against the input's taproot data.
///
/// The stored internal key must equal the BIP327 aggregate of the participant
/// keys, and the stored output key must equal the internal key tweaked with
/// `merkle_root`.
pub fn assert_participants(
    participants: &Musig2Participants,
    tap_internal_key: &XOnlyPublicKey,
    merkle_root: &[u8],
) -> Result<(), Musig2Error> {
    if participants.participant_pub_keys[0] == participants.participant_pub_keys[1] {
        return Err(Musig2Error::DuplicateParticipantKeys);
    }
    if participants.tap_internal_key != *tap_internal_key {
        return Err(Musig2Error::InternalKeyMismatch);
    }
    if aggregate_internal_key(&participants.participant_pub_keys)? != *tap_internal_key {
        return Err(Musig2Error::InternalKeyMismatch);
    }
    if output_key(tap_internal_key, merkle_root)? != participants.tap_output_key {
        return Err(Musig2Error::OutputKeyMismatch);
    }
    Ok(())
}

pub fn assert_nonces(
    participants: &Musig2Participants,
    nonces: &[Musig2PubNonce],
) -> Result<(), Musig2Error> {
    if participants.participant_pub_keys[0] == participants.participant_pub_keys[1] {
        return Err(Musig2Error::DuplicateParticipantKeys);
    }
    for nonce in nonces {
        if nonce.tap_output_key != participants.tap_output_key {
            return Err(Musig2Error::NonceOutputKeyMismatch);
        }
        if !participants.contains(&nonce.participant_pub_key) {
            return Err(Musig2Error::UnknownParticipant(
                nonce.participant_pub_key.to_string(),
            ));
        }
    }
    if let [a, b] = nonces {
        if a.participant_pub_key == b.participant_pub_key {
            return Err(Musig2Error::DuplicateNonceKeys);
        }
    }
    Ok(())
}

/// The sighash type shared by all partial signatures. An empty list yields
/// `SIGHASH_DEFAULT`.
pub fn get_sighash_type_from_sigs(partial_sigs: &[Musig2PartialSig]) -> Result<u8, Musig2Error> {
    let Some(first) = partial_sigs.first() else {
        return Ok(TapSighashType::Default as u8);
    };
    if partial_sigs
        .iter()
        .any(|sig| sig.sighash_type != first.sighash_type)
    {
        return Err(Musig2Error::InconsistentSighashType);
    }
    Ok(first.sighash_type)
}

/// Collect the spent outputs of all inputs, needed for taproot sighashes.
pub(crate) fn collect_prevouts(psbt: &Psbt) -> Result<Vec<TxOut>, Musig2Error> {
    (0..psbt.inputs.len())
        .map(|i| get_input_prevout(psbt, i).ok_or(Musig2Error::MissingUtxo(i)))
        .collect()
}

/// A taproot input that can only be spent with the key path.
pub fn is_taproot_key_path_input(input: &Input) -> bool {
    input.tap_internal_key.is_some()
        && input.tap_merkle_root.is_some()
        && input.tap_scripts.is_empty()
        && input.tap_script_sigs.is_empty()
        && input
            .tap_key_origins
            .values()
            .all(|(leaf_hashes, _)| leaf_hashes.is_empty())
}

/// Find the tap key origin that belongs to `xpriv` and derive the input key.
pub fn derive_xpriv_for_input_tap(xpriv: &Xpriv, input: &Input) -> Result<Xpriv, Musig2Error> {
    let secp = secp256k1::Secp256k1::new();
    let fingerprint = xpriv.fingerprint(&secp);
    for (xonly, (_leaf_hashes, (origin_fingerprint, path))) in &input.tap_key_origins {
        if *origin_fingerprint != fingerprint {
            continue;
        }
        let derived = xpriv
            .derive_priv(&secp, path)
            .map_err(|e| Musig2Error::Derivation(e.to_string()))?;
        if derived.private_key.x_only_public_key(&secp).0 == *xonly {
            return Ok(derived);
        }
    }
    Err(Musig2Error::NoMatchingDerivation)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Musig2InputState {
    NoNonces,
    OneNonce,
    TwoNonces,
    OnePartialSig,
    TwoPartialSigs,
    Finalized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Musig2SignOptions {
    /// Accepted values of the input's sighash type
    pub sighash_types: Vec<u8>,
    /// Cosigner only: derive the nonce from the other participant's nonce
    pub deterministic: bool,
}

impl Default for Musig2SignOptions {
    fn default() -> Self {
        Musig2SignOptions {
            sighash_types: vec![TapSighashType::Default as u8, TapSighashType::All as u8],
            deterministic: false,
        }
    }
}

impl Musig2SignOptions {
    pub fn for_network(network: Network) -> Self {
        Musig2SignOptions {
            sighash_types: default_sighash_types(network),
            deterministic: false,
        }
    }

    pub fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Musig2Input {
    pub participants: Musig2Participants,
    pub nonces: Vec<Musig2PubNonce>,
    pub partial_sigs: Vec<Musig2PartialSig>,
}

impl Musig2Input {
    /// Whether the input carries any MuSig2 record.
    pub fn is_musig2_input(input: &Input) -> bool {
        input.proprietary.keys().any(is_musig2_key)
    }

    pub fn from_input(input: &Input) -> Result<Self, Musig2Error> {
        let participants =
            parse_musig2_participants(input)?.ok_or(Musig2Error::ParticipantCount { got: 0 })?;
        Ok(Self {
            participants,
            nonces: parse_musig2_nonces(input)?,
            partial_sigs: parse_musig2_partial_sigs(input)?,
        })
    }

    pub fn nonce_for(&self, participant: &CompressedPublicKey) -> Option<&Musig2PubNonce> {
        self.nonces
            .iter()
            .find(|n| n.participant_pub_key == *participant)
    }

    /// Aggregate the two partial signatures into `tap_key_sig`, drop the
    /// MuSig2 records and finalize the input with miniscript.
    pub fn finalize_input<C: secp256k1::Verification>(
        psbt: &mut Psbt,
        secp: &secp256k1::Secp256k1<C>,
        input_index: usize,
    ) -> Result<(), Musig2Error> {
        Musig2Context::new(psbt, input_index)?.finalize(secp)
    }
}

struct SignerKey {
    secret_key: SecretKey,
    pub_key: CompressedPublicKey,
}

/// Mutable view of one MuSig2 input of a PSBT.
pub struct Musig2Context<'a> {
    psbt: &'a mut Psbt,
    input_index: usize,
}

impl<'a> Musig2Context<'a> {
    pub fn new(psbt: &'a mut Psbt, input_index: usize) -> Result<Self, Musig2Error> {
        if input_index >= psbt.inputs.len() {
            return Err(Musig2Error::InputIndexOutOfRange {
                index: input_index,
                len: psbt.inputs.len(),
            });
        }
        Ok(Musig2Context { psbt, input_index })
    }

    pub fn input_index(&self) -> usize {
        self.input_index
    }

    fn input(&self) -> &Input {
        &self.psbt.inputs[self.input_index]
    }

    fn input_mut(&mut self) -> &mut Input {
        &mut self.psbt.inputs[self.input_index]
    }

    pub fn musig2_input(&self) -> Result<Musig2Input, Musig2Error> {
        Musig2Input::from_input(self.input())
    }

    pub fn state(&self) -> Result<Musig2InputState, Musig2Error> {
        let input = self.input();
        if input.final_script_witness.is_some() {
            return Ok(Musig2InputState::Finalized);
        }
        let nonces = parse_musig2_nonces(input)?.len();
        let sigs = parse_musig2_partial_sigs(input)?.len();
        Ok(match (nonces, sigs) {
            (_, 2) => Musig2InputState::TwoPartialSigs,
            (_, 1) => Musig2InputState::OnePartialSig,
            (0, _) => Musig2InputState::NoNonces,
            (1, _) => Musig2InputState::OneNonce,
            _ => Musig2InputState::TwoNonces,
        })
    }

    fn taproot_data(&self) -> Result<(XOnlyPublicKey, [u8; 32]), Musig2Error> {
        let input = self.input();
        match (input.tap_internal_key, input.tap_merkle_root) {
            (Some(internal_key), Some(root)) => Ok((internal_key, root.to_byte_array())),
            _ => Err(Musig2Error::MissingTaprootData),
        }
    }

    /// Key path sighash for the input's sighash type, which must be one of
    /// `sighash_types`.
    pub fn sighash(&self, sighash_types: &[u8]) -> Result<(TapSighash, TapSighashType), Musig2Error> {
        let sighash_type = self
            .input()
            .sighash_type
            .map(|t| t.to_u32())
            .unwrap_or(TapSighashType::Default as u32);
        let allowed = u8::try_from(sighash_type)
            .map(|t| sighash_types.contains(&t))
            .unwrap_or(false);
        if !allowed {
            return Err(Musig2Error::SighashNotAllowed(sighash_type));
        }
        let sighash_type = TapSighashType::from_consensus_u8(sighash_type as u8)
            .map_err(|_| Musig2Error::SighashNotAllowed(sighash_type))?;

        let prevouts = collect_prevouts(&*self.psbt)?;
        let sighash = SighashCache::new(&self.psbt.unsigned_tx)
            .taproot_key_spend_signature_hash(
                self.input_index,
                &Prevouts::All(&prevouts),
                sighash_type,
            )
            .map_err(|e| Musig2Error::Sighash(e.to_string()))?;
        Ok((sighash, sighash_type))
    }

    /// Signing session from the two nonces stored on the input.
    pub fn session(
        &self,
        sighash_types: &[u8],
    ) -> Result<(Musig2SessionKey, Musig2Input, TapSighashType), Musig2Error> {
        let (internal_key, merkle_root) = self.taproot_data()?;
        let musig2_input = self.musig2_input()?;
        assert_participants(&musig2_input.participants, &internal_key, &merkle_root)?;
        let [first, second] = musig2_input.nonces.as_slice() else {
            return Err(Musig2Error::NonceCount {
                got: musig2_input.nonces.len(),
            });
        };
        assert_nonces(&musig2_input.participants, &musig2_input.nonces)?;

        let (sighash, sighash_type) = self.sighash(sighash_types)?;
        let agg_nonce = aggregate_nonce(&[first.pub_nonce.clone(), second.pub_nonce.clone()]);
        let session = start_session(
            agg_nonce,
            sighash.as_byte_array(),
            &musig2_input.participants.participant_pub_keys,
            &merkle_root,
        )?;
        Ok((session, musig2_input, sighash_type))
    }

    /// Store `pub_nonce` for `participant_pub_key`, replacing an earlier nonce
    /// of the same participant.
    pub fn set_nonce(
        &mut self,
        participant_pub_key: CompressedPublicKey,
        pub_nonce: PubNonce,
    ) -> Result<(), Musig2Error> {
        let participants = self.musig2_input()?.participants;
        if !participants.contains(&participant_pub_key) {
            return Err(Musig2Error::SignerNotParticipant);
        }
        let record = Musig2PubNonce {
            participant_pub_key,
            tap_output_key: participants.tap_output_key,
            pub_nonce,
        };
        self.replace_record(
            ProprietaryKeySubtype::Musig2PubNonce,
            &participant_pub_key,
            record.to_key_value(),
        );
        debug!(input = self.input_index, participant = %participant_pub_key, "set musig2 nonce");
        Ok(())
    }

    pub fn set_partial_signature(
        &mut self,
        participant_pub_key: CompressedPublicKey,
        partial_sig: PartialSignature,
        sighash_type: TapSighashType,
    ) -> Result<(), Musig2Error> {
        let participants = self.musig2_input()?.participants;
        if !participants.contains(&participant_pub_key) {
            return Err(Musig2Error::SignerNotParticipant);
        }
        let record = Musig2PartialSig {
            participant_pub_key,
            tap_output_key: participants.tap_output_key,
            partial_sig,
            sighash_type: sighash_type as u8,
        };
        self.replace_record(
            ProprietaryKeySubtype::Musig2PartialSig,
            &participant_pub_key,
            record.to_key_value(),
        );
        debug!(
            input = self.input_index,
            participant = %participant_pub_key,
            "set musig2 partial signature"
        );
        Ok(())
    }

    fn replace_record(
        &mut self,
        subtype: ProprietaryKeySubtype,
        participant_pub_key: &CompressedPublicKey,
        kv: BitGoKeyValue,
    ) {
        let participant_bytes = participant_pub_key.to_bytes();
        let proprietary = &mut self.input_mut().proprietary;
        proprietary.retain(|key, _| {
            !(is_musig2_key(key)
                && key.subtype == subtype as u8
                && key.key.starts_with(&participant_bytes))
        });
        let (key, value) = kv.to_key_value();
        proprietary.insert(key, value);
    }

    fn signer_key(&self, xpriv: &Xpriv) -> Result<SignerKey, Musig2Error> {
        if self.input().tap_key_origins.is_empty() {
            return Err(Musig2Error::MissingInputData);
        }
        let derived = derive_xpriv_for_input_tap(xpriv, self.input())?;
        let secp = secp256k1::Secp256k1::new();
        Ok(SignerKey {
            secret_key: derived.private_key,
            pub_key: Xpub::from_priv(&secp, &derived).to_pub(),
        })
    }

    fn nonce_prerequisites(&self) -> Result<(Musig2Participants, XOnlyPublicKey, [u8; 32]), Musig2Error> {
        let input = self.input();
        let internal_key = input
            .tap_internal_key
            .ok_or(Musig2Error::MissingInternalKeyForNonce)?;
        let merkle_root = input
            .tap_merkle_root
            .ok_or(Musig2Error::MissingMerkleRootForNonce)?
            .to_byte_array();
        let participants =
            parse_musig2_participants(input)?.ok_or(Musig2Error::ParticipantCount { got: 0 })?;
        assert_participants(&participants, &internal_key, &merkle_root)?;
        Ok((participants, internal_key, merkle_root))
    }

    /// Generate a nonce for the participant that `xpriv` derives to and store
    /// its public part on the input.
    ///
    /// A `session_id` makes the nonce reproducible; leave it `None` outside
    /// tests.
    pub fn generate_nonce(
        &mut self,
        store: &mut Musig2NonceStore,
        xpriv: &Xpriv,
        session_id: Option<&[u8]>,
        options: &Musig2SignOptions,
    ) -> Result<(NonceHandle, PubNonce), Musig2Error> {
        let (participants, _, _) = self.nonce_prerequisites()?;
        let signer = self.signer_key(xpriv)?;
        if !participants.contains(&signer.pub_key) {
            return Err(Musig2Error::ParticipantKeyNotDerived);
        }
        let (sighash, _) = self.sighash(&options.sighash_types)?;
        let (handle, pub_nonce) = store.create_nonce(
            &signer.secret_key,
            &participants.tap_output_key,
            sighash.as_byte_array(),
            session_id,
        )?;
        self.set_nonce(signer.pub_key, pub_nonce.clone())?;
        Ok((handle, pub_nonce))
    }

    /// Derive the cosigner nonce from the user nonce already on the input.
    pub fn set_deterministic_nonce(
        &mut self,
        xpriv: &Xpriv,
        options: &Musig2SignOptions,
    ) -> Result<PubNonce, Musig2Error> {
        let (participants, internal_key, merkle_root) = self.nonce_prerequisites()?;
        let signer = self.signer_key(xpriv)?;
        if signer.pub_key != participants.participant_pub_keys[1] {
            return Err(Musig2Error::DeterministicNonceNotCosigner);
        }
        let nonces = parse_musig2_nonces(self.input())?;
        if nonces.is_empty() {
            return Err(Musig2Error::NoNonces(self.input_index));
        }
        let user_nonce = nonces
            .iter()
            .find(|n| n.participant_pub_key == participants.participant_pub_keys[0])
            .ok_or(Musig2Error::MissingSignerNonceForDeterministic)?;

        let (sighash, _) = self.sighash(&options.sighash_types)?;
        let pub_nonce = deterministic_nonce(
            &signer.secret_key,
            &user_nonce.pub_nonce,
            &internal_key,
            &merkle_root,
            sighash.as_byte_array(),
        )?;
        self.set_nonce(signer.pub_key, pub_nonce.clone())?;
        Ok(pub_nonce)
    }

    fn musig2_signer(&self, xpriv: &Xpriv) -> Result<(SignerKey, Musig2Participants), Musig2Error> {
        let participants = parse_musig2_participants(self.input())?;
        let participants = match participants {
            Some(p) if is_taproot_key_path_input(self.input()) => p,
            _ => return Err(Musig2Error::NotMusig2Input),
        };
        let signer = self.signer_key(xpriv)?;
        if !participants.contains(&signer.pub_key) {
            return Err(Musig2Error::SignerNotParticipant);
        }
        Ok((signer, participants))
    }

    /// Handle of the nonce this signer stored on the input earlier.
    pub fn signer_nonce_handle(
        &self,
        store: &Musig2NonceStore,
        xpriv: &Xpriv,
    ) -> Result<NonceHandle, Musig2Error> {
        let (signer, _) = self.musig2_signer(xpriv)?;
        let nonces = parse_musig2_nonces(self.input())?;
        nonces
            .iter()
            .find(|n| n.participant_pub_key == signer.pub_key)
            .and_then(|n| store.get_handle(&n.pub_nonce))
            .ok_or(Musig2Error::MissingSignerNonce)
    }

    /// Sign with the secret nonce behind `handle`, which must be the nonce
    /// stored on the input for this signer.
    pub fn sign(
        &mut self,
        store: &mut Musig2NonceStore,
        handle: NonceHandle,
        xpriv: &Xpriv,
        options: &Musig2SignOptions,
    ) -> Result<(), Musig2Error> {
        let (signer, _) = self.musig2_signer(xpriv)?;
        let (session, musig2_input, sighash_type) = self.session(&options.sighash_types)?;

        let stored_nonce = musig2_input
            .nonce_for(&signer.pub_key)
            .map(|n| n.pub_nonce.serialize());
        let handle_nonce = store.pub_nonce(handle).map(|n| n.serialize());
        if stored_nonce.is_none() || stored_nonce != handle_nonce {
            return Err(Musig2Error::MissingSignerNonce);
        }

        let partial_sig = partial_sign(store, handle, &signer.secret_key, &session)?;
        self.set_partial_signature(signer.pub_key, partial_sig, sighash_type)
    }

    /// Cosigner signature with a nonce derived from the user nonce.
    pub fn sign_deterministic(
        &mut self,
        xpriv: &Xpriv,
        options: &Musig2SignOptions,
    ) -> Result<(), Musig2Error> {
        let (signer, participants) = self.musig2_signer(xpriv)?;
        if signer.pub_key != participants.participant_pub_keys[1] {
            return Err(Musig2Error::DeterministicSignerNotCosigner);
        }
        let (internal_key, merkle_root) = self.taproot_data()?;
        assert_participants(&participants, &internal_key, &merkle_root)?;
        let nonces = parse_musig2_nonces(self.input())?;
        assert_nonces(&participants, &nonces)?;
        let user_nonce = nonces
            .iter()
            .find(|n| n.participant_pub_key == participants.participant_pub_keys[0])
            .ok_or(Musig2Error::MissingUserNonce)?;

        let (sighash, sighash_type) = self.sighash(&options.sighash_types)?;
        let signature = deterministic_sign(
            &signer.secret_key,
            &user_nonce.pub_nonce,
            &participants.participant_pub_keys,
            &internal_key,
            &merkle_root,
            sighash.as_byte_array(),
        )?;
        self.set_nonce(signer.pub_key, signature.pub_nonce)?;
        self.set_partial_signature(signer.pub_key, signature.partial_sig, sighash_type)
    }

    /// Verify the partial signatures on the input, optionally only the one of
    /// `pubkey`. With two valid signatures the aggregate is checked against
    /// the output key as well.
    pub fn validate_signatures(
        &self,
        pubkey: Option<&CompressedPublicKey>,
    ) -> Result<bool, Musig2Error> {
        let all_sigs = parse_musig2_partial_sigs(self.input())?;
        if all_sigs.is_empty() {
            return Err(Musig2Error::NoSignatures);
        }
        let sigs: Vec<_> = all_sigs
            .iter()
            .filter(|sig| pubkey.map_or(true, |pk| sig.participant_pub_key == *pk))
            .collect();
        if sigs.is_empty() {
            return Err(Musig2Error::NoSignaturesForPubkey);
        }

        let sighash_type = get_sighash_type_from_sigs(&all_sigs)?;
        let (session, musig2_input, _) = self.session(&[sighash_type])?;

        for sig in &sigs {
            let nonce = musig2_input
                .nonce_for(&sig.participant_pub_key)
                .ok_or(Musig2Error::MissingPubNonce)?;
            if !partial_verify(sig.partial_sig, &sig.participant_pub_key, &nonce.pub_nonce, &session) {
                trace!(
                    input = self.input_index,
                    participant = %sig.participant_pub_key,
                    "invalid partial signature"
                );
                return Ok(false);
            }
        }

        if sigs.len() == 2 {
            let partial_sigs: Vec<_> = sigs.iter().map(|s| s.partial_sig).collect();
            let signature = aggregate_sigs(&partial_sigs, &session)?;
            return Ok(verify_schnorr(
                &signature,
                &session.message,
                &musig2_input.participants.tap_output_key,
            ));
        }
        Ok(true)
    }

    pub fn finalize<C: secp256k1::Verification>(
        self,
        secp: &secp256k1::Secp256k1<C>,
    ) -> Result<(), Musig2Error> {
        use miniscript::psbt::PsbtExt;

        let musig2_input = self.musig2_input()?;
        if musig2_input.partial_sigs.len() != 2 {
            return Err(Musig2Error::PartialSigCount(musig2_input.partial_sigs.len()));
        }
        let sighash_type = get_sighash_type_from_sigs(&musig2_input.partial_sigs)?;
        let (session, _, tap_sighash_type) = self.session(&[sighash_type])?;

        let partial_sigs: Vec<_> = musig2_input
            .partial_sigs
            .iter()
            .map(|s| s.partial_sig)
            .collect();
        let signature = aggregate_sigs(&partial_sigs, &session)?;
        let signature = secp256k1::schnorr::Signature::from_slice(&signature)
            .map_err(|e| Musig2Error::SignatureAggregation(e.to_string()))?;

        let input = &mut self.psbt.inputs[self.input_index];
        input.tap_key_sig = Some(crate::bitcoin::taproot::Signature {
            signature,
            sighash_type: tap_sighash_type,
        });
        input.proprietary.retain(|key, _| !is_musig2_key(key));

        self.psbt
            .finalize_inp_mut(secp, self.input_index)
            .map_err(|e| Musig2Error::Finalization(e.to_string()))?;
        debug!(input = self.input_index, "finalized musig2 input");
        Ok(())
    }
}
