//! MuSig2 signing primitives for the p2trMusig2 key path.
//!
//! The internal key is the BIP327 aggregate of `[user, bitgo]` and the output
//! key is its BIP341 tweak with the merkle root of the script tree. Signing
//! happens on the tweaked key aggregation context, so the aggregated
//! signature verifies against the output key.

use musig2::secp::{MaybeScalar, Point, Scalar};
use musig2::{AggNonce, BinaryEncoding, KeyAggContext, PartialSignature, PubNonce, SecNonce};
use tracing::{debug, trace};

use crate::bitcoin::hashes::Hash;
use crate::bitcoin::key::TapTweak;
use crate::bitcoin::secp256k1::{self, SecretKey, XOnlyPublicKey};
use crate::bitcoin::taproot::{TapNodeHash, TapTweakHash};
use crate::bitcoin::CompressedPublicKey;
use crate::bitgo_psbt::nonce_store::{Musig2NonceStore, NonceHandle};
use crate::bitgo_psbt::p2tr_musig2_input::Musig2Error;
use crate::fixed_script_wallet::wallet_scripts::{key_agg_p2tr_musig2, tagged_hash};

const DETERMINISTIC_NONCE_TAG: &str = "MuSig/deterministic/nonce";

/// Everything a participant needs to produce or check a partial signature.
#[derive(Debug, Clone)]
pub struct Musig2SessionKey {
    pub key_agg_ctx: KeyAggContext,
    pub agg_nonce: AggNonce,
    pub message: [u8; 32],
}

/// Result of [`deterministic_sign`].
#[derive(Debug, Clone)]
pub struct DeterministicSignature {
    pub partial_sig: PartialSignature,
    pub pub_nonce: PubNonce,
    pub session: Musig2SessionKey,
}

fn to_point(key: &CompressedPublicKey) -> Result<Point, Musig2Error> {
    Point::try_from(&key.to_bytes()[..]).map_err(|e| Musig2Error::InvalidField {
        field: "public key",
        reason: e.to_string(),
    })
}

fn to_scalar(secret_key: &SecretKey) -> Result<Scalar, Musig2Error> {
    Scalar::try_from(&secret_key.secret_bytes()[..]).map_err(|e| Musig2Error::InvalidField {
        field: "secret key",
        reason: e.to_string(),
    })
}

fn to_merkle_root(merkle_root: &[u8]) -> Result<[u8; 32], Musig2Error> {
    merkle_root.try_into().map_err(|_| Musig2Error::InvalidSize {
        field: "merkle root",
        expected: 32,
        got: merkle_root.len(),
    })
}

fn to_message(message_hash: &[u8]) -> Result<[u8; 32], Musig2Error> {
    message_hash.try_into().map_err(|_| Musig2Error::InvalidSize {
        field: "message hash",
        expected: 32,
        got: message_hash.len(),
    })
}

/// BIP327 aggregate of the participant keys. The order of `pubkeys` matters.
pub fn aggregate_internal_key(
    pubkeys: &[CompressedPublicKey; 2],
) -> Result<XOnlyPublicKey, Musig2Error> {
    let bytes = key_agg_p2tr_musig2(pubkeys)
        .map_err(|e| Musig2Error::KeyAggregation(e.to_string()))?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| Musig2Error::KeyAggregation(e.to_string()))
}

/// BIP341 tweak `hash_TapTweak(internal_key || merkle_root)`.
pub fn tap_tweak(internal_key: &XOnlyPublicKey, merkle_root: &[u8]) -> Result<[u8; 32], Musig2Error> {
    let root = TapNodeHash::from_byte_array(to_merkle_root(merkle_root)?);
    Ok(TapTweakHash::from_key_and_tweak(*internal_key, Some(root)).to_byte_array())
}

/// The taproot output key for `internal_key` committed to `merkle_root`.
pub fn output_key(
    internal_key: &XOnlyPublicKey,
    merkle_root: &[u8],
) -> Result<XOnlyPublicKey, Musig2Error> {
    let root = TapNodeHash::from_byte_array(to_merkle_root(merkle_root)?);
    let secp = secp256k1::Secp256k1::verification_only();
    let (tweaked, _parity) = internal_key.tap_tweak(&secp, Some(root));
    Ok(tweaked.to_x_only_public_key())
}

/// Sum of the public nonces. Order does not matter.
pub fn aggregate_nonce(pub_nonces: &[PubNonce; 2]) -> AggNonce {
    AggNonce::sum(pub_nonces)
}

/// Key aggregation context for `pubkeys` with the taproot tweak for
/// `merkle_root` applied.
pub fn tweaked_key_agg_context(
    pubkeys: &[CompressedPublicKey; 2],
    merkle_root: &[u8],
) -> Result<KeyAggContext, Musig2Error> {
    let root = to_merkle_root(merkle_root)?;
    let points = pubkeys
        .iter()
        .map(to_point)
        .collect::<Result<Vec<_>, _>>()?;
    KeyAggContext::new(points)
        .map_err(|e| Musig2Error::KeyAggregation(e.to_string()))?
        .with_taproot_tweak(&root)
        .map_err(|e| Musig2Error::KeyAggregation(e.to_string()))
}

pub fn start_session(
    agg_nonce: AggNonce,
    message_hash: &[u8],
    pubkeys: &[CompressedPublicKey; 2],
    merkle_root: &[u8],
) -> Result<Musig2SessionKey, Musig2Error> {
    let message = to_message(message_hash)?;
    let key_agg_ctx = tweaked_key_agg_context(pubkeys, merkle_root)?;
    trace!(message = %hex::encode(message), "started musig2 session");
    Ok(Musig2SessionKey {
        key_agg_ctx,
        agg_nonce,
        message,
    })
}

/// Sign with the secret nonce behind `handle`. The nonce is consumed even if
/// signing fails afterwards.
pub fn partial_sign(
    store: &mut Musig2NonceStore,
    handle: NonceHandle,
    secret_key: &SecretKey,
    session: &Musig2SessionKey,
) -> Result<PartialSignature, Musig2Error> {
    let sec_nonce = store.take(handle)?;
    sign_with_sec_nonce(sec_nonce, secret_key, session)
}

fn sign_with_sec_nonce(
    sec_nonce: SecNonce,
    secret_key: &SecretKey,
    session: &Musig2SessionKey,
) -> Result<PartialSignature, Musig2Error> {
    let partial_sig: PartialSignature = musig2::sign_partial(
        &session.key_agg_ctx,
        to_scalar(secret_key)?,
        sec_nonce,
        &session.agg_nonce,
        session.message,
    )
    .map_err(|e| Musig2Error::Signing(e.to_string()))?;
    Ok(partial_sig)
}

pub fn partial_verify(
    partial_sig: PartialSignature,
    pubkey: &CompressedPublicKey,
    pub_nonce: &PubNonce,
    session: &Musig2SessionKey,
) -> bool {
    let Ok(point) = to_point(pubkey) else {
        return false;
    };
    musig2::verify_partial(
        &session.key_agg_ctx,
        partial_sig,
        &session.agg_nonce,
        point,
        pub_nonce,
        session.message,
    )
    .is_ok()
}

/// Combine partial signatures into a 64-byte BIP340 signature.
pub fn aggregate_sigs(
    partial_sigs: &[PartialSignature],
    session: &Musig2SessionKey,
) -> Result<[u8; 64], Musig2Error> {
    let signature: musig2::LiftedSignature = musig2::aggregate_partial_signatures(
        &session.key_agg_ctx,
        &session.agg_nonce,
        partial_sigs.iter().copied(),
        session.message,
    )
    .map_err(|e| Musig2Error::SignatureAggregation(e.to_string()))?;
    Ok(signature.to_bytes())
}

/// Check a BIP340 signature against an x-only key.
pub fn verify_schnorr(signature: &[u8; 64], message: &[u8; 32], key: &XOnlyPublicKey) -> bool {
    let Ok(signature) = secp256k1::schnorr::Signature::from_slice(signature) else {
        return false;
    };
    let secp = secp256k1::Secp256k1::verification_only();
    secp.verify_schnorr(&signature, &secp256k1::Message::from_digest(*message), key)
        .is_ok()
}

/// BIP327 `det_nonce_hash` with the taproot output key as aggregate key.
///
/// The nonce is derived after the other participant has published theirs,
/// which lets a stateless cosigner sign without storing a secret nonce.
fn deterministic_sec_nonce(
    secret_key: &SecretKey,
    agg_other_nonce: &PubNonce,
    tap_output_key: &XOnlyPublicKey,
    message: &[u8; 32],
) -> Result<SecNonce, Musig2Error> {
    let secret_key_bytes = secret_key.secret_bytes();
    let agg_other_nonce_bytes = agg_other_nonce.serialize();
    let tap_output_key_bytes = tap_output_key.serialize();
    let msg_length = (message.len() as u64).to_be_bytes();

    let mut scalars = Vec::with_capacity(2);
    for i in 0u8..2 {
        let mut hash_input = Vec::with_capacity(32 + 66 + 32 + 8 + 32 + 1);
        hash_input.extend_from_slice(&secret_key_bytes);
        hash_input.extend_from_slice(&agg_other_nonce_bytes);
        hash_input.extend_from_slice(&tap_output_key_bytes);
        hash_input.extend_from_slice(&msg_length);
        hash_input.extend_from_slice(message);
        hash_input.push(i);

        let k_hash = tagged_hash(DETERMINISTIC_NONCE_TAG, &hash_input);
        let k = MaybeScalar::from_slice(&k_hash)
            .map_err(|e| Musig2Error::Signing(format!("invalid nonce scalar: {}", e)))?;
        // zero occurs with negligible probability
        let k_bytes = k.serialize();
        if k_bytes == [0u8; 32] {
            return Err(Musig2Error::Signing("generated zero nonce scalar".to_string()));
        }
        let k = Scalar::try_from(&k_bytes[..])
            .map_err(|e| Musig2Error::Signing(format!("invalid nonce scalar: {}", e)))?;
        scalars.push(k);
    }
    Ok(SecNonce::new(scalars[0], scalars[1]))
}

/// Public nonce a cosigner derives from the other participant's nonce.
pub fn deterministic_nonce(
    secret_key: &SecretKey,
    other_nonce: &PubNonce,
    internal_key: &XOnlyPublicKey,
    merkle_root: &[u8],
    message_hash: &[u8],
) -> Result<PubNonce, Musig2Error> {
    let tap_output_key = output_key(internal_key, merkle_root)?;
    let message = to_message(message_hash)?;
    let sec_nonce = deterministic_sec_nonce(secret_key, other_nonce, &tap_output_key, &message)?;
    Ok(sec_nonce.public_nonce())
}

/// Derive the deterministic nonce and sign in one step.
pub fn deterministic_sign(
    secret_key: &SecretKey,
    other_nonce: &PubNonce,
    pubkeys: &[CompressedPublicKey; 2],
    internal_key: &XOnlyPublicKey,
    merkle_root: &[u8],
    message_hash: &[u8],
) -> Result<DeterministicSignature, Musig2Error> {
    let tap_output_key = output_key(internal_key, merkle_root)?;
    let message = to_message(message_hash)?;
    let sec_nonce = deterministic_sec_nonce(secret_key, other_nonce, &tap_output_key, &message)?;
    let pub_nonce = sec_nonce.public_nonce();

    let agg_nonce = aggregate_nonce(&[other_nonce.clone(), pub_nonce.clone()]);
    let session = start_session(agg_nonce, &message, pubkeys, merkle_root)?;
    let partial_sig = sign_with_sec_nonce(sec_nonce, secret_key, &session)?;
    debug!("created deterministic musig2 partial signature");
    Ok(DeterministicSignature {
        partial_sig,
        pub_nonce,
        session,
    })
}
