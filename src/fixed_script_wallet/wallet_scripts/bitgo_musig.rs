//! Key aggregation for the two BitGo taproot script types.
//!
//! `p2tr` (chains 30/31) aggregates the user and bitgo keys with an early MuSig
//! variant that hashes x-only keys and sorts them first, which makes it
//! order-insensitive. `p2trMusig2` (chains 40/41) uses plain BIP327 key
//! aggregation, where the order of the keys changes the result.

use musig2::KeyAggContext;
use thiserror::Error;

use crate::bitcoin::hashes::{sha256, Hash, HashEngine};
use crate::bitcoin::secp256k1::{Parity, PublicKey, Scalar, Secp256k1, XOnlyPublicKey};
use crate::bitcoin::CompressedPublicKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitGoMusigError {
    #[error("Invalid pubkey count: {0}")]
    InvalidPubkeyCount(String),
    #[error("Invalid pubkey: {0}")]
    InvalidPubkey(String),
    #[error("Aggregation failed: {0}")]
    AggregationFailed(String),
}

/// BIP340-style tagged hash
pub(crate) fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let tag_hash = sha256::Hash::hash(tag.as_bytes());
    let mut engine = sha256::Hash::engine();
    engine.input(tag_hash.as_ref());
    engine.input(tag_hash.as_ref());
    engine.input(msg);
    sha256::Hash::from_engine(engine).to_byte_array()
}

fn assert_two_distinct(count: usize, has_distinct: bool) -> Result<(), BitGoMusigError> {
    if count < 2 {
        return Err(BitGoMusigError::InvalidPubkeyCount(
            "At least two pubkeys are required for MuSig key aggregation".to_string(),
        ));
    }
    if !has_distinct {
        return Err(BitGoMusigError::InvalidPubkeyCount(
            "All pubkeys are identical - MuSig requires at least two distinct keys".to_string(),
        ));
    }
    Ok(())
}

/// BIP327 KeyAgg over 32-byte x-only keys, lifted with even y.
///
/// The list hash and the coefficients are computed over the x-only encodings,
/// which is what makes this differ from standard BIP327.
fn key_agg_xonly(keys: &[[u8; 32]]) -> Result<[u8; 32], BitGoMusigError> {
    let second = keys.iter().skip(1).find(|k| *k != &keys[0]);
    assert_two_distinct(keys.len(), second.is_some())?;

    let secp = Secp256k1::verification_only();
    let list_hash = tagged_hash("KeyAgg list", &keys.concat());

    let mut aggregate: Option<PublicKey> = None;
    for (i, key) in keys.iter().enumerate() {
        let xonly = XOnlyPublicKey::from_slice(key).map_err(|e| {
            BitGoMusigError::InvalidPubkey(format!("Invalid x-only pubkey at index {}: {}", i, e))
        })?;
        let point = PublicKey::from_x_only_public_key(xonly, Parity::Even);

        let coefficient = if Some(key) == second {
            Scalar::ONE
        } else {
            let hash = tagged_hash("KeyAgg coefficient", &[&list_hash[..], &key[..]].concat());
            Scalar::from_be_bytes(hash).map_err(|e| {
                BitGoMusigError::AggregationFailed(format!("Invalid coefficient: {}", e))
            })?
        };

        let term = point.mul_tweak(&secp, &coefficient).map_err(|e| {
            BitGoMusigError::AggregationFailed(format!("Point multiplication failed: {}", e))
        })?;
        aggregate = Some(match aggregate {
            None => term,
            Some(acc) => acc.combine(&term).map_err(|e| {
                BitGoMusigError::AggregationFailed(format!("Point addition failed: {}", e))
            })?,
        });
    }

    aggregate
        .map(|q| q.x_only_public_key().0.serialize())
        .ok_or_else(|| {
            BitGoMusigError::AggregationFailed(
                "Aggregation resulted in point at infinity".to_string(),
            )
        })
}

/// BitGo legacy P2TR key aggregation (chains 30, 31).
///
/// Keys are converted to x-only and sorted before aggregation, so
/// `[a, b]` and `[b, a]` give the same internal key.
pub fn key_agg_bitgo_p2tr_legacy(
    pubkeys: &[CompressedPublicKey],
) -> Result<[u8; 32], BitGoMusigError> {
    let mut xonly_keys: Vec<[u8; 32]> = pubkeys
        .iter()
        .map(|pk| pk.0.x_only_public_key().0.serialize())
        .collect();
    xonly_keys.sort();
    key_agg_xonly(&xonly_keys)
}

/// P2TR MuSig2 key aggregation (chains 40, 41), BIP327 via the `musig2` crate.
pub fn key_agg_p2tr_musig2(pubkeys: &[CompressedPublicKey]) -> Result<[u8; 32], BitGoMusigError> {
    let has_distinct = pubkeys.iter().skip(1).any(|pk| Some(pk) != pubkeys.first());
    assert_two_distinct(pubkeys.len(), has_distinct)?;

    let points = pubkeys
        .iter()
        .enumerate()
        .map(|(i, pk)| {
            musig2::secp::Point::try_from(&pk.to_bytes()[..]).map_err(|e| {
                BitGoMusigError::InvalidPubkey(format!("Invalid pubkey at index {}: {}", i, e))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let key_agg_ctx = KeyAggContext::new(points).map_err(|e| {
        BitGoMusigError::AggregationFailed(format!("KeyAggContext creation failed: {}", e))
    })?;
    let agg_point: musig2::secp::Point = key_agg_ctx.aggregated_pubkey();
    Ok(agg_point.serialize_xonly())
}
