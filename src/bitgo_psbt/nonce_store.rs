//! Session-scoped storage for MuSig2 secret nonces.
//!
//! A secret nonce must never leave the signer and must be used at most once.
//! The store keeps every generated secret nonce next to its public nonce and
//! hands out a [`NonceHandle`] that callers pass back when signing. Signing
//! takes the secret nonce out of the store, so a second signature with the
//! same handle fails.

use musig2::{PubNonce, SecNonce};
use tracing::{debug, trace};

use crate::bitcoin::secp256k1::{SecretKey, XOnlyPublicKey};
use crate::bitgo_psbt::p2tr_musig2_input::Musig2Error;

/// Opaque reference to a nonce in a [`Musig2NonceStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NonceHandle(usize);

impl NonceHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

struct NonceEntry {
    pub_nonce: PubNonce,
    sec_nonce: Option<SecNonce>,
}

/// Owned by a single signing session. Use one store per input (or per
/// worker) when inputs are signed in parallel.
#[derive(Default)]
pub struct Musig2NonceStore {
    entries: Vec<NonceEntry>,
}

fn random_session_id() -> [u8; 32] {
    let mut session_id = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut session_id);
    session_id
}

pub fn assert_session_id(session_id: &[u8]) -> Result<[u8; 32], Musig2Error> {
    session_id
        .try_into()
        .map_err(|_| Musig2Error::InvalidSessionIdSize(session_id.len()))
}

impl Musig2NonceStore {
    pub fn new() -> Musig2NonceStore {
        Musig2NonceStore::default()
    }

    /// Generate a nonce bound to `secret_key`, the taproot output key and the
    /// message.
    ///
    /// Without a `session_id` 32 bytes are drawn from the OS random source.
    /// A fixed `session_id` makes the nonce reproducible; it must never be
    /// reused for a different message. If the resulting public nonce is
    /// already in the store the existing handle is returned, unless its
    /// secret nonce was already consumed by signing.
    pub fn create_nonce(
        &mut self,
        secret_key: &SecretKey,
        tap_output_key: &XOnlyPublicKey,
        message: &[u8],
        session_id: Option<&[u8]>,
    ) -> Result<(NonceHandle, PubNonce), Musig2Error> {
        if message.len() != 32 {
            return Err(Musig2Error::InvalidSize {
                field: "message hash",
                expected: 32,
                got: message.len(),
            });
        }
        let session_id = match session_id {
            Some(id) => assert_session_id(id)?,
            None => random_session_id(),
        };

        let mut agg_pk_bytes = [0x02u8; 33];
        agg_pk_bytes[1..].copy_from_slice(&tap_output_key.serialize());
        let agg_pk = musig2::secp::Point::try_from(&agg_pk_bytes[..]).map_err(|e| {
            Musig2Error::InvalidField {
                field: "tap output key",
                reason: e.to_string(),
            }
        })?;
        let secret_scalar = musig2::secp::Scalar::try_from(&secret_key.secret_bytes()[..])
            .map_err(|e| Musig2Error::InvalidField {
                field: "secret key",
                reason: e.to_string(),
            })?;

        let sec_nonce =
            SecNonce::generate(session_id, secret_scalar, agg_pk, message, &[] as &[u8]);
        let pub_nonce = sec_nonce.public_nonce();

        if let Some(handle) = self.get_handle(&pub_nonce) {
            if !self.is_available(handle) {
                return Err(Musig2Error::NonceConsumed(handle.0));
            }
            trace!(handle = handle.0, "nonce already in store");
            return Ok((handle, pub_nonce));
        }

        let handle = NonceHandle(self.entries.len());
        self.entries.push(NonceEntry {
            pub_nonce: pub_nonce.clone(),
            sec_nonce: Some(sec_nonce),
        });
        debug!(handle = handle.0, "created musig2 nonce");
        Ok((handle, pub_nonce))
    }

    /// Look up the handle of a public nonce by content.
    pub fn get_handle(&self, pub_nonce: &PubNonce) -> Option<NonceHandle> {
        let bytes = pub_nonce.serialize();
        self.entries
            .iter()
            .position(|entry| entry.pub_nonce.serialize() == bytes)
            .map(NonceHandle)
    }

    pub fn pub_nonce(&self, handle: NonceHandle) -> Option<&PubNonce> {
        self.entries.get(handle.0).map(|entry| &entry.pub_nonce)
    }

    /// Whether the secret nonce behind `handle` can still be used.
    pub fn is_available(&self, handle: NonceHandle) -> bool {
        self.entries
            .get(handle.0)
            .is_some_and(|entry| entry.sec_nonce.is_some())
    }

    /// Remove the secret nonce from the store.
    pub fn take(&mut self, handle: NonceHandle) -> Result<SecNonce, Musig2Error> {
        let entry = self
            .entries
            .get_mut(handle.0)
            .ok_or(Musig2Error::UnknownNonceHandle(handle.0))?;
        let sec_nonce = entry
            .sec_nonce
            .take()
            .ok_or(Musig2Error::NonceConsumed(handle.0))?;
        debug!(handle = handle.0, "consumed musig2 nonce");
        Ok(sec_nonce)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::secp256k1::{Keypair, Secp256k1};

    fn test_key() -> (SecretKey, XOnlyPublicKey) {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        (secret_key, keypair.x_only_public_key().0)
    }

    #[test]
    fn test_fixed_session_id_is_reproducible() {
        let (secret_key, output_key) = test_key();
        let mut a = Musig2NonceStore::new();
        let mut b = Musig2NonceStore::new();
        let (_, nonce_a) = a
            .create_nonce(&secret_key, &output_key, &[0x33; 32], Some(&[0x01; 32]))
            .unwrap();
        let (_, nonce_b) = b
            .create_nonce(&secret_key, &output_key, &[0x33; 32], Some(&[0x01; 32]))
            .unwrap();
        assert_eq!(nonce_a.serialize(), nonce_b.serialize());

        let (_, other) = a
            .create_nonce(&secret_key, &output_key, &[0x33; 32], Some(&[0x02; 32]))
            .unwrap();
        assert_ne!(nonce_a.serialize(), other.serialize());
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_random_session_ids_differ() {
        let (secret_key, output_key) = test_key();
        let mut store = Musig2NonceStore::new();
        let (h1, n1) = store
            .create_nonce(&secret_key, &output_key, &[0x33; 32], None)
            .unwrap();
        let (h2, n2) = store
            .create_nonce(&secret_key, &output_key, &[0x33; 32], None)
            .unwrap();
        assert_ne!(h1, h2);
        assert_ne!(n1.serialize(), n2.serialize());
    }

    #[test]
    fn test_content_equal_nonce_returns_original_handle() {
        let (secret_key, output_key) = test_key();
        let mut store = Musig2NonceStore::new();
        let (first, nonce) = store
            .create_nonce(&secret_key, &output_key, &[0x33; 32], Some(&[0x07; 32]))
            .unwrap();
        let (second, _) = store
            .create_nonce(&secret_key, &output_key, &[0x33; 32], Some(&[0x07; 32]))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_handle(&nonce), Some(first));
    }

    #[test]
    fn test_take_consumes_secret_nonce() {
        let (secret_key, output_key) = test_key();
        let mut store = Musig2NonceStore::new();
        let (handle, nonce) = store
            .create_nonce(&secret_key, &output_key, &[0x33; 32], Some(&[0x07; 32]))
            .unwrap();
        assert!(store.is_available(handle));

        let sec_nonce = store.take(handle).unwrap();
        assert_eq!(sec_nonce.public_nonce().serialize(), nonce.serialize());
        assert!(!store.is_available(handle));
        assert_eq!(store.take(handle).unwrap_err(), Musig2Error::NonceConsumed(0));
        // the public nonce stays known
        assert_eq!(store.pub_nonce(handle).map(|n| n.serialize()), Some(nonce.serialize()));
    }

    #[test]
    fn test_fixed_session_id_cannot_be_reused_after_signing() {
        let (secret_key, output_key) = test_key();
        let mut store = Musig2NonceStore::new();
        let (handle, _) = store
            .create_nonce(&secret_key, &output_key, &[0x33; 32], Some(&[0x07; 32]))
            .unwrap();
        store.take(handle).unwrap();
        assert_eq!(
            store
                .create_nonce(&secret_key, &output_key, &[0x33; 32], Some(&[0x07; 32]))
                .unwrap_err(),
            Musig2Error::NonceConsumed(handle.0)
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_invalid_lengths() {
        let (secret_key, output_key) = test_key();
        let mut store = Musig2NonceStore::new();
        assert_eq!(
            store
                .create_nonce(&secret_key, &output_key, &[0x33; 32], Some(&[0x01; 31]))
                .unwrap_err()
                .to_string(),
            "Invalid sessionId size 31"
        );
        assert_eq!(
            store
                .create_nonce(&secret_key, &output_key, &[0x33; 20], None)
                .unwrap_err(),
            Musig2Error::InvalidSize {
                field: "message hash",
                expected: 32,
                got: 20
            }
        );
        assert_eq!(
            store.take(NonceHandle(5)).unwrap_err(),
            Musig2Error::UnknownNonceHandle(5)
        );
        assert!(store.is_empty());
    }
}
