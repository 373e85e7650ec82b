use std::convert::TryInto;
use std::str::FromStr;

use thiserror::Error;

use crate::bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use crate::bitcoin::secp256k1::{Secp256k1, Verification};
use crate::bitcoin::CompressedPublicKey;
use crate::error::SignerError;

/// Ordered `[user, backup, bitgo]`.
pub type XpubTriple = [Xpub; 3];

/// Ordered `[user, backup, bitgo]`.
pub type PubTriple = [CompressedPublicKey; 3];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletKeysError {
    #[error("invalid key length at index {index}: expected 33, got {got}")]
    InvalidKeyLength { index: usize, got: usize },
    #[error("invalid public key at index {index}: {reason}")]
    InvalidKey { index: usize, reason: String },
    #[error("duplicate key at index {first} and {second}")]
    DuplicateKey { first: usize, second: usize },
}

pub fn xpub_triple_from_strings(xpub_strings: &[String; 3]) -> Result<XpubTriple, SignerError> {
    let xpubs = xpub_strings
        .iter()
        .map(|s| {
            Xpub::from_str(s).map_err(|e| SignerError::new(&format!("Failed to parse xpub: {}", e)))
        })
        .collect::<Result<Vec<Xpub>, _>>()?;

    xpubs
        .try_into()
        .map_err(|_| SignerError::new("Expected exactly 3 xpubs"))
}

pub fn to_pub_triple(xpubs: &XpubTriple) -> PubTriple {
    [xpubs[0].to_pub(), xpubs[1].to_pub(), xpubs[2].to_pub()]
}

/// Parse three serialized public keys. Only 33-byte compressed keys are accepted.
pub fn pub_triple_from_slices(keys: [&[u8]; 3]) -> Result<PubTriple, WalletKeysError> {
    let mut parsed = Vec::with_capacity(3);
    for (index, bytes) in keys.iter().enumerate() {
        if bytes.len() != 33 {
            return Err(WalletKeysError::InvalidKeyLength {
                index,
                got: bytes.len(),
            });
        }
        let key = CompressedPublicKey::from_slice(bytes).map_err(|e| {
            WalletKeysError::InvalidKey {
                index,
                reason: e.to_string(),
            }
        })?;
        parsed.push(key);
    }
    let triple: PubTriple = [parsed[0], parsed[1], parsed[2]];
    assert_unique_keys(&triple)?;
    Ok(triple)
}

pub fn assert_unique_keys(keys: &[CompressedPublicKey]) -> Result<(), WalletKeysError> {
    for (first, a) in keys.iter().enumerate() {
        for (offset, b) in keys[first + 1..].iter().enumerate() {
            if a == b {
                return Err(WalletKeysError::DuplicateKey {
                    first,
                    second: first + 1 + offset,
                });
            }
        }
    }
    Ok(())
}

/// The three root keys of a wallet plus the path prefix each of them is derived with
/// before the `<chain>/<index>` suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootWalletKeys {
    pub xpubs: XpubTriple,
    pub derivation_prefixes: [DerivationPath; 3],
}

impl RootWalletKeys {
    pub fn new(xpubs: XpubTriple) -> RootWalletKeys {
        let prefix = DerivationPath::from(vec![
            ChildNumber::Normal { index: 0 },
            ChildNumber::Normal { index: 0 },
        ]);
        RootWalletKeys {
            xpubs,
            derivation_prefixes: [prefix.clone(), prefix.clone(), prefix],
        }
    }

    pub fn with_derivation_prefixes(
        xpubs: XpubTriple,
        derivation_prefixes: [DerivationPath; 3],
    ) -> RootWalletKeys {
        RootWalletKeys {
            xpubs,
            derivation_prefixes,
        }
    }

    pub fn user_key(&self) -> &Xpub {
        &self.xpubs[0]
    }

    pub fn backup_key(&self) -> &Xpub {
        &self.xpubs[1]
    }

    pub fn bitgo_key(&self) -> &Xpub {
        &self.xpubs[2]
    }

    pub fn derive_for_chain_and_index(
        &self,
        chain: u32,
        index: u32,
    ) -> Result<XpubTriple, SignerError> {
        let secp = Secp256k1::verification_only();
        let mut derived = Vec::with_capacity(3);
        for (xpub, prefix) in self.xpubs.iter().zip(self.derivation_prefixes.iter()) {
            let path = prefix
                .child(ChildNumber::Normal { index: chain })
                .child(ChildNumber::Normal { index });
            derived.push(xpub.derive_pub(&secp, &path)?);
        }
        Ok([derived[0], derived[1], derived[2]])
    }

    /// Derive all three keys with the same full path.
    pub fn derive_with_path<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        path: &DerivationPath,
    ) -> Result<XpubTriple, SignerError> {
        Ok([
            self.xpubs[0].derive_pub(secp, path)?,
            self.xpubs[1].derive_pub(secp, path)?,
            self.xpubs[2].derive_pub(secp, path)?,
        ])
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::bitcoin::bip32::{Xpriv, Xpub};
    use crate::bitcoin::hashes::{sha256, Hash};

    pub type XprivTriple = [Xpriv; 3];

    pub fn get_xpriv_from_seed(seed: &str) -> Xpriv {
        use crate::bitcoin::Network;

        // hash seed into 32 bytes
        let seed_hash = sha256::Hash::hash(seed.as_bytes()).to_byte_array();

        Xpriv::new_master(Network::Testnet, &seed_hash).expect("could not create xpriv from seed")
    }

    pub fn get_test_wallet_xprvs(seed: &str) -> XprivTriple {
        let a = get_xpriv_from_seed(&format!("{}/0", seed));
        let b = get_xpriv_from_seed(&format!("{}/1", seed));
        let c = get_xpriv_from_seed(&format!("{}/2", seed));
        [a, b, c]
    }

    pub fn get_test_wallet_keys(seed: &str) -> XpubTriple {
        let xprvs = get_test_wallet_xprvs(seed);
        let secp = Secp256k1::new();
        xprvs.map(|x| Xpub::from_priv(&secp, &x))
    }

    #[test]
    fn it_works() {
        let keys = get_test_wallet_keys("test");
        assert_eq!(keys[0].to_string(), "tpubD6NzVbkrYhZ4XUs2skvAi3vaZPKQ2oebm4FNyzbHwo8cWoZ81e2Gt1w836KdQWNtf7AgsPBtZ4t4KuoTuaKdzAbgeoygoKqgU6L2GnisU9a");
    }

    #[test]
    fn test_xpub_triple_from_strings() {
        let keys = get_test_wallet_keys("test");
        let strings = keys.map(|k| k.to_string());
        assert_eq!(xpub_triple_from_strings(&strings).unwrap(), keys);

        let mut broken = strings.clone();
        broken[1] = "xpub-nope".to_string();
        assert!(xpub_triple_from_strings(&broken)
            .unwrap_err()
            .to_string()
            .contains("Failed to parse xpub"));
    }

    #[test]
    fn test_derive_for_chain_and_index_is_stable() {
        let root = RootWalletKeys::new(get_test_wallet_keys("derive"));
        let a = root.derive_for_chain_and_index(20, 7).unwrap();
        let b = root.derive_for_chain_and_index(20, 7).unwrap();
        assert_eq!(a, b);

        let secp = Secp256k1::new();
        let path = DerivationPath::from_str("m/0/0/20/7").unwrap();
        assert_eq!(root.derive_with_path(&secp, &path).unwrap(), a);
        assert_ne!(root.derive_for_chain_and_index(21, 7).unwrap(), a);
    }

    #[test]
    fn test_derive_with_custom_prefix() {
        let xpubs = get_test_wallet_keys("prefix");
        let prefix = DerivationPath::from_str("m/1/2").unwrap();
        let root = RootWalletKeys::with_derivation_prefixes(
            xpubs,
            [prefix.clone(), prefix.clone(), prefix],
        );
        let secp = Secp256k1::new();
        let expected = xpubs[2]
            .derive_pub(&secp, &DerivationPath::from_str("m/1/2/0/3").unwrap())
            .unwrap();
        assert_eq!(root.derive_for_chain_and_index(0, 3).unwrap()[2], expected);
    }

    #[test]
    fn test_pub_triple_from_slices() {
        let keys = to_pub_triple(&get_test_wallet_keys("slices"));
        let bytes = keys.map(|k| k.to_bytes());
        let parsed = pub_triple_from_slices([&bytes[0], &bytes[1], &bytes[2]]).unwrap();
        assert_eq!(parsed, keys);

        let uncompressed = [4u8; 65];
        assert_eq!(
            pub_triple_from_slices([&bytes[0], &uncompressed, &bytes[2]]),
            Err(WalletKeysError::InvalidKeyLength { index: 1, got: 65 })
        );

        assert_eq!(
            pub_triple_from_slices([&bytes[0], &bytes[1], &bytes[0]]),
            Err(WalletKeysError::DuplicateKey {
                first: 0,
                second: 2
            })
        );
    }
}
