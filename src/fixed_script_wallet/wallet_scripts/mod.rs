/// Code relating to script types of BitGo's 2-of-3 multisig wallets.
mod bitgo_musig;
mod checkmultisig;
mod checksigverify;
mod singlesig;

pub use bitgo_musig::{key_agg_bitgo_p2tr_legacy, key_agg_p2tr_musig2, BitGoMusigError};
pub(crate) use bitgo_musig::tagged_hash;
pub use checkmultisig::{build_multisig_script_2_of_3, ScriptP2sh, ScriptP2shP2wsh, ScriptP2wsh};
pub use checksigverify::{build_p2tr_ns_script, to_xonly_pubkey, ScriptP2tr, TapLeaf};
pub use singlesig::{build_p2pk_script, ScriptP2shP2pk};

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bitcoin::bip32::{ChildNumber, DerivationPath};
use crate::bitcoin::secp256k1::{Secp256k1, Verification};
use crate::bitcoin::ScriptBuf;
use crate::error::SignerError;
use crate::fixed_script_wallet::wallet_keys::{
    assert_unique_keys, to_pub_triple, PubTriple, RootWalletKeys, XpubTriple,
};
use crate::networks::OutputScriptSupport;

/// The 2-of-3 script types of a fixed-script wallet.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScriptType2Of3 {
    P2sh,
    P2shP2wsh,
    P2wsh,
    P2tr,
    P2trMusig2,
}

impl ScriptType2Of3 {
    pub const ALL: [ScriptType2Of3; 5] = [
        ScriptType2Of3::P2sh,
        ScriptType2Of3::P2shP2wsh,
        ScriptType2Of3::P2wsh,
        ScriptType2Of3::P2tr,
        ScriptType2Of3::P2trMusig2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType2Of3::P2sh => "p2sh",
            ScriptType2Of3::P2shP2wsh => "p2shP2wsh",
            ScriptType2Of3::P2wsh => "p2wsh",
            ScriptType2Of3::P2tr => "p2tr",
            ScriptType2Of3::P2trMusig2 => "p2trMusig2",
        }
    }

    pub fn is_segwit(&self) -> bool {
        !matches!(self, ScriptType2Of3::P2sh)
    }

    pub fn is_taproot(&self) -> bool {
        matches!(self, ScriptType2Of3::P2tr | ScriptType2Of3::P2trMusig2)
    }

    pub fn assert_supported(&self, script_support: &OutputScriptSupport) -> Result<(), SignerError> {
        match self {
            ScriptType2Of3::P2sh => script_support.assert_legacy(),
            ScriptType2Of3::P2shP2wsh | ScriptType2Of3::P2wsh => script_support.assert_segwit(),
            ScriptType2Of3::P2tr | ScriptType2Of3::P2trMusig2 => script_support.assert_taproot(),
        }
    }
}

impl fmt::Display for ScriptType2Of3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScriptType2Of3 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScriptType2Of3::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown script type {}", s))
    }
}

/// Scripts that belong to fixed-script BitGo wallets.
#[derive(Debug)]
pub enum WalletScripts {
    /// Chains 0 and 1. Legacy Pay-To-Script-Hash.
    P2sh(ScriptP2sh),
    /// Chains 10 and 11. Legacy Wrapped-Segwit Pay-To-Script-Hash.
    P2shP2wsh(ScriptP2shP2wsh),
    /// Chains 20 and 21. Native Segwit Pay-To-Witness-Script-Hash.
    P2wsh(ScriptP2wsh),
    /// Chains 30 and 31. Legacy Taproot, only supporting script-path spend.
    P2trLegacy(ScriptP2tr),
    /// Chains 40 and 41. Taproot with Musig2 key-path spend support.
    P2trMusig2(ScriptP2tr),
}

impl fmt::Display for WalletScripts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.script_type())
    }
}

impl WalletScripts {
    pub fn new(
        keys: &PubTriple,
        script_type: ScriptType2Of3,
        script_support: &OutputScriptSupport,
    ) -> Result<WalletScripts, SignerError> {
        script_type.assert_supported(script_support)?;
        assert_unique_keys(keys)?;
        Ok(match script_type {
            ScriptType2Of3::P2sh => WalletScripts::P2sh(ScriptP2sh::new(keys)),
            ScriptType2Of3::P2shP2wsh => WalletScripts::P2shP2wsh(ScriptP2shP2wsh::new(keys)),
            ScriptType2Of3::P2wsh => WalletScripts::P2wsh(ScriptP2wsh::new(keys)),
            ScriptType2Of3::P2tr => WalletScripts::P2trLegacy(ScriptP2tr::new(keys, false)?),
            ScriptType2Of3::P2trMusig2 => WalletScripts::P2trMusig2(ScriptP2tr::new(keys, true)?),
        })
    }

    pub fn from_wallet_keys(
        wallet_keys: &RootWalletKeys,
        chain: Chain,
        index: u32,
        script_support: &OutputScriptSupport,
    ) -> Result<WalletScripts, SignerError> {
        let derived_keys = wallet_keys.derive_for_chain_and_index(chain as u32, index)?;
        WalletScripts::new(
            &to_pub_triple(&derived_keys),
            chain.script_type(),
            script_support,
        )
    }

    pub fn script_type(&self) -> ScriptType2Of3 {
        match self {
            WalletScripts::P2sh(_) => ScriptType2Of3::P2sh,
            WalletScripts::P2shP2wsh(_) => ScriptType2Of3::P2shP2wsh,
            WalletScripts::P2wsh(_) => ScriptType2Of3::P2wsh,
            WalletScripts::P2trLegacy(_) => ScriptType2Of3::P2tr,
            WalletScripts::P2trMusig2(_) => ScriptType2Of3::P2trMusig2,
        }
    }

    pub fn output_script(&self) -> ScriptBuf {
        match self {
            WalletScripts::P2sh(script) => script.redeem_script.to_p2sh(),
            WalletScripts::P2shP2wsh(script) => script.redeem_script.to_p2sh(),
            WalletScripts::P2wsh(script) => script.witness_script.to_p2wsh(),
            WalletScripts::P2trLegacy(script) => script.output_script(),
            WalletScripts::P2trMusig2(script) => script.output_script(),
        }
    }

    pub fn redeem_script(&self) -> Option<&ScriptBuf> {
        match self {
            WalletScripts::P2sh(script) => Some(&script.redeem_script),
            WalletScripts::P2shP2wsh(script) => Some(&script.redeem_script),
            _ => None,
        }
    }

    pub fn witness_script(&self) -> Option<&ScriptBuf> {
        match self {
            WalletScripts::P2shP2wsh(script) => Some(&script.witness_script),
            WalletScripts::P2wsh(script) => Some(&script.witness_script),
            _ => None,
        }
    }

    pub fn taproot(&self) -> Option<&ScriptP2tr> {
        match self {
            WalletScripts::P2trLegacy(script) | WalletScripts::P2trMusig2(script) => Some(script),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Scope {
    External,
    Internal,
}

/// BitGo-Defined mappings between derivation path component and script type
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Chain {
    P2shExternal = 0,
    P2shInternal = 1,
    P2shP2wshExternal = 10,
    P2shP2wshInternal = 11,
    P2wshExternal = 20,
    P2wshInternal = 21,
    P2trInternal = 30,
    P2trExternal = 31,
    P2trMusig2Internal = 40,
    P2trMusig2External = 41,
}

/// Useful for iterating over enum values
const ALL_CHAINS: [Chain; 10] = [
    Chain::P2shExternal,
    Chain::P2shInternal,
    Chain::P2shP2wshExternal,
    Chain::P2shP2wshInternal,
    Chain::P2wshExternal,
    Chain::P2wshInternal,
    Chain::P2trInternal,
    Chain::P2trExternal,
    Chain::P2trMusig2Internal,
    Chain::P2trMusig2External,
];

impl Chain {
    pub fn all() -> &'static [Chain; 10] {
        &ALL_CHAINS
    }

    pub fn new(script_type: ScriptType2Of3, scope: Scope) -> Chain {
        use ScriptType2Of3::*;
        match (script_type, scope) {
            (P2sh, Scope::External) => Chain::P2shExternal,
            (P2sh, Scope::Internal) => Chain::P2shInternal,
            (P2shP2wsh, Scope::External) => Chain::P2shP2wshExternal,
            (P2shP2wsh, Scope::Internal) => Chain::P2shP2wshInternal,
            (P2wsh, Scope::External) => Chain::P2wshExternal,
            (P2wsh, Scope::Internal) => Chain::P2wshInternal,
            (P2tr, Scope::External) => Chain::P2trExternal,
            (P2tr, Scope::Internal) => Chain::P2trInternal,
            (P2trMusig2, Scope::External) => Chain::P2trMusig2External,
            (P2trMusig2, Scope::Internal) => Chain::P2trMusig2Internal,
        }
    }

    pub fn script_type(&self) -> ScriptType2Of3 {
        match self {
            Chain::P2shExternal | Chain::P2shInternal => ScriptType2Of3::P2sh,
            Chain::P2shP2wshExternal | Chain::P2shP2wshInternal => ScriptType2Of3::P2shP2wsh,
            Chain::P2wshExternal | Chain::P2wshInternal => ScriptType2Of3::P2wsh,
            Chain::P2trInternal | Chain::P2trExternal => ScriptType2Of3::P2tr,
            Chain::P2trMusig2Internal | Chain::P2trMusig2External => ScriptType2Of3::P2trMusig2,
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Chain::P2shExternal
            | Chain::P2shP2wshExternal
            | Chain::P2wshExternal
            | Chain::P2trExternal
            | Chain::P2trMusig2External => Scope::External,
            _ => Scope::Internal,
        }
    }
}

impl TryFrom<u32> for Chain {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        ALL_CHAINS
            .iter()
            .copied()
            .find(|chain| *chain as u32 == value)
            .ok_or_else(|| format!("no chain for {}", value))
    }
}

impl From<Chain> for u32 {
    fn from(chain: Chain) -> u32 {
        chain as u32
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chain: u32 = u32::from_str(s).map_err(|v| v.to_string())?;
        Chain::try_from(chain)
    }
}

/// Return derived WalletKeys. All keys are derived with the same path.
pub fn derive_xpubs_with_path<C: Verification>(
    xpubs: &XpubTriple,
    ctx: &Secp256k1<C>,
    p: &DerivationPath,
) -> Result<XpubTriple, SignerError> {
    Ok([
        xpubs[0].derive_pub(ctx, p)?,
        xpubs[1].derive_pub(ctx, p)?,
        xpubs[2].derive_pub(ctx, p)?,
    ])
}

pub fn derive_xpubs<C: Verification>(
    xpubs: &XpubTriple,
    ctx: &Secp256k1<C>,
    chain: Chain,
    index: u32,
) -> Result<XpubTriple, SignerError> {
    let p = DerivationPath::from(vec![
        ChildNumber::Normal { index: 0 },
        ChildNumber::Normal { index: 0 },
        ChildNumber::Normal {
            index: chain as u32,
        },
        ChildNumber::Normal { index },
    ]);
    derive_xpubs_with_path(xpubs, ctx, &p)
}
