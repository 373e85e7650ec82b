//! Definitions of the bitcoin-like networks that BitGo fixed-script wallets run on,
//! and the output script types each of them supports.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SignerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    // https://github.com/bitcoin/bitcoin/blob/master/src/chainparams.cpp
    Bitcoin,
    BitcoinTestnet3,
    BitcoinTestnet4,
    BitcoinPublicSignet,
    BitcoinBitGoSignet,

    // https://github.com/bitcoin-cash-node/bitcoin-cash-node/blob/master/src/chainparams.cpp
    BitcoinCash,
    BitcoinCashTestnet,

    // https://github.com/Bitcoin-ABC/bitcoin-abc/blob/master/src/chainparams.cpp
    Ecash,
    EcashTestnet,

    // https://github.com/BTCGPU/BTCGPU/blob/master/src/chainparams.cpp
    BitcoinGold,
    BitcoinGoldTestnet,

    // https://github.com/bitcoin-sv/bitcoin-sv/blob/master/src/chainparams.cpp
    BitcoinSV,
    BitcoinSVTestnet,

    Dash,
    DashTestnet,

    Dogecoin,
    DogecoinTestnet,

    Litecoin,
    LitecoinTestnet,

    Zcash,
    ZcashTestnet,
}

impl Network {
    /// Array containing all network variants
    pub const ALL: &'static [Network] = &[
        Network::Bitcoin,
        Network::BitcoinTestnet3,
        Network::BitcoinTestnet4,
        Network::BitcoinPublicSignet,
        Network::BitcoinBitGoSignet,
        Network::BitcoinCash,
        Network::BitcoinCashTestnet,
        Network::Ecash,
        Network::EcashTestnet,
        Network::BitcoinGold,
        Network::BitcoinGoldTestnet,
        Network::BitcoinSV,
        Network::BitcoinSVTestnet,
        Network::Dash,
        Network::DashTestnet,
        Network::Dogecoin,
        Network::DogecoinTestnet,
        Network::Litecoin,
        Network::LitecoinTestnet,
        Network::Zcash,
        Network::ZcashTestnet,
    ];

    /// Returns the canonical string name of this network
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Bitcoin => "Bitcoin",
            Network::BitcoinTestnet3 => "BitcoinTestnet3",
            Network::BitcoinTestnet4 => "BitcoinTestnet4",
            Network::BitcoinPublicSignet => "BitcoinPublicSignet",
            Network::BitcoinBitGoSignet => "BitcoinBitGoSignet",
            Network::BitcoinCash => "BitcoinCash",
            Network::BitcoinCashTestnet => "BitcoinCashTestnet",
            Network::Ecash => "Ecash",
            Network::EcashTestnet => "EcashTestnet",
            Network::BitcoinGold => "BitcoinGold",
            Network::BitcoinGoldTestnet => "BitcoinGoldTestnet",
            Network::BitcoinSV => "BitcoinSV",
            Network::BitcoinSVTestnet => "BitcoinSVTestnet",
            Network::Dash => "Dash",
            Network::DashTestnet => "DashTestnet",
            Network::Dogecoin => "Dogecoin",
            Network::DogecoinTestnet => "DogecoinTestnet",
            Network::Litecoin => "Litecoin",
            Network::LitecoinTestnet => "LitecoinTestnet",
            Network::Zcash => "Zcash",
            Network::ZcashTestnet => "ZcashTestnet",
        }
    }

    pub fn from_name_exact(name: &str) -> Option<Network> {
        Network::ALL.iter().copied().find(|n| n.as_str() == name)
    }

    pub fn mainnet(self) -> Network {
        match self {
            Network::Bitcoin
            | Network::BitcoinTestnet3
            | Network::BitcoinTestnet4
            | Network::BitcoinPublicSignet
            | Network::BitcoinBitGoSignet => Network::Bitcoin,
            Network::BitcoinCash | Network::BitcoinCashTestnet => Network::BitcoinCash,
            Network::Ecash | Network::EcashTestnet => Network::Ecash,
            Network::BitcoinGold | Network::BitcoinGoldTestnet => Network::BitcoinGold,
            Network::BitcoinSV | Network::BitcoinSVTestnet => Network::BitcoinSV,
            Network::Dash | Network::DashTestnet => Network::Dash,
            Network::Dogecoin | Network::DogecoinTestnet => Network::Dogecoin,
            Network::Litecoin | Network::LitecoinTestnet => Network::Litecoin,
            Network::Zcash | Network::ZcashTestnet => Network::Zcash,
        }
    }

    pub fn is_mainnet(self) -> bool {
        self == self.mainnet()
    }

    pub fn is_testnet(self) -> bool {
        !self.is_mainnet()
    }

    /// Bitcoin Cash and its descendants (and Bitcoin Gold) sign with SIGHASH_FORKID.
    pub fn uses_forkid(self) -> bool {
        matches!(
            self.mainnet(),
            Network::BitcoinCash | Network::BitcoinGold | Network::BitcoinSV | Network::Ecash
        )
    }

    pub fn output_script_support(self) -> OutputScriptSupport {
        let segwit = matches!(
            self.mainnet(),
            Network::Bitcoin | Network::Litecoin | Network::BitcoinGold
        );
        let taproot = self.mainnet() == Network::Bitcoin;
        OutputScriptSupport { segwit, taproot }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::from_name_exact(s).ok_or_else(|| format!("Unknown network: {}", s))
    }
}

/// Output script families a network can receive to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputScriptSupport {
    pub segwit: bool,
    pub taproot: bool,
}

impl OutputScriptSupport {
    pub fn all() -> OutputScriptSupport {
        OutputScriptSupport {
            segwit: true,
            taproot: true,
        }
    }

    pub fn assert_legacy(&self) -> Result<(), SignerError> {
        Ok(())
    }

    pub fn assert_segwit(&self) -> Result<(), SignerError> {
        if !self.segwit {
            return Err(SignerError::new("Network does not support segwit"));
        }
        Ok(())
    }

    pub fn assert_taproot(&self) -> Result<(), SignerError> {
        if !self.taproot {
            return Err(SignerError::new("Network does not support taproot"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_networks() {
        assert_eq!(Network::ALL.len(), 21);

        for (i, network1) in Network::ALL.iter().enumerate() {
            for (j, network2) in Network::ALL.iter().enumerate() {
                if i != j {
                    assert_ne!(network1, network2);
                }
            }
        }
    }

    #[test]
    fn test_roundtrip_as_str() {
        for &network in Network::ALL {
            assert_eq!(network.as_str(), network.to_string());
            assert_eq!(network.to_string().parse::<Network>().unwrap(), network);
        }
        assert!("InvalidNetwork".parse::<Network>().is_err());
    }

    #[test]
    fn test_serde_names_match_display() {
        for &network in Network::ALL {
            let json = serde_json::to_string(&network).unwrap();
            assert_eq!(json, format!("\"{}\"", network));
            let parsed: Network = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, network);
        }
    }

    #[test]
    fn test_mainnet_mapping() {
        assert_eq!(Network::BitcoinTestnet4.mainnet(), Network::Bitcoin);
        assert_eq!(Network::BitcoinBitGoSignet.mainnet(), Network::Bitcoin);
        assert_eq!(Network::BitcoinCashTestnet.mainnet(), Network::BitcoinCash);
        assert_eq!(Network::LitecoinTestnet.mainnet(), Network::Litecoin);
        assert!(Network::Zcash.is_mainnet());
        assert!(Network::ZcashTestnet.is_testnet());
    }

    #[test]
    fn test_forkid_networks() {
        assert!(Network::BitcoinCash.uses_forkid());
        assert!(Network::EcashTestnet.uses_forkid());
        assert!(Network::BitcoinSV.uses_forkid());
        assert!(Network::BitcoinGoldTestnet.uses_forkid());
        assert!(!Network::Bitcoin.uses_forkid());
        assert!(!Network::Litecoin.uses_forkid());
        assert!(!Network::Dogecoin.uses_forkid());
    }

    #[test]
    fn test_output_script_support() {
        assert_eq!(Network::Bitcoin.output_script_support(), OutputScriptSupport::all());
        assert_eq!(
            Network::LitecoinTestnet.output_script_support(),
            OutputScriptSupport {
                segwit: true,
                taproot: false
            }
        );
        let doge = Network::Dogecoin.output_script_support();
        assert!(doge.assert_legacy().is_ok());
        assert_eq!(
            doge.assert_segwit().unwrap_err().to_string(),
            "Network does not support segwit"
        );
        assert_eq!(
            Network::BitcoinCash
                .output_script_support()
                .assert_taproot()
                .unwrap_err()
                .to_string(),
            "Network does not support taproot"
        );
    }
}
