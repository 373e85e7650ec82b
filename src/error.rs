use thiserror::Error;

use crate::bitgo_psbt::p2tr_musig2_input::Musig2Error;
use crate::bitgo_psbt::psbt_input::PsbtInputError;
use crate::bitgo_psbt::root_keys::RootKeysError;
use crate::bitgo_psbt::wallet_outputs::WalletOutputError;
use crate::fixed_script_wallet::parse_input::ParseInputError;
use crate::fixed_script_wallet::wallet_keys::WalletKeysError;
use crate::fixed_script_wallet::wallet_scripts::BitGoMusigError;

/// Top-level error of the crate.
///
/// Each component reports its own error type; this enum lets callers that drive
/// several components at once use `?` throughout.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("{0}")]
    StringError(String),
    #[error(transparent)]
    ParseInput(#[from] ParseInputError),
    #[error(transparent)]
    WalletKeys(#[from] WalletKeysError),
    #[error(transparent)]
    KeyAggregation(#[from] BitGoMusigError),
    #[error(transparent)]
    Musig2(#[from] Musig2Error),
    #[error(transparent)]
    RootKeys(#[from] RootKeysError),
    #[error(transparent)]
    PsbtInput(#[from] PsbtInputError),
    #[error(transparent)]
    WalletOutput(#[from] WalletOutputError),
    #[error("bip32 derivation failed: {0}")]
    Bip32(#[from] crate::bitcoin::bip32::Error),
}

impl From<&str> for SignerError {
    fn from(s: &str) -> Self {
        SignerError::StringError(s.to_string())
    }
}

impl From<String> for SignerError {
    fn from(s: String) -> Self {
        SignerError::StringError(s)
    }
}

impl SignerError {
    pub fn new(s: &str) -> SignerError {
        SignerError::StringError(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_error_display() {
        let err = SignerError::new("Network does not support taproot");
        assert_eq!(err.to_string(), "Network does not support taproot");

        let err: SignerError = format!("no chain for {}", 7).into();
        assert!(matches!(err, SignerError::StringError(ref s) if s == "no chain for 7"));
    }

    #[test]
    fn test_transparent_display() {
        let err: SignerError = ParseInputError::CouldNotParseInput.into();
        assert_eq!(err.to_string(), "could not parse input");

        let err: SignerError = PsbtInputError::Finalized.into();
        assert_eq!(err.to_string(), "Finalized PSBT parsing is not supported");
    }
}
