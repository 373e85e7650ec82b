mod error;
pub mod bitgo_psbt;
pub mod fixed_script_wallet;
mod networks;

#[cfg(test)]
mod test_utils;

// re-export bitcoin from the miniscript crate
pub use ::miniscript::bitcoin;

pub use bitgo_psbt::BitGoPsbt;
pub use error::SignerError;
pub use networks::{Network, OutputScriptSupport};
