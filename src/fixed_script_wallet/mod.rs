//! BitGo fixed-script wallets.
//!
//! Wallet scripts are derived from three root keys `[user, backup, bitgo]`
//! along `m/0/0/<chain>/<index>`. They are not based on descriptors.
pub mod parse_input;
pub mod script_matcher;
pub mod wallet_keys;
pub mod wallet_scripts;

#[cfg(test)]
pub mod test_utils;

pub use wallet_keys::*;
pub use wallet_scripts::*;
