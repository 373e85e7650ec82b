//! Sighash types accepted by wallet signers per network.

use crate::networks::Network;

/// Set by Bitcoin Cash and its forks
const SIGHASH_FORKID: u32 = 0x40;

const SIGHASH_DEFAULT: u32 = 0x00;
const SIGHASH_ALL: u32 = 0x01;
const SIGHASH_NONE: u32 = 0x02;
const SIGHASH_SINGLE: u32 = 0x03;
const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Sighash types a signer accepts on `network` unless the caller passes its
/// own whitelist.
///
/// `SIGHASH_DEFAULT` and `SIGHASH_ALL` everywhere, plus their FORKID variants
/// on the Bitcoin Cash family.
pub fn default_sighash_types(network: Network) -> Vec<u8> {
    let mut types = vec![SIGHASH_DEFAULT as u8, SIGHASH_ALL as u8];
    if network.uses_forkid() {
        types.push((SIGHASH_DEFAULT | SIGHASH_FORKID) as u8);
        types.push((SIGHASH_ALL | SIGHASH_FORKID) as u8);
    }
    types
}

/// Check that `sighash_type` is well formed for `network`.
///
/// `0` is always accepted. FORKID networks require the FORKID flag, all
/// other networks reject it. The base type must be ALL, NONE or SINGLE,
/// optionally combined with ANYONECANPAY.
pub fn validate_sighash_type(sighash_type: u32, network: Network) -> Result<(), String> {
    if sighash_type == SIGHASH_DEFAULT {
        return Ok(());
    }

    let uses_forkid = network.uses_forkid();
    let has_forkid = (sighash_type & SIGHASH_FORKID) != 0;
    let has_anyonecanpay = (sighash_type & SIGHASH_ANYONECANPAY) != 0;
    let base_type = sighash_type & 0x1f;

    if has_forkid && !uses_forkid {
        return Err(format!(
            "SIGHASH_FORKID (0x40) is not valid for network {}. Sighash type: 0x{:02x}",
            network, sighash_type
        ));
    }
    if uses_forkid && !has_forkid {
        return Err(format!(
            "SIGHASH_FORKID (0x40) is required for network {}. Sighash type: 0x{:02x}",
            network, sighash_type
        ));
    }

    match base_type {
        SIGHASH_ALL | SIGHASH_NONE | SIGHASH_SINGLE => Ok(()),
        _ => Err(format!(
            "Invalid base sighash type: 0x{:02x}. Full sighash type: 0x{:02x}{}{}",
            base_type,
            sighash_type,
            if has_anyonecanpay { " (with ANYONECANPAY)" } else { "" },
            if has_forkid { " (with FORKID)" } else { "" }
        )),
    }
}
