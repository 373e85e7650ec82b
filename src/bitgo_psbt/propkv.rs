//! BitGo proprietary key-values on PSBT inputs.
//!
//! The MuSig2 protocol state of a p2trMusig2 key path input lives in
//! proprietary records with the identifier `BITGO`.

use std::collections::BTreeMap;

pub use miniscript::bitcoin::psbt::raw::ProprietaryKey;

use crate::bitgo_psbt::p2tr_musig2_input::Musig2Error;

/// BitGo proprietary key identifier
pub const BITGO: &[u8] = b"BITGO";

fn find_kv_iter<'a>(
    map: &'a BTreeMap<ProprietaryKey, Vec<u8>>,
    prefix: &'a [u8],
    subtype: Option<u8>,
) -> impl Iterator<Item = (&'a ProprietaryKey, &'a Vec<u8>)> + 'a {
    map.iter().filter(move |(k, _)| {
        k.prefix.as_slice() == prefix && subtype.map_or(true, |st| k.subtype == st)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProprietaryKeySubtype {
    Musig2ParticipantPubKeys = 0x01,
    Musig2PubNonce = 0x02,
    Musig2PartialSig = 0x03,
}

impl ProprietaryKeySubtype {
    pub fn from(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ProprietaryKeySubtype::Musig2ParticipantPubKeys),
            0x02 => Some(ProprietaryKeySubtype::Musig2PubNonce),
            0x03 => Some(ProprietaryKeySubtype::Musig2PartialSig),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitGoKeyValue {
    pub subtype: ProprietaryKeySubtype,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl BitGoKeyValue {
    pub fn new(subtype: ProprietaryKeySubtype, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            subtype,
            key,
            value,
        }
    }

    /// Decode a raw proprietary record. The identifier is checked before the subtype.
    pub fn from_key_value(key: &ProprietaryKey, value: &[u8]) -> Result<Self, Musig2Error> {
        if key.prefix.as_slice() != BITGO {
            return Err(Musig2Error::InvalidIdentifier);
        }
        let subtype = ProprietaryKeySubtype::from(key.subtype)
            .ok_or(Musig2Error::UnknownSubtype(key.subtype))?;
        Ok(Self::new(subtype, key.key.clone(), value.to_owned()))
    }

    pub fn to_key_value(&self) -> (ProprietaryKey, Vec<u8>) {
        let key = ProprietaryKey {
            prefix: BITGO.to_vec(),
            subtype: self.subtype as u8,
            key: self.key.clone(),
        };
        (key, self.value.clone())
    }

    /// Fail unless this record has the `expected` subtype.
    pub fn expect_subtype(&self, expected: ProprietaryKeySubtype) -> Result<(), Musig2Error> {
        if self.subtype != expected {
            return Err(Musig2Error::InvalidSubtype {
                expected: expected as u8,
                got: self.subtype as u8,
            });
        }
        Ok(())
    }
}

/// All BitGo records of one subtype.
pub fn find_kv<'a>(
    subtype: ProprietaryKeySubtype,
    map: &'a BTreeMap<ProprietaryKey, Vec<u8>>,
) -> impl Iterator<Item = BitGoKeyValue> + 'a {
    find_kv_iter(map, BITGO, Some(subtype as u8))
        .map(move |(key, value)| BitGoKeyValue::new(subtype, key.key.clone(), value.clone()))
}

pub fn is_bitgo_key(key: &ProprietaryKey) -> bool {
    key.prefix.as_slice() == BITGO
}

pub fn is_musig2_key(key: &ProprietaryKey) -> bool {
    is_bitgo_key(key) && ProprietaryKeySubtype::from(key.subtype).is_some()
}
