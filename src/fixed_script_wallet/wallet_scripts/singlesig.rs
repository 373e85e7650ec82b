/// Replay protection inputs (p2shP2pk) are single-signature: the key belongs to BitGo.
use crate::bitcoin::blockdata::opcodes::all::OP_CHECKSIG;
use crate::bitcoin::blockdata::script::Builder;
use crate::bitcoin::{CompressedPublicKey, ScriptBuf};

/// Build bare p2pk script (used for p2sh-p2pk replay protection)
pub fn build_p2pk_script(key: CompressedPublicKey) -> ScriptBuf {
    Builder::default()
        .push_slice(key.to_bytes())
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

#[derive(Debug)]
pub struct ScriptP2shP2pk {
    pub redeem_script: ScriptBuf,
}

impl ScriptP2shP2pk {
    pub fn new(key: CompressedPublicKey) -> Self {
        ScriptP2shP2pk {
            redeem_script: build_p2pk_script(key),
        }
    }

    pub fn output_script(&self) -> ScriptBuf {
        self.redeem_script.to_p2sh()
    }
}
