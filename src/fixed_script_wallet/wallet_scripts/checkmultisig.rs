use crate::bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
use crate::bitcoin::blockdata::script::Builder;
use crate::bitcoin::ScriptBuf;
use crate::fixed_script_wallet::wallet_keys::PubTriple;

/// Build bare multisig script. Needs to wrapped to be useful as an output script.
pub fn build_multisig_script_2_of_3(keys: &PubTriple) -> ScriptBuf {
    let quorum = 2;
    let total_count = 3;
    let mut builder = Builder::default().push_int(quorum as i64);
    for key in keys {
        builder = builder.push_slice(key.to_bytes())
    }
    builder
        .push_int(total_count as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

#[derive(Debug)]
pub struct ScriptP2sh {
    pub redeem_script: ScriptBuf,
}

impl ScriptP2sh {
    pub fn new(keys: &PubTriple) -> ScriptP2sh {
        ScriptP2sh {
            redeem_script: build_multisig_script_2_of_3(keys),
        }
    }
}

#[derive(Debug)]
pub struct ScriptP2shP2wsh {
    pub redeem_script: ScriptBuf,
    pub witness_script: ScriptBuf,
}

impl ScriptP2shP2wsh {
    pub fn new(keys: &PubTriple) -> ScriptP2shP2wsh {
        let witness_script = build_multisig_script_2_of_3(keys);
        ScriptP2shP2wsh {
            redeem_script: witness_script.to_p2wsh(),
            witness_script,
        }
    }
}

#[derive(Debug)]
pub struct ScriptP2wsh {
    pub witness_script: ScriptBuf,
}

impl ScriptP2wsh {
    pub fn new(keys: &PubTriple) -> ScriptP2wsh {
        ScriptP2wsh {
            witness_script: build_multisig_script_2_of_3(keys),
        }
    }
}
