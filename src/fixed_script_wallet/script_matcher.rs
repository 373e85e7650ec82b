//! Declarative matching of decompiled scripts and witness stacks.
//!
//! A pattern is a static table of [`Pattern`] elements. Matching walks the
//! script elements and the pattern in lockstep and collects the captured
//! values in the order they are encountered. Nested scripts (a push whose
//! content is itself a script, like a redeem script) are decompiled and
//! matched recursively.

use thiserror::Error;

use crate::bitcoin::blockdata::opcodes::Opcode;
use crate::bitcoin::blockdata::script::Instruction;
use crate::bitcoin::{Script, Witness};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("length mismatch")]
    LengthMismatch,
    #[error("error matching {0}")]
    Element(String),
    #[error("expected buffer for :script")]
    ExpectedPush,
    #[error("error decompiling nested script")]
    Decompile,
    #[error("no match for script")]
    NoMatch,
}

/// A decompiled script element. Witness stack items are always pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element<'a> {
    Push(&'a [u8]),
    Op(Opcode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// `OP_0` or an empty push
    Zero,
    Op(Opcode),
    /// 33 or 65 byte push
    PubKey,
    /// 32 byte push
    PubKeyXOnly,
    /// Any push. An empty push is a placeholder.
    Signature,
    /// Push of `33 + 32 * m` bytes
    ControlBlock,
    Script(&'static [Pattern]),
}

impl Pattern {
    fn name(&self) -> String {
        match self {
            Pattern::Zero => "OP_0".to_string(),
            Pattern::Op(op) => op.to_string(),
            Pattern::PubKey => ":pubkey".to_string(),
            Pattern::PubKeyXOnly => ":pubkey-xonly".to_string(),
            Pattern::Signature => ":signature".to_string(),
            Pattern::ControlBlock => ":control-block".to_string(),
            Pattern::Script(_) => ":script".to_string(),
        }
    }
}

/// A signature position in a (possibly partially signed) input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureSlot {
    Placeholder,
    Signature(Vec<u8>),
}

impl SignatureSlot {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, SignatureSlot::Placeholder)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SignatureSlot::Placeholder => None,
            SignatureSlot::Signature(sig) => Some(sig),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedScript<'a> {
    pub bytes: &'a [u8],
    pub captures: Captures<'a>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures<'a> {
    pub pubkeys: Vec<&'a [u8]>,
    pub pubkeys_xonly: Vec<&'a [u8]>,
    pub signatures: Vec<SignatureSlot>,
    pub control_blocks: Vec<&'a [u8]>,
    pub scripts: Vec<NestedScript<'a>>,
}

pub fn is_valid_control_block(bytes: &[u8]) -> bool {
    bytes.len() >= 33 && (bytes.len() - 33) % 32 == 0
}

pub fn decompile(script: &Script) -> Result<Vec<Element<'_>>, MatchError> {
    script
        .instructions()
        .map(|instruction| match instruction {
            Ok(Instruction::PushBytes(bytes)) => Ok(Element::Push(bytes.as_bytes())),
            Ok(Instruction::Op(op)) => Ok(Element::Op(op)),
            Err(_) => Err(MatchError::Decompile),
        })
        .collect()
}

pub fn witness_elements(witness: &Witness) -> Vec<Element<'_>> {
    witness.iter().map(Element::Push).collect()
}

fn match_element(element: &Element<'_>, pattern: &Pattern) -> bool {
    match (pattern, element) {
        (Pattern::Zero, Element::Push(bytes)) => bytes.is_empty(),
        (Pattern::Zero, Element::Op(op)) => op.to_u8() == 0,
        (Pattern::Op(expected), Element::Op(op)) => expected == op,
        (Pattern::PubKey, Element::Push(bytes)) => bytes.len() == 33 || bytes.len() == 65,
        (Pattern::PubKeyXOnly, Element::Push(bytes)) => bytes.len() == 32,
        (Pattern::Signature, Element::Push(_)) => true,
        (Pattern::Signature, Element::Op(op)) => op.to_u8() == 0,
        (Pattern::ControlBlock, Element::Push(bytes)) => is_valid_control_block(bytes),
        _ => false,
    }
}

/// Match `elements` against `pattern`. Element count must be equal.
pub fn match_script<'a>(
    elements: &[Element<'a>],
    pattern: &[Pattern],
) -> Result<Captures<'a>, MatchError> {
    if elements.len() != pattern.len() {
        return Err(MatchError::LengthMismatch);
    }

    let mut captures = Captures::default();
    for (element, p) in elements.iter().zip(pattern) {
        if let Pattern::Script(nested) = p {
            let bytes = match element {
                Element::Push(bytes) => *bytes,
                Element::Op(_) => return Err(MatchError::ExpectedPush),
            };
            let nested_elements = decompile(Script::from_bytes(bytes))?;
            let nested_captures = match_script(&nested_elements, nested)?;
            captures.scripts.push(NestedScript {
                bytes,
                captures: nested_captures,
            });
            continue;
        }

        if !match_element(element, p) {
            return Err(MatchError::Element(p.name()));
        }

        let bytes = match element {
            Element::Push(bytes) => *bytes,
            Element::Op(_) => &[][..],
        };
        match p {
            Pattern::PubKey => captures.pubkeys.push(bytes),
            Pattern::PubKeyXOnly => captures.pubkeys_xonly.push(bytes),
            Pattern::ControlBlock => captures.control_blocks.push(bytes),
            Pattern::Signature if bytes.is_empty() => {
                captures.signatures.push(SignatureSlot::Placeholder)
            }
            Pattern::Signature => captures
                .signatures
                .push(SignatureSlot::Signature(bytes.to_vec())),
            _ => {}
        }
    }
    Ok(captures)
}

/// Return the captures of the first pattern that matches.
pub fn match_script_some<'a>(
    elements: &[Element<'a>],
    patterns: &[&[Pattern]],
) -> Result<Captures<'a>, MatchError> {
    patterns
        .iter()
        .find_map(|pattern| match_script(elements, pattern).ok())
        .ok_or(MatchError::NoMatch)
}
