//! P2SH multisig script codec
//!
//! Builds the `m <pubkey>... n OP_CHECKMULTISIG` redeem script, its P2SH
//! output script and the input script that spends it. Input scripts come in
//! two forms:
//!
//! - **edit**: `OP_0 <slot>... <redeem>` with one slot per public key, an
//!   empty push standing in for a missing signature
//! - **sign**: `OP_0 <sig>... <redeem>` with only the signatures present
//!
//! Signing scripts store the edit form with every slot empty. The signed
//! transaction carries the sign form.

use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::opcodes::OP_0;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Script, ScriptBuf};
use thiserror::Error;

/// Largest key count `OP_CHECKMULTISIG` accepts in P2SH.
pub const MAX_MULTISIG_KEYS: usize = 15;

const OP_PUSHNUM_1: u8 = 0x51;
const OP_PUSHNUM_16: u8 = 0x60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Invalid multisig policy: {minsigs}-of-{keys}")]
    InvalidPolicy { minsigs: usize, keys: usize },
    #[error("Not a multisig input script")]
    Unrecognized,
    #[error("Public key is not part of this script")]
    UnknownPubkey,
    #[error("Push exceeds the script element size limit")]
    PushTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputScriptMode {
    Edit,
    Sign,
}

/// An M-of-N multisig policy with a signature slot per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigScript {
    minsigs: usize,
    pubkeys: Vec<PublicKey>,
    sigs: Vec<Option<Vec<u8>>>,
}

fn push_bytes(bytes: &[u8]) -> Result<PushBytesBuf, ScriptError> {
    PushBytesBuf::try_from(bytes.to_vec()).map_err(|_| ScriptError::PushTooLarge)
}

fn small_int(instruction: &Instruction<'_>) -> Option<usize> {
    match instruction {
        Instruction::Op(op) => {
            let byte = op.to_u8();
            (OP_PUSHNUM_1..=OP_PUSHNUM_16)
                .contains(&byte)
                .then(|| usize::from(byte - OP_PUSHNUM_1 + 1))
        }
        _ => None,
    }
}

impl MultisigScript {
    /// Keys are used in the order given; callers sort them first.
    pub fn new(minsigs: usize, pubkeys: Vec<PublicKey>) -> Result<Self, ScriptError> {
        let keys = pubkeys.len();
        if minsigs == 0 || minsigs > keys || keys > MAX_MULTISIG_KEYS {
            return Err(ScriptError::InvalidPolicy { minsigs, keys });
        }
        Ok(Self {
            minsigs,
            sigs: vec![None; keys],
            pubkeys,
        })
    }

    pub fn minsigs(&self) -> usize {
        self.minsigs
    }

    pub fn pubkeys(&self) -> &[PublicKey] {
        &self.pubkeys
    }

    pub fn redeem_script(&self) -> ScriptBuf {
        let mut builder = Builder::new().push_int(self.minsigs as i64);
        for pubkey in &self.pubkeys {
            builder = builder.push_key(&bitcoin::PublicKey::new(*pubkey));
        }
        builder
            .push_int(self.pubkeys.len() as i64)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script()
    }

    /// `OP_HASH160 <hash160(redeem)> OP_EQUAL`
    pub fn txoutscript(&self) -> ScriptBuf {
        ScriptBuf::new_p2sh(&self.redeem_script().script_hash())
    }

    pub fn txinscript(&self, mode: InputScriptMode) -> Result<ScriptBuf, ScriptError> {
        let mut builder = Builder::new().push_opcode(OP_0);
        for sig in &self.sigs {
            match (sig, mode) {
                (Some(sig), _) => builder = builder.push_slice(push_bytes(sig)?),
                (None, InputScriptMode::Edit) => builder = builder.push_slice(PushBytesBuf::new()),
                (None, InputScriptMode::Sign) => {}
            }
        }
        let redeem = self.redeem_script();
        Ok(builder.push_slice(push_bytes(redeem.as_bytes())?).into_script())
    }

    /// Parse either input script form.
    ///
    /// Sign-form signatures cannot be matched to keys without the sighash,
    /// so they fill the leading slots.
    pub fn parse_txinscript(script: &Script) -> Result<Self, ScriptError> {
        let instructions = script
            .instructions()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ScriptError::Unrecognized)?;

        let (first, rest) = instructions.split_first().ok_or(ScriptError::Unrecognized)?;
        let (last, slots) = rest.split_last().ok_or(ScriptError::Unrecognized)?;
        match first {
            Instruction::PushBytes(push) if push.is_empty() => {}
            _ => return Err(ScriptError::Unrecognized),
        }
        let redeem = match last {
            Instruction::PushBytes(push) => Script::from_bytes(push.as_bytes()),
            _ => return Err(ScriptError::Unrecognized),
        };

        let mut parsed = Self::parse_redeem_script(redeem)?;
        if slots.len() > parsed.pubkeys.len() {
            return Err(ScriptError::Unrecognized);
        }
        for (slot, instruction) in parsed.sigs.iter_mut().zip(slots) {
            match instruction {
                Instruction::PushBytes(push) if push.is_empty() => {}
                Instruction::PushBytes(push) => *slot = Some(push.as_bytes().to_vec()),
                _ => return Err(ScriptError::Unrecognized),
            }
        }
        Ok(parsed)
    }

    pub fn parse_redeem_script(script: &Script) -> Result<Self, ScriptError> {
        let instructions = script
            .instructions()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ScriptError::Unrecognized)?;
        if instructions.len() < 4 {
            return Err(ScriptError::Unrecognized);
        }

        let minsigs = small_int(&instructions[0]).ok_or(ScriptError::Unrecognized)?;
        let count = small_int(&instructions[instructions.len() - 2]).ok_or(ScriptError::Unrecognized)?;
        match instructions[instructions.len() - 1] {
            Instruction::Op(op) if op == OP_CHECKMULTISIG => {}
            _ => return Err(ScriptError::Unrecognized),
        }

        let pubkeys = instructions[1..instructions.len() - 2]
            .iter()
            .map(|instruction| match instruction {
                Instruction::PushBytes(push) => {
                    PublicKey::from_slice(push.as_bytes()).map_err(|_| ScriptError::Unrecognized)
                }
                _ => Err(ScriptError::Unrecognized),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if pubkeys.len() != count {
            return Err(ScriptError::Unrecognized);
        }

        Self::new(minsigs, pubkeys)
    }

    /// Put `sig` in the slot of `pubkey`, replacing any previous one.
    pub fn add_signature(&mut self, pubkey: &PublicKey, sig: Vec<u8>) -> Result<(), ScriptError> {
        let position = self
            .pubkeys
            .iter()
            .position(|k| k == pubkey)
            .ok_or(ScriptError::UnknownPubkey)?;
        self.sigs[position] = Some(sig);
        Ok(())
    }

    pub fn clear_signatures(&mut self) {
        self.sigs.iter_mut().for_each(|sig| *sig = None);
    }

    pub fn signature_count(&self) -> usize {
        self.sigs.iter().filter(|sig| sig.is_some()).count()
    }

    pub fn sigs_needed(&self) -> usize {
        self.minsigs.saturating_sub(self.signature_count())
    }

    /// Keys without a signature, or nothing once enough are present.
    pub fn missing_sigs(&self) -> Vec<PublicKey> {
        if self.sigs_needed() == 0 {
            return Vec::new();
        }
        self.pubkeys
            .iter()
            .zip(&self.sigs)
            .filter(|(_, sig)| sig.is_none())
            .map(|(pubkey, _)| *pubkey)
            .collect()
    }
}

/// Signatures still needed by an input script; 0 if it isn't multisig.
pub fn sigs_needed(script: &Script) -> usize {
    MultisigScript::parse_txinscript(script)
        .map(|multisig| multisig.sigs_needed())
        .unwrap_or(0)
}

/// Keys still missing a signature; empty if the script isn't multisig.
pub fn missing_sigs(script: &Script) -> Vec<PublicKey> {
    MultisigScript::parse_txinscript(script)
        .map(|multisig| multisig.missing_sigs())
        .unwrap_or_default()
}
