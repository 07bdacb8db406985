//! Script evaluation and the signature-verification primitive.
//!
//! This is a deliberately small interpreter: it executes the push opcodes
//! and the stack/crypto opcodes that standard outputs use (P2PK, P2PKH,
//! P2SH, bare data), which is what the verifier pool needs to validate
//! relayed transactions and blocks.

use once_cell::sync::Lazy;
use ripemd160::Ripemd160;
use secp256k1::{Message, PublicKey, Secp256k1, Signature, VerifyOnly};
use sha2::{Digest, Sha256};
use thiserror::Error;

use sable_chain::serialization::sha256d;
use sable_chain::transaction::Transaction;
use sable_chain::transparent::{Input, Output, Script};
use sable_chain::BitcoinSerialize;

static SECP: Lazy<Secp256k1<VerifyOnly>> = Lazy::new(Secp256k1::verification_only);

/// Maximum size of a pushed data element, per the protocol.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum number of executed opcodes per script.
const MAX_OPS_PER_SCRIPT: usize = 201;

/// `SIGHASH_ALL`, the only commitment mode standard wallets produce.
pub const SIGHASH_ALL: u32 = 1;
const SIGHASH_NONE: u32 = 2;
const SIGHASH_SINGLE: u32 = 3;
const SIGHASH_ANYONECANPAY: u32 = 0x80;

// The opcode subset the interpreter executes.
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1NEGATE: u8 = 0x4f;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_NOP: u8 = 0x61;
const OP_VERIFY: u8 = 0x69;
const OP_RETURN: u8 = 0x6a;
const OP_DROP: u8 = 0x75;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_RIPEMD160: u8 = 0xa6;
const OP_SHA256: u8 = 0xa8;
const OP_HASH160: u8 = 0xa9;
const OP_HASH256: u8 = 0xaa;
const OP_CODESEPARATOR: u8 = 0xab;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("OP_RETURN encountered")]
    OpReturn,
    #[error("push exceeds script bounds")]
    BadPush,
    #[error("pushed element exceeds {MAX_SCRIPT_ELEMENT_SIZE} bytes")]
    PushSize,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("OP_VERIFY failed")]
    VerifyFailed,
    #[error("unknown or disabled opcode {0:#04x}")]
    BadOpcode(u8),
    #[error("script has too many opcodes")]
    OpCount,
    #[error("signature hash type {0:#x} does not match the required type")]
    HashTypeMismatch(u32),
    #[error("scriptSig for pay-to-script-hash must be push-only")]
    SigPushOnly,
    #[error("input index {0} is out of range")]
    InputIndex(usize),
}

fn hash160(data: &[u8]) -> Vec<u8> {
    Ripemd160::digest(&Sha256::digest(data)).to_vec()
}

fn hash256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(&Sha256::digest(data)).to_vec()
}

fn is_truthy(element: &[u8]) -> bool {
    // Zero may be encoded with any length, and negative zero is false too.
    for (pos, byte) in element.iter().enumerate() {
        if *byte != 0 {
            return !(pos == element.len() - 1 && *byte == 0x80);
        }
    }
    false
}

/// Is `script` a pay-to-script-hash output: `HASH160 <20 bytes> EQUAL`?
pub fn is_pay_to_script_hash(script: &Script) -> bool {
    let bytes = script.as_bytes();
    bytes.len() == 23 && bytes[0] == OP_HASH160 && bytes[1] == 0x14 && bytes[22] == OP_EQUAL
}

/// Compute the legacy signature hash committed to by a signature over
/// `tx`'s input at `input_index`, with `script_code` standing in for the
/// spent output's script.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    hash_type: u32,
) -> Result<[u8; 32], ScriptError> {
    if input_index >= tx.inputs.len() {
        return Err(ScriptError::InputIndex(input_index));
    }

    let base_type = hash_type & 0x1f;
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;

    // `SIGHASH_SINGLE` with no matching output hashes the constant 1; a
    // bitcoind quirk that consensus now depends on.
    if base_type == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
        let mut one = [0u8; 32];
        one[0] = 1;
        return Ok(one);
    }

    let mut writer = sha256d::Writer::default();
    tx.version
        .bitcoin_serialize(&mut writer)
        .expect("hash writers are infallible");

    // Inputs.
    let own_input = &tx.inputs[input_index];
    let serialize_input = |writer: &mut sha256d::Writer,
                           input: &Input,
                           script: &[u8],
                           sequence_override: Option<u32>| {
        let (outpoint_bytes, sequence) = match input {
            Input::PrevOut {
                outpoint, sequence, ..
            } => (
                outpoint
                    .bitcoin_serialize_to_vec()
                    .expect("serializing into a vec never fails"),
                *sequence,
            ),
            Input::Coinbase { sequence, .. } => (
                sable_chain::transparent::OutPoint::null()
                    .bitcoin_serialize_to_vec()
                    .expect("serializing into a vec never fails"),
                *sequence,
            ),
        };
        (&outpoint_bytes[..])
            .bitcoin_serialize(&mut *writer)
            .expect("hash writers are infallible");
        script
            .to_vec()
            .bitcoin_serialize(&mut *writer)
            .expect("hash writers are infallible");
        sequence_override
            .unwrap_or(sequence)
            .bitcoin_serialize(&mut *writer)
            .expect("hash writers are infallible");
    };

    if anyone_can_pay {
        sable_chain::compactint::CompactInt::from(1)
            .bitcoin_serialize(&mut writer)
            .expect("hash writers are infallible");
        serialize_input(&mut writer, own_input, script_code, None);
    } else {
        sable_chain::compactint::CompactInt::from(tx.inputs.len())
            .bitcoin_serialize(&mut writer)
            .expect("hash writers are infallible");
        for (index, input) in tx.inputs.iter().enumerate() {
            if index == input_index {
                serialize_input(&mut writer, input, script_code, None);
            } else {
                // Other inputs are blanked; NONE and SINGLE also zero their
                // sequence numbers so they stay mutable.
                let sequence = if base_type == SIGHASH_NONE || base_type == SIGHASH_SINGLE {
                    Some(0)
                } else {
                    None
                };
                serialize_input(&mut writer, input, &[], sequence);
            }
        }
    }

    // Outputs.
    match base_type {
        SIGHASH_NONE => {
            sable_chain::compactint::CompactInt::from(0)
                .bitcoin_serialize(&mut writer)
                .expect("hash writers are infallible");
        }
        SIGHASH_SINGLE => {
            let outputs = &tx.outputs[..=input_index];
            sable_chain::compactint::CompactInt::from(outputs.len())
                .bitcoin_serialize(&mut writer)
                .expect("hash writers are infallible");
            for (index, output) in outputs.iter().enumerate() {
                if index == input_index {
                    output
                        .bitcoin_serialize(&mut writer)
                        .expect("hash writers are infallible");
                } else {
                    // Earlier outputs are blanked to value -1, empty script.
                    (-1i64)
                        .bitcoin_serialize(&mut writer)
                        .expect("hash writers are infallible");
                    Vec::<u8>::new()
                        .bitcoin_serialize(&mut writer)
                        .expect("hash writers are infallible");
                }
            }
        }
        _ => {
            tx.outputs
                .bitcoin_serialize(&mut writer)
                .expect("hash writers are infallible");
        }
    }

    tx.locktime
        .bitcoin_serialize(&mut writer)
        .expect("hash writers are infallible");
    hash_type
        .bitcoin_serialize(&mut writer)
        .expect("hash writers are infallible");

    Ok(writer.finish())
}

/// Check one signature against one public key for `tx`'s input at
/// `input_index`. `required_hash_type` of zero accepts any type.
fn check_sig(
    sig_bytes: &[u8],
    pubkey_bytes: &[u8],
    script_code: &[u8],
    tx: &Transaction,
    input_index: usize,
    required_hash_type: u32,
) -> Result<bool, ScriptError> {
    // An empty signature is an ordinary failure, not a script error.
    let (der, hash_type) = match sig_bytes.split_last() {
        Some((last, der)) => (der, *last as u32),
        None => return Ok(false),
    };
    if required_hash_type != 0 && hash_type != required_hash_type {
        return Err(ScriptError::HashTypeMismatch(hash_type));
    }

    let sighash = signature_hash(tx, input_index, script_code, hash_type)?;

    let message = Message::from_slice(&sighash).expect("a 32-byte digest is a valid message");
    let signature = match Signature::from_der(der) {
        Ok(signature) => signature,
        Err(_) => return Ok(false),
    };
    let pubkey = match PublicKey::from_slice(pubkey_bytes) {
        Ok(pubkey) => pubkey,
        Err(_) => return Ok(false),
    };

    Ok(SECP.verify(&message, &signature, &pubkey).is_ok())
}

struct Interpreter<'a> {
    tx: &'a Transaction,
    input_index: usize,
    required_hash_type: u32,
}

impl<'a> Interpreter<'a> {
    fn eval(&self, script: &[u8], stack: &mut Vec<Vec<u8>>) -> Result<(), ScriptError> {
        let mut pc = 0usize;
        let mut op_count = 0usize;
        // CHECKSIG commits to the script from the last OP_CODESEPARATOR on.
        let mut code_start = 0usize;

        while pc < script.len() {
            let opcode = script[pc];
            pc += 1;

            // Pushes.
            if opcode <= OP_PUSHDATA4 {
                let len = match opcode {
                    OP_PUSHDATA1 => {
                        let len = *script.get(pc).ok_or(ScriptError::BadPush)? as usize;
                        pc += 1;
                        len
                    }
                    OP_PUSHDATA2 => {
                        let bytes = script.get(pc..pc + 2).ok_or(ScriptError::BadPush)?;
                        pc += 2;
                        u16::from_le_bytes([bytes[0], bytes[1]]) as usize
                    }
                    OP_PUSHDATA4 => {
                        let bytes = script.get(pc..pc + 4).ok_or(ScriptError::BadPush)?;
                        pc += 4;
                        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                    }
                    direct => direct as usize,
                };
                if len > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
                let data = script.get(pc..pc + len).ok_or(ScriptError::BadPush)?;
                pc += len;
                stack.push(data.to_vec());
                continue;
            }

            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }

            match opcode {
                OP_1NEGATE => stack.push(vec![0x81]),
                OP_1..=OP_16 => stack.push(vec![opcode - OP_1 + 1]),
                OP_NOP => {}
                OP_VERIFY => {
                    let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    if !is_truthy(&top) {
                        return Err(ScriptError::VerifyFailed);
                    }
                }
                OP_RETURN => return Err(ScriptError::OpReturn),
                OP_DROP => {
                    stack.pop().ok_or(ScriptError::StackUnderflow)?;
                }
                OP_DUP => {
                    let top = stack.last().ok_or(ScriptError::StackUnderflow)?.clone();
                    stack.push(top);
                }
                OP_EQUAL | OP_EQUALVERIFY => {
                    let rhs = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    let lhs = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    let equal = lhs == rhs;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::VerifyFailed);
                        }
                    } else {
                        stack.push(vec![equal as u8]);
                    }
                }
                OP_RIPEMD160 => {
                    let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    stack.push(Ripemd160::digest(&top).to_vec());
                }
                OP_SHA256 => {
                    let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    stack.push(Sha256::digest(&top).to_vec());
                }
                OP_HASH160 => {
                    let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    stack.push(hash160(&top));
                }
                OP_HASH256 => {
                    let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    stack.push(hash256(&top));
                }
                OP_CODESEPARATOR => code_start = pc,
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let pubkey = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    let sig = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    let valid = check_sig(
                        &sig,
                        &pubkey,
                        &script[code_start..],
                        self.tx,
                        self.input_index,
                        self.required_hash_type,
                    )?;
                    if opcode == OP_CHECKSIGVERIFY {
                        if !valid {
                            return Err(ScriptError::VerifyFailed);
                        }
                    } else {
                        stack.push(vec![valid as u8]);
                    }
                }
                other => return Err(ScriptError::BadOpcode(other)),
            }
        }
        Ok(())
    }
}

fn is_push_only(script: &[u8]) -> bool {
    let mut pc = 0usize;
    while pc < script.len() {
        let opcode = script[pc];
        pc += 1;
        if opcode > OP_16 {
            return false;
        }
        if opcode <= OP_PUSHDATA4 {
            let len = match opcode {
                OP_PUSHDATA1 => match script.get(pc) {
                    Some(len) => {
                        pc += 1;
                        *len as usize
                    }
                    None => return false,
                },
                OP_PUSHDATA2 => match script.get(pc..pc + 2) {
                    Some(bytes) => {
                        pc += 2;
                        u16::from_le_bytes([bytes[0], bytes[1]]) as usize
                    }
                    None => return false,
                },
                OP_PUSHDATA4 => match script.get(pc..pc + 4) {
                    Some(bytes) => {
                        pc += 4;
                        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                    }
                    None => return false,
                },
                direct => direct as usize,
            };
            if script.get(pc..pc + len).is_none() {
                return false;
            }
            pc += len;
        }
    }
    true
}

/// Verify that `tx`'s input at `input_index` is authorized to spend
/// `output`.
///
/// This is the primitive the verifier pool evaluates in parallel. A
/// `hash_type` of zero accepts signatures with any commitment mode.
pub fn verify_signature(
    output: &Output,
    tx: &Transaction,
    input_index: usize,
    strict_p2sh: bool,
    hash_type: u32,
) -> Result<(), ScriptError> {
    let input = tx
        .inputs
        .get(input_index)
        .ok_or(ScriptError::InputIndex(input_index))?;
    let unlock_script = match input {
        Input::PrevOut { unlock_script, .. } => unlock_script.as_bytes(),
        // Coinbase inputs spend nothing and carry no script to verify.
        Input::Coinbase { .. } => return Ok(()),
    };
    let lock_script = output.lock_script.as_bytes();

    let interpreter = Interpreter {
        tx,
        input_index,
        required_hash_type: hash_type,
    };

    let evaluate_p2sh = strict_p2sh && is_pay_to_script_hash(&output.lock_script);
    if evaluate_p2sh && !is_push_only(unlock_script) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack: Vec<Vec<u8>> = Vec::new();
    interpreter.eval(unlock_script, &mut stack)?;
    let p2sh_stack = stack.clone();

    interpreter.eval(lock_script, &mut stack)?;
    match stack.last() {
        Some(top) if is_truthy(top) => {}
        _ => return Err(ScriptError::EvalFalse),
    }

    if evaluate_p2sh {
        let mut stack = p2sh_stack;
        let redeem_script = stack.pop().ok_or(ScriptError::StackUnderflow)?;
        interpreter.eval(&redeem_script, &mut stack)?;
        match stack.last() {
            Some(top) if is_truthy(top) => {}
            _ => return Err(ScriptError::EvalFalse),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    use sable_chain::amount::Amount;
    use sable_chain::transaction::LockTime;
    use sable_chain::transparent::OutPoint;

    fn output_with_script(script: Vec<u8>) -> Output {
        Output {
            value: Amount::try_from(50_000).unwrap(),
            lock_script: Script(script),
        }
    }

    fn spending_tx(unlock_script: Vec<u8>) -> Transaction {
        Transaction::new(
            1,
            vec![Input::PrevOut {
                outpoint: OutPoint {
                    hash: sable_chain::transaction::Hash([9u8; 32]),
                    index: 0,
                },
                unlock_script: Script(unlock_script),
                sequence: 0xffff_ffff,
            }],
            vec![output_with_script(vec![OP_1])],
            LockTime::unlocked(),
        )
    }

    #[test]
    fn trivial_true_script_passes() {
        let output = output_with_script(vec![OP_1]);
        let tx = spending_tx(vec![]);
        verify_signature(&output, &tx, 0, true, 0).expect("OP_TRUE output is spendable");
    }

    #[test]
    fn trivial_false_script_fails() {
        let output = output_with_script(vec![]);
        let tx = spending_tx(vec![]);
        assert_eq!(
            verify_signature(&output, &tx, 0, true, 0),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn hash_puzzle_roundtrip() {
        // lock: SHA256 <digest> EQUAL, unlock: <preimage>
        let preimage = b"sable".to_vec();
        let digest = Sha256::digest(&preimage);
        let mut lock = vec![OP_SHA256, 32];
        lock.extend_from_slice(&digest);
        lock.push(OP_EQUAL);

        let mut unlock = vec![preimage.len() as u8];
        unlock.extend_from_slice(&preimage);

        let output = output_with_script(lock);
        let tx = spending_tx(unlock);
        verify_signature(&output, &tx, 0, true, 0).expect("correct preimage satisfies the puzzle");

        let bad_tx = spending_tx(vec![1, 0x42]);
        assert!(verify_signature(&output, &bad_tx, 0, true, 0).is_err());
    }

    #[test]
    fn p2sh_redeem_script_is_evaluated_when_strict() {
        // redeem script: OP_1
        let redeem = vec![OP_1];
        let mut lock = vec![OP_HASH160, 0x14];
        lock.extend_from_slice(&hash160(&redeem));
        lock.push(OP_EQUAL);

        // unlock: <redeem>
        let unlock = vec![1, OP_1];

        let output = output_with_script(lock.clone());
        let tx = spending_tx(unlock);
        verify_signature(&output, &tx, 0, true, 0).expect("redeem script evaluates true");

        // A non-push unlock script is a strict-mode violation.
        let sneaky_tx = spending_tx(vec![OP_1, OP_DROP, 1, OP_1]);
        assert_eq!(
            verify_signature(&output, &sneaky_tx, 0, true, 0),
            Err(ScriptError::SigPushOnly)
        );
    }

    #[test]
    fn signed_p2pk_spend_verifies() {
        use secp256k1::{Secp256k1, SecretKey};

        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(&[0x11; 32]).expect("a constant key in range");
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);

        // lock: <pubkey> CHECKSIG
        let pubkey_bytes = public_key.serialize().to_vec();
        let mut lock = vec![pubkey_bytes.len() as u8];
        lock.extend_from_slice(&pubkey_bytes);
        lock.push(OP_CHECKSIG);

        let mut tx = spending_tx(vec![]);
        let sighash = signature_hash(&tx, 0, &lock, SIGHASH_ALL).unwrap();
        let message = Message::from_slice(&sighash).unwrap();
        let mut sig = secp.sign(&message, &secret_key).serialize_der().to_vec();
        sig.push(SIGHASH_ALL as u8);

        let mut unlock = vec![sig.len() as u8];
        unlock.extend_from_slice(&sig);
        tx.inputs[0] = Input::PrevOut {
            outpoint: OutPoint {
                hash: sable_chain::transaction::Hash([9u8; 32]),
                index: 0,
            },
            unlock_script: Script(unlock),
            sequence: 0xffff_ffff,
        };

        let output = output_with_script(lock);
        verify_signature(&output, &tx, 0, true, 0).expect("a correctly signed spend verifies");

        // Flipping a sighash byte invalidates the signature.
        let mut bad_output = output.clone();
        let mut bad_lock = bad_output.lock_script.as_bytes().to_vec();
        bad_lock[1] ^= 0x01;
        bad_output.lock_script = Script(bad_lock);
        assert!(verify_signature(&bad_output, &tx, 0, true, 0).is_err());
    }
}
