//! Commitment transactions hide their 48-bit state number in plain sight:
//! the number, XORed with a per-channel obfuscator, is split across the
//! sequence field of the sole input and the locktime field. Knowing both
//! parties' payment basepoints, any broadcast commitment can be mapped back
//! to the state it commits to, which is what lets the watcher tell a current
//! commitment from a revoked one.

use anyhow::ensure;
use bitcoin::{
    absolute,
    hashes::{sha256, Hash, HashEngine},
    secp256k1::PublicKey,
    Sequence, Transaction,
};

/// Number of obfuscator bytes encoded across the sequence and locktime.
pub const STATE_HINT_BYTES: usize = 6;

/// The largest state number the hint layout can carry.
pub const MAX_STATE_NUM: u64 = (1 << 48) - 1;

/// Set on the encoded sequence. Disables relative-timelock semantics for the
/// input, and keeps a commitment's sequence permanently distinct from the
/// finalized sequence that identifies a cooperative close.
const SEQUENCE_LOCKTIME_DISABLE: u32 = 1 << 31;

/// Added to the encoded locktime so it lands in the far future and never
/// delays inclusion of the commitment itself.
const TIMELOCK_SHIFT: u32 = 0x2000_0000;

/// The 48-bit per-channel value XORed into the state number before it is
/// written into a commitment transaction's header fields.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StateHintObfuscator([u8; STATE_HINT_BYTES]);

impl StateHintObfuscator {
    /// Derives the obfuscator for a channel from the two parties' payment
    /// basepoints. The ordering is significant: the channel initiator's
    /// basepoint comes first, so a non-initiator caller passes
    /// `(remote, local)`.
    pub fn derive(initiator: &PublicKey, non_initiator: &PublicKey) -> Self {
        let mut engine = sha256::Hash::engine();
        engine.input(&initiator.serialize());
        engine.input(&non_initiator.serialize());
        let digest = sha256::Hash::from_engine(engine).to_byte_array();

        let mut obfuscator = [0u8; STATE_HINT_BYTES];
        obfuscator.copy_from_slice(&digest[32 - STATE_HINT_BYTES..]);
        Self(obfuscator)
    }

    fn to_u64(self) -> u64 {
        let mut buf = [0u8; 8];
        buf[8 - STATE_HINT_BYTES..].copy_from_slice(&self.0);
        u64::from_be_bytes(buf)
    }
}

/// Writes `state_num`, obfuscated, into `tx`'s first input sequence (upper
/// 24 bits) and locktime (lower 24 bits).
///
/// Errors if `state_num` exceeds [`MAX_STATE_NUM`] or if `tx` does not have
/// exactly one input (a commitment transaction spends only the funding
/// outpoint).
pub fn encode_state_num(
    tx: &mut Transaction,
    state_num: u64,
    obfuscator: StateHintObfuscator,
) -> anyhow::Result<()> {
    ensure!(
        state_num <= MAX_STATE_NUM,
        "State number {state_num} does not fit in 48 bits"
    );
    ensure!(
        tx.input.len() == 1,
        "Commitment transaction must have exactly one input, got {}",
        tx.input.len()
    );

    let xored = state_num ^ obfuscator.to_u64();
    tx.input[0].sequence = Sequence::from_consensus(
        (xored >> 24) as u32 | SEQUENCE_LOCKTIME_DISABLE,
    );
    tx.lock_time = absolute::LockTime::from_consensus(
        (xored & 0xFF_FFFF) as u32 | TIMELOCK_SHIFT,
    );

    Ok(())
}

/// Recovers the obfuscated state number from `tx`'s header fields.
///
/// Never fails: a transaction that was not produced by [`encode_state_num`]
/// simply decodes to a meaningless number, and a transaction with no inputs
/// decodes as if its sequence were zero. Callers are expected to have
/// filtered out cooperative closes (finalized sequence) beforehand.
pub fn decode_state_num(
    tx: &Transaction,
    obfuscator: StateHintObfuscator,
) -> u64 {
    let sequence = tx
        .input
        .first()
        .map(|txin| txin.sequence.to_consensus_u32())
        .unwrap_or(0);
    let lock_time = tx.lock_time.to_consensus_u32();

    let hint = (u64::from(sequence & 0xFF_FFFF) << 24)
        | u64::from(lock_time & 0xFF_FFFF);
    hint ^ obfuscator.to_u64()
}
