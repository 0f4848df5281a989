use std::fmt::{self, Display};

use bitcoin::{secp256k1::PublicKey, Amount, BlockHash, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};

/// A read-only snapshot of the channel being watched, taken when the watcher
/// is constructed. Anything that advances while the channel is open (the
/// commitments, the revocation state) is deliberately *not* in here; the
/// watcher re-reads those from the [`ChannelStore`] at spend time so it acts
/// on authoritative state.
///
/// [`ChannelStore`]: crate::store::ChannelStore
#[derive(Clone, Debug)]
pub struct ChannelSnapshot {
    /// The funding output; every closure is a spend of this outpoint.
    pub funding_outpoint: OutPoint,
    /// Genesis hash of the chain the channel lives on.
    pub chain_hash: BlockHash,
    /// Total value committed to the channel.
    pub capacity: Amount,
    /// Whether the local party funded (and thus initiated) the channel.
    /// Determines the basepoint ordering for the state-hint obfuscator.
    pub is_initiator: bool,
    pub local_cfg: ChannelConfig,
    pub remote_cfg: ChannelConfig,
    /// The remote node's identity key, recorded in close summaries.
    pub remote_identity: PublicKey,
    pub short_channel_id: ShortChannelId,
    /// Height the funding transaction was broadcast at; used as a fallback
    /// spend-notification height hint while the channel is unconfirmed.
    pub funding_broadcast_height: u32,
}

/// The per-party channel parameters the watcher cares about.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Payment basepoint, one half of the state-hint obfuscator derivation.
    pub payment_basepoint: PublicKey,
    /// CSV delay imposed on this party's to-self outputs.
    pub to_self_delay: u16,
    /// Outputs below this value are trimmed from commitments.
    pub dust_limit: Amount,
}

/// One side's view of the channel at a given state: the signed commitment
/// transaction plus its monotonic state number. Local and remote sides
/// advance independently.
#[derive(Clone, Debug)]
pub struct Commitment {
    /// Monotonic 64-bit state number (48 usable bits on the wire).
    pub height: u64,
    /// The signed commitment transaction for this state.
    pub tx: Transaction,
    pub local_balance: Amount,
    pub remote_balance: Amount,
}

impl Commitment {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

/// Compact channel identifier encoding the funding confirmation location.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub struct ShortChannelId {
    pub block_height: u32,
    pub tx_index: u32,
    pub output_index: u16,
}

impl ShortChannelId {
    /// Packs into the standard u64 wire encoding:
    /// 3 bytes height | 3 bytes tx index | 2 bytes output index.
    pub fn to_u64(self) -> u64 {
        (u64::from(self.block_height) << 40)
            | (u64::from(self.tx_index) << 16)
            | u64::from(self.output_index)
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            block_height: ((raw >> 40) & 0xFF_FFFF) as u32,
            tx_index: ((raw >> 16) & 0xFF_FFFF) as u32,
            output_index: (raw & 0xFFFF) as u16,
        }
    }
}

impl Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            block_height,
            tx_index,
            output_index,
        } = self;
        write!(f, "{block_height}x{tx_index}x{output_index}")
    }
}

/// The revoked per-commitment secrets the remote party has handed us so far,
/// newest last. The watcher itself never reads the secrets; it fetches the
/// store before classifying a spend so the retribution builder sees the
/// latest revocation state.
#[derive(Clone, Debug, Default)]
pub struct RevocationStore {
    secrets: Vec<RevokedSecret>,
}

/// A single revoked commitment secret.
#[derive(Clone, Debug)]
pub struct RevokedSecret {
    pub commit_height: u64,
    pub secret: [u8; 32],
}

impl RevocationStore {
    pub fn new(secrets: Vec<RevokedSecret>) -> Self {
        Self { secrets }
    }

    /// The secret revoking the commitment at `commit_height`, if the remote
    /// has revoked that state.
    pub fn secret_at(&self, commit_height: u64) -> Option<&[u8; 32]> {
        self.secrets
            .iter()
            .find(|revoked| revoked.commit_height == commit_height)
            .map(|revoked| &revoked.secret)
    }
}

/// Which of the four closure paths a channel took.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CloseKind {
    Cooperative,
    LocalForce,
    RemoteForce,
    Breach,
}

/// Whether on-chain resolution of the closing transaction is still pending.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CloseStatus {
    PendingResolution,
    FullyClosed,
}

/// The durable record of a channel closure, written exactly once per
/// terminal dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelCloseSummary {
    pub channel_point: OutPoint,
    pub chain_hash: BlockHash,
    /// The transaction that spent the funding outpoint.
    pub closing_txid: Txid,
    pub close_height: u32,
    pub remote_identity: PublicKey,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub capacity: Amount,
    /// Value settled to us directly by the closing transaction.
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub settled_balance: Amount,
    /// Value owed to us but still behind timelocks (to-self CSV output,
    /// outgoing HTLCs).
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub time_locked_balance: Amount,
    pub kind: CloseKind,
    pub status: CloseStatus,
    pub short_channel_id: ShortChannelId,
}

impl Display for CloseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cooperative => write!(f, "cooperative"),
            Self::LocalForce => write!(f, "local force"),
            Self::RemoteForce => write!(f, "remote force"),
            Self::Breach => write!(f, "breach"),
        }
    }
}
