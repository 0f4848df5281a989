//! The recovery materials handed to subscribers when a channel closes on
//! chain. These are produced by the external [`CloseArtifactBuilder`]; the
//! watcher only assembles, persists and forwards them.
//!
//! [`CloseArtifactBuilder`]: crate::traits::CloseArtifactBuilder

use bitcoin::{Amount, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::{chain::SpendDetail, channel::ChannelCloseSummary};

/// How to sweep our own to-self output of a confirmed commitment, once its
/// CSV delay matures. Absent when the output was trimmed as dust.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitResolution {
    /// The to-self output on the commitment transaction.
    pub claim_outpoint: OutPoint,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
    /// Blocks the output must age before it can be swept.
    pub maturity_delay: u32,
}

/// Sweep instructions for the HTLC outputs of a confirmed commitment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HtlcResolutions {
    pub incoming: Vec<IncomingHtlcResolution>,
    pub outgoing: Vec<OutgoingHtlcResolution>,
}

/// An HTLC extended to us: claimable with the payment preimage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncomingHtlcResolution {
    pub claim_outpoint: OutPoint,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
    pub payment_hash: [u8; 32],
}

/// An HTLC we extended: reclaimable once its timeout height passes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutgoingHtlcResolution {
    pub claim_outpoint: OutPoint,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
    pub timeout_height: u32,
}

/// Everything needed to act on our own commitment confirming on chain.
#[derive(Clone, Debug)]
pub struct LocalForceCloseSummary {
    pub channel_point: OutPoint,
    /// Our broadcast commitment transaction.
    pub close_tx: Transaction,
    /// Our balance at the broadcast state.
    pub local_balance: Amount,
    pub commit_resolution: Option<CommitResolution>,
    pub htlc_resolutions: HtlcResolutions,
}

/// Everything needed to act on the remote party's *current* commitment
/// confirming on chain, including the close summary the watcher persists.
#[derive(Clone, Debug)]
pub struct UnilateralCloseSummary {
    pub spend_detail: SpendDetail,
    pub close_summary: ChannelCloseSummary,
    pub commit_resolution: Option<CommitResolution>,
    pub htlc_resolutions: HtlcResolutions,
}

/// Everything needed to sweep every output of a revoked commitment to the
/// honest party before the cheater's timelocks expire.
#[derive(Clone, Debug)]
pub struct BreachRetribution {
    pub channel_point: OutPoint,
    pub breach_txid: Txid,
    pub breach_height: u32,
    /// The revoked state the remote party broadcast.
    pub revoked_state_num: u64,
    /// The per-commitment secret revoking that state.
    pub revocation_secret: [u8; 32],
    /// The cheater's own to-self output, claimable by us via the
    /// revocation path.
    pub remote_output: Option<BreachedOutput>,
    /// Our to-self output on their commitment.
    pub local_output: Option<BreachedOutput>,
    pub htlc_outputs: Vec<BreachedOutput>,
}

/// A single sweepable output of a revoked commitment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreachedOutput {
    pub outpoint: OutPoint,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
}
