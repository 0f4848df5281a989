//! External collaborators the watcher holds handles to but never
//! implements: the transaction signer, the preimage beacon, and the builder
//! that assembles the closure artifacts. All are modelled as small
//! capability traits so callers can plug in their concrete backends.

use bitcoin::{secp256k1::ecdsa::Signature, Amount, Transaction};

use crate::{
    chain::SpendDetail,
    channel::{ChannelSnapshot, Commitment, RevocationStore},
    resolution::{
        BreachRetribution, LocalForceCloseSummary, UnilateralCloseSummary,
    },
};

/// Signs channel-related transactions. The watcher never signs anything
/// itself; it forwards this handle to the artifact builder.
pub trait Signer: Send + Sync {
    /// Produces a signature for `input_index` of `tx` spending an output of
    /// `value` owned by the channel keys.
    fn sign_output(
        &self,
        tx: &Transaction,
        input_index: usize,
        value: Amount,
    ) -> anyhow::Result<Signature>;
}

/// Shared view onto known payment preimages, consulted by the builder when
/// resolving incoming HTLCs on a confirmed commitment.
pub trait PreimageBeacon: Send + Sync {
    fn lookup_preimage(&self, payment_hash: &[u8; 32]) -> Option<[u8; 32]>;
}

/// Builds the closure-specific recovery artifacts from the channel snapshot
/// and the observed spend.
pub trait CloseArtifactBuilder: Send + Sync {
    /// Materials for sweeping our own confirmed commitment.
    fn local_force_close_summary(
        &self,
        snapshot: &ChannelSnapshot,
        signer: &dyn Signer,
        beacon: &dyn PreimageBeacon,
        spending_tx: &Transaction,
        local_commit: &Commitment,
    ) -> anyhow::Result<LocalForceCloseSummary>;

    /// Materials for sweeping the remote party's current confirmed
    /// commitment, including the close summary to persist.
    fn unilateral_close_summary(
        &self,
        snapshot: &ChannelSnapshot,
        signer: &dyn Signer,
        beacon: &dyn PreimageBeacon,
        spend: &SpendDetail,
        remote_commit: &Commitment,
    ) -> anyhow::Result<UnilateralCloseSummary>;

    /// Materials for punishing a revoked-commitment broadcast. `revocation`
    /// is the freshly fetched remote revocation store holding the secret
    /// for `revoked_state_num`.
    fn breach_retribution(
        &self,
        snapshot: &ChannelSnapshot,
        revocation: &RevocationStore,
        revoked_state_num: u64,
        breach_tx: &Transaction,
        spend_height: u32,
    ) -> anyhow::Result<BreachRetribution>;
}
