use thiserror::Error;

use crate::channel::{ChannelCloseSummary, Commitment, RevocationStore};

/// Errors surfaced by the channel persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store holds no active channels (e.g. the channel was already
    /// removed by a concurrent close).
    #[error("no active channels in the channel store")]
    NoActiveChannels,
    /// The channel store has not been created yet.
    #[error("channel store does not exist")]
    NoChannelDb,
    #[error("channel store is corrupt: {0}")]
    Corrupt(String),
    #[error("channel store i/o failed: {0}")]
    Io(String),
}

impl StoreError {
    /// The two sentinel kinds the cooperative close paths tolerate: both
    /// mean the close-summary write was already moot, not that state was
    /// lost.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NoActiveChannels | Self::NoChannelDb)
    }
}

/// The persistence capability the watcher consumes. Implementations must be
/// safe for concurrent use.
pub trait ChannelStore: Send + Sync {
    /// The latest `(local, remote)` commitments. The watcher refuses to
    /// classify a spend without these.
    fn latest_commitments(&self) -> Result<(Commitment, Commitment), StoreError>;

    /// The remote party's revocation store. Must be fetched before a breach
    /// is assessed: it carries the secrets the retribution builder needs.
    fn remote_revocation_store(&self) -> Result<RevocationStore, StoreError>;

    /// Writes the terminal close summary for the channel.
    fn close_channel(&self, summary: &ChannelCloseSummary) -> Result<(), StoreError>;

    /// Durably marks the channel unusable. Written before anything else on
    /// the breach path so the channel stays dead across a crash.
    fn mark_borked(&self) -> Result<(), StoreError>;
}
