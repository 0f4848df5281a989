//! The `chain-watch` crate watches the funding outpoint of a single funded
//! two-party payment channel, classifies the transaction that eventually
//! spends it (cooperative close, local force close, remote force close, or
//! revoked-state breach), hands the closure-specific recovery materials to
//! subscribers, and commits the durable close-summary state transitions.
//!
//! Each channel gets its own [`watcher::ChainWatcher`] instance.

/// Chain notifier interface and on-chain event types.
pub mod chain;
/// Channel data model and persisted close summaries.
pub mod channel;
/// Cooperative close negotiation context.
pub mod coop_close;
/// Closure artifacts produced by the external builder.
pub mod resolution;
/// Shutdown signalling.
pub mod shutdown;
/// Commitment state-hint obfuscation codec.
pub mod state_hint;
/// Channel persistence interface.
pub mod store;
/// Named task handles.
pub mod task;
/// External collaborator traits: signer, preimage beacon, artifact builder.
pub mod traits;
/// The per-channel chain watcher.
pub mod watcher;

#[cfg(test)]
mod test_utils;
