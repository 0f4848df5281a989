use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Transaction, Txid};
use tokio::sync::mpsc;

/// A spend of a watched outpoint, as reported by the [`ChainNotifier`].
#[derive(Clone, Debug)]
pub struct SpendDetail {
    pub spender_txid: Txid,
    pub spending_tx: Transaction,
    pub spending_height: u32,
}

/// A confirmation of a watched transaction.
#[derive(Clone, Debug)]
pub struct TxConfirmation {
    pub block_height: u32,
    pub block_hash: BlockHash,
    /// Index of the transaction within its block.
    pub tx_index: u32,
}

/// Deregisters an outstanding notification when the consumer no longer
/// needs it. Dropping the handle without calling [`cancel`] leaves the
/// registration to be cleaned up by the notifier itself.
///
/// [`cancel`]: CancelHandle::cancel
pub struct CancelHandle(Box<dyn FnOnce() + Send>);

impl CancelHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(cancel))
    }

    pub fn cancel(self) {
        (self.0)()
    }
}

/// An active spend registration. The stream yields confirmed spends of the
/// registered outpoint; a closed stream means the notifier went away.
pub struct SpendRegistration {
    pub spends: mpsc::Receiver<SpendDetail>,
    pub cancel: CancelHandle,
}

/// An active confirmation registration, scoped to one txid and a target
/// confirmation depth.
pub struct ConfRegistration {
    pub confirmed: mpsc::Receiver<TxConfirmation>,
    pub cancel: CancelHandle,
}

/// The chain-notification capability the watcher consumes: subscribe to
/// spends of an outpoint, and to confirmations of a transaction. Mempool
/// events are out of scope; only confirmed spends are reported.
///
/// Implementations must be safe for concurrent registration from multiple
/// tasks.
#[async_trait]
pub trait ChainNotifier: Send + Sync {
    /// Registers for a notification when `outpoint` is spent by a confirmed
    /// transaction. `height_hint` bounds the rescan the notifier may need
    /// for spends that predate the registration.
    async fn register_spend(
        &self,
        outpoint: OutPoint,
        height_hint: u32,
    ) -> anyhow::Result<SpendRegistration>;

    /// Registers for a notification once `txid` has `num_confs`
    /// confirmations.
    async fn register_confirmations(
        &self,
        txid: Txid,
        num_confs: u32,
        height_hint: u32,
    ) -> anyhow::Result<ConfRegistration>;
}
