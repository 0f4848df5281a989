//! The per-channel chain watcher: registers for a spend of the channel's
//! funding outpoint, classifies the spending transaction when it lands, and
//! dispatches the closure-specific recovery materials to subscribers while
//! committing the durable close-summary transitions.

use std::{
    collections::BTreeMap,
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use anyhow::{bail, Context};
use bitcoin::{Amount, OutPoint, Script, Sequence, Transaction, Txid};
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, info_span, warn};

use crate::{
    chain::{ChainNotifier, SpendDetail},
    channel::{
        ChannelCloseSummary, ChannelSnapshot, CloseKind, CloseStatus,
        Commitment, RevocationStore,
    },
    resolution::{
        BreachRetribution, LocalForceCloseSummary, UnilateralCloseSummary,
    },
    shutdown::ShutdownSignal,
    state_hint::{self, StateHintObfuscator},
    store::ChannelStore,
    task::Task,
    traits::{CloseArtifactBuilder, PreimageBeacon, Signer},
};

/// How a detected spend of the funding outpoint is classified.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpendVerdict {
    /// Our own commitment transaction confirmed.
    LocalForce,
    /// A mutually signed closing transaction confirmed.
    Cooperative,
    /// The remote party's current commitment confirmed.
    RemoteForce,
    /// The remote party broadcast a commitment they had already revoked.
    Breach { state_num: u64 },
}

/// Classifies the transaction spending the funding outpoint.
///
/// 1. Our own commitment is recognised by txid.
/// 2. A finalized first-input sequence identifies a cooperative close;
///    commitments can never carry one because of the state-hint encoding.
/// 3. Anything else is a remote commitment: decode its state number and
///    compare against the remote party's current state. A state at or above
///    the current one is a plain unilateral close (the remote may be one
///    state ahead if they crashed after accepting a new state but before
///    sending us their signature); a state below it was revoked.
///
/// Never panics, whatever the transaction looks like.
pub fn classify_spend(
    spender_txid: Txid,
    spending_tx: &Transaction,
    local_commit_txid: Txid,
    remote_commit_height: u64,
    obfuscator: StateHintObfuscator,
) -> SpendVerdict {
    if spender_txid == local_commit_txid {
        return SpendVerdict::LocalForce;
    }

    let first_input_sequence = spending_tx
        .input
        .first()
        .map(|txin| txin.sequence)
        .unwrap_or(Sequence::ZERO);
    if first_input_sequence == Sequence::MAX {
        return SpendVerdict::Cooperative;
    }

    let state_num = state_hint::decode_state_num(spending_tx, obfuscator);
    if state_num >= remote_commit_height {
        SpendVerdict::RemoteForce
    } else {
        SpendVerdict::Breach { state_num }
    }
}

/// Delivery payload for a local force close.
#[derive(Clone, Debug)]
pub struct LocalCloseInfo {
    pub spend: SpendDetail,
    pub force_close: LocalForceCloseSummary,
    /// The summary persisted for this close, balances included, so
    /// subscribers need no store read of their own.
    pub close_summary: ChannelCloseSummary,
}

/// Subscriber half of a close-event subscription: four capacity-1 delivery
/// slots, one per closure kind, plus (for `sync_dispatch` subscribers) the
/// sender used to acknowledge a breach hand-off.
///
/// The watcher owns the sender side of every slot; receivers stay usable
/// after [`cancel`], so an already-delivered value can still be drained.
///
/// [`cancel`]: CloseEventSubscription::cancel
pub struct CloseEventSubscription {
    /// The channel this subscription reports on.
    pub channel_point: OutPoint,
    /// Fires when the remote party's current commitment confirms.
    pub remote_unilateral: mpsc::Receiver<UnilateralCloseSummary>,
    /// Fires when our own commitment confirms.
    pub local_unilateral: mpsc::Receiver<LocalCloseInfo>,
    /// Empty signal fired when a cooperative close is detected or confirms.
    pub cooperative: mpsc::Receiver<()>,
    /// Fires when a revoked commitment confirms, carrying the retribution.
    pub breach: mpsc::Receiver<BreachRetribution>,
    /// Present iff the subscription asked for synchronous dispatch: the
    /// watcher blocks breach processing until a result is sent here. An
    /// `Err` aborts the dispatch before the close summary is persisted.
    pub breach_ack: Option<mpsc::Sender<anyhow::Result<()>>>,
    registry: Arc<Mutex<Registry>>,
    id: u64,
}

impl CloseEventSubscription {
    /// Removes this subscription from the watcher. Once this returns, no
    /// further notifications will be delivered, even if a dispatch is
    /// racing: removal is serialised with delivery.
    pub async fn cancel(&self) {
        self.registry.lock().await.slots.remove(&self.id);
    }
}

/// Watcher-side sender halves of one subscription.
struct SubscriptionSlots {
    remote_unilateral: mpsc::Sender<UnilateralCloseSummary>,
    local_unilateral: mpsc::Sender<LocalCloseInfo>,
    cooperative: mpsc::Sender<()>,
    breach: mpsc::Sender<BreachRetribution>,
    breach_ack: Option<mpsc::Receiver<anyhow::Result<()>>>,
}

/// All subscription state, behind one async mutex. Holding the lock across
/// an entire fan-out is what makes `cancel` a hard barrier: a subscription
/// removed before a dispatch acquires the lock can no longer be delivered
/// to.
#[derive(Default)]
struct Registry {
    next_id: u64,
    slots: BTreeMap<u64, SubscriptionSlots>,
}

/// Everything a [`ChainWatcher`] needs at construction.
pub struct ChainWatcherConfig {
    pub snapshot: ChannelSnapshot,
    pub notifier: Arc<dyn ChainNotifier>,
    pub store: Arc<dyn ChannelStore>,
    pub builder: Arc<dyn CloseArtifactBuilder>,
    pub signer: Arc<dyn Signer>,
    pub preimage_beacon: Arc<dyn PreimageBeacon>,
    /// The address-ownership oracle, asked per output script when summing
    /// the to-self value of a cooperative close.
    pub is_our_script: Arc<dyn Fn(&Script) -> bool + Send + Sync>,
    /// Marks the channel fully closed in persistence once a cooperative
    /// closing transaction confirms.
    pub mark_fully_closed: Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>,
}

/// Watches the funding outpoint of a single channel and reacts to the one
/// spend that ends it. Construct with [`ChainWatcher::new`], wrap in an
/// [`Arc`], then [`start`].
///
/// [`start`]: ChainWatcher::start
pub struct ChainWatcher {
    started: AtomicBool,
    stopped: AtomicBool,
    pub(crate) shutdown: ShutdownSignal,
    /// Observer plus any cooperative waiters; all joined on stop.
    tasks: StdMutex<Vec<Task<()>>>,

    pub(crate) snapshot: ChannelSnapshot,
    obfuscator: StateHintObfuscator,

    pub(crate) notifier: Arc<dyn ChainNotifier>,
    pub(crate) store: Arc<dyn ChannelStore>,
    builder: Arc<dyn CloseArtifactBuilder>,
    signer: Arc<dyn Signer>,
    preimage_beacon: Arc<dyn PreimageBeacon>,
    is_our_script: Arc<dyn Fn(&Script) -> bool + Send + Sync>,
    pub(crate) mark_fully_closed:
        Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>,

    registry: Arc<Mutex<Registry>>,
}

impl ChainWatcher {
    pub fn new(config: ChainWatcherConfig) -> Self {
        let ChainWatcherConfig {
            snapshot,
            notifier,
            store,
            builder,
            signer,
            preimage_beacon,
            is_our_script,
            mark_fully_closed,
        } = config;

        // Reconstruct the obfuscator hiding the commitment state numbers:
        // initiator's payment basepoint first.
        let local_basepoint = &snapshot.local_cfg.payment_basepoint;
        let remote_basepoint = &snapshot.remote_cfg.payment_basepoint;
        let obfuscator = if snapshot.is_initiator {
            StateHintObfuscator::derive(local_basepoint, remote_basepoint)
        } else {
            StateHintObfuscator::derive(remote_basepoint, local_basepoint)
        };

        Self {
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown: ShutdownSignal::new(),
            tasks: StdMutex::new(Vec::new()),
            snapshot,
            obfuscator,
            notifier,
            store,
            builder,
            signer,
            preimage_beacon,
            is_our_script,
            mark_fully_closed,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Registers the funding-outpoint spend notification and launches the
    /// close observer. Idempotent; a second call is a no-op.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let channel = self.snapshot.funding_outpoint;
        debug!("Starting chain watcher for channel {channel}");

        // The confirmation height is the better hint, but fall back to the
        // broadcast height while the funding transaction is unconfirmed.
        let height_hint = self
            .snapshot
            .short_channel_id
            .block_height
            .max(self.snapshot.funding_broadcast_height);

        let registration = self
            .notifier
            .register_spend(channel, height_hint)
            .await
            .context("Failed to register funding outpoint spend ntfn")?;

        let watcher = Arc::clone(self);
        self.track_task(Task::spawn_with_span(
            format!("close observer {channel}"),
            info_span!("(close-observer)"),
            async move { watcher.close_observer(registration.spends).await },
        ));

        Ok(())
    }

    /// Signals shutdown and waits for the observer and any cooperative
    /// waiters to return. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.send();

        let tasks = mem::take(&mut *self.tasks.lock().unwrap());
        let mut tasks = tasks.into_iter().collect::<FuturesUnordered<_>>();
        while let Some(result) = tasks.next().await {
            // Panics were already propagated by `Task`; anything left is an
            // abort, which we don't use.
            debug_assert!(result.is_ok());
        }
    }

    pub(crate) fn track_task(&self, task: Task<()>) {
        self.tasks.lock().unwrap().push(task);
    }

    /// Whether the observer and all spawned waiters have returned.
    #[cfg(test)]
    pub(crate) fn tasks_finished(&self) -> bool {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .all(|task| task.is_finished())
    }

    /// Returns a new subscription to this channel's close events. Pass
    /// `sync_dispatch = true` to make the watcher await an acknowledgement
    /// (via [`CloseEventSubscription::breach_ack`]) before it persists a
    /// breach close.
    pub async fn subscribe(
        &self,
        sync_dispatch: bool,
    ) -> CloseEventSubscription {
        let (remote_tx, remote_rx) = mpsc::channel(1);
        let (local_tx, local_rx) = mpsc::channel(1);
        let (coop_tx, coop_rx) = mpsc::channel(1);
        let (breach_tx, breach_rx) = mpsc::channel(1);
        let (ack_tx, ack_rx) = if sync_dispatch {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let mut registry = self.registry.lock().await;
        let id = registry.next_id;
        registry.next_id += 1;
        registry.slots.insert(
            id,
            SubscriptionSlots {
                remote_unilateral: remote_tx,
                local_unilateral: local_tx,
                cooperative: coop_tx,
                breach: breach_tx,
                breach_ack: ack_rx,
            },
        );
        drop(registry);

        debug!(
            "New close event subscription (id={id}) for channel {}",
            self.snapshot.funding_outpoint
        );

        CloseEventSubscription {
            channel_point: self.snapshot.funding_outpoint,
            remote_unilateral: remote_rx,
            local_unilateral: local_rx,
            cooperative: coop_rx,
            breach: breach_rx,
            breach_ack: ack_tx,
            registry: Arc::clone(&self.registry),
            id,
        }
    }

    /// Consumes exactly one spend of the funding outpoint, dispatches on
    /// it, and returns. Also returns if the notifier goes away (the owning
    /// supervisor restarts us on policy) or on shutdown.
    async fn close_observer(
        self: Arc<Self>,
        mut spends: mpsc::Receiver<SpendDetail>,
    ) {
        let channel = self.snapshot.funding_outpoint;
        info!("Close observer for channel {channel} active");

        let spend = tokio::select! {
            maybe_spend = spends.recv() => match maybe_spend {
                Some(spend) => spend,
                None => {
                    debug!("Spend ntfn stream closed; close observer exiting");
                    return;
                }
            },
            () = self.shutdown.recv() => return,
        };

        if let Err(err) = self.handle_spend(spend).await {
            error!("Unable to dispatch close for channel {channel}: {err:#}");
        }
    }

    /// Classifies the spend and runs the matching dispatch routine.
    async fn handle_spend(
        self: &Arc<Self>,
        spend: SpendDetail,
    ) -> anyhow::Result<()> {
        let channel = self.snapshot.funding_outpoint;

        // Both commitments and the revocation state are re-read from the
        // store; we refuse to dispatch on anything less than authoritative
        // state. The revocation fetch also refreshes the state consumed by
        // the retribution builder.
        let (local_commit, remote_commit) = self
            .store
            .latest_commitments()
            .context("Unable to fetch latest commitments")?;
        let revocation_store = self
            .store
            .remote_revocation_store()
            .context("Unable to fetch remote revocation store")?;

        let verdict = classify_spend(
            spend.spender_txid,
            &spend.spending_tx,
            local_commit.txid(),
            remote_commit.height,
            self.obfuscator,
        );

        match verdict {
            SpendVerdict::LocalForce =>
                self.dispatch_local_force_close(spend, local_commit).await,
            SpendVerdict::Cooperative =>
                self.dispatch_cooperative_close(spend).await,
            SpendVerdict::RemoteForce => {
                warn!("Unprompted commitment broadcast for channel {channel}");
                self.dispatch_remote_force_close(spend, remote_commit).await
            }
            SpendVerdict::Breach { state_num } =>
                self.dispatch_breach(
                    spend,
                    remote_commit,
                    revocation_store,
                    state_num,
                )
                .await,
        }
    }

    /// Sums the outputs of `tx` paying to scripts the ownership oracle
    /// recognises as ours. Zero is possible: our output may have been
    /// trimmed as dust.
    fn to_self_amount(&self, tx: &Transaction) -> Amount {
        tx.output
            .iter()
            .filter(|txout| (self.is_our_script)(&txout.script_pubkey))
            .map(|txout| txout.value)
            .fold(Amount::ZERO, |acc, value| acc + value)
    }

    fn close_summary_base(&self, spend: &SpendDetail) -> ChannelCloseSummary {
        ChannelCloseSummary {
            channel_point: self.snapshot.funding_outpoint,
            chain_hash: self.snapshot.chain_hash,
            closing_txid: spend.spender_txid,
            close_height: spend.spending_height,
            remote_identity: self.snapshot.remote_identity,
            capacity: self.snapshot.capacity,
            settled_balance: Amount::ZERO,
            time_locked_balance: Amount::ZERO,
            kind: CloseKind::Cooperative,
            status: CloseStatus::PendingResolution,
            short_channel_id: self.snapshot.short_channel_id,
        }
    }

    /// Our own commitment confirmed: persist the close summary, then hand
    /// subscribers the sweep materials.
    async fn dispatch_local_force_close(
        &self,
        spend: SpendDetail,
        local_commit: Commitment,
    ) -> anyhow::Result<()> {
        let channel = self.snapshot.funding_outpoint;
        info!("Local unilateral close of channel {channel} detected");

        let force_close = self
            .builder
            .local_force_close_summary(
                &self.snapshot,
                self.signer.as_ref(),
                self.preimage_beacon.as_ref(),
                &spend.spending_tx,
                &local_commit,
            )
            .context("Unable to build local force close summary")?;

        let mut close_summary = self.close_summary_base(&spend);
        close_summary.closing_txid = force_close.close_tx.compute_txid();
        close_summary.kind = CloseKind::LocalForce;

        // Our to-self output may have been trimmed as dust, in which case
        // there is no commit resolution and no balance behind a timelock.
        if force_close.commit_resolution.is_some() {
            close_summary.settled_balance = local_commit.local_balance;
            close_summary.time_locked_balance = local_commit.local_balance;
        }
        for htlc in &force_close.htlc_resolutions.outgoing {
            close_summary.time_locked_balance += htlc.value;
        }

        self.store
            .close_channel(&close_summary)
            .context("Unable to persist close summary")?;

        let close_info = LocalCloseInfo {
            spend,
            force_close,
            close_summary,
        };
        let registry = self.registry.lock().await;
        for slots in registry.slots.values() {
            tokio::select! {
                res = slots.local_unilateral.send(close_info.clone()) => {
                    // An Err means the subscriber dropped its receiver.
                    let _ = res;
                }
                () = self.shutdown.recv() =>
                    bail!("Chain watcher shutting down"),
            }
        }

        Ok(())
    }

    /// The remote party's current commitment confirmed: persist the close
    /// summary the builder assembled, then notify subscribers.
    async fn dispatch_remote_force_close(
        &self,
        spend: SpendDetail,
        remote_commit: Commitment,
    ) -> anyhow::Result<()> {
        let channel = self.snapshot.funding_outpoint;
        info!("Unilateral close of channel {channel} detected");

        let uni_close = self
            .builder
            .unilateral_close_summary(
                &self.snapshot,
                self.signer.as_ref(),
                self.preimage_beacon.as_ref(),
                &spend,
                &remote_commit,
            )
            .context("Unable to build unilateral close summary")?;

        self.store
            .close_channel(&uni_close.close_summary)
            .context("Unable to persist close summary")?;

        // TODO: should subscribers acknowledge the hand-off before the
        // summary hits disk, the way the breach path does? Repeated ntfns
        // after a crash are harmless (at-least-once), so keep this order.
        let registry = self.registry.lock().await;
        for slots in registry.slots.values() {
            tokio::select! {
                res = slots.remote_unilateral.send(uni_close.clone()) => {
                    let _ = res;
                }
                () = self.shutdown.recv() =>
                    bail!("Chain watcher shutting down"),
            }
        }

        Ok(())
    }

    /// A mutually signed closing transaction confirmed outside any
    /// negotiation context we were told about: record the pending close,
    /// arrange for the fully-closed mark once it confirms, and notify
    /// subscribers.
    async fn dispatch_cooperative_close(
        self: &Arc<Self>,
        spend: SpendDetail,
    ) -> anyhow::Result<()> {
        let channel = self.snapshot.funding_outpoint;
        info!(
            "Cooperative closure of channel {channel} by txid={}",
            spend.spender_txid
        );

        let mut close_summary = self.close_summary_base(&spend);
        close_summary.settled_balance =
            self.to_self_amount(&spend.spending_tx);

        match self.store.close_channel(&close_summary) {
            Ok(()) => (),
            Err(err) if err.is_benign() =>
                debug!("Tolerating benign close error: {err}"),
            Err(err) => return Err(err)
                .context("Unable to persist cooperative close summary"),
        }

        // TODO: a reported spend may already imply one confirmation, which
        // would let us skip PendingResolution here. Keep the two-stage
        // close until the notifier contract guarantees that.
        self.spawn_fully_closed_waiter(
            spend.spender_txid,
            spend.spending_height,
        );

        self.notify_cooperative_close().await
    }

    /// Spawns the waiter that marks the channel fully closed once the
    /// cooperative closing transaction has one confirmation.
    fn spawn_fully_closed_waiter(
        self: &Arc<Self>,
        closing_txid: Txid,
        height_hint: u32,
    ) {
        let watcher = Arc::clone(self);
        self.track_task(Task::spawn(
            format!("coop close conf {closing_txid}"),
            async move {
                let channel = watcher.snapshot.funding_outpoint;
                let registration = match watcher
                    .notifier
                    .register_confirmations(closing_txid, 1, height_hint)
                    .await
                {
                    Ok(registration) => registration,
                    Err(err) => {
                        error!("Unable to register for conf: {err:#}");
                        return;
                    }
                };
                let mut confirmed = registration.confirmed;

                info!(
                    "Waiting for txid={closing_txid} to close channel \
                     {channel} on chain"
                );

                tokio::select! {
                    maybe_conf = confirmed.recv() => match maybe_conf {
                        Some(conf) => {
                            info!(
                                "Channel {channel} is fully closed at \
                                 height {}",
                                conf.block_height
                            );
                            if let Err(err) = (watcher.mark_fully_closed)() {
                                error!(
                                    "Unable to mark channel fully closed: \
                                     {err:#}"
                                );
                            }
                        }
                        None => debug!("Conf ntfn stream closed; exiting"),
                    },
                    () = watcher.shutdown.recv() => (),
                }
            },
        ));
    }

    /// Fans the empty cooperative-close signal out to every subscriber.
    /// Shared between the observed path and the negotiation context's
    /// winning waiter.
    pub(crate) async fn notify_cooperative_close(&self) -> anyhow::Result<()> {
        let registry = self.registry.lock().await;
        for slots in registry.slots.values() {
            tokio::select! {
                res = slots.cooperative.send(()) => {
                    let _ = res;
                }
                () = self.shutdown.recv() =>
                    bail!("Chain watcher shutting down"),
            }
        }
        Ok(())
    }

    /// The remote party broadcast a revoked commitment. Bork the channel
    /// first so it stays unusable even across a crash, hand every
    /// subscriber the retribution, await each synchronous subscriber's
    /// acknowledgement, and only then persist the close summary: the party
    /// responsible for sweeping must have committed to the retribution plan
    /// before we forget it is in flight.
    async fn dispatch_breach(
        &self,
        spend: SpendDetail,
        remote_commit: Commitment,
        revocation_store: RevocationStore,
        state_num: u64,
    ) -> anyhow::Result<()> {
        let channel = self.snapshot.funding_outpoint;
        warn!(
            "Remote peer breached the contract for channel {channel}! \
             Revoked state #{state_num} was broadcast"
        );

        self.store
            .mark_borked()
            .context("Unable to mark channel borked")?;

        let retribution = self
            .builder
            .breach_retribution(
                &self.snapshot,
                &revocation_store,
                state_num,
                &spend.spending_tx,
                spend.spending_height,
            )
            .context("Unable to build breach retribution")?;

        let mut registry = self.registry.lock().await;
        for slots in registry.slots.values_mut() {
            let delivered = tokio::select! {
                res = slots.breach.send(retribution.clone()) => res.is_ok(),
                () = self.shutdown.recv() =>
                    bail!("Chain watcher shutting down"),
            };
            if !delivered {
                // Subscriber dropped its receiver without cancelling; no
                // hand-off to wait on.
                continue;
            }

            if let Some(ack_rx) = slots.breach_ack.as_mut() {
                tokio::select! {
                    maybe_ack = ack_rx.recv() => match maybe_ack {
                        Some(Ok(())) => (),
                        Some(Err(err)) => return Err(err)
                            .context("Breach retribution hand-off failed"),
                        None => bail!(
                            "Sync subscriber dropped its ack sender"
                        ),
                    },
                    () = self.shutdown.recv() =>
                        bail!("Chain watcher shutting down"),
                }
            }
        }
        drop(registry);

        let mut close_summary = self.close_summary_base(&spend);
        close_summary.kind = CloseKind::Breach;
        close_summary.settled_balance = remote_commit.local_balance;

        info!("Breached channel {channel} marked pending-closed");
        self.store
            .close_channel(&close_summary)
            .context("Unable to persist breach close summary")?;

        Ok(())
    }
}
