//! During a cooperative close negotiation we sign multiple versions of the
//! closing transaction, any of which the remote party may counter-sign and
//! broadcast. The negotiation context tracks every candidate and watches
//! the chain for each; whichever confirms first wins, cancels its siblings,
//! and drives the terminal close.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex as StdMutex},
};

use anyhow::Context;
use bitcoin::Txid;
use tracing::{debug, error, info, warn};

use crate::{
    channel::ChannelCloseSummary, shutdown::ShutdownSignal, task::Task,
    watcher::ChainWatcher,
};

/// A cooperative close negotiation in progress. Obtain one from
/// [`ChainWatcher::begin_cooperative_close`] before sending the first
/// signature to the remote party, then feed it every candidate close via
/// [`log_potential_close`] *before* transmitting that candidate.
///
/// [`log_potential_close`]: CooperativeCloseContext::log_potential_close
pub struct CooperativeCloseContext {
    watcher: Arc<ChainWatcher>,
    /// Closing txids already being watched; duplicates are no-ops.
    active_closes: StdMutex<HashSet<Txid>>,
    /// Raised by the first candidate to confirm; ends the sibling waiters.
    cancel: ShutdownSignal,
}

impl ChainWatcher {
    /// Opens a cooperative close negotiation context for this channel.
    pub fn begin_cooperative_close(
        self: &Arc<Self>,
    ) -> CooperativeCloseContext {
        CooperativeCloseContext {
            watcher: Arc::clone(self),
            active_closes: StdMutex::new(HashSet::new()),
            cancel: ShutdownSignal::new(),
        }
    }
}

impl CooperativeCloseContext {
    /// Registers a newly signed candidate closing transaction, identified
    /// by `potential_close.closing_txid`, and watches the chain for it.
    /// Logging the same txid twice is a no-op. The first candidate to
    /// confirm notifies subscribers, persists its summary, and marks the
    /// channel fully closed; the others exit without side effects, as do
    /// all waiters if the watcher shuts down.
    pub fn log_potential_close(&self, potential_close: ChannelCloseSummary) {
        let closing_txid = potential_close.closing_txid;
        if !self.active_closes.lock().unwrap().insert(closing_txid) {
            return;
        }

        let watcher = Arc::clone(&self.watcher);
        let cancel = self.cancel.clone();
        self.watcher.track_task(Task::spawn(
            format!("coop close watch {closing_txid}"),
            async move {
                watch_candidate(watcher, cancel, potential_close).await
            },
        ));
    }

    /// Called once both parties have agreed on `preferred_close`. Persists
    /// it as the pending close immediately, then watches it like any other
    /// candidate. Confirmation, not finalisation, is what completes the
    /// context.
    pub fn finalize(
        &self,
        preferred_close: ChannelCloseSummary,
    ) -> anyhow::Result<()> {
        let channel = self.watcher.snapshot.funding_outpoint;
        info!("Finalizing cooperative close for channel {channel}");

        self.watcher
            .store
            .close_channel(&preferred_close)
            .context("Unable to persist preferred close summary")?;

        self.log_potential_close(preferred_close);

        Ok(())
    }
}

/// One candidate's waiter: registers a one-confirmation notification and
/// waits for whichever comes first of its confirmation, a sibling winning,
/// or watcher shutdown.
async fn watch_candidate(
    watcher: Arc<ChainWatcher>,
    cancel: ShutdownSignal,
    potential_close: ChannelCloseSummary,
) {
    let channel = watcher.snapshot.funding_outpoint;
    let closing_txid = potential_close.closing_txid;

    let registration = match watcher
        .notifier
        .register_confirmations(
            closing_txid,
            1,
            potential_close.close_height,
        )
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
        "Waiting for txid={closing_txid} to close channel {channel} on chain"
    );

    tokio::select! {
        maybe_conf = confirmed.recv() => match maybe_conf {
            Some(conf) => {
                info!(
                    "Channel {channel} is fully closed at height {}",
                    conf.block_height
                );

                // We won; end the sibling waiters.
                cancel.send();

                if let Err(err) = watcher.notify_cooperative_close().await {
                    // Shutdown raced the win; leave the close to the next
                    // startup's recovery rather than half-dispatching.
                    debug!("Skipping close completion: {err:#}");
                    return;
                }

                if let Err(err) =
                    watcher.store.close_channel(&potential_close)
                {
                    warn!(
                        "Unable to update latest close for channel \
                         {channel}: {err:#}"
                    );
                }

                if let Err(err) = (watcher.mark_fully_closed)() {
                    error!("Unable to mark channel fully closed: {err:#}");
                }
            }
            None => debug!("Conf ntfn stream closed; exiting"),
        },
        () = cancel.recv() => debug!(
            "Exiting watch for close of txid={closing_txid} for channel \
             {channel}"
        ),
        () = watcher.shutdown.recv() => (),
    }
}
