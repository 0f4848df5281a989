//! Shared mocks and fixtures for this crate's tests.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::bail;
use async_trait::async_trait;
use bitcoin::{
    absolute,
    hashes::Hash as _,
    secp256k1::{ecdsa::Signature, PublicKey, Secp256k1, SecretKey},
    transaction, Amount, BlockHash, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use tokio::sync::mpsc;

use crate::{
    chain::{
        CancelHandle, ChainNotifier, ConfRegistration, SpendDetail,
        SpendRegistration, TxConfirmation,
    },
    channel::{
        ChannelCloseSummary, ChannelConfig, ChannelSnapshot, CloseKind,
        CloseStatus, Commitment, RevocationStore, ShortChannelId,
    },
    resolution::{
        BreachRetribution, CommitResolution, HtlcResolutions,
        LocalForceCloseSummary, OutgoingHtlcResolution,
        UnilateralCloseSummary,
    },
    state_hint::{self, StateHintObfuscator},
    store::{ChannelStore, StoreError},
    traits::{CloseArtifactBuilder, PreimageBeacon, Signer},
    watcher::{ChainWatcher, ChainWatcherConfig},
};

pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `predicate` until it returns true or ~5 seconds pass.
pub(crate) async fn wait_until(predicate: impl Fn() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for condition");
}

// --- deterministic fixtures --- //

pub(crate) fn pubkey(byte: u8) -> PublicKey {
    let secp = Secp256k1::new();
    let secret_key = SecretKey::from_slice(&[byte; 32]).unwrap();
    PublicKey::from_secret_key(&secp, &secret_key)
}

/// `(local, remote)` payment basepoints; the local party is the initiator.
pub(crate) fn payment_basepoints() -> (PublicKey, PublicKey) {
    (pubkey(0x11), pubkey(0x22))
}

pub(crate) fn obfuscator() -> StateHintObfuscator {
    let (local, remote) = payment_basepoints();
    StateHintObfuscator::derive(&local, &remote)
}

pub(crate) fn funding_outpoint() -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([0x42; 32]),
        vout: 0,
    }
}

pub(crate) fn arbitrary_txid(byte: u8) -> Txid {
    Txid::from_byte_array([byte; 32])
}

pub(crate) fn our_script() -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0xAA])
}

pub(crate) fn their_script() -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0xBB])
}

/// A minimal transaction spending the funding outpoint.
pub(crate) fn one_input_tx() -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: funding_outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

/// A commitment at `height` with the state hint encoded. The output value
/// tracks `local_balance_sat` so commitments with different balances get
/// different txids.
pub(crate) fn commitment(
    height: u64,
    local_balance_sat: u64,
    remote_balance_sat: u64,
) -> Commitment {
    let mut tx = one_input_tx();
    tx.output[0].value = Amount::from_sat(local_balance_sat);
    state_hint::encode_state_num(&mut tx, height, obfuscator()).unwrap();
    Commitment {
        height,
        tx,
        local_balance: Amount::from_sat(local_balance_sat),
        remote_balance: Amount::from_sat(remote_balance_sat),
    }
}

/// A mutually signed closing transaction: finalized sequence, one output
/// to us and one to them.
pub(crate) fn coop_close_tx(our_sat: u64, their_sat: u64) -> Transaction {
    let mut tx = one_input_tx();
    tx.input[0].sequence = Sequence::MAX;
    tx.output = vec![
        TxOut {
            value: Amount::from_sat(our_sat),
            script_pubkey: our_script(),
        },
        TxOut {
            value: Amount::from_sat(their_sat),
            script_pubkey: their_script(),
        },
    ];
    tx
}

pub(crate) fn spend_detail(tx: &Transaction, height: u32) -> SpendDetail {
    SpendDetail {
        spender_txid: tx.compute_txid(),
        spending_tx: tx.clone(),
        spending_height: height,
    }
}

pub(crate) fn snapshot() -> ChannelSnapshot {
    let (local_basepoint, remote_basepoint) = payment_basepoints();
    ChannelSnapshot {
        funding_outpoint: funding_outpoint(),
        chain_hash: BlockHash::all_zeros(),
        capacity: Amount::from_sat(100_000),
        is_initiator: true,
        local_cfg: ChannelConfig {
            payment_basepoint: local_basepoint,
            to_self_delay: 144,
            dust_limit: Amount::from_sat(354),
        },
        remote_cfg: ChannelConfig {
            payment_basepoint: remote_basepoint,
            to_self_delay: 144,
            dust_limit: Amount::from_sat(354),
        },
        remote_identity: pubkey(0x33),
        short_channel_id: ShortChannelId {
            block_height: 700_000,
            tx_index: 5,
            output_index: 0,
        },
        funding_broadcast_height: 699_990,
    }
}

/// A candidate cooperative close summary for the negotiation context.
pub(crate) fn cooperative_summary(
    closing_txid: Txid,
    close_height: u32,
) -> ChannelCloseSummary {
    let snapshot = snapshot();
    ChannelCloseSummary {
        channel_point: snapshot.funding_outpoint,
        chain_hash: snapshot.chain_hash,
        closing_txid,
        close_height,
        remote_identity: snapshot.remote_identity,
        capacity: snapshot.capacity,
        settled_balance: Amount::from_sat(40_000),
        time_locked_balance: Amount::ZERO,
        kind: CloseKind::Cooperative,
        status: CloseStatus::PendingResolution,
        short_channel_id: snapshot.short_channel_id,
    }
}

pub(crate) fn confirmation(block_height: u32) -> TxConfirmation {
    TxConfirmation {
        block_height,
        block_hash: BlockHash::all_zeros(),
        tx_index: 1,
    }
}

// --- MockNotifier --- //

pub(crate) struct MockNotifier {
    inner: StdMutex<NotifierInner>,
}

#[derive(Default)]
struct NotifierInner {
    spend_senders: Vec<mpsc::Sender<SpendDetail>>,
    conf_regs: Vec<ConfReg>,
}

struct ConfReg {
    txid: Txid,
    num_confs: u32,
    confirmed_tx: mpsc::Sender<TxConfirmation>,
}

impl MockNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StdMutex::new(NotifierInner::default()),
        })
    }

    pub fn spend_reg_count(&self) -> usize {
        self.inner.lock().unwrap().spend_senders.len()
    }

    /// The sender feeding the watcher's (sole) spend registration.
    pub fn spend_sender(&self) -> mpsc::Sender<SpendDetail> {
        self.inner
            .lock()
            .unwrap()
            .spend_senders
            .first()
            .cloned()
            .expect("No spend registration yet")
    }

    /// Drops every registered spend sender, closing the watcher's stream
    /// as if the notifier went away.
    pub fn drop_spend_senders(&self) {
        self.inner.lock().unwrap().spend_senders.clear();
    }

    pub fn conf_reg_count_for(&self, txid: Txid) -> usize {
        self.inner
            .lock()
            .unwrap()
            .conf_regs
            .iter()
            .filter(|reg| reg.txid == txid)
            .count()
    }

    pub fn conf_num_confs_for(&self, txid: Txid) -> Option<u32> {
        self.inner
            .lock()
            .unwrap()
            .conf_regs
            .iter()
            .find(|reg| reg.txid == txid)
            .map(|reg| reg.num_confs)
    }

    fn conf_sender(&self, txid: Txid) -> Option<mpsc::Sender<TxConfirmation>> {
        self.inner
            .lock()
            .unwrap()
            .conf_regs
            .iter()
            .find(|reg| reg.txid == txid)
            .map(|reg| reg.confirmed_tx.clone())
    }

    /// Waits for a confirmation registration of `txid` to show up (they are
    /// made from spawned waiter tasks) and returns its feed.
    pub async fn wait_for_conf_reg(
        &self,
        txid: Txid,
    ) -> mpsc::Sender<TxConfirmation> {
        for _ in 0..500 {
            if let Some(sender) = self.conf_sender(txid) {
                return sender;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Timed out waiting for conf registration of {txid}");
    }
}

#[async_trait]
impl ChainNotifier for MockNotifier {
    async fn register_spend(
        &self,
        _outpoint: OutPoint,
        _height_hint: u32,
    ) -> anyhow::Result<SpendRegistration> {
        let (spend_tx, spend_rx) = mpsc::channel(8);
        self.inner.lock().unwrap().spend_senders.push(spend_tx);
        Ok(SpendRegistration {
            spends: spend_rx,
            cancel: CancelHandle::new(|| {}),
        })
    }

    async fn register_confirmations(
        &self,
        txid: Txid,
        num_confs: u32,
        _height_hint: u32,
    ) -> anyhow::Result<ConfRegistration> {
        let (confirmed_tx, confirmed_rx) = mpsc::channel(8);
        self.inner.lock().unwrap().conf_regs.push(ConfReg {
            txid,
            num_confs,
            confirmed_tx,
        });
        Ok(ConfRegistration {
            confirmed: confirmed_rx,
            cancel: CancelHandle::new(|| {}),
        })
    }
}

// --- MockStore --- //

pub(crate) struct MockStore {
    commitments: StdMutex<(Commitment, Commitment)>,
    revocation: StdMutex<RevocationStore>,
    closes: StdMutex<Vec<ChannelCloseSummary>>,
    borked: AtomicBool,
    fail_next_close: StdMutex<Option<StoreError>>,
}

impl MockStore {
    pub fn new(local: Commitment, remote: Commitment) -> Arc<Self> {
        Arc::new(Self {
            commitments: StdMutex::new((local, remote)),
            revocation: StdMutex::new(RevocationStore::default()),
            closes: StdMutex::new(Vec::new()),
            borked: AtomicBool::new(false),
            fail_next_close: StdMutex::new(None),
        })
    }

    pub fn set_revocation(&self, revocation: RevocationStore) {
        *self.revocation.lock().unwrap() = revocation;
    }

    pub fn fail_next_close(&self, err: StoreError) {
        *self.fail_next_close.lock().unwrap() = Some(err);
    }

    pub fn closes(&self) -> Vec<ChannelCloseSummary> {
        self.closes.lock().unwrap().clone()
    }

    pub fn is_borked(&self) -> bool {
        self.borked.load(Ordering::SeqCst)
    }
}

impl ChannelStore for MockStore {
    fn latest_commitments(
        &self,
    ) -> Result<(Commitment, Commitment), StoreError> {
        Ok(self.commitments.lock().unwrap().clone())
    }

    fn remote_revocation_store(&self) -> Result<RevocationStore, StoreError> {
        Ok(self.revocation.lock().unwrap().clone())
    }

    fn close_channel(
        &self,
        summary: &ChannelCloseSummary,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.fail_next_close.lock().unwrap().take() {
            return Err(err);
        }
        self.closes.lock().unwrap().push(summary.clone());
        Ok(())
    }

    fn mark_borked(&self) -> Result<(), StoreError> {
        self.borked.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// --- MockBuilder / MockSigner / MockBeacon --- //

/// Produces canned artifacts assembled from its inputs; configure the
/// commit resolution and outgoing HTLCs per test.
#[derive(Default)]
pub(crate) struct MockBuilder {
    pub commit_resolution: Option<CommitResolution>,
    pub outgoing_htlcs: Vec<OutgoingHtlcResolution>,
}

impl MockBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl CloseArtifactBuilder for MockBuilder {
    fn local_force_close_summary(
        &self,
        snapshot: &ChannelSnapshot,
        _signer: &dyn Signer,
        _beacon: &dyn PreimageBeacon,
        spending_tx: &Transaction,
        local_commit: &Commitment,
    ) -> anyhow::Result<LocalForceCloseSummary> {
        Ok(LocalForceCloseSummary {
            channel_point: snapshot.funding_outpoint,
            close_tx: spending_tx.clone(),
            local_balance: local_commit.local_balance,
            commit_resolution: self.commit_resolution.clone(),
            htlc_resolutions: HtlcResolutions {
                incoming: Vec::new(),
                outgoing: self.outgoing_htlcs.clone(),
            },
        })
    }

    fn unilateral_close_summary(
        &self,
        snapshot: &ChannelSnapshot,
        _signer: &dyn Signer,
        _beacon: &dyn PreimageBeacon,
        spend: &SpendDetail,
        remote_commit: &Commitment,
    ) -> anyhow::Result<UnilateralCloseSummary> {
        Ok(UnilateralCloseSummary {
            spend_detail: spend.clone(),
            close_summary: ChannelCloseSummary {
                channel_point: snapshot.funding_outpoint,
                chain_hash: snapshot.chain_hash,
                closing_txid: spend.spender_txid,
                close_height: spend.spending_height,
                remote_identity: snapshot.remote_identity,
                capacity: snapshot.capacity,
                settled_balance: remote_commit.local_balance,
                time_locked_balance: Amount::ZERO,
                kind: CloseKind::RemoteForce,
                status: CloseStatus::PendingResolution,
                short_channel_id: snapshot.short_channel_id,
            },
            commit_resolution: self.commit_resolution.clone(),
            htlc_resolutions: HtlcResolutions::default(),
        })
    }

    fn breach_retribution(
        &self,
        snapshot: &ChannelSnapshot,
        revocation: &RevocationStore,
        revoked_state_num: u64,
        breach_tx: &Transaction,
        spend_height: u32,
    ) -> anyhow::Result<BreachRetribution> {
        Ok(BreachRetribution {
            channel_point: snapshot.funding_outpoint,
            breach_txid: breach_tx.compute_txid(),
            breach_height: spend_height,
            revoked_state_num,
            revocation_secret: revocation
                .secret_at(revoked_state_num)
                .copied()
                .unwrap_or([0; 32]),
            remote_output: None,
            local_output: None,
            htlc_outputs: Vec::new(),
        })
    }
}

pub(crate) struct MockSigner;

impl Signer for MockSigner {
    fn sign_output(
        &self,
        _tx: &Transaction,
        _input_index: usize,
        _value: Amount,
    ) -> anyhow::Result<Signature> {
        bail!("Mock signer is never asked to sign")
    }
}

pub(crate) struct MockBeacon;

impl PreimageBeacon for MockBeacon {
    fn lookup_preimage(&self, _payment_hash: &[u8; 32]) -> Option<[u8; 32]> {
        None
    }
}

// --- harness --- //

/// A watcher wired to mocks, plus handles to everything a test asserts on.
pub(crate) struct Harness {
    pub watcher: Arc<ChainWatcher>,
    pub notifier: Arc<MockNotifier>,
    pub store: Arc<MockStore>,
    pub fully_closed_count: Arc<AtomicUsize>,
}

pub(crate) fn harness(
    local: Commitment,
    remote: Commitment,
    builder: Arc<MockBuilder>,
) -> Harness {
    init_logging();

    let notifier = MockNotifier::new();
    let store = MockStore::new(local, remote);
    let fully_closed_count = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&fully_closed_count);
    let ours = our_script();
    let watcher = Arc::new(ChainWatcher::new(ChainWatcherConfig {
        snapshot: snapshot(),
        notifier: Arc::clone(&notifier) as Arc<dyn ChainNotifier>,
        store: Arc::clone(&store) as Arc<dyn ChannelStore>,
        builder,
        signer: Arc::new(MockSigner),
        preimage_beacon: Arc::new(MockBeacon),
        is_our_script: Arc::new(move |script: &bitcoin::Script| {
            script == ours.as_script()
        }),
        mark_fully_closed: Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    }));

    Harness {
        watcher,
        notifier,
        store,
        fully_closed_count,
    }
}
