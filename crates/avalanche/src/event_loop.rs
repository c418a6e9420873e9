//! # Event Loop
//!
//! Wires a `Processor`, a `FinalityIntegration` and an `AvalancheNetwork`
//! together.
//!
//! ## Tasks
//!
//! | Task | Wakes on | Work |
//! |------|----------|------|
//! | poll ticker | `poll_interval_ms` | `poll_round`, maintenance every second |
//! | dispatcher | inbound message | `process_message`, replies, bans |
//! | finality worker | vote update | `apply_update`, tip notifications |
//!
//! All three stop on the shared `Notify`. Each task registers its waiter
//! before it checks the stop flag.
//!
//! This is the only place that reads the wall clock. The step methods
//! (`poll`, `handle`, `maintain`, `drain_updates`) take `now_ms`, and a
//! simulator drives them with a virtual clock instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ava_chain::Transaction;
use ava_common::BlockHash;
use ava_proto::Message;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::{UpdateReceiver, VoteItem, VoteUpdate};
use crate::finality::FinalityIntegration;
use crate::ids::NodeId;
use crate::network::{AvalancheNetwork, NetworkError};
use crate::processor::Processor;

/// Bound on a single send.
pub const SEND_TIMEOUT_MS: u64 = 2_000;
/// Period of the maintenance pass.
pub const MAINTENANCE_INTERVAL_MS: u64 = 1_000;

/// Unix time in milliseconds.
#[must_use]
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

pub struct EventLoop {
    processor: Arc<Processor>,
    finality: Arc<FinalityIntegration>,
    network: Arc<dyn AvalancheNetwork>,
    updates: Mutex<Option<UpdateReceiver>>,
    shutdown: Arc<Notify>,
    stopping: AtomicBool,
}

impl EventLoop {
    pub fn new(
        processor: Arc<Processor>,
        finality: Arc<FinalityIntegration>,
        network: Arc<dyn AvalancheNetwork>,
        updates: UpdateReceiver,
    ) -> Self {
        Self {
            processor,
            finality,
            network,
            updates: Mutex::new(Some(updates)),
            shutdown: Arc::new(Notify::new()),
            stopping: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    #[must_use]
    pub fn finality(&self) -> &Arc<FinalityIntegration> {
        &self.finality
    }

    #[must_use]
    pub fn network(&self) -> &Arc<dyn AvalancheNetwork> {
        &self.network
    }

    // ────────────────────────────────────────────────────────────────────────
    // steps
    // ────────────────────────────────────────────────────────────────────────

    /// Start the avalanche session on an open link.
    pub async fn connect(&self, node: NodeId, now_ms: u64) -> Result<(), NetworkError> {
        let nonces = self.network.session_nonces(node).ok_or(NetworkError::NotConnected(node))?;
        let direction = self.network.direction(node).ok_or(NetworkError::NotConnected(node))?;
        let addr = self.network.node_addr(node);
        for msg in self.processor.connect_node(node, nonces, addr, direction, now_ms) {
            self.send(node, msg).await;
        }
        for (other, hello) in self.processor.take_delayed_hellos() {
            self.send(other, hello).await;
        }
        Ok(())
    }

    pub fn disconnect(&self, node: NodeId, now_ms: u64) {
        self.network.disconnect(node);
        self.processor.disconnect_node(node, now_ms);
    }

    /// One polling pass. Returns the number of polls sent.
    pub async fn poll(&self, now_ms: u64) -> usize {
        let polls = self.processor.poll_round(now_ms);
        let count = polls.len();
        for (node, msg) in polls {
            self.send(node, msg).await;
        }
        count
    }

    pub async fn handle(&self, node: NodeId, msg: Message, now_ms: u64) {
        let command = msg.command();
        let outcome = self.processor.process_message(node, msg, now_ms);
        if let Some(violation) = &outcome.violation {
            warn!("{} misbehaved on {}: {}", node, command, violation);
        }
        if outcome.disconnect {
            info!("disconnecting banned {}", node);
            self.disconnect(node, now_ms);
            return;
        }
        if !outcome.discovered.is_empty() {
            debug!("{} new address(es) learned from {}", outcome.discovered.len(), node);
        }
        for reply in outcome.replies {
            self.send(node, reply).await;
        }
    }

    pub async fn maintain(&self, now_ms: u64) {
        let work = self.processor.maintenance(now_ms);
        for node in work.disconnect {
            self.disconnect(node, now_ms);
        }
        for (node, msg) in work.requests {
            self.send(node, msg).await;
        }
        if !work.dangling.is_empty() {
            info!("{} dangling proof(s) evicted", work.dangling.len());
        }
        self.refresh_staking_winners();
    }

    /// Apply every queued vote update. Used when the finality worker task
    /// is not running. Returns the number applied.
    pub fn drain_updates(&self, now_ms: u64) -> usize {
        let mut drained = Vec::new();
        if let Some(rx) = self.updates.lock().as_mut() {
            while let Ok(update) = rx.try_recv() {
                drained.push(update);
            }
        }
        let count = drained.len();
        for update in drained {
            self.apply_update(update, now_ms);
        }
        count
    }

    pub fn apply_update(&self, update: VoteUpdate, now_ms: u64) {
        match self.finality.apply_update(&update) {
            Ok(Some(tip)) => self.on_tip_changed(tip, now_ms),
            Ok(None) => {}
            Err(e) => warn!("{:?} for {} not applied: {}", update.status, update.item, e),
        }
    }

    /// A block was added to the chain.
    pub fn block_received(&self, hash: BlockHash, now_ms: u64) {
        match self.finality.activate_best_chain() {
            Ok(Some(tip)) => self.on_tip_changed(tip, now_ms),
            Ok(None) => {}
            Err(e) => warn!("tip selection failed after block {}: {}", hash, e),
        }
        self.processor.add_to_reconcile(VoteItem::Block(hash));
    }

    /// Admit a transaction and start voting on it.
    pub fn submit_transaction(&self, tx: Transaction) -> bool {
        let txid = tx.txid();
        if !self.finality.accept_transaction(tx) {
            return false;
        }
        self.processor.add_to_reconcile(VoteItem::Tx(txid));
        true
    }

    fn on_tip_changed(&self, tip: BlockHash, now_ms: u64) {
        info!("active tip is now {}", tip);
        self.processor.updated_block_tip(now_ms);
        self.processor.add_to_reconcile(VoteItem::Block(tip));
        self.refresh_staking_winners();
    }

    fn refresh_staking_winners(&self) {
        if !self.processor.config().staking_rewards_enabled || !self.processor.is_quorum_established() {
            return;
        }
        let Some(cutoff) = self.finality.reward_registration_cutoff() else {
            return;
        };
        let candidates = self.processor.reward_candidates(cutoff);
        self.finality.update_staking_winners(&candidates);
    }

    async fn send(&self, node: NodeId, msg: Message) {
        let command = msg.command();
        match timeout(Duration::from_millis(SEND_TIMEOUT_MS), self.network.send(node, msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{} to {} failed: {}", command, node, e),
            Err(_) => warn!("{} to {} timed out after {}ms", command, node, SEND_TIMEOUT_MS),
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // tasks
    // ────────────────────────────────────────────────────────────────────────

    /// Spawn the poll ticker, the dispatcher and the finality worker.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.spawn_ticker(), self.spawn_dispatcher()];
        if let Some(rx) = self.updates.lock().take() {
            handles.push(self.spawn_finality_worker(rx));
        }
        info!("avalanche event loop started");
        handles
    }

    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_millis(this.processor.config().poll_interval_ms.max(1));
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_maintenance = 0u64;
            let shutdown = Arc::clone(&this.shutdown);
            let stopped = shutdown.notified();
            tokio::pin!(stopped);
            while !this.is_stopping() {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let now = unix_now_ms();
                        this.poll(now).await;
                        if now.saturating_sub(last_maintenance) >= MAINTENANCE_INTERVAL_MS {
                            last_maintenance = now;
                            this.maintain(now).await;
                        }
                    }
                }
            }
            debug!("poll ticker stopped");
        })
    }

    fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let shutdown = Arc::clone(&this.shutdown);
            let stopped = shutdown.notified();
            tokio::pin!(stopped);
            while !this.is_stopping() {
                tokio::select! {
                    _ = &mut stopped => break,
                    inbound = this.network.recv() => match inbound {
                        Ok((node, msg)) => this.handle(node, msg, unix_now_ms()).await,
                        Err(NetworkError::Shutdown) => break,
                        Err(e) => debug!("dropping inbound message: {}", e),
                    }
                }
            }
            debug!("dispatcher stopped");
        })
    }

    fn spawn_finality_worker(self: &Arc<Self>, mut rx: UpdateReceiver) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let shutdown = Arc::clone(&this.shutdown);
            let stopped = shutdown.notified();
            tokio::pin!(stopped);
            while !this.is_stopping() {
                tokio::select! {
                    _ = &mut stopped => break,
                    update = rx.recv() => match update {
                        Some(update) => this.apply_update(update, unix_now_ms()),
                        None => break,
                    }
                }
            }
            debug!("finality worker stopped");
        })
    }
}
