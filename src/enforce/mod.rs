pub mod iptables;

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};

use crate::metrics::Metrics;
use crate::storage::{Store, StorageError, SubscriberStatus};

/// Balance above which a commit skips threshold processing entirely.
const COMFORTABLE_BALANCE: i64 = 10_000_000;
const WARN_1MB: i64 = 1_000_000;
const WARN_5MB: i64 = 5_000_000;
const WARN_10MB: i64 = 10_000_000;

/// Kernel packet-filter effector over a subscriber source address.
///
/// Implementations must be idempotent: after `enable_block` succeeds
/// `probe` is true, after `disable_block` it is false, and repeating either
/// operation leaves the filter table unchanged.
pub trait PacketFilter: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// True iff a forwarding block for `addr` is currently installed.
    fn probe(&self, addr: IpAddr) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Install the forwarding block for `addr`.
    fn enable_block(
        &self,
        addr: IpAddr,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Remove the forwarding block for `addr`.
    fn disable_block(
        &self,
        addr: IpAddr,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Balance-driven access policy controller.
///
/// Consumes post-commit subscriber statuses, drives the packet filter, and
/// keeps the persisted bridged flag in step with the filter table. Filter
/// operations are serialized per subscriber address; different addresses
/// proceed in parallel.
pub struct Enforcer<S, F> {
    store: Arc<S>,
    filter: F,
    address_locks: DashMap<IpAddr, Arc<Mutex<()>>>,
    metrics: Arc<Metrics>,
}

impl<S: Store, F: PacketFilter> Enforcer<S, F> {
    pub fn new(store: Arc<S>, filter: F, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            filter,
            address_locks: DashMap::new(),
            metrics,
        }
    }

    fn address_lock(&self, addr: IpAddr) -> Arc<Mutex<()>> {
        self.address_locks.entry(addr).or_default().clone()
    }

    /// Make the kernel filter table match the persisted bridged state.
    ///
    /// The filter table outlives the process, so this runs once at startup
    /// before any traffic is counted. A store failure here is fatal to the
    /// caller; individual effector failures are logged and left for the
    /// regular enforcement paths to repair.
    pub async fn reconcile(&self) -> Result<(), StorageError> {
        let state = self.store.query_global_bridged_state().await?;
        tracing::info!(subscribers = state.len(), "synchronizing filter state");
        for sub in state {
            let lock = self.address_lock(sub.addr);
            let _held = lock.lock().await;
            tracing::info!(addr = %sub.addr, bridged = sub.bridged, "setting subscriber bridging");
            if sub.bridged {
                if let Err(e) = self.filter.disable_block(sub.addr).await {
                    tracing::warn!(addr = %sub.addr, error = %e, "failed to clear forwarding block");
                }
            } else if let Err(e) = self.filter.enable_block(sub.addr).await {
                tracing::error!(addr = %sub.addr, error = %e, "failed to install forwarding block");
            }
        }
        Ok(())
    }

    /// Evaluate a freshly committed status against the balance thresholds.
    ///
    /// Checked lowest first so a commit that crosses several thresholds at
    /// once produces only the most critical effect.
    pub async fn review(&self, status: &SubscriberStatus) {
        if status.current_balance > COMFORTABLE_BALANCE {
            return;
        }

        if status.current_balance <= 0 && status.prior_balance > 0 {
            tracing::info!(addr = %status.addr, "no balance remaining");
            self.cut_off(status.addr).await;
        } else if status.current_balance <= WARN_1MB && status.prior_balance > WARN_1MB {
            tracing::info!(addr = %status.addr, "less than 1MB remaining");
        } else if status.current_balance <= WARN_5MB && status.prior_balance > WARN_5MB {
            tracing::info!(addr = %status.addr, "less than 5MB remaining");
        } else if status.current_balance <= WARN_10MB && status.prior_balance > WARN_10MB {
            tracing::info!(addr = %status.addr, "less than 10MB remaining");
        }
    }

    async fn cut_off(&self, addr: IpAddr) {
        let lock = self.address_lock(addr);
        let _held = lock.lock().await;

        // If the filter cannot be installed the bridged flag stays true, so
        // the table and the store remain consistent with each other.
        if let Err(e) = self.filter.enable_block(addr).await {
            tracing::error!(addr = %addr, error = %e, "failed to install forwarding block");
            return;
        }
        self.metrics.blocks_installed.inc();

        if let Err(e) = self.store.update_bridged_state(addr, false).await {
            tracing::error!(addr = %addr, error = %e, "failed to record bridged state");
        }
    }

    async fn reopen(&self, addr: IpAddr) {
        let lock = self.address_lock(addr);
        let _held = lock.lock().await;

        tracing::info!(addr = %addr, "re-enabling subscriber traffic");
        // The rule may already be absent after a crash; that is not fatal.
        if let Err(e) = self.filter.disable_block(addr).await {
            tracing::warn!(addr = %addr, error = %e, "failed to clear forwarding block");
        }
        self.metrics.blocks_removed.inc();

        if let Err(e) = self.store.update_bridged_state(addr, true).await {
            tracing::error!(addr = %addr, error = %e, "failed to record bridged state");
        }
    }

    /// Poll for subscribers whose balance returned while they were blocked,
    /// and restore their forwarding. Runs until the shutdown signal.
    pub async fn run_topup_poller(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.store.query_topped_up_subscribers().await {
                        Ok(addrs) => {
                            for addr in addrs {
                                self.reopen(addr).await;
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "unable to query topped-up subscribers");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("shutting down topup poller");
                    return;
                }
            }
        }
    }
}
