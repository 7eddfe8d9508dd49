use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::enforce::PacketFilter;
use crate::storage::{StorageError, Store, UseRecord};

use super::{Inner, UsageEvent, UsageKind, WorkerGuard};

/// Four-bucket byte tally for one subscriber.
#[derive(Debug, Default)]
struct UsageTally {
    local_up: u64,
    local_down: u64,
    ext_up: u64,
    ext_down: u64,
}

impl UsageTally {
    fn apply(&mut self, event: &UsageEvent) {
        match event.kind {
            UsageKind::LocalUp => self.local_up += event.amount,
            UsageKind::LocalDown => self.local_down += event.amount,
            UsageKind::ExtUp => self.ext_up += event.amount,
            UsageKind::ExtDown => self.ext_down += event.amount,
        }
    }

    fn is_idle(&self) -> bool {
        self.local_up == 0 && self.local_down == 0 && self.ext_up == 0 && self.ext_down == 0
    }

    /// Extern bytes accumulated since the last commit; only these bill
    /// against the balance.
    fn outstanding_extern(&self) -> u64 {
        self.ext_up + self.ext_down
    }

    fn take_record(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> UseRecord {
        let record = UseRecord {
            start,
            end,
            local_up: self.local_up,
            local_down: self.local_down,
            ext_up: self.ext_up,
            ext_down: self.ext_down,
        };
        *self = UsageTally::default();
        record
    }
}

/// True when the uncommitted extern bytes plausibly exhaust the balance the
/// task last saw, which forces a commit (and a threshold evaluation) ahead
/// of the periodic timer. A non-positive cached balance never forces one.
fn should_flush_now(outstanding_extern: u64, cached_balance: i64) -> bool {
    cached_balance > 0 && outstanding_extern >= cached_balance as u64
}

/// One subscriber aggregator task. Serializes all usage for one address,
/// commits on the user interval or as soon as balance exhaustion is
/// plausible, and reclaims itself after a full idle interval.
pub(super) async fn run<S: Store, F: PacketFilter>(
    inner: Arc<Inner<S, F>>,
    addr: IpAddr,
    own_sender: mpsc::Sender<UsageEvent>,
    mut mailbox: mpsc::Receiver<UsageEvent>,
    _guard: WorkerGuard,
) {
    let mut tally = UsageTally::default();
    let mut cached_balance = match inner.store.query_subscriber(addr).await {
        Ok(status) => status.current_balance,
        Err(e) => {
            tracing::warn!(addr = %addr, error = %e, "unable to read starting balance");
            0
        }
    };
    let mut interval_start = Utc::now();
    let mut timer = tokio::time::interval_at(
        tokio::time::Instant::now() + inner.user_log_interval,
        inner.user_log_interval,
    );

    loop {
        tokio::select! {
            message = mailbox.recv() => match message {
                Some(event) => {
                    tally.apply(&event);
                    if should_flush_now(tally.outstanding_extern(), cached_balance) {
                        if let Some(balance) =
                            flush(&inner, addr, &mut tally, &mut interval_start).await
                        {
                            cached_balance = balance;
                        }
                    }
                }
                None => break,
            },
            _ = timer.tick() => {
                if tally.is_idle() {
                    tracing::debug!(addr = %addr, "reclaiming idle subscriber aggregator");
                    inner
                        .subscribers
                        .remove_if(&addr, |_, tx| tx.same_channel(&own_sender));
                    mailbox.close();
                    while let Some(event) = mailbox.recv().await {
                        tally.apply(&event);
                    }
                    break;
                }
                if let Some(balance) = flush(&inner, addr, &mut tally, &mut interval_start).await {
                    cached_balance = balance;
                }
            }
        }
    }

    if !tally.is_idle() {
        flush(&inner, addr, &mut tally, &mut interval_start).await;
    }
    inner
        .subscribers
        .remove_if(&addr, |_, tx| tx.same_channel(&own_sender));
    inner.metrics.active_subscribers.dec();
}

/// Commit the accumulated buckets and hand the post-commit status to the
/// enforcement controller. The buckets are zeroed whether or not the commit
/// lands; lost bytes are accepted and logged.
async fn flush<S: Store, F: PacketFilter>(
    inner: &Arc<Inner<S, F>>,
    addr: IpAddr,
    tally: &mut UsageTally,
    interval_start: &mut DateTime<Utc>,
) -> Option<i64> {
    let end = Utc::now();
    let record = tally.take_record(*interval_start, end);
    *interval_start = end;

    match inner.store.log_usage(addr, record).await {
        Ok(status) => {
            inner.metrics.usage_commits.inc();
            inner.enforcer.review(&status).await;
            Some(status.current_balance)
        }
        Err(StorageError::NotFound(_)) => {
            inner.metrics.commit_failures.inc();
            tracing::error!(addr = %addr, "no static IP mapping; discarding usage");
            None
        }
        Err(StorageError::TransactionLost) => {
            inner.metrics.commit_failures.inc();
            tracing::error!(addr = %addr, "data loss: unable to commit usage");
            None
        }
        Err(e) => {
            inner.metrics.commit_failures.inc();
            tracing::error!(addr = %addr, error = %e, "usage commit failed");
            None
        }
    }
}
