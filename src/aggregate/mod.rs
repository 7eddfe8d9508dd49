mod flow;
mod subscriber;

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::classify::{AddressClassifier, FiveTuple};
use crate::enforce::{Enforcer, PacketFilter};
use crate::metrics::Metrics;
use crate::storage::Store;

const WORKER_MAILBOX_DEPTH: usize = 32;

/// Which of a subscriber's four usage buckets a byte count lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    LocalUp,
    LocalDown,
    ExtUp,
    ExtDown,
}

/// One observed packet attributed to a flow, in observed direction.
#[derive(Debug, Clone, Copy)]
pub struct FlowEvent {
    pub tuple: FiveTuple,
    pub amount: u64,
}

/// One byte count attributed to a subscriber.
#[derive(Debug, Clone, Copy)]
pub struct UsageEvent {
    pub kind: UsageKind,
    pub amount: u64,
}

/// The concurrent aggregation fabric.
///
/// Owns the two task maps: canonical five-tuple to flow aggregator mailbox
/// and subscriber address to subscriber aggregator mailbox. Aggregator tasks
/// are created on first traffic and reclaim themselves after a full idle
/// interval; insertion is atomic, so a dispatch racing a reclaim either wins
/// the existing mailbox or installs a fresh one.
pub struct Accountant<S, F> {
    inner: Arc<Inner<S, F>>,
}

struct Inner<S, F> {
    flows: DashMap<FiveTuple, mpsc::Sender<FlowEvent>>,
    subscribers: DashMap<IpAddr, mpsc::Sender<UsageEvent>>,
    store: Arc<S>,
    enforcer: Arc<Enforcer<S, F>>,
    classifier: AddressClassifier,
    flow_log_interval: Duration,
    user_log_interval: Duration,
    metrics: Arc<Metrics>,
    tracker: Arc<WorkerTracker>,
}

impl<S: Store, F: PacketFilter> Accountant<S, F> {
    pub fn new(
        store: Arc<S>,
        enforcer: Arc<Enforcer<S, F>>,
        classifier: AddressClassifier,
        flow_log_interval: Duration,
        user_log_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                flows: DashMap::new(),
                subscribers: DashMap::new(),
                store,
                enforcer,
                classifier,
                flow_log_interval,
                user_log_interval,
                metrics,
                tracker: Arc::new(WorkerTracker::default()),
            }),
        }
    }

    /// Route one classified packet into its flow aggregator.
    pub async fn record_packet(&self, tuple: FiveTuple, amount: u64) {
        dispatch_flow(&self.inner, FlowEvent { tuple, amount }).await;
    }

    /// Wait for every aggregator task to flush and terminate. Tasks finish
    /// naturally once the ingress stops feeding them; flow aggregators may
    /// still fan out usage events while draining.
    pub async fn drain(&self) {
        self.inner.tracker.wait_idle().await;
    }

    pub fn active_flow_count(&self) -> usize {
        self.inner.flows.len()
    }

    pub fn active_subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

async fn dispatch_flow<S: Store, F: PacketFilter>(inner: &Arc<Inner<S, F>>, event: FlowEvent) {
    let key = event.tuple.canonical();
    let mut event = event;
    loop {
        let sender = match inner.flows.entry(key) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::channel(WORKER_MAILBOX_DEPTH);
                vacant.insert(tx.clone());
                inner.metrics.active_flows.inc();
                let worker_inner = Arc::clone(inner);
                let own_sender = tx.clone();
                let guard = WorkerGuard::enter(&inner.tracker);
                tokio::spawn(async move {
                    flow::run(worker_inner, key, own_sender, rx, guard).await;
                });
                tx
            }
        };

        match sender.send(event).await {
            Ok(()) => return,
            Err(mpsc::error::SendError(returned)) => {
                // The aggregator reclaimed itself between lookup and send.
                // Clear the stale entry (unless a newer task already
                // replaced it) and retry.
                inner.flows.remove_if(&key, |_, tx| tx.same_channel(&sender));
                event = returned;
            }
        }
    }
}

async fn dispatch_usage<S: Store, F: PacketFilter>(
    inner: &Arc<Inner<S, F>>,
    addr: IpAddr,
    event: UsageEvent,
) {
    let mut event = event;
    loop {
        let sender = match inner.subscribers.entry(addr) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::channel(WORKER_MAILBOX_DEPTH);
                vacant.insert(tx.clone());
                inner.metrics.active_subscribers.inc();
                let worker_inner = Arc::clone(inner);
                let own_sender = tx.clone();
                let guard = WorkerGuard::enter(&inner.tracker);
                tokio::spawn(async move {
                    subscriber::run(worker_inner, addr, own_sender, rx, guard).await;
                });
                tx
            }
        };

        match sender.send(event).await {
            Ok(()) => return,
            Err(mpsc::error::SendError(returned)) => {
                inner
                    .subscribers
                    .remove_if(&addr, |_, tx| tx.same_channel(&sender));
                event = returned;
            }
        }
    }
}

/// Fan a flow event out to the subscriber aggregators it bills to.
async fn attribute_usage<S: Store, F: PacketFilter>(inner: &Arc<Inner<S, F>>, event: &FlowEvent) {
    for (addr, usage) in attribute(&inner.classifier, &event.tuple, event.amount) {
        dispatch_usage(inner, addr, usage).await;
    }
}

/// Subscriber attribution for one packet: at most one event for each user
/// endpoint, classed by whether the far endpoint stays local. Transport
/// ports play no part here.
fn attribute(
    classifier: &AddressClassifier,
    tuple: &FiveTuple,
    amount: u64,
) -> Vec<(IpAddr, UsageEvent)> {
    let mut out = Vec::with_capacity(2);
    if classifier.is_user(tuple.src) {
        let kind = if classifier.is_local(tuple.dst) {
            UsageKind::LocalUp
        } else {
            UsageKind::ExtUp
        };
        out.push((tuple.src, UsageEvent { kind, amount }));
    }
    if classifier.is_user(tuple.dst) {
        let kind = if classifier.is_local(tuple.src) {
            UsageKind::LocalDown
        } else {
            UsageKind::ExtDown
        };
        out.push((tuple.dst, UsageEvent { kind, amount }));
    }
    out
}

/// Counts live aggregator tasks so shutdown can wait for the fabric to
/// drain, including tasks spawned while the drain is already underway.
#[derive(Debug, Default)]
struct WorkerTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl WorkerTracker {
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct WorkerGuard(Arc<WorkerTracker>);

impl WorkerGuard {
    fn enter(tracker: &Arc<WorkerTracker>) -> Self {
        tracker.active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(tracker))
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn classifier() -> AddressClassifier {
        AddressClassifier::new("10.45.0.0/16".parse().unwrap(), HashSet::new())
    }

    fn tuple(src: &str, dst: &str) -> FiveTuple {
        FiveTuple {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            src_port: 40000,
            dst_port: 443,
            protocol: 6,
        }
    }

    #[test]
    fn user_to_extern_bills_uplink() {
        let events = attribute(&classifier(), &tuple("10.45.0.7", "8.8.8.8"), 1500);
        assert_eq!(events.len(), 1);
        let (addr, usage) = &events[0];
        assert_eq!(*addr, "10.45.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(usage.kind, UsageKind::ExtUp);
        assert_eq!(usage.amount, 1500);
    }

    #[test]
    fn extern_to_user_bills_downlink() {
        let events = attribute(&classifier(), &tuple("8.8.8.8", "10.45.0.7"), 900);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.kind, UsageKind::ExtDown);
    }

    #[test]
    fn user_to_local_is_not_billed_as_extern() {
        let events = attribute(&classifier(), &tuple("10.45.0.7", "192.168.1.10"), 700);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.kind, UsageKind::LocalUp);
    }

    #[test]
    fn user_to_user_attributes_both_sides() {
        let events = attribute(&classifier(), &tuple("10.45.0.7", "10.45.0.9"), 400);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1.kind, UsageKind::LocalUp);
        assert_eq!(events[1].1.kind, UsageKind::LocalDown);
    }

    #[test]
    fn extern_to_extern_attributes_nothing() {
        let events = attribute(&classifier(), &tuple("8.8.8.8", "1.1.1.1"), 100);
        assert!(events.is_empty());
    }
}
