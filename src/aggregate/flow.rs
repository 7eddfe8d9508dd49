use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::classify::FiveTuple;
use crate::enforce::PacketFilter;
use crate::storage::{FlowUseRecord, Store};

use super::{FlowEvent, Inner, WorkerGuard};

/// Directional byte tally for one bidirectional flow.
///
/// Direction A is fixed by the very first event seen: its network source and
/// transport source define the A endpoint for the lifetime of the task.
#[derive(Debug, Default)]
struct FlowTally {
    oriented: Option<FiveTuple>,
    bytes_ab: u64,
    bytes_ba: u64,
}

impl FlowTally {
    fn apply(&mut self, event: &FlowEvent) {
        let first = self.oriented.get_or_insert(event.tuple);
        if (event.tuple.src, event.tuple.src_port) == (first.src, first.src_port) {
            self.bytes_ab += event.amount;
        } else {
            self.bytes_ba += event.amount;
        }
    }

    fn is_idle(&self) -> bool {
        self.bytes_ab == 0 && self.bytes_ba == 0
    }

    fn reset(&mut self) {
        self.bytes_ab = 0;
        self.bytes_ba = 0;
    }
}

/// One flow aggregator task. Serializes all events for a canonical flow,
/// appends a flow log row per interval, and reclaims itself after a full
/// interval without traffic.
pub(super) async fn run<S: Store, F: PacketFilter>(
    inner: Arc<Inner<S, F>>,
    key: FiveTuple,
    own_sender: mpsc::Sender<FlowEvent>,
    mut mailbox: mpsc::Receiver<FlowEvent>,
    _guard: WorkerGuard,
) {
    let mut tally = FlowTally::default();
    let mut interval_start = Utc::now();
    let mut timer = tokio::time::interval_at(
        tokio::time::Instant::now() + inner.flow_log_interval,
        inner.flow_log_interval,
    );

    loop {
        tokio::select! {
            message = mailbox.recv() => match message {
                Some(event) => {
                    tally.apply(&event);
                    super::attribute_usage(&inner, &event).await;
                }
                None => break,
            },
            _ = timer.tick() => {
                if tally.is_idle() {
                    tracing::debug!(flow = %key, "reclaiming idle flow aggregator");
                    inner.flows.remove_if(&key, |_, tx| tx.same_channel(&own_sender));
                    mailbox.close();
                    // Events that raced the reclaim still count; they are
                    // flushed below before the task dies.
                    while let Some(event) = mailbox.recv().await {
                        tally.apply(&event);
                        super::attribute_usage(&inner, &event).await;
                    }
                    break;
                }
                flush(&inner, &mut tally, &mut interval_start).await;
            }
        }
    }

    if !tally.is_idle() {
        flush(&inner, &mut tally, &mut interval_start).await;
    }
    inner.flows.remove_if(&key, |_, tx| tx.same_channel(&own_sender));
    inner.metrics.active_flows.dec();
}

async fn flush<S: Store, F: PacketFilter>(
    inner: &Arc<Inner<S, F>>,
    tally: &mut FlowTally,
    interval_start: &mut DateTime<Utc>,
) {
    // A byte was tallied, so the orientation is set.
    let Some(tuple) = tally.oriented else {
        return;
    };
    let end = Utc::now();
    let record = FlowUseRecord {
        start: *interval_start,
        end,
        tuple,
        bytes_ab: tally.bytes_ab,
        bytes_ba: tally.bytes_ba,
    };
    *interval_start = end;
    tally.reset();

    match inner.store.log_flow(record).await {
        Ok(()) => inner.metrics.flow_logs.inc(),
        Err(e) => {
            tracing::error!(flow = %record.tuple, error = %e, "unable to commit a flow log");
        }
    }
}
