pub mod mysql;

use std::future::Future;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::classify::dns::DnsResponseRecord;
use crate::classify::FiveTuple;

/// Commit attempts per unit of work before declaring the bytes lost.
pub const COMMIT_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no static IP mapping for {0}")]
    NotFound(IpAddr),
    #[error("data loss: unable to commit after {COMMIT_ATTEMPTS} attempts")]
    TransactionLost,
    #[error("storage backend failure: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Post-commit account state returned from a usage commit.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberStatus {
    pub addr: IpAddr,
    pub current_balance: i64,
    pub prior_balance: i64,
    pub currency_balance: Decimal,
}

/// One flushed aggregation interval for a single subscriber.
///
/// Only the extern buckets bill against the data balance; the local buckets
/// are recorded for analysis.
#[derive(Debug, Clone, Copy)]
pub struct UseRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub local_up: u64,
    pub local_down: u64,
    pub ext_up: u64,
    pub ext_down: u64,
}

/// One flushed interval of a bidirectional flow, in direction-A orientation.
#[derive(Debug, Clone, Copy)]
pub struct FlowUseRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub tuple: FiveTuple,
    pub bytes_ab: u64,
    pub bytes_ba: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BridgedState {
    pub addr: IpAddr,
    pub bridged: bool,
}

/// The persistence gateway. Every operation is a complete unit of work; no
/// transaction crosses a component boundary.
pub trait Store: Send + Sync + 'static {
    /// Commit a usage interval: advance the lifetime counters by the extern
    /// bytes, debit the balance, clamp it at zero, and append the interval
    /// and audit rows. Returns the committed post-write status.
    fn log_usage(
        &self,
        addr: IpAddr,
        usage: UseRecord,
    ) -> impl Future<Output = Result<SubscriberStatus, StorageError>> + Send;

    /// Read-only snapshot of a subscriber's committed balance.
    fn query_subscriber(
        &self,
        addr: IpAddr,
    ) -> impl Future<Output = Result<SubscriberStatus, StorageError>> + Send;

    /// Persist the forwarding state recorded for a subscriber. Idempotent
    /// with respect to the value.
    fn update_bridged_state(
        &self,
        addr: IpAddr,
        bridged: bool,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Append one flow log row.
    fn log_flow(
        &self,
        record: FlowUseRecord,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Record a DNS response, deduplicating the answer set.
    fn log_dns_response(
        &self,
        record: &DnsResponseRecord,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Bridged state of every enabled subscriber, for startup reconciliation.
    fn query_global_bridged_state(
        &self,
    ) -> impl Future<Output = Result<Vec<BridgedState>, StorageError>> + Send;

    /// Subscribers holding balance while still blocked, i.e. topped up since
    /// their cutoff.
    fn query_topped_up_subscribers(
        &self,
    ) -> impl Future<Output = Result<Vec<IpAddr>, StorageError>> + Send;
}

impl UseRecord {
    pub fn total_extern(&self) -> u64 {
        self.ext_up + self.ext_down
    }
}
