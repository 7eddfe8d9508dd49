#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;

use haulage::classify::dns::DnsResponseRecord;
use haulage::enforce::PacketFilter;
use haulage::storage::{
    BridgedState, FlowUseRecord, StorageError, Store, SubscriberStatus, UseRecord,
};

#[derive(Debug, Clone)]
pub struct Account {
    pub imsi: String,
    pub raw_up: i64,
    pub raw_down: i64,
    pub data_balance: i64,
    pub bridged: bool,
    pub enabled: bool,
}

#[derive(Debug, Default)]
pub struct MemoryState {
    pub accounts: HashMap<IpAddr, Account>,
    pub usage_rows: Vec<(IpAddr, UseRecord)>,
    pub flow_rows: Vec<FlowUseRecord>,
    pub answers: Vec<(String, String, String)>,
    pub dns_responses: Vec<(DnsResponseRecord, u32)>,
}

/// Store double mirroring the gateway's transactional semantics closely
/// enough to drive the aggregation and enforcement paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn with_account(ip: &str, imsi: &str, data_balance: i64, bridged: bool) -> Arc<Self> {
        let store = Arc::new(Self::default());
        store.add_account(ip, imsi, data_balance, bridged);
        store
    }

    pub fn add_account(&self, ip: &str, imsi: &str, data_balance: i64, bridged: bool) {
        self.state.lock().unwrap().accounts.insert(
            ip.parse().unwrap(),
            Account {
                imsi: imsi.to_owned(),
                raw_up: 0,
                raw_down: 0,
                data_balance,
                bridged,
                enabled: true,
            },
        );
    }

    pub fn account(&self, ip: &str) -> Account {
        self.state.lock().unwrap().accounts[&ip.parse::<IpAddr>().unwrap()].clone()
    }
}

impl Store for MemoryStore {
    async fn log_usage(
        &self,
        addr: IpAddr,
        usage: UseRecord,
    ) -> Result<SubscriberStatus, StorageError> {
        let mut state = self.state.lock().unwrap();
        if !state.accounts.contains_key(&addr) {
            return Err(StorageError::NotFound(addr));
        }
        state.usage_rows.push((addr, usage));
        let account = state.accounts.get_mut(&addr).unwrap();
        account.raw_up += usage.ext_up as i64;
        account.raw_down += usage.ext_down as i64;
        let prior_balance = account.data_balance;
        account.data_balance = (prior_balance - usage.total_extern() as i64).max(0);
        Ok(SubscriberStatus {
            addr,
            current_balance: account.data_balance,
            prior_balance,
            currency_balance: Decimal::ZERO,
        })
    }

    async fn query_subscriber(&self, addr: IpAddr) -> Result<SubscriberStatus, StorageError> {
        let state = self.state.lock().unwrap();
        let account = state.accounts.get(&addr).ok_or(StorageError::NotFound(addr))?;
        Ok(SubscriberStatus {
            addr,
            current_balance: account.data_balance,
            prior_balance: account.data_balance,
            currency_balance: Decimal::ZERO,
        })
    }

    async fn update_bridged_state(&self, addr: IpAddr, bridged: bool) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        let account = state
            .accounts
            .get_mut(&addr)
            .ok_or(StorageError::NotFound(addr))?;
        account.bridged = bridged;
        Ok(())
    }

    async fn log_flow(&self, record: FlowUseRecord) -> Result<(), StorageError> {
        self.state.lock().unwrap().flow_rows.push(record);
        Ok(())
    }

    async fn log_dns_response(&self, record: &DnsResponseRecord) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        let key = (
            record.host.clone(),
            record.answer_ips.clone(),
            record.answer_ttls.clone(),
        );
        let idx = match state.answers.iter().position(|existing| *existing == key) {
            Some(position) => position as u32 + 1,
            None => {
                state.answers.push(key);
                state.answers.len() as u32
            }
        };
        state.dns_responses.push((record.clone(), idx));
        Ok(())
    }

    async fn query_global_bridged_state(&self) -> Result<Vec<BridgedState>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .accounts
            .iter()
            .filter(|(_, account)| account.enabled)
            .map(|(addr, account)| BridgedState {
                addr: *addr,
                bridged: account.bridged,
            })
            .collect())
    }

    async fn query_topped_up_subscribers(&self) -> Result<Vec<IpAddr>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .accounts
            .iter()
            .filter(|(_, account)| account.enabled && account.data_balance > 0 && !account.bridged)
            .map(|(addr, _)| *addr)
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterCall {
    Probe(IpAddr),
    Enable(IpAddr),
    Disable(IpAddr),
}

#[derive(Debug, Default)]
struct FilterState {
    calls: Mutex<Vec<FilterCall>>,
    blocked: Mutex<HashSet<IpAddr>>,
}

/// Effector double recording every invocation and modeling the kernel table
/// as a set, so idempotence is observable.
#[derive(Debug, Clone, Default)]
pub struct RecordingFilter {
    state: Arc<FilterState>,
}

impl RecordingFilter {
    pub fn with_blocked(addrs: &[&str]) -> Self {
        let filter = Self::default();
        let mut blocked = filter.state.blocked.lock().unwrap();
        for addr in addrs {
            blocked.insert(addr.parse().unwrap());
        }
        drop(blocked);
        filter
    }

    pub fn calls(&self) -> Vec<FilterCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn is_blocked(&self, addr: &str) -> bool {
        self.state
            .blocked
            .lock()
            .unwrap()
            .contains(&addr.parse::<IpAddr>().unwrap())
    }
}

impl PacketFilter for RecordingFilter {
    type Error = std::convert::Infallible;

    async fn probe(&self, addr: IpAddr) -> Result<bool, Self::Error> {
        self.state.calls.lock().unwrap().push(FilterCall::Probe(addr));
        Ok(self.state.blocked.lock().unwrap().contains(&addr))
    }

    async fn enable_block(&self, addr: IpAddr) -> Result<(), Self::Error> {
        self.state.calls.lock().unwrap().push(FilterCall::Enable(addr));
        self.state.blocked.lock().unwrap().insert(addr);
        Ok(())
    }

    async fn disable_block(&self, addr: IpAddr) -> Result<(), Self::Error> {
        self.state
            .calls
            .lock()
            .unwrap()
            .push(FilterCall::Disable(addr));
        self.state.blocked.lock().unwrap().remove(&addr);
        Ok(())
    }
}
