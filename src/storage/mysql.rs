use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};

use crate::classify::dns::DnsResponseRecord;

use super::{
    BridgedState, FlowUseRecord, Store, StorageError, SubscriberStatus, UseRecord,
    COMMIT_ATTEMPTS,
};

/// Gateway over the deployment's MySQL store.
///
/// Each operation runs a single short transaction against the pool; commit
/// failures are retried up to [`COMMIT_ATTEMPTS`] times, all other errors
/// surface immediately.
#[derive(Debug, Clone)]
pub struct Gateway {
    pool: MySqlPool,
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    internal_uid: i32,
    raw_up: i64,
    raw_down: i64,
    data_balance: i64,
    balance: Decimal,
    bridged: bool,
}

impl Gateway {
    /// Connect to the configured database and verify it responds.
    pub async fn connect(db_name: &str, user: &str, pass: &str) -> Result<Self, StorageError> {
        let url = format!("mysql://{}:{}@localhost/{}", user, pass, db_name);
        let pool = MySqlPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&url)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Apply any pending schema migrations from `directory`.
    pub async fn migrate(&self, directory: &Path) -> anyhow::Result<()> {
        let migrator = sqlx::migrate::Migrator::new(directory)
            .await
            .with_context(|| format!("unable to read migrations from {:?}", directory))?;
        migrator
            .run(&self.pool)
            .await
            .context("schema migration failed")?;
        Ok(())
    }

    async fn resolve_imsi(
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        addr: IpAddr,
    ) -> Result<String, StorageError> {
        let imsi: Option<(String,)> =
            sqlx::query_as("SELECT imsi FROM static_ips WHERE ip = ?")
                .bind(addr.to_string())
                .fetch_optional(&mut **tx)
                .await?;
        imsi.map(|row| row.0).ok_or(StorageError::NotFound(addr))
    }

    async fn account_by_imsi(
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        addr: IpAddr,
        imsi: &str,
    ) -> Result<AccountRow, StorageError> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT internal_uid, raw_up, raw_down, data_balance, balance, bridged \
             FROM subscribers WHERE imsi = ?",
        )
        .bind(imsi)
        .fetch_optional(&mut **tx)
        .await?;
        row.ok_or(StorageError::NotFound(addr))
    }
}

impl Store for Gateway {
    async fn log_usage(
        &self,
        addr: IpAddr,
        usage: UseRecord,
    ) -> Result<SubscriberStatus, StorageError> {
        for attempt in 1..=COMMIT_ATTEMPTS {
            let mut tx = self.pool.begin().await?;
            let imsi = Self::resolve_imsi(&mut tx, addr).await?;
            let account = Self::account_by_imsi(&mut tx, addr, &imsi).await?;

            let raw_up = account.raw_up + usage.ext_up as i64;
            let raw_down = account.raw_down + usage.ext_down as i64;
            let prior_balance = account.data_balance;
            let mut data_balance = prior_balance - usage.total_extern() as i64;
            if data_balance < 0 {
                // The enforcement filter races with accounting at the cutoff
                // instant, so the last interval can overrun the balance. Per
                // network policy the balance floors at zero and the overrun
                // bytes go unbilled.
                tracing::debug!(imsi = %imsi, data_balance, "zeroing negative data balance");
                data_balance = 0;
            }

            sqlx::query(
                "UPDATE subscribers SET raw_up = ?, raw_down = ?, data_balance = ? \
                 WHERE imsi = ?",
            )
            .bind(raw_up)
            .bind(raw_down)
            .bind(data_balance)
            .bind(&imsi)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO subscriber_usage \
                 (subscriber, start_time, end_time, ran_bytes_up, ran_bytes_down, \
                  wan_bytes_up, wan_bytes_down) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(account.internal_uid)
            .bind(usage.start)
            .bind(usage.end)
            .bind((usage.local_up + usage.ext_up) as i64)
            .bind((usage.local_down + usage.ext_down) as i64)
            .bind(usage.ext_up as i64)
            .bind(usage.ext_down as i64)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO subscriber_history (subscriber, time, data_balance, bridged) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(account.internal_uid)
            .bind(usage.end)
            .bind(data_balance)
            .bind(account.bridged)
            .execute(&mut *tx)
            .await?;

            match tx.commit().await {
                Ok(()) => {
                    return Ok(SubscriberStatus {
                        addr,
                        current_balance: data_balance,
                        prior_balance,
                        currency_balance: account.balance,
                    })
                }
                Err(e) => {
                    tracing::warn!(attempt, imsi = %imsi, error = %e, "usage commit failed");
                }
            }
        }
        Err(StorageError::TransactionLost)
    }

    async fn query_subscriber(&self, addr: IpAddr) -> Result<SubscriberStatus, StorageError> {
        let row: Option<(i64, Decimal)> = sqlx::query_as(
            "SELECT data_balance, balance FROM subscribers \
             INNER JOIN static_ips ON static_ips.imsi = subscribers.imsi \
             WHERE static_ips.ip = ?",
        )
        .bind(addr.to_string())
        .fetch_optional(&self.pool)
        .await?;
        let (data_balance, balance) = row.ok_or(StorageError::NotFound(addr))?;
        Ok(SubscriberStatus {
            addr,
            current_balance: data_balance,
            prior_balance: data_balance,
            currency_balance: balance,
        })
    }

    async fn update_bridged_state(
        &self,
        addr: IpAddr,
        bridged: bool,
    ) -> Result<(), StorageError> {
        for attempt in 1..=COMMIT_ATTEMPTS {
            let mut tx = self.pool.begin().await?;
            let imsi = Self::resolve_imsi(&mut tx, addr).await?;

            sqlx::query("UPDATE subscribers SET bridged = ? WHERE imsi = ?")
                .bind(bridged)
                .bind(&imsi)
                .execute(&mut *tx)
                .await?;

            match tx.commit().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, imsi = %imsi, error = %e, "bridged-state commit failed");
                }
            }
        }
        Err(StorageError::TransactionLost)
    }

    async fn log_flow(&self, record: FlowUseRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO flowlogs \
             (intervalStart, intervalStop, addressA, addressB, transportProtocol, \
              portA, portB, bytesAtoB, bytesBtoA) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.start)
        .bind(record.end)
        .bind(address_bytes(record.tuple.src))
        .bind(address_bytes(record.tuple.dst))
        .bind(record.tuple.protocol)
        .bind(record.tuple.src_port)
        .bind(record.tuple.dst_port)
        .bind(record.bytes_ab as i64)
        .bind(record.bytes_ba as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_dns_response(&self, record: &DnsResponseRecord) -> Result<(), StorageError> {
        for attempt in 1..=COMMIT_ATTEMPTS {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT IGNORE INTO answers (host, ip_addresses, ttls) VALUES (?, ?, ?)",
            )
            .bind(&record.host)
            .bind(&record.answer_ips)
            .bind(&record.answer_ttls)
            .execute(&mut *tx)
            .await?;

            let answer_index: u32 = sqlx::query_scalar(
                "SELECT idx FROM answers WHERE host = ? AND ip_addresses = ? AND ttls = ?",
            )
            .bind(&record.host)
            .bind(&record.answer_ips)
            .bind(&record.answer_ttls)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO dnsResponses \
                 (time, srcIp, dstIp, transportProtocol, srcPort, dstPort, \
                  opcode, resultcode, answer) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.timestamp)
            .bind(address_bytes(record.tuple.src))
            .bind(address_bytes(record.tuple.dst))
            .bind(record.tuple.protocol)
            .bind(record.tuple.src_port)
            .bind(record.tuple.dst_port)
            .bind(record.opcode)
            .bind(record.response_code)
            .bind(answer_index)
            .execute(&mut *tx)
            .await?;

            match tx.commit().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, host = %record.host, error = %e, "dns commit failed");
                }
            }
        }
        Err(StorageError::TransactionLost)
    }

    async fn query_global_bridged_state(&self) -> Result<Vec<BridgedState>, StorageError> {
        let rows: Vec<(String, bool)> = sqlx::query_as(
            "SELECT ip, bridged FROM subscribers \
             INNER JOIN static_ips ON static_ips.imsi = subscribers.imsi \
             WHERE enabled = TRUE",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut state = Vec::with_capacity(rows.len());
        for (ip, bridged) in rows {
            // A row that does not parse is skipped outright rather than
            // reported with a garbage address.
            match ip.parse() {
                Ok(addr) => state.push(BridgedState { addr, bridged }),
                Err(_) => tracing::error!(ip = %ip, "skipping unparseable static IP row"),
            }
        }
        Ok(state)
    }

    async fn query_topped_up_subscribers(&self) -> Result<Vec<IpAddr>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT ip FROM subscribers \
             INNER JOIN static_ips ON static_ips.imsi = subscribers.imsi \
             WHERE enabled = TRUE AND data_balance > 0 AND bridged = FALSE",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut addrs = Vec::with_capacity(rows.len());
        for (ip,) in rows {
            match ip.parse() {
                Ok(addr) => addrs.push(addr),
                Err(_) => tracing::error!(ip = %ip, "skipping unparseable static IP row"),
            }
        }
        Ok(addrs)
    }
}

/// Addresses persist as 16-byte binary, IPv4-mapped for v4.
fn address_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}
