use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::aggregate::Accountant;
use crate::capture::CaptureSource;
use crate::classify::dns::DnsResponseRecord;
use crate::classify::{self, AddressClassifier, LinkKind, PacketParseError};
use crate::config::Config;
use crate::enforce::iptables::Iptables;
use crate::enforce::Enforcer;
use crate::metrics::{self, Metrics};
use crate::storage::mysql::Gateway;
use crate::storage::Store;

const DNS_QUEUE_DEPTH: usize = 64;

/// Top-level lifecycle: constructs the gateway, enforcer, and aggregation
/// fabric, reconciles persisted policy into the kernel filter, then feeds
/// captured packets through the classifier until shutdown.
pub struct Daemon {
    config: Config,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<()> {
        let metrics = Metrics::new();

        let gateway = Arc::new(
            Gateway::connect(
                &self.config.custom.db_location,
                &self.config.custom.db_user,
                &self.config.custom.db_pass,
            )
            .await
            .context("unable to connect to the backing database")?,
        );
        tracing::info!(
            db = %self.config.custom.db_location,
            user = %self.config.custom.db_user,
            "connected to database"
        );

        let enforcer = Arc::new(Enforcer::new(
            Arc::clone(&gateway),
            Iptables::new(),
            Arc::clone(&metrics),
        ));
        // The filter table persists across restarts; bring it in line with
        // the store before counting a single packet.
        enforcer
            .reconcile()
            .await
            .context("unable to synchronize the packet filter with stored state")?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let poller = tokio::spawn(Arc::clone(&enforcer).run_topup_poller(
            self.config.custom.reenable_poll_interval,
            shutdown_tx.subscribe(),
        ));

        if let Some(port) = self.config.metrics_port {
            metrics::start_server(port, Arc::clone(&metrics));
        }

        let classifier = AddressClassifier::new(
            self.config.user_subnet,
            self.config.ignored_user_addresses.clone(),
        );
        let accountant = Accountant::new(
            Arc::clone(&gateway),
            Arc::clone(&enforcer),
            classifier,
            self.config.flow_log_interval,
            self.config.user_log_interval,
            Arc::clone(&metrics),
        );

        let (dns_tx, dns_rx) = mpsc::channel(DNS_QUEUE_DEPTH);
        let dns_logger = tokio::spawn(log_dns_responses(
            Arc::clone(&gateway),
            dns_rx,
            Arc::clone(&metrics),
        ));

        let mut capture = CaptureSource::open(&self.config.interface)
            .context("unable to open the capture source")?;
        let capture_stop = capture.stop_handle();
        let link = capture.link();
        tracing::info!(interface = %self.config.interface, "capture started");

        let mut shutting_down = false;
        loop {
            tokio::select! {
                frame = capture.next_frame() => match frame {
                    Some(data) => {
                        self.handle_frame(link, &data, &accountant, &dns_tx, &metrics).await;
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    if shutting_down {
                        tracing::warn!("terminating uncleanly, connections may be orphaned");
                        std::process::exit(1);
                    }
                    tracing::info!("interrupt received, shutting down");
                    shutting_down = true;
                    capture_stop.stop();
                    let _ = shutdown_tx.send(());
                    // Keep looping: frames already queued still count.
                }
            }
        }
        let _ = shutdown_tx.send(());
        drop(dns_tx);

        tokio::select! {
            _ = accountant.drain() => {
                tracing::info!("aggregation fabric drained");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("terminating uncleanly, connections may be orphaned");
                std::process::exit(1);
            }
        }

        let _ = poller.await;
        let _ = dns_logger.await;
        Ok(())
    }

    async fn handle_frame(
        &self,
        link: LinkKind,
        data: &Bytes,
        accountant: &Accountant<Gateway, Iptables>,
        dns_tx: &mpsc::Sender<DnsResponseRecord>,
        metrics: &Metrics,
    ) {
        metrics.packets_observed.inc();
        match classify::parse_frame(link, data) {
            Ok(info) => {
                if let Some(record) = info.dns {
                    let _ = dns_tx.send(record).await;
                }
                accountant
                    .record_packet(info.tuple, u64::from(info.payload_length))
                    .await;
            }
            Err(PacketParseError::UnsupportedLinkLayer) => {
                metrics.packets_dropped.inc();
                tracing::debug!("dropping frame from unsupported link layer");
            }
            Err(PacketParseError::Malformed) => {
                metrics.packets_dropped.inc();
                tracing::debug!("dropping malformed packet");
            }
            Err(PacketParseError::UnhandledTransport) => {
                metrics.packets_dropped.inc();
            }
        }
    }
}

/// Serialize DNS record persistence through one task; responses arrive from
/// the ingress loop and drain here until shutdown.
async fn log_dns_responses<S: Store>(
    store: Arc<S>,
    mut records: mpsc::Receiver<DnsResponseRecord>,
    metrics: Arc<Metrics>,
) {
    while let Some(record) = records.recv().await {
        match store.log_dns_response(&record).await {
            Ok(()) => metrics.dns_responses.inc(),
            Err(e) => {
                tracing::error!(host = %record.host, error = %e, "unable to record dns response");
            }
        }
    }
}
