use std::sync::Arc;
use std::thread;

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tiny_http::{Response, Server};

/// Process-wide counters exported on the metrics port.
pub struct Metrics {
    registry: Registry,
    pub packets_observed: IntCounter,
    pub packets_dropped: IntCounter,
    pub active_flows: IntGauge,
    pub active_subscribers: IntGauge,
    pub usage_commits: IntCounter,
    pub commit_failures: IntCounter,
    pub flow_logs: IntCounter,
    pub dns_responses: IntCounter,
    pub blocks_installed: IntCounter,
    pub blocks_removed: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).unwrap();
    registry.register(Box::new(c.clone())).unwrap();
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::with_opts(Opts::new(name, help)).unwrap();
    registry.register(Box::new(g.clone())).unwrap();
    g
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();
        let metrics = Metrics {
            packets_observed: counter(
                &registry,
                "haulage_packets_observed_total",
                "Packets delivered by the capture source",
            ),
            packets_dropped: counter(
                &registry,
                "haulage_packets_dropped_total",
                "Packets dropped before classification",
            ),
            active_flows: gauge(
                &registry,
                "haulage_active_flows",
                "Flow aggregator tasks currently alive",
            ),
            active_subscribers: gauge(
                &registry,
                "haulage_active_subscribers",
                "Subscriber aggregator tasks currently alive",
            ),
            usage_commits: counter(
                &registry,
                "haulage_usage_commits_total",
                "Successful subscriber usage commits",
            ),
            commit_failures: counter(
                &registry,
                "haulage_usage_commit_failures_total",
                "Subscriber usage commits that failed or lost data",
            ),
            flow_logs: counter(
                &registry,
                "haulage_flow_logs_total",
                "Flow log rows appended",
            ),
            dns_responses: counter(
                &registry,
                "haulage_dns_responses_total",
                "DNS responses recorded",
            ),
            blocks_installed: counter(
                &registry,
                "haulage_blocks_installed_total",
                "Forwarding blocks installed at balance exhaustion",
            ),
            blocks_removed: counter(
                &registry,
                "haulage_blocks_removed_total",
                "Forwarding blocks removed after topup",
            ),
            registry,
        };
        Arc::new(metrics)
    }
}

/// Serve the registry on `0.0.0.0:<port>/metrics` from a plain thread.
pub fn start_server(port: u16, metrics: Arc<Metrics>) {
    let addr = format!("0.0.0.0:{}", port);

    thread::spawn(move || {
        let server = match Server::http(&addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "failed to start metrics server");
                return;
            }
        };
        tracing::info!(addr = %addr, "metrics server listening");

        for request in server.incoming_requests() {
            let response = if request.url() == "/metrics" {
                let encoder = TextEncoder::new();
                let mut buffer = Vec::new();
                encoder
                    .encode(&metrics.registry.gather(), &mut buffer)
                    .unwrap();
                Response::from_data(buffer).with_header(
                    tiny_http::Header::from_bytes(
                        &b"Content-Type"[..],
                        encoder.format_type().as_bytes(),
                    )
                    .unwrap(),
                )
            } else {
                Response::from_string("Not Found").with_status_code(404)
            };
            let _ = request.respond(response);
        }
    });
}
