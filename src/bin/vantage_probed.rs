//! vantage-probed: host-resident observability probe daemon.
//!
//! Loads configuration, wires up the Reporters enabled by Cargo features
//! (host always on; docker/kubernetes/conntrack/sniffer behind their
//! feature flags), and runs the probe loop until SIGINT/SIGTERM.
//!
//! ## Configuration
//! `--config <path>` or `VANTAGE_CONFIG` names a YAML file; individual
//! keys can be overridden with `VANTAGE__<SECTION>__<KEY>` env vars.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vantage_probe::config::Config;
use vantage_probe::probe::{Probe, Publisher};
use vantage_probe::report::Report;
use vantage_probe::reporter::Reporter;

/// Stand-in for the aggregator's wire encoding, which is out of scope
/// (spec.md §6 "Upstream contract"): logs a summary of each merged Report.
struct LoggingPublisher;

#[async_trait::async_trait]
impl Publisher for LoggingPublisher {
    async fn publish(&self, report: Report) {
        info!(
            endpoints = report.endpoint.nodes.len(),
            addresses = report.address.nodes.len(),
            hosts = report.host.nodes.len(),
            containers = report.container.nodes.len(),
            pods = report.pod.nodes.len(),
            services = report.service.nodes.len(),
            "report published"
        );
    }
}

fn config_path_from_args() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(vantage_probe::config::LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(config_path_from_args().as_deref()).map_err(|e| {
        error!(error = %e, "failed to load configuration");
        e
    })?;

    info!(host_id = %config.host_id, "starting vantage-probed");

    let mut reporters: Vec<Arc<dyn Reporter>> = Vec::new();

    if config.host.enabled {
        reporters.push(Arc::new(vantage_probe::host::HostReporter::new(config.host_id.clone())));
    }

    #[cfg(feature = "docker")]
    if config.docker.enabled {
        match vantage_probe::docker::DockerRegistry::spawn().await {
            Ok(registry) => reporters.push(Arc::new(registry)),
            Err(e) => warn!(error = %e, "docker reporter unavailable, continuing without it"),
        }
    }

    #[cfg(feature = "kubernetes")]
    if config.kubernetes.enabled {
        match vantage_probe::kubernetes::KubernetesRegistry::spawn(config.kubernetes.namespace.clone()).await {
            Ok(registry) => reporters.push(Arc::new(registry)),
            Err(e) => warn!(error = %e, "kubernetes reporter unavailable, continuing without it"),
        }
    }

    #[cfg(feature = "conntrack")]
    if config.conntrack.enabled {
        match vantage_probe::conntrack::Conntracker::spawn(config.host_id.clone(), config.conntrack.existing_connections).await {
            Ok(tracker) => reporters.push(Arc::new(tracker)),
            Err(e) => warn!(error = %e, "conntrack reporter unavailable (ENOPRECOND), continuing without it"),
        }
    }

    #[cfg(feature = "sniffer")]
    if config.sniffer.enabled {
        let on = config.sniffer.quantum.mul_f64(config.sniffer.sample_rate);
        let off = config.sniffer.quantum.saturating_sub(on);
        let factory = vantage_probe::sniff::source::live_source_factory(config.sniffer.device.clone());
        match vantage_probe::sniff::Sniffer::spawn(config.host_id.clone(), factory, on, off) {
            Ok(sniffer) => reporters.push(Arc::new(sniffer)),
            Err(e) => warn!(error = %e, "sniffer reporter unavailable, continuing without it"),
        }
    }

    let probe = Probe::new(
        reporters,
        Arc::new(LoggingPublisher),
        config.publish_interval,
        config.reporter_timeout,
    );

    info!("probe loop running, press ctrl-c to stop");
    probe
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await;

    info!("vantage-probed stopped");
    Ok(())
}
