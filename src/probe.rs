//! The probe loop: tick every `publish_interval`, call each Reporter with a
//! timeout budget, merge the results, hand the merged Report to a
//! publisher (spec.md §4.7).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::report::Report;
use crate::reporter::Reporter;

/// Receives each tick's merged Report. The aggregator's wire encoding is
/// out of scope (spec.md §6 "Upstream contract"); this crate only defines
/// the hand-off point.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, report: Report);
}

/// Periodic tick driving the registered Reporters (spec.md §4.7).
pub struct Probe {
    reporters: Vec<Arc<dyn Reporter>>,
    publisher: Arc<dyn Publisher>,
    publish_interval: Duration,
    reporter_timeout: Duration,
}

impl Probe {
    pub fn new(
        reporters: Vec<Arc<dyn Reporter>>,
        publisher: Arc<dyn Publisher>,
        publish_interval: Duration,
        reporter_timeout: Duration,
    ) -> Self {
        Self {
            reporters,
            publisher,
            publish_interval,
            reporter_timeout,
        }
    }

    /// Run ticks until `quit` fires. Per-reporter failures are logged and
    /// substituted with an empty Report (spec.md §7 "no single collector
    /// failure aborts the probe").
    pub async fn run(&self, quit: impl std::future::Future<Output = ()>) {
        tokio::pin!(quit);
        let mut ticker = tokio::time::interval(self.publish_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = &mut quit => break,
            }
        }

        for reporter in &self.reporters {
            reporter.stop().await;
        }
    }

    async fn tick(&self) {
        let mut reports = Vec::with_capacity(self.reporters.len());
        for reporter in &self.reporters {
            let report = match tokio::time::timeout(self.reporter_timeout, reporter.report()).await {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => {
                    warn!(reporter = reporter.name(), error = %e, "reporter failed, continuing without it");
                    Report::empty()
                }
                Err(_) => {
                    warn!(reporter = reporter.name(), timeout = ?self.reporter_timeout, "reporter timed out");
                    Report::empty()
                }
            };
            reports.push(report);
        }

        let merged = Report::merge_all(reports);
        debug!(
            endpoints = merged.endpoint.nodes.len(),
            addresses = merged.address.nodes.len(),
            hosts = merged.host.nodes.len(),
            containers = merged.container.nodes.len(),
            pods = merged.pod.nodes.len(),
            services = merged.service.nodes.len(),
            "publishing merged report"
        );
        self.publisher.publish(merged).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReporter {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Reporter for CountingReporter {
        fn name(&self) -> &str {
            "counting"
        }

        async fn report(&self) -> Result<Report, crate::error::ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(crate::error::ProbeError::Timeout(Duration::from_millis(1)));
            }
            let mut report = Report::empty();
            report.host.add_node(
                crate::report::id::host_node_id("h1"),
                crate::report::Node::with_metadata(HashMap::from([("k".to_string(), "v".to_string())])),
            );
            Ok(report)
        }
    }

    struct CapturingPublisher {
        received: Mutex<Vec<Report>>,
    }

    #[async_trait]
    impl Publisher for CapturingPublisher {
        async fn publish(&self, report: Report) {
            self.received.lock().push(report);
        }
    }

    #[tokio::test]
    async fn failing_reporter_does_not_block_the_tick() {
        let ok = Arc::new(CountingReporter { calls: AtomicUsize::new(0), fail: false });
        let failing = Arc::new(CountingReporter { calls: AtomicUsize::new(0), fail: true });
        let publisher = Arc::new(CapturingPublisher { received: Mutex::new(Vec::new()) });

        let probe = Probe::new(
            vec![ok.clone(), failing.clone()],
            publisher.clone(),
            Duration::from_millis(10),
            Duration::from_millis(50),
        );

        probe.tick().await;

        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        let received = publisher.received.lock();
        assert_eq!(received.len(), 1);
        assert!(!received[0].is_empty());
    }
}
