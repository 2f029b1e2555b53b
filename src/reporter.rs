//! The `Reporter` interface every collector implements (spec.md §4.0).
//!
//! Reporters are a closed set of concrete types known at startup (host,
//! docker, kubernetes, conntrack, sniffer), stored as trait objects so the
//! probe loop can drive them uniformly without generics leaking into
//! `Probe`.

use async_trait::async_trait;

use crate::error::ProbeError;
use crate::report::Report;

/// A component that produces a partial [`Report`] each probe cycle.
///
/// Implementations must be cheap to poll repeatedly and must not block the
/// executor; anything that talks to a subprocess, socket or kernel API
/// should do so on its own task and hand the probe loop a cached snapshot.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Human-readable name, used in logs and error messages.
    fn name(&self) -> &str;

    /// Produce this reporter's view of the world for one probe cycle.
    ///
    /// A `TRANSIENT` failure (spec.md §7) must not be fatal: the probe loop
    /// logs it and substitutes an empty Report rather than aborting.
    async fn report(&self) -> Result<Report, ProbeError>;

    /// Release background resources (subprocesses, sockets, tasks).
    ///
    /// Default no-op for reporters with nothing to tear down.
    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticReporter(&'static str);

    #[async_trait]
    impl Reporter for StaticReporter {
        fn name(&self) -> &str {
            self.0
        }

        async fn report(&self) -> Result<Report, ProbeError> {
            Ok(Report::empty())
        }
    }

    #[tokio::test]
    async fn trait_object_is_usable_through_box() {
        let reporters: Vec<Box<dyn Reporter>> = vec![Box::new(StaticReporter("test"))];
        for r in &reporters {
            assert_eq!(r.name(), "test");
            assert!(r.report().await.unwrap().is_empty());
        }
    }
}
