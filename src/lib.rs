//! `vantage-probe`: a host-resident observability probe.
//!
//! The probe runs a set of independent [`Reporter`]s — host facts, Docker
//! containers, Kubernetes pods/services, conntrack TCP flows, and sampled
//! packet capture — and folds their output into one [`Report`] per tick
//! (spec.md §2, §4.7). Collector internals persist across ticks; Reports
//! themselves are transient (spec.md §3 "Lifecycle").

pub mod config;
pub mod error;
pub mod host;
pub mod probe;
pub mod report;
pub mod reporter;
pub mod resolver;

#[cfg(feature = "conntrack")]
pub mod conntrack;

#[cfg(feature = "docker")]
pub mod docker;

#[cfg(feature = "kubernetes")]
pub mod kubernetes;

#[cfg(feature = "sniffer")]
pub mod sniff;

pub use error::ProbeError;
pub use probe::Probe;
pub use report::Report;
pub use reporter::Reporter;
