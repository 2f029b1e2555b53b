//! Crate-wide error aggregate.
//!
//! Each component owns its own `thiserror` enum (`ConntrackError`,
//! `SniffError`, `DockerError`, `KubernetesError`, `HostError`); this module
//! only aggregates them for the probe loop, which logs and continues rather
//! than propagating a failure out of `main`.

use thiserror::Error;

use crate::host::HostError;

/// Top-level error a Reporter's `report()` call can fail with.
///
/// Per spec.md §7, a `TRANSIENT` failure here must not abort the probe
/// loop: the loop logs it, substitutes an empty `Report`, and merges the
/// remaining reporters.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("host reporter: {0}")]
    Host(#[from] HostError),

    #[cfg(feature = "docker")]
    #[error("docker reporter: {0}")]
    Docker(#[from] crate::docker::DockerError),

    #[cfg(feature = "kubernetes")]
    #[error("kubernetes reporter: {0}")]
    Kubernetes(#[from] crate::kubernetes::KubernetesError),

    #[cfg(feature = "conntrack")]
    #[error("conntrack reporter: {0}")]
    Conntrack(#[from] crate::conntrack::ConntrackError),

    #[cfg(feature = "sniffer")]
    #[error("sniffer reporter: {0}")]
    Sniff(#[from] crate::sniff::SniffError),

    #[error("reporter timed out after {0:?}")]
    Timeout(std::time::Duration),
}
