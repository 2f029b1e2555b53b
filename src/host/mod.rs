//! Host reporter: emits a single Host node with hostname/OS/uptime/load/
//! local-network metadata (spec.md §4.6, SPEC_FULL.md §4.8; grounded on
//! `original_source/app/origin_host.go`'s `OriginHost` shape).

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::error::ProbeError;
use crate::report::{id, Node, Report};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Metadata keys (spec.md §6 vocabulary).
pub const HOST_NAME: &str = "host_name";
pub const OS: &str = "os";
pub const KERNEL_VERSION: &str = "kernel_version";
pub const UPTIME: &str = "uptime";
pub const LOAD: &str = "load";
pub const LOCAL_NETWORKS: &str = "local_networks";

/// Reads `/etc/hostname`, `uname`, `/proc/{uptime,loadavg}` and the local
/// interface list on every `Report()` call. Cheap enough to skip caching
/// (SPEC_FULL.md §4.8): no background polling needed.
pub struct HostReporter {
    host_id: String,
}

impl HostReporter {
    pub fn new(host_id: String) -> Self {
        Self { host_id }
    }

    fn hostname() -> String {
        std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| {
                nix::sys::utsname::uname()
                    .map(|u| u.nodename().to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "unknown".to_string())
            })
    }

    fn os_and_kernel() -> (String, String) {
        match nix::sys::utsname::uname() {
            Ok(uts) => (
                uts.sysname().to_string_lossy().to_lowercase(),
                uts.release().to_string_lossy().into_owned(),
            ),
            Err(e) => {
                warn!(error = %e, "uname failed");
                (std::env::consts::OS.to_string(), "unknown".to_string())
            }
        }
    }

    fn uptime() -> Option<String> {
        let contents = std::fs::read_to_string("/proc/uptime").ok()?;
        let seconds: f64 = contents.split_whitespace().next()?.parse().ok()?;
        Some(humantime::format_duration(std::time::Duration::from_secs(seconds as u64)).to_string())
    }

    /// First three whitespace-delimited fields of `/proc/loadavg`,
    /// space-joined (spec.md §8 S1: `"0.1 0.2 0.3"`).
    fn load() -> Option<String> {
        let contents = std::fs::read_to_string("/proc/loadavg").ok()?;
        let fields: Vec<&str> = contents.split_whitespace().take(3).collect();
        if fields.len() == 3 {
            Some(fields.join(" "))
        } else {
            None
        }
    }

    /// Non-loopback interface CIDRs, space-joined (spec.md §8 S1).
    fn local_networks() -> String {
        let Ok(addrs) = nix::ifaddrs::getifaddrs() else {
            return String::new();
        };

        let mut networks = Vec::new();
        for ifaddr in addrs {
            let Some(address) = ifaddr.address.and_then(|a| a.as_sockaddr_in().map(|s| IpAddr::V4(s.ip())).or_else(|| a.as_sockaddr_in6().map(|s| IpAddr::V6(s.ip())))) else {
                continue;
            };
            if address.is_loopback() {
                continue;
            }
            let prefix = ifaddr
                .netmask
                .and_then(|m| m.as_sockaddr_in().map(|s| u32::from(s.ip()).count_ones()))
                .unwrap_or(match address {
                    IpAddr::V4(_) => 24,
                    IpAddr::V6(_) => 64,
                });
            let cidr = format!("{address}/{prefix}");
            if !networks.contains(&cidr) {
                networks.push(cidr);
            }
        }
        networks.join(" ")
    }
}

#[async_trait]
impl crate::reporter::Reporter for HostReporter {
    fn name(&self) -> &str {
        "host"
    }

    async fn report(&self) -> Result<Report, ProbeError> {
        let (os, kernel_version) = Self::os_and_kernel();
        let mut metadata = std::collections::HashMap::new();
        metadata.insert(HOST_NAME.to_string(), Self::hostname());
        metadata.insert(OS.to_string(), os);
        metadata.insert(KERNEL_VERSION.to_string(), kernel_version);
        if let Some(uptime) = Self::uptime() {
            metadata.insert(UPTIME.to_string(), uptime);
        }
        if let Some(load) = Self::load() {
            metadata.insert(LOAD.to_string(), load);
        }
        metadata.insert(LOCAL_NETWORKS.to_string(), Self::local_networks());

        let mut report = Report::empty();
        report
            .host
            .add_node(id::host_node_id(&self.host_id), Node::with_metadata(metadata));
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn report_emits_one_host_node_with_required_keys() {
        let reporter = HostReporter::new("test-host".to_string());
        let report = crate::reporter::Reporter::report(&reporter).await.unwrap();
        let node = report.host.nodes.get(&id::host_node_id("test-host")).unwrap();
        assert!(node.metadata.contains_key(HOST_NAME));
        assert!(node.metadata.contains_key(OS));
        assert!(node.metadata.contains_key(LOCAL_NETWORKS));
    }
}
