//! Docker registry + reporter (spec.md §4.6 "Docker registry").
//!
//! Subscribes to the Docker event stream to maintain a live container set;
//! for each running container a stats-collector task reads the `/stats`
//! streaming endpoint and keeps the latest sample (SPEC_FULL.md §4.6b).
//! `Report()` walks the set and emits Container + ContainerImage nodes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{ListContainersOptions, StatsOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::ProbeError;
use crate::report::{id, Node, Report};

pub const CONTAINER_ID: &str = "docker_container_id";
pub const CONTAINER_NAME: &str = "docker_container_name";
pub const CONTAINER_IPS: &str = "docker_container_ips";
pub const CONTAINER_PORTS: &str = "docker_container_ports";
pub const CONTAINER_COMMAND: &str = "docker_container_command";
pub const CONTAINER_CREATED: &str = "docker_container_created";
pub const IMAGE_ID: &str = "docker_image_id";
pub const MEMORY_USAGE: &str = "memory_usage";
pub const LABEL_PREFIX: &str = "docker_label_";

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("failed to connect to docker daemon: {0}")]
    Connect(#[source] bollard::errors::Error),

    #[error("failed to list containers: {0}")]
    List(#[source] bollard::errors::Error),
}

#[derive(Debug, Clone, Default)]
struct ContainerState {
    name: String,
    image_id: String,
    command: String,
    created: String,
    ips: Vec<String>,
    ports: String,
    labels: HashMap<String, String>,
    memory_usage: Option<u64>,
}

/// Live view of running containers, kept current by the Docker event stream.
pub struct DockerRegistry {
    containers: Arc<RwLock<HashMap<String, ContainerState>>>,
    event_task: tokio::task::JoinHandle<()>,
    stats_tasks: Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl DockerRegistry {
    pub async fn spawn() -> Result<Self, DockerError> {
        let client = Docker::connect_with_local_defaults().map_err(DockerError::Connect)?;
        let client = Arc::new(client);

        let containers: Arc<RwLock<HashMap<String, ContainerState>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let stats_tasks: Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let running = client
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(DockerError::List)?;

        for summary in running {
            let Some(id) = summary.id.clone() else { continue };
            Self::seed_container(&client, &containers, &stats_tasks, &id).await;
        }

        let event_client = client.clone();
        let event_containers = containers.clone();
        let event_stats_tasks = stats_tasks.clone();
        let event_task = tokio::spawn(async move {
            Self::run_event_stream(event_client, event_containers, event_stats_tasks).await;
        });

        Ok(Self {
            containers,
            event_task,
            stats_tasks,
        })
    }

    async fn seed_container(
        client: &Arc<Docker>,
        containers: &Arc<RwLock<HashMap<String, ContainerState>>>,
        stats_tasks: &Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>>,
        id: &str,
    ) {
        let Ok(inspect) = client.inspect_container(id, None).await else {
            warn!(container = id, "inspect failed, skipping");
            return;
        };

        let state = container_state_from_inspect(&inspect);
        containers.write().insert(id.to_string(), state);

        let stats_client = client.clone();
        let stats_containers = containers.clone();
        let container_id = id.to_string();
        let handle = tokio::spawn(async move {
            Self::run_stats_collector(stats_client, stats_containers, container_id).await;
        });
        stats_tasks.write().insert(id.to_string(), handle);
    }

    async fn run_stats_collector(
        client: Arc<Docker>,
        containers: Arc<RwLock<HashMap<String, ContainerState>>>,
        container_id: String,
    ) {
        let mut stream = client.stats(
            &container_id,
            Some(StatsOptions {
                stream: true,
                one_shot: false,
            }),
        );

        while let Some(sample) = stream.next().await {
            match sample {
                Ok(stats) => {
                    let usage = stats.memory_stats.usage;
                    if let Some(state) = containers.write().get_mut(&container_id) {
                        state.memory_usage = usage.filter(|u| *u != 0);
                    }
                }
                Err(e) => {
                    debug!(container = %container_id, error = %e, "stats stream ended");
                    break;
                }
            }
        }
    }

    async fn run_event_stream(
        client: Arc<Docker>,
        containers: Arc<RwLock<HashMap<String, ContainerState>>>,
        stats_tasks: Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>>,
    ) {
        let mut stream = client.events(Some(EventsOptions::<String> {
            ..Default::default()
        }));

        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    error!(error = %e, "docker event stream error");
                    break;
                }
            };

            let Some(actor_id) = event.actor.and_then(|a| a.id) else { continue };
            match event.action.as_deref() {
                Some("start") => {
                    info!(container = %actor_id, "container started");
                    Self::seed_container(&client, &containers, &stats_tasks, &actor_id).await;
                }
                Some("die") | Some("destroy") => {
                    info!(container = %actor_id, "container stopped");
                    containers.write().remove(&actor_id);
                    if let Some(task) = stats_tasks.write().remove(&actor_id) {
                        task.abort();
                    }
                }
                _ => {}
            }
        }
    }

    /// Idempotent; stops the event stream and every per-container stats task.
    pub fn stop(&self) {
        self.event_task.abort();
        for (_, task) in self.stats_tasks.write().drain() {
            task.abort();
        }
    }
}

impl Drop for DockerRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

fn container_state_from_inspect(inspect: &bollard::models::ContainerInspectResponse) -> ContainerState {
    let name = inspect
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();

    let image_id = inspect.image.clone().unwrap_or_default();

    let command = inspect
        .config
        .as_ref()
        .map(|c| {
            let path = c.cmd.as_ref().and_then(|cmd| cmd.first()).cloned().unwrap_or_default();
            let rest = c
                .cmd
                .as_ref()
                .map(|cmd| cmd.iter().skip(1).cloned().collect::<Vec<_>>().join(" "))
                .unwrap_or_default();
            format!("{path} {rest}").trim_end().to_string()
        })
        .unwrap_or_default();

    let created = inspect
        .created
        .as_deref()
        .and_then(|c| chrono::DateTime::parse_from_rfc3339(c).ok())
        .map(|dt| dt.format("%d %b %y %H:%M %Z").to_string())
        .unwrap_or_default();

    let mut ips = Vec::new();
    if let Some(networks) = inspect
        .network_settings
        .as_ref()
        .and_then(|ns| ns.networks.as_ref())
    {
        for net in networks.values() {
            if let Some(ip) = net.ip_address.as_deref() {
                if !ip.is_empty() && !ips.contains(&ip.to_string()) {
                    ips.push(ip.to_string());
                }
            }
        }
    }

    let ports = inspect
        .network_settings
        .as_ref()
        .and_then(|ns| ns.ports.as_ref())
        .map(format_ports)
        .unwrap_or_default();

    let labels = inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default();

    ContainerState {
        name,
        image_id,
        command,
        created,
        ips,
        ports,
        labels,
        memory_usage: None,
    }
}

/// Groups published ports by `ip:hostPort` and formats each group as
/// `ip:hostPort->containerPort/proto[, containerPort/proto...]` (spec.md §8
/// S2).
fn format_ports(
    ports: &HashMap<String, Option<Vec<bollard::models::PortBinding>>>,
) -> String {
    // `ports` iterates in arbitrary HashMap order; sort container ports
    // first so both group order and within-group order are deterministic
    // across runs (spec.md §8 S2 expects a fixed ordered string).
    let mut container_ports: Vec<&String> = ports.keys().collect();
    container_ports.sort();

    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for container_port in container_ports {
        let Some(Some(bindings)) = ports.get(container_port) else { continue };
        for binding in bindings {
            let ip = binding.host_ip.clone().unwrap_or_default();
            let host_port = binding.host_port.clone().unwrap_or_default();
            let key = format!("{ip}:{host_port}");
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, v)) => v.push(container_port.clone()),
                None => groups.push((key, vec![container_port.clone()])),
            }
        }
    }
    groups.sort_by(|a, b| a.0.cmp(&b.0));
    for (_, container_ports) in &mut groups {
        container_ports.sort();
    }

    groups
        .into_iter()
        .map(|(key, container_ports)| format!("{key}->{}", container_ports.join(", ")))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl crate::reporter::Reporter for DockerRegistry {
    fn name(&self) -> &str {
        "docker"
    }

    async fn report(&self) -> Result<Report, ProbeError> {
        let mut report = Report::empty();
        let containers = self.containers.read();
        for (container_id, state) in containers.iter() {
            let mut metadata = HashMap::new();
            metadata.insert(CONTAINER_ID.to_string(), container_id.clone());
            metadata.insert(CONTAINER_NAME.to_string(), state.name.clone());
            metadata.insert(CONTAINER_COMMAND.to_string(), state.command.clone());
            metadata.insert(CONTAINER_CREATED.to_string(), state.created.clone());
            if !state.ips.is_empty() {
                metadata.insert(CONTAINER_IPS.to_string(), state.ips.join(" "));
            }
            if !state.ports.is_empty() {
                metadata.insert(CONTAINER_PORTS.to_string(), state.ports.clone());
            }
            if !state.image_id.is_empty() {
                metadata.insert(IMAGE_ID.to_string(), state.image_id.clone());
            }
            if let Some(usage) = state.memory_usage {
                metadata.insert(MEMORY_USAGE.to_string(), usage.to_string());
            }
            for (label, value) in &state.labels {
                metadata.insert(format!("{LABEL_PREFIX}{label}"), value.clone());
            }

            report
                .container
                .add_node(id::container_node_id(container_id), Node::with_metadata(metadata));

            if !state.image_id.is_empty() {
                let image_metadata =
                    HashMap::from([(IMAGE_ID.to_string(), state.image_id.clone())]);
                report
                    .container_image
                    .add_node(id::image_node_id(&state.image_id), Node::with_metadata(image_metadata));
            }
        }
        Ok(report)
    }

    async fn stop(&self) {
        DockerRegistry::stop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_ports_groups_by_ip_and_host_port() {
        let mut ports = HashMap::new();
        ports.insert(
            "80/tcp".to_string(),
            Some(vec![bollard::models::PortBinding {
                host_ip: Some("1.2.3.4".to_string()),
                host_port: Some("80".to_string()),
            }]),
        );
        ports.insert(
            "81/tcp".to_string(),
            Some(vec![bollard::models::PortBinding {
                host_ip: Some("1.2.3.4".to_string()),
                host_port: Some("80".to_string()),
            }]),
        );
        let formatted = format_ports(&ports);
        assert_eq!(formatted, "1.2.3.4:80->80/tcp, 81/tcp");
    }
}
