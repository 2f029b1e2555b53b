//! Kubernetes registry + reporter (spec.md §4.6 "Kubernetes registry";
//! SPEC_FULL.md §4.6c). List+watch reflectors keep replicated Pod and
//! Service stores; `Report()` emits Service nodes, then Pod nodes with
//! matching Service IDs attached (grounded on
//! `original_source/probe/kubernetes/{registry,service,reporter}.go`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::error::ProbeError;
use crate::report::{id, Node, Report};

pub const NAMESPACE: &str = "kubernetes_namespace";
pub const POD_ID: &str = "kubernetes_pod_id";
pub const POD_NAME: &str = "kubernetes_pod_name";
pub const POD_CREATED: &str = "kubernetes_pod_created";
pub const POD_CONTAINER_IDS: &str = "kubernetes_pod_container_ids";
pub const POD_SERVICE_ID: &str = "kubernetes_service_id";
pub const SERVICE_ID: &str = "kubernetes_service_id";
pub const SERVICE_NAME: &str = "kubernetes_service_name";
pub const SERVICE_CREATED: &str = "kubernetes_service_created";
pub const SERVICE_PORTS: &str = "kubernetes_service_ports";
pub const SERVICE_IPS: &str = "kubernetes_service_ips";

#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("failed to build kubernetes client: {0}")]
    Client(#[from] kube::Error),
}

#[derive(Debug, Clone)]
struct PodState {
    namespace: String,
    name: String,
    created: String,
    container_ids: Vec<String>,
    labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct ServiceState {
    namespace: String,
    name: String,
    created: String,
    ports: String,
    ips: String,
    selector: HashMap<String, String>,
}

/// Live replicated view of Pods and Services via list+watch reflectors.
pub struct KubernetesRegistry {
    pods: Arc<RwLock<HashMap<String, PodState>>>,
    services: Arc<RwLock<HashMap<String, ServiceState>>>,
    pod_task: tokio::task::JoinHandle<()>,
    service_task: tokio::task::JoinHandle<()>,
}

impl KubernetesRegistry {
    pub async fn spawn(namespace: Option<String>) -> Result<Self, KubernetesError> {
        let client = Client::try_default().await?;

        let pods: Arc<RwLock<HashMap<String, PodState>>> = Arc::new(RwLock::new(HashMap::new()));
        let services: Arc<RwLock<HashMap<String, ServiceState>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let pod_api: Api<Pod> = match &namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let service_api: Api<Service> = match &namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };

        let pod_store = pods.clone();
        let pod_task = tokio::spawn(async move {
            Self::watch_pods(pod_api, pod_store).await;
        });

        let service_store = services.clone();
        let service_task = tokio::spawn(async move {
            Self::watch_services(service_api, service_store).await;
        });

        Ok(Self {
            pods,
            services,
            pod_task,
            service_task,
        })
    }

    async fn watch_pods(api: Api<Pod>, store: Arc<RwLock<HashMap<String, PodState>>>) {
        let stream = watcher::watcher(api, watcher::Config::default());
        let result = stream
            .try_for_each(|event| {
                let store = store.clone();
                async move {
                    Self::handle_pod_event(&store, event);
                    Ok(())
                }
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "kubernetes pod watcher error");
        }
    }

    fn handle_pod_event(store: &RwLock<HashMap<String, PodState>>, event: Event<Pod>) {
        match event {
            Event::Apply(pod) | Event::InitApply(pod) => {
                if let Some(key) = pod_key(&pod) {
                    debug!(pod = %key, "pod applied");
                    store.write().insert(key, pod_state(&pod));
                }
            }
            Event::Delete(pod) => {
                if let Some(key) = pod_key(&pod) {
                    debug!(pod = %key, "pod deleted");
                    store.write().remove(&key);
                }
            }
            Event::Init | Event::InitDone => {}
        }
    }

    async fn watch_services(api: Api<Service>, store: Arc<RwLock<HashMap<String, ServiceState>>>) {
        let stream = watcher::watcher(api, watcher::Config::default());
        let result = stream
            .try_for_each(|event| {
                let store = store.clone();
                async move {
                    Self::handle_service_event(&store, event);
                    Ok(())
                }
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "kubernetes service watcher error");
        }
    }

    fn handle_service_event(store: &RwLock<HashMap<String, ServiceState>>, event: Event<Service>) {
        match event {
            Event::Apply(svc) | Event::InitApply(svc) => {
                if let Some(key) = service_key(&svc) {
                    debug!(service = %key, "service applied");
                    store.write().insert(key, service_state(&svc));
                }
            }
            Event::Delete(svc) => {
                if let Some(key) = service_key(&svc) {
                    debug!(service = %key, "service deleted");
                    store.write().remove(&key);
                }
            }
            Event::Init | Event::InitDone => {}
        }
    }

    /// Invoke `f` for every currently-known pod (spec.md §8 S5).
    pub fn walk_pods(&self, mut f: impl FnMut(&str)) {
        for key in self.pods.read().keys() {
            f(key);
        }
    }

    /// Idempotent; aborts both watcher tasks.
    pub fn stop(&self) {
        self.pod_task.abort();
        self.service_task.abort();
    }
}

impl Drop for KubernetesRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pod_key(pod: &Pod) -> Option<String> {
    let meta = &pod.metadata;
    Some(format!("{}/{}", meta.namespace.as_deref()?, meta.name.as_deref()?))
}

fn service_key(svc: &Service) -> Option<String> {
    let meta = &svc.metadata;
    Some(format!("{}/{}", meta.namespace.as_deref()?, meta.name.as_deref()?))
}

fn pod_state(pod: &Pod) -> PodState {
    let meta = &pod.metadata;
    let namespace = meta.namespace.clone().unwrap_or_default();
    let name = meta.name.clone().unwrap_or_default();
    let created = meta
        .creation_timestamp
        .as_ref()
        .map(|t| t.0.format("%d %b %y %H:%M %Z").to_string())
        .unwrap_or_default();
    let container_ids = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .map(|c| c.container_id.clone().unwrap_or_default())
                .map(|id| id.trim_start_matches("docker://").to_string())
                .collect()
        })
        .unwrap_or_default();
    let labels = meta.labels.clone().unwrap_or_default();

    PodState {
        namespace,
        name,
        created,
        container_ids,
        labels,
    }
}

fn service_state(svc: &Service) -> ServiceState {
    let meta = &svc.metadata;
    let namespace = meta.namespace.clone().unwrap_or_default();
    let name = meta.name.clone().unwrap_or_default();
    let created = meta
        .creation_timestamp
        .as_ref()
        .map(|t| t.0.format("%d %b %y %H:%M %Z").to_string())
        .unwrap_or_default();

    let spec = svc.spec.clone().unwrap_or_default();
    let selector = spec.selector.unwrap_or_default();

    let ports = spec
        .ports
        .as_ref()
        .map(|ports| {
            ports
                .iter()
                .map(|p| {
                    let target = p
                        .target_port
                        .as_ref()
                        .map(|t| match t {
                            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(i) => i.to_string(),
                            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(s) => s.clone(),
                        })
                        .filter(|s| !s.is_empty() && s != "0")
                        .unwrap_or_else(|| p.port.to_string());
                    format!("{}/{}->{}", p.port, p.protocol.clone().unwrap_or_else(|| "TCP".to_string()), target)
                })
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let service_type = spec.type_.clone().unwrap_or_else(|| "ClusterIP".to_string());
    let mut ips = vec![spec.cluster_ip.clone().unwrap_or_default()];
    // NodePort services are reached via the cluster IP like ClusterIP ones;
    // only LoadBalancer/ExternalName services carry extra addresses worth
    // attaching (original_source/probe/kubernetes/service.go's `ips()`).
    if service_type != "ClusterIP" && service_type != "NodePort" {
        ips.extend(spec.external_ips.clone().unwrap_or_default());
        if let Some(lb_ip) = &spec.load_balancer_ip {
            ips.push(lb_ip.clone());
        }
        if let Some(status) = &svc.status {
            if let Some(lb) = status.load_balancer.as_ref().and_then(|lb| lb.ingress.as_ref()) {
                for ingress in lb {
                    if let Some(ip) = &ingress.ip {
                        ips.push(ip.clone());
                    } else if let Some(hostname) = &ingress.hostname {
                        ips.push(hostname.clone());
                    }
                }
            }
        }
    }

    ServiceState {
        namespace,
        name,
        created,
        ports,
        ips: ips.join(" "),
        selector,
    }
}

fn selector_matches(selector: &HashMap<String, String>, labels: &HashMap<String, String>) -> bool {
    !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl crate::reporter::Reporter for KubernetesRegistry {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn report(&self) -> Result<Report, ProbeError> {
        let mut report = Report::empty();

        let services = self.services.read();
        for (key, svc) in services.iter() {
            let mut metadata = HashMap::new();
            metadata.insert(SERVICE_ID.to_string(), key.clone());
            metadata.insert(SERVICE_NAME.to_string(), svc.name.clone());
            metadata.insert(SERVICE_CREATED.to_string(), svc.created.clone());
            metadata.insert(NAMESPACE.to_string(), svc.namespace.clone());
            metadata.insert(SERVICE_PORTS.to_string(), svc.ports.clone());
            metadata.insert(SERVICE_IPS.to_string(), svc.ips.clone());
            report
                .service
                .add_node(id::service_node_id(&svc.namespace, &svc.name), Node::with_metadata(metadata));
        }

        let pods = self.pods.read();
        for (key, pod) in pods.iter() {
            let mut matching_services = Vec::new();
            for (svc_key, svc) in services.iter() {
                if selector_matches(&svc.selector, &pod.labels) {
                    matching_services.push(svc_key.clone());
                }
            }

            let mut metadata = HashMap::new();
            metadata.insert(POD_ID.to_string(), key.clone());
            metadata.insert(POD_NAME.to_string(), pod.name.clone());
            metadata.insert(NAMESPACE.to_string(), pod.namespace.clone());
            metadata.insert(POD_CREATED.to_string(), pod.created.clone());
            metadata.insert(POD_CONTAINER_IDS.to_string(), pod.container_ids.join(", "));
            if !matching_services.is_empty() {
                metadata.insert(POD_SERVICE_ID.to_string(), matching_services.join(", "));
            }
            report
                .pod
                .add_node(id::pod_node_id(&pod.namespace, &pod.name), Node::with_metadata(metadata));
        }

        Ok(report)
    }

    async fn stop(&self) {
        KubernetesRegistry::stop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_requires_every_key() {
        let selector = HashMap::from([("app".to_string(), "pong".to_string())]);
        let matching = HashMap::from([("app".to_string(), "pong".to_string()), ("extra".to_string(), "x".to_string())]);
        let non_matching = HashMap::from([("app".to_string(), "other".to_string())]);
        assert!(selector_matches(&selector, &matching));
        assert!(!selector_matches(&selector, &non_matching));
        assert!(!selector_matches(&HashMap::new(), &matching));
    }

    #[test]
    fn pod_key_requires_namespace_and_name() {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some("ping".to_string());
        pod.metadata.name = Some("pong".to_string());
        assert_eq!(pod_key(&pod).as_deref(), Some("ping/pong"));
    }
}
