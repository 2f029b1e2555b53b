//! Conntracker: maintains the set of TCP connections observable via the
//! kernel's conntrack facility, exposed as a walkable snapshot (spec.md
//! §4.4).
//!
//! Two subprocesses are involved: a one-shot `-L` snapshot (only when
//! existing-connection seeding is enabled) whose failure is logged and
//! ignored, and a long-lived `-E` event stream whose failure is fatal to the
//! tracker (spec.md §4.4b).

mod module_check;
mod xml;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

pub use xml::Flow;

#[derive(Debug, Error)]
pub enum ConntrackError {
    #[error("nf_conntrack kernel module not loaded")]
    ModulePreconditionFailed,

    #[error("failed to spawn conntrack: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("conntrack event stream ended: {0}")]
    StreamEnded(String),
}

#[derive(Default)]
struct State {
    active_flows: HashMap<i64, Flow>,
    buffered_flows: Vec<Flow>,
}

/// Tracks TCP conntrack flows via the `conntrack` CLI (spec.md §4.4).
pub struct Conntracker {
    host_id: String,
    state: Arc<Mutex<State>>,
    child: Arc<Mutex<Option<Child>>>,
    stream_task: tokio::task::JoinHandle<()>,
}

impl Conntracker {
    /// Spawn the tracker. Fails with [`ConntrackError::ModulePreconditionFailed`]
    /// if `nf_conntrack` isn't loaded (spec.md §4.4 "Preconditions").
    pub async fn spawn(host_id: String, existing_connections: bool) -> Result<Self, ConntrackError> {
        if !module_check::conntrack_module_present() {
            return Err(ConntrackError::ModulePreconditionFailed);
        }

        let state = Arc::new(Mutex::new(State::default()));

        if existing_connections {
            match Self::snapshot_existing(&state).await {
                Ok(n) => info!(flows = n, "seeded existing connections"),
                Err(e) => warn!(error = %e, "existing-connections snapshot failed, continuing without it"),
            }
        }

        let mut cmd = Command::new("conntrack");
        cmd.args(["-E", "-o", "xml", "-p", "tcp"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(ConntrackError::Spawn)?;
        let stdout = child.stdout.take().expect("conntrack stdout was piped");

        let child = Arc::new(Mutex::new(Some(child)));
        let stream_state = state.clone();
        let stream_task = tokio::spawn(async move {
            if let Err(e) = Self::run_event_stream(stdout, stream_state).await {
                error!(error = %e, "conntrack event stream terminated");
            }
        });

        Ok(Self {
            host_id,
            state,
            child,
            stream_task,
        })
    }

    async fn snapshot_existing(state: &Arc<Mutex<State>>) -> Result<usize, ConntrackError> {
        let mut cmd = Command::new("conntrack");
        cmd.args(["-L", "-o", "xml", "-p", "tcp"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(ConntrackError::Spawn)?;
        let stdout = child.stdout.take().expect("conntrack -L stdout was piped");

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(stdout), &mut buf)
            .await
            .map_err(ConntrackError::Spawn)?;

        let _ = child.wait().await;

        let batch: xml::ConntrackBatch = quick_xml::de::from_str(&String::from_utf8_lossy(&buf))
            .unwrap_or(xml::ConntrackBatch { flows: Vec::new() });

        let mut count = 0;
        for raw in batch.flows {
            let flow: Flow = raw.into();
            if flow.is_tcp() {
                Self::handle_flow(state, flow, true);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn run_event_stream(
        stdout: tokio::process::ChildStdout,
        state: Arc<Mutex<State>>,
    ) -> Result<(), ConntrackError> {
        let mut reader = BufReader::new(stdout);

        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConntrackError::StreamEnded(e.to_string()))?;
        if line != xml::XML_HEADER {
            return Err(ConntrackError::StreamEnded(format!(
                "unexpected header: {line:?}"
            )));
        }
        line.clear();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConntrackError::StreamEnded(e.to_string()))?;
        if line != xml::CONNTRACK_OPEN_TAG {
            return Err(ConntrackError::StreamEnded(format!(
                "unexpected open tag: {line:?}"
            )));
        }

        let mut chunk = String::new();
        loop {
            let mut next = String::new();
            let bytes = reader
                .read_line(&mut next)
                .await
                .map_err(|e| ConntrackError::StreamEnded(e.to_string()))?;
            if bytes == 0 {
                return Err(ConntrackError::StreamEnded("EOF".into()));
            }
            chunk.push_str(&next);

            if chunk.contains("</flow>") {
                if let Some(end) = chunk.find("</flow>") {
                    let flow_xml = &chunk[..end + "</flow>".len()];
                    match quick_xml::de::from_str::<xml::RawFlow>(flow_xml) {
                        Ok(raw) => {
                            let flow: Flow = raw.into();
                            if flow.is_tcp() {
                                Self::handle_flow(&state, flow, false);
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to decode conntrack flow"),
                    }
                    chunk = chunk[end + "</flow>".len()..].to_string();
                }
            }
        }
    }

    fn handle_flow(state: &Arc<Mutex<State>>, flow: Flow, force_add: bool) {
        let Some(independent) = flow.independent.clone() else {
            return;
        };
        let mut s = state.lock();

        let is_new_or_update = force_add || flow.flow_type == xml::NEW || flow.flow_type == xml::UPDATE;
        if is_new_or_update {
            if independent.state != xml::TIME_WAIT {
                s.active_flows.insert(independent.id, flow);
            } else if s.active_flows.remove(&independent.id).is_some() {
                s.buffered_flows.push(flow);
            }
        } else if flow.flow_type == xml::DESTROY && s.active_flows.remove(&independent.id).is_some() {
            s.buffered_flows.push(flow);
        }
    }

    /// Call `f` with every active flow, then every flow that transitioned out
    /// since the last call (one-cycle buffered delivery, spec.md §4.4 state
    /// machine table).
    pub fn walk_flows(&self, mut f: impl FnMut(&Flow)) {
        let mut state = self.state.lock();
        for flow in state.active_flows.values() {
            f(flow);
        }
        for flow in &state.buffered_flows {
            f(flow);
        }
        state.buffered_flows.clear();
    }

    /// Idempotent; kills the `-E` subprocess and aborts the reader task.
    pub fn stop(&self) {
        self.stream_task.abort();
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
    }
}

impl Drop for Conntracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl crate::reporter::Reporter for Conntracker {
    fn name(&self) -> &str {
        "conntrack"
    }

    async fn report(&self) -> Result<crate::report::Report, crate::error::ProbeError> {
        use crate::report::{id, EdgeMetadata, Node};

        let mut report = crate::report::Report::empty();
        self.walk_flows(|flow| {
            let Some(original) = &flow.original else { return };
            let src_endpoint = id::endpoint_node_id(&self.host_id, &original.layer3.src_ip, &original.layer4.src_port.to_string());
            let dst_endpoint = id::endpoint_node_id(&self.host_id, &original.layer3.dst_ip, &original.layer4.dst_port.to_string());

            report.endpoint.add_node(src_endpoint.clone(), Node::new());
            report.endpoint.add_node(dst_endpoint.clone(), Node::new());
            report.endpoint.add_edge(
                &self.host_id,
                &src_endpoint,
                &dst_endpoint,
                EdgeMetadata {
                    max_conn_count_tcp: Some(1),
                    ..Default::default()
                },
            );
        });
        Ok(report)
    }

    async fn stop(&self) {
        Conntracker::stop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xml::{Layer3, Layer4, Meta};

    fn meta(direction: &str, id: i64, state: &str) -> Meta {
        Meta {
            direction: direction.to_string(),
            layer3: Layer3 { src_ip: "1.1.1.1".into(), dst_ip: "2.2.2.2".into() },
            layer4: Layer4 { proto: xml::TCP.into(), src_port: 1000, dst_port: 80 },
            id,
            state: state.to_string(),
        }
    }

    fn flow(flow_type: &str, id: i64, state: &str) -> Flow {
        xml::RawFlow {
            flow_type: flow_type.to_string(),
            metas: vec![meta("original", id, state), meta("independent", id, state)],
        }
        .into()
    }

    #[test]
    fn lifecycle_matches_scenario_s4() {
        let state = Arc::new(Mutex::new(State::default()));

        Conntracker::handle_flow(&state, flow(xml::NEW, 7, "SYN_SENT"), false);
        let mut seen = Vec::new();
        {
            let mut s = state.lock();
            for f in s.active_flows.values() {
                seen.push(f.independent.as_ref().unwrap().state.clone());
            }
            for f in &s.buffered_flows {
                seen.push(f.independent.as_ref().unwrap().state.clone());
            }
            s.buffered_flows.clear();
        }
        assert_eq!(seen, vec!["SYN_SENT"]);

        Conntracker::handle_flow(&state, flow(xml::UPDATE, 7, "ESTABLISHED"), false);
        {
            let s = state.lock();
            assert_eq!(s.active_flows.len(), 1);
            assert!(s.buffered_flows.is_empty());
        }

        Conntracker::handle_flow(&state, flow(xml::UPDATE, 7, xml::TIME_WAIT), false);
        {
            let s = state.lock();
            assert!(s.active_flows.is_empty());
            assert_eq!(s.buffered_flows.len(), 1);
        }

        // First WalkFlows after TIME_WAIT observes the buffered flow...
        let mut walked = 0;
        {
            let mut s = state.lock();
            walked += s.active_flows.len() + s.buffered_flows.len();
            s.buffered_flows.clear();
        }
        assert_eq!(walked, 1);

        // ...the next does not.
        let s = state.lock();
        assert!(s.active_flows.is_empty());
        assert!(s.buffered_flows.is_empty());
    }

    #[test]
    fn non_tcp_flows_are_rejected_before_handle_flow() {
        let raw = xml::RawFlow {
            flow_type: xml::NEW.to_string(),
            metas: vec![Meta {
                direction: "original".into(),
                layer3: Layer3 { src_ip: "1.1.1.1".into(), dst_ip: "2.2.2.2".into() },
                layer4: Layer4 { proto: "udp".into(), src_port: 53, dst_port: 53 },
                id: 1,
                state: String::new(),
            }],
        };
        let flow: Flow = raw.into();
        assert!(!flow.is_tcp());
    }
}
