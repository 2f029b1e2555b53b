//! Duty-cycled packet sniffer (spec.md §4.5, §9 "gated" design).
//!
//! A reader task drains the [`PacketSource`] and decodes frames only while
//! a shared atomic gate is set; a merge task folds decoded packets into an
//! accumulating [`Report`] that `Report()` swaps out on each probe tick.
//! The gate itself is toggled by a single background timer task rather
//! than the two-timers-racing design spec.md §4.5 step 3 describes, since
//! a plain `sleep(off); on; sleep(on); off` loop produces the identical
//! on/off duty cycle with one fewer moving part.

pub mod decode;
pub mod source;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

pub use source::{PacketSource, SniffError, SourceFactory};

use crate::error::ProbeError;
use crate::report::{id, EdgeMetadata, Node, Report};

/// Duty-cycled packet sniffer (spec.md §4.5).
pub struct Sniffer {
    host_id: String,
    gate: Arc<AtomicBool>,
    total: Arc<AtomicU64>,
    captured: Arc<AtomicU64>,
    accumulator: Arc<Mutex<Report>>,
    reader_task: tokio::task::JoinHandle<()>,
    merge_task: tokio::task::JoinHandle<()>,
    gate_task: tokio::task::JoinHandle<()>,
    quit: Arc<tokio::sync::Notify>,
}

impl Sniffer {
    /// `on`/`off` durations bound the wall-clock fraction spent decoding
    /// (spec.md §4.5 "Duty-cycling").
    pub fn spawn(host_id: String, source_factory: SourceFactory, on: Duration, off: Duration) -> Result<Self, SniffError> {
        let source = source_factory()?;
        let gate = Arc::new(AtomicBool::new(false));
        let total = Arc::new(AtomicU64::new(0));
        let captured = Arc::new(AtomicU64::new(0));
        let accumulator = Arc::new(Mutex::new(Report::empty()));
        let quit = Arc::new(tokio::sync::Notify::new());

        let (packet_tx, packet_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(Self::run_reader(source, gate.clone(), total.clone(), captured.clone(), packet_tx));
        let merge_task = tokio::spawn(Self::run_merge(host_id.clone(), packet_rx, accumulator.clone()));
        let gate_task = tokio::spawn(Self::run_gate(gate.clone(), on, off, quit.clone()));

        Ok(Self {
            host_id,
            gate,
            total,
            captured,
            accumulator,
            reader_task,
            merge_task,
            gate_task,
            quit,
        })
    }

    async fn run_reader(
        mut source: Box<dyn PacketSource>,
        gate: Arc<AtomicBool>,
        total: Arc<AtomicU64>,
        captured: Arc<AtomicU64>,
        packet_tx: mpsc::UnboundedSender<decode::Decoded>,
    ) {
        loop {
            match source.next_packet().await {
                Ok(Some(data)) => {
                    total.fetch_add(1, Ordering::Relaxed);
                    if !gate.load(Ordering::Relaxed) {
                        continue;
                    }
                    captured.fetch_add(1, Ordering::Relaxed);
                    let decoded = decode::decode_ethernet_frame(&data);
                    if packet_tx.send(decoded).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "sniffer source read error");
                    return;
                }
            }
        }
    }

    async fn run_merge(
        host_id: String,
        mut packet_rx: mpsc::UnboundedReceiver<decode::Decoded>,
        accumulator: Arc<Mutex<Report>>,
    ) {
        while let Some(packet) = packet_rx.recv().await {
            let mut report = accumulator.lock();
            merge_packet(&host_id, &packet, &mut report);
        }
    }

    async fn run_gate(gate: Arc<AtomicBool>, on: Duration, off: Duration, quit: Arc<tokio::sync::Notify>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(off) => {}
                _ = quit.notified() => return,
            }
            gate.store(true, Ordering::Relaxed);
            tokio::select! {
                _ = tokio::time::sleep(on) => {}
                _ = quit.notified() => { gate.store(false, Ordering::Relaxed); return; }
            }
            gate.store(false, Ordering::Relaxed);
        }
    }

    /// Packets observed since startup, including those skipped while the
    /// gate was closed (spec.md §4.5 step 2 `total`).
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Packets actually decoded (spec.md §4.5 "captured"; used for the
    /// `captured/observed` sample-ratio property, spec.md §8 test 6).
    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }
}

/// Fold one decoded packet into `report`'s Address and Endpoint topologies
/// (spec.md §4.5 "Packet-to-Report merge rules").
fn merge_packet(host_id: &str, packet: &decode::Decoded, report: &mut Report) {
    let (Some(src_ip), Some(dst_ip)) = (&packet.src_ip, &packet.dst_ip) else {
        return;
    };

    let src_addr = id::address_node_id(host_id, src_ip);
    let dst_addr = id::address_node_id(host_id, dst_ip);
    report.address.add_node(src_addr.clone(), Node::new());
    report.address.add_node(dst_addr.clone(), Node::new());
    report.address.add_edge(
        host_id,
        &src_addr,
        &dst_addr,
        EdgeMetadata {
            packet_count: Some(1),
            byte_count: Some(packet.network_bytes as u64),
            ..Default::default()
        },
    );

    if let (Some(src_port), Some(dst_port)) = (&packet.src_port, &packet.dst_port) {
        let src_endpoint = id::endpoint_node_id(host_id, src_ip, src_port);
        let dst_endpoint = id::endpoint_node_id(host_id, dst_ip, dst_port);
        report.endpoint.add_node(src_endpoint.clone(), Node::new());
        report.endpoint.add_node(dst_endpoint.clone(), Node::new());
        report.endpoint.add_edge(
            host_id,
            &src_endpoint,
            &dst_endpoint,
            EdgeMetadata {
                packet_count: Some(1),
                byte_count: Some(packet.transport_bytes as u64),
                ..Default::default()
            },
        );
    }
}

impl Drop for Sniffer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl crate::reporter::Reporter for Sniffer {
    fn name(&self) -> &str {
        "sniffer"
    }

    async fn report(&self) -> Result<Report, ProbeError> {
        let mut guard = self.accumulator.lock();
        Ok(std::mem::replace(&mut *guard, Report::empty()))
    }

    async fn stop(&self) {
        self.quit.notify_waiters();
        self.reader_task.abort();
        self.merge_task.abort();
        self.gate_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use source::test_support::FixedSource;
    use std::collections::VecDeque;

    fn ethernet_ipv4_tcp_frame(src_ip: [u8; 4], dst_ip: [u8; 4]) -> Vec<u8> {
        // 14-byte Ethernet header (dst/src MAC + EtherType 0x0800) + minimal
        // IPv4 header (20 bytes, no options) + minimal TCP header (20 bytes).
        let mut frame = vec![0u8; 14];
        frame[12] = 0x08;
        frame[13] = 0x00;

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45; // version 4, IHL 5
        ip[9] = 6; // protocol TCP
        ip[12..16].copy_from_slice(&src_ip);
        ip[16..20].copy_from_slice(&dst_ip);
        let total_len: u16 = 40;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());

        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&1234u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
        tcp[12] = 0x50; // data offset 5

        frame.extend(ip);
        frame.extend(tcp);
        frame
    }

    #[tokio::test]
    async fn merge_packet_populates_address_and_endpoint_topologies() {
        let frame = ethernet_ipv4_tcp_frame([10, 0, 0, 1], [10, 0, 0, 2]);
        let decoded = decode::decode_ethernet_frame(&frame);
        assert_eq!(decoded.src_ip.as_deref(), Some("10.0.0.1"));

        let mut report = Report::empty();
        merge_packet("h1", &decoded, &mut report);

        let src = id::address_node_id("h1", "10.0.0.1");
        let dst = id::address_node_id("h1", "10.0.0.2");
        assert!(report.address.nodes.contains_key(&src));
        assert!(report.address.nodes.contains_key(&dst));
        let edge = report.address.edge_metadata.get(&id::edge_id(&src, &dst)).unwrap();
        assert_eq!(edge.packet_count, Some(1));
        assert!(edge.byte_count.unwrap() > 0);

        let src_endpoint = id::endpoint_node_id("h1", "10.0.0.1", "1234");
        let dst_endpoint = id::endpoint_node_id("h1", "10.0.0.2", "80");
        assert!(report.endpoint.nodes.contains_key(&src_endpoint));
        assert!(report.endpoint.nodes.contains_key(&dst_endpoint));
    }

    #[tokio::test(start_paused = true)]
    async fn report_drains_accumulator_and_resets_it() {
        let frame = ethernet_ipv4_tcp_frame([1, 1, 1, 1], [2, 2, 2, 2]);
        let source: SourceFactory = Arc::new(move || {
            Ok(Box::new(FixedSource(std::sync::Mutex::new(VecDeque::from([frame.clone()])))) as Box<dyn PacketSource>)
        });

        let sniffer = Sniffer::spawn("h1".to_string(), source, Duration::from_secs(10), Duration::from_millis(0)).unwrap();

        // Gate opens once the off-timer (0ms) elapses.
        for _ in 0..50 {
            tokio::time::advance(Duration::from_millis(1)).await;
            tokio::task::yield_now().await;
            if sniffer.captured() > 0 {
                break;
            }
        }

        let first = crate::reporter::Reporter::report(&sniffer).await.unwrap();
        assert!(!first.address.is_empty());
        let second = crate::reporter::Reporter::report(&sniffer).await.unwrap();
        assert!(second.is_empty());
    }
}
