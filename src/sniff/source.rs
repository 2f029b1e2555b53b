//! Packet data source abstraction (spec.md §6 "Packet source").

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SniffError {
    #[error("failed to open capture device {device}: {source}")]
    OpenDevice {
        device: String,
        #[source]
        source: pcap::Error,
    },

    #[error("capture read error: {0}")]
    Read(#[from] pcap::Error),
}

/// A zero-copy packet data source; `next_packet` returns `None` on EOF
/// (spec.md §6: "a zero-copy packet data source providing `(data, captureInfo,
/// error)` per call; EOF terminates").
#[async_trait]
pub trait PacketSource: Send {
    async fn next_packet(&mut self) -> Result<Option<Vec<u8>>, SniffError>;
}

/// Live capture off a named interface via libpcap.
pub struct PcapSource {
    capture: pcap::Capture<pcap::Active>,
}

const SNAPLEN: i32 = 65535;
const PROMISCUOUS: bool = true;

impl PcapSource {
    pub fn open(device: &str) -> Result<Self, SniffError> {
        let capture = pcap::Capture::from_device(device)
            .map_err(|e| SniffError::OpenDevice { device: device.to_string(), source: e })?
            .snaplen(SNAPLEN)
            .promisc(PROMISCUOUS)
            .immediate_mode(true)
            .open()
            .map_err(|e| SniffError::OpenDevice { device: device.to_string(), source: e })?;
        Ok(Self { capture })
    }
}

#[async_trait]
impl PacketSource for PcapSource {
    async fn next_packet(&mut self) -> Result<Option<Vec<u8>>, SniffError> {
        // pcap's API blocks the calling thread; run it via block_in_place so
        // it never stalls the reactor while waiting for the next packet.
        // `TimeoutExpired` just means no packet arrived within the read
        // timeout — retry rather than surface it as EOF, or an idle gap in
        // traffic would permanently kill the reader (spec.md §4.5 "On
        // source EOF, the reader closes `done`" only applies to a real
        // end-of-capture, not a quiet interval).
        let capture = &mut self.capture;
        loop {
            match tokio::task::block_in_place(|| capture.next_packet()) {
                Ok(packet) => return Ok(Some(packet.data.to_vec())),
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => return Ok(None),
                Err(e) => return Err(SniffError::Read(e)),
            }
        }
    }
}

/// Constructs a fresh [`PacketSource`] for one sniffer instance.
pub type SourceFactory = std::sync::Arc<dyn Fn() -> Result<Box<dyn PacketSource>, SniffError> + Send + Sync>;

pub fn live_source_factory(device: String) -> SourceFactory {
    std::sync::Arc::new(move || PcapSource::open(&device).map(|s| Box::new(s) as Box<dyn PacketSource>))
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// An in-memory [`PacketSource`] that replays a fixed queue, for tests.
    pub struct FixedSource(pub Mutex<VecDeque<Vec<u8>>>);

    #[async_trait]
    impl PacketSource for FixedSource {
        async fn next_packet(&mut self) -> Result<Option<Vec<u8>>, SniffError> {
            Ok(self.0.lock().unwrap().pop_front())
        }
    }
}
