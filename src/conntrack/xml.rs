//! `conntrack -o xml` wire types (spec.md §6 "Conntrack XML input").
//!
//! The prelude (`XMLHeader` then `ConntrackOpenTag`) is consumed as plain
//! lines before any XML decoding starts — `quick-xml` never sees it.

use serde::Deserialize;

pub const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n";
pub const CONNTRACK_OPEN_TAG: &str = "<conntrack>\n";

pub const TCP: &str = "tcp";
pub const TIME_WAIT: &str = "TIME_WAIT";
pub const NEW: &str = "new";
pub const UPDATE: &str = "update";
pub const DESTROY: &str = "destroy";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Layer3 {
    #[serde(rename = "src")]
    pub src_ip: String,
    #[serde(rename = "dst")]
    pub dst_ip: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Layer4 {
    #[serde(rename = "@protoname")]
    pub proto: String,
    #[serde(rename = "sport")]
    pub src_port: u16,
    #[serde(rename = "dport")]
    pub dst_port: u16,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Meta {
    #[serde(rename = "@direction")]
    pub direction: String,
    pub layer3: Layer3,
    pub layer4: Layer4,
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub state: String,
}

/// One `<flow>` element: up to three metas (`original`, `reply`,
/// `independent`), dispatched on the `direction` attribute rather than on
/// field presence (spec.md §9 "dispatch on element presence").
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RawFlow {
    #[serde(rename = "@type")]
    pub flow_type: String,
    #[serde(rename = "meta", default)]
    pub metas: Vec<Meta>,
}

/// A decoded flow with its three metas already classified by direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub flow_type: String,
    pub original: Option<Meta>,
    pub reply: Option<Meta>,
    pub independent: Option<Meta>,
}

impl From<RawFlow> for Flow {
    fn from(raw: RawFlow) -> Self {
        let mut original = None;
        let mut reply = None;
        let mut independent = None;
        for meta in raw.metas {
            match meta.direction.as_str() {
                "original" => original = Some(meta),
                "reply" => reply = Some(meta),
                "independent" => independent = Some(meta),
                _ => {}
            }
        }
        Self {
            flow_type: raw.flow_type,
            original,
            reply,
            independent,
        }
    }
}

impl Flow {
    /// Only TCP flows are retained (spec.md §4.4 "Filter").
    pub fn is_tcp(&self) -> bool {
        self.original
            .as_ref()
            .map(|m| m.layer4.proto == TCP)
            .unwrap_or(false)
    }
}

/// Batch root used by the one-shot `-L` snapshot (spec.md §4.4b).
#[derive(Debug, Clone, Deserialize)]
pub struct ConntrackBatch {
    #[serde(rename = "flow", default)]
    pub flows: Vec<RawFlow>,
}

/// Strip the two expected prelude lines from a reader, returning an error if
/// either doesn't match verbatim.
pub fn expect_prelude<R: std::io::BufRead>(reader: &mut R) -> std::io::Result<()> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line != XML_HEADER {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected conntrack header line: {line:?}"),
        ));
    }
    line.clear();
    reader.read_line(&mut line)?;
    if line != CONNTRACK_OPEN_TAG {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected conntrack open tag: {line:?}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_flow_classifies_metas_by_direction() {
        let raw = RawFlow {
            flow_type: NEW.to_string(),
            metas: vec![
                Meta {
                    direction: "original".into(),
                    layer3: Layer3 { src_ip: "1.1.1.1".into(), dst_ip: "2.2.2.2".into() },
                    layer4: Layer4 { proto: TCP.into(), src_port: 1000, dst_port: 80 },
                    id: 0,
                    state: String::new(),
                },
                Meta {
                    direction: "independent".into(),
                    layer3: Layer3 { src_ip: String::new(), dst_ip: String::new() },
                    layer4: Layer4 { proto: String::new(), src_port: 0, dst_port: 0 },
                    id: 7,
                    state: "SYN_SENT".into(),
                },
            ],
        };
        let flow: Flow = raw.into();
        assert!(flow.is_tcp());
        assert_eq!(flow.independent.unwrap().id, 7);
        assert!(flow.reply.is_none());
    }

    #[test]
    fn prelude_accepts_exact_lines_only() {
        let mut reader = std::io::Cursor::new(format!("{XML_HEADER}{CONNTRACK_OPEN_TAG}"));
        assert!(expect_prelude(&mut reader).is_ok());

        let mut bad = std::io::Cursor::new("garbage\n");
        assert!(expect_prelude(&mut bad).is_err());
    }
}
