//! Metadata extraction from submitted configuration documents
//!
//! Documents follow the upstream engine's JSON shape: a top-level `inbounds`
//! array where each inbound carries a `tag`, a `port` (number or `"from-to"`
//! string) and optional `settings`. The registry only reads this structure for
//! diagnostic reporting; full validation belongs to the engine.

use serde::{Deserialize, Serialize};

/// Inbound tag whose port ranges are reported by the `/usingport` endpoint
const DIAGNOSTIC_TAG: &str = "proxy";

/// An inclusive listening port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { from: port, to: port }
    }

    /// Number of ports covered by the range
    pub fn len(&self) -> usize {
        (self.to.saturating_sub(self.from) as usize) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.to < self.from
    }
}

/// Port field of an inbound: a single number or a `"from-to"` string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Number(u16),
    Text(String),
}

impl PortSpec {
    /// Resolve the spec into a concrete range, if well-formed.
    pub fn range(&self) -> Option<PortRange> {
        match self {
            PortSpec::Number(port) => Some(PortRange::single(*port)),
            PortSpec::Text(text) => {
                let (from, to) = match text.split_once('-') {
                    Some((from, to)) => (from.trim().parse().ok()?, to.trim().parse().ok()?),
                    None => {
                        let port = text.trim().parse().ok()?;
                        (port, port)
                    }
                };
                if to < from {
                    return None;
                }
                Some(PortRange { from, to })
            }
        }
    }
}

/// Forwarding target of an inbound, read from its `settings` block
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundSettings {
    pub address: Option<String>,
    pub port: Option<u16>,
}

/// One inbound declaration of a configuration document
#[derive(Debug, Clone, Deserialize)]
pub struct InboundConfig {
    pub tag: Option<String>,
    pub port: Option<PortSpec>,
    #[serde(default)]
    pub settings: InboundSettings,
}

impl InboundConfig {
    pub fn port_range(&self) -> Option<PortRange> {
        self.port.as_ref().and_then(PortSpec::range)
    }
}

/// The subset of a configuration document the control plane understands
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
}

/// Parse a raw document into its structured form.
pub fn parse(document: &str) -> Result<ConfigDocument, serde_json::Error> {
    serde_json::from_str(document)
}

/// Extract the listening port ranges of inbounds tagged for diagnostics.
///
/// Returns `None` when the document does not parse or declares no such
/// inbounds; absence of metadata is never an error.
pub fn extract_proxy_port_ranges(document: &str) -> Option<Vec<PortRange>> {
    let parsed = parse(document).ok()?;
    let ranges: Vec<PortRange> = parsed
        .inbounds
        .iter()
        .filter(|inbound| inbound.tag.as_deref() == Some(DIAGNOSTIC_TAG))
        .filter_map(InboundConfig::port_range)
        .collect();

    if ranges.is_empty() {
        None
    } else {
        Some(ranges)
    }
}
