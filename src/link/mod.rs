//! Proxy link parsing
//!
//! Turns `vmess://`, `vless://` and `trojan://` links into a protocol-neutral
//! [`Descriptor`]. Each protocol keeps exactly the fields it needs in
//! [`ProtocolSettings`]; the descriptor dispatches over it to produce the two
//! settings blobs written into the engine configuration.

mod trojan;
mod vless;
mod vmess;

pub use trojan::TrojanSettings;
pub use vless::VlessSettings;
pub use vmess::VmessSettings;

use std::collections::HashMap;

use url::{Host, Url};

use crate::engine::{Outbound, OutboundSettings, StreamSettings};
use crate::error::{PoolError, Result};

/// Link scheme / outbound protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
        }
    }

    /// Scheme token including the `://` separator
    pub fn prefix(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess://",
            Protocol::Vless => "vless://",
            Protocol::Trojan => "trojan://",
        }
    }

    pub fn from_link(raw: &str) -> Option<Self> {
        [Protocol::Vmess, Protocol::Vless, Protocol::Trojan]
            .into_iter()
            .find(|p| raw.starts_with(p.prefix()))
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Protocol specific fields of a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolSettings {
    Vmess(VmessSettings),
    Vless(VlessSettings),
    Trojan(TrojanSettings),
}

/// Parsed proxy endpoint, immutable once produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub remark: Option<String>,
    pub host: String,
    pub port: u16,
    pub settings: ProtocolSettings,
}

impl Descriptor {
    pub fn protocol(&self) -> Protocol {
        match self.settings {
            ProtocolSettings::Vmess(_) => Protocol::Vmess,
            ProtocolSettings::Vless(_) => Protocol::Vless,
            ProtocolSettings::Trojan(_) => Protocol::Trojan,
        }
    }

    pub fn remark(&self) -> &str {
        self.remark.as_deref().unwrap_or("")
    }

    /// Auth/routing settings of the outbound
    pub fn outbound_settings(&self) -> OutboundSettings {
        match &self.settings {
            ProtocolSettings::Vmess(s) => s.outbound_settings(&self.host, self.port),
            ProtocolSettings::Vless(s) => s.outbound_settings(&self.host, self.port),
            ProtocolSettings::Trojan(s) => s.outbound_settings(&self.host, self.port),
        }
    }

    /// Transport/security settings of the outbound, if any apply
    pub fn stream_settings(&self) -> Option<StreamSettings> {
        match &self.settings {
            ProtocolSettings::Vmess(s) => s.stream_settings(),
            ProtocolSettings::Vless(s) => s.stream_settings(),
            ProtocolSettings::Trojan(s) => s.stream_settings(),
        }
    }

    /// Complete outbound block for the engine configuration
    pub fn outbound(&self) -> Outbound {
        Outbound {
            protocol: self.protocol().as_str().to_string(),
            settings: self.outbound_settings(),
            stream_settings: self.stream_settings(),
        }
    }
}

/// Parse a raw proxy link into a descriptor
pub fn parse_link(raw: &str) -> Result<Descriptor> {
    let raw = raw.trim();
    match Protocol::from_link(raw) {
        Some(Protocol::Vmess) => vmess::parse(raw),
        Some(Protocol::Vless) => vless::parse(raw),
        Some(Protocol::Trojan) => trojan::parse(raw),
        None => Err(PoolError::UnsupportedProtocol(raw.to_string())),
    }
}

/// Split off and decode the `#remark` fragment
///
/// Decode failures keep the raw fragment text.
fn split_remark(raw: &str) -> (&str, Option<String>) {
    match raw.split_once('#') {
        Some((link, fragment)) => {
            let remark = urlencoding::decode(fragment)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| fragment.to_string());
            (link, Some(remark).filter(|r| !r.is_empty()))
        }
        None => (raw, None),
    }
}

/// Pieces of a `scheme://userinfo@host:port?query` link
struct UriParts {
    userinfo: String,
    host: String,
    port: Option<u16>,
    query: HashMap<String, String>,
}

impl UriParts {
    fn parse(link: &str) -> Result<Self> {
        let url = Url::parse(link)?;

        let host = match url.host() {
            Some(Host::Domain(d)) => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(PoolError::Parse(format!("missing host: {}", link))),
        };

        let userinfo = urlencoding::decode(url.username())
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| url.username().to_string());

        Ok(Self {
            userinfo,
            host,
            port: url.port(),
            query: url.query_pairs().into_owned().collect(),
        })
    }

    fn param(&self, key: &str) -> String {
        self.query.get(key).cloned().unwrap_or_default()
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.param(key).to_lowercase().as_str(), "1" | "true")
    }
}
