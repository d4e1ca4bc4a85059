//! `vmess://base64(json)` links

use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::{Descriptor, ProtocolSettings};
use crate::engine::{
    GrpcSettings, OutboundSettings, StreamSettings, TlsSettings, User, Vnext, WsSettings,
};
use crate::error::{PoolError, Result};

/// Fields carried by a vmess link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmessSettings {
    pub id: String,
    pub alter_id: u32,
    /// User cipher (`scy`)
    pub cipher: String,
    pub network: String,
    pub header_type: String,
    pub path: String,
    pub host_header: String,
    /// Stream security (`tls`)
    pub tls: String,
    pub sni: String,
}

/// JSON payload as found in the wild; numbers are frequently quoted
#[derive(Debug, Deserialize)]
struct VmessJson {
    #[serde(default)]
    add: String,
    #[serde(default, deserialize_with = "string_or_number")]
    port: String,
    #[serde(default)]
    id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    aid: String,
    #[serde(default)]
    ps: String,
    #[serde(default)]
    net: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    scy: String,
    #[serde(default, rename = "type")]
    header_type: String,
    #[serde(default)]
    tls: String,
    #[serde(default)]
    sni: String,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn decode_payload(encoded: &str) -> Result<Vec<u8>> {
    let encoded = encoded.trim();
    STANDARD
        .decode(encoded)
        .or_else(|_| STANDARD_NO_PAD.decode(encoded))
        .or_else(|_| URL_SAFE.decode(encoded))
        .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
        .map_err(PoolError::from)
}

pub(super) fn parse(raw: &str) -> Result<Descriptor> {
    let encoded = raw.trim_start_matches("vmess://");
    let payload = decode_payload(encoded)?;
    let json: VmessJson = serde_json::from_slice(&payload)?;

    if json.add.is_empty() {
        return Err(PoolError::Parse("vmess link without address".to_string()));
    }
    let port = json
        .port
        .trim()
        .parse::<u16>()
        .map_err(|_| PoolError::Parse(format!("invalid vmess port: {:?}", json.port)))?;
    let alter_id = if json.aid.trim().is_empty() {
        0
    } else {
        json.aid
            .trim()
            .parse::<u32>()
            .map_err(|_| PoolError::Parse(format!("invalid vmess alterId: {:?}", json.aid)))?
    };

    Ok(Descriptor {
        remark: Some(json.ps).filter(|r| !r.is_empty()),
        host: json.add,
        port,
        settings: ProtocolSettings::Vmess(VmessSettings {
            id: json.id,
            alter_id,
            cipher: json.scy,
            network: json.net,
            header_type: json.header_type,
            path: json.path,
            host_header: json.host,
            tls: json.tls,
            sni: json.sni,
        }),
    })
}

impl VmessSettings {
    pub(super) fn outbound_settings(&self, host: &str, port: u16) -> OutboundSettings {
        OutboundSettings {
            vnext: vec![Vnext {
                address: host.to_string(),
                port,
                users: vec![User {
                    id: self.id.clone(),
                    alter_id: self.alter_id,
                    security: self.cipher.clone(),
                    ..Default::default()
                }],
            }],
            servers: Vec::new(),
        }
    }

    pub(super) fn stream_settings(&self) -> Option<StreamSettings> {
        if self.network.is_empty() && self.tls.is_empty() {
            return None;
        }

        let network = if self.network.is_empty() {
            "tcp".to_string()
        } else {
            self.network.clone()
        };
        let security = if self.tls.is_empty() {
            "none".to_string()
        } else {
            self.tls.clone()
        };

        let tls_settings = (security == "tls").then(|| TlsSettings {
            server_name: if self.sni.is_empty() {
                self.host_header.clone()
            } else {
                self.sni.clone()
            },
            ..Default::default()
        });

        let ws_settings = (network == "ws").then(|| {
            let mut headers = std::collections::BTreeMap::new();
            if !self.host_header.is_empty() {
                headers.insert("Host".to_string(), self.host_header.clone());
            }
            WsSettings {
                path: self.path.clone(),
                headers,
            }
        });

        let grpc_settings = (network == "grpc").then(|| GrpcSettings {
            service_name: self.path.clone(),
        });

        Some(StreamSettings {
            network,
            security,
            tls_settings,
            ws_settings,
            grpc_settings,
            ..Default::default()
        })
    }
}
