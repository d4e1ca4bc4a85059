//! `vless://uuid@host:port?params#remark` links

use super::{split_remark, Descriptor, ProtocolSettings, UriParts};
use crate::engine::{
    GrpcSettings, OutboundSettings, RealitySettings, StreamSettings, TlsSettings, User, Vnext,
    WsSettings,
};
use crate::error::{PoolError, Result};

/// Fields carried by a vless link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VlessSettings {
    pub id: String,
    pub encryption: String,
    pub flow: String,
    pub network: String,
    pub security: String,
    pub sni: String,
    pub fingerprint: String,
    pub public_key: String,
    pub short_id: String,
    pub spider_x: String,
    pub path: String,
    pub host_header: String,
    pub service_name: String,
    pub allow_insecure: bool,
}

pub(super) fn parse(raw: &str) -> Result<Descriptor> {
    let (link, remark) = split_remark(raw);
    let parts = UriParts::parse(link)?;

    let port = parts
        .port
        .ok_or_else(|| PoolError::Parse(format!("vless link without port: {}", link)))?;

    Ok(Descriptor {
        remark,
        port,
        settings: ProtocolSettings::Vless(VlessSettings {
            id: parts.userinfo.clone(),
            encryption: parts.param("encryption"),
            flow: parts.param("flow"),
            network: parts.param("type"),
            security: parts.param("security"),
            sni: parts.param("sni"),
            fingerprint: parts.param("fp"),
            public_key: parts.param("pbk"),
            short_id: parts.param("sid"),
            spider_x: parts.param("spx"),
            path: parts.param("path"),
            host_header: parts.param("host"),
            service_name: parts.param("serviceName"),
            allow_insecure: parts.flag("allowInsecure"),
        }),
        host: parts.host,
    })
}

impl VlessSettings {
    pub(super) fn outbound_settings(&self, host: &str, port: u16) -> OutboundSettings {
        let encryption = if self.encryption.is_empty() {
            "none".to_string()
        } else {
            self.encryption.clone()
        };

        OutboundSettings {
            vnext: vec![Vnext {
                address: host.to_string(),
                port,
                users: vec![User {
                    id: self.id.clone(),
                    encryption,
                    flow: self.flow.clone(),
                    ..Default::default()
                }],
            }],
            servers: Vec::new(),
        }
    }

    pub(super) fn stream_settings(&self) -> Option<StreamSettings> {
        let network = if self.network.is_empty() {
            "tcp".to_string()
        } else {
            self.network.clone()
        };
        let security = if self.security.is_empty() {
            "none".to_string()
        } else {
            self.security.clone()
        };

        let tls_settings = (security == "tls").then(|| TlsSettings {
            server_name: self.sni.clone(),
            allow_insecure: self.allow_insecure,
            fingerprint: self.fingerprint.clone(),
            ..Default::default()
        });

        let reality_settings = (security == "reality").then(|| RealitySettings {
            server_name: self.sni.clone(),
            fingerprint: self.fingerprint.clone(),
            show: false,
            public_key: self.public_key.clone(),
            short_id: self.short_id.clone(),
            spider_x: self.spider_x.clone(),
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
            service_name: self.service_name.clone(),
        });

        Some(StreamSettings {
            network,
            security,
            tls_settings,
            reality_settings,
            ws_settings,
            grpc_settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{parse_link, Protocol};

    const REALITY_LINK: &str = "vless://c37cdcff-42f1-4f09-8ce1-0df6cf7e2520@sandking.fonixapp.org:33115?encryption=none&flow=xtls-rprx-vision&security=reality&sni=yelp.com&fp=chrome&pbk=53Q1y0Vmf2zaGBBlcO1NyKFvQM1TShkJKBCNjlevpns&sid=09cb&spx=%2F&allowInsecure=1&type=tcp&headerType=none#%F0%9F%87%A6%F0%9F%87%B9%20www.85.com%20%E5%A5%A5%E5%9C%B0%E5%88%A9";

    #[test]
    fn test_parse_vless_reality() {
        let d = parse_link(REALITY_LINK).unwrap();
        assert_eq!(d.protocol(), Protocol::Vless);
        assert_eq!(d.host, "sandking.fonixapp.org");
        assert_eq!(d.port, 33115);
        assert_eq!(d.remark(), "🇦🇹 www.85.com 奥地利");

        let user = &d.outbound_settings().vnext[0].users[0];
        assert_eq!(user.id, "c37cdcff-42f1-4f09-8ce1-0df6cf7e2520");
        assert_eq!(user.encryption, "none");
        assert_eq!(user.flow, "xtls-rprx-vision");

        let stream = d.stream_settings().unwrap();
        assert_eq!(stream.network, "tcp");
        assert_eq!(stream.security, "reality");
        let reality = stream.reality_settings.unwrap();
        assert_eq!(reality.server_name, "yelp.com");
        assert_eq!(reality.fingerprint, "chrome");
        assert_eq!(reality.public_key, "53Q1y0Vmf2zaGBBlcO1NyKFvQM1TShkJKBCNjlevpns");
        assert_eq!(reality.short_id, "09cb");
        assert_eq!(reality.spider_x, "/");
        assert!(stream.tls_settings.is_none());
    }

    #[test]
    fn test_parse_vless_defaults() {
        let d = parse_link("vless://uuid-1@example.com:443").unwrap();
        assert_eq!(d.remark, None);

        match &d.settings {
            ProtocolSettings::Vless(s) => {
                assert_eq!(s.flow, "");
                assert_eq!(s.fingerprint, "");
                assert!(!s.allow_insecure);
            }
            other => panic!("unexpected settings: {:?}", other),
        }

        let stream = d.stream_settings().unwrap();
        assert_eq!(stream.network, "tcp");
        assert_eq!(stream.security, "none");
    }

    #[test]
    fn test_parse_vless_ipv6_grpc() {
        let d = parse_link(
            "vless://270663ac-7abe-43e7-9f93-f0ee5ab4968c@[2001:41d0:701:1000::5505]:65531?encryption=none&security=none&type=grpc&serviceName=svc&authority=",
        )
        .unwrap();
        assert_eq!(d.host, "2001:41d0:701:1000::5505");
        let stream = d.stream_settings().unwrap();
        assert_eq!(stream.network, "grpc");
        assert_eq!(stream.grpc_settings.unwrap().service_name, "svc");
    }

    #[test]
    fn test_parse_vless_tls_ws() {
        let d = parse_link(
            "vless://id@h.example:8443?security=tls&sni=s.example&type=ws&path=%2Fws&host=cdn.example&allowInsecure=true#ws",
        )
        .unwrap();
        let stream = d.stream_settings().unwrap();
        let tls = stream.tls_settings.unwrap();
        assert_eq!(tls.server_name, "s.example");
        assert!(tls.allow_insecure);
        assert_eq!(stream.ws_settings.unwrap().path, "/ws");
    }

    #[test]
    fn test_parse_vless_bad_fragment_is_kept_raw() {
        let d = parse_link("vless://id@h.example:1#50%25%FF").unwrap();
        assert_eq!(d.remark(), "50%25%FF");
    }

    #[test]
    fn test_parse_vless_missing_port() {
        assert!(parse_link("vless://id@h.example").unwrap_err().is_parse_error());
    }
}
