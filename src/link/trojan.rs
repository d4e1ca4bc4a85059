//! `trojan://password@host:port?params#remark` links

use super::{split_remark, Descriptor, ProtocolSettings, UriParts};
use crate::engine::{OutboundSettings, Server, StreamSettings, TlsSettings};
use crate::error::Result;

/// Port assumed when the link leaves it out
pub const DEFAULT_TROJAN_PORT: u16 = 443;

/// Fields carried by a trojan link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrojanSettings {
    pub password: String,
    pub sni: String,
    pub alpn: Vec<String>,
    /// Carried for display only; xray trojan outbounds take no plugin
    pub plugin: String,
}

pub(super) fn parse(raw: &str) -> Result<Descriptor> {
    let (link, remark) = split_remark(raw);
    let parts = UriParts::parse(link)?;

    let password = if parts.userinfo.is_empty() {
        parts.param("password")
    } else {
        parts.userinfo.clone()
    };

    let sni = match parts.param("sni") {
        s if s.is_empty() => parts.host.clone(),
        s => s,
    };

    let alpn = parts
        .param("alpn")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    Ok(Descriptor {
        remark,
        port: parts.port.unwrap_or(DEFAULT_TROJAN_PORT),
        settings: ProtocolSettings::Trojan(TrojanSettings {
            password,
            sni,
            alpn,
            plugin: parts.param("plugin"),
        }),
        host: parts.host,
    })
}

impl TrojanSettings {
    pub(super) fn outbound_settings(&self, host: &str, port: u16) -> OutboundSettings {
        OutboundSettings {
            vnext: Vec::new(),
            servers: vec![Server {
                address: host.to_string(),
                port,
                password: self.password.clone(),
            }],
        }
    }

    pub(super) fn stream_settings(&self) -> Option<StreamSettings> {
        if self.sni.is_empty() && self.alpn.is_empty() {
            return None;
        }
        Some(StreamSettings {
            network: "tcp".to_string(),
            security: "tls".to_string(),
            tls_settings: Some(TlsSettings {
                server_name: self.sni.clone(),
                alpn: self.alpn.clone(),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{parse_link, Protocol};

    fn trojan(d: &Descriptor) -> &TrojanSettings {
        match &d.settings {
            ProtocolSettings::Trojan(s) => s,
            other => panic!("unexpected settings: {:?}", other),
        }
    }

    #[test]
    fn test_parse_trojan_full() {
        let d = parse_link(
            "trojan://password123@example.com:8443?sni=front.example&alpn=h2,http%2F1.1&plugin=obfs#My%20Trojan",
        )
        .unwrap();
        assert_eq!(d.protocol(), Protocol::Trojan);
        assert_eq!(d.host, "example.com");
        assert_eq!(d.port, 8443);
        assert_eq!(d.remark(), "My Trojan");

        let s = trojan(&d);
        assert_eq!(s.password, "password123");
        assert_eq!(s.sni, "front.example");
        assert_eq!(s.alpn, vec!["h2".to_string(), "http/1.1".to_string()]);
        assert_eq!(s.plugin, "obfs");

        let server = &d.outbound_settings().servers[0];
        assert_eq!(server.address, "example.com");
        assert_eq!(server.port, 8443);
        assert_eq!(server.password, "password123");
    }

    #[test]
    fn test_parse_trojan_default_port() {
        for link in [
            "trojan://pw@example.com",
            "trojan://pw@example.com?sni=x",
            "trojan://pw@example.com#remark",
            "trojan://pw@10.0.0.1/",
        ] {
            assert_eq!(parse_link(link).unwrap().port, DEFAULT_TROJAN_PORT, "{}", link);
        }
    }

    #[test]
    fn test_parse_trojan_password_query_fallback() {
        let d = parse_link("trojan://example.com:443?password=from-query").unwrap();
        assert_eq!(trojan(&d).password, "from-query");

        let d = parse_link("trojan://@example.com:443?password=q%2Bpw").unwrap();
        assert_eq!(trojan(&d).password, "q+pw");

        // userinfo wins over the query parameter
        let d = parse_link("trojan://user-pw@example.com:443?password=ignored").unwrap();
        assert_eq!(trojan(&d).password, "user-pw");
    }

    #[test]
    fn test_parse_trojan_sni_defaults_to_host() {
        let d = parse_link("trojan://pw@example.com:443").unwrap();
        assert_eq!(trojan(&d).sni, "example.com");
        let stream = d.stream_settings().unwrap();
        assert_eq!(stream.security, "tls");
        assert_eq!(stream.tls_settings.unwrap().server_name, "example.com");
    }

    #[test]
    fn test_parse_trojan_percent_encoded_password() {
        let d = parse_link("trojan://p%40ss%3Aword@example.com:443").unwrap();
        assert_eq!(trojan(&d).password, "p@ss:word");
    }
}
