use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::models::{Relay, RelayScheme};
use crate::nips::logs::ProbeLogs;

/// TLS certificate and session details for a clearnet `wss` relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Nip66SslData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_issuer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_subject_cn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_san: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cipher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cipher_bits: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_fingerprint_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_not_before: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_not_after: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_version: Option<i64>,
}

/// SSL probe result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Nip66SslMetadata {
    pub data: Nip66SslData,
    pub logs: ProbeLogs,
}

impl Nip66SslMetadata {
    pub fn to_payload(&self) -> Value {
        json!({
            "data": serde_json::to_value(&self.data).unwrap_or(Value::Null),
            "logs": serde_json::to_value(&self.logs).unwrap_or(Value::Null),
        })
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            data: Nip66SslData::default(),
            logs: ProbeLogs::fail(reason),
        }
    }
}

struct HandshakeCapture {
    peer_cert_der: Vec<u8>,
    protocol: Option<String>,
    cipher: Option<String>,
}

fn webpki_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn insecure_config() -> rustls::ClientConfig {
    crate::transport::insecure_client_config()
}

fn protocol_name(version: rustls::ProtocolVersion) -> String {
    match version {
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        other => format!("{other:?}"),
    }
}

/// One blocking TLS handshake, capturing the leaf certificate and
/// negotiated session parameters.
fn handshake(
    host: &str,
    port: u16,
    config: rustls::ClientConfig,
    timeout: Duration,
) -> Result<HandshakeCapture, (bool, String)> {
    let net_err = |e: String| (false, e);
    let cert_err = |e: String| (true, e);

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| net_err(format!("resolution failed: {e}")))?
        .next()
        .ok_or_else(|| net_err("host resolved to no addresses".to_string()))?;

    let mut stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| net_err(format!("connect failed: {e}")))?;
    stream.set_read_timeout(Some(timeout)).ok();
    stream.set_write_timeout(Some(timeout)).ok();

    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| net_err(format!("invalid server name: {e}")))?;
    let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| net_err(e.to_string()))?;

    while conn.is_handshaking() {
        conn.complete_io(&mut stream).map_err(|e| {
            // Alerts triggered by certificate rejection surface as io
            // errors wrapping a rustls InvalidCertificate.
            let message = e.to_string();
            if message.contains("InvalidCertificate") || message.contains("invalid peer certificate")
            {
                cert_err(message)
            } else {
                net_err(message)
            }
        })?;
    }

    let peer_cert_der = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec())
        .ok_or_else(|| net_err("no peer certificate presented".to_string()))?;

    Ok(HandshakeCapture {
        peer_cert_der,
        protocol: conn.protocol_version().map(protocol_name),
        cipher: conn
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite())),
    })
}

fn cipher_bits(cipher: &str) -> Option<i64> {
    if cipher.contains("128") {
        Some(128)
    } else if cipher.contains("256") || cipher.contains("CHACHA20") {
        Some(256)
    } else {
        None
    }
}

fn fill_from_capture(data: &mut Nip66SslData, capture: &HandshakeCapture) {
    data.ssl_protocol = capture.protocol.clone();
    data.ssl_cipher = capture.cipher.clone();
    data.ssl_cipher_bits = capture.cipher.as_deref().and_then(cipher_bits);
    data.ssl_fingerprint_sha256 = Some(hex::encode(Sha256::digest(&capture.peer_cert_der)));

    let Ok((_, cert)) = X509Certificate::from_der(&capture.peer_cert_der) else {
        return;
    };
    data.ssl_subject_cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    data.ssl_issuer = Some(cert.issuer().to_string());
    data.ssl_not_before = Some(cert.validity().not_before.timestamp());
    data.ssl_not_after = Some(cert.validity().not_after.timestamp());
    data.ssl_serial = Some(cert.raw_serial_as_string());
    data.ssl_version = Some(i64::from(cert.version().0));

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        let names: Vec<String> = san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some((*dns).to_string()),
                GeneralName::IPAddress(ip) if ip.len() == 4 => {
                    Some(format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]))
                }
                _ => None,
            })
            .collect();
        if !names.is_empty() {
            data.ssl_san = Some(names);
        }
    }
}

/// Inspect a relay's TLS certificate.
///
/// Clearnet `wss` only: overlay relays and plain `ws` report an explicit
/// failure instead of being probed. Validity reflects a handshake
/// against the webpki roots; when that fails on the certificate, an
/// unverified handshake still captures the certificate details with
/// `ssl_valid = false`.
pub async fn run_ssl(relay: &Relay, timeout: Duration) -> Nip66SslMetadata {
    if relay.network().is_overlay() {
        return Nip66SslMetadata::failed("ssl check requires a clearnet relay");
    }
    if relay.scheme() != RelayScheme::Wss {
        return Nip66SslMetadata::failed("ssl check requires a wss relay");
    }

    let host = relay.host().to_string();
    let port = relay.effective_port();

    let result = tokio::task::spawn_blocking(move || {
        match handshake(&host, port, webpki_config(), timeout) {
            Ok(capture) => Ok((capture, true)),
            Err((true, reason)) => {
                tracing::debug!(
                    target: "bigbrotr::nips::nip66",
                    "ssl_invalid host={host} reason={reason}"
                );
                handshake(&host, port, insecure_config(), timeout)
                    .map(|capture| (capture, false))
                    .map_err(|(_, e)| e)
            }
            Err((false, reason)) => Err(reason),
        }
    })
    .await;

    match result {
        Ok(Ok((capture, valid))) => {
            let mut data = Nip66SslData {
                ssl_valid: Some(valid),
                ..Nip66SslData::default()
            };
            fill_from_capture(&mut data, &capture);
            Nip66SslMetadata {
                data,
                logs: ProbeLogs::ok(),
            }
        }
        Ok(Err(reason)) => Nip66SslMetadata::failed(reason),
        Err(e) => Nip66SslMetadata::failed(format!("ssl probe panicked: {e}")),
    }
}
