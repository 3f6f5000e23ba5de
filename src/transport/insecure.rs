use std::sync::Arc;
use std::time::Duration;

use async_wsocket::{ConnectionMode, Message as WsMessage};
use futures::{SinkExt, StreamExt};
use nostr_sdk::pool::transport::error::TransportError;
use nostr_sdk::pool::transport::websocket::{BoxSink, BoxStream, WebSocketTransport};
use nostr_sdk::prelude::*;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_tungstenite::Connector;
use tokio_tungstenite::tungstenite::Message;

/// WebSocket transport with TLS certificate verification disabled.
///
/// Installed on the fallback client after a verified connection attempt
/// failed with a TLS-classified error and the caller allowed insecure
/// transport. Never used as the first attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsecureWebSocketTransport;

impl WebSocketTransport for InsecureWebSocketTransport {
    fn support_ping(&self) -> bool {
        true
    }

    fn connect<'a>(
        &'a self,
        url: &'a Url,
        _mode: &'a ConnectionMode,
        timeout: Duration,
    ) -> BoxedFuture<'a, Result<(BoxSink, BoxStream), TransportError>> {
        Box::pin(async move {
            let connector = Connector::Rustls(Arc::new(insecure_client_config()));

            let connect = tokio_tungstenite::connect_async_tls_with_config(
                url.as_str(),
                None,
                false,
                Some(connector),
            );
            let (socket, _response) = tokio::time::timeout(timeout, connect)
                .await
                .map_err(TransportError::backend)?
                .map_err(TransportError::backend)?;

            let (tx, rx) = socket.split();
            let sink: BoxSink = Box::new(
                tx.sink_map_err(TransportError::backend)
                    .with(|msg: WsMessage| {
                        futures::future::ready(Ok::<_, TransportError>(to_tungstenite(msg)))
                    }),
            ) as BoxSink;
            let stream: BoxStream = Box::new(rx.map(|res| {
                res.map(from_tungstenite).map_err(TransportError::backend)
            })) as BoxStream;
            Ok((sink, stream))
        })
    }
}

fn to_tungstenite(msg: WsMessage) -> Message {
    match msg {
        WsMessage::Text(text) => Message::Text(text),
        WsMessage::Binary(data) => Message::Binary(data),
        WsMessage::Ping(data) => Message::Ping(data),
        WsMessage::Pong(data) => Message::Pong(data),
        WsMessage::Close(_) => Message::Close(None),
    }
}

fn from_tungstenite(msg: Message) -> WsMessage {
    match msg {
        Message::Text(text) => WsMessage::Text(text),
        Message::Binary(data) => WsMessage::Binary(data),
        Message::Ping(data) => WsMessage::Ping(data),
        Message::Pong(data) => WsMessage::Pong(data),
        Message::Close(_) => WsMessage::Close(None),
        // Raw frames only surface when frame mode is requested; pass
        // the payload through as binary.
        Message::Frame(frame) => WsMessage::Binary(frame.into_data()),
    }
}

/// TLS client config with chain and hostname validation disabled.
pub(crate) fn insecure_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
        .with_no_client_auth()
}

/// Certificate verifier that accepts anything.
///
/// Signature checks still run against the ring provider so the
/// connection remains a well-formed TLS session; only the chain and
/// hostname validation are skipped.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl AcceptAnyCert {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
