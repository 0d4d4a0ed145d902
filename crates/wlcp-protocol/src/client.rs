// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client for a single provisioner endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::frame::{Frame, FrameError, read_frame, write_frame};
use crate::proto::{EchoRequest, RpcRequest, RpcResponse, rpc_request, rpc_response};

/// Errors that can occur in the QUIC client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("write error: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("no connection established")]
    NotConnected,

    #[error("unexpected response variant")]
    UnexpectedResponse,

    #[error("request timed out after {0}ms")]
    Timeout(u64),
}

/// Configuration for a provisioner connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Provisioner address
    pub server_addr: SocketAddr,
    /// Server name for TLS verification
    pub server_name: String,
    /// Skip certificate verification (for development only!)
    pub dangerous_skip_cert_verification: bool,
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl ConnectionConfig {
    /// Configuration for `addr` with default transport settings.
    pub fn new(server_addr: SocketAddr, server_name: impl Into<String>) -> Self {
        Self {
            server_addr,
            server_name: server_name.into(),
            dangerous_skip_cert_verification: false,
            keep_alive_interval_ms: 10_000,
            // create/start calls may take up to 15 minutes
            idle_timeout_ms: 20 * 60 * 1000,
            connect_timeout_ms: 5_000,
        }
    }

    /// Resolve `host:port` and build a configuration for the first address.
    pub async fn resolve(host: &str, port: u16) -> Result<Self, ClientError> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| ClientError::Resolve(format!("{}:{}", host, port)))?;
        Ok(Self::new(addr, host))
    }
}

/// QUIC connection to one provisioner endpoint.
///
/// Every call opens a fresh bidirectional stream on the shared connection.
pub struct ProvisionerConnection {
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
    config: ConnectionConfig,
}

impl ProvisionerConnection {
    /// Create a new, not yet connected, client
    pub fn new(config: ConnectionConfig) -> Result<Self, ClientError> {
        let bind: SocketAddr = if config.server_addr.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(Self::build_client_config(&config)?);

        Ok(Self {
            endpoint,
            connection: Mutex::new(None),
            config,
        })
    }

    /// Address of the provisioner this connection targets
    pub fn server_addr(&self) -> SocketAddr {
        self.config.server_addr
    }

    fn build_client_config(config: &ConnectionConfig) -> Result<ClientConfig, ClientError> {
        let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ClientError::Tls(e.to_string()))?;

        let crypto = if config.dangerous_skip_cert_verification {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        let idle = Duration::from_millis(config.idle_timeout_ms)
            .try_into()
            .map_err(|_| ClientError::Tls("idle timeout out of range".to_string()))?;
        transport.max_idle_timeout(Some(idle));

        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        let mut client_config = ClientConfig::new(Arc::new(quic_crypto));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// Connect to the provisioner, reusing a live connection
    #[instrument(skip(self), fields(addr = %self.config.server_addr))]
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut conn_guard = self.connection.lock().await;

        if let Some(ref conn) = *conn_guard
            && conn.close_reason().is_none()
        {
            debug!("reusing existing connection");
            return Ok(());
        }

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connecting = self
            .endpoint
            .connect(self.config.server_addr, &self.config.server_name)?;

        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        info!("connected to provisioner");
        *conn_guard = Some(connection);
        Ok(())
    }

    async fn current_connection(&self) -> Result<Connection, ClientError> {
        let conn_guard = self.connection.lock().await;
        conn_guard.clone().ok_or(ClientError::NotConnected)
    }

    /// Send one call on a new stream and wait for the reply.
    ///
    /// Does not dial; callers decide when to (re)connect.
    pub async fn call(&self, request: &RpcRequest) -> Result<RpcResponse, ClientError> {
        let conn = self.current_connection().await?;
        let (mut send, mut recv) = conn.open_bi().await?;

        write_frame(&mut send, &Frame::request(request)?).await?;
        send.finish()?;

        Ok(read_frame(&mut recv).await?.into_response()?)
    }

    /// Liveness probe bounded by `timeout`
    pub async fn echo(&self, timeout: Duration) -> Result<(), ClientError> {
        let request = RpcRequest {
            request: Some(rpc_request::Request::Echo(EchoRequest {
                message: "ping".to_string(),
            })),
        };
        let response = tokio::time::timeout(timeout, self.call(&request))
            .await
            .map_err(|_| ClientError::Timeout(timeout.as_millis() as u64))??;

        match response.response {
            Some(rpc_response::Response::Echo(_)) => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Whether a connection exists and has not been closed
    pub async fn is_connected(&self) -> bool {
        let conn_guard = self.connection.lock().await;
        conn_guard
            .as_ref()
            .is_some_and(|conn| conn.close_reason().is_none())
    }

    /// Whether a connection object is held at all, closed or not
    pub async fn has_connection(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Close the connection gracefully
    pub async fn close(&self) {
        let mut conn_guard = self.connection.lock().await;
        if let Some(conn) = conn_guard.take() {
            conn.close(0u32.into(), b"client closing");
        }
    }
}

impl Drop for ProvisionerConnection {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.connection.try_lock()
            && let Some(conn) = guard.take()
        {
            conn.close(0u32.into(), b"client dropped");
        }
    }
}

/// Certificate verifier that skips all verification (for development only!)
///
/// Also used for in-workspace services that present self-signed certificates.
#[derive(Debug)]
pub struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::new("127.0.0.1:7443".parse().unwrap(), "localhost");
        assert_eq!(config.server_name, "localhost");
        assert!(!config.dangerous_skip_cert_verification);
        assert_eq!(config.connect_timeout_ms, 5_000);
        assert!(config.idle_timeout_ms >= 15 * 60 * 1000);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let config = ConnectionConfig::resolve("127.0.0.1", 7443).await.unwrap();
        assert_eq!(config.server_addr.port(), 7443);
        assert_eq!(config.server_name, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_call_without_connection() {
        let mut config = ConnectionConfig::new("127.0.0.1:7443".parse().unwrap(), "localhost");
        config.dangerous_skip_cert_verification = true;
        let conn = ProvisionerConnection::new(config).unwrap();

        assert!(!conn.is_connected().await);
        assert!(!conn.has_connection().await);
        let result = conn.call(&RpcRequest::default()).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }
}
