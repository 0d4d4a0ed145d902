// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC server side of the provisioner protocol.
//!
//! Provisioner implementations plug in through [`ProvisionerService`]; the
//! server owns accepting connections, framing and dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::{Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use crate::proto::{
    AgentResponse, CreateWorkspaceRequest, EchoRequest, EchoResponse, RpcRequest, RpcResponse,
    StatusResponse, WorkspaceRequest, rpc_request, rpc_response,
};

/// Errors that can occur in the QUIC server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("handler error: {0}")]
    Handler(String),
}

/// The operations a provisioner exposes.
///
/// Implementations report domain outcomes (not found, concurrent request)
/// through the response status; `Err` is reserved for requests that cannot
/// be served at all and becomes an error frame on the wire.
#[async_trait]
pub trait ProvisionerService: Send + Sync + 'static {
    /// Liveness probe
    async fn echo(&self, request: EchoRequest) -> Result<EchoResponse, ServerError> {
        Ok(EchoResponse {
            message: request.message,
        })
    }

    async fn create_workspace(
        &self,
        request: CreateWorkspaceRequest,
    ) -> Result<AgentResponse, ServerError>;

    async fn start_workspace(&self, request: WorkspaceRequest)
    -> Result<AgentResponse, ServerError>;

    async fn stop_workspace(&self, request: WorkspaceRequest)
    -> Result<StatusResponse, ServerError>;

    async fn destroy_workspace(
        &self,
        request: WorkspaceRequest,
    ) -> Result<StatusResponse, ServerError>;
}

/// Configuration for the QUIC server
#[derive(Debug, Clone)]
pub struct ProvisionerServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// TLS certificate chain (PEM format)
    pub cert_pem: Vec<u8>,
    /// TLS private key (PEM format)
    pub key_pem: Vec<u8>,
    /// Maximum concurrent bidirectional streams per connection
    pub max_bi_streams: u32,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Server-side keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// UDP receive buffer size in bytes (0 for OS default)
    pub udp_receive_buffer_size: usize,
    /// UDP send buffer size in bytes (0 for OS default)
    pub udp_send_buffer_size: usize,
    /// Maximum concurrent connection handlers (0 for unlimited)
    pub max_concurrent_handlers: u32,
}

impl Default for ProvisionerServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7443)),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            max_bi_streams: 256,
            idle_timeout_ms: 20 * 60 * 1000,
            keep_alive_interval_ms: 15_000,
            udp_receive_buffer_size: 0,
            udp_send_buffer_size: 0,
            max_concurrent_handlers: 0,
        }
    }
}

impl ProvisionerServerConfig {
    /// Create a configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `WLCP_PROVISIONER_MAX_BI_STREAMS`: Max bidirectional streams per connection (default: 256)
    /// - `WLCP_PROVISIONER_IDLE_TIMEOUT_MS`: Idle timeout in ms (default: 1200000)
    /// - `WLCP_PROVISIONER_KEEP_ALIVE_MS`: Keep-alive interval in ms, 0 to disable (default: 15000)
    /// - `WLCP_PROVISIONER_MAX_HANDLERS`: Max concurrent connection handlers, 0 for unlimited (default: 0)
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str, default: T) -> T {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let default = Self::default();
        Self {
            max_bi_streams: var("WLCP_PROVISIONER_MAX_BI_STREAMS", default.max_bi_streams),
            idle_timeout_ms: var("WLCP_PROVISIONER_IDLE_TIMEOUT_MS", default.idle_timeout_ms),
            keep_alive_interval_ms: var(
                "WLCP_PROVISIONER_KEEP_ALIVE_MS",
                default.keep_alive_interval_ms,
            ),
            max_concurrent_handlers: var(
                "WLCP_PROVISIONER_MAX_HANDLERS",
                default.max_concurrent_handlers,
            ),
            ..default
        }
    }
}

/// QUIC server fronting a [`ProvisionerService`]
pub struct ProvisionerServer {
    endpoint: Endpoint,
    config: ProvisionerServerConfig,
}

impl ProvisionerServer {
    /// Create a new server with the given configuration
    pub fn new(config: ProvisionerServerConfig) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let server_config = Self::build_server_config(&config)?;

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if config.udp_receive_buffer_size > 0
            && let Err(e) = socket.set_recv_buffer_size(config.udp_receive_buffer_size)
        {
            warn!(size = config.udp_receive_buffer_size, error = %e, "Failed to set UDP receive buffer size");
        }
        if config.udp_send_buffer_size > 0
            && let Err(e) = socket.set_send_buffer_size(config.udp_send_buffer_size)
        {
            warn!(size = config.udp_send_buffer_size, error = %e, "Failed to set UDP send buffer size");
        }

        socket.bind(&config.bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(std_socket)?,
            runtime,
        )?;

        info!(addr = %config.bind_addr, "Provisioner QUIC server bound");

        Ok(Self { endpoint, config })
    }

    /// Create a server with a self-signed certificate for local development and tests
    pub fn localhost(bind_addr: SocketAddr) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        Self::new(ProvisionerServerConfig {
            bind_addr,
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: cert.key_pair.serialize_pem().into_bytes(),
            ..ProvisionerServerConfig::from_env()
        })
    }

    /// Get the server configuration
    pub fn config(&self) -> &ProvisionerServerConfig {
        &self.config
    }

    fn build_server_config(config: &ProvisionerServerConfig) -> Result<ServerConfig, ServerError> {
        let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {}", e)))?;

        let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
            .map_err(|e| ServerError::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

        let crypto = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ServerError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;

        let mut transport = TransportConfig::default();
        let idle = Duration::from_millis(config.idle_timeout_ms)
            .try_into()
            .map_err(|_| ServerError::Tls("idle timeout out of range".to_string()))?;
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(config.max_bi_streams.into());
        transport.max_concurrent_uni_streams(0u32.into());

        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| ServerError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(transport));

        Ok(server_config)
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Close the server; `serve` returns once the endpoint stops accepting
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }

    /// Accept connections until the endpoint is closed, dispatching every
    /// stream to `service`
    #[instrument(skip(self, service))]
    pub async fn serve(&self, service: Arc<dyn ProvisionerService>) -> Result<(), ServerError> {
        info!("Provisioner QUIC server running");

        let semaphore = (self.config.max_concurrent_handlers > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_concurrent_handlers as usize)));

        while let Some(incoming) = self.endpoint.accept().await {
            let service = service.clone();
            let semaphore = semaphore.clone();

            tokio::spawn(async move {
                let _permit = match semaphore {
                    Some(sem) => match sem.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            warn!("semaphore closed, dropping connection");
                            return;
                        }
                    },
                    None => None,
                };

                match incoming.await {
                    Ok(connection) => {
                        debug!(remote = %connection.remote_address(), "accepted connection");
                        serve_connection(connection, service).await;
                    }
                    Err(e) => warn!("failed to accept connection: {}", e),
                }
            });
        }

        Ok(())
    }
}

async fn serve_connection(connection: quinn::Connection, service: Arc<dyn ProvisionerService>) {
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_stream(send, recv, service).await {
                        debug!("stream ended with error: {}", e);
                    }
                });
            }
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!("connection closed");
                break;
            }
            Err(e) => {
                error!("error accepting stream: {}", e);
                break;
            }
        }
    }
}

async fn serve_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    service: Arc<dyn ProvisionerService>,
) -> Result<(), ServerError> {
    let frame = read_frame(&mut recv).await?;
    if frame.message_type != MessageType::Request {
        write_frame(&mut send, &Frame::error("bad_request", "expected a request frame")?).await?;
        send.finish()?;
        return Ok(());
    }

    let request: RpcRequest = frame.decode()?;
    let reply = match dispatch(service.as_ref(), request).await {
        Ok(response) => Frame::response(&response)?,
        Err(ServerError::Handler(message)) => Frame::error("bad_request", message)?,
        Err(e) => {
            error!("request handler error: {}", e);
            Frame::error("internal", e.to_string())?
        }
    };

    write_frame(&mut send, &reply).await?;
    send.finish()?;
    Ok(())
}

async fn dispatch(
    service: &dyn ProvisionerService,
    request: RpcRequest,
) -> Result<RpcResponse, ServerError> {
    use rpc_request::Request;
    use rpc_response::Response;

    let response = match request.request {
        Some(Request::Echo(req)) => Response::Echo(service.echo(req).await?),
        Some(Request::CreateWorkspace(req)) => {
            Response::CreateWorkspace(service.create_workspace(req).await?)
        }
        Some(Request::StartWorkspace(req)) => {
            Response::StartWorkspace(service.start_workspace(req).await?)
        }
        Some(Request::StopWorkspace(req)) => {
            Response::StopWorkspace(service.stop_workspace(req).await?)
        }
        Some(Request::DestroyWorkspace(req)) => {
            Response::DestroyWorkspace(service.destroy_workspace(req).await?)
        }
        None => return Err(ServerError::Handler("empty request".to_string())),
    };

    Ok(RpcResponse {
        response: Some(response),
    })
}
