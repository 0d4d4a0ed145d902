// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forwarding of a proxied request over an overlay stream.

use std::io::Cursor;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{CONNECTION, CONTENT_LENGTH, COOKIE, UPGRADE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use axum::response::Response;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tokio_util::io::ReaderStream;
use tracing::debug;
use wlcp_protocol::SkipServerVerification;

use super::AUTH_COOKIE;
use crate::api::ApiError;
use crate::overlay::{BoxedStream, Overlay};

const MAX_RESPONSE_HEAD: usize = 16 * 1024;

const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn bad_gateway(e: impl std::fmt::Display) -> ApiError {
    ApiError::BadGateway(e.to_string())
}

/// Remove cookie `name` from every `Cookie` header.
pub fn strip_cookie(headers: &mut HeaderMap, name: &str) {
    let kept: Vec<String> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| {
            v.split(';')
                .map(str::trim)
                .filter(|pair| {
                    let key = pair.split_once('=').map_or(*pair, |(k, _)| k);
                    !pair.is_empty() && key != name
                })
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|v| !v.is_empty())
        .collect();

    headers.remove(COOKIE);
    for value in kept {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.append(COOKIE, value);
        }
    }
}

/// Wire spelling of a header name.
///
/// Title case, except the websocket family which upstream servers match
/// as `Sec-WebSocket-*`.
pub(crate) fn header_case(name: &str) -> String {
    let title = name
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-");

    match title.strip_prefix("Sec-Websocket-") {
        Some(rest) => format!("Sec-WebSocket-{}", rest),
        None => title,
    }
}

/// Raw HTTP/1.1 request head for a websocket handshake.
pub fn websocket_request_head(method: &Method, path_and_query: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", method, path_and_query).into_bytes();
    for (name, value) in headers {
        head.extend_from_slice(header_case(name.as_str()).as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Bytes of the buffer taken by the head
    pub len: usize,
}

/// Parse a response head, or None while it is incomplete.
pub(crate) fn parse_response_head(buf: &[u8]) -> Result<Option<ResponseHead>, ApiError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    let len = match response.parse(buf).map_err(bad_gateway)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let status = response
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| bad_gateway("upstream sent an invalid status"))?;
    let mut map = HeaderMap::new();
    for header in response.headers.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(header.name.as_bytes()),
            HeaderValue::from_bytes(header.value),
        ) {
            map.append(name, value);
        }
    }
    Ok(Some(ResponseHead {
        status,
        headers: map,
        len,
    }))
}

async fn read_response_head(stream: &mut BoxedStream) -> Result<(ResponseHead, Vec<u8>), ApiError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.map_err(bad_gateway)?;
        if n == 0 {
            return Err(bad_gateway("upstream closed before responding"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(head) = parse_response_head(&buf)? {
            let rest = buf.split_off(head.len);
            return Ok((head, rest));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(bad_gateway("upstream response head too large"));
        }
    }
}

fn tls_connector() -> Result<TlsConnector, ApiError> {
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(bad_gateway)?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn connect(overlay: &dyn Overlay, agent_id: i64, port: u16, ssl: bool) -> Result<BoxedStream, ApiError> {
    let stream = overlay.dial(agent_id, port).await.map_err(bad_gateway)?;
    if !ssl {
        return Ok(stream);
    }
    let server_name = ServerName::try_from("localhost").map_err(bad_gateway)?;
    let tls = tls_connector()?
        .connect(server_name, stream)
        .await
        .map_err(bad_gateway)?;
    Ok(Box::new(tls))
}

/// Forward `req` to `internal_path` on `agent_id:port`.
pub(crate) async fn forward(
    overlay: &dyn Overlay,
    agent_id: i64,
    port: u16,
    ssl: bool,
    internal_path: &str,
    mut req: Request,
) -> Result<Response, ApiError> {
    strip_cookie(req.headers_mut(), AUTH_COOKIE);
    let path = if internal_path.is_empty() { "/" } else { internal_path };
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };

    let stream = connect(overlay, agent_id, port, ssl).await?;
    debug!(agent_id, port, path = %path_and_query, "Proxying request");

    if is_websocket_upgrade(req.headers()) {
        forward_websocket(stream, &path_and_query, req).await
    } else {
        forward_http(stream, &path_and_query, req).await
    }
}

async fn forward_http(stream: BoxedStream, path_and_query: &str, req: Request) -> Result<Response, ApiError> {
    let (mut parts, body) = req.into_parts();
    parts.uri = path_and_query
        .parse::<Uri>()
        .map_err(|_| ApiError::BadRequest("invalid path".to_string()))?;
    parts.version = Version::HTTP_11;
    for name in HOP_BY_HOP {
        parts.headers.remove(name);
    }

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(bad_gateway)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Upstream connection closed");
        }
    });

    let response = sender
        .send_request(Request::from_parts(parts, body))
        .await
        .map_err(bad_gateway)?;
    Ok(response.map(Body::new))
}

async fn forward_websocket(
    mut stream: BoxedStream,
    path_and_query: &str,
    mut req: Request,
) -> Result<Response, ApiError> {
    let on_upgrade = hyper::upgrade::on(&mut req);
    let head = websocket_request_head(req.method(), path_and_query, req.headers());
    stream.write_all(&head).await.map_err(bad_gateway)?;
    let (head, rest) = read_response_head(&mut stream).await?;

    let mut builder = Response::builder().status(head.status);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(head.headers.clone());
    }

    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        let reader = Cursor::new(rest).chain(stream);
        let length = head
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = match length {
            Some(length) => Body::from_stream(ReaderStream::new(reader.take(length))),
            None => Body::from_stream(ReaderStream::new(reader)),
        };
        return builder.body(body).map_err(bad_gateway);
    }

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!(error = %e, "Client upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(upgraded);
        if !rest.is_empty() && client.write_all(&rest).await.is_err() {
            return;
        }
        match tokio::io::copy_bidirectional(&mut client, &mut stream).await {
            Ok((up, down)) => debug!(up, down, "Websocket tunnel closed"),
            Err(e) => debug!(error = %e, "Websocket tunnel failed"),
        }
    });

    builder.body(Body::empty()).map_err(bad_gateway)
}
