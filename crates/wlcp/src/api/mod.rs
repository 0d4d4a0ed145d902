// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surfaces of a node.
//!
//! - `/internal/v1/ws/*`: the API in-workspace agents call, authenticated by
//!   agent token and workspace id ([`auth`]).
//! - `/editor`, `/desktop`, `/agent` and port subdomains: the reverse proxy
//!   into workspaces ([`crate::proxy`]).
//!
//! Every error leaves as a JSON body `{"error": <code>, "message": <text>}`.

pub mod agent;
pub mod auth;

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::coordinator::{self, AgentConnections};
use crate::error::Error;
use crate::proxy::{self, ProxyRoutes};
use crate::state::Core;

/// State shared by every HTTP handler.
#[derive(Clone)]
pub struct ApiState {
    pub core: Arc<Core>,
    pub connections: AgentConnections,
    pub proxy: Arc<ProxyRoutes>,
}

impl ApiState {
    pub fn new(core: Arc<Core>, connections: AgentConnections) -> Result<Self, Error> {
        let proxy = ProxyRoutes::new(&core.settings.app_hostname)?;
        Ok(Self {
            core,
            connections,
            proxy: Arc::new(proxy),
        })
    }
}

/// The full router of a node.
pub fn router(state: ApiState) -> Router {
    let internal = Router::new()
        .route("/initialize", post(agent::initialize))
        .route("/state", post(agent::post_state))
        .route("/version", post(agent::post_version))
        .route("/ports", post(agent::post_ports))
        .route("/stats", post(agent::post_stats))
        .route("/coordinate", get(coordinator::coordinate));

    Router::new()
        .nest("/internal/v1/ws", internal)
        .merge(proxy::routes())
        .fallback(proxy::port_proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Errors returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    BadGateway(String),
    #[error(transparent)]
    Internal(Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::BadGateway(_) => "bad_gateway",
            Self::Internal(_) => "internal",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Internal(e) => {
                error!(error = %e, "Request failed");
                "internal server error".to_string()
            }
            Self::BadGateway(e) => {
                error!(error = %e, "Upstream request failed");
                "bad gateway".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(ErrorBody {
            error: self.code(),
            message,
        });
        (self.status(), body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::WorkspaceNotFound(_) => Self::NotFound("workspace not found"),
            Error::AgentNotFound(_) => Self::NotFound("agent not found"),
            Error::InvalidRequest(message) => Self::BadRequest(message),
            other => Self::Internal(other),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        Self::Internal(Error::Database(e))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(_: JsonRejection) -> Self {
        Self::BadRequest("invalid request body".to_string())
    }
}
