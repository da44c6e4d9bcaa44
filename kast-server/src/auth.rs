//! Request identity: API key principals, public-link tokens and origin.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts, Query};
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::http::request::Parts;
use serde::Deserialize;
use tracing::debug;

use kast_core::access::Caller;
use kast_core::types::AuditOrigin;

use crate::errors::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
struct ShareTokenQuery {
    share_token: Option<String>,
}

/// Whoever is making the request. Anonymous callers are allowed through;
/// the services decide what they may reach.
#[derive(Debug, Clone)]
pub struct RequestCaller(pub Caller);

impl FromRequestParts<AppState> for RequestCaller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let origin = request_origin(parts);

        let share_token = Query::<ShareTokenQuery>::try_from_uri(&parts.uri)
            .map(|Query(q)| q.share_token)
            .unwrap_or_default()
            .filter(|token| !token.is_empty());

        let principal = match bearer_token(parts)? {
            Some(api_key) => {
                let principal = state
                    .access
                    .authenticate(api_key)
                    .await
                    .map_err(AppError::from)?;
                match principal {
                    Some(principal) => Some(principal),
                    None => {
                        debug!(client = ?origin.client_addr, "rejected unknown API key");
                        return Err(AppError::unauthorized("Invalid API key"));
                    }
                }
            }
            None => None,
        };

        Ok(Self(Caller {
            principal,
            share_token,
            origin,
        }))
    }
}

/// An authenticated principal. Rejects anonymous requests with 401.
#[derive(Debug, Clone)]
pub struct AuthenticatedCaller(pub Caller);

impl FromRequestParts<AppState> for AuthenticatedCaller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let RequestCaller(caller) = RequestCaller::from_request_parts(parts, state).await?;
        if caller.principal.is_none() {
            return Err(AppError::unauthorized("Authentication required"));
        }
        Ok(Self(caller))
    }
}

fn bearer_token(parts: &Parts) -> Result<Option<&str>, AppError> {
    let Some(value) = parts.headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| AppError::unauthorized("Malformed Authorization header"))?;
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(Some(token.trim())),
        _ => Err(AppError::unauthorized("Malformed Authorization header")),
    }
}

fn request_origin(parts: &Parts) -> AuditOrigin {
    AuditOrigin {
        client_addr: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string()),
        user_agent: parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|ua| ua.chars().take(512).collect()),
    }
}
