//! Access-key checks and caller identification shared by the handlers.
//!
//! Protected routes accept either `Authorization: Bearer <key>` or
//! `Authorization: Basic base64(admin:<key>)`. With no key configured every
//! request is allowed.

use crate::{errors::AppError, routes::AppState};
use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, header, request::Parts},
};
use base64::{Engine as _, engine::general_purpose};
use std::{convert::Infallible, net::SocketAddr};
use subtle::ConstantTimeEq;

const BASIC_USER: &str = "admin";
const UNKNOWN: &str = "unknown";

/// True when `headers` carry valid credentials for `access_key`.
pub fn is_authorized(headers: &HeaderMap, access_key: Option<&str>) -> bool {
    let Some(key) = access_key else {
        return true;
    };
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    if let Some(token) = value.strip_prefix("Bearer ") {
        return key_matches(token, key);
    }
    if let Some(encoded) = value.strip_prefix("Basic ") {
        let Some(credentials) = general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        else {
            return false;
        };
        return matches!(credentials.split_once(':'), Some((user, pass)) if user == BASIC_USER && key_matches(pass, key));
    }
    false
}

/// Compare without short-circuiting on the first differing byte.
fn key_matches(given: &str, key: &str) -> bool {
    given.as_bytes().ct_eq(key.as_bytes()).into()
}

/// Extractor guarding protected routes; rejects with 403.
pub struct Authorized;

impl FromRequestParts<AppState> for Authorized {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if is_authorized(&parts.headers, state.access_key.as_deref()) {
            Ok(Authorized)
        } else {
            Err(AppError::forbidden("Forbidden"))
        }
    }
}

/// Caller address and user agent as recorded on stored objects.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub ip: String,
    pub agent: String,
}

impl<S: Send + Sync> FromRequestParts<S> for ClientInfo {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(ClientInfo {
            ip: client_ip(&parts.headers, peer),
            agent: header_str(&parts.headers, header::USER_AGENT.as_str())
                .unwrap_or(UNKNOWN)
                .to_string(),
        })
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
fn client_ip(headers: &HeaderMap, peer: Option<String>) -> String {
    if let Some(first) = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    if let Some(real) = header_str(headers, "x-real-ip").filter(|v| !v.is_empty()) {
        return real.to_string();
    }
    peer.unwrap_or_else(|| UNKNOWN.to_string())
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}
