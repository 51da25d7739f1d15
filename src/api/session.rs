//! `TGC` cookie and client identification.

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, HeaderValue, header, request::Parts},
};
use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tracing::debug;

use crate::{api::state::AppState, crypto::Sealer};

pub const TGC_COOKIE_NAME: &str = "TGC";
const TGC_PURPOSE: &str = "tgc";
const UNKNOWN_CLIENT: &str = "unknown";

/// Caller address and browser, used for throttling, cookie pinning and device trust.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

impl ClientInfo {
    /// The TCP peer is the client unless forwarded headers are trusted, in which case the
    /// address appended by the nearest proxy wins.
    #[must_use]
    pub fn resolve(headers: &HeaderMap, peer: Option<IpAddr>, trust_forwarded: bool) -> Self {
        let forwarded = if trust_forwarded {
            forwarded_client_ip(headers)
        } else {
            None
        };
        Self {
            ip: forwarded
                .or_else(|| peer.map(|ip| ip.to_string()))
                .unwrap_or_else(|| UNKNOWN_CLIENT.to_string()),
            user_agent: headers
                .get(header::USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        }
    }
}

impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let trust_forwarded = parts
            .extensions
            .get::<Arc<AppState>>()
            .is_some_and(|state| state.config().trust_forwarded_headers());
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(Self::resolve(&parts.headers, peer, trust_forwarded))
    }
}

fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-forwarded-for") {
        if let Ok(value) = value.to_str() {
            if let Some(last) = value.rsplit(',').map(str::trim).find(|v| !v.is_empty()) {
                return Some(last.to_string());
            }
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[derive(Serialize, Deserialize)]
struct CookieValue {
    tgt: String,
    ip: String,
    ua: String,
}

fn extract_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
}

/// TGT id from a `TGC` cookie sealed for this client. Cookies pinned to another IP or
/// user agent are ignored.
#[must_use]
pub fn session_from(headers: &HeaderMap, client: &ClientInfo, sealer: &Sealer) -> Option<String> {
    let sealed = extract_cookie(headers, TGC_COOKIE_NAME)?;
    let value: CookieValue = match sealer.open_json(sealed, TGC_PURPOSE) {
        Ok(value) => value,
        Err(err) => {
            debug!("Ignoring unreadable TGC cookie: {}", err);
            return None;
        }
    };
    if value.ip != client.ip || value.ua != client.user_agent {
        debug!("Ignoring TGC cookie issued to another client");
        return None;
    }
    Some(value.tgt)
}

/// `Set-Cookie` value for a new SSO session.
///
/// # Errors
/// Returns an error if the value cannot be sealed.
pub fn session_cookie(
    tgt_id: &str,
    client: &ClientInfo,
    sealer: &Sealer,
    secure: bool,
) -> anyhow::Result<HeaderValue> {
    let sealed = sealer.seal_json(
        &CookieValue {
            tgt: tgt_id.to_string(),
            ip: client.ip.clone(),
            ua: client.user_agent.clone(),
        },
        TGC_PURPOSE,
    )?;
    let mut cookie = format!("{TGC_COOKIE_NAME}={sealed}; Path=/; HttpOnly; SameSite=Lax");
    if secure {
        cookie.push_str("; Secure");
    }
    Ok(HeaderValue::from_str(&cookie)?)
}

#[must_use]
pub fn clear_session_cookie(secure: bool) -> HeaderValue {
    let cookie = if secure {
        "TGC=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0; Secure"
    } else {
        "TGC=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0"
    };
    HeaderValue::from_static(cookie)
}

/// Token from `Authorization: Bearer <token>`.
#[must_use]
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
