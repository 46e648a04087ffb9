use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
};

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, Extensions, HeaderMap},
};
use tracing::{debug, error};

use crate::users::{
    repo::UserStore,
    repo_types::{NewActivity, User},
};

const MAX_USER_AGENT_LEN: usize = 255;

/// Last `X-Forwarded-For` hop if it parses as an IP address, else the
/// socket peer, else nothing.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit(',').next())
        .and_then(|hop| hop.trim().parse::<IpAddr>().ok());

    forwarded
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(|ip| ip.to_string())
}

pub fn peer_addr(extensions: &Extensions) -> Option<SocketAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .filter(|ua| !ua.is_empty())
        .map(|ua| ua.chars().take(MAX_USER_AGENT_LEN).collect())
}

/// Caller network details captured for the activity log.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientMeta {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Infallible> {
        Ok(ClientMeta {
            ip: client_ip(&parts.headers, peer_addr(&parts.extensions)),
            user_agent: user_agent(&parts.headers),
        })
    }
}

/// Appends a sign-in record. Failures are logged and swallowed so a broken
/// audit insert never blocks the sign-in itself.
pub async fn record(store: &dyn UserStore, user: &User, meta: &ClientMeta) {
    let new = NewActivity {
        user_id: user.id,
        ip_address: meta.ip.clone(),
        user_agent: meta.user_agent.clone(),
    };
    match store.record_activity(new).await {
        Ok(rec) => debug!(user_id = %user.id, activity_id = %rec.id, "activity recorded"),
        Err(e) => error!(error = %e, user_id = %user.id, "failed to record activity"),
    }
}
