//! Protocol upgrade
//!
//! A POST carrying `Connection: Upgrade` and `Upgrade: Byfs-Stream` is
//! answered with 101 and the raw connection is handed to the engine.

use std::sync::Arc;

use axum::Extension;
use axum::extract::{Request, State};
use axum::http::header::{CONNECTION, UPGRADE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use log::{error, info, warn};

use crate::auth::disclose_token;
use crate::connection;
use crate::error::HttpError;
use crate::http::Peer;
use crate::protocol::codes::PROTOCOL_NAME;
use crate::server::ServerContext;

const AUTH_HEADER_NAME: HeaderName = HeaderName::from_static("byfs-auth");

/// Whether the request asks to switch to the stream protocol.
pub fn wants_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let protocol = headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case(PROTOCOL_NAME));
    connection_upgrade && protocol
}

pub async fn handoff(
    State(ctx): State<Arc<ServerContext>>,
    Extension(Peer(peer)): Extension<Peer>,
    mut req: Request,
) -> Response {
    if !wants_upgrade(req.headers()) {
        warn!("{} sent POST {} without upgrade headers", peer, req.uri().path());
        return HttpError::UpgradeRequired.into_response();
    }

    let mut response = StatusCode::SWITCHING_PROTOCOLS.into_response();
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static(PROTOCOL_NAME));

    let token = ctx.authenticator().map(|_| disclose_token());
    if let Some(token) = &token {
        match HeaderValue::from_str(token) {
            Ok(value) => {
                headers.insert(AUTH_HEADER_NAME, value);
            }
            Err(e) => {
                error!("Disclosed token for {} is not a header value: {}", peer, e);
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    info!("Switching {} to {}", peer, PROTOCOL_NAME);
    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => connection::run(TokioIo::new(upgraded), &peer, ctx, token).await,
            Err(e) => warn!("Upgrade of {} failed: {}", peer, e),
        }
    });

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(HeaderName, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_upgrade_headers_match_case_insensitively() {
        assert!(wants_upgrade(&headers(&[
            (CONNECTION, "keep-alive, Upgrade"),
            (UPGRADE, "byfs-stream"),
        ])));
        assert!(wants_upgrade(&headers(&[
            (CONNECTION, "upgrade"),
            (UPGRADE, "Byfs-Stream"),
        ])));
    }

    #[test]
    fn test_missing_or_foreign_upgrade_is_refused() {
        assert!(!wants_upgrade(&headers(&[])));
        assert!(!wants_upgrade(&headers(&[(UPGRADE, "Byfs-Stream")])));
        assert!(!wants_upgrade(&headers(&[
            (CONNECTION, "Upgrade"),
            (UPGRADE, "websocket"),
        ])));
    }
}
