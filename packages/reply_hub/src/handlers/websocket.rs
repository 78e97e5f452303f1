use axum::{
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, request::Parts},
    response::Response,
};

use crate::AppState;
use crate::ws::{self, ConnectionIdentity};

const USER_HEADER: &str = "x-user-id";
const TENANT_HEADER: &str = "x-tenant-id";

/// Identity asserted by the upstream proxy on the upgrade request. Missing
/// or unreadable headers fall back to `anonymous` / `default`.
pub struct UpstreamIdentity(pub ConnectionIdentity);

impl UpstreamIdentity {
    fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str, fallback: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(fallback)
                .to_string()
        };
        Self(ConnectionIdentity {
            user_id: read(USER_HEADER, "anonymous"),
            tenant_id: read(TENANT_HEADER, "default"),
        })
    }
}

impl<S> axum::extract::FromRequestParts<S> for UpstreamIdentity
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

/// Streaming WebSocket - one connection per client for every conversation
pub async fn stream_websocket_handler(
    State(state): State<AppState>,
    UpstreamIdentity(identity): UpstreamIdentity,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| ws::handle_stream_ws(socket, hub, identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_identity_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_static("alice"));
        headers.insert(TENANT_HEADER, HeaderValue::from_static("acme"));

        let UpstreamIdentity(identity) = UpstreamIdentity::from_headers(&headers);
        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.tenant_id, "acme");
    }

    #[test]
    fn test_identity_defaults() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_static("   "));

        let UpstreamIdentity(identity) = UpstreamIdentity::from_headers(&headers);
        assert_eq!(identity.user_id, "anonymous");
        assert_eq!(identity.tenant_id, "default");
    }
}
