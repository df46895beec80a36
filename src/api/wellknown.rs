//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/host-meta
//! - /.well-known/nodeinfo
//! - /nodeinfo

use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{
    JRD_JSON, XRD_XML, account_name_from_resource, generate_webfinger_response, host_meta_document,
};

const NODEINFO_SCHEMA: &str = "http://nodeinfo.diaspora.software/ns/schema/2.1";

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/host-meta
/// - GET /.well-known/nodeinfo
/// - GET /nodeinfo
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/nodeinfo", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: Option<String>,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let federation = state.federation.as_ref().ok_or(AppError::NotFound)?;
    let identity = federation.identity();

    let account = query
        .resource
        .as_deref()
        .and_then(|resource| account_name_from_resource(resource, identity.domain()))
        .and_then(|name| identity.account(name))
        .ok_or(AppError::NotFound)?;

    let response = generate_webfinger_response(account, identity.domain());
    Ok(([(header::CONTENT_TYPE, JRD_JSON)], Json(response)).into_response())
}

/// GET /.well-known/host-meta
///
/// Points WebFinger lookups at the host the request was sent to.
async fn host_meta(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| state.config.server.domain.clone());

    ([(header::CONTENT_TYPE, XRD_XML)], host_meta_document(&host))
}

/// GET /.well-known/nodeinfo
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "links": [
            {
                "rel": NODEINFO_SCHEMA,
                "href": format!("{}/nodeinfo", state.config.server.public_address())
            }
        ]
    }))
}

/// GET /nodeinfo
///
/// Returns NodeInfo 2.1 document.
async fn nodeinfo(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": "2.1",
        "software": {
            "name": "pressfed",
            "version": env!("CARGO_PKG_VERSION")
        },
        "protocols": ["activitypub"],
        "services": {
            "inbound": [],
            "outbound": []
        },
        "openRegistrations": false,
        "usage": {
            "users": {
                "total": state.config.accounts.len()
            }
        },
        "metadata": {}
    }))
}
