//! ActivityPub endpoints
//!
//! - Actor document
//! - Inbox (activity receiving)
//! - Followers collection

use std::sync::Arc;

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::json;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{
    ACTIVITY_JSON_UTF8, ACTIVITY_STREAMS_CONTEXT, FederationIdentity, InboundActivity, LocalAccount,
};
use crate::metrics::{ACTIVITIES_RECEIVED, HTTP_REQUESTS_TOTAL};
use crate::service::Federation;

/// Create ActivityPub router
///
/// Routes:
/// - GET {account path} - Actor document, one route per configured account
/// - POST /inbox/:account - Inbox
/// - POST /:account/inbox - Inbox
/// - GET /:account/followers - Followers collection
pub fn activitypub_router(identity: &FederationIdentity) -> Router<AppState> {
    let mut router = Router::new()
        .route("/inbox/:account", post(inbox))
        .route("/:account/inbox", post(inbox))
        .route("/:account/followers", get(followers));

    for account in identity.accounts() {
        let name = account.name.clone();
        router = router.route(
            &account.path,
            get(move |State(state): State<AppState>| {
                let name = name.clone();
                async move { actor(state, name).await }
            }),
        );
    }

    router
}

fn federation(state: &AppState) -> Result<&Arc<Federation>, AppError> {
    state.federation.as_ref().ok_or(AppError::NotFound)
}

fn local_account(federation: &Federation, name: &str) -> Result<LocalAccount, AppError> {
    federation
        .identity()
        .account(name)
        .cloned()
        .ok_or(AppError::NotFound)
}

fn activity_json(body: serde_json::Value) -> Response {
    ([(header::CONTENT_TYPE, ACTIVITY_JSON_UTF8)], Json(body)).into_response()
}

/// GET {account path}
///
/// Returns the `Person` document remote servers verify signatures against.
async fn actor(state: AppState, name: String) -> Result<Response, AppError> {
    let federation = federation(&state)?;
    let account = local_account(federation, &name)?;
    let identity = federation.identity();

    Ok(activity_json(json!({
        "@context": [
            ACTIVITY_STREAMS_CONTEXT,
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": account.iri,
        "preferredUsername": account.name,
        "name": account.display_name.as_deref().unwrap_or(&account.name),
        "url": account.iri,
        "inbox": account.inbox,
        "followers": account.followers,
        "publicKey": {
            "id": account.key_id(),
            "owner": account.iri,
            "publicKeyPem": identity.public_key_pem()
        }
    })))
}

/// POST /inbox/:account and POST /:account/inbox
///
/// Answers 201 once the body decodes to a JSON object, whatever
/// processing does with it.
async fn inbox(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let federation = federation(&state)?;
    let account = local_account(federation, &name)?;

    let inbound = InboundActivity::from_slice(&body).map_err(|e| {
        tracing::debug!(account = %name, "Rejecting undecodable inbox body: {}", e);
        AppError::Validation("Failed to decode body".to_string())
    })?;

    let activity = &inbound.activity;

    // Unknown types share one label to keep remote input out of label values
    let kind_label = if activity.kind.is_known() {
        activity.kind.as_str()
    } else {
        "Unknown"
    };
    ACTIVITIES_RECEIVED.with_label_values(&[kind_label]).inc();
    tracing::debug!(
        account = %account.name,
        kind = %activity.kind,
        actor = ?activity.actor,
        "Activity received"
    );

    if let Err(e) = federation.inbox().dispatch(&account, inbound).await {
        tracing::error!(account = %account.name, "Inbox processing failed: {}", e);
    }

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "inbox", "201"])
        .inc();

    Ok(StatusCode::CREATED)
}

/// GET /:account/followers
async fn followers(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let federation = federation(&state)?;
    let account = local_account(federation, &name)?;
    let followers = state.db.list_followers(&account.name).await?;

    Ok(activity_json(json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "id": account.followers,
        "type": "OrderedCollection",
        "totalItems": followers.len(),
        "orderedItems": followers.keys().collect::<Vec<_>>()
    })))
}
