//! Remote actor lookup

use std::time::Duration;

use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use url::Url;

use crate::error::AppError;

/// Media type requested from and sent to remote servers
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Timeout for a single outbound federation request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The parts of a remote actor document federation needs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteActor {
    pub id: String,
    pub inbox: String,
}

/// Parse and check a remote URL before talking to it
///
/// Only `http` and `https` URLs with a host are accepted.
pub fn validate_remote_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "Unsupported URL scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AppError::Validation(format!("URL has no host: {}", raw)));
    }

    Ok(url)
}

/// True for the status codes a remote server answers a successful request with
pub fn is_success_status(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 201 | 202 | 204)
}

/// Fetch a remote actor document
///
/// # Errors
/// `Federation` if the server does not answer with a usable actor.
pub async fn fetch_remote_actor(
    client: &reqwest::Client,
    iri: &str,
    user_agent: &str,
) -> Result<RemoteActor, AppError> {
    let url = validate_remote_url(iri)?;

    let response = client
        .get(url)
        .header(ACCEPT, ACTIVITY_JSON)
        .header(USER_AGENT, user_agent)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?;

    let status = response.status();
    if !is_success_status(status) {
        return Err(AppError::Federation(format!(
            "Fetching actor {} failed with status {}",
            iri, status
        )));
    }

    let actor: RemoteActor = response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("Invalid actor document {}: {}", iri, e)))?;

    if actor.id.is_empty() || actor.inbox.is_empty() {
        return Err(AppError::Federation(format!(
            "Actor {} has no id or inbox",
            iri
        )));
    }

    tracing::debug!(actor = %actor.id, inbox = %actor.inbox, "Fetched remote actor");
    Ok(actor)
}
