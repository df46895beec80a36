//! WebFinger and host-meta documents
//!
//! Lets remote servers discover the actor IRI of `acct:{name}@{domain}`.

use serde::{Deserialize, Serialize};

use super::actor::ACTIVITY_JSON;
use super::identity::LocalAccount;

/// Content-Type of WebFinger responses
pub const JRD_JSON: &str = "application/jrd+json; charset=utf-8";

/// Content-Type of the host-meta document
pub const XRD_XML: &str = "application/xrd+xml; charset=utf-8";

/// WebFinger JRD response
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    pub link_type: String,
    pub href: String,
}

/// Account name addressed by a `acct:{name}@{domain}` resource
///
/// Returns `None` for other schemes and other domains.
pub fn account_name_from_resource<'a>(resource: &'a str, domain: &str) -> Option<&'a str> {
    let name = resource
        .strip_prefix("acct:")?
        .strip_suffix(domain)?
        .strip_suffix('@')?;

    (!name.is_empty()).then_some(name)
}

/// JRD for a local account
pub fn generate_webfinger_response(account: &LocalAccount, domain: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", account.name, domain),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: ACTIVITY_JSON.to_string(),
            href: account.iri.clone(),
        }],
    }
}

/// XRD pointing WebFinger lookups at `host`
pub fn host_meta_document(host: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0"><Link rel="lrdd" type="application/xrd+xml" template="https://{}/.well-known/webfinger?resource={{uri}}"/></XRD>"#,
        host
    )
}
