//! Builders for outbound activities

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use rand::rngs::OsRng;
use serde_json::{Map, Value, json};

use super::activity::{
    ACTIVITY_STREAMS_CONTEXT, Activity, ActivityKind, InboundActivity, ObjectRef,
    PUBLIC_COLLECTION,
};
use super::identity::LocalAccount;

/// Characters used for random id suffixes; look-alikes (0/O, 1/l/I) are left out
const TOKEN_ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const TOKEN_LENGTH: usize = 16;

/// Random token from the OS CSPRNG
pub fn random_token(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Fresh activity id below an account IRI: `{iri}#{token}`
pub fn new_activity_id(account_iri: &str) -> String {
    format!("{}#{}", account_iri, random_token(TOKEN_LENGTH))
}

/// A piece of published content handed over by the publishing side
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedItem {
    /// Path below the public address, e.g. "/alice/posts/hello"
    pub path: String,
    /// Rendered HTML content
    pub content: String,
    pub summary: Option<String>,
    pub published: DateTime<Utc>,
    pub in_reply_to: Option<String>,
}

/// Turns a published item into an ActivityStreams object
pub trait NoteRenderer: Send + Sync {
    fn render_note(
        &self,
        account: &LocalAccount,
        public_address: &str,
        item: &PublishedItem,
    ) -> Map<String, Value>;
}

/// Renders every item as a public `Note`
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainNoteRenderer;

impl NoteRenderer for PlainNoteRenderer {
    fn render_note(
        &self,
        account: &LocalAccount,
        public_address: &str,
        item: &PublishedItem,
    ) -> Map<String, Value> {
        let url = format!("{}{}", public_address, item.path);
        let mut note = Map::new();
        note.insert("id".to_string(), json!(url));
        note.insert("type".to_string(), json!("Note"));
        note.insert("url".to_string(), json!(url));
        note.insert("attributedTo".to_string(), json!(account.iri));
        note.insert("content".to_string(), json!(item.content));
        note.insert(
            "published".to_string(),
            json!(item.published.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        note.insert("to".to_string(), json!([PUBLIC_COLLECTION]));
        note.insert("cc".to_string(), json!([account.followers]));

        if let Some(summary) = &item.summary {
            note.insert("summary".to_string(), json!(summary));
        }
        if let Some(in_reply_to) = &item.in_reply_to {
            note.insert("inReplyTo".to_string(), json!(in_reply_to));
        }

        note
    }
}

/// Wrap a rendered note in a `Create`
///
/// The activity id is the item's public address. `published` and `to`
/// are copied from the note.
pub fn build_create(
    account: &LocalAccount,
    public_address: &str,
    item: &PublishedItem,
    note: Map<String, Value>,
) -> Activity {
    let mut create = Activity::new(ActivityKind::Create);
    create.id = Some(format!("{}{}", public_address, item.path));
    create.actor = Some(account.iri.clone());
    create.published = note.get("published").cloned();
    create.to = note.get("to").cloned();
    create.object = Some(ObjectRef::Object(note));
    create
}

/// Accept a Follow on behalf of `account`
///
/// The Follow is embedded exactly as received, minus its `@context`.
pub fn build_accept(account: &LocalAccount, follow: &InboundActivity) -> Activity {
    let mut object = follow.raw.clone();
    object.remove("@context");

    let mut accept = Activity::new(ActivityKind::Accept);
    accept.id = Some(new_activity_id(&account.iri));
    accept.actor = Some(account.iri.clone());
    accept.to = follow.activity.actor.clone().map(Value::String);
    accept.object = Some(ObjectRef::Object(object));
    accept
}
