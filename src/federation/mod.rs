//! ActivityPub federation module
//!
//! Handles:
//! - Identity and HTTP Signatures
//! - Activity model and builders
//! - Durable delivery queue
//! - Inbox dispatch
//! - WebFinger / host-meta

mod activity;
mod actor;
mod builder;
mod delivery;
mod events;
mod identity;
mod inbox;
mod queue;
mod signature;
mod webfinger;

pub use activity::{
    ACTIVITY_STREAMS_CONTEXT, Activity, ActivityKind, InboundActivity, ObjectRef, PUBLIC_COLLECTION,
    iri_of,
};
pub use actor::{
    ACTIVITY_JSON, REQUEST_TIMEOUT, RemoteActor, fetch_remote_actor, is_success_status,
    validate_remote_url,
};
pub use builder::{
    NoteRenderer, PlainNoteRenderer, PublishedItem, build_accept, build_create, new_activity_id,
    random_token,
};
pub use delivery::{
    ACTIVITY_JSON_UTF8, DELIVERY_QUEUE, DeliveryClient, DeliveryHandler, DeliveryRequest,
    RetryPolicy, enqueue_delivery,
};
pub use events::{EventReceiver, EventSender, FederationEvent};
pub use identity::{FederationIdentity, LocalAccount, Signer};
pub use inbox::{FollowRejection, InboxDispatcher, InboxOutcome};
pub use queue::{Queue, QueueAction, QueueHandler, QueueWorker, WorkerSettings};
pub use signature::{
    ParsedSignature, SIGNED_HEADERS, generate_digest, http_date, parse_signature_header,
    verify_signature,
};
pub use webfinger::{
    JRD_JSON, WebFingerLink, WebFingerResponse, XRD_XML, account_name_from_resource,
    generate_webfinger_response, host_meta_document,
};

pub(crate) use events::channel as event_channel;
