//! Inbound activity dispatch
//!
//! Classifies activities posted to a local account's inbox and applies
//! their effects on the follower registry and the delivery queue.

use std::sync::Arc;

use serde_json::Value;

use super::activity::{Activity, ActivityKind, InboundActivity, ObjectRef};
use super::actor::fetch_remote_actor;
use super::builder::build_accept;
use super::delivery::enqueue_delivery;
use super::events::{EventSender, FederationEvent};
use super::identity::LocalAccount;
use super::queue::Queue;
use crate::data::Database;
use crate::error::AppError;
use crate::metrics::FOLLOWER_CHANGES_TOTAL;

/// Why a Follow was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowRejection {
    MissingActor,
    SelfFollow,
    ActorUnreachable,
}

/// What processing an inbound activity did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxOutcome {
    /// Follower stored and an Accept queued for `inbox`
    FollowAccepted { follower: String, inbox: String },
    FollowDropped(FollowRejection),
    /// Undo(Follow) or self-Delete removed `follower`
    FollowerRemoved { follower: String, existed: bool },
    /// Create answering one of the account's posts; left to content ingestion
    ReplyCandidate { id: String },
    /// Any other Create with an object id; left to content ingestion
    MentionCandidate { id: String },
    /// Nothing to do
    Ignored,
}

pub struct InboxDispatcher {
    db: Arc<Database>,
    queue: Queue,
    http_client: reqwest::Client,
    user_agent: String,
    events: EventSender,
}

impl InboxDispatcher {
    pub fn new(
        db: Arc<Database>,
        queue: Queue,
        http_client: reqwest::Client,
        user_agent: &str,
        events: EventSender,
    ) -> Self {
        Self {
            db,
            queue,
            http_client,
            user_agent: user_agent.to_string(),
            events,
        }
    }

    /// Apply an activity addressed to `account`
    ///
    /// # Errors
    /// Only storage failures are errors. Unusable activities end up as
    /// `Ignored` or `FollowDropped`.
    pub async fn dispatch(
        &self,
        account: &LocalAccount,
        inbound: InboundActivity,
    ) -> Result<InboxOutcome, AppError> {
        let kind = inbound.activity.kind.clone();
        let activity = &inbound.activity;

        let outcome = match kind {
            ActivityKind::Follow => self.handle_follow(account, &inbound).await?,
            ActivityKind::Undo => self.handle_undo(account, activity).await?,
            ActivityKind::Delete => self.handle_delete(account, activity).await?,
            ActivityKind::Create => classify_create(account, activity),
            ActivityKind::Like | ActivityKind::Announce => InboxOutcome::Ignored,
            _ => {
                tracing::debug!(account = %account.name, kind = %kind, "Ignoring activity");
                InboxOutcome::Ignored
            }
        };

        let _ = self.events.send(FederationEvent::ActivityReceived {
            account: account.name.clone(),
            kind,
            outcome: outcome.clone(),
        });

        Ok(outcome)
    }

    async fn handle_follow(
        &self,
        account: &LocalAccount,
        inbound: &InboundActivity,
    ) -> Result<InboxOutcome, AppError> {
        let follow = &inbound.activity;
        let Some(actor) = follow.actor.clone() else {
            return Ok(InboxOutcome::FollowDropped(FollowRejection::MissingActor));
        };

        tracing::info!(account = %account.name, actor = %actor, "New follow request");

        if follow.object.as_ref().and_then(ObjectRef::id) == Some(actor.as_str()) {
            tracing::info!(actor = %actor, "Dropping self-follow");
            return Ok(InboxOutcome::FollowDropped(FollowRejection::SelfFollow));
        }

        let remote = match fetch_remote_actor(&self.http_client, &actor, &self.user_agent).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(actor = %actor, "Dropping follow, actor lookup failed: {}", e);
                return Ok(InboxOutcome::FollowDropped(FollowRejection::ActorUnreachable));
            }
        };

        self.db
            .upsert_follower(&account.name, &remote.id, &remote.inbox)
            .await?;
        FOLLOWER_CHANGES_TOTAL.with_label_values(&["added"]).inc();
        let _ = self.events.send(FederationEvent::FollowerAdded {
            account: account.name.clone(),
            follower: remote.id.clone(),
            inbox: remote.inbox.clone(),
        });

        let accept = build_accept(account, inbound);
        enqueue_delivery(&self.queue, &account.iri, &remote.inbox, &accept).await?;

        tracing::info!(
            account = %account.name,
            follower = %remote.id,
            "Follower added, Accept queued"
        );

        Ok(InboxOutcome::FollowAccepted {
            follower: remote.id,
            inbox: remote.inbox,
        })
    }

    async fn handle_undo(
        &self,
        account: &LocalAccount,
        undo: &Activity,
    ) -> Result<InboxOutcome, AppError> {
        let Some(inner) = undo.object.as_ref().and_then(ObjectRef::as_activity) else {
            return Ok(InboxOutcome::Ignored);
        };
        if inner.kind != ActivityKind::Follow {
            return Ok(InboxOutcome::Ignored);
        }

        match (&undo.actor, &inner.actor) {
            (Some(outer), Some(follower)) if outer == follower => {
                self.remove_follower(account, follower).await
            }
            _ => {
                tracing::debug!(account = %account.name, "Ignoring Undo with mismatched actor");
                Ok(InboxOutcome::Ignored)
            }
        }
    }

    async fn handle_delete(
        &self,
        account: &LocalAccount,
        delete: &Activity,
    ) -> Result<InboxOutcome, AppError> {
        match (&delete.object, &delete.actor) {
            (Some(ObjectRef::Iri(object)), Some(actor)) if object == actor => {
                self.remove_follower(account, actor).await
            }
            _ => Ok(InboxOutcome::Ignored),
        }
    }

    async fn remove_follower(
        &self,
        account: &LocalAccount,
        follower: &str,
    ) -> Result<InboxOutcome, AppError> {
        let existed = self.db.remove_follower(&account.name, follower).await?;

        if existed {
            FOLLOWER_CHANGES_TOTAL.with_label_values(&["removed"]).inc();
            let _ = self.events.send(FederationEvent::FollowerRemoved {
                account: account.name.clone(),
                follower: follower.to_string(),
            });
            tracing::info!(account = %account.name, follower = %follower, "Follower removed");
        }

        Ok(InboxOutcome::FollowerRemoved {
            follower: follower.to_string(),
            existed,
        })
    }
}

fn non_empty_str<'a>(object: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    object
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

fn classify_create(account: &LocalAccount, create: &Activity) -> InboxOutcome {
    let Some(object) = create.object.as_ref().and_then(ObjectRef::as_object) else {
        return InboxOutcome::Ignored;
    };
    let Some(id) = non_empty_str(object, "id") else {
        return InboxOutcome::Ignored;
    };

    let is_reply = non_empty_str(object, "inReplyTo")
        .is_some_and(|in_reply_to| in_reply_to.contains(&account.iri));

    if is_reply {
        InboxOutcome::ReplyCandidate { id: id.to_string() }
    } else {
        InboxOutcome::MentionCandidate { id: id.to_string() }
    }
}
