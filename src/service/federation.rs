//! Federation service
//!
//! Wires identity, follower registry, delivery queue and inbox dispatch
//! together and is the entry point for publishing content.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, QueueConfig};
use crate::data::Database;
use crate::error::AppError;
use crate::federation::{
    Activity, DELIVERY_QUEUE, DeliveryClient, DeliveryHandler, EventReceiver, EventSender,
    FederationIdentity, InboxDispatcher, LocalAccount, NoteRenderer, PlainNoteRenderer,
    PublishedItem, Queue, RetryPolicy, WorkerSettings, build_create, enqueue_delivery,
    event_channel,
};

/// Federation service
pub struct Federation {
    identity: Arc<FederationIdentity>,
    db: Arc<Database>,
    queue: Queue,
    inbox: InboxDispatcher,
    delivery: DeliveryClient,
    renderer: Arc<dyn NoteRenderer>,
    events: EventSender,
    queue_config: QueueConfig,
}

impl Federation {
    /// Create the federation service
    ///
    /// Nothing is delivered until [`Federation::spawn_delivery_worker`] runs.
    pub fn new(
        config: &AppConfig,
        identity: FederationIdentity,
        db: Arc<Database>,
        http_client: reqwest::Client,
    ) -> Self {
        let identity = Arc::new(identity);
        let user_agent = config.activitypub.user_agent.as_str();
        let (events, _) = event_channel();
        let queue = Queue::new(Arc::clone(&db), DELIVERY_QUEUE);

        let inbox = InboxDispatcher::new(
            Arc::clone(&db),
            queue.clone(),
            http_client.clone(),
            user_agent,
            events.clone(),
        );
        let delivery = DeliveryClient::new(http_client, Arc::clone(&identity), user_agent);

        Self {
            identity,
            db,
            queue,
            inbox,
            delivery,
            renderer: Arc::new(PlainNoteRenderer),
            events,
            queue_config: config.queue.clone(),
        }
    }

    /// Replace the default note renderer
    pub fn with_renderer(mut self, renderer: Arc<dyn NoteRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn identity(&self) -> &FederationIdentity {
        &self.identity
    }

    pub fn inbox(&self) -> &InboxDispatcher {
        &self.inbox
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Receive follower and inbound activity notifications
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Start the worker draining the delivery queue
    pub fn spawn_delivery_worker(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let handler = DeliveryHandler::new(
            self.delivery.clone(),
            Arc::clone(&self.db),
            RetryPolicy::from(&self.queue_config),
            self.events.clone(),
        );

        self.queue
            .worker(handler, WorkerSettings::from(&self.queue_config))
            .spawn(shutdown)
    }

    /// Send a published item to every follower of `account_name`
    ///
    /// Followers sharing an inbox get a single delivery.
    ///
    /// # Returns
    /// Number of deliveries queued
    pub async fn publish(&self, account_name: &str, item: &PublishedItem) -> Result<usize, AppError> {
        let account = self
            .identity
            .account(account_name)
            .ok_or(AppError::NotFound)?;

        let public_address = self.identity.public_address();
        let note = self.renderer.render_note(account, public_address, item);
        let create = build_create(account, public_address, item, note);

        let followers = self.db.list_followers(&account.name).await?;
        self.fan_out(account, &create, followers.into_values()).await
    }

    async fn fan_out(
        &self,
        account: &LocalAccount,
        activity: &Activity,
        inboxes: impl Iterator<Item = String>,
    ) -> Result<usize, AppError> {
        let inboxes: BTreeSet<String> = inboxes.collect();

        for inbox in &inboxes {
            enqueue_delivery(&self.queue, &account.iri, inbox, activity).await?;
        }

        tracing::info!(
            account = %account.name,
            activity = ?activity.id,
            deliveries = inboxes.len(),
            "Activity queued for followers"
        );

        Ok(inboxes.len())
    }
}
