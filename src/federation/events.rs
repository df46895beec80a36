//! Notifications about federation state changes
//!
//! Subscribers are optional; events sent while nobody listens are dropped.

use tokio::sync::broadcast;

use super::activity::ActivityKind;
use super::inbox::InboxOutcome;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum FederationEvent {
    FollowerAdded {
        account: String,
        follower: String,
        inbox: String,
    },
    FollowerRemoved {
        account: String,
        follower: String,
    },
    ActivityReceived {
        account: String,
        kind: ActivityKind,
        outcome: InboxOutcome,
    },
}

pub type EventSender = broadcast::Sender<FederationEvent>;
pub type EventReceiver = broadcast::Receiver<FederationEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    broadcast::channel(EVENT_CAPACITY)
}
