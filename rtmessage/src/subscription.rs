//! Administrative subscribe messages and inbox naming.

use serde::{Deserialize, Serialize};

/// Topic the router listens on for subscription changes.
pub const SUBSCRIBE_TOPIC: &str = "_RTROUTED.INBOX.SUBSCRIBE";

/// Body of a subscribe or unsubscribe control message, sent as compact JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SubscriptionRequest {
    /// Topic being added or removed.
    pub topic: String,
    /// `1` to subscribe, `0` to unsubscribe.
    pub add: u8,
    /// Client-chosen id echoed in `control_data` of routed traffic.
    pub route_id: u32,
}

impl SubscriptionRequest {
    /// Builds a request adding or removing `topic` under `route_id`.
    pub fn new(topic: impl Into<String>, add: bool, route_id: u32) -> Self {
        Self {
            topic: topic.into(),
            add: u8::from(add),
            route_id,
        }
    }
}

/// Name of the private inbox topic for an application instance.
pub fn inbox_topic(app_name: &str, inbox_id: u32) -> String {
    format!("{app_name}.INBOX.{inbox_id}")
}
