//! Wire names and routing keys.
//!
//! Topology declaration and publishing both go through these functions, so
//! the key a queue is bound with and the key a message is sent with cannot
//! drift apart.

/// Topic exchange all profile events are published to.
pub const EXCHANGE: &str = "user_form";

/// Queue drained by the persistence worker.
pub const SHARED_QUEUE: &str = "user_messages";

/// Routing key the shared queue is bound with.
pub const SHARED_ROUTING_KEY: &str = "user_messages";

/// Prefix of per-user queue names and routing keys.
pub const ENTITY_PREFIX: &str = "user:";

/// Exchange that receives dead letters.
pub const DEAD_LETTER_EXCHANGE: &str = "user_form.dlx";

/// Queue that holds dead letters for manual review and replay.
pub const DEAD_LETTER_QUEUE: &str = "user_form.dlq";

/// Routing key for one user's lifecycle events.
pub fn entity_routing_key(entity_id: i64) -> String {
    format!("{}{}", ENTITY_PREFIX, entity_id)
}

/// Name of one user's queue.
pub fn entity_queue(entity_id: i64) -> String {
    entity_routing_key(entity_id)
}

/// Who should receive a published event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    /// The persistence worker only.
    #[default]
    Shared,
    /// Subscribers of this user's queue only.
    Entity,
    /// Both; the event is published once per key.
    Both,
}

impl Audience {
    /// Routing keys to publish with, in publish order.
    pub fn routing_keys(&self, shared_key: &str, entity_id: i64) -> Vec<String> {
        match self {
            Audience::Shared => vec![shared_key.to_string()],
            Audience::Entity => vec![entity_routing_key(entity_id)],
            Audience::Both => vec![shared_key.to_string(), entity_routing_key(entity_id)],
        }
    }
}
