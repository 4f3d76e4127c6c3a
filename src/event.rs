//! Profile lifecycle events.
//!
//! A `ProfileEvent` is what the front-end hands to the publisher and what the
//! consumer worker hands to the persistence sink. It is immutable once built.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Form fields carried by an event, keyed by field name.
///
/// `BTreeMap` keeps encoding deterministic and makes equality order-free.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Keys the wire format uses at the top level of the message map.
pub const RESERVED_KEYS: [&str; 2] = ["id", "action"];

/// Errors raised while building an event.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Payload field '{0}' collides with a reserved event key")]
    ReservedKey(String),
}

/// What happened to the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    /// Tag written on the wire.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Action::Create => "create_profile",
            Action::Update => "update_profile",
            Action::Delete => "delete_profile",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl FromStr for Action {
    type Err = String;

    /// Accepts the wire tags and their short forms.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_profile" | "create" => Ok(Action::Create),
            "update_profile" | "update" => Ok(Action::Update),
            "delete_profile" | "delete" => Ok(Action::Delete),
            other => Err(other.to_string()),
        }
    }
}

/// A profile lifecycle event for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEvent {
    entity_id: i64,
    action: Action,
    payload: Payload,
}

impl ProfileEvent {
    /// Build an event, rejecting payloads that shadow `id` or `action`.
    pub fn new(entity_id: i64, action: Action, payload: Payload) -> Result<Self, EventError> {
        if let Some(key) = RESERVED_KEYS.iter().find(|k| payload.contains_key(**k)) {
            return Err(EventError::ReservedKey(key.to_string()));
        }
        Ok(Self {
            entity_id,
            action,
            payload,
        })
    }

    pub fn create(entity_id: i64, payload: Payload) -> Result<Self, EventError> {
        Self::new(entity_id, Action::Create, payload)
    }

    pub fn update(entity_id: i64, payload: Payload) -> Result<Self, EventError> {
        Self::new(entity_id, Action::Update, payload)
    }

    /// Deletes carry no form fields.
    pub fn delete(entity_id: i64) -> Self {
        Self {
            entity_id,
            action: Action::Delete,
            payload: Payload::new(),
        }
    }

    pub fn entity_id(&self) -> i64 {
        self.entity_id
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}
