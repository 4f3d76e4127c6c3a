//! In-memory profile store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Profile, ProfileSink, SinkError};
use crate::event::Payload;

/// A sink call that took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOp {
    Create(i64),
    Update(i64),
    Delete(i64),
}

/// Profiles held in a map, with a log of applied operations.
#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<i64, Profile>>,
    operations: RwLock<Vec<SinkOp>>,
    fail_next: RwLock<usize>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a transient storage error.
    pub async fn set_fail_next(&self, count: usize) {
        *self.fail_next.write().await = count;
    }

    pub async fn get(&self, entity_id: i64) -> Option<Profile> {
        self.profiles.read().await.get(&entity_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.profiles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.profiles.read().await.is_empty()
    }

    /// Operations applied so far, oldest first.
    pub async fn operations(&self) -> Vec<SinkOp> {
        self.operations.read().await.clone()
    }

    async fn injected_failure(&self) -> Result<(), SinkError> {
        let mut remaining = self.fail_next.write().await;
        if *remaining > 0 {
            *remaining -= 1;
            return Err(SinkError::Storage("injected failure".to_string()));
        }
        Ok(())
    }

    async fn record(&self, op: SinkOp) {
        self.operations.write().await.push(op);
    }
}

#[async_trait]
impl ProfileSink for InMemoryProfileStore {
    async fn create(&self, entity_id: i64, payload: &Payload) -> Result<(), SinkError> {
        self.injected_failure().await?;
        let profile = Profile::from_payload(entity_id, payload)?;

        self.profiles.write().await.insert(entity_id, profile);
        self.record(SinkOp::Create(entity_id)).await;
        Ok(())
    }

    async fn update(&self, entity_id: i64, payload: &Payload) -> Result<(), SinkError> {
        self.injected_failure().await?;

        let mut profiles = self.profiles.write().await;
        let current = profiles
            .get(&entity_id)
            .ok_or(SinkError::NotFound(entity_id))?;
        let updated = current.merged(payload)?;
        profiles.insert(entity_id, updated);
        drop(profiles);

        self.record(SinkOp::Update(entity_id)).await;
        Ok(())
    }

    async fn delete(&self, entity_id: i64) -> Result<(), SinkError> {
        self.injected_failure().await?;

        self.profiles.write().await.remove(&entity_id);
        self.record(SinkOp::Delete(entity_id)).await;
        Ok(())
    }
}
