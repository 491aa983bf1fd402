//! Last-known device state storage interface.
//!
//! The tracker itself never persists anything. This module defines the
//! save/load interface a durable store plugs into, an in-memory store, and a
//! confirmation handler that records each confirmed state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::callbacks::ConfirmationHandler;
use crate::command::{DeviceId, StateData};
use crate::error::{CallbackError, StoreError};

/// A device state with the time it was saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    /// Device state fields
    pub state: StateData,
    /// Save timestamp
    pub saved_at: DateTime<Utc>,
}

/// Save/load interface for last-known device state.
#[async_trait]
pub trait DeviceStateStore: Send + Sync {
    /// Save (replace) the state of a device.
    async fn save_state(&self, device_id: &str, state: &StateData) -> Result<(), StoreError>;

    /// Get the saved state of a device.
    async fn get_state(&self, device_id: &str) -> Result<Option<StateData>, StoreError>;

    /// Get all saved states.
    async fn get_all_states(&self) -> Result<HashMap<DeviceId, StateData>, StoreError>;

    /// Remove the saved state of a device. Returns whether one existed.
    async fn remove_state(&self, device_id: &str) -> Result<bool, StoreError>;

    /// Remove every saved state.
    async fn clear_all_states(&self) -> Result<(), StoreError>;
}

/// In-memory device state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<DeviceId, StoredState>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a saved state with its timestamp.
    pub async fn get_stored(&self, device_id: &str) -> Option<StoredState> {
        self.states.read().await.get(device_id).cloned()
    }

    /// Number of devices with a saved state.
    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    /// Check if the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait]
impl DeviceStateStore for MemoryStateStore {
    async fn save_state(&self, device_id: &str, state: &StateData) -> Result<(), StoreError> {
        let stored = StoredState {
            state: state.clone(),
            saved_at: Utc::now(),
        };
        self.states.write().await.insert(device_id.to_string(), stored);
        tracing::debug!("Saved state for device {}", device_id);
        Ok(())
    }

    async fn get_state(&self, device_id: &str) -> Result<Option<StateData>, StoreError> {
        Ok(self.get_stored(device_id).await.map(|s| s.state))
    }

    async fn get_all_states(&self) -> Result<HashMap<DeviceId, StateData>, StoreError> {
        let states = self.states.read().await;
        Ok(states
            .iter()
            .map(|(id, stored)| (id.clone(), stored.state.clone()))
            .collect())
    }

    async fn remove_state(&self, device_id: &str) -> Result<bool, StoreError> {
        let removed = self.states.write().await.remove(device_id).is_some();
        if removed {
            tracing::debug!("Removed state for device {}", device_id);
        }
        Ok(removed)
    }

    async fn clear_all_states(&self) -> Result<(), StoreError> {
        self.states.write().await.clear();
        tracing::info!("Cleared all saved device states");
        Ok(())
    }
}

/// Confirmation handler that saves each confirmed telegram state.
///
/// Confirmed fields are merged over the previously saved state, so a telegram
/// reporting a subset of fields does not erase the others. An optional inner
/// handler runs after the save.
pub struct PersistConfirmedState {
    store: Arc<dyn DeviceStateStore>,
    inner: Option<Arc<dyn ConfirmationHandler>>,
}

impl PersistConfirmedState {
    /// Create a handler writing to `store`.
    pub fn new(store: Arc<dyn DeviceStateStore>) -> Self {
        Self { store, inner: None }
    }

    /// Chain another confirmation handler after the save.
    pub fn with_inner(mut self, handler: impl ConfirmationHandler + 'static) -> Self {
        self.inner = Some(Arc::new(handler));
        self
    }
}

#[async_trait]
impl ConfirmationHandler for PersistConfirmedState {
    async fn on_confirmed(
        &self,
        device_id: &str,
        entity: &str,
        command: &Value,
        state_data: &StateData,
    ) -> Result<(), CallbackError> {
        let mut merged = self.store.get_state(device_id).await?.unwrap_or_default();
        merged.extend(state_data.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.store.save_state(device_id, &merged).await?;

        if let Some(inner) = &self.inner {
            inner
                .on_confirmed(device_id, entity, command, state_data)
                .await?;
        }
        Ok(())
    }
}
