//! Tracker lifecycle events.
//!
//! The confirmation and timeout callbacks are single-subscriber. The event bus
//! is the multi-subscriber path: every registration and resolution is
//! broadcast to any number of receivers and kept in a bounded history.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};

use crate::command::{DeviceId, PendingCommand, StateData};

/// Tracker event types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrackerEventType {
    /// Command registered for tracking
    Registered,
    /// Command confirmed by a telegram
    Confirmed,
    /// Command deadline passed
    TimedOut,
    /// Command dropped by a device clear
    Cleared,
}

/// Tracker event with context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerEvent {
    /// Event ID
    pub id: String,
    /// Event type
    pub event_type: TrackerEventType,
    /// Device ID
    pub device_id: DeviceId,
    /// Entity name (empty for device-wide events)
    pub entity: String,
    /// Command payload (null for device-wide events)
    pub command: Value,
    /// Confirming telegram state
    pub state_data: Option<StateData>,
    /// Seconds between registration and resolution
    pub elapsed_secs: Option<f64>,
    /// Number of commands affected (device clears)
    pub count: Option<usize>,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl TrackerEvent {
    fn new(event_type: TrackerEventType, device_id: DeviceId, entity: String, command: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            device_id,
            entity,
            command,
            state_data: None,
            elapsed_secs: None,
            count: None,
            timestamp: Utc::now(),
        }
    }

    /// Event for a newly registered command.
    pub fn registered(command: &PendingCommand) -> Self {
        Self::new(
            TrackerEventType::Registered,
            command.device_id.clone(),
            command.entity.clone(),
            command.command.clone(),
        )
    }

    /// Event for a confirmed command.
    pub fn confirmed(command: &PendingCommand, state_data: &StateData) -> Self {
        let mut event = Self::new(
            TrackerEventType::Confirmed,
            command.device_id.clone(),
            command.entity.clone(),
            command.command.clone(),
        );
        event.state_data = Some(state_data.clone());
        event.elapsed_secs = Some(command.elapsed().as_secs_f64());
        event
    }

    /// Event for a timed-out command.
    pub fn timed_out(command: &PendingCommand) -> Self {
        let mut event = Self::new(
            TrackerEventType::TimedOut,
            command.device_id.clone(),
            command.entity.clone(),
            command.command.clone(),
        );
        event.elapsed_secs = Some(command.elapsed().as_secs_f64());
        event
    }

    /// Event for a device whose pending commands were dropped.
    pub fn cleared(device_id: &str, count: usize) -> Self {
        let mut event = Self::new(
            TrackerEventType::Cleared,
            device_id.to_string(),
            String::new(),
            Value::Null,
        );
        event.count = Some(count);
        event
    }
}

/// Event filter for subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Filter by device ID
    pub device_id: Option<DeviceId>,
    /// Filter by event types
    pub event_types: Option<Vec<TrackerEventType>>,
}

impl EventFilter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only pass events for one device.
    pub fn device(mut self, device_id: impl Into<DeviceId>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Only pass the given event types.
    pub fn event_types(mut self, event_types: Vec<TrackerEventType>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &TrackerEvent) -> bool {
        if let Some(ref device_id) = self.device_id
            && &event.device_id != device_id
        {
            return false;
        }

        if let Some(ref event_types) = self.event_types
            && !event_types.contains(&event.event_type)
        {
            return false;
        }

        true
    }
}

/// Event bus for tracker events.
pub struct TrackerEventBus {
    broadcast_tx: broadcast::Sender<TrackerEvent>,
    recent_events: Arc<RwLock<VecDeque<TrackerEvent>>>,
    max_stored: usize,
}

impl TrackerEventBus {
    /// Create a new event bus keeping at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (broadcast_tx, _) = broadcast::channel(capacity);

        Self {
            broadcast_tx,
            recent_events: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            max_stored: capacity,
        }
    }

    /// Publish an event. Never blocks on slow subscribers.
    pub async fn publish(&self, event: TrackerEvent) {
        let mut events = self.recent_events.write().await;
        if events.len() >= self.max_stored {
            events.pop_front();
        }
        events.push_back(event.clone());
        drop(events);

        // No receivers is fine
        let _ = self.broadcast_tx.send(event);
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Subscribe with a filter.
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredSubscriber {
        FilteredSubscriber {
            rx: self.broadcast_tx.subscribe(),
            filter,
        }
    }

    /// Get the most recent events, oldest first.
    pub async fn get_recent(&self, limit: usize) -> Vec<TrackerEvent> {
        let events = self.recent_events.read().await;
        let start = events.len().saturating_sub(limit);
        events.iter().skip(start).cloned().collect()
    }

    /// Get recent events for a device, newest first.
    pub async fn get_by_device(&self, device_id: &str, limit: usize) -> Vec<TrackerEvent> {
        let events = self.recent_events.read().await;
        events
            .iter()
            .rev()
            .filter(|e| e.device_id == device_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Clear stored history.
    pub async fn clear(&self) {
        self.recent_events.write().await.clear();
    }
}

/// Filtered event subscriber.
pub struct FilteredSubscriber {
    rx: broadcast::Receiver<TrackerEvent>,
    filter: EventFilter,
}

impl FilteredSubscriber {
    /// Receive the next matching event.
    pub async fn recv(&mut self) -> Result<TrackerEvent, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Try to receive the next matching event without waiting.
    pub fn try_recv(&mut self) -> Result<TrackerEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.rx.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
