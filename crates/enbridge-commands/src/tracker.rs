//! Command confirmation tracker.
//!
//! Commands sent toward devices over the radio link get no synchronous reply.
//! The tracker remembers what each command should change, watches decoded
//! telegrams for a matching state report and resolves every command exactly
//! once: confirmed when a telegram matches, timed out when its deadline passes
//! first.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::time::Instant;

use crate::callbacks::{
    ConfirmationHandler, Handlers, TimeoutHandler, notify_confirmed, notify_timed_out,
};
use crate::command::{PendingCommand, StateData};
use crate::config::TrackerConfig;
use crate::events::{EventFilter, FilteredSubscriber, TrackerEvent, TrackerEventBus};
use crate::registry::{CommandRegistry, TrackerStats};
use crate::supervisor::TimeoutSupervisor;

/// State shared between the facade and the timeout supervisor.
pub(crate) struct TrackerInner {
    registry: Mutex<CommandRegistry>,
    handlers: RwLock<Handlers>,
    events: TrackerEventBus,
}

impl TrackerInner {
    /// Resolve matching commands, then notify outside the registry lock.
    async fn check_telegram(&self, device_id: &str, state_data: &StateData) -> usize {
        let confirmed = self.registry.lock().await.feed_telegram(device_id, state_data);
        if confirmed.is_empty() {
            return 0;
        }

        tracing::debug!("Confirmed state for {}: {:?}", device_id, state_data);

        let handler = self.handlers.read().await.confirmation.clone();
        for command in &confirmed {
            tracing::info!(
                device_id = %command.device_id,
                entity = %command.entity,
                command = %command.command,
                response_time_secs = command.elapsed().as_secs_f64(),
                "Command confirmed"
            );

            self.events
                .publish(TrackerEvent::confirmed(command, state_data))
                .await;

            if let Some(handler) = &handler {
                notify_confirmed(handler.as_ref(), command, state_data).await;
            }
        }

        confirmed.len()
    }

    /// Time out expired commands, then notify outside the registry lock.
    pub(crate) async fn sweep_timeouts(&self, now: Instant) -> usize {
        let expired = self.registry.lock().await.sweep_timeouts(now);
        if expired.is_empty() {
            return 0;
        }

        let handler = self.handlers.read().await.timeout.clone();
        for command in &expired {
            tracing::warn!(
                device_id = %command.device_id,
                entity = %command.entity,
                command = %command.command,
                timeout_secs = command.timeout_secs,
                "Command timed out: no confirmation received from device"
            );

            self.events.publish(TrackerEvent::timed_out(command)).await;

            if let Some(handler) = &handler {
                notify_timed_out(handler.as_ref(), command).await;
            }
        }

        expired.len()
    }
}

/// Tracks pending commands and matches them with confirmation telegrams.
pub struct CommandTracker {
    config: TrackerConfig,
    inner: Arc<TrackerInner>,
    supervisor: Mutex<Option<TimeoutSupervisor>>,
}

impl CommandTracker {
    /// Create a stopped tracker.
    pub fn new(config: TrackerConfig) -> Self {
        let events = TrackerEventBus::new(config.event_capacity);

        Self {
            config,
            inner: Arc::new(TrackerInner {
                registry: Mutex::new(CommandRegistry::new()),
                handlers: RwLock::new(Handlers::default()),
                events,
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Tracker configuration.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Start the timeout supervisor. Does nothing if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            return;
        }

        *supervisor = Some(TimeoutSupervisor::spawn(
            self.inner.clone(),
            self.config.check_interval(),
        ));
        tracing::info!(
            "Command tracker started (check interval {}ms)",
            self.config.check_interval_ms
        );
    }

    /// Stop the timeout supervisor. Does nothing if already stopped.
    ///
    /// Waits for an in-flight sweep and its callbacks, except when called from
    /// one of those callbacks.
    pub async fn stop(&self) {
        // Not held across the wait; callbacks may take it.
        let running = self.supervisor.lock().await.take();
        if let Some(running) = running {
            running.shutdown().await;
            tracing::info!("Command tracker stopped");
        }
    }

    /// Check if the timeout supervisor is running.
    pub async fn is_running(&self) -> bool {
        self.supervisor.lock().await.is_some()
    }

    /// Set the confirmation callback, replacing any previous one.
    pub async fn set_confirmation_callback(&self, handler: impl ConfirmationHandler + 'static) {
        self.inner.handlers.write().await.confirmation = Some(Arc::new(handler));
    }

    /// Set the timeout callback, replacing any previous one.
    pub async fn set_timeout_callback(&self, handler: impl TimeoutHandler + 'static) {
        self.inner.handlers.write().await.timeout = Some(Arc::new(handler));
    }

    /// Remove the confirmation callback.
    pub async fn clear_confirmation_callback(&self) {
        self.inner.handlers.write().await.confirmation = None;
    }

    /// Remove the timeout callback.
    pub async fn clear_timeout_callback(&self) {
        self.inner.handlers.write().await.timeout = None;
    }

    /// Track a command that was just sent.
    ///
    /// `timeout_secs` of `None` uses the configured default.
    pub async fn add_pending_command(
        &self,
        device_id: impl Into<String>,
        entity: impl Into<String>,
        command: Value,
        expected_state: StateData,
        timeout_secs: Option<f64>,
    ) {
        let timeout = timeout_secs.unwrap_or(self.config.default_timeout_secs);
        let pending = PendingCommand::new(device_id, entity, command, expected_state, timeout);

        tracing::debug!(
            device_id = %pending.device_id,
            entity = %pending.entity,
            command = %pending.command,
            expected_state = ?pending.expected_state,
            timeout_secs = pending.timeout_secs,
            "Tracking command"
        );

        let event = TrackerEvent::registered(&pending);
        self.inner.registry.lock().await.register(pending);
        self.inner.events.publish(event).await;
    }

    /// Check whether a decoded telegram confirms pending commands.
    ///
    /// Returns the number of commands confirmed.
    pub async fn check_telegram(&self, device_id: &str, state_data: &StateData) -> usize {
        self.inner.check_telegram(device_id, state_data).await
    }

    /// Run one timeout sweep now, independent of the supervisor.
    ///
    /// Returns the number of commands timed out.
    pub async fn check_timeouts(&self) -> usize {
        self.inner.sweep_timeouts(Instant::now()).await
    }

    /// Count pending commands for one device, or all devices.
    pub async fn get_pending_count(&self, device_id: Option<&str>) -> usize {
        self.inner.registry.lock().await.pending_count(device_id)
    }

    /// Pending commands of a device in registration order.
    pub async fn get_pending_commands(&self, device_id: &str) -> Vec<PendingCommand> {
        self.inner.registry.lock().await.pending_for(device_id)
    }

    /// Drop all pending commands of a device without notifying callbacks.
    ///
    /// Returns the number of commands dropped.
    pub async fn clear_device_commands(&self, device_id: &str) -> usize {
        let count = self.inner.registry.lock().await.clear_device(device_id);
        if count > 0 {
            tracing::info!("Cleared {} pending command(s) for {}", count, device_id);
            self.inner
                .events
                .publish(TrackerEvent::cleared(device_id, count))
                .await;
        }
        count
    }

    /// Get tracker statistics.
    pub async fn get_stats(&self) -> TrackerStats {
        self.inner.registry.lock().await.stats()
    }

    /// Subscribe to all tracker events.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe to tracker events passing `filter`.
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredSubscriber {
        self.inner.events.subscribe_filtered(filter)
    }

    /// Most recent tracker events, oldest first.
    pub async fn recent_events(&self, limit: usize) -> Vec<TrackerEvent> {
        self.inner.events.get_recent(limit).await
    }

    /// Most recent events of one device, newest first.
    pub async fn device_events(&self, device_id: &str, limit: usize) -> Vec<TrackerEvent> {
        self.inner.events.get_by_device(device_id, limit).await
    }

    /// Drop the stored event history. Subscribers are unaffected.
    pub async fn clear_event_history(&self) {
        self.inner.events.clear().await;
    }
}

impl Default for CommandTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl Drop for CommandTracker {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.abort();
        }
    }
}
