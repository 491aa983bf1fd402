//! Per-device registry of commands awaiting confirmation.
//!
//! The registry only resolves and removes entries. Notifying subscribers is
//! left to the caller, which receives the resolved entries back and can do so
//! after releasing whatever lock guards the registry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::command::{DeviceId, PendingCommand, StateData};

/// Tracker statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    /// Commands currently awaiting confirmation
    pub total_pending: usize,
    /// Commands confirmed since the tracker was created
    pub total_confirmed: u64,
    /// Commands timed out since the tracker was created
    pub total_timed_out: u64,
    /// Devices with at least one pending command
    pub devices_with_pending: usize,
    /// Commands registered since the tracker was created
    pub total_registered: u64,
    /// Commands dropped through an explicit device clear
    pub total_cleared: u64,
}

/// Ordered pending commands, grouped by device.
///
/// A device key never maps to an empty sequence.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    devices: HashMap<DeviceId, Vec<PendingCommand>>,
    next_sequence: u64,
    registered: u64,
    confirmed: u64,
    timed_out: u64,
    cleared: u64,
}

impl CommandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command to its device's sequence.
    pub fn register(&mut self, mut command: PendingCommand) {
        command.set_sequence(self.next_sequence);
        self.next_sequence += 1;
        self.registered += 1;
        self.devices
            .entry(command.device_id.clone())
            .or_default()
            .push(command);
    }

    /// Confirm every pending command of `device_id` that `state_data` matches.
    ///
    /// Confirmed commands are removed and returned in registration order.
    pub fn feed_telegram(&mut self, device_id: &str, state_data: &StateData) -> Vec<PendingCommand> {
        let Some(entries) = self.devices.get_mut(device_id) else {
            return Vec::new();
        };

        let resolved = take_resolved(entries, |entry| {
            entry.matches_state(state_data) && entry.confirm()
        });

        if entries.is_empty() {
            self.devices.remove(device_id);
        }
        self.confirmed += resolved.len() as u64;
        resolved
    }

    /// Time out every pending command whose deadline passed at `now`.
    ///
    /// Expired commands are removed and returned in registration order across
    /// all devices.
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<PendingCommand> {
        let mut resolved = Vec::new();

        for entries in self.devices.values_mut() {
            resolved.extend(take_resolved(entries, |entry| {
                entry.is_expired(now) && entry.time_out()
            }));
        }

        resolved.sort_by_key(PendingCommand::sequence);
        self.devices.retain(|_, entries| !entries.is_empty());
        self.timed_out += resolved.len() as u64;
        resolved
    }

    /// Drop every pending command of a device. Returns how many were dropped.
    pub fn clear_device(&mut self, device_id: &str) -> usize {
        let count = self.devices.remove(device_id).map_or(0, |entries| entries.len());
        self.cleared += count as u64;
        count
    }

    /// Pending command count, for one device or overall.
    pub fn pending_count(&self, device_id: Option<&str>) -> usize {
        match device_id {
            Some(id) => self.devices.get(id).map_or(0, Vec::len),
            None => self.devices.values().map(Vec::len).sum(),
        }
    }

    /// Snapshot of a device's pending commands in registration order.
    pub fn pending_for(&self, device_id: &str) -> Vec<PendingCommand> {
        self.devices.get(device_id).cloned().unwrap_or_default()
    }

    /// Devices that currently have pending commands.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.keys().cloned().collect()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            total_pending: self.pending_count(None),
            total_confirmed: self.confirmed,
            total_timed_out: self.timed_out,
            devices_with_pending: self.devices.len(),
            total_registered: self.registered,
            total_cleared: self.cleared,
        }
    }
}

/// Split `entries` into the ones `resolve` resolved and the ones still pending.
///
/// Already-resolved entries are never handed to `resolve`.
fn take_resolved(
    entries: &mut Vec<PendingCommand>,
    mut resolve: impl FnMut(&mut PendingCommand) -> bool,
) -> Vec<PendingCommand> {
    let mut resolved = Vec::new();
    let mut remaining = Vec::with_capacity(entries.len());

    for mut entry in entries.drain(..) {
        if !entry.is_resolved() && resolve(&mut entry) {
            resolved.push(entry);
        } else {
            remaining.push(entry);
        }
    }

    *entries = remaining;
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Resolution;
    use serde_json::{Value, json};
    use std::time::Duration;

    fn state(value: Value) -> StateData {
        serde_json::from_value(value).unwrap()
    }

    fn command(device: &str, entity: &str, expected: Value, timeout: f64) -> PendingCommand {
        PendingCommand::new(device, entity, json!({"entity": entity}), state(expected), timeout)
    }

    #[test]
    fn test_register_groups_by_device() {
        let mut registry = CommandRegistry::new();
        registry.register(command("dev1", "light", json!({"state": "on"}), 5.0));
        registry.register(command("dev1", "light", json!({"state": "off"}), 5.0));
        registry.register(command("dev2", "blind", json!({"position": 50}), 5.0));

        assert_eq!(registry.pending_count(None), 3);
        assert_eq!(registry.pending_count(Some("dev1")), 2);
        assert_eq!(registry.pending_count(Some("dev2")), 1);
        assert_eq!(registry.pending_count(Some("unknown")), 0);

        let pending = registry.pending_for("dev1");
        assert_eq!(pending[0].expected_state["state"], "on");
        assert_eq!(pending[1].expected_state["state"], "off");
    }

    #[test]
    fn test_feed_confirms_all_matching_in_order() {
        let mut registry = CommandRegistry::new();
        registry.register(command("dev1", "ch1", json!({"brightness": 80}), 5.0));
        registry.register(command("dev1", "ch2", json!({"brightness": 20}), 5.0));
        registry.register(command("dev1", "ch3", json!({"brightness": 82}), 5.0));

        let confirmed = registry.feed_telegram("dev1", &state(json!({"brightness": 81})));

        assert_eq!(confirmed.len(), 2);
        assert_eq!(confirmed[0].entity, "ch1");
        assert_eq!(confirmed[1].entity, "ch3");
        assert!(confirmed.iter().all(|c| c.resolution() == Resolution::Confirmed));

        let remaining = registry.pending_for("dev1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].entity, "ch2");
    }

    #[test]
    fn test_feed_removes_empty_device() {
        let mut registry = CommandRegistry::new();
        registry.register(command("dev1", "light", json!({"state": "on"}), 5.0));

        let confirmed = registry.feed_telegram("dev1", &state(json!({"state": "on"})));
        assert_eq!(confirmed.len(), 1);
        assert!(registry.devices().is_empty());
        assert_eq!(registry.stats().devices_with_pending, 0);
    }

    #[test]
    fn test_feed_unknown_device_is_noop() {
        let mut registry = CommandRegistry::new();
        registry.register(command("dev1", "light", json!({"state": "on"}), 5.0));

        assert!(registry.feed_telegram("dev9", &state(json!({"state": "on"}))).is_empty());
        assert!(registry.feed_telegram("dev1", &state(json!({"state": "off"}))).is_empty());
        assert_eq!(registry.pending_count(Some("dev1")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_expired_only() {
        let mut registry = CommandRegistry::new();
        registry.register(command("dev1", "fast", json!({"state": "on"}), 0.5));
        registry.register(command("dev1", "slow", json!({"state": "on"}), 10.0));
        registry.register(command("dev2", "fast", json!({"state": "on"}), 0.5));

        assert!(registry.sweep_timeouts(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let expired = registry.sweep_timeouts(Instant::now());

        assert_eq!(expired.len(), 2);
        assert!(expired.iter().all(|c| c.entity == "fast"));
        assert!(expired.iter().all(|c| c.resolution() == Resolution::TimedOut));
        assert_eq!(registry.devices(), vec!["dev1".to_string()]);
        assert_eq!(registry.pending_for("dev1")[0].entity, "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_registration_order_across_devices() {
        let mut registry = CommandRegistry::new();
        let mut expected = Vec::new();
        for i in 0..16 {
            let device = format!("dev{:02}", 15 - i);
            registry.register(command(&device, "first", json!({"state": "on"}), 0.1));
            expected.push(format!("{}/first", device));
            if i % 3 == 0 {
                registry.register(command(&device, "second", json!({"state": "on"}), 0.1));
                expected.push(format!("{}/second", device));
            }
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        let order: Vec<String> = registry
            .sweep_timeouts(Instant::now())
            .iter()
            .map(|c| format!("{}/{}", c.device_id, c.entity))
            .collect();

        assert_eq!(order, expected);
        assert!(registry.devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_entry_cannot_time_out() {
        let mut registry = CommandRegistry::new();
        registry.register(command("dev1", "light", json!({"state": "on"}), 0.1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(registry.feed_telegram("dev1", &state(json!({"state": "on"}))).len(), 1);
        assert!(registry.sweep_timeouts(Instant::now()).is_empty());

        let stats = registry.stats();
        assert_eq!(stats.total_confirmed, 1);
        assert_eq!(stats.total_timed_out, 0);
    }

    #[test]
    fn test_clear_device() {
        let mut registry = CommandRegistry::new();
        registry.register(command("dev1", "a", json!({"state": "on"}), 5.0));
        registry.register(command("dev1", "b", json!({"state": "on"}), 5.0));
        registry.register(command("dev2", "a", json!({"state": "on"}), 5.0));

        assert_eq!(registry.clear_device("dev1"), 2);
        assert_eq!(registry.clear_device("dev1"), 0);
        assert_eq!(registry.pending_count(Some("dev1")), 0);
        assert_eq!(registry.pending_count(None), 1);
    }

    #[test]
    fn test_stats_balance() {
        let mut registry = CommandRegistry::new();
        registry.register(command("dev1", "a", json!({"state": "on"}), 5.0));
        registry.register(command("dev1", "b", json!({"state": "off"}), 5.0));
        registry.register(command("dev2", "a", json!({"state": "on"}), 5.0));
        registry.register(command("dev3", "a", json!({"state": "on"}), 5.0));

        registry.feed_telegram("dev1", &state(json!({"state": "on"})));
        registry.clear_device("dev3");

        let stats = registry.stats();
        assert_eq!(stats.total_registered, 4);
        assert_eq!(stats.total_confirmed, 1);
        assert_eq!(stats.total_cleared, 1);
        assert_eq!(stats.total_pending, 2);
        assert_eq!(stats.devices_with_pending, 2);
        assert_eq!(
            stats.total_confirmed + stats.total_timed_out + stats.total_cleared
                + stats.total_pending as u64,
            stats.total_registered
        );
    }
}
