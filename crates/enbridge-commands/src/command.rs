//! Pending command records.
//!
//! A [`PendingCommand`] describes one command sent toward a device together
//! with the state the device is expected to report once the command took
//! effect. It owns the predicate that decides whether an incoming telegram
//! confirms it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// Device identifier.
pub type DeviceId = String;

/// Decoded telegram fields (or expected fields), keyed by field name.
pub type StateData = HashMap<String, Value>;

/// Default per-command confirmation deadline in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 5.0;

/// Relative tolerance applied to positive numeric expectations.
const RELATIVE_TOLERANCE: f64 = 0.05;

/// Smallest tolerance applied to any numeric expectation.
const MIN_TOLERANCE: f64 = 1.0;

/// Resolution of a pending command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Waiting for a confirming telegram
    Pending,
    /// A telegram matched the expected state
    Confirmed,
    /// The deadline passed without confirmation
    TimedOut,
}

impl Resolution {
    /// Check if the resolution is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Resolution::Pending)
    }
}

/// A command awaiting confirmation from its device.
#[derive(Debug, Clone, Serialize)]
pub struct PendingCommand {
    /// Target device
    pub device_id: DeviceId,
    /// Addressed sub-feature of the device
    pub entity: String,
    /// Original command payload, never interpreted
    pub command: Value,
    /// Fields the device should report after the command took effect
    pub expected_state: StateData,
    /// Wall-clock registration time
    pub created_at: DateTime<Utc>,
    /// Confirmation deadline in seconds
    pub timeout_secs: f64,
    resolution: Resolution,
    #[serde(skip)]
    registered_at: Instant,
    #[serde(skip)]
    timeout: Duration,
    #[serde(skip)]
    sequence: u64,
}

impl PendingCommand {
    /// Create a new pending command.
    ///
    /// Negative or NaN timeouts are clamped to zero; timeouts too large for a
    /// `Duration` (including infinity) never expire.
    pub fn new(
        device_id: impl Into<DeviceId>,
        entity: impl Into<String>,
        command: Value,
        expected_state: StateData,
        timeout_secs: f64,
    ) -> Self {
        let timeout = if timeout_secs.is_nan() || timeout_secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(timeout_secs).unwrap_or(Duration::MAX)
        };

        Self {
            device_id: device_id.into(),
            entity: entity.into(),
            command,
            expected_state,
            created_at: Utc::now(),
            timeout_secs: timeout.as_secs_f64(),
            resolution: Resolution::Pending,
            registered_at: Instant::now(),
            timeout,
            sequence: 0,
        }
    }

    /// Current resolution.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Check if the command has left the pending state.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_terminal()
    }

    /// Time elapsed since registration.
    pub fn elapsed(&self) -> Duration {
        self.registered_at.elapsed()
    }

    /// Check if the deadline has passed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.registered_at) > self.timeout
    }

    /// Check if a telegram confirms this command.
    ///
    /// A single overlapping field within tolerance is enough; fields missing
    /// from either side are ignored.
    pub fn matches_state(&self, state_data: &StateData) -> bool {
        self.expected_state.iter().any(|(key, expected)| {
            state_data
                .get(key)
                .is_some_and(|received| values_match(expected, received))
        })
    }

    /// Registration sequence number assigned by the registry.
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Mark as confirmed. Returns `false` if already resolved.
    pub(crate) fn confirm(&mut self) -> bool {
        self.resolve(Resolution::Confirmed)
    }

    /// Mark as timed out. Returns `false` if already resolved.
    pub(crate) fn time_out(&mut self) -> bool {
        self.resolve(Resolution::TimedOut)
    }

    fn resolve(&mut self, resolution: Resolution) -> bool {
        if self.resolution.is_terminal() {
            return false;
        }
        self.resolution = resolution;
        true
    }
}

/// Compare an expected field value with a received one.
///
/// Numbers match within [`tolerance_for`]; everything else (including
/// booleans) must be equal.
pub fn values_match(expected: &Value, received: &Value) -> bool {
    match (expected, received) {
        (Value::Number(e), Value::Number(r)) => match (e.as_f64(), r.as_f64()) {
            (Some(e), Some(r)) => (r - e).abs() <= tolerance_for(e),
            _ => e == r,
        },
        _ => expected == received,
    }
}

/// Allowed deviation for a numeric expectation.
pub fn tolerance_for(expected: f64) -> f64 {
    if expected > 0.0 {
        (expected * RELATIVE_TOLERANCE).abs().max(MIN_TOLERANCE)
    } else {
        MIN_TOLERANCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> StateData {
        serde_json::from_value(value).unwrap()
    }

    fn dimmer(expected: Value) -> PendingCommand {
        PendingCommand::new(
            "FFD4E701",
            "dimmer",
            json!({"action": "set"}),
            state(expected),
            DEFAULT_TIMEOUT_SECS,
        )
    }

    #[test]
    fn test_tolerance() {
        assert_eq!(tolerance_for(80.0), 4.0);
        assert_eq!(tolerance_for(200.0), 10.0);
        assert_eq!(tolerance_for(10.0), 1.0);
        assert_eq!(tolerance_for(0.0), 1.0);
        assert_eq!(tolerance_for(-50.0), 1.0);
    }

    #[test]
    fn test_numeric_within_tolerance() {
        let cmd = dimmer(json!({"brightness": 80}));
        assert!(cmd.matches_state(&state(json!({"brightness": 83}))));
        assert!(cmd.matches_state(&state(json!({"brightness": 76}))));
        assert!(cmd.matches_state(&state(json!({"brightness": 80.0}))));
        assert!(!cmd.matches_state(&state(json!({"brightness": 90}))));
        assert!(!cmd.matches_state(&state(json!({"brightness": 75.5}))));
    }

    #[test]
    fn test_zero_and_negative_expectations() {
        let cmd = dimmer(json!({"position": 0}));
        assert!(cmd.matches_state(&state(json!({"position": 1}))));
        assert!(cmd.matches_state(&state(json!({"position": -1}))));
        assert!(!cmd.matches_state(&state(json!({"position": 2}))));

        let cmd = dimmer(json!({"offset": -20}));
        assert!(cmd.matches_state(&state(json!({"offset": -21}))));
        assert!(!cmd.matches_state(&state(json!({"offset": -22}))));
    }

    #[test]
    fn test_exact_match_for_non_numeric() {
        let cmd = dimmer(json!({"state": "on"}));
        assert!(cmd.matches_state(&state(json!({"state": "on"}))));
        assert!(!cmd.matches_state(&state(json!({"state": "off"}))));
        assert!(!cmd.matches_state(&state(json!({"state": 1}))));

        let cmd = dimmer(json!({"locked": true}));
        assert!(cmd.matches_state(&state(json!({"locked": true}))));
        assert!(!cmd.matches_state(&state(json!({"locked": 1}))));
    }

    #[test]
    fn test_any_overlapping_field_is_enough() {
        let cmd = dimmer(json!({"state": "on", "brightness": 80}));
        assert!(cmd.matches_state(&state(json!({"state": "off", "brightness": 81}))));
        assert!(cmd.matches_state(&state(json!({"state": "on", "brightness": 10}))));
        assert!(!cmd.matches_state(&state(json!({"state": "off", "brightness": 10}))));
    }

    #[test]
    fn test_missing_fields_are_skipped() {
        let cmd = dimmer(json!({"brightness": 80}));
        assert!(!cmd.matches_state(&state(json!({"temperature": 80}))));
        assert!(!cmd.matches_state(&StateData::new()));

        let empty = dimmer(json!({}));
        assert!(!empty.matches_state(&state(json!({"brightness": 80}))));
    }

    #[test]
    fn test_resolution_transitions_once() {
        let mut cmd = dimmer(json!({"state": "on"}));
        assert_eq!(cmd.resolution(), Resolution::Pending);
        assert!(!cmd.is_resolved());

        assert!(cmd.confirm());
        assert_eq!(cmd.resolution(), Resolution::Confirmed);
        assert!(!cmd.time_out());
        assert!(!cmd.confirm());
        assert_eq!(cmd.resolution(), Resolution::Confirmed);
    }

    #[test]
    fn test_timeout_clamping() {
        let negative = PendingCommand::new("d", "e", Value::Null, StateData::new(), -3.0);
        assert_eq!(negative.timeout_secs, 0.0);

        let nan = PendingCommand::new("d", "e", Value::Null, StateData::new(), f64::NAN);
        assert_eq!(nan.timeout_secs, 0.0);

        let forever = PendingCommand::new("d", "e", Value::Null, StateData::new(), f64::INFINITY);
        assert!(!forever.is_expired(Instant::now() + Duration::from_secs(86_400 * 365)));
    }

    #[test]
    fn test_huge_finite_timeout_never_expires() {
        let later = Instant::now() + Duration::from_secs(86_400 * 365);

        for secs in [1e20, f64::MAX] {
            let cmd = PendingCommand::new("d", "e", Value::Null, StateData::new(), secs);
            assert!(cmd.timeout_secs > 1e18);
            assert!(!cmd.is_expired(later));
        }

        let tiny = PendingCommand::new("d", "e", Value::Null, StateData::new(), 0.25);
        assert_eq!(tiny.timeout_secs, 0.25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_expired_is_strict() {
        let cmd = PendingCommand::new("d", "e", Value::Null, StateData::new(), 2.0);
        let start = Instant::now();

        assert!(!cmd.is_expired(start + Duration::from_secs(2)));
        assert!(cmd.is_expired(start + Duration::from_millis(2001)));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(cmd.elapsed(), Duration::from_millis(500));
    }

    #[test]
    fn test_serialize_snapshot() {
        let cmd = dimmer(json!({"brightness": 80}));
        let value = serde_json::to_value(&cmd).unwrap();

        assert_eq!(value["device_id"], "FFD4E701");
        assert_eq!(value["resolution"], "pending");
        assert_eq!(value["timeout_secs"], 5.0);
        assert!(value.get("registered_at").is_none());
    }
}
