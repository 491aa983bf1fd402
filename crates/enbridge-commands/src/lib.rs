//! Command confirmation for the EnOcean bridge.
//!
//! Provides:
//! - Pending command records and tolerance-based state matching
//! - A per-device registry resolving each command exactly once
//! - A background supervisor timing out unconfirmed commands
//! - Single-subscriber callbacks plus a broadcast event bus
//! - A save/load interface for last-known device state

pub mod callbacks;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod persistence;
pub mod registry;
mod supervisor;
pub mod tracker;

// Re-exports
pub use command::{
    DEFAULT_TIMEOUT_SECS, DeviceId, PendingCommand, Resolution, StateData, tolerance_for,
    values_match,
};

pub use registry::{CommandRegistry, TrackerStats};

pub use tracker::CommandTracker;

pub use callbacks::{ConfirmationHandler, TimeoutHandler};

pub use config::TrackerConfig;

pub use error::{CallbackError, ConfigError, StoreError};

pub use events::{EventFilter, FilteredSubscriber, TrackerEvent, TrackerEventBus, TrackerEventType};

pub use persistence::{DeviceStateStore, MemoryStateStore, PersistConfirmedState, StoredState};

pub use logging::init_logging;
