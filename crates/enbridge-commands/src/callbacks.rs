//! Confirmation and timeout subscribers.
//!
//! Handlers may be implemented directly or supplied as async closures taking
//! owned arguments. Failures, including panics, are caught and logged at the
//! call site so one bad subscriber never stalls the remaining entries.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use crate::command::{PendingCommand, StateData};
use crate::error::CallbackError;

/// Receives commands confirmed by a device telegram.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    /// Called once per confirmed command.
    async fn on_confirmed(
        &self,
        device_id: &str,
        entity: &str,
        command: &Value,
        state_data: &StateData,
    ) -> Result<(), CallbackError>;
}

/// Receives commands whose deadline passed without confirmation.
#[async_trait]
pub trait TimeoutHandler: Send + Sync {
    /// Called once per timed-out command.
    async fn on_timeout(
        &self,
        device_id: &str,
        entity: &str,
        command: &Value,
    ) -> Result<(), CallbackError>;
}

#[async_trait]
impl<F, Fut> ConfirmationHandler for F
where
    F: Fn(String, String, Value, StateData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    async fn on_confirmed(
        &self,
        device_id: &str,
        entity: &str,
        command: &Value,
        state_data: &StateData,
    ) -> Result<(), CallbackError> {
        (self)(
            device_id.to_string(),
            entity.to_string(),
            command.clone(),
            state_data.clone(),
        )
        .await
    }
}

#[async_trait]
impl<F, Fut> TimeoutHandler for F
where
    F: Fn(String, String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    async fn on_timeout(
        &self,
        device_id: &str,
        entity: &str,
        command: &Value,
    ) -> Result<(), CallbackError> {
        (self)(device_id.to_string(), entity.to_string(), command.clone()).await
    }
}

/// Single-subscriber slots for both outcomes.
#[derive(Default, Clone)]
pub(crate) struct Handlers {
    pub confirmation: Option<Arc<dyn ConfirmationHandler>>,
    pub timeout: Option<Arc<dyn TimeoutHandler>>,
}

/// Invoke the confirmation handler, isolating any failure.
///
/// Returns `true` if the handler completed successfully.
pub(crate) async fn notify_confirmed(
    handler: &dyn ConfirmationHandler,
    command: &PendingCommand,
    state_data: &StateData,
) -> bool {
    let call = handler.on_confirmed(
        &command.device_id,
        &command.entity,
        &command.command,
        state_data,
    );

    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(
                device_id = %command.device_id,
                entity = %command.entity,
                "Error in confirmation callback: {}",
                e
            );
            false
        }
        Err(panic) => {
            tracing::error!(
                device_id = %command.device_id,
                entity = %command.entity,
                "Confirmation callback panicked: {}",
                panic_message(panic.as_ref())
            );
            false
        }
    }
}

/// Invoke the timeout handler, isolating any failure.
///
/// Returns `true` if the handler completed successfully.
pub(crate) async fn notify_timed_out(handler: &dyn TimeoutHandler, command: &PendingCommand) -> bool {
    let call = handler.on_timeout(&command.device_id, &command.entity, &command.command);

    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(
                device_id = %command.device_id,
                entity = %command.entity,
                "Error in timeout callback: {}",
                e
            );
            false
        }
        Err(panic) => {
            tracing::error!(
                device_id = %command.device_id,
                entity = %command.entity,
                "Timeout callback panicked: {}",
                panic_message(panic.as_ref())
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
