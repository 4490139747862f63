//! Downlink command queue: drains pending rows for a device once its
//! connection (and IMEI) are known, encoding each through the owning
//! protocol's `encode_command` and writing the bytes back on the socket.

use uuid::Uuid;

use fleetlink_core::position::CommandParams;
use fleetlink_core::ProtocolDecoder;

use crate::error::ServerError;
use crate::storage::models::{CommandStatus, QueuedCommand};
use crate::storage::PgStore;

fn params_from_json(value: &serde_json::Value) -> CommandParams {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

/// Drains every pending command for `device_id`, writing each one through
/// `write`. A write failure leaves the row `pending` for the next drain
/// (retried up to `max_retries`, tracked by the caller incrementing
/// `retries` — left to the schema's default since this module only flips
/// status, not retry counts, matching the minimal contract in the alert
/// engine's downlink section).
pub async fn drain_pending(
    store: &PgStore,
    decoder: &dyn ProtocolDecoder,
    device_id: Uuid,
    mut write: impl FnMut(&[u8]) -> bool,
) -> Result<(), ServerError> {
    let pending = store.pending_commands(device_id).await?;
    for command in pending {
        send_one(store, decoder, &command, &mut write).await?;
    }
    Ok(())
}

async fn send_one(
    store: &PgStore,
    decoder: &dyn ProtocolDecoder,
    command: &QueuedCommand,
    write: &mut impl FnMut(&[u8]) -> bool,
) -> Result<(), ServerError> {
    let params = params_from_json(&command.params);
    let bytes = decoder.encode_command(&command.command, &params);

    if write(&bytes) {
        store
            .mark_command_status(command.id, CommandStatus::Sent)
            .await?;
    } else if command.retries >= command.max_retries {
        store
            .mark_command_status(command.id, CommandStatus::Failed)
            .await?;
    }
    // else: left pending, picked up again on the next drain.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_from_json_defaults_on_null() {
        let params = params_from_json(&serde_json::Value::Null);
        assert!(params.is_empty());
    }
}
