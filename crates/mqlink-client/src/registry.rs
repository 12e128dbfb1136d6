//! Process-wide connection registry.
//!
//! Maps client ids to the command channel of their running engine, so
//! third parties can locate a connection by name. Engines register on
//! start and deregister on exit; two live connections with the same client
//! id in one process are forbidden.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::client::{Command, ConnectionHandle, MqttClient};
use crate::error::{ClientError, Result};

fn map() -> &'static RwLock<HashMap<String, mpsc::Sender<Command>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, mpsc::Sender<Command>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a running engine's command channel under its client id.
pub(crate) fn register(client_id: &str, tx: mpsc::Sender<Command>) -> Result<()> {
    let mut registry = map().write();
    if let Some(existing) = registry.get(client_id) {
        // A dead engine that never deregistered does not block the id
        if !existing.is_closed() {
            return Err(ClientError::DuplicateClientId(client_id.to_string()));
        }
    }
    registry.insert(client_id.to_string(), tx);
    Ok(())
}

/// Remove a client id on engine exit.
pub(crate) fn deregister(client_id: &str) {
    map().write().remove(client_id);
}

/// Look up a running connection by client id.
pub fn client(client_id: &str) -> Option<MqttClient> {
    let registry = map().read();
    let tx = registry.get(client_id)?;
    if tx.is_closed() {
        return None;
    }
    Some(MqttClient {
        tx: tx.clone(),
        client_id: client_id.to_string(),
    })
}

/// Wait up to `timeout` for the named connection to come up and return
/// its handle. Errors with [`ClientError::UnknownConnection`] when no
/// engine with this client id is running.
pub async fn connection(client_id: &str, timeout: Duration) -> Result<ConnectionHandle> {
    let client = self::client(client_id).ok_or(ClientError::UnknownConnection)?;
    client.connection(timeout).await
}
