use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::models::system_models::{ConsumerClass, EmsMode};

// --------------------------------------------------------------------------------------------------------------
// Transport seam towards the S2 message bus. The EMS core only ever talks to these types; the
// actual binding (local RPC bridge, test double) lives behind the trait.

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport error: {0}")]
    Transport(String),
}

/// Unicast side of the S2 bus. `client_id` is the session's unique id
/// ("{service}_RM{n}") and tags every call so the resource manager can route
/// multiple EMS connections.
#[async_trait]
pub trait S2Bus: Send + Sync {
    /// Establish the S2 connection. `false` means the RM refused; retried on
    /// the connection-retry timer.
    async fn connect(&self, client_id: &str, keep_alive_interval_s: u32) -> Result<bool, BusError>;

    /// Liveness probe. `false` or an error counts as a missed keep-alive.
    async fn keep_alive(&self, client_id: &str) -> Result<bool, BusError>;

    /// Deliver one S2 JSON envelope to the resource manager.
    async fn send_message(&self, client_id: &str, payload: &str) -> Result<(), BusError>;
}

// --------------------------------------------------------------------------------------------------------------

/// One resource manager endpoint discovered under /Devices/{n}/S2 of a device
/// service. Priority and consumer class come from the device's configuration
/// paths and fall back to the defaults when unannounced.
#[derive(Debug, Clone, Deserialize)]
pub struct RmDescriptor {
    pub index: u32,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_consumer_class")]
    pub consumer_class: ConsumerClass,
}

fn default_priority() -> i32 {
    50
}

fn default_consumer_class() -> ConsumerClass {
    ConsumerClass::Secondary
}

/// Broadcast side of the bus, delivered to the controller as an event stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    /// An S2 message signal, filtered by the session's unique id.
    Message { client_id: String, payload: String },
    /// The RM dropped the connection on its side.
    Disconnect { client_id: String, reason: String },
    /// A device service appeared; carries every S2 RM found on it.
    DeviceAdded {
        service: String,
        instance: u32,
        resource_managers: Vec<RmDescriptor>,
    },
    /// A device service left the bus; all its sessions end.
    DeviceRemoved { service: String },
    /// /Settings/Ems/Mode changed.
    ModeChanged { mode: EmsMode },
    /// /Settings/Ems/Debug/WriteDebugLogs changed.
    DebugLogsChanged { enabled: bool },
}

// --------------------------------------------------------------------------------------------------------------
