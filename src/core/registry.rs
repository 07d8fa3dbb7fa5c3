//! Device lifecycle boundary.
//!
//! The discovery layer (external) reports plug and unplug events; the
//! registry turns them into [`DeviceSession`] creation and teardown. The
//! registry lock only guards the id-to-session map and is never held across
//! a transport call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::core::error::DeviceError;
use crate::core::session::DeviceSession;
use crate::core::transport::DeviceTransport;

/// Events emitted by the device discovery layer.
pub enum DeviceEvent {
    Added {
        id: String,
        transport: Box<dyn DeviceTransport>,
    },
    Removed {
        id: String,
    },
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEvent::Added { id, .. } => f.debug_struct("Added").field("id", id).finish(),
            DeviceEvent::Removed { id } => f.debug_struct("Removed").field("id", id).finish(),
        }
    }
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceSession>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Added { id, transport } => self.add_device(id, transport),
            DeviceEvent::Removed { id } => self.remove_device(&id),
        }
    }

    fn add_device(&self, id: String, transport: Box<dyn DeviceTransport>) {
        let session = DeviceSession::new(id.clone(), transport);
        let replaced = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone(), session);

        if let Some(stale) = replaced {
            warn!(device = %id, "replacing stale session for re-added device");
            stale.invalidate();
        }
        info!(device = %id, "device added");
    }

    fn remove_device(&self, id: &str) {
        let session = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);

        match session {
            Some(session) => {
                // Blocks until the in-flight gateway call (at most one)
                // releases the device lock.
                session.invalidate();
                info!(device = %id, "device removed");
            }
            None => warn!(device = %id, "removal event for unknown device"),
        }
    }

    /// Look up a live session by device id.
    pub fn get(&self, id: &str) -> Result<DeviceSession, DeviceError> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
            .ok_or(DeviceError::NotInitialized)
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}
