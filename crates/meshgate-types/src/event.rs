//! Notifications fanned out to every connected notify subscriber.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::{Address16, Address64, Payload};
use crate::wire::{DiscoveredDevice, Role};

/// State reported by a `status` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// The radio handshake succeeded and commands are being served.
    Ready,
    /// The radio handshake failed; no commands will be served.
    Failed,
    /// The radio reported a modem status change (join, reset, ...).
    Modem,
}

/// Body of a [`NotifyEvent`], tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyKind {
    /// Data received from a remote node.
    Received { address: Address64, message: Payload },
    /// A node answered a discovery broadcast.
    Discovery {
        address: Address64,
        address16: Address16,
        node_id: String,
        role: Role,
    },
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<Address64>,
        state: LinkState,
        detail: String,
    },
}

/// One notification. Never persisted; subscribers that are not connected
/// when it is published never see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: NotifyKind,
}

impl NotifyEvent {
    pub fn new(kind: NotifyKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn received(address: Address64, data: impl Into<Payload>) -> Self {
        Self::new(NotifyKind::Received {
            address,
            message: data.into(),
        })
    }

    pub fn discovery(device: &DiscoveredDevice) -> Self {
        Self::new(NotifyKind::Discovery {
            address: device.address,
            address16: device.address16,
            node_id: device.id.clone(),
            role: device.role,
        })
    }

    pub fn status(address: Option<Address64>, state: LinkState, detail: impl Into<String>) -> Self {
        Self::new(NotifyKind::Status {
            address,
            state,
            detail: detail.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_event_wire_shape() {
        let addr: Address64 = "0013A200418D05FC".parse().unwrap();
        let event = NotifyEvent::received(addr, b"temp 21".to_vec());
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "received");
        assert_eq!(value["address"], "0013A200418D05FC");
        assert_eq!(value["message"], "dGVtcCAyMQ==");
        assert_eq!(value["id"], event.id.to_string());
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn status_event_omits_missing_address() {
        let event = NotifyEvent::status(None, LinkState::Failed, "no such port");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["state"], "failed");
        assert!(value.get("address").is_none());
    }

    #[test]
    fn event_roundtrip() {
        let device = DiscoveredDevice {
            address: Address64::new(0x0013_A200_4000_0001),
            address16: Address16::new(0x7A11),
            id: "KITCHEN".to_string(),
            role: Role::EndDevice,
        };
        let event = NotifyEvent::discovery(&device);
        let json = serde_json::to_string(&event).unwrap();
        let back: NotifyEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.kind, event.kind);
    }
}
