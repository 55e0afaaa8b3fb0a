//! `meshgate-types` – shared vocabulary of the gateway.
//!
//! Every crate in the workspace speaks in these types: the request/response
//! protocol spoken by network clients, the notifications pushed to
//! subscribers, radio addresses, and the [`GatewayError`] that travels back
//! through a command's response slot.

pub mod address;
pub mod error;
pub mod event;
pub mod wire;

pub use address::{Address16, Address64, AtCommand, Payload};
pub use error::{ErrorCode, GatewayError};
pub use event::{LinkState, NotifyEvent, NotifyKind};
pub use wire::{
    CommandOutput, DiscoveredDevice, DiscoveryResult, MAX_WAIT_SECS, Request, Response, Role,
    op_hint,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_error_display() {
        let err = GatewayError::hardware("send", "no ACK from 0013A200418D05FC");
        assert!(err.to_string().contains("send"));
        assert!(err.to_string().contains("no ACK"));

        assert!(GatewayError::Unavailable.to_string().contains("not running"));
    }

    #[test]
    fn gateway_error_codes() {
        assert_eq!(GatewayError::Validation("x".into()).code(), ErrorCode::Validation);
        assert_eq!(GatewayError::hardware("get", "x").code(), ErrorCode::Hardware);
        assert_eq!(GatewayError::Startup("x".into()).code(), ErrorCode::Unavailable);
        assert_eq!(
            GatewayError::timeout(std::time::Duration::from_millis(5)).code(),
            ErrorCode::Timeout
        );
    }

    #[test]
    fn every_error_maps_to_a_wire_code() {
        let errors = [
            GatewayError::Validation("x".into()),
            GatewayError::timeout(std::time::Duration::from_secs(1)),
            GatewayError::hardware("send", "x"),
            GatewayError::Unavailable,
            GatewayError::Startup("x".into()),
        ];
        for err in errors {
            let code = serde_json::to_value(err.code()).unwrap();
            assert!(
                ["validation", "timeout", "hardware", "unavailable"]
                    .contains(&code.as_str().unwrap()),
                "{err:?} reports {code}"
            );
        }
    }

    #[test]
    fn gateway_error_serialization_roundtrip() {
        let err = GatewayError::hardware("discover", "radio unplugged");
        let json = serde_json::to_string(&err).unwrap();
        let back: GatewayError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
