//! Request / response shapes of the newline-delimited JSON protocol.
//!
//! | `op` | Fields | `result` on success |
//! |---|---|---|
//! | `discover` | – | `{"devices": [..]}` |
//! | `send` | `address`, `message` | `{}` |
//! | `get_parameter` | `address`?, `at_command` | `{"value": b64}` |
//! | `set_parameter` | `address`?, `at_command`, `value`, `apply_changes`? | `{}` |
//! | `execute_command` | `address`?, `at_command`, `value`?, `apply_changes`? | `{"value": b64 \| null}` |
//! | `wait` | `time` (seconds) | `{"time": t}` |
//!
//! Omitting `address` targets the local radio.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::{Address16, Address64, AtCommand, Payload};
use crate::error::{ErrorCode, GatewayError};

/// Upper bound accepted for the `wait` operation, in seconds.
pub const MAX_WAIT_SECS: f64 = 3600.0;

fn default_apply_changes() -> bool {
    true
}

/// A validated operation addressed to the device worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Broadcast a node discovery and collect replies for one window.
    Discover,
    /// Point-to-point data transmission to a remote node.
    Send {
        #[serde(alias = "address64")]
        address: Address64,
        message: Payload,
    },
    /// Read an AT parameter.
    GetParameter {
        #[serde(default, alias = "address64", skip_serializing_if = "Option::is_none")]
        address: Option<Address64>,
        at_command: AtCommand,
    },
    /// Write an AT parameter, optionally applying it immediately.
    SetParameter {
        #[serde(default, alias = "address64", skip_serializing_if = "Option::is_none")]
        address: Option<Address64>,
        at_command: AtCommand,
        value: Payload,
        #[serde(default = "default_apply_changes")]
        apply_changes: bool,
    },
    /// Run an AT command that is not tied to a stored parameter.
    ExecuteCommand {
        #[serde(default, alias = "address64", skip_serializing_if = "Option::is_none")]
        address: Option<Address64>,
        at_command: AtCommand,
        #[serde(default)]
        value: Option<Payload>,
        #[serde(default = "default_apply_changes")]
        apply_changes: bool,
    },
    /// Hold the worker for `time` seconds. Diagnostic only.
    Wait { time: f64 },
}

impl Request {
    /// Parse and validate a request object received from a client.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] for unknown operations, missing or
    /// ill-typed fields, and out-of-range values.
    pub fn from_value(value: Value) -> Result<Self, GatewayError> {
        if !value.is_object() {
            return Err(GatewayError::Validation(
                "request must be a JSON object".to_string(),
            ));
        }
        let request: Request =
            serde_json::from_value(value).map_err(|e| GatewayError::Validation(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    /// Checks that serde cannot express on its own.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if let Request::Wait { time } = self
            && (!time.is_finite() || *time < 0.0 || *time > MAX_WAIT_SECS)
        {
            return Err(GatewayError::Validation(format!(
                "wait time must be between 0 and {MAX_WAIT_SECS} seconds, got {time}"
            )));
        }
        Ok(())
    }

    /// Wire name of the operation.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::Discover => "discover",
            Request::Send { .. } => "send",
            Request::GetParameter { .. } => "get_parameter",
            Request::SetParameter { .. } => "set_parameter",
            Request::ExecuteCommand { .. } => "execute_command",
            Request::Wait { .. } => "wait",
        }
    }
}

/// Best-effort extraction of the `op` field from a request that failed
/// validation, so the error response can still echo it.
pub fn op_hint(value: &Value) -> Option<String> {
    value.get("op").and_then(Value::as_str).map(str::to_string)
}

// ────────────────────────────────────────────────────────────────────────────
// Discovery
// ────────────────────────────────────────────────────────────────────────────

/// Mesh role reported by a node during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Router,
    EndDevice,
    Unknown,
}

impl Role {
    /// Map the `DEVICE_TYPE` byte of a node-discovery reply.
    pub fn from_device_type(raw: u8) -> Self {
        match raw {
            0 => Role::Coordinator,
            1 => Role::Router,
            2 => Role::EndDevice,
            _ => Role::Unknown,
        }
    }
}

/// One node that answered a discovery broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    #[serde(alias = "address64")]
    pub address: Address64,
    pub address16: Address16,
    /// Node identifier string (`NI`).
    pub id: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub devices: Vec<DiscoveredDevice>,
}

// ────────────────────────────────────────────────────────────────────────────
// Command output
// ────────────────────────────────────────────────────────────────────────────

/// Successful result of one command, as produced by the device worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandOutput {
    Discovery(DiscoveryResult),
    /// Result of `get_parameter` / `execute_command`.
    Parameter { value: Option<Payload> },
    Waited { time: f64 },
    /// `send` and `set_parameter` carry no data.
    Done {},
}

impl CommandOutput {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Response
// ────────────────────────────────────────────────────────────────────────────

/// Reply written back to a request/response client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op: Option<String>,
        result: Value,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op: Option<String>,
        code: ErrorCode,
        error: String,
    },
}

impl Response {
    pub fn ok(op: Option<&str>, output: &CommandOutput) -> Self {
        Response::Ok {
            op: op.map(str::to_string),
            result: output.to_value(),
        }
    }

    pub fn error(op: Option<&str>, err: &GatewayError) -> Self {
        Response::Error {
            op: op.map(str::to_string),
            code: err.code(),
            error: err.to_string(),
        }
    }

    pub fn from_result(op: &str, result: &Result<CommandOutput, GatewayError>) -> Self {
        match result {
            Ok(output) => Response::ok(Some(op), output),
            Err(err) => Response::error(Some(op), err),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_every_operation() {
        let cases = [
            (json!({"op": "discover"}), "discover"),
            (
                json!({"op": "send", "address": "0013A200418D05FC", "message": "aGk="}),
                "send",
            ),
            (
                json!({"op": "get_parameter", "at_command": "NI"}),
                "get_parameter",
            ),
            (
                json!({"op": "set_parameter", "address64": "0013A200418D05FC",
                       "at_command": "D4", "value": "BQ==", "apply_changes": false}),
                "set_parameter",
            ),
            (
                json!({"op": "execute_command", "at_command": "AC"}),
                "execute_command",
            ),
            (json!({"op": "wait", "time": 1.5}), "wait"),
        ];
        for (value, op) in cases {
            let request = Request::from_value(value).unwrap();
            assert_eq!(request.op_name(), op);
        }
    }

    #[test]
    fn set_parameter_defaults_to_applying_changes() {
        let request = Request::from_value(json!({
            "op": "set_parameter", "at_command": "NI", "value": "Tk9ERQ=="
        }))
        .unwrap();
        match request {
            Request::SetParameter {
                address,
                apply_changes,
                value,
                ..
            } => {
                assert!(address.is_none());
                assert!(apply_changes);
                assert_eq!(value.as_bytes(), b"NODE");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn unknown_op_is_a_validation_error() {
        let err = Request::from_value(json!({"op": "reboot_everything"})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[test]
    fn bad_fields_are_validation_errors() {
        let bad = [
            json!({"op": "send", "address": "nothex", "message": "aGk="}),
            json!({"op": "send", "address": "0013A200418D05FC", "message": "***"}),
            json!({"op": "send", "address": "0013A200418D05FC"}),
            json!({"op": "get_parameter", "at_command": "TOOLONG"}),
            json!({"op": "wait", "time": -1.0}),
            json!({"op": "wait", "time": "soon"}),
            json!({"name": "discover"}),
            json!(["op", "discover"]),
        ];
        for value in bad {
            let err = Request::from_value(value.clone()).unwrap_err();
            assert_eq!(err.code(), ErrorCode::Validation, "accepted {value}");
        }
    }

    #[test]
    fn op_hint_reads_op_even_when_invalid() {
        assert_eq!(op_hint(&json!({"op": "nope"})), Some("nope".to_string()));
        assert_eq!(op_hint(&json!({"name": "discover"})), None);
    }

    #[test]
    fn ok_response_shape() {
        let output = CommandOutput::Waited { time: 2.0 };
        let value = serde_json::to_value(Response::ok(Some("wait"), &output)).unwrap();
        assert_eq!(
            value,
            json!({"status": "ok", "op": "wait", "result": {"time": 2.0}})
        );
    }

    #[test]
    fn done_output_serializes_as_empty_object() {
        assert_eq!(CommandOutput::Done {}.to_value(), json!({}));
    }

    #[test]
    fn error_response_shape() {
        let err = GatewayError::timeout(std::time::Duration::from_secs(25));
        let value = serde_json::to_value(Response::error(Some("discover"), &err)).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], "timeout");
        assert_eq!(value["op"], "discover");
        assert!(value["error"].as_str().unwrap().contains("25000 ms"));
    }

    #[test]
    fn discovery_output_lists_devices() {
        let output = CommandOutput::Discovery(DiscoveryResult {
            devices: vec![DiscoveredDevice {
                address: "0013A200418D05FC".parse().unwrap(),
                address16: Address16::new(0x1234),
                id: "ROUTER1".to_string(),
                role: Role::Router,
            }],
        });
        assert_eq!(
            output.to_value(),
            json!({"devices": [{
                "address": "0013A200418D05FC",
                "address16": "1234",
                "id": "ROUTER1",
                "role": "router"
            }]})
        );
    }

    #[test]
    fn response_roundtrips_for_clients() {
        let response = Response::error(Some("send"), &GatewayError::Unavailable);
        let json = serde_json::to_string(&response).unwrap();
        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
        assert!(!back.is_ok());
    }
}
