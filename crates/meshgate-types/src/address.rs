//! Radio-level identifiers: 64-bit extended addresses, 16-bit network
//! addresses, two-letter AT command names and raw payloads.
//!
//! All four travel over the wire as strings (hex for addresses, base64 for
//! payloads) and are validated while deserializing, so a request that reaches
//! the command queue is already well-formed.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::GatewayError;

// ────────────────────────────────────────────────────────────────────────────
// Address64
// ────────────────────────────────────────────────────────────────────────────

/// IEEE 64-bit extended address of a mesh node, written as 16 hex digits
/// (e.g. `0013A200418D05FC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address64(u64);

impl Address64 {
    /// Address of the network coordinator.
    pub const COORDINATOR: Address64 = Address64(0);
    /// Broadcast address understood by every node in the mesh.
    pub const BROADCAST: Address64 = Address64(0xFFFF);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Address64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl FromStr for Address64 {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim();
        let digits = digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
            .unwrap_or(digits);
        if digits.len() != 16 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(GatewayError::Validation(format!(
                "'{s}' is not a 64-bit address (expected 16 hex digits)"
            )));
        }
        u64::from_str_radix(digits, 16)
            .map(Address64)
            .map_err(|e| GatewayError::Validation(format!("'{s}': {e}")))
    }
}

impl Serialize for Address64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Address16
// ────────────────────────────────────────────────────────────────────────────

/// 16-bit network address assigned to a node when it joins the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address16(u16);

impl Address16 {
    /// "Unknown" network address; the radio resolves it from the 64-bit one.
    pub const UNKNOWN: Address16 = Address16(0xFFFE);

    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Address16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for Address16 {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim();
        if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(GatewayError::Validation(format!(
                "'{s}' is not a 16-bit address (expected 4 hex digits)"
            )));
        }
        u16::from_str_radix(digits, 16)
            .map(Address16)
            .map_err(|e| GatewayError::Validation(format!("'{s}': {e}")))
    }
}

impl Serialize for Address16 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address16 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// AtCommand
// ────────────────────────────────────────────────────────────────────────────

/// Two-character AT command / parameter name such as `NI`, `D4` or `ND`.
///
/// Stored upper-cased; only ASCII letters and digits are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtCommand([u8; 2]);

impl AtCommand {
    /// Node Discover.
    pub const NODE_DISCOVER: AtCommand = AtCommand(*b"ND");
    /// Serial number, high 32 bits of the 64-bit address.
    pub const SERIAL_HIGH: AtCommand = AtCommand(*b"SH");
    /// Serial number, low 32 bits of the 64-bit address.
    pub const SERIAL_LOW: AtCommand = AtCommand(*b"SL");
    /// Node Identifier string.
    pub const NODE_IDENTIFIER: AtCommand = AtCommand(*b"NI");

    pub fn as_bytes(&self) -> [u8; 2] {
        self.0
    }

    /// Build from raw frame bytes, rejecting anything that is not
    /// alphanumeric ASCII.
    pub fn from_bytes(bytes: [u8; 2]) -> Result<Self, GatewayError> {
        if bytes.iter().all(u8::is_ascii_alphanumeric) {
            Ok(Self(bytes.map(|b| b.to_ascii_uppercase())))
        } else {
            Err(GatewayError::Validation(format!(
                "AT command {bytes:02X?} is not alphanumeric"
            )))
        }
    }
}

impl fmt::Display for AtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.0[0] as char, self.0[1] as char)
    }
}

impl FromStr for AtCommand {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.as_bytes() {
            [a, b] => Self::from_bytes([*a, *b]),
            _ => Err(GatewayError::Validation(format!(
                "'{s}' is not an AT command (expected two characters)"
            ))),
        }
    }
}

impl Serialize for AtCommand {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AtCommand {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Payload
// ────────────────────────────────────────────────────────────────────────────

/// Opaque bytes exchanged with the radio, base64-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, GatewayError> {
        BASE64
            .decode(encoded.trim())
            .map(Payload)
            .map_err(|e| GatewayError::Validation(format!("invalid base64 payload: {e}")))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Payload::from_base64(&raw).map_err(de::Error::custom)
    }
}
