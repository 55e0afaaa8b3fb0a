//! XBee API frame codec (API mode 1, no byte escaping).
//!
//! ```text
//! 0x7E | length (u16, big-endian) | frame data | checksum
//! ```
//!
//! The checksum is `0xFF - (sum of frame data bytes & 0xFF)`. The first byte
//! of the frame data is the frame type:
//!
//! | Type | Frame | Direction |
//! |---|---|---|
//! | `0x08` / `0x09` | Local AT command (apply / queue) | host → radio |
//! | `0x10` | Transmit request | host → radio |
//! | `0x17` | Remote AT command | host → radio |
//! | `0x88` | Local AT response | radio → host |
//! | `0x8A` | Modem status | radio → host |
//! | `0x8B` | Transmit status | radio → host |
//! | `0x90` | Receive packet | radio → host |
//! | `0x97` | Remote AT response | radio → host |

use meshgate_types::{Address16, Address64, AtCommand, DiscoveredDevice, Role};
use thiserror::Error;
use tracing::debug;

pub const START_DELIMITER: u8 = 0x7E;

/// Largest frame-data length the decoder will wait for. Anything larger is
/// treated as line noise.
pub const MAX_FRAME_DATA: usize = 512;

pub mod frame_type {
    pub const AT_COMMAND: u8 = 0x08;
    pub const AT_COMMAND_QUEUED: u8 = 0x09;
    pub const TRANSMIT_REQUEST: u8 = 0x10;
    pub const REMOTE_AT_COMMAND: u8 = 0x17;
    pub const AT_RESPONSE: u8 = 0x88;
    pub const MODEM_STATUS: u8 = 0x8A;
    pub const TRANSMIT_STATUS: u8 = 0x8B;
    pub const RECEIVE_PACKET: u8 = 0x90;
    pub const REMOTE_AT_RESPONSE: u8 = 0x97;
}

/// Remote AT option bit: apply the change immediately.
const REMOTE_APPLY_CHANGES: u8 = 0x02;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,

    #[error("frame type 0x{frame_type:02X} truncated at {len} bytes")]
    Truncated { frame_type: u8, len: usize },

    #[error("invalid AT command bytes {0:02X?}")]
    BadCommand([u8; 2]),

    #[error("frame data of {0} bytes does not fit in one frame")]
    TooLarge(usize),
}

/// One decoded API frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiFrame {
    AtCommand {
        frame_id: u8,
        command: AtCommand,
        parameter: Vec<u8>,
        /// `true` = `0x09`: store the value without applying it.
        queued: bool,
    },
    TransmitRequest {
        frame_id: u8,
        destination: Address64,
        data: Vec<u8>,
    },
    RemoteAtCommand {
        frame_id: u8,
        destination: Address64,
        command: AtCommand,
        parameter: Vec<u8>,
        apply: bool,
    },
    AtResponse {
        frame_id: u8,
        command: AtCommand,
        status: u8,
        data: Vec<u8>,
    },
    ModemStatus(u8),
    TransmitStatus {
        frame_id: u8,
        destination16: Address16,
        retries: u8,
        delivery: u8,
        discovery: u8,
    },
    Receive {
        source: Address64,
        source16: Address16,
        options: u8,
        data: Vec<u8>,
    },
    RemoteAtResponse {
        frame_id: u8,
        source: Address64,
        source16: Address16,
        command: AtCommand,
        status: u8,
        data: Vec<u8>,
    },
    /// A frame type this driver does not interpret.
    Other { frame_type: u8, data: Vec<u8> },
}

impl ApiFrame {
    /// Frame id used to correlate a reply with its request, if the frame
    /// carries one.
    pub fn frame_id(&self) -> Option<u8> {
        match self {
            ApiFrame::AtCommand { frame_id, .. }
            | ApiFrame::TransmitRequest { frame_id, .. }
            | ApiFrame::RemoteAtCommand { frame_id, .. }
            | ApiFrame::AtResponse { frame_id, .. }
            | ApiFrame::TransmitStatus { frame_id, .. }
            | ApiFrame::RemoteAtResponse { frame_id, .. } => Some(*frame_id),
            ApiFrame::ModemStatus(_) | ApiFrame::Receive { .. } | ApiFrame::Other { .. } => None,
        }
    }

    /// Parse the frame data (type byte onwards, no delimiter/length/checksum).
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let (&ty, _) = data.split_first().ok_or(CodecError::Empty)?;
        let need = |n: usize| {
            if data.len() < n {
                Err(CodecError::Truncated {
                    frame_type: ty,
                    len: data.len(),
                })
            } else {
                Ok(())
            }
        };

        let frame = match ty {
            frame_type::AT_COMMAND | frame_type::AT_COMMAND_QUEUED => {
                need(4)?;
                ApiFrame::AtCommand {
                    frame_id: data[1],
                    command: at_command(&data[2..4])?,
                    parameter: data[4..].to_vec(),
                    queued: ty == frame_type::AT_COMMAND_QUEUED,
                }
            }
            frame_type::TRANSMIT_REQUEST => {
                need(14)?;
                ApiFrame::TransmitRequest {
                    frame_id: data[1],
                    destination: address64(&data[2..10]),
                    data: data[14..].to_vec(),
                }
            }
            frame_type::REMOTE_AT_COMMAND => {
                need(15)?;
                ApiFrame::RemoteAtCommand {
                    frame_id: data[1],
                    destination: address64(&data[2..10]),
                    apply: data[12] & REMOTE_APPLY_CHANGES != 0,
                    command: at_command(&data[13..15])?,
                    parameter: data[15..].to_vec(),
                }
            }
            frame_type::AT_RESPONSE => {
                need(5)?;
                ApiFrame::AtResponse {
                    frame_id: data[1],
                    command: at_command(&data[2..4])?,
                    status: data[4],
                    data: data[5..].to_vec(),
                }
            }
            frame_type::MODEM_STATUS => {
                need(2)?;
                ApiFrame::ModemStatus(data[1])
            }
            frame_type::TRANSMIT_STATUS => {
                need(7)?;
                ApiFrame::TransmitStatus {
                    frame_id: data[1],
                    destination16: address16(&data[2..4]),
                    retries: data[4],
                    delivery: data[5],
                    discovery: data[6],
                }
            }
            frame_type::RECEIVE_PACKET => {
                need(12)?;
                ApiFrame::Receive {
                    source: address64(&data[1..9]),
                    source16: address16(&data[9..11]),
                    options: data[11],
                    data: data[12..].to_vec(),
                }
            }
            frame_type::REMOTE_AT_RESPONSE => {
                need(15)?;
                ApiFrame::RemoteAtResponse {
                    frame_id: data[1],
                    source: address64(&data[2..10]),
                    source16: address16(&data[10..12]),
                    command: at_command(&data[12..14])?,
                    status: data[14],
                    data: data[15..].to_vec(),
                }
            }
            _ => ApiFrame::Other {
                frame_type: ty,
                data: data[1..].to_vec(),
            },
        };
        Ok(frame)
    }

    /// Serialize into frame data (type byte onwards).
    pub fn to_frame_data(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ApiFrame::AtCommand {
                frame_id,
                command,
                parameter,
                queued,
            } => {
                out.push(if *queued {
                    frame_type::AT_COMMAND_QUEUED
                } else {
                    frame_type::AT_COMMAND
                });
                out.push(*frame_id);
                out.extend_from_slice(&command.as_bytes());
                out.extend_from_slice(parameter);
            }
            ApiFrame::TransmitRequest {
                frame_id,
                destination,
                data,
            } => {
                out.extend_from_slice(&[frame_type::TRANSMIT_REQUEST, *frame_id]);
                out.extend_from_slice(&destination.to_be_bytes());
                out.extend_from_slice(&Address16::UNKNOWN.to_be_bytes());
                // broadcast radius (0 = network maximum), options
                out.extend_from_slice(&[0x00, 0x00]);
                out.extend_from_slice(data);
            }
            ApiFrame::RemoteAtCommand {
                frame_id,
                destination,
                command,
                parameter,
                apply,
            } => {
                out.extend_from_slice(&[frame_type::REMOTE_AT_COMMAND, *frame_id]);
                out.extend_from_slice(&destination.to_be_bytes());
                out.extend_from_slice(&Address16::UNKNOWN.to_be_bytes());
                out.push(if *apply { REMOTE_APPLY_CHANGES } else { 0 });
                out.extend_from_slice(&command.as_bytes());
                out.extend_from_slice(parameter);
            }
            ApiFrame::AtResponse {
                frame_id,
                command,
                status,
                data,
            } => {
                out.extend_from_slice(&[frame_type::AT_RESPONSE, *frame_id]);
                out.extend_from_slice(&command.as_bytes());
                out.push(*status);
                out.extend_from_slice(data);
            }
            ApiFrame::ModemStatus(status) => {
                out.extend_from_slice(&[frame_type::MODEM_STATUS, *status]);
            }
            ApiFrame::TransmitStatus {
                frame_id,
                destination16,
                retries,
                delivery,
                discovery,
            } => {
                out.extend_from_slice(&[frame_type::TRANSMIT_STATUS, *frame_id]);
                out.extend_from_slice(&destination16.to_be_bytes());
                out.extend_from_slice(&[*retries, *delivery, *discovery]);
            }
            ApiFrame::Receive {
                source,
                source16,
                options,
                data,
            } => {
                out.push(frame_type::RECEIVE_PACKET);
                out.extend_from_slice(&source.to_be_bytes());
                out.extend_from_slice(&source16.to_be_bytes());
                out.push(*options);
                out.extend_from_slice(data);
            }
            ApiFrame::RemoteAtResponse {
                frame_id,
                source,
                source16,
                command,
                status,
                data,
            } => {
                out.extend_from_slice(&[frame_type::REMOTE_AT_RESPONSE, *frame_id]);
                out.extend_from_slice(&source.to_be_bytes());
                out.extend_from_slice(&source16.to_be_bytes());
                out.extend_from_slice(&command.as_bytes());
                out.push(*status);
                out.extend_from_slice(data);
            }
            ApiFrame::Other { frame_type, data } => {
                out.push(*frame_type);
                out.extend_from_slice(data);
            }
        }
        out
    }

    /// Serialize into a complete wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        wrap(&self.to_frame_data())
    }
}

/// Checksum over frame data.
pub fn checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0xFF - sum
}

/// Add delimiter, length and checksum around `data`.
pub fn wrap(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.is_empty() {
        return Err(CodecError::Empty);
    }
    if data.len() > MAX_FRAME_DATA {
        return Err(CodecError::TooLarge(data.len()));
    }
    let len = u16::try_from(data.len()).map_err(|_| CodecError::TooLarge(data.len()))?;
    let mut out = Vec::with_capacity(data.len() + 4);
    out.push(START_DELIMITER);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    out.push(checksum(data));
    Ok(out)
}

fn address64(bytes: &[u8]) -> Address64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    Address64::from_be_bytes(raw)
}

fn address16(bytes: &[u8]) -> Address16 {
    Address16::new(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn at_command(bytes: &[u8]) -> Result<AtCommand, CodecError> {
    let raw = [bytes[0], bytes[1]];
    AtCommand::from_bytes(raw).map_err(|_| CodecError::BadCommand(raw))
}

// ────────────────────────────────────────────────────────────────────────────
// Stream decoder
// ────────────────────────────────────────────────────────────────────────────

/// Incremental decoder for the radio's byte stream.
///
/// Bytes may arrive in arbitrary chunks. Noise before a start delimiter and
/// frames with a bad checksum are skipped; the decoder resynchronises on the
/// next `0x7E`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    discarded: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes dropped so far while resynchronising.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Option<ApiFrame> {
        loop {
            match self.buf.iter().position(|&b| b == START_DELIMITER) {
                None => {
                    self.skip(self.buf.len());
                    return None;
                }
                Some(0) => {}
                Some(offset) => self.skip(offset),
            }

            if self.buf.len() < 3 {
                return None;
            }
            let len = usize::from(u16::from_be_bytes([self.buf[1], self.buf[2]]));
            if len == 0 || len > MAX_FRAME_DATA {
                self.skip(1);
                continue;
            }
            if self.buf.len() < len + 4 {
                return None;
            }

            let data = &self.buf[3..3 + len];
            if checksum(data) != self.buf[3 + len] {
                debug!(frame_type = data[0], "API frame with bad checksum skipped");
                self.skip(1);
                continue;
            }
            let parsed = ApiFrame::parse(data);
            self.buf.drain(..len + 4);
            match parsed {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    debug!(error = %e, "undecodable API frame dropped");
                    self.discarded += len + 4;
                }
            }
        }
    }

    fn skip(&mut self, n: usize) {
        self.buf.drain(..n);
        self.discarded += n;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Node discovery payload
// ────────────────────────────────────────────────────────────────────────────

// MY(2) SH(4) SL(4) NI(..)\0 PARENT(2) DEVICE_TYPE(1) STATUS(1) PROFILE(2) MANUFACTURER(2)
const ND_PROFILE_ID: [u8; 2] = [0xC1, 0x05];
const ND_MANUFACTURER_ID: [u8; 2] = [0x10, 0x1E];

/// Parse the data of one `ND` reply.
pub fn parse_node_discovery(data: &[u8]) -> Result<DiscoveredDevice, CodecError> {
    let truncated = CodecError::Truncated {
        frame_type: frame_type::AT_RESPONSE,
        len: data.len(),
    };
    if data.len() < 11 {
        return Err(truncated);
    }
    let address16 = address16(&data[0..2]);
    let address = address64(&data[2..10]);

    let rest = &data[10..];
    let nul = rest.iter().position(|&b| b == 0).ok_or(truncated)?;
    let id = String::from_utf8_lossy(&rest[..nul]).trim().to_string();
    let role = rest
        .get(nul + 1 + 2)
        .map_or(Role::Unknown, |&raw| Role::from_device_type(raw));

    Ok(DiscoveredDevice {
        address,
        address16,
        id,
        role,
    })
}

/// Build the data of one `ND` reply, as a radio would report `device`.
pub fn encode_node_discovery(device: &DiscoveredDevice) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&device.address16.to_be_bytes());
    out.extend_from_slice(&device.address.to_be_bytes());
    out.extend_from_slice(device.id.as_bytes());
    out.push(0);
    out.extend_from_slice(&Address16::UNKNOWN.to_be_bytes());
    out.push(match device.role {
        Role::Coordinator => 0,
        Role::Router => 1,
        Role::EndDevice => 2,
        Role::Unknown => 0xFF,
    });
    out.push(0);
    out.extend_from_slice(&ND_PROFILE_ID);
    out.extend_from_slice(&ND_MANUFACTURER_ID);
    out
}

// ────────────────────────────────────────────────────────────────────────────
// Status codes
// ────────────────────────────────────────────────────────────────────────────

pub fn at_status_text(status: u8) -> &'static str {
    match status {
        0 => "OK",
        1 => "ERROR",
        2 => "invalid command",
        3 => "invalid parameter",
        4 => "transmission failure",
        _ => "unknown status",
    }
}

pub fn delivery_status_text(status: u8) -> &'static str {
    match status {
        0x00 => "success",
        0x01 => "MAC ACK failure",
        0x02 => "CCA failure",
        0x15 => "invalid destination endpoint",
        0x21 => "network ACK failure",
        0x22 => "not joined to network",
        0x23 => "self-addressed",
        0x24 => "address not found",
        0x25 => "route not found",
        0x74 => "payload too large",
        _ => "unknown delivery status",
    }
}

pub fn modem_status_text(status: u8) -> &'static str {
    match status {
        0x00 => "hardware reset",
        0x01 => "watchdog timer reset",
        0x02 => "joined network",
        0x03 => "disassociated",
        0x06 => "coordinator started",
        0x07 => "network security key updated",
        0x0B => "network woke up",
        0x0C => "network went to sleep",
        0x0D => "voltage supply limit exceeded",
        0x11 => "modem configuration changed while join in progress",
        _ => "unknown modem status",
    }
}
