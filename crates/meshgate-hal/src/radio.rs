//! The [`Radio`] trait – everything the device worker needs from a mesh
//! radio.
//!
//! A radio is owned by exactly one task. Every method takes `&mut self`, so
//! outbound traffic is serialised by ownership rather than by a lock.
//! Inbound traffic that nobody asked for (data from remote nodes, modem
//! status changes, discovery replies) is delivered through the channels in
//! [`RadioStreams`], which the radio hands out once when it is opened.

use async_trait::async_trait;
use meshgate_types::{Address64, AtCommand, DiscoveredDevice, GatewayError, Payload};
use tokio::sync::mpsc;

/// Identity of the local radio, learned during the startup handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioInfo {
    pub address: Address64,
    pub node_id: String,
}

/// Unsolicited traffic from the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    Received { from: Address64, data: Vec<u8> },
    ModemStatus(u8),
}

/// Identifies one discovery broadcast. Replies carry the tag of the
/// broadcast that triggered them.
pub type DiscoverySession = u8;

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryReply {
    pub session: DiscoverySession,
    pub device: DiscoveredDevice,
}

/// Handed out by [`Radio::open`].
#[derive(Debug)]
pub struct RadioStreams {
    pub info: RadioInfo,
    pub events: mpsc::UnboundedReceiver<RadioEvent>,
    pub discovery: mpsc::UnboundedReceiver<DiscoveryReply>,
}

/// A mesh radio driver.
///
/// `target = None` addresses the local radio; `Some(address)` sends the AT
/// command over the air to a remote node.
#[async_trait]
pub trait Radio: Send {
    /// Short name used in logs, e.g. `"xbee"` or `"sim"`.
    fn kind(&self) -> &'static str;

    /// Open the link and run the startup handshake. Called once.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Startup`] when the link cannot be opened or the
    /// radio does not identify itself.
    async fn open(&mut self) -> Result<RadioStreams, GatewayError>;

    async fn get_parameter(
        &mut self,
        target: Option<Address64>,
        command: AtCommand,
    ) -> Result<Payload, GatewayError>;

    async fn set_parameter(
        &mut self,
        target: Option<Address64>,
        command: AtCommand,
        value: &[u8],
        apply_changes: bool,
    ) -> Result<(), GatewayError>;

    /// Run an AT command, returning its response data if it produced any.
    async fn execute_command(
        &mut self,
        target: Option<Address64>,
        command: AtCommand,
        value: Option<&[u8]>,
        apply_changes: bool,
    ) -> Result<Option<Payload>, GatewayError>;

    /// Transmit `data` to a remote node and wait for the delivery report.
    async fn send_data(&mut self, to: Address64, data: &[u8]) -> Result<(), GatewayError>;

    /// Broadcast a node discovery. Replies arrive on
    /// [`RadioStreams::discovery`] tagged with the returned session.
    async fn start_discovery(&mut self) -> Result<DiscoverySession, GatewayError>;

    /// Release the link. Pending replies are abandoned.
    async fn close(&mut self);
}
