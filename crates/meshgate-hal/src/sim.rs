//! In-process simulated radio for tests and hardware-free runs.
//!
//! [`SimRadio`] keeps an AT parameter store per node, records every
//! transmission, and answers discovery broadcasts from a script of
//! `(delay, device)` pairs. A [`SimHandle`] lets the test (or the demo mesh)
//! inject inbound traffic from outside.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use meshgate_hal::sim::SimRadio;
//! use meshgate_types::AtCommand;
//!
//! let radio = SimRadio::new()
//!     .with_latency(Duration::from_millis(5))
//!     .with_parameter(None, AtCommand::NODE_IDENTIFIER, b"BENCH".to_vec());
//! let handle = radio.handle();
//! # drop((radio, handle));
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use meshgate_types::{Address16, Address64, AtCommand, DiscoveredDevice, GatewayError, Payload, Role};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::radio::{DiscoveryReply, DiscoverySession, Radio, RadioEvent, RadioInfo, RadioStreams};

/// 64-bit address the simulated local radio reports.
pub const SIM_LOCAL_ADDRESS: Address64 = Address64::new(0x0013_A200_0000_0001);

#[derive(Debug, Default)]
struct SimState {
    parameters: HashMap<(Option<Address64>, AtCommand), Vec<u8>>,
    sent: Vec<(Address64, Vec<u8>)>,
    events: Option<mpsc::UnboundedSender<RadioEvent>>,
    discovery: Option<mpsc::UnboundedSender<DiscoveryReply>>,
    last_session: Option<DiscoverySession>,
}

#[derive(Debug, Clone, Default)]
struct Shared(Arc<Mutex<SimState>>);

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Simulated mesh radio.
#[derive(Debug)]
pub struct SimRadio {
    info: RadioInfo,
    latency: Duration,
    startup_failure: Option<String>,
    discovery_script: Vec<(Duration, DiscoveredDevice)>,
    unreachable: HashSet<Address64>,
    echo: bool,
    opened: bool,
    shared: Shared,
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRadio {
    /// A radio with no latency, no neighbours and `SH`/`SL`/`NI` set.
    pub fn new() -> Self {
        let info = RadioInfo {
            address: SIM_LOCAL_ADDRESS,
            node_id: "SIM-COORDINATOR".to_string(),
        };
        let shared = Shared::default();
        {
            let mut state = shared.lock();
            let raw = info.address.as_u64().to_be_bytes();
            state
                .parameters
                .insert((None, AtCommand::SERIAL_HIGH), raw[..4].to_vec());
            state
                .parameters
                .insert((None, AtCommand::SERIAL_LOW), raw[4..].to_vec());
            state.parameters.insert(
                (None, AtCommand::NODE_IDENTIFIER),
                info.node_id.as_bytes().to_vec(),
            );
        }
        Self {
            info,
            latency: Duration::ZERO,
            startup_failure: None,
            discovery_script: Vec::new(),
            unreachable: HashSet::new(),
            echo: false,
            opened: false,
            shared,
        }
    }

    /// A small mesh for trying the gateway without hardware: three nodes
    /// that answer discovery within two seconds and echo whatever is sent
    /// to them.
    pub fn demo() -> Self {
        let nodes = [
            (300, 0x0013_A200_4000_0011, 0x1A2B, "LIVING-ROOM", Role::Router),
            (800, 0x0013_A200_4000_0022, 0x3C4D, "GREENHOUSE", Role::EndDevice),
            (1500, 0x0013_A200_4000_0033, 0x5E6F, "GARAGE", Role::EndDevice),
        ];
        let mut radio = Self::new().with_echo(true);
        for (delay_ms, address, address16, id, role) in nodes {
            let device = DiscoveredDevice {
                address: Address64::new(address),
                address16: Address16::new(address16),
                id: id.to_string(),
                role,
            };
            radio = radio
                .with_parameter(
                    Some(device.address),
                    AtCommand::NODE_IDENTIFIER,
                    id.as_bytes().to_vec(),
                )
                .with_discovery_reply(Duration::from_millis(delay_ms), device);
        }
        radio
    }

    /// Delay applied to every parameter and transmit operation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Seed a parameter. `target = None` is the local radio.
    pub fn with_parameter(
        self,
        target: Option<Address64>,
        command: AtCommand,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        let key = (self.normalise(target), command);
        self.shared.lock().parameters.insert(key, value.into());
        self
    }

    /// Answer every discovery broadcast with `device` after `delay`.
    pub fn with_discovery_reply(mut self, delay: Duration, device: DiscoveredDevice) -> Self {
        self.discovery_script.push((delay, device));
        self
    }

    /// Make the startup handshake fail.
    pub fn failing_startup(mut self, reason: impl Into<String>) -> Self {
        self.startup_failure = Some(reason.into());
        self
    }

    /// Transmissions and remote AT commands to `address` fail.
    pub fn with_unreachable(mut self, address: Address64) -> Self {
        self.unreachable.insert(address);
        self
    }

    /// Every successful transmission is answered by the destination with the
    /// same data.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            shared: self.shared.clone(),
        }
    }

    fn normalise(&self, target: Option<Address64>) -> Option<Address64> {
        target.filter(|addr| *addr != self.info.address)
    }

    async fn reach(
        &self,
        operation: &str,
        target: Option<Address64>,
    ) -> Result<Option<Address64>, GatewayError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if !self.opened {
            return Err(GatewayError::hardware(operation, "radio link is not open"));
        }
        let target = self.normalise(target);
        match target {
            Some(addr) if self.unreachable.contains(&addr) => Err(GatewayError::hardware(
                operation,
                format!("delivery to {addr} failed: address not found"),
            )),
            _ => Ok(target),
        }
    }
}

#[async_trait]
impl Radio for SimRadio {
    fn kind(&self) -> &'static str {
        "sim"
    }

    async fn open(&mut self) -> Result<RadioStreams, GatewayError> {
        if self.opened {
            return Err(GatewayError::Startup(
                "radio link was already opened".to_string(),
            ));
        }
        if let Some(reason) = &self.startup_failure {
            return Err(GatewayError::Startup(reason.clone()));
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let (discovery_tx, discovery) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.lock();
            state.events = Some(events_tx);
            state.discovery = Some(discovery_tx);
        }
        self.opened = true;
        info!(address = %self.info.address, node_id = %self.info.node_id, "simulated radio ready");

        Ok(RadioStreams {
            info: self.info.clone(),
            events,
            discovery,
        })
    }

    async fn get_parameter(
        &mut self,
        target: Option<Address64>,
        command: AtCommand,
    ) -> Result<Payload, GatewayError> {
        let target = self.reach("get_parameter", target).await?;
        self.shared
            .lock()
            .parameters
            .get(&(target, command))
            .map(|value| Payload::from(value.clone()))
            .ok_or_else(|| {
                GatewayError::hardware("get_parameter", format!("{command} failed: invalid command"))
            })
    }

    async fn set_parameter(
        &mut self,
        target: Option<Address64>,
        command: AtCommand,
        value: &[u8],
        _apply_changes: bool,
    ) -> Result<(), GatewayError> {
        let target = self.reach("set_parameter", target).await?;
        self.shared
            .lock()
            .parameters
            .insert((target, command), value.to_vec());
        Ok(())
    }

    async fn execute_command(
        &mut self,
        target: Option<Address64>,
        command: AtCommand,
        value: Option<&[u8]>,
        _apply_changes: bool,
    ) -> Result<Option<Payload>, GatewayError> {
        let target = self.reach("execute_command", target).await?;
        let mut state = self.shared.lock();
        match value {
            Some(value) => {
                state.parameters.insert((target, command), value.to_vec());
                Ok(None)
            }
            None => Ok(state
                .parameters
                .get(&(target, command))
                .map(|value| Payload::from(value.clone()))),
        }
    }

    async fn send_data(&mut self, to: Address64, data: &[u8]) -> Result<(), GatewayError> {
        self.reach("send", Some(to)).await?;
        let mut state = self.shared.lock();
        state.sent.push((to, data.to_vec()));
        if self.echo
            && let Some(events) = &state.events
        {
            let _ = events.send(RadioEvent::Received {
                from: to,
                data: data.to_vec(),
            });
        }
        Ok(())
    }

    async fn start_discovery(&mut self) -> Result<DiscoverySession, GatewayError> {
        if !self.opened {
            return Err(GatewayError::hardware("discover", "radio link is not open"));
        }
        let (session, replies) = {
            let mut state = self.shared.lock();
            let session = match state.last_session {
                None | Some(u8::MAX) => 1,
                Some(prev) => prev + 1,
            };
            state.last_session = Some(session);
            (session, state.discovery.clone())
        };

        if let Some(replies) = replies {
            for (delay, device) in self.discovery_script.iter().cloned() {
                let replies = replies.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = replies.send(DiscoveryReply { session, device });
                });
            }
        }
        debug!(session, scripted = self.discovery_script.len(), "simulated discovery started");
        Ok(session)
    }

    async fn close(&mut self) {
        let mut state = self.shared.lock();
        state.events = None;
        state.discovery = None;
        self.opened = false;
    }
}

/// Outside view of a [`SimRadio`], usable after the radio has been moved
/// into the device worker.
#[derive(Debug, Clone)]
pub struct SimHandle {
    shared: Shared,
}

impl SimHandle {
    /// Deliver a packet as if `from` had transmitted it. Returns `false`
    /// when the radio is not open.
    pub fn inject_received(&self, from: Address64, data: impl Into<Vec<u8>>) -> bool {
        self.inject(RadioEvent::Received {
            from,
            data: data.into(),
        })
    }

    pub fn inject_modem_status(&self, status: u8) -> bool {
        self.inject(RadioEvent::ModemStatus(status))
    }

    /// Deliver a discovery reply tagged with an arbitrary session.
    pub fn inject_discovery_reply(
        &self,
        session: DiscoverySession,
        device: DiscoveredDevice,
    ) -> bool {
        self.shared
            .lock()
            .discovery
            .as_ref()
            .is_some_and(|tx| tx.send(DiscoveryReply { session, device }).is_ok())
    }

    /// Every transmission so far, oldest first.
    pub fn sent(&self) -> Vec<(Address64, Vec<u8>)> {
        self.shared.lock().sent.clone()
    }

    pub fn parameter(&self, target: Option<Address64>, command: AtCommand) -> Option<Vec<u8>> {
        self.shared.lock().parameters.get(&(target, command)).cloned()
    }

    pub fn last_session(&self) -> Option<DiscoverySession> {
        self.shared.lock().last_session
    }

    fn inject(&self, event: RadioEvent) -> bool {
        self.shared
            .lock()
            .events
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}
