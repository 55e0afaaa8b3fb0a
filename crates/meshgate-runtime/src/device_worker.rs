//! [`DeviceWorker`] – the only task that talks to the radio.
//!
//! Lifecycle:
//!
//! 1. **Startup** – open the radio and run its handshake. The outcome is
//!    published through [`StartupStatus`] (always, even if the task dies)
//!    and as a `status` notification. A failed startup is terminal.
//! 2. **Serve** – pop commands from the [`CommandReceiver`] strictly in
//!    order, run each against the radio and answer it exactly once. A failing
//!    command never stops the loop.
//! 3. **Shutdown** – once every queue producer is gone the radio is closed.
//!
//! Unsolicited radio traffic is moved to the notify queue by a separate
//! forwarding task, so it never waits behind a slow command.
//!
//! # Discovery windows
//!
//! `discover` broadcasts a node discovery and collects replies until
//! `device_timeout` elapses. Each broadcast has its own session tag; replies
//! carrying another tag arrived too late for an earlier window and are
//! dropped, so they can never show up in a later result.

use std::collections::HashSet;
use std::time::Duration;

use meshgate_hal::frame::modem_status_text;
use meshgate_hal::{DiscoveryReply, Radio, RadioEvent, RadioStreams};
use meshgate_middleware::{CommandReceiver, CommandResult, NotifyQueue};
use meshgate_types::{
    Address64, CommandOutput, DiscoveryResult, GatewayError, LinkState, NotifyEvent, Request,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Default discovery window.
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a discovery window stays open.
    pub device_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            device_timeout: DEFAULT_DEVICE_TIMEOUT,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Startup status
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Failed,
}

/// Read side of the worker's startup outcome. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StartupStatus {
    rx: watch::Receiver<SessionState>,
}

impl StartupStatus {
    pub fn state(&self) -> SessionState {
        *self.rx.borrow()
    }

    pub fn startup_finished(&self) -> bool {
        self.state() != SessionState::Connecting
    }

    pub fn startup_successful(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Wait until startup has finished and return the outcome.
    pub async fn wait_finished(&mut self) -> SessionState {
        match self
            .rx
            .wait_for(|state| *state != SessionState::Connecting)
            .await
        {
            Ok(state) => *state,
            Err(_) => SessionState::Failed,
        }
    }
}

/// Write side. Dropping it before startup finished records a failure, so a
/// panicking worker still reports.
struct StartupReporter(watch::Sender<SessionState>);

impl StartupReporter {
    fn channel() -> (Self, StartupStatus) {
        let (tx, rx) = watch::channel(SessionState::Connecting);
        (Self(tx), StartupStatus { rx })
    }

    fn finish(&self, state: SessionState) {
        self.0.send_replace(state);
    }
}

impl Drop for StartupReporter {
    fn drop(&mut self) {
        self.0.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Failed;
                true
            } else {
                false
            }
        });
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Worker
// ────────────────────────────────────────────────────────────────────────────

/// Sole consumer of the command queue and sole owner of the radio.
pub struct DeviceWorker {
    radio: Box<dyn Radio>,
    commands: CommandReceiver,
    notify: NotifyQueue,
    config: WorkerConfig,
}

impl DeviceWorker {
    pub fn new(radio: Box<dyn Radio>, commands: CommandReceiver, notify: NotifyQueue) -> Self {
        Self {
            radio,
            commands,
            notify,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the worker task. Startup runs inside the task; watch the
    /// returned [`StartupStatus`] for its outcome.
    pub fn spawn(self) -> (StartupStatus, JoinHandle<()>) {
        let (reporter, status) = StartupReporter::channel();
        let task = tokio::spawn(self.run(reporter));
        (status, task)
    }

    async fn run(mut self, startup: StartupReporter) {
        let kind = self.radio.kind();
        let streams = match self.radio.open().await {
            Ok(streams) => streams,
            Err(e) => {
                error!(radio = kind, error = %e, "radio startup failed");
                self.notify
                    .publish(NotifyEvent::status(None, LinkState::Failed, e.to_string()));
                startup.finish(SessionState::Failed);
                return;
            }
        };
        let RadioStreams {
            info,
            events,
            discovery,
        } = streams;

        let forwarder = tokio::spawn(forward_inbound(events, self.notify.clone(), info.address));
        self.notify.publish(NotifyEvent::status(
            Some(info.address),
            LinkState::Ready,
            format!("{kind} radio '{}' ready", info.node_id),
        ));
        startup.finish(SessionState::Ready);
        info!(radio = kind, address = %info.address, node_id = %info.node_id, "device worker ready");

        let mut session = Session {
            radio: self.radio,
            discovery,
            notify: self.notify,
            device_timeout: self.config.device_timeout,
        };

        while let Some(command) = self.commands.pop().await {
            let span = info_span!("command", id = %command.id(), op = command.request().op_name());
            if command.is_abandoned() {
                debug!(parent: &span, "requester already gone; executing anyway");
            }
            let result = session.execute(command.request()).instrument(span.clone()).await;
            match &result {
                Ok(_) => debug!(parent: &span, elapsed_ms = command.age().as_millis() as u64, "command done"),
                Err(e) => warn!(parent: &span, error = %e, "command failed"),
            }
            command.respond(result);
        }

        info!("command queue closed; device worker stopping");
        forwarder.abort();
        session.radio.close().await;
    }
}

/// Radio state owned by the serve loop.
struct Session {
    radio: Box<dyn Radio>,
    discovery: mpsc::UnboundedReceiver<DiscoveryReply>,
    notify: NotifyQueue,
    device_timeout: Duration,
}

impl Session {
    async fn execute(&mut self, request: &Request) -> CommandResult {
        match request {
            Request::Discover => self.discover().await,
            Request::Send { address, message } => {
                self.radio.send_data(*address, message.as_bytes()).await?;
                Ok(CommandOutput::Done {})
            }
            Request::GetParameter {
                address,
                at_command,
            } => {
                let value = self.radio.get_parameter(*address, *at_command).await?;
                Ok(CommandOutput::Parameter { value: Some(value) })
            }
            Request::SetParameter {
                address,
                at_command,
                value,
                apply_changes,
            } => {
                self.radio
                    .set_parameter(*address, *at_command, value.as_bytes(), *apply_changes)
                    .await?;
                Ok(CommandOutput::Done {})
            }
            Request::ExecuteCommand {
                address,
                at_command,
                value,
                apply_changes,
            } => {
                let value = self
                    .radio
                    .execute_command(
                        *address,
                        *at_command,
                        value.as_ref().map(|v| v.as_bytes()),
                        *apply_changes,
                    )
                    .await?;
                Ok(CommandOutput::Parameter { value })
            }
            Request::Wait { time } => {
                let pause = Duration::try_from_secs_f64(*time)
                    .map_err(|e| GatewayError::Validation(format!("wait time {time}: {e}")))?;
                tokio::time::sleep(pause).await;
                Ok(CommandOutput::Waited { time: *time })
            }
        }
    }

    async fn discover(&mut self) -> CommandResult {
        let mut stale = 0usize;
        while self.discovery.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "dropped discovery replies from earlier windows");
        }

        let session = self.radio.start_discovery().await?;
        let deadline = Instant::now() + self.device_timeout;
        let mut seen = HashSet::new();
        let mut devices = Vec::new();

        loop {
            let reply = match tokio::time::timeout_at(deadline, self.discovery.recv()).await {
                Err(_) => break,
                Ok(None) => {
                    return Err(GatewayError::hardware(
                        "discover",
                        "radio link closed during discovery",
                    ));
                }
                Ok(Some(reply)) => reply,
            };
            if reply.session != session {
                debug!(session = reply.session, current = session, "late discovery reply dropped");
                continue;
            }
            if !seen.insert(reply.device.address) {
                continue;
            }
            debug!(address = %reply.device.address, node_id = %reply.device.id, "device discovered");
            self.notify.publish(NotifyEvent::discovery(&reply.device));
            devices.push(reply.device);
        }

        info!(session, found = devices.len(), "discovery window closed");
        Ok(CommandOutput::Discovery(DiscoveryResult { devices }))
    }
}

async fn forward_inbound(
    mut events: mpsc::UnboundedReceiver<RadioEvent>,
    notify: NotifyQueue,
    local: Address64,
) {
    while let Some(event) = events.recv().await {
        let note = match event {
            RadioEvent::Received { from, data } => NotifyEvent::received(from, data),
            RadioEvent::ModemStatus(status) => {
                NotifyEvent::status(Some(local), LinkState::Modem, modem_status_text(status))
            }
        };
        if !notify.publish(note) {
            debug!("notify queue closed; inbound forwarder stopping");
            break;
        }
    }
}
