//! [`XBeeRadio`] – driver for Digi XBee ZigBee modules in API mode 1.
//!
//! The link is split in two. Outbound frames are written by whoever owns the
//! radio (the device worker). A reader task decodes inbound frames and routes
//! them:
//!
//! - replies carrying a frame id go to the waiter registered under that id;
//! - `ND` replies go to the discovery channel, tagged with the id of the `ND`
//!   request (the discovery session);
//! - received packets and modem status go to the event channel.
//!
//! The serial port must already be configured (baud rate, raw mode), e.g.
//! `stty -F /dev/ttyUSB0 9600 raw -echo`, and the module set to `AP=1`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use meshgate_types::{Address64, AtCommand, GatewayError, Payload};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::frame::{
    ApiFrame, FrameDecoder, at_status_text, delivery_status_text, modem_status_text,
    parse_node_discovery,
};
use crate::radio::{DiscoveryReply, DiscoverySession, Radio, RadioEvent, RadioInfo, RadioStreams};

/// Default time to wait for the module to answer one frame.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Any full-duplex byte stream the radio can be reached through.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ByteStream for T {}

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where the module is attached.
pub enum Transport {
    /// A tty device such as `/dev/ttyUSB0`.
    Serial(PathBuf),
    /// A serial-over-TCP bridge (`ser2net` and similar), `host:port`.
    Tcp(String),
    /// An already connected stream.
    Stream(Box<dyn ByteStream>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Serial(path) => write!(f, "Serial({})", path.display()),
            Transport::Tcp(addr) => write!(f, "Tcp({addr})"),
            Transport::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl Transport {
    async fn connect(self) -> std::io::Result<(BoxReader, BoxWriter)> {
        match self {
            Transport::Serial(path) => {
                // Separate handles: a blocking tty read must not hold up writes.
                let reader = tokio::fs::File::open(&path).await?;
                let writer = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
                Ok((Box::new(reader), Box::new(writer)))
            }
            Transport::Tcp(addr) => {
                let stream = TcpStream::connect(&addr).await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            Transport::Stream(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                Ok((Box::new(reader), Box::new(writer)))
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Reply routing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct PendingReplies(Arc<Mutex<HashMap<u8, oneshot::Sender<ApiFrame>>>>);

impl PendingReplies {
    fn lock(&self) -> MutexGuard<'_, HashMap<u8, oneshot::Sender<ApiFrame>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, frame_id: u8) -> oneshot::Receiver<ApiFrame> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(frame_id, tx);
        rx
    }

    fn take(&self, frame_id: u8) -> Option<oneshot::Sender<ApiFrame>> {
        self.lock().remove(&frame_id)
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

struct Router {
    pending: PendingReplies,
    events: mpsc::UnboundedSender<RadioEvent>,
    discovery: mpsc::UnboundedSender<DiscoveryReply>,
}

impl Router {
    fn route(&self, frame: ApiFrame) {
        // A reply somebody is waiting for goes to them, whatever its type.
        if let Some(id) = frame.frame_id()
            && let Some(waiter) = self.pending.take(id)
        {
            let _ = waiter.send(frame);
            return;
        }
        match frame {
            ApiFrame::AtResponse {
                frame_id,
                command,
                status,
                data,
            } if command == AtCommand::NODE_DISCOVER => {
                if status != 0 {
                    warn!(
                        session = frame_id,
                        status = at_status_text(status),
                        "node discovery rejected by radio"
                    );
                } else if data.is_empty() {
                    debug!(session = frame_id, "radio finished node discovery");
                } else {
                    match parse_node_discovery(&data) {
                        Ok(device) => {
                            let _ = self.discovery.send(DiscoveryReply {
                                session: frame_id,
                                device,
                            });
                        }
                        Err(e) => debug!(error = %e, "unreadable discovery reply dropped"),
                    }
                }
            }
            ApiFrame::Receive { source, data, .. } => {
                trace!(from = %source, len = data.len(), "packet received");
                let _ = self.events.send(RadioEvent::Received { from: source, data });
            }
            ApiFrame::ModemStatus(status) => {
                info!(status = modem_status_text(status), "modem status");
                let _ = self.events.send(RadioEvent::ModemStatus(status));
            }
            other => match other.frame_id() {
                Some(id) => debug!(frame_id = id, "reply with no waiter dropped"),
                None => debug!(frame = ?other, "unhandled API frame"),
            },
        }
    }
}

async fn read_loop(mut reader: BoxReader, router: Router) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 256];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                warn!("radio link closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "radio link read failed");
                break;
            }
        };
        trace!(bytes = %hex::encode(&buf[..n]), "radio rx");
        decoder.extend(&buf[..n]);
        while let Some(frame) = decoder.next_frame() {
            router.route(frame);
        }
    }
    if decoder.discarded() > 0 {
        debug!(bytes = decoder.discarded(), "noise skipped on radio link");
    }
    // Dropping the waiters fails every in-flight request.
    router.pending.clear();
}

// ────────────────────────────────────────────────────────────────────────────
// Driver
// ────────────────────────────────────────────────────────────────────────────

struct Link {
    writer: BoxWriter,
    pending: PendingReplies,
    reader_task: JoinHandle<()>,
    local_address: Option<Address64>,
    next_frame_id: u8,
}

impl Link {
    /// Frame ids cycle through 1..=255; 0 would suppress the reply.
    fn allocate_frame_id(&mut self) -> u8 {
        let id = self.next_frame_id;
        self.next_frame_id = if id == u8::MAX { 1 } else { id + 1 };
        id
    }

    async fn write(&mut self, frame: &ApiFrame) -> Result<(), String> {
        let bytes = frame.encode().map_err(|e| e.to_string())?;
        trace!(bytes = %hex::encode(&bytes), "radio tx");
        self.writer.write_all(&bytes).await.map_err(|e| e.to_string())?;
        self.writer.flush().await.map_err(|e| e.to_string())
    }
}

/// XBee ZigBee module driver.
pub struct XBeeRadio {
    transport: Option<Transport>,
    frame_timeout: Duration,
    link: Option<Link>,
}

impl XBeeRadio {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport: Some(transport),
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            link: None,
        }
    }

    pub fn serial(path: impl Into<PathBuf>) -> Self {
        Self::new(Transport::Serial(path.into()))
    }

    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::new(Transport::Tcp(addr.into()))
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Write a frame built around a fresh frame id and wait for its reply.
    async fn transact(
        &mut self,
        operation: &str,
        build: impl FnOnce(u8) -> ApiFrame + Send,
    ) -> Result<ApiFrame, GatewayError> {
        let timeout = self.frame_timeout;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| GatewayError::hardware(operation, "radio link is not open"))?;

        let frame_id = link.allocate_frame_id();
        let reply = link.pending.register(frame_id);
        if let Err(e) = link.write(&build(frame_id)).await {
            link.pending.take(frame_id);
            return Err(GatewayError::hardware(operation, e));
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(GatewayError::hardware(operation, "radio link closed")),
            Err(_) => {
                link.pending.take(frame_id);
                Err(GatewayError::hardware(
                    operation,
                    format!("no reply from radio within {} ms", timeout.as_millis()),
                ))
            }
        }
    }

    /// Send a local or remote AT command and return its response data.
    async fn at(
        &mut self,
        operation: &str,
        target: Option<Address64>,
        command: AtCommand,
        parameter: Vec<u8>,
        apply: bool,
    ) -> Result<Vec<u8>, GatewayError> {
        let local = self.link.as_ref().and_then(|l| l.local_address);
        let target = target.filter(|addr| Some(*addr) != local);

        let reply = self
            .transact(operation, move |frame_id| match target {
                None => ApiFrame::AtCommand {
                    frame_id,
                    command,
                    parameter,
                    queued: !apply,
                },
                Some(destination) => ApiFrame::RemoteAtCommand {
                    frame_id,
                    destination,
                    command,
                    parameter,
                    apply,
                },
            })
            .await?;

        match reply {
            ApiFrame::AtResponse { status, data, .. }
            | ApiFrame::RemoteAtResponse { status, data, .. } => {
                if status == 0 {
                    Ok(data)
                } else {
                    Err(GatewayError::hardware(
                        operation,
                        format!("{command} failed: {}", at_status_text(status)),
                    ))
                }
            }
            other => Err(GatewayError::hardware(
                operation,
                format!("unexpected reply {other:?}"),
            )),
        }
    }

    async fn handshake(&mut self) -> Result<RadioInfo, GatewayError> {
        let high = self
            .at("handshake", None, AtCommand::SERIAL_HIGH, Vec::new(), true)
            .await?;
        let low = self
            .at("handshake", None, AtCommand::SERIAL_LOW, Vec::new(), true)
            .await?;
        let node_id = self
            .at("handshake", None, AtCommand::NODE_IDENTIFIER, Vec::new(), true)
            .await?;

        let address = Address64::new((be_u32(&high) << 32) | be_u32(&low));
        Ok(RadioInfo {
            address,
            node_id: String::from_utf8_lossy(&node_id).trim().to_string(),
        })
    }
}

/// `SH`/`SL` come back with leading zero bytes stripped on some firmware.
fn be_u32(bytes: &[u8]) -> u64 {
    bytes.iter().take(4).fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

#[async_trait]
impl Radio for XBeeRadio {
    fn kind(&self) -> &'static str {
        "xbee"
    }

    async fn open(&mut self) -> Result<RadioStreams, GatewayError> {
        let transport = self
            .transport
            .take()
            .ok_or_else(|| GatewayError::Startup("radio link was already opened".to_string()))?;
        debug!(?transport, "opening radio link");
        let (reader, writer) = transport
            .connect()
            .await
            .map_err(|e| GatewayError::Startup(format!("cannot open radio link: {e}")))?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let (discovery_tx, discovery) = mpsc::unbounded_channel();
        let pending = PendingReplies::default();
        let reader_task = tokio::spawn(read_loop(
            reader,
            Router {
                pending: pending.clone(),
                events: events_tx,
                discovery: discovery_tx,
            },
        ));
        self.link = Some(Link {
            writer,
            pending,
            reader_task,
            local_address: None,
            next_frame_id: 1,
        });

        let info = match self.handshake().await {
            Ok(info) => info,
            Err(e) => {
                self.close().await;
                return Err(GatewayError::Startup(e.to_string()));
            }
        };
        if let Some(link) = self.link.as_mut() {
            link.local_address = Some(info.address);
        }
        info!(address = %info.address, node_id = %info.node_id, "XBee radio ready");

        Ok(RadioStreams {
            info,
            events,
            discovery,
        })
    }

    async fn get_parameter(
        &mut self,
        target: Option<Address64>,
        command: AtCommand,
    ) -> Result<Payload, GatewayError> {
        self.at("get_parameter", target, command, Vec::new(), true)
            .await
            .map(Payload::from)
    }

    async fn set_parameter(
        &mut self,
        target: Option<Address64>,
        command: AtCommand,
        value: &[u8],
        apply_changes: bool,
    ) -> Result<(), GatewayError> {
        self.at("set_parameter", target, command, value.to_vec(), apply_changes)
            .await
            .map(|_| ())
    }

    async fn execute_command(
        &mut self,
        target: Option<Address64>,
        command: AtCommand,
        value: Option<&[u8]>,
        apply_changes: bool,
    ) -> Result<Option<Payload>, GatewayError> {
        let parameter = value.map(<[u8]>::to_vec).unwrap_or_default();
        let data = self
            .at("execute_command", target, command, parameter, apply_changes)
            .await?;
        Ok((!data.is_empty()).then(|| Payload::from(data)))
    }

    async fn send_data(&mut self, to: Address64, data: &[u8]) -> Result<(), GatewayError> {
        let data = data.to_vec();
        let reply = self
            .transact("send", move |frame_id| ApiFrame::TransmitRequest {
                frame_id,
                destination: to,
                data,
            })
            .await?;
        match reply {
            ApiFrame::TransmitStatus { delivery: 0, .. } => Ok(()),
            ApiFrame::TransmitStatus { delivery, .. } => Err(GatewayError::hardware(
                "send",
                format!("delivery to {to} failed: {}", delivery_status_text(delivery)),
            )),
            other => Err(GatewayError::hardware(
                "send",
                format!("unexpected reply {other:?}"),
            )),
        }
    }

    async fn start_discovery(&mut self) -> Result<DiscoverySession, GatewayError> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| GatewayError::hardware("discover", "radio link is not open"))?;
        let session = link.allocate_frame_id();
        link.write(&ApiFrame::AtCommand {
            frame_id: session,
            command: AtCommand::NODE_DISCOVER,
            parameter: Vec::new(),
            queued: false,
        })
        .await
        .map_err(|e| GatewayError::hardware("discover", e))?;
        Ok(session)
    }

    async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            let _ = link.writer.shutdown().await;
            link.reader_task.abort();
            link.pending.clear();
            debug!("radio link closed");
        }
    }
}
