//! [`RequestServer`] – newline-delimited JSON request/response endpoint.
//!
//! Listens on `0.0.0.0:9020` by default. Every connection gets its own task
//! which handles one request at a time:
//!
//! 1. read one framed request;
//! 2. validate it (failures are answered immediately and never queued);
//! 3. wrap it in a command, push it on the command queue and wait up to the
//!    response timeout for the device worker's answer;
//! 4. write the response, echoing the request's `op`.
//!
//! A timed-out request only stops the waiting. The worker still runs the
//! command and its late answer is discarded. The same holds when the client
//! disconnects while waiting: the handler ends at once.

use std::net::SocketAddr;
use std::time::Duration;

use meshgate_middleware::{CommandQueue, FrameError, FrameReader, FrameWriter, FramedChannel};
use meshgate_types::{GatewayError, Request, Response, op_hint};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::ServerError;

/// Default TCP port for request/response clients.
pub const DEFAULT_REQUEST_PORT: u16 = 9020;

/// Default time a client waits for the device worker.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(25);

pub struct RequestServer {
    queue: CommandQueue,
    address: SocketAddr,
    response_timeout: Duration,
}

impl RequestServer {
    /// Create a server feeding `queue` on `0.0.0.0:`[`DEFAULT_REQUEST_PORT`].
    pub fn new(queue: CommandQueue) -> Self {
        Self {
            queue,
            address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_REQUEST_PORT)),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Bind the configured address and serve forever.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the listener cannot be created.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.address)
            .await
            .map_err(|source| ServerError::Bind {
                address: self.address,
                source,
            })?;
        self.serve(listener).await;
        Ok(())
    }

    /// Serve clients accepted from an already bound listener.
    pub async fn serve(self, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "request server listening"),
            Err(e) => warn!(error = %e, "request server listening on unknown address"),
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let queue = self.queue.clone();
                    let timeout = self.response_timeout;
                    tokio::spawn(handle_tcp_client(stream, peer, queue, timeout));
                }
                Err(e) => warn!(error = %e, "request server accept failed"),
            }
        }
    }
}

async fn handle_tcp_client(
    stream: TcpStream,
    peer: SocketAddr,
    queue: CommandQueue,
    response_timeout: Duration,
) {
    debug!(%peer, "request client connected");
    let _ = stream.set_nodelay(true);
    let (reader, writer) = FramedChannel::from_tcp(stream).into_split();
    handle_client(reader, writer, &queue, response_timeout).await;
    debug!(%peer, "request client disconnected");
}

/// Serve one client until its connection breaks.
pub async fn handle_client<R, W>(
    mut reader: FrameReader<R>,
    mut writer: FrameWriter<W>,
    queue: &CommandQueue,
    response_timeout: Duration,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let response = match reader.receive_value().await {
            Ok(value) => tokio::select! {
                response = answer(value, queue, response_timeout) => response,
                () = reader.closed() => {
                    debug!("request client left before its answer");
                    return;
                }
            },
            Err(FrameError::Malformed(reason)) => {
                Response::error(None, &GatewayError::Validation(reason))
            }
            Err(FrameError::BrokenConnection(reason)) => {
                debug!(%reason, "request connection closed");
                return;
            }
        };

        if let Err(e) = writer.send(&response).await {
            debug!(error = %e, "could not write response");
            return;
        }
    }
}

async fn answer(
    value: serde_json::Value,
    queue: &CommandQueue,
    response_timeout: Duration,
) -> Response {
    let hint = op_hint(&value);
    let request = match Request::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            debug!(op = ?hint, error = %e, "request rejected");
            return Response::error(hint.as_deref(), &e);
        }
    };

    let op = request.op_name();
    let result = queue.call(request, response_timeout).await;
    if let Err(GatewayError::Timeout { .. }) = &result {
        warn!(op, timeout_ms = response_timeout.as_millis() as u64, "request timed out");
    }
    Response::from_result(op, &result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_middleware::{CommandReceiver, command_queue};
    use meshgate_types::{CommandOutput, ErrorCode};
    use serde_json::{Value, json};

    const PATIENCE: Duration = Duration::from_secs(2);

    async fn start(queue: CommandQueue, timeout: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RequestServer::new(queue).with_response_timeout(timeout);
        tokio::spawn(server.serve(listener));
        addr
    }

    /// Answers every `wait` with its own time, without sleeping.
    fn echo_worker(mut commands: CommandReceiver) {
        tokio::spawn(async move {
            while let Some(command) = commands.pop().await {
                let output = match command.request() {
                    Request::Wait { time } => CommandOutput::Waited { time: *time },
                    _ => CommandOutput::Done {},
                };
                command.respond(Ok(output));
            }
        });
    }

    async fn roundtrip<R, W>(client: &mut FramedChannel<R, W>, request: Value) -> Value
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        client.send(&request).await.unwrap();
        tokio::time::timeout(PATIENCE, client.receive_value())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn defaults() {
        let (queue, _rx) = command_queue();
        let server = RequestServer::new(queue);
        assert_eq!(server.address().port(), DEFAULT_REQUEST_PORT);
        let server = server.with_address("127.0.0.1:7000".parse().unwrap());
        assert_eq!(server.address().port(), 7000);
    }

    #[tokio::test]
    async fn concurrent_clients_get_their_own_responses() {
        let (queue, commands) = command_queue();
        echo_worker(commands);
        let addr = start(queue, PATIENCE).await;

        let mut clients = Vec::new();
        for i in 0..8u32 {
            clients.push(tokio::spawn(async move {
                let mut client = FramedChannel::connect(addr).await.unwrap();
                for round in 0..5u32 {
                    let token = f64::from(i * 100 + round);
                    let response = roundtrip(&mut client, json!({"op": "wait", "time": token})).await;
                    assert_eq!(response["status"], "ok");
                    assert_eq!(response["op"], "wait");
                    assert_eq!(response["result"]["time"], token);
                }
            }));
        }
        for client in clients {
            client.await.unwrap();
        }
    }

    #[tokio::test]
    async fn invalid_requests_are_answered_without_queueing() {
        let (queue, _commands) = command_queue();
        let observer = queue.clone();
        let addr = start(queue, PATIENCE).await;
        let mut client = FramedChannel::connect(addr).await.unwrap();

        let response = roundtrip(&mut client, json!({"op": "self_destruct"})).await;
        assert_eq!(response["status"], "error");
        assert_eq!(response["code"], "validation");
        assert_eq!(response["op"], "self_destruct");

        let response = roundtrip(
            &mut client,
            json!({"op": "send", "address": "not-an-address", "message": "aGk="}),
        )
        .await;
        assert_eq!(response["code"], "validation");

        let response = roundtrip(&mut client, json!({"op": "wait", "time": -3})).await;
        assert_eq!(response["code"], "validation");

        assert!(observer.is_empty());
    }

    #[tokio::test]
    async fn malformed_line_keeps_the_connection() {
        let (queue, commands) = command_queue();
        echo_worker(commands);

        let (client_side, server_side) = tokio::io::duplex(1024);
        let (sr, sw) = tokio::io::split(server_side);
        tokio::spawn(async move {
            handle_client(FrameReader::new(sr), FrameWriter::new(sw), &queue, PATIENCE).await;
        });

        let (cr, mut cw) = tokio::io::split(client_side);
        let mut responses = FrameReader::new(cr);
        tokio::io::AsyncWriteExt::write_all(&mut cw, b"{not json\n{\"op\":\"wait\",\"time\":1}\n")
            .await
            .unwrap();

        let first: Response = responses.receive().await.unwrap();
        assert!(matches!(
            first,
            Response::Error {
                code: ErrorCode::Validation,
                op: None,
                ..
            }
        ));
        let second: Response = responses.receive().await.unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn slow_worker_yields_timeout_error() {
        let (queue, mut commands) = command_queue();
        // Hold commands without answering them.
        let held = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(command) = commands.pop().await {
                held.push(command);
            }
            held
        });
        let addr = start(queue, Duration::from_millis(50)).await;
        let mut client = FramedChannel::connect(addr).await.unwrap();

        let response = roundtrip(&mut client, json!({"op": "discover"})).await;
        assert_eq!(response["status"], "error");
        assert_eq!(response["code"], "timeout");
        assert_eq!(response["op"], "discover");
        held.abort();
    }

    #[tokio::test]
    async fn disconnect_while_waiting_ends_the_handler() {
        let (queue, mut commands) = command_queue();
        let (taken_tx, mut taken_rx) = tokio::sync::mpsc::unbounded_channel();
        let held = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(command) = commands.pop().await {
                let _ = taken_tx.send(());
                held.push(command);
            }
            held
        });

        let (client_side, server_side) = tokio::io::duplex(1024);
        let (sr, sw) = tokio::io::split(server_side);
        let handler = tokio::spawn(async move {
            let timeout = Duration::from_secs(10);
            handle_client(FrameReader::new(sr), FrameWriter::new(sw), &queue, timeout).await;
        });

        let mut client = client_side;
        tokio::io::AsyncWriteExt::write_all(&mut client, b"{\"op\":\"discover\"}\n")
            .await
            .unwrap();
        taken_rx.recv().await.expect("command queued");
        drop(client);

        tokio::time::timeout(Duration::from_millis(500), handler)
            .await
            .expect("handler ends without waiting for the answer")
            .unwrap();
        held.abort();
    }

    #[tokio::test]
    async fn stopped_worker_yields_unavailable() {
        let (queue, commands) = command_queue();
        drop(commands);
        let addr = start(queue, PATIENCE).await;
        let mut client = FramedChannel::connect(addr).await.unwrap();

        let response = roundtrip(&mut client, json!({"op": "discover"})).await;
        assert_eq!(response["code"], "unavailable");
    }

    #[tokio::test]
    async fn set_then_get_through_the_gateway() {
        use meshgate_hal::SimRadio;
        use meshgate_middleware::notify_queue;
        use meshgate_runtime::DeviceWorker;

        let (queue, commands) = command_queue();
        let (notify, _events) = notify_queue();
        let (mut status, _worker) =
            DeviceWorker::new(Box::new(SimRadio::new()), commands, notify).spawn();
        assert_eq!(
            status.wait_finished().await,
            meshgate_runtime::SessionState::Ready
        );

        let addr = start(queue, PATIENCE).await;
        let mut client = FramedChannel::connect(addr).await.unwrap();

        let response = roundtrip(
            &mut client,
            json!({"op": "set_parameter", "at_command": "NI", "value": "Tk9ERS03"}),
        )
        .await;
        assert_eq!(response, json!({"status": "ok", "op": "set_parameter", "result": {}}));

        let response = roundtrip(
            &mut client,
            json!({"op": "get_parameter", "at_command": "NI"}),
        )
        .await;
        assert_eq!(response["result"]["value"], "Tk9ERS03");
    }
}
