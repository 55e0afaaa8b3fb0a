//! Newline-delimited JSON framing over any async byte stream.
//!
//! Each message is one JSON object followed by `\n`. [`FrameReader::receive`]
//! only ever yields complete messages: a peer that closes mid-line, sends
//! invalid UTF-8, or exceeds [`MAX_FRAME_LEN`] produces
//! [`FrameError::BrokenConnection`] and the stream should be abandoned.
//! A complete line that is not a JSON object produces
//! [`FrameError::Malformed`]; the stream stays usable.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::ToSocketAddrs;

/// Largest accepted frame, newline excluded.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream can no longer be used; the caller must reconnect.
    #[error("connection broken: {0}")]
    BrokenConnection(String),

    /// A complete frame arrived but it is not a usable JSON object.
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl FrameError {
    fn broken(reason: impl Into<String>) -> Self {
        FrameError::BrokenConnection(reason.into())
    }
}

/// Serialize `message` into a ready-to-write frame (JSON + `\n`).
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let mut frame =
        serde_json::to_vec(message).map_err(|e| FrameError::Malformed(e.to_string()))?;
    frame.push(b'\n');
    Ok(frame)
}

// ────────────────────────────────────────────────────────────────────────────
// Reader half
// ────────────────────────────────────────────────────────────────────────────

pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_len(inner, MAX_FRAME_LEN)
    }

    pub fn with_max_len(inner: R, max_len: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: Vec::new(),
            max_len,
        }
    }

    /// Read the next message as a JSON object. Blank lines are skipped.
    pub async fn receive_value(&mut self) -> Result<Value, FrameError> {
        loop {
            self.line.clear();
            let mut limited = (&mut self.reader).take(self.max_len as u64 + 1);
            let n = limited
                .read_until(b'\n', &mut self.line)
                .await
                .map_err(|e| FrameError::broken(e.to_string()))?;

            if n == 0 {
                return Err(FrameError::broken("peer closed the connection"));
            }
            if self.line.last() != Some(&b'\n') {
                return Err(if n > self.max_len {
                    FrameError::broken(format!("frame exceeds {} bytes", self.max_len))
                } else {
                    FrameError::broken("peer closed the connection mid-message")
                });
            }

            let text = std::str::from_utf8(&self.line)
                .map_err(|_| FrameError::broken("frame is not valid UTF-8"))?
                .trim();
            if text.is_empty() {
                continue;
            }

            let value: Value =
                serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
            if !value.is_object() {
                return Err(FrameError::Malformed("expected a JSON object".to_string()));
            }
            return Ok(value);
        }
    }

    /// Resolve once the peer has closed its side. Never consumes a message:
    /// if unread bytes are already buffered this waits forever. Cancel safe.
    pub async fn closed(&mut self) {
        match self.reader.fill_buf().await {
            Ok([]) | Err(_) => {}
            Ok(_) => std::future::pending().await,
        }
    }

    /// Read the next message and deserialize it into `T`.
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        let value = self.receive_value().await?;
        serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Writer half
// ────────────────────────────────────────────────────────────────────────────

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), FrameError> {
        let frame = encode_frame(message)?;
        self.send_frame(&frame).await
    }

    /// Write an already encoded frame (see [`encode_frame`]).
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), FrameError> {
        self.writer
            .write_all(frame)
            .await
            .map_err(|e| FrameError::broken(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| FrameError::broken(e.to_string()))
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Full duplex channel
// ────────────────────────────────────────────────────────────────────────────

/// A message-boundary-preserving wrapper over a byte stream.
pub struct FramedChannel<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl FramedChannel<OwnedReadHalf, OwnedWriteHalf> {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self::new(read, write)
    }

    /// Connect to a gateway endpoint.
    pub async fn connect(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_tcp(stream))
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> FramedChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), FrameError> {
        self.writer.send(message).await
    }

    pub async fn receive_value(&mut self) -> Result<Value, FrameError> {
        self.reader.receive_value().await
    }

    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        self.reader.receive().await
    }

    pub fn into_split(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn message_roundtrip_over_duplex() {
        let (a, b) = duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut left = FramedChannel::new(ar, aw);
        let mut right = FramedChannel::new(br, bw);

        left.send(&json!({"op": "discover"})).await.unwrap();
        left.send(&json!({"op": "wait", "time": 1})).await.unwrap();

        assert_eq!(right.receive_value().await.unwrap(), json!({"op": "discover"}));
        assert_eq!(right.receive_value().await.unwrap()["time"], 1);
    }

    #[tokio::test]
    async fn message_split_across_writes_is_reassembled() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server);

        let writer = tokio::spawn(async move {
            client.write_all(b"{\"op\":").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            client.write_all(b"\"discover\"}\n").await.unwrap();
            client
        });

        let value = reader.receive_value().await.unwrap();
        assert_eq!(value["op"], "discover");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn close_mid_message_is_broken_connection() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server);

        client.write_all(b"{\"op\":\"disc").await.unwrap();
        drop(client);

        let err = reader.receive_value().await.unwrap_err();
        assert!(matches!(err, FrameError::BrokenConnection(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn clean_close_is_broken_connection() {
        let (client, server) = duplex(64);
        let mut reader = FrameReader::new(server);
        drop(client);
        assert!(matches!(
            reader.receive_value().await,
            Err(FrameError::BrokenConnection(_))
        ));
    }

    #[tokio::test]
    async fn closed_resolves_on_eof_only() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server);

        client.write_all(b"{\"op\":\"discover\"}\n").await.unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(50), reader.closed()).await;
        assert!(pending.is_err(), "buffered data is not a close");
        let value = reader.receive_value().await.unwrap();
        assert_eq!(value["op"], "discover");

        drop(client);
        tokio::time::timeout(Duration::from_secs(1), reader.closed())
            .await
            .expect("close noticed");
    }

    #[tokio::test]
    async fn invalid_json_is_malformed_and_stream_continues() {
        let (mut client, server) = duplex(256);
        let mut reader = FrameReader::new(server);

        client.write_all(b"this is not json\n[1,2]\n\n{\"ok\":true}\n").await.unwrap();

        assert!(matches!(reader.receive_value().await, Err(FrameError::Malformed(_))));
        assert!(matches!(reader.receive_value().await, Err(FrameError::Malformed(_))));
        assert_eq!(reader.receive_value().await.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn oversized_frame_is_broken_connection() {
        let (mut client, server) = duplex(1024);
        let mut reader = FrameReader::with_max_len(server, 16);

        tokio::spawn(async move {
            let _ = client.write_all(&[b'x'; 100]).await;
            let _ = client.write_all(b"\n").await;
        });

        let err = reader.receive_value().await.unwrap_err();
        assert!(err.to_string().contains("exceeds"), "got {err}");
    }

    #[tokio::test]
    async fn invalid_utf8_is_broken_connection() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server);
        client.write_all(&[0xff, 0xfe, b'\n']).await.unwrap();
        assert!(matches!(
            reader.receive_value().await,
            Err(FrameError::BrokenConnection(_))
        ));
    }

    #[test]
    fn encode_frame_appends_newline() {
        let frame = encode_frame(&json!({"a": 1})).unwrap();
        assert_eq!(frame, b"{\"a\":1}\n");
    }
}
