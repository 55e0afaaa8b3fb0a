//! [`NotifyServer`] – pushes every notification to every connected
//! subscriber.
//!
//! Listens on `0.0.0.0:9021` by default. One fan-out task pops the notify
//! queue, snapshots the current subscribers and writes the event to all of
//! them concurrently. Each write is bounded by the write timeout; a
//! subscriber whose write fails or times out is dropped and the others are
//! unaffected. A watcher per subscriber drops it as soon as the peer closes.
//! Anything a subscriber sends is ignored.
//!
//! Delivery is best effort: an event reaches the subscribers connected when
//! it is published, and nobody else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use meshgate_middleware::{FrameWriter, NotifyReceiver, encode_frame};
use meshgate_types::NotifyEvent;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::{debug, info, trace, warn};

use crate::ServerError;

/// Default TCP port for notify subscribers.
pub const DEFAULT_NOTIFY_PORT: u16 = 9021;

/// Default bound on one write to one subscriber.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

pub type SubscriberId = u64;

// ────────────────────────────────────────────────────────────────────────────
// Subscriber set
// ────────────────────────────────────────────────────────────────────────────

type SharedWriter<W> = Arc<tokio::sync::Mutex<FrameWriter<W>>>;

/// The live subscriber set. Cheap to clone; all clones share one set.
pub struct Subscribers<W> {
    inner: Arc<Mutex<HashMap<SubscriberId, SharedWriter<W>>>>,
    next_id: Arc<AtomicU64>,
}

impl<W> Clone for Subscribers<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<W> Default for Subscribers<W> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> Subscribers<W> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, SharedWriter<W>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, writer: W) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let writer = Arc::new(tokio::sync::Mutex::new(FrameWriter::new(writer)));
        self.lock().insert(id, writer);
        id
    }

    /// Returns `false` if `id` was already gone.
    pub fn remove(&self, id: SubscriberId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write `event` to every current subscriber, concurrently.
    ///
    /// Returns the number of subscribers that received it. Subscribers whose
    /// write failed or exceeded `write_timeout` are removed.
    pub async fn broadcast(&self, event: &NotifyEvent, write_timeout: Duration) -> usize {
        let frame = match encode_frame(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "notification could not be encoded");
                return 0;
            }
        };
        let snapshot: Vec<(SubscriberId, SharedWriter<W>)> = self
            .lock()
            .iter()
            .map(|(id, writer)| (*id, Arc::clone(writer)))
            .collect();

        let frame = &frame;
        let outcomes = join_all(snapshot.into_iter().map(|(id, writer)| async move {
            let write = async {
                let mut writer = writer.lock().await;
                writer.send_frame(frame).await
            };
            let outcome = match tokio::time::timeout(write_timeout, write).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("write timed out after {} ms", write_timeout.as_millis())),
            };
            (id, outcome)
        }))
        .await;

        let mut delivered = 0;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => delivered += 1,
                Err(reason) => {
                    if self.remove(id) {
                        info!(subscriber = id, %reason, "dropping notify subscriber");
                    }
                }
            }
        }
        delivered
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Server
// ────────────────────────────────────────────────────────────────────────────

pub struct NotifyServer {
    events: NotifyReceiver,
    address: SocketAddr,
    write_timeout: Duration,
    subscribers: Subscribers<OwnedWriteHalf>,
}

impl NotifyServer {
    /// Create a server draining `events` on `0.0.0.0:`[`DEFAULT_NOTIFY_PORT`].
    pub fn new(events: NotifyReceiver) -> Self {
        Self {
            events,
            address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_NOTIFY_PORT)),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            subscribers: Subscribers::new(),
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Handle on the subscriber set, e.g. to report how many are connected.
    pub fn subscribers(&self) -> Subscribers<OwnedWriteHalf> {
        self.subscribers.clone()
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

    /// Serve subscribers accepted from an already bound listener.
    pub async fn serve(self, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "notify server listening"),
            Err(e) => warn!(error = %e, "notify server listening on unknown address"),
        }

        tokio::spawn(fan_out(
            self.events,
            self.subscribers.clone(),
            self.write_timeout,
        ));

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let (mut reader, writer) = stream.into_split();
                    let id = self.subscribers.add(writer);
                    info!(subscriber = id, %peer, "notify subscriber connected");

                    let subscribers = self.subscribers.clone();
                    tokio::spawn(async move {
                        // Discard whatever the peer sends until it hangs up.
                        let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                        if subscribers.remove(id) {
                            info!(subscriber = id, %peer, "notify subscriber disconnected");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "notify server accept failed"),
            }
        }
    }
}

async fn fan_out<W: AsyncWrite + Unpin + Send + 'static>(
    mut events: NotifyReceiver,
    subscribers: Subscribers<W>,
    write_timeout: Duration,
) {
    while let Some(event) = events.pop().await {
        let delivered = subscribers.broadcast(&event, write_timeout).await;
        trace!(event = %event.id, delivered, "notification fanned out");
    }
    debug!("notify queue closed; fan-out stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_middleware::{FrameReader, notify_queue};
    use meshgate_types::{Address64, LinkState, NotifyKind};
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};
    use tokio::net::TcpStream;

    const PATIENCE: Duration = Duration::from_secs(2);

    fn sample_event() -> NotifyEvent {
        NotifyEvent::received(Address64::new(0x0013_A200_0000_0042), b"21.5C".to_vec())
    }

    async fn read_event(reader: &mut FrameReader<impl tokio::io::AsyncRead + Unpin>) -> NotifyEvent {
        tokio::time::timeout(PATIENCE, reader.receive())
            .await
            .expect("event did not arrive in time")
            .unwrap()
    }

    async fn wait_for_count<W: AsyncWrite + Unpin + Send + 'static>(
        subscribers: &Subscribers<W>,
        expected: usize,
    ) {
        tokio::time::timeout(PATIENCE, async {
            while subscribers.len() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("subscriber count never reached {expected}"));
    }

    #[test]
    fn defaults() {
        let (_queue, events) = notify_queue();
        let server = NotifyServer::new(events);
        assert_eq!(server.address().port(), DEFAULT_NOTIFY_PORT);
        assert!(server.subscribers().is_empty());
    }

    #[tokio::test]
    async fn broadcast_survives_stuck_and_closed_subscribers() {
        let subscribers: Subscribers<DuplexStream> = Subscribers::new();

        let (good_a, peer_a) = duplex(4096);
        let (good_b, peer_b) = duplex(4096);
        // Too small for one frame and never read: the write blocks.
        let (stuck, _stuck_peer) = duplex(8);
        let (closed, closed_peer) = duplex(4096);
        drop(closed_peer);

        subscribers.add(good_a);
        subscribers.add(stuck);
        subscribers.add(closed);
        subscribers.add(good_b);
        assert_eq!(subscribers.len(), 4);

        let event = sample_event();
        let started = std::time::Instant::now();
        let delivered = subscribers
            .broadcast(&event, Duration::from_millis(100))
            .await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(delivered, 2);
        assert_eq!(subscribers.len(), 2);

        for peer in [peer_a, peer_b] {
            let mut reader = FrameReader::new(peer);
            assert_eq!(read_event(&mut reader).await.id, event.id);
        }
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_a_noop() {
        let subscribers: Subscribers<DuplexStream> = Subscribers::new();
        assert_eq!(
            subscribers.broadcast(&sample_event(), PATIENCE).await,
            0
        );
    }

    #[tokio::test]
    async fn events_fan_out_to_every_tcp_subscriber() {
        let (queue, events) = notify_queue();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = NotifyServer::new(events).with_write_timeout(Duration::from_millis(200));
        let subscribers = server.subscribers();
        tokio::spawn(server.serve(listener));

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        wait_for_count(&subscribers, 3).await;

        // One subscriber hangs up; the other two keep receiving.
        drop(clients.pop());
        wait_for_count(&subscribers, 2).await;

        let event = NotifyEvent::status(None, LinkState::Ready, "ready");
        assert!(queue.publish(event.clone()));

        for client in clients {
            let mut reader = FrameReader::new(client);
            let received = read_event(&mut reader).await;
            assert_eq!(received.id, event.id);
            assert!(matches!(received.kind, NotifyKind::Status { .. }));
        }
    }

    #[tokio::test]
    async fn subscriber_input_is_ignored() {
        let (queue, events) = notify_queue();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = NotifyServer::new(events);
        let subscribers = server.subscribers();
        tokio::spawn(server.serve(listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&subscribers, 1).await;
        tokio::io::AsyncWriteExt::write_all(&mut client, b"{\"op\":\"discover\"}\n")
            .await
            .unwrap();

        let event = sample_event();
        assert!(queue.publish(event.clone()));
        let mut reader = FrameReader::new(client);
        assert_eq!(read_event(&mut reader).await.id, event.id);
        assert_eq!(subscribers.len(), 1);
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_events() {
        let subscribers: Subscribers<DuplexStream> = Subscribers::new();
        subscribers.broadcast(&sample_event(), PATIENCE).await;

        let (writer, mut peer) = duplex(4096);
        subscribers.add(writer);
        let mut buf = [0u8; 16];
        let nothing = tokio::time::timeout(Duration::from_millis(50), peer.read(&mut buf)).await;
        assert!(nothing.is_err(), "late subscriber received a replay");
    }
}
