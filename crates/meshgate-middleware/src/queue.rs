//! Command and notify queues.
//!
//! Both are unbounded multi-producer single-consumer FIFOs built on
//! `tokio::sync::mpsc`. Any number of request handlers and the console submit
//! into the [`CommandQueue`]; only the device worker pops. The worker and its
//! inbound forwarder publish into the [`NotifyQueue`]; only the notify server
//! pops.
//!
//! Closing is implicit: once every producer handle is dropped, `pop` drains
//! what is left and then returns `None`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use meshgate_types::{GatewayError, NotifyEvent, Request};
use tokio::sync::mpsc;
use tracing::trace;

use crate::command::{Command, CommandResult, ResponseSlot};

// ────────────────────────────────────────────────────────────────────────────
// Command queue
// ────────────────────────────────────────────────────────────────────────────

/// Create a connected command queue pair.
pub fn command_queue() -> (CommandQueue, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        CommandQueue {
            tx,
            pending: Arc::clone(&pending),
        },
        CommandReceiver { rx, pending },
    )
}

/// Producer side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
}

impl CommandQueue {
    /// Append a command to the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unavailable`] when the worker has stopped.
    /// The rejected command is dropped, which also answers its slot.
    pub fn submit(&self, command: Command) -> Result<(), GatewayError> {
        let id = command.id();
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(command).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(GatewayError::Unavailable);
        }
        trace!(command = %id, "command queued");
        Ok(())
    }

    /// Wrap `request` in a command, queue it and return its response slot.
    pub fn enqueue(&self, request: Request) -> Result<ResponseSlot, GatewayError> {
        let (command, slot) = Command::new(request);
        self.submit(command)?;
        Ok(slot)
    }

    /// Submit `request` and wait up to `timeout` for the worker's answer.
    pub async fn call(&self, request: Request, timeout: Duration) -> CommandResult {
        self.enqueue(request)?.wait(timeout).await
    }

    /// Number of commands submitted but not yet popped by the worker.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` once the receiving worker is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the device worker.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::UnboundedReceiver<Command>,
    pending: Arc<AtomicUsize>,
}

impl CommandReceiver {
    /// Remove the head of the queue, waiting while it is empty.
    ///
    /// Returns `None` once all producers are gone and the queue is drained.
    pub async fn pop(&mut self) -> Option<Command> {
        let command = self.rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(command)
    }

    /// Stop accepting new commands. Already queued ones can still be popped.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Notify queue
// ────────────────────────────────────────────────────────────────────────────

pub fn notify_queue() -> (NotifyQueue, NotifyReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NotifyQueue { tx }, NotifyReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct NotifyQueue {
    tx: mpsc::UnboundedSender<NotifyEvent>,
}

impl NotifyQueue {
    /// Append an event. Returns `false` if the notify server is gone, in
    /// which case the event is dropped.
    pub fn publish(&self, event: NotifyEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

#[derive(Debug)]
pub struct NotifyReceiver {
    rx: mpsc::UnboundedReceiver<NotifyEvent>,
}

impl NotifyReceiver {
    pub async fn pop(&mut self) -> Option<NotifyEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`pop`](Self::pop).
    pub fn try_pop(&mut self) -> Option<NotifyEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_types::{Address64, CommandOutput, LinkState};

    fn wait_request(time: f64) -> Request {
        Request::Wait { time }
    }

    #[tokio::test]
    async fn commands_pop_in_submission_order() {
        let (queue, mut rx) = command_queue();
        for i in 0..5 {
            queue.enqueue(wait_request(i as f64)).unwrap();
        }
        assert_eq!(queue.len(), 5);

        for i in 0..5 {
            let command = rx.pop().await.unwrap();
            assert_eq!(command.request(), &wait_request(i as f64));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn producers_keep_their_own_order() {
        let (queue, mut rx) = command_queue();

        let mut handles = Vec::new();
        for producer in 0..4u32 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                for seq in 0..25u32 {
                    let time = f64::from(producer * 1000 + seq);
                    queue.enqueue(wait_request(time)).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        drop(queue);

        let mut last_seen = [None::<u32>; 4];
        let mut count = 0;
        while let Some(command) = rx.pop().await {
            let Request::Wait { time } = command.request() else {
                panic!("unexpected request");
            };
            let time = *time as u32;
            let (producer, seq) = ((time / 1000) as usize, time % 1000);
            if let Some(prev) = last_seen[producer] {
                assert!(seq > prev, "producer {producer} reordered");
            }
            last_seen[producer] = Some(seq);
            count += 1;
        }
        assert_eq!(count, 100);
    }

    #[tokio::test]
    async fn call_returns_worker_answer() {
        let (queue, mut rx) = command_queue();

        let worker = tokio::spawn(async move {
            let command = rx.pop().await.unwrap();
            command.respond(Ok(CommandOutput::Done {}));
        });

        let result = queue
            .call(Request::Discover, Duration::from_secs(1))
            .await;
        assert_eq!(result, Ok(CommandOutput::Done {}));
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn submit_after_worker_stopped_is_unavailable() {
        let (queue, rx) = command_queue();
        drop(rx);

        assert!(queue.is_closed());
        let err = queue.enqueue(Request::Discover).unwrap_err();
        assert_eq!(err, GatewayError::Unavailable);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn closed_receiver_drains_then_ends() {
        let (queue, mut rx) = command_queue();
        let slot = queue.enqueue(Request::Discover).unwrap();
        rx.close();

        assert!(queue.enqueue(Request::Discover).is_err());
        let command = rx.pop().await.unwrap();
        drop(command);
        assert!(rx.pop().await.is_none());

        let result = slot.wait(Duration::from_secs(1)).await;
        assert_eq!(result, Err(GatewayError::Unavailable));
    }

    #[tokio::test]
    async fn notify_events_are_fifo() {
        let (queue, mut rx) = notify_queue();
        let addr = Address64::new(0x0013_A200_0000_0001);

        assert!(queue.publish(NotifyEvent::status(None, LinkState::Ready, "up")));
        assert!(queue.publish(NotifyEvent::received(addr, b"one".to_vec())));
        assert!(queue.publish(NotifyEvent::received(addr, b"two".to_vec())));

        assert!(matches!(
            rx.pop().await.unwrap().kind,
            meshgate_types::NotifyKind::Status { .. }
        ));
        for expected in [&b"one"[..], &b"two"[..]] {
            match rx.pop().await.unwrap().kind {
                meshgate_types::NotifyKind::Received { message, .. } => {
                    assert_eq!(message.as_bytes(), expected);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(rx.try_pop().is_none());
    }

    #[tokio::test]
    async fn publish_without_subscriber_side_is_dropped() {
        let (queue, rx) = notify_queue();
        drop(rx);
        assert!(!queue.publish(NotifyEvent::status(None, LinkState::Ready, "up")));
    }
}
