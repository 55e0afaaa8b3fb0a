//! [`Command`] – one unit of work for the device worker, paired with a
//! single-use [`ResponseSlot`].
//!
//! The slot is a Tokio oneshot channel. Answering consumes the command, so a
//! response can be written at most once; dropping an unanswered command
//! answers it with [`GatewayError::Unavailable`], so the waiting side always
//! gets exactly one result.

use std::time::{Duration, Instant};

use meshgate_types::{CommandOutput, GatewayError, Request};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

pub type CommandResult = Result<CommandOutput, GatewayError>;

#[derive(Debug)]
pub struct Command {
    id: Uuid,
    request: Request,
    created_at: Instant,
    reply: Option<oneshot::Sender<CommandResult>>,
}

impl Command {
    /// Create a command and the slot its response will arrive in.
    pub fn new(request: Request) -> (Self, ResponseSlot) {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let command = Self {
            id,
            request,
            created_at: Instant::now(),
            reply: Some(tx),
        };
        (command, ResponseSlot { id, rx })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Time since the command was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// `true` once the requester has stopped waiting (timed out or
    /// disconnected). The command is still executed; its answer is dropped.
    pub fn is_abandoned(&self) -> bool {
        self.reply.as_ref().is_none_or(|tx| tx.is_closed())
    }

    /// Write the response. Returns `false` when nobody was listening any
    /// more, which is not an error.
    pub fn respond(mut self, result: CommandResult) -> bool {
        let Some(tx) = self.reply.take() else {
            return false;
        };
        let delivered = tx.send(result).is_ok();
        if !delivered {
            debug!(command = %self.id, "requester gone; late response discarded");
        }
        delivered
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Err(GatewayError::Unavailable));
        }
    }
}

/// Receiving end of a command's response.
#[derive(Debug)]
pub struct ResponseSlot {
    id: Uuid,
    rx: oneshot::Receiver<CommandResult>,
}

impl ResponseSlot {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait up to `timeout` for the response.
    ///
    /// On timeout the slot is dropped, which turns the worker's eventual
    /// write into a no-op.
    pub async fn wait(self, timeout: Duration) -> CommandResult {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Unavailable),
            Err(_) => Err(GatewayError::timeout(timeout)),
        }
    }
}
