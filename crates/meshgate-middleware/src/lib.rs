//! `meshgate-middleware` – the plumbing between clients and the radio.
//!
//! Moves work and events around without caring what they mean.
//!
//! # Modules
//!
//! - [`channel`] – newline-delimited JSON framing over any async byte stream.
//! - [`command`] – a [`Command`] and its single-use [`ResponseSlot`].
//! - [`queue`] – the FIFO command queue (many producers, one worker) and the
//!   notify queue (worker to notify server).

pub mod channel;
pub mod command;
pub mod queue;

pub use channel::{FrameError, FrameReader, FrameWriter, FramedChannel, MAX_FRAME_LEN, encode_frame};
pub use command::{Command, CommandResult, ResponseSlot};
pub use queue::{
    CommandQueue, CommandReceiver, NotifyQueue, NotifyReceiver, command_queue, notify_queue,
};
