//! `meshgate-server` – the two TCP front doors of the gateway.
//!
//! | Server | Default port | Direction |
//! |---|---|---|
//! | [`RequestServer`] | `9020` | client request in, one response out |
//! | [`NotifyServer`] | `9021` | notifications out to every subscriber |
//!
//! Both speak newline-delimited JSON through
//! [`meshgate_middleware::channel`] and spawn one task per connection, so a
//! slow or dead client never holds up the others.
//!
//! # Usage
//!
//! ```rust,no_run
//! use meshgate_middleware::{command_queue, notify_queue};
//! use meshgate_server::{NotifyServer, RequestServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), meshgate_server::ServerError> {
//!     let (queue, _commands) = command_queue();
//!     let (_notify, events) = notify_queue();
//!     tokio::spawn(NotifyServer::new(events).run());
//!     RequestServer::new(queue).run().await
//! }
//! ```

use std::net::SocketAddr;

pub mod notify_server;
pub mod request_server;

pub use notify_server::{DEFAULT_NOTIFY_PORT, DEFAULT_WRITE_TIMEOUT, NotifyServer, Subscribers};
pub use request_server::{
    DEFAULT_REQUEST_PORT, DEFAULT_RESPONSE_TIMEOUT, RequestServer, handle_client,
};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
