//! `meshgate-runtime` – the execution engine of the gateway.
//!
//! # Modules
//!
//! - [`device_worker`] – [`DeviceWorker`][device_worker::DeviceWorker]: owns
//!   the radio, performs the startup handshake, then drains the command queue
//!   one command at a time and forwards unsolicited radio traffic to the
//!   notify queue.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber with an optional OTLP span exporter. Set
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` to export the per-command spans to any
//!   OTLP-compatible collector.

pub mod device_worker;
pub mod telemetry;

pub use device_worker::{
    DEFAULT_DEVICE_TIMEOUT, DeviceWorker, SessionState, StartupStatus, WorkerConfig,
};
pub use telemetry::{TracerProviderGuard, init_tracing};
