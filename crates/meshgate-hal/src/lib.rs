//! `meshgate-hal` – mesh radio drivers.
//!
//! The rest of the gateway only talks to the [`Radio`] trait, so the XBee
//! driver and the simulator are interchangeable.
//!
//! # Modules
//!
//! - [`radio`] – the [`Radio`] trait and the types it hands out.
//! - [`frame`] – XBee API frame codec and stream decoder.
//! - [`xbee`] – [`XBeeRadio`], the driver for real modules.
//! - [`sim`] – [`SimRadio`], an in-process radio for tests and demos.

pub mod frame;
pub mod radio;
pub mod sim;
pub mod xbee;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use radio::{DiscoveryReply, DiscoverySession, Radio, RadioEvent, RadioInfo, RadioStreams};
pub use sim::{SimHandle, SimRadio};
pub use xbee::{Transport, XBeeRadio};

/// How to reach the radio, as written in configuration:
///
/// | Form | Meaning |
/// |---|---|
/// | `serial:/dev/ttyUSB0` | XBee module on a local tty |
/// | `tcp:192.168.1.20:2000` | XBee module behind a serial-over-TCP bridge |
/// | `sim` | [`SimRadio::demo`] |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    Serial(PathBuf),
    Tcp(String),
    Sim,
}

impl LinkSpec {
    /// Build the driver for this link. Nothing is opened yet.
    pub fn build(&self, frame_timeout: Duration) -> Box<dyn Radio> {
        match self {
            LinkSpec::Serial(path) => {
                Box::new(XBeeRadio::serial(path.clone()).with_frame_timeout(frame_timeout))
            }
            LinkSpec::Tcp(addr) => {
                Box::new(XBeeRadio::tcp(addr.clone()).with_frame_timeout(frame_timeout))
            }
            LinkSpec::Sim => Box::new(SimRadio::demo()),
        }
    }
}

impl FromStr for LinkSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "sim" {
            return Ok(LinkSpec::Sim);
        }
        match s.split_once(':') {
            Some(("serial", path)) if !path.is_empty() => Ok(LinkSpec::Serial(PathBuf::from(path))),
            Some(("tcp", addr)) if addr.contains(':') => Ok(LinkSpec::Tcp(addr.to_string())),
            _ => Err(format!(
                "invalid radio link '{s}' (expected serial:<path>, tcp:<host:port> or sim)"
            )),
        }
    }
}

impl fmt::Display for LinkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkSpec::Serial(path) => write!(f, "serial:{}", path.display()),
            LinkSpec::Tcp(addr) => write!(f, "tcp:{addr}"),
            LinkSpec::Sim => f.write_str("sim"),
        }
    }
}
