//! Host-side control of MicroPython devices over the Raw REPL protocol.
//!
//! The `mpylink` crate drives a MicroPython board (or a locally spawned
//! interpreter) over a plain byte transport, without ever touching the
//! interactive prompt. It implements:
//! * the Raw REPL and raw-paste execution protocols, including recovery
//!   from whatever state a previous session left the device in,
//! * capability detection (platform, version, raw-paste window, timing),
//! * chunked file transfer with base64 payloads and adaptive chunk sizing.
//!
//! Transports are a serial port (115200-8N1) or the stdio of a spawned
//! interpreter process; custom transports can be plugged in through the
//! [`transport::Channel`] trait.
//!
//! # Example
//! This example connects to a board over serial and evaluates an
//! expression on the device.
//!
//! ```no_run
//! # fn example() -> mpylink::LinkResult<()> {
//! use mpylink::DeviceBuilder;
//!
//! let device = DeviceBuilder::new().with_serial("/dev/ttyACM0").build()?;
//! let resp = device.execute("2+2")?;
//! assert_eq!(resp.result.as_deref(), Some("4"));
//! # Ok(())
//! # }
//! ```
//! # Example
//! This example spawns a local `micropython` interpreter via a connection
//! string and copies a file onto its filesystem.
//!
//! ```no_run
//! # fn example() -> mpylink::LinkResult<()> {
//! use mpylink::DeviceBuilder;
//!
//! let device = DeviceBuilder::new()
//!     .with_target("subprocess:micropython")?
//!     .build()?;
//! device.put_file("/data/config.json", b"{}")?;
//! # Ok(())
//! # }
//! ```
use std::{str::Utf8Error, time::Duration};

use thiserror::Error;

pub mod builder;
pub mod config;
pub mod device;
pub(crate) mod engine;
pub(crate) mod files;
pub(crate) mod optimizer;
pub mod transport;

pub use builder::DeviceBuilder;
pub use config::{Config, ConnectionTarget};
pub use device::{CancelHandle, Device};
pub use engine::Mode;
pub use engine::capabilities::Capabilities;
pub use engine::metrics::Metrics;
pub use engine::response::{Fault, FaultKind, Response};

/// Errors surfaced by the protocol engine and its transports.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("read did not complete within {0:?}")]
    Timeout(Duration),
    #[error("device failed to reach a known prompt after {attempts} startup attempts")]
    InitializationFailed { attempts: u32 },
    #[error("{0}")]
    ModeTransition(String),
    #[error("device did not acknowledge submitted code")]
    AcknowledgmentMissing,
    #[error("{0}")]
    ProtocolViolation(String),
    #[error("{0}")]
    DeviceError(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("device handle has been disposed")]
    Disposed,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
}

impl Error {
    /// Whether a failed execution may be redriven. Device-side tracebacks,
    /// caller mistakes, disposal and cancellation are final.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Timeout(_)
                | Error::ModeTransition(_)
                | Error::AcknowledgmentMissing
                | Error::ProtocolViolation(_)
        )
    }
}

pub type LinkResult<T> = std::result::Result<T, Error>;
