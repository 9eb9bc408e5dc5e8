// Contains the client tunables and connection target parsing
use crate::{Error, LinkResult};
use std::{fmt::Display, str::FromStr, time::Duration};

pub(crate) const DEFAULT_BASE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_STARTUP_DELAY: Duration = Duration::from_millis(200);
pub(crate) const DEFAULT_MAX_STARTUP_DELAY: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_INTERRUPT_DELAY: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub(crate) const DEFAULT_MAXIMUM_WINDOW_SIZE: u16 = 2048;

/// Tunables recognized by the protocol engine. All durations are starting
/// values; the engine adapts some of them upward from capability detection,
/// never beyond the configured ceilings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Starting read timeout for protocol reads.
    pub base_response_timeout: Duration,
    /// Ceiling for the read timeout after adaptive bumps.
    pub max_response_timeout: Duration,
    /// Idle period before the first interrupt of a startup attempt.
    pub startup_delay: Duration,
    /// Ceiling for the startup delay after retry escalation.
    pub max_startup_delay: Duration,
    /// Delay after Ctrl-C before draining device output.
    pub interrupt_delay: Duration,
    /// Base of the exponential-backoff retry schedule.
    pub retry_delay: Duration,
    /// Execution attempts per call before the failure is surfaced.
    pub max_retry_attempts: u32,
    /// Soft cap on the raw-paste flow-control window.
    pub maximum_window_size: u16,
    /// Overrides the device-advertised window increment if set.
    pub preferred_window_size: Option<u16>,
    /// When false the engine never attempts raw-paste mode.
    pub enable_raw_paste_autodetect: bool,
    /// Widens the diagnostic trace surface; protocol behavior is unchanged.
    pub verbose_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_response_timeout: DEFAULT_BASE_RESPONSE_TIMEOUT,
            max_response_timeout: DEFAULT_MAX_RESPONSE_TIMEOUT,
            startup_delay: DEFAULT_STARTUP_DELAY,
            max_startup_delay: DEFAULT_MAX_STARTUP_DELAY,
            interrupt_delay: DEFAULT_INTERRUPT_DELAY,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            maximum_window_size: DEFAULT_MAXIMUM_WINDOW_SIZE,
            preferred_window_size: None,
            enable_raw_paste_autodetect: true,
            verbose_logging: false,
        }
    }
}

/// A parsed `"<type>:<parameter>"` connection string. The type selects the
/// transport; the parameter is the device path or interpreter executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// A serial port, e.g. `serial:/dev/ttyACM0`.
    Serial(String),
    /// A locally spawned interpreter, e.g. `subprocess:micropython`.
    Subprocess(String),
}

impl FromStr for ConnectionTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, param) = s.split_once(':').ok_or_else(|| {
            Error::InvalidArgument(format!(
                "Connection string must be '<type>:<parameter>', got '{}'",
                s
            ))
        })?;
        if param.is_empty() {
            return Err(Error::InvalidArgument(
                "Connection string parameter is empty".to_string(),
            ));
        }
        match kind.to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial(param.to_string())),
            "subprocess" => Ok(Self::Subprocess(param.to_string())),
            other => Err(Error::InvalidArgument(format!(
                "Unknown connection type '{}', expected 'serial' or 'subprocess'",
                other
            ))),
        }
    }
}

impl Display for ConnectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial(p) => write!(f, "serial:{}", p),
            Self::Subprocess(p) => write!(f, "subprocess:{}", p),
        }
    }
}

impl ConnectionTarget {
    /// Parses a connection string, accepting the type tag case-insensitively.
    pub fn parse(s: &str) -> LinkResult<Self> {
        Self::from_str(s)
    }
}
