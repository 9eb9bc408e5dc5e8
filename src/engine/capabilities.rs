// Device capability record, detected once after initialization.
use std::time::Duration;

/// What capability detection learned about the connected device. Populated
/// exactly once, before the first user-visible execution, and immutable
/// thereafter.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Value of `sys.platform`, if the probe succeeded.
    pub platform: Option<String>,
    /// First line of `sys.version`, if the probe succeeded.
    pub version: Option<String>,
    pub supports_raw_paste: bool,
    /// Device-advertised window increment; 0 if unknown.
    pub preferred_window_size: u16,
    /// Max of the advertised increment and the configured ceiling.
    pub max_window_size: u16,
    /// Mean wall-clock duration of three `1+1` executions.
    pub average_response_time: Duration,
    /// Initialization needed more than one attempt or an enlarged delay.
    pub requires_extended_startup: bool,
    pub requires_extended_interrupt_delay: bool,
    /// The flow-control smoke test produced its sentinel.
    pub has_reliable_flow_control: bool,
    pub supports_large_code_transfers: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            platform: None,
            version: None,
            supports_raw_paste: false,
            preferred_window_size: 0,
            max_window_size: 0,
            average_response_time: Duration::ZERO,
            requires_extended_startup: false,
            requires_extended_interrupt_delay: false,
            // Both are earned by the flow-control smoke test, which only
            // runs when raw-paste was detected.
            has_reliable_flow_control: false,
            supports_large_code_transfers: false,
        }
    }
}
