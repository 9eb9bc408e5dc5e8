/* The Raw REPL protocol engine: recovery, mode transitions, raw and
raw-paste execution, capability detection. One engine owns one channel;
all wire interaction happens through the single engine instance. */

use crate::{
    Error, LinkResult,
    config::Config,
    transport::{Channel, DRAIN_MAX_ATTEMPTS, SHORT_READ_WAIT},
};
use bytes::BytesMut;
use derive_more::Display;
use log::{debug, trace, warn};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

pub(crate) mod capabilities;
pub(crate) mod metrics;
pub(crate) mod response;

use capabilities::Capabilities;
use metrics::Metrics;
use response::Response;

// Control bytes of the Raw REPL dialect.
pub(crate) const ENTER_RAW: u8 = 0x01;
pub(crate) const EXIT_RAW: u8 = 0x02;
pub(crate) const INTERRUPT: u8 = 0x03;
pub(crate) const END_OF_DATA: u8 = 0x04;
pub(crate) const RAW_PASTE_PREFIX: u8 = 0x05;

const FLOW_GRANT: u8 = 0x01;
const RAW_PASTE_HANDSHAKE: [u8; 3] = [RAW_PASTE_PREFIX, b'A', ENTER_RAW];
const RAW_BANNER: &[u8] = b"raw REPL";
const FRIENDLY_PROMPT: &[u8] = b">>>";

const STARTUP_ATTEMPTS: u32 = 3;
const STARTUP_ESCALATION: f64 = 1.5;
const MAX_INTERRUPT_DELAY: Duration = Duration::from_secs(1);
const RECOVERY_STEP_PAUSE: Duration = Duration::from_millis(100);
const RECOVERY_DRAIN_BUDGET: Duration = Duration::from_millis(500);
const ACK_TIMEOUT_FACTOR: f64 = 0.5;
const BANNER_RETRY_BUDGET: Duration = Duration::from_secs(1);
const QUIET_WINDOW: Duration = Duration::from_millis(50);
const EXTENDED_QUIET_WINDOW: Duration = Duration::from_millis(100);
const TIMING_PROBES: u32 = 3;
const TIMING_HEADROOM: u32 = 5;
const RESPONSE_FLOOR_FACTOR: u32 = 3;
const SLOW_CHUNK_THRESHOLD: usize = 64;
const SLOW_CHUNK_PACING: Duration = Duration::from_millis(10);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub(crate) const CLEANUP_BUDGET: Duration = Duration::from_secs(2);

const FLOW_SENTINEL: &str = "FLOWCHK";
const FLOW_SENTINEL_SCRIPT: &str =
    "total = 0\nfor i in range(4):\n    total += i\nprint('FLOWCHK', total)";

/// The device mode as the engine believes it. Advisory: every mode entry
/// re-verifies the expected banner or prompt on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Mode {
    Normal,
    Raw,
    RawPaste,
}

/// Outcome of the raw-paste entry handshake. A refusal is control flow
/// consumed inside the engine, never a user-visible error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PasteEntry {
    Accepted { window: u16 },
    Refused,
}

#[derive(Debug)]
pub(crate) struct Engine {
    channel: Box<dyn Channel>,
    config: Config,
    mode: Mode,
    at_prompt: bool,
    raw_paste_enabled: bool,
    capabilities: Option<Capabilities>,
    /// Read timeout for protocol reads; raised by capability detection,
    /// never above `config.max_response_timeout`.
    response_timeout: Duration,
    startup_delay: Duration,
    interrupt_delay: Duration,
    extended_startup: bool,
    extended_interrupt: bool,
    metrics: Metrics,
    operation_in_progress: bool,
    needs_recovery: bool,
    cancel: Arc<AtomicBool>,
    disposed: bool,
}

// ======= Construction and lifecycle =======
impl Engine {
    pub(crate) fn new(channel: Box<dyn Channel>, config: Config, cancel: Arc<AtomicBool>) -> Self {
        let response_timeout = config.base_response_timeout;
        let startup_delay = config.startup_delay;
        let interrupt_delay = config.interrupt_delay;
        Self {
            channel,
            config,
            mode: Mode::Normal,
            at_prompt: false,
            raw_paste_enabled: false,
            capabilities: None,
            response_timeout,
            startup_delay,
            interrupt_delay,
            extended_startup: false,
            extended_interrupt: false,
            metrics: Metrics::default(),
            operation_in_progress: false,
            needs_recovery: false,
            cancel,
            disposed: false,
        }
    }

    /// Brings a device in an arbitrary prior state to the friendly prompt
    /// and detects its capabilities. Called once, before any execution.
    pub(crate) fn connect(&mut self) -> LinkResult<()> {
        self.recover();
        self.initialize()?;
        self.detect_capabilities()
    }

    pub(crate) fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether the trailing prompt of the current mode has been observed
    /// and not yet consumed by sending code.
    pub(crate) fn at_prompt(&self) -> bool {
        self.at_prompt
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn mark_needs_recovery(&mut self) {
        self.needs_recovery = true;
    }

    /// Idempotent. Attempts a bounded-budget exit from raw mode; the
    /// channel itself is released when the engine is dropped.
    pub(crate) fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        let saved = self.response_timeout;
        self.response_timeout = saved.min(CLEANUP_BUDGET);
        if self.mode != Mode::Normal {
            if let Err(e) = self.exit_raw() {
                debug!("raw-mode exit on dispose failed: {}", e);
            }
        }
        self.response_timeout = saved;
    }
}

// ======= Recovery and initialization =======
impl Engine {
    /// Best-effort cleanup of whatever state a previous session left the
    /// device in. Write failures are logged and ignored.
    fn recover(&mut self) {
        debug!("running recovery sequence");
        let steps: [&[u8]; 4] = [&[INTERRUPT, END_OF_DATA], &[EXIT_RAW], &[INTERRUPT], b"\r\n"];
        for (idx, bytes) in steps.iter().enumerate() {
            if let Err(e) = self.write_flush(bytes) {
                debug!("recovery step {} failed: {}", idx + 1, e);
            }
            if idx < steps.len() - 1 {
                let _ = self.sleep(RECOVERY_STEP_PAUSE);
            }
        }
        match self.drain_for(RECOVERY_DRAIN_BUDGET) {
            Ok(n) if n > 0 => trace!("recovery discarded {} bytes", n),
            Ok(_) => {}
            Err(e) => debug!("recovery drain failed: {}", e),
        }
        self.mode = Mode::Normal;
        self.at_prompt = false;
        self.needs_recovery = false;
    }

    /// Up to three interrupt-and-drain attempts, escalating the delays by
    /// 1.5x between attempts. Success means the friendly prompt was seen.
    fn initialize(&mut self) -> LinkResult<()> {
        for attempt in 1..=STARTUP_ATTEMPTS {
            match self.startup_attempt() {
                Ok(()) => {
                    self.mode = Mode::Normal;
                    self.at_prompt = true;
                    if attempt > 1 {
                        self.extended_startup = true;
                    }
                    debug!("device at friendly prompt after attempt {}", attempt);
                    return Ok(());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("startup attempt {} failed: {}", attempt, e);
                    self.startup_delay = self
                        .startup_delay
                        .mul_f64(STARTUP_ESCALATION)
                        .min(self.config.max_startup_delay);
                    self.interrupt_delay = self
                        .interrupt_delay
                        .mul_f64(STARTUP_ESCALATION)
                        .min(MAX_INTERRUPT_DELAY);
                    self.extended_startup = true;
                    self.extended_interrupt = true;
                }
            }
        }
        Err(Error::InitializationFailed {
            attempts: STARTUP_ATTEMPTS,
        })
    }

    fn startup_attempt(&mut self) -> LinkResult<()> {
        self.sleep(self.startup_delay)?;
        let quiet = self.quiet_window();
        self.channel.drain(DRAIN_MAX_ATTEMPTS, quiet)?;
        self.write_flush(&[b'\r', INTERRUPT])?;
        self.sleep(self.interrupt_delay)?;
        // The prompt wait doubles as the post-interrupt drain.
        let mut acc = BytesMut::new();
        self.read_accumulate(
            &mut acc,
            |b| find(b, FRIENDLY_PROMPT).is_some(),
            self.response_timeout,
        )?;
        Ok(())
    }
}

// ======= Capability detection =======
impl Engine {
    /// One pass, run exactly once after initialization. Individual probe
    /// failures are soft: the corresponding field simply stays unset.
    fn detect_capabilities(&mut self) -> LinkResult<()> {
        let mut caps = Capabilities {
            requires_extended_startup: self.extended_startup,
            requires_extended_interrupt_delay: self.extended_interrupt,
            ..Capabilities::default()
        };

        match self.probe("import sys\nprint(sys.platform)") {
            Ok(resp) if resp.success => {
                caps.platform = resp.result.filter(|s| !s.is_empty());
            }
            _ => debug!("platform probe failed"),
        }
        match self.probe("import sys\nprint(sys.version)") {
            Ok(resp) if resp.success => {
                caps.version = resp
                    .result
                    .and_then(|s| s.lines().next().map(str::to_string))
                    .filter(|s| !s.is_empty());
            }
            _ => debug!("version probe failed"),
        }

        if self.config.enable_raw_paste_autodetect {
            match self.paste_probe() {
                Ok(Some(window)) => {
                    caps.supports_raw_paste = true;
                    caps.preferred_window_size = window;
                    debug!("raw-paste advertised, window increment {}", window);
                }
                Ok(None) => debug!("raw-paste not advertised"),
                Err(e) => {
                    debug!("raw-paste probe failed: {}", e);
                    let quiet = self.quiet_window();
                    let _ = self.channel.drain(DRAIN_MAX_ATTEMPTS, quiet);
                    self.mode = Mode::Normal;
                    self.at_prompt = false;
                }
            }
        }
        caps.max_window_size = caps
            .preferred_window_size
            .max(self.config.maximum_window_size);

        let mut samples: Vec<Duration> = Vec::with_capacity(TIMING_PROBES as usize);
        for _ in 0..TIMING_PROBES {
            let started = Instant::now();
            if matches!(self.probe("1+1"), Ok(r) if r.success) {
                samples.push(started.elapsed());
            }
        }
        if !samples.is_empty() {
            let avg = samples.iter().sum::<Duration>() / samples.len() as u32;
            caps.average_response_time = avg;
            if avg * TIMING_HEADROOM > self.response_timeout {
                self.response_timeout =
                    (avg * TIMING_HEADROOM).min(self.config.max_response_timeout);
            }
        }

        if caps.supports_raw_paste {
            caps.has_reliable_flow_control = self.flow_control_check().unwrap_or(false);
            if !caps.has_reliable_flow_control {
                warn!("flow-control smoke test failed; raw-paste disabled");
            }
        }
        caps.supports_large_code_transfers = caps.has_reliable_flow_control;

        if caps.average_response_time > Duration::ZERO {
            let floor = caps.average_response_time * RESPONSE_FLOOR_FACTOR;
            if floor > self.response_timeout {
                self.response_timeout = floor.min(self.config.max_response_timeout);
            }
        }
        self.raw_paste_enabled = self.config.enable_raw_paste_autodetect
            && caps.supports_raw_paste
            && caps.has_reliable_flow_control;

        if let Err(e) = self.exit_raw() {
            debug!("exit to friendly prompt after detection failed: {}", e);
            self.needs_recovery = true;
        }
        debug!(
            "capabilities: platform={:?} version={:?} raw_paste={} window={}",
            caps.platform, caps.version, caps.supports_raw_paste, caps.preferred_window_size
        );
        self.capabilities = Some(caps);
        Ok(())
    }

    /// A low-level raw-mode execution used during detection. Leaves the
    /// engine in raw mode so consecutive probes skip re-entry.
    fn probe(&mut self, code: &str) -> LinkResult<Response> {
        self.enter_raw()?;
        let out = self.execute_raw(&normalize(code));
        if out.is_err() {
            let quiet = self.quiet_window();
            let _ = self.channel.drain(DRAIN_MAX_ATTEMPTS, quiet);
            self.mode = Mode::Normal;
            self.at_prompt = false;
        }
        out
    }

    /// Checks the raw-paste advertisement and exits the paste prompt
    /// cleanly with an empty payload.
    fn paste_probe(&mut self) -> LinkResult<Option<u16>> {
        self.enter_raw()?;
        match self.try_enter_paste()? {
            PasteEntry::Accepted { window } => {
                let outcome: LinkResult<()> = (|| {
                    self.write_flush(&[END_OF_DATA])?;
                    let mut acc = BytesMut::new();
                    self.read_accumulate(&mut acc, response_complete, self.response_timeout)?;
                    Ok(())
                })();
                self.mode = Mode::Raw;
                self.at_prompt = outcome.is_ok();
                outcome?;
                Ok(Some(window))
            }
            PasteEntry::Refused => Ok(None),
        }
    }

    /// Streams a small multi-line script through raw-paste and checks the
    /// sentinel made it to stdout.
    fn flow_control_check(&mut self) -> LinkResult<bool> {
        self.enter_raw()?;
        match self.try_enter_paste()? {
            PasteEntry::Accepted { window } => {
                let resp = self.send_paste(&normalize(FLOW_SENTINEL_SCRIPT), window)?;
                Ok(resp.success && resp.stdout.contains(FLOW_SENTINEL))
            }
            PasteEntry::Refused => Ok(false),
        }
    }
}

// ======= Execution =======
impl Engine {
    pub(crate) fn execute(&mut self, code: &str) -> LinkResult<Response> {
        self.execute_with_limit(code, None)
    }

    /// Executes a code fragment with an optional one-shot read-timeout
    /// override (used by file-transfer cleanup).
    pub(crate) fn execute_with_limit(
        &mut self,
        code: &str,
        timeout_override: Option<Duration>,
    ) -> LinkResult<Response> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        if code.trim().is_empty() {
            return Err(Error::InvalidArgument("Code fragment is empty".to_string()));
        }
        if self.operation_in_progress {
            return Err(Error::InvalidArgument(
                "An operation is already in progress on this engine".to_string(),
            ));
        }
        self.operation_in_progress = true;
        let started = Instant::now();
        let saved_timeout = self.response_timeout;
        if let Some(t) = timeout_override {
            self.response_timeout = t;
        }
        let outcome = self.run_with_retries(code);
        self.response_timeout = saved_timeout;
        let success = matches!(&outcome, Ok(r) if r.success);
        self.metrics.record(started.elapsed(), success);
        self.operation_in_progress = false;
        outcome
    }

    fn run_with_retries(&mut self, code: &str) -> LinkResult<Response> {
        let code = normalize(code);
        if self.needs_recovery {
            self.recover();
        }
        let mut attempt = 1u32;
        loop {
            match self.execute_once(&code) {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < self.config.max_retry_attempts => {
                    self.metrics.note_retry();
                    warn!("execution attempt {} failed: {}; retrying", attempt, e);
                    let backoff = self.config.retry_delay * 2u32.pow(attempt - 1);
                    if let Err(e) = self.sleep(backoff) {
                        self.needs_recovery = true;
                        return Err(e);
                    }
                    // Redrive from a known prompt; no full recovery between
                    // attempts.
                    let quiet = self.quiet_window();
                    let _ = self.channel.drain(DRAIN_MAX_ATTEMPTS, quiet);
                    self.mode = Mode::Normal;
                    self.at_prompt = false;
                    attempt += 1;
                }
                Err(e) => {
                    self.needs_recovery = true;
                    return Err(e);
                }
            }
        }
    }

    fn execute_once(&mut self, code: &str) -> LinkResult<Response> {
        self.enter_raw()?;
        let resp = if self.raw_paste_enabled {
            match self.try_enter_paste()? {
                PasteEntry::Accepted { window } => self.send_paste(code, window)?,
                PasteEntry::Refused => {
                    // Session-wide fallback; deliberately not charged
                    // against the retry budget.
                    debug!("device refused raw-paste; falling back to raw mode");
                    self.raw_paste_enabled = false;
                    let quiet = self.quiet_window();
                    let _ = self.channel.drain(DRAIN_MAX_ATTEMPTS, quiet);
                    self.execute_raw(code)?
                }
            }
        } else {
            self.execute_raw(code)?
        };
        self.exit_raw()?;
        Ok(resp)
    }

    /// Sends code in raw mode and parses the two-stage response.
    /// Precondition: `mode == Raw`.
    fn execute_raw(&mut self, code: &str) -> LinkResult<Response> {
        if self.config.verbose_logging {
            trace!("raw exec, {} code bytes", code.len());
        }
        self.channel.write_all(code.as_bytes())?;
        self.channel.flush()?;
        self.write_flush(&[END_OF_DATA])?;
        self.at_prompt = false;

        let ack_timeout = self.response_timeout.mul_f64(ACK_TIMEOUT_FACTOR);
        let mut acc = BytesMut::with_capacity(256);
        match self.read_accumulate(&mut acc, |b| find(b, b"OK").is_some(), ack_timeout) {
            Ok(()) => {}
            Err(Error::Timeout(_)) => return Err(Error::AcknowledgmentMissing),
            Err(e) => return Err(e),
        }
        self.read_accumulate(&mut acc, response_complete, self.response_timeout)?;
        self.at_prompt = true;
        let start = find(&acc, b"OK").unwrap_or(0);
        Ok(response::parse(&acc[start..]))
    }

    /// The raw-paste entry handshake. Leaves `mode == RawPaste` only on
    /// acceptance.
    fn try_enter_paste(&mut self) -> LinkResult<PasteEntry> {
        self.write_flush(&RAW_PASTE_HANDSHAKE)?;
        let mut acc = BytesMut::new();
        if let Err(e) = self.read_accumulate(&mut acc, |b| b.contains(&b'\n'), self.response_timeout)
        {
            return match e {
                Error::Timeout(_) => Ok(PasteEntry::Refused),
                e => Err(e),
            };
        }
        let nl = acc
            .iter()
            .position(|b| *b == b'\n')
            .expect("newline just observed");
        let line_buf = acc.split_to(nl + 1);
        let mut line: &[u8] = &line_buf[..nl];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        match (line.first().copied(), line.get(1).copied()) {
            (Some(b'R'), Some(0x01)) => {
                self.read_accumulate(&mut acc, |b| b.len() >= 2, self.response_timeout)?;
                let window = u16::from_le_bytes([acc[0], acc[1]]);
                self.mode = Mode::RawPaste;
                self.at_prompt = false;
                if self.config.verbose_logging {
                    trace!("raw-paste accepted, window increment {}", window);
                }
                Ok(PasteEntry::Accepted { window })
            }
            (Some(b'R'), Some(0x00)) => Ok(PasteEntry::Refused),
            _ => Ok(PasteEntry::Refused),
        }
    }

    /// Streams code under window-based flow control, then reads the
    /// response. The mode rolls back to `Raw` on every exit path.
    fn send_paste(&mut self, code: &str, advertised: u16) -> LinkResult<Response> {
        let outcome = self.stream_paste(code, advertised);
        self.mode = Mode::Raw;
        outcome
    }

    fn stream_paste(&mut self, code: &str, advertised: u16) -> LinkResult<Response> {
        let window_increment = self
            .config
            .preferred_window_size
            .unwrap_or(advertised)
            .max(1) as usize;
        let data = code.as_bytes();
        let mut remaining = window_increment;
        let mut sent = 0usize;
        while sent < data.len() {
            self.check_cancel()?;
            if remaining == 0 {
                match self.read_flow_byte()? {
                    FLOW_GRANT => remaining += window_increment,
                    END_OF_DATA => {
                        // The device demands an abort; acknowledge and stop
                        // without reading further flow-control bytes.
                        self.write_flush(&[END_OF_DATA])?;
                        debug!("device aborted raw-paste transfer at byte {}", sent);
                        return Ok(Response::aborted());
                    }
                    other => {
                        return Err(Error::ProtocolViolation(format!(
                            "Unexpected flow-control byte 0x{:02x}",
                            other
                        )));
                    }
                }
            }
            let n = remaining.min(data.len() - sent);
            self.channel.write_all(&data[sent..sent + n])?;
            self.channel.flush()?;
            sent += n;
            remaining -= n;
            if self.extended_interrupt && n > SLOW_CHUNK_THRESHOLD {
                self.sleep(SLOW_CHUNK_PACING)?;
            }
        }
        self.write_flush(&[END_OF_DATA])?;

        let mut acc = BytesMut::with_capacity(256);
        self.read_accumulate(&mut acc, response_complete, self.response_timeout)?;
        self.at_prompt = true;
        let start = find(&acc, b"OK").unwrap_or(0);
        Ok(response::parse(&acc[start..]))
    }
}

// ======= Mode transitions =======
impl Engine {
    /// Enters raw mode, verifying the banner on the wire even when the
    /// engine already believes another transition happened.
    fn enter_raw(&mut self) -> LinkResult<()> {
        if self.mode == Mode::Raw {
            return Ok(());
        }
        self.write_flush(&[ENTER_RAW])?;
        let mut acc = BytesMut::new();
        match self.read_accumulate(&mut acc, raw_banner_seen, self.response_timeout) {
            Ok(()) => {}
            Err(Error::Timeout(_)) => {
                // One more grace read before giving up on the banner.
                self.sleep(self.interrupt_delay)?;
                self.read_accumulate(&mut acc, raw_banner_seen, BANNER_RETRY_BUDGET)
                    .map_err(|e| match e {
                        Error::Timeout(_) => Error::ModeTransition(
                            "Raw REPL banner not observed after ENTER_RAW".to_string(),
                        ),
                        e => e,
                    })?;
            }
            Err(e) => return Err(e),
        }
        self.mode = Mode::Raw;
        self.at_prompt = true;
        Ok(())
    }

    /// Exits to the friendly prompt.
    fn exit_raw(&mut self) -> LinkResult<()> {
        if self.mode == Mode::Normal {
            return Ok(());
        }
        self.write_flush(&[EXIT_RAW])?;
        let mut acc = BytesMut::new();
        self.read_accumulate(&mut acc, |b| b.contains(&b'>'), self.response_timeout)?;
        self.mode = Mode::Normal;
        self.at_prompt = true;
        Ok(())
    }
}

// ======= Wire helpers =======
impl Engine {
    fn write_flush(&mut self, bytes: &[u8]) -> LinkResult<()> {
        self.channel.write_all(bytes)?;
        self.channel.flush()
    }

    /// Accumulates channel bytes into `acc` until `done(acc)` holds.
    /// Cancellation is observed on every iteration.
    fn read_accumulate<F>(&mut self, acc: &mut BytesMut, done: F, timeout: Duration) -> LinkResult<()>
    where
        F: Fn(&[u8]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];
        loop {
            self.check_cancel()?;
            if done(acc) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            let wait = (deadline - now).min(SHORT_READ_WAIT);
            let n = self.channel.read_available(&mut chunk, wait)?;
            if n > 0 {
                acc.extend_from_slice(&chunk[..n]);
            }
        }
    }

    fn read_flow_byte(&mut self) -> LinkResult<u8> {
        let mut acc = BytesMut::new();
        self.read_accumulate(&mut acc, |b| !b.is_empty(), self.response_timeout)?;
        Ok(acc[0])
    }

    /// Discards pending input until a quiet window or the budget elapses.
    fn drain_for(&mut self, budget: Duration) -> LinkResult<usize> {
        let deadline = Instant::now() + budget;
        let quiet = self.quiet_window();
        let mut chunk = [0u8; 256];
        let mut total = 0usize;
        while Instant::now() < deadline {
            self.check_cancel()?;
            let n = self.channel.read_available(&mut chunk, quiet)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn quiet_window(&self) -> Duration {
        if self.extended_startup {
            EXTENDED_QUIET_WINDOW
        } else {
            QUIET_WINDOW
        }
    }

    /// Cancellable sleep; backoff and pacing waits all come through here.
    fn sleep(&self, dur: Duration) -> LinkResult<()> {
        let deadline = Instant::now() + dur;
        loop {
            self.check_cancel()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
        }
    }

    fn check_cancel(&self) -> LinkResult<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Trailing-whitespace strip plus line-ending normalization to `\n`.
pub(crate) fn normalize(code: &str) -> String {
    code.trim_end().replace("\r\n", "\n").replace('\r', "\n")
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A response is complete once both EOF separators and a terminating `>`
/// after the second one have arrived.
fn response_complete(acc: &[u8]) -> bool {
    let mut eofs = 0usize;
    for (i, b) in acc.iter().enumerate() {
        if *b == END_OF_DATA {
            eofs += 1;
            if eofs == 2 {
                return acc[i + 1..].contains(&b'>');
            }
        }
    }
    false
}

/// The raw banner counts only once its trailing prompt has arrived, so the
/// prompt byte is consumed together with the banner.
fn raw_banner_seen(acc: &[u8]) -> bool {
    match find(acc, RAW_BANNER) {
        Some(i) => acc[i + RAW_BANNER.len()..].contains(&b'>'),
        None => false,
    }
}
