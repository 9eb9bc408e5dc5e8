// Two-stage response framing: OK <stdout> 0x04 <stderr> 0x04 >
use super::END_OF_DATA;
use derive_more::Display;

const TRACEBACK_MARKERS: [&str; 3] = ["Traceback", "Error", "Exception"];

/// The outcome of one execution on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub success: bool,
    /// Normal device output with the EOF framing stripped.
    pub stdout: String,
    /// Device traceback text with the EOF framing stripped.
    pub stderr: String,
    /// Stdout with the leading `OK` marker and framing stripped, trimmed.
    /// Present only on success.
    pub result: Option<String>,
    pub error: Option<Fault>,
}

/// Why a returned [`Response`] carries `success == false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FaultKind {
    /// A Python traceback was produced on the device.
    DeviceExecution,
    /// The device demanded an abort during a raw-paste transfer.
    TransferAborted,
}

impl Response {
    pub(crate) fn aborted() -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            result: None,
            error: Some(Fault {
                kind: FaultKind::TransferAborted,
                message: "device aborted the raw-paste transfer".to_string(),
            }),
        }
    }
}

/// Parses the accumulated post-code bytes. `raw` spans from the `OK`
/// acknowledgment up to and including the terminating `>`.
pub(crate) fn parse(raw: &[u8]) -> Response {
    let mut regions = raw.splitn(3, |b| *b == END_OF_DATA);
    let stdout_bytes = regions.next().unwrap_or_default();
    let stderr_bytes = regions.next().unwrap_or_default();

    let stdout_text = String::from_utf8_lossy(stdout_bytes);
    let stdout = stdout_text
        .strip_prefix("OK")
        .unwrap_or(&stdout_text)
        .to_string();
    let stderr = String::from_utf8_lossy(stderr_bytes).to_string();

    // Tolerant classification: a traceback anywhere in the accumulation
    // marks the execution as failed on the device.
    let text = String::from_utf8_lossy(raw);
    if TRACEBACK_MARKERS.iter().any(|m| text.contains(m)) {
        let message = summarize_traceback(&stderr, &stdout);
        return Response {
            success: false,
            stdout,
            stderr,
            result: None,
            error: Some(Fault {
                kind: FaultKind::DeviceExecution,
                message,
            }),
        };
    }

    let result = stdout.trim_matches(['\r', '\n', '\t', ' ']).to_string();
    Response {
        success: true,
        stdout,
        stderr,
        result: Some(result),
        error: None,
    }
}

/// Picks the line naming the raised error, falling back to the first
/// non-empty traceback line.
fn summarize_traceback(stderr: &str, stdout: &str) -> String {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    source
        .lines()
        .filter(|l| !l.trim().is_empty())
        .find(|l| l.contains("Error") || l.contains("Exception"))
        .or_else(|| source.lines().find(|l| !l.trim().is_empty()))
        .unwrap_or("device reported an execution error")
        .trim()
        .to_string()
}
