use super::{Channel, SHORT_READ_WAIT};
use crate::{Error, LinkResult};
use std::{
    collections::VecDeque,
    io::{Read, Write},
    process::{Child, ChildStdin, Command, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
    thread,
    time::{Duration, Instant},
};

const BANNER_BUDGET: Duration = Duration::from_secs(1);
const FRIENDLY_PROMPT: &[u8] = b">>>";
const PUMP_CHUNK_SIZE: usize = 256;
const PUMP_QUEUE_DEPTH: usize = 64;

/// The stdio of a locally spawned interpreter process, combined into one
/// duplex byte stream. Reader threads pump stdout and stderr into an mpsc
/// queue so reads can honor deadlines; the child is killed on drop.
pub struct SubprocessChannel {
    child: Child,
    stdin: ChildStdin,
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    executable: String,
}

impl std::fmt::Debug for SubprocessChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessChannel")
            .field("executable", &self.executable)
            .field("pid", &self.child.id())
            .finish()
    }
}

impl SubprocessChannel {
    /// Spawns the interpreter with unbuffered, piped stdio and consumes its
    /// startup banner up to the first friendly prompt (or a 1 s budget).
    pub fn spawn(executable: &str) -> LinkResult<Self> {
        if executable.is_empty() {
            return Err(Error::InvalidArgument(
                "Interpreter executable path is empty".to_string(),
            ));
        }

        let mut child = Command::new(executable)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().expect("stdin was requested piped");
        let stdout = child.stdout.take().expect("stdout was requested piped");
        let stderr = child.stderr.take().expect("stderr was requested piped");

        let (tx, rx) = mpsc::sync_channel(PUMP_QUEUE_DEPTH);
        spawn_pump(stdout, tx.clone());
        spawn_pump(stderr, tx);

        let mut channel = Self {
            child,
            stdin,
            rx,
            pending: VecDeque::new(),
            executable: executable.to_string(),
        };
        channel.drain_banner()?;
        log::debug!(
            "spawned interpreter '{}' (pid {})",
            channel.executable,
            channel.child.id()
        );
        Ok(channel)
    }

    /// Reads until the interpreter's `>>>` prompt has been seen, or the
    /// banner budget expires. Either way the stream is left quiet.
    fn drain_banner(&mut self) -> LinkResult<()> {
        let deadline = Instant::now() + BANNER_BUDGET;
        let mut window: Vec<u8> = Vec::new();
        let mut chunk = [0u8; PUMP_CHUNK_SIZE];
        while Instant::now() < deadline {
            let n = self.read_available(&mut chunk, SHORT_READ_WAIT)?;
            if n == 0 {
                if window.windows(FRIENDLY_PROMPT.len()).any(|w| w == FRIENDLY_PROMPT) {
                    break;
                }
                continue;
            }
            window.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    fn fill_pending(&mut self, wait: Duration) -> LinkResult<()> {
        // Move anything already queued, then block once up to `wait`.
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(_) => break,
            }
        }
        if self.pending.is_empty() {
            match self.rx.recv_timeout(wait) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "interpreter process closed its output",
                    )));
                }
            }
        }
        Ok(())
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending.pop_front().expect("length checked");
        }
        n
    }
}

fn spawn_pump<R: Read + Send + 'static>(mut stream: R, tx: SyncSender<Vec<u8>>) {
    thread::spawn(move || {
        let mut chunk = [0u8; PUMP_CHUNK_SIZE];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

impl Channel for SubprocessChannel {
    fn read_exact(&mut self, buf: &mut [u8], deadline: Instant) -> LinkResult<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(Duration::ZERO));
            }
            let wait = (deadline - now).min(SHORT_READ_WAIT);
            self.fill_pending(wait)?;
            filled += self.take_pending(&mut buf[filled..]);
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> LinkResult<usize> {
        self.fill_pending(wait)?;
        Ok(self.take_pending(buf))
    }

    fn write_all(&mut self, bytes: &[u8]) -> LinkResult<()> {
        self.stdin.write_all(bytes).map_err(Error::Io)
    }

    fn flush(&mut self) -> LinkResult<()> {
        self.stdin.flush().map_err(Error::Io)
    }
}

impl Drop for SubprocessChannel {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            log::warn!("failed to kill interpreter process: {}", e);
        }
        let _ = self.child.wait();
    }
}
