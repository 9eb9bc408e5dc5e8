/* Abstraction for the transport semantics */

use crate::LinkResult;
use std::time::{Duration, Instant};

mod serial;
mod subprocess;

pub use serial::SerialChannel;
pub use subprocess::SubprocessChannel;

pub(crate) const SHORT_READ_WAIT: Duration = Duration::from_millis(100);
pub(crate) const DRAIN_MAX_ATTEMPTS: u32 = 10;
const DRAIN_CHUNK_SIZE: usize = 256;

/// A duplex byte stream to a device. The stream preserves no message
/// boundaries; framing is entirely the protocol engine's concern. No data
/// is buffered outside these calls.
pub trait Channel: std::fmt::Debug + Send {
    /// Fills `buf` completely, failing with `Timeout` if the bytes do not
    /// arrive by `deadline`.
    fn read_exact(&mut self, buf: &mut [u8], deadline: Instant) -> LinkResult<()>;

    /// Returns whatever bytes are available within a short bounded wait.
    /// A quiet wait returns `Ok(0)`, not an error.
    fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> LinkResult<usize>;

    fn write_all(&mut self, bytes: &[u8]) -> LinkResult<()>;

    /// Mandatory after every control-byte write.
    fn flush(&mut self) -> LinkResult<()>;

    /// Repeatedly reads and discards pending input until one `quiet_window`
    /// passes without data, or `max_attempts` reads have been made.
    /// Returns the number of bytes discarded.
    fn drain(&mut self, max_attempts: u32, quiet_window: Duration) -> LinkResult<usize> {
        let mut chunk = [0u8; DRAIN_CHUNK_SIZE];
        let mut discarded = 0usize;
        for _ in 0..max_attempts {
            let n = self.read_available(&mut chunk, quiet_window)?;
            if n == 0 {
                break;
            }
            discarded += n;
        }
        Ok(discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::collections::VecDeque;

    const DRAIN_QUIET_WINDOW: Duration = Duration::from_millis(50);

    #[derive(Debug)]
    struct QueueChannel {
        pending: VecDeque<u8>,
        reads: u32,
    }

    impl Channel for QueueChannel {
        fn read_exact(&mut self, buf: &mut [u8], _deadline: Instant) -> LinkResult<()> {
            for slot in buf.iter_mut() {
                *slot = self
                    .pending
                    .pop_front()
                    .ok_or(Error::Timeout(Duration::ZERO))?;
            }
            Ok(())
        }

        fn read_available(&mut self, buf: &mut [u8], _wait: Duration) -> LinkResult<usize> {
            self.reads += 1;
            let n = buf.len().min(self.pending.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.pending.pop_front().unwrap();
            }
            Ok(n)
        }

        fn write_all(&mut self, _bytes: &[u8]) -> LinkResult<()> {
            Ok(())
        }

        fn flush(&mut self) -> LinkResult<()> {
            Ok(())
        }
    }

    #[test]
    fn drain_discards_pending_and_stops_on_quiet() {
        let mut ch = QueueChannel {
            pending: (0..600).map(|i| i as u8).collect(),
            reads: 0,
        };
        let n = ch.drain(DRAIN_MAX_ATTEMPTS, DRAIN_QUIET_WINDOW).unwrap();
        assert_eq!(n, 600);
        assert!(ch.pending.is_empty());
        // 256-byte chunks: three data reads plus the quiet one.
        assert_eq!(ch.reads, 4);
    }

    #[test]
    fn drain_gives_up_after_max_attempts() {
        let mut ch = QueueChannel {
            pending: (0..4096).map(|i| i as u8).collect(),
            reads: 0,
        };
        let n = ch.drain(3, DRAIN_QUIET_WINDOW).unwrap();
        assert_eq!(n, 3 * 256);
        assert_eq!(ch.reads, 3);
    }
}
