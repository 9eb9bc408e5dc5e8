use super::{Channel, SHORT_READ_WAIT};
use crate::{Error, LinkResult};
use serial2::SerialPort;
use std::{
    io::{ErrorKind, Write},
    time::{Duration, Instant},
};

const BAUD_RATE: u32 = 115_200;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A serial port channel at 115200-8N1, no parity, no hardware flow
/// control. `serial2` opens the port in raw mode with echo disabled.
#[derive(Debug)]
pub struct SerialChannel {
    port: SerialPort,
    path: String,
}

impl SerialChannel {
    /// Opens and configures the serial device. On Unix-like systems the
    /// path must name a device node under `/dev/`.
    pub fn open(path: &str) -> LinkResult<Self> {
        if path.is_empty() {
            return Err(Error::InvalidArgument(
                "Serial device path is empty".to_string(),
            ));
        }
        #[cfg(unix)]
        if !path.starts_with("/dev/") {
            return Err(Error::InvalidArgument(format!(
                "Serial device path must begin with /dev/, got '{}'",
                path
            )));
        }

        let mut port = SerialPort::open(path, BAUD_RATE)?;
        port.set_read_timeout(SHORT_READ_WAIT)?;
        port.set_write_timeout(WRITE_TIMEOUT)?;
        // Stale bytes from a previous session would corrupt recovery.
        let _ = port.discard_input_buffer();
        log::debug!("opened serial channel on {}", path);
        Ok(Self {
            port,
            path: path.to_string(),
        })
    }

    /// The device path this channel was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Channel for SerialChannel {
    fn read_exact(&mut self, buf: &mut [u8], deadline: Instant) -> LinkResult<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(Duration::ZERO));
            }
            let wait = (deadline - now).min(SHORT_READ_WAIT);
            self.port.set_read_timeout(wait)?;
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "serial port closed",
                    )));
                }
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> LinkResult<usize> {
        self.port.set_read_timeout(wait.max(Duration::from_millis(1)))?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> LinkResult<()> {
        Write::write_all(&mut self.port, bytes).map_err(Error::Io)
    }

    fn flush(&mut self) -> LinkResult<()> {
        Write::flush(&mut self.port).map_err(Error::Io)
    }
}
