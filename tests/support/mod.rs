// An in-memory MicroPython Raw REPL emulator. It speaks the friendly,
// raw, and raw-paste dialects byte by byte, runs a small set of canned
// code fragments against an in-memory filesystem, and logs every
// host-to-device write for wire-level assertions.
use base64::{Engine as _, engine::general_purpose::STANDARD};
use mpylink::{Config, Device, DeviceBuilder, Error, LinkResult, transport::Channel};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

const ENTER_RAW: u8 = 0x01;
const EXIT_RAW: u8 = 0x02;
const INTERRUPT: u8 = 0x03;
const END_OF_DATA: u8 = 0x04;
const RAW_PASTE_PREFIX: u8 = 0x05;

const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
const FRIENDLY: &[u8] = b"\r\n>>> ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmuMode {
    Friendly,
    Raw,
    Paste,
}

#[derive(Debug)]
struct OpenFile {
    path: String,
    cursor: usize,
}

#[derive(Debug)]
pub struct ReplEmulator {
    mode: EmuMode,
    out: VecDeque<u8>,
    code: Vec<u8>,
    handshake: u8,
    pub raw_paste_supported: bool,
    pub window: u16,
    since_grant: usize,
    /// Answer the next flow-control grant point with an abort instead.
    pub abort_next_grant: bool,
    /// Drop all input on the floor; the device goes silent.
    pub mute: bool,
    /// Swallow END_OF_DATA in raw mode so no `OK` is ever produced.
    pub swallow_eof: bool,
    /// Every write_all payload, in order.
    pub writes: Vec<Vec<u8>>,
    fs: HashMap<String, Vec<u8>>,
    open: Option<OpenFile>,
}

impl ReplEmulator {
    pub fn new(raw_paste_supported: bool, window: u16) -> Self {
        Self {
            mode: EmuMode::Friendly,
            out: VecDeque::new(),
            code: Vec::new(),
            handshake: 0,
            raw_paste_supported,
            window,
            since_grant: 0,
            abort_next_grant: false,
            mute: false,
            swallow_eof: false,
            writes: Vec::new(),
            fs: HashMap::new(),
            open: None,
        }
    }

    /// A device abandoned at the raw prompt by a previous session.
    pub fn stuck_in_raw(raw_paste_supported: bool, window: u16) -> Self {
        let mut emu = Self::new(raw_paste_supported, window);
        emu.mode = EmuMode::Raw;
        emu
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.fs.get(path).map(Vec::as_slice)
    }

    pub fn has_open_file(&self) -> bool {
        self.open.is_some()
    }

    /// Drains and returns the write log.
    pub fn take_writes(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.writes)
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.writes.push(bytes.to_vec());
        if self.mute {
            return;
        }
        for b in bytes {
            match self.mode {
                EmuMode::Friendly => self.feed_friendly(*b),
                EmuMode::Raw => self.feed_raw(*b),
                EmuMode::Paste => self.feed_paste(*b),
            }
        }
    }

    fn feed_friendly(&mut self, b: u8) {
        match b {
            ENTER_RAW => {
                self.mode = EmuMode::Raw;
                self.code.clear();
                self.handshake = 0;
                self.out.extend(RAW_BANNER);
            }
            EXIT_RAW => self.out.extend(FRIENDLY),
            INTERRUPT => self.out.extend(b"\r\nKeyboardInterrupt\r\n>>> "),
            END_OF_DATA => self.out.extend(b"MPY: soft reboot\r\n>>> "),
            b'\r' => self.out.extend(FRIENDLY),
            _ => {}
        }
    }

    fn feed_raw(&mut self, b: u8) {
        match self.handshake {
            1 => {
                if b == b'A' {
                    self.handshake = 2;
                    return;
                }
                self.code.push(RAW_PASTE_PREFIX);
                self.handshake = 0;
            }
            2 => {
                if b == ENTER_RAW {
                    self.handshake = 0;
                    self.answer_paste_handshake();
                    return;
                }
                self.code.extend([RAW_PASTE_PREFIX, b'A']);
                self.handshake = 0;
            }
            _ => {}
        }
        match b {
            RAW_PASTE_PREFIX => self.handshake = 1,
            ENTER_RAW => {
                // Re-entering raw mode re-emits the banner.
                self.code.clear();
                self.out.extend(RAW_BANNER);
            }
            END_OF_DATA => {
                if self.swallow_eof {
                    self.code.clear();
                } else {
                    self.run_and_respond();
                }
            }
            INTERRUPT => {
                self.code.clear();
                self.out.extend(b"\r\n>");
            }
            EXIT_RAW => {
                self.mode = EmuMode::Friendly;
                self.out.extend(FRIENDLY);
            }
            _ => self.code.push(b),
        }
    }

    fn feed_paste(&mut self, b: u8) {
        if b == END_OF_DATA {
            self.run_and_respond();
            return;
        }
        self.code.push(b);
        self.since_grant += 1;
        if self.since_grant >= self.window as usize {
            self.since_grant = 0;
            if self.abort_next_grant {
                self.abort_next_grant = false;
                self.out.push_back(END_OF_DATA);
            } else {
                self.out.push_back(0x01);
            }
        }
    }

    fn answer_paste_handshake(&mut self) {
        if self.raw_paste_supported {
            self.out.extend([b'R', 0x01, b'\n']);
            self.out.extend(self.window.to_le_bytes());
            self.mode = EmuMode::Paste;
            self.code.clear();
            self.since_grant = 0;
        } else {
            self.out.extend(b"R\x00\n>");
        }
    }

    fn run_and_respond(&mut self) {
        let code = String::from_utf8_lossy(&self.code).to_string();
        self.code.clear();
        let (stdout, stderr) = self.run(&code);
        self.out.extend(b"OK");
        self.out.extend(stdout.as_bytes());
        self.out.push_back(END_OF_DATA);
        self.out.extend(stderr.as_bytes());
        self.out.push_back(END_OF_DATA);
        self.out.push_back(b'>');
        self.mode = EmuMode::Raw;
    }

    fn run(&mut self, code: &str) -> (String, String) {
        let code = code.trim();
        if code.is_empty() {
            return (String::new(), String::new());
        }
        match code {
            "2+2" => return ("4\r\n".to_string(), String::new()),
            "1+1" => return ("2\r\n".to_string(), String::new()),
            "1" => return ("1\r\n".to_string(), String::new()),
            "1/0" => {
                return (
                    String::new(),
                    "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nZeroDivisionError: divide by zero\r\n"
                        .to_string(),
                );
            }
            "import sys\nprint(sys.platform)" => {
                return ("fakeboard\r\n".to_string(), String::new());
            }
            "import sys\nprint(sys.version)" => {
                return (
                    "3.4.0; FakePy v1.22.0 on 2026-01-01\r\n".to_string(),
                    String::new(),
                );
            }
            _ => {}
        }
        if code.ends_with("print('A'*50)") {
            return (format!("{}\r\n", "A".repeat(50)), String::new());
        }
        if code.contains("print('FLOWCHK', total)") {
            return ("FLOWCHK 6\r\n".to_string(), String::new());
        }
        if let Some(rest) = code.strip_prefix("f=open('") {
            if let Some(idx) = rest.find("','") {
                let path = unescape(&rest[..idx]);
                if rest[idx..].starts_with("','wb')") {
                    self.fs.insert(path.clone(), Vec::new());
                    self.open = Some(OpenFile { path, cursor: 0 });
                    return (String::new(), String::new());
                }
                if self.fs.contains_key(&path) {
                    self.open = Some(OpenFile { path, cursor: 0 });
                    return (String::new(), String::new());
                }
                return (
                    String::new(),
                    "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nOSError: [Errno 2] ENOENT\r\n"
                        .to_string(),
                );
            }
        }
        if let Some(rest) = code.strip_prefix("w(__import__('binascii').a2b_base64('") {
            if let Some(end) = rest.find("'))") {
                let payload = STANDARD
                    .decode(&rest[..end])
                    .expect("emulator fed invalid base64");
                if let Some(open) = &self.open {
                    let path = open.path.clone();
                    self.fs
                        .get_mut(&path)
                        .expect("file was opened for write")
                        .extend_from_slice(&payload);
                }
                return (String::new(), String::new());
            }
        }
        if let Some(rest) = code.strip_prefix("data=r(") {
            if let Some(end) = rest.find(')') {
                let n: usize = rest[..end].parse().expect("chunk size is numeric");
                if let Some(open) = &mut self.open {
                    let data = self.fs.get(&open.path).cloned().unwrap_or_default();
                    let start = open.cursor.min(data.len());
                    let stop = (open.cursor + n).min(data.len());
                    open.cursor = stop;
                    if start == stop {
                        return ("EOF\r\n".to_string(), String::new());
                    }
                    return (
                        format!("{}\r\n", STANDARD.encode(&data[start..stop])),
                        String::new(),
                    );
                }
                return ("EOF\r\n".to_string(), String::new());
            }
        }
        if code.starts_with("try: f.close()") {
            self.open = None;
            return (String::new(), String::new());
        }
        (String::new(), String::new())
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Adapts a shared [`ReplEmulator`] to the transport trait. Reads pull
/// from the emulator's output queue; writes feed its state machine.
#[derive(Debug)]
pub struct EmulatorChannel {
    emu: Arc<Mutex<ReplEmulator>>,
}

impl EmulatorChannel {
    pub fn new(emu: Arc<Mutex<ReplEmulator>>) -> Self {
        Self { emu }
    }
}

const POLL: Duration = Duration::from_millis(1);

impl Channel for EmulatorChannel {
    fn read_exact(&mut self, buf: &mut [u8], deadline: Instant) -> LinkResult<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            {
                let mut emu = self.emu.lock().unwrap();
                while filled < buf.len() {
                    match emu.out.pop_front() {
                        Some(b) => {
                            buf[filled] = b;
                            filled += 1;
                        }
                        None => break,
                    }
                }
            }
            if filled < buf.len() {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout(Duration::ZERO));
                }
                thread::sleep(POLL);
            }
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> LinkResult<usize> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut emu = self.emu.lock().unwrap();
                if !emu.out.is_empty() {
                    let n = buf.len().min(emu.out.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = emu.out.pop_front().expect("length checked");
                    }
                    return Ok(n);
                }
            }
            if Instant::now() >= deadline {
                return Ok(0);
            }
            thread::sleep(POLL);
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> LinkResult<()> {
        self.emu.lock().unwrap().feed(bytes);
        Ok(())
    }

    fn flush(&mut self) -> LinkResult<()> {
        Ok(())
    }
}

/// Short delays so the suite stays fast; semantics are unchanged.
pub fn test_config() -> Config {
    Config {
        base_response_timeout: Duration::from_secs(1),
        startup_delay: Duration::from_millis(10),
        interrupt_delay: Duration::from_millis(10),
        retry_delay: Duration::from_millis(50),
        ..Config::default()
    }
}

/// Connects a device over a fresh emulator, returning both ends.
pub fn connect(emu: ReplEmulator, config: Config) -> LinkResult<(Device, Arc<Mutex<ReplEmulator>>)> {
    let shared = Arc::new(Mutex::new(emu));
    let device = DeviceBuilder::new()
        .with_channel(Box::new(EmulatorChannel::new(shared.clone())))
        .config(config)
        .build()?;
    Ok((device, shared))
}
