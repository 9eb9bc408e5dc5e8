// The user-facing device handle. One handle owns one engine and its
// transport; calls are strictly serialized by the single-writer lock.
use crate::{
    Error, LinkResult,
    engine::{Engine, Mode, capabilities::Capabilities, metrics::Metrics, response::Response},
    files,
};
use log::debug;
use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};

/// Cancels the in-flight operation of the [`Device`] it was obtained from.
/// Reads and delays observe the signal at their next suspension point; the
/// device-side program may keep running, and the next call recovers the
/// session first.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// A connected MicroPython device. Operations lock the engine for their
/// full duration, including every read; the Nth call completes before the
/// N+1th touches the wire.
#[derive(Debug)]
pub struct Device {
    engine: Mutex<Engine>,
    cancel: Arc<AtomicBool>,
    disposed: AtomicBool,
}

impl Device {
    pub(crate) fn new(engine: Engine, cancel: Arc<AtomicBool>) -> Self {
        Self {
            engine: Mutex::new(engine),
            cancel,
            disposed: AtomicBool::new(false),
        }
    }

    /// Executes a UTF-8 Python fragment on the device and returns its
    /// framed response. Device-side tracebacks come back as a `Response`
    /// with `success == false`, not as an `Err`.
    pub fn execute(&self, code: &str) -> LinkResult<Response> {
        let mut engine = self.lock_for_operation()?;
        engine.execute(code)
    }

    /// Writes `data` to `remote_path` on the device filesystem.
    pub fn put_file(&self, remote_path: &str, data: &[u8]) -> LinkResult<()> {
        let mut engine = self.lock_for_operation()?;
        files::put_file(&mut engine, remote_path, data)
    }

    /// Reads the contents of `remote_path` from the device filesystem.
    pub fn get_file(&self, remote_path: &str) -> LinkResult<Vec<u8>> {
        let mut engine = self.lock_for_operation()?;
        files::get_file(&mut engine, remote_path)
    }

    /// A snapshot of the capabilities detected at connection time.
    pub fn capabilities(&self) -> LinkResult<Capabilities> {
        let engine = self.lock()?;
        engine.capabilities().cloned().ok_or_else(|| {
            Error::InvalidArgument("Capabilities have not been detected yet".to_string())
        })
    }

    /// A snapshot of the operation counters.
    pub fn metrics(&self) -> LinkResult<Metrics> {
        Ok(self.lock()?.metrics().clone())
    }

    /// The engine's current belief of the device mode. Advisory; every
    /// mode entry re-verifies the expected banner or prompt on the wire.
    pub fn mode(&self) -> LinkResult<Mode> {
        Ok(self.lock()?.mode())
    }

    /// Whether the device is sitting at an unconsumed prompt.
    pub fn at_prompt(&self) -> LinkResult<bool> {
        Ok(self.lock()?.at_prompt())
    }

    /// A handle for cancelling this device's in-flight operation from
    /// another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: self.cancel.clone(),
        }
    }

    /// Idempotent. Leaves raw mode on a best-effort, bounded budget and
    /// rejects every later operation with `Disposed`. The transport is
    /// released when the device is dropped.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("disposing device handle");
        match self.engine.lock() {
            Ok(mut engine) => engine.dispose(),
            Err(poisoned) => poisoned.into_inner().dispose(),
        }
    }

    /// Clears a stale cancellation signal, then locks: the signal targets
    /// the operation in flight, not future ones.
    fn lock_for_operation(&self) -> LinkResult<MutexGuard<'_, Engine>> {
        self.cancel.store(false, Ordering::Relaxed);
        self.lock()
    }

    fn lock(&self) -> LinkResult<MutexGuard<'_, Engine>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        match self.engine.lock() {
            Ok(guard) => Ok(guard),
            // A panic mid-operation leaves the session dirty; recover on
            // the next call instead of refusing service forever.
            Err(poisoned) => {
                let mut guard = poisoned.into_inner();
                guard.mark_needs_recovery();
                Ok(guard)
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.dispose();
    }
}
