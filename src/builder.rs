/* Defines the builder functionality for the Device with serial,
subprocess, and caller-provided transports. */

use crate::{
    Config, LinkResult,
    config::ConnectionTarget,
    device::Device,
    engine::Engine,
    transport::{Channel, SerialChannel, SubprocessChannel},
};
use std::{
    marker::PhantomData,
    sync::{Arc, atomic::AtomicBool},
};

// Type-state builder states for the DeviceBuilder
pub struct Init;
pub struct Target;
pub struct Custom;

/// Type-state builder for a [`Device`], keyed on how the transport is
/// obtained.
pub struct DeviceBuilder<T> {
    target: Option<ConnectionTarget>,
    channel: Option<Box<dyn Channel>>,
    config: Config,
    _marker: PhantomData<T>,
}

impl DeviceBuilder<Init> {
    /// Starts the type-state builder pattern.
    pub fn new() -> DeviceBuilder<Init> {
        Self {
            target: None,
            channel: None,
            config: Config::default(),
            _marker: PhantomData,
        }
    }

    /// Continues in the path to build the device over a serial port.
    pub fn with_serial(self, device_path: &str) -> DeviceBuilder<Target> {
        DeviceBuilder {
            target: Some(ConnectionTarget::Serial(device_path.to_string())),
            channel: None,
            config: self.config,
            _marker: PhantomData,
        }
    }

    /// Continues in the path to build the device over the stdio of a
    /// locally spawned interpreter.
    pub fn with_subprocess(self, executable: &str) -> DeviceBuilder<Target> {
        DeviceBuilder {
            target: Some(ConnectionTarget::Subprocess(executable.to_string())),
            channel: None,
            config: self.config,
            _marker: PhantomData,
        }
    }

    /// Continues with a `"<type>:<parameter>"` connection string, e.g.
    /// `serial:/dev/ttyACM0` or `subprocess:micropython`.
    pub fn with_target(self, connection: &str) -> LinkResult<DeviceBuilder<Target>> {
        let target = ConnectionTarget::parse(connection)?;
        Ok(DeviceBuilder {
            target: Some(target),
            channel: None,
            config: self.config,
            _marker: PhantomData,
        })
    }

    /// Continues with a caller-provided transport channel.
    pub fn with_channel(self, channel: Box<dyn Channel>) -> DeviceBuilder<Custom> {
        DeviceBuilder {
            target: None,
            channel: Some(channel),
            config: self.config,
            _marker: PhantomData,
        }
    }
}

impl Default for DeviceBuilder<Init> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeviceBuilder<T> {
    /// Replaces the default tunables.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }
}

impl DeviceBuilder<Target> {
    /// Opens the transport and connects: recovery, initialization, and
    /// capability detection all complete before the device is returned.
    pub fn build(self) -> LinkResult<Device> {
        let target = self
            .target
            .expect("connection target required to reach the target build method");
        let channel: Box<dyn Channel> = match &target {
            ConnectionTarget::Serial(path) => Box::new(SerialChannel::open(path)?),
            ConnectionTarget::Subprocess(exe) => Box::new(SubprocessChannel::spawn(exe)?),
        };
        connect(channel, self.config)
    }
}

impl DeviceBuilder<Custom> {
    /// Connects over the caller-provided channel.
    pub fn build(self) -> LinkResult<Device> {
        let channel = self
            .channel
            .expect("channel required to reach the custom build method");
        connect(channel, self.config)
    }
}

fn connect(channel: Box<dyn Channel>, config: Config) -> LinkResult<Device> {
    let cancel = Arc::new(AtomicBool::new(false));
    let mut engine = Engine::new(channel, config, cancel.clone());
    engine.connect()?;
    Ok(Device::new(engine, cancel))
}
