// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Device state migration.
//!
//! A migratable device exposes its internal state as a byte stream that the kernel driver
//! produces while the device is in a saving state and consumes while it is resuming. [`Migration`]
//! drives the device through its states and moves that stream in and out of the migration
//! stream, either inline in the main channel (interleaved with markers) or, with multifd, as
//! indexed [`DeviceStatePacket`]s that the destination reorders in a [`LoadPipeline`].
//!
//! Inline stream layout of one device section:
//!
//! ```text
//! DEV_SETUP_STATE END_OF_STATE                          (setup)
//! DEV_DATA_STATE <be64 size> <size bytes> ... END_OF_STATE  (each iteration)
//! DEV_CONFIG_STATE <device config> END_OF_STATE         (config)
//! ```

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, error, warn};
use vmm_sys_util::errno;

use crate::bql::{Bql, BqlGuard};
use crate::device::Device;

mod load;
mod packet;
mod save;

pub use load::LoadPipeline;
pub use packet::{DeviceStatePacket, PacketFlags, PACKET_HEADER_SIZE, PACKET_VERSION};
pub use save::{send_device_state, PacketSink};

/// Ends a device section.
pub const END_OF_STATE: u64 = 0xffff_ffff_ef10_0001;
/// Starts the device configuration.
pub const DEV_CONFIG_STATE: u64 = 0xffff_ffff_ef10_0002;
/// Starts the setup section.
pub const DEV_SETUP_STATE: u64 = 0xffff_ffff_ef10_0003;
/// Starts a chunk of device data.
pub const DEV_DATA_STATE: u64 = 0xffff_ffff_ef10_0004;

/// Default size of the chunks read from the device state stream.
pub const DEFAULT_DATA_BUFFER_SIZE: usize = 1 << 20;

/// Blocker set when several devices migrate without peer-to-peer support.
pub const MULTIPLE_DEVICES_BLOCKER: &str =
    "Multiple VFIO devices migration is supported only if all of them support P2P migration";

/// Errors of the migration layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Querying the migration features of the device failed.
    #[error("Failed to query migration features: {0}")]
    Features(#[source] errno::Error),
    /// The device cannot stop-copy, which every migratable device must.
    #[error("{0}: device does not support stop-copy migration")]
    NoStopCopy(String),
    /// A device state transition failed.
    #[error("Failed setting device state to {state:?}: {source}")]
    SetState {
        /// Requested state.
        state: DeviceState,
        /// Host errno.
        #[source]
        source: errno::Error,
    },
    /// The operation needs the device in another state.
    #[error("Device is in state {actual:?}, expected {expected:?}")]
    InvalidState {
        /// Required state.
        expected: DeviceState,
        /// Current state.
        actual: DeviceState,
    },
    /// The device has no state stream open.
    #[error("No device state stream in state {0:?}")]
    NoDataStream(DeviceState),
    /// Reading or writing the device state stream failed.
    #[error("Device state stream: {0}")]
    Io(#[from] io::Error),
    /// The migration stream carries an unexpected marker.
    #[error("Unexpected marker {found:#x}, expected {expected:#x}")]
    UnexpectedMarker {
        /// Marker that should have followed.
        expected: u64,
        /// Marker found.
        found: u64,
    },
    /// The migration stream carries an unknown marker.
    #[error("Unknown marker {0:#x}")]
    UnknownMarker(u64),
    /// Device config arrived in the main channel while it travels over multifd.
    #[error("Config in main migration channel but multifd transfer enabled")]
    UnexpectedConfig,
    /// The device configuration could not be saved.
    #[error("Failed to save device config: {0}")]
    ConfigSave(#[source] io::Error),
    /// The device configuration could not be loaded.
    #[error("Failed to load device config: {0}")]
    ConfigLoad(#[source] io::Error),
    /// A packet shorter than its header.
    #[error("Device state packet too short: {0} bytes")]
    PacketTooShort(usize),
    /// A packet of an unknown version.
    #[error("Unsupported device state packet version {0}")]
    PacketVersion(u32),
    /// A packet with an invalid index.
    #[error("Invalid device state packet index {0:#x}")]
    PacketIndex(u32),
    /// A packet with unknown flags.
    #[error("Unknown device state packet flags {0:#x}")]
    PacketFlags(u32),
    /// A buffer index was received twice.
    #[error("State buffer {0} already filled")]
    DuplicateBuffer(u32),
    /// Queuing the buffer would exceed the queued bytes limit.
    #[error("Queuing state buffer of {requested} bytes over {queued} queued exceeds the limit of {max}")]
    QueueFull {
        /// Bytes already queued.
        queued: u64,
        /// Size of the rejected buffer.
        requested: u64,
        /// Configured limit.
        max: u64,
    },
    /// A second config packet was received.
    #[error("Config state packet {second} after config packet {first}")]
    DuplicateConfig {
        /// Index of the first config packet.
        first: u32,
        /// Index of the second one.
        second: u32,
    },
    /// The load pipeline lock was requested by a thread holding the big lock.
    #[error("Load pipeline lock requested while holding the big lock")]
    LockOrder,
    /// The transfer was cancelled.
    #[error("Device state transfer cancelled")]
    Cancelled,
    /// The load pipeline consumer is no longer running.
    #[error("Device state load thread has exited")]
    PipelineStopped,
    /// The load pipeline consumer panicked.
    #[error("Device state load thread panicked")]
    ConsumerPanicked,
    /// Multifd device state transfer requested without multifd.
    #[error("Multifd device transfer requested but multifd not configured")]
    MultifdNotConfigured,
    /// Several devices would migrate without peer-to-peer support.
    #[error("Multiple VFIO devices migration is supported only if all of them support P2P migration")]
    MultipleDevices,
}

/// Result of migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// States of a migratable device.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceState {
    /// The device failed a transition and must be reset.
    Error = 0,
    /// Stopped, no state stream.
    Stop = 1,
    /// Running normally.
    #[default]
    Running = 2,
    /// Stopped, saving its state.
    StopCopy = 3,
    /// Stopped, loading its state.
    Resuming = 4,
    /// Running without initiating peer-to-peer DMA.
    RunningP2p = 5,
    /// Running, saving its state.
    PreCopy = 6,
    /// Like `PreCopy` without initiating peer-to-peer DMA.
    PreCopyP2p = 7,
}

impl DeviceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DeviceState::Stop,
            2 => DeviceState::Running,
            3 => DeviceState::StopCopy,
            4 => DeviceState::Resuming,
            5 => DeviceState::RunningP2p,
            6 => DeviceState::PreCopy,
            7 => DeviceState::PreCopyP2p,
            _ => DeviceState::Error,
        }
    }

    /// Whether the device runs.
    pub fn is_running(self) -> bool {
        matches!(self, DeviceState::Running | DeviceState::RunningP2p)
    }

    /// Whether the device runs while saving its state.
    pub fn is_precopy(self) -> bool {
        matches!(self, DeviceState::PreCopy | DeviceState::PreCopyP2p)
    }

    /// Whether entering this state opens a device state stream.
    pub fn opens_data_stream(self) -> bool {
        matches!(
            self,
            DeviceState::StopCopy
                | DeviceState::Resuming
                | DeviceState::PreCopy
                | DeviceState::PreCopyP2p
        )
    }
}

bitflags! {
    /// Migration features of a device.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MigrationFlags: u64 {
        /// Stop-copy migration.
        const STOP_COPY = 1 << 0;
        /// Peer-to-peer quiescent states.
        const P2P = 1 << 1;
        /// Pre-copy migration.
        const PRE_COPY = 1 << 2;
    }
}

/// Tri-state device option.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnOffAuto {
    /// Required; failing to provide it is an error.
    On,
    /// Disabled.
    Off,
    /// Used when available.
    #[default]
    Auto,
}

/// Per-device migration knobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Whether the device must, may or must not migrate.
    pub enable_migration: OnOffAuto,
    /// Whether dirty tracking runs during pre-copy.
    pub pre_copy_dirty_page_tracking: OnOffAuto,
    /// Whether device DMA logging may be used.
    pub device_dirty_page_tracking: OnOffAuto,
    /// Whether device state travels over multifd channels.
    pub multifd_transfer: OnOffAuto,
    /// Limit on bytes received but not yet written to the device.
    pub max_queued_buffers_size: u64,
    /// Whether the config is loaded only after the iteration-complete signal.
    pub load_config_after_iter: OnOffAuto,
    /// Size of the chunks read from the device state stream.
    pub data_buffer_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            enable_migration: OnOffAuto::Auto,
            pre_copy_dirty_page_tracking: OnOffAuto::Auto,
            device_dirty_page_tracking: OnOffAuto::Auto,
            multifd_transfer: OnOffAuto::Auto,
            max_queued_buffers_size: u64::MAX,
            load_config_after_iter: OnOffAuto::Auto,
            data_buffer_size: DEFAULT_DATA_BUFFER_SIZE,
        }
    }
}

impl MigrationConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> MigrationConfigBuilder {
        MigrationConfigBuilder {
            config: MigrationConfig::default(),
        }
    }

    /// Whether config load waits for the iteration-complete signal. `Auto` defers only where
    /// the interrupt controller state must be restored first.
    pub fn defer_config_load(&self) -> bool {
        match self.load_config_after_iter {
            OnOffAuto::On => true,
            OnOffAuto::Off => false,
            OnOffAuto::Auto => cfg!(target_arch = "aarch64"),
        }
    }
}

/// Builder for [`MigrationConfig`].
#[derive(Debug)]
pub struct MigrationConfigBuilder {
    config: MigrationConfig,
}

impl MigrationConfigBuilder {
    /// Set whether the device must migrate.
    pub fn with_enable_migration(mut self, v: OnOffAuto) -> Self {
        self.config.enable_migration = v;
        self
    }

    /// Set whether dirty tracking runs during pre-copy.
    pub fn with_pre_copy_dirty_page_tracking(mut self, v: OnOffAuto) -> Self {
        self.config.pre_copy_dirty_page_tracking = v;
        self
    }

    /// Set whether device DMA logging may be used.
    pub fn with_device_dirty_page_tracking(mut self, v: OnOffAuto) -> Self {
        self.config.device_dirty_page_tracking = v;
        self
    }

    /// Set whether device state travels over multifd channels.
    pub fn with_multifd_transfer(mut self, v: OnOffAuto) -> Self {
        self.config.multifd_transfer = v;
        self
    }

    /// Set the limit on queued but unwritten bytes.
    pub fn with_max_queued_buffers_size(mut self, v: u64) -> Self {
        self.config.max_queued_buffers_size = v;
        self
    }

    /// Set whether config load waits for the iteration-complete signal.
    pub fn with_load_config_after_iter(mut self, v: OnOffAuto) -> Self {
        self.config.load_config_after_iter = v;
        self
    }

    /// Set the size of the chunks read from the device state stream.
    pub fn with_data_buffer_size(mut self, v: usize) -> Self {
        self.config.data_buffer_size = v.max(1);
        self
    }

    /// Finish the configuration.
    pub fn build(self) -> MigrationConfig {
        self.config
    }
}

/// Migration status of a device, shared with its container for dirty sync gating.
#[derive(Debug)]
pub struct MigrationStatus {
    supported: AtomicBool,
    state: AtomicU8,
}

impl Default for MigrationStatus {
    fn default() -> Self {
        MigrationStatus {
            supported: AtomicBool::new(false),
            state: AtomicU8::new(DeviceState::Running as u8),
        }
    }
}

impl MigrationStatus {
    /// Record whether the device supports migration.
    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::Release);
    }

    /// Whether the device supports migration.
    pub fn has_migration(&self) -> bool {
        self.supported.load(Ordering::Acquire)
    }

    /// Record the device state.
    pub fn set_state(&self, state: DeviceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Current device state.
    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// The device state stream: read while saving, written while resuming.
pub trait DataStream: Read + Write + Send {}

impl<T: Read + Write + Send> DataStream for T {}

/// Remaining pre-copy data reported by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrecopyInfo {
    /// Bytes of initial state not read yet.
    pub initial_bytes: u64,
    /// Bytes of state dirtied since.
    pub dirty_bytes: u64,
}

/// Kernel migration interface of one device.
pub trait MigrationDriver: Send {
    /// Supported migration features.
    fn features(&mut self) -> errno::Result<MigrationFlags>;
    /// Move the device to `state`, returning the state stream when the state opens one.
    fn set_state(&mut self, state: DeviceState) -> errno::Result<Option<Box<dyn DataStream>>>;
    /// Remaining pre-copy data.
    fn precopy_info(&mut self) -> errno::Result<PrecopyInfo>;
    /// Reset the device, which returns it to `Running`.
    fn reset(&mut self) -> errno::Result<()>;
}

/// The device model part of the migrated state, guarded by the big lock.
pub trait DeviceConfig {
    /// Serialize the configuration.
    fn save_config(&mut self, out: &mut dyn Write) -> io::Result<()>;
    /// Restore the configuration, reading exactly what [`save_config`](Self::save_config)
    /// wrote.
    fn load_config(&mut self, input: &mut dyn Read) -> io::Result<()>;
}

fn write_be64(out: &mut dyn Write, v: u64) -> Result<()> {
    out.write_all(&v.to_be_bytes())?;
    Ok(())
}

fn read_be64(input: &mut dyn Read) -> Result<u64> {
    let mut b = [0u8; 8];
    input.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

fn expect_marker(input: &mut dyn Read, expected: u64) -> Result<()> {
    let found = read_be64(input)?;
    if found != expected {
        return Err(Error::UnexpectedMarker { expected, found });
    }
    Ok(())
}

/// Serialize `config` framed by `DEV_CONFIG_STATE` and `END_OF_STATE`.
pub fn encode_config<M: DeviceConfig + ?Sized>(config: &mut M) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_be64(&mut buf, DEV_CONFIG_STATE)?;
    config.save_config(&mut buf).map_err(Error::ConfigSave)?;
    write_be64(&mut buf, END_OF_STATE)?;
    Ok(buf)
}

/// Load a configuration framed by [`encode_config`].
pub fn decode_config<M: DeviceConfig + ?Sized>(config: &mut M, blob: &[u8]) -> Result<()> {
    let mut input = io::Cursor::new(blob);
    expect_marker(&mut input, DEV_CONFIG_STATE)?;
    config.load_config(&mut input).map_err(Error::ConfigLoad)?;
    expect_marker(&mut input, END_OF_STATE)
}

/// Migration state of one device.
pub struct Migration {
    name: String,
    driver: Box<dyn MigrationDriver>,
    status: Arc<MigrationStatus>,
    config: MigrationConfig,
    flags: MigrationFlags,
    state: DeviceState,
    data: Option<Box<dyn DataStream>>,
    precopy_init_size: u64,
    precopy_dirty_size: u64,
    multifd: bool,
}

impl Migration {
    /// Probe the migration features of device `name`.
    ///
    /// Fails when the device cannot stop-copy.
    pub fn new(
        name: &str,
        mut driver: Box<dyn MigrationDriver>,
        status: Arc<MigrationStatus>,
        config: MigrationConfig,
    ) -> Result<Self> {
        let flags = driver.features().map_err(Error::Features)?;
        if !flags.contains(MigrationFlags::STOP_COPY) {
            return Err(Error::NoStopCopy(name.to_owned()));
        }
        status.set_supported(true);
        status.set_state(DeviceState::Running);
        Ok(Migration {
            name: name.to_owned(),
            driver,
            status,
            config,
            flags,
            state: DeviceState::Running,
            data: None,
            precopy_init_size: 0,
            precopy_dirty_size: 0,
            multifd: false,
        })
    }

    /// Migration features of the device.
    pub fn flags(&self) -> MigrationFlags {
        self.flags
    }

    /// Current device state.
    pub fn device_state(&self) -> DeviceState {
        self.state
    }

    /// Whether device state travels over multifd channels.
    pub fn multifd(&self) -> bool {
        self.multifd
    }

    /// Pre-copy bytes the device still has to send.
    pub fn precopy_pending(&self) -> u64 {
        self.precopy_init_size + self.precopy_dirty_size
    }

    fn enter(&mut self, state: DeviceState, stream: Option<Box<dyn DataStream>>) {
        if !state.opens_data_stream() {
            self.data = None;
        } else if stream.is_some() {
            self.data = stream;
        }
        self.state = state;
        self.status.set_state(state);
    }

    fn reset_device(&mut self) {
        match self.driver.reset() {
            Ok(()) => self.enter(DeviceState::Running, None),
            Err(e) => {
                error!("{}: Failed to reset device: {}", self.name, e);
                self.enter(DeviceState::Error, None);
            }
        }
    }

    /// Move the device to `new`. On failure the device is moved to `recover`, or reset if
    /// `recover` is `Error` or cannot be entered either.
    pub fn set_state(&mut self, new: DeviceState, recover: DeviceState) -> Result<()> {
        let source = match self.driver.set_state(new) {
            Ok(stream) => {
                debug!("{}: {:?} -> {:?}", self.name, self.state, new);
                self.enter(new, stream);
                return Ok(());
            }
            Err(e) => e,
        };
        let err = Error::SetState { state: new, source };

        if recover == DeviceState::Error {
            error!("{}: {}. Recover state is ERROR. Resetting device", self.name, err);
            self.reset_device();
            return Err(err);
        }
        error!("{}: {}", self.name, err);
        match self.driver.set_state(recover) {
            Ok(stream) => self.enter(recover, stream),
            Err(e) => {
                error!(
                    "{}: Failed setting device in recover state {:?}: {}. Resetting device",
                    self.name, recover, e
                );
                self.reset_device();
            }
        }
        Err(err)
    }

    /// Follow a VM run state change.
    pub fn vm_state_change(&mut self, running: bool) -> Result<()> {
        let new = if running {
            DeviceState::Running
        } else if self.state.is_precopy() {
            DeviceState::StopCopy
        } else {
            DeviceState::Stop
        };
        if new == self.state {
            return Ok(());
        }
        self.set_state(new, DeviceState::Error)
    }

    /// Resolve whether device state travels over multifd given whether migration uses multifd
    /// channels at all.
    pub fn multifd_transfer_setup(&mut self, multifd_active: bool) -> Result<bool> {
        self.multifd = match self.config.multifd_transfer {
            OnOffAuto::Off => false,
            OnOffAuto::Auto => multifd_active,
            OnOffAuto::On if multifd_active => true,
            OnOffAuto::On => return Err(Error::MultifdNotConfigured),
        };
        Ok(self.multifd)
    }

    fn update_precopy_sizes(&mut self) {
        match self.driver.precopy_info() {
            Ok(info) => {
                self.precopy_init_size = info.initial_bytes;
                self.precopy_dirty_size = info.dirty_bytes;
            }
            Err(e) => {
                warn!("{}: Failed to query pre-copy size: {}", self.name, e);
                self.precopy_init_size = 0;
                self.precopy_dirty_size = 0;
            }
        }
    }

    /// Start saving: write the setup section and enter pre-copy when the device supports it.
    pub fn save_setup(&mut self, out: &mut dyn Write) -> Result<()> {
        write_be64(out, DEV_SETUP_STATE)?;
        if self.flags.contains(MigrationFlags::PRE_COPY) {
            match self.state {
                DeviceState::Running => {
                    self.set_state(DeviceState::PreCopy, DeviceState::Running)?;
                    self.update_precopy_sizes();
                }
                // Stopped VM: the device goes straight to stop-copy.
                DeviceState::Stop => (),
                actual => {
                    return Err(Error::InvalidState {
                        expected: DeviceState::Running,
                        actual,
                    })
                }
            }
        }
        write_be64(out, END_OF_STATE)
    }

    // Read one chunk from the device and frame it into `out`. Returns the chunk size.
    fn save_block(&mut self, out: &mut dyn Write) -> Result<u64> {
        let precopy = self.state.is_precopy();
        let data = self
            .data
            .as_mut()
            .ok_or(Error::NoDataStream(self.state))?;
        let mut buf = vec![0u8; self.config.data_buffer_size];
        let n = loop {
            match data.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // No pre-copy data right now.
                Err(e) if precopy && e.raw_os_error() == Some(libc::ENOMSG) => break 0,
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            return Ok(0);
        }
        write_be64(out, DEV_DATA_STATE)?;
        write_be64(out, n as u64)?;
        out.write_all(&buf[..n])?;
        Ok(n as u64)
    }

    /// Send one pre-copy chunk. Returns whether the device has no pre-copy data left.
    pub fn save_iterate(&mut self, out: &mut dyn Write) -> Result<bool> {
        let n = self.save_block(out)?;
        if self.state.is_precopy() {
            let from_init = n.min(self.precopy_init_size);
            self.precopy_init_size -= from_init;
            self.precopy_dirty_size = self.precopy_dirty_size.saturating_sub(n - from_init);
        }
        write_be64(out, END_OF_STATE)?;
        Ok(self.precopy_pending() == 0)
    }

    /// Drain the remaining device state after the VM stopped, then stop the device.
    pub fn complete_precopy(&mut self, out: &mut dyn Write) -> Result<()> {
        if self.state != DeviceState::StopCopy {
            self.set_state(DeviceState::StopCopy, DeviceState::Stop)?;
        }
        if !self.multifd {
            while self.save_block(out)? != 0 {}
        }
        write_be64(out, END_OF_STATE)?;
        if !self.multifd {
            self.set_state(DeviceState::Stop, DeviceState::Error)?;
        }
        Ok(())
    }

    /// Write the device configuration section.
    pub fn save_config<M: DeviceConfig + ?Sized>(
        &self,
        out: &mut dyn Write,
        config: &mut M,
    ) -> Result<()> {
        out.write_all(&encode_config(config)?)?;
        Ok(())
    }

    /// Send the device state over multifd channels. The device must be in stop-copy.
    ///
    /// Returns the number of packets sent.
    pub fn multifd_save<M: DeviceConfig>(
        &mut self,
        sink: &mut dyn PacketSink,
        should_abort: &dyn Fn() -> bool,
        bql: &Bql<M>,
    ) -> Result<u32> {
        if self.state != DeviceState::StopCopy {
            return Err(Error::InvalidState {
                expected: DeviceState::StopCopy,
                actual: self.state,
            });
        }
        let chunk = self.config.data_buffer_size;
        let data = self
            .data
            .as_mut()
            .ok_or(Error::NoDataStream(self.state))?;
        let sent = send_device_state(data, chunk, sink, should_abort, bql)?;
        self.set_state(DeviceState::Stop, DeviceState::Error)?;
        Ok(sent)
    }

    /// Prepare the device to receive its state.
    pub fn load_setup(&mut self) -> Result<()> {
        let recover = self.state;
        self.set_state(DeviceState::Resuming, recover)
    }

    /// Load one device section from the main migration channel.
    pub fn load_state<M: DeviceConfig + ?Sized>(
        &mut self,
        input: &mut dyn Read,
        config: &mut M,
    ) -> Result<()> {
        loop {
            match read_be64(input)? {
                END_OF_STATE => return Ok(()),
                DEV_SETUP_STATE => return expect_marker(input, END_OF_STATE),
                DEV_CONFIG_STATE => {
                    if self.multifd {
                        return Err(Error::UnexpectedConfig);
                    }
                    config.load_config(input).map_err(Error::ConfigLoad)?;
                    return expect_marker(input, END_OF_STATE);
                }
                DEV_DATA_STATE => {
                    let size = read_be64(input)?;
                    let data = self
                        .data
                        .as_mut()
                        .ok_or(Error::NoDataStream(self.state))?;
                    let copied = io::copy(&mut (&mut *input).take(size), data)?;
                    if copied != size {
                        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                    }
                }
                other => return Err(Error::UnknownMarker(other)),
            }
        }
    }

    /// Start the multifd load pipeline. The device must be resuming; its state stream moves to
    /// the pipeline until [`multifd_load_finish`](Self::multifd_load_finish).
    pub fn multifd_load_start<M>(
        &mut self,
        bql: Arc<Bql<M>>,
    ) -> Result<LoadPipeline<Box<dyn DataStream>, M>>
    where
        M: DeviceConfig + Send + 'static,
    {
        if !self.multifd {
            return Err(Error::MultifdNotConfigured);
        }
        if self.state != DeviceState::Resuming {
            return Err(Error::InvalidState {
                expected: DeviceState::Resuming,
                actual: self.state,
            });
        }
        let data = self.data.take().ok_or(Error::NoDataStream(self.state))?;
        LoadPipeline::start(
            &self.name,
            data,
            bql,
            self.config.max_queued_buffers_size,
            self.config.defer_config_load(),
        )
    }

    /// Wait for the multifd load pipeline to finish and take the state stream back.
    pub fn multifd_load_finish<M>(
        &mut self,
        pipeline: LoadPipeline<Box<dyn DataStream>, M>,
        guard: Option<&mut BqlGuard<'_, M>>,
    ) -> Result<()>
    where
        M: DeviceConfig + Send + 'static,
    {
        let data = pipeline.finish(guard)?;
        self.data = Some(data);
        Ok(())
    }
}

impl Device {
    /// Set up migration with the device's kernel migration interface.
    ///
    /// A device that cannot migrate gets a migration blocker instead, unless migration is
    /// required by its configuration, in which case this fails.
    pub fn init_migration(&mut self, driver: Box<dyn MigrationDriver>) -> Result<()> {
        let config = self.migration_config().clone();
        if config.enable_migration == OnOffAuto::Off {
            self.migration_blocker = Some(format!(
                "{}: Migration is disabled for VFIO device",
                self.name()
            ));
            return Ok(());
        }
        match Migration::new(self.name(), driver, self.migration_status().clone(), config) {
            Ok(m) => {
                self.migration = Some(m);
                self.migration_blocker = None;
                Ok(())
            }
            Err(e) if self.migration_config().enable_migration == OnOffAuto::On => Err(e),
            Err(e) => {
                warn!("{}: {}", self.name(), e);
                self.migration_blocker = Some(format!(
                    "{}: VFIO device doesn't support migration",
                    self.name()
                ));
                Ok(())
            }
        }
    }
}
