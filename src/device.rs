// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Passthrough devices as seen by the DMA mapping layer.
//!
//! A [`Device`] is owned by whoever created it (typically a PCI device model). It only refers to
//! the container it is attached to through a [`ContainerHandle`]; the container in turn keeps
//! the per-device state it needs for dirty tracking and migration gating.

use std::fmt::{self, Debug};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use vmm_sys_util::errno;

use crate::backend::{DeviceInfo, VfioUserProxy};
use crate::container::ContainerHandle;
use crate::dirty::IovaRange;
use crate::migration::{Migration, MigrationConfig, MigrationStatus};

/// Process-unique identity of a [`Device`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DeviceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// How the host exposes a device.
#[derive(Clone)]
pub enum DeviceTransport {
    /// A device inside a VFIO IOMMU group.
    Group {
        /// IOMMU group number.
        group_id: u32,
    },
    /// A VFIO device character device, driven through iommufd.
    Cdev {
        /// Path of the device node.
        path: PathBuf,
    },
    /// A device implemented by a vfio-user server.
    User {
        /// Connected proxy to the server.
        proxy: Arc<dyn VfioUserProxy>,
    },
}

impl Debug for DeviceTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceTransport::Group { group_id } => {
                f.debug_struct("Group").field("group_id", group_id).finish()
            }
            DeviceTransport::Cdev { path } => f.debug_struct("Cdev").field("path", path).finish(),
            DeviceTransport::User { .. } => f.write_str("User"),
        }
    }
}

/// Device-level DMA logging, the alternative to IOMMU dirty tracking.
pub trait DeviceIo: Send + Sync {
    /// Whether the device can log its own DMA writes.
    fn dma_logging_supported(&self) -> bool;

    /// Start logging DMA writes to `ranges` at `page_size` granularity.
    fn dma_logging_start(&self, page_size: u64, ranges: &[IovaRange]) -> errno::Result<()>;

    /// Stop logging.
    fn dma_logging_stop(&self) -> errno::Result<()>;

    /// Set the bits of `bitmap` for pages of `[iova, iova + size)` written since the last
    /// report.
    fn dma_logging_report(
        &self,
        iova: u64,
        size: u64,
        page_size: u64,
        bitmap: &mut [u64],
    ) -> errno::Result<()>;
}

/// [`DeviceIo`] of a device without DMA logging.
#[derive(Debug, Default)]
pub struct NoDmaLogging;

impl DeviceIo for NoDmaLogging {
    fn dma_logging_supported(&self) -> bool {
        false
    }

    fn dma_logging_start(&self, _page_size: u64, _ranges: &[IovaRange]) -> errno::Result<()> {
        Err(errno::Error::new(libc::ENOTTY))
    }

    fn dma_logging_stop(&self) -> errno::Result<()> {
        Err(errno::Error::new(libc::ENOTTY))
    }

    fn dma_logging_report(
        &self,
        _iova: u64,
        _size: u64,
        _page_size: u64,
        _bitmap: &mut [u64],
    ) -> errno::Result<()> {
        Err(errno::Error::new(libc::ENOTTY))
    }
}

/// Where a device is in its attach lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachState {
    /// Not attached to any container.
    Detached,
    /// Attach in progress.
    Attaching,
    /// Attached, DMA mappings follow the guest memory map.
    Attached,
    /// Detach in progress.
    Detaching,
}

/// A passthrough device.
pub struct Device {
    id: DeviceId,
    name: String,
    transport: DeviceTransport,
    pci_address: Option<String>,
    io: Arc<dyn DeviceIo>,
    ram_discard_allowed: bool,
    config: MigrationConfig,
    pub(crate) state: AttachState,
    pub(crate) container: Option<ContainerHandle>,
    pub(crate) info: Option<DeviceInfo>,
    status: Arc<MigrationStatus>,
    pub(crate) migration: Option<Migration>,
    pub(crate) migration_blocker: Option<String>,
}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("container", &self.container)
            .finish()
    }
}

impl Device {
    /// Create a detached device named `name` (the host sysfs name for kernel devices).
    pub fn new(name: &str, transport: DeviceTransport) -> Self {
        Device {
            id: DeviceId::next(),
            name: name.to_owned(),
            transport,
            pci_address: None,
            io: Arc::new(NoDmaLogging),
            ram_discard_allowed: false,
            config: MigrationConfig::default(),
            state: AttachState::Detached,
            container: None,
            info: None,
            status: Arc::new(MigrationStatus::default()),
            migration: None,
            migration_blocker: None,
        }
    }

    /// Set the host PCI address (`dddd:bb:dd.f`) of the device.
    pub fn with_pci_address(mut self, address: &str) -> Self {
        self.pci_address = Some(address.to_owned());
        self
    }

    /// Use `io` for device DMA logging.
    pub fn with_io(mut self, io: Arc<dyn DeviceIo>) -> Self {
        self.io = io;
        self
    }

    /// Declare that the device tolerates guest RAM being discarded under it (e.g. because it
    /// never pins memory).
    pub fn with_ram_discard_allowed(mut self, allowed: bool) -> Self {
        self.ram_discard_allowed = allowed;
        self
    }

    /// Set the migration configuration.
    pub fn with_migration_config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Identity of the device.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Name of the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How the host exposes the device.
    pub fn transport(&self) -> &DeviceTransport {
        &self.transport
    }

    /// Host PCI address, if known.
    pub fn pci_address(&self) -> Option<&str> {
        self.pci_address.as_deref()
    }

    /// Device DMA logging interface.
    pub fn io(&self) -> &Arc<dyn DeviceIo> {
        &self.io
    }

    /// Whether guest RAM may be discarded while the device is attached.
    pub fn ram_discard_allowed(&self) -> bool {
        self.ram_discard_allowed
    }

    /// Migration configuration.
    pub fn migration_config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Attach lifecycle state.
    pub fn attach_state(&self) -> AttachState {
        self.state
    }

    /// Container the device is attached to.
    pub fn container(&self) -> Option<ContainerHandle> {
        self.container
    }

    /// Region/irq layout, known once attached.
    pub fn info(&self) -> Option<DeviceInfo> {
        self.info
    }

    /// Migration status shared with the container.
    pub fn migration_status(&self) -> &Arc<MigrationStatus> {
        &self.status
    }

    /// Migration state, if the device supports migration.
    pub fn migration(&self) -> Option<&Migration> {
        self.migration.as_ref()
    }

    /// Mutable migration state, if the device supports migration.
    pub fn migration_mut(&mut self) -> Option<&mut Migration> {
        self.migration.as_mut()
    }

    /// Reason the device blocks migration, if it does.
    pub fn migration_blocker(&self) -> Option<&str> {
        self.migration_blocker.as_deref()
    }
}
