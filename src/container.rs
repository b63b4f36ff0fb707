// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! One host IOMMU domain shared by a set of compatible devices.
//!
//! A [`Container`] owns its [`IommuBackend`] and mirrors every DMA mapping it programs into a
//! local IOVA map, so the state of the host IOMMU can be inspected without asking the host. The
//! memory listener callbacks live in [`crate::listener`] and the dirty page tracking logic in
//! [`crate::dirty`]; both are further `impl Container` blocks.

use std::collections::BTreeMap;
use std::num::Wrapping;
use std::sync::Arc;

use rangemap::{RangeInclusiveMap, RangeInclusiveSet};
use vmm_sys_util::errno;

use crate::address::{HostAddr, Iova};
use crate::backend::{self, BackendDevice, BackendKind, HostDrivers, IommuBackend, OwnedGroups};
use crate::device::{Device, DeviceId, DeviceIo};
use crate::dirty::DirtyLog;
use crate::listener::{DiscardListener, GuestIommuNotifier};
use crate::memory::{self, AddressSpaceId};
use crate::migration::{MigrationConfig, MigrationStatus};
use crate::page::min_page_size;

/// Default number of memory slots the hypervisor may plug, used to budget DMA mappings.
pub const DEFAULT_MAX_MEMSLOTS: u32 = 512;

/// Errors of the container layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The IOMMU backend failed.
    #[error(transparent)]
    Backend(#[from] backend::Error),
    /// A memory model collaborator failed.
    #[error(transparent)]
    Memory(#[from] memory::Error),
    /// The range is not within the valid IOVA ranges of the host IOMMU.
    #[error("IOVA range {iova:#x}+{size:#x} is outside the valid IOVA ranges")]
    InvalidIova {
        /// Start of the range.
        iova: u64,
        /// Size of the range.
        size: u64,
    },
    /// DMA mapping failed.
    #[error("vfio_container_dma_map({iova:#x}, {size:#x}, {vaddr:#x}) = {source}")]
    Map {
        /// IOVA of the mapping.
        iova: u64,
        /// Size of the mapping.
        size: u64,
        /// Host virtual address of the mapping.
        vaddr: u64,
        /// Backend error.
        #[source]
        source: backend::Error,
    },
    /// DMA unmapping failed.
    #[error("vfio_container_dma_unmap({iova:#x}, {size:#x}) = {source}")]
    Unmap {
        /// IOVA of the range.
        iova: u64,
        /// Size of the range.
        size: u64,
        /// Backend error.
        #[source]
        source: backend::Error,
    },
    /// The device cannot join this container.
    #[error("Device {0} is not compatible with this container")]
    Incompatible(String),
    /// The device is not attached to this container.
    #[error("Device {0:?} is not attached to this container")]
    UnknownDevice(DeviceId),
    /// The dirty bitmap for a range exceeds what the host fills in one call.
    #[error("Dirty bitmap for {size:#x} bytes needs {requested} bytes, host maximum is {max}")]
    BitmapTooBig {
        /// Size of the queried range.
        size: u64,
        /// Bitmap size in bytes.
        requested: u64,
        /// Host maximum in bytes.
        max: u64,
    },
    /// Device DMA logging failed.
    #[error("{device}: DMA logging: {source}")]
    DeviceLogging {
        /// Device name.
        device: String,
        /// Host errno.
        #[source]
        source: errno::Error,
    },
    /// Dirty page tracking could not be started.
    #[error("Could not start dirty page tracking - {0}")]
    DirtyTrackingStart(#[source] Box<Error>),
    /// A discard-managed region would need more DMA mappings than the host allows.
    #[error(
        "Possibly running out of DMA mappings: {required} needed with {max_memslots} memory slots, host limit is {max_mappings}"
    )]
    DmaMappingsExhausted {
        /// Worst-case mappings needed.
        required: u64,
        /// Memory slot budget.
        max_memslots: u32,
        /// Host limit.
        max_mappings: u32,
    },
    /// The populate/discard granularity of a region is unusable.
    #[error("Discard granularity {granularity:#x} of {region} is not a power of two of at least {min:#x}")]
    InvalidGranularity {
        /// Region name.
        region: String,
        /// Reported granularity.
        granularity: u64,
        /// Minimum IOMMU page size.
        min: u64,
    },
    /// A discard-managed section is not aligned to the host page size.
    #[error("Section {region}@{gpa:#x}+{size:#x} is not aligned to the host page size")]
    Misaligned {
        /// Region name.
        region: String,
        /// Guest address of the section.
        gpa: u64,
        /// Size of the section.
        size: u128,
    },
    /// Mapping a region failed.
    #[error("Region {region}: {source}")]
    Region {
        /// Region name.
        region: String,
        /// Cause.
        #[source]
        source: Box<Error>,
    },
    /// A mapping failure after the container was set up; the guest can no longer run safely.
    #[error("vfio: DMA mapping failed, unable to continue: {0}")]
    Fatal(#[source] Box<Error>),
}

impl Error {
    /// Whether another container might still accept the device.
    pub fn is_incompatible(&self) -> bool {
        match self {
            Error::Incompatible(_) => true,
            Error::Backend(e) => e.is_incompatible(),
            _ => false,
        }
    }

    /// Whether the error must stop the guest.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

/// Result of container operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Handle of a [`Container`] inside the address-space registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerHandle {
    space: AddressSpaceId,
    index: u64,
}

impl ContainerHandle {
    pub(crate) fn new(space: AddressSpaceId, index: u64) -> Self {
        ContainerHandle { space, index }
    }

    /// Address space the container belongs to.
    pub fn space(&self) -> AddressSpaceId {
        self.space
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DmaMapping {
    // Stored as a difference so that rangemap only coalesces truly contiguous mappings.
    vaddr_iova_diff: Wrapping<u64>,
    readonly: bool,
}

/// Per-device state kept by the container.
pub(crate) struct ContainerDevice {
    pub(crate) backend: BackendDevice,
    pub(crate) io: Arc<dyn DeviceIo>,
    pub(crate) config: MigrationConfig,
    pub(crate) status: Arc<MigrationStatus>,
    pub(crate) dirty_tracking: bool,
}

/// A host IOMMU domain and the devices sharing it.
pub struct Container {
    handle: ContainerHandle,
    pub(crate) backend: IommuBackend,
    pub(crate) devices: BTreeMap<DeviceId, ContainerDevice>,
    iova_ranges: RangeInclusiveSet<u64>,
    mappings: RangeInclusiveMap<u64, DmaMapping>,
    ram_discard_allowed: bool,
    pub(crate) dirty_log: Arc<dyn DirtyLog>,
    pub(crate) dirty_pages_started: bool,
    pub(crate) initialized: bool,
    pub(crate) error: Option<Error>,
    pub(crate) giommus: Vec<GuestIommuNotifier>,
    pub(crate) discard_listeners: Vec<DiscardListener>,
    pub(crate) max_memslots: u32,
}

impl Container {
    /// Create a container whose backend can drive `device`, and acquire its host objects.
    ///
    /// The device itself is not attached yet.
    pub fn create(
        handle: ContainerHandle,
        device: &Device,
        host: &HostDrivers,
        dirty_log: Arc<dyn DirtyLog>,
    ) -> Result<Self> {
        let mut backend = IommuBackend::for_device(device, host)?;
        backend.setup()?;
        Ok(Container {
            handle,
            backend,
            devices: BTreeMap::new(),
            iova_ranges: RangeInclusiveSet::new(),
            mappings: RangeInclusiveMap::new(),
            ram_discard_allowed: device.ram_discard_allowed(),
            dirty_log,
            dirty_pages_started: false,
            initialized: false,
            error: None,
            giommus: Vec::new(),
            discard_listeners: Vec::new(),
            max_memslots: DEFAULT_MAX_MEMSLOTS,
        })
    }

    /// Handle of the container.
    pub fn handle(&self) -> ContainerHandle {
        self.handle
    }

    /// Which host interface the container drives.
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Whether the container finished its initial replay of the address space.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether no device is attached.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Number of attached devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Whether the device is attached to this container.
    pub fn contains(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id)
    }

    /// Names of the attached devices.
    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.devices.values().map(|d| d.backend.name.as_str())
    }

    /// Whether guest RAM may be discarded under the container's devices.
    pub fn ram_discard_allowed(&self) -> bool {
        self.ram_discard_allowed
    }

    /// Supported IOMMU page sizes.
    pub fn pgsizes(&self) -> u64 {
        self.backend.info().pgsizes
    }

    /// Smallest supported IOMMU page size.
    pub fn min_page_size(&self) -> u64 {
        min_page_size(self.pgsizes()).unwrap_or_else(crate::page::host_page_size)
    }

    /// Maximum number of DMA mappings the host accepts, 0 when unknown.
    pub fn dma_max_mappings(&self) -> u32 {
        self.backend.info().dma_max_mappings
    }

    /// Valid IOVA ranges.
    pub fn iova_ranges(&self) -> impl Iterator<Item = std::ops::RangeInclusive<u64>> + '_ {
        self.iova_ranges.iter().cloned()
    }

    /// Budget of memory slots used to sanity check discard-managed regions.
    pub fn set_max_memslots(&mut self, max_memslots: u32) {
        self.max_memslots = max_memslots;
    }

    /// Host virtual address an IOVA is currently mapped to, and whether it is read-only.
    pub fn translate(&self, iova: Iova) -> Option<(HostAddr, bool)> {
        self.mappings
            .get(&iova.0)
            .map(|m| (HostAddr((Wrapping(iova.0) + m.vaddr_iova_diff).0), m.readonly))
    }

    /// Number of disjoint mapped IOVA ranges.
    pub fn mapped_ranges(&self) -> usize {
        self.mappings.len()
    }

    fn refresh_info(&mut self) {
        self.iova_ranges = RangeInclusiveSet::new();
        for range in &self.backend.info().iova_ranges {
            self.iova_ranges.insert(range.clone());
        }
    }

    /// Attach `device` to the container.
    ///
    /// Fails with an incompatibility (see [`Error::is_incompatible`]) when the device cannot share
    /// this container but might share another one.
    pub fn attach_device(&mut self, device: &Device) -> Result<BackendDevice> {
        if BackendKind::for_transport(device.transport()) != self.kind()
            || (!self.devices.is_empty()
                && device.ram_discard_allowed() != self.ram_discard_allowed)
        {
            return Err(Error::Incompatible(device.name().to_owned()));
        }
        let first = self.devices.is_empty();
        let backend_dev = self.backend.attach_device(device)?;
        if first {
            self.ram_discard_allowed = device.ram_discard_allowed();
            self.refresh_info();
        }
        self.devices.insert(
            device.id(),
            ContainerDevice {
                backend: backend_dev.clone(),
                io: device.io().clone(),
                config: device.migration_config().clone(),
                status: device.migration_status().clone(),
                dirty_tracking: false,
            },
        );
        Ok(backend_dev)
    }

    /// Detach a device, releasing the host objects acquired for it.
    pub fn detach_device(&mut self, id: DeviceId) -> Result<()> {
        let dev = self.devices.remove(&id).ok_or(Error::UnknownDevice(id))?;
        self.backend.detach_device(&dev.backend);
        Ok(())
    }

    fn check_iova(&self, iova: u64, size: u64) -> Result<()> {
        let last = iova
            .checked_add(size.saturating_sub(1))
            .ok_or(Error::InvalidIova { iova, size })?;
        let range = iova..=last;
        if size == 0 || self.iova_ranges.gaps(&range).next().is_some() {
            return Err(Error::InvalidIova { iova, size });
        }
        Ok(())
    }

    /// Map `[iova, iova + size)` to host memory at `vaddr`.
    pub fn dma_map(&mut self, iova: Iova, size: u64, vaddr: HostAddr, readonly: bool) -> Result<()> {
        self.check_iova(iova.0, size)?;
        self.backend
            .dma_map(iova, size, vaddr, readonly)
            .map_err(|source| Error::Map {
                iova: iova.0,
                size,
                vaddr: vaddr.0,
                source,
            })?;
        self.mappings.insert(
            iova.0..=iova.0 + (size - 1),
            DmaMapping {
                vaddr_iova_diff: Wrapping(vaddr.0) - Wrapping(iova.0),
                readonly,
            },
        );
        Ok(())
    }

    /// Unmap `[iova, iova + size)`, or every mapping if `unmap_all`.
    ///
    /// Unmapping a range that was never mapped is not an error.
    pub fn dma_unmap(&mut self, iova: Iova, size: u64, unmap_all: bool) -> Result<()> {
        self.backend
            .dma_unmap(iova, size, unmap_all)
            .map_err(|source| Error::Unmap {
                iova: iova.0,
                size,
                source,
            })?;
        if unmap_all {
            self.mappings.clear();
        } else if size > 0 {
            self.mappings
                .remove(iova.0..=iova.0.saturating_add(size - 1));
        }
        Ok(())
    }

    /// Hot reset an attached PCI device, alone if `single`.
    ///
    /// `groups` holds the IOMMU groups of the other containers, which the reset domain may span.
    pub fn pci_hot_reset(&mut self, id: DeviceId, single: bool, groups: &OwnedGroups) -> Result<()> {
        let dev = self.devices.get(&id).ok_or(Error::UnknownDevice(id))?;
        let backend_dev = dev.backend.clone();
        self.backend.pci_hot_reset(&backend_dev, single, groups)?;
        Ok(())
    }

    /// IOMMU groups held by the container and their descriptors.
    pub fn group_fds(&self) -> Vec<(u32, std::os::fd::RawFd)> {
        self.backend.group_fds()
    }

    /// Release every host object held by the container.
    pub(crate) fn release(&mut self) {
        self.backend.release();
        self.mappings.clear();
    }
}
