// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Host IOMMU backends.
//!
//! A container talks to the host IOMMU through exactly one of three incompatible interfaces:
//! - [`LegacyBackend`]: the VFIO container/group API, where an IOMMU type is negotiated on a
//!   container that groups are added to;
//! - [`IommufdBackend`]: the iommufd API, where devices bind to an I/O address space (IOAS)
//!   through hardware page tables (hwpt);
//! - [`UserBackend`]: a vfio-user server in another process, reached through a connected
//!   [`VfioUserProxy`].
//!
//! [`IommuBackend`] hides the difference. Behaviour shared by all backends (retrying a map that
//! collides with an existing mapping, emulating "unmap everything") lives in its methods, on top
//! of the per-backend [`IommuBackendOps`] implementation picked by a single `match`.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::os::fd::RawFd;
use std::sync::Arc;

use log::warn;
use vmm_sys_util::errno;

use crate::address::{HostAddr, Iova};
use crate::bitmap::DirtyBitmap;
use crate::cpr::CprStore;
use crate::device::{Device, DeviceTransport};

mod iommufd;
mod legacy;
mod user;

pub use iommufd::{HotResetDevice, HwCaps, Hwpt, HwptFlags, IommufdBackend, IommufdDriver};
pub use legacy::{
    Extension, HotResetDependency, IommuInfo, IommuType, LegacyBackend, MigrationCap,
    VfioContainerDriver,
};
pub use user::{UserBackend, VfioUserProxy};

/// Errors reported by IOMMU backends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A host interface call failed.
    #[error("{op}: {source}")]
    Host {
        /// Name of the failed host operation.
        op: &'static str,
        /// Host errno.
        #[source]
        source: errno::Error,
    },
    /// The host offers none of the IOMMU types the backend can drive.
    #[error("No available IOMMU models")]
    NoIommuType,
    /// An IOMMU group is not usable because not all of its devices are bound to VFIO.
    #[error(
        "Group {0} is not viable, please ensure all devices within the iommu_group are bound to their vfio bus driver"
    )]
    GroupNotViable(u32),
    /// The device cannot share this backend instance; another container may accept it.
    #[error("Device {0} is not compatible with this container")]
    Incompatible(String),
    /// Devices of one IOMMU group disagree on whether RAM discarding is safe.
    #[error("Inconsistent setting of support for discarding RAM (e.g., balloon) within group {0}")]
    InconsistentDiscard(u32),
    /// The device was attached through a transport this backend does not drive.
    #[error("Device {0} cannot be attached to a {1:?} backend")]
    WrongTransport(String, BackendKind),
    /// The device is already attached to this backend.
    #[error("Device {0} is already attached")]
    AlreadyAttached(String),
    /// The device is not attached to this backend.
    #[error("Device {0} is not attached")]
    UnknownDevice(String),
    /// The backend lacks the capability.
    #[error("{0} is not supported by this IOMMU backend")]
    Unsupported(&'static str),
    /// A hot reset would affect a device in a group this process does not own.
    #[error("Cannot reset {device}: dependent group {group} is not owned")]
    HotResetUnowned {
        /// Device being reset.
        device: String,
        /// Group that is not owned.
        group: u32,
    },
    /// A hot reset would affect a device bound to another iommufd context.
    #[error("Cannot reset {device}: {dependent} is not owned")]
    HotResetUnownedDevice {
        /// Device being reset.
        device: String,
        /// Device that is not owned.
        dependent: String,
    },
    /// A single-device hot reset would also reset another device.
    #[error("Cannot reset {device} alone: {dependent} is affected by the same reset")]
    HotResetNotSingle {
        /// Device being reset.
        device: String,
        /// Other affected device.
        dependent: String,
    },
}

impl Error {
    /// The host errno behind the error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Host { source, .. } => Some(source.errno()),
            _ => None,
        }
    }

    /// Whether another container (or a fresh one) might still accept the device.
    pub fn is_incompatible(&self) -> bool {
        matches!(self, Error::Incompatible(_))
    }
}

/// Result of backend operations.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn host(op: &'static str) -> impl FnOnce(errno::Error) -> Error {
    move |source| Error::Host { op, source }
}

/// Descriptors of the IOMMU groups open in the process, across every container, by group id.
///
/// A reset domain may span devices of several containers; proving ownership of each group
/// takes its descriptor.
pub type OwnedGroups = BTreeMap<u32, RawFd>;

/// Which host interface a backend drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// VFIO container/group API.
    Legacy,
    /// iommufd API.
    IommuFd,
    /// vfio-user.
    User,
}

impl BackendKind {
    /// The backend able to drive a device reached through `transport`.
    pub fn for_transport(transport: &DeviceTransport) -> Self {
        match transport {
            DeviceTransport::Group { .. } => BackendKind::Legacy,
            DeviceTransport::Cdev { .. } => BackendKind::IommuFd,
            DeviceTransport::User { .. } => BackendKind::User,
        }
    }
}

/// Capabilities of a backend instance, known once the first device is attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendInfo {
    /// Bitmask of supported IOMMU page sizes.
    pub pgsizes: u64,
    /// Valid IOVA ranges, non-overlapping.
    pub iova_ranges: Vec<RangeInclusive<u64>>,
    /// Maximum number of DMA mappings the host accepts, 0 when unknown.
    pub dma_max_mappings: u32,
    /// Whether the backend can track dirty pages itself.
    pub dirty_pages_supported: bool,
    /// Page sizes usable for dirty bitmaps.
    pub dirty_pgsizes: u64,
    /// Largest dirty bitmap, in bytes, the host fills in one call.
    pub max_dirty_bitmap_size: u64,
    /// Whether the host can unmap the whole IOVA space in one call.
    pub unmap_all_supported: bool,
}

impl Default for BackendInfo {
    fn default() -> Self {
        BackendInfo {
            pgsizes: crate::page::host_page_size(),
            iova_ranges: vec![0..=u64::MAX],
            dma_max_mappings: 0,
            dirty_pages_supported: false,
            dirty_pgsizes: 0,
            max_dirty_bitmap_size: 0,
            unmap_all_supported: false,
        }
    }
}

/// Static information about a device region/irq layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Number of device regions.
    pub num_regions: u32,
    /// Number of interrupt indexes.
    pub num_irqs: u32,
    /// Whether the device supports a function-level reset.
    pub reset_supported: bool,
}

/// Backend-specific identity of an attached device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendDeviceRef {
    /// Device opened through an IOMMU group.
    Group {
        /// IOMMU group id.
        group_id: u32,
    },
    /// Device bound to iommufd.
    IommuFd {
        /// Device id returned by the bind call.
        devid: u32,
        /// Hardware page table the device is attached to.
        hwpt_id: u32,
    },
    /// Device behind a vfio-user proxy.
    User,
}

/// A device as registered with a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendDevice {
    /// Device name (sysfs name for kernel devices).
    pub name: String,
    /// Host device file descriptor; `-1` for vfio-user devices.
    pub fd: RawFd,
    /// Host PCI address, used to match hot reset dependencies.
    pub pci_address: Option<String>,
    /// Region/irq layout.
    pub info: DeviceInfo,
    /// Backend-specific identity.
    pub backend_ref: BackendDeviceRef,
}

mod private {
    pub trait Sealed {}
}

/// Operations each host interface implements. Sealed: the set of backends is closed.
pub trait IommuBackendOps: private::Sealed + Send {
    /// Acquire the host objects the backend needs before any device is attached.
    fn setup(&mut self) -> Result<()>;
    /// Capabilities, valid once a device is attached.
    fn info(&self) -> &BackendInfo;
    /// Register a device with the backend.
    fn attach_device(&mut self, device: &Device) -> Result<BackendDevice>;
    /// Unregister a device, releasing every host object acquired for it.
    fn detach_device(&mut self, device: &BackendDevice);
    /// Map `[iova, iova + size)` to host memory at `vaddr`.
    fn dma_map(&mut self, iova: Iova, size: u64, vaddr: HostAddr, readonly: bool) -> Result<()>;
    /// Unmap `[iova, iova + size)`, or everything if `unmap_all` (only called when supported).
    fn dma_unmap(&mut self, iova: Iova, size: u64, unmap_all: bool) -> Result<()>;
    /// Start or stop IOMMU dirty tracking.
    fn set_dirty_tracking(&mut self, start: bool) -> Result<()>;
    /// Fill `bitmap` with the dirty state of `[iova, iova + size)`.
    fn query_dirty_bitmap(&mut self, iova: Iova, size: u64, bitmap: &mut DirtyBitmap)
        -> Result<()>;
    /// Reset the device, together with the devices sharing its reset domain unless `single`.
    ///
    /// `groups` lists the groups open elsewhere in the process.
    fn pci_hot_reset(
        &mut self,
        device: &BackendDevice,
        single: bool,
        groups: &OwnedGroups,
    ) -> Result<()>;
    /// IOMMU groups held by the backend and their descriptors.
    fn group_fds(&self) -> Vec<(u32, RawFd)> {
        Vec::new()
    }
    /// Release every host object held by the backend.
    fn release(&mut self);
}

/// Everything a backend needs from the host.
#[derive(Clone)]
pub struct HostDrivers {
    /// Legacy VFIO container API, if the host has one.
    pub legacy: Option<Arc<dyn VfioContainerDriver>>,
    /// iommufd context, if the host has one.
    pub iommufd: Option<Arc<dyn IommufdDriver>>,
    /// File descriptor preservation across CPR.
    pub cpr: Arc<dyn CprStore>,
}

/// The IOMMU backend of one container.
pub enum IommuBackend {
    /// VFIO container/group API.
    Legacy(LegacyBackend),
    /// iommufd API.
    IommuFd(IommufdBackend),
    /// vfio-user.
    User(UserBackend),
}

impl IommuBackend {
    /// Create the backend able to drive `device`.
    ///
    /// The choice is final: the container created around the backend only ever accepts
    /// devices of the same kind.
    pub fn for_device(device: &Device, host: &HostDrivers) -> Result<Self> {
        match device.transport() {
            DeviceTransport::Group { group_id } => {
                let driver = host
                    .legacy
                    .clone()
                    .ok_or(Error::Unsupported("VFIO container API"))?;
                Ok(IommuBackend::Legacy(LegacyBackend::new(
                    driver,
                    host.cpr.clone(),
                    *group_id,
                )))
            }
            DeviceTransport::Cdev { .. } => {
                let driver = host
                    .iommufd
                    .clone()
                    .ok_or(Error::Unsupported("iommufd"))?;
                Ok(IommuBackend::IommuFd(IommufdBackend::new(
                    driver,
                    host.cpr.clone(),
                )))
            }
            DeviceTransport::User { proxy } => {
                Ok(IommuBackend::User(UserBackend::new(proxy.clone())))
            }
        }
    }

    /// Which host interface this backend drives.
    pub fn kind(&self) -> BackendKind {
        match self {
            IommuBackend::Legacy(_) => BackendKind::Legacy,
            IommuBackend::IommuFd(_) => BackendKind::IommuFd,
            IommuBackend::User(_) => BackendKind::User,
        }
    }

    fn ops(&self) -> &dyn IommuBackendOps {
        match self {
            IommuBackend::Legacy(b) => b,
            IommuBackend::IommuFd(b) => b,
            IommuBackend::User(b) => b,
        }
    }

    fn ops_mut(&mut self) -> &mut dyn IommuBackendOps {
        match self {
            IommuBackend::Legacy(b) => b,
            IommuBackend::IommuFd(b) => b,
            IommuBackend::User(b) => b,
        }
    }

    /// Acquire the host objects the backend needs.
    ///
    /// On failure nothing is left registered with the host.
    pub fn setup(&mut self) -> Result<()> {
        self.ops_mut().setup()
    }

    /// Capabilities of the backend.
    pub fn info(&self) -> &BackendInfo {
        self.ops().info()
    }

    /// Register `device` with the backend.
    pub fn attach_device(&mut self, device: &Device) -> Result<BackendDevice> {
        self.ops_mut().attach_device(device)
    }

    /// Unregister a device previously returned by [`attach_device`](Self::attach_device).
    pub fn detach_device(&mut self, device: &BackendDevice) {
        self.ops_mut().detach_device(device)
    }

    /// Map `[iova, iova + size)` to host memory at `vaddr`.
    ///
    /// A mapping that collides with an existing one (`EEXIST`) is replaced: guest ROM shadows
    /// legitimately get mapped twice, so the old mapping is dropped and the map retried once.
    pub fn dma_map(&mut self, iova: Iova, size: u64, vaddr: HostAddr, readonly: bool) -> Result<()> {
        match self.ops_mut().dma_map(iova, size, vaddr, readonly) {
            Err(e) if e.errno() == Some(libc::EEXIST) => {
                warn!(
                    "DMA mapping {:#x}+{:#x} already exists, remapping",
                    iova, size
                );
                self.ops_mut().dma_unmap(iova, size, false)?;
                self.ops_mut().dma_map(iova, size, vaddr, readonly)
            }
            res => res,
        }
    }

    /// Unmap `[iova, iova + size)`, or the whole IOVA space if `unmap_all`.
    ///
    /// Hosts that cannot express a full 64-bit span in one call get two calls, one for each
    /// half of the space.
    pub fn dma_unmap(&mut self, iova: Iova, size: u64, unmap_all: bool) -> Result<()> {
        if !unmap_all {
            return self.ops_mut().dma_unmap(iova, size, false);
        }
        if self.info().unmap_all_supported {
            return self.ops_mut().dma_unmap(Iova(0), 0, true);
        }
        let half = 1u64 << 63;
        self.ops_mut().dma_unmap(Iova(0), half, false)?;
        self.ops_mut().dma_unmap(Iova(half), half, false)
    }

    /// Start or stop IOMMU dirty tracking.
    pub fn set_dirty_tracking(&mut self, start: bool) -> Result<()> {
        self.ops_mut().set_dirty_tracking(start)
    }

    /// Fill `bitmap` with the dirty state of `[iova, iova + size)`.
    pub fn query_dirty_bitmap(
        &mut self,
        iova: Iova,
        size: u64,
        bitmap: &mut DirtyBitmap,
    ) -> Result<()> {
        self.ops_mut().query_dirty_bitmap(iova, size, bitmap)
    }

    /// Hot reset the PCI device, alone if `single`. Devices of the reset domain may belong to
    /// any group in `groups`.
    pub fn pci_hot_reset(
        &mut self,
        device: &BackendDevice,
        single: bool,
        groups: &OwnedGroups,
    ) -> Result<()> {
        self.ops_mut().pci_hot_reset(device, single, groups)
    }

    /// IOMMU groups held by the backend and their descriptors.
    pub fn group_fds(&self) -> Vec<(u32, RawFd)> {
        self.ops().group_fds()
    }

    /// Release every host object held by the backend.
    pub fn release(&mut self) {
        self.ops_mut().release()
    }
}
