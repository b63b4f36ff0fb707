// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The VFIO container/group backend.
//!
//! Devices are reached through IOMMU groups. The first group added to a container lets the
//! container negotiate its IOMMU type; from then on the container accepts any further group the
//! kernel agrees to add, and the IOMMU geometry is that of the negotiated type.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::os::fd::RawFd;
use std::sync::Arc;

use log::{debug, warn};
use vmm_sys_util::errno;

use super::{
    host, BackendDevice, BackendDeviceRef, BackendInfo, BackendKind, DeviceInfo, Error,
    IommuBackendOps, OwnedGroups, Result,
};
use crate::address::{HostAddr, Iova};
use crate::bitmap::DirtyBitmap;
use crate::cpr::{self, CprStore};
use crate::device::{Device, DeviceTransport};
use crate::page::host_page_size;

/// IOMMU models of the container API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IommuType {
    /// Type1 with v2 semantics (partial unmaps allowed).
    Type1v2,
    /// Original Type1.
    Type1,
    /// sPAPR TCE, version 2.
    SpaprTceV2,
    /// sPAPR TCE.
    SpaprTce,
}

impl IommuType {
    /// All models, richest first.
    pub const PREFERENCE: [IommuType; 4] = [
        IommuType::Type1v2,
        IommuType::Type1,
        IommuType::SpaprTceV2,
        IommuType::SpaprTce,
    ];
}

/// Optional container API features probed with `VFIO_CHECK_EXTENSION`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extension {
    /// An IOMMU model.
    Iommu(IommuType),
    /// `VFIO_UNMAP_ALL`.
    UnmapAll,
}

/// Dirty page tracking capability of a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MigrationCap {
    /// Page sizes usable for dirty bitmaps.
    pub pgsize_bitmap: u64,
    /// Largest bitmap, in bytes, the kernel fills in one call.
    pub max_dirty_bitmap_size: u64,
}

/// IOMMU geometry reported by `VFIO_IOMMU_GET_INFO`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IommuInfo {
    /// Supported IOMMU page sizes.
    pub iova_pgsizes: u64,
    /// Valid IOVA ranges; empty when the kernel does not report them.
    pub iova_ranges: Vec<RangeInclusive<u64>>,
    /// Remaining DMA mapping slots, when reported.
    pub dma_avail: Option<u32>,
    /// Dirty tracking capability, when available.
    pub migration: Option<MigrationCap>,
}

/// A device affected by the hot reset of another one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HotResetDependency {
    /// IOMMU group of the dependent device.
    pub group_id: u32,
    /// PCI address of the dependent device.
    pub pci_address: String,
}

/// The kernel VFIO container API.
pub trait VfioContainerDriver: Send + Sync {
    /// Open a new container.
    fn open_container(&self) -> errno::Result<RawFd>;
    /// Probe an optional feature of the container.
    fn check_extension(&self, container: RawFd, ext: Extension) -> bool;
    /// Select the IOMMU model of the container.
    fn set_iommu(&self, container: RawFd, iommu_type: IommuType) -> errno::Result<()>;
    /// Query the IOMMU geometry.
    fn iommu_info(&self, container: RawFd) -> errno::Result<IommuInfo>;
    /// Open IOMMU group `group_id`.
    fn open_group(&self, group_id: u32) -> errno::Result<RawFd>;
    /// Whether every device of the group is bound to VFIO.
    fn group_viable(&self, group: RawFd) -> errno::Result<bool>;
    /// Add a group to a container.
    fn group_set_container(&self, group: RawFd, container: RawFd) -> errno::Result<()>;
    /// Remove a group from its container.
    fn group_unset_container(&self, group: RawFd, container: RawFd) -> errno::Result<()>;
    /// Open the device `name` of a group.
    fn group_get_device_fd(&self, group: RawFd, name: &str) -> errno::Result<RawFd>;
    /// Query the region/irq layout of a device.
    fn device_info(&self, device: RawFd) -> errno::Result<DeviceInfo>;
    /// `VFIO_IOMMU_MAP_DMA`.
    fn map_dma(
        &self,
        container: RawFd,
        iova: u64,
        size: u64,
        vaddr: u64,
        readonly: bool,
    ) -> errno::Result<()>;
    /// `VFIO_IOMMU_UNMAP_DMA`, returning the number of bytes unmapped.
    fn unmap_dma(&self, container: RawFd, iova: u64, size: u64, all: bool) -> errno::Result<u64>;
    /// Start or stop container dirty tracking.
    fn set_dirty_tracking(&self, container: RawFd, start: bool) -> errno::Result<()>;
    /// Read (and clear) the dirty bitmap of `[iova, iova + size)`.
    fn get_dirty_bitmap(
        &self,
        container: RawFd,
        iova: u64,
        size: u64,
        page_size: u64,
        bitmap: &mut [u64],
    ) -> errno::Result<()>;
    /// List the devices affected by a hot reset of `device`.
    fn pci_hot_reset_info(&self, device: RawFd) -> errno::Result<Vec<HotResetDependency>>;
    /// Hot reset `device`, proving ownership of every affected group.
    fn pci_hot_reset(&self, device: RawFd, groups: &[RawFd]) -> errno::Result<()>;
    /// Close a descriptor returned by this driver.
    fn close(&self, fd: RawFd);
}

const CPR_CONTAINER: &str = "vfio_container_for_group";
const CPR_GROUP: &str = "vfio_group";

#[derive(Debug)]
struct Group {
    fd: RawFd,
    devices: BTreeSet<String>,
    ram_discard_allowed: bool,
}

/// Backend driving one VFIO container.
pub struct LegacyBackend {
    driver: Arc<dyn VfioContainerDriver>,
    cpr: Arc<dyn CprStore>,
    // Group the container was created for; keys the container descriptor across CPR.
    first_group: u32,
    fd: Option<RawFd>,
    iommu_type: Option<IommuType>,
    iommu_set: bool,
    info: BackendInfo,
    groups: BTreeMap<u32, Group>,
}

impl LegacyBackend {
    pub(crate) fn new(
        driver: Arc<dyn VfioContainerDriver>,
        cpr: Arc<dyn CprStore>,
        first_group: u32,
    ) -> Self {
        LegacyBackend {
            driver,
            cpr,
            first_group,
            fd: None,
            iommu_type: None,
            iommu_set: false,
            info: BackendInfo::default(),
            groups: BTreeMap::new(),
        }
    }

    /// IOMMU model negotiated for the container.
    pub fn iommu_type(&self) -> Option<IommuType> {
        self.iommu_type
    }

    /// IOMMU groups currently in the container.
    pub fn group_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.groups.keys().copied()
    }

    fn container_fd(&self) -> Result<RawFd> {
        self.fd.ok_or(Error::Unsupported("an unopened container"))
    }

    fn group_id_of(device: &Device) -> Result<u32> {
        match device.transport() {
            DeviceTransport::Group { group_id } => Ok(*group_id),
            _ => Err(Error::WrongTransport(
                device.name().to_owned(),
                BackendKind::Legacy,
            )),
        }
    }

    fn load_info(&mut self, fd: RawFd) -> Result<()> {
        let info = self
            .driver
            .iommu_info(fd)
            .map_err(host("VFIO_IOMMU_GET_INFO"))?;
        let iova_ranges = if info.iova_ranges.is_empty() {
            vec![0..=u64::MAX]
        } else {
            info.iova_ranges
        };
        let mut backend_info = BackendInfo {
            pgsizes: if info.iova_pgsizes != 0 {
                info.iova_pgsizes
            } else {
                host_page_size()
            },
            iova_ranges,
            dma_max_mappings: info.dma_avail.unwrap_or(0),
            dirty_pages_supported: false,
            dirty_pgsizes: info.migration.map_or(0, |m| m.pgsize_bitmap),
            max_dirty_bitmap_size: info.migration.map_or(0, |m| m.max_dirty_bitmap_size),
            unmap_all_supported: self.driver.check_extension(fd, Extension::UnmapAll),
        };
        // Bitmaps are always requested at host page granularity.
        if info.migration.is_some() {
            if backend_info.dirty_pgsizes & host_page_size() != 0 {
                backend_info.dirty_pages_supported = true;
            } else {
                warn!(
                    "Container dirty tracking page sizes {:#x} lack the host page size {:#x}, \
                     not using it",
                    backend_info.dirty_pgsizes,
                    host_page_size()
                );
            }
        }
        self.info = backend_info;
        Ok(())
    }

    // Open the group and add it to the container. A group the kernel refuses to add to a
    // container with an IOMMU model already set is merely incompatible with this container.
    fn add_group(&mut self, group_id: u32, ram_discard_allowed: bool) -> Result<()> {
        let container = self.container_fd()?;
        let (fd, reused) = cpr::find_or_open(self.cpr.as_ref(), CPR_GROUP, group_id as i32, || {
            self.driver.open_group(group_id)
        })
        .map_err(host("open group"))?;

        let (driver, cpr) = (self.driver.clone(), self.cpr.clone());
        let close_group = || {
            driver.close(fd);
            cpr.delete_fd(CPR_GROUP, group_id as i32);
        };

        match self.driver.group_viable(fd) {
            Ok(true) => (),
            Ok(false) => {
                close_group();
                return Err(Error::GroupNotViable(group_id));
            }
            Err(e) => {
                close_group();
                return Err(host("VFIO_GROUP_GET_STATUS")(e));
            }
        }

        if !reused {
            if let Err(e) = self.driver.group_set_container(fd, container) {
                close_group();
                if self.iommu_set {
                    debug!("group {} not accepted by container: {}", group_id, e);
                    return Err(Error::Incompatible(format!("group {}", group_id)));
                }
                return Err(host("VFIO_GROUP_SET_CONTAINER")(e));
            }
        }

        if !self.iommu_set {
            let iommu_type = self.iommu_type.ok_or(Error::NoIommuType)?;
            let res = self
                .driver
                .set_iommu(container, iommu_type)
                .map_err(host("VFIO_SET_IOMMU"))
                .and_then(|_| self.load_info(container));
            if let Err(e) = res {
                let _ = self.driver.group_unset_container(fd, container);
                close_group();
                return Err(e);
            }
            self.iommu_set = true;
        }

        self.groups.insert(
            group_id,
            Group {
                fd,
                devices: BTreeSet::new(),
                ram_discard_allowed,
            },
        );
        Ok(())
    }

    fn remove_group(&mut self, group_id: u32) {
        if let Some(group) = self.groups.remove(&group_id) {
            if let Some(container) = self.fd {
                if let Err(e) = self.driver.group_unset_container(group.fd, container) {
                    warn!("error disconnecting group {} from container: {}", group_id, e);
                }
            }
            self.driver.close(group.fd);
            self.cpr.delete_fd(CPR_GROUP, group_id as i32);
        }
    }
}

impl super::private::Sealed for LegacyBackend {}

impl IommuBackendOps for LegacyBackend {
    fn setup(&mut self) -> Result<()> {
        let id = self.first_group as i32;
        let (fd, _) = cpr::find_or_open(self.cpr.as_ref(), CPR_CONTAINER, id, || {
            self.driver.open_container()
        })
        .map_err(host("open /dev/vfio/vfio"))?;

        let Some(iommu_type) = IommuType::PREFERENCE
            .into_iter()
            .find(|t| self.driver.check_extension(fd, Extension::Iommu(*t)))
        else {
            self.driver.close(fd);
            self.cpr.delete_fd(CPR_CONTAINER, id);
            return Err(Error::NoIommuType);
        };

        debug!("container for group {} uses {:?}", self.first_group, iommu_type);
        self.fd = Some(fd);
        self.iommu_type = Some(iommu_type);
        Ok(())
    }

    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn attach_device(&mut self, device: &Device) -> Result<BackendDevice> {
        let group_id = Self::group_id_of(device)?;
        let name = device.name();

        let new_group = !self.groups.contains_key(&group_id);
        if new_group {
            self.add_group(group_id, device.ram_discard_allowed())?;
        }

        let group = self
            .groups
            .get(&group_id)
            .ok_or_else(|| Error::UnknownDevice(name.to_owned()))?;
        if group.devices.contains(name) {
            return Err(Error::AlreadyAttached(name.to_owned()));
        }
        if !group.devices.is_empty() && group.ram_discard_allowed != device.ram_discard_allowed() {
            return Err(Error::InconsistentDiscard(group_id));
        }
        let group_fd = group.fd;

        let res = cpr::find_or_open(self.cpr.as_ref(), name, 0, || {
            self.driver.group_get_device_fd(group_fd, name)
        })
        .map_err(host("VFIO_GROUP_GET_DEVICE_FD"))
        .and_then(|(fd, _)| match self.driver.device_info(fd) {
            Ok(info) => Ok((fd, info)),
            Err(e) => {
                self.driver.close(fd);
                self.cpr.delete_fd(name, 0);
                Err(host("VFIO_DEVICE_GET_INFO")(e))
            }
        });

        let (fd, info) = match res {
            Ok(v) => v,
            Err(e) => {
                if new_group {
                    self.remove_group(group_id);
                }
                return Err(e);
            }
        };

        if let Some(group) = self.groups.get_mut(&group_id) {
            group.devices.insert(name.to_owned());
        }
        Ok(BackendDevice {
            name: name.to_owned(),
            fd,
            pci_address: device.pci_address().map(str::to_owned),
            info,
            backend_ref: BackendDeviceRef::Group { group_id },
        })
    }

    fn detach_device(&mut self, device: &BackendDevice) {
        let BackendDeviceRef::Group { group_id } = device.backend_ref else {
            return;
        };
        self.driver.close(device.fd);
        self.cpr.delete_fd(&device.name, 0);

        let now_empty = match self.groups.get_mut(&group_id) {
            Some(group) => {
                group.devices.remove(&device.name);
                group.devices.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.remove_group(group_id);
        }
    }

    fn dma_map(&mut self, iova: Iova, size: u64, vaddr: HostAddr, readonly: bool) -> Result<()> {
        let fd = self.container_fd()?;
        self.driver
            .map_dma(fd, iova.0, size, vaddr.0, readonly)
            .map_err(host("VFIO_MAP_DMA"))
    }

    fn dma_unmap(&mut self, iova: Iova, size: u64, unmap_all: bool) -> Result<()> {
        let fd = self.container_fd()?;
        self.driver
            .unmap_dma(fd, iova.0, size, unmap_all)
            .map(|_| ())
            .map_err(host("VFIO_UNMAP_DMA"))
    }

    fn set_dirty_tracking(&mut self, start: bool) -> Result<()> {
        if !self.info.dirty_pages_supported {
            return Err(Error::Unsupported("container dirty tracking"));
        }
        let fd = self.container_fd()?;
        self.driver
            .set_dirty_tracking(fd, start)
            .map_err(host("VFIO_IOMMU_DIRTY_PAGES"))
    }

    fn query_dirty_bitmap(
        &mut self,
        iova: Iova,
        size: u64,
        bitmap: &mut DirtyBitmap,
    ) -> Result<()> {
        let fd = self.container_fd()?;
        let page_size = bitmap.page_size();
        self.driver
            .get_dirty_bitmap(fd, iova.0, size, page_size, bitmap.as_words_mut())
            .map_err(host("VFIO_IOMMU_DIRTY_PAGES_FLAG_GET_BITMAP"))
    }

    fn pci_hot_reset(
        &mut self,
        device: &BackendDevice,
        single: bool,
        groups: &OwnedGroups,
    ) -> Result<()> {
        let deps = self
            .driver
            .pci_hot_reset_info(device.fd)
            .map_err(host("VFIO_DEVICE_GET_PCI_HOT_RESET_INFO"))?;

        let mut fds = Vec::new();
        for dep in &deps {
            let group_fd = self
                .groups
                .get(&dep.group_id)
                .map(|g| g.fd)
                .or_else(|| groups.get(&dep.group_id).copied())
                .ok_or_else(|| Error::HotResetUnowned {
                    device: device.name.clone(),
                    group: dep.group_id,
                })?;
            if single && device.pci_address.as_deref() != Some(dep.pci_address.as_str()) {
                return Err(Error::HotResetNotSingle {
                    device: device.name.clone(),
                    dependent: dep.pci_address.clone(),
                });
            }
            if !fds.contains(&group_fd) {
                fds.push(group_fd);
            }
        }

        self.driver
            .pci_hot_reset(device.fd, &fds)
            .map_err(host("VFIO_DEVICE_PCI_HOT_RESET"))
    }

    fn group_fds(&self) -> Vec<(u32, RawFd)> {
        self.groups.iter().map(|(id, g)| (*id, g.fd)).collect()
    }

    fn release(&mut self) {
        let groups: Vec<u32> = self.groups.keys().copied().collect();
        for group_id in groups {
            self.remove_group(group_id);
        }
        if let Some(fd) = self.fd.take() {
            self.driver.close(fd);
            self.cpr.delete_fd(CPR_CONTAINER, self.first_group as i32);
        }
        self.iommu_set = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpr::LocalCprStore;
    use crate::test_utils::{legacy_device, MockLegacyDriver, Op};

    fn backend(driver: &Arc<MockLegacyDriver>, cpr: &Arc<LocalCprStore>) -> LegacyBackend {
        LegacyBackend::new(driver.clone(), cpr.clone(), 1)
    }

    #[test]
    fn test_setup_prefers_richest_iommu_type() {
        let driver = Arc::new(MockLegacyDriver::new());
        driver.set_iommu_types(&[IommuType::Type1, IommuType::SpaprTce]);
        let cpr = Arc::new(LocalCprStore::new());
        let mut b = backend(&driver, &cpr);
        b.setup().unwrap();
        assert_eq!(b.iommu_type(), Some(IommuType::Type1));

        driver.set_iommu_types(&[]);
        let mut b = LegacyBackend::new(driver.clone(), cpr.clone(), 2);
        assert!(matches!(b.setup(), Err(Error::NoIommuType)));
        // Only the first container's descriptor is preserved.
        assert_eq!(cpr.len(), 1);
    }

    #[test]
    fn test_attach_sets_iommu_once() {
        let driver = Arc::new(MockLegacyDriver::new());
        let cpr = Arc::new(LocalCprStore::new());
        let mut b = backend(&driver, &cpr);
        b.setup().unwrap();

        let d1 = b.attach_device(&legacy_device("0000:01:00.0", 1)).unwrap();
        let d2 = b.attach_device(&legacy_device("0000:02:00.0", 2)).unwrap();
        assert_eq!(d1.backend_ref, BackendDeviceRef::Group { group_id: 1 });
        assert_eq!(b.group_ids().collect::<Vec<_>>(), vec![1, 2]);
        let set_iommu = driver
            .take_ops()
            .into_iter()
            .filter(|op| matches!(op, Op::SetIommu(_)))
            .count();
        assert_eq!(set_iommu, 1);
        assert_eq!(b.info().pgsizes, 0x1000);

        b.detach_device(&d1);
        assert_eq!(b.group_ids().collect::<Vec<_>>(), vec![2]);
        b.detach_device(&d2);
        b.release();
        assert!(cpr.is_empty());
        assert_eq!(driver.open_fds(), 0);
    }

    #[test]
    fn test_group_not_viable() {
        let driver = Arc::new(MockLegacyDriver::new());
        driver.set_group_viable(1, false);
        let cpr = Arc::new(LocalCprStore::new());
        let mut b = backend(&driver, &cpr);
        b.setup().unwrap();
        assert!(matches!(
            b.attach_device(&legacy_device("0000:01:00.0", 1)),
            Err(Error::GroupNotViable(1))
        ));
        assert_eq!(b.group_ids().count(), 0);
        b.release();
        assert_eq!(driver.open_fds(), 0);
    }

    #[test]
    fn test_group_rejected_by_configured_container_is_incompatible() {
        let driver = Arc::new(MockLegacyDriver::new());
        let cpr = Arc::new(LocalCprStore::new());
        let mut b = backend(&driver, &cpr);
        b.setup().unwrap();
        b.attach_device(&legacy_device("0000:01:00.0", 1)).unwrap();

        driver.reject_group(5);
        let err = b.attach_device(&legacy_device("0000:05:00.0", 5)).unwrap_err();
        assert!(err.is_incompatible());
        assert_eq!(b.group_ids().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_inconsistent_discard_within_group() {
        let driver = Arc::new(MockLegacyDriver::new());
        let cpr = Arc::new(LocalCprStore::new());
        let mut b = backend(&driver, &cpr);
        b.setup().unwrap();
        b.attach_device(&legacy_device("0000:01:00.0", 1)).unwrap();
        let other = legacy_device("0000:01:00.1", 1).with_ram_discard_allowed(true);
        assert!(matches!(
            b.attach_device(&other),
            Err(Error::InconsistentDiscard(1))
        ));
    }

    #[test]
    fn test_device_open_failure_unwinds_group() {
        let driver = Arc::new(MockLegacyDriver::new());
        driver.fail_device_open("0000:01:00.0");
        let cpr = Arc::new(LocalCprStore::new());
        let mut b = backend(&driver, &cpr);
        b.setup().unwrap();
        assert!(b.attach_device(&legacy_device("0000:01:00.0", 1)).is_err());
        assert_eq!(b.group_ids().count(), 0);
        b.release();
        assert_eq!(driver.open_fds(), 0);
    }

    #[test]
    fn test_hot_reset() {
        let driver = Arc::new(MockLegacyDriver::new());
        let cpr = Arc::new(LocalCprStore::new());
        let mut b = backend(&driver, &cpr);
        b.setup().unwrap();
        let dev = b
            .attach_device(&legacy_device("0000:01:00.0", 1).with_pci_address("0000:01:00.0"))
            .unwrap();
        let mut groups = OwnedGroups::new();

        driver.set_hot_reset_deps(vec![HotResetDependency {
            group_id: 1,
            pci_address: "0000:01:00.0".to_owned(),
        }]);
        b.pci_hot_reset(&dev, true, &groups).unwrap();

        driver.set_hot_reset_deps(vec![
            HotResetDependency {
                group_id: 1,
                pci_address: "0000:01:00.0".to_owned(),
            },
            HotResetDependency {
                group_id: 1,
                pci_address: "0000:01:00.1".to_owned(),
            },
        ]);
        assert!(matches!(
            b.pci_hot_reset(&dev, true, &groups),
            Err(Error::HotResetNotSingle { .. })
        ));
        b.pci_hot_reset(&dev, false, &groups).unwrap();

        driver.set_hot_reset_deps(vec![HotResetDependency {
            group_id: 9,
            pci_address: "0000:09:00.0".to_owned(),
        }]);
        assert!(matches!(
            b.pci_hot_reset(&dev, false, &groups),
            Err(Error::HotResetUnowned { group: 9, .. })
        ));

        // Group 9 is open in another container.
        groups.insert(9, 42);
        b.pci_hot_reset(&dev, false, &groups).unwrap();
        let own_fd = b.group_fds()[0].1;
        assert_eq!(driver.hot_resets().last(), Some(&vec![42]));
        assert_eq!(b.group_fds(), vec![(1, own_fd)]);
    }

    #[test]
    fn test_dirty_tracking_needs_host_page_size() {
        let driver = Arc::new(MockLegacyDriver::new());
        driver.set_dirty_tracking(host_page_size() << 9, 0x1000);
        let cpr = Arc::new(LocalCprStore::new());
        let mut b = backend(&driver, &cpr);
        b.setup().unwrap();
        b.attach_device(&legacy_device("0000:01:00.0", 1)).unwrap();
        assert_eq!(b.info().dirty_pgsizes, host_page_size() << 9);
        assert!(!b.info().dirty_pages_supported);
        assert!(matches!(
            b.set_dirty_tracking(true),
            Err(Error::Unsupported(_))
        ));

        let driver = Arc::new(MockLegacyDriver::new());
        driver.set_dirty_tracking(host_page_size() | host_page_size() << 9, 0x1000);
        let cpr = Arc::new(LocalCprStore::new());
        let mut b = backend(&driver, &cpr);
        b.setup().unwrap();
        b.attach_device(&legacy_device("0000:01:00.0", 1)).unwrap();
        assert!(b.info().dirty_pages_supported);
    }
}
