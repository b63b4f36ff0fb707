// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The iommufd backend.
//!
//! Each container owns one I/O address space (IOAS). Devices do not attach to the IOAS
//! directly but to a hardware page table ([`Hwpt`]) allocated on top of it; several devices
//! share a hwpt when the host IOMMU lets them. A hwpt lives exactly as long as it has devices.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;

use bitflags::bitflags;
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

bitflags! {
    /// Allocation flags of a hardware page table.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HwptFlags: u32 {
        /// The page table tracks dirty IOVAs.
        const DIRTY_TRACKING = 1 << 1;
    }
}

/// Hardware capabilities of the IOMMU behind a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HwCaps {
    /// The IOMMU can track dirty IOVAs.
    pub dirty_tracking: bool,
}

/// A device affected by the hot reset of a device bound to iommufd.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HotResetDevice {
    /// PCI address of the affected device.
    pub pci_address: String,
    /// Its device id in this iommufd context, `None` when it is bound elsewhere.
    pub devid: Option<u32>,
}

/// The iommufd context of the process.
pub trait IommufdDriver: Send + Sync {
    /// Allocate an I/O address space.
    fn ioas_alloc(&self) -> errno::Result<u32>;
    /// Free an I/O address space.
    fn ioas_free(&self, ioas: u32);
    /// Valid IOVA ranges of an I/O address space.
    fn ioas_iova_ranges(&self, ioas: u32) -> errno::Result<Vec<RangeInclusive<u64>>>;
    /// Open a VFIO device node.
    fn open_cdev(&self, path: &Path) -> errno::Result<RawFd>;
    /// Bind a device to the iommufd context, returning its device id.
    fn bind_device(&self, device: RawFd) -> errno::Result<u32>;
    /// Query the IOMMU capabilities of a bound device.
    fn hw_caps(&self, devid: u32) -> errno::Result<HwCaps>;
    /// Allocate a hardware page table for `devid` on top of `ioas`.
    fn hwpt_alloc(&self, devid: u32, ioas: u32, flags: HwptFlags) -> errno::Result<u32>;
    /// Free a hardware page table.
    fn hwpt_free(&self, hwpt: u32);
    /// Attach a device to a page table. `EINVAL` means the two are incompatible.
    fn attach_hwpt(&self, device: RawFd, hwpt: u32) -> errno::Result<()>;
    /// Detach a device from its page table.
    fn detach_hwpt(&self, device: RawFd) -> errno::Result<()>;
    /// Query the region/irq layout of a device.
    fn device_info(&self, device: RawFd) -> errno::Result<DeviceInfo>;
    /// `IOMMU_IOAS_MAP`.
    fn map_dma(
        &self,
        ioas: u32,
        iova: u64,
        size: u64,
        vaddr: u64,
        readonly: bool,
    ) -> errno::Result<()>;
    /// `IOMMU_IOAS_UNMAP`; `iova == 0, size == u64::MAX` unmaps everything.
    fn unmap_dma(&self, ioas: u32, iova: u64, size: u64) -> errno::Result<u64>;
    /// Start or stop dirty tracking of a page table.
    fn set_dirty_tracking(&self, hwpt: u32, start: bool) -> errno::Result<()>;
    /// Read (and clear) the dirty bitmap of `[iova, iova + size)` in a page table.
    fn get_dirty_bitmap(
        &self,
        hwpt: u32,
        iova: u64,
        size: u64,
        page_size: u64,
        bitmap: &mut [u64],
    ) -> errno::Result<()>;
    /// List the devices affected by a hot reset of `device`.
    fn pci_hot_reset_info(&self, device: RawFd) -> errno::Result<Vec<HotResetDevice>>;
    /// Hot reset a device bound to iommufd. Ownership is proven by the iommufd context.
    fn pci_hot_reset(&self, device: RawFd) -> errno::Result<()>;
    /// Close a descriptor returned by this driver.
    fn close(&self, fd: RawFd);
}

/// A hardware page table and the devices attached to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hwpt {
    id: u32,
    flags: HwptFlags,
    devices: BTreeSet<String>,
}

impl Hwpt {
    /// Page table id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Allocation flags.
    pub fn flags(&self) -> HwptFlags {
        self.flags
    }

    /// Number of attached devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

#[derive(Clone, Copy, Debug)]
struct BoundDevice {
    hwpt: u32,
}

/// Backend driving one iommufd I/O address space.
pub struct IommufdBackend {
    driver: Arc<dyn IommufdDriver>,
    cpr: Arc<dyn CprStore>,
    ioas: Option<u32>,
    info: BackendInfo,
    hwpts: Vec<Hwpt>,
    devices: BTreeMap<String, BoundDevice>,
}

impl IommufdBackend {
    pub(crate) fn new(driver: Arc<dyn IommufdDriver>, cpr: Arc<dyn CprStore>) -> Self {
        IommufdBackend {
            driver,
            cpr,
            ioas: None,
            info: BackendInfo::default(),
            hwpts: Vec::new(),
            devices: BTreeMap::new(),
        }
    }

    /// I/O address space of the container.
    pub fn ioas(&self) -> Option<u32> {
        self.ioas
    }

    /// Hardware page tables currently allocated.
    pub fn hwpts(&self) -> &[Hwpt] {
        &self.hwpts
    }

    fn ioas_id(&self) -> Result<u32> {
        self.ioas.ok_or(Error::Unsupported("an unallocated IOAS"))
    }

    fn refresh_dirty_support(&mut self) {
        self.info.dirty_pages_supported = !self.hwpts.is_empty()
            && self
                .hwpts
                .iter()
                .all(|h| h.flags.contains(HwptFlags::DIRTY_TRACKING));
    }

    // Attach to an existing page table or allocate a new one, richest flags first.
    fn attach_hwpt(&mut self, name: &str, fd: RawFd, devid: u32, caps: HwCaps) -> Result<u32> {
        let ioas = self.ioas_id()?;

        for hwpt in self.hwpts.iter_mut() {
            if hwpt.flags.contains(HwptFlags::DIRTY_TRACKING) && !caps.dirty_tracking {
                continue;
            }
            match self.driver.attach_hwpt(fd, hwpt.id) {
                Ok(()) => {
                    hwpt.devices.insert(name.to_owned());
                    return Ok(hwpt.id);
                }
                Err(e) if e.errno() == libc::EINVAL => {
                    debug!("{}: hwpt {} is incompatible", name, hwpt.id);
                }
                Err(e) => return Err(host("IOMMU_HWPT_ATTACH")(e)),
            }
        }

        let candidates = if caps.dirty_tracking {
            vec![HwptFlags::DIRTY_TRACKING, HwptFlags::empty()]
        } else {
            vec![HwptFlags::empty()]
        };
        let mut last_err = None;
        for flags in candidates {
            let id = match self.driver.hwpt_alloc(devid, ioas, flags) {
                Ok(id) => id,
                Err(e) => {
                    last_err = Some(host("IOMMU_HWPT_ALLOC")(e));
                    continue;
                }
            };
            if let Err(e) = self.driver.attach_hwpt(fd, id) {
                self.driver.hwpt_free(id);
                return Err(host("IOMMU_HWPT_ATTACH")(e));
            }
            self.hwpts.push(Hwpt {
                id,
                flags,
                devices: BTreeSet::from([name.to_owned()]),
            });
            return Ok(id);
        }
        Err(last_err.unwrap_or(Error::Unsupported("hwpt allocation")))
    }

    fn detach_from_hwpt(&mut self, name: &str, hwpt_id: u32) {
        if let Some(pos) = self.hwpts.iter().position(|h| h.id == hwpt_id) {
            let hwpt = &mut self.hwpts[pos];
            hwpt.devices.remove(name);
            if hwpt.devices.is_empty() {
                self.driver.hwpt_free(hwpt_id);
                self.hwpts.remove(pos);
            }
        }
    }
}

impl super::private::Sealed for IommufdBackend {}

impl IommuBackendOps for IommufdBackend {
    fn setup(&mut self) -> Result<()> {
        let ioas = self.driver.ioas_alloc().map_err(host("IOMMU_IOAS_ALLOC"))?;
        let ranges = match self.driver.ioas_iova_ranges(ioas) {
            Ok(r) if !r.is_empty() => r,
            Ok(_) => vec![0..=u64::MAX],
            Err(e) => {
                self.driver.ioas_free(ioas);
                return Err(host("IOMMU_IOAS_IOVA_RANGES")(e));
            }
        };
        self.ioas = Some(ioas);
        self.info = BackendInfo {
            pgsizes: host_page_size(),
            iova_ranges: ranges,
            dma_max_mappings: 0,
            dirty_pages_supported: false,
            dirty_pgsizes: host_page_size(),
            max_dirty_bitmap_size: u64::MAX,
            unmap_all_supported: true,
        };
        Ok(())
    }

    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn attach_device(&mut self, device: &Device) -> Result<BackendDevice> {
        let DeviceTransport::Cdev { path } = device.transport() else {
            return Err(Error::WrongTransport(
                device.name().to_owned(),
                BackendKind::IommuFd,
            ));
        };
        let name = device.name();
        if self.devices.contains_key(name) {
            return Err(Error::AlreadyAttached(name.to_owned()));
        }

        let (fd, _) = cpr::find_or_open(self.cpr.as_ref(), name, 0, || {
            self.driver.open_cdev(path)
        })
        .map_err(host("open VFIO cdev"))?;

        let res = self
            .driver
            .bind_device(fd)
            .map_err(host("VFIO_DEVICE_BIND_IOMMUFD"))
            .and_then(|devid| {
                let caps = self.driver.hw_caps(devid).unwrap_or_default();
                let hwpt = self.attach_hwpt(name, fd, devid, caps)?;
                Ok((devid, hwpt))
            });
        let (devid, hwpt_id) = match res {
            Ok(v) => v,
            Err(e) => {
                self.driver.close(fd);
                self.cpr.delete_fd(name, 0);
                return Err(e);
            }
        };

        let info = match self.driver.device_info(fd) {
            Ok(info) => info,
            Err(e) => {
                let _ = self.driver.detach_hwpt(fd);
                self.detach_from_hwpt(name, hwpt_id);
                self.driver.close(fd);
                self.cpr.delete_fd(name, 0);
                return Err(host("VFIO_DEVICE_GET_INFO")(e));
            }
        };

        self.devices
            .insert(name.to_owned(), BoundDevice { hwpt: hwpt_id });
        self.refresh_dirty_support();
        Ok(BackendDevice {
            name: name.to_owned(),
            fd,
            pci_address: device.pci_address().map(str::to_owned),
            info,
            backend_ref: BackendDeviceRef::IommuFd { devid, hwpt_id },
        })
    }

    fn detach_device(&mut self, device: &BackendDevice) {
        let Some(bound) = self.devices.remove(&device.name) else {
            return;
        };
        if let Err(e) = self.driver.detach_hwpt(device.fd) {
            warn!("{}: failed to detach from hwpt {}: {}", device.name, bound.hwpt, e);
        }
        self.detach_from_hwpt(&device.name, bound.hwpt);
        self.driver.close(device.fd);
        self.cpr.delete_fd(&device.name, 0);
        self.refresh_dirty_support();
    }

    fn dma_map(&mut self, iova: Iova, size: u64, vaddr: HostAddr, readonly: bool) -> Result<()> {
        let ioas = self.ioas_id()?;
        self.driver
            .map_dma(ioas, iova.0, size, vaddr.0, readonly)
            .map_err(host("IOMMU_IOAS_MAP"))
    }

    fn dma_unmap(&mut self, iova: Iova, size: u64, unmap_all: bool) -> Result<()> {
        let ioas = self.ioas_id()?;
        let (iova, size) = if unmap_all {
            (0, u64::MAX)
        } else {
            (iova.0, size)
        };
        self.driver
            .unmap_dma(ioas, iova, size)
            .map(|_| ())
            .map_err(host("IOMMU_IOAS_UNMAP"))
    }

    fn set_dirty_tracking(&mut self, start: bool) -> Result<()> {
        if !self.info.dirty_pages_supported {
            return Err(Error::Unsupported("hwpt dirty tracking"));
        }
        let ids: Vec<u32> = self.hwpts.iter().map(|h| h.id).collect();
        for (done, id) in ids.iter().enumerate() {
            if let Err(e) = self.driver.set_dirty_tracking(*id, start) {
                for undo in &ids[..done] {
                    let _ = self.driver.set_dirty_tracking(*undo, !start);
                }
                return Err(host("IOMMU_HWPT_SET_DIRTY_TRACKING")(e));
            }
        }
        Ok(())
    }

    fn query_dirty_bitmap(
        &mut self,
        iova: Iova,
        size: u64,
        bitmap: &mut DirtyBitmap,
    ) -> Result<()> {
        let mut scratch = bitmap.clone();
        for hwpt in &self.hwpts {
            scratch.reset();
            self.driver
                .get_dirty_bitmap(
                    hwpt.id,
                    iova.0,
                    size,
                    scratch.page_size(),
                    scratch.as_words_mut(),
                )
                .map_err(host("IOMMU_HWPT_GET_DIRTY_BITMAP"))?;
            bitmap.merge(&scratch);
        }
        Ok(())
    }

    fn pci_hot_reset(
        &mut self,
        device: &BackendDevice,
        single: bool,
        _groups: &OwnedGroups,
    ) -> Result<()> {
        let affected = self
            .driver
            .pci_hot_reset_info(device.fd)
            .map_err(host("VFIO_DEVICE_GET_PCI_HOT_RESET_INFO"))?;
        for dep in &affected {
            if dep.devid.is_none() {
                return Err(Error::HotResetUnownedDevice {
                    device: device.name.clone(),
                    dependent: dep.pci_address.clone(),
                });
            }
            if single && device.pci_address.as_deref() != Some(dep.pci_address.as_str()) {
                return Err(Error::HotResetNotSingle {
                    device: device.name.clone(),
                    dependent: dep.pci_address.clone(),
                });
            }
        }
        self.driver
            .pci_hot_reset(device.fd)
            .map_err(host("VFIO_DEVICE_PCI_HOT_RESET"))
    }

    fn release(&mut self) {
        for hwpt in self.hwpts.drain(..) {
            self.driver.hwpt_free(hwpt.id);
        }
        if let Some(ioas) = self.ioas.take() {
            self.driver.ioas_free(ioas);
        }
    }
}
