// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The vfio-user backend: DMA mapping requests forwarded to a device server over a socket.
//!
//! A vfio-user server implements a single device, so the container around this backend never
//! accepts a second device.

use std::sync::Arc;

use vmm_sys_util::errno;

use super::{
    host, BackendDevice, BackendDeviceRef, BackendInfo, BackendKind, DeviceInfo, Error,
    IommuBackendOps, OwnedGroups, Result,
};
use crate::address::{HostAddr, Iova};
use crate::bitmap::DirtyBitmap;
use crate::device::{Device, DeviceTransport};

/// A connected vfio-user server.
pub trait VfioUserProxy: Send + Sync {
    /// IOMMU page sizes advertised by the server.
    fn page_sizes(&self) -> u64;
    /// Maximum number of DMA regions the server accepts, 0 when unlimited.
    fn max_dma_regions(&self) -> u32;
    /// Query the region/irq layout of the device.
    fn device_info(&self) -> errno::Result<DeviceInfo>;
    /// `VFIO_USER_DMA_MAP`.
    fn dma_map(&self, iova: u64, size: u64, vaddr: u64, readonly: bool) -> errno::Result<()>;
    /// `VFIO_USER_DMA_UNMAP`; `all` unmaps everything.
    fn dma_unmap(&self, iova: u64, size: u64, all: bool) -> errno::Result<()>;
    /// `VFIO_USER_DEVICE_RESET`.
    fn reset(&self) -> errno::Result<()>;
}

/// Backend forwarding to one vfio-user server.
pub struct UserBackend {
    proxy: Arc<dyn VfioUserProxy>,
    info: BackendInfo,
    device: Option<String>,
}

impl UserBackend {
    pub(crate) fn new(proxy: Arc<dyn VfioUserProxy>) -> Self {
        UserBackend {
            proxy,
            info: BackendInfo::default(),
            device: None,
        }
    }
}

impl super::private::Sealed for UserBackend {}

impl IommuBackendOps for UserBackend {
    fn setup(&mut self) -> Result<()> {
        let pgsizes = self.proxy.page_sizes();
        self.info = BackendInfo {
            pgsizes: if pgsizes != 0 {
                pgsizes
            } else {
                crate::page::host_page_size()
            },
            dma_max_mappings: self.proxy.max_dma_regions(),
            unmap_all_supported: true,
            ..BackendInfo::default()
        };
        Ok(())
    }

    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn attach_device(&mut self, device: &Device) -> Result<BackendDevice> {
        let DeviceTransport::User { proxy } = device.transport() else {
            return Err(Error::WrongTransport(
                device.name().to_owned(),
                BackendKind::User,
            ));
        };
        if self.device.is_some() || !Arc::ptr_eq(proxy, &self.proxy) {
            return Err(Error::Incompatible(device.name().to_owned()));
        }
        let info = self
            .proxy
            .device_info()
            .map_err(host("VFIO_USER_DEVICE_GET_INFO"))?;
        self.device = Some(device.name().to_owned());
        Ok(BackendDevice {
            name: device.name().to_owned(),
            fd: -1,
            pci_address: device.pci_address().map(str::to_owned),
            info,
            backend_ref: BackendDeviceRef::User,
        })
    }

    fn detach_device(&mut self, device: &BackendDevice) {
        if self.device.as_deref() == Some(device.name.as_str()) {
            self.device = None;
        }
    }

    fn dma_map(&mut self, iova: Iova, size: u64, vaddr: HostAddr, readonly: bool) -> Result<()> {
        self.proxy
            .dma_map(iova.0, size, vaddr.0, readonly)
            .map_err(host("VFIO_USER_DMA_MAP"))
    }

    fn dma_unmap(&mut self, iova: Iova, size: u64, unmap_all: bool) -> Result<()> {
        self.proxy
            .dma_unmap(iova.0, size, unmap_all)
            .map_err(host("VFIO_USER_DMA_UNMAP"))
    }

    fn set_dirty_tracking(&mut self, _start: bool) -> Result<()> {
        Err(Error::Unsupported("vfio-user dirty tracking"))
    }

    fn query_dirty_bitmap(
        &mut self,
        _iova: Iova,
        _size: u64,
        _bitmap: &mut DirtyBitmap,
    ) -> Result<()> {
        Err(Error::Unsupported("vfio-user dirty tracking"))
    }

    // A vfio-user server implements one device; its reset domain is that device.
    fn pci_hot_reset(
        &mut self,
        _device: &BackendDevice,
        _single: bool,
        _groups: &OwnedGroups,
    ) -> Result<()> {
        self.proxy.reset().map_err(host("VFIO_USER_DEVICE_RESET"))
    }

    fn release(&mut self) {
        self.device = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{user_device, MockUserProxy};

    #[test]
    fn test_single_device_per_server() {
        let proxy = Arc::new(MockUserProxy::new());
        let dev = user_device("vfio-user0", proxy.clone());
        let mut b = UserBackend::new(proxy.clone());
        b.setup().unwrap();
        assert_eq!(b.info().pgsizes, 0x1000);
        assert!(!b.info().dirty_pages_supported);

        let bd = b.attach_device(&dev).unwrap();
        assert_eq!(bd.backend_ref, BackendDeviceRef::User);
        assert!(b
            .attach_device(&user_device("vfio-user1", proxy.clone()))
            .unwrap_err()
            .is_incompatible());

        b.detach_device(&bd);
        b.attach_device(&dev).unwrap();
    }

    #[test]
    fn test_requests_are_forwarded() {
        let proxy = Arc::new(MockUserProxy::new());
        let mut b = UserBackend::new(proxy.clone());
        b.setup().unwrap();
        b.dma_map(Iova(0x10000), 0x2000, HostAddr(0x5000), true)
            .unwrap();
        assert_eq!(proxy.maps(), vec![(0x10000, 0x2000, true)]);
        b.dma_unmap(Iova(0), 0, true).unwrap();
        assert!(proxy.maps().is_empty());
        assert!(matches!(
            b.set_dirty_tracking(true),
            Err(Error::Unsupported(_))
        ));
    }
}
