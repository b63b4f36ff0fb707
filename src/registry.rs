// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest address spaces and the containers serving them.
//!
//! The [`AddressSpaceRegistry`] owns every [`Container`]. A device attaches to the first
//! container of its address space that accepts it, or to a new one; when a container loses its
//! last device it is destroyed, and an address space left without containers is forgotten.
//! Devices only keep the [`ContainerHandle`] of their container.
//!
//! The registry also fans memory topology and migration events of an address space out to its
//! containers, and keeps the process-wide services that follow the set of containers: the RAM
//! discard disabler, the kernel acceleration device and the multiple-device migration blocker.

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use vmm_sys_util::errno;

use crate::backend::{BackendDevice, HostDrivers, OwnedGroups};
use crate::container::{self, Container, ContainerHandle};
use crate::device::{AttachState, Device, DeviceId};
use crate::dirty::DirtyLog;
use crate::memory::{AddressSpace, AddressSpaceId, IotlbEntry, MemorySection, NotifierId};
use crate::migration::{self, MigrationFlags, OnOffAuto, MULTIPLE_DEVICES_BLOCKER};

/// Errors of the registry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A container operation failed.
    #[error(transparent)]
    Container(#[from] container::Error),
    /// The device is already attached.
    #[error("Device {0} is already attached")]
    AlreadyAttached(String),
    /// The device is not attached.
    #[error("Device {0} is not attached")]
    NotAttached(String),
    /// RAM discard could not be disabled for a new container.
    #[error("Cannot set discarding of RAM broken: {0}")]
    DiscardDisable(#[source] errno::Error),
    /// The acceleration device refused a device descriptor.
    #[error("{device}: Failed to add device to the acceleration device: {source}")]
    Accel {
        /// Device name.
        device: String,
        /// Host errno.
        #[source]
        source: errno::Error,
    },
    /// Migration requirements of the device cannot be met.
    #[error(transparent)]
    Migration(#[from] migration::Error),
}

/// Result of registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Process-wide control over discarding guest RAM (e.g. by balloon or virtio-mem).
pub trait RamDiscardControl: Send + Sync {
    /// Forbid discarding until a matching [`enable`](Self::enable). Calls nest.
    fn disable(&self) -> errno::Result<()>;
    /// Undo one [`disable`](Self::disable).
    fn enable(&self);
}

#[derive(Debug, Default)]
struct DiscardState {
    disabled: u32,
    required: u32,
}

/// Counter-based [`RamDiscardControl`].
///
/// Discarding cannot be disabled while a memory backend requires it, and vice versa.
#[derive(Debug, Default)]
pub struct DiscardCounter {
    state: Mutex<DiscardState>,
}

impl DiscardCounter {
    /// Create a counter with discarding allowed.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DiscardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Declare that a memory backend depends on discarding. Fails with `EBUSY` while it is
    /// disabled.
    pub fn require(&self) -> errno::Result<()> {
        let mut state = self.state();
        if state.disabled > 0 {
            return Err(errno::Error::new(libc::EBUSY));
        }
        state.required += 1;
        Ok(())
    }

    /// Undo one [`require`](Self::require).
    pub fn unrequire(&self) {
        let mut state = self.state();
        state.required = state.required.saturating_sub(1);
    }

    /// Whether discarding is currently disabled.
    pub fn is_disabled(&self) -> bool {
        self.state().disabled > 0
    }

    /// Number of outstanding disables.
    pub fn disabled_count(&self) -> u32 {
        self.state().disabled
    }
}

impl RamDiscardControl for DiscardCounter {
    fn disable(&self) -> errno::Result<()> {
        let mut state = self.state();
        if state.required > 0 {
            return Err(errno::Error::new(libc::EBUSY));
        }
        state.disabled += 1;
        Ok(())
    }

    fn enable(&self) {
        let mut state = self.state();
        state.disabled = state.disabled.saturating_sub(1);
    }
}

/// The kernel's VFIO acceleration pseudo device (the KVM VFIO device).
pub trait AccelDevice: Send + Sync {
    /// Tell the hypervisor about a VFIO descriptor.
    fn add_fd(&self, fd: RawFd) -> errno::Result<()>;
    /// Withdraw a descriptor previously added.
    fn del_fd(&self, fd: RawFd) -> errno::Result<()>;
}

struct SpaceEntry {
    space: Arc<AddressSpace>,
    containers: BTreeMap<ContainerHandle, Container>,
}

/// The address spaces with passthrough devices, and their containers.
pub struct AddressSpaceRegistry {
    host: HostDrivers,
    dirty_log: Arc<dyn DirtyLog>,
    discard: Arc<dyn RamDiscardControl>,
    accel: Option<Arc<dyn AccelDevice>>,
    spaces: BTreeMap<AddressSpaceId, SpaceEntry>,
    next_index: u64,
    max_memslots: u32,
    // Devices with migration support, and whether they support P2P.
    migratable: BTreeMap<DeviceId, bool>,
    migration_blocker: Option<String>,
}

impl AddressSpaceRegistry {
    /// Create an empty registry using `host` to create backends.
    pub fn new(
        host: HostDrivers,
        dirty_log: Arc<dyn DirtyLog>,
        discard: Arc<dyn RamDiscardControl>,
    ) -> Self {
        AddressSpaceRegistry {
            host,
            dirty_log,
            discard,
            accel: None,
            spaces: BTreeMap::new(),
            next_index: 0,
            max_memslots: container::DEFAULT_MAX_MEMSLOTS,
            migratable: BTreeMap::new(),
            migration_blocker: None,
        }
    }

    /// Register device descriptors with `accel` on attach.
    pub fn with_accel(mut self, accel: Arc<dyn AccelDevice>) -> Self {
        self.accel = Some(accel);
        self
    }

    /// Size new containers' DMA mapping budget for `max_memslots` hypervisor memory slots.
    pub fn with_max_memslots(mut self, max_memslots: u32) -> Self {
        self.max_memslots = max_memslots;
        self
    }

    /// Number of address spaces with at least one container.
    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    /// Number of live containers.
    pub fn container_count(&self) -> usize {
        self.spaces.values().map(|e| e.containers.len()).sum()
    }

    /// Containers of an address space, in creation order.
    pub fn containers(&self, space: AddressSpaceId) -> impl Iterator<Item = &Container> {
        self.spaces
            .get(&space)
            .into_iter()
            .flat_map(|e| e.containers.values())
    }

    /// Look up a container.
    pub fn container(&self, handle: ContainerHandle) -> Option<&Container> {
        self.spaces.get(&handle.space())?.containers.get(&handle)
    }

    /// Look up a container for modification.
    pub fn container_mut(&mut self, handle: ContainerHandle) -> Option<&mut Container> {
        self.spaces
            .get_mut(&handle.space())?
            .containers
            .get_mut(&handle)
    }

    /// The migration blocker installed because of the current set of devices, if any.
    pub fn migration_blocker(&self) -> Option<&str> {
        self.migration_blocker.as_deref()
    }

    /// Attach `device` to a container serving `space`.
    ///
    /// Migration must have been initialized on the device beforehand for it to count as
    /// migratable. Every failure leaves the device detached and the registry as it was.
    pub fn attach_device(
        &mut self,
        device: &mut Device,
        space: &Arc<AddressSpace>,
    ) -> Result<ContainerHandle> {
        if device.container.is_some() {
            return Err(Error::AlreadyAttached(device.name().to_owned()));
        }
        device.state = AttachState::Attaching;
        match self.try_attach(device, space) {
            Ok(handle) => {
                device.state = AttachState::Attached;
                debug!("{}: attached to {:?}", device.name(), handle);
                Ok(handle)
            }
            Err(e) => {
                device.state = AttachState::Detached;
                Err(e)
            }
        }
    }

    fn try_attach(&mut self, device: &mut Device, space: &Arc<AddressSpace>) -> Result<ContainerHandle> {
        let (handle, backend_dev) = match self.attach_existing(device, space.id())? {
            Some(found) => found,
            None => self.create_container(device, space)?,
        };

        if let Err(e) = self.accel_add(&backend_dev) {
            self.detach_from_container(handle, device.id());
            return Err(e);
        }
        if let Err(e) = self.block_multiple_devices_migration(device) {
            self.accel_del(&backend_dev);
            self.detach_from_container(handle, device.id());
            return Err(e);
        }

        device.container = Some(handle);
        device.info = Some(backend_dev.info);
        Ok(handle)
    }

    fn attach_existing(
        &mut self,
        device: &Device,
        space: AddressSpaceId,
    ) -> Result<Option<(ContainerHandle, BackendDevice)>> {
        let Some(entry) = self.spaces.get_mut(&space) else {
            return Ok(None);
        };
        for (handle, container) in entry.containers.iter_mut() {
            match container.attach_device(device) {
                Ok(backend_dev) => return Ok(Some((*handle, backend_dev))),
                Err(e) if e.is_incompatible() => {
                    debug!("{}: not joining {:?}: {}", device.name(), handle, e)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn create_container(
        &mut self,
        device: &Device,
        space: &Arc<AddressSpace>,
    ) -> Result<(ContainerHandle, BackendDevice)> {
        let handle = ContainerHandle::new(space.id(), self.next_index);
        self.next_index += 1;

        let mut container =
            Container::create(handle, device, &self.host, self.dirty_log.clone())?;
        container.set_max_memslots(self.max_memslots);
        let backend_dev = match container.attach_device(device) {
            Ok(d) => d,
            Err(e) => {
                container.release();
                return Err(e.into());
            }
        };

        let discard_disabled = !container.ram_discard_allowed();
        if discard_disabled {
            if let Err(e) = self.discard.disable() {
                let _ = container.detach_device(device.id());
                container.release();
                return Err(Error::DiscardDisable(e));
            }
        }

        let view = space.flat_view();
        if let Err(e) = container.register_listener(&view) {
            container.unregister_listener(&view);
            let _ = container.detach_device(device.id());
            container.release();
            if discard_disabled {
                self.discard.enable();
            }
            return Err(e.into());
        }
        container.initialized = true;

        self.spaces
            .entry(space.id())
            .or_insert_with(|| SpaceEntry {
                space: space.clone(),
                containers: BTreeMap::new(),
            })
            .containers
            .insert(handle, container);
        debug!("{}: created container {:?}", device.name(), handle);
        Ok((handle, backend_dev))
    }

    // Remove a device from its container, destroying the container and forgetting the address
    // space as they empty.
    fn detach_from_container(&mut self, handle: ContainerHandle, id: DeviceId) {
        let Some(entry) = self.spaces.get_mut(&handle.space()) else {
            return;
        };
        let Some(container) = entry.containers.get_mut(&handle) else {
            return;
        };

        let last = container.device_count() == 1 && container.contains(id);
        if last {
            // Unmap while the backend still has a device to unmap for.
            container.unregister_listener(&entry.space.flat_view());
        }
        if let Err(e) = container.detach_device(id) {
            warn!("{:?}: {}", handle, e);
        }

        if container.is_empty() {
            if let Some(mut container) = entry.containers.remove(&handle) {
                container.release();
                if !container.ram_discard_allowed() {
                    self.discard.enable();
                }
                debug!("destroyed container {:?}", handle);
            }
            if entry.containers.is_empty() {
                self.spaces.remove(&handle.space());
            }
        }
    }

    fn accel_add(&self, device: &BackendDevice) -> Result<()> {
        match &self.accel {
            Some(accel) if device.fd >= 0 => {
                accel.add_fd(device.fd).map_err(|source| Error::Accel {
                    device: device.name.clone(),
                    source,
                })
            }
            _ => Ok(()),
        }
    }

    fn accel_del(&self, device: &BackendDevice) {
        if let Some(accel) = &self.accel {
            if device.fd >= 0 {
                if let Err(e) = accel.del_fd(device.fd) {
                    warn!("{}: Failed to remove device from the acceleration device: {}", device.name, e);
                }
            }
        }
    }

    fn multiple_devices_blocked(&self) -> bool {
        self.migratable.len() > 1 && self.migratable.values().any(|p2p| !p2p)
    }

    fn update_migration_blocker(&mut self) {
        if self.multiple_devices_blocked() {
            if self.migration_blocker.is_none() {
                warn!("{}", MULTIPLE_DEVICES_BLOCKER);
                self.migration_blocker = Some(MULTIPLE_DEVICES_BLOCKER.to_owned());
            }
        } else {
            self.migration_blocker = None;
        }
    }

    fn block_multiple_devices_migration(&mut self, device: &Device) -> Result<()> {
        let Some(migration) = device.migration() else {
            return Ok(());
        };
        self.migratable
            .insert(device.id(), migration.flags().contains(MigrationFlags::P2P));
        if self.multiple_devices_blocked()
            && device.migration_config().enable_migration == OnOffAuto::On
        {
            self.migratable.remove(&device.id());
            return Err(migration::Error::MultipleDevices.into());
        }
        self.update_migration_blocker();
        Ok(())
    }

    /// Detach `device` from its container.
    pub fn detach_device(&mut self, device: &mut Device) -> Result<()> {
        let handle = device
            .container
            .ok_or_else(|| Error::NotAttached(device.name().to_owned()))?;
        device.state = AttachState::Detaching;

        if self.migratable.remove(&device.id()).is_some() {
            self.update_migration_blocker();
        }
        let backend_dev = self
            .container(handle)
            .and_then(|c| c.devices.get(&device.id()))
            .map(|d| d.backend.clone());
        if let Some(backend_dev) = &backend_dev {
            self.accel_del(backend_dev);
        }
        self.detach_from_container(handle, device.id());

        device.container = None;
        device.info = None;
        device.state = AttachState::Detached;
        debug!("{}: detached from {:?}", device.name(), handle);
        Ok(())
    }

    /// Hot reset an attached PCI device, alone if `single`.
    ///
    /// The reset domain may include devices of any container in any address space.
    pub fn pci_hot_reset(&mut self, device: &Device, single: bool) -> Result<()> {
        let handle = device
            .container()
            .ok_or_else(|| Error::NotAttached(device.name().to_owned()))?;
        let groups: OwnedGroups = self
            .spaces
            .values()
            .flat_map(|e| e.containers.values())
            .flat_map(|c| c.group_fds())
            .collect();
        let container = self
            .container_mut(handle)
            .ok_or_else(|| Error::NotAttached(device.name().to_owned()))?;
        container.pci_hot_reset(device.id(), single, &groups)?;
        Ok(())
    }

    fn containers_mut(&mut self, space: AddressSpaceId) -> impl Iterator<Item = &mut Container> {
        self.spaces
            .get_mut(&space)
            .into_iter()
            .flat_map(|e| e.containers.values_mut())
    }

    /// A section entered `space`. Returns the first fatal error (see
    /// [`container::Error::is_fatal`]) after every container has seen the section.
    pub fn region_add(&mut self, space: AddressSpaceId, section: &MemorySection) -> Result<()> {
        let mut first_err = None;
        for container in self.containers_mut(space) {
            if let Err(e) = container.region_add(section) {
                error!("{}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), |e| Err(e.into()))
    }

    /// A section left `space`.
    pub fn region_del(&mut self, space: AddressSpaceId, section: &MemorySection) {
        for container in self.containers_mut(space) {
            container.region_del(section);
        }
    }

    /// Start dirty tracking in every container of `space`. On failure the containers already
    /// started are stopped again.
    pub fn log_global_start(&mut self, space: AddressSpaceId) -> Result<()> {
        let Some(entry) = self.spaces.get_mut(&space) else {
            return Ok(());
        };
        let view = entry.space.flat_view();
        let mut started = Vec::new();
        let mut failure = None;
        for (handle, container) in entry.containers.iter_mut() {
            match container.start_dirty_tracking(&view) {
                Ok(()) => started.push(*handle),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let Some(e) = failure else {
            return Ok(());
        };
        for handle in &started {
            if let Some(container) = entry.containers.get_mut(handle) {
                if let Err(e) = container.stop_dirty_tracking() {
                    warn!("{:?}: {}", handle, e);
                }
            }
        }
        Err(e.into())
    }

    /// Stop dirty tracking in every container of `space`. Failures are logged.
    pub fn log_global_stop(&mut self, space: AddressSpaceId) {
        for container in self.containers_mut(space) {
            if let Err(e) = container.stop_dirty_tracking() {
                error!("vfio: Could not stop dirty page tracking - {}", e);
            }
        }
    }

    /// Sync the dirty state of `section` from every container of `space`.
    pub fn log_sync(&mut self, space: AddressSpaceId, section: &MemorySection) -> Result<()> {
        for container in self.containers_mut(space) {
            container.log_sync(section)?;
        }
        Ok(())
    }

    fn notifier_owner(&mut self, space: AddressSpaceId, id: NotifierId) -> Option<&mut Container> {
        self.containers_mut(space).find(|c| c.owns_notifier(id))
    }

    /// Deliver a guest IOMMU event to the container that registered notifier `id`.
    pub fn iommu_notify(
        &mut self,
        space: AddressSpaceId,
        id: NotifierId,
        entry: &IotlbEntry,
    ) -> Result<()> {
        match self.notifier_owner(space, id) {
            Some(container) => Ok(container.iommu_notify(id, entry)?),
            None => {
                debug!("IOMMU event for unknown notifier {:?}", id);
                Ok(())
            }
        }
    }

    /// Deliver a populate event to the container that registered discard listener `id`.
    pub fn ram_discard_populate(
        &mut self,
        space: AddressSpaceId,
        id: NotifierId,
        section: &MemorySection,
    ) -> Result<()> {
        match self.notifier_owner(space, id) {
            Some(container) => Ok(container.ram_discard_populate(id, section)?),
            None => Ok(()),
        }
    }

    /// Deliver a discard event to the container that registered discard listener `id`.
    pub fn ram_discard_discard(
        &mut self,
        space: AddressSpaceId,
        id: NotifierId,
        section: &MemorySection,
    ) {
        if let Some(container) = self.notifier_owner(space, id) {
            container.ram_discard_discard(id, section);
        }
    }
}
