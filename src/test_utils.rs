// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Mock host drivers and collaborators for the unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Cursor, Read, Write};
use std::ops::RangeInclusive;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use vmm_sys_util::errno;

use crate::address::{HostAddr, RamAddr};
use crate::backend::{
    DeviceInfo, Extension, HostDrivers, HotResetDependency, HotResetDevice, HwCaps, HwptFlags,
    IommuInfo, IommuType, IommufdDriver, MigrationCap, VfioContainerDriver, VfioUserProxy,
};
use crate::bitmap::DirtyBitmap;
use crate::container::{Container, ContainerHandle};
use crate::cpr::LocalCprStore;
use crate::device::{Device, DeviceIo, DeviceTransport};
use crate::dirty::{DirtyLog, IovaRange};
use crate::memory::{
    self, AddressSpace, GuestIommu, IommuAccess, IotlbEntry, MemoryRegion, MemorySection,
    NotifierId, RamDiscardManager, RegionKind, Translation,
};
use crate::migration::{
    DataStream, DeviceConfig, DeviceState, MigrationDriver, MigrationFlags, PrecopyInfo,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
}

// IOVA -> (size, vaddr), never overlapping.
#[derive(Debug, Default)]
struct MappingTable {
    map: BTreeMap<u64, (u64, u64)>,
}

impl MappingTable {
    fn overlapping(&self, iova: u64, size: u64) -> Vec<u64> {
        let start = u128::from(iova);
        let end = start + u128::from(size);
        self.map
            .iter()
            .filter(|(s, (sz, _))| {
                let s = u128::from(**s);
                s < end && start < s + u128::from(*sz)
            })
            .map(|(s, _)| *s)
            .collect()
    }

    fn insert(&mut self, iova: u64, size: u64, vaddr: u64) -> errno::Result<()> {
        if size == 0 {
            return Err(errno::Error::new(libc::EINVAL));
        }
        if !self.overlapping(iova, size).is_empty() {
            return Err(errno::Error::new(libc::EEXIST));
        }
        self.map.insert(iova, (size, vaddr));
        Ok(())
    }

    fn remove(&mut self, iova: u64, size: u64) -> u64 {
        let start = u128::from(iova);
        let end = start + u128::from(size);
        let mut removed = 0u128;
        for key in self.overlapping(iova, size) {
            let (sz, vaddr) = self.map.remove(&key).unwrap();
            let s = u128::from(key);
            let e = s + u128::from(sz);
            if s < start {
                self.map.insert(key, ((start - s) as u64, vaddr));
            }
            if e > end {
                let off = (end - s) as u64;
                self.map.insert(end as u64, ((e - end) as u64, vaddr + off));
            }
            removed += e.min(end) - s.max(start);
        }
        removed.min(u128::from(u64::MAX)) as u64
    }

    fn lookup(&self, iova: u64) -> Option<u64> {
        let (start, (size, vaddr)) = self.map.range(..=iova).next_back()?;
        (iova - start < *size).then(|| vaddr + (iova - start))
    }
}

/// Host calls recorded by the mock drivers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Map { iova: u64, size: u64 },
    Unmap { iova: u64, size: u64, all: bool },
    SetIommu(IommuType),
}

struct LegacyState {
    next_fd: RawFd,
    open: BTreeSet<RawFd>,
    groups: HashMap<RawFd, u32>,
    iommu_types: Vec<IommuType>,
    unmap_all: bool,
    info: IommuInfo,
    not_viable: BTreeSet<u32>,
    rejected: BTreeSet<u32>,
    failing_devices: BTreeSet<String>,
    hot_reset_deps: Vec<HotResetDependency>,
    // Group fds passed to each hot reset.
    hot_resets: Vec<Vec<RawFd>>,
    mappings: MappingTable,
    // Successful maps left before the next failure, and its errno.
    fail_map: Option<(u32, i32)>,
    map_calls: usize,
    dirty: BTreeSet<u64>,
    ops: Vec<Op>,
}

impl LegacyState {
    fn alloc_fd(&mut self) -> RawFd {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.open.insert(fd);
        fd
    }
}

/// In-memory VFIO container API.
pub struct MockLegacyDriver {
    state: Mutex<LegacyState>,
}

impl MockLegacyDriver {
    pub fn new() -> Self {
        MockLegacyDriver {
            state: Mutex::new(LegacyState {
                next_fd: 100,
                open: BTreeSet::new(),
                groups: HashMap::new(),
                iommu_types: vec![IommuType::Type1v2, IommuType::Type1],
                unmap_all: true,
                info: IommuInfo {
                    iova_pgsizes: 0x1000,
                    iova_ranges: Vec::new(),
                    dma_avail: None,
                    migration: None,
                },
                not_viable: BTreeSet::new(),
                rejected: BTreeSet::new(),
                failing_devices: BTreeSet::new(),
                hot_reset_deps: Vec::new(),
                hot_resets: Vec::new(),
                mappings: MappingTable::default(),
                fail_map: None,
                map_calls: 0,
                dirty: BTreeSet::new(),
                ops: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LegacyState> {
        lock(&self.state)
    }

    pub fn set_iommu_types(&self, types: &[IommuType]) {
        self.state().iommu_types = types.to_vec();
    }

    pub fn set_unmap_all_supported(&self, supported: bool) {
        self.state().unmap_all = supported;
    }

    pub fn set_pgsizes(&self, pgsizes: u64) {
        self.state().info.iova_pgsizes = pgsizes;
    }

    pub fn set_iova_ranges(&self, ranges: Vec<RangeInclusive<u64>>) {
        self.state().info.iova_ranges = ranges;
    }

    pub fn set_dma_avail(&self, avail: u32) {
        self.state().info.dma_avail = Some(avail);
    }

    pub fn set_dirty_tracking(&self, pgsize_bitmap: u64, max_dirty_bitmap_size: u64) {
        self.state().info.migration = Some(MigrationCap {
            pgsize_bitmap,
            max_dirty_bitmap_size,
        });
    }

    pub fn set_group_viable(&self, group_id: u32, viable: bool) {
        let mut state = self.state();
        if viable {
            state.not_viable.remove(&group_id);
        } else {
            state.not_viable.insert(group_id);
        }
    }

    pub fn reject_group(&self, group_id: u32) {
        self.state().rejected.insert(group_id);
    }

    pub fn fail_device_open(&self, name: &str) {
        self.state().failing_devices.insert(name.to_owned());
    }

    pub fn set_hot_reset_deps(&self, deps: Vec<HotResetDependency>) {
        self.state().hot_reset_deps = deps;
    }

    pub fn hot_resets(&self) -> Vec<Vec<RawFd>> {
        self.state().hot_resets.clone()
    }

    pub fn fail_next_map(&self, errno: i32) {
        self.fail_map_after(0, errno);
    }

    pub fn fail_map_after(&self, successes: u32, errno: i32) {
        self.state().fail_map = Some((successes, errno));
    }

    pub fn map_calls(&self) -> usize {
        self.state().map_calls
    }

    pub fn mapped_vaddr(&self, iova: u64) -> Option<u64> {
        self.state().mappings.lookup(iova)
    }

    pub fn dirty_page(&self, iova: u64) {
        self.state().dirty.insert(iova);
    }

    pub fn take_ops(&self) -> Vec<Op> {
        std::mem::take(&mut self.state().ops)
    }

    pub fn open_fds(&self) -> usize {
        self.state().open.len()
    }
}

impl VfioContainerDriver for MockLegacyDriver {
    fn open_container(&self) -> errno::Result<RawFd> {
        Ok(self.state().alloc_fd())
    }

    fn check_extension(&self, _container: RawFd, ext: Extension) -> bool {
        let state = self.state();
        match ext {
            Extension::Iommu(t) => state.iommu_types.contains(&t),
            Extension::UnmapAll => state.unmap_all,
        }
    }

    fn set_iommu(&self, _container: RawFd, iommu_type: IommuType) -> errno::Result<()> {
        self.state().ops.push(Op::SetIommu(iommu_type));
        Ok(())
    }

    fn iommu_info(&self, _container: RawFd) -> errno::Result<IommuInfo> {
        Ok(self.state().info.clone())
    }

    fn open_group(&self, group_id: u32) -> errno::Result<RawFd> {
        let mut state = self.state();
        let fd = state.alloc_fd();
        state.groups.insert(fd, group_id);
        Ok(fd)
    }

    fn group_viable(&self, group: RawFd) -> errno::Result<bool> {
        let state = self.state();
        let id = state.groups.get(&group).ok_or(errno::Error::new(libc::EBADF))?;
        Ok(!state.not_viable.contains(id))
    }

    fn group_set_container(&self, group: RawFd, _container: RawFd) -> errno::Result<()> {
        let state = self.state();
        let id = state.groups.get(&group).ok_or(errno::Error::new(libc::EBADF))?;
        if state.rejected.contains(id) {
            return Err(errno::Error::new(libc::EBUSY));
        }
        Ok(())
    }

    fn group_unset_container(&self, _group: RawFd, _container: RawFd) -> errno::Result<()> {
        Ok(())
    }

    fn group_get_device_fd(&self, _group: RawFd, name: &str) -> errno::Result<RawFd> {
        let mut state = self.state();
        if state.failing_devices.contains(name) {
            return Err(errno::Error::new(libc::ENODEV));
        }
        Ok(state.alloc_fd())
    }

    fn device_info(&self, _device: RawFd) -> errno::Result<DeviceInfo> {
        Ok(DeviceInfo {
            num_regions: 9,
            num_irqs: 5,
            reset_supported: true,
        })
    }

    fn map_dma(
        &self,
        _container: RawFd,
        iova: u64,
        size: u64,
        vaddr: u64,
        _readonly: bool,
    ) -> errno::Result<()> {
        let mut state = self.state();
        state.map_calls += 1;
        match state.fail_map {
            Some((0, e)) => {
                state.fail_map = None;
                return Err(errno::Error::new(e));
            }
            Some((n, e)) => state.fail_map = Some((n - 1, e)),
            None => (),
        }
        state.mappings.insert(iova, size, vaddr)?;
        state.ops.push(Op::Map { iova, size });
        Ok(())
    }

    fn unmap_dma(&self, _container: RawFd, iova: u64, size: u64, all: bool) -> errno::Result<u64> {
        let mut state = self.state();
        state.ops.push(Op::Unmap { iova, size, all });
        if all {
            state.mappings.map.clear();
            return Ok(0);
        }
        Ok(state.mappings.remove(iova, size))
    }

    fn set_dirty_tracking(&self, _container: RawFd, _start: bool) -> errno::Result<()> {
        Ok(())
    }

    fn get_dirty_bitmap(
        &self,
        _container: RawFd,
        iova: u64,
        size: u64,
        page_size: u64,
        bitmap: &mut [u64],
    ) -> errno::Result<()> {
        let mut state = self.state();
        let end = iova.saturating_add(size);
        let hits: Vec<u64> = state.dirty.range(iova..end).copied().collect();
        for addr in hits {
            let bit = (addr - iova) / page_size;
            bitmap[(bit / 64) as usize] |= 1 << (bit % 64);
            state.dirty.remove(&addr);
        }
        Ok(())
    }

    fn pci_hot_reset_info(&self, _device: RawFd) -> errno::Result<Vec<HotResetDependency>> {
        Ok(self.state().hot_reset_deps.clone())
    }

    fn pci_hot_reset(&self, _device: RawFd, groups: &[RawFd]) -> errno::Result<()> {
        self.state().hot_resets.push(groups.to_vec());
        Ok(())
    }

    fn close(&self, fd: RawFd) {
        let mut state = self.state();
        state.open.remove(&fd);
        state.groups.remove(&fd);
    }
}

#[derive(Default)]
struct IommufdState {
    next_id: u32,
    next_fd: RawFd,
    open: HashMap<RawFd, String>,
    ioas: BTreeSet<u32>,
    // hwpt -> descriptor of the device it was allocated for
    hwpts: HashMap<u32, RawFd>,
    devids: HashMap<u32, RawFd>,
    incompatible: BTreeSet<String>,
    dirty_capable: bool,
    reject_dirty: bool,
    hot_reset_devices: Vec<HotResetDevice>,
    hot_resets: usize,
    mappings: MappingTable,
}

impl IommufdState {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory iommufd context.
pub struct MockIommufd {
    state: Mutex<IommufdState>,
}

impl MockIommufd {
    pub fn new() -> Self {
        MockIommufd {
            state: Mutex::new(IommufdState {
                next_fd: 200,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, IommufdState> {
        lock(&self.state)
    }

    pub fn make_incompatible(&self, name: &str) {
        self.state().incompatible.insert(name.to_owned());
    }

    pub fn set_dirty_capable(&self, capable: bool) {
        self.state().dirty_capable = capable;
    }

    pub fn reject_dirty_alloc(&self) {
        self.state().reject_dirty = true;
    }

    pub fn set_hot_reset_devices(&self, devices: Vec<HotResetDevice>) {
        self.state().hot_reset_devices = devices;
    }

    pub fn hot_resets(&self) -> usize {
        self.state().hot_resets
    }

    pub fn live_hwpts(&self) -> usize {
        self.state().hwpts.len()
    }

    pub fn live_ioas(&self) -> usize {
        self.state().ioas.len()
    }

    pub fn open_fds(&self) -> usize {
        self.state().open.len()
    }

    pub fn mapping_count(&self) -> usize {
        self.state().mappings.map.len()
    }
}

impl IommufdDriver for MockIommufd {
    fn ioas_alloc(&self) -> errno::Result<u32> {
        let mut state = self.state();
        let id = state.alloc_id();
        state.ioas.insert(id);
        Ok(id)
    }

    fn ioas_free(&self, ioas: u32) {
        self.state().ioas.remove(&ioas);
    }

    fn ioas_iova_ranges(&self, _ioas: u32) -> errno::Result<Vec<RangeInclusive<u64>>> {
        Ok(Vec::new())
    }

    fn open_cdev(&self, path: &Path) -> errno::Result<RawFd> {
        let mut state = self.state();
        let fd = state.next_fd;
        state.next_fd += 1;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        state.open.insert(fd, name);
        Ok(fd)
    }

    fn bind_device(&self, device: RawFd) -> errno::Result<u32> {
        let mut state = self.state();
        let id = state.alloc_id();
        state.devids.insert(id, device);
        Ok(id)
    }

    fn hw_caps(&self, _devid: u32) -> errno::Result<HwCaps> {
        Ok(HwCaps {
            dirty_tracking: self.state().dirty_capable,
        })
    }

    fn hwpt_alloc(&self, devid: u32, _ioas: u32, flags: HwptFlags) -> errno::Result<u32> {
        let mut state = self.state();
        if state.reject_dirty && flags.contains(HwptFlags::DIRTY_TRACKING) {
            return Err(errno::Error::new(libc::EOPNOTSUPP));
        }
        let fd = *state
            .devids
            .get(&devid)
            .ok_or(errno::Error::new(libc::ENOENT))?;
        let id = state.alloc_id();
        state.hwpts.insert(id, fd);
        Ok(id)
    }

    fn hwpt_free(&self, hwpt: u32) {
        self.state().hwpts.remove(&hwpt);
    }

    fn attach_hwpt(&self, device: RawFd, hwpt: u32) -> errno::Result<()> {
        let state = self.state();
        let owner = *state.hwpts.get(&hwpt).ok_or(errno::Error::new(libc::ENOENT))?;
        let name = state.open.get(&device).cloned().unwrap_or_default();
        if owner != device && state.incompatible.contains(&name) {
            return Err(errno::Error::new(libc::EINVAL));
        }
        Ok(())
    }

    fn detach_hwpt(&self, _device: RawFd) -> errno::Result<()> {
        Ok(())
    }

    fn device_info(&self, _device: RawFd) -> errno::Result<DeviceInfo> {
        Ok(DeviceInfo::default())
    }

    fn map_dma(
        &self,
        _ioas: u32,
        iova: u64,
        size: u64,
        vaddr: u64,
        _readonly: bool,
    ) -> errno::Result<()> {
        self.state().mappings.insert(iova, size, vaddr)
    }

    fn unmap_dma(&self, _ioas: u32, iova: u64, size: u64) -> errno::Result<u64> {
        let mut state = self.state();
        if iova == 0 && size == u64::MAX {
            state.mappings.map.clear();
            return Ok(0);
        }
        Ok(state.mappings.remove(iova, size))
    }

    fn set_dirty_tracking(&self, _hwpt: u32, _start: bool) -> errno::Result<()> {
        Ok(())
    }

    fn get_dirty_bitmap(
        &self,
        _hwpt: u32,
        _iova: u64,
        _size: u64,
        _page_size: u64,
        _bitmap: &mut [u64],
    ) -> errno::Result<()> {
        Ok(())
    }

    fn pci_hot_reset_info(&self, _device: RawFd) -> errno::Result<Vec<HotResetDevice>> {
        Ok(self.state().hot_reset_devices.clone())
    }

    fn pci_hot_reset(&self, _device: RawFd) -> errno::Result<()> {
        self.state().hot_resets += 1;
        Ok(())
    }

    fn close(&self, fd: RawFd) {
        self.state().open.remove(&fd);
    }
}

/// A vfio-user server that accepts everything.
#[derive(Default)]
pub struct MockUserProxy {
    maps: Mutex<Vec<(u64, u64, bool)>>,
}

impl MockUserProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn maps(&self) -> Vec<(u64, u64, bool)> {
        lock(&self.maps).clone()
    }
}

impl VfioUserProxy for MockUserProxy {
    fn page_sizes(&self) -> u64 {
        0x1000
    }

    fn max_dma_regions(&self) -> u32 {
        0
    }

    fn device_info(&self) -> errno::Result<DeviceInfo> {
        Ok(DeviceInfo::default())
    }

    fn dma_map(&self, iova: u64, size: u64, _vaddr: u64, readonly: bool) -> errno::Result<()> {
        lock(&self.maps).push((iova, size, readonly));
        Ok(())
    }

    fn dma_unmap(&self, iova: u64, _size: u64, all: bool) -> errno::Result<()> {
        let mut maps = lock(&self.maps);
        if all {
            maps.clear();
        } else {
            maps.retain(|m| m.0 != iova);
        }
        Ok(())
    }

    fn reset(&self) -> errno::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct DeviceIoState {
    fail_start: bool,
    logging: bool,
    ranges: Vec<IovaRange>,
}

/// Device DMA logging that records what it is asked to do.
pub struct MockDeviceIo {
    supported: bool,
    state: Mutex<DeviceIoState>,
}

impl MockDeviceIo {
    pub fn new(supported: bool) -> Self {
        MockDeviceIo {
            supported,
            state: Mutex::new(DeviceIoState::default()),
        }
    }

    pub fn fail_start(&self) {
        lock(&self.state).fail_start = true;
    }

    pub fn allow_start(&self) {
        lock(&self.state).fail_start = false;
    }

    pub fn logging(&self) -> bool {
        lock(&self.state).logging
    }

    pub fn ranges(&self) -> Vec<IovaRange> {
        lock(&self.state).ranges.clone()
    }
}

impl DeviceIo for MockDeviceIo {
    fn dma_logging_supported(&self) -> bool {
        self.supported
    }

    fn dma_logging_start(&self, _page_size: u64, ranges: &[IovaRange]) -> errno::Result<()> {
        let mut state = lock(&self.state);
        if state.fail_start {
            return Err(errno::Error::new(libc::EIO));
        }
        state.logging = true;
        state.ranges = ranges.to_vec();
        Ok(())
    }

    fn dma_logging_stop(&self) -> errno::Result<()> {
        lock(&self.state).logging = false;
        Ok(())
    }

    fn dma_logging_report(
        &self,
        _iova: u64,
        _size: u64,
        _page_size: u64,
        _bitmap: &mut [u64],
    ) -> errno::Result<()> {
        Ok(())
    }
}

/// Dirty log recording what the containers report.
#[derive(Default)]
pub struct MockDirtyLog {
    ranges: Mutex<Vec<(RamAddr, u64)>>,
    bitmaps: Mutex<usize>,
}

impl MockDirtyLog {
    pub fn ranges(&self) -> Vec<(RamAddr, u64)> {
        lock(&self.ranges).clone()
    }

    pub fn bitmaps(&self) -> usize {
        *lock(&self.bitmaps)
    }
}

impl DirtyLog for MockDirtyLog {
    fn set_dirty_range(&self, ram_addr: RamAddr, size: u64) {
        lock(&self.ranges).push((ram_addr, size));
    }

    fn set_dirty_bitmap(&self, _ram_addr: RamAddr, bitmap: &DirtyBitmap) -> u64 {
        *lock(&self.bitmaps) += 1;
        bitmap.dirty_pages()
    }
}

/// A guest IOMMU with a static translation table.
#[derive(Default)]
pub struct MockGuestIommu {
    mappings: Mutex<BTreeMap<u64, (u64, Translation)>>,
    notifier: Mutex<Option<NotifierId>>,
}

impl MockGuestIommu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mapping(&self, iova: u64, size: u64, translation: Translation) {
        lock(&self.mappings).insert(iova, (size, translation));
    }

    pub fn notifier(&self) -> Option<NotifierId> {
        *lock(&self.notifier)
    }
}

impl GuestIommu for MockGuestIommu {
    fn translate(&self, entry: &IotlbEntry) -> memory::Result<Translation> {
        let mappings = lock(&self.mappings);
        let found = mappings
            .range(..=entry.iova)
            .next_back()
            .filter(|(start, (size, _))| entry.iova - **start < *size);
        match found {
            Some((start, (_, t))) => {
                let off = entry.iova - start;
                Ok(Translation {
                    host_addr: HostAddr(t.host_addr.0 + off),
                    ram_addr: RamAddr(t.ram_addr.0 + off),
                    ..*t
                })
            }
            None => Err(memory::Error::Translate {
                iova: entry.iova,
                reason: "no mapping".to_owned(),
            }),
        }
    }

    fn replay(&self, start: u64, end: u64) -> Vec<IotlbEntry> {
        lock(&self.mappings)
            .range(start..=end)
            .map(|(iova, (size, t))| IotlbEntry {
                iova: *iova,
                addr_mask: size - 1,
                translated_addr: t.ram_addr.0,
                perm: IommuAccess::READ | IommuAccess::WRITE,
                target_as: None,
            })
            .collect()
    }

    fn register_notifier(&self, id: NotifierId, _start: u64, _end: u64) -> memory::Result<()> {
        *lock(&self.notifier) = Some(id);
        Ok(())
    }

    fn unregister_notifier(&self, id: NotifierId) {
        let mut notifier = lock(&self.notifier);
        if *notifier == Some(id) {
            *notifier = None;
        }
    }
}

/// A discard manager with explicitly populated ranges (offsets inside the region).
#[derive(Debug)]
pub struct MockDiscardManager {
    granularity: u64,
    populated: Mutex<Vec<(u64, u64)>>,
    listener: Mutex<Option<NotifierId>>,
}

impl MockDiscardManager {
    pub fn new(granularity: u64) -> Self {
        MockDiscardManager {
            granularity,
            populated: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
        }
    }

    pub fn populate(&self, offset: u64, size: u64) {
        lock(&self.populated).push((offset, size));
    }

    pub fn listener(&self) -> Option<NotifierId> {
        *lock(&self.listener)
    }
}

impl RamDiscardManager for MockDiscardManager {
    fn min_granularity(&self, _mr: &MemoryRegion) -> u64 {
        self.granularity
    }

    fn register_listener(&self, id: NotifierId, _section: &MemorySection) {
        *lock(&self.listener) = Some(id);
    }

    fn unregister_listener(&self, id: NotifierId) {
        let mut listener = lock(&self.listener);
        if *listener == Some(id) {
            *listener = None;
        }
    }

    fn populated_parts(&self, section: &MemorySection) -> Vec<MemorySection> {
        let sec_start = section.offset_within_region;
        let sec_end = sec_start.saturating_add(section.size64());
        lock(&self.populated)
            .iter()
            .filter_map(|(off, size)| {
                let start = (*off).max(sec_start);
                let end = off.saturating_add(*size).min(sec_end);
                (start < end).then(|| {
                    MemorySection::new(
                        section.mr.clone(),
                        start,
                        section.offset_within_address_space + (start - sec_start),
                        u128::from(end - start),
                    )
                })
            })
            .collect()
    }
}

#[derive(Default)]
struct MigrationShared {
    failing: Vec<DeviceState>,
    resets: usize,
    source: Cursor<Vec<u8>>,
    written: Vec<u8>,
    precopy: PrecopyInfo,
}

/// Test-side view of a [`MockMigrationDriver`] that has been moved into a migration.
#[derive(Clone, Default)]
pub struct MockMigrationHandle(Arc<Mutex<MigrationShared>>);

impl MockMigrationHandle {
    pub fn fail_state(&self, state: DeviceState) {
        lock(&self.0).failing.push(state);
    }

    pub fn resets(&self) -> usize {
        lock(&self.0).resets
    }

    pub fn set_stream(&self, data: Vec<u8>) {
        lock(&self.0).source = Cursor::new(data);
    }

    pub fn set_precopy(&self, initial_bytes: u64, dirty_bytes: u64) {
        lock(&self.0).precopy = PrecopyInfo {
            initial_bytes,
            dirty_bytes,
        };
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.0).written.clone()
    }
}

struct MockStream(MockMigrationHandle);

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        lock(&self.0 .0).source.read(buf)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0 .0).written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Kernel migration interface of a device whose state is a byte buffer.
pub struct MockMigrationDriver {
    flags: MigrationFlags,
    handle: MockMigrationHandle,
}

impl MockMigrationDriver {
    pub fn new(flags: MigrationFlags) -> Self {
        MockMigrationDriver {
            flags,
            handle: MockMigrationHandle::default(),
        }
    }

    pub fn handle(&self) -> MockMigrationHandle {
        self.handle.clone()
    }
}

impl MigrationDriver for MockMigrationDriver {
    fn features(&mut self) -> errno::Result<MigrationFlags> {
        Ok(self.flags)
    }

    fn set_state(&mut self, state: DeviceState) -> errno::Result<Option<Box<dyn DataStream>>> {
        if lock(&self.handle.0).failing.contains(&state) {
            return Err(errno::Error::new(libc::EINVAL));
        }
        if state.opens_data_stream() {
            return Ok(Some(Box::new(MockStream(self.handle.clone()))));
        }
        Ok(None)
    }

    fn precopy_info(&mut self) -> errno::Result<PrecopyInfo> {
        Ok(lock(&self.handle.0).precopy)
    }

    fn reset(&mut self) -> errno::Result<()> {
        lock(&self.handle.0).resets += 1;
        Ok(())
    }
}

/// Device configuration saved as a length-prefixed byte string.
#[derive(Debug, Default)]
pub struct MockConfig {
    saved: Vec<u8>,
    loaded: Vec<u8>,
}

impl MockConfig {
    pub fn new(saved: &[u8]) -> Self {
        MockConfig {
            saved: saved.to_vec(),
            loaded: Vec::new(),
        }
    }

    pub fn loaded(&self) -> Vec<u8> {
        self.loaded.clone()
    }
}

impl DeviceConfig for MockConfig {
    fn save_config(&mut self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(&(self.saved.len() as u32).to_be_bytes())?;
        out.write_all(&self.saved)
    }

    fn load_config(&mut self, input: &mut dyn Read) -> io::Result<()> {
        let mut len = [0u8; 4];
        input.read_exact(&mut len)?;
        let mut data = vec![0u8; u32::from_be_bytes(len) as usize];
        input.read_exact(&mut data)?;
        self.loaded = data;
        Ok(())
    }
}

/// A writer whose output stays observable after it is moved away.
#[derive(Clone, Default)]
pub struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.0).clone()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Mock host drivers and dirty log wired together.
pub struct Fixture {
    pub legacy: Arc<MockLegacyDriver>,
    pub iommufd: Arc<MockIommufd>,
    pub dirty: Arc<MockDirtyLog>,
    pub cpr: Arc<LocalCprStore>,
}

impl Fixture {
    pub fn new() -> Self {
        Fixture {
            legacy: Arc::new(MockLegacyDriver::new()),
            iommufd: Arc::new(MockIommufd::new()),
            dirty: Arc::new(MockDirtyLog::default()),
            cpr: Arc::new(LocalCprStore::new()),
        }
    }

    pub fn host(&self) -> HostDrivers {
        HostDrivers {
            legacy: Some(self.legacy.clone()),
            iommufd: Some(self.iommufd.clone()),
            cpr: self.cpr.clone(),
        }
    }

    /// A container with `device` attached, before its initial replay.
    pub fn container(&self, device: &Device) -> Container {
        let handle = ContainerHandle::new(AddressSpace::new("test", true).id(), 0);
        let mut c = Container::create(handle, device, &self.host(), self.dirty.clone()).unwrap();
        c.attach_device(device).unwrap();
        c
    }
}

pub fn legacy_device(name: &str, group_id: u32) -> Device {
    Device::new(name, DeviceTransport::Group { group_id })
}

pub fn cdev_device(name: &str) -> Device {
    Device::new(
        name,
        DeviceTransport::Cdev {
            path: PathBuf::from(format!("/dev/vfio/devices/{}", name)),
        },
    )
}

pub fn user_device(name: &str, proxy: Arc<MockUserProxy>) -> Device {
    Device::new(name, DeviceTransport::User { proxy })
}

/// Guest RAM at `gpa`, backed by host memory at a fixed offset.
pub fn ram_section(gpa: u64, size: u128) -> MemorySection {
    let mr = Arc::new(MemoryRegion::new(
        "pc.ram",
        RegionKind::Ram {
            host_addr: HostAddr(0x7f00_0000_0000u64.wrapping_add(gpa)),
            ram_addr: RamAddr(0),
        },
    ));
    MemorySection::new(mr, 0, gpa, size)
}

/// A region translated by `iommu`, placed at guest address 0.
pub fn iommu_section(iommu: Arc<MockGuestIommu>, size: u128) -> MemorySection {
    let mr = Arc::new(MemoryRegion::new("iommu", RegionKind::Iommu(iommu)));
    MemorySection::new(mr, 0, 0, size)
}
