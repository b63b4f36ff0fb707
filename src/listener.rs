// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Keeping a container's DMA mappings in sync with the guest memory map.
//!
//! The hypervisor calls [`Container::region_add`] and [`Container::region_del`] for every
//! section entering or leaving the address space, the guest IOMMU calls
//! [`Container::iommu_notify`] for every translation change, and discard managers call
//! [`Container::ram_discard_populate`] and [`Container::ram_discard_discard`].
//!
//! Failures are classified as they happen. A mapping failure on device memory only degrades
//! peer-to-peer DMA and is logged. Any other failure during the initial replay of the address
//! space is remembered and fails the attach; after that it is fatal, because the device could
//! otherwise DMA into memory the guest believes it owns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};

use crate::address::{HostAddr, Iova, RamAddr};
use crate::container::{Container, Error, Result};
use crate::memory::{FlatView, IommuAccess, IotlbEntry, MemoryRegion, MemorySection, NotifierId, RegionFlags};
use crate::page::{align_down, align_up, host_page_size, is_aligned};

fn next_notifier_id() -> NotifierId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NotifierId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// A translation notifier registered with a guest IOMMU.
#[derive(Clone, Debug)]
pub(crate) struct GuestIommuNotifier {
    pub(crate) id: NotifierId,
    pub(crate) mr: Arc<MemoryRegion>,
    /// Added to an IOVA inside the region to get the IOVA programmed into the host.
    pub(crate) iommu_offset: u64,
    pub(crate) start: u64,
}

/// A listener registered with a RAM discard manager.
#[derive(Clone, Debug)]
pub(crate) struct DiscardListener {
    pub(crate) id: NotifierId,
    pub(crate) mr: Arc<MemoryRegion>,
    pub(crate) offset_within_address_space: u64,
    pub(crate) size: u64,
    pub(crate) granularity: u64,
}

/// Sections the DMA mapping layer never maps: emulated I/O, confidential memory, and the
/// upper half of the 64-bit space (which no host IOMMU can address).
pub(crate) fn skipped_section(section: &MemorySection) -> bool {
    let mr = &section.mr;
    !(mr.is_ram() || mr.iommu().is_some())
        || mr.flags().contains(RegionFlags::PROTECTED)
        || section.offset_within_address_space & (1 << 63) != 0
}

fn valid_section(section: &MemorySection, op: &str) -> bool {
    if skipped_section(section) {
        return false;
    }
    let in_page = host_page_size() - 1;
    if section.offset_within_address_space & in_page != section.offset_within_region & in_page {
        if !section
            .mr
            .flags()
            .contains(RegionFlags::KNOWN_SAFE_MISALIGNMENT)
        {
            error!(
                "{} received unaligned region {} iova={:#x} offset_within_region={:#x} host page size={:#x}",
                op,
                section.mr.name(),
                section.offset_within_address_space,
                section.offset_within_region,
                host_page_size()
            );
        }
        return false;
    }
    true
}

/// The host-page-aligned interior of a section: first IOVA, last IOVA and the exclusive end
/// (which may be `1 << 64`). `None` when the interior is empty.
pub(crate) fn section_iova_range(section: &MemorySection) -> Option<(u64, u64, u128)> {
    let page = u128::from(host_page_size());
    let gpa = u128::from(section.offset_within_address_space);
    let iova = (gpa + page - 1) & !(page - 1);
    let llend = (gpa + section.size) & !(page - 1);
    if iova >= llend {
        return None;
    }
    let iova = u64::try_from(iova).ok()?;
    let end = u64::try_from(llend - 1).ok()?;
    Some((iova, end, llend))
}

impl Container {
    /// Whether the notifier or listener `id` belongs to this container.
    pub fn owns_notifier(&self, id: NotifierId) -> bool {
        self.giommus.iter().any(|g| g.id == id) || self.discard_listeners.iter().any(|l| l.id == id)
    }

    /// Replay the current memory map into the container.
    ///
    /// Returns the first mapping failure, if any.
    pub(crate) fn register_listener(&mut self, view: &FlatView) -> Result<()> {
        for section in view.sections() {
            self.region_add(section)?;
        }
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove every mapping made for the memory map.
    pub(crate) fn unregister_listener(&mut self, view: &FlatView) {
        for section in view.sections() {
            self.region_del(section);
        }
    }

    /// A section entered the address space.
    ///
    /// Returns an error only when the failure is fatal (see [`Error::is_fatal`]).
    pub fn region_add(&mut self, section: &MemorySection) -> Result<()> {
        if !valid_section(section, "region_add") {
            return Ok(());
        }
        let Some((iova, _end, llend)) = section_iova_range(section) else {
            if section.mr.is_ram_device() {
                debug!("region_add: {} has an empty page interior", section.mr.name());
            }
            return Ok(());
        };

        match self.region_add_range(section, iova, llend) {
            Ok(()) => Ok(()),
            Err(e) => self.region_add_failed(section, e),
        }
    }

    fn region_add_range(&mut self, section: &MemorySection, iova: u64, llend: u128) -> Result<()> {
        if section.mr.iommu().is_some() {
            return self.register_guest_iommu(section);
        }
        if section.mr.discard_manager().is_some() {
            return self.register_discard_listener(section);
        }

        let size = u64::try_from(llend - u128::from(iova)).map_err(|_| Error::InvalidIova {
            iova,
            size: u64::MAX,
        })?;
        let vaddr = section.host_addr_of(iova).ok_or(Error::InvalidIova { iova, size })?;

        if section.mr.is_ram_device() {
            let pgsize = self.min_page_size();
            if !is_aligned(iova, pgsize) || !is_aligned(size, pgsize) {
                debug!(
                    "region_add: {} {:#x}+{:#x} is not aligned to IOMMU page size {:#x}, skipping",
                    section.mr.name(),
                    iova,
                    size,
                    pgsize
                );
                return Ok(());
            }
        }

        self.dma_map(Iova(iova), size, vaddr, section.readonly)
    }

    fn region_add_failed(&mut self, section: &MemorySection, err: Error) -> Result<()> {
        if section.mr.is_ram_device() {
            error!("{}", err);
            warn!(
                "{}: PCI peer-to-peer transactions on BARs are not supported.",
                section.mr.owner().unwrap_or_else(|| section.mr.name())
            );
            return Ok(());
        }

        let err = Error::Region {
            region: section.mr.name().to_owned(),
            source: Box::new(err),
        };
        if !self.initialized {
            if self.error.is_none() {
                self.error = Some(err);
            }
            return Ok(());
        }
        error!("vfio: DMA mapping failed, unable to continue: {}", err);
        Err(Error::Fatal(Box::new(err)))
    }

    fn register_guest_iommu(&mut self, section: &MemorySection) -> Result<()> {
        let Some(iommu) = section.mr.iommu().cloned() else {
            return Ok(());
        };
        let start = section.offset_within_region;
        let end = u128::from(start) + section.size - 1;
        let end = u64::try_from(end).unwrap_or(u64::MAX);

        let id = next_notifier_id();
        iommu.register_notifier(id, start, end)?;
        self.giommus.push(GuestIommuNotifier {
            id,
            mr: section.mr.clone(),
            iommu_offset: section
                .offset_within_address_space
                .wrapping_sub(section.offset_within_region),
            start,
        });

        for entry in iommu.replay(start, end) {
            if let Err(e) = self.iommu_notify(id, &entry) {
                error!("{}", e);
            }
        }
        Ok(())
    }

    /// A guest IOMMU translation changed.
    ///
    /// Non-fatal: a failure leaves the device unable to DMA through the entry, which the guest
    /// IOMMU driver will notice.
    pub fn iommu_notify(&mut self, id: NotifierId, entry: &IotlbEntry) -> Result<()> {
        let Some(giommu) = self.giommus.iter().find(|g| g.id == id) else {
            return Ok(());
        };
        let Some(iommu) = giommu.mr.iommu().cloned() else {
            return Ok(());
        };
        let iova = entry.iova.wrapping_add(giommu.iommu_offset);

        if let Some(target) = &entry.target_as {
            return Err(crate::memory::Error::WrongTargetAddressSpace(target.clone()).into());
        }

        if entry.perm != IommuAccess::empty() {
            let xlat = iommu.translate(entry)?;
            let readonly = !entry.perm.contains(IommuAccess::WRITE) || xlat.readonly;
            return self.dma_map(Iova(iova), entry.size(), xlat.host_addr, readonly);
        }

        if self.dirty_tracking_started() {
            let ram_addr = iommu
                .translate(entry)
                .map(|t| t.ram_addr)
                .unwrap_or(RamAddr(entry.translated_addr));
            return self.dma_unmap_dirty(Iova(iova), entry.size(), ram_addr);
        }
        self.dma_unmap(Iova(iova), entry.size(), false)
    }

    fn register_discard_listener(&mut self, section: &MemorySection) -> Result<()> {
        let Some(rdm) = section.mr.discard_manager().cloned() else {
            return Ok(());
        };
        let page = host_page_size();
        let size = section.size64();
        if !is_aligned(section.offset_within_region, page)
            || !is_aligned(section.offset_within_address_space, page)
            || !is_aligned(size, page)
        {
            return Err(Error::Misaligned {
                region: section.mr.name().to_owned(),
                gpa: section.offset_within_address_space,
                size: section.size,
            });
        }

        let granularity = rdm.min_granularity(&section.mr);
        let min = self.min_page_size();
        if !granularity.is_power_of_two() || granularity < min {
            return Err(Error::InvalidGranularity {
                region: section.mr.name().to_owned(),
                granularity,
                min,
            });
        }

        let id = next_notifier_id();
        rdm.register_listener(id, section);
        self.discard_listeners.push(DiscardListener {
            id,
            mr: section.mr.clone(),
            offset_within_address_space: section.offset_within_address_space,
            size,
            granularity,
        });

        let res = self.check_dma_mapping_budget().and_then(|_| {
            rdm.populated_parts(section)
                .iter()
                .try_for_each(|part| self.ram_discard_populate(id, part))
        });
        if let Err(e) = res {
            self.unregister_discard_listener(section);
            return Err(e);
        }
        Ok(())
    }

    // Worst case, every granule of every discard-managed region gets its own mapping, next to
    // one mapping per memory slot for the rest of RAM.
    fn check_dma_mapping_budget(&self) -> Result<()> {
        let max_mappings = self.dma_max_mappings();
        if max_mappings == 0 {
            return Ok(());
        }
        let mut mappings = 0u64;
        for l in &self.discard_listeners {
            let start = align_down(l.offset_within_address_space, l.granularity);
            let end = align_up(l.offset_within_address_space + l.size, l.granularity)
                .unwrap_or(u64::MAX);
            mappings += (end - start) / l.granularity;
        }
        let required = (mappings + u64::from(self.max_memslots))
            .saturating_sub(self.discard_listeners.len() as u64);
        if required > u64::from(max_mappings) {
            return Err(Error::DmaMappingsExhausted {
                required,
                max_memslots: self.max_memslots,
                max_mappings,
            });
        }
        Ok(())
    }

    fn unregister_discard_listener(&mut self, section: &MemorySection) {
        let Some(pos) = self.discard_listeners.iter().position(|l| {
            l.mr.id() == section.mr.id()
                && l.offset_within_address_space == section.offset_within_address_space
                && l.size == section.size64()
        }) else {
            return;
        };
        let listener = self.discard_listeners.remove(pos);
        if let Some(rdm) = section.mr.discard_manager() {
            rdm.unregister_listener(listener.id);
        }
        if let Err(e) = self.dma_unmap(Iova(listener.offset_within_address_space), listener.size, false) {
            error!("{}", e);
        }
    }

    /// A discard manager populated `section`. Mapped granule by granule; on failure the
    /// whole section is unmapped again.
    pub fn ram_discard_populate(&mut self, id: NotifierId, section: &MemorySection) -> Result<()> {
        let Some(granularity) = self
            .discard_listeners
            .iter()
            .find(|l| l.id == id)
            .map(|l| l.granularity)
        else {
            return Ok(());
        };
        let Some((HostAddr(base), _)) = section.mr.ram_base() else {
            return Ok(());
        };

        let end = section.offset_within_region + section.size64();
        let mut start = section.offset_within_region;
        while start < end {
            let next = align_up(start + 1, granularity).unwrap_or(end).min(end);
            let iova = start - section.offset_within_region + section.offset_within_address_space;
            let vaddr = HostAddr(base + start);
            if let Err(e) = self.dma_map(Iova(iova), next - start, vaddr, section.readonly) {
                self.ram_discard_discard(id, section);
                return Err(e);
            }
            start = next;
        }
        Ok(())
    }

    /// A discard manager discarded `section`.
    pub fn ram_discard_discard(&mut self, id: NotifierId, section: &MemorySection) {
        if !self.discard_listeners.iter().any(|l| l.id == id) {
            return;
        }
        let res = self.dma_unmap(
            Iova(section.offset_within_address_space),
            section.size64(),
            false,
        );
        if let Err(e) = res {
            error!("{}", e);
        }
    }

    /// A section left the address space. Unmap failures are logged.
    pub fn region_del(&mut self, section: &MemorySection) {
        if !valid_section(section, "region_del") {
            return;
        }

        if let Some(iommu) = section.mr.iommu() {
            if let Some(pos) = self.giommus.iter().position(|g| {
                g.mr.id() == section.mr.id() && g.start == section.offset_within_region
            }) {
                let giommu = self.giommus.remove(pos);
                iommu.unregister_notifier(giommu.id);
            }
        }

        let Some((iova, _end, llend)) = section_iova_range(section) else {
            return;
        };
        let llsize = llend - u128::from(iova);

        let mut try_unmap = true;
        if section.mr.is_ram_device() {
            let pgsize = u128::from(self.min_page_size());
            try_unmap = u128::from(iova) % pgsize == 0 && llsize % pgsize == 0;
        } else if section.mr.discard_manager().is_some() {
            // Unregistering unmaps.
            self.unregister_discard_listener(section);
            try_unmap = false;
        }
        if !try_unmap {
            return;
        }

        let res = if llsize == 1u128 << 64 {
            self.dma_unmap(Iova(0), 0, true)
        } else {
            self.dma_unmap(Iova(iova), llsize as u64, false)
        };
        if let Err(e) = res {
            error!("{}", e);
        }
    }
}
