// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Dirty page tracking during live migration.
//!
//! Writes done by passthrough devices are invisible to the hypervisor's own dirty logging, so
//! while a migration runs each container reports them through one of two mechanisms:
//! - device DMA logging, when every device of the container can log its own writes;
//! - IOMMU dirty tracking in the backend otherwise.
//!
//! When neither is available, every synced range is reported dirty in full.

use std::num::NonZeroU64;

use log::{debug, error, warn};

use crate::address::{Iova, RamAddr};
use crate::bitmap::DirtyBitmap;
use crate::container::{Container, Error, Result};
use crate::listener::{section_iova_range, skipped_section};
use crate::memory::{FlatView, IommuAccess, MemorySection};
use crate::migration::OnOffAuto;
use crate::page::host_page_size;

/// Sink for the dirty pages found by a sync, usually the hypervisor's global dirty log.
pub trait DirtyLog: Send + Sync {
    /// Mark `size` bytes starting at `ram_addr` dirty.
    fn set_dirty_range(&self, ram_addr: RamAddr, size: u64);

    /// Mark the pages set in `bitmap` dirty, bit 0 being the page at `ram_addr`. Returns the
    /// number of pages marked.
    fn set_dirty_bitmap(&self, ram_addr: RamAddr, bitmap: &DirtyBitmap) -> u64;
}

/// A contiguous IOVA range handed to device DMA logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IovaRange {
    /// First IOVA of the range.
    pub iova: u64,
    /// Length of the range in bytes.
    pub length: u64,
}

/// Bounds of the guest memory to log, collapsed into at most three ranges.
///
/// Guest RAM tends to sit in two clusters (below and above 4 GiB), and device BARs mapped for
/// peer-to-peer DMA form a third one high above. Logging three bounding ranges instead of every
/// section keeps the number of ranges within what devices accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirtyRanges {
    min32: u64,
    max32: u64,
    min64: u64,
    max64: u64,
    minpci64: u64,
    maxpci64: u64,
}

impl Default for DirtyRanges {
    fn default() -> Self {
        DirtyRanges {
            min32: u64::from(u32::MAX),
            max32: 0,
            min64: u64::MAX,
            max64: 0,
            minpci64: u64::MAX,
            maxpci64: 0,
        }
    }
}

impl DirtyRanges {
    /// Create empty ranges.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow the ranges to cover `[iova, end]`. `pci` marks memory belonging to a passthrough
    /// device of the container, which goes in its own range when above 4 GiB.
    pub fn update(&mut self, iova: u64, end: u64, pci: bool) {
        let limit32 = u64::from(u32::MAX);
        let (min, max) = if pci && iova >= limit32 {
            (&mut self.minpci64, &mut self.maxpci64)
        } else if end <= limit32 {
            (&mut self.min32, &mut self.max32)
        } else {
            (&mut self.min64, &mut self.max64)
        };
        if *min > iova {
            *min = iova;
        }
        if *max < end {
            *max = end;
        }
    }

    /// The non-empty ranges, low to high bucket.
    pub fn ranges(&self) -> Vec<IovaRange> {
        [
            (self.min32, self.max32),
            (self.min64, self.max64),
            (self.minpci64, self.maxpci64),
        ]
        .into_iter()
        .filter(|&(_, max)| max != 0)
        .map(|(min, max)| IovaRange {
            iova: min,
            length: max - min + 1,
        })
        .collect()
    }
}

impl Container {
    /// Whether every device of the container can log its own DMA writes.
    pub fn all_devices_support_dirty_tracking(&self) -> bool {
        !self.devices.is_empty()
            && self.devices.values().all(|d| {
                d.config.device_dirty_page_tracking != OnOffAuto::Off
                    && d.io.dma_logging_supported()
            })
    }

    fn all_devices_dirty_tracking(&self) -> bool {
        !self.devices.is_empty() && self.devices.values().all(|d| d.dirty_tracking)
    }

    /// Whether dirty tracking, by either mechanism, is running.
    pub fn dirty_tracking_started(&self) -> bool {
        self.all_devices_dirty_tracking() || self.dirty_pages_started
    }

    /// Whether a dirty sync should be carried out now.
    ///
    /// Syncing is pointless unless tracking runs, and only meaningful once every device has
    /// migration support. Devices configured not to track during pre-copy suppress syncs while
    /// they still run.
    pub fn log_sync_needed(&self) -> bool {
        if !self.dirty_tracking_started() {
            return false;
        }
        self.devices.values().all(|d| {
            d.status.has_migration()
                && !(d.config.pre_copy_dirty_page_tracking == OnOffAuto::Off
                    && (d.status.state().is_running() || d.status.state().is_precopy()))
        })
    }

    fn section_is_device_memory(&self, section: &MemorySection) -> bool {
        section
            .mr
            .owner()
            .is_some_and(|owner| self.device_names().any(|name| name == owner))
    }

    /// Compute the ranges to log for the current memory map.
    pub fn dirty_ranges(&self, view: &FlatView) -> DirtyRanges {
        let mut ranges = DirtyRanges::new();
        for section in view.sections() {
            if skipped_section(section) {
                continue;
            }
            if let Some((iova, end, _)) = section_iova_range(section) {
                ranges.update(iova, end, self.section_is_device_memory(section));
            }
        }
        ranges
    }

    fn devices_logging_start(&mut self, view: &FlatView) -> Result<()> {
        let ranges = self.dirty_ranges(view).ranges();
        debug!("dirty tracking ranges: {:x?}", ranges);
        let page_size = host_page_size();

        let mut failure = None;
        for dev in self.devices.values_mut() {
            if dev.dirty_tracking {
                continue;
            }
            match dev.io.dma_logging_start(page_size, &ranges) {
                Ok(()) => dev.dirty_tracking = true,
                Err(source) => {
                    failure = Some(Error::DeviceLogging {
                        device: dev.backend.name.clone(),
                        source,
                    });
                    break;
                }
            }
        }
        match failure {
            Some(e) => {
                self.devices_logging_stop();
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn devices_logging_stop(&mut self) {
        for dev in self.devices.values_mut() {
            if !dev.dirty_tracking {
                continue;
            }
            if let Err(e) = dev.io.dma_logging_stop() {
                warn!("{}: Failed to stop DMA logging: {}", dev.backend.name, e);
            }
            dev.dirty_tracking = false;
        }
    }

    fn set_dirty_page_tracking(&mut self, start: bool) -> Result<()> {
        if self.dirty_pages_started == start || !self.backend.info().dirty_pages_supported {
            return Ok(());
        }
        self.backend.set_dirty_tracking(start)?;
        self.dirty_pages_started = start;
        Ok(())
    }

    /// Start dirty tracking for the memory map `view`.
    ///
    /// On failure no device is left logging.
    pub fn start_dirty_tracking(&mut self, view: &FlatView) -> Result<()> {
        let res = if self.all_devices_support_dirty_tracking() {
            self.devices_logging_start(view)
        } else {
            self.set_dirty_page_tracking(true)
        };
        res.map_err(|e| Error::DirtyTrackingStart(Box::new(e)))
    }

    /// Stop dirty tracking. Device logging failures are only warned about.
    pub fn stop_dirty_tracking(&mut self) -> Result<()> {
        if self.all_devices_support_dirty_tracking() {
            self.devices_logging_stop();
            Ok(())
        } else {
            self.set_dirty_page_tracking(false)
        }
    }

    /// Collect the dirty state of `[iova, iova + size)`, backed by RAM at `ram_addr`, into the
    /// dirty log. Returns the number of dirty pages.
    pub fn query_dirty_bitmap(&mut self, iova: Iova, size: u64, ram_addr: RamAddr) -> Result<u64> {
        let all_devices = self.all_devices_support_dirty_tracking();
        if !all_devices && !self.backend.info().dirty_pages_supported {
            self.dirty_log.set_dirty_range(ram_addr, size);
            return Ok(size.div_ceil(host_page_size()));
        }

        let page_size = NonZeroU64::new(host_page_size()).ok_or(Error::InvalidIova {
            iova: iova.0,
            size,
        })?;
        if !all_devices {
            let max = self.backend.info().max_dirty_bitmap_size;
            let requested = DirtyBitmap::bytes_for(size, page_size);
            if requested > max {
                return Err(Error::BitmapTooBig {
                    size,
                    requested,
                    max,
                });
            }
        }
        let mut bitmap = DirtyBitmap::new(size, page_size);

        if all_devices {
            for dev in self.devices.values() {
                dev.io
                    .dma_logging_report(iova.0, size, page_size.get(), bitmap.as_words_mut())
                    .map_err(|source| Error::DeviceLogging {
                        device: dev.backend.name.clone(),
                        source,
                    })?;
            }
        } else {
            self.backend.query_dirty_bitmap(iova, size, &mut bitmap)?;
        }

        Ok(self.dirty_log.set_dirty_bitmap(ram_addr, &bitmap))
    }

    /// Unmap an IOMMU-translated range while dirty tracking runs, without losing the pages the
    /// device dirtied through it.
    pub(crate) fn dma_unmap_dirty(&mut self, iova: Iova, size: u64, ram_addr: RamAddr) -> Result<()> {
        if self.all_devices_support_dirty_tracking() {
            // Device logs survive the IOMMU unmap.
            self.dma_unmap(iova, size, false)?;
            self.query_dirty_bitmap(iova, size, ram_addr)?;
        } else {
            // The IOMMU forgets dirty state on unmap.
            self.query_dirty_bitmap(iova, size, ram_addr)?;
            self.dma_unmap(iova, size, false)?;
        }
        Ok(())
    }

    /// Sync the dirty state of `section` into the dirty log.
    pub fn sync_dirty_bitmap(&mut self, section: &MemorySection) -> Result<()> {
        if let Some(iommu) = section.mr.iommu().cloned() {
            let Some(offset) = self
                .giommus
                .iter()
                .find(|g| g.mr.id() == section.mr.id() && g.start == section.offset_within_region)
                .map(|g| g.iommu_offset)
            else {
                return Ok(());
            };
            let end = section
                .offset_within_region
                .saturating_add(section.size64().saturating_sub(1));
            let mut first_err = None;
            for entry in iommu.replay(section.offset_within_region, end) {
                if entry.perm == IommuAccess::empty() {
                    continue;
                }
                let iova = entry.iova.wrapping_add(offset);
                let res = if let Some(target) = &entry.target_as {
                    Err(Error::from(crate::memory::Error::WrongTargetAddressSpace(
                        target.clone(),
                    )))
                } else {
                    iommu
                        .translate(&entry)
                        .map_err(Error::from)
                        .and_then(|t| self.query_dirty_bitmap(Iova(iova), entry.size(), t.ram_addr))
                };
                if let Err(e) = res {
                    error!("vfio_iommu_map_dirty_notify({:#x}, {:#x}) failed - {}", iova, entry.size(), e);
                    first_err.get_or_insert(e);
                }
            }
            return first_err.map_or(Ok(()), Err);
        }

        if let Some(rdm) = section.mr.discard_manager().cloned() {
            for part in rdm.populated_parts(section) {
                let Some(ram_addr) = part.ram_addr() else {
                    continue;
                };
                self.query_dirty_bitmap(
                    Iova(part.offset_within_address_space),
                    part.size64(),
                    ram_addr,
                )?;
            }
            return Ok(());
        }

        let Some(ram_addr) = section.ram_addr() else {
            return Ok(());
        };
        let iova = crate::page::align_up(section.offset_within_address_space, host_page_size())
            .ok_or_else(|| Error::InvalidIova {
                iova: section.offset_within_address_space,
                size: section.size64(),
            })?;
        self.query_dirty_bitmap(Iova(iova), section.size64(), ram_addr)?;
        Ok(())
    }

    /// Sync `section` if a sync is needed now.
    pub fn log_sync(&mut self, section: &MemorySection) -> Result<()> {
        if skipped_section(section) || !self.log_sync_needed() {
            return Ok(());
        }
        self.sync_dirty_bitmap(section)
    }

    /// Whether the device is currently logging its DMA writes.
    pub fn device_dirty_tracking(&self, id: crate::device::DeviceId) -> bool {
        self.devices.get(&id).is_some_and(|d| d.dirty_tracking)
    }
}
