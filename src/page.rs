// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Host page geometry helpers.

use std::sync::OnceLock;

static HOST_PAGE_SIZE: OnceLock<u64> = OnceLock::new();

/// Return the real page size of the host.
pub fn host_page_size() -> u64 {
    *HOST_PAGE_SIZE.get_or_init(|| {
        // SAFETY: There's no unsafe potential in calling this function.
        let size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
        // sysconf only fails for unknown names; fall back to the smallest page we support.
        u64::try_from(size).ok().filter(|s| s.is_power_of_two()).unwrap_or(0x1000)
    })
}

/// Round `value` up to the next multiple of the power of two `align`.
///
/// Returns `None` on overflow.
pub fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Round `value` down to a multiple of the power of two `align`.
pub fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check whether `value` is a multiple of the power of two `align`.
pub fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

/// Smallest page size contained in an IOMMU page size bitmask, or `None` for an empty mask.
pub fn min_page_size(pgsizes: u64) -> Option<u64> {
    if pgsizes == 0 {
        None
    } else {
        Some(1u64 << pgsizes.trailing_zeros())
    }
}
