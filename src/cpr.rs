// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! File descriptor preservation across a checkpoint/restart (CPR) re-exec.
//!
//! Backends never open a host file descriptor they might already own: they first ask the
//! [`CprStore`] whether a descriptor with the same `(name, id)` key survived a restart, and they
//! hand every freshly opened descriptor to the store so it survives the next one.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Mutex;

/// Storage for named file descriptors that must outlive a process re-exec.
pub trait CprStore: Send + Sync {
    /// Remember `fd` under `(name, id)`.
    fn save_fd(&self, name: &str, id: i32, fd: RawFd);

    /// Look up a descriptor previously saved under `(name, id)`.
    fn find_fd(&self, name: &str, id: i32) -> Option<RawFd>;

    /// Forget the descriptor saved under `(name, id)`.
    fn delete_fd(&self, name: &str, id: i32);
}

/// Reuse a preserved descriptor for `(name, id)` or open a fresh one and preserve it.
///
/// Returns the descriptor and whether it was reused.
pub fn find_or_open<E>(
    store: &dyn CprStore,
    name: &str,
    id: i32,
    open: impl FnOnce() -> Result<RawFd, E>,
) -> Result<(RawFd, bool), E> {
    if let Some(fd) = store.find_fd(name, id) {
        return Ok((fd, true));
    }
    let fd = open()?;
    store.save_fd(name, id, fd);
    Ok((fd, false))
}

/// A process-local [`CprStore`].
///
/// Without a restart in the picture this simply remembers descriptors; it is also the store
/// the hypervisor hands to a re-exec'ed instance after filling it from the preserved state.
#[derive(Debug, Default)]
pub struct LocalCprStore {
    fds: Mutex<HashMap<(String, i32), RawFd>>,
}

impl LocalCprStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of preserved descriptors.
    pub fn len(&self) -> usize {
        self.fds.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no descriptor is preserved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CprStore for LocalCprStore {
    fn save_fd(&self, name: &str, id: i32, fd: RawFd) {
        self.fds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((name.to_owned(), id), fd);
    }

    fn find_fd(&self, name: &str, id: i32) -> Option<RawFd> {
        self.fds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(name.to_owned(), id))
            .copied()
    }

    fn delete_fd(&self, name: &str, id: i32) {
        self.fds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(name.to_owned(), id));
    }
}
