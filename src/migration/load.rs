// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The destination side of multifd device state transfer.
//!
//! Packets arrive on several channels in any order. Receive threads [`insert`] them into a
//! reorder buffer; one consumer thread writes them to the device strictly by index and, once it
//! reaches the config packet, loads the device configuration under the big lock.
//!
//! Lock order: the pipeline lock is taken before the big lock, never after. Entry points that
//! may be reached with the big lock held take the caller's guard and release it around the
//! pipeline operation; reaching the pipeline lock with the big lock held any other way fails
//! with [`Error::LockOrder`].
//!
//! [`insert`]: LoadPipeline::insert

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use log::{debug, error};

use super::{decode_config, DeviceConfig, DeviceStatePacket, Error, Result};
use crate::bql::{self, Bql, BqlGuard};

#[derive(Debug, Default)]
struct Queue {
    // Presence of an index is presence of its buffer.
    buffers: BTreeMap<u32, Vec<u8>>,
    load_buf_idx: u32,
    last_idx: Option<u32>,
    queued_bytes: u64,
    iteration_done: bool,
    consumer_exited: bool,
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<Queue>,
    buffer_ready: Condvar,
    iteration_done: Condvar,
    cancel: AtomicBool,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Queue>> {
        if bql::held_by_current_thread() {
            return Err(Error::LockOrder);
        }
        Ok(self.lock_unchecked())
    }

    fn lock_unchecked(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    // Set the token and wake every wait the consumer can park on.
    fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        let _queue = self.lock_unchecked();
        self.buffer_ready.notify_all();
        self.iteration_done.notify_all();
    }
}

fn without_bql<M, R>(guard: Option<&mut BqlGuard<'_, M>>, f: impl FnOnce() -> R) -> Result<R> {
    match guard {
        Some(guard) => Ok(guard.unlocked(f)),
        None if bql::held_by_current_thread() => Err(Error::LockOrder),
        None => Ok(f()),
    }
}

fn write_buffer<W: Write>(writer: &mut W, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "device state stream accepted no data",
                ))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn consume<W: Write, M: DeviceConfig>(
    shared: &Shared,
    mut writer: W,
    bql: &Bql<M>,
    defer_config: bool,
) -> Result<W> {
    let mut queue = shared.lock()?;
    let config = loop {
        let data = loop {
            if shared.cancelled() {
                return Err(Error::Cancelled);
            }
            let idx = queue.load_buf_idx;
            if let Some(data) = queue.buffers.remove(&idx) {
                break data;
            }
            queue = shared
                .buffer_ready
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
        };

        let len = data.len() as u64;
        if queue.last_idx == Some(queue.load_buf_idx) {
            queue.queued_bytes -= len;
            break data;
        }

        drop(queue);
        write_buffer(&mut writer, &data)?;
        queue = shared.lock()?;
        queue.queued_bytes -= len;
        queue.load_buf_idx += 1;
    };

    if defer_config {
        loop {
            if shared.cancelled() {
                return Err(Error::Cancelled);
            }
            if queue.iteration_done {
                break;
            }
            queue = shared
                .iteration_done
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
    drop(queue);

    let mut device = bql
        .lock_or_cancel(|| shared.cancelled())
        .ok_or(Error::Cancelled)?;
    if shared.cancelled() {
        return Err(Error::Cancelled);
    }
    decode_config(&mut *device, &config)?;
    Ok(writer)
}

/// Reorder buffer and consumer thread of one device.
pub struct LoadPipeline<W, M> {
    name: String,
    shared: Arc<Shared>,
    max_queued: u64,
    thread: Option<JoinHandle<Result<W>>>,
    _config: PhantomData<fn() -> M>,
}

impl<W, M> LoadPipeline<W, M>
where
    W: Write + Send + 'static,
    M: DeviceConfig + Send + 'static,
{
    /// Start the consumer thread writing to `writer`, with the device configuration behind
    /// `bql`.
    ///
    /// At most `max_queued` bytes may be waiting to be written at any time. With
    /// `defer_config`, the configuration is loaded only after
    /// [`iteration_done`](Self::iteration_done).
    pub fn start(
        name: &str,
        writer: W,
        bql: Arc<Bql<M>>,
        max_queued: u64,
        defer_config: bool,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let thread_shared = shared.clone();
        let thread_name = name.to_owned();
        let thread = thread::Builder::new()
            .name(format!("vfio-load-{}", name))
            .spawn(move || {
                let res = consume(&thread_shared, writer, &bql, defer_config);
                thread_shared.lock_unchecked().consumer_exited = true;
                match &res {
                    Ok(_) => debug!("{}: device state loaded", thread_name),
                    Err(Error::Cancelled) => debug!("{}: device state load cancelled", thread_name),
                    Err(e) => error!("{}: device state load failed: {}", thread_name, e),
                }
                res
            })?;
        Ok(LoadPipeline {
            name: name.to_owned(),
            shared,
            max_queued,
            thread: Some(thread),
            _config: PhantomData,
        })
    }

    /// Queue a received packet.
    pub fn insert(&self, packet: DeviceStatePacket) -> Result<()> {
        let mut queue = self.shared.lock()?;
        if queue.consumer_exited || self.shared.cancelled() {
            return Err(Error::PipelineStopped);
        }

        let idx = packet.idx;
        if idx < queue.load_buf_idx || queue.buffers.contains_key(&idx) {
            return Err(Error::DuplicateBuffer(idx));
        }
        let requested = packet.data.len() as u64;
        if queue
            .queued_bytes
            .checked_add(requested)
            .map_or(true, |total| total > self.max_queued)
        {
            return Err(Error::QueueFull {
                queued: queue.queued_bytes,
                requested,
                max: self.max_queued,
            });
        }
        if packet.is_config() {
            if let Some(first) = queue.last_idx {
                return Err(Error::DuplicateConfig { first, second: idx });
            }
            queue.last_idx = Some(idx);
        }

        queue.queued_bytes += requested;
        queue.buffers.insert(idx, packet.data);
        if idx == queue.load_buf_idx {
            self.shared.buffer_ready.notify_all();
        }
        Ok(())
    }

    /// Parse and queue a packet received from a channel.
    pub fn insert_raw(&self, buf: &[u8]) -> Result<()> {
        self.insert(DeviceStatePacket::decode(buf)?)
    }

    /// Bytes received but not yet written to the device.
    pub fn queued_bytes(&self) -> Result<u64> {
        Ok(self.shared.lock()?.queued_bytes)
    }

    /// Signal that the main channel finished the iteration, releasing a deferred config load.
    pub fn iteration_done(&self, guard: Option<&mut BqlGuard<'_, M>>) -> Result<()> {
        without_bql(guard, || {
            let mut queue = self.shared.lock()?;
            queue.iteration_done = true;
            self.shared.iteration_done.notify_all();
            Ok(())
        })?
    }

    fn join(&mut self) -> Result<Result<W>> {
        let handle = self.thread.take().ok_or(Error::PipelineStopped)?;
        handle.join().map_err(|_| Error::ConsumerPanicked)
    }

    /// Wait until every buffer is written and the configuration loaded, then return the
    /// writer.
    pub fn finish(mut self, guard: Option<&mut BqlGuard<'_, M>>) -> Result<W> {
        without_bql(guard, || self.join())??
    }

    /// Cancel the transfer and wait for the consumer thread to exit.
    pub fn abort(mut self, guard: Option<&mut BqlGuard<'_, M>>) -> Result<()> {
        // Seen by a consumer that wins the big lock as soon as it is released.
        self.shared.cancel.store(true, Ordering::Release);
        without_bql(guard, || {
            self.shared.cancel();
            self.join().map(|_| ())
        })?
    }
}

// The consumer never blocks on the big lock once cancelled, so joining is safe with the big
// lock held.
impl<W, M> Drop for LoadPipeline<W, M> {
    fn drop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        self.shared.cancel();
        if handle.join().is_err() {
            error!("{}: device state load thread panicked", self.name);
        }
    }
}
