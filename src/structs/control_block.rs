/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! The control block shared by every process that has the device open: a
//! versioned header, one record per session slot and the lock word that
//! serializes access to both.
//!
//! Records are plain old data and only ever copied in and out of the region,
//! so nothing in the region refers to memory of a particular process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use log::{error, warn};

use crate::jpu_error::{err_exit_code, ErrorCode, JpuError, Result};

/// "JPUC"
pub const POOL_MAGIC: u32 = 0x4A50_5543;

pub const POOL_LAYOUT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PoolHeader {
    pub magic: u32,
    pub layout_version: u32,

    /// set by the first process to attach, cleared by the last one to leave
    pub initialized: u32,

    /// number of processes that have the device attached
    pub task_count: u32,

    pub clock_enabled: u32,
    pub capacity: u32,
}

impl PoolHeader {
    pub fn new(capacity: usize) -> Self {
        PoolHeader {
            magic: POOL_MAGIC,
            layout_version: POOL_LAYOUT_VERSION,
            initialized: 1,
            task_count: 0,
            clock_enabled: 0,
            capacity: capacity as u32,
        }
    }

    /// true if another process already set the pool up with a layout we understand
    pub fn is_initialized(&self, capacity: usize) -> bool {
        self.initialized != 0
            && self.magic == POOL_MAGIC
            && self.layout_version == POOL_LAYOUT_VERSION
            && self.capacity as usize == capacity
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SlotRecord {
    pub in_use: u32,

    /// position in the table, written once when the table is initialized
    pub slot_index: u32,

    /// SessionMode of the open session
    pub mode: u32,

    /// register bank the session programs
    pub register_bank: u32,

    /// bumped every time the slot is handed out, stale session ids fail validation
    pub generation: u32,

    pub owner_pid: u32,

    /// marker of the session with a job on the hardware, 0 if none
    pub pending_session: u64,
}

impl SlotRecord {
    pub fn empty(slot_index: usize) -> Self {
        SlotRecord {
            slot_index: slot_index as u32,
            ..Default::default()
        }
    }

    pub fn pending(&self) -> Option<u64> {
        if self.pending_session == 0 {
            None
        } else {
            Some(self.pending_session)
        }
    }
}

pub const HEADER_SIZE: usize = std::mem::size_of::<PoolHeader>();
pub const SLOT_SIZE: usize = std::mem::size_of::<SlotRecord>();

/// Accessor for the shared region. Implementations map it however the
/// platform allows, callers only see copies of the records.
pub trait SharedControlBlock: Send + Sync {
    /// number of slot records in the region
    fn capacity(&self) -> usize;

    /// the cross-process lock word: 0 when free, else `pid << 32 | serial` of the holder
    fn lock_word(&self) -> &AtomicU64;

    fn read_header(&self) -> Result<PoolHeader>;
    fn write_header(&self, header: &PoolHeader) -> Result<()>;

    fn read_slot(&self, index: usize) -> Result<SlotRecord>;
    fn write_slot(&self, index: usize, slot: &SlotRecord) -> Result<()>;

    /// whether the process holding the lock can still release it
    fn is_process_alive(&self, pid: u32) -> bool;
}

/// Control block kept in process memory. Threads of one process can share
/// it, and tests use it to stand in for several processes.
pub struct MemoryControlBlock {
    capacity: usize,
    region: Mutex<Vec<u8>>,
    lock: AtomicU64,
    dead_processes: Mutex<HashSet<u32>>,
}

fn poisoned<T>(_: T) -> JpuError {
    JpuError::new(ErrorCode::Failure, "control block mutex poisoned")
}

impl MemoryControlBlock {
    pub fn new(capacity: usize) -> Self {
        MemoryControlBlock {
            capacity,
            region: Mutex::new(vec![0u8; HEADER_SIZE + capacity * SLOT_SIZE]),
            lock: AtomicU64::new(0),
            dead_processes: Mutex::new(HashSet::new()),
        }
    }

    /// Makes `is_process_alive` report `pid` as gone, the way a crashed
    /// holder of the lock looks to the others.
    pub fn mark_process_dead(&self, pid: u32) {
        if let Ok(mut dead) = self.dead_processes.lock() {
            dead.insert(pid);
        }
    }

    fn slot_range(&self, index: usize) -> Result<std::ops::Range<usize>> {
        if index >= self.capacity {
            return err_exit_code(
                ErrorCode::InvalidHandle,
                format!("slot {0} outside a table of {1}", index, self.capacity),
            );
        }
        let start = HEADER_SIZE + index * SLOT_SIZE;
        Ok(start..start + SLOT_SIZE)
    }
}

impl SharedControlBlock for MemoryControlBlock {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock_word(&self) -> &AtomicU64 {
        &self.lock
    }

    fn read_header(&self) -> Result<PoolHeader> {
        let region = self.region.lock().map_err(poisoned)?;
        Ok(bytemuck::pod_read_unaligned(&region[..HEADER_SIZE]))
    }

    fn write_header(&self, header: &PoolHeader) -> Result<()> {
        let mut region = self.region.lock().map_err(poisoned)?;
        region[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(header));
        Ok(())
    }

    fn read_slot(&self, index: usize) -> Result<SlotRecord> {
        let range = self.slot_range(index)?;
        let region = self.region.lock().map_err(poisoned)?;
        Ok(bytemuck::pod_read_unaligned(&region[range]))
    }

    fn write_slot(&self, index: usize, slot: &SlotRecord) -> Result<()> {
        let range = self.slot_range(index)?;
        let mut region = self.region.lock().map_err(poisoned)?;
        region[range].copy_from_slice(bytemuck::bytes_of(slot));
        Ok(())
    }

    fn is_process_alive(&self, pid: u32) -> bool {
        self.dead_processes
            .lock()
            .map(|dead| !dead.contains(&pid))
            .unwrap_or(true)
    }
}

/// Holding this means holding the cross-process lock. Dropping it releases the lock.
pub struct LockGuard<'a> {
    word: &'a AtomicU64,
    token: u64,
}

impl LockGuard<'_> {
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(current) =
            self.word
                .compare_exchange(self.token, 0, Ordering::Release, Ordering::Relaxed)
        {
            error!(
                "lock word changed while held: expected {0:#x}, found {1:#x}",
                self.token, current
            );
        }
    }
}

const SPINS_BEFORE_YIELD: u32 = 64;

/// Takes the lock of `block`. A lock left behind by a process that died is
/// taken over in one compare-and-swap; giving up after `timeout` is a Failure.
pub fn acquire(
    block: &dyn SharedControlBlock,
    pid: u32,
    serial: u32,
    timeout: Duration,
) -> Result<LockGuard<'_>> {
    let word = block.lock_word();
    let token = (u64::from(pid) << 32) | u64::from(serial % u32::MAX + 1);
    let deadline = Instant::now() + timeout;
    let mut spins = 0u32;

    loop {
        match word.compare_exchange_weak(0, token, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return Ok(LockGuard { word, token }),
            Err(0) => continue,
            Err(current) => {
                let holder = (current >> 32) as u32;
                if !block.is_process_alive(holder)
                    && word
                        .compare_exchange(current, token, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    warn!(
                        "recovered cross-process lock abandoned by process {0}",
                        holder
                    );
                    return Ok(LockGuard { word, token });
                }
            }
        }

        if Instant::now() >= deadline {
            return err_exit_code(
                ErrorCode::Failure,
                format!(
                    "cross-process lock held by process {0} for more than {1:?}",
                    word.load(Ordering::Relaxed) >> 32,
                    timeout
                ),
            );
        }

        if spins < SPINS_BEFORE_YIELD {
            spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}
