/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Bookkeeping shared by decoder and encoder sessions: the slot a session
//! owns, the frame job it has in flight and the start / wait / collect
//! handshake with the pending job markers.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::jpu_error::{err_exit_code, AddContext, ErrorCode, JpuError, Result};
use crate::jpu_registers::{INST_CTRL_STATUS, PIC_START, START_PIC};
use crate::structs::control_block::LockGuard;
use crate::structs::device::{DeviceContext, WaitOutcome};
use crate::structs::frame_job::FrameJob;
use crate::structs::instance_pool::{SessionId, SessionMode};

/// A DMA frame buffer. Plane addresses are `base_addr` plus the plane offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameBuffer {
    pub dma_fd: i32,
    pub base_addr: u32,
    pub y_offset: u32,
    pub u_offset: u32,
    pub v_offset: u32,
    pub stride_c: u32,
}

impl FrameBuffer {
    /// Device addresses of the Y, Cb and Cr planes. `chroma_padding` is
    /// added to both chroma planes.
    pub(crate) fn plane_addresses(&self, chroma_padding: u32) -> Result<[u32; 3]> {
        let plane = |offset: u32, padding: u32| {
            self.base_addr
                .checked_add(offset)
                .and_then(|a| a.checked_add(padding))
                .ok_or_else(|| {
                    JpuError::new(
                        ErrorCode::InvalidParameter,
                        format!(
                            "plane at {0:#x}+{1:#x} is outside the address space",
                            self.base_addr, offset
                        ),
                    )
                })
        };
        Ok([
            plane(self.y_offset, 0)?,
            plane(self.u_offset, chroma_padding)?,
            plane(self.v_offset, chroma_padding)?,
        ])
    }
}

pub(crate) struct SessionCore {
    device: Arc<DeviceContext>,
    id: SessionId,
    mode: SessionMode,

    /// slice mode sessions own the register bank of their slot, all others share bank 0
    slice_mode: bool,

    job: Option<FrameJob>,
    closed: bool,
}

impl SessionCore {
    pub fn open(device: &Arc<DeviceContext>, mode: SessionMode, slice_mode: bool) -> Result<Self> {
        let id = device.allocate_slot(mode).context()?;

        let core = SessionCore {
            device: device.clone(),
            id,
            mode,
            slice_mode,
            job: None,
            closed: false,
        };

        device.set_clock_gate_ex(true).context()?;
        Ok(core)
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn register_bank(&self) -> usize {
        if self.slice_mode {
            self.id.slot_index()
        } else {
            0
        }
    }

    pub fn has_job_in_flight(&self) -> bool {
        self.job.as_ref().map(|j| j.is_in_flight()).unwrap_or(false)
    }

    /// true if the pending marker of our slot names this session
    pub fn is_pending(&self, lock: &LockGuard) -> Result<bool> {
        Ok(self.device.get_pending(lock, self.id.slot_index())? == Some(self.id))
    }

    /// Checks under the lock that a new job may be started
    pub fn check_can_start(&self, lock: &LockGuard) -> Result<()> {
        self.device.session_record(lock, self.id)?;

        if self.is_pending(lock)? {
            return err_exit_code(
                ErrorCode::FrameNotComplete,
                format!(
                    "slot {0} has not collected its previous frame",
                    self.id.slot_index()
                ),
            );
        }

        let bank = self.register_bank();
        if let Some(owner) = self.device.bank_owner(lock, bank, self.id)? {
            return err_exit_code(
                ErrorCode::FrameNotComplete,
                format!(
                    "register bank {0} is busy with a job of slot {1}",
                    bank,
                    owner.slot_index()
                ),
            );
        }
        Ok(())
    }

    /// Fails unless the pending marker of the slot is clear, for calls that
    /// move the stream pointers under a running job
    pub fn check_not_pending(&self, lock: &LockGuard) -> Result<()> {
        if self.device.get_pending(lock, self.id.slot_index())?.is_some() {
            return err_exit_code(
                ErrorCode::FrameNotComplete,
                format!("slot {0} has a job outstanding", self.id.slot_index()),
            );
        }
        Ok(())
    }

    /// Records a configured job as pending and writes its start bit. The
    /// registers of the job are already programmed.
    pub fn launch(&mut self, lock: &LockGuard, mut job: FrameJob) -> Result<()> {
        let bank = job.register_bank();

        self.device.set_clock_gate_locked(lock, true)?;
        self.device.mark_pending(lock, self.id, bank)?;
        self.device.write_register(bank, PIC_START, 1 << START_PIC);

        job.start()?;
        self.job = Some(job);
        Ok(())
    }

    /// Blocks without holding the lock until the job raises an interrupt,
    /// returns the status bits.
    ///
    /// A timeout in slice mode abandons the job and clears the pending
    /// marker. Outside slice mode the job stays on the hardware and the wait
    /// may be repeated.
    pub fn wait(&mut self, timeout: Duration) -> Result<u32> {
        let job = match self.job.as_mut() {
            Some(j) if j.is_in_flight() => j,
            _ => {
                return err_exit_code(
                    ErrorCode::WrongCallSequence,
                    "no frame was started on this session",
                )
            }
        };
        job.begin_wait()?;
        let bank = job.register_bank();

        match self
            .device
            .hardware()
            .wait_for_completion(bank, timeout)
            .context()?
        {
            WaitOutcome::Interrupt(status) => Ok(status),
            WaitOutcome::Timeout => {
                error!(
                    "device {0}: frame {1} of slot {2} timed out after {3:?}",
                    self.device.device_id(),
                    job.frame_index(),
                    self.id.slot_index(),
                    timeout
                );
                let dump = self.device.dump_registers(bank);

                if self.slice_mode {
                    job.fail(ErrorCode::HardwareTimeout);
                    let lock = self.device.lock()?;
                    self.device.clear_pending(&lock, self.id.slot_index())?;
                    warn!(
                        "device {0}: abandoned the slice job of slot {1}",
                        self.device.device_id(),
                        self.id.slot_index()
                    );
                }

                err_exit_code(
                    ErrorCode::HardwareTimeout,
                    format!("no interrupt from bank {0}, registers:{1}", bank, dump),
                )
            }
        }
    }

    /// Fails with WrongCallSequence unless this session has a job waiting to be collected
    pub fn check_collectable(&self, lock: &LockGuard) -> Result<()> {
        if !self.is_pending(lock)? {
            return err_exit_code(
                ErrorCode::WrongCallSequence,
                format!("slot {0} has no frame to collect", self.id.slot_index()),
            );
        }
        Ok(())
    }

    /// Stops the bank, releases the pending marker and closes the job. With
    /// `failure` set the job ends failed instead of collected.
    pub fn finish(&mut self, lock: &LockGuard, failure: Option<ErrorCode>) -> Result<()> {
        let bank = self.register_bank();
        self.device.write_register(bank, PIC_START, 0);

        let status = self.device.read_register(0, INST_CTRL_STATUS);
        self.device
            .write_register(0, INST_CTRL_STATUS, status & !(1 << bank));

        self.device.clear_pending(lock, self.id.slot_index())?;

        if let Some(job) = self.job.as_mut() {
            match failure {
                Some(code) => job.fail(code),
                None => job.collect()?,
            }
        }
        Ok(())
    }

    /// Frees the slot. Fails with FrameNotComplete while a job is outstanding.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        self.device.free_slot(self.id).context()?;
        self.closed = true;

        if let Err(e) = self.device.set_clock_gate_ex(false) {
            warn!("device {0}: clock gate: {1}", self.device.device_id(), e);
        }

        info!(
            "device {0}: {1:?} session of slot {2} closed",
            self.device.device_id(),
            self.mode,
            self.id.slot_index()
        );
        Ok(())
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!(
                    "device {0}: slot {1} left allocated: {2}",
                    self.device.device_id(),
                    self.id.slot_index(),
                    e
                );
            }
        }
    }
}

/// Maps a table upload failure to the error the start call reports
pub(crate) fn table_error(e: JpuError) -> JpuError {
    JpuError::new(ErrorCode::InvalidParameter, e.message())
}
