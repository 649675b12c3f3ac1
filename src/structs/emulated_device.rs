/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! In-memory stand-in for the accelerator. It keeps a register file per
//! instance bank, hands out DMA addresses and completes frame jobs with
//! results queued by the caller, so the engine can run without a device.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use default_boxed::DefaultBoxed;
use log::debug;

use crate::consts::MAX_INSTANCE_CAPACITY;
use crate::helpers::ceil_align;
use crate::jpu_error::{err_exit_code, ErrorCode, Result};
use crate::jpu_registers::*;
use crate::structs::control_block::{MemoryControlBlock, SharedControlBlock};
use crate::structs::device::{DmaConfig, Hardware, HardwareOpener, WaitOutcome};
use crate::structs::register_words::VersionInfo;

const BANK_WORDS: usize = 0x400 / 4;

const DMA_BASE: u32 = 0x1000_0000;
const DMA_ALIGN: u32 = 0x1000;
const DMA_OUTPUT_SIZE: u32 = 0x10_0000;

#[derive(DefaultBoxed)]
struct RegisterFile {
    banks: [[u32; BANK_WORDS]; MAX_INSTANCE_CAPACITY],
}

impl RegisterFile {
    fn word(bank: usize, offset: u32) -> Option<(usize, usize)> {
        // global registers only exist once
        let bank = if offset >= INST_CTRL_START { 0 } else { bank };
        let index = (offset / 4) as usize;
        if bank < MAX_INSTANCE_CAPACITY && index < BANK_WORDS {
            Some((bank, index))
        } else {
            None
        }
    }

    fn read(&self, bank: usize, offset: u32) -> u32 {
        Self::word(bank, offset)
            .map(|(b, i)| self.banks[b][i])
            .unwrap_or(0)
    }

    fn write(&mut self, bank: usize, offset: u32, value: u32) {
        if let Some((b, i)) = Self::word(bank, offset) {
            self.banks[b][i] = value;
        }
    }
}

/// What a job reports when it finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Completion {
    /// PIC_STATUS bits to raise
    pub status: u32,

    /// decoder: bytes the bit counter advanced by
    pub consumed_bytes: u32,

    /// encoder: bytes written behind the read pointer
    pub encoded_bytes: u32,

    pub slice_position: u32,

    /// raw PIC_ERRMB value reported with an error
    pub error_macroblock: u32,

    pub cycles: u32,
}

impl Completion {
    pub fn done() -> Self {
        Completion {
            status: 1 << INT_DONE,
            cycles: 1000,
            ..Default::default()
        }
    }

    pub fn encoded(bytes: u32) -> Self {
        Completion {
            encoded_bytes: bytes,
            ..Self::done()
        }
    }

    pub fn slice_done(slice_position: u32) -> Self {
        Completion {
            status: 1 << INT_SLICE_DONE,
            slice_position,
            ..Self::done()
        }
    }

    /// the decoder ran dry after `consumed_bytes` and waits for more data
    pub fn bit_empty(consumed_bytes: u32) -> Self {
        Completion {
            status: 1 << INT_BIT_BUF_EMPTY,
            consumed_bytes,
            ..Default::default()
        }
    }

    pub fn error(error_macroblock: u32) -> Self {
        Completion {
            status: 1 << INT_ERROR,
            error_macroblock,
            ..Self::done()
        }
    }
}

/// Result of the next wait, queued ahead of time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedResult {
    Complete(Completion),
    Timeout,
}

struct EmulatorState {
    registers: Box<RegisterFile>,
    running: [bool; MAX_INSTANCE_CAPACITY],
    script: VecDeque<ScriptedResult>,
    control: Option<Arc<MemoryControlBlock>>,
    open_counts: [u32; MAX_INSTANCE_CAPACITY],
    refused: [bool; MAX_INSTANCE_CAPACITY],
    clock_enabled: bool,
    clock_changes: u32,
    resets: u32,
    next_dma: u32,
    last_dma: Option<(DmaConfig, u32, u32)>,
    write_log: Vec<(usize, u32, u32)>,
}

/// Emulated accelerator. Clones share the same device, so one value can be
/// handed to several registries that play separate processes.
#[derive(Clone)]
pub struct EmulatedDevice {
    state: Arc<Mutex<EmulatorState>>,
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedDevice {
    /// A CODAJ10 style device with 12-bit support
    pub fn new() -> Self {
        Self::with_version(VersionInfo {
            product_id: crate::consts::PRODUCT_ID_CODAJ10,
            revision: 0x0001_0000,
            support_12bit: true,
        })
    }

    pub fn with_version(version: VersionInfo) -> Self {
        let mut registers = RegisterFile::default_boxed();
        registers.write(0, VERSION_INFO, version.encode());

        EmulatedDevice {
            state: Arc::new(Mutex::new(EmulatorState {
                registers,
                running: [false; MAX_INSTANCE_CAPACITY],
                script: VecDeque::new(),
                control: None,
                open_counts: [0; MAX_INSTANCE_CAPACITY],
                refused: [false; MAX_INSTANCE_CAPACITY],
                clock_enabled: false,
                clock_changes: 0,
                resets: 0,
                next_dma: DMA_BASE,
                last_dma: None,
                write_log: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, EmulatorState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queues the outcome of a future wait. Waits with nothing queued
    /// complete with `Completion::done()`.
    pub fn push_result(&self, result: ScriptedResult) {
        self.state().script.push_back(result);
    }

    pub fn register(&self, bank: usize, offset: u32) -> u32 {
        self.state().registers.read(bank, offset)
    }

    /// Changes a register behind the engine's back
    pub fn set_register(&self, bank: usize, offset: u32, value: u32) {
        self.state().registers.write(bank, offset, value);
    }

    /// true while a started job on `bank` has not completed
    pub fn is_running(&self, bank: usize) -> bool {
        self.state().running.get(bank).copied().unwrap_or(false)
    }

    pub fn clock_enabled(&self) -> bool {
        self.state().clock_enabled
    }

    pub fn clock_changes(&self) -> u32 {
        self.state().clock_changes
    }

    pub fn reset_count(&self) -> u32 {
        self.state().resets
    }

    pub fn open_count(&self, slot: usize) -> u32 {
        self.state().open_counts.get(slot).copied().unwrap_or(0)
    }

    /// makes the driver fail to open instance `slot` until cleared
    pub fn refuse_instance(&self, slot: usize, refuse: bool) {
        if let Some(r) = self.state().refused.get_mut(slot) {
            *r = refuse;
        }
    }

    /// last mapping made by `configure_dma` with its data and extra size
    pub fn last_dma(&self) -> Option<(DmaConfig, u32, u32)> {
        self.state().last_dma
    }

    /// the control block once some process mapped it
    pub fn control_block(&self) -> Option<Arc<MemoryControlBlock>> {
        self.state().control.clone()
    }

    /// Register writes since the last call, as (bank, offset, value)
    pub fn take_write_log(&self) -> Vec<(usize, u32, u32)> {
        std::mem::take(&mut self.state().write_log)
    }

    fn complete(state: &mut EmulatorState, bank: usize, c: &Completion) {
        let regs = &mut state.registers;
        regs.write(bank, PIC_STATUS, c.status);
        regs.write(bank, CYCLE_INFO, c.cycles);
        regs.write(bank, SLICE_POS, c.slice_position);
        regs.write(bank, PIC_ERRMB, c.error_macroblock);

        if regs.read(bank, PIC_CTRL) & PIC_CTRL_ENCODE != 0 {
            let rd = regs.read(bank, BBC_RD_PTR);
            regs.write(bank, BBC_WR_PTR, rd.wrapping_add(c.encoded_bytes));
        } else {
            let wr = regs.read(bank, BBC_WR_PTR);
            regs.write(bank, BBC_RD_PTR, wr);
            regs.write(bank, GBU_TCNT, c.consumed_bytes.wrapping_mul(8));
        }

        state.running[bank] = c.status & JOB_END_STATUS == 0;
    }
}

impl Hardware for EmulatedDevice {
    fn read_register(&self, bank: usize, offset: u32) -> u32 {
        self.state().registers.read(bank, offset)
    }

    fn write_register(&self, bank: usize, offset: u32, value: u32) {
        let mut state = self.state();
        state.write_log.push((bank, offset, value));

        if offset == PIC_START {
            if value & (1 << START_INIT) != 0 {
                // reset completes at once
                state.resets += 1;
                state.running = [false; MAX_INSTANCE_CAPACITY];
                state.registers.write(bank, PIC_START, value & !(1 << START_INIT));
                return;
            }
            if bank < MAX_INSTANCE_CAPACITY && value & (1 << START_PIC) == 0 {
                // clearing the start bit stops the instance
                state.running[bank] = false;
            }
            if value & (1 << START_PIC) != 0 && bank < MAX_INSTANCE_CAPACITY {
                state.running[bank] = true;
                let status = state.registers.read(0, INST_CTRL_STATUS);
                state
                    .registers
                    .write(0, INST_CTRL_STATUS, status | (1 << bank));
            }
        }

        state.registers.write(bank, offset, value);
    }

    fn wait_for_completion(&self, bank: usize, timeout: Duration) -> Result<WaitOutcome> {
        let mut state = self.state();
        if bank >= MAX_INSTANCE_CAPACITY {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("no register bank {0}", bank),
            );
        }

        if !state.running[bank] {
            debug!("wait on idle bank {0} gave up after {1:?}", bank, timeout);
            return Ok(WaitOutcome::Timeout);
        }

        match state
            .script
            .pop_front()
            .unwrap_or(ScriptedResult::Complete(Completion::done()))
        {
            ScriptedResult::Timeout => Ok(WaitOutcome::Timeout),
            ScriptedResult::Complete(c) => {
                Self::complete(&mut state, bank, &c);
                Ok(WaitOutcome::Interrupt(c.status))
            }
        }
    }

    fn configure_dma(
        &self,
        input_fd: i32,
        output_fd: i32,
        data_size: u32,
        extra_size: u32,
    ) -> Result<DmaConfig> {
        let mut state = self.state();

        // an unknown buffer maps to nothing, like a failed import
        let config = if input_fd < 0 || output_fd < 0 {
            DmaConfig::default()
        } else {
            let input_addr = state.next_dma;
            let input_size = ceil_align(DMA_ALIGN, data_size + extra_size);
            let output_addr = input_addr + input_size;
            state.next_dma = output_addr + DMA_OUTPUT_SIZE;
            DmaConfig {
                input_addr,
                output_addr,
            }
        };

        state.last_dma = Some((config, data_size, extra_size));
        Ok(config)
    }

    fn set_clock_gate(&self, enabled: bool) -> Result<()> {
        let mut state = self.state();
        if state.clock_enabled != enabled {
            state.clock_changes += 1;
        }
        state.clock_enabled = enabled;
        Ok(())
    }

    fn open_instance_count(&self, slot: usize) -> Result<()> {
        let mut state = self.state();
        if state.refused.get(slot).copied().unwrap_or(false) {
            return err_exit_code(
                ErrorCode::Failure,
                format!("driver refused to open instance {0}", slot),
            );
        }
        match state.open_counts.get_mut(slot) {
            Some(c) => {
                *c += 1;
                Ok(())
            }
            None => err_exit_code(
                ErrorCode::InvalidParameter,
                format!("no instance slot {0}", slot),
            ),
        }
    }

    fn close_instance_count(&self, slot: usize) -> Result<()> {
        match self.state().open_counts.get_mut(slot) {
            Some(c) if *c > 0 => {
                *c -= 1;
                Ok(())
            }
            _ => err_exit_code(
                ErrorCode::InvalidParameter,
                format!("instance slot {0} is not open", slot),
            ),
        }
    }

    fn map_control_block(&self, capacity: usize) -> Result<Arc<dyn SharedControlBlock>> {
        let mut state = self.state();
        let block = state
            .control
            .get_or_insert_with(|| Arc::new(MemoryControlBlock::new(capacity)))
            .clone();
        Ok(block)
    }
}

impl HardwareOpener for EmulatedDevice {
    fn open(&self, _device_id: u32) -> Result<Arc<dyn Hardware>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_registers_are_shared_by_banks() {
        let dev = EmulatedDevice::new();
        dev.write_register(3, INST_CTRL_START, 5);
        assert_eq!(dev.read_register(0, INST_CTRL_START), 5);

        dev.write_register(3, RST_INTVAL, 7);
        assert_eq!(dev.read_register(3, RST_INTVAL), 7);
        assert_eq!(dev.read_register(0, RST_INTVAL), 0);
    }

    #[test]
    fn version_register_survives_reset() {
        let dev = EmulatedDevice::new();
        dev.write_register(0, PIC_START, 1 << START_INIT);
        assert_eq!(dev.read_register(0, PIC_START), 0);
        assert_eq!(dev.reset_count(), 1);

        let v = VersionInfo::decode(dev.read_register(0, VERSION_INFO));
        assert!(v.support_12bit);
        assert_eq!(v.product_id, crate::consts::PRODUCT_ID_CODAJ10);
    }

    #[test]
    fn decode_job_consumes_up_to_write_pointer() {
        let dev = EmulatedDevice::new();
        dev.write_register(1, BBC_WR_PTR, 0x2000);
        dev.write_register(1, PIC_START, 1 << START_PIC);
        assert!(dev.is_running(1));
        assert_eq!(dev.read_register(0, INST_CTRL_STATUS), 1 << 1);

        dev.push_result(ScriptedResult::Complete(Completion {
            consumed_bytes: 300,
            ..Completion::done()
        }));
        let outcome = dev.wait_for_completion(1, Duration::from_secs(1)).unwrap();
        assert_eq!(outcome, WaitOutcome::Interrupt(1 << INT_DONE));
        assert_eq!(dev.read_register(1, BBC_RD_PTR), 0x2000);
        assert_eq!(dev.read_register(1, GBU_TCNT), 2400);
        assert!(!dev.is_running(1));
    }

    #[test]
    fn starved_decode_keeps_running_until_stopped() {
        let dev = EmulatedDevice::new();
        dev.write_register(2, BBC_WR_PTR, 0x3000);
        dev.write_register(2, PIC_START, 1 << START_PIC);

        dev.push_result(ScriptedResult::Complete(Completion::bit_empty(0x100)));
        let outcome = dev.wait_for_completion(2, Duration::from_secs(1)).unwrap();
        assert_eq!(outcome, WaitOutcome::Interrupt(1 << INT_BIT_BUF_EMPTY));
        assert!(dev.is_running(2));
        assert_eq!(dev.read_register(2, GBU_TCNT), 0x800);

        // the next wait sees the queued completion
        dev.write_register(2, BBC_WR_PTR, 0x3400);
        dev.wait_for_completion(2, Duration::from_secs(1)).unwrap();
        assert_eq!(dev.read_register(2, BBC_RD_PTR), 0x3400);
        assert!(!dev.is_running(2));

        dev.write_register(2, PIC_START, 1 << START_PIC);
        dev.write_register(2, PIC_START, 0);
        assert!(!dev.is_running(2));
    }

    #[test]
    fn encode_job_advances_write_pointer() {
        let dev = EmulatedDevice::new();
        dev.write_register(0, PIC_CTRL, PIC_CTRL_ENCODE);
        dev.write_register(0, BBC_RD_PTR, 0x5000);
        dev.write_register(0, PIC_START, 1 << START_PIC);
        dev.push_result(ScriptedResult::Complete(Completion::encoded(1234)));

        dev.wait_for_completion(0, Duration::from_secs(1)).unwrap();
        assert_eq!(dev.read_register(0, BBC_WR_PTR), 0x5000 + 1234);
    }

    #[test]
    fn idle_bank_and_scripted_timeout_time_out() {
        let dev = EmulatedDevice::new();
        assert_eq!(
            dev.wait_for_completion(0, Duration::from_millis(1)).unwrap(),
            WaitOutcome::Timeout
        );

        dev.write_register(0, PIC_START, 1 << START_PIC);
        dev.push_result(ScriptedResult::Timeout);
        assert_eq!(
            dev.wait_for_completion(0, Duration::from_millis(1)).unwrap(),
            WaitOutcome::Timeout
        );
        assert!(dev.is_running(0));
    }

    #[test]
    fn dma_addresses_are_distinct_and_nonzero() {
        let dev = EmulatedDevice::new();
        let a = dev.configure_dma(3, 4, 100, 28).unwrap();
        let b = dev.configure_dma(3, 4, 100, 0).unwrap();
        assert_ne!(a.input_addr, 0);
        assert!(a.output_addr > a.input_addr);
        assert!(b.input_addr > a.output_addr);

        let bad = dev.configure_dma(-1, 4, 100, 0).unwrap();
        assert_eq!(bad, DmaConfig::default());
    }

    #[test]
    fn instance_counts_do_not_go_negative() {
        let dev = EmulatedDevice::new();
        dev.open_instance_count(2).unwrap();
        assert_eq!(dev.open_count(2), 1);
        dev.close_instance_count(2).unwrap();
        assert!(dev.close_instance_count(2).is_err());
        assert!(dev.open_instance_count(MAX_INSTANCE_CAPACITY).is_err());
    }
}
