/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Attachment of a process to an accelerator.
//!
//! The transport to the device is behind the `Hardware` trait. A process
//! attaches through a `DeviceRegistry`, which maps the shared control block
//! once per device and keeps a count of the attachments the process holds.
//! The first process in the system to attach formats the session table and
//! resets the hardware, the last one to leave turns the clock off.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::consts::API_VERSION;
use crate::enabled_features::EnabledFeatures;
use crate::jpu_error::{err_exit_code, AddContext, ErrorCode, JpuError, Result};
use crate::jpu_registers::{
    DUMP_REGISTERS, INST_CTRL_START, PIC_START, START_INIT, VERSION_INFO,
};
use crate::structs::control_block::{
    acquire, LockGuard, PoolHeader, SharedControlBlock, SlotRecord,
};
use crate::structs::register_words::{describe_register, RegisterWrite, VersionInfo};

/// What a wait for an instance interrupt came back with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// PIC_STATUS bits that were raised
    Interrupt(u32),
    Timeout,
}

/// Device addresses of a DMA mapped buffer pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaConfig {
    pub input_addr: u32,
    pub output_addr: u32,
}

/// Transport to one accelerator. Register accesses address an instance
/// register bank; global registers live in bank 0.
pub trait Hardware: Send + Sync {
    fn read_register(&self, bank: usize, offset: u32) -> u32;
    fn write_register(&self, bank: usize, offset: u32, value: u32);

    /// Blocks until the instance of `bank` raises an interrupt or `timeout` passes
    fn wait_for_completion(&self, bank: usize, timeout: Duration) -> Result<WaitOutcome>;

    /// Maps an input and an output buffer for the next job. `extra_size` is
    /// padding mapped behind the input.
    fn configure_dma(
        &self,
        input_fd: i32,
        output_fd: i32,
        data_size: u32,
        extra_size: u32,
    ) -> Result<DmaConfig>;

    fn set_clock_gate(&self, enabled: bool) -> Result<()>;

    /// Tells the driver a session slot was opened or closed
    fn open_instance_count(&self, slot: usize) -> Result<()>;
    fn close_instance_count(&self, slot: usize) -> Result<()>;

    /// Maps the control block shared by every process using the device
    fn map_control_block(&self, capacity: usize) -> Result<Arc<dyn SharedControlBlock>>;
}

/// Opens the transport of a device id
pub trait HardwareOpener: Send + Sync {
    fn open(&self, device_id: u32) -> Result<Arc<dyn Hardware>>;
}

/// What the version register told us about the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub api_version: u32,
    pub product_id: u32,
    pub revision: u32,
    pub support_12bit: bool,
}

/// A device as seen by one process
pub struct DeviceContext {
    device_id: u32,
    process_id: u32,
    hardware: Arc<dyn Hardware>,
    control: Arc<dyn SharedControlBlock>,
    enabled_features: EnabledFeatures,

    /// attachments this process holds
    task_count: Mutex<u32>,

    lock_serial: AtomicU32,
    capabilities: OnceLock<Capabilities>,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device_id", &self.device_id)
            .field("process_id", &self.process_id)
            .field("capabilities", &self.capabilities.get())
            .finish()
    }
}

impl DeviceContext {
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn enabled_features(&self) -> &EnabledFeatures {
        &self.enabled_features
    }

    pub fn hardware(&self) -> &dyn Hardware {
        self.hardware.as_ref()
    }

    pub fn control_block(&self) -> &dyn SharedControlBlock {
        self.control.as_ref()
    }

    /// number of attachments this process holds on the device
    pub fn task_count(&self) -> u32 {
        self.task_count.lock().map(|c| *c).unwrap_or(0)
    }

    /// Chip capabilities, read once when the process first attached
    pub fn capabilities(&self) -> Result<Capabilities> {
        self.capabilities.get().copied().ok_or_else(|| {
            JpuError::new(ErrorCode::Failure, "device capabilities were never read")
        })
    }

    /// Takes the cross-process lock of the session table
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        let serial = self.lock_serial.fetch_add(1, Ordering::Relaxed);
        acquire(
            self.control.as_ref(),
            self.process_id,
            serial,
            self.enabled_features.lock_timeout,
        )
        .context()
    }

    pub fn read_register(&self, bank: usize, offset: u32) -> u32 {
        self.hardware.read_register(bank, offset)
    }

    pub fn write_register(&self, bank: usize, offset: u32, value: u32) {
        self.hardware.write_register(bank, offset, value)
    }

    /// Performs a sequence of register writes on `bank`
    pub fn run_program(&self, bank: usize, program: &[RegisterWrite]) {
        for w in program {
            self.hardware.write_register(bank, w.offset, w.value);
        }
    }

    /// Logs every register of `bank` and returns the same text
    pub fn dump_registers(&self, bank: usize) -> String {
        let mut dump = String::new();
        for (name, offset) in DUMP_REGISTERS {
            let value = self.hardware.read_register(bank, offset);
            let fields = describe_register(offset, value);
            error!(
                "device {0}: register {1}, {2:04x}@{3:08x} {4}",
                self.device_id,
                name,
                offset,
                value,
                fields.as_deref().unwrap_or("")
            );
            let _ = write!(dump, "\n{0}={1:#010x}", name, value);
            if let Some(fields) = fields {
                let _ = write!(dump, " {0}", fields);
            }
        }
        dump
    }

    /// Clock gating only while nothing is running. Turning the clock off
    /// while any slot has a pending job is silently skipped.
    pub(crate) fn set_clock_gate_locked(&self, lock: &LockGuard, on: bool) -> Result<()> {
        if !on && self.any_pending(lock)? {
            return Ok(());
        }

        self.hardware.set_clock_gate(on).context()?;

        let mut header = self.control.read_header()?;
        header.clock_enabled = u32::from(on);
        self.control.write_header(&header)
    }

    /// Puts the codec back into its initial state and waits for it to get there
    fn software_reset(&self) -> Result<()> {
        self.hardware.write_register(0, PIC_START, 1 << START_INIT);

        let deadline = Instant::now() + self.enabled_features.lock_timeout;
        while self.hardware.read_register(0, PIC_START) & (1 << START_INIT) != 0 {
            if Instant::now() >= deadline {
                return err_exit_code(
                    ErrorCode::HardwareTimeout,
                    format!("device {0} did not finish its reset", self.device_id),
                );
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    fn read_capabilities(&self) -> Capabilities {
        let version = VersionInfo::decode(self.hardware.read_register(0, VERSION_INFO));
        Capabilities {
            api_version: API_VERSION,
            product_id: version.product_id,
            revision: version.revision,
            support_12bit: self
                .enabled_features
                .support_12bit_override
                .unwrap_or(version.support_12bit),
        }
    }
}

/// The devices a process has attached, by device id
pub struct DeviceRegistry {
    opener: Arc<dyn HardwareOpener>,
    enabled_features: EnabledFeatures,
    process_id: u32,
    devices: Mutex<HashMap<u32, Arc<DeviceContext>>>,
}

impl DeviceRegistry {
    pub fn new(opener: Arc<dyn HardwareOpener>, enabled_features: EnabledFeatures) -> Self {
        Self::with_process_id(opener, enabled_features, std::process::id())
    }

    /// Registry that identifies itself with `process_id` on the shared lock.
    /// Several registries with distinct ids behave like separate processes.
    pub fn with_process_id(
        opener: Arc<dyn HardwareOpener>,
        enabled_features: EnabledFeatures,
        process_id: u32,
    ) -> Self {
        DeviceRegistry {
            opener,
            enabled_features,
            process_id,
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn devices(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u32, Arc<DeviceContext>>>> {
        self.devices
            .lock()
            .map_err(|_| JpuError::new(ErrorCode::Failure, "device registry mutex poisoned"))
    }

    /// Attaches to `device_id`. Attaching again returns the same context and
    /// only bumps the attachment count.
    pub fn attach(&self, device_id: u32) -> Result<Arc<DeviceContext>> {
        let mut devices = self.devices()?;

        if let Some(device) = devices.get(&device_id) {
            let _lock = device.lock()?;
            let mut count = device.task_count.lock().map_err(|_| {
                JpuError::new(ErrorCode::Failure, "device task count mutex poisoned")
            })?;
            *count += 1;
            debug!(
                "device {0} attached again, {1} attachments",
                device_id, *count
            );
            return Ok(device.clone());
        }

        let capacity = self.enabled_features.instance_capacity;
        if capacity == 0 || capacity > crate::consts::MAX_INSTANCE_CAPACITY {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("session table capacity {0} out of range", capacity),
            );
        }

        let hardware = self.opener.open(device_id).context()?;
        let control = hardware.map_control_block(capacity).context()?;
        if control.capacity() != capacity {
            return err_exit_code(
                ErrorCode::Failure,
                format!(
                    "control block holds {0} slots, expected {1}",
                    control.capacity(),
                    capacity
                ),
            );
        }

        let device = Arc::new(DeviceContext {
            device_id,
            process_id: self.process_id,
            hardware,
            control,
            enabled_features: self.enabled_features.clone(),
            task_count: Mutex::new(1),
            lock_serial: AtomicU32::new(0),
            capabilities: OnceLock::new(),
        });

        {
            let lock = device.lock()?;

            let mut header = device.control.read_header()?;
            let first_in_system = !header.is_initialized(capacity);
            if first_in_system {
                header = PoolHeader::new(capacity);
                for i in 0..capacity {
                    device.control.write_slot(i, &SlotRecord::empty(i))?;
                }
            }
            header.task_count += 1;
            device.control.write_header(&header)?;

            device.set_clock_gate_locked(&lock, true)?;

            if first_in_system {
                device.software_reset()?;
            }

            let capabilities = device.read_capabilities();
            let _ = device.capabilities.set(capabilities);

            info!(
                "attached device {0} (product {1}, revision {2:#x}, 12-bit {3}), {4} processes attached",
                device_id,
                capabilities.product_id,
                capabilities.revision,
                capabilities.support_12bit,
                header.task_count
            );
        }

        devices.insert(device_id, device.clone());
        Ok(device)
    }

    /// Drops one attachment. When the process drops its last one the
    /// process leaves the device, and the last process to leave stops the
    /// codec and turns the clock off.
    pub fn detach(&self, device: &Arc<DeviceContext>) -> Result<()> {
        let mut devices = self.devices()?;

        match devices.get(&device.device_id) {
            Some(d) if Arc::ptr_eq(d, device) => {}
            _ => {
                return err_exit_code(
                    ErrorCode::InvalidHandle,
                    format!("device {0} is not attached", device.device_id),
                )
            }
        }

        let lock = device.lock()?;

        let remaining = {
            let mut count = device.task_count.lock().map_err(|_| {
                JpuError::new(ErrorCode::Failure, "device task count mutex poisoned")
            })?;
            *count = count.saturating_sub(1);
            *count
        };

        if remaining > 0 {
            debug!(
                "device {0} detached, {1} attachments left",
                device.device_id, remaining
            );
            return Ok(());
        }

        let mut header = device.control.read_header()?;
        header.task_count = header.task_count.saturating_sub(1);
        let last_in_system = header.task_count == 0;
        if last_in_system {
            device.hardware.write_register(0, INST_CTRL_START, 0);
            header.initialized = 0;
        }
        device.control.write_header(&header)?;

        if last_in_system {
            device.set_clock_gate_locked(&lock, false)?;
        }
        drop(lock);

        devices.remove(&device.device_id);
        info!(
            "detached device {0}, {1} processes still attached",
            device.device_id, header.task_count
        );
        Ok(())
    }

    /// The context of an attached device without taking another attachment
    pub fn get(&self, device_id: u32) -> Option<Arc<DeviceContext>> {
        self.devices
            .lock()
            .ok()
            .and_then(|d| d.get(&device_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::emulated_device::EmulatedDevice;
    use crate::structs::register_words::VersionInfo;

    fn registry(emulated: &EmulatedDevice, pid: u32) -> DeviceRegistry {
        DeviceRegistry::with_process_id(
            Arc::new(emulated.clone()),
            EnabledFeatures::default(),
            pid,
        )
    }

    #[test]
    fn attach_is_idempotent_per_process() {
        let emulated = EmulatedDevice::new();
        let reg = registry(&emulated, 1);

        let a = reg.attach(0).unwrap();
        let b = reg.attach(0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.task_count(), 2);
        assert_eq!(a.control_block().read_header().unwrap().task_count, 1);
        assert_eq!(emulated.reset_count(), 1);

        reg.detach(&a).unwrap();
        assert!(reg.get(0).is_some());
        assert!(emulated.clock_enabled());

        reg.detach(&b).unwrap();
        assert!(reg.get(0).is_none());
        assert!(!emulated.clock_enabled());
        assert_eq!(
            reg.detach(&b).unwrap_err().error_code(),
            ErrorCode::InvalidHandle
        );
    }

    #[test]
    fn second_process_joins_without_reset() {
        let emulated = EmulatedDevice::new();
        let first = registry(&emulated, 1);
        let second = registry(&emulated, 2);

        let a = first.attach(0).unwrap();
        emulated.write_register(0, INST_CTRL_START, 1);
        let b = second.attach(0).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(emulated.reset_count(), 1);
        assert_eq!(b.control_block().read_header().unwrap().task_count, 2);

        // the first process leaving keeps the device running for the second
        first.detach(&a).unwrap();
        assert!(emulated.clock_enabled());
        assert_eq!(emulated.register(0, INST_CTRL_START), 1);

        second.detach(&b).unwrap();
        assert!(!emulated.clock_enabled());
        assert_eq!(emulated.register(0, INST_CTRL_START), 0);
        assert!(!b.control_block().read_header().unwrap().is_initialized(4));

        // the next attach formats the table again
        first.attach(0).unwrap();
        assert_eq!(emulated.reset_count(), 2);
    }

    #[test]
    fn capabilities_follow_version_register_and_override() {
        let emulated = EmulatedDevice::with_version(VersionInfo {
            product_id: 3,
            revision: 0x42,
            support_12bit: false,
        });
        let caps = registry(&emulated, 1).attach(0).unwrap().capabilities().unwrap();
        assert_eq!(
            caps,
            Capabilities {
                api_version: API_VERSION,
                product_id: 3,
                revision: 0x42,
                support_12bit: false
            }
        );

        let forced = DeviceRegistry::with_process_id(
            Arc::new(emulated.clone()),
            EnabledFeatures {
                support_12bit_override: Some(true),
                ..Default::default()
            },
            2,
        );
        assert!(forced.attach(0).unwrap().capabilities().unwrap().support_12bit);
    }

    #[test]
    fn invalid_capacity_is_rejected() {
        let emulated = EmulatedDevice::new();
        let reg = DeviceRegistry::with_process_id(
            Arc::new(emulated),
            EnabledFeatures {
                instance_capacity: 0,
                ..Default::default()
            },
            1,
        );
        assert_eq!(
            reg.attach(0).unwrap_err().error_code(),
            ErrorCode::InvalidParameter
        );
    }

    #[test]
    fn register_dump_names_every_register() {
        let emulated = EmulatedDevice::new();
        let device = registry(&emulated, 1).attach(0).unwrap();
        device.write_register(0, crate::jpu_registers::GBU_TCNT, 0x1234);
        device.write_register(0, crate::jpu_registers::PIC_SIZE, 0x0280_01E0);

        let dump = device.dump_registers(0);
        assert_eq!(dump.lines().filter(|l| !l.is_empty()).count(), DUMP_REGISTERS.len());
        assert!(dump.contains("\nGBU_TCNT=0x00001234\n"));
        assert!(dump.contains("\nPIC_SIZE=0x028001e0 PictureSize { width: 640, height: 480 }\n"));
    }
}
