/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Session slots of a device and their pending job markers.
//!
//! Every slot lives in the shared control block. A session id carries the
//! generation the slot had when it was handed out, so an id kept after its
//! session closed is rejected even if the slot was reused by then.

use log::{debug, info};

use crate::jpu_error::{err_exit_code, AddContext, ErrorCode, Result};
use crate::structs::control_block::{LockGuard, SlotRecord};
use crate::structs::device::DeviceContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    slot_index: usize,
    generation: u32,
}

impl SessionId {
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Value stored in a pending job marker, never 0
    pub fn marker(&self) -> u64 {
        (u64::from(self.generation) << 32) | (self.slot_index as u64 + 1)
    }

    pub fn from_marker(marker: u64) -> Option<SessionId> {
        let index = (marker & 0xFFFF_FFFF) as usize;
        if index == 0 {
            return None;
        }
        Some(SessionId {
            slot_index: index - 1,
            generation: (marker >> 32) as u32,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Decoder = 1,
    Encoder = 2,
}

impl SessionMode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(SessionMode::Decoder),
            2 => Some(SessionMode::Encoder),
            _ => None,
        }
    }
}

impl DeviceContext {
    /// Hands out the first free slot of the session table
    pub fn allocate_slot(&self, mode: SessionMode) -> Result<SessionId> {
        let control = self.control_block();
        let _lock = self.lock()?;

        for i in 0..control.capacity() {
            let mut slot = control.read_slot(i)?;
            if slot.in_use != 0 {
                continue;
            }

            let released = slot;
            slot.in_use = 1;
            slot.slot_index = i as u32;
            slot.mode = mode as u32;
            slot.register_bank = i as u32;
            slot.generation = slot.generation.wrapping_add(1).max(1);
            slot.owner_pid = self.process_id();
            slot.pending_session = 0;
            control.write_slot(i, &slot)?;

            // the driver counts the instance only once the slot is claimed
            if let Err(e) = self.hardware().open_instance_count(i) {
                control.write_slot(i, &released)?;
                return Err(e).context();
            }

            let id = SessionId {
                slot_index: i,
                generation: slot.generation,
            };
            info!(
                "device {0}: opened {1:?} session in slot {2} (generation {3})",
                self.device_id(),
                mode,
                i,
                slot.generation
            );
            return Ok(id);
        }

        err_exit_code(
            ErrorCode::ResourceExhausted,
            format!(
                "all {0} session slots of device {1} are in use",
                control.capacity(),
                self.device_id()
            ),
        )
    }

    /// Gives the slot of `id` back. A slot with a job outstanding stays
    /// allocated and the call fails with FrameNotComplete.
    pub fn free_slot(&self, id: SessionId) -> Result<()> {
        let lock = self.lock()?;
        let mut slot = self.session_record(&lock, id)?;

        if let Some(marker) = slot.pending() {
            return err_exit_code(
                ErrorCode::FrameNotComplete,
                format!(
                    "slot {0} still has a job of session {1:?} outstanding",
                    id.slot_index,
                    SessionId::from_marker(marker)
                ),
            );
        }

        slot.in_use = 0;
        slot.mode = 0;
        slot.owner_pid = 0;
        self.control_block().write_slot(id.slot_index, &slot)?;

        self.hardware().close_instance_count(id.slot_index).context()?;

        info!(
            "device {0}: closed session in slot {1}",
            self.device_id(),
            id.slot_index
        );
        Ok(())
    }

    /// Fails with InvalidHandle unless `id` names the session currently
    /// holding its slot
    pub fn validate_session(&self, id: SessionId) -> Result<SlotRecord> {
        let lock = self.lock()?;
        self.session_record(&lock, id)
    }

    pub(crate) fn session_record(&self, _lock: &LockGuard, id: SessionId) -> Result<SlotRecord> {
        let control = self.control_block();
        if id.slot_index >= control.capacity() {
            return err_exit_code(
                ErrorCode::InvalidHandle,
                format!("session slot {0} does not exist", id.slot_index),
            );
        }

        let slot = control.read_slot(id.slot_index)?;
        if slot.in_use == 0 || slot.generation != id.generation {
            return err_exit_code(
                ErrorCode::InvalidHandle,
                format!(
                    "session {0}/{1} is not open",
                    id.slot_index, id.generation
                ),
            );
        }
        Ok(slot)
    }

    /// Records that `id` has a job on register bank `bank`. The caller holds the lock.
    pub fn mark_pending(&self, lock: &LockGuard, id: SessionId, bank: usize) -> Result<()> {
        let mut slot = self.session_record(lock, id)?;
        slot.pending_session = id.marker();
        slot.register_bank = bank as u32;
        self.control_block().write_slot(id.slot_index, &slot)?;

        debug!(
            "device {0}: slot {1} pending on bank {2}",
            self.device_id(),
            id.slot_index,
            bank
        );
        Ok(())
    }

    pub fn clear_pending(&self, _lock: &LockGuard, slot_index: usize) -> Result<()> {
        let control = self.control_block();
        let mut slot = control.read_slot(slot_index)?;
        if slot.pending_session != 0 {
            slot.pending_session = 0;
            control.write_slot(slot_index, &slot)?;
        }
        Ok(())
    }

    /// Session with a job outstanding on `slot_index`, if any
    pub fn get_pending(&self, _lock: &LockGuard, slot_index: usize) -> Result<Option<SessionId>> {
        let slot = self.control_block().read_slot(slot_index)?;
        Ok(slot.pending().and_then(SessionId::from_marker))
    }

    /// Another session with a job on register bank `bank`. Sessions outside
    /// slice mode all share bank 0, so only one of them may run at a time.
    pub fn bank_owner(
        &self,
        _lock: &LockGuard,
        bank: usize,
        except: SessionId,
    ) -> Result<Option<SessionId>> {
        let control = self.control_block();
        for i in 0..control.capacity() {
            let slot = control.read_slot(i)?;
            if slot.register_bank as usize != bank {
                continue;
            }
            if let Some(owner) = slot.pending().and_then(SessionId::from_marker) {
                if owner != except {
                    return Ok(Some(owner));
                }
            }
        }
        Ok(None)
    }

    pub fn any_pending(&self, _lock: &LockGuard) -> Result<bool> {
        let control = self.control_block();
        for i in 0..control.capacity() {
            if control.read_slot(i)?.pending().is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Number of slots currently handed out
    pub fn sessions_in_use(&self) -> Result<usize> {
        let control = self.control_block();
        let _lock = self.lock()?;

        let mut count = 0;
        for i in 0..control.capacity() {
            if control.read_slot(i)?.in_use != 0 {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Gates the codec clock. Turning it off is skipped while any slot has
    /// a job outstanding.
    pub fn set_clock_gate_ex(&self, on: bool) -> Result<()> {
        let lock = self.lock()?;
        self.set_clock_gate_locked(&lock, on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enabled_features::EnabledFeatures;
    use crate::helpers::get_rand_from_seed;
    use crate::structs::control_block::SharedControlBlock;
    use crate::structs::device::DeviceRegistry;
    use crate::structs::emulated_device::EmulatedDevice;
    use rand::Rng;
    use rstest::rstest;
    use std::sync::Arc;

    fn attach(capacity: usize) -> (EmulatedDevice, DeviceRegistry, Arc<DeviceContext>) {
        let emulated = EmulatedDevice::new();
        let features = EnabledFeatures {
            instance_capacity: capacity,
            ..Default::default()
        };
        let registry = DeviceRegistry::with_process_id(Arc::new(emulated.clone()), features, 100);
        let device = registry.attach(0).unwrap();
        (emulated, registry, device)
    }

    #[rstest]
    #[case(0x1_0000_0001, Some((0, 1)))]
    #[case(0x7_0000_0004, Some((3, 7)))]
    #[case(0xFFFF_FFFF_0000_0020, Some((31, u32::MAX)))]
    #[case(0x5_0000_0000, None)]
    #[case(0, None)]
    fn markers_decode(#[case] marker: u64, #[case] expected: Option<(usize, u32)>) {
        let id = SessionId::from_marker(marker);
        assert_eq!(id.map(|i| (i.slot_index(), i.generation())), expected);
        if let Some(id) = id {
            assert_eq!(id.marker(), marker);
        }
    }

    #[rstest]
    fn allocation_beyond_capacity_is_exhausted(#[values(1, 4, 7)] capacity: usize) {
        let (emulated, _registry, device) = attach(capacity);

        let mut ids = Vec::new();
        for _ in 0..capacity {
            ids.push(device.allocate_slot(SessionMode::Decoder).unwrap());
        }
        let e = device.allocate_slot(SessionMode::Encoder).unwrap_err();
        assert_eq!(e.error_code(), ErrorCode::ResourceExhausted);

        let mut slots: Vec<_> = ids.iter().map(|i| i.slot_index()).collect();
        slots.sort();
        slots.dedup();
        assert_eq!(slots.len(), capacity);
        for i in 0..capacity {
            assert_eq!(emulated.open_count(i), 1);
        }
    }

    #[test]
    fn refused_instance_leaves_the_slot_free() {
        let (emulated, _registry, device) = attach(2);

        emulated.refuse_instance(0, true);
        let e = device.allocate_slot(SessionMode::Decoder).unwrap_err();
        assert_eq!(e.error_code(), ErrorCode::Failure);
        assert_eq!(device.sessions_in_use().unwrap(), 0);
        assert_eq!(emulated.open_count(0), 0);
        assert_eq!(device.control_block().read_slot(0).unwrap().in_use, 0);

        emulated.refuse_instance(0, false);
        let id = device.allocate_slot(SessionMode::Decoder).unwrap();
        assert_eq!(id.slot_index(), 0);
        assert_eq!(emulated.open_count(0), 1);
        assert_eq!(device.sessions_in_use().unwrap(), 1);
    }

    #[test]
    fn freed_slot_is_reused_with_new_generation() {
        let (emulated, _registry, device) = attach(2);

        let a = device.allocate_slot(SessionMode::Decoder).unwrap();
        let b = device.allocate_slot(SessionMode::Encoder).unwrap();
        device.free_slot(a).unwrap();
        assert_eq!(emulated.open_count(a.slot_index()), 0);

        let c = device.allocate_slot(SessionMode::Encoder).unwrap();
        assert_eq!(c.slot_index(), a.slot_index());
        assert_ne!(c.generation(), a.generation());

        // the old id must not reach the new session
        assert_eq!(
            device.validate_session(a).unwrap_err().error_code(),
            ErrorCode::InvalidHandle
        );
        assert_eq!(
            device.free_slot(a).unwrap_err().error_code(),
            ErrorCode::InvalidHandle
        );
        assert_eq!(
            device.validate_session(c).unwrap().mode,
            SessionMode::Encoder as u32
        );
        device.validate_session(b).unwrap();
    }

    #[test]
    fn pending_slot_cannot_be_freed() {
        let (_emulated, _registry, device) = attach(4);
        let id = device.allocate_slot(SessionMode::Decoder).unwrap();

        {
            let lock = device.lock().unwrap();
            device.mark_pending(&lock, id, 0).unwrap();
            assert_eq!(device.get_pending(&lock, id.slot_index()).unwrap(), Some(id));
        }

        let e = device.free_slot(id).unwrap_err();
        assert_eq!(e.error_code(), ErrorCode::FrameNotComplete);
        assert_eq!(device.validate_session(id).unwrap().in_use, 1);

        {
            let lock = device.lock().unwrap();
            device.clear_pending(&lock, id.slot_index()).unwrap();
            assert_eq!(device.get_pending(&lock, id.slot_index()).unwrap(), None);
        }
        device.free_slot(id).unwrap();
    }

    #[test]
    fn shared_bank_has_one_owner() {
        let (_emulated, _registry, device) = attach(4);
        let a = device.allocate_slot(SessionMode::Decoder).unwrap();
        let b = device.allocate_slot(SessionMode::Decoder).unwrap();

        let lock = device.lock().unwrap();
        assert_eq!(device.bank_owner(&lock, 0, b).unwrap(), None);
        device.mark_pending(&lock, a, 0).unwrap();
        assert_eq!(device.bank_owner(&lock, 0, b).unwrap(), Some(a));
        assert_eq!(device.bank_owner(&lock, 0, a).unwrap(), None);
        assert_eq!(device.bank_owner(&lock, 1, b).unwrap(), None);
        assert!(device.any_pending(&lock).unwrap());
    }

    #[test]
    fn clock_stays_on_while_job_pending() {
        let (emulated, _registry, device) = attach(2);
        let id = device.allocate_slot(SessionMode::Encoder).unwrap();
        assert!(emulated.clock_enabled());

        {
            let lock = device.lock().unwrap();
            device.mark_pending(&lock, id, id.slot_index()).unwrap();
        }
        device.set_clock_gate_ex(false).unwrap();
        assert!(emulated.clock_enabled());

        {
            let lock = device.lock().unwrap();
            device.clear_pending(&lock, id.slot_index()).unwrap();
        }
        device.set_clock_gate_ex(false).unwrap();
        assert!(!emulated.clock_enabled());
        assert_eq!(device.control_block().read_header().unwrap().clock_enabled, 0);
    }

    /// random allocate/free sequences never hand out more than the capacity
    /// and a pending slot always survives a free
    #[test]
    fn random_allocate_free_keeps_invariants() {
        const CAPACITY: usize = 5;
        let (_emulated, _registry, device) = attach(CAPACITY);
        let mut rng = get_rand_from_seed([7; 32]);
        let mut open: Vec<(SessionId, bool)> = Vec::new();

        for _ in 0..2000 {
            match rng.gen_range(0..4) {
                0 | 1 => match device.allocate_slot(SessionMode::Decoder) {
                    Ok(id) => {
                        assert!(open.iter().all(|(o, _)| o.slot_index() != id.slot_index()));
                        open.push((id, false));
                    }
                    Err(e) => {
                        assert_eq!(e.error_code(), ErrorCode::ResourceExhausted);
                        assert_eq!(open.len(), CAPACITY);
                    }
                },
                2 if !open.is_empty() => {
                    let i = rng.gen_range(0..open.len());
                    let (id, pending) = open[i];
                    let lock = device.lock().unwrap();
                    if pending {
                        device.clear_pending(&lock, id.slot_index()).unwrap();
                    } else {
                        device.mark_pending(&lock, id, id.slot_index()).unwrap();
                    }
                    open[i].1 = !pending;
                }
                _ if !open.is_empty() => {
                    let i = rng.gen_range(0..open.len());
                    let (id, pending) = open[i];
                    let r = device.free_slot(id);
                    if pending {
                        assert_eq!(r.unwrap_err().error_code(), ErrorCode::FrameNotComplete);
                        assert_eq!(device.validate_session(id).unwrap().in_use, 1);
                    } else {
                        r.unwrap();
                        open.swap_remove(i);
                    }
                }
                _ => {}
            }

            let in_use = device.sessions_in_use().unwrap();
            assert!(in_use <= CAPACITY);
            assert_eq!(in_use, open.len());
        }
    }
}
