// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The execution dispatcher.
//!
//! Single entry point from the host into the guest. The steady-state loop
//! reads the guest PC, injects pending interrupts at the architectural
//! boundary, finds or builds the translation unit for the PC and enters it.
//! Fragments return here after every guest control transfer; traps and
//! service requests they recorded are performed before the next iteration.

use crate::exception::Vector;
use crate::state::{SERVICE_BSR, SERVICE_RTE, SERVICE_RTS, TRAP_NONE};
use crate::status_register::SR_MASK;
use crate::{Emulator, JitError};

use std::sync::atomic::Ordering;

impl Emulator {
    /// Runs the guest until it leaves a program counter of zero after a
    /// fragment return, the halt sentinel.
    pub fn run(&mut self) -> Result<(), JitError> {
        loop {
            self.service_trap()?;

            if self.state.pc == 0 {
                log::debug!("halt sentinel reached");
                return Ok(());
            }

            if self.poll_interrupts()? {
                // The handler address is re-examined from the top.
                continue;
            }

            let pc = self.state.pc;
            let handle = if self.state.icache_enabled() && self.last_pc == pc {
                match self.last_handle {
                    Some(handle) => handle,
                    None => self.lookup_or_translate(pc)?,
                }
            } else {
                self.lookup_or_translate(pc)?
            };

            self.enter(handle)?;
        }
    }

    /// Translates and caches the unit at `pc` without entering it.
    pub fn prepare(&mut self, pc: u32) -> Result<(), JitError> {
        self.lookup_or_translate(pc)?;
        Ok(())
    }

    /// Performs a pending trap or service recorded by the last fragment.
    fn service_trap(&mut self) -> Result<(), JitError> {
        let code = std::mem::replace(&mut self.state.trap, TRAP_NONE);
        let result = match code {
            TRAP_NONE => return Ok(()),
            SERVICE_RTS => self.pop_long().map(|pc| self.state.pc = pc),
            SERVICE_RTE => self.service_rte(),
            SERVICE_BSR => {
                let target = self.state.trap_arg;
                self.push_long(self.state.pc).map(|()| self.state.pc = target)
            }
            vector => return self.raise(vector as u8),
        };

        match result {
            Ok(()) => Ok(()),
            // A stack or vector fetch fault during the service becomes a
            // guest exception of its own.
            Err(vector) => self.raise(vector),
        }
    }

    fn service_rte(&mut self) -> Result<(), u8> {
        let old = self.state.status();
        if !old.s {
            return Err(Vector::PrivilegeViolation as u8);
        }

        let sr = self.pop_word()?;
        let pc = self.pop_long()?;
        let format = self.pop_word()?;
        if format >> 12 != 0 {
            return Err(Vector::FormatError as u8);
        }

        self.state.sr = sr & SR_MASK;
        self.state.pc = pc;
        self.switch_stack(old, self.state.status());
        Ok(())
    }

    /// Raises a guest exception, surfacing a nested fault as a host error.
    fn raise(&mut self, vector: u8) -> Result<(), JitError> {
        self.enter_exception(vector)
            .map_err(|nested| JitError::DoubleFault { vector: nested })
    }

    /// Injects the highest pending unmasked interrupt, if any, and reports
    /// whether one was taken. Level 7 is not maskable.
    fn poll_interrupts(&mut self) -> Result<bool, JitError> {
        let pending = self.pint.load(Ordering::Acquire);
        if pending == 0 {
            return Ok(false);
        }

        let ipm = self.state.status().interrupt_mask as u32;
        let masked = ((2u32 << ipm) - 1) & !0x80;
        let takeable = pending & !masked & 0xFE;
        if takeable == 0 {
            return Ok(false);
        }

        let level = 31 - takeable.leading_zeros();
        self.pint.fetch_and(!(1 << level), Ordering::AcqRel);

        let vector = Vector::SpuriousInterrupt as u8 + level as u8;
        log::debug!("interrupt level {level}, vector {vector}");
        self.raise(vector)?;
        Ok(true)
    }

    /// Cache lookup with consistency verification; translation on miss,
    /// flushing the cache when the arena is full.
    fn lookup_or_translate(&mut self, pc: u32) -> Result<u32, JitError> {
        if let Some(handle) = self.cache.find(pc) {
            if !self.state.jit_control().contains(crate::state::JitControl::VERIFY) {
                return Ok(handle);
            }
            if let Some(handle) = self.cache.verify(handle, &self.memory, &mut self.arena) {
                return Ok(handle);
            }
            // The guest rewrote this unit's source; fall through and rebuild.
            self.invalidate_fast_path();
        }

        let unit = match self.translator.translate(&mut self.arena, &self.memory, pc) {
            Ok(unit) => unit,
            Err(JitError::ArenaExhausted { .. }) => self.translate_after_flush(pc)?,
            Err(other) => return Err(other),
        };

        let handle = self.cache.insert(unit);
        self.sync_jit_counters();
        Ok(handle)
    }

    /// The arena-exhaustion protocol: soft flush and retry, then hard flush
    /// and retry; a second failure is fatal.
    fn translate_after_flush(
        &mut self,
        pc: u32,
    ) -> Result<crate::translator::InstalledUnit, JitError> {
        if self.state.jit_control().contains(crate::state::JitControl::SOFT_FLUSH) {
            let target = self.state.jit_soft_thresh as usize;
            self.cache.soft_flush(&mut self.arena, target);
            self.invalidate_fast_path();
            self.sync_jit_counters();
            match self.translator.translate(&mut self.arena, &self.memory, pc) {
                Ok(unit) => return Ok(unit),
                Err(JitError::ArenaExhausted { .. }) => {}
                Err(other) => return Err(other),
            }
        }

        self.cache.hard_flush(&mut self.arena);
        self.invalidate_fast_path();
        self.sync_jit_counters();
        match self.translator.translate(&mut self.arena, &self.memory, pc) {
            Ok(unit) => Ok(unit),
            Err(JitError::ArenaExhausted { requested }) => {
                panic!("JIT arena exhausted after hard flush ({requested} bytes requested)")
            }
            Err(other) => Err(other),
        }
    }

    pub(crate) fn invalidate_fast_path(&mut self) {
        self.last_pc = u32::MAX;
        self.last_handle = None;
    }

    fn sync_jit_counters(&mut self) {
        self.state.jit_cache_total = self.arena.total_size() as u32;
        self.state.jit_cache_free = self.arena.free_size() as u32;
        self.state.jit_unit_count = self.cache.len() as u32;
    }

    /// Enters a fragment. The fragment spills all guest state back into the
    /// record before returning, so the dispatcher only ever observes a
    /// coherent state.
    #[cfg(target_arch = "aarch64")]
    fn enter(&mut self, handle: u32) -> Result<(), JitError> {
        let unit = self.cache.get_mut(handle);
        unit.use_count += 1;
        let entry = unit.entry();
        self.last_pc = unit.pc;
        self.last_handle = Some(handle);

        unsafe {
            let fragment: extern "C" fn(*mut crate::state::CpuState) =
                std::mem::transmute(entry);
            fragment(&mut *self.state);
        }
        Ok(())
    }

    /// Fragments hold host instructions; on foreign hosts they are data.
    #[cfg(not(target_arch = "aarch64"))]
    fn enter(&mut self, _handle: u32) -> Result<(), JitError> {
        Err(JitError::UnsupportedHost)
    }
}
