// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest architectural state.
//!
//! The state record is the authoritative storage of the guest register file.
//! Generated code reaches its fields through fixed byte offsets from a single
//! base register that is loaded in every fragment prologue, so the layout is
//! `#[repr(C)]` and every field touched by emitted code must stay within a
//! short unsigned offset of the base.

use crate::status_register::{StatusRegister, SR_S};

use bitflags::bitflags;
use std::mem::offset_of;

bitflags! {
    /// Guest cache control register.
    pub struct Cacr: u32 {
        /// Instruction cache enable.
        const IE = 0x0000_8000;
        /// Data cache enable. Accepted but ignored by the translator.
        const DE = 0x8000_0000;
    }
}

bitflags! {
    /// JIT control word, guest-visible through the state record.
    pub struct JitControl: u32 {
        /// Soft flush on arena pressure instead of a full purge.
        const SOFT_FLUSH = 0x0000_0001;
        /// Verify unit fingerprints on cache hits.
        const VERIFY = 0x0000_0002;
    }
}

/// No trap or service pending.
pub const TRAP_NONE: u32 = 0;
/// Return-from-subroutine service: pop the return address into PC.
pub const SERVICE_RTS: u32 = 0x100;
/// Return-from-exception service: pop SR, PC and the frame word.
pub const SERVICE_RTE: u32 = 0x101;
/// Branch-to-subroutine service: push PC, then jump to the argument cell.
pub const SERVICE_BSR: u32 = 0x102;

/// The guest register file and JIT bookkeeping, in its in-memory layout.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct CpuState {
    /// Data registers.
    pub d: [u32; 8],
    /// Address registers. `a[7]` shadows whichever of USP/ISP/MSP is active
    /// for the current `(S, M)`.
    pub a: [u32; 8],
    /// Program counter.
    pub pc: u32,
    /// Status register, packed raw word.
    pub sr: u16,
    _pad0: u16,
    /// User stack pointer.
    pub usp: u32,
    /// Interrupt stack pointer.
    pub isp: u32,
    /// Master stack pointer.
    pub msp: u32,
    /// Vector base register.
    pub vbr: u32,
    /// Cache control register.
    pub cacr: u32,
    /// Pending guest trap or dispatcher service, written by generated code.
    pub trap: u32,
    /// Argument cell for dispatcher services.
    pub trap_arg: u32,
    _pad1: u32,
    /// Floating-point registers, held as host doubles.
    pub fp: [f64; 8],
    /// FPU control register.
    pub fpcr: u32,
    /// FPU status register.
    pub fpsr: u32,
    /// FPU instruction address register.
    pub fpiar: u32,

    /// Total size of the JIT arena in bytes.
    pub jit_cache_total: u32,
    /// Free bytes remaining in the JIT arena.
    pub jit_cache_free: u32,
    /// Number of live translation units.
    pub jit_unit_count: u32,
    /// Unit count the soft flush drives the cache down to.
    pub jit_soft_thresh: u32,
    /// JIT control flags, see [JitControl].
    pub jit_control: u32,
}

impl CpuState {
    /// A state record as the boot contract leaves it: supervisor mode,
    /// interrupts masked, FPU control at its defined default.
    pub fn new() -> Self {
        Self {
            d: [0; 8],
            a: [0; 8],
            pc: 0,
            sr: 1 << SR_S | 7 << 8,
            _pad0: 0,
            usp: 0,
            isp: 0,
            msp: 0,
            vbr: 0,
            cacr: 0,
            trap: TRAP_NONE,
            trap_arg: 0,
            _pad1: 0,
            fp: [0.0; 8],
            fpcr: 0xFFFF,
            fpsr: 0,
            fpiar: 0,
            jit_cache_total: 0,
            jit_cache_free: 0,
            jit_unit_count: 0,
            jit_soft_thresh: 0,
            jit_control: 0,
        }
    }

    /// Typed view of the packed status register.
    pub fn status(&self) -> StatusRegister {
        StatusRegister::from(self.sr)
    }

    /// Writes back a typed status register into the packed word.
    pub fn set_status(&mut self, sr: StatusRegister) {
        self.sr = sr.into();
    }

    /// True when the guest instruction cache is enabled.
    pub fn icache_enabled(&self) -> bool {
        Cacr::from_bits_truncate(self.cacr).contains(Cacr::IE)
    }

    /// JIT control flags.
    pub fn jit_control(&self) -> JitControl {
        JitControl::from_bits_truncate(self.jit_control)
    }

    /// Offset of data register `reg` from the state base.
    pub(crate) const fn off_d(reg: u8) -> u32 {
        (offset_of!(CpuState, d) + reg as usize * 4) as u32
    }

    /// Offset of address register `reg` from the state base.
    pub(crate) const fn off_a(reg: u8) -> u32 {
        (offset_of!(CpuState, a) + reg as usize * 4) as u32
    }

    /// Offset of floating-point register `reg` from the state base.
    pub(crate) const fn off_fp(reg: u8) -> u32 {
        (offset_of!(CpuState, fp) + reg as usize * 8) as u32
    }

    pub(crate) const OFF_PC: u32 = offset_of!(CpuState, pc) as u32;
    pub(crate) const OFF_SR: u32 = offset_of!(CpuState, sr) as u32;
    pub(crate) const OFF_TRAP: u32 = offset_of!(CpuState, trap) as u32;
    pub(crate) const OFF_TRAP_ARG: u32 = offset_of!(CpuState, trap_arg) as u32;
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}
