// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register allocation for the instruction emitters.
//!
//! Two independent banks map guest general-purpose and guest floating-point
//! registers onto host registers, tracking dirtiness for write-back. Within
//! each bank a fixed partition is reserved for guest state and a second
//! partition serves as a scratch pool; temporaries never take registers from
//! the guest partition. The allocator is a pure service: it knows offsets
//! into the state record, never guest semantics.
//!
//! Host register convention, inside a fragment:
//! - x0, x1: emitter immediates and helper-call arguments, never allocated.
//! - x2..x9: guest general-purpose partition.
//! - x10..x15: general-purpose scratch pool.
//! - x16: helper-call target.
//! - x27: state base, live for the whole fragment.
//! - x28: guest status register, live for the whole fragment.
//! - d0, d1: helper-call argument/result, never allocated.
//! - d2..d7: guest floating-point partition.
//! - d16..d19: floating-point scratch pool.
//!
//! Every allocatable register is caller-saved in the host convention, so a
//! full spill doubles as the call-boundary save.

use crate::aarch64 as a64;
use crate::code_buffer::CodeBuffer;
use crate::state::CpuState;

/// Host register holding the state base across the whole fragment.
pub const REG_CTX: u8 = 27;
/// Host register holding the raw guest SR across the whole fragment.
pub const REG_SR: u8 = 28;
/// Host register used as the helper-call target.
pub const REG_CALL: u8 = 16;

const GP_GUEST_POOL: &[u8] = &[2, 3, 4, 5, 6, 7, 8, 9];
const GP_SCRATCH_POOL: &[u8] = &[10, 11, 12, 13, 14, 15];
const FP_GUEST_POOL: &[u8] = &[2, 3, 4, 5, 6, 7];
const FP_SCRATCH_POOL: &[u8] = &[16, 17, 18, 19];

/// A guest general-purpose register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestReg {
    /// Data register D0..D7.
    D(u8),
    /// Address register A0..A7.
    A(u8),
}

impl GuestReg {
    fn index(self) -> usize {
        match self {
            Self::D(r) => r as usize,
            Self::A(r) => 8 + r as usize,
        }
    }

    fn offset(index: usize) -> u32 {
        if index < 8 {
            CpuState::off_d(index as u8)
        } else {
            CpuState::off_a(index as u8 - 8)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Owner {
    Free,
    Guest { index: u8, dirty: bool },
    Temp,
}

struct Bank {
    guest_pool: &'static [u8],
    scratch_pool: &'static [u8],
    owners: [Owner; 32],
    stamps: [u64; 32],
    /// guest index -> resident host register.
    map: [Option<u8>; 16],
    load: fn(u8, u8, u32) -> u32,
    store: fn(u8, u8, u32) -> u32,
    offset: fn(usize) -> u32,
}

impl Bank {
    fn new(
        guest_pool: &'static [u8],
        scratch_pool: &'static [u8],
        load: fn(u8, u8, u32) -> u32,
        store: fn(u8, u8, u32) -> u32,
        offset: fn(usize) -> u32,
    ) -> Self {
        Self {
            guest_pool,
            scratch_pool,
            owners: [Owner::Free; 32],
            stamps: [0; 32],
            map: [None; 16],
            load,
            store,
            offset,
        }
    }

    fn touch(&mut self, host: u8, clock: &mut u64) {
        *clock += 1;
        self.stamps[host as usize] = *clock;
    }

    fn spill_one(&mut self, buf: &mut CodeBuffer, host: u8) {
        if let Owner::Guest { index, dirty } = self.owners[host as usize] {
            if dirty {
                buf.push((self.store)(host, REG_CTX, (self.offset)(index as usize)));
            }
            self.map[index as usize] = None;
        }
        self.owners[host as usize] = Owner::Free;
    }

    /// Least-recently-used guest-owned register of `pool`, if any.
    fn lru_guest(&self, pool: &[u8]) -> Option<u8> {
        pool.iter()
            .copied()
            .filter(|&h| matches!(self.owners[h as usize], Owner::Guest { .. }))
            .min_by_key(|&h| self.stamps[h as usize])
    }

    fn free_slot(&self, pool: &[u8]) -> Option<u8> {
        pool.iter()
            .copied()
            .find(|&h| self.owners[h as usize] == Owner::Free)
    }

    /// Picks a host register for a guest mapping, spilling if needed.
    fn take_for_guest(&mut self, buf: &mut CodeBuffer) -> u8 {
        if let Some(h) = self.free_slot(self.guest_pool) {
            return h;
        }
        if let Some(h) = self.free_slot(self.scratch_pool) {
            return h;
        }
        let h = self
            .lru_guest(self.guest_pool)
            .expect("guest register partition exhausted by temporaries");
        self.spill_one(buf, h);
        h
    }

    fn map_guest(&mut self, buf: &mut CodeBuffer, index: usize, write: bool, clock: &mut u64) -> u8 {
        if let Some(host) = self.map[index] {
            if write {
                self.owners[host as usize] = Owner::Guest { index: index as u8, dirty: true };
            }
            self.touch(host, clock);
            return host;
        }

        let host = self.take_for_guest(buf);
        if !write {
            buf.push((self.load)(host, REG_CTX, (self.offset)(index)));
        }
        self.owners[host as usize] = Owner::Guest { index: index as u8, dirty: write };
        self.map[index] = Some(host);
        self.touch(host, clock);
        host
    }

    fn mark_dirty(&mut self, index: usize) {
        let host = self.map[index].expect("marking a non-resident guest register dirty");
        self.owners[host as usize] = Owner::Guest { index: index as u8, dirty: true };
    }

    fn alloc_temp(&mut self, buf: &mut CodeBuffer, clock: &mut u64) -> u8 {
        let host = match self.free_slot(self.scratch_pool) {
            Some(h) => h,
            None => {
                // Reclaim the least-recently-used guest value living in the
                // scratch pool; live temporaries cannot be stolen.
                let h = self
                    .lru_guest(self.scratch_pool)
                    .expect("scratch pool exhausted by temporaries");
                self.spill_one(buf, h);
                h
            }
        };
        self.owners[host as usize] = Owner::Temp;
        self.touch(host, clock);
        host
    }

    fn free_temp(&mut self, host: u8) {
        assert_eq!(
            self.owners[host as usize],
            Owner::Temp,
            "freeing a register that is not a live temporary"
        );
        self.owners[host as usize] = Owner::Free;
    }

    fn spill_all(&mut self, buf: &mut CodeBuffer) {
        for pool in [self.guest_pool, self.scratch_pool] {
            for &h in pool {
                self.spill_one(buf, h);
            }
        }
    }
}

/// The emitters' register allocator.
pub struct RegisterAllocator {
    gp: Bank,
    fp: Bank,
    clock: u64,
}

impl RegisterAllocator {
    pub fn new() -> Self {
        Self {
            gp: Bank::new(
                GP_GUEST_POOL,
                GP_SCRATCH_POOL,
                a64::ldr_offset,
                a64::str_offset,
                GuestReg::offset,
            ),
            fp: Bank::new(
                FP_GUEST_POOL,
                FP_SCRATCH_POOL,
                a64::ldr_d_offset,
                a64::str_d_offset,
                |i| CpuState::off_fp(i as u8),
            ),
            clock: 0,
        }
    }

    /// Host register holding the current value of `reg`, loading it from the
    /// state record if not resident. Does not mark it dirty.
    pub fn map_read(&mut self, buf: &mut CodeBuffer, reg: GuestReg) -> u8 {
        self.gp.map_guest(buf, reg.index(), false, &mut self.clock)
    }

    /// Host register for writing `reg`: allocates without the reload and
    /// marks it dirty.
    pub fn map_write(&mut self, buf: &mut CodeBuffer, reg: GuestReg) -> u8 {
        self.gp.map_guest(buf, reg.index(), true, &mut self.clock)
    }

    /// Records that the resident host copy of `reg` must be written back.
    pub fn mark_dirty(&mut self, reg: GuestReg) {
        self.gp.mark_dirty(reg.index());
    }

    /// A host register from the scratch pool, disjoint from the guest mapping.
    pub fn alloc_temp(&mut self, buf: &mut CodeBuffer) -> u8 {
        self.gp.alloc_temp(buf, &mut self.clock)
    }

    /// Releases a temporary.
    pub fn free_temp(&mut self, host: u8) {
        self.gp.free_temp(host);
    }

    /// Host floating-point register holding guest FP register `reg`.
    pub fn map_fp_read(&mut self, buf: &mut CodeBuffer, reg: u8) -> u8 {
        self.fp.map_guest(buf, reg as usize, false, &mut self.clock)
    }

    /// Host floating-point register for writing guest FP register `reg`.
    pub fn map_fp_write(&mut self, buf: &mut CodeBuffer, reg: u8) -> u8 {
        self.fp.map_guest(buf, reg as usize, true, &mut self.clock)
    }

    /// A floating-point temporary.
    pub fn alloc_fp_temp(&mut self, buf: &mut CodeBuffer) -> u8 {
        self.fp.alloc_temp(buf, &mut self.clock)
    }

    /// Releases a floating-point temporary.
    pub fn free_fp_temp(&mut self, host: u8) {
        self.fp.free_temp(host);
    }

    /// Writes back every dirty mapping and drops residency in both banks.
    pub fn spill_all(&mut self, buf: &mut CodeBuffer) {
        self.gp.spill_all(buf);
        self.fp.spill_all(buf);
    }

    /// Call-boundary spill. Every allocatable register is caller-saved, so
    /// this is a full spill; dirty guest values must never be live in host
    /// registers across an emitted call.
    pub fn spill_for_call(&mut self, buf: &mut CodeBuffer) {
        self.spill_all(buf);
    }
}

impl Default for RegisterAllocator {
    fn default() -> Self {
        Self::new()
    }
}
