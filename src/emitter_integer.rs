// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integer instruction emitters, one family per guest opcode group.
//!
//! Register-to-register forms are emitted inline; the subroutine and
//! exception-return instructions are emitted as dispatcher service requests
//! since they touch the guest stack. Memory operand forms of this first pass
//! fall back to the illegal-instruction guard.

use crate::aarch64 as a64;
use crate::aarch64::{Cond, GUEST_CC_TO_HOST};
use crate::memory::GuestMemory;
use crate::register_allocator::{GuestReg, REG_CTX, REG_SR};
use crate::state::{CpuState, SERVICE_BSR, SERVICE_RTE, SERVICE_RTS};
use crate::translator::UnitBuilder;

/// Guest conditional test numbers with no host condition: always and never.
const CC_T: u8 = 0;
const CC_F: u8 = 1;

impl UnitBuilder {
    /// Aligns the host flags with the guest CCR: copy the condition codes to
    /// a scratch register, drop the extend bit which no conditional test
    /// consumes, reorder carry above overflow the way the host flag word is
    /// laid out, and write the native flags register. Single use: valid until
    /// the next flag-setting host instruction.
    pub(crate) fn emit_materialize_ccr(&mut self) {
        let t = self.ra.alloc_temp(&mut self.buf);
        let u = self.ra.alloc_temp(&mut self.buf);

        self.buf.push(a64::ubfx(t, REG_SR, 2, 2));
        self.buf.push(a64::lsl_immed(t, t, 2));
        self.buf.push(a64::ubfx(u, REG_SR, 0, 1));
        self.buf.push(a64::orr_reg_shift(t, t, u, 1));
        self.buf.push(a64::ubfx(u, REG_SR, 1, 1));
        self.buf.push(a64::orr_reg(t, t, u));
        self.buf.push(a64::lsl_immed(t, t, 28));
        self.buf.push(a64::msr_nzcv(t));

        self.ra.free_temp(u);
        self.ra.free_temp(t);
    }

    /// Folds the host flags of the preceding flag-setting instruction back
    /// into the guest CCR. The guest borrow is the inverted host carry on
    /// subtraction; the extend bit follows carry when `set_x` is requested.
    pub(crate) fn emit_ccr_from_host_flags(&mut self, invert_c: bool, set_x: bool) {
        let t = self.ra.alloc_temp(&mut self.buf);
        let u = self.ra.alloc_temp(&mut self.buf);

        self.buf.push(a64::mrs_nzcv(t));
        self.buf.push(a64::lsr_immed(t, t, 28));
        if invert_c {
            self.buf.push(a64::eor_immed(t, t, 0b0010));
        }
        self.buf.push(a64::ubfx(u, t, 1, 1));
        self.buf.push(a64::bfi(REG_SR, u, 0, 1));
        if set_x {
            self.buf.push(a64::bfi(REG_SR, u, 4, 1));
        }
        self.buf.push(a64::ubfx(u, t, 0, 1));
        self.buf.push(a64::bfi(REG_SR, u, 1, 1));
        self.buf.push(a64::ubfx(u, t, 2, 2));
        self.buf.push(a64::bfi(REG_SR, u, 2, 2));

        self.ra.free_temp(u);
        self.ra.free_temp(t);
    }

    /// NOP, TRAP, RTS, RTE.
    pub(crate) fn emit_line4(&mut self, opcode: u16) {
        match opcode {
            0x4E71 => self.advance_pc(), // NOP
            0x4E73 => {
                // RTE. The dispatcher performs the frame pop; the recorded PC
                // is the instruction itself for the privilege-violation path.
                self.emit_trap(SERVICE_RTE, self.pc);
            }
            0x4E75 => {
                // RTS.
                self.emit_trap(SERVICE_RTS, self.cursor);
            }
            _ if opcode & 0xFFF0 == 0x4E40 => {
                // TRAP #n pushes the address of the next instruction.
                let vector = 32 + (opcode & 0xF) as u32;
                self.emit_trap(vector, self.cursor);
            }
            _ => self.emit_illegal(),
        }
    }

    /// ADDQ, SUBQ, Scc, DBcc.
    pub(crate) fn emit_line5(&mut self, memory: &GuestMemory, opcode: u16) {
        if opcode & 0xF0C0 == 0x50C0 {
            match opcode & 0x38 {
                0x08 => self.emit_dbcc(memory, opcode),
                0x00 => self.emit_scc(opcode),
                // TRAPcc and the memory Scc forms.
                _ => self.emit_illegal(),
            }
        } else {
            self.emit_addq_subq(opcode);
        }
    }

    /// Count-controlled loop.
    ///
    /// First test: a true condition exits the loop past the displacement
    /// word. Otherwise the low 16 bits of the counter are decremented with
    /// the high half untouched; wrapping through zero exits, anything else
    /// re-enters the loop at the displaced target.
    fn emit_dbcc(&mut self, memory: &GuestMemory, opcode: u16) {
        let condition = (opcode >> 8) as u8 & 0x0F;
        let Some(displacement) = self.next_word(memory) else {
            return self.emit_fetch_fault();
        };

        // DBT never branches and never touches the counter.
        if condition == CC_T {
            self.advance_pc();
            return;
        }

        let target = self
            .pc
            .wrapping_add(2)
            .wrapping_add(displacement as i16 as u32);
        let past = self.cursor;

        let counter = self.ra.map_read(&mut self.buf, GuestReg::D(opcode as u8 & 7));
        self.ra.mark_dirty(GuestReg::D(opcode as u8 & 7));
        let t = self.ra.alloc_temp(&mut self.buf);

        // A true condition is the loop break condition.
        let break_cond = if condition != CC_F {
            self.emit_materialize_ccr();
            Some(self.buf.bcc_forward(GUEST_CC_TO_HOST[condition as usize]))
        } else {
            None
        };

        // Decrement the low 16 bits in the top half of a scratch register so
        // the host flags see the 16-bit wrap.
        self.buf.push(a64::lsl_immed(t, counter, 16));
        self.buf.push(a64::sub_immed(t, t, 0x10, true));
        self.buf.push(a64::cmn_immed(t, 0x10, true));
        self.buf.push(a64::lsr_immed(t, t, 16));
        self.buf.push(a64::bfi(counter, t, 0, 16));

        // Counter wrapped through zero: fall out of the loop.
        let break_wrap = self.buf.bcc_forward(Cond::Eq);

        self.emit_store_pc(target);
        let done = self.buf.b_forward();

        if let Some(branch) = break_cond {
            self.buf.bind_here(branch);
        }
        self.buf.bind_here(break_wrap);
        self.emit_store_pc(past);

        self.buf.bind_here(done);
        self.ra.free_temp(t);
        self.terminated = true;
    }

    /// Scc with a data register destination.
    fn emit_scc(&mut self, opcode: u16) {
        let condition = (opcode >> 8) as u8 & 0x0F;
        let reg = GuestReg::D(opcode as u8 & 7);
        let dn = self.ra.map_read(&mut self.buf, reg);
        self.ra.mark_dirty(reg);

        match condition {
            CC_T => self.emit_mov32(0, 0xFF),
            CC_F => self.emit_mov32(0, 0),
            _ => {
                self.emit_materialize_ccr();
                self.buf
                    .push(a64::csetm(0, GUEST_CC_TO_HOST[condition as usize]));
            }
        }
        self.buf.push(a64::bfi(dn, 0, 0, 8));
        self.advance_pc();
    }

    /// ADDQ/SUBQ with register destinations.
    fn emit_addq_subq(&mut self, opcode: u16) {
        let is_sub = opcode & 0x0100 != 0;
        let mut data = (opcode >> 9) as u32 & 7;
        if data == 0 {
            data = 8;
        }
        let size = (opcode >> 6) & 3;
        let mode = (opcode >> 3) & 7;
        let reg = opcode as u8 & 7;

        match mode {
            0 => {
                let guest = GuestReg::D(reg);
                let dn = self.ra.map_read(&mut self.buf, guest);
                self.ra.mark_dirty(guest);
                match size {
                    2 => {
                        self.buf.push(if is_sub {
                            a64::subs_immed(dn, dn, data)
                        } else {
                            a64::adds_immed(dn, dn, data)
                        });
                        self.emit_ccr_from_host_flags(is_sub, true);
                    }
                    _ => {
                        // Byte and word operate in the top of a scratch
                        // register, leaving the untouched part of the data
                        // register intact and the host flags exact.
                        let shift = if size == 0 { 24 } else { 16 };
                        let width = 32 - shift;
                        let t = self.ra.alloc_temp(&mut self.buf);
                        let u = self.ra.alloc_temp(&mut self.buf);
                        self.buf.push(a64::lsl_immed(t, dn, shift));
                        self.emit_mov32(u, data << shift);
                        self.buf.push(if is_sub {
                            a64::subs_reg(t, t, u)
                        } else {
                            a64::adds_reg(t, t, u)
                        });
                        self.buf.push(a64::lsr_immed(t, t, shift));
                        self.buf.push(a64::bfi(dn, t, 0, width));
                        self.ra.free_temp(u);
                        self.ra.free_temp(t);
                        self.emit_ccr_from_host_flags(is_sub, true);
                    }
                }
                self.advance_pc();
            }
            1 if size != 0 => {
                // Address register destination: whole register, no flags.
                let guest = GuestReg::A(reg);
                let an = self.ra.map_read(&mut self.buf, guest);
                self.ra.mark_dirty(guest);
                self.buf.push(if is_sub {
                    a64::sub_immed(an, an, data, false)
                } else {
                    a64::add_immed(an, an, data)
                });
                self.advance_pc();
            }
            // Memory destinations are not in the first translation pass.
            _ => self.emit_illegal(),
        }
    }

    /// BRA, BSR, Bcc.
    pub(crate) fn emit_line6(&mut self, memory: &GuestMemory, opcode: u16) {
        let condition = (opcode >> 8) as u8 & 0x0F;
        let displacement = match opcode as u8 {
            0x00 => {
                let Some(ext) = self.next_word(memory) else {
                    return self.emit_fetch_fault();
                };
                ext as i16 as i32
            }
            // The long displacement form of later family members.
            0xFF => return self.emit_illegal(),
            byte => byte as i8 as i32,
        };

        let target = self.pc.wrapping_add(2).wrapping_add(displacement as u32);
        let past = self.cursor;

        match condition {
            CC_T => {
                // BRA.
                self.emit_store_pc(target);
                self.terminated = true;
            }
            CC_F => {
                // BSR: the dispatcher pushes the return address.
                self.emit_store_trap_arg(target);
                self.emit_trap(SERVICE_BSR, past);
            }
            _ => {
                self.emit_materialize_ccr();
                self.emit_mov32(0, target);
                self.emit_mov32(1, past);
                self.buf
                    .push(a64::csel(0, 0, 1, GUEST_CC_TO_HOST[condition as usize]));
                self.buf.push(a64::str_offset(0, REG_CTX, CpuState::OFF_PC));
                self.terminated = true;
            }
        }
    }

    /// MOVEQ.
    pub(crate) fn emit_line7(&mut self, opcode: u16) {
        if opcode & 0x0100 != 0 {
            return self.emit_illegal();
        }
        let value = opcode as i8 as i32 as u32;
        let reg = GuestReg::D((opcode >> 9) as u8 & 7);

        let dn = self.ra.map_write(&mut self.buf, reg);
        self.emit_mov32(dn, value);

        // N and Z are known at translation time; V and C always clear.
        self.buf.push(a64::and_immed(REG_SR, REG_SR, 0xFFFF_FFF0));
        if value == 0 {
            self.buf.push(a64::orr_immed(REG_SR, REG_SR, 0b0100));
        } else if (value as i32) < 0 {
            self.buf.push(a64::orr_immed(REG_SR, REG_SR, 0b1000));
        }
        self.advance_pc();
    }

    /// Instruction stream ran off the mapped guest memory.
    pub(crate) fn emit_fetch_fault(&mut self) {
        self.emit_trap(crate::exception::Vector::AccessError as u32, self.pc);
    }
}
