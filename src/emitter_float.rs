// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Line F emitters: the FPU instruction family.
//!
//! The transcendentals inline a quadrant-dispatch tail around the shared
//! range-trim and polynomial helpers. The helpers are address-stable
//! routines; their addresses and the constants-pool base are embedded as
//! 64-bit literals in the fragment, and polynomial coefficients are reached
//! PC-relative from the pool.

use crate::aarch64 as a64;
use crate::aarch64::Cond;
use crate::constants::{
    poly_cosine, poly_sine, trim_double_range, C_0_5, C_10P0, C_1_5, C_1_PI, CONSTANTS,
};
use crate::exception::Vector;
use crate::memory::GuestMemory;
use crate::register_allocator::{REG_CALL, REG_CTX};
use crate::state::CpuState;
use crate::translator::UnitBuilder;

fn pool_address() -> u64 {
    CONSTANTS.as_ptr() as u64
}

fn sine_address() -> u64 {
    poly_sine as extern "C" fn(f64) -> f64 as usize as u64
}

fn cosine_address() -> u64 {
    poly_cosine as extern "C" fn(f64) -> f64 as usize as u64
}

fn trim_address() -> u64 {
    trim_double_range as extern "C" fn(f64) -> f64 as usize as u64
}

impl UnitBuilder {
    /// FPU family dispatch.
    pub(crate) fn emit_line_f(&mut self, memory: &GuestMemory, opcode: u16) {
        if self.nofpu {
            return self.emit_trap(Vector::LineFEmulator as u32, self.pc);
        }
        let Some(op2) = self.next_word(memory) else {
            return self.emit_fetch_fault();
        };

        // FNOP.
        if opcode == 0xF280 && op2 == 0 {
            self.advance_pc();
            return;
        }
        if opcode != 0xF200 {
            return self.emit_trap(Vector::LineFEmulator as u32, self.pc);
        }

        if op2 & 0xFC00 == 0x5C00 {
            self.emit_fmovecr(op2);
        } else if op2 & 0xE07F == 0x0018 {
            self.emit_fabs(op2);
        } else if op2 & 0xE07F == 0x000E {
            self.emit_fsincos(op2, false);
        } else if op2 & 0xE07F == 0x001D {
            self.emit_fsincos(op2, true);
        } else {
            self.emit_trap(Vector::LineFEmulator as u32, self.pc);
        }
    }

    /// FMOVECR: PC-relative double load from the constants pool at the 7-bit
    /// selector of the extension word.
    fn emit_fmovecr(&mut self, op2: u16) {
        let offset = (op2 & 0x7F) as u32;
        let dst = self.ra.map_fp_write(&mut self.buf, (op2 >> 7) as u8 & 7);

        self.buf.ldr64_literal(1, pool_address());
        self.buf.push(a64::ldr_d_offset(dst, 1, offset * 8));
        self.advance_pc();
    }

    /// FABS.X reg-reg.
    fn emit_fabs(&mut self, op2: u16) {
        let src = self.ra.map_fp_read(&mut self.buf, (op2 >> 10) as u8 & 7);
        let dst = self.ra.map_fp_write(&mut self.buf, (op2 >> 7) as u8 & 7);
        self.buf.push(a64::fabs_d(dst, src));
        self.advance_pc();
    }

    /// FSIN.X and FCOS.X reg-reg.
    ///
    /// Compute |x|/pi, trim into [0, 2) through the range-trim helper, then
    /// quadrant-dispatch into the polynomial helpers. The final sign of the
    /// sine is taken from the preserved sign of the argument; the cosine is
    /// even and skips that step.
    fn emit_fsincos(&mut self, op2: u16, cosine: bool) {
        let src_reg = (op2 >> 10) as u8 & 7;
        let src = self.ra.map_fp_read(&mut self.buf, src_reg);

        self.buf.push(a64::fabs_d(0, src));
        // The helper calls honor the host calling convention: every dirty
        // guest value goes back to the state record first.
        self.ra.spill_for_call(&mut self.buf);
        let dst = self.ra.map_fp_write(&mut self.buf, (op2 >> 7) as u8 & 7);

        // d0 = |x| / pi.
        self.buf.ldr64_literal(1, pool_address());
        self.buf.push(a64::ldr_d_offset(1, 1, C_1_PI as u32 * 8));
        self.buf.push(a64::fmul_d(0, 0, 1));

        self.buf.ldr64_literal(REG_CALL, trim_address());
        self.buf.push(a64::blr(REG_CALL));

        // Quadrant select on the top half of the trimmed value.
        self.buf.push(a64::fmov_x_from_d(1, 0));
        self.buf.push(a64::lsr64_immed(1, 1, 32));

        // Range 1: [0, 0.5): sin uses the sine table, cos the cosine table.
        self.buf.push(a64::movz(0, 0x3FE0, 1));
        self.buf.push(a64::cmp_reg(1, 0));
        let q2 = self.buf.bcc_forward(Cond::Gt);
        self.emit_poly_call(if cosine { cosine_address() } else { sine_address() });
        self.buf.push(a64::fmov_d(dst, 0));
        let exit_1 = self.buf.b_forward();
        self.buf.bind_here(q2);

        // Range 2: [0.5, 1): sin(x) = cos(x - 0.5), cos(x) = -sin(x - 0.5).
        self.buf.push(a64::movz(0, 0x3FF0, 1));
        self.buf.push(a64::cmp_reg(1, 0));
        let q3 = self.buf.bcc_forward(Cond::Gt);
        self.emit_pool_sub(C_0_5);
        self.emit_poly_call(if cosine { sine_address() } else { cosine_address() });
        self.buf.push(if cosine {
            a64::fneg_d(dst, 0)
        } else {
            a64::fmov_d(dst, 0)
        });
        let exit_2 = self.buf.b_forward();
        self.buf.bind_here(q3);

        // Range 3: [1, 1.5): sin(x) = -sin(x - 1), cos(x) = -cos(x - 1).
        self.buf.push(a64::movz(0, 0x3FF8, 1));
        self.buf.push(a64::cmp_reg(1, 0));
        let q4 = self.buf.bcc_forward(Cond::Gt);
        self.emit_pool_sub(C_10P0);
        self.emit_poly_call(if cosine { cosine_address() } else { sine_address() });
        self.buf.push(a64::fneg_d(dst, 0));
        let exit_3 = self.buf.b_forward();
        self.buf.bind_here(q4);

        // Range 4: [1.5, 2): sin(x) = -sin(x - 1.5), cos(x) = sin(x - 1.5).
        self.emit_pool_sub(C_1_5);
        self.emit_poly_call(sine_address());
        self.buf.push(if cosine {
            a64::fmov_d(dst, 0)
        } else {
            a64::fneg_d(dst, 0)
        });

        self.buf.bind_here(exit_1);
        self.buf.bind_here(exit_2);
        self.buf.bind_here(exit_3);

        if !cosine {
            // sin(-x) = -sin(x): fold the preserved argument sign back in.
            self.buf
                .push(a64::ldr64_offset(1, REG_CTX, CpuState::off_fp(src_reg)));
            let positive = self.buf.tbz_forward(1, 63);
            self.buf.push(a64::fneg_d(dst, dst));
            self.buf.bind_here(positive);
        }
        self.advance_pc();
    }

    /// d0 -= pool[index].
    fn emit_pool_sub(&mut self, index: usize) {
        self.buf.ldr64_literal(0, pool_address());
        self.buf.push(a64::ldr_d_offset(1, 0, index as u32 * 8));
        self.buf.push(a64::fsub_d(0, 0, 1));
    }

    /// Calls an address-stable helper through an inline literal.
    fn emit_poly_call(&mut self, address: u64) {
        self.buf.ldr64_literal(REG_CALL, address);
        self.buf.push(a64::blr(REG_CALL));
    }
}
