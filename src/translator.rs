// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation of guest instruction runs into host-code fragments.
//!
//! A unit covers one straight-line run of guest instructions ending at a
//! control-transfer boundary. The builder emits into a temporary buffer;
//! the finished stream is copied behind a fragment header into the arena and
//! made visible to instruction fetch before anyone may enter it.
//!
//! Fragments are entered with the state base in the first argument register.
//! The prologue moves it into its long-lived home and loads the guest SR;
//! the epilogue writes the SR back and returns to the dispatcher.

use crate::aarch64 as a64;
use crate::arena::{flush_icache, Arena};
use crate::cache::fingerprint;
use crate::code_buffer::CodeBuffer;
use crate::exception::Vector;
use crate::memory::GuestMemory;
use crate::register_allocator::{RegisterAllocator, REG_CTX, REG_SR};
use crate::state::CpuState;
use crate::JitError;
use crate::Options;

use std::ptr::NonNull;

/// Bytes of the fragment header: starting guest PC, fetched guest-word
/// count, native code byte length, one pad word. Entry is right behind it.
pub const FRAGMENT_HEADER_BYTES: usize = 16;

/// Capacity of the emission buffer, in words.
const UNIT_CAPACITY_WORDS: usize = 2048;
/// Worst-case expansion of one emitted instruction group, in words. The
/// builder stops fetching when less than this remains.
const WORST_CASE_WORDS: usize = 128;
/// Upper bound of guest instructions gathered into one unit.
const MAX_UNIT_INSNS: usize = 64;

/// A finished fragment, ready to be indexed by the cache.
pub struct InstalledUnit {
    /// The fragment, header included.
    pub fragment: NonNull<u8>,
    /// Allocated fragment length in bytes.
    pub frag_len: usize,
    /// Starting guest PC.
    pub pc: u32,
    /// Guest words consumed.
    pub word_count: u32,
    /// Native code byte length, header and literal pool excluded.
    pub code_len: u32,
    /// Fingerprint of the consumed guest words.
    pub fingerprint: u32,
}

/// The guest-to-host translator.
pub struct Translator {
    nofpu: bool,
    log_instructions: bool,
}

impl Translator {
    pub fn new(opts: &Options) -> Self {
        Self {
            nofpu: opts.nofpu,
            log_instructions: opts.debug || opts.disassemble,
        }
    }

    /// Builds, installs and finalizes the translation unit starting at `pc`.
    pub fn translate(
        &self,
        arena: &mut Arena,
        memory: &GuestMemory,
        pc: u32,
    ) -> Result<InstalledUnit, JitError> {
        log::debug!("translating unit at {pc:#010X}");

        let mut b = UnitBuilder::new(pc, self.nofpu);
        b.emit_prologue();

        let mut insns = 0;
        while !b.terminated && insns < MAX_UNIT_INSNS && b.buf.remaining_words() >= WORST_CASE_WORDS
        {
            if b.pc & 1 != 0 {
                b.emit_trap(Vector::AddressError as u32, b.pc);
                break;
            }
            let Some(opcode) = memory.code_word(b.pc) else {
                b.emit_trap(Vector::AccessError as u32, b.pc);
                break;
            };
            if self.log_instructions {
                log::trace!("{:#010X}: {opcode:04X}", b.pc);
            }

            b.cursor = b.pc.wrapping_add(2);
            match opcode >> 12 {
                0x4 => b.emit_line4(opcode),
                0x5 => b.emit_line5(memory, opcode),
                0x6 => b.emit_line6(memory, opcode),
                0x7 => b.emit_line7(opcode),
                0xA => b.emit_trap(Vector::LineAEmulator as u32, b.pc),
                0xF => b.emit_line_f(memory, opcode),
                _ => b.emit_illegal(),
            }
            insns += 1;
        }

        let word_count = b.cursor_words();
        if !b.terminated {
            // Straight-line end of unit, continue at the next instruction.
            b.emit_store_pc(b.pc);
        }
        b.ra.spill_all(&mut b.buf);
        b.emit_epilogue();

        let code = b.buf.finish();
        let print = unit_fingerprint(memory, pc, word_count);
        install(arena, pc, word_count, print, &code)
    }
}

fn unit_fingerprint(memory: &GuestMemory, pc: u32, word_count: u32) -> u32 {
    let words: Vec<u16> = (0..word_count)
        .map(|i| memory.code_word(pc.wrapping_add(i * 2)).unwrap_or(0))
        .collect();
    fingerprint(&words)
}

fn install(
    arena: &mut Arena,
    pc: u32,
    word_count: u32,
    print: u32,
    code: &[u32],
) -> Result<InstalledUnit, JitError> {
    let frag_len = FRAGMENT_HEADER_BYTES + code.len() * 4;
    let fragment = arena.alloc(frag_len)?;

    unsafe {
        let header = fragment.as_ptr().cast::<u32>();
        header.write(pc);
        header.add(1).write(word_count);
        header.add(2).write(code.len() as u32 * 4);
        header.add(3).write(0);
        std::ptr::copy_nonoverlapping(
            code.as_ptr(),
            header.add(FRAGMENT_HEADER_BYTES / 4),
            code.len(),
        );
    }
    flush_icache(fragment.as_ptr(), frag_len);

    Ok(InstalledUnit {
        fragment,
        frag_len,
        pc,
        word_count,
        code_len: code.len() as u32 * 4,
        fingerprint: print,
    })
}

/// Emission context of one unit under construction.
pub(crate) struct UnitBuilder {
    pub buf: CodeBuffer,
    pub ra: RegisterAllocator,
    /// Starting guest PC of the unit.
    pub start_pc: u32,
    /// Address of the instruction currently being emitted.
    pub pc: u32,
    /// Address of the next unfetched guest word.
    pub cursor: u32,
    /// Set by terminator emitters; the unit ends after them.
    pub terminated: bool,
    pub nofpu: bool,
}

impl UnitBuilder {
    fn new(pc: u32, nofpu: bool) -> Self {
        Self {
            buf: CodeBuffer::new(UNIT_CAPACITY_WORDS),
            ra: RegisterAllocator::new(),
            start_pc: pc,
            pc,
            cursor: pc,
            terminated: false,
            nofpu,
        }
    }

    fn cursor_words(&self) -> u32 {
        self.cursor.wrapping_sub(self.start_pc) / 2
    }

    /// Fetches the next extension word.
    pub(crate) fn next_word(&mut self, memory: &GuestMemory) -> Option<u16> {
        let word = memory.code_word(self.cursor)?;
        self.cursor = self.cursor.wrapping_add(2);
        Some(word)
    }

    /// The shared advance-PC helper: commits the consumed guest words to the
    /// PC expression. Accumulation is deferred, no code is emitted; exits
    /// materialize the accumulated value.
    pub(crate) fn advance_pc(&mut self) {
        self.pc = self.cursor;
    }

    fn emit_prologue(&mut self) {
        self.buf.push(a64::stp64_preindex(29, 30, 31, -32));
        self.buf.push(a64::stp64_offset(REG_CTX, REG_SR, 31, 16));
        self.buf.push(a64::add64_immed(29, 31, 0));
        self.buf.push(a64::mov64_reg(REG_CTX, 0));
        self.buf
            .push(a64::ldrh_offset(REG_SR, REG_CTX, CpuState::OFF_SR));
    }

    fn emit_epilogue(&mut self) {
        self.buf
            .push(a64::strh_offset(REG_SR, REG_CTX, CpuState::OFF_SR));
        self.buf.push(a64::ldp64_offset(REG_CTX, REG_SR, 31, 16));
        self.buf.push(a64::ldp64_postindex(29, 30, 31, 32));
        self.buf.push(a64::ret());
    }

    /// Materializes a 32-bit constant into a host register. Uses no
    /// allocator state.
    pub(crate) fn emit_mov32(&mut self, rd: u8, value: u32) {
        let lo = value & 0xFFFF;
        let hi = value >> 16;
        if hi == 0 {
            self.buf.push(a64::movz(rd, lo, 0));
        } else if lo == 0 {
            self.buf.push(a64::movz(rd, hi, 1));
        } else {
            self.buf.push(a64::movz(rd, lo, 0));
            self.buf.push(a64::movk(rd, hi, 1));
        }
    }

    /// Stores a constant guest PC into the state record, through w0.
    pub(crate) fn emit_store_pc(&mut self, value: u32) {
        self.emit_mov32(0, value);
        self.buf.push(a64::str_offset(0, REG_CTX, CpuState::OFF_PC));
    }

    /// Stores a pending trap or service code into the state record.
    pub(crate) fn emit_store_trap(&mut self, code: u32) {
        self.emit_mov32(0, code);
        self.buf
            .push(a64::str_offset(0, REG_CTX, CpuState::OFF_TRAP));
    }

    /// Stores the service argument cell.
    pub(crate) fn emit_store_trap_arg(&mut self, value: u32) {
        self.emit_mov32(0, value);
        self.buf
            .push(a64::str_offset(0, REG_CTX, CpuState::OFF_TRAP_ARG));
    }

    /// The undefined-instruction guard and the guest exception emitters:
    /// record the vector and the faulting PC, then surface at the dispatcher.
    pub(crate) fn emit_trap(&mut self, vector: u32, at_pc: u32) {
        self.emit_store_trap(vector);
        self.emit_store_pc(at_pc);
        self.terminated = true;
    }

    /// Unrecognized opcode: the guard traps through the illegal vector.
    pub(crate) fn emit_illegal(&mut self) {
        self.emit_trap(Vector::IllegalInstruction as u32, self.pc);
    }
}
