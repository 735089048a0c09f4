// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Append-only host-code buffer.
//!
//! Emitters append instruction words through a cursor; forward branches are
//! recorded in a side table and patched once their destination is known, so
//! the emitted stream contains only executable words. 64-bit immediates are
//! gathered into a trailing literal pool addressed by PC-relative loads.

use crate::aarch64 as a64;
use crate::aarch64::Cond;

/// A resolved position in the instruction stream, in words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

/// Handle of a pending branch awaiting its destination.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a pending branch must be bound to a destination"]
pub struct PendingBranch {
    at: usize,
    kind: FixupKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FixupKind {
    /// 26-bit word offset at bit 0.
    B,
    /// 19-bit word offset at bit 5.
    Imm19,
    /// 14-bit word offset at bit 5.
    Imm14,
}

/// Append-only cursor over a host-code fragment under construction.
pub struct CodeBuffer {
    words: Vec<u32>,
    capacity: usize,
    pending: usize,
    literals: Vec<u64>,
    lit_refs: Vec<(usize, usize)>,
}

impl CodeBuffer {
    /// A new buffer bounded to `capacity` words, literal pool included.
    pub fn new(capacity: usize) -> Self {
        Self {
            words: Vec::new(),
            capacity,
            pending: 0,
            literals: Vec::new(),
            lit_refs: Vec::new(),
        }
    }

    /// Words remaining before the buffer is full, counting the literal pool
    /// and its alignment padding.
    pub fn remaining_words(&self) -> usize {
        self.capacity
            .saturating_sub(self.words.len() + 2 * self.literals.len() + 1)
    }

    /// Current length of the instruction stream in words.
    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    /// Appends one native word.
    pub fn push(&mut self, insn: u32) {
        assert!(self.remaining_words() > 0, "host-code buffer overflow");
        self.words.push(insn);
    }

    /// The position the next word will be emitted at.
    pub fn here(&self) -> Label {
        Label(self.words.len())
    }

    /// Emits an unconditional branch to an already known destination.
    pub fn b_to(&mut self, target: Label) {
        let delta = target.0 as i32 - self.words.len() as i32;
        self.push(a64::b(delta));
    }

    /// Emits an unconditional branch with a pending destination.
    pub fn b_forward(&mut self) -> PendingBranch {
        let at = self.words.len();
        self.push(a64::b(0));
        self.pending += 1;
        PendingBranch { at, kind: FixupKind::B }
    }

    /// Emits a conditional branch with a pending destination.
    pub fn bcc_forward(&mut self, cond: Cond) -> PendingBranch {
        let at = self.words.len();
        self.push(a64::b_cc(cond, 0));
        self.pending += 1;
        PendingBranch { at, kind: FixupKind::Imm19 }
    }

    /// Emits a compare-and-branch-if-zero with a pending destination.
    pub fn cbz_forward(&mut self, rt: u8) -> PendingBranch {
        let at = self.words.len();
        self.push(a64::cbz(rt, 0));
        self.pending += 1;
        PendingBranch { at, kind: FixupKind::Imm19 }
    }

    /// Emits a test-bit-and-branch-if-zero with a pending destination.
    pub fn tbz_forward(&mut self, rt: u8, bit: u8) -> PendingBranch {
        let at = self.words.len();
        self.push(a64::tbz(rt, bit, 0));
        self.pending += 1;
        PendingBranch { at, kind: FixupKind::Imm14 }
    }

    /// Patches a pending branch to land at `target`.
    pub fn bind(&mut self, branch: PendingBranch, target: Label) {
        let delta = target.0 as i32 - branch.at as i32;
        let (bits, shift) = match branch.kind {
            FixupKind::B => (26, 0),
            FixupKind::Imm19 => (19, 5),
            FixupKind::Imm14 => (14, 5),
        };
        let limit = 1i32 << (bits - 1);
        assert!(
            (-limit..limit).contains(&delta),
            "branch fixup out of range: {delta} words"
        );
        self.words[branch.at] |= ((delta as u32) & ((1 << bits) - 1)) << shift;
        self.pending -= 1;
    }

    /// Patches a pending branch to land at the current cursor.
    pub fn bind_here(&mut self, branch: PendingBranch) {
        let target = self.here();
        self.bind(branch, target);
    }

    /// Emits `LDR Xt, <literal>` against a slot of the trailing pool holding
    /// the given 64-bit value. Equal values share one slot.
    pub fn ldr64_literal(&mut self, rt: u8, value: u64) {
        let index = match self.literals.iter().position(|&v| v == value) {
            Some(index) => index,
            None => {
                self.literals.push(value);
                self.literals.len() - 1
            }
        };
        let at = self.words.len();
        self.push(a64::ldr64_literal(rt, 0));
        self.lit_refs.push((at, index));
    }

    /// Resolves the literal pool and returns the finished word stream,
    /// instruction words first, pool last.
    ///
    /// Panics if a pending branch was never bound.
    pub fn finish(mut self) -> Vec<u32> {
        assert_eq!(self.pending, 0, "unbound pending branch in emitted stream");

        // The pool is 8-aligned relative to the fragment start.
        if self.words.len() % 2 != 0 {
            self.words.push(a64::nop());
        }
        let pool = self.words.len();
        for &value in &self.literals {
            self.words.push(value as u32);
            self.words.push((value >> 32) as u32);
        }
        for &(at, index) in &self.lit_refs {
            let delta = (pool + 2 * index) as i32 - at as i32;
            assert!((-(1 << 18)..1 << 18).contains(&delta));
            self.words[at] |= ((delta as u32) & 0x7_FFFF) << 5;
        }
        self.words
    }
}
