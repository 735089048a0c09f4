// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Motorola 68000 dynamic binary translator for 64-bit ARM hosts.
//!
//! This library executes M68k programs by translating short runs of guest
//! instructions into native host fragments at runtime, caching the results
//! in a directory keyed by guest program counter, and dispatching between
//! them. The guest sees an ordinary 68000-family machine: registers,
//! status register, the three supervisor stacks, a vector table, and an FPU
//! whose values are held as host doubles.
//!
//! # How to use
//!
//! Build a [GuestMemory](memory::GuestMemory), load a program image, create
//! an [Emulator] and run it:
//!
//! ```no_run
//! use m68000_jit::{Emulator, Options};
//! use m68000_jit::memory::GuestMemory;
//!
//! let mut memory = GuestMemory::new(1 << 20, false);
//! // Initial SSP at guest word 0, initial PC at guest word 1.
//! memory.set_long(0, 0x0010_0000).unwrap();
//! memory.set_long(4, 0x0000_1000).unwrap();
//! // Load the program at 0x1000 here.
//!
//! let mut emu = Emulator::new(memory, Options::default()).unwrap();
//! emu.reset();
//! emu.run().unwrap();
//! ```
//!
//! The guest runs until a translated fragment leaves a program counter of
//! zero, the run loop's halt sentinel.
//!
//! Execution requires an AArch64 host; on any other architecture the crate
//! still translates (useful for inspection and tests) but [Emulator::run]
//! refuses to enter generated code.

pub mod aarch64;
pub mod arena;
pub mod cache;
pub mod code_buffer;
pub mod constants;
mod dispatcher;
mod emitter_float;
mod emitter_integer;
pub mod exception;
pub mod memory;
pub mod register_allocator;
pub mod state;
pub mod status_register;
pub mod translator;

use arena::{Arena, DEFAULT_ARENA_SIZE};
use cache::UnitCache;
use memory::GuestMemory;
use state::{CpuState, Cacr, JitControl};
use translator::Translator;

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use thiserror::Error;

/// Unit count the soft flush falls back to when the guest has not set one.
pub const DEFAULT_SOFT_FLUSH_LIMIT: u32 = 4096;

/// Host-side failures. Guest-side failures are not errors; they vector
/// through the guest's own exception table.
#[derive(Debug, Error)]
pub enum JitError {
    /// The arena could not fit a fragment. Recoverable by flushing.
    #[error("JIT arena exhausted ({requested} bytes requested)")]
    ArenaExhausted { requested: usize },
    /// The executable arena could not be mapped at startup.
    #[error("failed to map the JIT arena: {0}")]
    ArenaMap(std::io::Error),
    /// Generated code cannot run on this host architecture.
    #[error("emitted code cannot run on this host architecture")]
    UnsupportedHost,
    /// An exception was raised while pushing an exception frame.
    #[error("double fault: vector {vector} raised while processing an exception")]
    DoubleFault { vector: u8 },
}

/// Options recognized on the supervisor-to-CPU surface.
#[derive(Debug, Default, Clone)]
pub struct Options {
    /// Boot with the guest instruction cache enabled in CACR.
    pub enable_cache: bool,
    /// Clamp mapped RAM at 2 GiB.
    pub limit_2g: bool,
    /// Trap on FPU opcodes instead of emitting them.
    pub nofpu: bool,
    /// Log translation activity.
    pub debug: bool,
    /// Log every translated guest instruction.
    pub disassemble: bool,
    /// The host binary runs its log writer on a dedicated service thread.
    pub async_log: bool,
}

impl Options {
    /// Parses the recognized option words out of a bootargs-style string.
    pub fn from_bootargs(args: &str) -> Self {
        Self {
            enable_cache: args.contains("enable_cache"),
            limit_2g: args.contains("limit_2g"),
            nofpu: args.contains("nofpu"),
            debug: args.contains("debug"),
            disassemble: args.contains("disassemble"),
            async_log: args.contains("async_log"),
        }
    }
}

/// A shared handle raising guest interrupt requests from service threads.
///
/// Updates are atomic; the dispatcher snapshots the pending set once per
/// loop iteration and injects the highest unmasked level.
#[derive(Clone)]
pub struct IrqLine {
    pint: Arc<AtomicU32>,
}

impl IrqLine {
    /// Latches the given IRQ level (1..=7) as pending.
    pub fn raise(&self, level: u8) {
        assert!((1..=7).contains(&level), "bad IRQ level: {level}");
        self.pint
            .fetch_or(1 << level, std::sync::atomic::Ordering::Release);
    }

    /// Snapshot of the pending bitmask, one bit per level.
    pub fn pending(&self) -> u32 {
        self.pint.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// The emulator context: guest state, guest memory, the translation-unit
/// cache, the host-code arena and the translator, threaded explicitly
/// through the dispatcher.
pub struct Emulator {
    /// Authoritative guest state.
    pub state: Box<CpuState>,
    /// Guest RAM.
    pub memory: GuestMemory,
    pub(crate) cache: UnitCache,
    pub(crate) arena: Arena,
    pub(crate) translator: Translator,
    pub(crate) pint: Arc<AtomicU32>,
    /// Last entered guest PC, the dispatcher's lookup-skip fast path.
    pub(crate) last_pc: u32,
    pub(crate) last_handle: Option<u32>,
}

impl Emulator {
    /// Creates an emulator around the given guest memory.
    pub fn new(memory: GuestMemory, opts: Options) -> Result<Self, JitError> {
        let arena = Arena::new(DEFAULT_ARENA_SIZE)?;

        let mut state = Box::new(CpuState::new());
        if opts.enable_cache {
            state.cacr = (Cacr::IE | Cacr::DE).bits();
        }
        state.jit_cache_total = arena.total_size() as u32;
        state.jit_cache_free = arena.free_size() as u32;
        state.jit_soft_thresh = DEFAULT_SOFT_FLUSH_LIMIT;
        state.jit_control = (JitControl::SOFT_FLUSH | JitControl::VERIFY).bits();

        Ok(Self {
            state,
            memory,
            cache: UnitCache::new(),
            arena,
            translator: Translator::new(&opts),
            pint: Arc::new(AtomicU32::new(0)),
            last_pc: u32::MAX,
            last_handle: None,
        })
    }

    /// Applies the boot contract: initial supervisor stack pointer from
    /// guest word 0, initial PC from guest word 1, supervisor mode with
    /// interrupts masked.
    pub fn reset(&mut self) {
        self.state.isp = self.memory.get_long(0).unwrap_or(0);
        self.state.a[7] = self.state.isp;
        self.state.pc = self.memory.get_long(4).unwrap_or(0);
        let mut sr = self.state.status();
        sr.t1 = false;
        sr.t0 = false;
        sr.s = true;
        sr.m = false;
        sr.interrupt_mask = 7;
        self.state.set_status(sr);
    }

    /// An interrupt-request handle for service threads.
    pub fn irq_line(&self) -> IrqLine {
        IrqLine {
            pint: Arc::clone(&self.pint),
        }
    }

    /// Number of live translation units.
    pub fn unit_count(&self) -> usize {
        self.cache.len()
    }

    /// Entries into the unit starting at `pc`, if one is cached.
    pub fn unit_use_count(&self, pc: u32) -> Option<u64> {
        self.cache.peek(pc).map(|h| self.cache.get(h).use_count)
    }

    /// Complete cache purge, the guest cache-disable / invalidate-all hook.
    pub fn hard_flush(&mut self) {
        self.cache.hard_flush(&mut self.arena);
        self.invalidate_fast_path();
        self.state.jit_cache_free = self.arena.free_size() as u32;
        self.state.jit_unit_count = 0;
    }
}
