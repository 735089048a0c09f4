// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dispatcher-level behavior that does not require entering generated code:
//! interrupt injection, trap services and the halt sentinel. Handlers are
//! vectored to guest address zero so the run loop halts right after the
//! side effects under test.

use m68000_jit::memory::GuestMemory;
use m68000_jit::state::{SERVICE_BSR, SERVICE_RTE, SERVICE_RTS};
use m68000_jit::{Emulator, Options};

fn emulator() -> Emulator {
    let memory = GuestMemory::new(0x1_0000, false);
    Emulator::new(memory, Options::default()).unwrap()
}

#[test]
fn halts_on_zero_pc() {
    let mut emu = emulator();
    emu.state.pc = 0;
    emu.run().unwrap();
    assert_eq!(emu.unit_count(), 0, "halt must not translate anything");
}

#[test]
fn unmasked_interrupt_vectors_with_frame_push() {
    let mut emu = emulator();
    // Vector 24 + 5 lives at VBR + (5 + 24) * 4; the handler address of zero
    // doubles as the halt sentinel.
    emu.memory.set_long((5 + 24) * 4, 0).unwrap();

    emu.state.pc = 0x1000;
    emu.state.sr = 0x0300; // User mode, IPM = 3.
    emu.state.a[7] = 0x8000;
    emu.state.usp = 0x8000;
    emu.state.isp = 0x4000;

    let irq = emu.irq_line();
    irq.raise(5);
    irq.raise(2); // Masked by IPM = 3, must stay pending.

    emu.run().unwrap();

    let sr = emu.state.status();
    assert!(sr.s, "interrupt entry must set the supervisor bit");
    assert_eq!(sr.interrupt_mask, 5, "IPM must take the accepted level");

    // Frame format 0 on the interrupt stack: SR, PC, vector-offset word.
    assert_eq!(emu.state.a[7], 0x4000 - 8);
    assert_eq!(emu.state.usp, 0x8000, "USP snapshot of the interrupted code");
    assert_eq!(emu.memory.get_word(0x4000 - 8), Some(0x0300));
    assert_eq!(emu.memory.get_long(0x4000 - 6), Some(0x1000));
    assert_eq!(emu.memory.get_word(0x4000 - 2), Some((5 + 24) * 4));

    assert_eq!(irq.pending(), 1 << 2, "masked level 2 stays latched");
}

#[test]
fn level_seven_is_not_maskable() {
    let mut emu = emulator();
    emu.memory.set_long((7 + 24) * 4, 0).unwrap();

    emu.state.pc = 0x1000;
    emu.state.sr = 0x2700; // Supervisor, IPM = 7.
    emu.state.a[7] = 0x4000;
    emu.state.isp = 0x4000;

    emu.irq_line().raise(7);
    emu.run().unwrap();

    assert_eq!(emu.state.status().interrupt_mask, 7);
    assert_eq!(emu.memory.get_long(0x4000 - 6), Some(0x1000));
}

#[test]
fn rts_service_pops_the_return_address() {
    let mut emu = emulator();
    emu.state.a[7] = 0x2000;
    emu.memory.set_long(0x2000, 0).unwrap(); // Return to the halt sentinel.
    emu.state.pc = 0x1234;
    emu.state.trap = SERVICE_RTS;

    emu.run().unwrap();
    assert_eq!(emu.state.pc, 0);
    assert_eq!(emu.state.a[7], 0x2004);
}

#[test]
fn bsr_service_pushes_the_return_address() {
    let mut emu = emulator();
    emu.state.a[7] = 0x2000;
    emu.state.pc = 0x1238; // Address of the instruction after the BSR.
    emu.state.trap = SERVICE_BSR;
    emu.state.trap_arg = 0; // Subroutine at the halt sentinel.

    emu.run().unwrap();
    assert_eq!(emu.state.a[7], 0x1FFC);
    assert_eq!(emu.memory.get_long(0x1FFC), Some(0x1238));
}

#[test]
fn rte_service_unwinds_the_frame_and_switches_stacks() {
    let mut emu = emulator();
    // Format-0 frame at the supervisor stack: SR, PC, vector-offset word.
    emu.state.a[7] = 0x7000;
    emu.memory.set_word(0x7000, 0x0000).unwrap(); // User-mode SR.
    emu.memory.set_long(0x7002, 0).unwrap(); // Return to the halt sentinel.
    emu.memory.set_word(0x7006, 0x0074).unwrap();
    emu.state.usp = 0x9000;
    emu.state.sr = 0x2700;
    emu.state.pc = 0x1000;
    emu.state.trap = SERVICE_RTE;

    emu.run().unwrap();

    assert!(!emu.state.status().s);
    assert_eq!(emu.state.pc, 0);
    assert_eq!(emu.state.isp, 0x7008, "popped supervisor stack is banked");
    assert_eq!(emu.state.a[7], 0x9000, "A7 follows the user bank");
}

#[test]
fn rte_in_user_mode_is_a_privilege_violation() {
    let mut emu = emulator();
    emu.memory.set_long(8 * 4, 0).unwrap(); // Privilege-violation handler.
    emu.state.sr = 0x0000;
    emu.state.a[7] = 0x8000;
    emu.state.usp = 0x8000;
    emu.state.isp = 0x4000;
    emu.state.pc = 0x1000;
    emu.state.trap = SERVICE_RTE;

    emu.run().unwrap();
    assert!(emu.state.status().s);
    assert_eq!(emu.memory.get_long(0x4000 - 6), Some(0x1000));
    assert_eq!(emu.memory.get_word(0x4000 - 2), Some(8 * 4));
}

#[test]
fn guest_trap_vectors_through_the_table() {
    let mut emu = emulator();
    // TRAP #2 uses vector 34.
    emu.memory.set_long(34 * 4, 0).unwrap();
    emu.state.pc = 0x1002;
    emu.state.sr = 0x0000;
    emu.state.a[7] = 0x8000;
    emu.state.usp = 0x8000;
    emu.state.isp = 0x4000;
    emu.state.trap = 34;

    emu.run().unwrap();
    assert!(emu.state.status().s);
    // The pushed PC is the one the fragment recorded.
    assert_eq!(emu.memory.get_long(0x4000 - 6), Some(0x1002));
    assert_eq!(emu.memory.get_word(0x4000 - 2), Some(34 * 4));
}

#[test]
fn reset_applies_the_boot_contract() {
    let mut memory = GuestMemory::new(0x1000, false);
    memory.set_long(0, 0x0000_0F00).unwrap();
    memory.set_long(4, 0x0000_0400).unwrap();
    let mut emu = Emulator::new(memory, Options::default()).unwrap();
    emu.reset();

    assert_eq!(emu.state.isp, 0xF00);
    assert_eq!(emu.state.a[7], 0xF00);
    assert_eq!(emu.state.pc, 0x400);
    let sr = emu.state.status();
    assert!(sr.s);
    assert_eq!(sr.interrupt_mask, 7);
}

#[test]
fn options_parse_from_bootargs() {
    let opts = Options::from_bootargs("enable_cache nofpu async_log");
    assert!(opts.enable_cache && opts.nofpu && opts.async_log);
    assert!(!opts.limit_2g && !opts.debug && !opts.disassemble);

    let memory = GuestMemory::new(0x1000, false);
    let emu = Emulator::new(memory, opts).unwrap();
    assert!(emu.state.icache_enabled());
}
