// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios entering generated code; host hardware only.

#![cfg(target_arch = "aarch64")]

use m68000_jit::memory::GuestMemory;
use m68000_jit::{Emulator, Options};

const PROGRAM_BASE: u32 = 0x1000;
const STACK_TOP: u32 = 0x8000;

/// Assembles `words` at the program base, appends a BRA.W to guest address
/// zero (the halt sentinel) and runs to completion.
fn run_program(words: &[u16], opts: Options, setup: impl FnOnce(&mut Emulator)) -> Emulator {
    let mut memory = GuestMemory::new(0x1_0000, false);
    memory.set_long(0, STACK_TOP).unwrap();
    memory.set_long(4, PROGRAM_BASE).unwrap();

    let mut pc = PROGRAM_BASE;
    for &word in words {
        memory.set_word(pc, word).unwrap();
        pc += 2;
    }
    memory.set_word(pc, 0x6000).unwrap(); // BRA.W to 0.
    memory.set_word(pc + 2, 0u32.wrapping_sub(pc + 2) as u16).unwrap();

    let mut emu = Emulator::new(memory, opts).unwrap();
    emu.reset();
    setup(&mut emu);
    emu.run().unwrap();
    emu
}

fn ulp_distance(a: f64, b: f64) -> u64 {
    (a.to_bits() as i64 - b.to_bits() as i64).unsigned_abs()
}

#[test]
fn dbf_iterates_count_plus_one_times() {
    // DBF D0, <self>: with D0.low16 = 3 the loop body runs exactly 4 times
    // and exits with the counter wrapped to 0xFFFF, high half untouched.
    let emu = run_program(&[0x51C8, 0xFFFE], Options::default(), |emu| {
        emu.state.d[0] = 0x7FFF_0003;
    });
    assert_eq!(emu.state.d[0], 0x7FFF_FFFF);
}

#[test]
fn dbt_executes_zero_times() {
    let emu = run_program(&[0x50C8, 0xFFFE], Options::default(), |emu| {
        emu.state.d[0] = 5;
    });
    assert_eq!(emu.state.d[0], 5, "DBT must not touch the counter");
}

#[test]
fn fmovecr_loads_pi_bit_equal() {
    // FMOVECR #0x00, FP0.
    let emu = run_program(&[0xF200, 0x5C00], Options::default(), |_| {});
    assert_eq!(emu.state.fp[0].to_bits(), std::f64::consts::PI.to_bits());
}

#[test]
fn fmovecr_zero_selector() {
    // FMOVECR #0x0F, FP3.
    let emu = run_program(&[0xF200, 0x5D8F], Options::default(), |emu| {
        emu.state.fp[3] = 42.0;
    });
    assert_eq!(emu.state.fp[3].to_bits(), 0);
}

fn fsin_of(x: f64) -> f64 {
    // FSIN FP1 -> FP0.
    let emu = run_program(&[0xF200, 0x040E], Options::default(), |emu| {
        emu.state.fp[1] = x;
    });
    emu.state.fp[0]
}

#[test]
fn fsin_signed_zero() {
    assert_eq!(fsin_of(0.0).to_bits(), 0.0f64.to_bits());
    assert_eq!(fsin_of(-0.0).to_bits(), (-0.0f64).to_bits());
}

#[test]
fn fsin_of_pi_is_tiny() {
    assert!(fsin_of(std::f64::consts::PI).abs() < (2.0f64).powi(-50));
}

#[test]
fn fsin_of_half_pi_is_one() {
    assert!(ulp_distance(fsin_of(std::f64::consts::FRAC_PI_2), 1.0) <= 1);
    assert!(ulp_distance(fsin_of(-std::f64::consts::FRAC_PI_2), -1.0) <= 1);
}

#[test]
fn fsin_covers_all_quadrants() {
    for (x, expected) in [
        (1.0, 1.0f64.sin()),
        (2.5, 2.5f64.sin()),
        (4.0, 4.0f64.sin()),
        (5.5, 5.5f64.sin()),
        (-2.5, (-2.5f64).sin()),
    ] {
        let got = fsin_of(x);
        assert!(
            (got - expected).abs() < 1e-9,
            "fsin({x}) = {got}, expected {expected}"
        );
    }
}

#[test]
fn fcos_basics() {
    // FCOS FP1 -> FP0.
    let run = |x: f64| {
        run_program(&[0xF200, 0x041D], Options::default(), |emu| {
            emu.state.fp[1] = x;
        })
        .state
        .fp[0]
    };
    assert!(ulp_distance(run(0.0), 1.0) <= 1);
    assert!(run(std::f64::consts::FRAC_PI_2).abs() < (2.0f64).powi(-50));
    for x in [1.0, 2.5, 4.0, 5.5, -1.0] {
        assert!((run(x) - x.cos()).abs() < 1e-9, "fcos({x})");
    }
}

#[test]
fn fabs_reg_reg() {
    // FABS FP2 -> FP4.
    let emu = run_program(&[0xF200, 0x0A18], Options::default(), |emu| {
        emu.state.fp[2] = -3.75;
    });
    assert_eq!(emu.state.fp[4], 3.75);
}

#[test]
fn tight_loop_reuses_one_unit_hundred_times() {
    // 100 trips through one translated loop unit.
    let mut emu = run_program(&[0x51C8, 0xFFFE], Options::default(), |emu| {
        emu.state.d[0] = 99;
    });
    assert_eq!(emu.unit_use_count(PROGRAM_BASE), Some(100));

    // After a hard flush, re-executing rebuilds exactly one unit for the
    // loop with a fresh use count of 100.
    emu.hard_flush();
    assert_eq!(emu.unit_count(), 0);
    emu.reset();
    emu.state.d[0] = 99;
    emu.run().unwrap();
    assert_eq!(emu.unit_use_count(PROGRAM_BASE), Some(100));
    assert_eq!(emu.unit_count(), 2, "the loop unit and its exit unit");
}

#[test]
fn enable_cache_fast_path_is_equivalent() {
    let opts = Options::from_bootargs("enable_cache");
    let emu = run_program(&[0x51C8, 0xFFFE], opts, |emu| {
        emu.state.d[0] = 0x0003_0009;
    });
    assert_eq!(emu.state.d[0], 0x0003_FFFF);
}

#[test]
fn moveq_and_scc() {
    let emu = run_program(
        &[
            0x7000, // MOVEQ #0, D0: sets Z.
            0x56C1, // SNE D1: false, low byte cleared.
            0x57C2, // SEQ D2: true, low byte set.
        ],
        Options::default(),
        |emu| {
            emu.state.d[1] = 0x1234_5678;
            emu.state.d[2] = 0x1234_5678;
        },
    );
    assert_eq!(emu.state.d[0], 0);
    assert_eq!(emu.state.d[1], 0x1234_5600);
    assert_eq!(emu.state.d[2], 0x1234_56FF);
    assert!(emu.state.status().z);
}

#[test]
fn moveq_sign_extends_and_sets_n() {
    let emu = run_program(&[0x74FF], Options::default(), |_| {});
    assert_eq!(emu.state.d[2], 0xFFFF_FFFF);
    let sr = emu.state.status();
    assert!(sr.n && !sr.z && !sr.v && !sr.c);
}

#[test]
fn addq_word_keeps_high_half_and_sets_carry() {
    // ADDQ.W #5, D0 with D0.low16 = 0xFFFE wraps to 0x0003.
    let emu = run_program(&[0x5A40], Options::default(), |emu| {
        emu.state.d[0] = 0x0001_FFFE;
    });
    assert_eq!(emu.state.d[0], 0x0001_0003);
    let sr = emu.state.status();
    assert!(sr.c && sr.x && !sr.z && !sr.n && !sr.v);
}

#[test]
fn subq_long_borrow() {
    // SUBQ.L #1, D1 on zero.
    let emu = run_program(&[0x5381], Options::default(), |emu| {
        emu.state.d[1] = 0;
    });
    assert_eq!(emu.state.d[1], 0xFFFF_FFFF);
    let sr = emu.state.status();
    assert!(sr.c && sr.x && sr.n && !sr.z && !sr.v);
}

#[test]
fn quick_arithmetic_on_address_register_skips_flags() {
    // MOVEQ #0, D0 sets Z; SUBQ.L #8, A1 must leave it alone.
    let emu = run_program(&[0x7000, 0x5189], Options::default(), |emu| {
        emu.state.a[1] = 10;
    });
    assert_eq!(emu.state.a[1], 2);
    assert!(emu.state.status().z, "address arithmetic must not touch CCR");
}

#[test]
fn bcc_takes_and_falls_through() {
    let emu = run_program(
        &[
            0x7000, // MOVEQ #0, D0: Z set.
            0x6702, // BEQ.S +2: skip the next instruction.
            0x7001, // MOVEQ #1, D0 (skipped).
            0x7A05, // MOVEQ #5, D5.
        ],
        Options::default(),
        |_| {},
    );
    assert_eq!(emu.state.d[0], 0);
    assert_eq!(emu.state.d[5], 5);
}

#[test]
fn bsr_and_rts_roundtrip() {
    let emu = run_program(
        &[
            0x6104, // 0x1000 BSR.S 0x1006, pushes 0x1002.
            0x6000, // 0x1002 BRA.W to halt...
            0xEFFC, //        ...at guest 0.
            0x7A07, // 0x1006 MOVEQ #7, D5.
            0x4E75, // 0x1008 RTS.
        ],
        Options::default(),
        |_| {},
    );
    assert_eq!(emu.state.d[5], 7);
    assert_eq!(emu.state.a[7], STACK_TOP, "stack must balance");
}

#[test]
fn trap_instruction_vectors() {
    // TRAP #2 through vector 34; the null handler halts.
    let emu = run_program(&[0x4E42], Options::default(), |_| {});
    assert!(emu.state.status().s);
    assert_eq!(emu.state.a[7], STACK_TOP - 8);
    assert_eq!(emu.memory.get_long(STACK_TOP - 6), Some(PROGRAM_BASE + 2));
    assert_eq!(emu.memory.get_word(STACK_TOP - 2), Some(34 * 4));
}

#[test]
fn self_modified_loop_is_retranslated() {
    // Run a NOP; the guest then rewrites it to MOVEQ and re-enters.
    let mut emu = run_program(&[0x4E71], Options::default(), |_| {});
    assert_eq!(emu.state.d[3], 0);

    emu.memory.set_word(PROGRAM_BASE, 0x7609).unwrap(); // MOVEQ #9, D3.
    emu.reset();
    emu.run().unwrap();
    assert_eq!(emu.state.d[3], 9, "stale unit survived a guest write");
}
