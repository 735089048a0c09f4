// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use m68000_jit::status_register::{StatusRegister, SR_MASK};

#[test]
fn status_register() {
    for raw in 0..=u16::MAX {
        assert_eq!(u16::from(StatusRegister::from(raw)), raw & SR_MASK);

        let sr = StatusRegister::from(raw);
        assert_eq!(sr.ccr() as u16, raw & 0x1F);

        assert_eq!(sr.condition(0), true, "condition(0) for {raw:#X}");
        assert_eq!(sr.condition(1), false, "condition(1) for {raw:#X}");
        assert_eq!(sr.condition(2), raw & 0b0101 == 0, "condition(2) for {raw:#X}");
        assert_eq!(sr.condition(3), raw & 0b0101 != 0, "condition(3) for {raw:#X}");
        assert_eq!(sr.condition(4), raw & 0b0001 == 0, "condition(4) for {raw:#X}");
        assert_eq!(sr.condition(5), raw & 0b0001 != 0, "condition(5) for {raw:#X}");
        assert_eq!(sr.condition(6), raw & 0b0100 == 0, "condition(6) for {raw:#X}");
        assert_eq!(sr.condition(7), raw & 0b0100 != 0, "condition(7) for {raw:#X}");
        assert_eq!(sr.condition(8), raw & 0b0010 == 0, "condition(8) for {raw:#X}");
        assert_eq!(sr.condition(9), raw & 0b0010 != 0, "condition(9) for {raw:#X}");
        assert_eq!(sr.condition(10), raw & 0b1000 == 0, "condition(10) for {raw:#X}");
        assert_eq!(sr.condition(11), raw & 0b1000 != 0, "condition(11) for {raw:#X}");
        assert_eq!(
            sr.condition(12),
            raw & 0b1010 == 0b1010 || raw & 0b1010 == 0,
            "condition(12) for {raw:#X}"
        );
        assert_eq!(
            sr.condition(13),
            raw & 0b1010 == 0b1000 || raw & 0b1010 == 0b0010,
            "condition(13) for {raw:#X}"
        );
        assert_eq!(
            sr.condition(14),
            raw & 0b1110 == 0b1010 || raw & 0b1110 == 0,
            "condition(14) for {raw:#X}"
        );
        assert_eq!(
            sr.condition(15),
            raw & 0b0100 != 0 || raw & 0b1010 == 0b1000 || raw & 0b1010 == 0b0010,
            "condition(15) for {raw:#X}"
        );
    }
}

#[test]
fn set_ccr_leaves_system_byte() {
    let mut sr = StatusRegister::from(0x2700);
    sr.set_ccr(0x001F);
    assert_eq!(u16::from(sr), 0x271F);
    sr.set_ccr(0);
    assert_eq!(u16::from(sr), 0x2700);
}

#[test]
fn master_and_trace_bits() {
    let sr = StatusRegister::from(0xF000);
    assert!(sr.t1 && sr.t0 && sr.s && sr.m);
    let sr = StatusRegister::from(0x2000);
    assert!(sr.s && !sr.m);
}
