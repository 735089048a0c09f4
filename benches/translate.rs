// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Benchmarks for unit translation and cache lookup.
//!
//! Make sure the result of the benchmarked function is used,
//! whether by sending it to black_box, or to return it from the closure.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use m68000_jit::arena::Arena;
use m68000_jit::cache::UnitCache;
use m68000_jit::memory::GuestMemory;
use m68000_jit::translator::Translator;
use m68000_jit::Options;

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut memory = GuestMemory::new(0x1_0000, false);
    // A small straight-line run: MOVEQ, ADDQ.L, NOP, then DBF closing the loop.
    for (i, word) in [0x7001u16, 0x5280, 0x4E71, 0x51C8, 0xFFF8].into_iter().enumerate() {
        memory.set_word(0x1000 + i as u32 * 2, word).unwrap();
    }
    let translator = Translator::new(&Options::default());

    c.bench_function("unit translation", |b| {
        let mut arena = Arena::new(16 << 20).unwrap();
        b.iter(|| {
            let unit = translator
                .translate(&mut arena, black_box(&memory), black_box(0x1000))
                .unwrap();
            let len = unit.frag_len;
            arena.free(unit.fragment, len);
            black_box(unit.code_len);
        });
    });

    c.bench_function("cache hit promotion", |b| {
        let mut arena = Arena::new(16 << 20).unwrap();
        let mut cache = UnitCache::new();
        for pc in (0x1000u32..0x1400).step_by(0x100) {
            let mut unit_memory = GuestMemory::new(0x1_0000, false);
            unit_memory.set_word(pc, 0x4E71).unwrap();
            unit_memory.set_word(pc + 2, 0x4E75).unwrap();
            let unit = translator.translate(&mut arena, &unit_memory, pc).unwrap();
            cache.insert(unit);
        }
        b.iter(|| black_box(cache.find(black_box(0x1200))));
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
