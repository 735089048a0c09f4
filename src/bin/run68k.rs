// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal host around the translator, used to run raw test images.
//! It also demonstrate how to use this library in Rust projects.
//!
//! Usage: `run68k <image> [bootargs]`
//!
//! The image is loaded at guest address 0 and must start with the reset
//! vectors: initial supervisor stack pointer, then initial PC. Recognized
//! bootargs words are the supervisor options, e.g.
//! `"enable_cache nofpu debug"`.

use m68000_jit::memory::GuestMemory;
use m68000_jit::status_register::StatusRegister;
use m68000_jit::{Emulator, Options};

use std::fs;

/// RAM given to the guest when the image does not dictate more.
const RAM_SIZE: usize = 16 << 20;

fn main() {
    let mut args = std::env::args().skip(1);
    let Some(image_path) = args.next() else {
        eprintln!("usage: run68k <image> [bootargs]");
        std::process::exit(2);
    };
    let bootargs = args.next().unwrap_or_default();
    let opts = Options::from_bootargs(&bootargs);

    let mut builder = env_logger::Builder::from_default_env();
    if opts.debug || opts.disassemble {
        builder.filter_level(log::LevelFilter::Trace);
    }
    // The env_logger sink writes on the caller's thread; with async_log the
    // guest thread is kept free of formatting.
    builder.init();

    let image = match fs::read(&image_path) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("run68k: cannot read {image_path}: {err}");
            std::process::exit(1);
        }
    };

    let mut memory = GuestMemory::new(RAM_SIZE.max(image.len()), opts.limit_2g);
    memory.load_image(0, &image);

    let mut emu = match Emulator::new(memory, opts.clone()) {
        Ok(emu) => emu,
        Err(err) => {
            eprintln!("run68k: {err}");
            std::process::exit(1);
        }
    };
    emu.reset();

    log::info!(
        "entering guest at {:#010X}, ssp {:#010X}",
        emu.state.pc,
        emu.state.isp
    );

    let result = if opts.async_log {
        let guest = std::thread::spawn(move || {
            let r = emu.run();
            (emu, r)
        });
        let (returned, r) = guest.join().expect("guest thread panicked");
        emu = returned;
        r
    } else {
        emu.run()
    };

    match result {
        Ok(()) => print_context(&emu),
        Err(err) => {
            eprintln!("run68k: {err}");
            std::process::exit(1);
        }
    }
}

fn print_context(emu: &Emulator) {
    let state = &emu.state;
    for (i, d) in state.d.iter().enumerate() {
        print!("    D{i} = {d:#010X}");
        if i % 4 == 3 {
            println!();
        }
    }
    for (i, a) in state.a.iter().enumerate() {
        print!("    A{i} = {a:#010X}");
        if i % 4 == 3 {
            println!();
        }
    }
    let sr = StatusRegister::from(state.sr);
    println!(
        "    PC = {:#010X}    SR = {:#06X} (S={} M={} IPM={})",
        state.pc, state.sr, sr.s as u8, sr.m as u8, sr.interrupt_mask
    );
    println!(
        "    USP= {:#010X}    ISP= {:#010X}    MSP= {:#010X}",
        state.usp, state.isp, state.msp
    );
    println!(
        "    JIT: {} units, {}/{} bytes free",
        state.jit_unit_count, state.jit_cache_free, state.jit_cache_total
    );
}
