//! Integration tests that boot firmware images through the whole core:
//! BAM scan, TLB setup, instruction execution, exception dispatch and the
//! watchdog escalation path.

use crate::cpu::decode::OpKind;
use crate::exc::{ExcKind, ExternalSource, ResetSource};
use crate::ihex;
use crate::mmu::PageSize;
use crate::periph::flash::FlashDevice;
use crate::regs::{msr_bits, spr};
use crate::{Config, Core, Exception};

// BookE encodings used by the test firmware
const ADDI_R3_5: u32 = 0x3860_0005;
const ADDI_R4_7: u32 = 0x3880_0007;
const ADD_R5_R3_R4: u32 = 0x7CA3_2214;
const ADDIS_R6_0X4000: u32 = 0x3CC0_4000;
const STW_R5_0_R6: u32 = 0x90A6_0000;
const B_SELF: u32 = 0x4800_0000;
const SC: u32 = 0x4400_0002;
const NOP: u32 = 0x6000_0000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build a core whose flash carries a BookE RCHW at offset 0 pointing at
/// `entry`, with `prog` placed there.
fn boot_core(entry: u32, prog: &[u32]) -> Core {
    init_logging();
    let mut core = Core::new(Config { test_mode: true, ..Config::default() });
    let mut rchw = vec![0x00, 0x5A, 0x00, 0x00];
    rchw.extend_from_slice(&entry.to_be_bytes());
    core.flash.load(FlashDevice::Main, &rchw, 0);

    let mut bytes = Vec::new();
    for w in prog {
        bytes.extend_from_slice(&w.to_be_bytes());
    }
    core.flash.load(FlashDevice::Main, &bytes, entry as usize);
    core.reset();
    core
}

#[test]
fn test_bam_happy_path_booke() {
    init_logging();
    let mut core = Core::new(Config { test_mode: true, ..Config::default() });
    core.flash.load(
        FlashDevice::Main,
        &[0x00, 0x5A, 0x00, 0x00, 0xAA, 0xAA, 0xAA, 0xAA],
        0x4000,
    );
    core.reset();

    assert_eq!(core.regs.pc, 0xAAAA_AAAA);
    assert!(core.mmu.entry(0).valid && core.mmu.entry(0).epn == 0xFFF0_0000);
    assert!(core.mmu.entry(4).valid && core.mmu.entry(4).epn == 0xC3F0_0000);
    for esel in [1usize, 2, 3] {
        assert!(core.mmu.entry(esel).valid);
        assert!(!core.mmu.entry(esel).vle, "VLE=0 boots BookE");
    }
    assert_eq!(core.mmu.entry(3).tsiz, PageSize::Size256K);
    assert!(!core.swt.enabled(), "RCHW.swt=0 disables the SWT");
}

#[test]
fn test_bam_vle_with_swt() {
    init_logging();
    let mut core = Core::new(Config { test_mode: true, ..Config::default() });
    core.flash.load(
        FlashDevice::Main,
        &[0x09, 0x5A, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00],
        0x4000,
    );
    core.reset();

    assert_eq!(core.regs.pc, 0x4000_0000);
    for esel in [1usize, 2, 3] {
        assert!(core.mmu.entry(esel).vle, "entry {} carries VLE", esel);
    }
    assert!(core.swt.enabled());
    assert!(core.swt.timer_running());
}

#[test]
fn test_execute_firmware_arithmetic() {
    let entry = 0x0001_0000;
    let mut core = boot_core(
        entry,
        &[ADDI_R3_5, ADDI_R4_7, ADD_R5_R3_R4, ADDIS_R6_0X4000, STW_R5_0_R6, B_SELF],
    );

    for _ in 0..5 {
        core.step().unwrap();
    }
    assert_eq!(core.regs.gpr[3], 5);
    assert_eq!(core.regs.gpr[4], 7);
    assert_eq!(core.regs.gpr[5], 12);
    assert_eq!(core.read_mem_value(0x4000_0000, 4).unwrap(), 12);

    // the loop instruction keeps the PC in place
    let pc = core.regs.pc;
    core.step().unwrap();
    assert_eq!(core.regs.pc, pc);
}

#[test]
fn test_vle_fetch_and_execute() {
    init_logging();
    let mut core = Core::new(Config { test_mode: true, ..Config::default() });
    // VLE RCHW (SWT off), entry at 0x10000: se_li r7, 0x2A ; se_b .
    core.flash.load(FlashDevice::Main, &[0x01, 0x5A, 0, 0, 0x00, 0x01, 0x00, 0x00], 0);
    core.flash.load(FlashDevice::Main, &[0x4A, 0xA7, 0xE8, 0x00], 0x1_0000);
    core.reset();

    core.step().unwrap();
    assert_eq!(core.regs.gpr[7], 0x2A);
    let cur = core.cur_instr().unwrap();
    assert!(cur.vle);

    let pc = core.regs.pc;
    core.step().unwrap();
    assert_eq!(core.regs.pc, pc, "se_b . loops");
}

#[test]
fn test_system_call_dispatch() {
    let entry = 0x0001_0000;
    let mut core = boot_core(entry, &[ADDI_R3_5, SC, B_SELF, NOP, NOP, NOP, NOP, NOP]);
    // vector the system call into the same flash page
    core.write_spr(spr::IVPR, entry);
    core.write_spr(spr::IVOR8, 0x20);
    core.flash.load(FlashDevice::Main, &B_SELF.to_be_bytes(), (entry + 0x20) as usize);

    core.step().unwrap(); // addi
    core.step().unwrap(); // sc raises, queued
    core.step().unwrap(); // dispatch lands on the handler

    assert_eq!(core.regs.pc, entry + 0x20);
    assert_eq!(core.regs.get_spr32(spr::SRR0), entry + 8, "SRR0 resumes after sc");
    assert_eq!(core.intc.stack_depth(), 1);
}

#[test]
fn test_priority_preemption_and_rfi() {
    let entry = 0x0001_0000;
    let mut core = boot_core(entry, &[B_SELF]);
    core.set_msr(msr_bits::EE | msr_bits::CE | msr_bits::ME);
    core.write_spr(spr::IVPR, entry);
    core.write_spr(spr::IVOR1, 0x100);
    core.write_spr(spr::IVOR10, 0x200);
    // machine-check handler returns with rfmci; decrementer handler loops
    core.flash.load(FlashDevice::Main, &0x4C00_004Cu32.to_be_bytes(), (entry + 0x100) as usize);
    core.flash.load(FlashDevice::Main, &B_SELF.to_be_bytes(), (entry + 0x200) as usize);

    core.queue_exception(Exception::new(ExcKind::Decrementer));
    core.queue_exception(Exception::new(ExcKind::MachineCheck));

    // the machine check (priority 1) wins even though it was queued
    // second; its handler instruction is rfmci, so the same step unwinds
    // the stack and returns to the interrupted loop
    core.step().unwrap();
    assert_eq!(core.regs.pc, entry);
    assert_eq!(core.intc.stack_depth(), 0);

    // now the decrementer is eligible
    core.step().unwrap();
    assert_eq!(core.regs.pc, entry + 0x200);
    assert_eq!(core.intc.stack_depth(), 1);
    assert_eq!(core.intc.current_level(), 8);
}

#[test]
fn test_watchdog_expiry_resets_core() {
    init_logging();
    let mut core = Core::new(Config { test_mode: true, ..Config::default() });
    // RCHW with SWT enabled; firmware never services the watchdog
    core.flash.load(FlashDevice::Main, &[0x08, 0x5A, 0, 0, 0x00, 0x01, 0x00, 0x00], 0);
    core.flash.load(FlashDevice::Main, &B_SELF.to_be_bytes(), 0x1_0000);
    core.reset();
    assert!(core.swt.timer_running());

    // a full timeout is TO / extal ~ 9.8ms; skip past it
    core.time.advance(0.05);
    core.time.process_expired();

    // the queued reset is taken at the next step boundary
    for _ in 0..200 {
        core.step().unwrap();
        if core.reset_source == ResetSource::Watchdog {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(core.reset_source, ResetSource::Watchdog);
    // BAM re-ran: back at the entry with the watchdog re-armed
    assert_eq!(core.regs.pc, 0x0001_0000);
    assert!(core.swt.timer_running());
}

#[test]
fn test_watchdog_interrupt_then_reset_policy() {
    init_logging();
    let mut core = Core::new(Config { test_mode: true, ..Config::default() });
    core.flash.load(FlashDevice::Main, &[0x00, 0x5A, 0, 0, 0x00, 0x01, 0x00, 0x00], 0);
    core.flash.load(FlashDevice::Main, &B_SELF.to_be_bytes(), 0x1_0000);
    core.reset();

    // widen the window to 10 seconds, then enable with ITR so the first
    // expiry is an external interrupt
    core.write_mem_value(0xFFF3_8008, 400_000_000, 4).unwrap();
    let mcr: u32 = 0xFF00_014B; // RIA | ITR | CSL | FRZ | WEN
    core.write_mem_value(0xFFF3_8000, mcr as u64, 4).unwrap();
    assert_eq!(core.swt.regs.field("mcr", "itr"), 1);

    core.time.advance(10.5);
    for _ in 0..2000 {
        core.time.process_expired();
        core.intc.drain_inbox(u32::MAX);
        if core.intc.pending_len() > 0 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert!(core
        .intc
        .is_exception_active(|k| *k == ExcKind::ExternalInput(ExternalSource::SwtTimeout)));
    // IR[TIF] latched
    assert_eq!(core.read_mem_value(0xFFF3_8004, 4).unwrap(), 1);
}

#[test]
fn test_swt_unlock_sequence_via_bus() {
    let entry = 0x0001_0000;
    let mut core = boot_core(entry, &[B_SELF]);

    // enable and soft-lock the watchdog through the bus
    core.write_mem_value(0xFFF3_8000, 0xFF00_010B, 4).unwrap();
    core.write_mem_value(0xFFF3_8000, 0xFF00_011B, 4).unwrap();
    assert!(core.swt.locked());

    // a locked MCR write escalates per RIA
    let err = core.write_mem_value(0xFFF3_8000, 0xFF00_010B, 4).unwrap_err();
    assert_eq!(err.kind, ExcKind::Reset(ResetSource::Watchdog));

    // unlock pair clears SLK; hard lock would survive this
    core.write_mem_value(0xFFF3_8010, 0xC520, 4).unwrap();
    core.write_mem_value(0xFFF3_8010, 0xD928, 4).unwrap();
    assert!(!core.swt.locked());
    core.write_mem_value(0xFFF3_8000, 0xFF00_010A, 4).unwrap();
    assert!(!core.swt.enabled());
}

#[test]
fn test_flash_program_through_bus() {
    let entry = 0x0001_0000;
    let mut core = boot_core(entry, &[B_SELF]);

    // unlock array A's lock registers and clear the block locks
    core.write_mem_value(0xC3F8_8004, 0xA1A1_1111, 4).unwrap();
    core.write_mem_value(0xC3F8_8008, 0xB2B2_2222, 4).unwrap();
    core.write_mem_value(0xC3F8_800C, 0xC3C3_3333, 4).unwrap();
    core.write_mem_value(0xC3F8_8004, 0x8000_0000, 4).unwrap();
    core.write_mem_value(0xC3F8_8008, 0x8000_0000, 4).unwrap();
    core.write_mem_value(0xC3F8_800C, 0x8000_0000, 4).unwrap();

    // PGM, two words, EHV
    let mcr = core.read_mem_value(0xC3F8_8000, 4).unwrap() as u32;
    core.write_mem_value(0xC3F8_8000, (mcr | 0x10) as u64, 4).unwrap();
    core.write_mem_value(0x0000_4000, 0xDEAD_BEEF, 4).unwrap();
    core.write_mem_value(0x0000_4004, 0x0BAD_F00D, 4).unwrap();
    assert_eq!(core.read_mem_value(0x0000_4000, 4).unwrap(), 0xFFFF_FFFF);

    let mcr = core.read_mem_value(0xC3F8_8000, 4).unwrap() as u32;
    core.write_mem_value(0xC3F8_8000, (mcr | 0x1) as u64, 4).unwrap();
    assert_eq!(core.read_mem_value(0x0000_4000, 4).unwrap(), 0xDEAD_BEEF);
    assert_eq!(core.read_mem_value(0x0000_4004, 4).unwrap(), 0x0BAD_F00D);
}

#[test]
fn test_opcode_cache_refreshes_after_write() {
    let entry = 0x0001_0000;
    let mut core = boot_core(entry, &[B_SELF]);

    // plant an instruction in SRAM and decode it
    core.write_opcode(0x4000_0100, &0x3860_0001u32.to_be_bytes()).unwrap();
    let op = core.parse_opcode(0x4000_0100).unwrap();
    assert_eq!(op.kind, OpKind::Addi { rt: 3, ra: 0, simm: 1 });

    // overwrite one byte inside the cached instruction via a data write
    core.write_mem(0x4000_0103, &[0x02]).unwrap();
    let op = core.parse_opcode(0x4000_0100).unwrap();
    assert_eq!(op.kind, OpKind::Addi { rt: 3, ra: 0, simm: 2 }, "stale decode served");

    // a write shortly before the instruction also invalidates it
    core.write_mem(0x4000_00F8, &[0, 0, 0, 0]).unwrap();
    core.write_opcode(0x4000_0100, &0x3860_0003u32.to_be_bytes()).unwrap();
    let op = core.parse_opcode(0x4000_0100).unwrap();
    assert_eq!(op.kind, OpKind::Addi { rt: 3, ra: 0, simm: 3 });
}

#[test]
fn test_invalid_instruction_becomes_program_exception() {
    let entry = 0x0001_0000;
    let mut core = boot_core(entry, &[0xFFFF_FFFF]);
    core.write_spr(spr::IVPR, entry);
    core.write_spr(spr::IVOR6, 0x40);
    core.flash.load(FlashDevice::Main, &B_SELF.to_be_bytes(), (entry + 0x40) as usize);

    core.step().unwrap(); // decoder rejects, Program queued
    core.step().unwrap(); // dispatch lands on the looping handler
    assert_eq!(core.regs.pc, entry + 0x40);
    assert_eq!(core.regs.get_spr32(spr::SRR0), entry, "fault restart point");
}

#[test]
fn test_time_base_spr_reads() {
    let entry = 0x0001_0000;
    let mut core = boot_core(entry, &[B_SELF]);

    // TB reads zero until HID0[TBEN] starts it
    assert_eq!(core.read_spr(spr::TB), 0);
    core.write_spr(spr::HID0, 0x0000_4000);
    core.time.advance(0.5);
    let tb = core.read_spr(spr::TB);
    assert!(tb > 0, "TB counts while enabled");

    // rebasing through the write-only pair shifts subsequent reads
    core.write_spr(spr::TBL_WO, 0x1000_0000);
    let tb = core.read_spr(spr::TB);
    assert!(tb >= 0x1000_0000);

    // disabling freezes the value at zero
    core.write_spr(spr::HID0, 0);
    assert_eq!(core.read_spr(spr::TB), 0);
}

#[test]
fn test_ihex_image_boots() {
    init_logging();
    let mut image = ihex::Image::default();
    let mut boot = vec![0x00u8, 0x5A, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00];
    boot.extend_from_slice(&[0u8; 8]);
    image.blocks.insert(0, boot);
    let mut prog = Vec::new();
    for w in [ADDI_R3_5, B_SELF] {
        prog.extend_from_slice(&w.to_be_bytes());
    }
    image.blocks.insert(0x0001_0000, prog);

    let text = ihex::emit(&image);
    let parsed = ihex::parse(&text).unwrap();

    let mut core = Core::new(Config { test_mode: true, ..Config::default() });
    for (base, data) in &parsed.blocks {
        core.flash.load(FlashDevice::Main, data, *base as usize);
    }
    core.reset();

    assert_eq!(core.regs.pc, 0x0001_0000);
    core.step().unwrap();
    assert_eq!(core.regs.gpr[3], 5);
}

#[test]
fn test_decrementer_fires_through_core() {
    let entry = 0x0001_0000;
    let mut core = boot_core(entry, &[B_SELF]);
    core.set_msr(msr_bits::EE);
    core.write_spr(spr::IVPR, entry);
    core.write_spr(spr::IVOR10, 0x80);
    core.flash.load(FlashDevice::Main, &B_SELF.to_be_bytes(), (entry + 0x80) as usize);

    // program a short decrementer and enable it: 1M ticks @ 120MHz
    core.write_spr(spr::DEC, 1_000_000);
    core.write_spr(spr::TCR, 0x0400_0000); // DIE
    assert!(core.read_spr(spr::DEC) > 0);

    core.time.advance(0.1);
    core.time.process_expired();
    for _ in 0..200 {
        core.step().unwrap();
        if core.regs.pc == entry + 0x80 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(core.regs.pc, entry + 0x80, "decrementer handler entered");
    assert_eq!(core.tsr.lock().unwrap().field("dis"), 1);
}
