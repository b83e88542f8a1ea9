//! End-to-end execution scenarios on raw guest programs.

mod common;

use common::*;
use rvum::{MachineError, MachineOptions, Machine32, PageAttributes, PAGE_SIZE, REG_RA, SYSCALL_EBREAK};

#[test]
fn test_immediate_add_exits_42() {
    let code = assemble(&[
        addi(10, 0, 7),
        addi(10, 10, 35),
        addi(17, 0, 93),
        ecall(),
    ]);
    let mut m = machine32_with_program(&code, 0x1000);
    let exit = install_exit32(&mut m);

    m.simulate(0).unwrap();
    assert_eq!(*exit.lock().unwrap(), Some(42));
}

#[test]
fn test_branch_taken_skips_clear() {
    let code = assemble(&[
        addi(10, 0, 1),
        addi(11, 0, 1),
        beq(10, 11, 8),
        addi(10, 0, 0), // skipped
        addi(17, 0, 93),
        ecall(),
    ]);
    let mut m = machine32_with_program(&code, 0x1000);
    let exit = install_exit32(&mut m);

    m.simulate(0).unwrap();
    assert_eq!(*exit.lock().unwrap(), Some(1));
}

#[test]
fn test_jump_and_link() {
    let code = assemble(&[
        jal(1, 8),       // skip the next instruction
        addi(10, 0, 2),  // never executed; ra points here
        addi(10, 0, 9),
        addi(17, 0, 93),
        ecall(),
    ]);
    let mut m = machine32_with_program(&code, 0x1000);
    let exit = install_exit32(&mut m);

    m.simulate(0).unwrap();
    assert_eq!(*exit.lock().unwrap(), Some(9));
    assert_eq!(m.cpu.reg(REG_RA), 0x1004);
}

#[test]
fn test_store_then_load() {
    let [lui_t0, addi_t0] = li_pair(5, 0x20000);
    let [lui_t1, addi_t1] = li_pair(6, 0xdeadbeef);
    let code = assemble(&[
        lui_t0,
        addi_t0,
        lui_t1,
        addi_t1,
        sw(5, 6, 0),
        lw(10, 5, 0),
        addi(17, 0, 93),
        ecall(),
    ]);
    let mut m = machine32_with_program(&code, 0x1000);
    m.memory.create_page(0x20).unwrap();
    let exit = install_exit32(&mut m);

    m.simulate(0).unwrap();
    assert_eq!(*exit.lock().unwrap(), Some(0xdeadbeef));
}

#[test]
fn test_store_to_readonly_page_faults() {
    let [lui_t0, addi_t0] = li_pair(5, 0x30000);
    let code = assemble(&[lui_t0, addi_t0, addi(6, 0, 1), sw(5, 6, 0)]);
    let mut m = machine32_with_program(&code, 0x1000);
    m.memory.create_page(0x30).unwrap();
    m.memory
        .set_page_attr(0x30000, PAGE_SIZE, PageAttributes::new(true, false, false))
        .unwrap();

    let err = m.simulate(0).unwrap_err();
    assert_eq!(err, MachineError::ProtectionFault { addr: 0x30000 });
    // The faulted store must not have touched the page.
    assert_eq!(m.memory.read_u32(0x30000).unwrap(), 0);
}

#[test]
fn test_instruction_budget_is_exact() {
    let code = assemble(&[
        addi(5, 5, 1),
        addi(6, 6, 1),
        jal(0, -8),
    ]);
    let mut m = machine32_with_program(&code, 0x1000);

    m.simulate(10).unwrap();
    assert_eq!(m.cpu.counter, 10);
    assert!(!m.stopped());

    // A second bounded run picks up where the first left off.
    m.simulate(5).unwrap();
    assert_eq!(m.cpu.counter, 15);
}

#[test]
fn test_x0_is_zero_after_write() {
    let code = assemble(&[addi(0, 0, 42), addi(17, 0, 93), ecall()]);
    let mut m = machine32_with_program(&code, 0x1000);
    install_exit32(&mut m);

    m.simulate(0).unwrap();
    assert_eq!(m.cpu.reg(0), 0);
}

#[test]
fn test_unhandled_syscall_returns_enosys() {
    let code = assemble(&[
        addi(17, 0, 1234),
        ecall(),
        addi(17, 0, 93),
        ecall(),
    ]);
    let mut m = machine32_with_program(&code, 0x1000);
    let exit = install_exit32(&mut m);

    m.simulate(0).unwrap();
    // -ENOSYS from the unhandled call became the exit value.
    assert_eq!(*exit.lock().unwrap(), Some((-38i32) as u32));
}

#[test]
fn test_unhandled_syscall_can_fail_instead() {
    let code = assemble(&[addi(17, 0, 1234), ecall()]);
    let mut m = Machine32::new(Vec::new(), MachineOptions {
        throw_on_unhandled_syscall: true,
        ..MachineOptions::default()
    })
    .unwrap();
    for pageno in 1..3 {
        m.memory.create_page(pageno).unwrap();
    }
    m.memory.memcpy(0x1000, &code).unwrap();
    m.memory.define_exec_segment(0x1000, code.len() as u64, true).unwrap();
    m.cpu.jump(0x1000).unwrap();

    let err = m.simulate(0).unwrap_err();
    assert_eq!(err, MachineError::UnhandledSyscall { number: 1234 });
}

#[test]
fn test_ebreak_does_not_clobber_a0() {
    let code = assemble(&[addi(10, 0, 7), ebreak()]);
    let mut m = machine32_with_program(&code, 0x1000);
    m.install_syscall_handler(
        SYSCALL_EBREAK,
        Box::new(|m| {
            m.stop();
            Ok(0xbad)
        }),
    );

    m.simulate(0).unwrap();
    assert_eq!(m.cpu.reg(10), 7);
}

#[test]
fn test_fetch_outside_execute_segment() {
    // Jump off the end of the segment: the last instruction falls through.
    let code = assemble(&[addi(10, 0, 1), addi(10, 10, 1)]);
    let mut m = machine32_with_program(&code, 0x1000);

    let err = m.simulate(0).unwrap_err();
    assert_eq!(err, MachineError::ExecutionSpaceProtectionFault { pc: 0x1008 });
    // Both instructions retired before the fault.
    assert_eq!(m.cpu.counter, 2);
    assert_eq!(m.cpu.reg(10), 2);
}

#[test]
fn test_illegal_instruction() {
    let code = assemble(&[0xffff_ffff]);
    let mut m = machine32_with_program(&code, 0x1000);
    let err = m.simulate(0).unwrap_err();
    assert_eq!(
        err,
        MachineError::UnimplementedInstruction { pc: 0x1000, bits: 0xffff_ffff }
    );
}

#[test]
fn test_decoder_cache_matches_fresh_decode() {
    let program = [
        addi(10, 0, 7),
        addi(11, 0, 35),
        add(10, 10, 11),
        sub(11, 10, 11),
        addi(17, 0, 93),
        ecall(),
    ];
    let code = assemble(&program);

    let run = |cache: bool| {
        let mut m = Machine32::new(Vec::new(), MachineOptions {
            enable_decoder_cache: cache,
            ..MachineOptions::default()
        })
        .unwrap();
        for pageno in 1..3 {
            m.memory.create_page(pageno).unwrap();
        }
        m.memory.memcpy(0x1000, &code).unwrap();
        m.memory.define_exec_segment(0x1000, code.len() as u64, cache).unwrap();
        m.cpu.jump(0x1000).unwrap();
        let exit = install_exit32(&mut m);
        m.simulate(0).unwrap();
        let value = exit.lock().unwrap().unwrap();
        (value, m.cpu.counter)
    };

    assert_eq!(run(true), run(false));
}

#[test]
fn test_decoder_cache_survives_reexecution() {
    // Run the same loop body many times so cached slots are exercised.
    let code = assemble(&[
        addi(5, 5, 1),
        beq(5, 6, 12),
        jal(0, -8),
        addi(17, 0, 93),
        ecall(),
    ]);
    let mut m = machine32_with_program(&code, 0x1000);
    m.cpu.set_reg(6, 100);
    let exit = install_exit32(&mut m);

    m.simulate(0).unwrap();
    assert!(exit.lock().unwrap().is_some());
    assert_eq!(m.cpu.reg(5), 100);
}

#[cfg(feature = "compressed")]
#[test]
fn test_compressed_and_wide_mix() {
    // c.li a0, 1 / c.addi a0, 2 / addi a7, x0, 93 / ecall
    let mut code: Vec<u8> = Vec::new();
    code.extend(0x4505u16.to_le_bytes()); // c.li a0, 1
    code.extend(0x0509u16.to_le_bytes()); // c.addi a0, 2
    code.extend(addi(17, 0, 93).to_le_bytes());
    code.extend(ecall().to_le_bytes());

    let mut m = machine32_with_program(&code, 0x1000);
    let exit = install_exit32(&mut m);

    m.simulate(0).unwrap();
    assert_eq!(*exit.lock().unwrap(), Some(3));
    assert_eq!(m.cpu.counter, 4);
}

#[cfg(feature = "atomics")]
#[test]
fn test_amoadd_and_lr_sc() {
    let [lui_t0, addi_t0] = li_pair(5, 0x20000);
    let code = assemble(&[
        lui_t0,
        addi_t0,
        addi(6, 0, 5),
        // amoadd.w a0, t1, (t0): a0 = old value, mem += 5
        encode_r(0b0101111, 10, 0b010, 5, 6, 0b0000000),
        // lr.w a1, (t0)
        encode_r(0b0101111, 11, 0b010, 5, 0, 0b0001000),
        // sc.w a2, t1, (t0)
        encode_r(0b0101111, 12, 0b010, 5, 6, 0b0001100),
        addi(17, 0, 93),
        ecall(),
    ]);
    let mut m = machine32_with_program(&code, 0x1000);
    m.memory.create_page(0x20).unwrap();
    m.memory.write_u32(0x20000, 37).unwrap();
    install_exit32(&mut m);

    m.simulate(0).unwrap();
    assert_eq!(m.cpu.reg(10), 37); // amoadd returned the old value
    assert_eq!(m.cpu.reg(11), 42); // lr saw the sum
    assert_eq!(m.cpu.reg(12), 0); // sc succeeded
    assert_eq!(m.memory.read_u32(0x20000).unwrap(), 5);
}

#[cfg(feature = "atomics")]
#[test]
fn test_sc_width_must_match_reservation() {
    let [lui_t0, addi_t0] = li_pair(5, 0x20000);
    let code = assemble(&[
        lui_t0,
        addi_t0,
        addi(6, 0, 7),
        // lr.w a1, (t0)
        encode_r(0b0101111, 11, 0b010, 5, 0, 0b0001000),
        // sc.d a2, t1, (t0): width differs from the paired lr.w
        encode_r(0b0101111, 12, 0b011, 5, 6, 0b0001100),
        // lr.d a3, (t0) / sc.d a4, t1, (t0): matching widths succeed
        encode_r(0b0101111, 13, 0b011, 5, 0, 0b0001000),
        encode_r(0b0101111, 14, 0b011, 5, 6, 0b0001100),
        addi(17, 0, 93),
        ecall(),
    ]);
    let mut m = machine64_with_program(&code, 0x1000);
    m.memory.create_page(0x20).unwrap();
    install_exit64(&mut m);

    m.simulate(0).unwrap();
    assert_eq!(m.cpu.reg(12), 1); // mismatched width must fail
    assert_eq!(m.memory.read_u64(0x20000).unwrap(), 7);
    assert_eq!(m.cpu.reg(14), 0);
}

#[test]
fn test_rv64_wide_arithmetic() {
    let code = assemble(&[
        addi(10, 0, -1),
        // srli a0, a0, 32 -> 0xffffffff
        encode_i(0b0010011, 10, 0b101, 10, 32),
        addiw(11, 10, 1), // 32-bit wrap: 0
        addi(17, 0, 93),
        ecall(),
    ]);
    let mut m = machine64_with_program(&code, 0x1000);
    let exit = install_exit64(&mut m);

    m.simulate(0).unwrap();
    assert!(exit.lock().unwrap().is_some());
    assert_eq!(m.cpu.reg(10), 0xffff_ffff);
    assert_eq!(m.cpu.reg(11), 0);
}

#[test]
fn test_memview_and_memstring_via_machine() {
    let mut m = Machine32::new(Vec::new(), MachineOptions::default()).unwrap();
    m.memory.create_page(2).unwrap();
    m.copy_to_guest(0x2000, b"vm\0").unwrap();
    assert_eq!(m.memory.memstring(0x2000, 64).unwrap(), "vm");
    let first = m.memory.memview(0x2000, 2, |b| b[0]).unwrap();
    assert_eq!(first, b'v');
}

#[test]
fn test_realign_stack() {
    let mut m = Machine32::new(Vec::new(), MachineOptions::default()).unwrap();
    m.cpu.set_reg(rvum::REG_SP, 0x1fff7);
    m.realign_stack(16).unwrap();
    assert_eq!(m.cpu.reg(rvum::REG_SP), 0x1fff0);
    m.cpu.set_reg(rvum::REG_SP, 0x1fff7);
    m.realign_stack(8).unwrap();
    assert_eq!(m.cpu.reg(rvum::REG_SP), 0x1fff0);

    for bad in [0u8, 1, 2, 15, 32] {
        assert_eq!(
            m.realign_stack(bad).unwrap_err(),
            MachineError::InvalidAlignment { align: bad }
        );
    }
}

#[test]
fn test_setup_call_rejects_too_many_args() {
    let mut m = Machine32::new(Vec::new(), MachineOptions::default()).unwrap();
    let args = [0u32; 9];
    assert_eq!(
        m.setup_call(0x1000, 0, &args).unwrap_err(),
        MachineError::InvalidArgument { what: "more than 8 call arguments" }
    );
}

#[test]
fn test_self_modifying_store_invalidates_cache() {
    // Overwrite the instruction after next with `addi a0, x0, 55`, then
    // execute it.
    let patch = addi(10, 0, 55);
    let [lui_t0, addi_t0] = li_pair(5, 0x1014); // patch target
    let [lui_t1, addi_t1] = li_pair(6, patch);
    let code = assemble(&[
        lui_t0,
        addi_t0,
        lui_t1,
        addi_t1,
        sw(5, 6, 0),
        addi(10, 0, 1), // at 0x1014: patched to a0 = 55
        addi(17, 0, 93),
        ecall(),
    ]);
    let mut m = machine32_with_program(&code, 0x1000);
    let exit = install_exit32(&mut m);

    m.simulate(0).unwrap();
    assert_eq!(*exit.lock().unwrap(), Some(55));
}
