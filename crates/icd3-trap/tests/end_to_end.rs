//! End-to-end scenarios from `spec.md` §8, exercised against the real
//! `SIGSEGV` path: a genuine volatile memory access triggers the fault,
//! the installed engine answers it, and we observe the effect the fault
//! handler had on the faulting thread's own registers/return value.
//!
//! These tests assume the chosen guest addresses are free for an in-place
//! reservation on the host running the suite (true on ordinary Linux x86-64
//! machines, where these high, round addresses are never otherwise mapped).
//! Where that assumption doesn't hold, the test reports it and returns
//! rather than asserting on a fault that can't occur.

use std::sync::{Arc, RwLock};

use icd3_registry::DeviceRegistry;

#[test]
fn single_32bit_load_returns_fallback_value() {
    let mut registry = DeviceRegistry::new();
    registry.register(1, 0x4000_0000, 0x1000).expect("register device 1");
    let trappable = registry.lookup(0x4000_0000).unwrap().is_trappable();
    let registry = Arc::new(RwLock::new(registry));
    let _guard = icd3_trap::install(registry).expect("install trap engine");

    if !trappable {
        eprintln!("skipping: 0x40000000 could not be reserved in-place on this host");
        return;
    }

    // SAFETY: the address was just reserved as PROT_NONE above; the read
    // faults, the trap engine answers it, and execution resumes normally.
    let value = unsafe { std::ptr::read_volatile(0x4000_0000usize as *const u32) };
    assert_eq!(value, 0xDEAD_BEEF);
}

#[test]
fn status_register_poll_returns_one() {
    let mut registry = DeviceRegistry::new();
    registry.register(2, 0x4001_0000, 0x1000).expect("register device 2");
    let trappable = registry.lookup(0x4001_0000).unwrap().is_trappable();
    let registry = Arc::new(RwLock::new(registry));
    let _guard = icd3_trap::install(registry).expect("install trap engine");

    if !trappable {
        eprintln!("skipping: 0x40010000 could not be reserved in-place on this host");
        return;
    }

    // Low byte 0x04 is the conventional STATUS offset (`spec.md` §4.E).
    let value = unsafe { std::ptr::read_volatile(0x4001_0004usize as *const u32) };
    assert_eq!(value, 1);
}

#[test]
fn rep_stosb_zero_fill_clamps_count_and_advances_dest() {
    let mut registry = DeviceRegistry::new();
    registry.register(3, 0x4002_0000, 0x1000).expect("register device 3");
    let trappable = registry.lookup(0x4002_0000).unwrap().is_trappable();
    let registry = Arc::new(RwLock::new(registry));
    let _guard = icd3_trap::install(registry).expect("install trap engine");

    if !trappable {
        eprintln!("skipping: 0x40020000 could not be reserved in-place on this host");
        return;
    }

    let dest: u64 = 0x4002_0200;
    let count: u64 = 64;
    let final_rcx: u64;
    let final_rdi: u64;
    // SAFETY: `rep stosb` only touches [rdi, rdi+rcx) and al/rcx/rdi, all
    // accounted for in the asm! operand list; the destination range lies
    // entirely inside the reserved (and hence faulting) device window.
    unsafe {
        std::arch::asm!(
            "rep stosb",
            inout("rdi") dest => final_rdi,
            inout("rcx") count => final_rcx,
            in("al") 0u8,
            options(nostack),
        );
    }

    assert_eq!(final_rcx, 0);
    assert_eq!(final_rdi, dest + count);
}

/// Drives scenario 6 ("unmapped fault") in a child process: the fault
/// handler must abort rather than silently resuming.
#[test]
fn unmapped_fault_aborts_the_process() {
    if std::env::var_os("ICD3_TRAP_SUBPROCESS_UNMAPPED_FAULT").is_some() {
        run_unmapped_fault_child();
    }

    let exe = std::env::current_exe().expect("current_exe");
    let status = std::process::Command::new(exe)
        .arg("--exact")
        .arg("unmapped_fault_aborts_the_process")
        .env("ICD3_TRAP_SUBPROCESS_UNMAPPED_FAULT", "1")
        .status()
        .expect("spawn child process");
    assert!(!status.success(), "child process should have aborted on the unmapped fault");
}

fn run_unmapped_fault_child() -> ! {
    let registry = Arc::new(RwLock::new(DeviceRegistry::new()));
    let _guard = icd3_trap::install(registry).expect("install trap engine");
    // SAFETY: nothing; this deliberately dereferences an address no device
    // owns, to prove the engine aborts rather than resuming.
    unsafe {
        std::ptr::read_volatile(0x1usize as *const u32);
    }
    unreachable!("fault handler should have aborted the process before returning here");
}
