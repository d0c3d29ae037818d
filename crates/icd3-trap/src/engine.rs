//! The trap engine itself (`spec.md` §4.D): installs the access-fault
//! handler, decodes and dispatches each fault, and exchanges requests with
//! device models.
//!
//! The handler calls the model transport's blocking socket I/O directly,
//! inline, rather than routing it through a lock-free mailbox to a helper
//! thread. `spec.md` §9 explicitly leaves that choice to implementers
//! ("the transport's socket calls are signal-safe on the target OS
//! family"), and the original driver this system replaces does exactly
//! this — `segv_handler` in the source implementation calls
//! `send_message_to_model` inline. Keeping that shape here preserves the
//! ordering guarantee in `spec.md` §5 ("requests from a single thread are
//! observed by the model in program order") for free, since nothing else
//! can run on the trapping thread until the handler returns.

use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use icd3_decoder::{Category, DecodedInsn, Extend, MAX_INSTRUCTION_LEN};
use icd3_protocol::Frame;
use icd3_registry::DeviceRegistry;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::regctx::{extend_to_u32, mask_to_size, RegisterContext};

#[derive(Debug, thiserror::Error)]
pub enum TrapError {
    #[error("trap engine is already installed in this process")]
    AlreadyInstalled,
    #[error("failed to install access-fault handler: {0}")]
    Sigaction(#[source] nix::Error),
}

struct EngineState {
    registry: Arc<RwLock<DeviceRegistry>>,
}

// Signal handlers are bare `extern "C" fn` pointers with no captured state;
// the shared registry has to live behind a process-wide static. Guarded by
// `spec.md` §5's single-writer contract: this is only ever written outside
// of driver execution (install/teardown), and only ever read from inside
// the handler while driver code is (by definition) not otherwise running.
static ENGINE: Mutex<Option<EngineState>> = Mutex::new(None);

/// RAII handle for the installed handler. Dropping it does not reset the
/// signal disposition (racing a model's in-flight `kill` is worse than
/// leaving it installed); it only clears the shared registry pointer so a
/// fresh [`install`] can run again, which the test suite relies on.
pub struct TrapEngineGuard {
    _private: (),
}

impl Drop for TrapEngineGuard {
    fn drop(&mut self) {
        *ENGINE.lock().unwrap() = None;
    }
}

/// Installs the access-fault handler on an alternate signal stack and binds
/// it to `registry`.
pub fn install(registry: Arc<RwLock<DeviceRegistry>>) -> Result<TrapEngineGuard, TrapError> {
    {
        let mut slot = ENGINE.lock().unwrap();
        if slot.is_some() {
            return Err(TrapError::AlreadyInstalled);
        }
        *slot = Some(EngineState { registry });
    }

    install_alt_stack();

    let action = SigAction::new(
        SigHandler::SigAction(handle_access_fault),
        SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK,
        SigSet::empty(),
    );
    // SAFETY: `handle_access_fault` only touches the static `ENGINE` slot,
    // the decoder (a pure function), and raw register-context accessors —
    // no heap allocation on the success path, no locks taken recursively.
    unsafe { signal::sigaction(Signal::SIGSEGV, &action) }.map_err(TrapError::Sigaction)?;

    Ok(TrapEngineGuard { _private: () })
}

/// Installs a dedicated alternate stack for the handler, since the primary
/// stack may itself sit adjacent to a fabricated device window during
/// testing (`spec.md` §4.D).
fn install_alt_stack() {
    const ALT_STACK_SIZE: usize = 1 << 16;
    // Leaked deliberately: the alternate stack must outlive the process,
    // since the handler can run at any point after installation.
    let stack = Box::leak(vec![0u8; ALT_STACK_SIZE].into_boxed_slice());
    let stack_t = libc::stack_t {
        ss_sp: stack.as_mut_ptr() as *mut c_void,
        ss_flags: 0,
        ss_size: ALT_STACK_SIZE,
    };
    // SAFETY: `stack` is a valid, `'static` buffer of `ALT_STACK_SIZE` bytes.
    let rc = unsafe { libc::sigaltstack(&stack_t, std::ptr::null_mut()) };
    if rc != 0 {
        tracing::warn!("sigaltstack installation failed; handler will run on the faulting stack");
    }
}

extern "C" fn handle_access_fault(_signo: libc::c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    // SAFETY: the kernel guarantees `info`/`ucontext` are valid for the
    // duration of an `SA_SIGINFO` handler invocation.
    let fault_addr = unsafe { (*info).si_addr() } as u64;
    let mut regs = unsafe { RegisterContext::from_raw(ucontext) };

    let Some(state) = ENGINE.lock().unwrap().as_ref().map(|s| s.registry.clone()) else {
        fatal("access fault with no trap engine installed", fault_addr);
    };

    let rip = regs.rip();
    // SAFETY: `rip` is the faulting thread's own instruction pointer; the
    // bytes at and after it are the code currently executing.
    let code = unsafe { std::slice::from_raw_parts(rip as *const u8, MAX_INSTRUCTION_LEN) };

    let decoded = match icd3_decoder::decode(code) {
        Ok(d) => d,
        Err(_) => fatal("failed to decode faulting instruction", fault_addr),
    };

    match decoded.category {
        Category::Unknown => fatal("unsupported opcode at faulting instruction", fault_addr),
        Category::Load | Category::StoreReg | Category::StoreImm => {
            dispatch_single_access(&state, &mut regs, fault_addr, rip, &decoded);
        }
        Category::RepStos => {
            dispatch_rep_stos(&state, &mut regs, fault_addr, rip, &decoded);
        }
    }
}

fn lookup_device(
    registry: &RwLock<DeviceRegistry>,
    address: u64,
) -> Option<(u32, Option<PathBuf>, u64)> {
    let guard = registry.read().unwrap();
    let entry = guard.lookup(address)?;
    Some((entry.device_id, entry.model_endpoint.clone(), entry.guest_end()))
}

fn dispatch_single_access(
    registry: &RwLock<DeviceRegistry>,
    regs: &mut RegisterContext,
    fault_addr: u64,
    rip: u64,
    decoded: &DecodedInsn,
) {
    let Some((device_id, endpoint, _window_end)) = lookup_device(registry, fault_addr) else {
        fatal("access fault at an unmapped address", fault_addr);
    };

    match decoded.category {
        Category::Load => {
            let request = Frame::read(device_id, fault_addr, decoded.operand_size as u32);
            let (response, _outcome) = icd3_transport::exchange(endpoint.as_deref(), &request);
            let slot = decoded.reg_index.expect("LOAD always carries a destination register");

            if response.result.is_success() {
                if decoded.extend == Extend::None {
                    regs.writeback(slot, decoded.operand_size, response.value());
                } else {
                    let extended = extend_to_u32(response.value(), decoded.operand_size, decoded.extend);
                    regs.writeback(slot, 4, extended as u64);
                }
            } else {
                // §7 ModelError: zero is written so driver-level retry/error handling runs.
                let size = if decoded.extend == Extend::None { decoded.operand_size } else { 4 };
                regs.writeback(slot, size, 0);
            }
        }
        Category::StoreReg => {
            let slot = decoded.reg_index.expect("STORE_REG always carries a source register");
            let value = mask_to_size(regs.get(slot), decoded.operand_size);
            let request = Frame::write(device_id, fault_addr, decoded.operand_size as u32, value);
            let _ = icd3_transport::exchange(endpoint.as_deref(), &request);
        }
        Category::StoreImm => {
            let request = Frame::write(device_id, fault_addr, decoded.operand_size as u32, decoded.imm);
            let _ = icd3_transport::exchange(endpoint.as_deref(), &request);
        }
        Category::Unknown | Category::RepStos => unreachable!("filtered by caller"),
    }

    regs.set_rip(rip + decoded.length as u64);
}

fn dispatch_rep_stos(
    registry: &RwLock<DeviceRegistry>,
    regs: &mut RegisterContext,
    fault_addr: u64,
    rip: u64,
    decoded: &DecodedInsn,
) {
    let count_reg = decoded.rep_count_reg.expect("REP_STOS always carries a count register");
    let dest_reg = decoded.dest_addr_reg.expect("REP_STOS always carries a destination register");
    let value_reg = decoded.value_reg.expect("REP_STOS always carries a value register");

    let count = regs.get(count_reg);
    let dest = regs.get(dest_reg);
    let value = mask_to_size(regs.get(value_reg), decoded.operand_size);
    let size = decoded.operand_size as u64;

    let Some((device_id, endpoint, window_end)) = lookup_device(registry, fault_addr) else {
        fatal("rep stos destination is an unmapped address", fault_addr);
    };

    let max_count = if size == 0 { 0 } else { (window_end.saturating_sub(dest)) / size };
    let clamped = count.min(max_count);
    if clamped < count {
        tracing::warn!(requested = count, clamped, "rep stos clamped to device window");
    }

    let mut emitted = 0u64;
    let mut transport_failed = false;
    for i in 0..clamped {
        let addr = dest + i * size;
        let request = Frame::write(device_id, addr, decoded.operand_size as u32, value);
        let (_response, outcome) = icd3_transport::exchange(endpoint.as_deref(), &request);
        emitted += 1;
        if outcome == icd3_transport::TransportOutcome::Truncated {
            transport_failed = true;
            break;
        }
    }

    let (final_count, final_dest) = if transport_failed {
        (count - emitted, dest + emitted * size)
    } else {
        (0, dest + clamped * size)
    };
    regs.set(count_reg, final_count);
    regs.set(dest_reg, final_dest);
    regs.set_rip(rip + decoded.length as u64);
}

/// Aborts the process with a diagnostic naming the fault. `DecodeFailed`
/// and `UnmappedAddress` are treated as real driver bugs that must not be
/// silently masked (`spec.md` §7).
fn fatal(reason: &str, fault_addr: u64) -> ! {
    eprintln!("icd3: fatal access fault at {fault_addr:#x}: {reason}");
    std::process::abort();
}
