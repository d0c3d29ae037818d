//! `icd3`: a user-space MMIO trap engine. Lets unmodified memory-mapped-I/O
//! driver code run in an ordinary host process while the hardware it talks
//! to is replaced by an out-of-process device model.
//!
//! This crate is the public-facing facade over the six subsystem crates
//! (`icd3-registry`, `icd3-decoder`, `icd3-protocol`, `icd3-transport`,
//! `icd3-interrupts`, `icd3-trap`): a single process-wide singleton, built
//! and torn down by [`init`]/[`deinit`], wired to the free functions below.
//! There is deliberately only one of these per process — the trap engine's
//! `SIGSEGV` handler and the interrupt dispatcher's signal handler are both
//! process-global resources, so a second instance would just race the
//! first one for the same signal dispositions.

pub mod config;

use std::sync::{Arc, Mutex, OnceLock, RwLock};

use icd3_interrupts::{InterruptDispatcher, InterruptTable, Pid, Signal};
use icd3_protocol::{Command, Frame, ResultCode};
use icd3_registry::{DeviceRegistry, RegistryError};
use icd3_trap::TrapEngineGuard;

pub use config::{ConfigError, Icd3Config};
pub use icd3_interrupts::InterruptError;
pub use icd3_protocol::Frame as Message;
pub use icd3_trap::TrapError;

#[derive(Debug, thiserror::Error)]
pub enum Icd3Error {
    #[error("icd3 is already initialized in this process")]
    AlreadyInitialized,
    #[error("icd3 has not been initialized; call icd3::init() first")]
    NotInitialized,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Interrupt(#[from] InterruptError),
    #[error("failed to install trap engine: {0}")]
    Trap(#[from] TrapError),
    #[error("failed to install interrupt dispatcher: {0}")]
    Dispatcher(#[from] icd3_interrupts::DispatcherError),
    #[error("sidecar I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("no device owns address {0:#x}")]
    NoDeviceAtAddress(u64),
}

struct Instance {
    config: Icd3Config,
    registry: Arc<RwLock<DeviceRegistry>>,
    interrupts: Arc<InterruptTable>,
    // Held only to keep the installed handlers alive for the process
    // lifetime; `deinit` drops the dispatcher (stopping its thread) but,
    // per both guards' own docs, never un-installs the signal dispositions
    // themselves.
    _trap_guard: TrapEngineGuard,
    dispatcher: Mutex<Option<InterruptDispatcher>>,
}

static INSTANCE: OnceLock<Instance> = OnceLock::new();

fn instance() -> Result<&'static Instance, Icd3Error> {
    INSTANCE.get().ok_or(Icd3Error::NotInitialized)
}

/// Installs the access-fault handler, the interrupt signal handler and its
/// dispatcher thread, and writes the PID sidecar file models use to find
/// this process. Call once per process; a second call returns
/// [`Icd3Error::AlreadyInitialized`].
pub fn init(config: Icd3Config) -> Result<(), Icd3Error> {
    if INSTANCE.get().is_some() {
        return Err(Icd3Error::AlreadyInitialized);
    }

    let registry = Arc::new(RwLock::new(DeviceRegistry::new()));
    let interrupts = Arc::new(InterruptTable::new());

    let trap_guard = icd3_trap::install(registry.clone())?;

    let pid = std::process::id();
    let dispatcher = InterruptDispatcher::install(config.signal()?, interrupts.clone(), pid)?;

    icd3_interrupts::write_pid_sidecar(&config.pid_sidecar())?;

    let instance = Instance {
        config,
        registry,
        interrupts,
        _trap_guard: trap_guard,
        dispatcher: Mutex::new(Some(dispatcher)),
    };
    // Can't race: `OnceLock::set` only fails if another call won first,
    // and the guard check above already made that case return early.
    INSTANCE
        .set(instance)
        .unwrap_or_else(|_| unreachable!("init() races with itself"));
    Ok(())
}

/// Stops the interrupt dispatcher thread and removes the PID sidecar file.
/// The installed `SIGSEGV`/interrupt signal dispositions are left in place
/// (see [`icd3_trap::TrapEngineGuard`] and
/// [`icd3_interrupts::InterruptDispatcher`] for why), so a process that
/// calls `deinit()` and never calls `init()` again must not touch any
/// fabricated device window afterward.
pub fn deinit() -> Result<(), Icd3Error> {
    let instance = instance()?;
    if let Some(mut dispatcher) = instance.dispatcher.lock().unwrap().take() {
        dispatcher.stop();
    }
    let _ = std::fs::remove_file(instance.config.pid_sidecar());
    Ok(())
}

/// Registers a device with no attached model; its MMIO window always uses
/// the deterministic fallback responder (`spec.md` §4.E).
pub fn register_device(device_id: u32, guest_base: u64, size: u64) -> Result<(), Icd3Error> {
    let instance = instance()?;
    instance
        .registry
        .write()
        .unwrap()
        .register(device_id, guest_base, size)?;
    Ok(())
}

/// As [`register_device`], attaching the local-stream endpoint of the
/// device's model.
pub fn register_device_with_model(
    device_id: u32,
    guest_base: u64,
    size: u64,
    model_endpoint: std::path::PathBuf,
) -> Result<(), Icd3Error> {
    let instance = instance()?;
    instance
        .registry
        .write()
        .unwrap()
        .register_with_model(device_id, guest_base, size, Some(model_endpoint))?;
    Ok(())
}

pub fn unregister_device(device_id: u32) -> Result<(), Icd3Error> {
    let instance = instance()?;
    instance.registry.write().unwrap().unregister(device_id)?;
    Ok(())
}

/// Reads `address` directly over the model transport, bypassing the trap
/// path entirely (`spec.md` §6: "same transport" as the fault handler
/// uses). For programmatic callers that already know the address they
/// want, rather than driver code that touches it via a load instruction.
pub fn read_register(address: u64, size: u32) -> Result<u64, Icd3Error> {
    let instance = instance()?;
    let (endpoint, device_id) = lookup_endpoint(instance, address)?;
    let request = Frame::read(device_id, address, size);
    let (response, _outcome) = icd3_transport::exchange(endpoint.as_deref(), &request);
    Ok(response.value())
}

/// Writes `value` to `address` directly over the model transport, bypassing
/// the trap path (`spec.md` §6).
pub fn write_register(address: u64, value: u64, size: u32) -> Result<ResultCode, Icd3Error> {
    let instance = instance()?;
    let (endpoint, device_id) = lookup_endpoint(instance, address)?;
    let request = Frame::write(device_id, address, size, value);
    let (response, _outcome) = icd3_transport::exchange(endpoint.as_deref(), &request);
    Ok(response.result)
}

fn lookup_endpoint(
    instance: &Instance,
    address: u64,
) -> Result<(Option<std::path::PathBuf>, u32), Icd3Error> {
    let guard = instance.registry.read().unwrap();
    let entry = guard
        .lookup(address)
        .ok_or(Icd3Error::NoDeviceAtAddress(address))?;
    Ok((entry.model_endpoint.clone(), entry.device_id))
}

/// Registers a handler for `interrupt_id`, invoked synchronously on the
/// background dispatcher thread whenever a model raises it (`spec.md` §4.F).
pub fn register_interrupt_handler(
    interrupt_id: u32,
    handler: impl Fn(u32, u32) + Send + Sync + 'static,
) -> Result<(), Icd3Error> {
    let instance = instance()?;
    instance.interrupts.register(interrupt_id, handler)?;
    Ok(())
}

pub fn unregister_interrupt_handler(interrupt_id: u32) -> Result<(), Icd3Error> {
    let instance = instance()?;
    instance.interrupts.unregister(interrupt_id)?;
    Ok(())
}

/// Model-side entry point: raises `interrupt_id` for `device_id` against
/// this very process, via the sidecar-file + signal path (`spec.md` §4.F).
/// Exposed here mainly for tests and single-process demos; a real model
/// runs in its own process and calls [`icd3_interrupts::trigger_interrupt`]
/// directly against the PID it read from the sidecar file.
pub fn trigger_interrupt(device_id: u32, interrupt_id: u32) -> Result<(), Icd3Error> {
    let instance = instance()?;
    let pid = Pid::from_raw(std::process::id() as i32);
    let signal = instance.config.signal()?;
    icd3_interrupts::trigger_interrupt(pid, signal, device_id, interrupt_id)?;
    Ok(())
}

/// Sends an arbitrary, already-built frame to the owning device's model and
/// returns its response, falling back to the in-process responder if the
/// model can't be reached (`spec.md` §6's escape hatch for requests the
/// typed helpers above don't cover, e.g. `Command::Interrupt`).
pub fn send_message_to_model(request: Frame) -> Result<Frame, Icd3Error> {
    let instance = instance()?;
    let endpoint = match request.command {
        Command::Interrupt => None,
        Command::Read | Command::Write => {
            let guard = instance.registry.read().unwrap();
            guard
                .get(request.device_id)
                .and_then(|entry| entry.model_endpoint.clone())
        }
    };
    let (response, _outcome) = icd3_transport::exchange(endpoint.as_deref(), &request);
    Ok(response)
}
