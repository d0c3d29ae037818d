//! Signal-safe handoff from the interrupt signal to the in-process handler
//! table (`spec.md` §9 "Signal-handler re-entrancy").
//!
//! The signal handler itself does the absolute minimum required to be
//! async-signal-safe: store `true` into a static atomic flag and return.
//! Reading the sidecar file, parsing it, and invoking the registered
//! handler all happen on an ordinary background thread that polls the
//! flag. This trades a few milliseconds of dispatch latency for the
//! ability to do blocking I/O and take locks outside of signal context,
//! which the handler itself must never do.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::sidecar::{interrupt_sidecar_path, parse_sidecar};
use crate::table::InterruptTable;

/// How often the dispatcher thread polls the pending flag when idle.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

// A signal handler is a bare `extern "C" fn` with no captured state, so the
// handoff flag must be a process-wide static. `InterruptDispatcher::install`
// is meant to be called once per process (the `icd3` facade enforces this).
static PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signo: libc::c_int) {
    PENDING.store(true, Ordering::SeqCst);
}

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("failed to install signal handler: {0}")]
    Sigaction(#[source] nix::Error),
}

/// Installs the interrupt signal handler and starts the background
/// dispatcher thread. Dropping (or calling [`InterruptDispatcher::stop`])
/// stops the thread and leaves the signal disposition installed, since
/// resetting it races with a model's in-flight `kill`.
pub struct InterruptDispatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl InterruptDispatcher {
    pub fn install(
        signal: Signal,
        table: Arc<InterruptTable>,
        pid: u32,
    ) -> Result<Self, DispatcherError> {
        let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());
        // SAFETY: `on_signal` only performs an atomic store, satisfying the
        // async-signal-safety contract `sigaction` requires of its handler.
        unsafe { signal::sigaction(signal, &action) }.map_err(DispatcherError::Sigaction)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let sidecar_path = interrupt_sidecar_path(pid);
        let thread = std::thread::spawn(move || dispatch_loop(table, sidecar_path, stop2));

        Ok(InterruptDispatcher {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for InterruptDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(table: Arc<InterruptTable>, sidecar_path: PathBuf, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        if PENDING.swap(false, Ordering::SeqCst) {
            service_one(&table, &sidecar_path);
        } else {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn service_one(table: &InterruptTable, sidecar_path: &PathBuf) {
    match std::fs::read_to_string(sidecar_path) {
        Ok(contents) => {
            match parse_sidecar(&contents) {
                Some((device_id, interrupt_id)) => table.dispatch(device_id, interrupt_id),
                None => tracing::warn!(contents, "malformed interrupt sidecar contents"),
            }
            if let Err(e) = std::fs::remove_file(sidecar_path) {
                tracing::warn!(error = %e, "failed to remove consumed interrupt sidecar file");
            }
        }
        Err(e) => tracing::warn!(error = %e, "interrupt signalled but sidecar file was unreadable"),
    }
}

/// Model-side helper: writes the sidecar payload and signals `pid`. Used by
/// device models (and by tests simulating one) to raise an interrupt.
pub fn trigger_interrupt(
    pid: Pid,
    signal: Signal,
    device_id: u32,
    interrupt_id: u32,
) -> std::io::Result<()> {
    let path = interrupt_sidecar_path(pid.as_raw() as u32);
    std::fs::write(&path, crate::sidecar::format_sidecar(device_id, interrupt_id))?;
    signal::kill(pid, signal).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn end_to_end_sidecar_round_trip_within_one_dispatch() {
        let table = Arc::new(InterruptTable::new());
        let seen_device = Arc::new(AtomicU32::new(0));
        let seen_irq = Arc::new(AtomicU32::new(0));
        let (d, i) = (seen_device.clone(), seen_irq.clone());
        table
            .register(0x42, move |device_id, interrupt_id| {
                d.store(device_id, Ordering::SeqCst);
                i.store(interrupt_id, Ordering::SeqCst);
            })
            .unwrap();

        let pid = std::process::id();
        let mut dispatcher =
            InterruptDispatcher::install(Signal::SIGUSR2, table, pid).expect("install");

        trigger_interrupt(Pid::from_raw(pid as i32), Signal::SIGUSR2, 7, 0x42).expect("trigger");

        // Give the background thread a few poll cycles to notice and act.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen_irq.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(seen_device.load(Ordering::SeqCst), 7);
        assert_eq!(seen_irq.load(Ordering::SeqCst), 0x42);

        dispatcher.stop();
        assert!(!interrupt_sidecar_path(pid).exists());
    }
}
