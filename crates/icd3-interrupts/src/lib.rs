//! Out-of-band interrupt delivery (`spec.md` §4.F): the handler table, the
//! sidecar-file wire convention, and the signal-safe dispatcher that bridges
//! between them.

mod dispatcher;
mod sidecar;
mod table;

pub use dispatcher::{trigger_interrupt, DispatcherError, InterruptDispatcher};
pub use sidecar::{format_sidecar, interrupt_sidecar_path, parse_sidecar, pid_sidecar_path, write_pid_sidecar};
pub use table::{Handler, InterruptError, InterruptTable, MAX_IRQS};

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
