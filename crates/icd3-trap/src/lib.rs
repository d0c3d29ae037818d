//! The MMIO trap engine (`spec.md` §4.D): installs the x86-64 access-fault
//! handler, decodes and dispatches each fault against the device registry,
//! and writes the result back into the trapping thread's saved CPU context.

mod engine;
mod regctx;

pub use engine::{install, TrapEngineGuard, TrapError};
pub use regctx::RegisterContext;
