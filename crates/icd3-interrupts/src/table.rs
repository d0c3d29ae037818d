//! The interrupt-handler table (`spec.md` §3: "a dense mapping from
//! `interrupt_id ∈ [0, MAX_IRQS)` to an optional handler").

use std::sync::{Arc, Mutex};

/// Upper bound on distinct interrupt identifiers.
pub const MAX_IRQS: usize = 32;

pub type Handler = dyn Fn(u32, u32) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InterruptError {
    #[error("interrupt id {0} is out of range (max {MAX_IRQS})")]
    OutOfRange(u32),
}

/// Process-wide table of registered interrupt handlers.
///
/// Handlers are invoked synchronously on the thread that observes the
/// signal (`spec.md` §3), so registration takes an `Arc` rather than
/// requiring `'static` borrows to be re-validated per dispatch.
pub struct InterruptTable {
    handlers: Mutex<[Option<Arc<Handler>>; MAX_IRQS]>,
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptTable {
    pub fn new() -> Self {
        InterruptTable {
            handlers: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    pub fn register(
        &self,
        interrupt_id: u32,
        handler: impl Fn(u32, u32) + Send + Sync + 'static,
    ) -> Result<(), InterruptError> {
        let idx = Self::index(interrupt_id)?;
        self.handlers.lock().unwrap()[idx] = Some(Arc::new(handler));
        Ok(())
    }

    pub fn unregister(&self, interrupt_id: u32) -> Result<(), InterruptError> {
        let idx = Self::index(interrupt_id)?;
        self.handlers.lock().unwrap()[idx] = None;
        Ok(())
    }

    /// Invokes the handler registered for `interrupt_id`, if any. Unknown
    /// or unregistered ids are logged and otherwise ignored: a model racing
    /// ahead of a driver's `register_interrupt_handler` call is routine,
    /// not a protocol error.
    pub fn dispatch(&self, device_id: u32, interrupt_id: u32) {
        let Ok(idx) = Self::index(interrupt_id) else {
            tracing::warn!(interrupt_id, "interrupt id out of range, dropping");
            return;
        };
        let handler = self.handlers.lock().unwrap()[idx].clone();
        match handler {
            Some(handler) => handler(device_id, interrupt_id),
            None => tracing::debug!(device_id, interrupt_id, "no handler registered, dropping"),
        }
    }

    fn index(interrupt_id: u32) -> Result<usize, InterruptError> {
        let idx = interrupt_id as usize;
        if idx < MAX_IRQS {
            Ok(idx)
        } else {
            Err(InterruptError::OutOfRange(interrupt_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn dispatch_invokes_registered_handler() {
        let table = InterruptTable::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        table.register(0x42, move |_device_id, interrupt_id| {
            seen2.store(interrupt_id, Ordering::SeqCst);
        }).unwrap();
        table.dispatch(1, 0x42);
        assert_eq!(seen.load(Ordering::SeqCst), 0x42);
    }

    #[test]
    fn dispatch_with_no_handler_does_not_panic() {
        let table = InterruptTable::new();
        table.dispatch(1, 5);
    }

    #[test]
    fn register_out_of_range_errors() {
        let table = InterruptTable::new();
        let err = table.register(MAX_IRQS as u32, |_, _| {}).unwrap_err();
        assert_eq!(err, InterruptError::OutOfRange(MAX_IRQS as u32));
    }

    #[test]
    fn unregister_then_dispatch_is_a_noop() {
        let table = InterruptTable::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        table.register(3, move |_, _| { seen2.fetch_add(1, Ordering::SeqCst); }).unwrap();
        table.unregister(3).unwrap();
        table.dispatch(1, 3);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
