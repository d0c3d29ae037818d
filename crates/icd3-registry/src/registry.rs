//! Device registry (`spec.md` §4.B).
//!
//! Tracks which fabricated guest-address windows are owned by which device,
//! backed one-to-one by a [`Reservation`]. Lookups during fault dispatch are
//! a linear scan over a small, bounded table — `MAX_DEVICES` is tiny enough
//! that this beats any indexed structure in both simplicity and cache
//! behaviour.

use std::path::PathBuf;

use crate::reservation::{self, Reservation, ReservationError};

/// Upper bound on simultaneously registered devices (`spec.md` §4.B).
pub const MAX_DEVICES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry is full (max {MAX_DEVICES} devices)")]
    AlreadyFull,
    #[error("device id {0} is already registered")]
    IdInUse(u32),
    #[error("window [{guest_base:#x}, {guest_base_end:#x}) overlaps device {existing_id}")]
    OverlapsExisting {
        guest_base: u64,
        guest_base_end: u64,
        existing_id: u32,
    },
    #[error("device id {0} is not registered")]
    NotFound(u32),
    #[error("failed to reserve host memory for the device window")]
    ReserveFailed(#[from] ReservationError),
}

/// One registered device's window and its backing reservation.
pub struct DeviceEntry {
    pub device_id: u32,
    pub guest_base: u64,
    pub size: u64,
    /// Local-stream endpoint the device's model listens on. `None` means
    /// this device always uses the in-process fallback responder
    /// (`spec.md` §3).
    pub model_endpoint: Option<PathBuf>,
    reservation: Reservation,
}

impl DeviceEntry {
    pub fn guest_end(&self) -> u64 {
        self.guest_base + self.size
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.guest_base && address < self.guest_end()
    }

    /// `false` if the window's real host address diverges from
    /// `guest_base` — MMIO faults for this device will never occur, only
    /// the `read_register`/`write_register` bypass works.
    pub fn is_trappable(&self) -> bool {
        self.reservation.is_in_place() && self.reservation.host_addr() == self.guest_base
    }
}

/// The process-wide table of registered devices.
///
/// Never panics: all fallible operations return a [`RegistryError`]
/// (`spec.md` §4.B: "Errors are non-fatal; the registry never panics.").
#[derive(Default)]
pub struct DeviceRegistry {
    entries: Vec<DeviceEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.entries.iter()
    }

    /// Reserves `[guest_base, guest_base + size)` and registers `device_id`
    /// as its owner, with no attached model (always uses the fallback
    /// responder). See [`DeviceRegistry::register_with_model`] to attach one.
    pub fn register(&mut self, device_id: u32, guest_base: u64, size: u64) -> Result<(), RegistryError> {
        self.register_with_model(device_id, guest_base, size, None)
    }

    /// As [`DeviceRegistry::register`], additionally recording the
    /// local-stream endpoint of the device's model.
    pub fn register_with_model(
        &mut self,
        device_id: u32,
        guest_base: u64,
        size: u64,
        model_endpoint: Option<PathBuf>,
    ) -> Result<(), RegistryError> {
        if self.entries.len() >= MAX_DEVICES {
            return Err(RegistryError::AlreadyFull);
        }
        if self.entries.iter().any(|e| e.device_id == device_id) {
            return Err(RegistryError::IdInUse(device_id));
        }
        let guest_end = guest_base + size;
        if let Some(existing) = self
            .entries
            .iter()
            .find(|e| guest_base < e.guest_end() && e.guest_base < guest_end)
        {
            return Err(RegistryError::OverlapsExisting {
                guest_base,
                guest_base_end: guest_end,
                existing_id: existing.device_id,
            });
        }

        let reservation = reservation::reserve(guest_base, size)?;
        if !reservation.is_in_place() {
            tracing::warn!(
                device_id,
                guest_base = format_args!("{:#x}", guest_base),
                "device window registered out-of-place; it will never raise a real MMIO fault"
            );
        }
        self.entries.push(DeviceEntry {
            device_id,
            guest_base,
            size,
            model_endpoint,
            reservation,
        });
        Ok(())
    }

    /// Releases `device_id`'s reservation and removes it from the table.
    ///
    /// Uses swap-removal: the freed slot is filled by whichever entry was
    /// last, so order is not preserved (`spec.md` §4.B compaction).
    pub fn unregister(&mut self, device_id: u32) -> Result<(), RegistryError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.device_id == device_id)
            .ok_or(RegistryError::NotFound(device_id))?;
        self.entries.swap_remove(idx);
        Ok(())
    }

    /// Finds the device whose window contains `address`, if any.
    pub fn lookup(&self, address: u64) -> Option<&DeviceEntry> {
        self.entries.iter().find(|e| e.contains(address))
    }

    pub fn get(&self, device_id: u32) -> Option<&DeviceEntry> {
        self.entries.iter().find(|e| e.device_id == device_id)
    }
}
