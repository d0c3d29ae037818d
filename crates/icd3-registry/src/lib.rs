//! Host-memory reservation and device registry for fabricated MMIO windows.
//!
//! This crate owns components A and B of the trap engine: carving out
//! `PROT_NONE` host memory for each device's guest-address window
//! ([`reservation`]), and the bounded table mapping addresses back to the
//! device that owns them ([`registry`]).

mod registry;
mod reservation;

pub use registry::{DeviceEntry, DeviceRegistry, RegistryError, MAX_DEVICES};
pub use reservation::{Reservation, ReservationError};
