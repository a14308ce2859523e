//! Platform key vault (spec component 4.A): an OS-principal-bound sealing
//! primitive used once at startup to unwrap the DB master key.

pub mod master_key;
pub mod platform;

pub use platform::{forget_wrapping_key, seal, unseal};
