//! Built-in driver implementations.
//!
//! - [`dummy`] - Canned data for development and testing without hardware
//! - [`relay`] - Re-exposes one device under another address
//! - [`logsink`] - Lossless sink that logs what it receives
//!
//! # Adding New Drivers
//!
//! 1. Create a new submodule under `drivers/`
//! 2. Implement the `Driver` trait from `crate::driver`
//! 3. Register its factory in [`register_all_drivers`]

pub mod dummy;
pub mod logsink;
pub mod relay;

use crate::driver_registry::DriverRegistry;

/// Register every built-in driver.
pub fn register_all_drivers(registry: &mut DriverRegistry) {
    registry.register("dummy", dummy::create_driver);
    registry.register("relay", relay::create_driver);
    registry.register("logsink", logsink::create_driver);
}
