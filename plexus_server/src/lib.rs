//! # Plexus Server Library
//!
//! Device server with pluggable drivers: drivers bind device addresses,
//! start when the first client subscribes and stop after the last one
//! leaves; clients talk to devices over TCP through a dispatcher that
//! routes data, commands and request/reply pairs.
//!
//! # Module Structure
//!
//! - [`core`] - ServerCore struct, accept loop and teardown
//! - [`binder`] - Config file → registered devices
//! - [`client`] - Per-connection sessions
//! - [`delivery`] - Data modes and SYNCH-terminated data rounds
//! - [`dispatcher`] - Publish, put, reply and subscription routing
//! - [`device_registry`] - Address → driver bindings and subscriber edges
//! - [`lifecycle`] - Subscription-counted driver start / stop
//! - [`driver`] - The `Driver` trait and its run context
//! - [`driver_registry`] - Driver factory registration
//! - [`drivers`] - Built-in driver implementations
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         plexus_server                             │
//! │  ┌──────────────┐    ┌──────────────┐    ┌─────────────────────┐  │
//! │  │ TCP sessions │◄──►│  Dispatcher  │◄──►│  DeviceRegistry     │  │
//! │  │  (client)    │    │              │    │  (addr → driver)    │  │
//! │  └──────────────┘    └──────┬───────┘    └─────────────────────┘  │
//! │                             │                                     │
//! │                             ▼                                     │
//! │                   ┌──────────────────┐                            │
//! │                   │  DriverHandle    │ one thread per running     │
//! │                   │  (lifecycle)     │ driver                     │
//! │                   └──────────────────┘                            │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

pub mod binder;
pub mod client;
pub mod core;
pub mod delivery;
pub mod device_registry;
pub mod dispatcher;
pub mod driver;
pub mod driver_registry;
pub mod drivers;
pub mod lifecycle;

// Re-export key types for convenience
pub use crate::binder::{BindError, BindReport, DriverSection, ServerConfig};
pub use crate::core::{ServerCore, ServerError};
pub use crate::device_registry::{DeviceRegistry, RegistryError};
pub use crate::dispatcher::{DispatchError, Dispatcher};
pub use crate::driver::{CancelToken, Driver, DriverContext, DriverError, DriverSpec};
pub use crate::driver_registry::{DriverFactory, DriverRegistry};
pub use crate::lifecycle::{DriverHandle, DriverState, LifecycleError};
