//! Driver factory table.
//!
//! Maps a driver name (the `name` of a `[[driver]]` stanza) to the factory
//! that builds it. Constructed at startup, populated via `register()`, and
//! handed to `ServerCore` by value. No global state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::driver::{Driver, DriverError, DriverSpec};

/// Builds one driver instance from its resolved stanza.
pub type DriverFactory =
    Arc<dyn Fn(&DriverSpec) -> Result<Box<dyn Driver>, DriverError> + Send + Sync>;

/// Registry of available driver factories.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in driver.
    pub fn with_builtin() -> Self {
        let mut reg = Self::new();
        crate::drivers::register_all_drivers(&mut reg);
        reg
    }

    /// Register a driver factory.
    ///
    /// # Panics
    /// Panics if a driver with the same name is already registered.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DriverSpec) -> Result<Box<dyn Driver>, DriverError> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            panic!("Driver '{name}' is already registered");
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Get a driver factory by name.
    pub fn get_factory(&self, name: &str) -> Option<DriverFactory> {
        self.factories.get(name).cloned()
    }

    /// Create a driver instance for `spec`.
    ///
    /// # Errors
    /// Returns `DriverError::Config` if no driver named `spec.name` is
    /// registered, or whatever the factory rejects.
    pub fn create_driver(&self, spec: &DriverSpec) -> Result<Box<dyn Driver>, DriverError> {
        let factory = self
            .factories
            .get(&spec.name)
            .ok_or_else(|| DriverError::Config(format!("unknown driver '{}'", spec.name)))?;
        factory(spec)
    }

    /// List all registered driver names, sorted.
    pub fn list_drivers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}
