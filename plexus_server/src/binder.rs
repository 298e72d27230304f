//! Server configuration and driver binding.
//!
//! Turns the `[[driver]]` stanzas of a [`ServerConfig`] into registered
//! devices: resolve addresses, build the driver through its factory,
//! register every provided address, and give always-on drivers their
//! internal subscription.
//!
//! A failing stanza never stops the others. Each stanza is all-or-nothing:
//! if one of its addresses cannot be registered, the addresses it already
//! registered are rolled back.

use plexus_common::address::{Address, AddressError};
use plexus_common::config::{ConfigError, ServerSection};
use plexus_common::consts::MAX_DEVICES;
use plexus_common::interface::PLAYER;
use plexus_common::queue::Discipline;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::device_registry::RegistryError;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::driver::{DriverError, DriverSpec};
use crate::driver_registry::DriverRegistry;
use crate::lifecycle::DriverHandle;

/// Complete server configuration file.
///
/// # TOML Example
///
/// ```toml
/// [server]
/// port = 6665
///
/// [[driver]]
/// name = "dummy"
/// provides = ["position:0", "sonar:0"]
///
/// [driver.discipline]
/// "sonar:0" = "fifo"
///
/// [driver.options]
/// rate = 10.0
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Process-wide settings.
    #[serde(default)]
    pub server: ServerSection,

    /// Driver instantiations, in bind order.
    #[serde(default, rename = "driver")]
    pub drivers: Vec<DriverSection>,
}

/// One `[[driver]]` stanza.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverSection {
    /// Factory name.
    pub name: String,

    /// Addresses this instantiation binds.
    pub provides: Vec<String>,

    /// Addresses of devices it depends on.
    #[serde(default)]
    pub requires: Vec<String>,

    /// Start at server startup instead of on first subscription.
    #[serde(default)]
    pub alwayson: bool,

    /// Per-address queue discipline overrides.
    #[serde(default)]
    pub discipline: BTreeMap<String, Discipline>,

    /// Free-form options passed to the factory.
    #[serde(default)]
    pub options: toml::Table,
}

impl ServerConfig {
    /// Validate process-wide settings.
    ///
    /// Per-stanza problems are reported by [`bind`] instead, so one bad
    /// driver does not keep the others from loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        let total: usize = self.drivers.iter().map(|d| d.provides.len()).sum();
        if total > MAX_DEVICES {
            return Err(ConfigError::ValidationError(format!(
                "{total} devices configured, at most {MAX_DEVICES} supported"
            )));
        }
        Ok(())
    }
}

/// Failure of a single `[[driver]]` stanza.
#[derive(Debug, Error)]
pub enum BindError {
    /// No factory with this name.
    #[error("driver #{stanza}: unknown driver '{name}'")]
    UnknownDriver {
        /// Stanza position in the file.
        stanza: usize,
        /// Requested factory name.
        name: String,
    },

    /// An address string did not parse.
    #[error("driver #{stanza} ({name}): {source}")]
    Address {
        /// Stanza position in the file.
        stanza: usize,
        /// Factory name.
        name: String,
        /// Parse failure.
        #[source]
        source: AddressError,
    },

    /// Stanza is inconsistent, or the factory rejected it.
    #[error("driver #{stanza} ({name}): {source}")]
    Driver {
        /// Stanza position in the file.
        stanza: usize,
        /// Factory name.
        name: String,
        /// Underlying failure.
        #[source]
        source: DriverError,
    },

    /// An address collided with one already bound.
    #[error("driver #{stanza} ({name}): {source}")]
    Registry {
        /// Stanza position in the file.
        stanza: usize,
        /// Factory name.
        name: String,
        /// Underlying failure.
        #[source]
        source: RegistryError,
    },

    /// The driver is bound, but its startup subscription failed.
    #[error("driver #{stanza} ({name}): always-on start failed: {source}")]
    AlwaysOn {
        /// Stanza position in the file.
        stanza: usize,
        /// Factory name.
        name: String,
        /// Underlying failure.
        #[source]
        source: Box<DispatchError>,
    },
}

/// Outcome of binding a whole configuration.
#[derive(Debug, Default)]
pub struct BindReport {
    /// Drivers that ended up registered, in stanza order.
    pub drivers: Vec<DriverHandle>,
    /// One entry per failed stanza.
    pub errors: Vec<BindError>,
}

impl BindReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Resolved {
    spec: DriverSpec,
    overrides: BTreeMap<Address, Discipline>,
}

fn resolve(
    stanza: usize,
    section: &DriverSection,
    server: &ServerSection,
) -> Result<Resolved, BindError> {
    let parse = |s: &String| {
        Address::parse_with(s, server.host_id, server.robot).map_err(|source| BindError::Address {
            stanza,
            name: section.name.clone(),
            source,
        })
    };
    let config_err = |msg: String| BindError::Driver {
        stanza,
        name: section.name.clone(),
        source: DriverError::Config(msg),
    };

    let provides = section.provides.iter().map(parse).collect::<Result<Vec<_>, _>>()?;
    let requires = section.requires.iter().map(parse).collect::<Result<Vec<_>, _>>()?;

    if provides.is_empty() {
        return Err(config_err("provides no addresses".to_string()));
    }
    if let Some(addr) = provides.iter().find(|a| a.interf == PLAYER) {
        return Err(config_err(format!("{addr} is reserved for the server")));
    }

    let mut overrides = BTreeMap::new();
    for (key, discipline) in &section.discipline {
        let addr = parse(key)?;
        if !provides.contains(&addr) {
            return Err(config_err(format!(
                "discipline set for '{key}', which this driver does not provide"
            )));
        }
        overrides.insert(addr, *discipline);
    }

    Ok(Resolved {
        spec: DriverSpec {
            name: section.name.clone(),
            provides,
            requires,
            options: section.options.clone(),
        },
        overrides,
    })
}

/// Instantiate one stanza and register its addresses.
pub fn bind_driver(
    stanza: usize,
    section: &DriverSection,
    server: &ServerSection,
    drivers: &DriverRegistry,
    dispatcher: &Dispatcher,
) -> Result<DriverHandle, BindError> {
    if !drivers.contains(&section.name) {
        return Err(BindError::UnknownDriver {
            stanza,
            name: section.name.clone(),
        });
    }
    let Resolved { spec, overrides } = resolve(stanza, section, server)?;

    let driver = drivers
        .create_driver(&spec)
        .map_err(|source| BindError::Driver {
            stanza,
            name: section.name.clone(),
            source,
        })?;
    let disciplines: Vec<(Address, Discipline)> = spec
        .provides
        .iter()
        .map(|addr| {
            let d = overrides
                .get(addr)
                .copied()
                .unwrap_or_else(|| driver.default_discipline(addr));
            (*addr, d)
        })
        .collect();
    let handle = DriverHandle::new(driver, server.queue_capacity);

    let registry = dispatcher.registry();
    for (i, (addr, discipline)) in disciplines.iter().enumerate() {
        if let Err(source) = registry.register(*addr, &handle, *discipline) {
            for (done, _) in &disciplines[..i] {
                registry.unregister(done);
            }
            warn!(
                driver = %section.name,
                rolled_back = i,
                "Registration failed, instantiation rolled back"
            );
            return Err(BindError::Registry {
                stanza,
                name: section.name.clone(),
                source,
            });
        }
    }

    Ok(handle)
}

/// Give an always-on driver its server-internal subscription.
///
/// One subscription on the first address keeps the whole (possibly
/// multi-address) driver running.
fn start_always_on(
    stanza: usize,
    section: &DriverSection,
    handle: &DriverHandle,
    dispatcher: &Dispatcher,
) -> Result<(), BindError> {
    let Some(first) = handle.addresses().first().copied() else {
        return Ok(());
    };
    dispatcher
        .subscribe_internal(&first)
        .map_err(|source| BindError::AlwaysOn {
            stanza,
            name: section.name.clone(),
            source: Box::new(source),
        })?;
    info!(driver = %section.name, "Always-on driver started");
    Ok(())
}

/// Bind every stanza of `config`, continuing past failures.
///
/// An always-on driver whose startup subscription fails stays bound; an
/// ordinary subscription may still start it later.
pub fn bind(config: &ServerConfig, drivers: &DriverRegistry, dispatcher: &Dispatcher) -> BindReport {
    let mut report = BindReport::default();
    for (stanza, section) in config.drivers.iter().enumerate() {
        match bind_driver(stanza, section, &config.server, drivers, dispatcher) {
            Ok(handle) => {
                if section.alwayson
                    && let Err(e) = start_always_on(stanza, section, &handle, dispatcher)
                {
                    error!("{}", e);
                    report.errors.push(e);
                }
                report.drivers.push(handle);
            }
            Err(e) => {
                error!("{}", e);
                report.errors.push(e);
            }
        }
    }
    info!(
        bound = report.drivers.len(),
        failed = report.errors.len(),
        devices = dispatcher.registry().len(),
        "Driver binding complete"
    );
    report
}
