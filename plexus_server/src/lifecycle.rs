//! Subscription-counted driver lifecycle.
//!
//! ```text
//! Created ──register──► Configured ──0→1──► Running ──1→0──► Idle
//!                                             ▲                │
//!                                             └──────0→1───────┘
//!                     any ──destroy──► Destroyed
//! ```
//!
//! - 0→1 (aggregate count): `setup()` in the caller's thread; on success
//!   the driver moves into a fresh worker thread running `run()`.
//! - 1→0: cancel, join (the driver comes back), then `shutdown()`.
//! - Everything else only adjusts counters.
//!
//! All transitions of one driver are serialized by its setup lock. That
//! lock is distinct from any driver buffer lock and from the registry lock,
//! and is the only lock held while user `setup`/`shutdown` code runs.

use parking_lot::Mutex;
use plexus_common::address::Address;
use plexus_common::queue::{Discipline, QueueHandle};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::driver::{CancelToken, Driver, DriverContext, DriverError};

/// Lifecycle transition errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// `setup()` failed; the driver stays Idle with count 0.
    #[error("driver '{driver}' setup failed: {source}")]
    SetupFailed {
        /// Driver name.
        driver: String,
        /// Underlying failure.
        #[source]
        source: Box<DriverError>,
    },

    /// `shutdown()` failed; the driver is Idle regardless.
    #[error("driver '{driver}' shutdown failed: {source}")]
    ShutdownFailed {
        /// Driver name.
        driver: String,
        /// Underlying failure.
        #[source]
        source: Box<DriverError>,
    },

    /// Unsubscribe without a matching subscribe.
    #[error("{addr} has no subscriptions to release")]
    NotSubscribed {
        /// Address of the unsubscribe.
        addr: Address,
    },

    /// The driver has been torn down at server shutdown.
    #[error("driver '{0}' is destroyed")]
    Destroyed(String),
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Constructed, not yet bound to any address.
    Created,
    /// Bound, never started.
    Configured,
    /// Stopped after at least one run.
    Idle,
    /// Worker thread started and subscribers present.
    Running,
    /// Torn down; rejects further subscriptions.
    Destroyed,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

type WorkerResult = (Box<dyn Driver>, DriverContext);

struct Worker {
    cancel: CancelToken,
    join: JoinHandle<WorkerResult>,
}

struct Lifecycle {
    state: DriverState,
    /// `None` while the worker owns the driver.
    driver: Option<Box<dyn Driver>>,
    counts: BTreeMap<Address, usize>,
    total: usize,
    worker: Option<Worker>,
}

struct DriverCell {
    name: String,
    inbox: QueueHandle,
    addresses: Mutex<Vec<Address>>,
    setup: Mutex<Lifecycle>,
}

/// Shared handle to one driver instantiation.
///
/// Cloning is cheap; clones compare equal ([`ptr_eq`](Self::ptr_eq)).
#[derive(Clone)]
pub struct DriverHandle(Arc<DriverCell>);

impl DriverHandle {
    /// Wrap a driver. Its inbox is a lossless queue of `inbox_capacity`.
    pub fn new(driver: Box<dyn Driver>, inbox_capacity: usize) -> Self {
        let name = driver.name().to_string();
        Self(Arc::new(DriverCell {
            name,
            inbox: QueueHandle::new(inbox_capacity, Discipline::Fifo),
            addresses: Mutex::new(Vec::new()),
            setup: Mutex::new(Lifecycle {
                state: DriverState::Created,
                driver: Some(driver),
                counts: BTreeMap::new(),
                total: 0,
                worker: None,
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Inbound queue: CMDs and REQs for this driver, plus data from
    /// devices it subscribes to.
    pub fn inbox(&self) -> &QueueHandle {
        &self.0.inbox
    }

    /// Addresses bound so far, in registration order.
    pub fn addresses(&self) -> Vec<Address> {
        self.0.addresses.lock().clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn state(&self) -> DriverState {
        self.0.setup.lock().state
    }

    /// Subscriptions held on one address.
    pub fn subscriptions(&self, addr: &Address) -> usize {
        self.0.setup.lock().counts.get(addr).copied().unwrap_or(0)
    }

    /// Aggregate subscriptions over all addresses.
    pub fn total_subscriptions(&self) -> usize {
        self.0.setup.lock().total
    }

    /// True while the worker thread exists and has not finished.
    pub fn is_worker_alive(&self) -> bool {
        self.0
            .setup
            .lock()
            .worker
            .as_ref()
            .is_some_and(|w| !w.join.is_finished())
    }

    /// Record a newly bound address. Called by the registry.
    pub(crate) fn bind_address(&self, addr: Address) {
        self.0.addresses.lock().push(addr);
        let mut lc = self.0.setup.lock();
        if lc.state == DriverState::Created {
            lc.state = DriverState::Configured;
        }
    }

    /// Forget a bound address (registration rollback).
    pub(crate) fn unbind_address(&self, addr: &Address) {
        self.0.addresses.lock().retain(|a| a != addr);
    }

    /// Add one subscription on `addr`, starting the driver on 0→1.
    pub fn subscribe(&self, addr: &Address, dispatcher: &Dispatcher) -> Result<(), LifecycleError> {
        let mut lc = self.0.setup.lock();
        let state = lc.state;
        match state {
            DriverState::Destroyed => return Err(LifecycleError::Destroyed(self.0.name.clone())),
            DriverState::Running => {}
            _ if lc.total == 0 => self.start(&mut lc, dispatcher)?,
            _ => {}
        }
        *lc.counts.entry(*addr).or_insert(0) += 1;
        lc.total += 1;
        debug!(
            driver = %self.0.name,
            addr = %addr,
            count = lc.total,
            "Subscribed"
        );
        Ok(())
    }

    /// Release one subscription on `addr`, stopping the driver on 1→0.
    pub fn unsubscribe(&self, addr: &Address) -> Result<(), LifecycleError> {
        let mut lc = self.0.setup.lock();
        if lc.state == DriverState::Destroyed {
            return Err(LifecycleError::Destroyed(self.0.name.clone()));
        }
        match lc.counts.get(addr).copied().unwrap_or(0) {
            0 => return Err(LifecycleError::NotSubscribed { addr: *addr }),
            1 => {
                lc.counts.remove(addr);
            }
            n => {
                lc.counts.insert(*addr, n - 1);
            }
        }
        lc.total -= 1;
        debug!(
            driver = %self.0.name,
            addr = %addr,
            count = lc.total,
            "Unsubscribed"
        );
        if lc.total == 0 {
            self.stop(&mut lc)?;
        }
        Ok(())
    }

    /// Force the driver to Idle if running, then mark it Destroyed.
    ///
    /// Shutdown errors are logged, never returned.
    pub fn destroy(&self) {
        let mut lc = self.0.setup.lock();
        if lc.state == DriverState::Destroyed {
            return;
        }
        if lc.state == DriverState::Running {
            info!(
                driver = %self.0.name,
                subscribers = lc.total,
                "Forcing shutdown"
            );
            if let Err(e) = self.stop(&mut lc) {
                warn!(driver = %self.0.name, "{}", e);
            }
        }
        lc.counts.clear();
        lc.total = 0;
        lc.driver = None;
        lc.state = DriverState::Destroyed;
        self.0.inbox.close();
        debug!(driver = %self.0.name, "Destroyed");
    }

    fn start(&self, lc: &mut Lifecycle, dispatcher: &Dispatcher) -> Result<(), LifecycleError> {
        let Some(mut driver) = lc.driver.take() else {
            return Err(LifecycleError::Destroyed(self.0.name.clone()));
        };

        let inbox = self.0.inbox.clone();
        inbox.clear_interrupt();
        let cancel = CancelToken::for_queue(inbox.clone());
        let ctx = DriverContext::new(
            self.0.name.clone(),
            self.addresses(),
            inbox,
            dispatcher.clone(),
            cancel.clone(),
        );

        info!(driver = %self.0.name, "Setting up driver");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| driver.setup(&ctx)))
            .unwrap_or_else(|_| Err(DriverError::SetupFailed("setup panicked".to_string())));
        if let Err(e) = outcome {
            warn!(driver = %self.0.name, "Setup failed: {}", e);
            lc.driver = Some(driver);
            return Err(LifecycleError::SetupFailed {
                driver: self.0.name.clone(),
                source: Box::new(e),
            });
        }

        let name = self.0.name.clone();
        let spawned = thread::Builder::new()
            .name(format!("drv-{}", self.0.name))
            .spawn(move || run_worker(name, driver, ctx));

        match spawned {
            Ok(join) => {
                lc.worker = Some(Worker { cancel, join });
                lc.state = DriverState::Running;
                Ok(())
            }
            Err(e) => {
                // The driver went down with the closure; nothing left to shut down.
                error!(driver = %self.0.name, "Failed to spawn worker: {}", e);
                lc.state = DriverState::Destroyed;
                Err(LifecycleError::SetupFailed {
                    driver: self.0.name.clone(),
                    source: Box::new(DriverError::Io(e)),
                })
            }
        }
    }

    fn stop(&self, lc: &mut Lifecycle) -> Result<(), LifecycleError> {
        lc.state = DriverState::Idle;
        let Some(worker) = lc.worker.take() else {
            return Ok(());
        };

        worker.cancel.cancel();
        let (mut driver, ctx) = match worker.join.join() {
            Ok(returned) => returned,
            Err(_) => {
                // run_worker contains panics from run(); reaching here means
                // the worker itself failed and took the driver with it.
                error!(driver = %self.0.name, "Worker thread lost the driver");
                lc.state = DriverState::Destroyed;
                return Err(LifecycleError::Destroyed(self.0.name.clone()));
            }
        };

        info!(driver = %self.0.name, "Shutting down driver");
        let result = panic::catch_unwind(AssertUnwindSafe(|| driver.shutdown(&ctx)))
            .unwrap_or_else(|_| Err(DriverError::Runtime("shutdown panicked".to_string())));
        lc.driver = Some(driver);
        result.map_err(|e| {
            warn!(driver = %self.0.name, "Shutdown failed: {}", e);
            LifecycleError::ShutdownFailed {
                driver: self.0.name.clone(),
                source: Box::new(e),
            }
        })
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle")
            .field("name", &self.0.name)
            .field("inbox", &self.0.inbox.id())
            .finish()
    }
}

/// Body of a driver's worker thread.
///
/// Errors and panics from `run()` are logged and end the thread; the
/// driver value always comes back to the joiner.
fn run_worker(name: String, mut driver: Box<dyn Driver>, ctx: DriverContext) -> WorkerResult {
    debug!(driver = %name, "Worker started");
    match panic::catch_unwind(AssertUnwindSafe(|| driver.run(&ctx))) {
        Ok(Ok(())) => debug!(driver = %name, "Worker finished"),
        Ok(Err(e)) => error!(driver = %name, "Main loop fault, driver stopped: {}", e),
        Err(_) => error!(driver = %name, "Main loop panicked, driver stopped"),
    }
    (driver, ctx)
}
