//! Device registry: the authoritative Address → driver binding set.
//!
//! One registry-wide lock guards the map, the per-address discipline and
//! the subscription edges. It is held only for map operations and never
//! while driver code runs.

use parking_lot::Mutex;
use plexus_common::address::{Address, MatchPolicy};
use plexus_common::queue::{Discipline, QueueHandle};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::lifecycle::DriverHandle;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The address is already bound.
    #[error("address {0} is already bound")]
    DuplicateAddress(Address),

    /// No driver is bound to the address.
    #[error("no device at {0}")]
    UnknownAddress(Address),
}

/// One subscriber queue with the number of times it subscribed.
#[derive(Debug, Clone)]
struct Edge {
    queue: QueueHandle,
    count: usize,
}

struct Entry {
    /// Address as registered (the map key may be policy-reduced).
    addr: Address,
    driver: DriverHandle,
    discipline: Discipline,
    edges: Vec<Edge>,
    /// Registration order, for reverse-order teardown.
    order: u64,
}

#[derive(Default)]
struct Inner {
    map: BTreeMap<Address, Entry>,
    next_order: u64,
}

/// Snapshot of the subscribers of one address, taken under the lock.
#[derive(Debug, Clone)]
pub struct Fanout {
    /// Address as registered.
    pub addr: Address,
    pub discipline: Discipline,
    pub queues: Vec<QueueHandle>,
}

/// Concurrent map of bound devices.
pub struct DeviceRegistry {
    policy: MatchPolicy,
    inner: Mutex<Inner>,
}

impl DeviceRegistry {
    pub fn new(policy: MatchPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Bind `addr` to `driver`.
    ///
    /// # Errors
    /// Returns `RegistryError::DuplicateAddress` if an address matching
    /// `addr` under the registry's policy is already bound; the existing
    /// binding is left untouched.
    pub fn register(
        &self,
        addr: Address,
        driver: &DriverHandle,
        discipline: Discipline,
    ) -> Result<(), RegistryError> {
        let key = self.policy.key(&addr);
        {
            let mut inner = self.inner.lock();
            if inner.map.contains_key(&key) {
                return Err(RegistryError::DuplicateAddress(addr));
            }
            let order = inner.next_order;
            inner.next_order += 1;
            inner.map.insert(
                key,
                Entry {
                    addr,
                    driver: driver.clone(),
                    discipline,
                    edges: Vec::new(),
                    order,
                },
            );
        }
        driver.bind_address(addr);
        info!(
            addr = %addr,
            driver = driver.name(),
            discipline = ?discipline,
            "Registered device"
        );
        Ok(())
    }

    /// Driver bound to `addr`.
    pub fn lookup(&self, addr: &Address) -> Option<DriverHandle> {
        self.resolve(addr).map(|(_, driver)| driver)
    }

    /// Registered address and driver matching `addr`.
    pub fn resolve(&self, addr: &Address) -> Option<(Address, DriverHandle)> {
        let inner = self.inner.lock();
        inner
            .map
            .get(&self.policy.key(addr))
            .map(|e| (e.addr, e.driver.clone()))
    }

    /// Remove one binding. Used to roll back a partial instantiation.
    pub fn unregister(&self, addr: &Address) -> Option<DriverHandle> {
        let entry = self.inner.lock().map.remove(&self.policy.key(addr))?;
        entry.driver.unbind_address(&entry.addr);
        debug!(addr = %entry.addr, driver = entry.driver.name(), "Unregistered device");
        Some(entry.driver)
    }

    /// Tear everything down at server shutdown.
    ///
    /// Every driver is forced Idle (if running) and destroyed, newest
    /// registration first, so drivers that depend on earlier ones stop
    /// before their dependencies. The bindings stay in place until every
    /// driver is destroyed, so a shutting-down driver can still release
    /// the devices it subscribed to.
    pub fn unregister_all(&self) {
        let mut drivers: Vec<(u64, DriverHandle)> = Vec::new();
        {
            let inner = self.inner.lock();
            for entry in inner.map.values() {
                match drivers.iter_mut().find(|(_, d)| d.ptr_eq(&entry.driver)) {
                    Some(slot) => slot.0 = slot.0.max(entry.order),
                    None => drivers.push((entry.order, entry.driver.clone())),
                }
            }
        }
        drivers.sort_by(|a, b| b.0.cmp(&a.0));

        info!(count = drivers.len(), "Destroying drivers");
        for (_, driver) in &drivers {
            driver.destroy();
        }

        let entries = std::mem::take(&mut self.inner.lock().map);
        for entry in entries.into_values() {
            entry.driver.unbind_address(&entry.addr);
        }
    }

    /// Every bound address, in address order.
    pub fn devices(&self) -> Vec<Address> {
        self.inner.lock().map.values().map(|e| e.addr).collect()
    }

    pub fn discipline(&self, addr: &Address) -> Option<Discipline> {
        self.inner
            .lock()
            .map
            .get(&self.policy.key(addr))
            .map(|e| e.discipline)
    }

    /// Consistent snapshot of the subscriber queues of `addr`.
    pub fn subscribers(&self, addr: &Address) -> Option<Fanout> {
        let inner = self.inner.lock();
        inner.map.get(&self.policy.key(addr)).map(|e| Fanout {
            addr: e.addr,
            discipline: e.discipline,
            queues: e.edges.iter().map(|edge| edge.queue.clone()).collect(),
        })
    }

    /// Number of subscriptions `queue` holds on `addr`.
    pub fn edge_count(&self, addr: &Address, queue: &QueueHandle) -> usize {
        let inner = self.inner.lock();
        inner
            .map
            .get(&self.policy.key(addr))
            .and_then(|e| e.edges.iter().find(|edge| edge.queue == *queue))
            .map_or(0, |edge| edge.count)
    }

    /// Record one subscription of `queue` to `addr`.
    pub fn add_edge(&self, addr: &Address, queue: &QueueHandle) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .map
            .get_mut(&self.policy.key(addr))
            .ok_or(RegistryError::UnknownAddress(*addr))?;
        match entry.edges.iter_mut().find(|edge| edge.queue == *queue) {
            Some(edge) => edge.count += 1,
            None => entry.edges.push(Edge {
                queue: queue.clone(),
                count: 1,
            }),
        }
        Ok(())
    }

    /// Release one subscription of `queue` to `addr`.
    ///
    /// Returns `Ok(false)` if `queue` held no subscription there.
    pub fn remove_edge(&self, addr: &Address, queue: &QueueHandle) -> Result<bool, RegistryError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .map
            .get_mut(&self.policy.key(addr))
            .ok_or(RegistryError::UnknownAddress(*addr))?;
        let Some(pos) = entry.edges.iter().position(|edge| edge.queue == *queue) else {
            return Ok(false);
        };
        entry.edges[pos].count -= 1;
        if entry.edges[pos].count == 0 {
            entry.edges.remove(pos);
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }
}
