//! # Driver Lifecycle Tests
//!
//! Subscription-counted start/stop through the public dispatcher API:
//!
//! - Setup runs exactly once per 0→1, Shutdown once per 1→0
//! - Setup failure leaves the driver idle with no thread
//! - Last unsubscribe joins the worker before returning
//! - Multi-address drivers count subscriptions in aggregate
//! - Main-loop faults stop the thread but keep the binding
//! - Server teardown lets dependent drivers release their devices

use plexus_common::address::{Address, MatchPolicy};
use plexus_common::interface::{LASER, POSITION, SONAR};
use plexus_common::queue::{Discipline, QueueHandle};
use plexus_server::drivers::relay::RelayDriver;
use plexus_server::{
    DeviceRegistry, DispatchError, Dispatcher, Driver, DriverContext, DriverError, DriverHandle,
    DriverState, LifecycleError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

// ─── Helpers ────────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    setups: AtomicUsize,
    shutdowns: AtomicUsize,
    /// True while `run()` is executing.
    in_run: AtomicBool,
    fail_setup: AtomicBool,
}

#[derive(Clone, Copy, PartialEq)]
enum RunMode {
    Loop,
    Fail,
    Panic,
}

struct Tracked {
    counters: Arc<Counters>,
    mode: RunMode,
}

impl Driver for Tracked {
    fn name(&self) -> &str {
        "tracked"
    }

    fn setup(&mut self, _ctx: &DriverContext) -> Result<(), DriverError> {
        self.counters.setups.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_setup.load(Ordering::SeqCst) {
            return Err(DriverError::SetupFailed("device not found".to_string()));
        }
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &DriverContext) -> Result<(), DriverError> {
        // The worker must be gone before shutdown runs.
        assert!(!self.counters.in_run.load(Ordering::SeqCst));
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn run(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        self.counters.in_run.store(true, Ordering::SeqCst);
        let result = match self.mode {
            RunMode::Loop => {
                while ctx.sleep(Duration::from_millis(5)) {}
                Ok(())
            }
            RunMode::Fail => Err(DriverError::Runtime("bus fault".to_string())),
            RunMode::Panic => {
                self.counters.in_run.store(false, Ordering::SeqCst);
                panic!("driver bug");
            }
        };
        self.counters.in_run.store(false, Ordering::SeqCst);
        result
    }
}

/// Remembers how many subscriber queues its own address still had
/// when it shut down (`None`: the address was already unbound).
struct Downstream {
    addr: Address,
    edges_at_shutdown: Arc<Mutex<Option<Option<usize>>>>,
}

impl Driver for Downstream {
    fn name(&self) -> &str {
        "downstream"
    }

    fn setup(&mut self, _ctx: &DriverContext) -> Result<(), DriverError> {
        Ok(())
    }

    fn shutdown(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        let edges = ctx
            .dispatcher()
            .registry()
            .subscribers(&self.addr)
            .map(|f| f.queues.len());
        *self.edges_at_shutdown.lock() = Some(edges);
        Ok(())
    }
}

fn setup(addrs: &[Address], mode: RunMode) -> (Dispatcher, DriverHandle, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let registry = Arc::new(DeviceRegistry::new(MatchPolicy::Full));
    let handle = DriverHandle::new(
        Box::new(Tracked {
            counters: Arc::clone(&counters),
            mode,
        }),
        8,
    );
    for addr in addrs {
        registry
            .register(*addr, &handle, Discipline::Overwrite)
            .expect("register");
    }
    (Dispatcher::new(registry), handle, counters)
}

fn queue() -> QueueHandle {
    QueueHandle::new(8, Discipline::Overwrite)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

// ─── Start / stop ───────────────────────────────────────────────────

#[test]
fn test_setup_and_shutdown_once_per_transition() {
    let laser = Address::local(LASER, 0);
    let (d, handle, c) = setup(&[laser], RunMode::Loop);
    let (a, b) = (queue(), queue());

    d.subscribe(&laser, &a).unwrap();
    d.subscribe(&laser, &b).unwrap();
    assert_eq!(c.setups.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), DriverState::Running);

    d.unsubscribe(&laser, &a).unwrap();
    assert_eq!(c.shutdowns.load(Ordering::SeqCst), 0);
    assert!(handle.is_worker_alive());

    d.unsubscribe(&laser, &b).unwrap();
    assert_eq!(c.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), DriverState::Idle);

    // Restart from Idle.
    d.subscribe(&laser, &a).unwrap();
    assert_eq!(c.setups.load(Ordering::SeqCst), 2);
    d.unsubscribe(&laser, &a).unwrap();
    assert_eq!(c.shutdowns.load(Ordering::SeqCst), 2);
}

#[test]
fn test_churn_never_reenters_setup() {
    let laser = Address::local(LASER, 0);
    let (d, handle, c) = setup(&[laser], RunMode::Loop);
    let anchor = queue();
    d.subscribe(&laser, &anchor).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let d = d.clone();
            thread::spawn(move || {
                let q = QueueHandle::new(4, Discipline::Overwrite);
                for _ in 0..50 {
                    d.subscribe(&laser, &q).unwrap();
                    d.unsubscribe(&laser, &q).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(c.setups.load(Ordering::SeqCst), 1);
    assert_eq!(c.shutdowns.load(Ordering::SeqCst), 0);
    assert_eq!(handle.total_subscriptions(), 1);

    d.unsubscribe(&laser, &anchor).unwrap();
    assert_eq!(c.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_setup_failure_leaves_driver_idle() {
    let laser = Address::local(LASER, 0);
    let (d, handle, c) = setup(&[laser], RunMode::Loop);
    c.fail_setup.store(true, Ordering::SeqCst);
    let q = queue();

    let err = d.subscribe(&laser, &q).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Lifecycle(LifecycleError::SetupFailed { .. })
    ));
    assert_eq!(handle.total_subscriptions(), 0);
    assert!(!handle.is_worker_alive());
    assert_eq!(d.registry().edge_count(&laser, &q), 0);
    assert_eq!(c.shutdowns.load(Ordering::SeqCst), 0);

    // A later subscribe may retry.
    c.fail_setup.store(false, Ordering::SeqCst);
    d.subscribe(&laser, &q).unwrap();
    assert_eq!(c.setups.load(Ordering::SeqCst), 2);
    assert_eq!(handle.state(), DriverState::Running);
    d.unsubscribe(&laser, &q).unwrap();
}

#[test]
fn test_last_unsubscribe_joins_worker() {
    let laser = Address::local(LASER, 0);
    let (d, handle, c) = setup(&[laser], RunMode::Loop);
    let q = queue();
    d.subscribe(&laser, &q).unwrap();
    assert!(wait_until(|| c.in_run.load(Ordering::SeqCst)));

    d.unsubscribe(&laser, &q).unwrap();
    assert!(!c.in_run.load(Ordering::SeqCst));
    assert!(!handle.is_worker_alive());
    assert_eq!(c.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unsubscribe_without_subscription_fails() {
    let laser = Address::local(LASER, 0);
    let (d, handle, _c) = setup(&[laser], RunMode::Loop);
    let err = d.unsubscribe(&laser, &queue()).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Lifecycle(LifecycleError::NotSubscribed { .. })
    ));
    assert!(matches!(
        handle.unsubscribe(&laser),
        Err(LifecycleError::NotSubscribed { .. })
    ));
}

// ─── Multi-address drivers ──────────────────────────────────────────

#[test]
fn test_multidriver_counts_in_aggregate() {
    let pos = Address::local(POSITION, 0);
    let sonar = Address::local(SONAR, 0);
    let (d, handle, c) = setup(&[pos, sonar], RunMode::Loop);
    let q = queue();

    d.subscribe(&pos, &q).unwrap();
    d.subscribe(&sonar, &q).unwrap();
    assert_eq!(c.setups.load(Ordering::SeqCst), 1);
    assert_eq!(handle.subscriptions(&pos), 1);
    assert_eq!(handle.subscriptions(&sonar), 1);

    d.unsubscribe(&pos, &q).unwrap();
    assert_eq!(handle.state(), DriverState::Running);
    d.unsubscribe(&sonar, &q).unwrap();
    assert_eq!(handle.state(), DriverState::Idle);
    assert_eq!(c.shutdowns.load(Ordering::SeqCst), 1);
}

// ─── Runtime faults ─────────────────────────────────────────────────

#[test]
fn test_main_loop_error_stops_thread_only() {
    let laser = Address::local(LASER, 0);
    let (d, handle, c) = setup(&[laser], RunMode::Fail);
    let q = queue();
    d.subscribe(&laser, &q).unwrap();

    assert!(wait_until(|| !handle.is_worker_alive()));
    assert_eq!(handle.state(), DriverState::Running);
    assert!(d.registry().lookup(&laser).is_some());

    d.unsubscribe(&laser, &q).unwrap();
    assert_eq!(c.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_main_loop_panic_is_contained() {
    let laser = Address::local(LASER, 0);
    let (d, handle, c) = setup(&[laser], RunMode::Panic);
    let q = queue();
    d.subscribe(&laser, &q).unwrap();

    assert!(wait_until(|| !handle.is_worker_alive()));
    d.unsubscribe(&laser, &q).unwrap();
    assert_eq!(c.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), DriverState::Idle);

    // The driver came back and can start again.
    d.subscribe(&laser, &q).unwrap();
    assert_eq!(c.setups.load(Ordering::SeqCst), 2);
    d.unsubscribe(&laser, &q).unwrap();
}

#[test]
fn test_destroy_forces_running_driver_down() {
    let laser = Address::local(LASER, 0);
    let (d, handle, c) = setup(&[laser], RunMode::Loop);
    d.subscribe(&laser, &queue()).unwrap();

    d.registry().unregister_all();
    assert_eq!(handle.state(), DriverState::Destroyed);
    assert_eq!(c.shutdowns.load(Ordering::SeqCst), 1);
    assert!(handle.inbox().is_closed());
    assert!(matches!(
        handle.subscribe(&laser, &d),
        Err(LifecycleError::Destroyed(_))
    ));
}

#[test]
fn test_teardown_lets_relay_release_its_downstream() {
    let registry = Arc::new(DeviceRegistry::new(MatchPolicy::Full));
    let d = Dispatcher::new(Arc::clone(&registry));
    let real = Address::local(POSITION, 0);
    let relayed = Address::local(POSITION, 1);

    let edges_at_shutdown = Arc::new(Mutex::new(None));
    let downstream = DriverHandle::new(
        Box::new(Downstream {
            addr: real,
            edges_at_shutdown: Arc::clone(&edges_at_shutdown),
        }),
        8,
    );
    registry.register(real, &downstream, Discipline::Overwrite).unwrap();
    let relay = DriverHandle::new(Box::new(RelayDriver::new(relayed, real).unwrap()), 8);
    registry.register(relayed, &relay, Discipline::Overwrite).unwrap();

    d.subscribe(&relayed, &queue()).unwrap();
    assert_eq!(downstream.state(), DriverState::Running);

    registry.unregister_all();

    // The relay's own unsubscribe stopped the downstream driver, while its
    // binding was still in place and after its last edge was released.
    assert_eq!(*edges_at_shutdown.lock(), Some(Some(0)));
    assert_eq!(relay.state(), DriverState::Destroyed);
    assert_eq!(downstream.state(), DriverState::Destroyed);
    assert!(registry.is_empty());
}
