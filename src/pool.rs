//! Heater worker pool.
//!
//! The pool owns one OS thread per heater slot. Each heater alternates a busy
//! phase and an idle phase inside a fixed duty period, so `N` heaters at a duty
//! fraction `f` keep roughly `N * f` cores busy.
//!
//! # Architecture
//!
//! ```text
//! HeaterPool (Clone, Arc<PoolInner>)
//!   ├── PoolState (Mutex)
//!   │     └── Vec<Worker>            one per occupied slot
//!   │           ├── stop: Arc<AtomicBool>
//!   │           └── JoinHandle<()>   "{prefix}-heater-NNNN", pinned to slot CPU
//!   └── lease: Option<CancellationToken>
//! ```
//!
//! Workers share nothing but their stop flag. [`HeaterPool::teardown`] raises
//! every flag, unparks every thread and joins them, so no heater outlives the
//! call. A [`PoolLease`] hands the pool to a calibration run and tears it down
//! when dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::affinity::{pin_heater, CpuAllocator};
use crate::config::HearthConfig;
use crate::cpuset::resolve_heater_cpus;
use crate::error::{HearthError, Result};

/// Busy/idle split of one heater period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DutyCycle {
    fraction: f64,
    period: Duration,
}

impl DutyCycle {
    /// Create a duty cycle; `fraction` is clamped to `[0, 1]`.
    pub fn new(fraction: f64, period: Duration) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            period,
        }
    }

    /// Compute for the whole period.
    pub fn full(period: Duration) -> Self {
        Self::new(1.0, period)
    }

    /// Fraction of each period spent computing.
    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// Length of one period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Busy portion of one period.
    pub fn busy(&self) -> Duration {
        self.period.mul_f64(self.fraction)
    }

    /// Idle portion of one period.
    pub fn idle(&self) -> Duration {
        self.period.saturating_sub(self.busy())
    }
}

/// CPU work performed during a heater's busy phase.
pub trait Workload: Send + Sync + 'static {
    /// Keep the CPU busy until `deadline` passes or `stop` is raised.
    fn burn(&self, deadline: Instant, stop: &AtomicBool);
}

/// Integer arithmetic in a tight loop, checking the clock every few thousand
/// iterations.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinWorkload;

impl Workload for SpinWorkload {
    fn burn(&self, deadline: Instant, stop: &AtomicBool) {
        let mut acc = 0u64;
        while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
            for i in 0..4096u64 {
                acc = acc.wrapping_add(std::hint::black_box(i * i));
            }
        }
        std::hint::black_box(acc);
    }
}

/// Static settings of a heater pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Thread name prefix.
    pub prefix: String,
    /// Duty cycle used when the controller heats.
    pub duty: DutyCycle,
    /// Pin heaters to their slot CPU.
    pub pin: bool,
    /// Spawn attempts allowed per reconcile call beyond the first try.
    pub respawn_limit: u32,
}

impl PoolSettings {
    /// Derive pool settings from the runtime configuration.
    pub fn from_config(config: &HearthConfig) -> Self {
        Self {
            prefix: config.prefix.clone(),
            duty: config.duty_cycle(),
            pin: config.pin_workers,
            respawn_limit: config.worker_respawn_limit,
        }
    }
}

/// One running heater thread.
struct Worker {
    slot: usize,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.handle.thread().unpark();
    }

    /// Join the thread; returns false if the heater panicked.
    fn join(self) -> bool {
        self.handle.join().is_ok()
    }
}

struct PoolState {
    workers: Vec<Worker>,
    duty: DutyCycle,
    /// Slots that should be occupied; zero when idle.
    target: usize,
}

struct PoolInner {
    prefix: Arc<str>,
    allocator: CpuAllocator,
    default_duty: DutyCycle,
    pin: bool,
    respawn_limit: u32,
    workload: Arc<dyn Workload>,
    state: Mutex<PoolState>,
    lease: Mutex<Option<CancellationToken>>,
}

/// Pool of CPU-burning heater threads.
///
/// Cloning is cheap; clones share the same workers.
#[derive(Clone)]
pub struct HeaterPool {
    inner: Arc<PoolInner>,
}

impl HeaterPool {
    /// Create an empty pool over an explicit CPU list.
    ///
    /// Capacity equals the list length; duplicates are allowed and yield
    /// several heaters on one CPU.
    ///
    /// # Errors
    ///
    /// Returns `HearthError::NoCpusAvailable` for an empty list.
    pub fn new(cpus: Vec<usize>, settings: PoolSettings) -> Result<Self> {
        Self::with_workload(cpus, settings, Arc::new(SpinWorkload))
    }

    /// Create an empty pool running a custom workload.
    pub fn with_workload(
        cpus: Vec<usize>,
        settings: PoolSettings,
        workload: Arc<dyn Workload>,
    ) -> Result<Self> {
        let allocator = CpuAllocator::new(cpus)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                prefix: settings.prefix.as_str().into(),
                allocator,
                default_duty: settings.duty,
                pin: settings.pin,
                respawn_limit: settings.respawn_limit,
                workload,
                state: Mutex::new(PoolState {
                    workers: Vec::new(),
                    duty: settings.duty,
                    target: 0,
                }),
                lease: Mutex::new(None),
            }),
        })
    }

    /// Create a pool over the configured cpuset (all CPUs when unset).
    pub fn from_config(config: &HearthConfig) -> Result<Self> {
        let cpus = resolve_heater_cpus(config.cpuset.as_deref())?;
        Self::new(cpus, PoolSettings::from_config(config))
    }

    /// Number of heaters the pool runs when fully heating.
    pub fn capacity(&self) -> usize {
        self.inner.allocator.len()
    }

    /// CPUs backing the heater slots.
    pub fn cpus(&self) -> &[usize] {
        self.inner.allocator.cpus()
    }

    /// Heaters whose thread is still alive.
    pub fn active_workers(&self) -> usize {
        self.inner
            .state
            .lock()
            .workers
            .iter()
            .filter(|w| w.is_running())
            .count()
    }

    /// Whether the pool is meant to be heating, even if every heater has died.
    pub fn is_heating(&self) -> bool {
        self.inner.state.lock().target > 0
    }

    /// Start one heater per slot at the configured duty cycle.
    ///
    /// Returns the number of running heaters.
    ///
    /// # Errors
    ///
    /// `PoolBusy` while a calibration run holds the pool;
    /// `WorkerSpawnFailure` if some slots could not be filled within the retry
    /// bound (the heaters that did start keep running).
    pub fn heat(&self) -> Result<usize> {
        if self.is_leased() {
            return Err(HearthError::PoolBusy("leased to a calibration run"));
        }
        let inner = &self.inner;
        inner.scale(inner.allocator.len(), inner.default_duty)
    }

    /// Refill heater slots left empty while the pool should be heating.
    ///
    /// Covers heaters that died and slots that failed to start. At most `respawn_limit` spawn attempts are made per call. Returns the
    /// number of heaters restarted.
    ///
    /// # Errors
    ///
    /// `WorkerSpawnFailure` when slots remain empty after the attempts.
    pub fn maintain(&self) -> Result<usize> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        inner.reap(&mut state);
        let wanted = state.target;
        if state.workers.len() >= wanted {
            return Ok(0);
        }
        let duty = state.duty;
        let before = state.workers.len();
        let result = inner.fill(&mut state, wanted, duty, 0);
        let respawned = state.workers.len() - before;
        if respawned > 0 {
            info!(respawned, wanted, "respawned crashed heaters");
        }
        result.map(|_| respawned)
    }

    /// Stop and join every heater. Returns how many were stopped.
    pub fn teardown(&self) -> usize {
        self.inner.teardown()
    }

    /// Hand the pool to a calibration run.
    ///
    /// # Errors
    ///
    /// `PoolBusy` if the pool is heating or already leased. A pool whose
    /// heaters all crashed is still heating until it is torn down.
    pub fn try_lease(&self) -> Result<PoolLease> {
        let mut lease = self.inner.lease.lock();
        if lease.is_some() {
            return Err(HearthError::PoolBusy("already leased"));
        }
        if self.is_heating() || self.active_workers() > 0 {
            return Err(HearthError::PoolBusy("heaters are running"));
        }
        let token = CancellationToken::new();
        *lease = Some(token.clone());
        debug!(prefix = %self.inner.prefix, "heater pool leased");
        Ok(PoolLease {
            pool: self.clone(),
            token,
        })
    }

    /// Whether a calibration run currently holds the pool.
    pub fn is_leased(&self) -> bool {
        self.inner.lease.lock().is_some()
    }

    /// Cancel the current lease, if any. The lease holder tears the pool down.
    pub fn revoke_lease(&self) -> bool {
        match self.inner.lease.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for HeaterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaterPool")
            .field("prefix", &self.inner.prefix)
            .field("capacity", &self.capacity())
            .field("active_workers", &self.active_workers())
            .field("leased", &self.is_leased())
            .finish()
    }
}

impl PoolInner {
    /// Bring the pool to exactly `n` heaters at `duty`.
    fn scale(&self, n: usize, duty: DutyCycle) -> Result<usize> {
        let mut state = self.state.lock();
        if state.duty != duty {
            Self::stop_workers(std::mem::take(&mut state.workers));
            state.duty = duty;
        }
        self.reap(&mut state);

        let surplus: Vec<Worker> = {
            let (keep, drop): (Vec<_>, Vec<_>) =
                state.workers.drain(..).partition(|w| w.slot < n);
            state.workers = keep;
            drop
        };
        Self::stop_workers(surplus);

        state.target = n;
        self.fill(&mut state, n, duty, 1)
    }

    /// Spawn heaters into empty slots below `wanted`.
    ///
    /// Each empty slot gets `first_tries` attempts for free; further attempts
    /// draw on the shared `respawn_limit` budget.
    fn fill(
        &self,
        state: &mut PoolState,
        wanted: usize,
        duty: DutyCycle,
        first_tries: u32,
    ) -> Result<usize> {
        let mut budget = self.respawn_limit;
        let mut attempts = 0u32;
        let mut missing = 0usize;

        for slot in 0..wanted {
            if state.workers.iter().any(|w| w.slot == slot) {
                continue;
            }
            let mut free = first_tries;
            loop {
                if free > 0 {
                    free -= 1;
                } else if budget > 0 {
                    budget -= 1;
                } else {
                    missing += 1;
                    break;
                }
                attempts += 1;
                match self.spawn_worker(slot, duty) {
                    Ok(worker) => {
                        state.workers.push(worker);
                        break;
                    }
                    Err(e) => warn!(%e, slot, "failed to spawn heater"),
                }
            }
        }

        if missing > 0 {
            return Err(HearthError::WorkerSpawnFailure {
                missing,
                wanted,
                attempts,
            });
        }
        Ok(state.workers.len())
    }

    fn spawn_worker(&self, slot: usize, duty: DutyCycle) -> std::io::Result<Worker> {
        let name = format!("{}-heater-{:04}", self.prefix, slot);
        let cpu = self.allocator.cpu_for_slot(slot);
        let pin = self.pin;
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let workload = Arc::clone(&self.workload);

        let handle = thread::Builder::new().name(name).spawn(move || {
            if pin {
                let name = thread::current().name().unwrap_or("heater").to_string();
                pin_heater(cpu, &name);
            }
            heater_loop(&worker_stop, duty, workload.as_ref());
        })?;

        debug!(slot, cpu, fraction = duty.fraction(), "heater started");
        Ok(Worker { slot, stop, handle })
    }

    /// Remove finished heaters, returning how many died.
    fn reap(&self, state: &mut PoolState) -> usize {
        let (alive, dead): (Vec<_>, Vec<_>) =
            state.workers.drain(..).partition(Worker::is_running);
        state.workers = alive;
        let count = dead.len();
        for worker in dead {
            let slot = worker.slot;
            if !worker.join() {
                warn!(slot, "heater thread panicked");
            } else {
                warn!(slot, "heater thread exited unexpectedly");
            }
        }
        count
    }

    fn teardown(&self) -> usize {
        let workers = {
            let mut state = self.state.lock();
            state.target = 0;
            std::mem::take(&mut state.workers)
        };
        let count = workers.len();
        Self::stop_workers(workers);
        if count > 0 {
            info!(prefix = %self.prefix, stopped = count, "heater pool torn down");
        }
        count
    }

    fn stop_workers(workers: Vec<Worker>) {
        for worker in &workers {
            worker.signal_stop();
        }
        for worker in workers {
            let slot = worker.slot;
            if !worker.join() {
                warn!(slot, "heater thread panicked before shutdown");
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        Self::stop_workers(std::mem::take(&mut self.state.get_mut().workers));
    }
}

fn heater_loop(stop: &AtomicBool, duty: DutyCycle, workload: &dyn Workload) {
    while !stop.load(Ordering::Acquire) {
        let start = Instant::now();
        workload.burn(start + duty.busy(), stop);

        let wake = start + duty.period();
        loop {
            if stop.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            if now >= wake {
                break;
            }
            thread::park_timeout(wake - now);
        }
    }
}

/// Exclusive use of the heater pool by a calibration run.
///
/// While a lease exists the controller cannot heat. The lease's token is
/// cancelled when the controller must force heating off; dropping the lease
/// stops every heater before returning.
pub struct PoolLease {
    pool: HeaterPool,
    token: CancellationToken,
}

impl PoolLease {
    /// Cancelled when the lease is revoked.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the lease was revoked.
    pub fn is_revoked(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of heater slots available to the holder.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Heaters currently alive.
    pub fn active_workers(&self) -> usize {
        self.pool.active_workers()
    }

    /// Load the CPU set to roughly `load` (0.0 - 1.0) of its capacity.
    ///
    /// Uses `ceil(capacity * load)` heaters at a full duty cycle; a load of
    /// zero stops every heater. Returns the number of running heaters.
    pub fn apply_load(&self, load: f64) -> Result<usize> {
        if self.is_revoked() {
            return Err(HearthError::Cancelled);
        }
        let inner = &self.pool.inner;
        let load = load.clamp(0.0, 1.0);
        let heaters = (inner.allocator.len() as f64 * load).ceil() as usize;
        inner.scale(heaters, DutyCycle::full(inner.default_duty.period()))
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.pool.inner.teardown();
        *self.pool.inner.lease.lock() = None;
        debug!(prefix = %self.pool.inner.prefix, "heater pool lease released");
    }
}

impl std::fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease")
            .field("capacity", &self.capacity())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}
