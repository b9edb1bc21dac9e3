//! Master orchestration: bring-up, the cyclic loop, publication.
//!
//! [`Orchestrator::bring_up`] drives the bus from INIT to OP and stands up
//! the shared-memory publication layer (directory, both process-data
//! regions, the tick broker). [`Orchestrator::run`] then enters the cyclic
//! loop:
//!
//! 1. Copy the shared output region into the stack's output image.
//! 2. Run one fieldbus exchange and validate the working counter.
//! 3. Copy the stack's input image into the shared input region.
//! 4. Serve the consumer mailboxes (state requests, stats reset).
//! 5. Publish timestamp and cycle statistics, then tick every registered
//!    consumer.
//!
//! A cycle whose working counter falls short of the expected value is not
//! published: the shared inputs keep their last good values and no tick
//! is sent. The loop re-reads the bus state on such cycles, publishes
//! whatever the slaves backslid to, and drives them back toward OP one
//! non-blocking request per cycle, acknowledging error states first; the
//! first complete cycle afterwards confirms the recovery. Failing to
//! reach OP during bring-up is survivable the same way; the bus stays up
//! in whatever state it reached and consumers can see that
//! `is_authorized` never went to 1.
//!
//! With the `rt` feature the loop runs under `SCHED_FIFO` with
//! `clock_nanosleep(TIMER_ABSTIME)` pacing on an isolated core; without it
//! a plain `thread::sleep` loop keeps approximate timing for development
//! and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ecx::consts::{input_segment_name, output_segment_name};
use ecx::state::{AL_ERROR_FLAG, AlState};
use ecx_shm::{BusDirectory, ProcessDataRegion, Role, ShmError, SyncBroker};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::MasterConfig;
use crate::discovery;
use crate::stack::{MasterStack, RETURN_TIMEOUT, STATE_RECHECK_TIMEOUT, STATE_TIMEOUT, StackError};

/// OP bring-up retry budget: one exchange plus a short state check per
/// attempt.
const OP_RECHECKS: u32 = 40;

// ─── Errors ─────────────────────────────────────────────────────────

/// Fatal master errors. Everything that can be survived (bad working
/// counter, refused state transition, slave errors) is logged and
/// published instead.
#[derive(Error, Debug)]
pub enum MasterError {
    /// The fieldbus stack failed during bring-up.
    #[error("fieldbus error: {0}")]
    Stack(#[from] StackError),

    /// The shared-memory publication layer could not be stood up.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),

    /// A real-time system call failed.
    #[error("real-time setup failed: {0}")]
    RtSetup(String),
}

// ─── Cycle statistics ───────────────────────────────────────────────

/// O(1) per-cycle timing statistics, updated every cycle with no
/// allocation.
#[derive(Debug, Clone)]
pub struct CycleStats {
    /// Total cycles executed.
    pub cycle_count: u64,
    /// Last cycle duration [ns].
    pub last_cycle_ns: i64,
    /// Minimum cycle duration [ns].
    pub min_cycle_ns: i64,
    /// Maximum cycle duration [ns].
    pub max_cycle_ns: i64,
    /// Running sum for average computation.
    pub sum_cycle_ns: i64,
    /// Maximum wake-up latency [ns] behind the cycle boundary.
    pub max_latency_ns: i64,
    /// Number of cycles that exceeded the budget.
    pub overruns: u64,
}

impl CycleStats {
    /// Zeroed stats.
    pub const fn new() -> Self {
        Self {
            cycle_count: 0,
            last_cycle_ns: 0,
            min_cycle_ns: i64::MAX,
            max_cycle_ns: 0,
            sum_cycle_ns: 0,
            max_latency_ns: 0,
            overruns: 0,
        }
    }

    /// Record one cycle.
    #[inline]
    pub fn record(&mut self, duration_ns: i64, latency_ns: i64) {
        self.cycle_count += 1;
        self.last_cycle_ns = duration_ns;
        if duration_ns < self.min_cycle_ns {
            self.min_cycle_ns = duration_ns;
        }
        if duration_ns > self.max_cycle_ns {
            self.max_cycle_ns = duration_ns;
        }
        self.sum_cycle_ns += duration_ns;
        if latency_ns > self.max_latency_ns {
            self.max_latency_ns = latency_ns;
        }
    }

    /// Average cycle time [ns] (0 before the first cycle).
    #[inline]
    pub fn avg_cycle_ns(&self) -> i64 {
        if self.cycle_count == 0 {
            0
        } else {
            self.sum_cycle_ns / self.cycle_count as i64
        }
    }

    /// Restart min/max/avg tracking. The overrun count survives a reset.
    pub fn reset(&mut self) {
        self.cycle_count = 0;
        self.last_cycle_ns = 0;
        self.min_cycle_ns = i64::MAX;
        self.max_cycle_ns = 0;
        self.sum_cycle_ns = 0;
        self.max_latency_ns = 0;
    }

    /// Last cycle duration [µs].
    pub fn last_us(&self) -> f64 {
        self.last_cycle_ns as f64 / 1_000.0
    }

    /// Minimum cycle duration [µs] (0 before the first cycle).
    pub fn min_us(&self) -> f64 {
        if self.cycle_count == 0 {
            0.0
        } else {
            self.min_cycle_ns as f64 / 1_000.0
        }
    }

    /// Maximum cycle duration [µs].
    pub fn max_us(&self) -> f64 {
        self.max_cycle_ns as f64 / 1_000.0
    }

    /// Average cycle duration [µs].
    pub fn avg_us(&self) -> f64 {
        self.avg_cycle_ns() as f64 / 1_000.0
    }
}

// ─── RT setup ───────────────────────────────────────────────────────

/// Lock all current and future memory pages.
///
/// No-op when the `rt` feature is not enabled.
#[cfg(feature = "rt")]
fn rt_mlockall() -> Result<(), MasterError> {
    use nix::sys::mman::{MlockallFlags, mlockall};
    mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE)
        .map_err(|e| MasterError::RtSetup(format!("mlockall failed: {e}")))?;
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_mlockall() -> Result<(), MasterError> {
    Ok(()) // No-op in simulation mode
}

/// Prefault stack pages so the cyclic loop never takes a stack fault.
fn prefault_stack() {
    let mut buf = [0u8; 1024 * 1024];
    // Prevent the compiler from optimizing the touch away.
    for byte in buf.iter_mut() {
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    core::hint::black_box(&buf);
}

/// Pin the current thread to a specific CPU core.
///
/// No-op when the `rt` feature is not enabled.
#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), MasterError> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| MasterError::RtSetup(format!("CpuSet::set({cpu}) failed: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| MasterError::RtSetup(format!("sched_setaffinity failed: {e}")))?;
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_affinity(_cpu: usize) -> Result<(), MasterError> {
    Ok(()) // No-op in simulation mode
}

/// Set SCHED_FIFO with the given RT priority.
///
/// No-op when the `rt` feature is not enabled.
#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), MasterError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(MasterError::RtSetup(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"
        )));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: i32) -> Result<(), MasterError> {
    Ok(()) // No-op in simulation mode
}

/// Full RT setup sequence: lock pages, prefault the stack, pin the core,
/// raise the scheduler class. Call before [`Orchestrator::run`].
///
/// In simulation builds (no `rt` feature) every step is a no-op.
pub fn rt_setup(cpu_core: usize, rt_priority: i32) -> Result<(), MasterError> {
    rt_mlockall()?;
    prefault_stack();
    rt_set_affinity(cpu_core)?;
    rt_set_scheduler(rt_priority)?;
    Ok(())
}

// ─── Orchestrator ───────────────────────────────────────────────────

/// Owns the fieldbus stack and the shared-memory publication layer.
#[derive(Debug)]
pub struct Orchestrator<S: MasterStack> {
    stack: S,
    directory: BusDirectory,
    input: ProcessDataRegion,
    output: ProcessDataRegion,
    broker: SyncBroker,
    expected_wkc: i32,
    cycle_time_ns: i64,
    stats: CycleStats,
    running: Arc<AtomicBool>,
    // Set by a working-counter shortfall; the next complete cycle
    // re-reads the bus state once to confirm the recovery.
    needs_recheck: bool,
}

impl<S: MasterStack> Orchestrator<S> {
    /// Bring the bus up and stand up the publication layer.
    ///
    /// Fails only on conditions nothing can be published for: interface
    /// open, an empty bus, mapping, or shared-memory creation. Not
    /// reaching OP is survivable and leaves the bus running degraded.
    pub fn bring_up(
        mut stack: S,
        config: &MasterConfig,
        running: Arc<AtomicBool>,
    ) -> Result<Self, MasterError> {
        stack.init(&config.ifname)?;
        info!(ifname = %config.ifname, "fieldbus interface open");

        let found = stack.config_init()?;
        if found == 0 {
            return Err(StackError::NoSlaves.into());
        }
        let mapped = stack.config_map()?;
        let safe_op = AlState::SafeOp.as_u8();
        let reached = stack.check_state(0, safe_op, STATE_TIMEOUT);
        if reached != safe_op {
            warn!(
                state = format_args!("{reached:#04x}"),
                "bus not in SAFE-OP after mapping"
            );
        }
        let expected_wkc = stack.expected_wkc();
        info!(slaves = found, image_bytes = mapped, expected_wkc, "bus enumerated and mapped");

        let mut directory = BusDirectory::for_instance(config.instance, Role::Owner)?;
        let report = discovery::run(&mut stack, directory.bus_mut());

        let input = ProcessDataRegion::create(
            &input_segment_name(config.instance),
            stack.input_image(0).len(),
        )?;
        let output = ProcessDataRegion::create(
            &output_segment_name(config.instance),
            stack.output_image(0).len(),
        )?;
        let broker = SyncBroker::create(config.instance)?;
        info!(
            input = %input.name(),
            output = %output.name(),
            variables = report.variables,
            "publication layer online"
        );

        let mut master = Self {
            stack,
            directory,
            input,
            output,
            broker,
            expected_wkc,
            cycle_time_ns: config.cycle_time_us as i64 * 1000,
            stats: CycleStats::new(),
            running,
            needs_recheck: false,
        };
        master.enter_op();
        Ok(master)
    }

    /// Request OP and retry with exchanges in between; slaves only accept
    /// OP once output data is flowing.
    fn enter_op(&mut self) {
        let op = AlState::Op.as_u8();
        self.stack.exchange(RETURN_TIMEOUT);
        self.stack.request_state(0, op);
        let mut reached = self.stack.read_state();
        for _ in 0..OP_RECHECKS {
            if reached == op {
                break;
            }
            self.stack.exchange(RETURN_TIMEOUT);
            reached = self.stack.check_state(0, op, STATE_RECHECK_TIMEOUT);
        }

        let bus = self.directory.bus_mut();
        bus.current_state = reached;
        if reached == op {
            bus.is_authorized = 1;
            // OP becomes the standing expectation; after a backslide the
            // cycle loop drives the bus back toward it.
            bus.request_state = op;
            bus.next_expected_state = op;
            info!("bus operational");
        } else {
            // Quiet the standing OP request so the mailbox is not
            // re-served with a blocking state check every cycle.
            bus.request_state = reached;
            bus.next_expected_state = reached;
            error!(
                state = format_args!("{reached:#04x}"),
                "bus did not reach OP, running degraded"
            );
        }
    }

    /// Enter the cyclic loop until the running flag is cleared.
    pub fn run(&mut self) -> Result<(), MasterError> {
        info!(
            cycle_time_us = self.cycle_time_ns / 1000,
            expected_wkc = self.expected_wkc,
            "entering cyclic exchange"
        );

        #[cfg(feature = "rt")]
        {
            self.run_rt_loop()
        }

        #[cfg(not(feature = "rt"))]
        {
            self.run_sim_loop()
        }
    }

    /// RT cycle loop: drift-free pacing with `clock_nanosleep(TIMER_ABSTIME)`
    /// on `CLOCK_MONOTONIC`.
    #[cfg(feature = "rt")]
    fn run_rt_loop(&mut self) -> Result<(), MasterError> {
        use nix::time::{ClockId, ClockNanosleepFlags, clock_gettime, clock_nanosleep};

        let clock = ClockId::CLOCK_MONOTONIC;
        let mut next_wake = clock_gettime(clock)
            .map_err(|e| MasterError::RtSetup(format!("clock_gettime: {e}")))?;

        while self.running.load(Ordering::SeqCst) {
            let cycle_start = clock_gettime(clock)
                .map_err(|e| MasterError::RtSetup(format!("clock_gettime: {e}")))?;
            let latency_ns = timespec_diff_ns(&cycle_start, &next_wake).max(0);
            next_wake = timespec_add_ns(next_wake, self.cycle_time_ns);

            let published = self.cycle_once();

            let cycle_end = clock_gettime(clock)
                .map_err(|e| MasterError::RtSetup(format!("clock_gettime: {e}")))?;
            let duration_ns = timespec_diff_ns(&cycle_end, &cycle_start);
            self.finish_cycle(duration_ns, latency_ns, published);

            let _ = clock_nanosleep(clock, ClockNanosleepFlags::TIMER_ABSTIME, &next_wake);
        }
        Ok(())
    }

    /// Simulation cycle loop with `thread::sleep` pacing.
    #[cfg(not(feature = "rt"))]
    fn run_sim_loop(&mut self) -> Result<(), MasterError> {
        use std::time::Duration;

        // thread::sleep never wakes early; trim a little so the next
        // cycle is not systematically late.
        const SLEEP_MARGIN: Duration = Duration::from_micros(10);

        let cycle = Duration::from_nanos(self.cycle_time_ns as u64);
        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();
            let published = self.cycle_once();
            let elapsed = started.elapsed();
            self.finish_cycle(elapsed.as_nanos() as i64, 0, published);

            if let Some(remaining) = cycle.checked_sub(elapsed) {
                std::thread::sleep(remaining.saturating_sub(SLEEP_MARGIN));
            }
        }
        Ok(())
    }

    /// One full cycle including timing, for callers that pace themselves.
    pub fn step(&mut self) {
        let started = Instant::now();
        let published = self.cycle_once();
        let duration_ns = started.elapsed().as_nanos() as i64;
        self.finish_cycle(duration_ns, 0, published);
    }

    /// Exchange once and move data across the shared boundary. Returns
    /// whether the cycle is publishable.
    fn cycle_once(&mut self) -> bool {
        // Consumer outputs first, so this cycle's frame carries them.
        {
            let image = self.stack.output_image_mut(0);
            let shared = self.output.as_slice();
            let n = image.len().min(shared.len());
            image[..n].copy_from_slice(&shared[..n]);
        }

        let wkc = self.stack.exchange(RETURN_TIMEOUT);
        while let Some(msg) = self.stack.next_error() {
            warn!(error = %msg, "stack error");
        }
        if wkc < self.expected_wkc {
            warn!(
                wkc,
                expected = self.expected_wkc,
                "incomplete working counter, cycle not published"
            );
            // The mailbox stays served so a consumer can still steer a
            // failing bus, then supervision re-reads and re-drives it.
            self.service_mailbox();
            self.supervise();
            return false;
        }

        {
            let image = self.stack.input_image(0);
            let shared = self.input.as_mut_slice();
            let n = image.len().min(shared.len());
            shared[..n].copy_from_slice(&image[..n]);
        }

        self.service_mailbox();
        if self.needs_recheck {
            self.supervise();
        }
        true
    }

    /// Serve the consumer-writable directory fields: the state request and
    /// the stats-reset flag.
    fn service_mailbox(&mut self) {
        let request = self.directory.bus().request_state;
        let current = self.directory.bus().current_state;
        if request != current {
            match AlState::from_u8(request) {
                Some(state) => {
                    info!(requested = %state, "serving consumer state request");
                    self.directory.bus_mut().next_expected_state = state.as_u8();
                    self.stack.request_state(0, state.as_u8());
                    let reached = self.stack.check_state(0, state.as_u8(), STATE_RECHECK_TIMEOUT);

                    let bus = self.directory.bus_mut();
                    bus.current_state = reached;
                    bus.is_authorized = (reached == AlState::Op.as_u8()) as u8;
                    if reached != state.as_u8() {
                        // One shot per request: park the mailbox on what was
                        // reached instead of blocking every following cycle.
                        bus.request_state = reached;
                        bus.next_expected_state = reached;
                        warn!(
                            requested = %state,
                            reached = format_args!("{reached:#04x}"),
                            "state transition incomplete"
                        );
                    }
                }
                None => {
                    warn!(
                        value = format_args!("{request:#04x}"),
                        "invalid state request ignored"
                    );
                    self.directory.bus_mut().request_state = current;
                }
            }
        }

        if self.directory.bus().reset_cycle_stats != 0 {
            self.stats.reset();
            self.directory.bus_mut().reset_cycle_stats = 0;
            debug!("cycle statistics reset");
        }
    }

    /// Bus supervision after a working-counter shortfall: re-read the
    /// lowest application-layer state on the bus, publish it, and while
    /// OP is the expected state nudge the bus back with one non-blocking
    /// request per cycle (an error acknowledge first, the OP re-request
    /// once the flag clears). Runs on every short cycle and on the first
    /// complete cycles after one, until OP is confirmed.
    fn supervise(&mut self) {
        let op = AlState::Op.as_u8();
        let reached = self.stack.read_state();
        let expected = self.directory.bus().next_expected_state;

        let bus = self.directory.bus_mut();
        if reached == op && bus.current_state != op {
            info!("bus recovered, all slaves operational");
        } else if reached != bus.current_state {
            warn!(
                from = format_args!("{:#04x}", bus.current_state),
                to = format_args!("{reached:#04x}"),
                "bus state changed"
            );
        }
        bus.current_state = reached;
        bus.is_authorized = (reached == op) as u8;
        // Align the consumer mailbox with what was just published so a
        // previously parked request is not mistaken for a fresh one.
        bus.request_state = reached;

        if expected == op && reached != op {
            if reached & AL_ERROR_FLAG != 0 {
                warn!(
                    state = format_args!("{reached:#04x}"),
                    "acknowledging slave error state"
                );
                // Writing the flagged state back is the acknowledge.
                self.stack.request_state(0, reached);
            } else {
                self.stack.request_state(0, op);
            }
        }
        self.needs_recheck = expected == op && reached != op;
    }

    /// Account one cycle and, if it was publishable, stamp the directory
    /// and tick every registered consumer.
    fn finish_cycle(&mut self, duration_ns: i64, latency_ns: i64, published: bool) {
        self.stats.record(duration_ns, latency_ns);
        if duration_ns > self.cycle_time_ns {
            self.stats.overruns += 1;
            warn!(
                actual_ns = duration_ns,
                budget_ns = self.cycle_time_ns,
                "cycle overrun"
            );
        }
        if !published {
            return;
        }

        let bus = self.directory.bus_mut();
        bus.timestamp = epoch_us();
        bus.current_cycle_us = self.stats.last_us();
        bus.min_cycle_us = self.stats.min_us();
        bus.max_cycle_us = self.stats.max_us();
        bus.avg_cycle_us = self.stats.avg_us();
        self.broker.signal_cycle();
    }

    /// Park the bus in INIT and release the interface. The shared segments
    /// stay behind for inspection; the next bring-up replaces them.
    pub fn shutdown(&mut self) {
        info!("shutting down");
        self.directory.bus_mut().is_authorized = 0;

        let init = AlState::Init.as_u8();
        self.stack.request_state(0, init);
        let reached = self.stack.check_state(0, init, STATE_TIMEOUT);
        self.directory.bus_mut().current_state = reached;
        self.stack.close();

        info!(
            cycles = self.stats.cycle_count,
            overruns = self.stats.overruns,
            max_cycle_us = self.stats.max_us(),
            max_latency_us = self.stats.max_latency_ns as f64 / 1_000.0,
            "final cycle statistics"
        );
    }

    /// Timing statistics so far.
    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// The owned directory mapping.
    pub fn directory(&self) -> &BusDirectory {
        &self.directory
    }

    /// The underlying stack (simulation hooks in tests).
    pub fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }
}

fn epoch_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as i64)
}

// ─── Time helpers ───────────────────────────────────────────────────

/// Add nanoseconds to a TimeSpec.
#[cfg(feature = "rt")]
fn timespec_add_ns(ts: nix::sys::time::TimeSpec, ns: i64) -> nix::sys::time::TimeSpec {
    use nix::sys::time::TimeSpec;
    let mut secs = ts.tv_sec();
    let mut nanos = ts.tv_nsec() + ns;
    while nanos >= 1_000_000_000 {
        secs += 1;
        nanos -= 1_000_000_000;
    }
    while nanos < 0 {
        secs -= 1;
        nanos += 1_000_000_000;
    }
    TimeSpec::new(secs, nanos)
}

/// Difference (a - b) in nanoseconds.
#[cfg(feature = "rt")]
fn timespec_diff_ns(a: &nix::sys::time::TimeSpec, b: &nix::sys::time::TimeSpec) -> i64 {
    (a.tv_sec() - b.tv_sec()) * 1_000_000_000 + (a.tv_nsec() - b.tv_nsec())
}

// ─── Tests ──────────────────────────────────────────────────────────
