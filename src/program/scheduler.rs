//! Program execution.
//!
//! The scheduler runs a [`Program`] on its own tokio task. It never touches
//! the serial link: every step goes through [`Engine::set`] and friends, and
//! the task throttles itself by watching the outbound queue depth.
//!
//! Cancellation is cooperative. `stop` and `skip` raise flags that every wait
//! loop checks; `skip` only ends the current item.

use super::item::{Program, ProgramItem, SkipCondition};
use super::state::{ProgramProgress, SchedulerState};
use crate::device::Engine;
use crate::error::LoadResult;
use crate::events::{EventBus, LoadEvent};
use crate::protocol::RunMode;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Items wait while more than this many commands are queued.
pub const QUEUE_HIGH_WATER: usize = 2;

const CONSTANT_BACKOFF: Duration = Duration::from_millis(10);
const RAMP_BACKOFF: Duration = Duration::from_millis(1);

/// Ramp set-point after `elapsed` of `duration`, never past `end`.
pub fn ramp_value(start: f64, end: f64, duration: Duration, elapsed: Duration) -> f64 {
    if duration.is_zero() {
        return end;
    }
    let fraction = elapsed.as_secs_f64() / duration.as_secs_f64();
    let value = start + (end - start) * fraction;
    if start <= end {
        value.min(end)
    } else {
        value.max(end)
    }
}

#[derive(Debug, Default)]
struct Position {
    total_loops: u32,
    current_loop: u32,
    current_item: usize,
    item_started: Option<Instant>,
    durations: Vec<Duration>,
}

#[derive(Debug, Default)]
struct RunControl {
    stop: AtomicBool,
    skip: AtomicBool,
    state: RwLock<SchedulerState>,
    position: RwLock<Position>,
}

impl RunControl {
    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Current item should end now.
    fn interrupted(&self) -> bool {
        self.stop_requested() || self.skip.load(Ordering::SeqCst)
    }

    fn begin_item(&self, index: usize) -> Instant {
        let now = Instant::now();
        let mut position = self.position.write();
        position.current_item = index;
        position.item_started = Some(now);
        now
    }
}

/// Runs programs against an [`Engine`].
#[derive(Debug)]
pub struct Scheduler {
    engine: Engine,
    events: EventBus,
    control: Arc<RunControl>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Scheduler issuing commands through `engine`.
    pub fn new(engine: Engine) -> Self {
        let events = engine.events().clone();
        Self {
            engine,
            events,
            control: Arc::new(RunControl::default()),
            task: Mutex::new(None),
        }
    }

    /// Start `program`, first stopping and waiting out any run in progress.
    #[instrument(skip_all, fields(items = program.items.len(), loops = program.loops))]
    pub async fn start(&self, program: Program) -> LoadResult<()> {
        program.validate()?;
        self.stop().await;

        self.control.stop.store(false, Ordering::SeqCst);
        self.control.skip.store(false, Ordering::SeqCst);
        *self.control.position.write() = Position {
            total_loops: program.loops,
            durations: program.items.iter().map(ProgramItem::duration).collect(),
            ..Position::default()
        };
        *self.control.state.write() = SchedulerState::Running;

        info!("program started");
        self.events.emit(LoadEvent::ProgramStarted);
        let handle = tokio::spawn(run_program(
            self.engine.clone(),
            Arc::clone(&self.control),
            self.events.clone(),
            program,
        ));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Ask the running program to stop without waiting for it.
    ///
    /// Safe to call from the telemetry observer.
    pub fn request_stop(&self) {
        let mut state = self.control.state.write();
        if *state == SchedulerState::Running {
            self.control.stop.store(true, Ordering::SeqCst);
            *state = SchedulerState::Cancelling;
        }
    }

    /// Stop the running program and wait until its task has exited.
    pub async fn stop(&self) {
        self.request_stop();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "program task ended abnormally");
                *self.control.state.write() = SchedulerState::Idle;
            }
        }
    }

    /// End the current item and continue with the next one.
    pub fn skip(&self) {
        if self.control.state.read().can_skip() {
            self.control.skip.store(true, Ordering::SeqCst);
        }
    }

    /// Wait for the running program to finish by itself.
    pub async fn wait(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "program task ended abnormally");
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        *self.control.state.read()
    }

    /// True until a stopped program's task has finished.
    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// Position and remaining time of the current run.
    pub fn progress(&self) -> ProgramProgress {
        let state = self.state();
        let position = self.control.position.read();
        let elapsed = position
            .item_started
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let item_total = position
            .durations
            .get(position.current_item)
            .copied()
            .unwrap_or_default();
        let pass_total: Duration = position
            .durations
            .iter()
            .skip(position.current_item)
            .sum();

        ProgramProgress {
            state,
            current_loop: position.current_loop,
            total_loops: position.total_loops,
            current_item: position.current_item,
            item_remaining: item_total.saturating_sub(elapsed),
            total_remaining: pass_total.saturating_sub(elapsed),
        }
    }
}

async fn run_program(engine: Engine, control: Arc<RunControl>, events: EventBus, program: Program) {
    if let Err(err) = execute(&engine, &control, &program).await {
        error!(error = %err, "program aborted");
        events.emit(LoadEvent::ProgramFailed(err.to_string()));
    }

    engine.finish_and_stop();
    *control.state.write() = SchedulerState::Idle;
    control.position.write().item_started = None;
    info!("program stopped");
    events.emit(LoadEvent::ProgramStopped);
}

async fn execute(engine: &Engine, control: &RunControl, program: &Program) -> LoadResult<()> {
    if program.items.is_empty() {
        return Ok(());
    }

    let mut loop_index = 0u32;
    while program.loops == 0 || loop_index < program.loops {
        control.position.write().current_loop = loop_index;

        for (index, item) in program.items.iter().enumerate() {
            if control.stop_requested() {
                return Ok(());
            }
            debug!(loop_index, index, %item, "program item");

            match item {
                ProgramItem::Constant {
                    mode,
                    value,
                    duration,
                    skip,
                } => {
                    let value = value.unwrap_or_else(|| engine.get_value(*mode));
                    let started = control.begin_item(index);
                    run_constant(engine, control, *mode, value, started + *duration, skip.as_ref())
                        .await?;
                }
                ProgramItem::Ramp {
                    mode,
                    start,
                    end,
                    duration,
                    skip,
                } => {
                    let start = start.unwrap_or_else(|| engine.get_value(*mode));
                    let started = control.begin_item(index);
                    let ramp = Ramp {
                        mode: *mode,
                        start,
                        end: *end,
                        started,
                        duration: *duration,
                    };
                    run_ramp(engine, control, &ramp, skip.as_ref()).await?;
                }
                ProgramItem::Pin { pin, set } => {
                    control.begin_item(index);
                    if wait_for_queue(engine, control, None, CONSTANT_BACKOFF).await {
                        engine.set_user_pin(*pin, *set);
                    }
                }
            }

            control.skip.store(false, Ordering::SeqCst);
            tokio::task::yield_now().await;
        }

        if control.stop_requested() {
            break;
        }
        loop_index = loop_index.saturating_add(1);
    }
    Ok(())
}

fn skip_met(engine: &Engine, skip: Option<&SkipCondition>) -> bool {
    skip.is_some_and(|condition| condition.is_met(engine.measured(condition.quantity)))
}

/// Sleep while the queue is above the high-water mark. Returns `false` if the
/// item ended while waiting.
async fn wait_for_queue(
    engine: &Engine,
    control: &RunControl,
    deadline: Option<Instant>,
    backoff: Duration,
) -> bool {
    while engine.queue_len() > QUEUE_HIGH_WATER {
        if control.interrupted() || deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        tokio::time::sleep(backoff).await;
    }
    true
}

/// Sleep `backoff` between set-points, waking early for the item deadline.
/// Keeps the loop from spinning when nothing is being queued.
async fn pace(deadline: Instant, backoff: Duration) {
    tokio::time::sleep_until(deadline.min(Instant::now() + backoff)).await;
}

async fn run_constant(
    engine: &Engine,
    control: &RunControl,
    mode: RunMode,
    value: f64,
    deadline: Instant,
    skip: Option<&SkipCondition>,
) -> LoadResult<()> {
    while Instant::now() < deadline && !control.interrupted() {
        if skip_met(engine, skip) {
            debug!("skip condition met");
            break;
        }
        if !wait_for_queue(engine, control, Some(deadline), CONSTANT_BACKOFF).await {
            break;
        }
        engine.set(mode, value)?;
        pace(deadline, CONSTANT_BACKOFF).await;
    }
    Ok(())
}

struct Ramp {
    mode: RunMode,
    start: f64,
    end: f64,
    started: Instant,
    duration: Duration,
}

async fn run_ramp(
    engine: &Engine,
    control: &RunControl,
    ramp: &Ramp,
    skip: Option<&SkipCondition>,
) -> LoadResult<()> {
    let deadline = ramp.started + ramp.duration;
    let mut first = true;
    while Instant::now() < deadline && !control.interrupted() {
        if skip_met(engine, skip) {
            debug!("skip condition met");
            break;
        }
        if !wait_for_queue(engine, control, Some(deadline), RAMP_BACKOFF).await {
            break;
        }
        let setpoint = if first {
            first = false;
            ramp.start
        } else {
            ramp_value(ramp.start, ramp.end, ramp.duration, ramp.started.elapsed())
        };
        engine.set(ramp.mode, setpoint)?;
        pace(deadline, RAMP_BACKOFF).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LinkSettings;
    use tracing_test::traced_test;

    #[test]
    fn ramp_is_monotonic_and_bounded() {
        let duration = Duration::from_secs(1);
        let mut previous = f64::MIN;
        for ms in (0..=1500).step_by(7) {
            let value = ramp_value(0.0, 10.0, duration, Duration::from_millis(ms));
            assert!(value >= previous, "decreased at {ms} ms");
            assert!(value <= 10.0);
            previous = value;
        }
        assert_eq!(ramp_value(0.0, 10.0, duration, Duration::from_millis(500)), 5.0);
    }

    #[test]
    fn falling_ramp_clamps_at_end() {
        let duration = Duration::from_secs(2);
        assert_eq!(ramp_value(8.0, 2.0, duration, Duration::from_secs(1)), 5.0);
        assert_eq!(ramp_value(8.0, 2.0, duration, Duration::from_secs(3)), 2.0);
        assert_eq!(ramp_value(8.0, 2.0, Duration::ZERO, Duration::ZERO), 2.0);
    }

    fn offline_scheduler() -> (Scheduler, EventBus) {
        let events = EventBus::default();
        let engine = Engine::serial(LinkSettings::default(), events.clone());
        (Scheduler::new(engine), events)
    }

    #[tokio::test]
    #[traced_test]
    async fn completes_all_loops_and_returns_to_idle() {
        let (scheduler, events) = offline_scheduler();
        let mut rx = events.subscribe();

        let program = Program::new(
            vec![
                ProgramItem::constant(RunMode::Current, Some(0.5), Duration::from_millis(20)),
                ProgramItem::pin(0, true),
            ],
            2,
        );
        scheduler.start(program).await.unwrap();
        assert!(scheduler.is_running());
        scheduler.wait().await;

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(rx.recv().await.unwrap(), LoadEvent::ProgramStarted);
        assert_eq!(rx.recv().await.unwrap(), LoadEvent::ProgramStopped);
        assert_eq!(scheduler.progress().current_loop, 1);
        assert_eq!(scheduler.engine.user_pins(), 0b1);
        assert!(logs_contain("program started"));
    }

    #[tokio::test]
    async fn stop_cancels_infinite_program() {
        let (scheduler, _events) = offline_scheduler();
        let program = Program::new(
            vec![ProgramItem::constant(
                RunMode::Voltage,
                Some(1.0),
                Duration::from_secs(3600),
            )],
            0,
        );
        scheduler.start(program).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let begun = std::time::Instant::now();
        scheduler.stop().await;
        assert!(begun.elapsed() < Duration::from_secs(1));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn skip_moves_to_next_item() {
        let (scheduler, _events) = offline_scheduler();
        let program = Program::new(
            vec![
                ProgramItem::constant(RunMode::Current, Some(1.0), Duration::from_secs(3600)),
                ProgramItem::constant(RunMode::Current, Some(2.0), Duration::from_secs(3600)),
            ],
            1,
        );
        scheduler.start(program).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.progress().current_item, 0);

        scheduler.skip();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let progress = scheduler.progress();
        assert_eq!(progress.current_item, 1);
        assert!(progress.item_remaining > Duration::from_secs(3500));

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_during_queue_wait_skips_pending_pin() {
        let (scheduler, _events) = offline_scheduler();
        // Nothing drains the queue offline, so the fourth pin waits for room.
        let program = Program::new((0..4).map(|pin| ProgramItem::pin(pin, true)).collect(), 1);
        scheduler.start(program).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.engine.user_pins(), 0b0111);
        assert_eq!(scheduler.engine.queue_len(), 3);

        scheduler.stop().await;
        assert_eq!(scheduler.engine.user_pins(), 0b0111);
        // Three pins plus the final zero current.
        assert_eq!(scheduler.engine.queue_len(), 4);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    #[traced_test]
    async fn offline_constant_item_does_not_spin() {
        let (scheduler, _events) = offline_scheduler();
        let control = RunControl::default();
        let started = Instant::now();

        run_constant(
            &scheduler.engine,
            &control,
            RunMode::Current,
            1.0,
            started + Duration::from_millis(200),
            None,
        )
        .await
        .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(200));
        logs_assert(|lines: &[&str]| {
            let sets = lines
                .iter()
                .filter(|line| line.contains("set ignored"))
                .count();
            if (1..=40).contains(&sets) {
                Ok(())
            } else {
                Err(format!("{sets} set-points issued in 200 ms"))
            }
        });
    }

    #[tokio::test]
    async fn invalid_program_is_rejected() {
        let (scheduler, _events) = offline_scheduler();
        let program = Program::new(
            vec![ProgramItem::ramp(RunMode::Mppt, None, 1.0, Duration::from_secs(1))],
            1,
        );
        assert!(scheduler.start(program).await.is_err());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }
}
