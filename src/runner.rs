//! Driving a looper over a session's lifetime
//!
//! [`LoopDriver`] is the per-session state machine (setup, running, torn
//! down). [`LoopRunner`] repeats its tick at a fixed interval on an injected
//! [`Clock`], and can reconnect when a session ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::looper::Looper;
use crate::session::Session;
use crate::transport::{Transport, TransportError};
use crate::ui::UiSink;

/// Time between two ticks of the polling loop.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Source of time for the polling loop.
pub trait Clock {
    /// Yield to the rest of the program for `duration`.
    fn sleep(&self, duration: Duration);

    /// Time elapsed since the clock was created.
    fn elapsed(&self) -> Duration;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }

    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

type SleepHook = Box<dyn FnMut(Duration) + Send>;

/// Virtual clock: `sleep` returns at once and only advances the counter.
///
/// An optional hook runs after every sleep with the new virtual time, which is
/// where tests poke the controls or cancel the loop.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
    hook: Arc<Mutex<Option<SleepHook>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sleep(&self, hook: impl FnMut(Duration) + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration;
    }
}

impl Clock for ManualClock {
    fn sleep(&self, duration: Duration) {
        let now = {
            let mut now = self.now.lock();
            *now += duration;
            *now
        };
        if let Some(hook) = self.hook.lock().as_mut() {
            hook(now);
        }
    }

    fn elapsed(&self) -> Duration {
        *self.now.lock()
    }
}

/// Shared stop flag, checked at every yield point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Setup,
    Running,
    TornDown,
}

#[derive(Debug)]
pub enum TeardownReason {
    Cancelled,
    Failed(TransportError),
}

impl TeardownReason {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TeardownReason::Cancelled)
    }
}

/// One session's run of a looper.
pub struct LoopDriver<'a, T: Transport, L: Looper<T>, U: UiSink> {
    session: Session<T>,
    looper: &'a mut L,
    ui: &'a mut U,
    phase: LoopPhase,
    ui_enabled: bool,
    ticks: u64,
}

impl<'a, T: Transport, L: Looper<T>, U: UiSink> LoopDriver<'a, T, L, U> {
    pub fn new(session: Session<T>, looper: &'a mut L, ui: &'a mut U) -> Self {
        Self {
            session,
            looper,
            ui,
            phase: LoopPhase::Setup,
            ui_enabled: false,
            ticks: 0,
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Open the looper's peripherals and enable the UI. Does nothing outside
    /// the setup phase.
    pub fn setup(&mut self) -> Result<(), TransportError> {
        if self.phase != LoopPhase::Setup {
            return Ok(());
        }

        if let Err(e) = self.looper.setup(&self.session) {
            log::warn!("Looper setup failed: {}", e);
            self.teardown();
            return Err(e);
        }

        self.phase = LoopPhase::Running;
        self.ui_enabled = true;
        self.ui.set_enabled(true);
        Ok(())
    }

    pub fn tick(&mut self) -> Result<(), TransportError> {
        if self.phase != LoopPhase::Running {
            return Err(TransportError::Rejected(format!(
                "cannot tick in phase {:?}",
                self.phase
            )));
        }

        let _span = tracing::debug_span!("tick", n = self.ticks).entered();
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("tick"), 0));

        self.ticks += 1;
        if let Err(e) = self.looper.tick(&self.session, &mut *self.ui) {
            log::warn!("Loop stopped after {} tick(s): {}", self.ticks, e);
            self.teardown();
            return Err(e);
        }
        Ok(())
    }

    /// Release the looper's handles, close the session and disable the UI.
    /// Only the first call has any effect.
    pub fn teardown(&mut self) {
        if self.phase == LoopPhase::TornDown {
            return;
        }
        self.phase = LoopPhase::TornDown;

        self.looper.disconnected();
        self.session.disconnect();
        if self.ui_enabled {
            self.ui_enabled = false;
            self.ui.set_enabled(false);
        }
        log::info!("Session torn down");
    }
}

impl<T: Transport, L: Looper<T>, U: UiSink> Drop for LoopDriver<'_, T, L, U> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Runs loopers at a fixed cadence.
pub struct LoopRunner<C: Clock> {
    clock: C,
    interval: Duration,
    reconnect_delay: Duration,
    cancel: CancelToken,
}

impl<C: Clock> LoopRunner<C> {
    pub fn new(clock: C, cancel: CancelToken) -> Self {
        Self {
            clock,
            interval: DEFAULT_TICK_INTERVAL,
            reconnect_delay: Duration::from_secs(1),
            cancel,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Run `looper` on `session` until the link fails or the runner is
    /// cancelled.
    pub fn run_session<T, L, U>(&self, session: Session<T>, looper: &mut L, ui: &mut U) -> TeardownReason
    where
        T: Transport,
        L: Looper<T>,
        U: UiSink,
    {
        let _span = tracing::info_span!("session").entered();
        let mut driver = LoopDriver::new(session, looper, ui);

        if let Err(e) = driver.setup() {
            return TeardownReason::Failed(e);
        }

        loop {
            if self.cancel.is_cancelled() {
                driver.teardown();
                return TeardownReason::Cancelled;
            }
            if let Err(e) = driver.tick() {
                return TeardownReason::Failed(e);
            }
            self.clock.sleep(self.interval);
        }
    }

    /// Keep opening sessions with `connect` and running `looper` on them
    /// until cancelled.
    pub fn run_reconnecting<T, L, U, E>(
        &self,
        mut connect: impl FnMut() -> Result<Session<T>, E>,
        looper: &mut L,
        ui: &mut U,
    ) where
        T: Transport,
        L: Looper<T>,
        U: UiSink,
        E: std::fmt::Display,
    {
        while !self.cancel.is_cancelled() {
            match connect() {
                Ok(session) => {
                    log::info!("Board connected");
                    match self.run_session(session, looper, ui) {
                        TeardownReason::Cancelled => break,
                        TeardownReason::Failed(e) => log::warn!("Session ended: {}", e),
                    }
                }
                Err(e) => log::warn!("Connecting to board failed: {}", e),
            }
            self.clock.sleep(self.reconnect_delay);
        }
    }
}
