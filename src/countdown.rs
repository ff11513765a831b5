//! Debounced shutdown countdown.
//!
//! [`Controller`] turns a stream of "trigger active" booleans into at most one
//! scheduled shutdown. Inbound signals and timer expiry are two independent
//! producers; both mutate [`CountdownState`] only while holding the same
//! lock, and publish the resulting status event before releasing it, so
//! events leave in the order the transitions happened.
//!
//! Expiry disarms before the executor is spawned. A start signal that
//! arrives while a shutdown run is in flight therefore begins a fresh,
//! independent countdown, and a stop signal has nothing left to cancel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::executor::ShutdownRunner;
use crate::report::{StatusEvent, StatusReporter};

/// Maximum number of shutdown runs executing at once.
const MAX_CONCURRENT_RUNS: usize = 1;

#[derive(Debug, Default)]
struct CountdownState {
    armed: bool,
    deadline: Option<Instant>,
    /// Incremented on every arm; lets a timer that lost a race detect that
    /// its cycle is gone.
    cycle: u64,
    cancel: Option<CancellationToken>,
}

impl CountdownState {
    fn disarm(&mut self) {
        self.armed = false;
        self.deadline = None;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

pub struct Controller {
    countdown: Duration,
    reporter: Arc<StatusReporter>,
    runner: Arc<dyn ShutdownRunner>,
    state: Mutex<CountdownState>,
    workers: Arc<Semaphore>,
    runs: TaskTracker,
}

impl Controller {
    pub fn new(
        countdown: Duration,
        reporter: Arc<StatusReporter>,
        runner: Arc<dyn ShutdownRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            countdown,
            reporter,
            runner,
            state: Mutex::new(CountdownState::default()),
            workers: Arc::new(Semaphore::new(MAX_CONCURRENT_RUNS)),
            runs: TaskTracker::new(),
        })
    }

    /// Feed one decoded trigger signal.
    ///
    /// | signal | state    | effect                                   |
    /// |--------|----------|------------------------------------------|
    /// | true   | disarmed | arm, publish `SHUTDOWN_COUNTDOWN_INITIATED` |
    /// | true   | armed    | nothing; the deadline is not extended    |
    /// | false  | armed    | cancel, publish `SHUTDOWN_COUNTDOWN_ABORTED` |
    /// | false  | disarmed | nothing                                  |
    pub async fn on_signal(self: &Arc<Self>, active: bool) {
        let mut state = self.state.lock().await;

        match (active, state.armed) {
            (true, false) => {
                state.cycle += 1;
                let deadline = Instant::now() + self.countdown;
                let cancel = CancellationToken::new();
                state.armed = true;
                state.deadline = Some(deadline);
                state.cancel = Some(cancel.clone());
                self.spawn_timer(state.cycle, deadline, cancel);

                tracing::info!(
                    cycle = state.cycle,
                    "Shutdown countdown started, shutting down in {}s",
                    self.countdown.as_secs()
                );
                let _ = self.reporter.report(StatusEvent::CountdownInitiated).await;
            }
            (true, true) => {
                tracing::debug!(cycle = state.cycle, "Countdown already running, ignoring");
            }
            (false, true) => {
                state.disarm();
                tracing::info!(cycle = state.cycle, "Shutdown countdown aborted");
                let _ = self.reporter.report(StatusEvent::CountdownAborted).await;
            }
            (false, false) => {
                tracing::debug!("No countdown running, ignoring abort");
            }
        }
    }

    fn spawn_timer(self: &Arc<Self>, cycle: u64, deadline: Instant, cancel: CancellationToken) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => controller.on_timer_expired(cycle).await,
            }
        });
    }

    async fn on_timer_expired(&self, cycle: u64) {
        let mut state = self.state.lock().await;
        if !state.armed || state.cycle != cycle {
            tracing::debug!(cycle, "Ignoring expiry of a cancelled countdown");
            return;
        }
        state.disarm();

        tracing::info!(cycle, "Shutdown countdown expired");
        let _ = self.reporter.report(StatusEvent::ShutdownInitiated).await;
        self.spawn_run(cycle);
    }

    /// Run the executor off the delivery path. Runs queue on the worker
    /// semaphore rather than overlapping.
    fn spawn_run(&self, cycle: u64) {
        let runner = Arc::clone(&self.runner);
        let workers = Arc::clone(&self.workers);
        self.runs.spawn(async move {
            let _permit = match Arc::clone(&workers).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(cycle, "Previous shutdown run still in progress, waiting");
                    let Ok(permit) = workers.acquire_owned().await else {
                        return;
                    };
                    permit
                }
            };
            let outcome = runner.execute().await;
            tracing::info!(
                cycle,
                succeeded = outcome.succeeded,
                exit_code = outcome.exit_code,
                "Shutdown cycle finished"
            );
        });
    }

    #[cfg(test)]
    pub(crate) async fn is_armed(&self) -> bool {
        self.state.lock().await.armed
    }

    #[cfg(test)]
    pub(crate) async fn deadline(&self) -> Option<Instant> {
        self.state.lock().await.deadline
    }

    /// Stop accepting work before the process exits.
    ///
    /// A pending countdown is aborted (and reported as such); an in-flight
    /// shutdown run is given up to `grace` to finish.
    pub async fn close(&self, grace: Duration) {
        {
            let mut state = self.state.lock().await;
            if state.armed {
                state.disarm();
                tracing::info!(cycle = state.cycle, "Aborting pending countdown on exit");
                let _ = self.reporter.report(StatusEvent::CountdownAborted).await;
            }
        }

        self.runs.close();
        if !self.runs.is_empty() {
            tracing::info!("Waiting for in-flight shutdown run to finish");
        }
        if tokio::time::timeout(grace, self.runs.wait()).await.is_err() {
            tracing::warn!(
                "Shutdown run still in flight after {}s, exiting anyway",
                grace.as_secs()
            );
        }
    }
}
