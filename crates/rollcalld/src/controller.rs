//! Top-level state machine: wait for the remote trigger, run one kiosk
//! session, clear the trigger, repeat.

use crate::trigger::TriggerTransport;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How a kiosk session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// An enrollment or attendance mark succeeded; go back to waiting.
    Succeeded,
    /// The operator asked to stop.
    Quit,
    /// The camera or inference pipeline failed mid-session.
    DeviceLost,
}

impl SessionOutcome {
    fn keeps_running(self) -> bool {
        self == SessionOutcome::Succeeded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    WaitingForTrigger,
    SessionActive,
    Resetting(SessionOutcome),
    Terminated,
}

/// Runs one interactive session to completion.
pub trait SessionRunner {
    fn run_session(&mut self) -> impl Future<Output = SessionOutcome>;
}

pub trait Sleeper {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()>;
}

pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct TriggerController<T, S> {
    transport: T,
    sleeper: S,
    poll_interval: Duration,
    state: ControllerState,
    polls: u64,
    sessions: u64,
}

impl<T: TriggerTransport, S: Sleeper> TriggerController<T, S> {
    pub fn new(transport: T, sleeper: S, poll_interval: Duration) -> Self {
        Self {
            transport,
            sleeper,
            poll_interval,
            state: ControllerState::WaitingForTrigger,
            polls: 0,
            sessions: 0,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    /// Advance one transition and return the new state.
    pub async fn step<R: SessionRunner>(&mut self, runner: &mut R) -> ControllerState {
        self.state = match self.state {
            ControllerState::WaitingForTrigger => {
                self.wait_for_trigger().await;
                ControllerState::SessionActive
            }
            ControllerState::SessionActive => {
                self.sessions += 1;
                info!(session = self.sessions, "session started");
                let outcome = runner.run_session().await;
                info!(session = self.sessions, ?outcome, "session ended");
                ControllerState::Resetting(outcome)
            }
            ControllerState::Resetting(outcome) => {
                self.reset_trigger().await;
                if outcome.keeps_running() {
                    ControllerState::WaitingForTrigger
                } else {
                    ControllerState::Terminated
                }
            }
            ControllerState::Terminated => ControllerState::Terminated,
        };
        self.state
    }

    /// Run until a session ends with anything other than success.
    pub async fn run<R: SessionRunner>(&mut self, runner: &mut R) {
        while self.step(runner).await != ControllerState::Terminated {}
        info!(sessions = self.sessions, "controller terminated");
    }

    /// Poll until the trigger reads exactly 1. Read failures count as
    /// "not asserted".
    async fn wait_for_trigger(&mut self) {
        self.polls = 0;
        info!(interval = ?self.poll_interval, "waiting for trigger");
        loop {
            self.polls += 1;
            match self.transport.read().await {
                Ok(reading) if reading.is_asserted() => {
                    info!(polls = self.polls, "trigger asserted");
                    return;
                }
                Ok(reading) => debug!(polls = self.polls, value = ?reading.value, "trigger idle"),
                Err(e) => warn!(polls = self.polls, error = %e, "trigger poll failed"),
            }
            self.sleeper.sleep(self.poll_interval).await;
        }
    }

    async fn reset_trigger(&self) {
        match self.transport.reset().await {
            Ok(()) => debug!("trigger reset"),
            Err(e) => warn!(error = %e, "trigger reset failed"),
        }
    }
}
