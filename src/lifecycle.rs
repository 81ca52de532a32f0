//! Inferior lifecycle: `Created -> Running <-> Stopped -> {Exited, Signaled}`.

use crate::inferior::breakpoint::BreakpointManager;
use crate::inferior::error::Error;
use crate::inferior::wait::{WaitOutcome, WaitState};
use crate::inferior::{Event, InferiorOps, ServerHandle, SpawnRequest, TargetInfo, WaitMode};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::sync::Arc;
use strum_macros::Display;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum InferiorState {
    Created,
    Running,
    Stopped,
    Exited(i32),
    Signaled(Signal),
    /// Tracing released, the process is not ours anymore.
    Detached,
}

impl InferiorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InferiorState::Exited(_) | InferiorState::Signaled(_) | InferiorState::Detached
        )
    }
}

/// How the session got its inferior.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Origin {
    Spawned,
    Attached,
}

/// Result of one generic wait round.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Poll {
    Event(Event),
    /// The status went to a stop requester.
    Diverted,
    Idle,
}

/// Drives one session through its lifecycle on top of an inferior operation table.
pub struct Lifecycle<O: InferiorOps> {
    ops: O,
    session: ServerHandle<O::Arch>,
    wait: Arc<WaitState>,
    state: InferiorState,
    origin: Origin,
}

impl<O: InferiorOps> Lifecycle<O> {
    /// Spawn a new inferior. A spawn failure leaves no session behind.
    pub fn spawn(
        ops: O,
        bpm: Arc<dyn BreakpointManager>,
        wait: Arc<WaitState>,
        request: &SpawnRequest,
    ) -> Result<Self, Error> {
        let mut lifecycle = Self::new(ops, bpm, wait, Origin::Spawned);
        lifecycle
            .ops
            .spawn(&mut lifecycle.session, &lifecycle.wait, request)?;
        lifecycle.set_state(InferiorState::Running);
        Ok(lifecycle)
    }

    /// Attach to a running process.
    pub fn attach(
        ops: O,
        bpm: Arc<dyn BreakpointManager>,
        wait: Arc<WaitState>,
        pid: Pid,
    ) -> Result<Self, Error> {
        let mut lifecycle = Self::new(ops, bpm, wait, Origin::Attached);
        lifecycle
            .ops
            .attach(&mut lifecycle.session, &lifecycle.wait, pid)?;
        lifecycle.set_state(InferiorState::Running);
        Ok(lifecycle)
    }

    fn new(ops: O, bpm: Arc<dyn BreakpointManager>, wait: Arc<WaitState>, origin: Origin) -> Self {
        let session = ops.initialize(bpm);
        Self {
            ops,
            session,
            wait,
            state: InferiorState::Created,
            origin,
        }
    }

    pub fn state(&self) -> InferiorState {
        self.state
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn pid(&self) -> Result<Pid, Error> {
        self.session.inferior.pid()
    }

    pub fn wait_state(&self) -> Arc<WaitState> {
        self.wait.clone()
    }

    pub fn target_info(&self) -> TargetInfo {
        self.ops.get_target_info()
    }

    fn set_state(&mut self, state: InferiorState) {
        if self.state != state {
            debug!(target: "server", "inferior state {} -> {}", self.state, state);
        }
        self.state = state;
    }

    fn ensure_stopped(&self) -> Result<(), Error> {
        if self.state == InferiorState::Stopped {
            Ok(())
        } else {
            Err(Error::NotStopped)
        }
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::Stopped(_) => self.set_state(InferiorState::Stopped),
            Event::Exited(code) => self.set_state(InferiorState::Exited(code)),
            Event::Signaled(signal) => self.set_state(InferiorState::Signaled(signal)),
            Event::Unknown => {}
        }
    }

    /// Run one generic wait round and apply its event to the lifecycle.
    ///
    /// Interrupted waits are retried. Statuses of processes other than the inferior are logged
    /// and reported as [`Poll::Idle`].
    pub fn poll(&mut self, mode: WaitMode) -> Result<Poll, Error> {
        loop {
            let outcome = match self.ops.global_wait(&self.wait, mode) {
                Ok(outcome) => outcome,
                // nothing is traced after a detach from a process that is not our child
                Err(Error::Waitpid(Errno::ECHILD)) if self.state.is_terminal() => {
                    return Ok(Poll::Idle)
                }
                Err(e) => return Err(e),
            };

            match outcome {
                WaitOutcome::Interrupted => continue,
                WaitOutcome::Idle => return Ok(Poll::Idle),
                WaitOutcome::Diverted => return Ok(Poll::Diverted),
                WaitOutcome::Event(status) => {
                    if status.pid() != self.pid().ok() {
                        warn!(target: "server", "status of a foreign child ignored: {status:?}");
                        return Ok(Poll::Idle);
                    }
                    if self.state == InferiorState::Detached {
                        info!(target: "server", "detached inferior changed state: {status:?}");
                        return Ok(Poll::Idle);
                    }
                    let event = self.ops.dispatch_event(&mut self.session, status);
                    self.apply(event);
                    return Ok(Poll::Event(event));
                }
            }
        }
    }

    pub fn continue_(&mut self) -> Result<(), Error> {
        self.ensure_stopped()?;
        self.ops.continue_(&mut self.session)?;
        self.set_state(InferiorState::Running);
        Ok(())
    }

    pub fn step(&mut self) -> Result<(), Error> {
        self.ensure_stopped()?;
        self.ops.step(&mut self.session)?;
        self.set_state(InferiorState::Running);
        Ok(())
    }

    pub fn get_pc(&mut self) -> Result<u64, Error> {
        self.ensure_stopped()?;
        self.ops.get_pc(&mut self.session)
    }

    pub fn get_return_address(&mut self) -> Result<u64, Error> {
        self.ensure_stopped()?;
        self.ops.get_return_address(&mut self.session)
    }

    pub fn read_memory(&self, addr: usize, len: usize) -> Result<Vec<u8>, Error> {
        self.ensure_stopped()?;
        self.ops.read_memory(&self.session, addr, len)
    }

    pub fn write_memory(&self, addr: usize, data: &[u8]) -> Result<(), Error> {
        self.ensure_stopped()?;
        self.ops.write_memory(&self.session, addr, data)
    }

    pub fn insert_breakpoint(&self, addr: usize) -> Result<u64, Error> {
        self.ensure_stopped()?;
        self.ops.insert_breakpoint(&self.session, addr)
    }

    pub fn remove_breakpoint(&self, id: u64) -> Result<(), Error> {
        self.ensure_stopped()?;
        self.ops.remove_breakpoint(&self.session, id)
    }

    pub fn set_signal(&mut self, signal: Option<Signal>) -> Result<(), Error> {
        self.ensure_stopped()?;
        self.ops.set_signal(&mut self.session, signal);
        Ok(())
    }

    pub fn get_signal(&self) -> Result<Option<Signal>, Error> {
        self.ensure_stopped()?;
        Ok(self.ops.get_signal(&self.session))
    }

    /// Stop a running inferior synchronously.
    ///
    /// Returns `None` if the inferior is already stopped, the classified stop event otherwise.
    /// A terminal event means the inferior died instead of stopping.
    pub fn stop(&mut self) -> Result<Option<Event>, Error> {
        match self.state {
            InferiorState::Stopped => return Ok(None),
            InferiorState::Running => {}
            _ => return Err(Error::NotStopped),
        }

        let status = self.ops.stop_and_wait(&self.session, &self.wait)?;
        let event = self.ops.dispatch_event(&mut self.session, status);
        self.apply(event);
        Ok(Some(event))
    }

    /// Release the inferior, stopping it first if it runs.
    pub fn detach(&mut self) -> Result<Option<Event>, Error> {
        let event = self.stop()?;
        if let Some(event) = event.filter(Event::is_terminal) {
            return Ok(Some(event));
        }
        self.ops.detach(&mut self.session)?;
        self.set_state(InferiorState::Detached);
        info!(target: "server", "inferior detached");
        Ok(event)
    }

    /// Tear the session down.
    ///
    /// An attached inferior is detached and keeps running. A spawned one is killed with `SIGKILL`
    /// when `forceful`, otherwise it gets `SIGTERM` delivered untraced. A spawned inferior that
    /// was detached earlier still gets the signal.
    pub fn terminate(&mut self, forceful: bool) -> Result<(), Error> {
        if self.state == InferiorState::Detached && self.origin == Origin::Spawned {
            let signal = if forceful {
                Signal::SIGKILL
            } else {
                Signal::SIGTERM
            };
            info!(target: "server", "send {signal} to released inferior");
            return match self.ops.kill(&self.session, signal) {
                Err(Error::NotStopped) => Ok(()),
                result => result,
            };
        }
        if self.state.is_terminal() {
            return Ok(());
        }

        match self.origin {
            Origin::Attached => self.detach().map(|_| ()),
            Origin::Spawned if forceful => self.kill(),
            Origin::Spawned => self.graceful_terminate(),
        }
    }

    fn kill(&mut self) -> Result<(), Error> {
        info!(target: "server", "kill inferior");
        self.ops.kill(&self.session, Signal::SIGKILL)?;
        self.reap(|_, _| Ok(()))
    }

    fn graceful_terminate(&mut self) -> Result<(), Error> {
        info!(target: "server", "terminate inferior");
        self.ops.kill(&self.session, Signal::SIGTERM)?;
        if self.state == InferiorState::Stopped {
            self.continue_()?;
        }

        self.reap(|lifecycle, signal| {
            if signal == Signal::SIGTERM {
                // deliver the signal untraced
                lifecycle.ops.detach(&mut lifecycle.session)?;
                lifecycle.set_state(InferiorState::Detached);
            } else {
                lifecycle.continue_()?;
            }
            Ok(())
        })
    }

    /// Block until the inferior is gone, `on_stop` handles every stop on the way.
    fn reap<F>(&mut self, mut on_stop: F) -> Result<(), Error>
    where
        F: FnMut(&mut Self, Signal) -> Result<(), Error>,
    {
        while !self.state.is_terminal() {
            match self.poll(WaitMode::Blocking)? {
                Poll::Event(Event::Stopped(signal)) => on_stop(self, signal)?,
                Poll::Event(_) | Poll::Diverted | Poll::Idle => {}
            }
        }
        Ok(())
    }
}
