use crate::inferior::error::Error;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Result of one generic wait.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitOutcome {
    /// State change that nobody claimed, goes to the normal event path.
    Event(WaitStatus),
    /// State change of the inferior a stop request waits for, handed over to the requester.
    Diverted,
    /// The wait call was interrupted by a signal.
    Interrupted,
    /// Non-blocking wait found no state change.
    Idle,
}

#[derive(Default)]
struct Rendezvous {
    requested: Option<Pid>,
    captured: Option<WaitStatus>,
}

/// Process-wide wait coordination.
///
/// Two mutual exclusion domains are used: `serial` makes sure only one thread at a time is
/// inside the OS wait call, `rendezvous` guards the hand-off of a single wait result between the
/// generic waiter and a stop requester. A status is observed either by the generic waiter or by
/// the requester, never by both.
#[derive(Default)]
pub struct WaitState {
    first: Mutex<Option<WaitStatus>>,
    serial: Mutex<()>,
    rendezvous: Mutex<Rendezvous>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WaitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the initial trace-stop of a freshly created inferior until its first consumer.
    pub fn seed_first(&self, status: WaitStatus) {
        debug!(target: "wait", "first status seeded: {status:?}");
        *lock(&self.first) = Some(status);
    }

    /// True if the initial trace-stop is still waiting for its consumer.
    pub fn has_first(&self) -> bool {
        lock(&self.first).is_some()
    }

    /// Wait for a state change of any traced child.
    ///
    /// # Arguments
    ///
    /// * `wait`: the OS wait call, returns [`WaitStatus::StillAlive`] if it was non-blocking and
    ///   nothing changed.
    pub fn global_wait<W>(&self, wait: W) -> Result<WaitOutcome, Error>
    where
        W: FnOnce() -> nix::Result<WaitStatus>,
    {
        if let Some(status) = lock(&self.first).take() {
            debug!(target: "wait", "replay first status: {status:?}");
            return Ok(WaitOutcome::Event(status));
        }

        let _serial = lock(&self.serial);
        let status = match wait() {
            Ok(WaitStatus::StillAlive) => return Ok(WaitOutcome::Idle),
            Ok(status) => status,
            Err(Errno::EINTR) => return Ok(WaitOutcome::Interrupted),
            Err(e) => {
                warn!(target: "wait", "global wait failed: {e}");
                return Err(Error::Waitpid(e));
            }
        };
        debug!(target: "wait", "global wait finished: {status:?}");

        let mut rendezvous = lock(&self.rendezvous);
        if rendezvous.requested.is_some() && rendezvous.requested == status.pid() {
            debug!(target: "wait", "status diverted to stop requester");
            rendezvous.captured = Some(status);
            return Ok(WaitOutcome::Diverted);
        }

        Ok(WaitOutcome::Event(status))
    }

    /// Stop an inferior and return the status it stopped with.
    ///
    /// The request is published before `stop` runs, so if the generic waiter catches the
    /// resulting status it hands it over instead of reporting it.
    ///
    /// # Arguments
    ///
    /// * `pid`: inferior to stop
    /// * `stop`: sends the stop request to the inferior
    /// * `wait`: blocking OS wait for exactly `pid`
    pub fn stop_and_wait<S, W>(&self, pid: Pid, stop: S, mut wait: W) -> Result<WaitStatus, Error>
    where
        S: FnOnce(Pid) -> Result<(), Error>,
        W: FnMut(Pid) -> nix::Result<WaitStatus>,
    {
        {
            let mut first = lock(&self.first);
            match first.take() {
                Some(status) if status.pid() == Some(pid) => {
                    debug!(target: "wait", "stop request served by first status: {status:?}");
                    return Ok(status);
                }
                other => *first = other,
            }
        }

        {
            let mut rendezvous = lock(&self.rendezvous);
            rendezvous.requested = Some(pid);
            rendezvous.captured = None;
        }

        if let Err(e) = stop(pid) {
            self.finish_request();
            return Err(e);
        }

        let _serial = lock(&self.serial);
        if let Some(status) = self.finish_request() {
            return Ok(status);
        }

        let result = loop {
            match wait(pid) {
                Err(Errno::EINTR) => continue,
                result => break result,
            }
        };
        self.finish_request();

        let status = result.map_err(Error::Waitpid)?;
        debug!(target: "wait", "stop requester got status: {status:?}");
        Ok(status)
    }

    /// Withdraw the pending stop request, returning the captured status if any.
    fn finish_request(&self) -> Option<WaitStatus> {
        let mut rendezvous = lock(&self.rendezvous);
        rendezvous.requested = None;
        rendezvous.captured.take()
    }
}
