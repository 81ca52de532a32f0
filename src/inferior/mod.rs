//! Inferior operation table: the single seam of OS and architecture specific process control.

pub mod breakpoint;
pub mod error;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;
pub mod memory;
pub mod register;
pub mod wait;

use crate::inferior::breakpoint::BreakpointManager;
use crate::inferior::error::Error;
use crate::inferior::register::Architecture;
use crate::inferior::wait::{WaitOutcome, WaitState};
use crate::protocol::{StatusKind, StatusMessage};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

/// Operation table of this build.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub type NativeOps = linux::LinuxX86_64;

/// How an inferior is brought under control by spawn.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub cwd: Option<PathBuf>,
    /// Exec vector, the first element names the program.
    pub argv: Vec<String>,
    /// Environment of the inferior, `None` to inherit the server environment.
    pub env: Option<Vec<(OsString, OsString)>>,
    pub disable_aslr: bool,
}

impl SpawnRequest {
    pub fn new<ARGS: IntoIterator<Item = I>, I: Into<String>>(argv: ARGS) -> Self {
        Self {
            cwd: None,
            argv: argv.into_iter().map(Into::into).collect(),
            env: None,
            disable_aslr: true,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Word sizes of the target.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TargetInfo {
    pub int_size: u8,
    pub long_size: u8,
    pub address_size: u8,
}

impl TargetInfo {
    /// Sizes packed into the 64-bit response argument: int, long, address - one byte each.
    pub fn pack(self) -> u64 {
        u64::from(self.int_size)
            | u64::from(self.long_size) << 8
            | u64::from(self.address_size) << 16
    }
}

/// Classified inferior state change.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Event {
    /// Inferior stopped with a signal.
    Stopped(Signal),
    /// Inferior exited with a code.
    Exited(i32),
    /// Inferior was terminated by a signal.
    Signaled(Signal),
    Unknown,
}

impl Event {
    /// Classify a raw wait status. Total over every status the OS delivers.
    pub fn classify(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Stopped(_, signal) => Event::Stopped(signal),
            WaitStatus::PtraceEvent(_, signal, _) => Event::Stopped(signal),
            WaitStatus::PtraceSyscall(_) => Event::Stopped(Signal::SIGTRAP),
            WaitStatus::Exited(_, code) => Event::Exited(code),
            WaitStatus::Signaled(_, signal, _) => Event::Signaled(signal),
            WaitStatus::Continued(_) | WaitStatus::StillAlive => Event::Unknown,
        }
    }

    /// True if no operation is valid against the inferior after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Exited(_) | Event::Signaled(_))
    }

    /// Status message announcing this event to the front-end. A stop reports the raw stop signal.
    pub fn status_message(&self) -> StatusMessage {
        match *self {
            Event::Stopped(signal) => StatusMessage::new(StatusKind::ChildStopped, signal as i32),
            Event::Exited(code) => StatusMessage::new(StatusKind::ChildExited, code),
            Event::Signaled(signal) => StatusMessage::new(StatusKind::ChildSignaled, signal as i32),
            Event::Unknown => StatusMessage::new(StatusKind::UnknownError, 0),
        }
    }
}

/// Signal to inject on the next resume after a stop with `signal`.
pub fn redelivered(signal: Signal) -> Option<Signal> {
    match signal {
        Signal::SIGTRAP | Signal::SIGSTOP => None,
        signal => Some(signal),
    }
}

/// OS identity and control state of the debuggee.
#[derive(Debug)]
pub struct InferiorHandle {
    pid: Option<Pid>,
    /// Signal redelivered on the next continue or step.
    pub last_signal: Option<Signal>,
    pub page_size: usize,
    attached: bool,
}

impl InferiorHandle {
    pub fn new(page_size: usize) -> Self {
        Self {
            pid: None,
            last_signal: None,
            page_size,
            attached: false,
        }
    }

    /// Bind the handle to a freshly spawned or attached process. A pid is bound once.
    pub fn bind(&mut self, pid: Pid, attached: bool) -> Result<(), Error> {
        if let Some(bound) = self.pid {
            return Err(Error::AlreadyBound(bound));
        }
        self.pid = Some(pid);
        self.attached = attached;
        Ok(())
    }

    pub fn pid(&self) -> Result<Pid, Error> {
        self.pid.ok_or(Error::NotStarted)
    }

    /// True when the process was attached by its pid, false if it was spawned.
    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

/// Session: the inferior, the breakpoint manager it reports to and the architecture context.
pub struct ServerHandle<A: Architecture> {
    pub inferior: InferiorHandle,
    pub arch: A,
    bpm: Arc<dyn BreakpointManager>,
}

impl<A: Architecture> ServerHandle<A> {
    pub fn new(bpm: Arc<dyn BreakpointManager>, page_size: usize) -> Self {
        Self {
            inferior: InferiorHandle::new(page_size),
            arch: A::default(),
            bpm,
        }
    }

    pub fn breakpoints(&self) -> &dyn BreakpointManager {
        self.bpm.as_ref()
    }
}

/// Wait mode of a generic wait.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitMode {
    Blocking,
    NonBlocking,
}

/// Process control for one (OS, architecture) pair.
///
/// Optional operations have a default implementation returning [`Error::NotImplemented`], so
/// every table exposes the same contract.
pub trait InferiorOps: Send + Sync {
    type Arch: Architecture;

    /// Create a session with an empty inferior handle.
    fn initialize(&self, bpm: Arc<dyn BreakpointManager>) -> ServerHandle<Self::Arch>;

    /// Create the inferior with tracing enabled before exec and block until its initial
    /// trace-stop. The stop is seeded into `wait` as the first status.
    fn spawn(
        &self,
        session: &mut ServerHandle<Self::Arch>,
        wait: &WaitState,
        request: &SpawnRequest,
    ) -> Result<Pid, Error>;

    fn get_target_info(&self) -> TargetInfo;

    /// Wait for a state change of any traced child.
    fn global_wait(&self, wait: &WaitState, mode: WaitMode) -> Result<WaitOutcome, Error>;

    /// Classify a wait status and update the session accordingly.
    fn dispatch_event(&self, session: &mut ServerHandle<Self::Arch>, status: WaitStatus) -> Event;

    /// Resume the inferior, redelivering the last recorded signal.
    fn continue_(&self, session: &mut ServerHandle<Self::Arch>) -> Result<(), Error>;

    /// Resume the inferior for a single instruction.
    fn step(&self, session: &mut ServerHandle<Self::Arch>) -> Result<(), Error>;

    fn get_pc(&self, session: &mut ServerHandle<Self::Arch>) -> Result<u64, Error>;

    fn get_return_address(&self, session: &mut ServerHandle<Self::Arch>) -> Result<u64, Error>;

    fn read_memory(
        &self,
        session: &ServerHandle<Self::Arch>,
        addr: usize,
        len: usize,
    ) -> Result<Vec<u8>, Error>;

    fn attach(
        &self,
        _session: &mut ServerHandle<Self::Arch>,
        _wait: &WaitState,
        _pid: Pid,
    ) -> Result<(), Error> {
        Err(Error::NotImplemented("attach"))
    }

    /// Release tracing, the inferior keeps running.
    fn detach(&self, _session: &mut ServerHandle<Self::Arch>) -> Result<(), Error> {
        Err(Error::NotImplemented("detach"))
    }

    /// Send `signal` to the inferior.
    fn kill(&self, _session: &ServerHandle<Self::Arch>, _signal: Signal) -> Result<(), Error> {
        Err(Error::NotImplemented("kill"))
    }

    /// Stop a running inferior and rendezvous on its stop status.
    fn stop_and_wait(
        &self,
        _session: &ServerHandle<Self::Arch>,
        _wait: &WaitState,
    ) -> Result<WaitStatus, Error> {
        Err(Error::NotImplemented("stop_and_wait"))
    }

    fn write_memory(
        &self,
        _session: &ServerHandle<Self::Arch>,
        _addr: usize,
        _data: &[u8],
    ) -> Result<(), Error> {
        Err(Error::NotImplemented("write_memory"))
    }

    /// Patch a trap instruction at `addr`, return the breakpoint id.
    fn insert_breakpoint(
        &self,
        _session: &ServerHandle<Self::Arch>,
        _addr: usize,
    ) -> Result<u64, Error> {
        Err(Error::NotImplemented("insert_breakpoint"))
    }

    fn remove_breakpoint(
        &self,
        _session: &ServerHandle<Self::Arch>,
        _id: u64,
    ) -> Result<(), Error> {
        Err(Error::NotImplemented("remove_breakpoint"))
    }

    /// Inject a call into the inferior and run it to completion.
    fn call_method(
        &self,
        _session: &mut ServerHandle<Self::Arch>,
        _method: u64,
        _args: &[u64],
    ) -> Result<u64, Error> {
        Err(Error::NotImplemented("call_method"))
    }

    /// Replace the signal redelivered on the next resume.
    fn set_signal(&self, session: &mut ServerHandle<Self::Arch>, signal: Option<Signal>) {
        session.inferior.last_signal = signal;
    }

    fn get_signal(&self, session: &ServerHandle<Self::Arch>) -> Option<Signal> {
        session.inferior.last_signal
    }
}
