use crate::inferior::breakpoint::{BreakpointManager, Patch, TRAP_INSN};
use crate::inferior::error::{resume_error, Error};
use crate::inferior::register::{Architecture, X86_64};
use crate::inferior::wait::{WaitOutcome, WaitState};
use crate::inferior::{
    memory, redelivered, Event, InferiorOps, ServerHandle, SpawnRequest, TargetInfo, WaitMode,
};
use crate::weak_error;
use log::{debug, info};
use nix::errno::Errno;
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::Options;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid, SysconfVar};
use std::mem;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use sysinfo::{RefreshKind, System};

const DEFAULT_PAGE_SIZE: usize = 4096;

/// Inferior operation table for linux on x86-64, built on `ptrace`.
#[derive(Clone, Copy, Default)]
pub struct LinuxX86_64;

fn page_size() -> usize {
    match unistd::sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => DEFAULT_PAGE_SIZE,
    }
}

/// Blocking wait for exactly `pid`, transparently restarted on `EINTR`.
fn wait_for(pid: Pid) -> nix::Result<WaitStatus> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Err(Errno::EINTR) => continue,
            result => return result,
        }
    }
}

/// Resolve the program through `PATH` when it does not name an existing file.
fn resolve_program(program: &str) -> String {
    if Path::new(program).exists() {
        return program.to_string();
    }
    match which::which(program) {
        Ok(path) => path.to_string_lossy().to_string(),
        Err(_) => program.to_string(),
    }
}

impl InferiorOps for LinuxX86_64 {
    type Arch = X86_64;

    fn initialize(&self, bpm: Arc<dyn BreakpointManager>) -> ServerHandle<X86_64> {
        ServerHandle::new(bpm, page_size())
    }

    fn spawn(
        &self,
        session: &mut ServerHandle<X86_64>,
        wait: &WaitState,
        request: &SpawnRequest,
    ) -> Result<Pid, Error> {
        let argv0 = request
            .argv
            .first()
            .ok_or_else(|| Error::ForkFailed("empty exec vector".to_string()))?;

        let mut cmd = Command::new(resolve_program(argv0));
        cmd.arg0(argv0).args(&request.argv[1..]);
        if let Some(cwd) = request.cwd.as_deref() {
            cmd.current_dir(cwd);
        }
        if let Some(env) = request.env.as_ref() {
            cmd.env_clear().envs(env.iter().map(|(k, v)| (k, v)));
        }

        let disable_aslr = request.disable_aslr;
        unsafe {
            // runs in the forked child before exec: syscalls only, no allocation
            cmd.pre_exec(move || {
                if disable_aslr {
                    sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                }
                unistd::setsid()?;
                sys::ptrace::traceme()?;
                Ok(())
            });
        }

        // exec failures come back through the close-on-exec error pipe of `Command`
        let child = cmd
            .spawn()
            .map_err(|e| Error::ForkFailed(format!("Cannot exec `{argv0}': {e}")))?;
        let pid = Pid::from_raw(child.id() as i32);
        // the child is reaped through `waitpid`, never through `std::process::Child`
        mem::drop(child);

        let status = wait_for(pid).map_err(Error::Waitpid)?;
        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            WaitStatus::Exited(_, code) => {
                return Err(Error::ForkFailed(format!(
                    "`{argv0}' exited with code {code} before exec"
                )))
            }
            other => {
                return Err(Error::ForkFailed(format!(
                    "`{argv0}' unexpected initial status: {other:?}"
                )))
            }
        }

        session.inferior.bind(pid, false)?;
        sys::ptrace::setoptions(pid, Options::PTRACE_O_EXITKILL).map_err(Error::Ptrace)?;
        weak_error!(session.arch.fetch(pid), "initial registers:");
        wait.seed_first(status);

        info!(target: "tracer", "inferior `{argv0}' spawned, pid {pid}");
        Ok(pid)
    }

    fn get_target_info(&self) -> TargetInfo {
        TargetInfo {
            int_size: mem::size_of::<i32>() as u8,
            long_size: mem::size_of::<i64>() as u8,
            address_size: mem::size_of::<usize>() as u8,
        }
    }

    fn global_wait(&self, wait: &WaitState, mode: WaitMode) -> Result<WaitOutcome, Error> {
        let flags = match mode {
            WaitMode::Blocking => WaitPidFlag::__WALL,
            WaitMode::NonBlocking => WaitPidFlag::__WALL | WaitPidFlag::WNOHANG,
        };
        wait.global_wait(|| waitpid(Pid::from_raw(-1), Some(flags)))
    }

    fn dispatch_event(&self, session: &mut ServerHandle<X86_64>, status: WaitStatus) -> Event {
        let event = Event::classify(status);
        match event {
            Event::Stopped(signal) => {
                session.inferior.last_signal = redelivered(signal);
                if let Ok(pid) = session.inferior.pid() {
                    weak_error!(session.arch.fetch(pid), "registers stale after stop:");
                }
            }
            Event::Exited(_) | Event::Signaled(_) => {
                session.inferior.last_signal = None;
                session.arch.invalidate();
            }
            Event::Unknown => {
                log::warn!(target: "tracer", "unknown wait status: {status:?}");
            }
        }
        debug!(target: "tracer", "dispatched {status:?} as {event:?}");
        event
    }

    fn continue_(&self, session: &mut ServerHandle<X86_64>) -> Result<(), Error> {
        let pid = session.inferior.pid()?;
        let signal = session.inferior.last_signal;
        debug!(target: "tracer", "continue pid {pid} with signal {signal:?}");
        sys::ptrace::cont(pid, signal).map_err(resume_error)?;
        session.inferior.last_signal = None;
        session.arch.invalidate();
        Ok(())
    }

    fn step(&self, session: &mut ServerHandle<X86_64>) -> Result<(), Error> {
        let pid = session.inferior.pid()?;
        let signal = session.inferior.last_signal;
        debug!(target: "tracer", "single step pid {pid} with signal {signal:?}");
        sys::ptrace::step(pid, signal).map_err(resume_error)?;
        session.inferior.last_signal = None;
        session.arch.invalidate();
        Ok(())
    }

    fn get_pc(&self, session: &mut ServerHandle<X86_64>) -> Result<u64, Error> {
        let pid = session.inferior.pid()?;
        session.arch.current(pid).map(X86_64::pc)
    }

    fn get_return_address(&self, session: &mut ServerHandle<X86_64>) -> Result<u64, Error> {
        let pid = session.inferior.pid()?;
        let regs = *session.arch.current(pid)?;
        session.arch.return_address(pid, &regs)
    }

    fn read_memory(
        &self,
        session: &ServerHandle<X86_64>,
        addr: usize,
        len: usize,
    ) -> Result<Vec<u8>, Error> {
        let pid = session.inferior.pid()?;
        memory::read(pid, addr, len, session.inferior.page_size)
    }

    fn attach(
        &self,
        session: &mut ServerHandle<X86_64>,
        wait: &WaitState,
        pid: Pid,
    ) -> Result<(), Error> {
        let sys =
            System::new_with_specifics(RefreshKind::everything().without_cpu().without_memory());
        if sys.process(sysinfo::Pid::from_u32(pid.as_raw() as u32)).is_none() {
            return Err(Error::AttachedProcessNotFound(pid));
        }

        sys::ptrace::attach(pid).map_err(Error::Attach)?;
        let status = wait_for(pid).map_err(Error::Attach)?;
        debug!(target: "tracer", "attach stop of pid {pid}: {status:?}");
        if !matches!(status, WaitStatus::Stopped(_, _)) {
            return Err(Error::AttachedProcessNotFound(pid));
        }

        session.inferior.bind(pid, true)?;
        weak_error!(session.arch.fetch(pid), "initial registers:");
        wait.seed_first(status);

        info!(target: "tracer", "attached to pid {pid}");
        Ok(())
    }

    fn detach(&self, session: &mut ServerHandle<X86_64>) -> Result<(), Error> {
        let pid = session.inferior.pid()?;
        let signal = session.inferior.last_signal.take();
        debug!(target: "tracer", "detach pid {pid} with signal {signal:?}");
        sys::ptrace::detach(pid, signal).map_err(resume_error)?;
        session.arch.invalidate();
        Ok(())
    }

    fn kill(&self, session: &ServerHandle<X86_64>, signal: Signal) -> Result<(), Error> {
        let pid = session.inferior.pid()?;
        debug!(target: "tracer", "send {signal} to pid {pid}");
        sys::signal::kill(pid, signal).map_err(|e| match e {
            Errno::ESRCH => Error::NotStopped,
            e => Error::Syscall("kill", e),
        })
    }

    fn stop_and_wait(
        &self,
        session: &ServerHandle<X86_64>,
        wait: &WaitState,
    ) -> Result<WaitStatus, Error> {
        let pid = session.inferior.pid()?;
        wait.stop_and_wait(
            pid,
            |pid| {
                sys::signal::kill(pid, Signal::SIGSTOP).map_err(|e| match e {
                    Errno::ESRCH => Error::NotStopped,
                    e => Error::Syscall("kill", e),
                })
            },
            wait_for,
        )
    }

    fn write_memory(
        &self,
        session: &ServerHandle<X86_64>,
        addr: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        let pid = session.inferior.pid()?;
        memory::write(pid, addr, data)
    }

    fn insert_breakpoint(&self, session: &ServerHandle<X86_64>, addr: usize) -> Result<u64, Error> {
        let bpm = session.breakpoints();
        if let Some(id) = bpm.find_by_address(addr) {
            return Ok(id);
        }

        let pid = session.inferior.pid()?;
        let saved = memory::read(pid, addr, 1, session.inferior.page_size)?[0];
        memory::write(pid, addr, &[TRAP_INSN])?;
        let id = bpm.register(Patch { addr, saved });
        debug!(target: "tracer", "breakpoint {id} inserted at {addr:#x}");
        Ok(id)
    }

    fn remove_breakpoint(&self, session: &ServerHandle<X86_64>, id: u64) -> Result<(), Error> {
        let bpm = session.breakpoints();
        let patch = bpm.lookup(id).ok_or(Error::UnknownBreakpoint(id))?;
        let pid = session.inferior.pid()?;
        memory::write(pid, patch.addr, &[patch.saved])?;
        bpm.unregister(id);
        debug!(target: "tracer", "breakpoint {id} removed from {:#x}", patch.addr);
        Ok(())
    }
}
