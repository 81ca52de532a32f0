use crate::inferior::error::Error;
use nix::libc::{c_void, user_regs_struct};
use nix::sys;
use nix::unistd::Pid;
use std::fmt;
use strum_macros::Display;
use strum_macros::EnumString;

/// Per-architecture register access for an inferior.
///
/// An implementation keeps a snapshot of the register file taken at the last stop. The snapshot
/// is stale once the inferior resumes, callers must not treat a failed fetch as fatal.
pub trait Architecture: Default + Send {
    type Registers: Clone + fmt::Debug;

    /// Fetch the register file of a stopped inferior and keep it as the current snapshot.
    fn fetch(&mut self, pid: Pid) -> Result<&Self::Registers, Error>;

    /// Snapshot taken at the last stop, if still valid.
    fn snapshot(&self) -> Option<&Self::Registers>;

    /// Drop the snapshot (inferior resumed or gone).
    fn invalidate(&mut self);

    fn pc(regs: &Self::Registers) -> u64;

    /// Return address of the function the inferior has just entered.
    fn return_address(&self, pid: Pid, regs: &Self::Registers) -> Result<u64, Error>;

    /// Snapshot if valid, otherwise a fresh fetch.
    fn current(&mut self, pid: Pid) -> Result<&Self::Registers, Error> {
        if self.snapshot().is_none() {
            return self.fetch(pid);
        }
        self.snapshot().ok_or(Error::NotStopped)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    OrigRax,
    FsBase,
    GsBase,
}

/// x86-64 general purpose register file, as returned by `PTRACE_GETREGS`.
#[derive(Clone, Copy)]
pub struct RegisterSet(user_regs_struct);

impl RegisterSet {
    pub fn value(&self, register: Register) -> u64 {
        let r = &self.0;
        match register {
            Register::Rax => r.rax,
            Register::Rbx => r.rbx,
            Register::Rcx => r.rcx,
            Register::Rdx => r.rdx,
            Register::Rdi => r.rdi,
            Register::Rsi => r.rsi,
            Register::Rbp => r.rbp,
            Register::Rsp => r.rsp,
            Register::R8 => r.r8,
            Register::R9 => r.r9,
            Register::R10 => r.r10,
            Register::R11 => r.r11,
            Register::R12 => r.r12,
            Register::R13 => r.r13,
            Register::R14 => r.r14,
            Register::R15 => r.r15,
            Register::Rip => r.rip,
            Register::Eflags => r.eflags,
            Register::OrigRax => r.orig_rax,
            Register::FsBase => r.fs_base,
            Register::GsBase => r.gs_base,
        }
    }
}

impl From<user_regs_struct> for RegisterSet {
    fn from(value: user_regs_struct) -> Self {
        Self(value)
    }
}

impl fmt::Debug for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterSet")
            .field("rip", &format_args!("{:#x}", self.0.rip))
            .field("rsp", &format_args!("{:#x}", self.0.rsp))
            .field("rbp", &format_args!("{:#x}", self.0.rbp))
            .finish_non_exhaustive()
    }
}

/// x86-64 (System V ABI) architecture context.
#[derive(Default)]
pub struct X86_64 {
    snapshot: Option<RegisterSet>,
}

impl Architecture for X86_64 {
    type Registers = RegisterSet;

    fn fetch(&mut self, pid: Pid) -> Result<&RegisterSet, Error> {
        let regs = sys::ptrace::getregs(pid).map_err(Error::Registers)?;
        let regs: &RegisterSet = self.snapshot.insert(regs.into());
        Ok(regs)
    }

    fn snapshot(&self) -> Option<&RegisterSet> {
        self.snapshot.as_ref()
    }

    fn invalidate(&mut self) {
        self.snapshot = None;
    }

    fn pc(regs: &RegisterSet) -> u64 {
        regs.value(Register::Rip)
    }

    /// At function entry the `call` instruction has just pushed the return address.
    fn return_address(&self, pid: Pid, regs: &RegisterSet) -> Result<u64, Error> {
        let rsp = regs.value(Register::Rsp) as usize;
        sys::ptrace::read(pid, rsp as *mut c_void)
            .map(|word| word as u64)
            .map_err(|e| Error::MemoryAccess(rsp, e))
    }
}
