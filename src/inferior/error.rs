use crate::protocol::{ProtocolError, ResultCode};
use nix::errno::Errno;
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- spawn/attach errors ---------------------------------------
    #[error("{0}")]
    ForkFailed(String),
    #[error("process pid {0} not found")]
    AttachedProcessNotFound(Pid),
    #[error("attach a running process: {0}")]
    Attach(nix::Error),
    #[error("inferior already bound to pid {0}")]
    AlreadyBound(Pid),
    #[error("inferior is not started")]
    NotStarted,

    // --------------------------------- live inferior errors --------------------------------------
    #[error("inferior is not stopped")]
    NotStopped,
    #[error("memory access at {0:#x}: {1}")]
    MemoryAccess(usize, nix::Error),
    #[error("short read at {addr:#x}: {got} of {expected} bytes")]
    ShortRead {
        addr: usize,
        expected: usize,
        got: usize,
    },
    #[error("fetch registers: {0}")]
    Registers(nix::Error),
    #[error("unknown breakpoint {0}")]
    UnknownBreakpoint(u64),
    #[error("operation `{0}` is not supported by this inferior table")]
    NotImplemented(&'static str),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),

    // --------------------------------- channel errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl Error {
    /// Result code reported to the front-end for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::ForkFailed(_) => ResultCode::ForkFailed,
            Error::NotStopped | Error::NotStarted => ResultCode::NotStopped,
            Error::MemoryAccess(_, _) | Error::ShortRead { .. } => ResultCode::MemoryAccess,
            Error::NotImplemented(_) => ResultCode::NotImplemented,
            Error::UnknownBreakpoint(_) => ResultCode::InvalidCommand,
            Error::AttachedProcessNotFound(_)
            | Error::Attach(_)
            | Error::AlreadyBound(_)
            | Error::Registers(_)
            | Error::Waitpid(_)
            | Error::Ptrace(_)
            | Error::Syscall(_, _)
            | Error::IO(_)
            | Error::Protocol(_) => ResultCode::Unknown,
        }
    }

    /// Return a hint to the server loop - keep serving after error or stop whole process.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::ForkFailed(_) => false,
            Error::AlreadyBound(_) => false,
            Error::NotStarted => false,
            Error::NotStopped => false,
            Error::MemoryAccess(_, _) => false,
            Error::ShortRead { .. } => false,
            Error::Registers(_) => false,
            Error::UnknownBreakpoint(_) => false,
            Error::NotImplemented(_) => false,
            Error::Ptrace(_) => false,
            Error::Syscall(_, _) => false,

            // the process-table view or the request/response alternation can't be trusted anymore
            Error::AttachedProcessNotFound(_) => true,
            Error::Attach(_) => true,
            Error::Waitpid(_) => true,
            Error::IO(_) => true,
            Error::Protocol(_) => true,
        }
    }
}

/// Classify a failed resume-like ptrace request.
pub(crate) fn resume_error(e: nix::Error) -> Error {
    if e == Errno::ESRCH {
        Error::NotStopped
    } else {
        Error::Ptrace(e)
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "tracer", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "tracer", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}
