use crate::inferior::SpawnRequest;
use crate::protocol::{self, ProtocolError};
use clap::Parser;
use log::LevelFilter;
use nix::sys::stat;
use nix::unistd::Pid;
use std::os::fd::RawFd;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "inferior-server", author, version, about, long_about = None)]
pub struct Args {
    /// Protocol magic token
    pub magic: String,

    /// Protocol version expected by the front-end
    #[arg(value_name = "VERSION")]
    pub protocol_version: String,

    /// `0` to spawn a new inferior, a process id to attach to
    pub target: String,

    /// Spawn mode only: working directory followed by the exec vector
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub rest: Vec<String>,

    /// Write-only descriptor of the status channel
    #[arg(long, env = "INFERIOR_SERVER_STATUS_FD", default_value_t = 3)]
    pub status_fd: RawFd,

    /// Bidirectional descriptor of the command channel
    #[arg(long, env = "INFERIOR_SERVER_COMMAND_FD", default_value_t = 4)]
    pub command_fd: RawFd,

    /// Report the initial trace-stop of a spawned inferior instead of running it
    #[arg(long, env = "INFERIOR_SERVER_STOP_AT_ENTRY")]
    pub stop_at_entry: bool,

    /// Keep address space layout randomization enabled for a spawned inferior
    #[arg(long, env = "INFERIOR_SERVER_KEEP_ASLR")]
    pub keep_aslr: bool,

    /// Log level, overridden by `RUST_LOG`
    #[arg(long, env = "INFERIOR_SERVER_LOG", default_value = "warn")]
    pub log_level: LevelFilter,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Handshake(#[from] ProtocolError),
    #[error("invalid process id `{0}`")]
    InvalidPid(String),
    #[error("spawn mode expects a working directory and a program")]
    MissingProgram,
    #[error("unexpected arguments after process id: {0:?}")]
    TrailingArguments(Vec<String>),
    #[error("status and command channels share descriptor {0}")]
    SharedDescriptor(RawFd),
    #[error("descriptor {0} is not open: {1}")]
    BadDescriptor(RawFd, nix::Error),
}

/// How the session obtains its inferior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Spawn { cwd: PathBuf, argv: Vec<String> },
    Attach { pid: Pid },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub status_fd: RawFd,
    pub command_fd: RawFd,
    pub stop_at_entry: bool,
    pub disable_aslr: bool,
    pub log_level: LevelFilter,
    pub mode: Mode,
}

impl TryFrom<Args> for ServerConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        protocol::check_handshake(&args.magic, &args.protocol_version)?;

        let mode = if args.target == "0" {
            let mut rest = args.rest.into_iter();
            let cwd = rest.next().ok_or(ConfigError::MissingProgram)?;
            let argv: Vec<String> = rest.collect();
            if argv.is_empty() {
                return Err(ConfigError::MissingProgram);
            }
            Mode::Spawn {
                cwd: PathBuf::from(cwd),
                argv,
            }
        } else {
            let pid: i32 = args
                .target
                .parse()
                .ok()
                .filter(|pid| *pid > 0)
                .ok_or_else(|| ConfigError::InvalidPid(args.target.clone()))?;
            if !args.rest.is_empty() {
                return Err(ConfigError::TrailingArguments(args.rest));
            }
            Mode::Attach {
                pid: Pid::from_raw(pid),
            }
        };

        if args.status_fd == args.command_fd {
            return Err(ConfigError::SharedDescriptor(args.status_fd));
        }

        Ok(Self {
            status_fd: args.status_fd,
            command_fd: args.command_fd,
            stop_at_entry: args.stop_at_entry,
            disable_aslr: !args.keep_aslr,
            log_level: args.log_level,
            mode,
        })
    }
}

impl ServerConfig {
    /// Make sure both inherited descriptors are open.
    pub fn check_descriptors(&self) -> Result<(), ConfigError> {
        for fd in [self.status_fd, self.command_fd] {
            stat::fstat(fd).map_err(|e| ConfigError::BadDescriptor(fd, e))?;
        }
        Ok(())
    }

    /// Spawn request for spawn mode, `None` in attach mode.
    pub fn spawn_request(&self) -> Option<SpawnRequest> {
        match &self.mode {
            Mode::Spawn { cwd, argv } => {
                let mut request = SpawnRequest::new(argv.iter().cloned());
                if !cwd.as_os_str().is_empty() {
                    request = request.with_cwd(cwd);
                }
                request.disable_aslr = self.disable_aslr;
                Some(request)
            }
            Mode::Attach { .. } => None,
        }
    }
}
