use anyhow::Context;
use clap::Parser;
use inferior_server::config::{Args, Mode, ServerConfig};
use inferior_server::inferior::breakpoint::BreakpointTable;
use inferior_server::inferior::wait::WaitState;
use inferior_server::inferior::{error, NativeOps};
use inferior_server::lifecycle::Lifecycle;
use inferior_server::protocol::{self, ResultCode, StatusKind, StatusMessage};
use inferior_server::server::{self, Server};
use nix::fcntl::{self, FcntlArg, FdFlag};
use std::os::fd::RawFd;
use std::process::ExitCode;
use std::sync::Arc;

fn main() -> ExitCode {
    let args = Args::parse();
    let config = match ServerConfig::try_from(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("inferior-server: {e}");
            return ExitCode::FAILURE;
        }
    };
    inferior_server::log::init(config.log_level);

    match run(config) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            log::error!(target: "server", "{e:#}");
            eprintln!("inferior-server: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn close_on_exec(fd: RawFd) -> anyhow::Result<()> {
    fcntl::fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .with_context(|| format!("mark descriptor {fd} close-on-exec"))?;
    Ok(())
}

fn run(config: ServerConfig) -> anyhow::Result<u8> {
    config.check_descriptors()?;
    // before any child exists, a status change or a command must never be missed
    let signals = server::wake_signals().context("register wake signals")?;

    close_on_exec(config.status_fd)?;
    close_on_exec(config.command_fd)?;
    // SAFETY: both descriptors are open, distinct and not used elsewhere in this process
    let (mut status, commands) =
        unsafe { protocol::inherited_channels(config.status_fd, config.command_fd) };

    let ops = NativeOps::default();
    let bpm = Arc::new(BreakpointTable::default());
    let wait = Arc::new(WaitState::new());

    let lifecycle = match &config.mode {
        Mode::Spawn { .. } => {
            let request = config
                .spawn_request()
                .context("spawn mode without exec vector")?;
            match Lifecycle::spawn(ops, bpm, wait, &request) {
                Ok(lifecycle) => lifecycle,
                Err(e @ error::Error::ForkFailed(_)) => {
                    eprintln!("inferior-server: {e}");
                    status
                        .send(StatusMessage::new(
                            StatusKind::UnknownError,
                            ResultCode::ForkFailed as i32,
                        ))
                        .context("report spawn failure")?;
                    return Ok(1);
                }
                Err(e) => return Err(e).context("spawn inferior"),
            }
        }
        Mode::Attach { pid } => {
            Lifecycle::attach(ops, bpm, wait, *pid).with_context(|| format!("attach to {pid}"))?
        }
    };

    let server = Server::new(lifecycle, commands, status, signals, config.stop_at_entry);
    let code = server.run().context("serve")?;
    Ok(code as u8)
}
