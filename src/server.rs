//! Command/event loop serving a debugger front-end.
//!
//! Three wake sources drive the loop, in priority order: a child status change (`SIGCHLD`), a
//! command waiting on the command channel (`SIGUSR1` from the front-end) and a termination
//! request (`SIGTERM`, `SIGINT`). While none is pending the loop blocks in [`Signals::wait`].

use crate::inferior::error::Error;
use crate::inferior::{Event, InferiorOps, WaitMode};
use crate::lifecycle::{Lifecycle, Origin, Poll};
use crate::protocol::{
    Command, CommandChannel, Opcode, Response, ResultCode, StatusChannel, MAX_TRANSFER,
};
use crate::weak_error;
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use signal_hook::consts::{SIGCHLD, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use std::io::{Read, Write};

/// Signals the loop wakes on. Must be registered before the inferior is created.
pub const WAKE_SIGNALS: [i32; 4] = [SIGCHLD, SIGUSR1, SIGTERM, SIGINT];

/// Register the wake signals of the loop.
pub fn wake_signals() -> std::io::Result<Signals> {
    Signals::new(WAKE_SIGNALS)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShutdownMode {
    /// `Shutdown` command: a spawned inferior gets `SIGTERM`.
    Graceful,
    /// `Kill` command or a termination signal: a spawned inferior gets `SIGKILL`.
    Forceful,
}

pub struct Server<O: InferiorOps, S, W> {
    lifecycle: Lifecycle<O>,
    commands: CommandChannel<S>,
    status: StatusChannel<W>,
    signals: Signals,
    stop_at_entry: bool,
    entry_pending: bool,
    command_pending: bool,
    shutdown: Option<ShutdownMode>,
    /// Raw signal of the most recent stop.
    last_stop: Option<Signal>,
    finished: bool,
}

impl<O: InferiorOps, S: Read + Write, W: Write> Server<O, S, W> {
    pub fn new(
        lifecycle: Lifecycle<O>,
        commands: CommandChannel<S>,
        status: StatusChannel<W>,
        signals: Signals,
        stop_at_entry: bool,
    ) -> Self {
        let entry_pending = lifecycle.origin() == Origin::Spawned;
        Self {
            lifecycle,
            commands,
            status,
            signals,
            stop_at_entry,
            entry_pending,
            command_pending: false,
            shutdown: None,
            last_stop: None,
            finished: false,
        }
    }

    /// Serve until the inferior terminates or a shutdown is requested. Returns the exit code of
    /// the server process.
    pub fn run(mut self) -> Result<i32, Error> {
        loop {
            self.drain_events()?;
            if self.finished {
                break;
            }

            if self.command_pending {
                self.command_pending = false;
                self.serve_command()?;
                if self.finished {
                    break;
                }
            }

            if let Some(mode) = self.shutdown {
                info!(target: "server", "shutdown requested: {mode:?}");
                self.lifecycle.terminate(mode == ShutdownMode::Forceful)?;
                break;
            }

            for signal in self.signals.wait() {
                match signal {
                    SIGCHLD => {}
                    SIGUSR1 => self.command_pending = true,
                    SIGTERM | SIGINT => {
                        debug!(target: "server", "termination signal {signal}");
                        self.shutdown = Some(ShutdownMode::Forceful);
                    }
                    _ => {}
                }
            }
        }

        info!(target: "server", "serve loop finished, inferior {}", self.lifecycle.state());
        Ok(0)
    }

    /// Report every pending status change without blocking.
    fn drain_events(&mut self) -> Result<(), Error> {
        while !self.finished {
            match self.lifecycle.poll(WaitMode::NonBlocking)? {
                Poll::Idle => break,
                Poll::Diverted => continue,
                Poll::Event(event) => self.report(event)?,
            }
        }
        Ok(())
    }

    fn report(&mut self, event: Event) -> Result<(), Error> {
        if let Event::Stopped(signal) = event {
            self.last_stop = Some(signal);
        }

        if self.entry_pending {
            self.entry_pending = false;
            if event == Event::Stopped(Signal::SIGTRAP) && !self.stop_at_entry {
                debug!(target: "server", "run through entry stop");
                if weak_error!(self.lifecycle.continue_(), "resume after entry stop:").is_some() {
                    return Ok(());
                }
                // still stopped, the front-end has to learn about it
            }
        }

        let message = event.status_message();
        debug!(target: "server", "status {message:?}");
        self.status.send(message)?;
        if event.is_terminal() {
            self.finished = true;
        }
        Ok(())
    }

    /// Read one command and write exactly one response to it.
    fn serve_command(&mut self) -> Result<(), Error> {
        let command = self.commands.read_command()?;
        let opcode = command.opcode();
        debug!(target: "server", "command {opcode:?} {command:?}");

        // the data block is part of the request even if the write is refused
        let payload = match opcode {
            Some(Opcode::WriteMemory) => self.commands.read_payload(command.arg2)?,
            _ => vec![],
        };

        let mut terminal = None;
        let (response, fatal) = match self.execute(opcode, &command, &payload, &mut terminal) {
            Ok(response) => (response, None),
            Err(e) => {
                warn!(target: "server", "command {opcode:?} failed: {e:#}");
                let response = Response::failed(e.code());
                (response, e.is_fatal().then_some(e))
            }
        };
        self.commands.write_response(opcode, &response)?;

        if let Some(e) = fatal {
            return Err(e);
        }
        if let Some(event) = terminal {
            self.report(event)?;
        }
        Ok(())
    }

    fn execute(
        &mut self,
        opcode: Option<Opcode>,
        command: &Command,
        payload: &[u8],
        terminal: &mut Option<Event>,
    ) -> Result<Response, Error> {
        let Some(opcode) = opcode else {
            return Ok(Response::failed(ResultCode::InvalidCommand));
        };

        let lifecycle = &mut self.lifecycle;
        let response = match opcode {
            Opcode::GetPc => Response::with_arg(lifecycle.get_pc()?),
            Opcode::Continue => {
                lifecycle.continue_()?;
                Response::ok()
            }
            Opcode::Step => {
                lifecycle.step()?;
                Response::ok()
            }
            Opcode::Detach => match lifecycle.detach()?.filter(Event::is_terminal) {
                None => Response::ok(),
                Some(event) => {
                    // died while being stopped for the detach
                    *terminal = Some(event);
                    Response::failed(ResultCode::NotStopped)
                }
            },
            Opcode::Shutdown => {
                self.shutdown = Some(ShutdownMode::Graceful);
                Response::ok()
            }
            Opcode::Kill => {
                self.shutdown = Some(ShutdownMode::Forceful);
                Response::ok()
            }
            Opcode::GetReturnAddress => Response::with_arg(lifecycle.get_return_address()?),
            Opcode::GetTargetInfo => Response::with_arg(lifecycle.target_info().pack()),
            Opcode::ReadMemory => {
                if command.arg2 > MAX_TRANSFER {
                    return Ok(Response::failed(ResultCode::InvalidCommand));
                }
                let bytes = lifecycle.read_memory(command.arg1 as usize, command.arg2 as usize)?;
                Response::memory(bytes)
            }
            Opcode::WriteMemory => {
                lifecycle.write_memory(command.arg1 as usize, payload)?;
                Response::ok()
            }
            Opcode::InsertBreakpoint => {
                Response::with_arg(lifecycle.insert_breakpoint(command.arg1 as usize)?)
            }
            Opcode::RemoveBreakpoint => {
                lifecycle.remove_breakpoint(command.arg1)?;
                Response::ok()
            }
            Opcode::Stop => match lifecycle.stop()? {
                None => Response::with_arg(signal_arg(self.last_stop)),
                Some(Event::Stopped(signal)) => {
                    self.last_stop = Some(signal);
                    Response::with_arg(signal as i32 as u64)
                }
                Some(event) => {
                    // died instead of stopping
                    *terminal = Some(event);
                    Response::failed(ResultCode::NotStopped)
                }
            },
            Opcode::SetSignal => {
                let signal = match command.arg1 {
                    0 => None,
                    raw => match i32::try_from(raw).ok().and_then(|s| Signal::try_from(s).ok()) {
                        Some(signal) => Some(signal),
                        None => return Ok(Response::failed(ResultCode::InvalidCommand)),
                    },
                };
                lifecycle.set_signal(signal)?;
                Response::ok()
            }
            Opcode::GetSignal => Response::with_arg(signal_arg(lifecycle.get_signal()?)),
        };
        Ok(response)
    }
}

fn signal_arg(signal: Option<Signal>) -> u64 {
    signal.map_or(0, |s| s as i32 as u64)
}
