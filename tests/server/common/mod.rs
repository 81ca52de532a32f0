use assert_cmd::cargo::CommandCargoExt;
use inferior_server::protocol::{
    Command, Opcode, Response, StatusMessage, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use os_pipe::PipeReader;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdout, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const TRAPPER: &str = env!("CARGO_BIN_EXE_trapper");
pub const SLEEPER: &str = env!("CARGO_BIN_EXE_sleeper");

const STATUS_FD: RawFd = 50;
const COMMAND_FD: RawFd = 51;
const TIMEOUT: Duration = Duration::from_secs(20);

/// Server process wired to the test through its two protocol channels.
pub struct ServerSession {
    child: Child,
    status: PipeReader,
    commands: UnixStream,
    stdout: BufReader<ChildStdout>,
}

impl ServerSession {
    /// Start a server spawning `argv` in the root directory.
    pub fn spawn(argv: &[&str]) -> Self {
        let mut args = vec!["0", "/"];
        args.extend_from_slice(argv);
        Self::start(&[], &args)
    }

    /// Start a server attached to `pid`.
    pub fn attach(pid: Pid) -> Self {
        Self::start(&[], &[pid.to_string().as_str()])
    }

    pub fn start(options: &[&str], args: &[&str]) -> Self {
        let (status_reader, status_writer) = os_pipe::pipe().unwrap();
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_read_timeout(Some(TIMEOUT)).unwrap();

        let mut cmd = std::process::Command::cargo_bin("inferior-server").unwrap();
        cmd.arg("--status-fd")
            .arg(STATUS_FD.to_string())
            .arg("--command-fd")
            .arg(COMMAND_FD.to_string())
            .args(options)
            .arg(PROTOCOL_MAGIC)
            .arg(PROTOCOL_VERSION.to_string())
            .args(args)
            .stdout(Stdio::piped());

        let status_raw = status_writer.as_raw_fd();
        let command_raw = theirs.as_raw_fd();
        unsafe {
            cmd.pre_exec(move || {
                unistd::dup2(status_raw, STATUS_FD)?;
                unistd::dup2(command_raw, COMMAND_FD)?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().unwrap();
        drop(status_writer);
        drop(theirs);
        let stdout = BufReader::new(child.stdout.take().unwrap());

        Self {
            child,
            status: status_reader,
            commands: ours,
            stdout,
        }
    }

    pub fn server_pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Pid printed by a helper inferior on start.
    pub fn inferior_pid(&mut self) -> Pid {
        let mut line = String::new();
        self.stdout.read_line(&mut line).unwrap();
        Pid::from_raw(line.trim().parse().unwrap())
    }

    pub fn next_status(&mut self) -> StatusMessage {
        StatusMessage::read_from(&mut self.status).unwrap()
    }

    pub fn request(&mut self, cmd: Command) -> Response {
        self.request_with_payload(cmd, &[])
    }

    pub fn request_with_payload(&mut self, cmd: Command, payload: &[u8]) -> Response {
        cmd.write_to(&mut self.commands).unwrap();
        self.commands.write_all(payload).unwrap();
        signal::kill(self.server_pid(), Signal::SIGUSR1).unwrap();
        Response::read_from(&mut self.commands, cmd.opcode()).unwrap()
    }

    pub fn simple(&mut self, opcode: Opcode) -> Response {
        self.request(Command::new(opcode))
    }

    /// Wait for the server process to exit.
    pub fn wait_exit(mut self) -> ExitStatus {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            if Instant::now() > deadline {
                self.child.kill().unwrap();
                panic!("server did not exit in time");
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

/// True if the process is gone or only a zombie is left of it.
pub fn is_dead(pid: Pid) -> bool {
    let sys = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::everything()
            .without_cpu()
            .without_memory(),
    );
    match sys.process(sysinfo::Pid::from_u32(pid.as_raw() as u32)) {
        None => true,
        Some(process) => process.status() == sysinfo::ProcessStatus::Zombie,
    }
}

#[macro_export]
macro_rules! assert_no_proc {
    ($pid:expr) => {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !$crate::common::is_dead($pid) {
            assert!(
                std::time::Instant::now() < deadline,
                "process {} still alive",
                $pid
            );
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    };
}
