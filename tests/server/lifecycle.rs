use crate::common::{SLEEPER, TRAPPER};
use inferior_server::inferior::breakpoint::BreakpointTable;
use inferior_server::inferior::error::Error;
use inferior_server::inferior::wait::WaitState;
use inferior_server::inferior::{Event, NativeOps, SpawnRequest, WaitMode};
use inferior_server::lifecycle::{InferiorState, Lifecycle, Poll};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serial_test::serial;
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::Arc;

fn spawn(argv: &[&str]) -> Lifecycle<NativeOps> {
    Lifecycle::spawn(
        NativeOps::default(),
        Arc::new(BreakpointTable::default()),
        Arc::new(WaitState::new()),
        &SpawnRequest::new(argv.iter().copied()),
    )
    .unwrap()
}

/// Block until the next event of the inferior.
fn next_event(lifecycle: &mut Lifecycle<NativeOps>) -> Event {
    loop {
        if let Poll::Event(event) = lifecycle.poll(WaitMode::Blocking).unwrap() {
            return event;
        }
    }
}

#[test]
#[serial]
fn test_first_status_belongs_to_spawned_pid() {
    let mut lifecycle = spawn(&[TRAPPER]);
    assert_eq!(lifecycle.state(), InferiorState::Running);
    assert!(lifecycle.wait_state().has_first());

    assert_eq!(next_event(&mut lifecycle), Event::Stopped(Signal::SIGTRAP));
    assert_eq!(lifecycle.state(), InferiorState::Stopped);
    assert!(!lifecycle.wait_state().has_first());

    lifecycle.terminate(true).unwrap();
    assert_eq!(lifecycle.state(), InferiorState::Signaled(Signal::SIGKILL));
}

#[test]
#[serial]
fn test_resume_only_while_stopped() {
    let mut lifecycle = spawn(&[SLEEPER, "30"]);
    next_event(&mut lifecycle);

    lifecycle.continue_().unwrap();
    assert_eq!(lifecycle.state(), InferiorState::Running);
    assert!(matches!(lifecycle.continue_(), Err(Error::NotStopped)));
    assert!(matches!(lifecycle.step(), Err(Error::NotStopped)));
    assert!(matches!(lifecycle.get_pc(), Err(Error::NotStopped)));
    assert!(matches!(
        lifecycle.read_memory(0x1000, 1),
        Err(Error::NotStopped)
    ));

    assert_eq!(lifecycle.stop().unwrap(), Some(Event::Stopped(Signal::SIGSTOP)));
    assert_eq!(lifecycle.state(), InferiorState::Stopped);
    assert_eq!(lifecycle.stop().unwrap(), None);

    lifecycle.step().unwrap();
    assert_eq!(next_event(&mut lifecycle), Event::Stopped(Signal::SIGTRAP));
    lifecycle.continue_().unwrap();

    lifecycle.terminate(true).unwrap();
    assert!(lifecycle.state().is_terminal());
}

#[test]
#[serial]
fn test_unaligned_read_matches_page_slice() {
    let mut lifecycle = spawn(&[TRAPPER]);
    next_event(&mut lifecycle);

    let pc = lifecycle.get_pc().unwrap() as usize;
    let page_size = 4096;
    let page_start = pc - pc % page_size;
    let page = lifecycle.read_memory(page_start, page_size).unwrap();

    for (offset, len) in [(1, 15), (123, 64), (4000, 96), (4095, 1)] {
        let bytes = lifecycle.read_memory(page_start + offset, len).unwrap();
        assert_eq!(bytes, page[offset..offset + len], "offset {offset}, len {len}");
    }

    lifecycle.terminate(true).unwrap();
}

#[test]
#[serial]
fn test_graceful_terminate_spawned() {
    let mut lifecycle = spawn(&[SLEEPER, "30"]);
    next_event(&mut lifecycle);
    lifecycle.continue_().unwrap();

    lifecycle.terminate(false).unwrap();
    // signal delivered untraced
    assert_eq!(lifecycle.state(), InferiorState::Detached);
    let pid = lifecycle.pid().unwrap();
    assert_eq!(
        waitpid(pid, None).unwrap(),
        WaitStatus::Signaled(pid, Signal::SIGTERM, false)
    );
}

#[test]
#[serial]
fn test_attach_and_detach() {
    let mut sleeper = Command::new(SLEEPER)
        .arg("30")
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let mut line = String::new();
    BufReader::new(sleeper.stdout.take().unwrap())
        .read_line(&mut line)
        .unwrap();
    let pid = Pid::from_raw(sleeper.id() as i32);

    let mut lifecycle = Lifecycle::attach(
        NativeOps::default(),
        Arc::new(BreakpointTable::default()),
        Arc::new(WaitState::new()),
        pid,
    )
    .unwrap();
    assert_eq!(next_event(&mut lifecycle), Event::Stopped(Signal::SIGSTOP));
    assert!(lifecycle.get_pc().unwrap() != 0);

    lifecycle.terminate(false).unwrap();
    assert_eq!(lifecycle.state(), InferiorState::Detached);
    assert_eq!(lifecycle.poll(WaitMode::NonBlocking).unwrap(), Poll::Idle);

    assert_eq!(
        waitpid(pid, Some(WaitPidFlag::WNOHANG)).unwrap(),
        WaitStatus::StillAlive
    );
    signal::kill(pid, Signal::SIGKILL).unwrap();
    sleeper.wait().unwrap();
}

#[test]
#[serial]
fn test_spawn_missing_program() {
    let result = Lifecycle::spawn(
        NativeOps::default(),
        Arc::new(BreakpointTable::default()),
        Arc::new(WaitState::new()),
        &SpawnRequest::new(["/definitely/not/a/program"]),
    );
    match result {
        Err(Error::ForkFailed(msg)) => assert!(msg.starts_with("Cannot exec")),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("spawn of a missing program succeeded"),
    }
}

#[test]
#[serial]
fn test_spawn_with_environment() {
    let mut request = SpawnRequest::new(["sh", "-c", "exit $EXIT_CODE"]);
    request.env = Some(vec![("EXIT_CODE".into(), "7".into())]);

    let mut lifecycle = Lifecycle::spawn(
        NativeOps::default(),
        Arc::new(BreakpointTable::default()),
        Arc::new(WaitState::new()),
        &request,
    )
    .unwrap();
    assert_eq!(next_event(&mut lifecycle), Event::Stopped(Signal::SIGTRAP));
    lifecycle.continue_().unwrap();

    assert_eq!(next_event(&mut lifecycle), Event::Exited(7));
    assert_eq!(lifecycle.state(), InferiorState::Exited(7));
    assert!(matches!(lifecycle.get_pc(), Err(Error::NotStopped)));
}

#[test]
#[serial]
fn test_memory_window_past_address_space() {
    let mut lifecycle = spawn(&[TRAPPER]);
    next_event(&mut lifecycle);

    assert!(matches!(
        lifecycle.write_memory(usize::MAX - 3, &[0u8; 8]),
        Err(Error::MemoryAccess(_, _))
    ));
    assert!(matches!(
        lifecycle.read_memory(usize::MAX - 3, 8),
        Err(Error::MemoryAccess(_, _))
    ));
    // session survives the rejected request
    assert!(lifecycle.get_pc().is_ok());

    lifecycle.terminate(true).unwrap();
}

#[test]
#[serial]
fn test_terminate_detached_spawned() {
    let mut lifecycle = spawn(&[SLEEPER, "30"]);
    next_event(&mut lifecycle);
    lifecycle.continue_().unwrap();

    lifecycle.detach().unwrap();
    assert_eq!(lifecycle.state(), InferiorState::Detached);
    let pid = lifecycle.pid().unwrap();
    assert_eq!(
        waitpid(pid, Some(WaitPidFlag::WNOHANG)).unwrap(),
        WaitStatus::StillAlive
    );

    lifecycle.terminate(true).unwrap();
    assert_eq!(
        waitpid(pid, None).unwrap(),
        WaitStatus::Signaled(pid, Signal::SIGKILL, false)
    );
}
