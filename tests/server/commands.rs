use crate::common::{ServerSession, SLEEPER, TRAPPER};
use crate::assert_no_proc;
use inferior_server::protocol::{Command, Opcode, ResultCode, StatusKind, MAX_TRANSFER};
use nix::sys::signal::Signal;
use serial_test::serial;

fn stopped_trapper() -> ServerSession {
    let mut session = ServerSession::spawn(&[TRAPPER]);
    session.inferior_pid();
    assert_eq!(session.next_status().kind, StatusKind::ChildStopped);
    session
}

fn finish(mut session: ServerSession) {
    assert_eq!(session.simple(Opcode::Continue).code, ResultCode::Ok);
    assert_eq!(session.next_status().kind, StatusKind::ChildExited);
    assert_eq!(session.wait_exit().code(), Some(0));
}

#[test]
#[serial]
fn test_unknown_opcode_keeps_alternation() {
    let mut session = stopped_trapper();

    let resp = session.request(Command {
        opcode: 0x1000,
        ..Default::default()
    });
    assert_eq!(resp.code, ResultCode::InvalidCommand);

    // the next response must still be in sync
    let pc = session.simple(Opcode::GetPc);
    assert_eq!(pc.code, ResultCode::Ok);
    assert_ne!(pc.arg, 0);

    finish(session);
}

#[test]
#[serial]
fn test_target_info() {
    let mut session = stopped_trapper();

    let info = session.simple(Opcode::GetTargetInfo);
    assert_eq!(info.code, ResultCode::Ok);
    assert_eq!(info.arg & 0xff, 4);
    assert_eq!((info.arg >> 8) & 0xff, 8);
    assert_eq!((info.arg >> 16) & 0xff, 8);

    let ret = session.simple(Opcode::GetReturnAddress);
    assert_eq!(ret.code, ResultCode::Ok);

    finish(session);
}

#[test]
#[serial]
fn test_memory_commands() {
    let mut session = stopped_trapper();
    let pc = session.simple(Opcode::GetPc).arg;

    let orig = session.request(Command::with_args(Opcode::ReadMemory, pc, 8));
    assert_eq!(orig.code, ResultCode::Ok);
    assert_eq!(orig.arg, 8);
    assert_eq!(orig.payload.len(), 8);

    // unaligned write in the middle of a word
    let patch = [0x90u8, 0x90, 0x90];
    let resp = session.request_with_payload(
        Command::with_args(Opcode::WriteMemory, pc + 3, patch.len() as u64),
        &patch,
    );
    assert_eq!(resp.code, ResultCode::Ok);
    let patched = session.request(Command::with_args(Opcode::ReadMemory, pc, 8));
    assert_eq!(&patched.payload[..3], &orig.payload[..3]);
    assert_eq!(&patched.payload[3..6], &patch);
    assert_eq!(&patched.payload[6..], &orig.payload[6..]);

    let resp = session.request_with_payload(
        Command::with_args(Opcode::WriteMemory, pc + 3, 3),
        &orig.payload[3..6],
    );
    assert_eq!(resp.code, ResultCode::Ok);
    let restored = session.request(Command::with_args(Opcode::ReadMemory, pc, 8));
    assert_eq!(restored.payload, orig.payload);

    let unmapped = session.request(Command::with_args(Opcode::ReadMemory, 0, 8));
    assert_eq!(unmapped.code, ResultCode::MemoryAccess);
    assert_eq!(unmapped.arg, 0);
    assert!(unmapped.payload.is_empty());

    let too_large =
        session.request(Command::with_args(Opcode::ReadMemory, pc, MAX_TRANSFER + 1));
    assert_eq!(too_large.code, ResultCode::InvalidCommand);
    assert_eq!(too_large.arg, 0);

    finish(session);
}

#[test]
#[serial]
fn test_breakpoint_commands() {
    let mut session = stopped_trapper();
    let pc = session.simple(Opcode::GetPc).arg;
    let orig = session.request(Command::with_args(Opcode::ReadMemory, pc, 1));

    let bp = session.request(Command::with_args(Opcode::InsertBreakpoint, pc, 0));
    assert_eq!(bp.code, ResultCode::Ok);
    assert_ne!(bp.arg, 0);
    let text = session.request(Command::with_args(Opcode::ReadMemory, pc, 1));
    assert_eq!(text.payload, vec![0xCC]);

    // second insertion at the same address is the same breakpoint
    let again = session.request(Command::with_args(Opcode::InsertBreakpoint, pc, 0));
    assert_eq!(again.arg, bp.arg);

    let removed = session.request(Command::with_args(Opcode::RemoveBreakpoint, bp.arg, 0));
    assert_eq!(removed.code, ResultCode::Ok);
    let text = session.request(Command::with_args(Opcode::ReadMemory, pc, 1));
    assert_eq!(text.payload, orig.payload);

    let unknown = session.request(Command::with_args(Opcode::RemoveBreakpoint, bp.arg, 0));
    assert_eq!(unknown.code, ResultCode::InvalidCommand);

    finish(session);
}

#[test]
#[serial]
fn test_signal_commands() {
    let mut session = stopped_trapper();

    // trace trap is never redelivered
    assert_eq!(session.simple(Opcode::GetSignal).arg, 0);

    let usr2 = Signal::SIGUSR2 as u64;
    let resp = session.request(Command::with_args(Opcode::SetSignal, usr2, 0));
    assert_eq!(resp.code, ResultCode::Ok);
    assert_eq!(session.simple(Opcode::GetSignal).arg, usr2);

    let bogus = session.request(Command::with_args(Opcode::SetSignal, 4096, 0));
    assert_eq!(bogus.code, ResultCode::InvalidCommand);
    assert_eq!(session.simple(Opcode::GetSignal).arg, usr2);

    let resp = session.request(Command::with_args(Opcode::SetSignal, 0, 0));
    assert_eq!(resp.code, ResultCode::Ok);
    assert_eq!(session.simple(Opcode::GetSignal).arg, 0);

    finish(session);
}

#[test]
#[serial]
fn test_step() {
    let mut session = stopped_trapper();
    let pc = session.simple(Opcode::GetPc).arg;

    assert_eq!(session.simple(Opcode::Step).code, ResultCode::Ok);
    let status = session.next_status();
    assert_eq!(status.kind, StatusKind::ChildStopped);
    assert_eq!(status.arg, Signal::SIGTRAP as i32);
    let stepped = session.simple(Opcode::GetPc);
    assert_eq!(stepped.code, ResultCode::Ok);
    assert_ne!(stepped.arg, pc);

    finish(session);
}

#[test]
#[serial]
fn test_commands_against_running_inferior() {
    let mut session = ServerSession::spawn(&[SLEEPER, "30"]);
    let pid = session.inferior_pid();

    for opcode in [Opcode::Continue, Opcode::Step, Opcode::GetSignal] {
        assert_eq!(session.simple(opcode).code, ResultCode::NotStopped);
    }
    let pc = session.simple(Opcode::GetPc);
    assert_eq!(pc.code, ResultCode::NotStopped);
    assert_eq!(pc.arg, 0);
    let read = session.request(Command::with_args(Opcode::ReadMemory, 0x1000, 8));
    assert_eq!(read.code, ResultCode::NotStopped);

    // refused write still consumes its data block
    let refused = session.request_with_payload(
        Command::with_args(Opcode::WriteMemory, 0x1000, 4),
        &[1, 2, 3, 4],
    );
    assert_eq!(refused.code, ResultCode::NotStopped);
    assert_eq!(session.simple(Opcode::GetTargetInfo).code, ResultCode::Ok);

    let stop = session.simple(Opcode::Stop);
    assert_eq!(stop.code, ResultCode::Ok);
    assert_eq!(stop.arg, Signal::SIGSTOP as u64);
    assert_eq!(session.simple(Opcode::GetPc).code, ResultCode::Ok);

    // stopping a stopped inferior reports the last stop again
    let again = session.simple(Opcode::Stop);
    assert_eq!(again.code, ResultCode::Ok);
    assert_eq!(again.arg, Signal::SIGSTOP as u64);

    assert_eq!(session.simple(Opcode::Kill).code, ResultCode::Ok);
    assert_eq!(session.wait_exit().code(), Some(0));
    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_detach_spawned_inferior() {
    let mut session = ServerSession::spawn(&[SLEEPER, "30"]);
    let pid = session.inferior_pid();

    assert_eq!(session.simple(Opcode::Detach).code, ResultCode::Ok);
    // nothing left to control
    assert_eq!(session.simple(Opcode::GetPc).code, ResultCode::NotStopped);
    assert_eq!(session.simple(Opcode::Shutdown).code, ResultCode::Ok);
    assert_eq!(session.wait_exit().code(), Some(0));
    // released but still owned by the server
    assert_no_proc!(pid);
}
