//! Fixed-layout byte protocol spoken with the debugger front-end.
//!
//! Two channels compose the protocol. The command channel is a single bidirectional descriptor
//! carrying strictly alternating requests and responses. The status channel is write-only and
//! carries asynchronous inferior state changes. All integers are little-endian.

use bytes::{Buf, BufMut, BytesMut};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use strum_macros::{Display, FromRepr};

/// Magic token expected as the first server argument.
pub const PROTOCOL_MAGIC: &str = "8b21fa66e3bc4c0f";
/// Protocol version compiled into this server.
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of a command envelope on the wire.
pub const COMMAND_SIZE: usize = 24;
/// Size of a status message on the wire.
pub const STATUS_MESSAGE_SIZE: usize = 8;
/// Upper bound for a single memory transfer.
pub const MAX_TRANSFER: u64 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("magic token mismatch: got `{0}`")]
    BadMagic(String),
    #[error("unparseable protocol version `{0}`")]
    MalformedVersion(String),
    #[error("incorrect server version; this is {PROTOCOL_VERSION}, but the caller expects {0}")]
    VersionMismatch(u32),
    #[error("command channel closed")]
    Closed,
    #[error("transfer of {0} bytes exceeds the protocol limit")]
    TransferTooLarge(u64),
    #[error(transparent)]
    IO(#[from] io::Error),
}

/// Validate the `magic` + `version` pair a front-end passes on the command line.
pub fn check_handshake(magic: &str, version: &str) -> Result<(), ProtocolError> {
    if magic != PROTOCOL_MAGIC {
        return Err(ProtocolError::BadMagic(magic.to_string()));
    }
    let version: u32 = version
        .parse()
        .map_err(|_| ProtocolError::MalformedVersion(version.to_string()))?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(version));
    }
    Ok(())
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, FromRepr)]
#[repr(u32)]
pub enum Opcode {
    GetPc = 1,
    Continue = 2,
    Detach = 3,
    Shutdown = 4,
    Kill = 5,
    Step = 6,
    GetReturnAddress = 7,
    GetTargetInfo = 8,
    ReadMemory = 9,
    WriteMemory = 10,
    InsertBreakpoint = 11,
    RemoveBreakpoint = 12,
    Stop = 13,
    SetSignal = 14,
    GetSignal = 15,
}

impl Opcode {
    /// True if a response to this opcode carries a 64-bit argument after the result code.
    pub fn has_argument(self) -> bool {
        matches!(
            self,
            Opcode::GetPc
                | Opcode::GetReturnAddress
                | Opcode::GetTargetInfo
                | Opcode::ReadMemory
                | Opcode::InsertBreakpoint
                | Opcode::Stop
                | Opcode::GetSignal
        )
    }
}

/// Result code of a command.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, FromRepr)]
#[repr(u32)]
pub enum ResultCode {
    Ok = 0,
    InvalidCommand = 1,
    ForkFailed = 2,
    NotStopped = 3,
    MemoryAccess = 4,
    Unknown = 5,
    NotImplemented = 6,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, FromRepr)]
#[repr(u32)]
pub enum StatusKind {
    ChildExited = 1,
    ChildStopped = 2,
    ChildSignaled = 3,
    UnknownError = 4,
}

/// Request envelope.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Command {
    pub opcode: u32,
    pub arg1: u64,
    pub arg2: u64,
}

impl Command {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode: opcode as u32,
            ..Default::default()
        }
    }

    pub fn with_args(opcode: Opcode, arg1: u64, arg2: u64) -> Self {
        Self {
            opcode: opcode as u32,
            arg1,
            arg2,
        }
    }

    /// Known opcode of this command, `None` for an opcode this server does not understand.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_repr(self.opcode)
    }

    pub fn encode(&self) -> [u8; COMMAND_SIZE] {
        let mut buf = [0u8; COMMAND_SIZE];
        let mut dst = &mut buf[..];
        dst.put_u32_le(self.opcode);
        dst.put_u32_le(0);
        dst.put_u64_le(self.arg1);
        dst.put_u64_le(self.arg2);
        buf
    }

    pub fn decode(raw: &[u8; COMMAND_SIZE]) -> Self {
        let mut src = &raw[..];
        let opcode = src.get_u32_le();
        let _reserved = src.get_u32_le();
        Self {
            opcode,
            arg1: src.get_u64_le(),
            arg2: src.get_u64_le(),
        }
    }

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.encode())
    }
}

/// Reply to exactly one [`Command`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Response {
    pub code: ResultCode,
    pub arg: u64,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn ok() -> Self {
        Self::with_arg(0)
    }

    pub fn with_arg(arg: u64) -> Self {
        Self {
            code: ResultCode::Ok,
            arg,
            payload: vec![],
        }
    }

    pub fn failed(code: ResultCode) -> Self {
        Self {
            code,
            arg: 0,
            payload: vec![],
        }
    }

    /// Successful memory read, the argument announces the payload length.
    pub fn memory(bytes: Vec<u8>) -> Self {
        Self {
            code: ResultCode::Ok,
            arg: bytes.len() as u64,
            payload: bytes,
        }
    }

    /// Serialize the response as an answer to `opcode`.
    ///
    /// The argument is present only for opcodes that define one, so the size of a response is
    /// fixed per opcode (memory payload aside, whose size the argument announces).
    pub fn encode(&self, opcode: Option<Opcode>) -> BytesMut {
        let with_arg = opcode.is_some_and(Opcode::has_argument);
        let ok = self.code == ResultCode::Ok;

        let mut buf = BytesMut::with_capacity(12 + self.payload.len());
        buf.put_u32_le(self.code as u32);
        if with_arg {
            buf.put_u64_le(if ok { self.arg } else { 0 });
        }
        if ok && opcode == Some(Opcode::ReadMemory) {
            buf.put_slice(&self.payload);
        }
        buf
    }

    /// Read a response to `opcode` (front-end side of the protocol).
    pub fn read_from(r: &mut impl Read, opcode: Option<Opcode>) -> io::Result<Self> {
        let mut raw_code = [0u8; 4];
        r.read_exact(&mut raw_code)?;
        let code = ResultCode::from_repr(u32::from_le_bytes(raw_code)).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unknown result code")
        })?;

        let mut arg = 0;
        if opcode.is_some_and(Opcode::has_argument) {
            let mut raw_arg = [0u8; 8];
            r.read_exact(&mut raw_arg)?;
            arg = u64::from_le_bytes(raw_arg);
        }

        let mut payload = vec![];
        if opcode == Some(Opcode::ReadMemory) && code == ResultCode::Ok {
            payload = vec![0; arg as usize];
            r.read_exact(&mut payload)?;
        }

        Ok(Self { code, arg, payload })
    }
}

/// Asynchronous inferior state change.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StatusMessage {
    pub kind: StatusKind,
    pub arg: i32,
}

impl StatusMessage {
    pub fn new(kind: StatusKind, arg: i32) -> Self {
        Self { kind, arg }
    }

    pub fn encode(&self) -> [u8; STATUS_MESSAGE_SIZE] {
        let mut buf = [0u8; STATUS_MESSAGE_SIZE];
        let mut dst = &mut buf[..];
        dst.put_u32_le(self.kind as u32);
        dst.put_i32_le(self.arg);
        buf
    }

    pub fn read_from(r: &mut impl Read) -> io::Result<Self> {
        let mut raw = [0u8; STATUS_MESSAGE_SIZE];
        r.read_exact(&mut raw)?;
        let mut src = &raw[..];
        let kind = StatusKind::from_repr(src.get_u32_le())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown status kind"))?;
        Ok(Self {
            kind,
            arg: src.get_i32_le(),
        })
    }
}

/// Server side of the command channel.
pub struct CommandChannel<S> {
    stream: S,
}

impl<S: Read + Write> CommandChannel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Read exactly one command envelope. A short read breaks request/response alternation.
    pub fn read_command(&mut self) -> Result<Command, ProtocolError> {
        let mut raw = [0u8; COMMAND_SIZE];
        read_full(&mut self.stream, &mut raw)?;
        Ok(Command::decode(&raw))
    }

    /// Read the data block following a `WriteMemory` envelope.
    pub fn read_payload(&mut self, len: u64) -> Result<Vec<u8>, ProtocolError> {
        if len > MAX_TRANSFER {
            return Err(ProtocolError::TransferTooLarge(len));
        }
        let mut data = vec![0; len as usize];
        read_full(&mut self.stream, &mut data)?;
        Ok(data)
    }

    pub fn write_response(
        &mut self,
        opcode: Option<Opcode>,
        response: &Response,
    ) -> Result<(), ProtocolError> {
        self.stream.write_all(&response.encode(opcode))?;
        self.stream.flush()?;
        Ok(())
    }
}

fn read_full(r: &mut impl Read, buf: &mut [u8]) -> Result<(), ProtocolError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ProtocolError::Closed,
        _ => ProtocolError::IO(e),
    })
}

/// Server side of the status channel.
pub struct StatusChannel<W> {
    writer: W,
}

impl<W: Write> StatusChannel<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn send(&mut self, message: StatusMessage) -> Result<(), ProtocolError> {
        self.writer.write_all(&message.encode())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Take ownership of the two descriptors inherited from the front-end.
///
/// # Safety
///
/// Both descriptors must be open, owned by nobody else in this process and distinct.
pub unsafe fn inherited_channels(
    status_fd: RawFd,
    command_fd: RawFd,
) -> (StatusChannel<File>, CommandChannel<File>) {
    let status = File::from_raw_fd(status_fd);
    let commands = File::from_raw_fd(command_fd);
    (StatusChannel::new(status), CommandChannel::new(commands))
}
