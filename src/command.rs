//! Framing of the six core commands and the [`Channel`] that issues them.
//!
//! Every request is a big-endian command id followed by the command's
//! payload, every response is a big-endian status word followed by the
//! payload the command defines. The protocol is strictly request/response.

use crate::{
    alloc::RemoteAddress,
    error::{Error, Result, StatusCode},
    transport::Transport,
    MAX_READ_LEN, MAX_SVC_ARGS, MAX_WRITE_LEN, STATUS_LEN,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{convert::TryFrom, fmt};

/// Kernel syscall numbers used on top of the `Svc` command.
pub mod svc {
    pub const ALLOC: u32 = 0x27;
    pub const ALLOC_ALIGNED: u32 = 0x28;
    pub const FREE: u32 = 0x29;
    pub const OPEN: u32 = 0x33;
    pub const CLOSE: u32 = 0x34;
    pub const IOCTL: u32 = 0x38;
    pub const IOCTLV: u32 = 0x39;
    /// Argument 0 shuts the console down, 1 resets it.
    pub const POWER: u32 = 0x72;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum CommandId {
    Write = 0,
    Read = 1,
    Svc = 2,
    Kill = 3,
    Memcpy = 4,
    RepeatWrite = 5,
}

impl TryFrom<u32> for CommandId {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => CommandId::Write,
            1 => CommandId::Read,
            2 => CommandId::Svc,
            3 => CommandId::Kill,
            4 => CommandId::Memcpy,
            5 => CommandId::RepeatWrite,
            _ => return Err(Error::MalformedRequest("unknown command id")),
        })
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandId::Write => "write",
            CommandId::Read => "read",
            CommandId::Svc => "svc",
            CommandId::Kill => "kill",
            CommandId::Memcpy => "memcpy",
            CommandId::RepeatWrite => "repeat-write",
        };
        f.write_str(name)
    }
}

/// A single request understood by the debug stub.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command<'a> {
    /// Writes `data` to `address`.
    Write {
        address: RemoteAddress,
        data: &'a [u8],
    },
    /// Reads `len` bytes from `address`.
    Read { address: RemoteAddress, len: u32 },
    /// Invokes kernel syscall `id`, answered with a 32-bit result.
    Svc { id: u32, args: Vec<u32> },
    /// Stops the stub's request loop. The socket stays open.
    Kill,
    /// Copies `len` bytes from `src` to `dst` on the console.
    Memcpy {
        dst: RemoteAddress,
        src: RemoteAddress,
        len: u32,
    },
    /// Stores `value` `count` times starting at `dst`.
    RepeatWrite {
        dst: RemoteAddress,
        value: u32,
        count: u32,
    },
}

impl<'a> Command<'a> {
    pub fn id(&self) -> CommandId {
        match self {
            Command::Write { .. } => CommandId::Write,
            Command::Read { .. } => CommandId::Read,
            Command::Svc { .. } => CommandId::Svc,
            Command::Kill => CommandId::Kill,
            Command::Memcpy { .. } => CommandId::Memcpy,
            Command::RepeatWrite { .. } => CommandId::RepeatWrite,
        }
    }

    /// Number of payload bytes that follow the status word of a
    /// successful response.
    pub fn reply_len(&self) -> usize {
        match self {
            Command::Read { len, .. } => *len as usize,
            Command::Svc { .. } => 4,
            _ => 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(4 + self.payload_len());
        frame.put_u32(self.id() as u32);

        match self {
            Command::Write { address, data } => {
                frame.put_u32(address.to_raw());
                frame.put_slice(data);
            }
            Command::Read { address, len } => {
                frame.put_u32(address.to_raw());
                frame.put_u32(*len);
            }
            Command::Svc { id, args } => {
                frame.put_u32(*id);
                for arg in args {
                    frame.put_u32(*arg);
                }
            }
            Command::Kill => {}
            Command::Memcpy { dst, src, len } => {
                frame.put_u32(dst.to_raw());
                frame.put_u32(src.to_raw());
                frame.put_u32(*len);
            }
            Command::RepeatWrite { dst, value, count } => {
                frame.put_u32(dst.to_raw());
                frame.put_u32(*value);
                frame.put_u32(*count);
            }
        }

        frame.freeze()
    }

    /// Parses a request frame, the way the stub on the console does.
    pub fn decode(frame: &'a [u8]) -> Result<Self> {
        let mut buf = frame;
        if buf.len() < 4 {
            return Err(Error::MalformedRequest("missing command id"));
        }
        let id = CommandId::try_from(buf.get_u32())?;

        let command = match id {
            CommandId::Write => {
                expect_words(buf, 1, false)?;
                let address = RemoteAddress::from_raw(buf.get_u32());
                Command::Write { address, data: buf }
            }
            CommandId::Read => {
                expect_words(buf, 2, true)?;
                Command::Read {
                    address: RemoteAddress::from_raw(buf.get_u32()),
                    len: buf.get_u32(),
                }
            }
            CommandId::Svc => {
                expect_words(buf, 1, false)?;
                if buf.len() % 4 != 0 {
                    return Err(Error::MalformedRequest("svc arguments are not whole words"));
                }
                let id = buf.get_u32();
                let mut args = Vec::with_capacity(buf.len() / 4);
                while buf.has_remaining() {
                    args.push(buf.get_u32());
                }
                Command::Svc { id, args }
            }
            CommandId::Kill => {
                expect_words(buf, 0, true)?;
                Command::Kill
            }
            CommandId::Memcpy => {
                expect_words(buf, 3, true)?;
                Command::Memcpy {
                    dst: RemoteAddress::from_raw(buf.get_u32()),
                    src: RemoteAddress::from_raw(buf.get_u32()),
                    len: buf.get_u32(),
                }
            }
            CommandId::RepeatWrite => {
                expect_words(buf, 3, true)?;
                Command::RepeatWrite {
                    dst: RemoteAddress::from_raw(buf.get_u32()),
                    value: buf.get_u32(),
                    count: buf.get_u32(),
                }
            }
        };

        Ok(command)
    }

    fn payload_len(&self) -> usize {
        match self {
            Command::Write { data, .. } => 4 + data.len(),
            Command::Read { .. } => 8,
            Command::Svc { args, .. } => 4 + 4 * args.len(),
            Command::Kill => 0,
            Command::Memcpy { .. } | Command::RepeatWrite { .. } => 12,
        }
    }
}

fn expect_words(buf: &[u8], words: usize, exact: bool) -> Result<()> {
    let len = words * 4;
    if buf.len() < len || (exact && buf.len() != len) {
        return Err(Error::MalformedRequest("unexpected payload length"));
    }
    Ok(())
}

/// A decoded response frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub payload: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, payload: Bytes) -> Self {
        Response { status, payload }
    }

    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(STATUS_LEN + self.payload.len());
        frame.put_u32(self.status.to_raw());
        frame.put_slice(&self.payload);
        frame.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.len() < STATUS_LEN {
            return Err(Error::ShortResponse {
                expected: STATUS_LEN,
                received: frame.len(),
            });
        }
        let status = StatusCode::from_raw(frame.get_u32());
        Ok(Response {
            status,
            payload: frame,
        })
    }
}

/// Typed access to the core commands over a [`Transport`].
///
/// A nonzero status on any command is reported as [`Error::Command`] and is
/// never retried.
pub struct Channel<T> {
    transport: T,
}

impl<T: Transport> Channel<T> {
    pub fn new(transport: T) -> Self {
        Channel { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn call(&mut self, command: Command<'_>) -> Result<Bytes> {
        let id = command.id();
        let expected = command.reply_len();
        let frame = command.encode();

        log::trace!("-> {} ({} bytes)", id, frame.len());
        let response = self.transport.request(&frame, expected)?;
        log::trace!("<- {} status {}", id, response.status);

        if !response.status.is_success() {
            return Err(Error::Command {
                command: id,
                status: response.status,
            });
        }
        if response.payload.len() != expected {
            return Err(Error::MalformedResponse {
                what: "response payload",
                expected,
                actual: response.payload.len(),
            });
        }

        Ok(response.payload)
    }

    /// Writes at most [`MAX_WRITE_LEN`] bytes with a single command.
    pub fn write(&mut self, address: RemoteAddress, data: &[u8]) -> Result<()> {
        if data.len() > MAX_WRITE_LEN {
            return Err(Error::WriteTooLarge {
                requested: data.len(),
                limit: MAX_WRITE_LEN,
            });
        }
        self.call(Command::Write { address, data }).map(drop)
    }

    /// Writes `data` of any length, split into as many commands as needed.
    pub fn write_bytes(&mut self, address: RemoteAddress, data: &[u8]) -> Result<()> {
        for (index, chunk) in data.chunks(MAX_WRITE_LEN).enumerate() {
            self.write(address.offset(index * MAX_WRITE_LEN), chunk)?;
        }
        Ok(())
    }

    /// Reads at most [`MAX_READ_LEN`] bytes with a single command.
    pub fn read(&mut self, address: RemoteAddress, len: usize) -> Result<Bytes> {
        if len > MAX_READ_LEN {
            return Err(Error::ReadTooLarge {
                requested: len,
                limit: MAX_READ_LEN,
            });
        }
        self.call(Command::Read {
            address,
            len: len as u32,
        })
    }

    /// Reads `len` bytes of any length, split into as many commands as needed.
    pub fn read_bytes(&mut self, address: RemoteAddress, len: usize) -> Result<Bytes> {
        if len <= MAX_READ_LEN {
            return self.read(address, len);
        }

        let mut data = BytesMut::with_capacity(len);
        while data.len() < len {
            let chunk = std::cmp::min(len - data.len(), MAX_READ_LEN);
            let bytes = self.read(address.offset(data.len()), chunk)?;
            data.put(bytes);
        }
        Ok(data.freeze())
    }

    /// Invokes syscall `id` and returns its 32-bit result.
    pub fn svc(&mut self, id: u32, args: &[u32]) -> Result<u32> {
        if args.len() > MAX_SVC_ARGS {
            return Err(Error::TooManyArguments(args.len()));
        }
        let mut result = self.call(Command::Svc {
            id,
            args: args.to_vec(),
        })?;
        Ok(result.get_u32())
    }

    pub fn kill(&mut self) -> Result<()> {
        self.call(Command::Kill).map(drop)
    }

    pub fn memcpy(&mut self, dst: RemoteAddress, src: RemoteAddress, len: u32) -> Result<()> {
        self.call(Command::Memcpy { dst, src, len }).map(drop)
    }

    pub fn repeat_write(&mut self, dst: RemoteAddress, value: u32, count: u32) -> Result<()> {
        self.call(Command::RepeatWrite { dst, value, count })
            .map(drop)
    }

    /// Sends a syscall that never gets an answer and closes the socket.
    ///
    /// Every later call on this channel fails with
    /// [`Error::ConnectionClosed`] without touching the network.
    pub fn send_terminal(&mut self, id: u32, args: &[u32]) -> Result<()> {
        if args.len() > MAX_SVC_ARGS {
            return Err(Error::TooManyArguments(args.len()));
        }
        let frame = Command::Svc {
            id,
            args: args.to_vec(),
        }
        .encode();

        log::info!("sending terminal svc {:#x}, closing connection", id);
        self.transport.send_terminal(&frame)
    }
}
