//! `cafe_link` is a client for the debug stub that runs inside IOSU, the
//! security processor of the Wii U.
//!
//! The stub listens on TCP port [`DEFAULT_PORT`] and understands six
//! commands: memory writes and reads, kernel syscalls, a kill switch, memcpy
//! and a repeated word store. Everything else is built on top of the
//! syscalls:
//! 1. [`alloc`] pairs every allocation from the console's shared heap with
//! exactly one free.
//! 2. [`driver`] opens device nodes and marshals `ioctl`/`ioctlv` calls
//! through that heap.
//! 3. [`fsa`] and [`mcp`] encode the file system and title management
//! drivers on top of the marshalers.
//! 4. [`connection`] ties the pieces together and tears them down in order.
//!
//! ```no_run
//! use cafe_link::{Config, Connection};
//!
//! # fn main() -> cafe_link::Result<()> {
//! let mut connection = Connection::connect(&Config::new("192.168.1.20"))?;
//! let mut fsa = connection.fsa()?;
//! fsa.mount("/dev/sdcard01", "/vol/storage_sdcard", 2)?;
//! let dir = fsa.open_dir("/vol/storage_sdcard")?;
//! while let Ok(entry) = fsa.read_dir(&dir) {
//!     println!("{}", entry.name);
//! }
//! fsa.close_dir(dir)?;
//! connection.close()
//! # }
//! ```

pub use bytes;

pub mod alloc;
pub mod command;
pub mod connection;
pub mod driver;
pub mod error;
pub mod fsa;
pub mod mcp;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

pub use alloc::{RemoteAddress, RemoteAllocation, Staging};
pub use command::{Channel, Command, CommandId, Response};
pub use connection::{Config, Connection};
pub use driver::{DriverHandle, IoVec, Ioctlv, IoctlReply, IoctlvReply};
pub use error::{Error, ErrorKind, Result, StatusCode};
pub use fsa::{DirEntry, DirHandle, FileHandle, FileStat, FsaClient, QueryInfo, RawHandle};
pub use mcp::{InstallInfo, InstallProgress, InstallTarget, McpClient};
pub use transport::{TcpTransport, Transport};

/// Heap id passed to the allocation syscalls, selecting the shared heap.
pub const HEAP_ID: u32 = 0xCAFF;

/// Largest frame the stub accepts or sends, status word included.
pub const MAX_FRAME_LEN: usize = 0x600;

/// Length of the status word leading every response.
pub const STATUS_LEN: usize = 4;

/// Most bytes a single `Read` command may return.
pub const MAX_READ_LEN: usize = MAX_FRAME_LEN - STATUS_LEN;

/// Most data bytes a single `Write` command may carry.
pub const MAX_WRITE_LEN: usize = MAX_FRAME_LEN - 8;

/// Most argument words a single `Svc` command may carry.
pub const MAX_SVC_ARGS: usize = 8;

/// Alignment of every buffer staged for an ioctlv call.
pub const IOVEC_ALIGNMENT: u32 = 0x40;

pub const DEFAULT_PORT: u16 = 1337;
