//! The file system driver (`/dev/fsa`).
//!
//! Every request is a 0x520 byte block: a path or handle at offset 4, a
//! second string or word at 0x284 and a third word at 0x288. Most calls
//! answer with a 0x293 byte block; calls that open something put the new
//! handle in its second word.

use crate::{
    alloc::{RemoteAddress, Staging},
    command::Channel,
    driver::{DriverHandle, IoVec, Ioctlv},
    error::{Error, Result},
    transport::Transport,
    wire::{self, WireBuffer},
    IOVEC_ALIGNMENT,
};
use bytes::Bytes;
use std::{convert::TryFrom, fmt};

pub const DEVICE: &str = "/dev/fsa";

/// Mode mask used by [`FsaClient::change_mode`] callers that don't care.
pub const DEFAULT_MODE_MASK: u32 = 0x777;

/// Size of the console-side buffer used by [`FsaClient::copy_file`].
pub const COPY_BUFFER_LEN: u32 = 0x10000;

mod command {
    pub const MOUNT: u32 = 0x01;
    pub const UNMOUNT: u32 = 0x02;
    pub const MAKE_DIR: u32 = 0x07;
    pub const REMOVE: u32 = 0x08;
    pub const RENAME: u32 = 0x09;
    pub const OPEN_DIR: u32 = 0x0A;
    pub const READ_DIR: u32 = 0x0B;
    pub const CLOSE_DIR: u32 = 0x0D;
    pub const OPEN_FILE: u32 = 0x0E;
    pub const READ_FILE: u32 = 0x0F;
    pub const WRITE_FILE: u32 = 0x10;
    pub const GET_STAT_FILE: u32 = 0x14;
    pub const CLOSE_FILE: u32 = 0x15;
    pub const GET_INFO_BY_QUERY: u32 = 0x18;
    pub const FLUSH_VOLUME: u32 = 0x1B;
    pub const CHANGE_MODE: u32 = 0x20;
    pub const FORMAT: u32 = 0x69;
    pub const RAW_OPEN: u32 = 0x6A;
}

const REQUEST_LEN: usize = 0x520;
const RESPONSE_LEN: u32 = 0x293;

const PATH: usize = 0x004;
const PATH_CAPACITY: usize = 0x280;
const ARG: usize = 0x284;
const ARG_CAPACITY: usize = 0x280;
const MASK: usize = 0x288;
const MODE_CAPACITY: usize = 0x10;
const MOUNT_FLAGS: usize = 0x504;
const FILESYSTEM_CAPACITY: usize = 0x0B;
const FORMAT_FLAGS: usize = 0x28F;

const TRANSFER_SIZE: usize = 0x08;
const TRANSFER_COUNT: usize = 0x0C;
const TRANSFER_HANDLE: usize = 0x14;

const ENTRY_STAT: usize = 0x04;
const ENTRY_NAME: usize = ENTRY_STAT + FileStat::LEN;

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Eq, PartialEq, Hash)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            pub const fn from_raw(raw: u32) -> Self {
                $name(raw)
            }

            #[inline]
            pub const fn to_raw(&self) -> u32 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

handle! {
    /// An open file. Closed by [`FsaClient::close_file`].
    FileHandle
}
handle! {
    /// An open directory. Closed by [`FsaClient::close_dir`].
    DirHandle
}
handle! {
    /// A block device opened with [`FsaClient::raw_open`].
    RawHandle
}

/// The 25 word stat block returned for files and directory entries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FileStat {
    words: [u32; 25],
}

impl FileStat {
    pub const LEN: usize = 0x64;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(FileStat {
            words: wire::read_words(bytes, "stat block")?,
        })
    }

    pub fn flags(&self) -> u32 {
        self.words[1]
    }

    pub fn mode(&self) -> u32 {
        self.words[2]
    }

    pub fn owner(&self) -> u32 {
        self.words[3]
    }

    pub fn group(&self) -> u32 {
        self.words[4]
    }

    pub fn size(&self) -> u32 {
        self.words[5]
    }

    /// All words, including the ones without a known meaning.
    pub fn words(&self) -> &[u32; 25] {
        &self.words
    }
}

/// Answer to [`FsaClient::query_info`]. The layout depends on the query
/// type, so only the raw words are exposed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueryInfo {
    words: [u32; 25],
}

impl QueryInfo {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(QueryInfo {
            words: wire::read_words(bytes, "query result")?,
        })
    }

    pub fn words(&self) -> &[u32; 25] {
        &self.words
    }
}

/// One entry read from an open directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub is_file: bool,
    pub raw: [u8; FileStat::LEN],
}

impl DirEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RESPONSE_LEN as usize {
            return Err(Error::MalformedResponse {
                what: "directory entry",
                expected: RESPONSE_LEN as usize,
                actual: bytes.len(),
            });
        }

        let mut raw = [0; FileStat::LEN];
        raw.copy_from_slice(&bytes[ENTRY_STAT..ENTRY_NAME]);
        Ok(DirEntry {
            name: wire::read_c_string(&bytes[ENTRY_NAME..]),
            is_file: raw[0] & 0x80 == 0,
            raw,
        })
    }

    /// The entry's metadata.
    pub fn stat(&self) -> FileStat {
        let mut words = [0; 25];
        for (word, bytes) in words.iter_mut().zip(self.raw.chunks_exact(4)) {
            *word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        FileStat { words }
    }
}

/// Calls against an open `/dev/fsa` handle.
///
/// A driver failure is returned as [`Error::Status`] carrying the code, so
/// callers can tell "not found" from "already exists".
pub struct FsaClient<'c, T: Transport> {
    channel: &'c mut Channel<T>,
    handle: &'c DriverHandle,
    mounts: Option<&'c mut Vec<String>>,
}

impl<'c, T: Transport> FsaClient<'c, T> {
    pub fn new(channel: &'c mut Channel<T>, handle: &'c DriverHandle) -> Self {
        FsaClient {
            channel,
            handle,
            mounts: None,
        }
    }

    /// Like [`FsaClient::new`], but records successful mounts in `mounts`
    /// and forgets them again when they are unmounted.
    pub(crate) fn tracking(
        channel: &'c mut Channel<T>,
        handle: &'c DriverHandle,
        mounts: &'c mut Vec<String>,
    ) -> Self {
        FsaClient {
            channel,
            handle,
            mounts: Some(mounts),
        }
    }

    pub fn mount(&mut self, device_path: &str, volume_path: &str, flags: u32) -> Result<()> {
        let mut block = WireBuffer::new(REQUEST_LEN);
        block.put_str(PATH, PATH_CAPACITY, device_path)?;
        block.put_str(ARG, ARG_CAPACITY, volume_path)?;
        block.put_u32(MOUNT_FLAGS, flags);

        let request = Ioctlv::new()
            .input(block.as_slice())
            .input(&[])
            .output(RESPONSE_LEN);
        let reply = self.channel.ioctlv(self.handle, command::MOUNT, &request)?;
        reply.status.check()?;

        if let Some(mounts) = self.mounts.as_mut() {
            if !mounts.iter().any(|mounted| mounted == volume_path) {
                mounts.push(volume_path.to_string());
            }
        }
        log::info!("mounted {} at {}", device_path, volume_path);
        Ok(())
    }

    pub fn unmount(&mut self, volume_path: &str, flags: u32) -> Result<()> {
        let mut block = path_block(volume_path)?;
        block.put_u32(ARG, flags);
        self.call(command::UNMOUNT, block)?;

        if let Some(mounts) = self.mounts.as_mut() {
            mounts.retain(|mounted| mounted != volume_path);
        }
        log::info!("unmounted {}", volume_path);
        Ok(())
    }

    pub fn raw_open(&mut self, device_path: &str) -> Result<RawHandle> {
        let output = self.call(command::RAW_OPEN, path_block(device_path)?)?;
        opened(&output).map(RawHandle)
    }

    pub fn open_dir(&mut self, path: &str) -> Result<DirHandle> {
        let output = self.call(command::OPEN_DIR, path_block(path)?)?;
        opened(&output).map(DirHandle)
    }

    /// Reads the next entry. Once the directory is exhausted the driver
    /// answers with a nonzero status, returned as [`Error::Status`].
    pub fn read_dir(&mut self, dir: &DirHandle) -> Result<DirEntry> {
        let output = self.call(command::READ_DIR, handle_block(dir.0))?;
        DirEntry::parse(&output)
    }

    pub fn close_dir(&mut self, dir: DirHandle) -> Result<()> {
        self.call(command::CLOSE_DIR, handle_block(dir.0)).map(drop)
    }

    /// Opens a file with an fopen style `mode` such as `"r"` or `"w"`.
    pub fn open_file(&mut self, path: &str, mode: &str) -> Result<FileHandle> {
        let mut block = path_block(path)?;
        block.put_str(ARG, MODE_CAPACITY, mode)?;
        let output = self.call(command::OPEN_FILE, block)?;
        opened(&output).map(FileHandle)
    }

    pub fn make_dir(&mut self, path: &str, flags: u32) -> Result<()> {
        let mut block = path_block(path)?;
        block.put_u32(ARG, flags);
        self.call(command::MAKE_DIR, block).map(drop)
    }

    /// Reads up to `count` elements of `size` bytes from the file position.
    ///
    /// The result holds only the elements actually read, so a short result
    /// marks the end of the file.
    pub fn read_file(&mut self, file: &FileHandle, size: u32, count: u32) -> Result<Bytes> {
        let len = transfer_len(size, count)?;
        let block = transfer_block(file, size, count);

        let request = Ioctlv::new()
            .input(block.as_slice())
            .output(len)
            .output(RESPONSE_LEN);
        let reply = self.channel.ioctlv(self.handle, command::READ_FILE, &request)?;
        let elements = reply.status.count()?;

        let mut data = reply.outputs.into_iter().next().unwrap_or_default();
        let read = (elements as usize).saturating_mul(size as usize);
        data.truncate(read);
        Ok(data)
    }

    /// Writes `data` as single byte elements and returns how many were
    /// written.
    pub fn write_file(&mut self, file: &FileHandle, data: &[u8]) -> Result<u32> {
        let count = u32::try_from(data.len()).map_err(|_| Error::WriteTooLarge {
            requested: data.len(),
            limit: u32::MAX as usize,
        })?;
        let block = transfer_block(file, 1, count);

        let request = Ioctlv::new()
            .input(block.as_slice())
            .input(data)
            .output(RESPONSE_LEN);
        let reply = self.channel.ioctlv(self.handle, command::WRITE_FILE, &request)?;
        reply.status.count()
    }

    /// Reads straight into `buffer` on the console, which must hold
    /// `size * count` bytes. Returns the number of elements read.
    pub fn read_file_to(
        &mut self,
        file: &FileHandle,
        size: u32,
        count: u32,
        buffer: RemoteAddress,
    ) -> Result<u32> {
        let len = transfer_len(size, count)?;
        let block = transfer_block(file, size, count);

        let request = Ioctlv::new()
            .input(block.as_slice())
            .output(RESPONSE_LEN)
            .remote_output(IoVec::new(buffer, len));
        let reply = self.channel.ioctlv(self.handle, command::READ_FILE, &request)?;
        reply.status.count()
    }

    /// Writes `size * count` bytes from `buffer` on the console. Returns
    /// the number of elements written.
    pub fn write_file_from(
        &mut self,
        file: &FileHandle,
        size: u32,
        count: u32,
        buffer: RemoteAddress,
    ) -> Result<u32> {
        let len = transfer_len(size, count)?;
        let block = transfer_block(file, size, count);

        let request = Ioctlv::new()
            .input(block.as_slice())
            .remote_input(IoVec::new(buffer, len))
            .output(RESPONSE_LEN);
        let reply = self.channel.ioctlv(self.handle, command::WRITE_FILE, &request)?;
        reply.status.count()
    }

    /// Writes all of `data` in pieces of at most `chunk_len` bytes. A piece
    /// the console only partly accepts is an [`Error::ShortTransfer`].
    pub fn write_all(&mut self, file: &FileHandle, data: &[u8], chunk_len: usize) -> Result<()> {
        for chunk in data.chunks(chunk_len.max(1)) {
            let written = self.write_file(file, chunk)?;
            if written as usize != chunk.len() {
                return Err(Error::ShortTransfer {
                    expected: chunk.len() as u32,
                    actual: written,
                });
            }
        }
        Ok(())
    }

    /// Copies the file at `from` to `to` on the console. The data only
    /// passes through one staged buffer there and never crosses the
    /// network. Returns the number of bytes copied.
    pub fn copy_file(&mut self, from: &str, to: &str) -> Result<u64> {
        let handle = self.handle;
        let mut staging = Staging::new(&mut *self.channel);
        let buffer = staging.allocate_aligned(COPY_BUFFER_LEN, IOVEC_ALIGNMENT)?;

        let copied = FsaClient::new(staging.channel(), handle).copy_through(buffer, from, to);
        let released = staging.release();

        let copied = copied?;
        released?;
        log::info!("copied {} bytes from {} to {}", copied, from, to);
        Ok(copied)
    }

    fn copy_through(&mut self, buffer: RemoteAddress, from: &str, to: &str) -> Result<u64> {
        let src = self.open_file(from, "r")?;
        let dst = match self.open_file(to, "w") {
            Ok(dst) => dst,
            Err(err) => {
                if let Err(close_err) = self.close_file(src) {
                    log::warn!("failed to close {}: {}", from, close_err);
                }
                return Err(err);
            }
        };

        let mut copied = 0u64;
        let result = loop {
            let read = match self.read_file_to(&src, 1, COPY_BUFFER_LEN, buffer) {
                Ok(0) => break Ok(copied),
                Ok(read) => read,
                Err(err) => break Err(err),
            };
            match self.write_file_from(&dst, 1, read, buffer) {
                Ok(written) if written == read => copied += u64::from(read),
                Ok(written) => {
                    break Err(Error::ShortTransfer {
                        expected: read,
                        actual: written,
                    })
                }
                Err(err) => break Err(err),
            }
        };

        let closed_src = self.close_file(src);
        let closed_dst = self.close_file(dst);
        let copied = result?;
        closed_src?;
        closed_dst?;
        Ok(copied)
    }

    pub fn stat_file(&mut self, file: &FileHandle) -> Result<FileStat> {
        let reply = self.channel.ioctl(
            self.handle,
            command::GET_STAT_FILE,
            handle_block(file.0).as_slice(),
            FileStat::LEN as u32,
        )?;
        reply.status.check()?;
        FileStat::parse(&reply.output)
    }

    pub fn close_file(&mut self, file: FileHandle) -> Result<()> {
        self.call(command::CLOSE_FILE, handle_block(file.0)).map(drop)
    }

    pub fn change_mode(&mut self, path: &str, mode: u32, mask: u32) -> Result<()> {
        let mut block = path_block(path)?;
        block.put_u32(ARG, mode);
        block.put_u32(MASK, mask);
        self.call(command::CHANGE_MODE, block).map(drop)
    }

    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        let mut block = path_block(old_path)?;
        block.put_str(ARG, ARG_CAPACITY, new_path)?;
        self.call(command::RENAME, block).map(drop)
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.call(command::REMOVE, path_block(path)?).map(drop)
    }

    pub fn flush_volume(&mut self, volume_path: &str) -> Result<()> {
        self.call(command::FLUSH_VOLUME, path_block(volume_path)?)
            .map(drop)
    }

    pub fn format(&mut self, device_path: &str, filesystem: &str, flags: u32) -> Result<()> {
        let mut block = path_block(device_path)?;
        block.put_str(ARG, FILESYSTEM_CAPACITY, filesystem)?;
        block.put_u32(FORMAT_FLAGS, flags);
        self.call(command::FORMAT, block).map(drop)
    }

    pub fn query_info(&mut self, path: &str, query_type: u32) -> Result<QueryInfo> {
        let mut block = path_block(path)?;
        block.put_u32(ARG, query_type);
        let reply = self.channel.ioctl(
            self.handle,
            command::GET_INFO_BY_QUERY,
            block.as_slice(),
            FileStat::LEN as u32,
        )?;
        reply.status.check()?;
        QueryInfo::parse(&reply.output)
    }

    /// Issues a plain ioctl answered with a 0x293 byte block.
    fn call(&mut self, command: u32, block: WireBuffer) -> Result<Bytes> {
        let reply = self
            .channel
            .ioctl(self.handle, command, block.as_slice(), RESPONSE_LEN)?;
        reply.status.check()?;
        Ok(reply.output)
    }
}

fn path_block(path: &str) -> Result<WireBuffer> {
    let mut block = WireBuffer::new(REQUEST_LEN);
    block.put_str(PATH, PATH_CAPACITY, path)?;
    Ok(block)
}

fn handle_block(raw: u32) -> WireBuffer {
    let mut block = WireBuffer::new(REQUEST_LEN);
    block.put_u32(PATH, raw);
    block
}

fn transfer_block(file: &FileHandle, size: u32, count: u32) -> WireBuffer {
    let mut block = WireBuffer::new(REQUEST_LEN);
    block.put_u32(TRANSFER_SIZE, size);
    block.put_u32(TRANSFER_COUNT, count);
    block.put_u32(TRANSFER_HANDLE, file.0);
    block
}

fn transfer_len(size: u32, count: u32) -> Result<u32> {
    size.checked_mul(count).ok_or(Error::ReadTooLarge {
        requested: size as usize * count as usize,
        limit: u32::MAX as usize,
    })
}

fn opened(output: &[u8]) -> Result<u32> {
    wire::read_u32(output, 4).ok_or(Error::MalformedResponse {
        what: "open reply",
        expected: RESPONSE_LEN as usize,
        actual: output.len(),
    })
}
