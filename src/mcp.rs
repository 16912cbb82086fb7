//! The title management driver (`/dev/mcp`).
//!
//! Installs run asynchronously on the console. [`McpClient::install`] only
//! starts one; polling [`McpClient::install_get_progress`] is up to the
//! caller.

use crate::{
    command::Channel,
    driver::{DriverHandle, Ioctlv, IoctlvReply},
    error::{Error, Result},
    transport::Transport,
    wire::{self, WireBuffer},
};
use bytes::Buf;

pub const DEVICE: &str = "/dev/mcp";

mod command {
    pub const INSTALL_GET_INFO: u32 = 0x80;
    pub const INSTALL: u32 = 0x81;
    pub const INSTALL_GET_PROGRESS: u32 = 0x82;
    pub const DELETE_TITLE: u32 = 0x83;
    pub const COPY_TITLE: u32 = 0x85;
    pub const INSTALL_SET_TARGET_DEVICE: u32 = 0x8D;
    pub const INSTALL_SET_TARGET_USB: u32 = 0xF1;
}

const PATH_BLOCK_LEN: usize = 0x27F;
const DELETE_PATH_BLOCK_LEN: usize = 0x38;
const INSTALL_INFO_LEN: u32 = 0x16;
const PROGRESS_LEN: u32 = 0x24;

/// Storage a title is installed to or copied to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum InstallTarget {
    Internal = 0,
    Usb = 1,
}

impl InstallTarget {
    pub const fn to_raw(self) -> u32 {
        self as u32
    }
}

/// Answer to [`McpClient::install_get_info`]: five words and a trailing
/// half word, passed through unchanged.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InstallInfo {
    pub words: [u32; 5],
    pub trailer: u16,
}

impl InstallInfo {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != INSTALL_INFO_LEN as usize {
            return Err(Error::MalformedResponse {
                what: "install info",
                expected: INSTALL_INFO_LEN as usize,
                actual: bytes.len(),
            });
        }
        let mut buf = bytes;
        let mut words = [0; 5];
        for word in words.iter_mut() {
            *word = buf.get_u32();
        }
        Ok(InstallInfo {
            words,
            trailer: buf.get_u16(),
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InstallProgress {
    pub in_progress: bool,
    pub title_id: u64,
    pub size_total: u64,
    pub size_progress: u64,
    pub contents_total: u32,
    pub contents_progress: u32,
}

impl InstallProgress {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let words = wire::read_words::<9>(bytes, "install progress")?;
        let wide = |hi: usize| u64::from(words[hi]) << 32 | u64::from(words[hi + 1]);
        Ok(InstallProgress {
            in_progress: words[0] != 0,
            title_id: wide(1),
            size_total: wide(3),
            size_progress: wide(5),
            contents_total: words[7],
            contents_progress: words[8],
        })
    }
}

/// An open `/dev/mcp` handle.
///
/// The handle is closed by [`McpClient::close`], or on drop if that was
/// never called.
pub struct McpClient<'c, T: Transport> {
    channel: &'c mut Channel<T>,
    handle: Option<DriverHandle>,
}

impl<'c, T: Transport> McpClient<'c, T> {
    pub fn open(channel: &'c mut Channel<T>) -> Result<Self> {
        let handle = channel.open(DEVICE, 0)?;
        Ok(McpClient {
            channel,
            handle: Some(handle),
        })
    }

    pub fn install_get_info(&mut self, path: &str) -> Result<InstallInfo> {
        let block = path_block(PATH_BLOCK_LEN, path)?;
        let request = Ioctlv::new()
            .input(block.as_slice())
            .output(INSTALL_INFO_LEN);
        let reply = self.ioctlv(command::INSTALL_GET_INFO, &request)?;
        reply.status.check()?;
        InstallInfo::parse(reply.outputs.first().map_or(&[][..], |output| &output[..]))
    }

    /// Starts installing the title found under `path`.
    pub fn install(&mut self, path: &str) -> Result<()> {
        let block = path_block(PATH_BLOCK_LEN, path)?;
        let request = Ioctlv::new().input(block.as_slice());
        self.ioctlv(command::INSTALL, &request)?.status.check()
    }

    pub fn install_get_progress(&mut self) -> Result<InstallProgress> {
        let handle = self.handle.as_ref().ok_or(Error::ConnectionClosed)?;
        let reply = self
            .channel
            .ioctl(handle, command::INSTALL_GET_PROGRESS, &[], PROGRESS_LEN)?;
        reply.status.check()?;
        InstallProgress::parse(&reply.output)
    }

    pub fn delete_title(&mut self, path: &str, flush: bool) -> Result<()> {
        let block = path_block(DELETE_PATH_BLOCK_LEN, path)?;
        let flush = word(flush as u32);
        let request = Ioctlv::new().input(block.as_slice()).input(&flush);
        self.ioctlv(command::DELETE_TITLE, &request)?
            .status
            .check()
    }

    pub fn copy_title(&mut self, path: &str, target: InstallTarget, flush: bool) -> Result<()> {
        let block = path_block(PATH_BLOCK_LEN, path)?;
        let target = word(target.to_raw());
        let flush = word(flush as u32);
        let request = Ioctlv::new()
            .input(block.as_slice())
            .input(&target)
            .input(&flush);
        self.ioctlv(command::COPY_TITLE, &request)?.status.check()
    }

    pub fn install_set_target_device(&mut self, target: InstallTarget) -> Result<()> {
        self.set_word(command::INSTALL_SET_TARGET_DEVICE, target.to_raw())
    }

    pub fn install_set_target_usb(&mut self, target: InstallTarget) -> Result<()> {
        self.set_word(command::INSTALL_SET_TARGET_USB, target.to_raw())
    }

    /// Starts an install to `target`: reads the install info, selects the
    /// target device and bus, then starts the install. Stops at the first
    /// failing step.
    pub fn begin_install(&mut self, path: &str, target: InstallTarget) -> Result<InstallInfo> {
        let info = self.install_get_info(path)?;
        self.install_set_target_device(target)?;
        self.install_set_target_usb(target)?;
        self.install(path)?;
        log::info!("started install of {} to {:?}", path, target);
        Ok(info)
    }

    pub fn close(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.channel.close(handle),
            None => Ok(()),
        }
    }

    fn set_word(&mut self, command: u32, value: u32) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(Error::ConnectionClosed)?;
        let reply = self.channel.ioctl(handle, command, &word(value), 0)?;
        reply.status.check()
    }

    fn ioctlv(&mut self, command: u32, request: &Ioctlv<'_>) -> Result<IoctlvReply> {
        let handle = self.handle.as_ref().ok_or(Error::ConnectionClosed)?;
        self.channel.ioctlv(handle, command, request)
    }
}

impl<T: Transport> Drop for McpClient<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.channel.close(handle) {
                log::warn!("failed to close {}: {}", DEVICE, err);
            }
        }
    }
}

fn path_block(len: usize, path: &str) -> Result<WireBuffer> {
    let mut block = WireBuffer::new(len);
    block.put_str(0, len, path)?;
    Ok(block)
}

fn word(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}
