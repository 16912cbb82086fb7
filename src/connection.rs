//! A live session with the console.
//!
//! Opening a [`Connection`] opens `/dev/fsa`. Closing it unmounts every
//! volume mounted through it, then the auxiliary volume, then closes the
//! driver handle and finally the socket. [`Connection::close`] reports
//! failures of that sequence, dropping the connection runs it best-effort.

use crate::{
    command::{svc, Channel},
    driver::DriverHandle,
    error::{Error, Result},
    fsa::{self, FsaClient},
    mcp::McpClient,
    transport::{TcpTransport, Transport},
    DEFAULT_PORT,
};
use std::{mem, thread, time::Duration};

/// Volume unmounted at teardown whether or not it was mounted through this
/// connection.
pub const AUXILIARY_VOLUME: &str = "/vol/storage_sdcard";

/// Flags passed to every unmount done at teardown.
pub const TEARDOWN_UNMOUNT_FLAGS: u32 = 2;

const POWER_SHUTDOWN: u32 = 0;
const POWER_RESET: u32 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Host name or IP address of the console.
    pub address: String,
    pub port: u16,
    /// Connection attempts before giving up. Zero behaves like one.
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    /// Limit on how long a response may take. The protocol has none.
    pub read_timeout: Option<Duration>,
    pub auxiliary_volume: Option<String>,
}

impl Config {
    pub fn new(address: impl Into<String>) -> Self {
        Config {
            address: address.into(),
            port: DEFAULT_PORT,
            connect_attempts: 3,
            retry_delay: Duration::from_secs(1),
            read_timeout: None,
            auxiliary_volume: Some(AUXILIARY_VOLUME.to_string()),
        }
    }
}

pub struct Connection<T: Transport = TcpTransport> {
    channel: Channel<T>,
    /// `None` once torn down or after a terminal call.
    fsa: Option<DriverHandle>,
    mounts: Vec<String>,
    auxiliary_volume: Option<String>,
}

impl Connection<TcpTransport> {
    /// Connects to the stub, retrying with a delay as configured, and opens
    /// the file system driver.
    pub fn connect(config: &Config) -> Result<Self> {
        let attempts = config.connect_attempts.max(1);
        let mut attempt = 1;

        let transport = loop {
            match TcpTransport::connect(
                (config.address.as_str(), config.port),
                config.read_timeout,
            ) {
                Ok(transport) => break transport,
                Err(err) if attempt < attempts => {
                    log::warn!(
                        "connection attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        err
                    );
                    thread::sleep(config.retry_delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        log::info!("connected to {}:{}", config.address, config.port);
        Connection::with_transport(transport, config)
    }
}

impl<T: Transport> Connection<T> {
    /// Opens the file system driver over an established transport.
    pub fn with_transport(transport: T, config: &Config) -> Result<Self> {
        let mut channel = Channel::new(transport);
        let fsa = channel.open(fsa::DEVICE, 0)?;
        Ok(Connection {
            channel,
            fsa: Some(fsa),
            mounts: Vec::new(),
            auxiliary_volume: config.auxiliary_volume.clone(),
        })
    }

    /// Raw access to the core commands.
    pub fn channel(&mut self) -> &mut Channel<T> {
        &mut self.channel
    }

    /// The file system driver. Volumes mounted through it are unmounted at
    /// teardown.
    pub fn fsa(&mut self) -> Result<FsaClient<'_, T>> {
        let handle = self.fsa.as_ref().ok_or(Error::ConnectionClosed)?;
        Ok(FsaClient::tracking(&mut self.channel, handle, &mut self.mounts))
    }

    /// Opens the title management driver.
    pub fn mcp(&mut self) -> Result<McpClient<'_, T>> {
        if self.fsa.is_none() {
            return Err(Error::ConnectionClosed);
        }
        McpClient::open(&mut self.channel)
    }

    /// Volumes mounted through [`Connection::fsa`] and not unmounted yet.
    pub fn mounted_volumes(&self) -> &[String] {
        &self.mounts
    }

    /// Leaves `volume` mounted at teardown, including the auxiliary volume.
    pub fn keep_mounted(&mut self, volume: &str) {
        self.mounts.retain(|mounted| mounted != volume);
        if self.auxiliary_volume.as_deref() == Some(volume) {
            self.auxiliary_volume = None;
        }
    }

    /// Tears the session down and reports the first failure.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    /// Powers the console off. Nothing is torn down first and no answer is
    /// awaited.
    pub fn shutdown(self) -> Result<()> {
        self.power(POWER_SHUTDOWN)
    }

    /// Reboots the console. Nothing is torn down first and no answer is
    /// awaited.
    pub fn reset(self) -> Result<()> {
        self.power(POWER_RESET)
    }

    fn power(mut self, mode: u32) -> Result<()> {
        self.fsa = None;
        self.mounts.clear();
        self.channel.send_terminal(svc::POWER, &[mode])
    }

    fn teardown(&mut self) -> Result<()> {
        let handle = match self.fsa.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };

        let mut first_error = None;
        let mut volumes = mem::take(&mut self.mounts);
        volumes.reverse();
        let auxiliary = self
            .auxiliary_volume
            .take()
            .filter(|volume| !volumes.contains(volume));

        {
            let mut fsa = FsaClient::new(&mut self.channel, &handle);
            for volume in &volumes {
                if let Err(err) = fsa.unmount(volume, TEARDOWN_UNMOUNT_FLAGS) {
                    log::warn!("failed to unmount {}: {}", volume, err);
                    first_error.get_or_insert(err);
                }
            }
            if let Some(volume) = &auxiliary {
                match fsa.unmount(volume, TEARDOWN_UNMOUNT_FLAGS) {
                    Ok(()) => {}
                    // Usually it simply wasn't mounted.
                    Err(Error::Status(status)) => {
                        log::debug!("{} not unmounted: {}", volume, status)
                    }
                    Err(err) => {
                        log::warn!("failed to unmount {}: {}", volume, err);
                        first_error.get_or_insert(err);
                    }
                }
            }
        }

        if let Err(err) = self.channel.close(handle) {
            log::warn!("failed to close {}: {}", fsa::DEVICE, err);
            first_error.get_or_insert(err);
        }
        log::info!("connection closed");

        first_error.map_or(Ok(()), Err)
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            log::warn!("teardown failed: {}", err);
        }
    }
}
