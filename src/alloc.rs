//! Allocations from the console's shared heap.
//!
//! Every successful allocation must be paired with exactly one free, also
//! when the operation that needed it fails halfway. Operations that make
//! more than one allocation do so through a [`Staging`] guard, which frees
//! everything it handed out when it is released or dropped.

use crate::{
    command::{svc, Channel},
    error::{Error, Result, StatusCode},
    transport::Transport,
    HEAP_ID, MAX_WRITE_LEN,
};
use std::{convert::TryFrom, fmt, mem};

/// An address in the console's address space. Never dereferenced locally.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RemoteAddress(u32);

impl RemoteAddress {
    pub const NULL: RemoteAddress = RemoteAddress(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        RemoteAddress(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The address `bytes` past this one.
    #[inline]
    pub fn offset(self, bytes: usize) -> Self {
        RemoteAddress(self.0.wrapping_add(bytes as u32))
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::Debug for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteAddress(0x{:08X})", self.0)
    }
}

/// A block of remote heap memory and the size it was requested with.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RemoteAllocation {
    pub address: RemoteAddress,
    pub size: u32,
}

impl<T: Transport> Channel<T> {
    /// Allocates `size` bytes from the shared heap.
    ///
    /// A zero size returns [`RemoteAddress::NULL`] without a remote call.
    pub fn allocate(&mut self, size: u32) -> Result<RemoteAddress> {
        if size == 0 {
            return Ok(RemoteAddress::NULL);
        }
        let raw = self.svc(svc::ALLOC, &[HEAP_ID, size])?;
        allocated(size, raw)
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// A zero size returns [`RemoteAddress::NULL`] without a remote call.
    pub fn allocate_aligned(&mut self, size: u32, alignment: u32) -> Result<RemoteAddress> {
        if size == 0 {
            return Ok(RemoteAddress::NULL);
        }
        let raw = self.svc(svc::ALLOC_ALIGNED, &[HEAP_ID, size, alignment])?;
        allocated(size, raw)
    }

    /// Returns memory to the shared heap. Freeing null is a no-op.
    pub fn free(&mut self, address: RemoteAddress) -> Result<()> {
        if address.is_null() {
            return Ok(());
        }
        let result = self.svc(svc::FREE, &[HEAP_ID, address.to_raw()])?;
        log::debug!("freed {}", address);
        StatusCode::from_raw(result).check()
    }
}

fn allocated(size: u32, raw: u32) -> Result<RemoteAddress> {
    let address = RemoteAddress::from_raw(raw);
    if address.is_null() {
        return Err(Error::AllocationFailed { size });
    }
    log::debug!("allocated {:#x} bytes at {}", size, address);
    Ok(address)
}

/// Remote allocations owned by one in-progress operation.
///
/// Dropping the guard frees whatever is still outstanding, so an early
/// return through `?` never leaks console memory. [`Staging::release`]
/// does the same but reports the first failed free.
pub struct Staging<'c, T: Transport> {
    channel: &'c mut Channel<T>,
    allocations: Vec<RemoteAllocation>,
}

impl<'c, T: Transport> Staging<'c, T> {
    pub fn new(channel: &'c mut Channel<T>) -> Self {
        Staging {
            channel,
            allocations: Vec::new(),
        }
    }

    pub fn channel(&mut self) -> &mut Channel<T> {
        &mut *self.channel
    }

    /// Allocations still owned by the guard, oldest first.
    pub fn allocations(&self) -> &[RemoteAllocation] {
        &self.allocations
    }

    pub fn allocate(&mut self, size: u32) -> Result<RemoteAddress> {
        let address = self.channel.allocate(size)?;
        self.track(address, size);
        Ok(address)
    }

    pub fn allocate_aligned(&mut self, size: u32, alignment: u32) -> Result<RemoteAddress> {
        let address = self.channel.allocate_aligned(size, alignment)?;
        self.track(address, size);
        Ok(address)
    }

    /// Copies `data` into a fresh allocation. Empty data stages nothing and
    /// yields the null address.
    pub fn stage(&mut self, data: &[u8], alignment: Option<u32>) -> Result<RemoteAddress> {
        let size = u32::try_from(data.len()).map_err(|_| Error::WriteTooLarge {
            requested: data.len(),
            limit: MAX_WRITE_LEN,
        })?;
        let address = match alignment {
            Some(alignment) => self.allocate_aligned(size, alignment)?,
            None => self.allocate(size)?,
        };
        if !address.is_null() {
            self.channel.write_bytes(address, data)?;
        }
        Ok(address)
    }

    /// Frees every allocation and returns the first error, if any.
    pub fn release(mut self) -> Result<()> {
        self.free_all()
    }

    fn track(&mut self, address: RemoteAddress, size: u32) {
        if !address.is_null() {
            self.allocations.push(RemoteAllocation { address, size });
        }
    }

    fn free_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for allocation in mem::take(&mut self.allocations) {
            if let Err(err) = self.channel.free(allocation.address) {
                log::warn!(
                    "failed to free {:#x} bytes at {}: {}",
                    allocation.size,
                    allocation.address,
                    err
                );
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<T: Transport> Drop for Staging<'_, T> {
    fn drop(&mut self) {
        if !self.allocations.is_empty() {
            let _ = self.free_all();
        }
    }
}
