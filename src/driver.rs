//! Device handles and the ioctl/ioctlv marshalers.
//!
//! Driver calls take their arguments from console memory, so every local
//! buffer is staged into the shared heap first, outputs are allocated there
//! and read back afterwards. All of it is freed before the call returns,
//! whatever the driver answered.

use crate::{
    alloc::{RemoteAddress, Staging},
    command::{svc, Channel},
    error::{Error, Result, StatusCode},
    transport::Transport,
    wire, IOVEC_ALIGNMENT,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// A handle returned by opening a device node such as `/dev/fsa`.
///
/// Closing consumes the handle, so it cannot be closed twice.
#[derive(Eq, PartialEq, Hash)]
pub struct DriverHandle(u32);

impl DriverHandle {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        DriverHandle(raw)
    }

    #[inline]
    pub const fn to_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriverHandle({:#x})", self.0)
    }
}

/// One entry of the descriptor array handed to an ioctlv call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IoVec {
    pub address: RemoteAddress,
    pub len: u32,
}

impl IoVec {
    /// Encoded size: address, length and a reserved word.
    pub const SIZE: usize = 12;

    pub fn new(address: RemoteAddress, len: u32) -> Self {
        IoVec { address, len }
    }
}

/// Encodes the descriptor array in the order given.
pub fn build_iovec(entries: &[IoVec]) -> Bytes {
    let mut table = BytesMut::with_capacity(entries.len() * IoVec::SIZE);
    for entry in entries {
        table.put_u32(entry.address.to_raw());
        table.put_u32(entry.len);
        table.put_u32(0);
    }
    table.freeze()
}

/// The buffers of one ioctlv call.
///
/// Local inputs are staged and local outputs allocated by the call.
/// Remote buffers are buffers the caller already owns on the console; they
/// are referenced as-is and never freed by the marshaler.
#[derive(Clone, Debug, Default)]
pub struct Ioctlv<'a> {
    inputs: Vec<&'a [u8]>,
    outputs: Vec<u32>,
    remote_inputs: Vec<IoVec>,
    remote_outputs: Vec<IoVec>,
}

impl<'a> Ioctlv<'a> {
    pub fn new() -> Self {
        Ioctlv::default()
    }

    pub fn input(mut self, data: &'a [u8]) -> Self {
        self.inputs.push(data);
        self
    }

    /// Requests an output buffer of `size` bytes. Zero requests no buffer.
    pub fn output(mut self, size: u32) -> Self {
        self.outputs.push(size);
        self
    }

    pub fn remote_input(mut self, vector: IoVec) -> Self {
        self.remote_inputs.push(vector);
        self
    }

    pub fn remote_output(mut self, vector: IoVec) -> Self {
        self.remote_outputs.push(vector);
        self
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len() + self.remote_inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len() + self.remote_outputs.len()
    }
}

/// Result of an ioctl call. `output` is empty unless the driver succeeded
/// and an output buffer was requested.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IoctlReply {
    pub status: StatusCode,
    pub output: Bytes,
}

/// Result of an ioctlv call. `outputs` holds one block per locally
/// allocated output, in request order, and is empty if the driver failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IoctlvReply {
    pub status: StatusCode,
    pub outputs: Vec<Bytes>,
}

impl<T: Transport> Channel<T> {
    /// Opens the device node at `path`.
    pub fn open(&mut self, path: &str, mode: u32) -> Result<DriverHandle> {
        let path_bytes = wire::c_string(path)?;

        let mut staging = Staging::new(self);
        let address = staging.stage(&path_bytes, None)?;
        let result = staging.channel().svc(svc::OPEN, &[address.to_raw(), mode])?;
        let released = staging.release();

        let status = StatusCode::from_raw(result);
        if status.is_error() {
            released?;
            return Err(Error::Status(status));
        }
        let handle = DriverHandle(result);
        if let Err(err) = released {
            let _ = self.close(handle);
            return Err(err);
        }

        log::debug!("opened {} as {:?}", path, handle);
        Ok(handle)
    }

    pub fn close(&mut self, handle: DriverHandle) -> Result<()> {
        let result = self.svc(svc::CLOSE, &[handle.0])?;
        log::debug!("closed {:?}", handle);
        StatusCode::from_raw(result).check()
    }

    /// Single-buffer driver call.
    pub fn ioctl(
        &mut self,
        handle: &DriverHandle,
        command: u32,
        input: &[u8],
        output_len: u32,
    ) -> Result<IoctlReply> {
        let mut staging = Staging::new(self);
        let in_address = staging.stage(input, None)?;
        let out_address = staging.allocate(output_len)?;

        let result = staging.channel().svc(
            svc::IOCTL,
            &[
                handle.0,
                command,
                in_address.to_raw(),
                input.len() as u32,
                out_address.to_raw(),
                output_len,
            ],
        )?;
        let status = StatusCode::from_raw(result);

        let output = if out_address.is_null() || status.is_error() {
            Bytes::new()
        } else {
            staging
                .channel()
                .read_bytes(out_address, output_len as usize)?
        };
        staging.release()?;

        log::debug!("ioctl {:#x} on {:?}: {}", command, handle, status);
        Ok(IoctlReply { status, output })
    }

    /// Scatter/gather driver call.
    ///
    /// The descriptor array lists local inputs, remote inputs, remote
    /// outputs and local outputs, in that order.
    pub fn ioctlv(
        &mut self,
        handle: &DriverHandle,
        command: u32,
        request: &Ioctlv<'_>,
    ) -> Result<IoctlvReply> {
        let mut staging = Staging::new(self);

        let mut vectors = Vec::with_capacity(request.input_count() + request.output_count());
        for input in &request.inputs {
            let address = staging.stage(input, Some(IOVEC_ALIGNMENT))?;
            vectors.push(IoVec::new(address, input.len() as u32));
        }
        let mut outputs = Vec::with_capacity(request.outputs.len());
        for &size in &request.outputs {
            let address = staging.allocate_aligned(size, IOVEC_ALIGNMENT)?;
            outputs.push(IoVec::new(address, size));
        }
        vectors.extend_from_slice(&request.remote_inputs);
        vectors.extend_from_slice(&request.remote_outputs);
        vectors.extend_from_slice(&outputs);

        let table = staging.stage(&build_iovec(&vectors), None)?;
        let result = staging.channel().svc(
            svc::IOCTLV,
            &[
                handle.0,
                command,
                request.input_count() as u32,
                request.output_count() as u32,
                table.to_raw(),
            ],
        )?;
        let status = StatusCode::from_raw(result);

        let mut data = Vec::new();
        if !status.is_error() {
            data.reserve(outputs.len());
            for output in &outputs {
                if output.address.is_null() {
                    data.push(Bytes::new());
                } else {
                    let bytes = staging
                        .channel()
                        .read_bytes(output.address, output.len as usize)?;
                    data.push(bytes);
                }
            }
        }
        staging.release()?;

        log::debug!("ioctlv {:#x} on {:?}: {}", command, handle, status);
        Ok(IoctlvReply {
            status,
            outputs: data,
        })
    }
}
