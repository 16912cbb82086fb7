//! An in-memory console for unit tests.
//!
//! [`MockConsole`] answers request frames the way the stub does. Behind the
//! syscalls it keeps a heap, device handles, a file system driver over an
//! in-memory tree, a title driver that records its calls and an echo device
//! that copies inputs to outputs.

use crate::{
    alloc::RemoteAddress,
    command::{svc, Command, CommandId, Response},
    driver::{DriverHandle, IoVec},
    error::{Error, Result, StatusCode},
    transport::Transport,
    wire, HEAP_ID,
};
use bytes::{Buf, BufMut, Bytes};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    rc::Rc,
};

/// Command status of an injected failure.
pub(crate) const INJECTED: u32 = 0xDEAD_0001;
/// Command status of a memory access outside the heap.
pub(crate) const BAD_ADDRESS: u32 = 0xDEAD_0002;
/// Command status of a frame the console could not decode.
pub(crate) const MALFORMED: u32 = 0xDEAD_0003;

pub(crate) const NOT_FOUND: i32 = -0x3_0006;
pub(crate) const EXISTS: i32 = -0x3_0007;
pub(crate) const NOT_EMPTY: i32 = -0x3_0008;
pub(crate) const BAD_HANDLE: i32 = -0x3_000A;
pub(crate) const END_OF_DIR: i32 = -0x3_0004;
pub(crate) const UNSUPPORTED: i32 = -0x3_0001;
pub(crate) const BAD_FREE: i32 = -0x1_0001;
pub(crate) const MCP_FAILURE: i32 = -0x4_0001;

/// Allocations larger than this fail with a null address.
const HEAP_LIMIT: u32 = 0x0100_0000;
const HEAP_BASE: u32 = 0x1000_0000;
const PLACE_BASE: u32 = 0x1800_0000;
const FIRST_DEVICE: u32 = 3;

/// A request the console saw.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Logged {
    pub command: CommandId,
    /// Syscall id, for `Svc` frames.
    pub svc: Option<u32>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Device {
    Fsa,
    Mcp,
    Echo,
}

type Status<T> = std::result::Result<T, u32>;

pub(crate) struct MockConsole {
    heap: BTreeMap<u32, Vec<u8>>,
    placed: BTreeSet<u32>,
    next_address: u32,
    next_placed: u32,
    /// Successful allocations.
    pub allocations: usize,
    /// Free syscalls received, including ones that failed.
    pub free_calls: usize,

    requests: usize,
    log: Vec<Logged>,
    events: Vec<String>,
    fail_at: Option<usize>,
    terminal: Option<Vec<u8>>,

    devices: BTreeMap<u32, Device>,
    next_device: u32,
    last_ioctlv: Option<(u32, u32, Vec<IoVec>)>,
    last_plain_alloc: Option<u32>,

    fs: MockFs,
    fsa_requests: Vec<(u32, Vec<u8>)>,
    mcp_calls: Vec<(u32, Vec<Vec<u8>>)>,
    mcp_failure: Option<u32>,
}

impl MockConsole {
    pub(crate) fn new() -> Self {
        MockConsole {
            heap: BTreeMap::new(),
            placed: BTreeSet::new(),
            next_address: HEAP_BASE,
            next_placed: PLACE_BASE,
            allocations: 0,
            free_calls: 0,
            requests: 0,
            log: Vec::new(),
            events: Vec::new(),
            fail_at: None,
            terminal: None,
            devices: BTreeMap::new(),
            next_device: FIRST_DEVICE,
            last_ioctlv: None,
            last_plain_alloc: None,
            fs: MockFs::default(),
            fsa_requests: Vec::new(),
            mcp_calls: Vec::new(),
            mcp_failure: None,
        }
    }

    /// A console shared between a transport and the test inspecting it.
    pub(crate) fn shared() -> (MockTransport, Rc<RefCell<MockConsole>>) {
        let console = Rc::new(RefCell::new(MockConsole::new()));
        let transport = MockTransport {
            console: Rc::clone(&console),
            closed: false,
        };
        (transport, console)
    }

    /// Makes the request with the given zero-based index fail with a
    /// command status.
    pub(crate) fn fail_request(&mut self, index: usize) {
        self.fail_at = Some(index);
    }

    /// Makes every title driver call with `command` fail.
    pub(crate) fn fail_mcp(&mut self, command: u32) {
        self.mcp_failure = Some(command);
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests
    }

    pub(crate) fn log(&self) -> &[Logged] {
        &self.log
    }

    /// Device opens and closes, mounts and unmounts and power calls, in
    /// order.
    pub(crate) fn events(&self) -> &[String] {
        &self.events
    }

    pub(crate) fn terminal(&self) -> Option<&[u8]> {
        self.terminal.as_deref()
    }

    /// Copies `data` into memory the client never allocated, like a buffer
    /// some other code owns.
    pub(crate) fn place(&mut self, data: &[u8]) -> RemoteAddress {
        let address = self.next_placed;
        self.next_placed = align_up(address + data.len() as u32 + 0x40, 0x40);
        self.place_at(RemoteAddress::from_raw(address), data);
        RemoteAddress::from_raw(address)
    }

    pub(crate) fn place_at(&mut self, address: RemoteAddress, data: &[u8]) {
        self.heap.insert(address.to_raw(), data.to_vec());
        self.placed.insert(address.to_raw());
    }

    /// Whether placed memory at `address` is still there.
    pub(crate) fn is_placed(&self, address: RemoteAddress) -> bool {
        self.placed.contains(&address.to_raw()) && self.heap.contains_key(&address.to_raw())
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.heap
            .keys()
            .filter(|address| !self.placed.contains(address))
            .count()
    }

    /// Opens a device without going through the protocol.
    pub(crate) fn open_device(&mut self, path: &str) -> DriverHandle {
        let raw = self
            .open_path(path)
            .unwrap_or_else(|| panic!("unknown device {}", path));
        DriverHandle::from_raw(raw)
    }

    pub(crate) fn open_devices(&self) -> usize {
        self.devices.len()
    }

    pub(crate) fn last_ioctlv(&self) -> Option<(u32, u32, Vec<IoVec>)> {
        self.last_ioctlv.clone()
    }

    /// Size of the last allocation made without an alignment.
    pub(crate) fn last_plain_alloc(&self) -> Option<u32> {
        self.last_plain_alloc
    }

    /// Makes every file write accept at most `len` bytes.
    pub(crate) fn limit_writes(&mut self, len: usize) {
        self.fs.write_limit = Some(len);
    }

    /// Command and request block of every file system driver call.
    pub(crate) fn fsa_requests(&self) -> &[(u32, Vec<u8>)] {
        &self.fsa_requests
    }

    /// Command and inputs of every title driver call.
    pub(crate) fn mcp_calls(&self) -> &[(u32, Vec<Vec<u8>>)] {
        &self.mcp_calls
    }

    /// Creates a directory and any missing parents.
    pub(crate) fn add_dir(&mut self, path: &str) {
        self.fs.add_parents(path);
        self.fs.nodes.insert(path.to_string(), Node::Dir);
    }

    /// Creates a file and any missing parent directories.
    pub(crate) fn add_file(&mut self, path: &str, data: &[u8]) {
        self.fs.add_parents(path);
        self.fs
            .nodes
            .insert(path.to_string(), Node::File(data.to_vec()));
    }

    pub(crate) fn file(&self, path: &str) -> Option<&[u8]> {
        match self.fs.nodes.get(path) {
            Some(Node::File(data)) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn is_mounted(&self, volume: &str) -> bool {
        self.fs.mounted.contains(volume)
    }

    pub(crate) fn open_fs_handles(&self) -> usize {
        self.fs.files.len() + self.fs.dirs.len()
    }

    /// Answers one request frame with one response frame.
    pub(crate) fn handle(&mut self, frame: &[u8]) -> Vec<u8> {
        let index = self.requests;
        self.requests += 1;

        let command = match Command::decode(frame) {
            Ok(command) => command,
            Err(_) => return status_only(MALFORMED),
        };
        let svc_id = match &command {
            Command::Svc { id, .. } => Some(*id),
            _ => None,
        };
        self.log.push(Logged {
            command: command.id(),
            svc: svc_id,
        });
        if svc_id == Some(svc::FREE) {
            self.free_calls += 1;
        }
        if self.fail_at == Some(index) {
            return status_only(INJECTED);
        }

        let result = match command {
            Command::Write { address, data } => self.poke(address.to_raw(), data).map(|()| Vec::new()),
            Command::Read { address, len } => self.peek(address.to_raw(), len as usize),
            Command::Svc { id, args } => self
                .svc(id, &args)
                .map(|result| result.to_be_bytes().to_vec()),
            Command::Kill => Ok(Vec::new()),
            Command::Memcpy { dst, src, len } => match self.peek(src.to_raw(), len as usize) {
                Ok(data) => self.poke(dst.to_raw(), &data).map(|()| Vec::new()),
                Err(status) => Err(status),
            },
            Command::RepeatWrite { dst, value, count } => {
                let data = value.to_be_bytes().repeat(count as usize);
                self.poke(dst.to_raw(), &data).map(|()| Vec::new())
            }
        };

        match result {
            Ok(payload) => Response::new(StatusCode::SUCCESS, Bytes::from(payload))
                .encode()
                .to_vec(),
            Err(status) => status_only(status),
        }
    }

    fn terminal_frame(&mut self, frame: &[u8]) {
        self.requests += 1;
        if let Ok(Command::Svc { id, args }) = Command::decode(frame) {
            self.log.push(Logged {
                command: CommandId::Svc,
                svc: Some(id),
            });
            if id == svc::POWER {
                let mode = args.first().copied().unwrap_or_default();
                self.events.push(format!("power {}", mode));
            }
        }
        self.terminal = Some(frame.to_vec());
    }

    fn locate(&self, address: u32, len: usize) -> Status<(u32, usize)> {
        let (&base, block) = self
            .heap
            .range(..=address)
            .next_back()
            .ok_or(BAD_ADDRESS)?;
        let start = (address - base) as usize;
        if start + len > block.len() {
            return Err(BAD_ADDRESS);
        }
        Ok((base, start))
    }

    fn peek(&self, address: u32, len: usize) -> Status<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let (base, start) = self.locate(address, len)?;
        Ok(self.heap[&base][start..start + len].to_vec())
    }

    fn poke(&mut self, address: u32, data: &[u8]) -> Status<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (base, start) = self.locate(address, data.len())?;
        let block = self.heap.get_mut(&base).ok_or(BAD_ADDRESS)?;
        block[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn peek_c_string(&self, address: u32) -> Status<String> {
        let (base, start) = self.locate(address, 1)?;
        Ok(wire::read_c_string(&self.heap[&base][start..]))
    }

    fn svc(&mut self, id: u32, args: &[u32]) -> Status<u32> {
        let arg = |index: usize| args.get(index).copied().ok_or(MALFORMED);
        match id {
            svc::ALLOC => {
                let size = arg(1)?;
                self.last_plain_alloc = Some(size);
                Ok(self.alloc(arg(0)?, size, 0x20))
            }
            svc::ALLOC_ALIGNED => Ok(self.alloc(arg(0)?, arg(1)?, arg(2)?)),
            svc::FREE => Ok(self.free(arg(0)?, arg(1)?) as u32),
            svc::OPEN => {
                let path = self.peek_c_string(arg(0)?)?;
                Ok(self.open_path(&path).unwrap_or(NOT_FOUND as u32))
            }
            svc::CLOSE => Ok(self.close(arg(0)?) as u32),
            svc::IOCTL => self.ioctl(args),
            svc::IOCTLV => self.ioctlv(args),
            _ => Ok(UNSUPPORTED as u32),
        }
    }

    fn alloc(&mut self, heap: u32, size: u32, alignment: u32) -> u32 {
        if heap != HEAP_ID || size > HEAP_LIMIT || !alignment.is_power_of_two() {
            return 0;
        }
        let address = align_up(self.next_address, alignment);
        self.next_address = address + size + 0x20;
        self.heap.insert(address, vec![0; size as usize]);
        self.allocations += 1;
        address
    }

    fn free(&mut self, heap: u32, address: u32) -> i32 {
        if heap != HEAP_ID {
            return BAD_FREE;
        }
        match self.heap.remove(&address) {
            Some(_) => 0,
            None => BAD_FREE,
        }
    }

    fn open_path(&mut self, path: &str) -> Option<u32> {
        let device = match path {
            "/dev/fsa" => Device::Fsa,
            "/dev/mcp" => Device::Mcp,
            "/dev/echo" => Device::Echo,
            _ => return None,
        };
        let handle = self.next_device;
        self.next_device += 1;
        self.devices.insert(handle, device);
        self.events.push(format!("open {}", path));
        Some(handle)
    }

    fn close(&mut self, handle: u32) -> i32 {
        match self.devices.remove(&handle) {
            Some(device) => {
                self.events.push(format!("close {:?}", device));
                0
            }
            None => BAD_HANDLE,
        }
    }

    fn ioctl(&mut self, args: &[u32]) -> Status<u32> {
        if args.len() != 6 {
            return Err(MALFORMED);
        }
        let (handle, command) = (args[0], args[1]);
        let input = self.peek(args[2], args[3] as usize)?;
        let (out_address, out_len) = (args[4], args[5]);

        let (status, outputs) = self.dispatch(handle, command, vec![input], &[out_len]);
        if out_len > 0 {
            let output = outputs.into_iter().next().unwrap_or_default();
            self.poke(out_address, &fit(output, out_len))?;
        }
        Ok(status as u32)
    }

    fn ioctlv(&mut self, args: &[u32]) -> Status<u32> {
        if args.len() != 5 {
            return Err(MALFORMED);
        }
        let (handle, command, in_count, out_count) = (args[0], args[1], args[2], args[3]);
        let total = (in_count + out_count) as usize;
        let mut table = &self.peek(args[4], total * IoVec::SIZE)?[..];

        let mut vectors = Vec::with_capacity(total);
        for _ in 0..total {
            let address = RemoteAddress::from_raw(table.get_u32());
            let len = table.get_u32();
            table.advance(4);
            vectors.push(IoVec::new(address, len));
        }
        self.last_ioctlv = Some((in_count, out_count, vectors.clone()));

        let (ins, outs) = vectors.split_at(in_count as usize);
        let mut inputs = Vec::with_capacity(ins.len());
        for vector in ins {
            inputs.push(self.peek(vector.address.to_raw(), vector.len as usize)?);
        }
        let sizes = outs.iter().map(|vector| vector.len).collect::<Vec<_>>();

        let (status, outputs) = self.dispatch(handle, command, inputs, &sizes);
        for (vector, output) in outs.iter().zip(outputs) {
            if vector.len > 0 {
                self.poke(vector.address.to_raw(), &fit(output, vector.len))?;
            }
        }
        Ok(status as u32)
    }

    /// Runs a driver call. Returns the status and one block per output.
    fn dispatch(
        &mut self,
        handle: u32,
        command: u32,
        inputs: Vec<Vec<u8>>,
        sizes: &[u32],
    ) -> (i32, Vec<Vec<u8>>) {
        let device = self.devices.get(&handle).copied();
        let (status, mut outputs) = match device {
            None => (BAD_HANDLE, Vec::new()),
            Some(Device::Echo) => {
                let echoed = inputs.concat();
                (0, sizes.iter().map(|_| echoed.clone()).collect())
            }
            Some(Device::Fsa) => {
                let block = inputs.first().cloned().unwrap_or_default();
                let reply = self.fs.call(command, &inputs);
                if block.len() == 0x520 {
                    match command {
                        0x01 => {
                            let volume = wire::read_c_string(&block[0x284..]);
                            self.events.push(format!("mount {}", volume));
                        }
                        0x02 => {
                            let volume = wire::read_c_string(&block[0x4..]);
                            self.events.push(format!("unmount {}", volume));
                        }
                        _ => {}
                    }
                }
                self.fsa_requests.push((command, block));
                reply
            }
            Some(Device::Mcp) => {
                self.mcp_calls.push((command, inputs));
                if self.mcp_failure == Some(command) {
                    (MCP_FAILURE, Vec::new())
                } else {
                    mcp_reply(command)
                }
            }
        };
        outputs.resize(sizes.len(), Vec::new());
        (status, outputs)
    }
}

/// The console side of [`MockConsole::shared`].
pub(crate) struct MockTransport {
    console: Rc<RefCell<MockConsole>>,
    closed: bool,
}

impl MockTransport {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Transport for MockTransport {
    fn request(&mut self, frame: &[u8], reply_len: usize) -> Result<Response> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        let raw = self.console.borrow_mut().handle(frame);
        let response = Response::decode(Bytes::from(raw))?;
        if response.payload.len() > reply_len {
            return Err(Error::ResponseOverflow {
                expected: reply_len,
                received: response.payload.len(),
            });
        }
        Ok(response)
    }

    fn send_terminal(&mut self, frame: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        self.console.borrow_mut().terminal_frame(frame);
        self.closed = true;
        Ok(())
    }
}

enum Node {
    Dir,
    File(Vec<u8>),
}

struct OpenFile {
    path: String,
    position: usize,
}

/// The file system behind `/dev/fsa`.
#[derive(Default)]
struct MockFs {
    nodes: BTreeMap<String, Node>,
    mounted: BTreeSet<String>,
    files: HashMap<u32, OpenFile>,
    dirs: HashMap<u32, VecDeque<(String, bool, u32)>>,
    handles: u32,
    write_limit: Option<usize>,
}

impl MockFs {
    fn add_parents(&mut self, path: &str) {
        let mut parent = parent(path);
        while let Some(dir) = parent {
            self.nodes.entry(dir.to_string()).or_insert(Node::Dir);
            parent = self::parent(dir);
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(path), Some(Node::Dir))
    }

    fn parent_exists(&self, path: &str) -> bool {
        parent(path).map_or(true, |dir| self.is_dir(dir))
    }

    fn children(&self, path: &str) -> Vec<(String, bool, u32)> {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, node)| {
                let name = key[prefix.len()..].to_string();
                match node {
                    Node::Dir => (name, false, 0),
                    Node::File(data) => (name, true, data.len() as u32),
                }
            })
            .collect()
    }

    fn next_handle(&mut self) -> u32 {
        self.handles += 1;
        self.handles
    }

    fn call(&mut self, command: u32, inputs: &[Vec<u8>]) -> (i32, Vec<Vec<u8>>) {
        let block = match inputs.first() {
            Some(block) if block.len() == 0x520 => block,
            _ => return (UNSUPPORTED, Vec::new()),
        };
        let path = wire::read_c_string(&block[0x4..]);
        let word = |offset: usize| wire::read_u32(block, offset).unwrap_or_default();

        match command {
            // Mount
            0x01 => {
                let volume = wire::read_c_string(&block[0x284..]);
                self.nodes.entry(volume.clone()).or_insert(Node::Dir);
                self.mounted.insert(volume);
                done()
            }
            // Unmount
            0x02 => {
                if self.mounted.remove(&path) {
                    done()
                } else {
                    failed(NOT_FOUND)
                }
            }
            // MakeDir
            0x07 => {
                if self.nodes.contains_key(&path) {
                    failed(EXISTS)
                } else if !self.parent_exists(&path) {
                    failed(NOT_FOUND)
                } else {
                    self.nodes.insert(path, Node::Dir);
                    done()
                }
            }
            // Remove
            0x08 => match self.nodes.get(&path) {
                None => failed(NOT_FOUND),
                Some(Node::Dir) if !self.children(&path).is_empty() => failed(NOT_EMPTY),
                Some(_) => {
                    self.nodes.remove(&path);
                    done()
                }
            },
            // Rename
            0x09 => {
                let target = wire::read_c_string(&block[0x284..]);
                if !self.nodes.contains_key(&path) {
                    return failed(NOT_FOUND);
                }
                if self.nodes.contains_key(&target) {
                    return failed(EXISTS);
                }
                let prefix = format!("{}/", path);
                let moved = self
                    .nodes
                    .keys()
                    .filter(|key| **key == path || key.starts_with(&prefix))
                    .cloned()
                    .collect::<Vec<_>>();
                for key in moved {
                    if let Some(node) = self.nodes.remove(&key) {
                        let renamed = format!("{}{}", target, &key[path.len()..]);
                        self.nodes.insert(renamed, node);
                    }
                }
                done()
            }
            // OpenDir
            0x0A => {
                if !self.is_dir(&path) {
                    return failed(NOT_FOUND);
                }
                let entries = self.children(&path).into_iter().collect();
                let handle = self.next_handle();
                self.dirs.insert(handle, entries);
                opened(handle)
            }
            // ReadDir
            0x0B => match self.dirs.get_mut(&word(0x4)) {
                None => failed(BAD_HANDLE),
                Some(entries) => match entries.pop_front() {
                    None => failed(END_OF_DIR),
                    Some((name, is_file, size)) => {
                        let mut output = vec![0; 0x293];
                        if !is_file {
                            output[0x4] = 0x80;
                        }
                        output[0x18..0x1C].copy_from_slice(&size.to_be_bytes());
                        output[0x68..0x68 + name.len()].copy_from_slice(name.as_bytes());
                        (0, vec![output])
                    }
                },
            },
            // CloseDir
            0x0D => match self.dirs.remove(&word(0x4)) {
                Some(_) => done(),
                None => failed(BAD_HANDLE),
            },
            // OpenFile
            0x0E => {
                let mode = wire::read_c_string(&block[0x284..]);
                let position = match (mode.chars().next(), self.nodes.get(&path)) {
                    (Some('r'), Some(Node::File(_))) => 0,
                    (Some('r'), _) => return failed(NOT_FOUND),
                    (Some('w'), Some(Node::Dir)) | (Some('a'), Some(Node::Dir)) => {
                        return failed(EXISTS)
                    }
                    (Some('w'), _) => {
                        if !self.parent_exists(&path) {
                            return failed(NOT_FOUND);
                        }
                        self.nodes.insert(path.clone(), Node::File(Vec::new()));
                        0
                    }
                    (Some('a'), Some(Node::File(data))) => data.len(),
                    (Some('a'), None) => {
                        if !self.parent_exists(&path) {
                            return failed(NOT_FOUND);
                        }
                        self.nodes.insert(path.clone(), Node::File(Vec::new()));
                        0
                    }
                    _ => return failed(UNSUPPORTED),
                };
                let handle = self.next_handle();
                self.files.insert(handle, OpenFile { path, position });
                opened(handle)
            }
            // ReadFile
            0x0F => {
                let (size, count) = (word(0x08) as usize, word(0x0C) as usize);
                let file = match self.files.get_mut(&word(0x14)) {
                    Some(file) => file,
                    None => return failed(BAD_HANDLE),
                };
                let data = match self.nodes.get(&file.path) {
                    Some(Node::File(data)) => data,
                    _ => return failed(NOT_FOUND),
                };
                if size == 0 {
                    return (0, Vec::new());
                }
                let available = data.len().saturating_sub(file.position);
                let elements = std::cmp::min(count, available / size);
                let start = file.position;
                file.position += elements * size;
                let read = data[start..start + elements * size].to_vec();
                (elements as i32, vec![read])
            }
            // WriteFile
            0x10 => {
                let (size, count) = (word(0x08) as usize, word(0x0C) as usize);
                let input = inputs.get(1).cloned().unwrap_or_default();
                let file = match self.files.get_mut(&word(0x14)) {
                    Some(file) => file,
                    None => return failed(BAD_HANDLE),
                };
                let data = match self.nodes.get_mut(&file.path) {
                    Some(Node::File(data)) => data,
                    _ => return failed(NOT_FOUND),
                };
                if size == 0 {
                    return (0, Vec::new());
                }
                let accepted = self.write_limit.unwrap_or(usize::MAX);
                let len = (size * count).min(input.len()).min(accepted) / size * size;
                let end = file.position + len;
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[file.position..end].copy_from_slice(&input[..len]);
                file.position = end;
                ((len / size) as i32, Vec::new())
            }
            // GetStatFile
            0x14 => {
                let file = match self.files.get(&word(0x4)) {
                    Some(file) => file,
                    None => return failed(BAD_HANDLE),
                };
                match self.nodes.get(&file.path) {
                    Some(Node::File(data)) => (0, vec![stat_words(0, data.len() as u32)]),
                    _ => failed(NOT_FOUND),
                }
            }
            // CloseFile
            0x15 => match self.files.remove(&word(0x4)) {
                Some(_) => done(),
                None => failed(BAD_HANDLE),
            },
            // GetInfoByQuery
            0x18 => match self.nodes.get(&path) {
                Some(Node::File(data)) => (0, vec![stat_words(0, data.len() as u32)]),
                Some(Node::Dir) => (0, vec![stat_words(0x8000_0000, 0)]),
                None => failed(NOT_FOUND),
            },
            // FlushVolume
            0x1B => {
                if self.mounted.contains(&path) {
                    done()
                } else {
                    failed(NOT_FOUND)
                }
            }
            // ChangeMode
            0x20 => {
                if self.nodes.contains_key(&path) {
                    done()
                } else {
                    failed(NOT_FOUND)
                }
            }
            // Format
            0x69 => done(),
            // RawOpen
            0x6A => {
                let handle = self.next_handle();
                opened(handle)
            }
            _ => failed(UNSUPPORTED),
        }
    }
}

fn mcp_reply(command: u32) -> (i32, Vec<Vec<u8>>) {
    match command {
        // InstallGetInfo
        0x80 => {
            let mut info = Vec::with_capacity(0x16);
            for word in &[0, 0x0005_000E, 0x1010_2000, 0x10, 0x4000u32] {
                info.put_u32(*word);
            }
            info.put_u16(0xABCD);
            (0, vec![info])
        }
        // InstallGetProgress
        0x82 => {
            let mut progress = Vec::with_capacity(0x24);
            for word in &[1, 0x0005_000E, 0x1010_2000, 0, 0x4000, 0, 0x1000, 12, 3u32] {
                progress.put_u32(*word);
            }
            (0, vec![progress])
        }
        0x81 | 0x83 | 0x85 | 0x8D | 0xF1 => (0, Vec::new()),
        _ => (UNSUPPORTED, Vec::new()),
    }
}

fn stat_words(flags: u32, size: u32) -> Vec<u8> {
    let mut words = [0u32; 25];
    words[1] = flags;
    words[2] = 0x666;
    words[3] = 0x1000_0000;
    words[4] = 0x400;
    words[5] = size;
    let mut bytes = Vec::with_capacity(0x64);
    for word in &words {
        bytes.put_u32(*word);
    }
    bytes
}

fn done() -> (i32, Vec<Vec<u8>>) {
    (0, Vec::new())
}

fn failed(status: i32) -> (i32, Vec<Vec<u8>>) {
    (status, Vec::new())
}

fn opened(handle: u32) -> (i32, Vec<Vec<u8>>) {
    let mut output = vec![0; 0x293];
    output[4..8].copy_from_slice(&handle.to_be_bytes());
    (0, vec![output])
}

fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(index) => Some(&path[..index]),
    }
}

fn fit(mut data: Vec<u8>, len: u32) -> Vec<u8> {
    data.resize(len as usize, 0);
    data
}

fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

fn status_only(status: u32) -> Vec<u8> {
    status.to_be_bytes().to_vec()
}
