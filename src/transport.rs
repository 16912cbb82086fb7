//! Byte transports carrying request and response frames.

use crate::{
    command::Response,
    error::{Error, Result},
    MAX_FRAME_LEN, STATUS_LEN,
};
use bytes::Bytes;
use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

/// Carries one request frame and returns exactly one response frame.
pub trait Transport {
    /// Sends `frame` and waits for its response.
    ///
    /// `reply_len` is the payload length a successful response carries.
    /// Responses are bounded by [`MAX_FRAME_LEN`].
    fn request(&mut self, frame: &[u8], reply_len: usize) -> Result<Response>;

    /// Sends `frame` without waiting for a response and closes the
    /// transport. Later calls fail with [`Error::ConnectionClosed`].
    fn send_terminal(&mut self, frame: &[u8]) -> Result<()>;
}

/// A [`Transport`] over a TCP connection to the debug stub.
pub struct TcpTransport {
    /// `None` once the connection was closed locally or broke.
    stream: Option<TcpStream>,
    /// Set while a request is on the wire. Stays set after a timed out
    /// request, whose response may still arrive.
    in_flight: bool,
    /// Length of the last complete response.
    last_response: usize,
}

impl TcpTransport {
    /// Connects to the stub. No handshake follows the TCP connect.
    pub fn connect<A: ToSocketAddrs>(address: A, read_timeout: Option<Duration>) -> Result<Self> {
        let describe = || {
            address
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .map_or_else(|| "console".to_string(), |addr| addr.to_string())
        };

        let stream = TcpStream::connect(&address).map_err(|source| Error::Connect {
            address: describe(),
            source,
        })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(read_timeout)?;

        Ok(TcpTransport::new(stream))
    }

    pub fn new(stream: TcpStream) -> Self {
        TcpTransport {
            stream: Some(stream),
            in_flight: false,
            last_response: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Closes the socket. Idempotent.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn exchange(&mut self, frame: &[u8], reply_len: usize) -> Result<Response> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionClosed)?;
        let stray = pending(stream)?;
        if stray > 0 {
            return Err(Error::ResponseOverflow {
                expected: self.last_response,
                received: self.last_response + stray,
            });
        }
        stream.write_all(frame)?;

        let complete = STATUS_LEN + reply_len;
        // One spare byte so a response longer than announced is noticed.
        let mut buffer = vec![0; complete + 1];
        let mut received = 0;

        loop {
            let n = stream.read(&mut buffer[received..])?;
            if n == 0 {
                return Err(Error::ShortResponse {
                    expected: complete,
                    received,
                });
            }
            received += n;

            if received > complete {
                return Err(Error::ResponseOverflow {
                    expected: complete,
                    received,
                });
            }
            if received >= STATUS_LEN {
                let failed = buffer[..STATUS_LEN].iter().any(|&b| b != 0);
                if failed || received == complete {
                    break;
                }
            }
        }

        let stray = pending(stream)?;
        if stray > 0 {
            return Err(Error::ResponseOverflow {
                expected: complete,
                received: received + stray,
            });
        }
        self.last_response = received;

        buffer.truncate(received);
        let mut response = Response::decode(Bytes::from(buffer))?;
        if !response.status.is_success() {
            response.payload = Bytes::new();
        }
        Ok(response)
    }
}

impl Transport for TcpTransport {
    fn request(&mut self, frame: &[u8], reply_len: usize) -> Result<Response> {
        if self.in_flight {
            return Err(Error::RequestInFlight);
        }
        if self.stream.is_none() {
            return Err(Error::ConnectionClosed);
        }
        if STATUS_LEN + reply_len > MAX_FRAME_LEN {
            return Err(Error::ReadTooLarge {
                requested: reply_len,
                limit: MAX_FRAME_LEN - STATUS_LEN,
            });
        }

        self.in_flight = true;
        match self.exchange(frame, reply_len) {
            Ok(response) => {
                self.in_flight = false;
                Ok(response)
            }
            Err(Error::Io(err)) if is_timeout(&err) => {
                log::warn!("request timed out, the stream is out of sync: {}", err);
                Err(Error::Io(err))
            }
            Err(err) => {
                log::debug!("dropping connection after failed request: {}", err);
                self.in_flight = false;
                self.close();
                Err(err)
            }
        }
    }

    fn send_terminal(&mut self, frame: &[u8]) -> Result<()> {
        if self.in_flight {
            return Err(Error::RequestInFlight);
        }
        let mut stream = self.stream.take().ok_or(Error::ConnectionClosed)?;
        let result = stream.write_all(frame);
        let _ = stream.shutdown(Shutdown::Both);
        result.map_err(Error::from)
    }
}

/// Bytes already waiting on `stream`, without consuming them.
fn pending(stream: &TcpStream) -> io::Result<usize> {
    stream.set_nonblocking(true)?;
    let mut spare = [0u8; 64];
    let result = match stream.peek(&mut spare) {
        Ok(n) => Ok(n),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(err) => Err(err),
    };
    stream.set_nonblocking(false)?;
    result
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
