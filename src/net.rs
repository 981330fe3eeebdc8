//! Point-to-point UDP link between two fixed endpoints
//!
//! Two message shapes travel over the link:
//!
//! - **doubles**: the datagram is a run of little-endian `f64`s with no
//!   header; the element count is the datagram length divided by 8.
//! - **text**: a big-endian `u32` byte length followed by the UTF-8 bytes,
//!   no terminator.
//!
//! Unlike the shared memory maps there is no lock and no history: each
//! receive returns the next datagram the OS has queued.

use crate::error::NetError;
use crate::frame::{decode_scalars, encode_scalars};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use tracing::{debug, trace};

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Default send and receive timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10);

const TEXT_LEN_PREFIX: usize = 4;

/// Link configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Local address to bind
    pub local: SocketAddr,
    /// Peer that sends go to
    pub remote: SocketAddr,
    /// Send timeout; zero means wait indefinitely
    pub send_timeout: Duration,
    /// Receive timeout; zero means wait indefinitely
    pub recv_timeout: Duration,
    /// Blocking sockets wait up to the timeouts, non-blocking ones return at once
    pub blocking: bool,
}

impl LinkConfig {
    /// Bind `local_port` on all interfaces and talk to `remote`
    pub fn new(local_port: u16, remote: SocketAddr) -> Self {
        Self {
            local: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port)),
            remote,
            send_timeout: DEFAULT_TIMEOUT,
            recv_timeout: DEFAULT_TIMEOUT,
            blocking: true,
        }
    }
}

/// Pack doubles into a datagram
pub fn encode_doubles(values: &[f64]) -> Result<Vec<u8>, NetError> {
    let bytes = encode_scalars(values);
    check_size(bytes.len())?;
    Ok(bytes)
}

/// Unpack a doubles datagram
pub fn decode_doubles(datagram: &[u8]) -> Result<Vec<f64>, NetError> {
    decode_scalars(datagram).map_err(|e| NetError::Malformed {
        reason: e.to_string(),
    })
}

/// Length-prefixed text datagram
pub fn encode_text(text: &str) -> Result<Vec<u8>, NetError> {
    check_size(TEXT_LEN_PREFIX + text.len())?;
    let mut out = Vec::with_capacity(TEXT_LEN_PREFIX + text.len());
    out.extend_from_slice(&(text.len() as u32).to_be_bytes());
    out.extend_from_slice(text.as_bytes());
    Ok(out)
}

/// Decode a text datagram; the declared length must match exactly
pub fn decode_text(datagram: &[u8]) -> Result<String, NetError> {
    let Some((prefix, body)) = datagram.split_first_chunk::<TEXT_LEN_PREFIX>() else {
        return Err(NetError::Malformed {
            reason: format!("{} bytes is shorter than the length prefix", datagram.len()),
        });
    };
    let declared = u32::from_be_bytes(*prefix) as usize;
    if declared != body.len() {
        return Err(NetError::Malformed {
            reason: format!("declared {} bytes of text, received {}", declared, body.len()),
        });
    }
    String::from_utf8(body.to_vec()).map_err(|_| NetError::Malformed {
        reason: "text is not valid UTF-8".to_string(),
    })
}

fn check_size(len: usize) -> Result<(), NetError> {
    if len > MAX_DATAGRAM_SIZE {
        return Err(NetError::TooLarge {
            max: MAX_DATAGRAM_SIZE,
            got: len,
        });
    }
    Ok(())
}

fn timeout_opt(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

/// A bound UDP socket paired with one remote peer
pub struct DatagramLink {
    socket: UdpSocket,
    remote: SocketAddr,
    blocking: bool,
    buf: Vec<u8>,
}

impl DatagramLink {
    /// Bind the local address and apply timeouts
    pub fn bind(config: &LinkConfig) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(config.local).map_err(|source| NetError::Bind {
            addr: config.local,
            source,
        })?;
        socket.set_read_timeout(timeout_opt(config.recv_timeout))?;
        socket.set_write_timeout(timeout_opt(config.send_timeout))?;
        socket.set_nonblocking(!config.blocking)?;

        debug!(local = %socket.local_addr()?, remote = %config.remote, "bound datagram link");
        Ok(Self {
            socket,
            remote: config.remote,
            blocking: config.blocking,
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn set_blocking(&mut self, blocking: bool) -> Result<(), NetError> {
        self.socket.set_nonblocking(!blocking)?;
        self.blocking = blocking;
        Ok(())
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn map_io(&self, e: std::io::Error) -> NetError {
        match e.kind() {
            ErrorKind::WouldBlock if !self.blocking => NetError::NotReady,
            // SO_RCVTIMEO expiry surfaces as EAGAIN on Linux
            ErrorKind::WouldBlock | ErrorKind::TimedOut => NetError::Timeout,
            _ => NetError::Io(e),
        }
    }

    /// Send one datagram to the remote peer
    pub fn send_raw(&self, datagram: &[u8]) -> Result<(), NetError> {
        check_size(datagram.len())?;
        let sent = self
            .socket
            .send_to(datagram, self.remote)
            .map_err(|e| self.map_io(e))?;
        trace!(bytes = sent, remote = %self.remote, "sent datagram");
        Ok(())
    }

    /// Receive the next datagram from any sender
    pub fn recv_raw(&mut self) -> Result<Vec<u8>, NetError> {
        let (len, from) = match self.socket.recv_from(&mut self.buf) {
            Ok(received) => received,
            Err(e) => return Err(self.map_io(e)),
        };
        trace!(bytes = len, %from, "received datagram");
        Ok(self.buf[..len].to_vec())
    }

    pub fn send_doubles(&self, values: &[f64]) -> Result<(), NetError> {
        self.send_raw(&encode_doubles(values)?)
    }

    pub fn recv_doubles(&mut self) -> Result<Vec<f64>, NetError> {
        decode_doubles(&self.recv_raw()?)
    }

    pub fn send_text(&self, text: &str) -> Result<(), NetError> {
        self.send_raw(&encode_text(text)?)
    }

    pub fn recv_text(&mut self) -> Result<String, NetError> {
        decode_text(&self.recv_raw()?)
    }
}
