//! Ethernet transport: register transactions over TCP and UDP-broadcast
//! device discovery.
//!
//! The device answers feedback frames (see [`crate::device::frame`]) on its
//! register port and replies to a broadcast probe on the discovery port
//! with its serial number and register port.

use crate::device::frame::{FeedbackRequest, FeedbackResponse, HEADER_LEN};
use crate::device::{registers, Backend, ConnectionType, Device, DeviceFamily, RwOp};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, trace};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

/// Default register-protocol TCP port.
pub const REGISTER_PORT: u16 = 502;

/// UDP port devices listen on for discovery probes.
pub const DISCOVERY_PORT: u16 = 52362;

/// Discovery probe payload ("T7DQ").
const DISCOVERY_REQUEST: u32 = 0x5437_4451;

/// Discovery reply magic ("T7DR").
const DISCOVERY_REPLY: u32 = 0x5437_4452;

/// Connect timeout for the register port.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Read/write timeout for register transactions.
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a single discovery round listens for replies.
const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(900);

/// An open TCP register connection to one device.
#[derive(Debug)]
pub struct TcpDevice {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    serial: u32,
    txn: u16,
}

impl TcpDevice {
    /// Connect to a device's register port and read its serial number.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        debug!("Connecting to {addr}");
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        stream.set_nodelay(true)?;

        let mut device = Self {
            stream: Some(stream),
            peer: addr,
            serial: 0,
            txn: 0,
        };
        device.serial = device.read_register(registers::SERIAL_NUMBER)?;
        info!("Connected to device {} at {addr}", device.serial);
        Ok(device)
    }

    /// Peer address of this connection.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn transact(&mut self, ops: &[RwOp]) -> Result<Vec<u32>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Protocol("handle is closed".into()))?;

        self.txn = self.txn.wrapping_add(1);
        let request = FeedbackRequest { txn: self.txn, ops }.build();
        trace!("-> {} ops, {} bytes", ops.len(), request.len());

        stream.write_all(&request).map_err(map_io)?;
        stream.flush().map_err(map_io)?;

        let mut frame = vec![0u8; HEADER_LEN];
        stream.read_exact(&mut frame).map_err(map_io)?;
        let length = BigEndian::read_u16(&frame[4..6]) as usize;
        if length == 0 {
            return Err(Error::Protocol("zero-length response frame".into()));
        }
        let body_start = frame.len();
        frame.resize(body_start + length - 1, 0);
        stream.read_exact(&mut frame[body_start..]).map_err(map_io)?;

        let expected_reads = ops.iter().filter(|op| op.is_read()).count();
        let response = FeedbackResponse::parse(&frame, expected_reads)?;
        if response.txn != self.txn {
            return Err(Error::Protocol(format!(
                "transaction id mismatch: sent {}, got {}",
                self.txn, response.txn
            )));
        }
        Ok(response.values)
    }
}

/// Classify socket timeouts separately from hard I/O failures.
fn map_io(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            Error::Timeout("no response from device".into())
        },
        _ => Error::Io(e),
    }
}

impl Device for TcpDevice {
    fn read_register(&mut self, addr: u16) -> Result<u32> {
        let values = self.transact(&[RwOp::Read { addr }])?;
        values
            .first()
            .copied()
            .ok_or_else(|| Error::Protocol("read returned no value".into()))
    }

    fn write_register(&mut self, addr: u16, value: u32) -> Result<()> {
        self.transact(&[RwOp::Write { addr, value }])?;
        Ok(())
    }

    fn rw_many(&mut self, ops: &[RwOp]) -> Result<Vec<u32>> {
        self.transact(ops)
    }

    fn serial_number(&self) -> u32 {
        self.serial
    }

    fn close(&mut self) -> Result<()> {
        // Take ownership of the stream and let it drop (close)
        self.stream.take();
        Ok(())
    }
}

/// A device found by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Reported serial number.
    pub serial: u32,
    /// Register-protocol endpoint.
    pub addr: SocketAddr,
}

/// Ethernet backend: UDP-broadcast discovery, open by serial.
#[derive(Debug, Clone)]
pub struct TcpBackend {
    discovery_timeout: Duration,
}

impl TcpBackend {
    /// Create a backend with default discovery settings.
    pub fn new() -> Self {
        Self {
            discovery_timeout: DISCOVERY_TIMEOUT,
        }
    }

    /// Set how long a discovery round listens for replies.
    #[must_use]
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Broadcast a discovery probe and collect replies.
    pub fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;

        socket.send_to(
            &DISCOVERY_REQUEST.to_be_bytes(),
            (Ipv4Addr::BROADCAST, DISCOVERY_PORT),
        )?;

        let deadline = Instant::now() + self.discovery_timeout;
        let mut found: Vec<DiscoveredDevice> = Vec::new();
        let mut buf = [0u8; 32];

        while Instant::now() < deadline {
            match socket.recv_from(&mut buf) {
                Ok((n, peer)) if n >= 10 => {
                    let magic = BigEndian::read_u32(&buf[0..4]);
                    if magic != DISCOVERY_REPLY {
                        trace!("ignoring non-reply datagram from {peer}");
                        continue;
                    }
                    let serial = BigEndian::read_u32(&buf[4..8]);
                    let port = BigEndian::read_u16(&buf[8..10]);
                    let addr = SocketAddr::new(peer.ip(), port);
                    if !found.iter().any(|d| d.serial == serial) {
                        debug!("Discovered device {serial} at {addr}");
                        found.push(DiscoveredDevice { serial, addr });
                    }
                },
                Ok(_) => {},
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Ok(found)
    }

    /// Open a device by explicit host address, bypassing discovery.
    ///
    /// `host` is `"addr"` or `"addr:port"`; the default register port is
    /// used when none is given.
    pub fn open_host(&self, host: &str) -> Result<Box<dyn Device>> {
        let target = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:{REGISTER_PORT}")
        };
        let addr = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Fetch(format!("cannot resolve host {host}")))?;
        Ok(Box::new(TcpDevice::connect(addr)?))
    }

    fn require_ethernet(&self, connection: ConnectionType) -> Result<()> {
        match connection {
            ConnectionType::Usb => Err(Error::Unsupported(
                "USB access requires the vendor driver; use the Ethernet connection".into(),
            )),
            ConnectionType::Ethernet | ConnectionType::Any => Ok(()),
        }
    }
}

impl Default for TcpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for TcpBackend {
    fn enumerate(&self, _family: DeviceFamily, connection: ConnectionType) -> Result<Vec<u32>> {
        self.require_ethernet(connection)?;
        Ok(self.discover()?.iter().map(|d| d.serial).collect())
    }

    fn open(
        &self,
        _family: DeviceFamily,
        connection: ConnectionType,
        serial: u32,
    ) -> Result<Box<dyn Device>> {
        self.require_ethernet(connection)?;

        let devices = self.discover()?;
        let target = devices
            .iter()
            .find(|d| d.serial == serial)
            .ok_or(Error::DeviceNotFound)?;

        let device = TcpDevice::connect(target.addr)?;
        if device.serial_number() != serial {
            return Err(Error::Protocol(format!(
                "device at {} reports serial {}, expected {}",
                target.addr,
                device.serial_number(),
                serial
            )));
        }
        Ok(Box::new(device))
    }
}
