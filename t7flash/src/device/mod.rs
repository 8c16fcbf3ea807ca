//! Device abstraction for register-addressed transports.
//!
//! The upgrade pipeline talks to the target through two narrow traits:
//!
//! - [`Device`]: an open handle supporting single-register reads/writes and
//!   compound [`rw_many`](Device::rw_many) frames,
//! - [`Backend`]: enumeration by (family, connection type) and open by
//!   serial number, which the pipeline uses to re-find the device after the
//!   upgrade reboot.
//!
//! The bundled implementation is Ethernet-based (see [`tcp`]); a vendor USB
//! driver would plug in behind the same traits.

pub mod frame;
pub mod registers;
pub mod tcp;

use crate::error::Result;
use std::fmt;

/// Default number of 32-bit words per compound frame.
///
/// The device accepts bounded-size compound frames only; this is the
/// largest block the wire protocol carries in one transaction.
pub const DEFAULT_BLOCK_WORDS: usize = 32;

/// Device family identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceFamily {
    /// T7 series data-acquisition devices.
    #[default]
    T7,
}

impl DeviceFamily {
    /// Get the device family from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "t7" => Some(Self::T7),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::T7 => write!(f, "T7"),
        }
    }
}

/// Transport used to reach the device.
///
/// Passed through to the backend opaquely; the pipeline itself only stores
/// it so re-enumeration reopens the device the same way it was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    /// USB connection.
    Usb,
    /// Ethernet connection.
    Ethernet,
    /// Any available connection.
    #[default]
    Any,
}

impl ConnectionType {
    /// Get the connection type from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "usb" => Some(Self::Usb),
            "ethernet" | "eth" | "tcp" => Some(Self::Ethernet),
            "any" | "auto" => Some(Self::Any),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb => write!(f, "USB"),
            Self::Ethernet => write!(f, "Ethernet"),
            Self::Any => write!(f, "Any"),
        }
    }
}

/// One operation inside a compound register frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwOp {
    /// Write a 32-bit value to a register.
    Write {
        /// Register address.
        addr: u16,
        /// Value to write.
        value: u32,
    },
    /// Read a 32-bit value from a register.
    Read {
        /// Register address.
        addr: u16,
    },
}

impl RwOp {
    /// Register address this operation targets.
    pub fn addr(&self) -> u16 {
        match self {
            Self::Write { addr, .. } | Self::Read { addr } => *addr,
        }
    }

    /// Whether this is a read operation.
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read { .. })
    }
}

/// An open register-addressed device handle.
///
/// All operations are synchronous; compound frames are atomic on the wire.
pub trait Device: Send + std::fmt::Debug {
    /// Read a single 32-bit register.
    fn read_register(&mut self, addr: u16) -> Result<u32>;

    /// Write a single 32-bit register.
    fn write_register(&mut self, addr: u16, value: u32) -> Result<()>;

    /// Execute a compound frame of mixed reads and writes.
    ///
    /// Operations are applied in order within one transport transaction.
    /// Returns the values of the `Read` operations, in order.
    fn rw_many(&mut self, ops: &[RwOp]) -> Result<Vec<u32>>;

    /// Serial number this handle was opened with.
    fn serial_number(&self) -> u32;

    /// Largest number of data words the transport carries per compound
    /// frame.
    fn max_block_words(&self) -> usize {
        DEFAULT_BLOCK_WORDS
    }

    /// Close the handle and release the transport.
    ///
    /// After calling this method, the handle cannot be used for further
    /// I/O.
    fn close(&mut self) -> Result<()>;

    /// Read a register holding an IEEE-754 float32.
    fn read_f32(&mut self, addr: u16) -> Result<f32> {
        Ok(f32::from_bits(self.read_register(addr)?))
    }
}

/// Device discovery and opening.
///
/// Separated from [`Device`] because enumeration does not require an open
/// handle, and because the pipeline must reopen the device after it reboots.
pub trait Backend {
    /// List serial numbers of reachable devices of the given family.
    fn enumerate(&self, family: DeviceFamily, connection: ConnectionType) -> Result<Vec<u32>>;

    /// Open a device by serial number.
    fn open(
        &self,
        family: DeviceFamily,
        connection: ConnectionType,
        serial: u32,
    ) -> Result<Box<dyn Device>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_type_from_name() {
        assert_eq!(ConnectionType::from_name("usb"), Some(ConnectionType::Usb));
        assert_eq!(
            ConnectionType::from_name("Ethernet"),
            Some(ConnectionType::Ethernet)
        );
        assert_eq!(ConnectionType::from_name("tcp"), Some(ConnectionType::Ethernet));
        assert_eq!(ConnectionType::from_name("any"), Some(ConnectionType::Any));
        assert_eq!(ConnectionType::from_name("bluetooth"), None);
    }

    #[test]
    fn test_device_family_from_name() {
        assert_eq!(DeviceFamily::from_name("t7"), Some(DeviceFamily::T7));
        assert_eq!(DeviceFamily::from_name("T7"), Some(DeviceFamily::T7));
        assert_eq!(DeviceFamily::from_name("t8"), None);
    }

    #[test]
    fn test_rw_op_accessors() {
        let w = RwOp::Write { addr: 61804, value: 0x100 };
        let r = RwOp::Read { addr: 61810 };
        assert_eq!(w.addr(), 61804);
        assert_eq!(r.addr(), 61810);
        assert!(!w.is_read());
        assert!(r.is_read());
    }
}
