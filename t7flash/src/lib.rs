//! # t7flash
//!
//! A library for upgrading the firmware of T7-family data-acquisition
//! devices over their register-addressed transport.
//!
//! This crate provides the complete upgrade pipeline:
//!
//! - Firmware image parsing (128-byte big-endian header + payload)
//! - Compatibility gating against the device family
//! - Key-protected external-flash erase/read/write in compound frames
//! - Reboot supervision: the device is followed through its upgrade
//!   reboot and reopened by serial number once it re-enumerates
//! - Version confirmation against the image's declared version
//!
//! ## Supported transports
//!
//! - **Ethernet** (bundled): register transactions over TCP with
//!   UDP-broadcast discovery
//! - **USB**: requires the vendor driver; pluggable behind the same
//!   [`Backend`] trait
//!
//! ## Example
//!
//! ```rust,no_run
//! use t7flash::{ConnectionType, NullProgress, TcpBackend, Upgrader};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = TcpBackend::new();
//!
//!     // Find and open the device
//!     let devices = backend.discover()?;
//!     let serial = devices.first().ok_or("no devices found")?.serial;
//!     let device = t7flash::open_device(&backend, ConnectionType::Ethernet, serial)?;
//!
//!     // Run the upgrade; the reopened post-reboot handle comes back
//!     let upgrader = Upgrader::new(&backend);
//!     let device = upgrader.update_firmware(
//!         device,
//!         "T7firmware_010290_2019.bin",
//!         ConnectionType::Ethernet,
//!         &mut NullProgress,
//!     )?;
//!
//!     drop(device);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod device;
pub mod error;
pub mod flash;
pub mod image;
pub mod progress;
pub mod upgrade;

// Re-exports for convenience
pub use {
    cancel::CancelToken,
    device::{
        tcp::{DiscoveredDevice, TcpBackend, TcpDevice},
        Backend, ConnectionType, Device, DeviceFamily, RwOp,
    },
    error::{Error, FlashStage, Incompatibility, Result},
    image::{check_compatibility, FwImage, ImageHeader},
    progress::{NullProgress, ProgressSink},
    upgrade::{UpgradeOptions, Upgrader},
};

/// Open a device of the default family through a backend.
///
/// Thin convenience wrapper over [`Backend::open`].
pub fn open_device(
    backend: &dyn Backend,
    connection: ConnectionType,
    serial: u32,
) -> Result<Box<dyn Device>> {
    backend.open(DeviceFamily::default(), connection, serial)
}
