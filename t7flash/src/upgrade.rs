//! The firmware upgrade pipeline.
//!
//! A single upgrade is a strictly sequential chain:
//!
//! ```text
//! load → check → erase info → erase image → write image →
//! write image-info → reboot request → close → wait for re-enumeration →
//! reopen by serial → confirm version
//! ```
//!
//! Each stage either mutates the bundle or fails the pipeline with its own
//! error, with two deliberate exceptions: the reboot-request write and the
//! pre-reboot close are best-effort, because the device is expected to
//! vanish underneath them.

use crate::cancel::CancelToken;
use crate::device::{registers, Backend, ConnectionType, Device, DeviceFamily};
use crate::error::{Error, Result};
use crate::flash::{
    check_erase, check_image, erase_image, erase_image_info, write_image, write_image_info,
};
use crate::image::fwimg::{round4, versions_match, FwImage};
use crate::image::check_compatibility;
use crate::progress::{MonotonicSink, ProgressSink, ScaledSink};
use log::{debug, info, trace, warn};
use std::thread;
use std::time::{Duration, Instant};

/// Progress checkpoint after the compatibility gate.
const PCT_COMPATIBLE: f64 = 10.0;

/// Progress checkpoint after both regions are erased.
const PCT_ERASED: f64 = 30.0;

/// Progress checkpoint after the image region is written.
const PCT_IMAGE_WRITTEN: f64 = 85.0;

/// Progress checkpoint after the image-info region is written.
const PCT_INFO_WRITTEN: f64 = 90.0;

/// Progress value on successful completion.
const PCT_COMPLETE: f64 = 100.0;

/// Tunable pipeline behaviour.
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Read both regions back after erasing and require the erased
    /// sentinel everywhere.
    pub verify_erase: bool,
    /// Read the image region back after writing and compare byte-for-byte.
    /// Off by default for speed.
    pub verify_image: bool,
    /// Upper bound on the re-enumeration wait.
    pub reenumeration_timeout: Duration,
    /// Interval between enumeration polls.
    pub poll_interval: Duration,
    /// Initial sleep before the first poll, giving the boot loader time to
    /// come up.
    pub boot_delay: Duration,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            verify_erase: true,
            verify_image: false,
            reenumeration_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            boot_delay: Duration::from_secs(1),
        }
    }
}

impl UpgradeOptions {
    /// Enable or disable post-write byte verification.
    #[must_use]
    pub fn with_verify_image(mut self, verify: bool) -> Self {
        self.verify_image = verify;
        self
    }

    /// Enable or disable post-erase verification.
    #[must_use]
    pub fn with_verify_erase(mut self, verify: bool) -> Self {
        self.verify_erase = verify;
        self
    }

    /// Set the re-enumeration timeout.
    #[must_use]
    pub fn with_reenumeration_timeout(mut self, timeout: Duration) -> Self {
        self.reenumeration_timeout = timeout;
        self
    }

    /// Set the enumeration poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the initial boot-loader delay.
    #[must_use]
    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }
}

/// Pipeline state carried from load to completion.
///
/// The device handle has two distinct lifetimes: the pre-reboot handle,
/// consumed by the close step, and the post-reboot handle installed by
/// re-enumeration and handed back to the caller. The field is `None` only
/// between those two.
struct Bundle {
    image: FwImage,
    serial: u32,
    connection: ConnectionType,
    device: Option<Box<dyn Device>>,
}

/// Drives firmware upgrades against devices opened through a [`Backend`].
pub struct Upgrader<'a> {
    backend: &'a dyn Backend,
    options: UpgradeOptions,
    cancel: CancelToken,
}

impl<'a> Upgrader<'a> {
    /// Create an upgrader with default options.
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self {
            backend,
            options: UpgradeOptions::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Replace the pipeline options.
    #[must_use]
    pub fn with_options(mut self, options: UpgradeOptions) -> Self {
        self.options = options;
        self
    }

    /// Use an externally-held cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Handle to this pipeline's cancellation token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Load an image from a path or URL and upgrade the device with it.
    ///
    /// On success the returned handle is the reopened post-reboot device;
    /// the handle passed in is consumed either way.
    pub fn update_firmware(
        &self,
        device: Box<dyn Device>,
        source: &str,
        connection: ConnectionType,
        progress: &mut dyn ProgressSink,
    ) -> Result<Box<dyn Device>> {
        let image = FwImage::load(source)?;
        self.upgrade_image(image, device, connection, progress)
    }

    /// Upgrade the device with an already-loaded image.
    pub fn upgrade_image(
        &self,
        image: FwImage,
        device: Box<dyn Device>,
        connection: ConnectionType,
        progress: &mut dyn ProgressSink,
    ) -> Result<Box<dyn Device>> {
        let mut sink = MonotonicSink::new(progress);
        let serial = device.serial_number();
        info!(
            "Upgrading device {serial} to {:.4} from {}",
            image.firmware_version(),
            image.source_name()
        );

        let mut bundle = Bundle {
            image,
            serial,
            connection,
            device: Some(device),
        };

        self.cancel.check()?;
        check_compatibility(&bundle.image)?;
        sink.update(PCT_COMPATIBLE, false);

        {
            let device = bundle
                .device
                .as_deref_mut()
                .ok_or_else(|| Error::Protocol("device handle missing".into()))?;

            sink.status("Erasing image…", false);
            erase_image_info(device, &self.cancel)?;
            erase_image(device, &self.cancel)?;
            if self.options.verify_erase {
                check_erase(device, &self.cancel)?;
            }
            sink.update(PCT_ERASED, false);

            sink.status("Writing image…", false);
            {
                let mut scaled = ScaledSink::new(&mut sink, PCT_ERASED, PCT_IMAGE_WRITTEN);
                write_image(device, bundle.image.payload(), &self.cancel, &mut |done, total| {
                    scaled.fraction(done, total);
                })?;
            }
            sink.update(PCT_IMAGE_WRITTEN, false);

            if self.options.verify_image {
                sink.status("Verifying image…", false);
                check_image(device, bundle.image.payload(), &self.cancel)?;
            }

            sink.status("Writing image info…", false);
            {
                let mut scaled = ScaledSink::new(&mut sink, PCT_IMAGE_WRITTEN, PCT_INFO_WRITTEN);
                write_image_info(
                    device,
                    bundle.image.header_bytes(),
                    &self.cancel,
                    &mut |done, total| {
                        scaled.fraction(done, total);
                    },
                )?;
            }
            sink.update(PCT_INFO_WRITTEN, false);

            self.cancel.check()?;
            sink.status("Restarting…", false);
            // The device resets after acknowledging; the acknowledgment may
            // never arrive, so a transport error here is not fatal.
            if let Err(e) = device.write_register(registers::SYSTEM_REBOOT, registers::REBOOT_UPGRADE_MAGIC)
            {
                warn!("Reboot request did not acknowledge: {e}");
            }
        }

        // The pre-reboot handle is stale either way; close best-effort.
        if let Some(mut old) = bundle.device.take() {
            if let Err(e) = old.close() {
                warn!("Closing pre-reboot handle failed: {e}");
            }
        }

        sink.status("Waiting for device…", false);
        bundle.device = Some(self.wait_for_reenumeration(bundle.serial, bundle.connection)?);

        let device = bundle
            .device
            .as_deref_mut()
            .ok_or_else(|| Error::Protocol("device handle missing".into()))?;
        let reported = round4(f64::from(device.read_f32(registers::FIRMWARE_VERSION)?));
        let expected = bundle.image.firmware_version();
        if !versions_match(reported, expected) {
            return Err(Error::VersionMismatch {
                expected,
                got: reported,
            });
        }

        info!("Device {serial} confirmed running firmware {reported:.4}");
        sink.update(PCT_COMPLETE, true);
        sink.status("Firmware upgrade complete", true);

        bundle
            .device
            .take()
            .ok_or_else(|| Error::Protocol("device handle missing".into()))
    }

    /// Poll enumeration until the device reappears under its serial number
    /// and can be reopened.
    fn wait_for_reenumeration(
        &self,
        serial: u32,
        connection: ConnectionType,
    ) -> Result<Box<dyn Device>> {
        let start = Instant::now();

        self.cancel.check()?;
        thread::sleep(self.options.boot_delay);

        loop {
            self.cancel.check()?;

            match self.backend.enumerate(DeviceFamily::T7, connection) {
                Ok(serials) if serials.contains(&serial) => {
                    match self.backend.open(DeviceFamily::T7, connection, serial) {
                        Ok(device) => {
                            info!(
                                "Device {serial} re-enumerated after {:?}",
                                start.elapsed()
                            );
                            return Ok(device);
                        },
                        Err(e) => {
                            debug!("Reopen failed, device may still be booting: {e}");
                        },
                    }
                },
                Ok(_) => trace!("Device {serial} not yet enumerated"),
                Err(e) => debug!("Enumeration poll failed: {e}"),
            }

            if start.elapsed() >= self.options.reenumeration_timeout {
                return Err(Error::EnumerationTimeout {
                    serial,
                    waited: start.elapsed(),
                });
            }
            thread::sleep(self.options.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = UpgradeOptions::default();
        assert!(options.verify_erase);
        assert!(!options.verify_image);
        assert_eq!(options.reenumeration_timeout, Duration::from_secs(60));
        assert_eq!(options.poll_interval, Duration::from_secs(1));
        assert_eq!(options.boot_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_options_builders() {
        let options = UpgradeOptions::default()
            .with_verify_image(true)
            .with_verify_erase(false)
            .with_reenumeration_timeout(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(10))
            .with_boot_delay(Duration::ZERO);
        assert!(options.verify_image);
        assert!(!options.verify_erase);
        assert_eq!(options.reenumeration_timeout, Duration::from_secs(5));
        assert_eq!(options.poll_interval, Duration::from_millis(10));
        assert_eq!(options.boot_delay, Duration::ZERO);
    }
}
