//! Error types for t7flash.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for t7flash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reason a firmware image was rejected by the compatibility gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Incompatibility {
    /// The header code does not match the T7 family magic.
    FamilyMagic {
        /// Header code found in the image.
        got: u32,
    },
    /// The intended device type is not in the allowed set.
    DeviceType {
        /// Intended device type found in the image.
        got: u32,
    },
    /// The filename-declared version disagrees with the header's
    /// contained version.
    Version {
        /// Version derived from the filename.
        declared: f64,
        /// Version stored in the header.
        contained: f64,
    },
}

impl std::fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FamilyMagic { got } => {
                write!(f, "header code {got:#010X} is not a T7 firmware image")
            },
            Self::DeviceType { got } => {
                write!(f, "image is intended for device type {got}")
            },
            Self::Version { declared, contained } => write!(
                f,
                "declared version {declared:.4} does not match contained version {contained:.4}"
            ),
        }
    }
}

/// Pipeline stage during which a flash I/O failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStage {
    /// Erasing the image region.
    EraseImage,
    /// Erasing the image-info region.
    EraseImageInfo,
    /// Writing the image region.
    WriteImage,
    /// Writing the image-info region.
    WriteImageInfo,
    /// Reading the image region back.
    ReadImage,
    /// Reading the image-info region back.
    ReadImageInfo,
}

impl std::fmt::Display for FlashStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::EraseImage => "eraseImage",
            Self::EraseImageInfo => "eraseImageInfo",
            Self::WriteImage => "writeImage",
            Self::WriteImageInfo => "writeImageInfo",
            Self::ReadImage => "readImage",
            Self::ReadImageInfo => "readImageInfo",
        };
        f.write_str(name)
    }
}

/// Error type for t7flash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HTTP fetch of the image failed.
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// The file is not a usable firmware image.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// A header field could not be read.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The image does not match the target device.
    #[error("Incompatible image: {0}")]
    Incompatible(Incompatibility),

    /// A flash transaction failed mid-operation.
    #[error("Flash I/O failed during {stage}, chunk {chunk}: {source}")]
    FlashIo {
        /// Stage in which the failure occurred.
        stage: FlashStage,
        /// Zero-based index of the failed chunk.
        chunk: usize,
        /// Underlying transport error.
        #[source]
        source: Box<Error>,
    },

    /// A region read back non-erased words after an erase.
    #[error("Erase incomplete: word at flash offset {offset:#010X} is {got:#010X}")]
    EraseIncomplete {
        /// Byte offset of the first non-erased word.
        offset: u32,
        /// Value read from that word.
        got: u32,
    },

    /// Written image does not match the source buffer.
    #[error("Write mismatch at image offset {offset}")]
    WriteMismatch {
        /// Byte offset of the first divergence.
        offset: usize,
    },

    /// The device did not reappear after the upgrade reboot.
    #[error("Device {serial} did not re-enumerate within {waited:?}")]
    EnumerationTimeout {
        /// Serial number of the device being waited for.
        serial: u32,
        /// How long the wait loop ran.
        waited: Duration,
    },

    /// The rebooted device reports an unexpected firmware version.
    #[error("Version mismatch: expected {expected:.4}, device reports {got:.4}")]
    VersionMismatch {
        /// Version the image declared.
        expected: f64,
        /// Version read from the device.
        got: f64,
    },

    /// Operation cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Register protocol error (malformed frame, device exception).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No matching device was found.
    #[error("Device not found")]
    DeviceNotFound,

    /// Unsupported connection type or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incompatibility_display() {
        let e = Incompatibility::FamilyMagic { got: 0xDEAD_BEEF };
        assert!(e.to_string().contains("0xDEADBEEF"));

        let e = Incompatibility::DeviceType { got: 9 };
        assert!(e.to_string().contains('9'));

        let e = Incompatibility::Version {
            declared: 1.0290,
            contained: 1.0300,
        };
        let s = e.to_string();
        assert!(s.contains("1.0290") && s.contains("1.0300"));
    }

    #[test]
    fn test_flash_stage_display() {
        assert_eq!(FlashStage::WriteImage.to_string(), "writeImage");
        assert_eq!(FlashStage::EraseImageInfo.to_string(), "eraseImageInfo");
    }

    #[test]
    fn test_flash_io_error_carries_stage_and_chunk() {
        let err = Error::FlashIo {
            stage: FlashStage::WriteImage,
            chunk: 17,
            source: Box::new(Error::Timeout("no response".into())),
        };
        let s = err.to_string();
        assert!(s.contains("writeImage"));
        assert!(s.contains("17"));
    }
}
