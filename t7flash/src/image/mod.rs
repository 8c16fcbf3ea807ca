//! Firmware image loading and validation.

pub mod fwimg;

pub use fwimg::{FwImage, ImageHeader, ALLOWED_DEVICE_TYPES, HEADER_SIZE, T7_HEADER_CODE};

use crate::error::{Error, Incompatibility, Result};
use fwimg::versions_match;

/// Gate an image against the target family before any device I/O.
///
/// All three predicates must hold: the family magic, the intended device
/// type, and agreement between the filename-declared version and the
/// header's contained version at four-decimal precision. The first failed
/// predicate is reported.
pub fn check_compatibility(image: &FwImage) -> Result<()> {
    let header = image.header();

    if header.header_code != T7_HEADER_CODE {
        return Err(Error::Incompatible(Incompatibility::FamilyMagic {
            got: header.header_code,
        }));
    }

    if !ALLOWED_DEVICE_TYPES.contains(&header.intended_device) {
        return Err(Error::Incompatible(Incompatibility::DeviceType {
            got: header.intended_device,
        }));
    }

    let declared = image.firmware_version();
    let contained = header.contained_version_fixed();
    if !versions_match(declared, contained) {
        return Err(Error::Incompatible(Incompatibility::Version {
            declared,
            contained,
        }));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::fwimg::tests::build_image;
    use super::*;

    #[test]
    fn test_compatible_image_passes() {
        let data = build_image(T7_HEADER_CODE, 7, 1.0290, &[0u8; 8]);
        let image = FwImage::from_bytes("T7firmware_010290_2019.bin", data).unwrap();
        assert!(check_compatibility(&image).is_ok());
    }

    #[test]
    fn test_wrong_family_magic() {
        let data = build_image(0x1234_5678, 7, 1.0290, &[0u8; 8]);
        let image = FwImage::from_bytes("T7firmware_010290_2019.bin", data).unwrap();
        let err = check_compatibility(&image).unwrap_err();
        assert!(matches!(
            err,
            Error::Incompatible(Incompatibility::FamilyMagic { got: 0x1234_5678 })
        ));
    }

    #[test]
    fn test_wrong_device_type() {
        let data = build_image(T7_HEADER_CODE, 9, 1.0290, &[0u8; 8]);
        let image = FwImage::from_bytes("T7firmware_010290_2019.bin", data).unwrap();
        let err = check_compatibility(&image).unwrap_err();
        assert!(matches!(
            err,
            Error::Incompatible(Incompatibility::DeviceType { got: 9 })
        ));
    }

    #[test]
    fn test_filename_header_version_disagreement() {
        // Filename declares 1.0290, header carries 1.0300
        let data = build_image(T7_HEADER_CODE, 7, 1.0300, &[0u8; 8]);
        let image = FwImage::from_bytes("T7firmware_010290_2019.bin", data).unwrap();
        let err = check_compatibility(&image).unwrap_err();
        assert!(matches!(
            err,
            Error::Incompatible(Incompatibility::Version { .. })
        ));
    }
}
