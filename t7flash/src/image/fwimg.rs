//! T7 firmware image format.
//!
//! A firmware image is a flat binary: a 128-byte header followed by the
//! image payload. All multi-byte fields are big-endian; the two version
//! fields are IEEE-754 float32.
//!
//! ```text
//! +--------------------+
//! |   Header (128 B)   |
//! +--------------------+
//! |      Payload       |
//! |  (multiple of 4 B) |
//! +--------------------+
//! ```
//!
//! Header layout (byte offsets):
//!
//! | Offset | Size | Field                     |
//! |--------|------|---------------------------|
//! | 0      | 4    | header code (family magic)|
//! | 4      | 4    | intended device           |
//! | 8      | 4    | contained version (f32)   |
//! | 12     | 4    | required upgrader (f32)   |
//! | 16     | 2    | image number              |
//! | 18     | 2    | images in file            |
//! | 20     | 4    | start of next image       |
//! | 24     | 4    | image length              |
//! | 28     | 4    | image offset              |
//! | 32     | 4    | SHA byte count            |
//! | 72     | 4    | options                   |
//! | 76     | 20   | encrypted SHA-1           |
//! | 96     | 20   | unencrypted SHA-1         |
//! | 124    | 4    | header checksum           |

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt};
use log::debug;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Header size in bytes. The payload starts at this offset.
pub const HEADER_SIZE: usize = 128;

/// T7 firmware family magic ("LJFX").
pub const T7_HEADER_CODE: u32 = 0x4C4A_4658;

/// Device type codes this upgrader will write to.
pub const ALLOWED_DEVICE_TYPES: &[u32] = &[7, 8];

/// SHA-1 digest length in bytes.
pub const SHA_LEN: usize = 20;

/// Parsed 128-byte image header.
#[derive(Debug, Clone)]
pub struct ImageHeader {
    /// Family magic; must equal [`T7_HEADER_CODE`].
    pub header_code: u32,
    /// Device type code the image targets.
    pub intended_device: u32,
    /// Firmware version carried by the image.
    pub contained_version: f32,
    /// Minimum upgrader version required by the image.
    pub required_upgrader_version: f32,
    /// Index of this image within the file.
    pub image_number: u16,
    /// Total number of images in the file.
    pub num_images: u16,
    /// File offset of the next image, if any.
    pub start_of_next_image: u32,
    /// Payload length in bytes.
    pub length_of_image: u32,
    /// File offset of the payload.
    pub image_offset: u32,
    /// Number of payload bytes covered by the SHA digests.
    pub sha_byte_count: u32,
    /// Option flags.
    pub options: u32,
    /// Encrypted SHA-1 digest.
    pub encrypted_sha: [u8; SHA_LEN],
    /// Unencrypted SHA-1 digest.
    pub unencrypted_sha: [u8; SHA_LEN],
    /// Checksum over the header itself.
    pub header_checksum: u32,
}

impl ImageHeader {
    /// Read a header from a reader positioned at the start of the file.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let err = |what: &'static str| move |e| Error::Parse(format!("{what}: {e}"));

        let header_code = reader.read_u32::<BigEndian>().map_err(err("header code"))?;
        let intended_device = reader
            .read_u32::<BigEndian>()
            .map_err(err("intended device"))?;
        let contained_version = reader
            .read_f32::<BigEndian>()
            .map_err(err("contained version"))?;
        let required_upgrader_version = reader
            .read_f32::<BigEndian>()
            .map_err(err("required upgrader version"))?;
        let image_number = reader.read_u16::<BigEndian>().map_err(err("image number"))?;
        let num_images = reader.read_u16::<BigEndian>().map_err(err("image count"))?;
        let start_of_next_image = reader
            .read_u32::<BigEndian>()
            .map_err(err("next image offset"))?;
        let length_of_image = reader.read_u32::<BigEndian>().map_err(err("image length"))?;
        let image_offset = reader.read_u32::<BigEndian>().map_err(err("image offset"))?;
        let sha_byte_count = reader
            .read_u32::<BigEndian>()
            .map_err(err("SHA byte count"))?;

        // Reserved bytes 36..72
        let mut reserved = [0u8; 36];
        reader.read_exact(&mut reserved).map_err(err("reserved"))?;

        let options = reader.read_u32::<BigEndian>().map_err(err("options"))?;

        let mut encrypted_sha = [0u8; SHA_LEN];
        reader
            .read_exact(&mut encrypted_sha)
            .map_err(err("encrypted SHA"))?;
        let mut unencrypted_sha = [0u8; SHA_LEN];
        reader
            .read_exact(&mut unencrypted_sha)
            .map_err(err("unencrypted SHA"))?;

        // Reserved bytes 116..124
        let mut tail = [0u8; 8];
        reader.read_exact(&mut tail).map_err(err("reserved tail"))?;

        let header_checksum = reader
            .read_u32::<BigEndian>()
            .map_err(err("header checksum"))?;

        Ok(Self {
            header_code,
            intended_device,
            contained_version,
            required_upgrader_version,
            image_number,
            num_images,
            start_of_next_image,
            length_of_image,
            image_offset,
            sha_byte_count,
            options,
            encrypted_sha,
            unencrypted_sha,
            header_checksum,
        })
    }

    /// Contained version truncated to four decimal places.
    pub fn contained_version_fixed(&self) -> f64 {
        round4(f64::from(self.contained_version))
    }
}

/// Round a version to four-decimal fixed point.
pub fn round4(version: f64) -> f64 {
    (version * 10000.0).round() / 10000.0
}

/// Whether two versions agree at four-decimal precision.
pub fn versions_match(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-4
}

/// Extract the declared version from an image filename.
///
/// The version is the integer segment between the first and second
/// underscore, divided by 10000 (`T7firmware_010290_2019.bin` → 1.0290).
pub fn version_from_filename(name: &str) -> Option<f64> {
    let mut parts = name.split('_');
    parts.next()?;
    let segment = parts.next()?;
    let raw: u32 = segment.parse().ok()?;
    Some(round4(f64::from(raw) / 10000.0))
}

/// A loaded firmware image.
pub struct FwImage {
    header: ImageHeader,
    data: Vec<u8>,
    firmware_version: f64,
    source_name: String,
}

impl FwImage {
    /// Load an image from a filesystem path or an `http(s)://` URL.
    pub fn load(source: &str) -> Result<Self> {
        if source.starts_with("http://") || source.starts_with("https://") {
            Self::from_url(source)
        } else {
            Self::from_file(source)
        }
    }

    /// Load an image from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware image from {}", path.display());

        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_bytes(&name, data)
    }

    /// Fetch an image over HTTP(S). The body is read fully into memory.
    pub fn from_url(url: &str) -> Result<Self> {
        debug!("Fetching firmware image from {url}");

        let response = ureq::get(url)
            .call()
            .map_err(|e| Error::Fetch(e.to_string()))?;

        let mut data = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut data)
            .map_err(|e| Error::Fetch(format!("reading response body: {e}")))?;

        let name = url
            .rsplit('/')
            .next()
            .and_then(|s| s.split('?').next())
            .unwrap_or_default()
            .to_string();
        Self::from_bytes(&name, data)
    }

    /// Parse an image from raw bytes.
    ///
    /// `name` is the source filename, used for the declared version and for
    /// log messages. When the filename carries no parsable version segment,
    /// the header's contained version stands in.
    pub fn from_bytes(name: &str, data: Vec<u8>) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidImage(format!(
                "file is {} bytes, header alone is {HEADER_SIZE}",
                data.len()
            )));
        }
        if (data.len() - HEADER_SIZE) % 4 != 0 {
            return Err(Error::InvalidImage(format!(
                "payload length {} is not a multiple of 4",
                data.len() - HEADER_SIZE
            )));
        }

        let header = ImageHeader::read_from(&mut &data[..HEADER_SIZE])?;
        let firmware_version =
            version_from_filename(name).unwrap_or_else(|| header.contained_version_fixed());

        debug!(
            "Image {}: device type {}, contained version {:.4}, {} payload bytes",
            name,
            header.intended_device,
            header.contained_version,
            data.len() - HEADER_SIZE
        );

        Ok(Self {
            header,
            data,
            firmware_version,
            source_name: name.to_string(),
        })
    }

    /// Parsed header.
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// The 128 header bytes as stored in the file.
    pub fn header_bytes(&self) -> &[u8] {
        &self.data[..HEADER_SIZE]
    }

    /// The image payload (bytes after the header).
    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_SIZE..]
    }

    /// Version this upgrade declares, four-decimal fixed point.
    pub fn firmware_version(&self) -> f64 {
        self.firmware_version
    }

    /// Source filename this image was loaded from.
    pub fn source_name(&self) -> &str {
        &self.source_name
    }
}

impl std::fmt::Debug for FwImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FwImage")
            .field("source_name", &self.source_name)
            .field("header", &self.header)
            .field("firmware_version", &self.firmware_version)
            .field("data_len", &self.data.len())
            .finish()
    }
}
