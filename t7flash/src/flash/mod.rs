//! External-flash I/O: the chunked read/write primitive, region façades
//! and post-operation verification.
//!
//! All data movement goes through [`flash_op`]. Read and write differ only
//! in the direction of the data operations and whether a key and payload
//! are supplied; unifying them keeps the chunking behaviour identical,
//! which matters because the device accepts bounded-size compound frames
//! only.
//!
//! Erasing is a separate register protocol: each page erase is a key write
//! followed by an address write to the erase register, not a streaming
//! block.

use crate::cancel::CancelToken;
use crate::device::registers::{
    self, FlashRegion, ERASED_WORD, IMAGE_INFO_REGION, IMAGE_REGION,
};
use crate::device::{Device, RwOp};
use crate::error::{Error, FlashStage, Result};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

/// Direction of a [`flash_op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashDirection {
    /// Read words out of flash.
    Read,
    /// Write words into flash.
    Write,
}

/// Parameters of one flash operation.
#[derive(Debug, Clone)]
pub struct FlashOpParams {
    /// Read or write.
    pub direction: FlashDirection,
    /// Start address in flash address space.
    pub start_address: u32,
    /// Total length in 32-bit words.
    pub length_words: usize,
    /// Words per compound frame. Clamped to the device's frame limit.
    pub block_words: usize,
    /// Flash pointer register for this direction.
    pub pointer_register: u16,
    /// Flash data register for this direction.
    pub data_register: u16,
    /// Permission key, required for writes into protected regions.
    pub key: Option<u32>,
    /// Stage attributed to failures.
    pub stage: FlashStage,
}

/// Move `length_words` words between host and flash in bounded chunks.
///
/// Each chunk is one compound frame: pointer write, optional key write,
/// then up to `block_words` data operations. The pointer advances by
/// `block × 4` bytes per chunk and the final partial chunk carries the
/// remainder. Chunks are strictly in-order; the next frame is issued only
/// after the previous one completed.
///
/// For writes, `data` must hold exactly `length_words × 4` bytes. For
/// reads the returned buffer holds the words big-endian.
///
/// `progress` is called after every chunk with `(words_done, words_total)`.
/// A chunk failure aborts with [`Error::FlashIo`] carrying the chunk index;
/// there is no automatic retry, since a partial write leaves the device
/// inconsistent and recovery is re-running the full upgrade.
pub fn flash_op(
    device: &mut dyn Device,
    params: &FlashOpParams,
    data: Option<&[u8]>,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<Option<Vec<u8>>> {
    let total = params.length_words;

    let source = match params.direction {
        FlashDirection::Write => {
            let data = data.ok_or_else(|| {
                Error::InvalidImage("flash write without a source buffer".into())
            })?;
            if data.len() % 4 != 0 {
                return Err(Error::InvalidImage(format!(
                    "write buffer of {} bytes has a trailing partial word",
                    data.len()
                )));
            }
            if data.len() / 4 != total {
                return Err(Error::InvalidImage(format!(
                    "write buffer holds {} words, operation covers {}",
                    data.len() / 4,
                    total
                )));
            }
            Some(data)
        },
        FlashDirection::Read => None,
    };

    let block = params.block_words.min(device.max_block_words()).max(1);
    let mut out = match params.direction {
        FlashDirection::Read => Some(Vec::with_capacity(total * 4)),
        FlashDirection::Write => None,
    };

    debug!(
        "{}: {} words at {:#010X}, {} per chunk",
        params.stage, total, params.start_address, block
    );

    let mut done = 0usize;
    let mut chunk = 0usize;
    while done < total {
        cancel.check()?;

        let words = block.min(total - done);
        #[allow(clippy::cast_possible_truncation)]
        let address = params.start_address + (done as u32) * 4;

        let mut ops = Vec::with_capacity(2 + words);
        ops.push(RwOp::Write {
            addr: params.pointer_register,
            value: address,
        });
        if let Some(key) = params.key {
            ops.push(RwOp::Write {
                addr: registers::EF_KEY,
                value: key,
            });
        }
        for i in 0..words {
            match params.direction {
                FlashDirection::Write => {
                    #[allow(clippy::unwrap_used)] // length checked above
                    let word = BigEndian::read_u32(&source.unwrap()[(done + i) * 4..]);
                    ops.push(RwOp::Write {
                        addr: params.data_register,
                        value: word,
                    });
                },
                FlashDirection::Read => {
                    ops.push(RwOp::Read {
                        addr: params.data_register,
                    });
                },
            }
        }

        trace!("chunk {chunk}: {words} words at {address:#010X}");
        let values = device.rw_many(&ops).map_err(|e| Error::FlashIo {
            stage: params.stage,
            chunk,
            source: Box::new(e),
        })?;

        if let Some(out) = out.as_mut() {
            if values.len() != words {
                return Err(Error::FlashIo {
                    stage: params.stage,
                    chunk,
                    source: Box::new(Error::Protocol(format!(
                        "chunk returned {} words, expected {words}",
                        values.len()
                    ))),
                });
            }
            for value in values {
                out.extend_from_slice(&value.to_be_bytes());
            }
        }

        done += words;
        chunk += 1;
        progress(done, total);
    }

    Ok(out)
}

/// Erase every page of a region, sequentially.
fn erase_region(
    device: &mut dyn Device,
    region: &FlashRegion,
    stage: FlashStage,
    cancel: &CancelToken,
) -> Result<()> {
    debug!("Erasing {} region ({} pages)", region.name, region.pages);

    for page in 0..region.pages {
        cancel.check()?;
        let address = region.page_address(page);
        let ops = [
            RwOp::Write {
                addr: registers::EF_KEY,
                value: region.key,
            },
            RwOp::Write {
                addr: registers::EF_ERASE,
                value: address,
            },
        ];
        device.rw_many(&ops).map_err(|e| Error::FlashIo {
            stage,
            chunk: page as usize,
            source: Box::new(e),
        })?;
    }

    Ok(())
}

/// Erase the firmware image region.
pub fn erase_image(device: &mut dyn Device, cancel: &CancelToken) -> Result<()> {
    erase_region(device, &IMAGE_REGION, FlashStage::EraseImage, cancel)
}

/// Erase the image-info region.
pub fn erase_image_info(device: &mut dyn Device, cancel: &CancelToken) -> Result<()> {
    erase_region(
        device,
        &IMAGE_INFO_REGION,
        FlashStage::EraseImageInfo,
        cancel,
    )
}

/// Write the firmware payload into the image region.
pub fn write_image(
    device: &mut dyn Device,
    payload: &[u8],
    cancel: &CancelToken,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<()> {
    if payload.len() > IMAGE_REGION.len_bytes() as usize {
        return Err(Error::InvalidImage(format!(
            "payload of {} bytes exceeds the {}-byte image region",
            payload.len(),
            IMAGE_REGION.len_bytes()
        )));
    }
    let params = FlashOpParams {
        direction: FlashDirection::Write,
        start_address: IMAGE_REGION.base,
        length_words: payload.len() / 4,
        block_words: device.max_block_words(),
        pointer_register: registers::EF_WRITE_POINTER,
        data_register: registers::EF_WRITE,
        key: Some(IMAGE_REGION.key),
        stage: FlashStage::WriteImage,
    };
    flash_op(device, &params, Some(payload), cancel, progress)?;
    Ok(())
}

/// Write the 128-byte image header into the image-info region.
pub fn write_image_info(
    device: &mut dyn Device,
    header: &[u8],
    cancel: &CancelToken,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<()> {
    let params = FlashOpParams {
        direction: FlashDirection::Write,
        start_address: IMAGE_INFO_REGION.base,
        length_words: header.len() / 4,
        block_words: device.max_block_words(),
        pointer_register: registers::EF_WRITE_POINTER,
        data_register: registers::EF_WRITE,
        key: Some(IMAGE_INFO_REGION.key),
        stage: FlashStage::WriteImageInfo,
    };
    flash_op(device, &params, Some(header), cancel, progress)?;
    Ok(())
}

/// Read bytes back from the start of the image region.
pub fn read_image(
    device: &mut dyn Device,
    len_bytes: usize,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<Vec<u8>> {
    read_region(device, &IMAGE_REGION, len_bytes, FlashStage::ReadImage, cancel, progress)
}

/// Read bytes back from the start of the image-info region.
pub fn read_image_info(
    device: &mut dyn Device,
    len_bytes: usize,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<Vec<u8>> {
    read_region(
        device,
        &IMAGE_INFO_REGION,
        len_bytes,
        FlashStage::ReadImageInfo,
        cancel,
        progress,
    )
}

fn read_region(
    device: &mut dyn Device,
    region: &FlashRegion,
    len_bytes: usize,
    stage: FlashStage,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<Vec<u8>> {
    if len_bytes % 4 != 0 {
        return Err(Error::InvalidImage(format!(
            "read length {len_bytes} is not a multiple of 4"
        )));
    }
    let params = FlashOpParams {
        direction: FlashDirection::Read,
        start_address: region.base,
        length_words: len_bytes / 4,
        block_words: device.max_block_words(),
        pointer_register: registers::EF_READ_POINTER,
        data_register: registers::EF_READ,
        key: None,
        stage,
    };
    flash_op(device, &params, None, cancel, progress)?
        .ok_or_else(|| Error::Protocol("flash read produced no buffer".into()))
}

/// Verify both regions read back fully erased.
///
/// Every 32-bit word must equal the erased sentinel; the first word that
/// does not fails with [`Error::EraseIncomplete`].
pub fn check_erase(device: &mut dyn Device, cancel: &CancelToken) -> Result<()> {
    for region in [&IMAGE_INFO_REGION, &IMAGE_REGION] {
        debug!("Verifying erase of {} region", region.name);
        let bytes = read_region(
            device,
            region,
            region.len_bytes() as usize,
            region_read_stage(region),
            cancel,
            &mut |_, _| {},
        )?;
        for (i, word) in bytes.chunks_exact(4).enumerate() {
            let value = BigEndian::read_u32(word);
            if value != ERASED_WORD {
                #[allow(clippy::cast_possible_truncation)]
                return Err(Error::EraseIncomplete {
                    offset: region.base + (i as u32) * 4,
                    got: value,
                });
            }
        }
    }
    Ok(())
}

fn region_read_stage(region: &FlashRegion) -> FlashStage {
    if region.base == IMAGE_REGION.base {
        FlashStage::ReadImage
    } else {
        FlashStage::ReadImageInfo
    }
}

/// Compare the image region byte-for-byte against the written payload.
///
/// Fails with [`Error::WriteMismatch`] at the first divergence.
pub fn check_image(
    device: &mut dyn Device,
    expected: &[u8],
    cancel: &CancelToken,
) -> Result<()> {
    debug!("Verifying {} written bytes", expected.len());
    let actual = read_image(device, expected.len(), cancel, &mut |_, _| {})?;
    for (offset, (a, b)) in actual.iter().zip(expected.iter()).enumerate() {
        if a != b {
            return Err(Error::WriteMismatch { offset });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory register-level flash simulation.
    #[derive(Debug)]
    struct MockFlashDevice {
        mem: HashMap<u32, u32>,
        key: u32,
        write_ptr: u32,
        read_ptr: u32,
        calls: usize,
        fail_on_call: Option<usize>,
        block_words: usize,
    }

    impl MockFlashDevice {
        fn new() -> Self {
            Self {
                mem: HashMap::new(),
                key: 0,
                write_ptr: 0,
                read_ptr: 0,
                calls: 0,
                fail_on_call: None,
                block_words: 32,
            }
        }

        fn region_of(addr: u32) -> Option<&'static FlashRegion> {
            for region in [&IMAGE_REGION, &IMAGE_INFO_REGION] {
                if addr >= region.base && addr < region.base + region.len_bytes() {
                    return Some(region);
                }
            }
            None
        }

        fn check_key(&self, addr: u32) -> Result<()> {
            match Self::region_of(addr) {
                Some(region) if region.key == self.key => Ok(()),
                Some(region) => Err(Error::Protocol(format!(
                    "key {:#010X} does not unlock {}",
                    self.key, region.name
                ))),
                None => Err(Error::Protocol(format!(
                    "address {addr:#010X} outside any region"
                ))),
            }
        }
    }

    impl Device for MockFlashDevice {
        fn read_register(&mut self, addr: u16) -> Result<u32> {
            Ok(self.rw_many(&[RwOp::Read { addr }])?[0])
        }

        fn write_register(&mut self, addr: u16, value: u32) -> Result<()> {
            self.rw_many(&[RwOp::Write { addr, value }])?;
            Ok(())
        }

        fn rw_many(&mut self, ops: &[RwOp]) -> Result<Vec<u32>> {
            self.calls += 1;
            if self.fail_on_call == Some(self.calls) {
                return Err(Error::Timeout("injected fault".into()));
            }

            let mut values = Vec::new();
            for op in ops {
                match *op {
                    RwOp::Write { addr, value } => match addr {
                        registers::EF_KEY => self.key = value,
                        registers::EF_ERASE => {
                            self.check_key(value)?;
                            for word in (value..value + registers::FLASH_PAGE_SIZE).step_by(4) {
                                self.mem.remove(&word);
                            }
                        },
                        registers::EF_WRITE_POINTER => self.write_ptr = value,
                        registers::EF_READ_POINTER => self.read_ptr = value,
                        registers::EF_WRITE => {
                            self.check_key(self.write_ptr)?;
                            self.mem.insert(self.write_ptr, value);
                            self.write_ptr += 4;
                        },
                        _ => {},
                    },
                    RwOp::Read { addr } => match addr {
                        registers::EF_READ => {
                            values.push(*self.mem.get(&self.read_ptr).unwrap_or(&ERASED_WORD));
                            self.read_ptr += 4;
                        },
                        _ => values.push(0),
                    },
                }
            }
            Ok(values)
        }

        fn serial_number(&self) -> u32 {
            1
        }

        fn max_block_words(&self) -> usize {
            self.block_words
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn cancel() -> CancelToken {
        CancelToken::new()
    }

    #[test]
    fn test_write_chunk_count_and_final_pointer() {
        let mut device = MockFlashDevice::new();
        let payload: Vec<u8> = (0..400).map(|i| (i % 251) as u8).collect(); // 100 words
        let mut reports = Vec::new();

        write_image(&mut device, &payload, &cancel(), &mut |done, total| {
            reports.push((done, total));
        })
        .unwrap();

        // 100 words in blocks of 32: 32, 64, 96, 100
        assert_eq!(reports, vec![(32, 100), (64, 100), (96, 100), (100, 100)]);
        assert_eq!(device.calls, 4);
        assert_eq!(device.write_ptr, IMAGE_REGION.base + 400);
    }

    #[test]
    fn test_exact_multiple_emits_no_partial_chunk() {
        let mut device = MockFlashDevice::new();
        let payload = vec![0xABu8; 64 * 4]; // exactly two blocks
        let mut chunks = 0;

        write_image(&mut device, &payload, &cancel(), &mut |_, _| chunks += 1).unwrap();
        assert_eq!(chunks, 2);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut device = MockFlashDevice::new();
        let payload: Vec<u8> = (0..1024u32).flat_map(|i| i.to_be_bytes()).collect();

        write_image(&mut device, &payload, &cancel(), &mut |_, _| {}).unwrap();
        let back = read_image(&mut device, payload.len(), &cancel(), &mut |_, _| {}).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_write_rejects_partial_word() {
        let mut device = MockFlashDevice::new();
        let err = write_image(&mut device, &[1, 2, 3], &cancel(), &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
        assert_eq!(device.calls, 0);
    }

    #[test]
    fn test_write_rejects_oversized_payload() {
        let mut device = MockFlashDevice::new();
        let payload = vec![0u8; IMAGE_REGION.len_bytes() as usize + 4];
        let err = write_image(&mut device, &payload, &cancel(), &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[test]
    fn test_erase_then_check_erase_passes() {
        let mut device = MockFlashDevice::new();
        let payload = vec![0x55u8; 256];
        write_image(&mut device, &payload, &cancel(), &mut |_, _| {}).unwrap();
        write_image_info(&mut device, &[0xAAu8; 128], &cancel(), &mut |_, _| {}).unwrap();

        erase_image_info(&mut device, &cancel()).unwrap();
        erase_image(&mut device, &cancel()).unwrap();
        check_erase(&mut device, &cancel()).unwrap();
    }

    #[test]
    fn test_check_erase_reports_residual_word() {
        let mut device = MockFlashDevice::new();
        device.mem.insert(IMAGE_REGION.base + 8, 0x1234_5678);

        let err = check_erase(&mut device, &cancel()).unwrap_err();
        match err {
            Error::EraseIncomplete { offset, got } => {
                assert_eq!(offset, IMAGE_REGION.base + 8);
                assert_eq!(got, 0x1234_5678);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_mid_write_failure_carries_chunk_index() {
        let mut device = MockFlashDevice::new();
        device.fail_on_call = Some(18); // chunks are zero-indexed
        let payload = vec![0u8; 100 * 32 * 4]; // 100 full chunks

        let err = write_image(&mut device, &payload, &cancel(), &mut |_, _| {}).unwrap_err();
        match err {
            Error::FlashIo { stage, chunk, .. } => {
                assert_eq!(stage, FlashStage::WriteImage);
                assert_eq!(chunk, 17);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let mut device = MockFlashDevice::new();
        let params = FlashOpParams {
            direction: FlashDirection::Write,
            start_address: IMAGE_REGION.base,
            length_words: 1,
            block_words: 8,
            pointer_register: registers::EF_WRITE_POINTER,
            data_register: registers::EF_WRITE,
            key: Some(0xBAD_C0DE),
            stage: FlashStage::WriteImage,
        };
        let err = flash_op(&mut device, &params, Some(&[0u8; 4]), &cancel(), &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::FlashIo { chunk: 0, .. }));
    }

    #[test]
    fn test_check_image_detects_divergence() {
        let mut device = MockFlashDevice::new();
        let payload = vec![0x42u8; 64];
        write_image(&mut device, &payload, &cancel(), &mut |_, _| {}).unwrap();

        let mut tampered = payload.clone();
        tampered[10] ^= 0xFF;
        let err = check_image(&mut device, &tampered, &cancel()).unwrap_err();
        assert!(matches!(err, Error::WriteMismatch { offset: 10 }));

        check_image(&mut device, &payload, &cancel()).unwrap();
    }

    #[test]
    fn test_cancellation_between_chunks() {
        let mut device = MockFlashDevice::new();
        let token = CancelToken::new();
        token.cancel();

        let err =
            write_image(&mut device, &[0u8; 64], &token, &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(device.calls, 0);
    }
}
