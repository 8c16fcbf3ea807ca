//! Scripted in-memory device/backend pair for pipeline tests.
//!
//! The simulated device models the register surface the pipeline touches:
//! the external-flash key/erase/pointer/data registers (with key
//! enforcement and erased-sentinel semantics), the reboot request register
//! and the firmware version register. The backend scripts re-enumeration:
//! after the reboot request, the device reappears after a configurable
//! number of polls, or never.

use byteorder::{BigEndian, WriteBytesExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use t7flash::device::registers;
use t7flash::progress::ProgressSink;
use t7flash::{Backend, ConnectionType, Device, DeviceFamily, Error, Result, RwOp};

/// Shared state behind every handle the backend hands out.
#[derive(Debug)]
pub struct SimState {
    pub serial: u32,
    /// Version reported while the pre-upgrade firmware runs.
    pub firmware_version: f32,
    /// Version the device reports once it boots the new image.
    pub version_after_reboot: f32,
    pub flash: HashMap<u32, u32>,
    pub key: u32,
    pub write_ptr: u32,
    pub read_ptr: u32,
    pub rebooted: bool,
    pub closes: usize,
    pub enumerate_polls: usize,
    /// Polls after the reboot before the device reappears; `None` = never.
    pub reappear_after_polls: Option<usize>,
    /// Fail the nth (zero-based) data-write chunk with a transport error.
    pub fail_write_chunk: Option<usize>,
    pub write_chunks_seen: usize,
}

impl SimState {
    pub fn flash_word(&self, addr: u32) -> u32 {
        *self.flash.get(&addr).unwrap_or(&0xFFFF_FFFF)
    }
}

pub type SharedState = Arc<Mutex<SimState>>;

pub fn sim_state(serial: u32, version_after_reboot: f32) -> SharedState {
    Arc::new(Mutex::new(SimState {
        serial,
        firmware_version: 1.0250,
        version_after_reboot,
        flash: HashMap::new(),
        key: 0,
        write_ptr: 0,
        read_ptr: 0,
        rebooted: false,
        closes: 0,
        enumerate_polls: 0,
        reappear_after_polls: Some(2),
        fail_write_chunk: None,
        write_chunks_seen: 0,
    }))
}

/// One open handle onto the simulated device.
#[derive(Debug)]
pub struct SimDevice {
    state: SharedState,
    serial: u32,
    closed: bool,
}

impl SimDevice {
    pub fn open(state: &SharedState) -> Self {
        let serial = state.lock().unwrap().serial;
        Self {
            state: Arc::clone(state),
            serial,
            closed: false,
        }
    }

    fn region_key(addr: u32) -> Option<u32> {
        for region in [
            &registers::IMAGE_REGION,
            &registers::IMAGE_INFO_REGION,
        ] {
            if addr >= region.base && addr < region.base + region.len_bytes() {
                return Some(region.key);
            }
        }
        None
    }
}

impl Device for SimDevice {
    fn read_register(&mut self, addr: u16) -> Result<u32> {
        Ok(self.rw_many(&[RwOp::Read { addr }])?[0])
    }

    fn write_register(&mut self, addr: u16, value: u32) -> Result<()> {
        self.rw_many(&[RwOp::Write { addr, value }])?;
        Ok(())
    }

    fn rw_many(&mut self, ops: &[RwOp]) -> Result<Vec<u32>> {
        if self.closed {
            return Err(Error::Protocol("handle is closed".into()));
        }
        let mut state = self.state.lock().unwrap();

        // Fault injection keyed on data-write chunks
        if ops
            .iter()
            .any(|op| matches!(op, RwOp::Write { addr, .. } if *addr == registers::EF_WRITE))
        {
            let chunk = state.write_chunks_seen;
            state.write_chunks_seen += 1;
            if state.fail_write_chunk == Some(chunk) {
                return Err(Error::Timeout("injected transport fault".into()));
            }
        }

        let mut values = Vec::new();
        for op in ops {
            match *op {
                RwOp::Write { addr, value } => match addr {
                    registers::EF_KEY => state.key = value,
                    registers::EF_ERASE => {
                        match Self::region_key(value) {
                            Some(key) if key == state.key => {},
                            _ => {
                                return Err(Error::Protocol(format!(
                                    "erase of {value:#010X} rejected"
                                )))
                            },
                        }
                        for word in (value..value + registers::FLASH_PAGE_SIZE).step_by(4) {
                            state.flash.remove(&word);
                        }
                    },
                    registers::EF_WRITE_POINTER => state.write_ptr = value,
                    registers::EF_READ_POINTER => state.read_ptr = value,
                    registers::EF_WRITE => {
                        match Self::region_key(state.write_ptr) {
                            Some(key) if key == state.key => {},
                            _ => {
                                return Err(Error::Protocol(format!(
                                    "write at {:#010X} rejected",
                                    state.write_ptr
                                )))
                            },
                        }
                        let ptr = state.write_ptr;
                        state.flash.insert(ptr, value);
                        state.write_ptr += 4;
                    },
                    registers::SYSTEM_REBOOT => {
                        if value == registers::REBOOT_UPGRADE_MAGIC {
                            state.rebooted = true;
                            state.enumerate_polls = 0;
                            state.firmware_version = state.version_after_reboot;
                        }
                    },
                    _ => {},
                },
                RwOp::Read { addr } => match addr {
                    registers::EF_READ => {
                        let ptr = state.read_ptr;
                        values.push(state.flash_word(ptr));
                        state.read_ptr += 4;
                    },
                    registers::FIRMWARE_VERSION => {
                        values.push(state.firmware_version.to_bits());
                    },
                    registers::SERIAL_NUMBER => values.push(state.serial),
                    _ => values.push(0),
                },
            }
        }
        Ok(values)
    }

    fn serial_number(&self) -> u32 {
        self.serial
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

/// Backend scripting the post-reboot enumeration behaviour.
pub struct SimBackend {
    state: SharedState,
}

impl SimBackend {
    pub fn new(state: &SharedState) -> Self {
        Self {
            state: Arc::clone(state),
        }
    }

    fn visible(&self) -> bool {
        let state = self.state.lock().unwrap();
        if !state.rebooted {
            return true;
        }
        match state.reappear_after_polls {
            Some(n) => state.enumerate_polls >= n,
            None => false,
        }
    }
}

impl Backend for SimBackend {
    fn enumerate(&self, _family: DeviceFamily, _connection: ConnectionType) -> Result<Vec<u32>> {
        {
            let mut state = self.state.lock().unwrap();
            if state.rebooted {
                state.enumerate_polls += 1;
            }
        }
        if self.visible() {
            Ok(vec![self.state.lock().unwrap().serial])
        } else {
            Ok(Vec::new())
        }
    }

    fn open(
        &self,
        _family: DeviceFamily,
        _connection: ConnectionType,
        serial: u32,
    ) -> Result<Box<dyn Device>> {
        if !self.visible() || self.state.lock().unwrap().serial != serial {
            return Err(Error::DeviceNotFound);
        }
        Ok(Box::new(SimDevice::open(&self.state)))
    }
}

/// Progress sink recording every report.
#[derive(Default)]
pub struct RecordingSink {
    pub updates: Vec<f64>,
    pub statuses: Vec<String>,
}

impl ProgressSink for RecordingSink {
    fn update(&mut self, percent: f64, _done: bool) {
        self.updates.push(percent);
    }

    fn status(&mut self, text: &str, _done: bool) {
        self.statuses.push(text.to_string());
    }
}

/// Build a firmware image file: 128-byte header + payload.
pub fn build_image(
    header_code: u32,
    intended_device: u32,
    contained_version: f32,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + payload.len());
    buf.write_u32::<BigEndian>(header_code).unwrap();
    buf.write_u32::<BigEndian>(intended_device).unwrap();
    buf.write_f32::<BigEndian>(contained_version).unwrap();
    buf.write_f32::<BigEndian>(1.0).unwrap();
    buf.write_u16::<BigEndian>(0).unwrap();
    buf.write_u16::<BigEndian>(1).unwrap();
    buf.write_u32::<BigEndian>(0).unwrap();
    buf.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    buf.write_u32::<BigEndian>(128).unwrap();
    buf.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    buf.resize(128, 0);
    buf.extend_from_slice(payload);
    buf
}
