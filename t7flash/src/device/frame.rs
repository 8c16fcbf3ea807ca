//! Register feedback frame codec.
//!
//! The T7 speaks a register protocol framed with an MBAP-style header.
//! Compound transactions use the feedback function, which carries a vector
//! of mixed read/write operations executed in order on the device:
//!
//! ```text
//! +--------+----------+--------+------+------+---------------------+
//! | TxnId  | Protocol | Length | Unit | Func |     Operations      |
//! +--------+----------+--------+------+------+---------------------+
//! | 2 B    | 2 B = 0  | 2 B    | 1 B  | 0x4C | variable            |
//! +--------+----------+--------+------+------+---------------------+
//! ```
//!
//! Each operation is `[dir][addr][count]` followed, for writes, by the
//! 32-bit value. All integers are big-endian. The response echoes the
//! function byte and concatenates the values of the read operations; a
//! device exception sets the high bit of the function byte.

use crate::device::RwOp;
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

/// Protocol identifier carried in every frame header.
pub const PROTOCOL_ID: u16 = 0;

/// Unit identifier; the T7 exposes a single unit.
pub const UNIT_ID: u8 = 1;

/// Feedback (compound read/write) function code.
pub const FUNC_FEEDBACK: u8 = 0x4C;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 7;

/// Direction byte for a read operation.
const DIR_READ: u8 = 0x00;

/// Direction byte for a write operation.
const DIR_WRITE: u8 = 0x01;

/// Registers per 32-bit value on the wire.
const REGS_PER_WORD: u8 = 2;

/// A feedback request frame.
#[derive(Debug)]
pub struct FeedbackRequest<'a> {
    /// Transaction identifier, echoed by the response.
    pub txn: u16,
    /// Operations to execute, in order.
    pub ops: &'a [RwOp],
}

impl FeedbackRequest<'_> {
    /// Build the complete frame.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.ops.len() * 8);
        pdu.push(FUNC_FEEDBACK);

        for op in self.ops {
            match *op {
                RwOp::Read { addr } => {
                    pdu.push(DIR_READ);
                    pdu.write_u16::<BigEndian>(addr).unwrap();
                    pdu.push(REGS_PER_WORD);
                },
                RwOp::Write { addr, value } => {
                    pdu.push(DIR_WRITE);
                    pdu.write_u16::<BigEndian>(addr).unwrap();
                    pdu.push(REGS_PER_WORD);
                    pdu.write_u32::<BigEndian>(value).unwrap();
                },
            }
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + pdu.len());
        buf.write_u16::<BigEndian>(self.txn).unwrap();
        buf.write_u16::<BigEndian>(PROTOCOL_ID).unwrap();
        // Length covers unit id + PDU - safe cast, frames are < 64 KB
        buf.write_u16::<BigEndian>((pdu.len() + 1) as u16).unwrap();
        buf.push(UNIT_ID);
        buf.extend_from_slice(&pdu);

        buf
    }
}

/// A parsed feedback response frame.
#[derive(Debug)]
pub struct FeedbackResponse {
    /// Transaction identifier echoed from the request.
    pub txn: u16,
    /// Values of the read operations, in request order.
    pub values: Vec<u32>,
}

impl FeedbackResponse {
    /// Parse a complete response frame.
    ///
    /// `expected_reads` is the number of read operations in the matching
    /// request; the response payload must carry exactly that many words.
    pub fn parse(frame: &[u8], expected_reads: usize) -> Result<Self> {
        if frame.len() < HEADER_LEN + 1 {
            return Err(Error::Protocol(format!(
                "response frame too short: {} bytes",
                frame.len()
            )));
        }

        let txn = BigEndian::read_u16(&frame[0..2]);
        let protocol = BigEndian::read_u16(&frame[2..4]);
        if protocol != PROTOCOL_ID {
            return Err(Error::Protocol(format!(
                "unexpected protocol id {protocol:#06X}"
            )));
        }

        let length = BigEndian::read_u16(&frame[4..6]) as usize;
        if frame.len() != HEADER_LEN - 1 + length {
            return Err(Error::Protocol(format!(
                "frame length field {} does not match frame size {}",
                length,
                frame.len()
            )));
        }

        let func = frame[7];
        if func == FUNC_FEEDBACK | 0x80 {
            let code = frame.get(8).copied().unwrap_or(0);
            return Err(Error::Protocol(format!(
                "device exception {code:#04X}"
            )));
        }
        if func != FUNC_FEEDBACK {
            return Err(Error::Protocol(format!(
                "unexpected function code {func:#04X}"
            )));
        }

        let payload = &frame[8..];
        if payload.len() != expected_reads * 4 {
            return Err(Error::Protocol(format!(
                "expected {} read words, response carries {} bytes",
                expected_reads,
                payload.len()
            )));
        }

        let values = payload
            .chunks_exact(4)
            .map(BigEndian::read_u32)
            .collect();

        Ok(Self { txn, values })
    }
}

/// Build a response frame for the given read values.
///
/// Used by loopback servers in tests; the device side of the protocol is
/// otherwise out of scope.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
#[allow(clippy::cast_possible_truncation)]
pub fn build_response(txn: u16, values: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 1 + values.len() * 4);
    buf.write_u16::<BigEndian>(txn).unwrap();
    buf.write_u16::<BigEndian>(PROTOCOL_ID).unwrap();
    buf.write_u16::<BigEndian>((2 + values.len() * 4) as u16).unwrap();
    buf.push(UNIT_ID);
    buf.push(FUNC_FEEDBACK);
    for v in values {
        buf.write_u32::<BigEndian>(*v).unwrap();
    }
    buf
}
