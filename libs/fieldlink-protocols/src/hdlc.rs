//! HDLC-like link framing for sign controllers
//!
//! `[0x7E][address?][0x13][0xC1][payload][fcs lo][fcs hi][0x7E]` with byte
//! stuffing: 0x7E and 0x7D inside a frame become `0x7D, byte ^ 0x20`. The
//! frame check is CRC-16 over the unstuffed bytes between the flags.
//!
//! Point-to-point links carry no address and no control/protocol header.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use fieldlink_core::{CommError, LinkCodec, Result};

use crate::checksum;

pub const FLAG: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

/// Unnumbered information
pub const CONTROL_UI: u8 = 0x13;
/// Initial protocol identifier for SNMP over the link
pub const IPI_SNMP: u8 = 0xC1;

/// Largest unstuffed frame (header, payload and FCS)
pub const MAX_FRAME: usize = 1024;

/// Highest address expressible in two address octets
pub const MAX_ADDRESS: u16 = 0x3FFF;

/// HDLC framer
#[derive(Debug, Clone, Default)]
pub struct HdlcCodec {
    header: Vec<u8>,
}

impl HdlcCodec {
    /// Point-to-point framer
    pub fn new() -> Self {
        Self::default()
    }

    /// Multipoint framer for one station address
    pub fn with_address(address: u16) -> Result<Self> {
        let mut header = encode_address(address)?;
        header.push(CONTROL_UI);
        header.push(IPI_SNMP);
        Ok(Self { header })
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Unstuff, check and strip one frame body
    fn open(&self, body: &[u8]) -> Result<BytesMut> {
        let logical = unstuff(body)?;
        if logical.len() > MAX_FRAME {
            return Err(CommError::length(format!(
                "frame of {} bytes exceeds {}",
                logical.len(),
                MAX_FRAME
            )));
        }
        if logical.len() < self.header.len() + 2 {
            return Err(CommError::length(format!("runt frame of {} bytes", logical.len())));
        }
        let split = logical.len() - 2;
        let received = u16::from_le_bytes([logical[split], logical[split + 1]]);
        checksum::verify(
            u32::from(checksum::crc16(&logical[..split])),
            u32::from(received),
        )?;
        if !logical.starts_with(&self.header) {
            return Err(CommError::sentinel(format!(
                "header {:02X?}, expected {:02X?}",
                &logical[..self.header.len()],
                self.header
            )));
        }
        let mut logical = logical;
        logical.truncate(split);
        logical.advance(self.header.len());
        Ok(logical)
    }
}

/// Address octets; the low bit marks the last one
pub fn encode_address(address: u16) -> Result<Vec<u8>> {
    if address > MAX_ADDRESS {
        return Err(CommError::range(format!("HDLC address {address}")));
    }
    if address < 0x80 {
        Ok(vec![((address << 1) | 1) as u8])
    } else {
        Ok(vec![
            ((address >> 7) << 1) as u8,
            (((address & 0x7F) << 1) | 1) as u8,
        ])
    }
}

fn stuff(data: &[u8], out: &mut BytesMut) {
    for &b in data {
        if b == FLAG || b == ESCAPE {
            out.put_u8(ESCAPE);
            out.put_u8(b ^ ESCAPE_XOR);
        } else {
            out.put_u8(b);
        }
    }
}

fn unstuff(body: &[u8]) -> Result<BytesMut> {
    let mut out = BytesMut::with_capacity(body.len());
    let mut iter = body.iter();
    while let Some(&b) = iter.next() {
        if b == ESCAPE {
            match iter.next() {
                Some(&next) => out.put_u8(next ^ ESCAPE_XOR),
                None => return Err(CommError::escape("escape at end of frame")),
            }
        } else {
            out.put_u8(b);
        }
    }
    Ok(out)
}

impl Decoder for HdlcCodec {
    type Item = BytesMut;
    type Error = CommError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        loop {
            // Resynchronize on the next flag
            match src.iter().position(|b| *b == FLAG) {
                Some(0) => {},
                Some(skip) => {
                    debug!("Discarding {} bytes of line noise", skip);
                    src.advance(skip);
                },
                None => {
                    if !src.is_empty() {
                        debug!("Discarding {} bytes of line noise", src.len());
                        src.clear();
                    }
                    return Ok(None);
                },
            }

            let Some(end) = src[1..].iter().position(|b| *b == FLAG).map(|p| p + 1) else {
                // Worst case every byte stuffed, plus both flags
                if src.len() > 2 * MAX_FRAME + 2 {
                    let dropped = src.len();
                    src.clear();
                    return Err(CommError::length(format!(
                        "no closing flag within {dropped} bytes"
                    )));
                }
                return Ok(None);
            };

            // Back-to-back flags: the closing flag may open the next frame
            if end == 1 {
                src.advance(1);
                continue;
            }

            let frame = src.split_to(end);
            trace!("HDLC frame of {} stuffed bytes", frame.len() - 1);
            return self.open(&frame[1..]).map(Some);
        }
    }
}

impl<'a> Encoder<&'a [u8]> for HdlcCodec {
    type Error = CommError;

    fn encode(&mut self, payload: &'a [u8], dst: &mut BytesMut) -> Result<()> {
        let logical_len = self.header.len() + payload.len() + 2;
        if logical_len > MAX_FRAME {
            return Err(CommError::length(format!(
                "payload of {} bytes exceeds frame limit",
                payload.len()
            )));
        }
        let mut logical = BytesMut::with_capacity(logical_len);
        logical.extend_from_slice(&self.header);
        logical.extend_from_slice(payload);
        let fcs = checksum::crc16(&logical);
        logical.put_u16_le(fcs);

        dst.reserve(logical.len() * 2 + 2);
        dst.put_u8(FLAG);
        stuff(&logical, dst);
        dst.put_u8(FLAG);
        Ok(())
    }
}

impl LinkCodec for HdlcCodec {}
