//! Memory-mapped serial protocol (ramp meter controllers)
//!
//! Request: `[drop << 3 | category][len][payload][xor]`
//! Reply:   `[drop << 3 | status][len][payload][xor]`
//!
//! The XOR covers every byte before it. Drops are 5 bits (1-31).

use std::fmt;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

use fieldlink_core::{ByteCursor, CommError, ExchangeContext, FrameReader, Property, Result};

use crate::checksum;

/// Largest payload a controller accepts in one frame
pub const MAX_PAYLOAD: usize = 128;

/// Request category (low 3 bits of the first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Category {
    ShutUp = 0,
    Level1Restart = 1,
    SynchronizeClock = 2,
    QueryRecordCount = 3,
    SendNextRecord = 4,
    DeleteOldestRecord = 5,
    WriteMemory = 6,
    ReadMemory = 7,
}

/// Reply status (low 3 bits of the first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadMessage,
    BadPollChecksum,
    DownloadRequest,
    WriteProtect,
    MessageSize,
    NoData,
    NoRam,
}

impl Status {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => Status::Ok,
            1 => Status::BadMessage,
            2 => Status::BadPollChecksum,
            3 => Status::DownloadRequest,
            4 => Status::WriteProtect,
            5 => Status::MessageSize,
            6 => Status::NoData,
            _ => Status::NoRam,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "OK",
            Status::BadMessage => "BAD MESSAGE",
            Status::BadPollChecksum => "BAD POLL CHECKSUM",
            Status::DownloadRequest => "DOWNLOAD REQUEST",
            Status::WriteProtect => "WRITE PROTECT",
            Status::MessageSize => "MESSAGE SIZE",
            Status::NoData => "NO DATA",
            Status::NoRam => "NO RAM",
        };
        f.write_str(s)
    }
}

pub fn encode_request(drop: u16, category: Category, payload: &[u8], out: &mut BytesMut) -> Result<()> {
    if !(1..=31).contains(&drop) {
        return Err(CommError::range(format!("drop {drop}")));
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(CommError::length(format!("payload of {} bytes", payload.len())));
    }
    let start = out.len();
    out.put_u8(((drop as u8) << 3) | category as u8);
    out.put_u8(payload.len() as u8);
    out.extend_from_slice(payload);
    let chk = checksum::xor8(&out[start..]);
    out.put_u8(chk);
    Ok(())
}

/// Validate a complete reply frame and return its payload
///
/// A non-OK status is a controller error; the frame itself was fine. A
/// download request status asks for the controller's settings.
pub fn decode_reply(drop: u16, frame: &[u8]) -> Result<&[u8]> {
    let Some((&received, body)) = frame.split_last() else {
        return Err(CommError::length("empty reply"));
    };
    checksum::verify(u32::from(checksum::xor8(body)), u32::from(received))?;

    let mut cur = ByteCursor::new(body);
    let head = cur.u8()?;
    let len = cur.u8()? as usize;
    if len != cur.remaining() {
        return Err(CommError::length(format!(
            "header says {} bytes, frame holds {}",
            len,
            cur.remaining()
        )));
    }
    if u16::from(head >> 3) != drop {
        return Err(CommError::sentinel(format!(
            "reply from drop {}, expected {}",
            head >> 3,
            drop
        )));
    }
    match Status::from_bits(head) {
        Status::Ok => cur.take(len),
        Status::DownloadRequest => Err(CommError::download_request(format!("drop {drop}"))),
        status => Err(CommError::controller(status.to_string())),
    }
}

/// Read `[head][len][payload][xor]` off the link
pub async fn read_reply(rx: &mut FrameReader<'_>) -> Result<bytes::Bytes> {
    let len = rx.peek(2).await?[1] as usize;
    if len > MAX_PAYLOAD {
        return Err(CommError::length(format!("reply length {len}")));
    }
    rx.read_exact(len + 3).await
}

async fn exchange_ack(ctx: &ExchangeContext<'_>, rx: &mut FrameReader<'_>) -> Result<()> {
    let frame = read_reply(rx).await?;
    let payload = decode_reply(ctx.drop_address(), &frame)?;
    if !payload.is_empty() {
        return Err(CommError::length(format!(
            "ack with {} payload bytes",
            payload.len()
        )));
    }
    Ok(())
}

// ============================================================================
// Properties
// ============================================================================

/// A block of controller memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProperty {
    address: u16,
    len: usize,
    data: Vec<u8>,
}

impl MemoryProperty {
    /// Read `len` bytes at `address`
    pub fn read(address: u16, len: usize) -> Self {
        Self {
            address,
            len,
            data: Vec::new(),
        }
    }

    /// Write `data` at `address`
    pub fn write(address: u16, data: Vec<u8>) -> Self {
        Self {
            address,
            len: data.len(),
            data,
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Big-endian word at byte `offset` of the block
    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        ByteCursor::new(self.data.get(offset..).unwrap_or_default()).u16_be()
    }
}

impl fmt::Display for MemoryProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memory {:04X}+{}", self.address, self.len)
    }
}

#[async_trait]
impl Property for MemoryProperty {
    fn encode_query(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        if self.len > MAX_PAYLOAD || self.len == 0 {
            return Err(CommError::range(format!("read of {} bytes", self.len)));
        }
        let [hi, lo] = self.address.to_be_bytes();
        encode_request(ctx.drop_address(), Category::ReadMemory, &[hi, lo, self.len as u8], out)
    }

    async fn decode_query(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        let frame = read_reply(rx).await?;
        let payload = decode_reply(ctx.drop_address(), &frame)?;
        if payload.len() != self.len {
            return Err(CommError::length(format!(
                "read {} bytes, requested {}",
                payload.len(),
                self.len
            )));
        }
        self.data = payload.to_vec();
        Ok(())
    }

    fn encode_store(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        let mut payload = Vec::with_capacity(self.data.len() + 2);
        payload.extend_from_slice(&self.address.to_be_bytes());
        payload.extend_from_slice(&self.data);
        encode_request(ctx.drop_address(), Category::WriteMemory, &payload, out)
    }

    async fn decode_store(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        exchange_ack(ctx, rx).await
    }
}

/// Count of buffered event records
#[derive(Debug, Clone, Default)]
pub struct RecordCount {
    pub count: u8,
}

impl fmt::Display for RecordCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record count")
    }
}

#[async_trait]
impl Property for RecordCount {
    fn encode_query(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        encode_request(ctx.drop_address(), Category::QueryRecordCount, &[], out)
    }

    async fn decode_query(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        let frame = read_reply(rx).await?;
        let mut cur = ByteCursor::new(decode_reply(ctx.drop_address(), &frame)?);
        let count = cur.u8()?;
        cur.finish()?;
        self.count = count;
        Ok(())
    }
}

/// Payload-less command acknowledged with an empty reply
#[derive(Debug, Clone, Copy)]
pub struct Command(pub Category);

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command {:?}", self.0)
    }
}

#[async_trait]
impl Property for Command {
    fn encode_store(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        match self.0 {
            Category::ShutUp
            | Category::Level1Restart
            | Category::DeleteOldestRecord => encode_request(ctx.drop_address(), self.0, &[], out),
            other => Err(CommError::not_supported(format!("{other:?} as a command"))),
        }
    }

    async fn decode_store(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        exchange_ack(ctx, rx).await
    }
}
