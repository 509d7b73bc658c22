//! SNMPv1 messages for MIB-object controllers (message signs, NTCIP devices)
//!
//! No frame checksum: integrity rests on BER structure and the request-id
//! echo. A reply carrying a stale request-id is skipped and the next message
//! read, a bounded number of times.

use std::fmt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use fieldlink_core::{CommError, ExchangeContext, FrameReader, Property, Result};

use crate::ber::{self, tag, BerReader};

pub const DEFAULT_COMMUNITY: &str = "public";

/// SNMPv1 version field
pub const VERSION_1: i32 = 0;

/// Stale replies skipped before giving up on a request-id
pub const MAX_REREADS: usize = 5;

/// Largest message accepted off the wire
const MAX_MESSAGE: usize = 65_535;

/// PDU tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    GetRequest = 0xA0,
    GetNextRequest = 0xA1,
    GetResponse = 0xA2,
    SetRequest = 0xA3,
}

/// Agent error status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    NoError,
    TooBig,
    NoSuchName,
    BadValue,
    ReadOnly,
    GenErr,
    Other(i32),
}

impl ErrorStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ErrorStatus::NoError,
            1 => ErrorStatus::TooBig,
            2 => ErrorStatus::NoSuchName,
            3 => ErrorStatus::BadValue,
            4 => ErrorStatus::ReadOnly,
            5 => ErrorStatus::GenErr,
            other => ErrorStatus::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ErrorStatus::NoError => 0,
            ErrorStatus::TooBig => 1,
            ErrorStatus::NoSuchName => 2,
            ErrorStatus::BadValue => 3,
            ErrorStatus::ReadOnly => 4,
            ErrorStatus::GenErr => 5,
            ErrorStatus::Other(code) => *code,
        }
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStatus::NoError => write!(f, "noError"),
            ErrorStatus::TooBig => write!(f, "tooBig"),
            ErrorStatus::NoSuchName => write!(f, "noSuchName"),
            ErrorStatus::BadValue => write!(f, "badValue"),
            ErrorStatus::ReadOnly => write!(f, "readOnly"),
            ErrorStatus::GenErr => write!(f, "genErr"),
            ErrorStatus::Other(code) => write!(f, "error {code}"),
        }
    }
}

/// Request-id for the `seq`-th exchange on a link
///
/// Some older agents echo only 7 bits of request-id.
pub fn request_id(seq: u32, legacy_wrap: bool) -> i32 {
    if legacy_wrap {
        (seq % 128) as i32
    } else {
        (seq & 0x7FFF_FFFF) as i32
    }
}

// ============================================================================
// MIB values
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MibValue {
    Null,
    Integer(i32),
    OctetString(Vec<u8>),
    ObjectId(Vec<u32>),
    Counter(u32),
    Gauge(u32),
    TimeTicks(u32),
}

impl MibValue {
    fn encode(&self, out: &mut BytesMut) -> Result<()> {
        match self {
            MibValue::Null => ber::encode_null(out),
            MibValue::Integer(v) => ber::encode_integer(*v, out),
            MibValue::OctetString(v) => ber::encode_octets(v, out),
            MibValue::ObjectId(v) => ber::encode_oid(v, out)?,
            MibValue::Counter(v) => ber::encode_unsigned(tag::COUNTER, *v, out),
            MibValue::Gauge(v) => ber::encode_unsigned(tag::GAUGE, *v, out),
            MibValue::TimeTicks(v) => ber::encode_unsigned(tag::TIME_TICKS, *v, out),
        }
        Ok(())
    }

    fn decode(found: u8, content: &[u8]) -> Result<Self> {
        Ok(match found {
            tag::NULL if content.is_empty() => MibValue::Null,
            tag::INTEGER => MibValue::Integer(ber::decode_integer(content)?),
            tag::OCTET_STRING => MibValue::OctetString(content.to_vec()),
            tag::OBJECT_IDENTIFIER => MibValue::ObjectId(ber::decode_oid(content)?),
            tag::COUNTER => MibValue::Counter(ber::decode_unsigned(content)?),
            tag::GAUGE => MibValue::Gauge(ber::decode_unsigned(content)?),
            tag::TIME_TICKS => MibValue::TimeTicks(ber::decode_unsigned(content)?),
            other => {
                return Err(CommError::bad_tag(format!("value tag {other:#04X}")));
            },
        })
    }
}

impl fmt::Display for MibValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MibValue::Null => write!(f, "null"),
            MibValue::Integer(v) => write!(f, "{v}"),
            MibValue::OctetString(v) => write!(f, "\"{}\"", String::from_utf8_lossy(v)),
            MibValue::ObjectId(v) => write!(f, "{}", ber::format_oid(v)),
            MibValue::Counter(v) | MibValue::Gauge(v) | MibValue::TimeTicks(v) => {
                write!(f, "{v}")
            },
        }
    }
}

/// One MIB object instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MibObject {
    pub name: String,
    pub oid: Vec<u32>,
    pub value: MibValue,
}

impl MibObject {
    pub fn new(name: impl Into<String>, oid: impl Into<Vec<u32>>) -> Self {
        Self {
            name: name.into(),
            oid: oid.into(),
            value: MibValue::Null,
        }
    }

    pub fn with_value(mut self, value: MibValue) -> Self {
        self.value = value;
        self
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self.value {
            MibValue::Integer(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match &self.value {
            MibValue::OctetString(v) => Some(String::from_utf8_lossy(v).into_owned()),
            _ => None,
        }
    }
}

impl fmt::Display for MibObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

// ============================================================================
// Message
// ============================================================================

/// Encode a complete SNMPv1 message
#[allow(clippy::too_many_arguments)]
pub fn encode_message(
    pdu: PduType,
    community: &str,
    request_id: i32,
    status: ErrorStatus,
    error_index: i32,
    objects: &[MibObject],
    with_values: bool,
    out: &mut BytesMut,
) -> Result<()> {
    ber::encode_constructed(tag::SEQUENCE, out, |msg| {
        ber::encode_integer(VERSION_1, msg);
        ber::encode_octets(community.as_bytes(), msg);
        ber::encode_constructed(pdu as u8, msg, |body| {
            ber::encode_integer(request_id, body);
            ber::encode_integer(status.code(), body);
            ber::encode_integer(error_index, body);
            ber::encode_constructed(tag::SEQUENCE, body, |list| {
                for obj in objects {
                    ber::encode_constructed(tag::SEQUENCE, list, |vb| {
                        ber::encode_oid(&obj.oid, vb)?;
                        if with_values {
                            obj.value.encode(vb)
                        } else {
                            MibValue::Null.encode(vb)
                        }
                    })?;
                }
                Ok(())
            })
        })
    })
}

/// Read one whole BER message off the link
pub async fn read_message(rx: &mut FrameReader<'_>) -> Result<Bytes> {
    let mut want = 2;
    loop {
        let head = rx.peek(want).await?;
        if head[0] != tag::SEQUENCE {
            return Err(CommError::bad_tag(format!(
                "message tag {:#04X}",
                head[0]
            )));
        }
        if let Some(total) = ber::tlv_size(head)? {
            if total > MAX_MESSAGE {
                return Err(CommError::length(format!("message of {total} bytes")));
            }
            return rx.read_exact(total).await;
        }
        want += 1;
    }
}

/// Decoded GetResponse
#[derive(Debug)]
struct Response {
    request_id: i32,
    status: ErrorStatus,
    error_index: i32,
    bindings: Vec<(Vec<u32>, MibValue)>,
}

fn parse_response(buf: &[u8]) -> Result<Response> {
    let mut rd = BerReader::new(buf);
    let mut msg = rd.enter(tag::SEQUENCE)?;
    rd.finish()?;
    let version = msg.read_integer()?;
    if version != VERSION_1 {
        return Err(CommError::parse(format!("SNMP version {version}")));
    }
    let _community = msg.read_octets()?;
    let mut pdu = msg.enter(PduType::GetResponse as u8)?;
    msg.finish()?;

    let request_id = pdu.read_integer()?;
    let status = ErrorStatus::from_code(pdu.read_integer()?);
    let error_index = pdu.read_integer()?;
    let mut list = pdu.enter(tag::SEQUENCE)?;
    pdu.finish()?;

    let mut bindings = Vec::new();
    while !list.is_empty() {
        let mut vb = list.enter(tag::SEQUENCE)?;
        let oid = vb.read_oid()?;
        let (found, content) = vb.read_any()?;
        vb.finish()?;
        bindings.push((oid, MibValue::decode(found, content)?));
    }
    Ok(Response {
        request_id,
        status,
        error_index,
        bindings,
    })
}

/// A Get or Set of one or more MIB objects
#[derive(Debug, Clone)]
pub struct SnmpMessage {
    objects: Vec<MibObject>,
    request_id: i32,
}

impl SnmpMessage {
    pub fn new(objects: Vec<MibObject>) -> Self {
        Self {
            objects,
            request_id: 0,
        }
    }

    pub fn objects(&self) -> &[MibObject] {
        &self.objects
    }

    pub fn into_objects(self) -> Vec<MibObject> {
        self.objects
    }

    pub fn get(&self, name: &str) -> Option<&MibObject> {
        self.objects.iter().find(|o| o.name == name)
    }

    fn encode(&mut self, pdu: PduType, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        let options = &ctx.link.options;
        self.request_id = request_id(ctx.next_sequence(), options.legacy_request_id_wrap);
        let community = options.community.as_deref().unwrap_or(DEFAULT_COMMUNITY);
        encode_message(
            pdu,
            community,
            self.request_id,
            ErrorStatus::NoError,
            0,
            &self.objects,
            pdu == PduType::SetRequest,
            out,
        )
    }

    /// Read replies until one carries our request-id
    async fn read_response(&self, rx: &mut FrameReader<'_>) -> Result<Response> {
        let mut last = None;
        for _ in 0..MAX_REREADS {
            let buf = read_message(rx).await?;
            let resp = parse_response(&buf)?;
            if resp.request_id == self.request_id {
                return Ok(resp);
            }
            debug!(
                "Skipping stale response id {} (want {})",
                resp.request_id, self.request_id
            );
            last = Some(resp.request_id);
        }
        Err(CommError::RequestId {
            expected: i64::from(self.request_id),
            received: last.map_or(-1, i64::from),
        })
    }

    /// Check status and bindings; returns false for a tolerated error
    fn check(&self, ctx: &ExchangeContext<'_>, resp: &Response) -> Result<bool> {
        if resp.status != ErrorStatus::NoError {
            let culprit = usize::try_from(resp.error_index)
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| self.objects.get(i))
                .map_or("?", |o| o.name.as_str());
            let code = resp.status.code();
            if u8::try_from(code).is_ok_and(|c| ctx.link.options.tolerated_errors.contains(&c)) {
                warn!(
                    controller = %ctx.controller.name(),
                    "Tolerated {} on {} (index {})",
                    resp.status, culprit, resp.error_index
                );
                return Ok(false);
            }
            return Err(CommError::status(
                code,
                format!("{} on {} (index {})", resp.status, culprit, resp.error_index),
            ));
        }
        if resp.bindings.len() != self.objects.len() {
            return Err(CommError::parse(format!(
                "{} bindings for {} objects",
                resp.bindings.len(),
                self.objects.len()
            )));
        }
        for (obj, (oid, _)) in self.objects.iter().zip(&resp.bindings) {
            if *oid != obj.oid {
                return Err(CommError::parse(format!(
                    "binding {} for {}",
                    ber::format_oid(oid),
                    obj.name
                )));
            }
        }
        Ok(true)
    }
}

impl fmt::Display for SnmpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.objects.iter().map(|o| o.name.as_str()).collect();
        write!(f, "SNMP [{}]", names.join(", "))
    }
}

#[async_trait]
impl Property for SnmpMessage {
    fn encode_query(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        self.encode(PduType::GetRequest, ctx, out)
    }

    async fn decode_query(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        let resp = self.read_response(rx).await?;
        if self.check(ctx, &resp)? {
            for (obj, (_, value)) in self.objects.iter_mut().zip(resp.bindings) {
                obj.value = value;
            }
        }
        Ok(())
    }

    fn encode_store(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        self.encode(PduType::SetRequest, ctx, out)
    }

    async fn decode_store(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        let resp = self.read_response(rx).await?;
        self.check(ctx, &resp)?;
        Ok(())
    }
}
