//! ASCII vehicle-sensor link
//!
//! Every message, in both directions, is one line:
//! `[4-digit decimal drop][ASCII payload][4 hex digits][CR]`, where the hex
//! digits are the 16-bit additive sum of everything before them.

use std::fmt;

use async_trait::async_trait;
use bytes::BytesMut;

use fieldlink_core::{CommError, ExchangeContext, FrameReader, Property, Result};

use crate::checksum;

pub const CR: u8 = b'\r';

/// Longest line accepted, terminator included
pub const MAX_LINE: usize = 256;

const DROP_DIGITS: usize = 4;
const CHECKSUM_DIGITS: usize = 4;

pub fn encode_line(drop: u16, payload: &str, out: &mut BytesMut) -> Result<()> {
    if drop > 9999 {
        return Err(CommError::range(format!("drop {drop}")));
    }
    if !payload.bytes().all(is_payload_byte) {
        return Err(CommError::range(format!("payload {payload:?} is not printable ASCII")));
    }
    let body = format!("{drop:04}{payload}");
    if body.len() + CHECKSUM_DIGITS + 1 > MAX_LINE {
        return Err(CommError::length(format!("line of {} bytes", body.len())));
    }
    let sum = checksum::sum16(body.as_bytes());
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(format!("{sum:04X}").as_bytes());
    out.extend_from_slice(&[CR]);
    Ok(())
}

fn is_payload_byte(b: u8) -> bool {
    (0x20..0x7F).contains(&b)
}

/// Validate one received line (terminator included) and return its payload
pub fn decode_line(drop: u16, line: &[u8]) -> Result<String> {
    let Some(line) = line.strip_suffix(&[CR]) else {
        return Err(CommError::sentinel("line not terminated by CR"));
    };
    if line.len() < DROP_DIGITS + CHECKSUM_DIGITS {
        return Err(CommError::length(format!("line of {} bytes", line.len())));
    }
    let (body, chk) = line.split_at(line.len() - CHECKSUM_DIGITS);
    let received = std::str::from_utf8(chk)
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b)))
        .and_then(|s| u16::from_str_radix(s, 16).ok())
        .ok_or_else(|| CommError::sentinel(format!("checksum field {chk:02X?}")))?;
    checksum::verify(
        u32::from(checksum::sum16(body)),
        u32::from(received),
    )?;

    let (digits, payload) = body.split_at(DROP_DIGITS);
    let from: u16 = std::str::from_utf8(digits)
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CommError::sentinel(format!("drop field {digits:02X?}")))?;
    if from != drop {
        return Err(CommError::sentinel(format!(
            "reply from drop {from}, expected {drop}"
        )));
    }
    if !payload.iter().copied().all(is_payload_byte) {
        return Err(CommError::parse("non-printable payload"));
    }
    Ok(String::from_utf8_lossy(payload).into_owned())
}

/// One command/response exchange with a sensor
///
/// Replies are comma-separated `key=value` fields.
#[derive(Debug, Clone)]
pub struct SensorQuery {
    command: String,
    reply: Option<String>,
}

impl SensorQuery {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            reply: None,
        }
    }

    pub fn reply(&self) -> Option<&str> {
        self.reply.as_deref()
    }

    /// Value of `key` in the reply
    pub fn field(&self, key: &str) -> Option<&str> {
        self.reply
            .as_deref()?
            .split(',')
            .filter_map(|f| f.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.trim())
    }

    /// Numeric value of `key`; a missing key is a parse error
    pub fn number(&self, key: &str) -> Result<u32> {
        let raw = self
            .field(key)
            .ok_or_else(|| CommError::parse(format!("no {key} in reply")))?;
        raw.parse()
            .map_err(|_| CommError::parse(format!("{key}={raw} is not a number")))
    }
}

impl fmt::Display for SensorQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sensor {:?}", self.command)
    }
}

#[async_trait]
impl Property for SensorQuery {
    fn encode_query(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        encode_line(ctx.drop_address(), &self.command, out)
    }

    async fn decode_query(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        let line = rx.read_until(CR, MAX_LINE).await?;
        let payload = decode_line(ctx.drop_address(), &line)?;
        if payload.starts_with('?') {
            return Err(CommError::controller(format!(
                "{} rejected: {}",
                self.command, payload
            )));
        }
        self.reply = Some(payload);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use fieldlink_core::test_utils::{Reply, ScriptedMessenger};
    use fieldlink_core::{CommChannel, CommLink, Controller, LinkSequence, ProtocolKind};

    fn line(drop: u16, payload: &str) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_line(drop, payload, &mut out).unwrap();
        out.to_vec()
    }

    #[test]
    fn test_line_bytes() {
        // "0042S" sums to 0x30+0x30+0x34+0x32+0x53 = 0x119
        assert_eq!(line(42, "S"), b"0042S0119\r".to_vec());
        assert_eq!(line(7, ""), b"000700C7\r".to_vec());
    }

    #[test]
    fn test_decode_line() {
        let raw = line(42, "V=12,O=345");
        assert_eq!(decode_line(42, &raw).unwrap(), "V=12,O=345");
        assert!(matches!(decode_line(43, &raw), Err(CommError::Sentinel(_))));
    }

    #[test]
    fn test_any_corrupted_byte_is_rejected() {
        let raw = line(42, "V=12,O=345");
        for i in 0..raw.len() - 1 {
            for bit in 0..7 {
                let mut bad = raw.clone();
                bad[i] ^= 1 << bit;
                let err = decode_line(42, &bad).unwrap_err();
                assert_eq!(
                    err.class(),
                    fieldlink_core::ErrorClass::Framing,
                    "byte {i} bit {bit}: {err}"
                );
            }
        }
    }

    #[test]
    fn test_lowercase_checksum_rejected() {
        let mut raw = line(7, "");
        raw[6] = b'c';
        assert!(matches!(decode_line(7, &raw), Err(CommError::Sentinel(_))));
    }

    #[test]
    fn test_encode_limits() {
        let mut out = BytesMut::new();
        assert!(encode_line(10_000, "S", &mut out).is_err());
        assert!(encode_line(1, "bad\r", &mut out).is_err());
        assert!(encode_line(1, &"X".repeat(MAX_LINE), &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_payload_bounds() {
        let longest = "X".repeat(MAX_LINE - DROP_DIGITS - CHECKSUM_DIGITS - 1);
        for payload in ["", longest.as_str()] {
            let raw = line(42, payload);
            assert!(raw.len() <= MAX_LINE);
            assert_eq!(decode_line(42, &raw).unwrap(), payload);
        }

        let mut out = BytesMut::new();
        assert!(matches!(
            encode_line(42, &format!("{longest}X"), &mut out),
            Err(CommError::Length(_))
        ));
        assert!(out.is_empty());
    }

    async fn query(prop: &mut SensorQuery, reply: Reply) -> Result<()> {
        let (mut m, _) = ScriptedMessenger::new(move |_req: &[u8]| reply.clone());
        let link = CommLink::new("sensors", "tcp://10.3.0.2:4001", ProtocolKind::AsciiHex);
        let ctl = Controller::new("S-42", "sensors", 42);
        let seq = LinkSequence::new();
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);
        chan.query(prop).await
    }

    #[tokio::test]
    async fn test_query_fields() {
        let mut prop = SensorQuery::new("S");
        let raw = line(42, "V=12, O=345,SPD=61");
        query(&mut prop, Reply::Chunks(vec![raw[..5].to_vec(), raw[5..].to_vec()]))
            .await
            .unwrap();
        assert_eq!(prop.number("V").unwrap(), 12);
        assert_eq!(prop.number("O").unwrap(), 345);
        assert_eq!(prop.field("SPD"), Some("61"));
        assert!(matches!(prop.number("X"), Err(CommError::Parse(_))));
    }

    #[tokio::test]
    async fn test_empty_and_longest_replies() {
        let mut prop = SensorQuery::new("S");
        query(&mut prop, Reply::Bytes(line(42, ""))).await.unwrap();
        assert_eq!(prop.reply(), Some(""));

        let longest = "X".repeat(MAX_LINE - DROP_DIGITS - CHECKSUM_DIGITS - 1);
        let mut prop = SensorQuery::new("S");
        query(&mut prop, Reply::Bytes(line(42, &longest))).await.unwrap();
        assert_eq!(prop.reply(), Some(longest.as_str()));
    }

    #[tokio::test]
    async fn test_rejected_command() {
        let mut prop = SensorQuery::new("Z");
        let result = query(&mut prop, Reply::Bytes(line(42, "?UNKNOWN"))).await;
        assert!(matches!(result, Err(CommError::Controller(_))));
        assert!(prop.reply().is_none());
    }

    #[tokio::test]
    async fn test_unterminated_reply() {
        let mut prop = SensorQuery::new("S");
        let result = query(&mut prop, Reply::Bytes(vec![b'0'; MAX_LINE + 1])).await;
        assert!(matches!(result, Err(CommError::Length(_))));
    }
}
