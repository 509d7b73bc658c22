//! ASN.1 Basic Encoding Rules, the subset SNMP needs
//!
//! Every value is `{tag, length, content}`. Lengths use the short form below
//! 128 and the minimal long form (`0x81`..`0x84` prefix) above. INTEGER content is
//! minimal-length big-endian two's complement.

use bytes::{BufMut, BytesMut};
use fieldlink_core::{ByteCursor, CommError, Result};

/// Universal and SNMP application tags
pub mod tag {
    pub const INTEGER: u8 = 0x02;
    pub const OCTET_STRING: u8 = 0x04;
    pub const NULL: u8 = 0x05;
    pub const OBJECT_IDENTIFIER: u8 = 0x06;
    pub const SEQUENCE: u8 = 0x30;
    pub const COUNTER: u8 = 0x41;
    pub const GAUGE: u8 = 0x42;
    pub const TIME_TICKS: u8 = 0x43;
}

/// Longest long-form length accepted on decode
const MAX_LENGTH_OCTETS: usize = 4;

// ============================================================================
// Encoding
// ============================================================================

pub fn encode_length(len: usize, out: &mut BytesMut) {
    if len < 0x80 {
        out.put_u8(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.put_u8(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

pub fn encode_tlv(tag: u8, content: &[u8], out: &mut BytesMut) {
    out.put_u8(tag);
    encode_length(content.len(), out);
    out.extend_from_slice(content);
}

/// Minimal two's-complement content bytes of `value`
fn integer_content(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 3 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

pub fn encode_integer(value: i32, out: &mut BytesMut) {
    encode_tlv(tag::INTEGER, &integer_content(value), out);
}

/// Unsigned application types (Counter, Gauge, TimeTicks)
pub fn encode_unsigned(tag: u8, value: u32, out: &mut BytesMut) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(3).take_while(|b| **b == 0).count();
    let mut content = bytes[skip..].to_vec();
    if content[0] & 0x80 != 0 {
        content.insert(0, 0);
    }
    encode_tlv(tag, &content, out);
}

pub fn encode_octets(value: &[u8], out: &mut BytesMut) {
    encode_tlv(tag::OCTET_STRING, value, out);
}

pub fn encode_null(out: &mut BytesMut) {
    out.put_u8(tag::NULL);
    out.put_u8(0);
}

pub fn encode_oid(oid: &[u32], out: &mut BytesMut) -> Result<()> {
    if oid.len() < 2 || oid[0] > 2 || (oid[0] < 2 && oid[1] >= 40) {
        return Err(CommError::range(format!("invalid OID {}", format_oid(oid))));
    }
    let mut content = Vec::with_capacity(oid.len() + 4);
    push_subid(oid[0] * 40 + oid[1], &mut content);
    for &sub in &oid[2..] {
        push_subid(sub, &mut content);
    }
    encode_tlv(tag::OBJECT_IDENTIFIER, &content, out);
    Ok(())
}

/// Base-128, high bit set on every byte but the last
fn push_subid(mut value: u32, out: &mut Vec<u8>) {
    let mut tmp = [0u8; 5];
    let mut n = 0;
    loop {
        tmp[n] = (value & 0x7F) as u8;
        n += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        out.push(if i == 0 { tmp[i] } else { tmp[i] | 0x80 });
    }
}

/// Wrap already-encoded content in a constructed TLV
pub fn encode_constructed<F>(tag: u8, out: &mut BytesMut, body: F) -> Result<()>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let mut content = BytesMut::new();
    body(&mut content)?;
    encode_tlv(tag, &content, out);
    Ok(())
}

pub fn format_oid(oid: &[u32]) -> String {
    oid.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

// ============================================================================
// Decoding
// ============================================================================

/// Total size of the TLV starting at `head`, if its header is complete
///
/// Used to know how many bytes to read off a stream before decoding.
pub fn tlv_size(head: &[u8]) -> Result<Option<usize>> {
    if head.len() < 2 {
        return Ok(None);
    }
    let first = head[1];
    if first < 0x80 {
        return Ok(Some(2 + first as usize));
    }
    let n = long_form_octets(first)?;
    if head.len() < 2 + n {
        return Ok(None);
    }
    let len = head[2..2 + n]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
    Ok(Some(2 + n + len))
}

fn long_form_octets(first: u8) -> Result<usize> {
    let n = (first & 0x7F) as usize;
    if n == 0 {
        return Err(CommError::length("indefinite length not allowed"));
    }
    if first == 0xFF || n > MAX_LENGTH_OCTETS {
        return Err(CommError::length(format!("length prefix {first:#04X}")));
    }
    Ok(n)
}

/// TLV reader over a received message
#[derive(Debug, Clone)]
pub struct BerReader<'a> {
    cur: ByteCursor<'a>,
}

impl<'a> BerReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            cur: ByteCursor::new(buf),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cur.is_empty()
    }

    pub fn peek_tag(&self) -> Result<u8> {
        self.cur.peek()
    }

    /// Declared length, checked against the bytes that remain
    pub fn read_length(&mut self) -> Result<usize> {
        let first = self.cur.u8()?;
        let len = if first < 0x80 {
            first as usize
        } else {
            let n = long_form_octets(first)?;
            self.cur
                .take(n)?
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize)
        };
        if len > self.cur.remaining() {
            return Err(CommError::length(format!(
                "declared {} bytes, {} remain",
                len,
                self.cur.remaining()
            )));
        }
        Ok(len)
    }

    /// Read `{tag, length, content}` with an expected tag
    pub fn read_tlv(&mut self, expected: u8) -> Result<&'a [u8]> {
        let found = self.cur.u8()?;
        if found != expected {
            return Err(CommError::bad_tag(format!(
                "expected {expected:#04X}, found {found:#04X}"
            )));
        }
        let len = self.read_length()?;
        self.cur.take(len)
    }

    /// Read any TLV, returning its tag and content
    pub fn read_any(&mut self) -> Result<(u8, &'a [u8])> {
        let found = self.cur.u8()?;
        let len = self.read_length()?;
        Ok((found, self.cur.take(len)?))
    }

    /// Step into a constructed value
    pub fn enter(&mut self, expected: u8) -> Result<BerReader<'a>> {
        Ok(BerReader::new(self.read_tlv(expected)?))
    }

    pub fn read_integer(&mut self) -> Result<i32> {
        decode_integer(self.read_tlv(tag::INTEGER)?)
    }

    pub fn read_octets(&mut self) -> Result<&'a [u8]> {
        self.read_tlv(tag::OCTET_STRING)
    }

    pub fn read_null(&mut self) -> Result<()> {
        let content = self.read_tlv(tag::NULL)?;
        if !content.is_empty() {
            return Err(CommError::length(format!("NULL with {} bytes", content.len())));
        }
        Ok(())
    }

    pub fn read_oid(&mut self) -> Result<Vec<u32>> {
        decode_oid(self.read_tlv(tag::OBJECT_IDENTIFIER)?)
    }

    /// Nothing may follow the last value
    pub fn finish(&self) -> Result<()> {
        self.cur.finish()
    }
}

pub fn decode_integer(content: &[u8]) -> Result<i32> {
    if content.is_empty() {
        return Err(CommError::length("empty INTEGER"));
    }
    if content.len() > 4 {
        return Err(CommError::range(format!(
            "INTEGER of {} bytes",
            content.len()
        )));
    }
    let init: i32 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(content
        .iter()
        .fold(init, |acc, &b| (acc << 8) | i32::from(b)))
}

pub fn decode_unsigned(content: &[u8]) -> Result<u32> {
    let content = match content {
        [0, rest @ ..] if !rest.is_empty() => rest,
        _ => content,
    };
    if content.is_empty() {
        return Err(CommError::length("empty unsigned value"));
    }
    if content.len() > 4 {
        return Err(CommError::range(format!(
            "unsigned value of {} bytes",
            content.len()
        )));
    }
    Ok(content.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}

pub fn decode_oid(content: &[u8]) -> Result<Vec<u32>> {
    let mut subids = Vec::new();
    let mut value: u32 = 0;
    let mut pending = false;
    for &b in content {
        if value > (u32::MAX >> 7) {
            return Err(CommError::range("OID sub-identifier overflow"));
        }
        value = (value << 7) | u32::from(b & 0x7F);
        pending = b & 0x80 != 0;
        if !pending {
            subids.push(value);
            value = 0;
        }
    }
    if pending || subids.is_empty() {
        return Err(CommError::length("truncated OID"));
    }
    let first = subids.remove(0);
    let (a, b) = match first {
        0..=39 => (0, first),
        40..=79 => (1, first - 40),
        _ => (2, first - 80),
    };
    let mut oid = Vec::with_capacity(subids.len() + 2);
    oid.push(a);
    oid.push(b);
    oid.extend(subids);
    Ok(oid)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn int_bytes(v: i32) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_integer(v, &mut out);
        out.to_vec()
    }

    #[test]
    fn test_integer_minimal_length() {
        assert_eq!(int_bytes(0), vec![0x02, 0x01, 0x00]);
        assert_eq!(int_bytes(-1), vec![0x02, 0x01, 0xFF]);
        assert_eq!(int_bytes(127), vec![0x02, 0x01, 0x7F]);
        assert_eq!(int_bytes(128), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(int_bytes(-128), vec![0x02, 0x01, 0x80]);
        assert_eq!(int_bytes(-129), vec![0x02, 0x02, 0xFF, 0x7F]);
        assert_eq!(int_bytes(256), vec![0x02, 0x02, 0x01, 0x00]);
        assert_eq!(int_bytes(i32::MAX), vec![0x02, 0x04, 0x7F, 0xFF, 0xFF, 0xFF]);
        assert_eq!(int_bytes(i32::MIN), vec![0x02, 0x04, 0x80, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_integer_boundaries_decode() {
        let mut values = vec![0, -1, 1, i32::MAX, i32::MIN];
        for shift in 0..31 {
            let p = 1i32 << shift;
            values.extend([p, p - 1, -p, -p - 1]);
        }
        for v in values {
            let bytes = int_bytes(v);
            let mut rd = BerReader::new(&bytes);
            assert_eq!(rd.read_integer().unwrap(), v, "value {v}");
            rd.finish().unwrap();
        }
    }

    #[test]
    fn test_integer_too_wide() {
        assert!(matches!(
            decode_integer(&[0x01, 0, 0, 0, 0]),
            Err(CommError::Range(_))
        ));
        assert!(matches!(decode_integer(&[]), Err(CommError::Length(_))));
    }

    #[test]
    fn test_length_forms() {
        let mut out = BytesMut::new();
        encode_length(0x7F, &mut out);
        encode_length(0x80, &mut out);
        encode_length(0x1234, &mut out);
        assert_eq!(out.to_vec(), vec![0x7F, 0x81, 0x80, 0x82, 0x12, 0x34]);

        let mut out = BytesMut::new();
        encode_length(0xFF, &mut out);
        encode_length(0x1_0000, &mut out);
        encode_length(0x0123_4567, &mut out);
        assert_eq!(
            out.to_vec(),
            vec![0x81, 0xFF, 0x83, 0x01, 0x00, 0x00, 0x84, 0x01, 0x23, 0x45, 0x67]
        );
    }

    #[test]
    fn test_octet_string_above_64k() {
        let payload = vec![0xAA; 70_000];
        let mut out = BytesMut::new();
        encode_octets(&payload, &mut out);
        assert_eq!(&out[..5], &[0x04, 0x83, 0x01, 0x11, 0x70]);
        assert_eq!(tlv_size(&out).unwrap(), Some(out.len()));

        let mut rd = BerReader::new(&out);
        assert_eq!(rd.read_octets().unwrap().len(), payload.len());
        rd.finish().unwrap();
    }

    #[test]
    fn test_length_exceeding_input_is_rejected() {
        // Short form
        let mut rd = BerReader::new(&[0x04, 0x05, b'a', b'b']);
        assert!(matches!(rd.read_octets(), Err(CommError::Length(_))));
        // Long form
        let mut rd = BerReader::new(&[0x04, 0x81, 0x90, 0x00]);
        assert!(matches!(rd.read_octets(), Err(CommError::Length(_))));
        // Indefinite and reserved prefixes
        let mut rd = BerReader::new(&[0x30, 0x80, 0x00, 0x00]);
        assert!(matches!(rd.read_tlv(tag::SEQUENCE), Err(CommError::Length(_))));
        let mut rd = BerReader::new(&[0x30, 0xFF, 0x00]);
        assert!(matches!(rd.read_tlv(tag::SEQUENCE), Err(CommError::Length(_))));
    }

    #[test]
    fn test_long_octet_string() {
        let payload = vec![0x5A; 300];
        let mut out = BytesMut::new();
        encode_octets(&payload, &mut out);
        assert_eq!(&out[..4], &[0x04, 0x82, 0x01, 0x2C]);
        let mut rd = BerReader::new(&out);
        assert_eq!(rd.read_octets().unwrap(), &payload[..]);
    }

    #[test]
    fn test_empty_octet_string() {
        let mut out = BytesMut::new();
        encode_octets(&[], &mut out);
        assert_eq!(out.to_vec(), vec![0x04, 0x00]);
        assert!(BerReader::new(&out).read_octets().unwrap().is_empty());
    }

    #[test]
    fn test_oid_encoding() {
        // 1.3.6.1.4.1.1206.4.2.3.1.1.0
        let oid = [1, 3, 6, 1, 4, 1, 1206, 4, 2, 3, 1, 1, 0];
        let mut out = BytesMut::new();
        encode_oid(&oid, &mut out).unwrap();
        assert_eq!(
            out.to_vec(),
            vec![0x06, 0x0D, 0x2B, 0x06, 0x01, 0x04, 0x01, 0x89, 0x36, 0x04, 0x02, 0x03, 0x01, 0x01, 0x00]
        );
        let mut rd = BerReader::new(&out);
        assert_eq!(rd.read_oid().unwrap(), oid.to_vec());
    }

    #[test]
    fn test_oid_invalid() {
        let mut out = BytesMut::new();
        assert!(encode_oid(&[1], &mut out).is_err());
        assert!(encode_oid(&[3, 1], &mut out).is_err());
        assert!(matches!(decode_oid(&[0x2B, 0x89]), Err(CommError::Length(_))));
    }

    #[test]
    fn test_unsigned() {
        let mut out = BytesMut::new();
        encode_unsigned(tag::GAUGE, 0xFFFF_FFFF, &mut out);
        assert_eq!(out.to_vec(), vec![0x42, 0x05, 0x00, 0xFF, 0xFF, 0xFF, 0xFF]);
        let mut rd = BerReader::new(&out);
        let (t, content) = rd.read_any().unwrap();
        assert_eq!(t, tag::GAUGE);
        assert_eq!(decode_unsigned(content).unwrap(), u32::MAX);
    }

    #[test]
    fn test_bad_tag() {
        let mut rd = BerReader::new(&[0x04, 0x01, 0x00]);
        assert!(matches!(rd.read_integer(), Err(CommError::BadTag(_))));
    }

    #[test]
    fn test_tlv_size() {
        assert_eq!(tlv_size(&[0x30]).unwrap(), None);
        assert_eq!(tlv_size(&[0x30, 0x10]).unwrap(), Some(18));
        assert_eq!(tlv_size(&[0x30, 0x82, 0x01]).unwrap(), None);
        assert_eq!(tlv_size(&[0x30, 0x82, 0x01, 0x00]).unwrap(), Some(260));
        assert!(tlv_size(&[0x30, 0x80]).is_err());
    }

    #[test]
    fn test_nested_sequence() {
        let mut out = BytesMut::new();
        encode_constructed(tag::SEQUENCE, &mut out, |b| {
            encode_integer(7, b);
            encode_null(b);
            Ok(())
        })
        .unwrap();
        let mut rd = BerReader::new(&out);
        let mut seq = rd.enter(tag::SEQUENCE).unwrap();
        assert_eq!(seq.read_integer().unwrap(), 7);
        seq.read_null().unwrap();
        seq.finish().unwrap();
        rd.finish().unwrap();
    }
}
