//! Gate-arm controller link
//!
//! Request: `[0xFF][drop: 2 ASCII digits][size][payload][password][chk]`
//! Reply:   `[0xFF][drop: 2 ASCII digits][size][payload][chk]`
//!
//! `chk` is the two's complement of the sum of every byte after the sentinel,
//! so the bytes after the sentinel sum to zero.

use std::fmt;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

use fieldlink_core::{ByteCursor, CommError, ExchangeContext, FrameReader, Property, Result};

use crate::checksum;

pub const SENTINEL: u8 = 0xFF;

/// Passwords are space padded to this length
pub const PASSWORD_LEN: usize = 8;

pub const MAX_PAYLOAD: usize = 64;

const ACK: u8 = b'A';
const NAK: u8 = b'N';

pub fn encode_request(drop: u16, payload: &[u8], password: &str, out: &mut BytesMut) -> Result<()> {
    if !(1..=99).contains(&drop) {
        return Err(CommError::range(format!("drop {drop}")));
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(CommError::length(format!("payload of {} bytes", payload.len())));
    }
    if password.len() > PASSWORD_LEN || !password.is_ascii() {
        return Err(CommError::config(format!(
            "password must be at most {PASSWORD_LEN} ASCII characters"
        )));
    }
    out.put_u8(SENTINEL);
    let start = out.len();
    out.extend_from_slice(format!("{drop:02}").as_bytes());
    out.put_u8(payload.len() as u8);
    out.extend_from_slice(payload);
    out.extend_from_slice(format!("{password:<PASSWORD_LEN$}").as_bytes());
    let chk = checksum::twos_complement8(&out[start..]);
    out.put_u8(chk);
    Ok(())
}

/// Validate a reply frame and return its payload
pub fn decode_reply(drop: u16, frame: &[u8]) -> Result<&[u8]> {
    let mut cur = ByteCursor::new(frame);
    cur.expect(SENTINEL, "gate arm sentinel")?;
    let body = cur.rest();
    if checksum::sum8(body) != 0 {
        let (&received, covered) = body
            .split_last()
            .ok_or_else(|| CommError::length("empty reply"))?;
        return Err(CommError::checksum(
            u32::from(checksum::twos_complement8(covered)),
            u32::from(received),
        ));
    }
    let digits = cur.take(2)?;
    let from = std::str::from_utf8(digits)
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| CommError::sentinel(format!("drop field {digits:02X?}")))?;
    if from != drop {
        return Err(CommError::sentinel(format!(
            "reply from drop {from}, expected {drop}"
        )));
    }
    let size = cur.u8()? as usize;
    if size + 1 != cur.remaining() {
        return Err(CommError::length(format!(
            "size {} with {} bytes left",
            size,
            cur.remaining()
        )));
    }
    cur.take(size)
}

/// Read one reply frame off the link
pub async fn read_reply(rx: &mut FrameReader<'_>) -> Result<bytes::Bytes> {
    let head = rx.peek(4).await?;
    if head[0] != SENTINEL {
        return Err(CommError::sentinel(format!("reply starts {:#04X}", head[0])));
    }
    let size = head[3] as usize;
    if size > MAX_PAYLOAD {
        return Err(CommError::length(format!("reply size {size}")));
    }
    rx.read_exact(4 + size + 1).await
}

/// Arm position reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    Opening,
    Open,
    Closing,
    Closed,
    Fault,
}

impl ArmState {
    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            b'1' => ArmState::Opening,
            b'2' => ArmState::Open,
            b'3' => ArmState::Closing,
            b'4' => ArmState::Closed,
            b'5' => ArmState::Fault,
            other => return Err(CommError::range(format!("arm state {other:#04X}"))),
        })
    }
}

fn password<'a>(ctx: &'a ExchangeContext<'_>) -> &'a str {
    ctx.link.options.password.as_deref().unwrap_or("")
}

/// Arm state and fault code
#[derive(Debug, Clone, Default)]
pub struct GateArmStatus {
    pub state: Option<ArmState>,
    /// Non-zero controller fault code
    pub fault: Option<u8>,
}

impl fmt::Display for GateArmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gate arm status")
    }
}

#[async_trait]
impl Property for GateArmStatus {
    fn encode_query(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        encode_request(ctx.drop_address(), b"S", password(ctx), out)
    }

    async fn decode_query(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        let frame = read_reply(rx).await?;
        let mut cur = ByteCursor::new(decode_reply(ctx.drop_address(), &frame)?);
        let state = ArmState::from_code(cur.u8()?)?;
        let fault = cur.u8()?;
        cur.finish()?;
        self.state = Some(state);
        self.fault = (fault != b'0').then_some(fault);
        Ok(())
    }
}

/// Arm movement request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmCommand {
    Open,
    Close,
}

impl fmt::Display for ArmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArmCommand::Open => write!(f, "gate arm open"),
            ArmCommand::Close => write!(f, "gate arm close"),
        }
    }
}

#[async_trait]
impl Property for ArmCommand {
    fn encode_store(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        let code = match self {
            ArmCommand::Open => b"O",
            ArmCommand::Close => b"C",
        };
        encode_request(ctx.drop_address(), code, password(ctx), out)
    }

    async fn decode_store(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        let frame = read_reply(rx).await?;
        match decode_reply(ctx.drop_address(), &frame)? {
            [ACK] => Ok(()),
            [NAK] => Err(CommError::controller(format!("{} refused", self))),
            other => Err(CommError::parse(format!("acknowledgement {other:02X?}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use fieldlink_core::test_utils::{Reply, ScriptedMessenger};
    use fieldlink_core::{CommChannel, CommLink, Controller, LinkOptions, LinkSequence, ProtocolKind};

    fn reply(drop: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![SENTINEL];
        out.extend_from_slice(format!("{drop:02}").as_bytes());
        out.push(payload.len() as u8);
        out.extend_from_slice(payload);
        out.push(checksum::twos_complement8(&out[1..]));
        out
    }

    fn gate_link() -> CommLink {
        CommLink::new("gates", "tcp://10.4.0.3:7000", ProtocolKind::GateArm).with_options(
            LinkOptions {
                password: Some("s3cret".to_string()),
                ..LinkOptions::default()
            },
        )
    }

    #[test]
    fn test_request_bytes() {
        let mut out = BytesMut::new();
        encode_request(7, b"S", "ab", &mut out).unwrap();
        let mut expected = vec![SENTINEL, b'0', b'7', 0x01, b'S'];
        expected.extend_from_slice(b"ab      ");
        let chk = checksum::twos_complement8(&expected[1..]);
        expected.push(chk);
        assert_eq!(out.to_vec(), expected);
        assert_eq!(checksum::sum8(&out[1..]), 0);
    }

    #[test]
    fn test_request_limits() {
        let mut out = BytesMut::new();
        assert!(encode_request(100, b"S", "", &mut out).is_err());
        assert!(encode_request(0, b"S", "", &mut out).is_err());
        assert!(matches!(
            encode_request(1, b"S", "waytoolongpw", &mut out),
            Err(CommError::Config(_))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_reply_and_corruption() {
        let frame = reply(7, b"40");
        assert_eq!(decode_reply(7, &frame).unwrap(), b"40");
        for i in 1..frame.len() {
            for bit in 0..8 {
                let mut bad = frame.clone();
                bad[i] ^= 1 << bit;
                assert!(
                    matches!(decode_reply(7, &bad), Err(CommError::Checksum { .. })),
                    "byte {i} bit {bit}"
                );
            }
        }
        let mut bad = frame.clone();
        bad[0] = 0xFE;
        assert!(matches!(decode_reply(7, &bad), Err(CommError::Sentinel(_))));
    }

    #[test]
    fn test_reply_from_wrong_drop() {
        assert!(matches!(
            decode_reply(7, &reply(8, b"40")),
            Err(CommError::Sentinel(_))
        ));
    }

    #[test]
    fn test_payload_bounds() {
        for len in [0, MAX_PAYLOAD] {
            let payload = vec![b'Z'; len];
            let mut out = BytesMut::new();
            encode_request(7, &payload, "pw", &mut out).unwrap();
            assert_eq!(out.len(), 4 + len + PASSWORD_LEN + 1);
            assert_eq!(out[3] as usize, len);
            assert_eq!(checksum::sum8(&out[1..]), 0);

            let frame = reply(7, &payload);
            assert_eq!(decode_reply(7, &frame).unwrap(), &payload[..]);
        }

        let mut out = BytesMut::new();
        assert!(matches!(
            encode_request(7, &[b'Z'; MAX_PAYLOAD + 1], "pw", &mut out),
            Err(CommError::Length(_))
        ));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_reply_rejected_before_read() {
        let (mut m, _) = ScriptedMessenger::new(|_req: &[u8]| {
            Reply::Bytes(reply(12, &[b'4'; MAX_PAYLOAD + 1]))
        });
        let link = gate_link();
        let ctl = Controller::new("G-12", "gates", 12);
        let seq = LinkSequence::new();
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);
        let mut status = GateArmStatus::default();
        let result = chan.query(&mut status).await;
        assert!(matches!(result, Err(CommError::Length(_))));
        assert_eq!(status.state, None);
    }

    #[tokio::test]
    async fn test_status_query() {
        let (mut m, handle) = ScriptedMessenger::new(|_req: &[u8]| Reply::Bytes(reply(12, b"47")));
        let link = gate_link();
        let ctl = Controller::new("G-12", "gates", 12);
        let seq = LinkSequence::new();
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);
        let mut status = GateArmStatus::default();
        chan.query(&mut status).await.unwrap();
        assert_eq!(status.state, Some(ArmState::Closed));
        assert_eq!(status.fault, Some(b'7'));
        assert_eq!(&handle.sent()[0][5..13], b"s3cret  ");
    }

    #[tokio::test]
    async fn test_command_refused() {
        let (mut m, _) = ScriptedMessenger::new(|_req: &[u8]| Reply::Bytes(reply(12, &[NAK])));
        let link = gate_link();
        let ctl = Controller::new("G-12", "gates", 12);
        let seq = LinkSequence::new();
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);
        let result = chan.store(&mut ArmCommand::Open).await;
        assert!(matches!(result, Err(CommError::Controller(_))));
    }

    #[tokio::test]
    async fn test_command_acknowledged() {
        let (mut m, handle) = ScriptedMessenger::new(|_req: &[u8]| Reply::Bytes(reply(12, &[ACK])));
        let link = gate_link();
        let ctl = Controller::new("G-12", "gates", 12);
        let seq = LinkSequence::new();
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);
        chan.store(&mut ArmCommand::Close).await.unwrap();
        assert_eq!(handle.sent()[0][4], b'C');
    }
}
