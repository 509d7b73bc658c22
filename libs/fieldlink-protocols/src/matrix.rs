//! Camera keyboard/matrix switcher link
//!
//! Fixed 8-byte frames: `[0xA0][addr][d1][d2][d3][d4][0xAF][xsum]`, where
//! `xsum` is the running XOR from STX through ETX inclusive. Requests carry
//! `[command][monitor][camera hi][camera lo]` in the data bytes.

use std::fmt;

use async_trait::async_trait;
use bytes::BytesMut;

use fieldlink_core::{CommError, ExchangeContext, FrameReader, Property, Result};

use crate::checksum;

pub const STX: u8 = 0xA0;
pub const ETX: u8 = 0xAF;
pub const FRAME_LEN: usize = 8;

const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

/// Switch a camera onto a monitor
pub const CMD_SELECT: u8 = 0x01;
/// Ask which camera a monitor shows
pub const CMD_QUERY: u8 = 0x02;

pub fn encode_frame(address: u16, data: [u8; 4]) -> Result<[u8; FRAME_LEN]> {
    let address = u8::try_from(address)
        .map_err(|_| CommError::range(format!("matrix address {address}")))?;
    let mut frame = [STX, address, data[0], data[1], data[2], data[3], ETX, 0];
    frame[7] = checksum::xor8(&frame[..7]);
    Ok(frame)
}

/// Validate a reply frame and return its four data bytes
pub fn decode_frame(address: u16, frame: &[u8]) -> Result<[u8; 4]> {
    if frame.len() != FRAME_LEN {
        return Err(CommError::length(format!("frame of {} bytes", frame.len())));
    }
    if frame[0] != STX || frame[6] != ETX {
        return Err(CommError::sentinel(format!(
            "STX {:#04X} ETX {:#04X}",
            frame[0], frame[6]
        )));
    }
    checksum::verify(u32::from(checksum::xor8(&frame[..7])), u32::from(frame[7]))?;
    if u16::from(frame[1]) != address {
        return Err(CommError::sentinel(format!(
            "reply from {}, expected {}",
            frame[1], address
        )));
    }
    Ok([frame[2], frame[3], frame[4], frame[5]])
}

/// Read one frame, skipping anything before STX
async fn read_frame(rx: &mut FrameReader<'_>) -> Result<bytes::Bytes> {
    for _ in 0..FRAME_LEN {
        if rx.peek(1).await?[0] == STX {
            return rx.read_exact(FRAME_LEN).await;
        }
        rx.read_exact(1).await?;
    }
    Err(CommError::sentinel("no STX in reply"))
}

fn request(monitor: u8, camera: u16, command: u8) -> [u8; 4] {
    let [hi, lo] = camera.to_be_bytes();
    [command, monitor, hi, lo]
}

/// Camera selection on one monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSelection {
    pub monitor: u8,
    pub camera: u16,
}

impl MonitorSelection {
    pub fn new(monitor: u8, camera: u16) -> Self {
        Self { monitor, camera }
    }

    fn check_echo(&self, data: [u8; 4], command: u8) -> Result<u16> {
        match data[0] {
            NAK => {
                return Err(CommError::controller(format!(
                    "monitor {} refused",
                    self.monitor
                )))
            },
            c if c != command => {
                return Err(CommError::parse(format!("reply command {c:#04X}")));
            },
            _ => {},
        }
        if data[1] != self.monitor {
            return Err(CommError::parse(format!(
                "reply for monitor {}, expected {}",
                data[1], self.monitor
            )));
        }
        Ok(u16::from_be_bytes([data[2], data[3]]))
    }
}

impl fmt::Display for MonitorSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "monitor {} camera {}", self.monitor, self.camera)
    }
}

#[async_trait]
impl Property for MonitorSelection {
    fn encode_query(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        out.extend_from_slice(&encode_frame(ctx.drop_address(), request(self.monitor, 0, CMD_QUERY))?);
        Ok(())
    }

    async fn decode_query(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        let frame = read_frame(rx).await?;
        let data = decode_frame(ctx.drop_address(), &frame)?;
        self.camera = self.check_echo(data, CMD_QUERY)?;
        Ok(())
    }

    fn encode_store(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        out.extend_from_slice(&encode_frame(
            ctx.drop_address(),
            request(self.monitor, self.camera, CMD_SELECT),
        )?);
        Ok(())
    }

    async fn decode_store(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        let frame = read_frame(rx).await?;
        let data = decode_frame(ctx.drop_address(), &frame)?;
        let camera = self.check_echo(data, ACK)?;
        if camera != self.camera {
            return Err(CommError::parse(format!(
                "switched camera {camera}, requested {}",
                self.camera
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use fieldlink_core::test_utils::{Reply, ScriptedMessenger};
    use fieldlink_core::{CommChannel, CommLink, Controller, LinkSequence, ProtocolKind};

    #[test]
    fn test_frame_bytes() {
        let frame = encode_frame(3, [CMD_SELECT, 2, 0x01, 0x2C]).unwrap();
        let xsum = 0xA0 ^ 0x03 ^ 0x01 ^ 0x02 ^ 0x01 ^ 0x2C ^ 0xAF;
        assert_eq!(frame, [0xA0, 0x03, 0x01, 0x02, 0x01, 0x2C, 0xAF, xsum]);
        assert!(encode_frame(256, [0; 4]).is_err());
    }

    #[test]
    fn test_corrupted_byte_is_rejected() {
        let frame = encode_frame(3, [ACK, 2, 0x01, 0x2C]).unwrap();
        assert_eq!(decode_frame(3, &frame).unwrap(), [ACK, 2, 0x01, 0x2C]);
        for i in 1..6 {
            for bit in 0..8 {
                let mut bad = frame;
                bad[i] ^= 1 << bit;
                assert!(
                    matches!(decode_frame(3, &bad), Err(CommError::Checksum { .. })),
                    "byte {i} bit {bit}"
                );
            }
        }
        let mut bad = frame;
        bad[7] ^= 0x10;
        assert!(matches!(decode_frame(3, &bad), Err(CommError::Checksum { .. })));
        let mut bad = frame;
        bad[6] = 0xAE;
        assert!(matches!(decode_frame(3, &bad), Err(CommError::Sentinel(_))));
    }

    #[test]
    fn test_data_and_address_bounds() {
        // Data bytes equal to STX or ETX are not sentinels
        for data in [[0x00; 4], [0xFF; 4], [STX, ETX, STX, ETX]] {
            for address in [0, 255] {
                let frame = encode_frame(address, data).unwrap();
                assert_eq!(decode_frame(address, &frame).unwrap(), data);
            }
        }

        let frame = encode_frame(3, [ACK, 1, 0, 0]).unwrap();
        assert!(matches!(decode_frame(3, &[]), Err(CommError::Length(_))));
        assert!(matches!(
            decode_frame(3, &frame[..FRAME_LEN - 1]),
            Err(CommError::Length(_))
        ));
        let mut long = frame.to_vec();
        long.push(0x00);
        assert!(matches!(decode_frame(3, &long), Err(CommError::Length(_))));
    }

    fn run(reply: Vec<u8>) -> (ScriptedMessenger, fieldlink_core::test_utils::ScriptHandle) {
        ScriptedMessenger::new(move |_req: &[u8]| Reply::Bytes(reply.clone()))
    }

    #[tokio::test]
    async fn test_select_camera() {
        let ack = encode_frame(3, [ACK, 2, 0x01, 0x2C]).unwrap().to_vec();
        let (mut m, handle) = run(ack);
        let link = CommLink::new("matrix", "serial:///dev/ttyS1?baud=9600", ProtocolKind::Matrix);
        let ctl = Controller::new("KB-3", "matrix", 3);
        let seq = LinkSequence::new();
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);
        chan.store(&mut MonitorSelection::new(2, 300)).await.unwrap();
        assert_eq!(handle.sent()[0][2..6], [CMD_SELECT, 2, 0x01, 0x2C]);
    }

    #[tokio::test]
    async fn test_query_with_leading_noise() {
        let mut reply = vec![0x00, 0x55];
        reply.extend_from_slice(&encode_frame(3, [CMD_QUERY, 4, 0x00, 0x11]).unwrap());
        let (mut m, _) = run(reply);
        let link = CommLink::new("matrix", "serial:///dev/ttyS1?baud=9600", ProtocolKind::Matrix);
        let ctl = Controller::new("KB-3", "matrix", 3);
        let seq = LinkSequence::new();
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);
        let mut sel = MonitorSelection::new(4, 0);
        chan.query(&mut sel).await.unwrap();
        assert_eq!(sel.camera, 0x11);
    }

    #[tokio::test]
    async fn test_select_highest_camera() {
        let ack = encode_frame(255, [ACK, 255, 0xFF, 0xFF]).unwrap().to_vec();
        let (mut m, handle) = run(ack);
        let link = CommLink::new("matrix", "serial:///dev/ttyS1?baud=9600", ProtocolKind::Matrix);
        let ctl = Controller::new("KB-255", "matrix", 255);
        let seq = LinkSequence::new();
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);
        chan.store(&mut MonitorSelection::new(255, u16::MAX)).await.unwrap();
        assert_eq!(handle.sent()[0][1..6], [255, CMD_SELECT, 255, 0xFF, 0xFF]);
    }

    #[tokio::test]
    async fn test_nak() {
        let nak = encode_frame(3, [NAK, 2, 0, 0]).unwrap().to_vec();
        let (mut m, _) = run(nak);
        let link = CommLink::new("matrix", "serial:///dev/ttyS1?baud=9600", ProtocolKind::Matrix);
        let ctl = Controller::new("KB-3", "matrix", 3);
        let seq = LinkSequence::new();
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);
        let result = chan.store(&mut MonitorSelection::new(2, 300)).await;
        assert!(matches!(result, Err(CommError::Controller(_))));
    }
}
