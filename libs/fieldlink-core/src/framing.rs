//! Link-layer framing decorator
//!
//! Wraps another messenger to add transparency (escaping, flags, frame check)
//! on send and resynchronization on receive. The wrapped stream sees framed
//! bytes; everything above sees one logical message per `recv`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::error::{CommError, Result};
use crate::messenger::{hex_dump, Messenger};

/// Codec usable as a link-layer framer
///
/// `decode` must consume a rejected frame from the buffer before returning
/// its error, so the next call starts at the following frame.
pub trait LinkCodec:
    Decoder<Item = BytesMut, Error = CommError>
    + for<'a> Encoder<&'a [u8], Error = CommError>
    + Send
{
    /// Forget any partially received frame
    fn reset(&mut self) {}
}

/// Messenger decorator applying a link codec
pub struct FramedMessenger<C> {
    inner: Box<dyn Messenger>,
    codec: C,
    rx: BytesMut,
}

impl<C: LinkCodec> FramedMessenger<C> {
    pub fn new(inner: Box<dyn Messenger>, codec: C) -> Self {
        Self {
            inner,
            codec,
            rx: BytesMut::new(),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }
}

#[async_trait]
impl<C: LinkCodec> Messenger for FramedMessenger<C> {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let mut out = BytesMut::with_capacity(frame.len() + 8);
        self.codec.encode(frame, &mut out)?;
        trace!("Framed {} -> {}", frame.len(), out.len());
        self.inner.send(&out).await
    }

    async fn recv(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let limit = self.inner.timeout();
        let Self { inner, codec, rx } = self;
        let read = async {
            loop {
                if let Some(message) = codec.decode(rx)? {
                    trace!("Deframed {}", hex_dump(&message));
                    buf.extend_from_slice(&message);
                    return Ok(message.len());
                }
                inner.recv(rx).await?;
            }
        };
        timeout(limit, read)
            .await
            .map_err(|_| CommError::timeout(format!("no complete frame in {limit:?}")))?
    }

    async fn drain(&mut self) {
        if !self.rx.is_empty() {
            debug!("Discarding {} buffered framed bytes", self.rx.len());
        }
        self.rx.clear();
        self.codec.reset();
        self.inner.drain().await;
    }

    async fn close(&mut self) {
        self.rx.clear();
        self.codec.reset();
        self.inner.close().await;
    }

    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.inner.set_timeout(timeout);
    }

    fn reopen_delay(&self) -> Option<Duration> {
        self.inner.reopen_delay()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::test_utils::{Reply, ScriptedMessenger};

    /// `[len][payload]` framing for exercising the decorator
    struct LenPrefix;

    impl Decoder for LenPrefix {
        type Item = BytesMut;
        type Error = CommError;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
            let Some(&len) = src.first() else {
                return Ok(None);
            };
            if len == 0 {
                let _ = src.split_to(1);
                return Err(CommError::length("empty frame"));
            }
            if src.len() < 1 + len as usize {
                return Ok(None);
            }
            let mut frame = src.split_to(1 + len as usize);
            Ok(Some(frame.split_off(1)))
        }
    }

    impl<'a> Encoder<&'a [u8]> for LenPrefix {
        type Error = CommError;

        fn encode(&mut self, item: &'a [u8], dst: &mut BytesMut) -> Result<()> {
            dst.extend_from_slice(&[item.len() as u8]);
            dst.extend_from_slice(item);
            Ok(())
        }
    }

    impl LinkCodec for LenPrefix {}

    #[tokio::test]
    async fn test_send_is_encoded() {
        let (inner, handle) = ScriptedMessenger::new(|_req: &[u8]| Reply::Silence);
        let mut m = FramedMessenger::new(Box::new(inner), LenPrefix);
        m.send(&[0xAA, 0xBB]).await.unwrap();
        assert_eq!(handle.sent(), vec![vec![0x02, 0xAA, 0xBB]]);
    }

    #[tokio::test]
    async fn test_recv_reassembles_split_frames() {
        let (inner, _handle) = ScriptedMessenger::new(|_req: &[u8]| {
            Reply::Chunks(vec![vec![0x03, 0x01], vec![0x02], vec![0x03, 0x01, 0x09]])
        });
        let mut m = FramedMessenger::new(Box::new(inner), LenPrefix);
        m.send(&[0x00]).await.unwrap();

        let mut buf = BytesMut::new();
        assert_eq!(m.recv(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..], &[0x01, 0x02, 0x03]);

        // Second frame was already buffered
        let mut buf = BytesMut::new();
        assert_eq!(m.recv(&mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..], &[0x09]);
    }

    #[tokio::test]
    async fn test_bad_frame_then_resync() {
        let (inner, _handle) =
            ScriptedMessenger::new(|_req: &[u8]| Reply::Bytes(vec![0x00, 0x01, 0x42]));
        let mut m = FramedMessenger::new(Box::new(inner), LenPrefix);
        m.send(&[0x00]).await.unwrap();

        let mut buf = BytesMut::new();
        assert!(matches!(m.recv(&mut buf).await, Err(CommError::Length(_))));
        assert_eq!(m.recv(&mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..], &[0x42]);
    }

    #[tokio::test]
    async fn test_drain_drops_partial_frame() {
        let (inner, handle) = ScriptedMessenger::new(|_req: &[u8]| Reply::Bytes(vec![0x05, 0x01]));
        let mut m = FramedMessenger::new(Box::new(inner), LenPrefix);
        m.send(&[0x00]).await.unwrap();

        let mut buf = BytesMut::new();
        assert!(matches!(m.recv(&mut buf).await, Err(CommError::Timeout(_))));
        m.drain().await;
        assert!(m.rx.is_empty());
        assert_eq!(handle.drain_count(), 1);
    }
}
