//! Property (codec) contract and the exchange channel
//!
//! A property is one piece of controller state: a memory region, a status
//! block, a MIB object. It knows how to encode a request for itself and how to
//! decode and validate the reply. The channel runs those encode/decode round
//! trips over the link messenger on behalf of a phase.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::{CommError, Result};
use crate::messenger::{hex_dump, Messenger};
use crate::model::{CommLink, Controller};

// ============================================================================
// Exchange context
// ============================================================================

/// Per-link transaction counter
#[derive(Debug, Default)]
pub struct LinkSequence(AtomicU32);

impl LinkSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next value; wraps at `u32::MAX`
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// What a property may know about the exchange it takes part in
#[derive(Debug, Clone, Copy)]
pub struct ExchangeContext<'a> {
    pub link: &'a CommLink,
    pub controller: &'a Controller,
    sequence: &'a LinkSequence,
}

impl<'a> ExchangeContext<'a> {
    pub fn new(link: &'a CommLink, controller: &'a Controller, sequence: &'a LinkSequence) -> Self {
        Self {
            link,
            controller,
            sequence,
        }
    }

    /// Drop address of the target controller
    pub fn drop_address(&self) -> u16 {
        self.controller.drop_address()
    }

    /// Next transaction number on this link
    pub fn next_sequence(&self) -> u32 {
        self.sequence.next()
    }
}

// ============================================================================
// Frame reader
// ============================================================================

/// Buffered reader over the link messenger for one response
///
/// Bytes left over after decoding belong to nobody and are dropped with the
/// reader. A stream that stops short of a requested length surfaces as the
/// messenger's read timeout, not as end of stream.
pub struct FrameReader<'a> {
    link: &'a mut dyn Messenger,
    buf: BytesMut,
}

impl<'a> FrameReader<'a> {
    pub fn new(link: &'a mut dyn Messenger) -> Self {
        Self {
            link,
            buf: BytesMut::new(),
        }
    }

    /// Receive until at least `n` bytes are buffered
    pub async fn fill(&mut self, n: usize) -> Result<()> {
        self.link.recv_exact(&mut self.buf, n).await
    }

    /// Look at the first `n` bytes without consuming them
    pub async fn peek(&mut self, n: usize) -> Result<&[u8]> {
        self.fill(n).await?;
        Ok(&self.buf[..n])
    }

    /// Consume exactly `n` bytes
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        self.fill(n).await?;
        Ok(self.buf.split_to(n).freeze())
    }

    /// Consume through the first `delim`, inclusive
    pub async fn read_until(&mut self, delim: u8, max: usize) -> Result<Bytes> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|b| *b == delim) {
                let end = scanned + pos + 1;
                return Ok(self.buf.split_to(end).freeze());
            }
            scanned = self.buf.len();
            if scanned >= max {
                return Err(CommError::length(format!(
                    "no {delim:02X} terminator within {max} bytes"
                )));
            }
            self.link.recv(&mut self.buf).await?;
        }
    }

    /// Consume one message from a datagram or framed link
    pub async fn read_message(&mut self) -> Result<Bytes> {
        if self.buf.is_empty() {
            self.link.recv(&mut self.buf).await?;
        }
        Ok(self.buf.split().freeze())
    }

    /// Drop whatever is buffered
    pub fn discard_buffered(&mut self) -> usize {
        let n = self.buf.len();
        self.buf.clear();
        n
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// ============================================================================
// Property
// ============================================================================

/// Codec for one piece of controller state
///
/// Decoding validates framing (checksum, length, tag) before touching any
/// field, and commits decoded values only after the whole reply is accepted.
/// A failed decode leaves the property as it was.
#[async_trait]
pub trait Property: fmt::Display + Send {
    /// Encode a read request
    fn encode_query(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        let _ = (ctx, out);
        Err(CommError::not_supported(format!("query {}", self)))
    }

    /// Decode and validate a read reply
    async fn decode_query(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        let _ = (ctx, rx);
        Err(CommError::not_supported(format!("query {}", self)))
    }

    /// Encode a write request
    fn encode_store(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
        let _ = (ctx, out);
        Err(CommError::not_supported(format!("store {}", self)))
    }

    /// Decode and validate a write acknowledgement
    async fn decode_store(
        &mut self,
        ctx: &ExchangeContext<'_>,
        rx: &mut FrameReader<'_>,
    ) -> Result<()> {
        let _ = (ctx, rx);
        Err(CommError::not_supported(format!("store {}", self)))
    }
}

/// Properties collected for one query or store pass
#[derive(Default)]
pub struct PropertySet<'p> {
    items: Vec<&'p mut dyn Property>,
}

impl<'p> PropertySet<'p> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn add(&mut self, prop: &'p mut dyn Property) -> &mut Self {
        self.items.push(prop);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ============================================================================
// Comm channel
// ============================================================================

/// Exchange surface handed to a phase
pub struct CommChannel<'a> {
    link: &'a mut dyn Messenger,
    ctx: ExchangeContext<'a>,
}

impl<'a> CommChannel<'a> {
    pub fn new(
        link: &'a mut dyn Messenger,
        comm_link: &'a CommLink,
        controller: &'a Controller,
        sequence: &'a LinkSequence,
    ) -> Self {
        Self {
            link,
            ctx: ExchangeContext::new(comm_link, controller, sequence),
        }
    }

    pub fn controller(&self) -> &Controller {
        self.ctx.controller
    }

    pub fn comm_link(&self) -> &CommLink {
        self.ctx.link
    }

    pub fn context(&self) -> &ExchangeContext<'a> {
        &self.ctx
    }

    /// Read one property from the controller
    pub async fn query(&mut self, prop: &mut dyn Property) -> Result<()> {
        let mut out = BytesMut::new();
        prop.encode_query(&self.ctx, &mut out)?;
        debug!(
            controller = %self.ctx.controller.name(),
            drop = self.ctx.drop_address(),
            "QUERY {}", prop
        );
        trace!("TX {}", hex_dump(&out));
        self.link.send(&out).await?;
        let mut rx = FrameReader::new(&mut *self.link);
        prop.decode_query(&self.ctx, &mut rx).await
    }

    /// Write one property to the controller
    pub async fn store(&mut self, prop: &mut dyn Property) -> Result<()> {
        let mut out = BytesMut::new();
        prop.encode_store(&self.ctx, &mut out)?;
        debug!(
            controller = %self.ctx.controller.name(),
            drop = self.ctx.drop_address(),
            "STORE {}", prop
        );
        trace!("TX {}", hex_dump(&out));
        self.link.send(&out).await?;
        let mut rx = FrameReader::new(&mut *self.link);
        prop.decode_store(&self.ctx, &mut rx).await
    }

    /// Read every property in the set, in insertion order
    pub async fn query_props(&mut self, props: &mut PropertySet<'_>) -> Result<()> {
        for prop in props.items.iter_mut() {
            self.query(&mut **prop).await?;
        }
        Ok(())
    }

    /// Write every property in the set, in insertion order
    pub async fn store_props(&mut self, props: &mut PropertySet<'_>) -> Result<()> {
        for prop in props.items.iter_mut() {
            self.store(&mut **prop).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::model::ProtocolKind;
    use crate::test_utils::{Reply, ScriptedMessenger};

    /// `[drop][value]` echo property
    #[derive(Debug, Default)]
    struct Register {
        value: Option<u8>,
        stored: u8,
    }

    impl fmt::Display for Register {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "register")
        }
    }

    #[async_trait]
    impl Property for Register {
        fn encode_query(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
            out.extend_from_slice(&[ctx.drop_address() as u8, 0x00]);
            Ok(())
        }

        async fn decode_query(
            &mut self,
            ctx: &ExchangeContext<'_>,
            rx: &mut FrameReader<'_>,
        ) -> Result<()> {
            let frame = rx.read_exact(2).await?;
            if frame[0] != ctx.drop_address() as u8 {
                return Err(CommError::sentinel("wrong drop"));
            }
            self.value = Some(frame[1]);
            Ok(())
        }

        fn encode_store(&mut self, ctx: &ExchangeContext<'_>, out: &mut BytesMut) -> Result<()> {
            out.extend_from_slice(&[ctx.drop_address() as u8, 0x01, self.stored]);
            Ok(())
        }

        async fn decode_store(
            &mut self,
            _ctx: &ExchangeContext<'_>,
            rx: &mut FrameReader<'_>,
        ) -> Result<()> {
            rx.read_exact(1).await.map(|_| ())
        }
    }

    /// Property that supports nothing
    struct Opaque;

    impl fmt::Display for Opaque {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "opaque")
        }
    }

    impl Property for Opaque {}

    fn fixtures() -> (CommLink, Controller, LinkSequence) {
        (
            CommLink::new("line-1", "tcp://127.0.0.1:1", ProtocolKind::MemoryMapped),
            Controller::new("ctl-7", "line-1", 7),
            LinkSequence::new(),
        )
    }

    #[test]
    fn test_sequence_increments() {
        let seq = LinkSequence::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[tokio::test]
    async fn test_query_and_store_set() {
        let (link, ctl, seq) = fixtures();
        let (mut m, handle) = ScriptedMessenger::new(|req: &[u8]| match req[1] {
            0x00 => Reply::Bytes(vec![req[0], 0x42]),
            _ => Reply::Bytes(vec![0x06]),
        });
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);

        let mut a = Register::default();
        let mut b = Register {
            value: None,
            stored: 9,
        };
        {
            let mut set = PropertySet::new();
            set.add(&mut a).add(&mut b);
            assert_eq!(set.len(), 2);
            chan.query_props(&mut set).await.unwrap();
        }
        assert_eq!(a.value, Some(0x42));
        assert_eq!(b.value, Some(0x42));

        chan.store(&mut b).await.unwrap();
        assert_eq!(
            handle.sent(),
            vec![vec![7, 0], vec![7, 0], vec![7, 1, 9]]
        );
    }

    #[tokio::test]
    async fn test_short_reply_times_out_and_leaves_value() {
        let (link, ctl, seq) = fixtures();
        let (mut m, _handle) = ScriptedMessenger::new(|_req: &[u8]| Reply::Bytes(vec![7]));
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);

        let mut reg = Register::default();
        // One byte arrives, the second read times out
        let err = chan.query(&mut reg).await.unwrap_err();
        assert!(matches!(err, CommError::Timeout(_)));
        assert_eq!(reg.value, None);
    }

    #[tokio::test]
    async fn test_unsupported_direction() {
        let (link, ctl, seq) = fixtures();
        let (mut m, handle) = ScriptedMessenger::new(|_req: &[u8]| Reply::Silence);
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);
        let err = chan.query(&mut Opaque).await.unwrap_err();
        assert!(matches!(err, CommError::NotSupported(_)));
        assert_eq!(handle.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_frame_reader_read_until() {
        let (mut m, _handle) =
            ScriptedMessenger::new(|_req: &[u8]| Reply::Chunks(vec![b"00".to_vec(), b"12\rXY".to_vec()]));
        m.send(b"?").await.unwrap();
        let mut rx = FrameReader::new(&mut m);
        let line = rx.read_until(b'\r', 16).await.unwrap();
        assert_eq!(&line[..], b"0012\r");
        assert_eq!(rx.buffered(), 2);
        assert_eq!(rx.discard_buffered(), 2);
    }

    #[tokio::test]
    async fn test_frame_reader_read_until_limit() {
        let (mut m, _handle) = ScriptedMessenger::new(|_req: &[u8]| Reply::Bytes(vec![b'A'; 8]));
        m.send(b"?").await.unwrap();
        let mut rx = FrameReader::new(&mut m);
        assert!(matches!(
            rx.read_until(b'\r', 4).await,
            Err(CommError::Length(_))
        ));
    }
}
