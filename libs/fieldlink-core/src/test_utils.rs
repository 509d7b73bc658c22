//! Test utilities for fieldlink crates
//!
//! A scripted in-memory messenger: every `send` asks a responder closure what
//! the field device would answer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::{CommError, Result};
use crate::messenger::Messenger;

/// Device answer to one request
#[derive(Debug, Clone)]
pub enum Reply {
    /// One chunk of response bytes
    Bytes(Vec<u8>),
    /// Response delivered over several reads
    Chunks(Vec<Vec<u8>>),
    /// No answer; the next read times out
    Silence,
    /// Connection reset by the device
    Reset,
}

type Responder = Box<dyn FnMut(&[u8]) -> Reply + Send>;

/// Observation handle kept by the test after the messenger moves into a worker
#[derive(Debug, Clone, Default)]
pub struct ScriptHandle {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    closes: Arc<AtomicUsize>,
    drains: Arc<AtomicUsize>,
}

impl ScriptHandle {
    /// Every frame sent so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn drain_count(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }
}

/// Messenger answering from a closure
pub struct ScriptedMessenger {
    responder: Responder,
    pending: VecDeque<Vec<u8>>,
    reset: bool,
    timeout: Duration,
    handle: ScriptHandle,
}

impl ScriptedMessenger {
    pub fn new<F>(responder: F) -> (Self, ScriptHandle)
    where
        F: FnMut(&[u8]) -> Reply + Send + 'static,
    {
        let handle = ScriptHandle::default();
        let messenger = Self {
            responder: Box::new(responder),
            pending: VecDeque::new(),
            reset: false,
            timeout: Duration::from_millis(100),
            handle: handle.clone(),
        };
        (messenger, handle)
    }
}

#[async_trait]
impl Messenger for ScriptedMessenger {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.handle.sent.lock().push(frame.to_vec());
        match (self.responder)(frame) {
            Reply::Bytes(bytes) => self.pending.push_back(bytes),
            Reply::Chunks(chunks) => self.pending.extend(chunks),
            Reply::Silence => {},
            Reply::Reset => self.reset = true,
        }
        Ok(())
    }

    async fn recv(&mut self, buf: &mut BytesMut) -> Result<usize> {
        if let Some(chunk) = self.pending.pop_front() {
            buf.extend_from_slice(&chunk);
            return Ok(chunk.len());
        }
        if std::mem::take(&mut self.reset) {
            return Err(CommError::Reset("scripted reset".to_string()));
        }
        Err(CommError::timeout(format!(
            "scripted silence after {:?}",
            self.timeout
        )))
    }

    async fn drain(&mut self) {
        self.pending.clear();
        self.handle.drains.fetch_add(1, Ordering::SeqCst);
    }

    async fn close(&mut self) {
        self.pending.clear();
        self.reset = false;
        self.handle.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}
