//! Fieldlink Core
//!
//! Generic engine for polling and commanding field controllers over serial
//! and IP links.
//!
//! # Architecture
//!
//! - **Messenger**: owns one transport per comm link, optionally wrapped by a
//!   link-layer framer
//! - **Property**: codec for one piece of controller state
//! - **Operation / Phase**: explicit phase table driven one exchange at a time
//! - **Queue / Worker**: one worker per link, strict priority, FIFO among equals
//! - **Completer**: interval barrier aggregating sub-polls into one sample period
//!
//! Protocols supply "what bytes to send and how to read the reply"; this crate
//! supplies when, in what order, and what happens on failure.

pub mod completer;
pub mod cursor;
pub mod error;
pub mod framing;
pub mod messenger;
pub mod model;
pub mod operation;
pub mod property;
pub mod queue;
pub mod reconnect;
pub mod worker;

// Test utilities (for use in test code only)
pub mod test_utils;

// Re-export core types
pub use completer::{Completer, CompleterTicket, EpochSummary};
pub use cursor::ByteCursor;
pub use error::{CommError, ErrorClass, Result};
pub use framing::{FramedMessenger, LinkCodec};
pub use messenger::{hex_dump, Endpoint, Messenger, SerialSettings, StreamMessenger};
pub use model::{
    CommLink, Controller, ControllerLock, ControllerStatus, DeviceKind, DeviceRef, LinkOptions,
    OpCounters, ProtocolKind,
};
pub use operation::{Completion, Next, OpHandler, OpReport, Operation, Priority};
pub use property::{
    CommChannel, ExchangeContext, FrameReader, LinkSequence, Property, PropertySet,
};
pub use queue::OpQueue;
pub use reconnect::{ConnectionState, ReconnectHelper, ReconnectPolicy};
pub use worker::{DownloadHook, EngineSettings, LinkHandle, LinkSubmitter};
