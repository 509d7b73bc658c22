//! Comm link and controller domain objects
//!
//! Addressing and device-mapping metadata consumed by phases, plus the
//! controller status block written by operation cleanup.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CommError, ErrorClass, Result};

// ============================================================================
// Protocol and device kinds
// ============================================================================

/// Wire protocol spoken on a comm link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// SNMP over UDP or TCP
    Snmp,
    /// SNMP carried in HDLC frames on a point-to-point sign link
    NtcipHdlc,
    /// Serial memory-mapped ramp meter controllers
    MemoryMapped,
    /// ASCII-hex vehicle sensors
    AsciiHex,
    /// Gate arm controllers
    GateArm,
    /// Camera keyboard / video matrix switch
    Matrix,
}

impl ProtocolKind {
    /// Valid drop addresses for this protocol
    pub fn drop_range(&self) -> RangeInclusive<u16> {
        match self {
            ProtocolKind::Snmp => 0..=u16::MAX,
            ProtocolKind::NtcipHdlc => 0..=16383,
            ProtocolKind::MemoryMapped => 1..=31,
            ProtocolKind::AsciiHex => 0..=9999,
            ProtocolKind::GateArm => 1..=99,
            ProtocolKind::Matrix => 0..=255,
        }
    }

    pub fn is_drop_valid(&self, drop: u16) -> bool {
        self.drop_range().contains(&drop)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Snmp => "snmp",
            ProtocolKind::NtcipHdlc => "ntcip_hdlc",
            ProtocolKind::MemoryMapped => "memory_mapped",
            ProtocolKind::AsciiHex => "ascii_hex",
            ProtocolKind::GateArm => "gate_arm",
            ProtocolKind::Matrix => "matrix",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field device attached to a controller I/O pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Meter,
    Detector,
    Sign,
    Camera,
    GateArm,
    Alarm,
}

/// Device bound to one controller pin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRef {
    pub kind: DeviceKind,
    pub name: String,
}

// ============================================================================
// Comm link
// ============================================================================

/// Protocol options carried by a link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkOptions {
    /// SNMP community string
    pub community: Option<String>,
    /// SNMP error statuses accepted as success
    pub tolerated_errors: Vec<u8>,
    /// Wrap SNMP request ids at 127 for firmware that mishandles larger ids
    pub legacy_request_id_wrap: bool,
    /// Gate arm link password
    pub password: Option<String>,
    /// HDLC station address (none on point-to-point links)
    pub hdlc_address: Option<u16>,
}

/// Named transport endpoint
#[derive(Debug, Clone)]
pub struct CommLink {
    pub name: String,
    pub uri: String,
    pub protocol: ProtocolKind,
    pub multidrop: bool,
    /// Read timeout for each exchange
    pub timeout: Duration,
    pub options: LinkOptions,
}

impl CommLink {
    pub fn new(name: impl Into<String>, uri: impl Into<String>, protocol: ProtocolKind) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            protocol,
            multidrop: false,
            timeout: Duration::from_millis(750),
            options: LinkOptions::default(),
        }
    }

    pub fn with_multidrop(mut self, multidrop: bool) -> Self {
        self.multidrop = multidrop;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_options(mut self, options: LinkOptions) -> Self {
        self.options = options;
        self
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Per-controller operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpCounters {
    pub ok: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub checksum_errors: u64,
    pub parse_errors: u64,
    pub controller_errors: u64,
    pub download_requests: u64,
}

/// Mutable controller status
///
/// Written only by operation cleanup, read by anyone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStatus {
    /// Sticky last error; a later success does not clear it
    pub last_error: Option<String>,
    pub fail_time: Option<DateTime<Utc>>,
    pub failed: bool,
    pub firmware_version: Option<String>,
    pub counters: OpCounters,
}

/// Field controller addressed by a drop on one comm link
#[derive(Debug)]
pub struct Controller {
    name: String,
    link: String,
    drop: u16,
    io: BTreeMap<u16, DeviceRef>,
    status: RwLock<ControllerStatus>,
    exclusive: AtomicBool,
}

impl Controller {
    pub fn new(name: impl Into<String>, link: impl Into<String>, drop: u16) -> Self {
        Self {
            name: name.into(),
            link: link.into(),
            drop,
            io: BTreeMap::new(),
            status: RwLock::new(ControllerStatus::default()),
            exclusive: AtomicBool::new(false),
        }
    }

    /// Bind a device to an I/O pin
    pub fn with_device(mut self, pin: u16, kind: DeviceKind, name: impl Into<String>) -> Self {
        self.io.insert(
            pin,
            DeviceRef {
                kind,
                name: name.into(),
            },
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn drop_address(&self) -> u16 {
        self.drop
    }

    pub fn device(&self, pin: u16) -> Option<&DeviceRef> {
        self.io.get(&pin)
    }

    /// Pins and devices of one kind, in pin order
    pub fn devices_of(&self, kind: DeviceKind) -> impl Iterator<Item = (u16, &DeviceRef)> {
        self.io
            .iter()
            .filter(move |(_, dev)| dev.kind == kind)
            .map(|(pin, dev)| (*pin, dev))
    }

    pub fn io(&self) -> &BTreeMap<u16, DeviceRef> {
        &self.io
    }

    /// Snapshot of the current status
    pub fn status(&self) -> ControllerStatus {
        self.status.read().clone()
    }

    pub fn is_failed(&self) -> bool {
        self.status.read().failed
    }

    pub fn set_firmware_version(&self, version: impl Into<String>) {
        self.status.write().firmware_version = Some(version.into());
    }

    /// Check whether an exclusive operation currently holds this controller
    pub fn is_locked(&self) -> bool {
        self.exclusive.load(Ordering::Acquire)
    }

    /// Acquire the exclusive lock, or fail with a contention error
    pub fn try_lock(self: &Arc<Self>) -> Result<ControllerLock> {
        self.exclusive
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                CommError::contention(format!(
                    "{} already has an exclusive operation in flight",
                    self.name
                ))
            })?;
        Ok(ControllerLock {
            controller: Arc::clone(self),
        })
    }

    pub(crate) fn record_success(&self) {
        let mut status = self.status.write();
        status.failed = false;
        status.counters.ok += 1;
    }

    pub(crate) fn record_failure(&self, err: &CommError) {
        let mut status = self.status.write();
        // Valid reply; the link's download hook takes it from here
        if let CommError::DownloadRequest(_) = err {
            status.counters.download_requests += 1;
            return;
        }
        status.counters.failed += 1;
        match err {
            CommError::Timeout(_) => status.counters.timeouts += 1,
            CommError::Controller(_) | CommError::Status { .. } => {
                status.counters.controller_errors += 1
            },
            _ => match err.class() {
                ErrorClass::Framing => status.counters.checksum_errors += 1,
                ErrorClass::Protocol => status.counters.parse_errors += 1,
                _ => {},
            },
        }
        // Drained operations never reached the wire
        if err.class() != ErrorClass::Shutdown {
            status.failed = true;
            status.last_error = Some(err.to_string());
            status.fail_time = Some(Utc::now());
        }
    }
}

/// Exclusive hold on a controller, released on drop
#[derive(Debug)]
pub struct ControllerLock {
    controller: Arc<Controller>,
}

impl Drop for ControllerLock {
    fn drop(&mut self) {
        self.controller.exclusive.store(false, Ordering::Release);
    }
}
