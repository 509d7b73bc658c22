//! Sample and status operations submitted by the interval job
//!
//! One handler per protocol family. Each keeps the decoded values of its last
//! successful run in the shared [`SampleStore`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use fieldlink_core::{
    CommChannel, CommError, CompleterTicket, Completion, Controller, DeviceKind, DownloadHook,
    LinkHandle, LinkSubmitter, Next, OpHandler, Operation, Priority, ProtocolKind, Result,
};
use fieldlink_protocols::ascii_hex::SensorQuery;
use fieldlink_protocols::gate_arm::{ArmCommand, ArmState, GateArmStatus};
use fieldlink_protocols::matrix::MonitorSelection;
use fieldlink_protocols::memory::{Category, Command, MemoryProperty, RecordCount};
use fieldlink_protocols::snmp::ErrorStatus;
use fieldlink_protocols::{MibObject, SnmpMessage};

/// 30-second detector buffer: 24 volume bytes then 24 big-endian scan counts
pub const DETECTOR_BUFFER_ADDRESS: u16 = 0x034B;
pub const DETECTORS: usize = 24;
const DETECTOR_BUFFER_LEN: usize = DETECTORS * 3;

/// Occupancy scans taken in one 30-second sample (60 Hz)
pub const MAX_SCANS: u16 = 1800;

/// Firmware major and minor version bytes
pub const PROM_VERSION_ADDRESS: u16 = 0xFFF6;
/// Detector enable bitmap, one bit per detector input
pub const DETECTOR_BITMAP_ADDRESS: u16 = 0x0129;
/// I/O pin of detector input 0
pub const FIRST_DETECTOR_PIN: u16 = 39;

/// Vehicle speeds kept per sensor
pub const MAX_EVENTS: usize = 256;

const NTCIP_DMS: [u32; 10] = [1, 3, 6, 1, 4, 1, 1206, 4, 2, 3];

fn dms_oid(tail: &[u32]) -> Vec<u32> {
    let mut oid = NTCIP_DMS.to_vec();
    oid.extend_from_slice(tail);
    oid
}

// ============================================================================
// Sample store
// ============================================================================

/// Decoded values of one controller
#[derive(Debug, Clone, PartialEq)]
pub enum SampleData {
    Meter {
        volumes: Vec<u8>,
        scans: Vec<u16>,
        pending_records: u8,
    },
    Sign {
        photocell: Option<i32>,
        light_output: Option<i32>,
        cabinet_temp: Option<(i32, i32)>,
        /// Absent on signs without an ambient sensor
        ambient_temp: Option<(i32, i32)>,
    },
    Sensor {
        volume: u32,
        occupancy: u32,
        speed: Option<u32>,
    },
    GateArm {
        state: Option<ArmState>,
        fault: Option<u8>,
    },
    Matrix {
        /// (monitor, camera) pairs
        monitors: Vec<(u8, u16)>,
    },
}

impl SampleData {
    /// Percent occupancy of one detector
    pub fn occupancy(&self, detector: usize) -> Option<f32> {
        match self {
            SampleData::Meter { scans, .. } => scans
                .get(detector)
                .map(|&s| f32::from(s) * 100.0 / f32::from(MAX_SCANS)),
            _ => None,
        }
    }
}

impl fmt::Display for SampleData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleData::Meter {
                volumes,
                pending_records,
                ..
            } => {
                let total: u32 = volumes.iter().map(|&v| u32::from(v)).sum();
                write!(f, "volume {total}, {pending_records} records pending")
            },
            SampleData::Sign {
                light_output,
                cabinet_temp,
                ..
            } => write!(
                f,
                "light output {:?}%, cabinet {:?}",
                light_output, cabinet_temp
            ),
            SampleData::Sensor {
                volume,
                occupancy,
                speed,
            } => write!(f, "volume {volume}, occupancy {occupancy}, speed {speed:?}"),
            SampleData::GateArm { state, fault } => write!(f, "arm {state:?}, fault {fault:?}"),
            SampleData::Matrix { monitors } => write!(f, "{} monitors", monitors.len()),
        }
    }
}

/// A sample tagged with its interval
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub stamp: DateTime<Utc>,
    pub data: SampleData,
}

/// Latest sample per controller name
#[derive(Debug, Default)]
pub struct SampleStore {
    samples: DashMap<String, SampleRecord>,
    /// Speeds of individual vehicles, oldest first
    events: DashMap<String, Vec<u32>>,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, controller: &str) -> Option<SampleRecord> {
        self.samples.get(controller).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Recent vehicle speeds reported by a sensor
    pub fn speeds(&self, controller: &str) -> Vec<u32> {
        self.events
            .get(controller)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn record(&self, controller: &Controller, stamp: DateTime<Utc>, data: SampleData) {
        debug!(controller = %controller.name(), "Sample @ {}: {}", stamp, data);
        self.samples
            .insert(controller.name().to_string(), SampleRecord { stamp, data });
    }

    fn record_events(&self, controller: &Controller, speeds: &[u32]) {
        if speeds.is_empty() {
            return;
        }
        debug!(controller = %controller.name(), "{} vehicle events", speeds.len());
        let mut events = self.events.entry(controller.name().to_string()).or_default();
        events.extend_from_slice(speeds);
        let excess = events.len().saturating_sub(MAX_EVENTS);
        events.drain(..excess);
    }
}

/// Where a handler files its result
#[derive(Debug, Clone)]
pub struct SampleSink {
    pub store: Arc<SampleStore>,
    pub stamp: DateTime<Utc>,
}

// ============================================================================
// Ramp meter sample
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterPhase {
    DetectorData,
    RecordCount,
}

/// Detector volumes and scans, then the event record backlog
pub struct MeterSample {
    sink: SampleSink,
    buffer: MemoryProperty,
    records: RecordCount,
    data: Option<SampleData>,
}

impl MeterSample {
    pub fn new(sink: SampleSink) -> Self {
        Self {
            sink,
            buffer: MemoryProperty::read(DETECTOR_BUFFER_ADDRESS, DETECTOR_BUFFER_LEN),
            records: RecordCount::default(),
            data: None,
        }
    }

    fn decode_buffer(&self) -> Result<(Vec<u8>, Vec<u16>)> {
        let volumes = self
            .buffer
            .data()
            .get(..DETECTORS)
            .ok_or_else(|| CommError::length("short detector buffer"))?
            .to_vec();
        let scans = (0..DETECTORS)
            .map(|i| self.buffer.u16_at(DETECTORS + 2 * i))
            .collect::<Result<Vec<_>>>()?;
        if let Some(s) = scans.iter().find(|&&s| s > MAX_SCANS) {
            return Err(CommError::range(format!("{s} scans in one sample")));
        }
        Ok((volumes, scans))
    }
}

#[async_trait]
impl OpHandler for MeterSample {
    type Phase = MeterPhase;
    type Output = Option<SampleData>;

    fn name(&self) -> &str {
        "meter sample"
    }

    fn first_phase(&self) -> MeterPhase {
        MeterPhase::DetectorData
    }

    async fn poll(&mut self, phase: MeterPhase, chan: &mut CommChannel<'_>) -> Result<Next<MeterPhase>> {
        match phase {
            MeterPhase::DetectorData => {
                chan.query(&mut self.buffer).await?;
                Ok(Next::Goto(MeterPhase::RecordCount))
            },
            MeterPhase::RecordCount => {
                chan.query(&mut self.records).await?;
                let (volumes, scans) = self.decode_buffer()?;
                self.data = Some(SampleData::Meter {
                    volumes,
                    scans,
                    pending_records: self.records.count,
                });
                Ok(Next::Done)
            },
        }
    }

    fn on_success(&mut self, controller: &Controller) {
        if let Some(data) = &self.data {
            self.sink.store.record(controller, self.sink.stamp, data.clone());
        }
    }

    fn into_output(self) -> Option<SampleData> {
        self.data
    }
}

// ============================================================================
// Sign status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignPhase {
    Brightness,
    CabinetTemperature,
    AmbientTemperature,
}

/// Illumination and temperature status of a message sign
pub struct SignStatus {
    sink: SampleSink,
    photocell: Option<i32>,
    light_output: Option<i32>,
    cabinet_temp: Option<(i32, i32)>,
    ambient_temp: Option<(i32, i32)>,
    done: bool,
}

impl SignStatus {
    pub fn new(sink: SampleSink) -> Self {
        Self {
            sink,
            photocell: None,
            light_output: None,
            cabinet_temp: None,
            ambient_temp: None,
            done: false,
        }
    }

    fn data(&self) -> SampleData {
        SampleData::Sign {
            photocell: self.photocell,
            light_output: self.light_output,
            cabinet_temp: self.cabinet_temp,
            ambient_temp: self.ambient_temp,
        }
    }
}

fn min_max(msg: &SnmpMessage) -> Option<(i32, i32)> {
    Some((msg.get("min")?.as_integer()?, msg.get("max")?.as_integer()?))
}

#[async_trait]
impl OpHandler for SignStatus {
    type Phase = SignPhase;
    type Output = Option<SampleData>;

    fn name(&self) -> &str {
        "sign status"
    }

    fn first_phase(&self) -> SignPhase {
        SignPhase::Brightness
    }

    async fn poll(&mut self, phase: SignPhase, chan: &mut CommChannel<'_>) -> Result<Next<SignPhase>> {
        match phase {
            SignPhase::Brightness => {
                let mut msg = SnmpMessage::new(vec![
                    MibObject::new("photocell", dms_oid(&[7, 3, 0])),
                    MibObject::new("light_output", dms_oid(&[7, 9, 0])),
                ]);
                chan.query(&mut msg).await?;
                self.photocell = msg.get("photocell").and_then(MibObject::as_integer);
                self.light_output = msg.get("light_output").and_then(MibObject::as_integer);
                Ok(Next::Goto(SignPhase::CabinetTemperature))
            },
            SignPhase::CabinetTemperature => {
                let mut msg = SnmpMessage::new(vec![
                    MibObject::new("min", dms_oid(&[9, 8, 1, 0])),
                    MibObject::new("max", dms_oid(&[9, 8, 2, 0])),
                ]);
                chan.query(&mut msg).await?;
                self.cabinet_temp = min_max(&msg);
                Ok(Next::Goto(SignPhase::AmbientTemperature))
            },
            SignPhase::AmbientTemperature => {
                let mut msg = SnmpMessage::new(vec![
                    MibObject::new("min", dms_oid(&[9, 8, 3, 0])),
                    MibObject::new("max", dms_oid(&[9, 8, 4, 0])),
                ]);
                match chan.query(&mut msg).await {
                    Ok(()) => self.ambient_temp = min_max(&msg),
                    // Signs without an ambient sensor
                    Err(CommError::Status { code, .. })
                        if code == ErrorStatus::NoSuchName.code() =>
                    {
                        debug!(
                            controller = %chan.controller().name(),
                            "No ambient temperature sensor"
                        );
                    },
                    Err(e) => return Err(e),
                }
                self.done = true;
                Ok(Next::Done)
            },
        }
    }

    fn on_success(&mut self, controller: &Controller) {
        if self.done {
            self.sink.store.record(controller, self.sink.stamp, self.data());
        }
    }

    fn into_output(self) -> Option<SampleData> {
        self.done.then(|| self.data())
    }
}

// ============================================================================
// Vehicle sensor sample
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorPhase {
    Sample,
}

/// Volume, occupancy and speed from an ASCII sensor
pub struct SensorSample {
    sink: SampleSink,
    query: SensorQuery,
    data: Option<SampleData>,
}

impl SensorSample {
    pub fn new(sink: SampleSink) -> Self {
        Self {
            sink,
            query: SensorQuery::new("S"),
            data: None,
        }
    }
}

#[async_trait]
impl OpHandler for SensorSample {
    type Phase = SensorPhase;
    type Output = Option<SampleData>;

    fn name(&self) -> &str {
        "sensor sample"
    }

    fn first_phase(&self) -> SensorPhase {
        SensorPhase::Sample
    }

    async fn poll(&mut self, _phase: SensorPhase, chan: &mut CommChannel<'_>) -> Result<Next<SensorPhase>> {
        chan.query(&mut self.query).await?;
        let speed = match self.query.field("SPD") {
            Some(_) => Some(self.query.number("SPD")?),
            None => None,
        };
        self.data = Some(SampleData::Sensor {
            volume: self.query.number("V")?,
            occupancy: self.query.number("O")?,
            speed,
        });
        Ok(Next::Done)
    }

    fn on_success(&mut self, controller: &Controller) {
        if let Some(data) = &self.data {
            self.sink.store.record(controller, self.sink.stamp, data.clone());
        }
    }

    fn into_output(self) -> Option<SampleData> {
        self.data
    }
}

// ============================================================================
// Gate arm status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateArmPhase {
    Status,
}

pub struct GateArmPoll {
    sink: SampleSink,
    status: GateArmStatus,
    done: bool,
}

impl GateArmPoll {
    pub fn new(sink: SampleSink) -> Self {
        Self {
            sink,
            status: GateArmStatus::default(),
            done: false,
        }
    }

    fn data(&self) -> SampleData {
        SampleData::GateArm {
            state: self.status.state,
            fault: self.status.fault,
        }
    }
}

#[async_trait]
impl OpHandler for GateArmPoll {
    type Phase = GateArmPhase;
    type Output = Option<SampleData>;

    fn name(&self) -> &str {
        "gate arm status"
    }

    fn first_phase(&self) -> GateArmPhase {
        GateArmPhase::Status
    }

    async fn poll(&mut self, _phase: GateArmPhase, chan: &mut CommChannel<'_>) -> Result<Next<GateArmPhase>> {
        chan.query(&mut self.status).await?;
        self.done = true;
        Ok(Next::Done)
    }

    fn on_success(&mut self, controller: &Controller) {
        if self.done {
            self.sink.store.record(controller, self.sink.stamp, self.data());
        }
    }

    fn on_failure(&mut self, controller: &Controller, err: &CommError) {
        if matches!(err, CommError::Controller(_)) {
            debug!(controller = %controller.name(), "Gate arm refused status: {}", err);
        }
    }

    fn into_output(self) -> Option<SampleData> {
        self.done.then(|| self.data())
    }
}

// ============================================================================
// Matrix switch readback
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixPhase {
    /// Index into the monitor list
    Monitor(usize),
}

/// Camera shown on each monitor of a matrix switch
pub struct MatrixPoll {
    sink: SampleSink,
    monitors: Vec<u8>,
    shown: Vec<(u8, u16)>,
}

impl MatrixPoll {
    /// Monitors are the controller pins bound to cameras
    pub fn new(sink: SampleSink, controller: &Controller) -> Self {
        let mut monitors: Vec<u8> = controller
            .devices_of(DeviceKind::Camera)
            .filter_map(|(pin, _)| u8::try_from(pin).ok())
            .collect();
        if monitors.is_empty() {
            monitors.push(1);
        }
        Self {
            sink,
            monitors,
            shown: Vec::new(),
        }
    }
}

#[async_trait]
impl OpHandler for MatrixPoll {
    type Phase = MatrixPhase;
    type Output = Option<SampleData>;

    fn name(&self) -> &str {
        "matrix readback"
    }

    fn first_phase(&self) -> MatrixPhase {
        MatrixPhase::Monitor(0)
    }

    async fn poll(&mut self, phase: MatrixPhase, chan: &mut CommChannel<'_>) -> Result<Next<MatrixPhase>> {
        let MatrixPhase::Monitor(i) = phase;
        let monitor = self.monitors[i];
        let mut sel = MonitorSelection::new(monitor, 0);
        chan.query(&mut sel).await?;
        // A retried phase must not record the monitor twice
        self.shown.retain(|&(m, _)| m != monitor);
        self.shown.push((monitor, sel.camera));
        if i + 1 < self.monitors.len() {
            Ok(Next::Goto(MatrixPhase::Monitor(i + 1)))
        } else {
            Ok(Next::Done)
        }
    }

    fn on_success(&mut self, controller: &Controller) {
        let data = SampleData::Matrix {
            monitors: self.shown.clone(),
        };
        self.sink.store.record(controller, self.sink.stamp, data);
    }

    fn into_output(self) -> Option<SampleData> {
        Some(SampleData::Matrix {
            monitors: self.shown,
        })
    }
}

// ============================================================================
// Meter settings download
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    Restart,
    PromVersion,
    DetectorBitmap,
}

/// Settings for a meter controller that lost its configuration
///
/// Reads the firmware version, then writes the detector enable bitmap built
/// from the controller's detector pins.
pub struct MeterDownload {
    restart: bool,
    version: MemoryProperty,
    bitmap: MemoryProperty,
    firmware: Option<String>,
}

impl MeterDownload {
    pub fn new(controller: &Controller) -> Self {
        Self {
            restart: false,
            version: MemoryProperty::read(PROM_VERSION_ADDRESS, 2),
            bitmap: MemoryProperty::write(DETECTOR_BITMAP_ADDRESS, detector_bitmap(controller)),
            firmware: None,
        }
    }

    /// Start with a level-1 restart of the controller
    pub fn with_restart(mut self) -> Self {
        self.restart = true;
        self
    }
}

/// One bit per detector input, set where a detector is bound
pub fn detector_bitmap(controller: &Controller) -> Vec<u8> {
    let mut bitmap = vec![0u8; DETECTORS / 8];
    for (pin, _) in controller.devices_of(DeviceKind::Detector) {
        let Some(input) = pin.checked_sub(FIRST_DETECTOR_PIN).map(usize::from) else {
            continue;
        };
        if input < DETECTORS {
            bitmap[input / 8] |= 1 << (input % 8);
        }
    }
    bitmap
}

#[async_trait]
impl OpHandler for MeterDownload {
    type Phase = DownloadPhase;
    type Output = Option<String>;

    fn name(&self) -> &str {
        "meter download"
    }

    fn first_phase(&self) -> DownloadPhase {
        if self.restart {
            DownloadPhase::Restart
        } else {
            DownloadPhase::PromVersion
        }
    }

    async fn poll(&mut self, phase: DownloadPhase, chan: &mut CommChannel<'_>) -> Result<Next<DownloadPhase>> {
        match phase {
            DownloadPhase::Restart => {
                chan.store(&mut Command(Category::Level1Restart)).await?;
                Ok(Next::Goto(DownloadPhase::PromVersion))
            },
            DownloadPhase::PromVersion => {
                chan.query(&mut self.version).await?;
                let [major, minor] = self.version.data() else {
                    return Err(CommError::length("short firmware version"));
                };
                self.firmware = Some(format!("{major}.{minor}"));
                Ok(Next::Goto(DownloadPhase::DetectorBitmap))
            },
            DownloadPhase::DetectorBitmap => {
                chan.store(&mut self.bitmap).await?;
                Ok(Next::Done)
            },
        }
    }

    fn on_success(&mut self, controller: &Controller) {
        if let Some(version) = &self.firmware {
            info!(controller = %controller.name(), "Settings downloaded, firmware {}", version);
            controller.set_firmware_version(version.clone());
        }
    }

    fn into_output(self) -> Option<String> {
        self.firmware
    }
}

/// Download hook for memory-mapped links
///
/// The download holds its controller exclusively, so a second request while
/// one is in flight is dropped.
pub fn meter_download_hook() -> DownloadHook {
    Arc::new(|controller: &Arc<Controller>, link: &LinkSubmitter| {
        let op = Operation::new(
            Arc::clone(controller),
            Priority::Command,
            MeterDownload::new(controller),
        )
        .exclusive();
        if let Err(e) = link.submit(op) {
            warn!(controller = %controller.name(), "Settings download not queued: {}", e);
        }
    })
}

// ============================================================================
// Gate arm command
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateControlPhase {
    Command,
}

/// Arm movement request
pub struct GateArmControl {
    command: ArmCommand,
}

impl GateArmControl {
    pub fn new(command: ArmCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl OpHandler for GateArmControl {
    type Phase = GateControlPhase;
    type Output = ();

    fn name(&self) -> &str {
        "gate arm control"
    }

    fn first_phase(&self) -> GateControlPhase {
        GateControlPhase::Command
    }

    async fn poll(
        &mut self,
        _phase: GateControlPhase,
        chan: &mut CommChannel<'_>,
    ) -> Result<Next<GateControlPhase>> {
        chan.store(&mut self.command).await?;
        Ok(Next::Done)
    }

    fn on_success(&mut self, controller: &Controller) {
        info!(controller = %controller.name(), "{} acknowledged", self.command);
    }

    fn into_output(self) {}
}

// ============================================================================
// Vehicle event listen
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenPhase {
    Events,
}

/// Drains buffered vehicle events while the link has nothing else to do
///
/// Each cycle fetches one event; an empty reply means the buffer is empty.
/// `active` is cleared when the listen ends, however it ends.
pub struct SensorListen {
    store: Arc<SampleStore>,
    active: Arc<AtomicBool>,
    cycles: u32,
    speeds: Vec<u32>,
    events: usize,
}

impl SensorListen {
    pub fn new(store: Arc<SampleStore>, active: Arc<AtomicBool>, cycles: u32) -> Self {
        Self {
            store,
            active,
            cycles,
            speeds: Vec::new(),
            events: 0,
        }
    }

    fn finish(&mut self, controller: &Controller) {
        self.store.record_events(controller, &self.speeds);
        self.speeds.clear();
        self.active.store(false, Ordering::Release);
    }
}

#[async_trait]
impl OpHandler for SensorListen {
    type Phase = ListenPhase;
    type Output = usize;

    fn name(&self) -> &str {
        "sensor listen"
    }

    fn first_phase(&self) -> ListenPhase {
        ListenPhase::Events
    }

    async fn poll(&mut self, _phase: ListenPhase, chan: &mut CommChannel<'_>) -> Result<Next<ListenPhase>> {
        let mut query = SensorQuery::new("E");
        chan.query(&mut query).await?;
        if query.field("SPD").is_some() {
            self.speeds.push(query.number("SPD")?);
            self.events += 1;
        }
        Ok(Next::Again)
    }

    fn max_cycles(&self) -> Option<u32> {
        Some(self.cycles)
    }

    fn on_success(&mut self, controller: &Controller) {
        self.finish(controller);
    }

    fn on_failure(&mut self, controller: &Controller, _err: &CommError) {
        self.finish(controller);
    }

    fn into_output(self) -> usize {
        self.events
    }
}

// ============================================================================
// Submission
// ============================================================================

/// Queue the interval operation matching the link's protocol
///
/// The completion is not awaited; results land in the sink's store and the
/// ticket leaves its epoch when the operation finishes.
pub fn submit_sample(
    link: &LinkHandle,
    controller: &Arc<Controller>,
    ticket: CompleterTicket,
    sink: SampleSink,
) -> Result<()> {
    let ctl = Arc::clone(controller);
    match link.link().protocol {
        ProtocolKind::MemoryMapped => {
            let op = Operation::new(ctl, Priority::PollHigh, MeterSample::new(sink));
            link.submit(op.with_ticket(ticket)).map(drop)
        },
        ProtocolKind::AsciiHex => {
            let op = Operation::new(ctl, Priority::PollHigh, SensorSample::new(sink));
            link.submit(op.with_ticket(ticket)).map(drop)
        },
        ProtocolKind::Snmp | ProtocolKind::NtcipHdlc => {
            let op = Operation::new(ctl, Priority::PollLow, SignStatus::new(sink));
            link.submit(op.with_ticket(ticket)).map(drop)
        },
        ProtocolKind::GateArm => {
            let op = Operation::new(ctl, Priority::PollLow, GateArmPoll::new(sink));
            link.submit(op.with_ticket(ticket)).map(drop)
        },
        ProtocolKind::Matrix => {
            let handler = MatrixPoll::new(sink, controller);
            let op = Operation::new(ctl, Priority::PollLow, handler);
            link.submit(op.with_ticket(ticket)).map(drop)
        },
    }
}

/// Queue an arm movement; it holds the controller until acknowledged
pub fn submit_gate_command(
    link: &LinkHandle,
    controller: &Arc<Controller>,
    command: ArmCommand,
) -> Result<Completion<()>> {
    if link.link().protocol != ProtocolKind::GateArm {
        return Err(CommError::not_supported(format!(
            "{} on a {} link",
            command,
            link.link().protocol
        )));
    }
    let op = Operation::new(
        Arc::clone(controller),
        Priority::Command,
        GateArmControl::new(command),
    );
    link.submit(op.exclusive())
}

/// Queue an idle event listen on a sensor link
pub fn submit_listen(
    link: &LinkHandle,
    controller: &Arc<Controller>,
    store: Arc<SampleStore>,
    active: Arc<AtomicBool>,
    cycles: u32,
) -> Result<Completion<usize>> {
    let handler = SensorListen::new(store, active, cycles);
    link.submit(Operation::new(Arc::clone(controller), Priority::Idle, handler))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use bytes::BytesMut;
    use fieldlink_core::test_utils::{Reply, ScriptedMessenger};
    use fieldlink_core::{CommLink, EngineSettings, LinkOptions, LinkSequence};
    use fieldlink_protocols::ascii_hex::encode_line;
    use fieldlink_protocols::checksum;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn sink() -> SampleSink {
        SampleSink {
            store: Arc::new(SampleStore::new()),
            stamp: Utc::now(),
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            max_retries: 1,
            retry_backoff: Duration::from_millis(1),
        }
    }

    /// Memory-mapped reply with an XOR trailer
    fn memory_reply(drop: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![(drop as u8) << 3, payload.len() as u8];
        out.extend_from_slice(payload);
        out.push(out.iter().fold(0, |acc, b| acc ^ b));
        out
    }

    fn detector_buffer() -> Vec<u8> {
        let mut buf: Vec<u8> = (1..=DETECTORS as u8).collect();
        for i in 0..DETECTORS as u16 {
            buf.extend_from_slice(&(i * 10).to_be_bytes());
        }
        buf
    }

    #[tokio::test]
    async fn test_meter_sample_two_phases() {
        let (messenger, handle) = ScriptedMessenger::new(|req: &[u8]| {
            // ReadMemory is category 7; record count is 3
            match req[0] & 0x07 {
                7 => Reply::Bytes(memory_reply(5, &detector_buffer())),
                3 => Reply::Bytes(memory_reply(5, &[2])),
                _ => Reply::Silence,
            }
        });
        let link = CommLink::new("meters", "serial:///dev/ttyS0", ProtocolKind::MemoryMapped)
            .with_multidrop(true);
        let worker = LinkHandle::spawn(link, Box::new(messenger), settings());
        let ctl = Arc::new(Controller::new("M-5", "meters", 5));
        let sink = sink();
        let store = Arc::clone(&sink.store);

        let op = Operation::new(Arc::clone(&ctl), Priority::PollHigh, MeterSample::new(sink));
        let report = worker.submit(op).unwrap().report().await;
        let data = report.outcome.unwrap().unwrap();
        assert_eq!(report.phases, 2);
        assert_eq!(handle.sent_count(), 2);

        match &data {
            SampleData::Meter {
                volumes,
                scans,
                pending_records,
            } => {
                assert_eq!(volumes[0], 1);
                assert_eq!(volumes[23], 24);
                assert_eq!(scans[3], 30);
                assert_eq!(*pending_records, 2);
            },
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(data.occupancy(9), Some(5.0));
        assert_eq!(store.get("M-5").unwrap().data, data);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_meter_sample_rejects_impossible_scans() {
        let mut buffer = detector_buffer();
        buffer[DETECTORS..DETECTORS + 2].copy_from_slice(&2000u16.to_be_bytes());
        let (messenger, _) = ScriptedMessenger::new(move |req: &[u8]| match req[0] & 0x07 {
            7 => Reply::Bytes(memory_reply(5, &buffer)),
            _ => Reply::Bytes(memory_reply(5, &[0])),
        });
        let link = CommLink::new("meters", "serial:///dev/ttyS0", ProtocolKind::MemoryMapped);
        let worker = LinkHandle::spawn(link, Box::new(messenger), settings());
        let ctl = Arc::new(Controller::new("M-5", "meters", 5));
        let sink = sink();
        let store = Arc::clone(&sink.store);

        let op = Operation::new(Arc::clone(&ctl), Priority::PollHigh, MeterSample::new(sink));
        let result = worker.submit(op).unwrap().wait().await;
        assert!(matches!(result, Err(CommError::Range(_))));
        assert!(store.is_empty());
        assert_eq!(ctl.status().counters.failed, 1);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_sensor_sample() {
        let (mut m, _) = ScriptedMessenger::new(|_req: &[u8]| {
            let mut out = BytesMut::new();
            encode_line(42, "V=12,O=345,SPD=58", &mut out).unwrap();
            Reply::Bytes(out.to_vec())
        });
        let link = CommLink::new("sensors", "tcp://10.3.0.2:4001", ProtocolKind::AsciiHex);
        let ctl = Controller::new("S-42", "sensors", 42);
        let seq = LinkSequence::new();
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);

        let mut op = SensorSample::new(sink());
        assert_eq!(op.poll(SensorPhase::Sample, &mut chan).await.unwrap(), Next::Done);
        assert_eq!(
            op.into_output(),
            Some(SampleData::Sensor {
                volume: 12,
                occupancy: 345,
                speed: Some(58),
            })
        );
    }

    #[test]
    fn test_detector_bitmap() {
        let ctl = Controller::new("M-5", "meters", 5)
            .with_device(2, DeviceKind::Meter, "M5")
            .with_device(FIRST_DETECTOR_PIN, DeviceKind::Detector, "D1")
            .with_device(FIRST_DETECTOR_PIN + 2, DeviceKind::Detector, "D3")
            .with_device(FIRST_DETECTOR_PIN + 23, DeviceKind::Detector, "D24")
            .with_device(FIRST_DETECTOR_PIN + 24, DeviceKind::Detector, "out of range");
        assert_eq!(detector_bitmap(&ctl), vec![0x05, 0x00, 0x80]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_download_request_sends_settings() {
        let (messenger, handle) = ScriptedMessenger::new(|req: &[u8]| match (req[0] & 0x07, req.get(2..4)) {
            (7, Some([0xFF, 0xF6])) => Reply::Bytes(memory_reply(5, &[5, 4])),
            // Detector buffer read: controller lost its settings
            (7, _) => {
                let head = (5 << 3) | 3;
                Reply::Bytes(vec![head, 0x00, head])
            },
            (6, _) => Reply::Bytes(memory_reply(5, &[])),
            _ => Reply::Silence,
        });
        let link = CommLink::new("meters", "serial:///dev/ttyS0", ProtocolKind::MemoryMapped);
        let worker = LinkHandle::spawn_with_download(
            link,
            Box::new(messenger),
            settings(),
            meter_download_hook(),
        );
        let ctl = Arc::new(
            Controller::new("M-5", "meters", 5)
                .with_device(FIRST_DETECTOR_PIN, DeviceKind::Detector, "D1"),
        );
        let sink = sink();
        let store = Arc::clone(&sink.store);

        let op = Operation::new(Arc::clone(&ctl), Priority::PollHigh, MeterSample::new(sink));
        let result = worker.submit(op).unwrap().wait().await;
        assert!(matches!(result, Err(CommError::DownloadRequest(_))));
        assert!(store.is_empty());

        tokio::time::timeout(Duration::from_secs(2), async {
            while ctl.status().firmware_version.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let sent = handle.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(&sent[1][..5], &[0x2F, 0x03, 0xFF, 0xF6, 0x02]);
        assert_eq!(&sent[2][..7], &[0x2E, 0x05, 0x01, 0x29, 0x01, 0x00, 0x00]);

        let status = ctl.status();
        assert_eq!(status.firmware_version.as_deref(), Some("5.4"));
        assert_eq!(status.counters.download_requests, 1);
        assert!(!status.failed);
        assert!(!ctl.is_locked());
        assert!(logs_contain("Settings downloaded, firmware 5.4"));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_download_with_restart() {
        let (mut m, handle) = ScriptedMessenger::new(|req: &[u8]| match req[0] & 0x07 {
            7 => Reply::Bytes(memory_reply(5, &[4, 2])),
            _ => Reply::Bytes(memory_reply(5, &[])),
        });
        let link = CommLink::new("meters", "serial:///dev/ttyS0", ProtocolKind::MemoryMapped);
        let ctl = Controller::new("M-5", "meters", 5);
        let seq = LinkSequence::new();
        let mut chan = CommChannel::new(&mut m, &link, &ctl, &seq);

        let mut op = MeterDownload::new(&ctl).with_restart();
        let mut phase = op.first_phase();
        assert_eq!(phase, DownloadPhase::Restart);
        while let Next::Goto(next) = op.poll(phase, &mut chan).await.unwrap() {
            phase = next;
        }
        assert_eq!(phase, DownloadPhase::DetectorBitmap);
        assert_eq!(handle.sent()[0], vec![0x29, 0x00, 0x29]);
        assert_eq!(op.into_output().as_deref(), Some("4.2"));
    }

    fn gate_reply(drop: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0xFF];
        out.extend_from_slice(format!("{drop:02}").as_bytes());
        out.push(payload.len() as u8);
        out.extend_from_slice(payload);
        out.push(checksum::twos_complement8(&out[1..]));
        out
    }

    #[tokio::test]
    async fn test_gate_command_holds_controller() {
        let (messenger, handle) = ScriptedMessenger::new(|_req: &[u8]| Reply::Bytes(gate_reply(12, b"A")));
        let link = CommLink::new("gates", "tcp://10.4.0.3:7000", ProtocolKind::GateArm).with_options(
            LinkOptions {
                password: Some("s3cret".to_string()),
                ..LinkOptions::default()
            },
        );
        let worker = LinkHandle::spawn(link, Box::new(messenger), settings());
        let ctl = Arc::new(Controller::new("G-12", "gates", 12));

        let open = submit_gate_command(&worker, &ctl, ArmCommand::Open).unwrap();
        assert!(ctl.is_locked());
        let close = submit_gate_command(&worker, &ctl, ArmCommand::Close);
        assert!(matches!(close, Err(CommError::Contention(_))));

        open.wait().await.unwrap();
        assert!(!ctl.is_locked());
        submit_gate_command(&worker, &ctl, ArmCommand::Close)
            .unwrap()
            .wait()
            .await
            .unwrap();

        let sent = handle.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!((sent[0][4], sent[1][4]), (b'O', b'C'));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_gate_command_needs_gate_link() {
        let (messenger, _) = ScriptedMessenger::new(|_req: &[u8]| Reply::Silence);
        let link = CommLink::new("sensors", "tcp://10.3.0.2:4001", ProtocolKind::AsciiHex);
        let worker = LinkHandle::spawn(link, Box::new(messenger), settings());
        let ctl = Arc::new(Controller::new("S-42", "sensors", 42));
        let result = submit_gate_command(&worker, &ctl, ArmCommand::Open);
        assert!(matches!(result, Err(CommError::NotSupported(_))));
        assert!(!ctl.is_locked());
        worker.shutdown().await;
    }

    fn event_sensor(events: Vec<&'static str>) -> (LinkHandle, fieldlink_core::test_utils::ScriptHandle) {
        let mut pending = events.into_iter();
        let (messenger, handle) = ScriptedMessenger::new(move |req: &[u8]| {
            let payload = match req[4] {
                b'E' => pending.next().unwrap_or(""),
                _ => "V=1,O=2",
            };
            let mut out = BytesMut::new();
            encode_line(42, payload, &mut out).unwrap();
            Reply::Bytes(out.to_vec())
        });
        let link = CommLink::new("sensors", "tcp://10.3.0.2:4001", ProtocolKind::AsciiHex);
        (LinkHandle::spawn(link, Box::new(messenger), settings()), handle)
    }

    #[tokio::test]
    async fn test_sensor_listen_collects_events() {
        let (worker, handle) = event_sensor(vec!["SPD=55", "", "SPD=61,LEN=18", "SPD=58"]);
        let ctl = Arc::new(Controller::new("S-42", "sensors", 42));
        let store = Arc::new(SampleStore::new());
        let active = Arc::new(AtomicBool::new(true));

        let listen = submit_listen(&worker, &ctl, Arc::clone(&store), Arc::clone(&active), 6).unwrap();
        assert_eq!(listen.wait().await.unwrap(), 3);
        assert_eq!(store.speeds("S-42"), vec![55, 61, 58]);
        assert!(!active.load(Ordering::Acquire));
        assert_eq!(handle.sent_count(), 6);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_listen_and_sample_share_link() {
        let (worker, handle) = event_sensor(Vec::new());
        let ctl = Arc::new(Controller::new("S-42", "sensors", 42));
        let store = Arc::new(SampleStore::new());
        let active = Arc::new(AtomicBool::new(true));

        let listen = submit_listen(&worker, &ctl, Arc::clone(&store), Arc::clone(&active), 50).unwrap();
        let sink = SampleSink {
            store: Arc::clone(&store),
            stamp: Utc::now(),
        };
        let sample = Operation::new(Arc::clone(&ctl), Priority::PollHigh, SensorSample::new(sink));
        let data = worker.submit(sample).unwrap().wait().await.unwrap();
        assert!(matches!(data, Some(SampleData::Sensor { volume: 1, .. })));

        assert_eq!(listen.wait().await.unwrap(), 0);
        assert!(!active.load(Ordering::Acquire));
        assert!(store.speeds("S-42").is_empty());
        let sent = handle.sent();
        assert_eq!(sent.len(), 51);
        assert_eq!(sent.iter().filter(|req| req[4] == b'S').count(), 1);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_drained_listen_releases_flag() {
        let (worker, handle) = event_sensor(vec!["SPD=40"]);
        let ctl = Arc::new(Controller::new("S-42", "sensors", 42));
        let active = Arc::new(AtomicBool::new(true));
        let listen =
            submit_listen(&worker, &ctl, Arc::new(SampleStore::new()), Arc::clone(&active), 5).unwrap();
        assert_eq!(worker.shutdown().await, 1);
        assert!(matches!(listen.wait().await, Err(CommError::QueueDrained)));
        assert!(!active.load(Ordering::Acquire));
        assert_eq!(handle.sent_count(), 0);
    }

    #[test]
    fn test_matrix_monitors_from_camera_pins() {
        let ctl = Controller::new("KB-3", "matrix", 3)
            .with_device(4, DeviceKind::Camera, "C-401")
            .with_device(2, DeviceKind::Camera, "C-215")
            .with_device(9, DeviceKind::Alarm, "door");
        let op = MatrixPoll::new(sink(), &ctl);
        assert_eq!(op.monitors, vec![2, 4]);

        let bare = Controller::new("KB-4", "matrix", 4);
        assert_eq!(MatrixPoll::new(sink(), &bare).monitors, vec![1]);
    }
}
