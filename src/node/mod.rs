//! Per-device protocol driver.
//!
//! Everything specific to one radio-attached node lives here: the reliable
//! command transport, the inbound packet demultiplexer, the sensor
//! configuration cache ([`pages`]), the measurement data-stream reassembler
//! ([`stream`]) and firmware upload ([`upload`]).
//!
//! # Reliable transport
//!
//! A node processes commands identified by a 5-bit sequence number. The host
//! keeps 32 slots; each remembers the last packet sent under its id, how many
//! transmissions are still unanswered, and when the id was last used. A slot
//! can only be reused once it is quiescent — either every transmission was
//! answered, or the node has reported an empty transmit buffer (a "no-data
//! info" packet) well after the last transmission under that id. This is what
//! protects a new command from being resolved by a stale duplicate response
//! to an earlier command that happened to use the same id.
//!
//! Command packets over the radio look like:
//!
//! ```notrust
//! offset  0        2      3      4
//!         +--------+------+------+------------------------ - -
//!         | msg    | arg  | seq  | payload (up to 24 bytes)
//!         | (u16)  | (u8) | (u8) |
//!         +--------+------+------+------------------------ - -
//! ```
//!
//! Inbound packets are classified by byte 3: `0xFF` is a no-data info
//! barrier, a clear top bit is a data-stream packet (15-bit sequence number
//! in bytes 2..4), and `100sssss` is the response to command slot `sssss`
//! with the result status in byte 2 and the payload from byte 4.

pub(crate) mod pages;
pub(crate) mod stream;
pub(crate) mod upload;

pub(crate) use self::pages::Transfer;
pub use self::stream::MeasurementStats;

use crate::config::Config;
use crate::device_id::{DeviceId, DeviceInfo};
use crate::hooks::{AttrDataHook, DecodedDataHook, RawDataHook};
use crate::hub::Router;
use crate::mailbox::Mailbox;
use crate::sensor::{self, AttrValue, SensorDriver, SensorPages, PAGES_PER_SENSOR, SENSOR_SLOTS};
use crate::stats::DeltaTracker;
use crate::time::Clock;
use crate::util::{self, HexSlice};
use crate::Error;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Number of reliable-transport sequence slots.
const SLOT_COUNT: usize = 32;

/// Maximum payload of a reliable command (28-byte radio payload minus the
/// 4-byte command header).
const MAX_CMD_PAYLOAD: usize = 24;

/// A no-data barrier this long after the last transmission under a slot
/// means no more responses for the old command can arrive. The margin covers
/// the node's maximum command processing time.
const NO_DATA_BARRIER: Duration = Duration::from_millis(50);

/// Poll the node when allocation is stuck and nothing was heard for this
/// long.
const IDLE_BEFORE_POLL: Duration = Duration::from_millis(20);

/// How long a stuck allocation waits for the next inbound packet.
const ALLOC_RETRY_WAIT: Duration = Duration::from_millis(10);

/// How long a caller may wait for a free sequence slot.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result status reported while the node is busy writing or measuring.
pub(crate) const STATUS_BUSY: u8 = 5;

/// A backward stream-sequence jump of at least this many packets is treated
/// as a wrapped 15-bit extension rather than reordering.
const BACKWARD_JUMP_LIMIT: i32 = 0x2000;

/// Response to one reliable command.
#[derive(Clone, Debug)]
pub struct CmdReply {
    /// Result status byte; 0 is success.
    pub status: u8,
    /// Response payload (24 bytes on the wire, trailing part type-specific).
    pub data: Vec<u8>,
}

struct LinkState {
    next_seq: usize,
    active: usize,
    cmd_data: [Vec<u8>; SLOT_COUNT],
    listeners: [Option<Arc<Mailbox<CmdReply>>>; SLOT_COUNT],
    pending_rx: [u32; SLOT_COUNT],
    last_tx: [Option<Instant>; SLOT_COUNT],
    last_rx: Option<Instant>,
    last_no_data: Option<Instant>,
    bitrate: u32,
    data_seq: u32,
    telemetry: DeltaTracker,
}

#[derive(Default)]
struct NodeHooks {
    raw: Option<Arc<dyn RawDataHook>>,
    attr: Option<Arc<dyn AttrDataHook>>,
    decoded: Option<Arc<dyn DecodedDataHook>>,
}

pub(crate) struct MeasureState {
    series_header: [Option<[u8; sensor::PAGE_LEN]>; stream::SERIES_PAGES],
    pages: Vec<SensorPages>,
    dirty: Vec<[bool; PAGES_PER_SENSOR]>,
    sensors: BTreeMap<u8, SensorDriver>,
    decoder: stream::DecoderState,
}

impl MeasureState {
    fn new() -> Self {
        MeasureState {
            series_header: Default::default(),
            pages: vec![[[0; sensor::PAGE_LEN]; PAGES_PER_SENSOR]; SENSOR_SLOTS],
            dirty: vec![[false; PAGES_PER_SENSOR]; SENSOR_SLOTS],
            sensors: BTreeMap::new(),
            decoder: stream::DecoderState::new(),
        }
    }
}

/// Driver for one radio-attached multi-sensor node.
///
/// Created by the routing hub when the node first announces itself; obtained
/// through [`Hub::device`]. All operations fail with `DeviceDropped` once the
/// device has been dropped for re-discovery.
///
/// [`Hub::device`]: ../hub/struct.Hub.html#method.device
pub struct Node {
    id: DeviceId,
    info: Option<DeviceInfo>,
    router: Weak<dyn Router>,
    clock: Arc<dyn Clock>,
    cfg: Config,
    link: Mutex<LinkState>,
    cmd_finished: Condvar,
    packet_received: Condvar,
    measure: Mutex<MeasureState>,
    hooks: RwLock<NodeHooks>,
    dropped: AtomicBool,
    discovered: AtomicBool,
}

impl Node {
    pub(crate) fn new_basic(
        router: Weak<dyn Router>,
        id: DeviceId,
        info: Option<DeviceInfo>,
        cfg: &Config,
        clock: Arc<dyn Clock>,
    ) -> Arc<Node> {
        Arc::new(Node {
            id,
            info,
            router,
            clock,
            cfg: cfg.clone(),
            link: Mutex::new(LinkState {
                next_seq: 0,
                active: 0,
                cmd_data: Default::default(),
                listeners: Default::default(),
                pending_rx: [0; SLOT_COUNT],
                last_tx: [None; SLOT_COUNT],
                last_rx: None,
                last_no_data: None,
                bitrate: 0,
                data_seq: 0,
                telemetry: DeltaTracker::new(0xFFFF),
            }),
            cmd_finished: Condvar::new(),
            packet_received: Condvar::new(),
            measure: Mutex::new(MeasureState::new()),
            hooks: RwLock::new(NodeHooks::default()),
            dropped: AtomicBool::new(false),
            discovered: AtomicBool::new(false),
        })
    }

    /// Constructor registered for the multi-sensor protocol: starts the
    /// sensor-discovery worker alongside the driver.
    pub(crate) fn new_multisensor(
        router: Weak<dyn Router>,
        id: DeviceId,
        info: Option<DeviceInfo>,
        cfg: &Config,
        clock: Arc<dyn Clock>,
    ) -> Arc<Node> {
        let node = Self::new_basic(router, id, info, cfg, clock);
        let worker = node.clone();
        thread::Builder::new()
            .name(format!("discover-{:08X}", id.serial))
            .spawn(move || {
                if let Err(err) = worker.run_discovery() {
                    error!("discovery of device {} failed: {}", worker.id, err);
                    if let Some(router) = worker.router.upgrade() {
                        router.drop_device(&worker.id);
                    }
                }
            })
            .expect("spawning discovery worker");
        node
    }

    /// The node's hardware identity.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Protocol and firmware information, if announced.
    pub fn info(&self) -> Option<DeviceInfo> {
        self.info
    }

    /// Whether the sensor inventory has been downloaded.
    pub fn is_discovered(&self) -> bool {
        self.discovered.load(Ordering::Acquire)
    }

    /// Whether the device has been dropped for re-discovery.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Ids and display names of all discovered sensors.
    pub fn sensors(&self) -> Vec<(u8, String)> {
        util::lock(&self.measure)
            .sensors
            .values()
            .map(|s| (s.id, s.name.clone()))
            .collect()
    }

    /// Most recent per-second link telemetry rates.
    pub fn telemetry_delta(&self) -> Option<Vec<f64>> {
        util::lock(&self.link).telemetry.delta()
    }

    /// Average data bit rate last reported by the node.
    pub fn bitrate(&self) -> u32 {
        util::lock(&self.link).bitrate
    }

    pub fn set_raw_data_hook(&self, hook: Arc<dyn RawDataHook>) {
        util::write(&self.hooks).raw = Some(hook);
    }

    pub fn set_attr_data_hook(&self, hook: Arc<dyn AttrDataHook>) {
        util::write(&self.hooks).attr = Some(hook);
    }

    pub fn set_decoded_data_hook(&self, hook: Arc<dyn DecodedDataHook>) {
        util::write(&self.hooks).decoded = Some(hook);
    }

    /// Reads an attribute of a discovered sensor from the page cache.
    pub fn get_attr(&self, sensor: u8, attr: &str) -> Result<AttrValue, Error> {
        let m = util::lock(&self.measure);
        let driver = m.sensors.get(&sensor).ok_or(Error::InvalidValue)?;
        driver.attr_value(&m.pages[sensor as usize], attr)
    }

    /// Updates an attribute in the page cache; the change reaches the node
    /// with the next commit.
    pub fn set_attr(&self, sensor: u8, attr: &str, value: &str) -> Result<(), Error> {
        let mut m = util::lock(&self.measure);
        let m = &mut *m;
        let driver = m.sensors.get(&sensor).ok_or(Error::InvalidValue)?;
        let attribute = driver
            .attrs
            .get(attr)
            .ok_or_else(|| Error::UnknownAttribute(attr.to_string()))?;
        attribute.set(
            &mut m.pages[sensor as usize],
            &mut m.dirty[sensor as usize],
            value,
        )
    }

    pub(crate) fn destroy(&self) {
        self.dropped.store(true, Ordering::Release);
        // Wake anything blocked on slot allocation so it observes the flag.
        self.cmd_finished.notify_all();
        self.packet_received.notify_all();
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if self.is_dropped() {
            Err(Error::DeviceDropped {
                serial: self.id.serial,
            })
        } else {
            Ok(())
        }
    }

    fn router(&self) -> Result<Arc<dyn Router>, Error> {
        self.router.upgrade().ok_or(Error::NoRoute {
            serial: self.id.serial,
        })
    }

    /// Reserves a sequence slot and prepares the command packet. The packet
    /// is transmitted by the following [`cmd_attempt`] / [`finish_cmd`].
    ///
    /// Returns the claimed slot id.
    ///
    /// [`cmd_attempt`]: #method.cmd_attempt
    /// [`finish_cmd`]: #method.finish_cmd
    pub fn async_cmd(&self, cmd: u16, arg: u8, payload: &[u8]) -> Result<u8, Error> {
        self.ensure_live()?;
        if payload.len() > MAX_CMD_PAYLOAD {
            return Err(Error::InvalidLength);
        }
        let mut link = util::lock(&self.link);
        let seq = loop {
            self.ensure_live()?;
            while link.active == SLOT_COUNT {
                // Too many commands in progress, wait for one to finish.
                let (guard, result) = self
                    .cmd_finished
                    .wait_timeout(link, ACQUIRE_TIMEOUT)
                    .unwrap_or_else(|e| e.into_inner());
                link = guard;
                self.ensure_live()?;
                if result.timed_out() && link.active == SLOT_COUNT {
                    return Err(Error::SequenceExhausted);
                }
            }

            let mut claimed = None;
            let mut poll = false;
            for _ in 0..SLOT_COUNT {
                link.next_seq = (link.next_seq + 1) % SLOT_COUNT;
                let s = link.next_seq;
                if link.listeners[s].is_some() {
                    // That sequence number is in use, try the next one.
                    continue;
                }
                // If the last no-data info arrived significantly after the
                // last transmission under this id, no more replies to the
                // old command can arrive.
                if let (Some(no_data), Some(tx)) = (link.last_no_data, link.last_tx[s]) {
                    if no_data.checked_duration_since(tx).map_or(false, |d| d > NO_DATA_BARRIER) {
                        link.pending_rx[s] = 0;
                    }
                }
                if link.pending_rx[s] > 0 {
                    // A stale duplicate response might still arrive for this
                    // id; look for another one.
                    poll = true;
                    continue;
                }
                claimed = Some(s);
                break;
            }
            if let Some(s) = claimed {
                break s;
            }
            if poll {
                let now = self.clock.now();
                let idle = match link.last_rx {
                    Some(rx) => now.checked_duration_since(rx).unwrap_or_default(),
                    None => Duration::from_secs(u64::MAX >> 1),
                };
                if idle > IDLE_BEFORE_POLL {
                    // Ask the node whether its buffers are empty; the no-data
                    // answer quiesces the skipped slots.
                    drop(link);
                    self.router()?.poll_device(&self.id)?;
                    link = util::lock(&self.link);
                }
            }
            // Wait for any packet before scanning all sequence numbers
            // again.
            let (guard, _) = self
                .packet_received
                .wait_timeout(link, ALLOC_RETRY_WAIT)
                .unwrap_or_else(|e| e.into_inner());
            link = guard;
        };

        link.active += 1;
        link.listeners[seq] = Some(Arc::new(Mailbox::new()));
        link.pending_rx[seq] = 0;
        let mut data = Vec::with_capacity(4 + payload.len());
        data.extend_from_slice(&cmd.to_le_bytes());
        data.push(arg);
        data.push(seq as u8);
        data.extend_from_slice(payload);
        link.cmd_data[seq] = data;
        Ok(seq as u8)
    }

    /// Attempts a (re-)transmission of the command in slot `seq`.
    pub fn cmd_attempt(&self, seq: u8) -> Result<(), Error> {
        self.ensure_live()?;
        let s = usize::from(seq) % SLOT_COUNT;
        let data = {
            let mut link = util::lock(&self.link);
            link.pending_rx[s] += 1;
            link.last_tx[s] = Some(self.clock.now());
            link.cmd_data[s].clone()
        };
        let router = self.router()?;
        router.send_packet(&self.id, &data)?;
        // Trigger polling the device for a reply.
        router.poll_device(&self.id)
    }

    /// Whether the command in slot `seq` has received its response.
    pub fn is_cmd_done(&self, seq: u8) -> Result<bool, Error> {
        self.ensure_live()?;
        let link = util::lock(&self.link);
        match &link.listeners[usize::from(seq) % SLOT_COUNT] {
            Some(mailbox) => Ok(mailbox.is_filled()),
            None => Err(Error::InvalidValue),
        }
    }

    /// Cancels a running command, or cleans up after a finished one.
    ///
    /// The transmission count and time of the slot are kept so a future
    /// allocation can rule out stale responses before reusing the id.
    pub fn cancel_cmd(&self, seq: u8) {
        let mut link = util::lock(&self.link);
        let s = usize::from(seq) % SLOT_COUNT;
        if link.listeners[s].take().is_some() {
            link.active -= 1;
            self.cmd_finished.notify_one();
        }
    }

    /// Collects the response of an asynchronous command, retransmitting up
    /// to `attempts` times every `reply_timeout`. The slot is released in
    /// every outcome.
    pub fn finish_cmd(
        &self,
        seq: u8,
        reply_timeout: Duration,
        attempts: u32,
    ) -> Result<CmdReply, Error> {
        let result = self.finish_cmd_inner(seq, reply_timeout, attempts);
        self.cancel_cmd(seq);
        result
    }

    fn finish_cmd_inner(
        &self,
        seq: u8,
        reply_timeout: Duration,
        attempts: u32,
    ) -> Result<CmdReply, Error> {
        let mailbox = {
            let link = util::lock(&self.link);
            link.listeners[usize::from(seq) % SLOT_COUNT]
                .clone()
                .ok_or(Error::InvalidValue)?
        };
        let mut last_error = None;
        for _ in 0..attempts {
            self.ensure_live()?;
            if !mailbox.is_filled() {
                if let Err(err) = self.cmd_attempt(seq) {
                    // Usually no route to the device; remember the error and
                    // wait one retransmission interval before trying again.
                    last_error = Some(err);
                    thread::sleep(reply_timeout);
                    continue;
                }
            }
            if let Some(reply) = mailbox.wait(reply_timeout) {
                return Ok(reply);
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Err(Error::CommandTimeout {
                serial: self.id.serial,
            }),
        }
    }

    /// Synchronous reliable command execution.
    pub fn cmd(&self, cmd: u16, arg: u8, payload: &[u8]) -> Result<CmdReply, Error> {
        let seq = self.async_cmd(cmd, arg, payload)?;
        self.finish_cmd(seq, self.cfg.reply_timeout, self.cfg.max_attempts)
    }

    /// Turns a non-zero result status into an error.
    pub fn check(&self, reply: CmdReply) -> Result<CmdReply, Error> {
        if reply.status != 0 {
            return Err(Error::Status {
                serial: self.id.serial,
                status: reply.status,
            });
        }
        Ok(reply)
    }

    /// Differentiates the link telemetry counters; driven by the routing
    /// hub's telemetry task.
    pub(crate) fn snapshot_telemetry(&self, interval: Duration) {
        util::lock(&self.link).telemetry.snapshot(interval);
    }

    /// Demultiplexes one inbound radio packet from this node.
    pub(crate) fn handle_packet(&self, sof_count: u16, packet: &[u8]) {
        if self.is_dropped() {
            return;
        }
        if packet.len() < 4 {
            warn!("runt packet from device {}: {:?}", self.id, HexSlice(packet));
            return;
        }
        let now = self.clock.now();
        let mut data_seq = None;
        {
            let mut link = util::lock(&self.link);
            link.last_rx = Some(now);
            self.packet_received.notify_all();
            let kind = packet[3];
            if kind == 0xFF {
                // No-data info: the node's transmit buffer is empty. This is
                // the barrier that quiesces stale command slots.
                link.last_no_data = Some(now);
                if packet.len() >= 32 {
                    link.bitrate =
                        u32::from_le_bytes([packet[8], packet[9], packet[10], packet[11]]);
                    link.data_seq =
                        u32::from_le_bytes([packet[12], packet[13], packet[14], packet[15]]);
                    let mut counters = Vec::with_capacity(9);
                    counters.push(u64::from(sof_count));
                    for pair in packet[16..32].chunks_exact(2) {
                        counters.push(u64::from(u16::from_le_bytes([pair[0], pair[1]])));
                    }
                    link.telemetry.update(counters);
                } else {
                    warn!("truncated no-data info from device {}", self.id);
                }
            } else if kind & 0x80 == 0 {
                // Data-stream packet; extend the 15-bit wire counter to the
                // full 32-bit sequence number in the direction of the
                // smallest distance.
                let seq15 = u16::from_le_bytes([packet[2], packet[3]]);
                let current = (link.data_seq & 0x7FFF) as u16;
                let mut delta = i32::from(seq15.wrapping_sub(current) & 0x7FFF);
                if delta & 0x4000 != 0 {
                    delta -= 0x8000;
                }
                if delta <= -BACKWARD_JUMP_LIMIT {
                    error!(
                        "{}",
                        Error::StreamDesync {
                            serial: self.id.serial,
                            delta: (-delta) as u32,
                        }
                    );
                } else {
                    link.data_seq = link.data_seq.wrapping_add(delta as u32);
                    data_seq = Some(link.data_seq);
                }
            } else if kind >> 5 == 0b100 {
                // Command response for slot `kind & 0x1f`.
                let s = usize::from(kind & 0x1F);
                link.pending_rx[s] = link.pending_rx[s].saturating_sub(1);
                if let Some(mailbox) = link.listeners[s].clone() {
                    mailbox.put(CmdReply {
                        status: packet[2],
                        data: packet[4..].to_vec(),
                    });
                }
            }
        }
        if let Some(seq32) = data_seq {
            self.handle_data_packet(sof_count, seq32, &packet[4..]);
        }
    }

    /// Sensor discovery, run once when the driver is instantiated.
    fn run_discovery(&self) -> Result<(), Error> {
        // Leave upload mode just in case; reports success when already idle.
        self.stop_upload()?;
        // A BUSY series header read means a measurement may be running; stop
        // it and retry. Other BUSY causes are transient.
        loop {
            let reply = self.read_series_header_page(0)?;
            if reply.status != STATUS_BUSY {
                break;
            }
            let stopped = self.stop_measurement()?;
            self.check(stopped)?;
        }
        self.reload_sensor_data()?;
        {
            let mut m = util::lock(&self.measure);
            let m = &mut *m;
            for slot in 0..SENSOR_SLOTS {
                if sensor::page_present(&m.pages[slot][0]) {
                    m.sensors
                        .insert(slot as u8, sensor::instantiate(slot as u8, &m.pages[slot][0]));
                }
            }
        }
        self.discovered.store(true, Ordering::Release);
        info!("device {} sensors:", self.id);
        for (id, name) in self.sensors() {
            info!("    sensor {:2}: {}", id, name);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Router mock: records transmissions, optionally answers them.
    pub(crate) struct MockRouter {
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub polls: Mutex<u32>,
        pub dropped: Mutex<Vec<DeviceId>>,
        pub node: Mutex<Weak<Node>>,
        /// Maps a transmitted radio payload to `(response packet, delay)`.
        pub responder:
            Mutex<Option<Box<dyn Fn(&[u8]) -> Option<(Vec<u8>, Duration)> + Send + Sync>>>,
    }

    impl MockRouter {
        pub fn new() -> Arc<MockRouter> {
            Arc::new(MockRouter {
                sent: Mutex::new(Vec::new()),
                polls: Mutex::new(0),
                dropped: Mutex::new(Vec::new()),
                node: Mutex::new(Weak::new()),
                responder: Mutex::new(None),
            })
        }

        pub fn set_responder(
            &self,
            f: impl Fn(&[u8]) -> Option<(Vec<u8>, Duration)> + Send + Sync + 'static,
        ) {
            *util::lock(&self.responder) = Some(Box::new(f));
        }

        /// Answers every command with status 0 and the sent header echoed
        /// into the payload.
        pub fn echo_ok(&self) {
            self.set_responder(|sent| Some((echo_response(sent, 0), Duration::from_millis(0))));
        }
    }

    /// Builds a well-formed response packet for a transmitted command.
    pub(crate) fn echo_response(sent: &[u8], status: u8) -> Vec<u8> {
        let seq = sent[3] & 0x1F;
        let mut packet = vec![0x05, 0x00, status, 0x80 | seq];
        // Echo the command header so tests can match responses to requests.
        packet.extend_from_slice(&sent[..4.min(sent.len())]);
        packet.resize(32, 0);
        packet
    }

    impl Router for MockRouter {
        fn send_packet(&self, _device: &DeviceId, data: &[u8]) -> Result<(), Error> {
            util::lock(&self.sent).push(data.to_vec());
            let response = util::lock(&self.responder)
                .as_ref()
                .and_then(|f| f(data));
            if let Some((packet, delay)) = response {
                let node = util::lock(&self.node).clone();
                thread::spawn(move || {
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    if let Some(node) = node.upgrade() {
                        node.handle_packet(0, &packet);
                    }
                });
            }
            Ok(())
        }

        fn poll_device(&self, _device: &DeviceId) -> Result<(), Error> {
            *util::lock(&self.polls) += 1;
            Ok(())
        }

        fn drop_device(&self, device: &DeviceId) {
            util::lock(&self.dropped).push(*device);
            if let Some(node) = util::lock(&self.node).upgrade() {
                node.destroy();
            }
        }
    }

    pub(crate) fn test_id() -> DeviceId {
        DeviceId {
            vendor: 0x5341_4149,
            product: 0x534D_5053,
            serial: 0x1234_5678,
        }
    }

    /// A node wired to a mock router and the given clock.
    pub(crate) fn test_node(router: &Arc<MockRouter>, clock: Arc<dyn Clock>) -> Arc<Node> {
        test_node_with_config(router, clock, &Config::default())
    }

    pub(crate) fn test_node_with_config(
        router: &Arc<MockRouter>,
        clock: Arc<dyn Clock>,
        cfg: &Config,
    ) -> Arc<Node> {
        let weak: Weak<dyn Router> = {
            let as_router: Arc<dyn Router> = router.clone();
            Arc::downgrade(&as_router)
        };
        let node = Node::new_basic(weak, test_id(), None, cfg, clock);
        *util::lock(&router.node) = Arc::downgrade(&node);
        node
    }
}
