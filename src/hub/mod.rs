//! Radio routing hub and address assignment.
//!
//! The hub owns every known device and every attached base station. A base
//! station's channel has 101 node-id slots (id 0 is reserved); a slot binds a
//! short radio address to a device for as long as the device keeps talking.
//! Five seconds of silence and the node is assumed to have forgotten its id,
//! so the binding expires and the slot becomes assignable again.
//!
//! Nodes without an address broadcast association requests to id `0x7F`,
//! carrying their hardware identity. The hub instantiates a driver for
//! previously unseen identities (via the protocol registry), picks a free
//! slot uniformly at random, and answers with an assignment packet echoing
//! the identity. Every other inbound frame starts with the sender's node id
//! and is forwarded to the device bound to that slot.
//!
//! Devices move freely between base stations: an association request on a
//! different station releases the old route first.

use crate::config::Config;
use crate::device_id::{DeviceId, DeviceInfo};
use crate::bytes::{ByteReader, FromBytes};
use crate::hooks::{NewDeviceHook, PacketReceivedHook};
use crate::node::Node;
use crate::registry;
use crate::station::{Station, POLL_BATCH};
use crate::time::{Clock, SystemClock};
use crate::util::{self, HexSlice};
use crate::Error;
use log::{debug, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Node ids per base station; id 0 is never assigned.
const SLOT_TABLE: usize = 101;

/// Broadcast id used for association traffic.
const BROADCAST_ID: u8 = 0x7F;

/// Transmission seam between a device driver and its current base station.
///
/// Implemented by the hub; device drivers hold a weak handle so a dropped
/// hub turns into "no route" instead of keeping the whole stack alive.
pub(crate) trait Router: Send + Sync {
    /// Sends a radio payload to the device's currently assigned node id.
    fn send_packet(&self, device: &DeviceId, data: &[u8]) -> Result<(), Error>;

    /// Schedules a poll of the device so queued responses can drain.
    fn poll_device(&self, device: &DeviceId) -> Result<(), Error>;

    /// Tears the device down for re-discovery.
    fn drop_device(&self, device: &DeviceId);
}

struct Frame {
    station: usize,
    sof: u16,
    payload: Vec<u8>,
}

/// Address record: binds one slot of one base station to a device.
struct AddrRecord {
    device: DeviceId,
    expires: Instant,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct Addr {
    station: usize,
    node_id: u8,
}

struct StationEntry {
    station: Arc<Station>,
    slots: Vec<Option<AddrRecord>>,
}

struct DeviceEntry {
    node: Arc<Node>,
    addr: Option<Addr>,
    last_assign_attempt: Option<Instant>,
    /// Whether the announced protocol matched a registered driver; only
    /// identified devices appear in listings.
    identified: bool,
}

struct HubState {
    stations: Vec<StationEntry>,
    devices: HashMap<DeviceId, DeviceEntry>,
}

impl HubState {
    /// Forgets the device's current route, freeing its slot.
    fn release_addr(&mut self, id: &DeviceId) {
        if let Some(entry) = self.devices.get_mut(id) {
            if let Some(addr) = entry.addr.take() {
                self.stations[addr.station].slots[usize::from(addr.node_id)] = None;
            }
        }
    }
}

struct AssignAction {
    station: Arc<Station>,
    node_id: u8,
    packet: Vec<u8>,
}

struct HubShared {
    cfg: Config,
    clock: Arc<dyn Clock>,
    state: Mutex<HubState>,
    new_device_hook: RwLock<Option<Arc<dyn NewDeviceHook>>>,
    frames: Mutex<mpsc::Sender<Frame>>,
    self_weak: Weak<HubShared>,
}

/// Routing hub: entry point of the host runtime.
pub struct Hub {
    shared: Arc<HubShared>,
}

impl Hub {
    /// A hub with default configuration.
    pub fn new() -> Hub {
        Self::with_config(Config::default())
    }

    pub fn with_config(cfg: Config) -> Hub {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    pub(crate) fn with_clock(cfg: Config, clock: Arc<dyn Clock>) -> Hub {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new_cyclic(|weak: &Weak<HubShared>| HubShared {
            cfg,
            clock,
            state: Mutex::new(HubState {
                stations: Vec::new(),
                devices: HashMap::new(),
            }),
            new_device_hook: RwLock::new(None),
            frames: Mutex::new(tx),
            self_weak: weak.clone(),
        });

        let weak = Arc::downgrade(&shared);
        thread::Builder::new()
            .name("hub-rx".into())
            .spawn(move || dispatch_worker(weak, rx))
            .expect("spawning hub dispatch worker");
        let weak = Arc::downgrade(&shared);
        thread::Builder::new()
            .name("hub-telemetry".into())
            .spawn(move || telemetry_worker(weak))
            .expect("spawning hub telemetry worker");

        Hub { shared }
    }

    /// Attaches a base station: clears its static slot assignments and
    /// routes its received frames into the hub.
    pub fn add_station(&self, station: Arc<Station>) -> Result<(), Error> {
        station.assign_slots(&[0u8; POLL_BATCH])?;
        let index = {
            let mut state = util::lock(&self.shared.state);
            state.stations.push(StationEntry {
                station: station.clone(),
                slots: (0..SLOT_TABLE).map(|_| None).collect(),
            });
            state.stations.len() - 1
        };
        let tx = util::lock(&self.shared.frames).clone();
        station.set_packet_hook(Arc::new(FrameSink {
            station: index,
            tx: Mutex::new(tx),
        }));
        Ok(())
    }

    /// Installs the hook fired for every previously unknown device.
    pub fn set_new_device_hook(&self, hook: Arc<dyn NewDeviceHook>) {
        *util::write(&self.shared.new_device_hook) = Some(hook);
    }

    /// Looks a device driver up by identity.
    pub fn device(&self, id: &DeviceId) -> Option<Arc<Node>> {
        util::lock(&self.shared.state)
            .devices
            .get(id)
            .map(|entry| entry.node.clone())
    }

    /// All fully identified devices.
    pub fn devices(&self) -> Vec<Arc<Node>> {
        util::lock(&self.shared.state)
            .devices
            .values()
            .filter(|entry| entry.identified)
            .map(|entry| entry.node.clone())
            .collect()
    }

    /// Drops a device so it gets re-discovered on its next association.
    pub fn drop_device(&self, id: &DeviceId) {
        self.shared.drop_device(id);
    }
}

impl Default for Hub {
    fn default() -> Self {
        Hub::new()
    }
}

/// Adapter feeding one station's frames into the hub queue.
struct FrameSink {
    station: usize,
    tx: Mutex<mpsc::Sender<Frame>>,
}

impl PacketReceivedHook for FrameSink {
    fn packet_received(&self, sof_count: u16, payload: &[u8]) {
        let frame = Frame {
            station: self.station,
            sof: sof_count,
            payload: payload.to_vec(),
        };
        // A failed send means the hub is gone; nothing to do.
        let _ = util::lock(&self.tx).send(frame);
    }
}

impl HubShared {
    fn router_weak(&self) -> Weak<dyn Router> {
        let weak: Weak<dyn Router> = self.self_weak.clone();
        weak
    }

    /// Routes one received radio frame.
    fn dispatch(&self, frame: Frame) {
        let payload = &frame.payload;
        if payload.len() < 4 {
            debug!("runt radio frame (frame {:04X}): {:?}", frame.sof, HexSlice(payload));
            return;
        }
        if payload[0] == BROADCAST_ID {
            // Notify traffic; the only kind we handle is a node requesting
            // an address (no id assigned yet).
            if payload[1] == 0x00 && payload[3] == 0x00 && payload.len() >= 16 {
                self.handle_association(frame.station, payload);
            }
            return;
        }

        let node = {
            let mut state = util::lock(&self.state);
            let state = &mut *state;
            let now = self.clock.now();
            let slot_idx = usize::from(payload[0]);
            match state.stations.get_mut(frame.station) {
                Some(entry) if slot_idx < SLOT_TABLE => match entry.slots[slot_idx].as_mut() {
                    Some(record) => {
                        // Traffic resets the deassociation timeout.
                        record.expires = now + self.cfg.addr_timeout;
                        state.devices.get(&record.device).map(|d| d.node.clone())
                    }
                    None => None,
                },
                _ => None,
            }
        };
        match node {
            Some(node) => node.handle_packet(frame.sof, payload),
            None => debug!(
                "dropped packet from unknown node id {:02X} (frame {:04X}): {:?}",
                payload[0],
                frame.sof,
                HexSlice(payload)
            ),
        }
    }

    fn handle_association(&self, station_idx: usize, payload: &[u8]) {
        let mut reader = ByteReader::new(&payload[4..]);
        let id = match DeviceId::from_bytes(&mut reader) {
            Ok(id) => id,
            Err(_) => return,
        };
        // Protocol and firmware identification follow when the frame is
        // long enough; without them the device still gets an address.
        let info = DeviceInfo::from_bytes(&mut reader).ok();
        let now = self.clock.now();

        let mut fire_hook = false;
        let assignment = {
            let mut state = util::lock(&self.state);
            if !state.devices.contains_key(&id) {
                let node = registry::instantiate(
                    self.router_weak(),
                    id,
                    info,
                    &self.cfg,
                    self.clock.clone(),
                );
                state.devices.insert(
                    id,
                    DeviceEntry {
                        node,
                        addr: None,
                        last_assign_attempt: None,
                        identified: registry::lookup(info.as_ref()).is_some(),
                    },
                );
                fire_hook = true;
            } else if let Some(entry) = state.devices.get(&id) {
                // An assignment answer may still be in flight; don't pile
                // more on top.
                let recent = entry.last_assign_attempt.map_or(false, |last| {
                    now.checked_duration_since(last)
                        .map_or(true, |d| d < self.cfg.assign_holdoff)
                });
                if recent {
                    return;
                }
            }
            if let Some(entry) = state.devices.get_mut(&id) {
                entry.last_assign_attempt = Some(now);
            }
            self.assign_addr(&mut state, station_idx, &id)
        };

        if fire_hook {
            let hook = util::read(&self.new_device_hook).clone();
            if let Some(hook) = hook {
                hook.device_appeared(&id);
            }
        }

        match assignment {
            Ok(action) => {
                // The slot bookkeeping is done; the transmission happens
                // outside the routing lock.
                if let Err(err) = action.station.send_rf_packet(BROADCAST_ID, &action.packet) {
                    warn!("address assignment for device {} failed to send: {}", id, err);
                    return;
                }
                // Poll the fresh id so the node's traffic starts flowing.
                action.station.poll_device(action.node_id);
            }
            Err(err) => warn!("cannot assign an address to device {}: {}", id, err),
        }
    }

    /// Assigns (or refreshes) a node id for the device on the given base
    /// station and builds the assignment packet.
    fn assign_addr(
        &self,
        state: &mut HubState,
        station_idx: usize,
        id: &DeviceId,
    ) -> Result<AssignAction, Error> {
        let now = self.clock.now();

        // The device may have moved here from another base station whose
        // record hasn't expired yet.
        if let Some(addr) = state.devices.get(id).and_then(|e| e.addr) {
            if addr.station != station_idx {
                state.release_addr(id);
            }
        }

        let node_id = match state.devices.get(id).and_then(|e| e.addr) {
            Some(addr) => addr.node_id,
            None => {
                let mut candidates = Vec::new();
                for nid in 1..SLOT_TABLE {
                    let expired = match &state.stations[station_idx].slots[nid] {
                        None => true,
                        Some(record) => now > record.expires,
                    };
                    if expired {
                        // Expiry releases the record and its owner's route.
                        if let Some(record) = state.stations[station_idx].slots[nid].take() {
                            let freed = Addr {
                                station: station_idx,
                                node_id: nid as u8,
                            };
                            if let Some(owner) = state.devices.get_mut(&record.device) {
                                if owner.addr == Some(freed) {
                                    owner.addr = None;
                                }
                            }
                        }
                        candidates.push(nid as u8);
                    }
                }
                if candidates.is_empty() {
                    return Err(Error::AddressesExhausted);
                }
                let node_id = candidates[rand::thread_rng().gen_range(0..candidates.len())];
                state.stations[station_idx].slots[usize::from(node_id)] = Some(AddrRecord {
                    device: *id,
                    expires: now + self.cfg.addr_timeout,
                });
                if let Some(entry) = state.devices.get_mut(id) {
                    entry.addr = Some(Addr {
                        station: station_idx,
                        node_id,
                    });
                }
                node_id
            }
        };

        // Either way the node just spoke to us; reset the deassociation
        // timeout and tell it its id.
        if let Some(record) = state.stations[station_idx].slots[usize::from(node_id)].as_mut() {
            record.expires = now + self.cfg.addr_timeout;
        }
        let mut packet = vec![BROADCAST_ID, 0x80, 0x00, node_id];
        packet.extend_from_slice(&id.to_wire());
        Ok(AssignAction {
            station: state.stations[station_idx].station.clone(),
            node_id,
            packet,
        })
    }

    /// Finds the base station and node id currently routing to the device.
    fn route(&self, device: &DeviceId) -> Result<(Arc<Station>, u8), Error> {
        let no_route = Error::NoRoute {
            serial: device.serial,
        };
        let mut state = util::lock(&self.state);
        let state = &mut *state;
        let now = self.clock.now();
        let addr = match state.devices.get(device).and_then(|e| e.addr) {
            Some(addr) => addr,
            None => return Err(no_route),
        };
        let live = match &state.stations[addr.station].slots[usize::from(addr.node_id)] {
            Some(record) => now <= record.expires,
            None => false,
        };
        if live {
            return Ok((state.stations[addr.station].station.clone(), addr.node_id));
        }
        // The node has forgotten this id by now; release it.
        state.release_addr(device);
        Err(no_route)
    }
}

impl Router for HubShared {
    fn send_packet(&self, device: &DeviceId, data: &[u8]) -> Result<(), Error> {
        let (station, node_id) = self.route(device)?;
        station.send_rf_packet(node_id, data)
    }

    fn poll_device(&self, device: &DeviceId) -> Result<(), Error> {
        let (station, node_id) = self.route(device)?;
        station.poll_device(node_id);
        Ok(())
    }

    fn drop_device(&self, device: &DeviceId) {
        let node = {
            let mut state = util::lock(&self.state);
            state.release_addr(device);
            state.devices.remove(device).map(|entry| entry.node)
        };
        if let Some(node) = node {
            node.destroy();
        }
    }
}

fn dispatch_worker(weak: Weak<HubShared>, rx: mpsc::Receiver<Frame>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(frame) => match weak.upgrade() {
                Some(shared) => shared.dispatch(frame),
                None => return,
            },
            Err(RecvTimeoutError::Timeout) => {
                if weak.upgrade().is_none() {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Samples receiver and device telemetry counters on a fixed interval.
fn telemetry_worker(weak: Weak<HubShared>) {
    loop {
        let interval = match weak.upgrade() {
            Some(shared) => shared.cfg.telemetry_interval,
            None => return,
        };
        thread::sleep(interval);
        let shared = match weak.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        let state = util::lock(&shared.state);
        for entry in &state.stations {
            if let Err(err) = entry.station.update_telemetry() {
                debug!("receiver telemetry update failed: {}", err);
            }
            entry.station.snapshot_telemetry(interval);
        }
        for entry in state.devices.values() {
            entry.node.snapshot_telemetry(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::test::TestClock;
    use crate::usb::tests::MockUsb;
    use crate::usb::PACKET_LEN;

    /// Answers every USB command (seq != 0) with a success response so the
    /// synchronous station operations complete.
    fn auto_responder(io: &Arc<MockUsb>) {
        let weak = Arc::downgrade(io);
        thread::spawn(move || {
            let mut answered = 0usize;
            loop {
                let io = match weak.upgrade() {
                    Some(io) => io,
                    None => return,
                };
                let pending: Vec<Vec<u8>> = {
                    let written = util::lock(&io.written);
                    written[answered..].to_vec()
                };
                for packet in pending {
                    answered += 1;
                    let msg = u16::from_le_bytes([packet[0], packet[1]]);
                    if msg >> 14 == 0 && packet[2] != 0 {
                        let mut response = vec![0u8; PACKET_LEN];
                        response[..2].copy_from_slice(&(msg | 0x8000).to_le_bytes());
                        response[2] = packet[2];
                        io.feed_packet(&response);
                    }
                }
                drop(io);
                thread::sleep(Duration::from_millis(2));
            }
        });
    }

    fn quiet_config() -> Config {
        let mut cfg = Config::default();
        // Keep the telemetry task out of the way.
        cfg.telemetry_interval = Duration::from_secs(3600);
        cfg
    }

    struct TestHub {
        hub: Hub,
        clock: Arc<TestClock>,
        io: Arc<MockUsb>,
    }

    fn hub_with_station() -> TestHub {
        let clock = Arc::new(TestClock::new());
        let hub = Hub::with_clock(quiet_config(), clock.clone());
        let io = MockUsb::new();
        auto_responder(&io);
        let station = Arc::new(Station::new(io.clone(), &quiet_config()));
        hub.add_station(station).unwrap();
        TestHub { hub, clock, io }
    }

    /// Association frame from the wire: identity plus (possibly partial)
    /// identification data.
    fn association_payload(serial: u32, proto: Option<(u32, u16, u16)>) -> Vec<u8> {
        let mut payload = vec![0x7F, 0x00, 0x00, 0x00];
        let id = DeviceId {
            vendor: 0x5341_4149,
            product: 0x534D_5053,
            serial,
        };
        payload.extend_from_slice(&id.to_wire());
        if let Some((vendor, ty, version)) = proto {
            payload.extend_from_slice(&vendor.to_le_bytes());
            payload.extend_from_slice(&ty.to_le_bytes());
            payload.extend_from_slice(&version.to_le_bytes());
            payload.extend_from_slice(&[0u8; 8]); // firmware identification
        }
        payload
    }

    fn test_device_id(serial: u32) -> DeviceId {
        DeviceId {
            vendor: 0x5341_4149,
            product: 0x534D_5053,
            serial,
        }
    }

    fn dispatch(hub: &Hub, station: usize, payload: Vec<u8>) {
        hub.shared.dispatch(Frame {
            station,
            sof: 0,
            payload,
        });
    }

    /// Waits for a USB packet matching `pred`.
    fn wait_for_packet(
        io: &Arc<MockUsb>,
        timeout: Duration,
        pred: impl Fn(&[u8]) -> bool,
    ) -> Option<Vec<u8>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            {
                let written = util::lock(&io.written);
                if let Some(packet) = written.iter().find(|p| pred(p)) {
                    return Some(packet.clone());
                }
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    struct HookProbe {
        seen: Mutex<Vec<DeviceId>>,
    }

    impl NewDeviceHook for HookProbe {
        fn device_appeared(&self, id: &DeviceId) {
            util::lock(&self.seen).push(*id);
        }
    }

    /// Boot-to-association scenario: the raw frame creates the device,
    /// fires the hook, and answers with an assignment packet on the
    /// broadcast id.
    #[test]
    fn association_assigns_an_address() {
        let t = hub_with_station();
        let probe = Arc::new(HookProbe {
            seen: Mutex::new(Vec::new()),
        });
        t.hub.set_new_device_hook(probe.clone());

        // Feed the frame through the real notification path.
        let frame: Vec<u8> = vec![
            0x7F, 0x00, 0x00, 0x00, 0x49, 0x41, 0x41, 0x53, 0x53, 0x50, 0x4D, 0x53, 0x78, 0x56,
            0x34, 0x12, 0x01, 0x00, 0x00, 0x00, 0x49, 0x41, 0x41, 0x53, 0x53, 0x50, 0x00, 0x00,
            0x01, 0x00,
        ];
        let mut notify = vec![0u8; PACKET_LEN];
        notify[..2].copy_from_slice(&0xC001u16.to_le_bytes());
        notify[4..6].copy_from_slice(&0x0042u16.to_le_bytes());
        notify[32..32 + frame.len()].copy_from_slice(&frame);
        t.io.feed_packet(&notify);

        let assignment = wait_for_packet(&t.io, Duration::from_secs(5), |p| {
            u16::from_le_bytes([p[0], p[1]]) == 0x0280
        })
        .expect("assignment packet");
        // Target: broadcast id; payload: 7F 80 00 kk followed by the echoed
        // identity.
        assert_eq!(assignment[4], 0x7F);
        assert_eq!(&assignment[32..35], &[0x7F, 0x80, 0x00]);
        let node_id = assignment[35];
        assert!((1..=100).contains(&node_id));
        assert_eq!(
            &assignment[36..48],
            &[0x49, 0x41, 0x41, 0x53, 0x53, 0x50, 0x4D, 0x53, 0x78, 0x56, 0x34, 0x12]
        );

        let expected = test_device_id(0x1234_5678);
        assert_eq!(util::lock(&probe.seen).as_slice(), &[expected]);
        assert!(t.hub.device(&expected).is_some());

        // The slot is bound with a fresh deassociation timeout.
        let state = util::lock(&t.hub.shared.state);
        let record = state.stations[0].slots[usize::from(node_id)]
            .as_ref()
            .expect("bound slot");
        assert_eq!(record.device, expected);
        assert_eq!(record.expires, t.clock.now() + Duration::from_secs(5));
    }

    #[test]
    fn repeated_requests_respect_the_holdoff() {
        let t = hub_with_station();
        dispatch(&t.hub, 0, association_payload(1, None));
        wait_for_packet(&t.io, Duration::from_secs(5), |p| {
            u16::from_le_bytes([p[0], p[1]]) == 0x0280
        })
        .expect("first assignment");

        // Within the holdoff: ignored.
        dispatch(&t.hub, 0, association_payload(1, None));
        let count = |io: &Arc<MockUsb>| {
            util::lock(&io.written)
                .iter()
                .filter(|p| u16::from_le_bytes([p[0], p[1]]) == 0x0280)
                .count()
        };
        assert_eq!(count(&t.io), 1);

        // After the holdoff: answered again.
        t.clock.advance(Duration::from_millis(250));
        dispatch(&t.hub, 0, association_payload(1, None));
        assert_eq!(count(&t.io), 2);
    }

    /// Address aging: after the deassociation timeout the route is gone and
    /// a new association succeeds.
    #[test]
    fn addresses_age_out() {
        let t = hub_with_station();
        dispatch(&t.hub, 0, association_payload(2, None));
        let id = test_device_id(2);
        let addr = util::lock(&t.hub.shared.state).devices[&id].addr;
        assert!(addr.is_some());

        t.clock.advance(Duration::from_millis(5500));
        // Routing observes the expiry and releases the slot.
        match t.hub.shared.send_packet(&id, &[0u8; 4]) {
            Err(Error::NoRoute { serial: 2 }) => {}
            other => panic!("expected no route, got {:?}", other.is_ok()),
        }
        {
            let state = util::lock(&t.hub.shared.state);
            assert!(state.devices[&id].addr.is_none());
            assert!(state.stations[0].slots.iter().all(|slot| slot.is_none()));
        }

        // The node asks again and gets a (possibly different) free id.
        dispatch(&t.hub, 0, association_payload(2, None));
        let addr = util::lock(&t.hub.shared.state).devices[&id]
            .addr
            .expect("re-assigned address");
        assert_eq!(addr.station, 0);
    }

    /// A stale record on the old base station is released when the device
    /// shows up on another one.
    #[test]
    fn migration_releases_the_old_route() {
        let clock = Arc::new(TestClock::new());
        let hub = Hub::with_clock(quiet_config(), clock.clone());
        let io_a = MockUsb::new();
        let io_b = MockUsb::new();
        auto_responder(&io_a);
        auto_responder(&io_b);
        hub.add_station(Arc::new(Station::new(io_a, &quiet_config())))
            .unwrap();
        hub.add_station(Arc::new(Station::new(io_b, &quiet_config())))
            .unwrap();

        dispatch(&hub, 0, association_payload(3, None));
        let id = test_device_id(3);
        let first = util::lock(&hub.shared.state).devices[&id].addr.unwrap();
        assert_eq!(first.station, 0);

        clock.advance(Duration::from_millis(250));
        dispatch(&hub, 1, association_payload(3, None));
        let state = util::lock(&hub.shared.state);
        let second = state.devices[&id].addr.unwrap();
        assert_eq!(second.station, 1);
        assert!(state.stations[0].slots[usize::from(first.node_id)].is_none());
        assert!(state.stations[1].slots[usize::from(second.node_id)].is_some());
    }

    #[test]
    fn exhausted_channel_rejects_assignment() {
        let t = hub_with_station();
        {
            let mut state = util::lock(&t.hub.shared.state);
            let expires = t.clock.now() + Duration::from_secs(3600);
            for nid in 1..SLOT_TABLE {
                state.stations[0].slots[nid] = Some(AddrRecord {
                    device: test_device_id(9000 + nid as u32),
                    expires,
                });
            }
        }
        dispatch(&t.hub, 0, association_payload(4, None));
        let id = test_device_id(4);
        let state = util::lock(&t.hub.shared.state);
        // The device is known but could not be addressed.
        assert!(state.devices.contains_key(&id));
        assert!(state.devices[&id].addr.is_none());
    }

    #[test]
    fn frames_reach_the_bound_device() {
        let t = hub_with_station();
        dispatch(&t.hub, 0, association_payload(5, None));
        let id = test_device_id(5);
        let node_id = util::lock(&t.hub.shared.state).devices[&id]
            .addr
            .unwrap()
            .node_id;

        // A no-data info packet from that node id.
        let mut payload = vec![node_id, 0x00, 0x00, 0xFF, 0, 0, 0, 0];
        payload.extend_from_slice(&777u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&[0u8; 16]);
        t.clock.advance(Duration::from_secs(2));
        dispatch(&t.hub, 0, payload);

        let node = t.hub.device(&id).unwrap();
        assert_eq!(node.bitrate(), 777);
        // Inbound traffic refreshed the deassociation timeout.
        let state = util::lock(&t.hub.shared.state);
        let record = state.stations[0].slots[usize::from(node_id)].as_ref().unwrap();
        assert_eq!(record.expires, t.clock.now() + Duration::from_secs(5));
    }

    #[test]
    fn only_identified_devices_are_listed() {
        let t = hub_with_station();
        // Correct multi-sensor identification.
        dispatch(
            &t.hub,
            0,
            association_payload(6, Some((0x5341_4149, 0x5053, 0))),
        );
        // Unknown protocol: addressed but not listed.
        dispatch(&t.hub, 0, association_payload(7, Some((1, 2, 3))));

        let listed = t.hub.devices();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id().serial, 6);
        assert!(t.hub.device(&test_device_id(7)).is_some());
        assert!(util::lock(&t.hub.shared.state).devices[&test_device_id(7)]
            .addr
            .is_some());
    }

    #[test]
    fn dropping_a_device_poisons_its_driver() {
        let t = hub_with_station();
        dispatch(&t.hub, 0, association_payload(8, None));
        let id = test_device_id(8);
        let node = t.hub.device(&id).unwrap();
        t.hub.drop_device(&id);
        assert!(t.hub.device(&id).is_none());
        assert!(node.is_dropped());
        // Its frames are dropped now.
        dispatch(&t.hub, 0, association_payload(8, None));
        assert!(t.hub.device(&id).is_some()); // re-discovered as a new driver
    }
}
