//! Base-station driver.
//!
//! Extends the USB framing transport with the radio-control command set:
//! carrier configuration, static slot ownership, node polling and
//! receiver-side telemetry. Received radio frames arrive as notification
//! `0xC001` and are handed to the installed [`PacketReceivedHook`] (the
//! routing hub).
//!
//! [`PacketReceivedHook`]: ../hooks/trait.PacketReceivedHook.html

use crate::bytes::{ByteWriter, ToBytes};
use crate::config::Config;
use crate::hooks::PacketReceivedHook;
use crate::stats::DeltaTracker;
use crate::usb::{InterfaceKind, Transport, UsbBulk, UsbDeviceIo, UsbReply};
use crate::util::{self, HexSlice};
use crate::Error;
use log::{debug, info, trace, warn};
use rand::Rng;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

const MSG_RADIO_STATS: u16 = 0x0100;
const MSG_STOP_RADIO: u16 = 0x0200;
const MSG_START_RADIO: u16 = 0x0201;
const MSG_POLL_BATCH: u16 = 0x027E;
const MSG_ASSIGN_SLOTS: u16 = 0x027F;
const MSG_SEND_RF: u16 = 0x0280;

/// Radio frames are received as notification `0xC001`.
const NOTIFY_RF_PACKET: u16 = 0xC001;

/// A poll batch carries at most this many node ids.
pub(crate) const POLL_BATCH: usize = 28;

/// Number of receiver-side telemetry counters.
const TELEMETRY_COUNTERS: usize = 5;

/// Radio configuration for [`Station::start_radio`].
///
/// [`Station::start_radio`]: struct.Station.html#method.start_radio
#[derive(Clone, Debug)]
pub struct RadioParams {
    /// Channel number; the carrier is at 2400 + channel MHz.
    pub channel: u8,
    /// Network id shared by all participants on the channel.
    pub net_id: u8,
    /// Bit-rate selector (0 = default rate).
    pub speed: u8,
    /// Node transmit power attenuation.
    pub tx_power: u8,
    /// Base-station transmit power attenuation.
    pub receiver_tx_power: u8,
    /// Guard bits between time slots.
    pub guard_bits: u8,
    /// Idle bits before a slot.
    pub pre_gap_bits: u16,
    /// Idle bits after a slot.
    pub post_gap_bits: u8,
}

impl RadioParams {
    /// Default parameters on the given channel with a random network id.
    pub fn on_channel(channel: u8) -> RadioParams {
        RadioParams {
            channel,
            net_id: rand::thread_rng().gen(),
            speed: 0,
            tx_power: 0,
            receiver_tx_power: 0,
            guard_bits: 0,
            pre_gap_bits: 0,
            post_gap_bits: 0,
        }
    }
}

impl ToBytes for RadioParams {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.channel)?;
        writer.write_u8(self.net_id)?;
        writer.write_u16_le(self.pre_gap_bits | (u16::from(self.speed) << 14))?;
        writer.write_u8(self.guard_bits)?;
        writer.write_u8(self.tx_power << 4)?;
        writer.skip(6)?; // reserved
        writer.write_u8(self.post_gap_bits)?;
        writer.write_u8(self.receiver_tx_power)?;
        Ok(())
    }
}

struct StationShared {
    transport: Transport,
    poll_queue: Mutex<Vec<u8>>,
    telemetry: Mutex<DeltaTracker>,
    hook: RwLock<Option<Arc<dyn PacketReceivedHook>>>,
    cmd_timeout: Duration,
}

impl StationShared {
    fn handle_notify(&self, packet: &[u8]) {
        let msg = u16::from_le_bytes([packet[0], packet[1]]);
        if msg != NOTIFY_RF_PACKET {
            return;
        }
        if packet.len() < 33 {
            warn!("truncated radio frame notification: {:?}", HexSlice(packet));
            return;
        }
        let sof_count = u16::from_le_bytes([packet[4], packet[5]]);
        let payload = &packet[32..];
        trace!("rf <<< frame {:04X} {:?}", sof_count, HexSlice(payload));
        let hook = util::read(&self.hook).clone();
        if let Some(hook) = hook {
            hook.packet_received(sof_count, payload);
        }
    }
}

/// One radio base station attached over USB.
pub struct Station {
    shared: Arc<StationShared>,
}

impl Station {
    /// Opens the first attached base station.
    pub fn open(cfg: &Config) -> Result<Station, Error> {
        let (io, kind) = UsbDeviceIo::open_first()?;
        if kind != InterfaceKind::BaseStation {
            // Every shipped platform device that talks USB is a base
            // station; anything else is worth flagging.
            warn!("first platform USB device is not a base station: {:?}", kind);
        }
        Ok(Self::new(Arc::new(io), cfg))
    }

    /// Creates a station over an already opened endpoint pair.
    pub fn new(io: Arc<dyn UsbBulk>, cfg: &Config) -> Station {
        let shared = Arc::new(StationShared {
            transport: Transport::new(io, cfg),
            poll_queue: Mutex::new(Vec::new()),
            telemetry: Mutex::new(DeltaTracker::new(0xFFFF_FFFF)),
            hook: RwLock::new(None),
            cmd_timeout: Duration::from_secs(1),
        });

        let weak = Arc::downgrade(&shared);
        shared.transport.set_notify_handler(move |packet| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_notify(packet);
            }
        });

        let weak = Arc::downgrade(&shared);
        let tick = cfg.poll_interval;
        thread::Builder::new()
            .name("station-poll".into())
            .spawn(move || poll_worker(weak, tick))
            .expect("spawning station poll worker");

        Station { shared }
    }

    fn command(&self, msg: u16, payload: &[u8]) -> Result<UsbReply, Error> {
        self.shared
            .transport
            .command(msg, payload, self.shared.cmd_timeout)
    }

    /// Requests the radio statistics block: the host-relative frame counter
    /// followed by the telemetry counters.
    pub fn radio_stats(&self) -> Result<UsbReply, Error> {
        self.command(MSG_RADIO_STATS, &[])
    }

    /// Current radio time in µs, used to schedule measurement starts.
    pub fn global_time(&self) -> Result<u32, Error> {
        let stats = self.radio_stats()?;
        if stats.payload.len() < 4 {
            return Err(Error::InvalidLength);
        }
        Ok(u32::from_le_bytes([
            stats.payload[0],
            stats.payload[1],
            stats.payload[2],
            stats.payload[3],
        ]))
    }

    /// Shuts the radio down, returning all nodes to sleep.
    pub fn stop_radio(&self) -> Result<UsbReply, Error> {
        self.command(MSG_STOP_RADIO, &[])
    }

    /// Configures and starts the radio.
    pub fn start_radio(&self, params: &RadioParams) -> Result<UsbReply, Error> {
        info!(
            "starting radio communication on {} MHz with network id {}",
            2400 + u32::from(params.channel),
            params.net_id
        );
        let mut payload = [0u8; 14];
        let mut writer = ByteWriter::new(&mut payload);
        params.to_bytes(&mut writer)?;
        self.command(MSG_START_RADIO, &payload)
    }

    /// Writes the static slot-owner table; owner 0 re-enables automatic
    /// assignment for that slot.
    pub fn assign_slots(&self, owners: &[u8; POLL_BATCH]) -> Result<UsbReply, Error> {
        self.command(MSG_ASSIGN_SLOTS, owners)
    }

    /// Sends a radio packet to the given node id. Fire-and-forget: delivery
    /// is the reliable transport's problem.
    pub fn send_rf_packet(&self, target: u8, packet: &[u8]) -> Result<(), Error> {
        trace!("rf {:02X} >>> {:?}", target, HexSlice(packet));
        let mut payload = Vec::with_capacity(POLL_BATCH + packet.len());
        payload.push(target);
        payload.resize(POLL_BATCH, 0);
        payload.extend_from_slice(packet);
        self.shared.transport.send_noreply(MSG_SEND_RF, &payload)
    }

    /// Schedules the node id to be polled for packets in the next cycle.
    /// Duplicate requests are coalesced.
    pub fn poll_device(&self, node_id: u8) {
        let mut queue = util::lock(&self.shared.poll_queue);
        if !queue.contains(&node_id) {
            queue.push(node_id);
        }
    }

    /// Reads the current telemetry counter values from the device.
    pub fn update_telemetry(&self) -> Result<(), Error> {
        let stats = self.radio_stats()?;
        if stats.payload.len() < 4 + TELEMETRY_COUNTERS * 4 {
            return Err(Error::InvalidLength);
        }
        let counters = stats.payload[4..4 + TELEMETRY_COUNTERS * 4]
            .chunks_exact(4)
            .map(|c| u64::from(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        util::lock(&self.shared.telemetry).update(counters);
        Ok(())
    }

    /// Differentiates the counters against the previous snapshot. Call every
    /// `interval`, right after [`update_telemetry`].
    ///
    /// [`update_telemetry`]: #method.update_telemetry
    pub fn snapshot_telemetry(&self, interval: Duration) {
        util::lock(&self.shared.telemetry).snapshot(interval);
    }

    /// Per-second telemetry counter rates, once two snapshots exist.
    pub fn telemetry_delta(&self) -> Option<Vec<f64>> {
        util::lock(&self.shared.telemetry).delta()
    }

    pub(crate) fn set_packet_hook(&self, hook: Arc<dyn PacketReceivedHook>) {
        *util::write(&self.shared.hook) = Some(hook);
    }
}

/// Poll worker: every tick, drains up to one batch of node ids into a single
/// poll request.
fn poll_worker(weak: Weak<StationShared>, tick: Duration) {
    loop {
        thread::sleep(tick);
        let shared = match weak.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        let targets: Vec<u8> = {
            let mut queue = util::lock(&shared.poll_queue);
            let take = queue.len().min(POLL_BATCH);
            queue.drain(..take).collect()
        };
        if !targets.is_empty() {
            if let Err(err) = shared.transport.send_noreply(MSG_POLL_BATCH, &targets) {
                debug!("poll request failed: {}", err);
            }
        }
    }
}
