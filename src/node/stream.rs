//! Measurement data-stream reassembly.
//!
//! During a measurement a node emits a numbered stream of 28-byte packets.
//! The first 16 are the series header, the next 256 dump all sensor
//! configuration pages, and everything after is a byte stream of sensor
//! records, multiplexed in sampling-schedule order. The radio link reorders
//! and occasionally loses packets; this module restores order with a bounded
//! wait: a packet that fails to show up for [`gap_timeout`] is zero-filled so
//! one lost packet cannot stall the stream.
//!
//! The demultiplexer mirrors the node firmware: every active sensor is
//! scheduled at `start + offset` and re-scheduled at `time + interval` after
//! each record, with simultaneous samples ordered by their position in the
//! schedule queue. Decoding must replay that order exactly, which is why the
//! queue inserts ties *after* existing entries.
//!
//! [`gap_timeout`]: ../../config/struct.Config.html#structfield.gap_timeout

use super::{CmdReply, MeasureState, Node};
use crate::sensor::{SensorConfig, SensorDriver, PAGE_LEN};
use crate::util;
use crate::Error;
use log::{info, warn};
use std::collections::{BTreeMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

/// Number of series-header packets at the start of a measurement stream.
pub(crate) const SERIES_PAGES: usize = 16;

/// Packets below this sequence number carry the series header and the sensor
/// configuration pages.
const HEADER_PACKETS: u32 = 272;

/// Extra time allowed for the header region to trickle in before gap
/// skipping may engage.
const HEADER_GRACE: Duration = Duration::from_secs(3);

/// Poll cadence while waiting for the node to drain its buffers.
const END_POLL: Duration = Duration::from_millis(10);

const MSG_START_MEASUREMENT: u16 = 0x0110;
const MSG_STOP_MEASUREMENT: u16 = 0x0111;

/// Completion summary of a measurement.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MeasurementStats {
    /// Measurement duration in µs as reported by the node (wraps after
    /// exceeding 32 bits).
    pub duration_us: u32,
    /// Total measurement data size in bytes, header included.
    pub data_bytes: u64,
    /// Number of stream packets in the measurement.
    pub packets: u32,
    /// Packets the reassembler zero-filled because they never arrived.
    pub lost_packets: u32,
    /// Packets the node never transmitted due to radio buffer overflow.
    pub tx_overflow_lost: u32,
    /// Packets the node failed to record due to SD-card backpressure.
    pub sd_overflow_lost: u32,
}

pub(crate) struct DecoderState {
    pub active: bool,
    /// Timestamp of the most recently emitted sample, µs since the Unix
    /// epoch.
    pub time_us: u64,
    /// Next in-order stream sequence number.
    pub seq: u32,
    /// Bytes of the record stream not yet consumed by a full record.
    pub pending: Vec<u8>,
    /// Out-of-order packets waiting for their turn.
    pub buffer: BTreeMap<u32, Vec<u8>>,
    /// Upcoming sampling times, sorted by due time, ties kept in insertion
    /// order.
    pub schedule: VecDeque<(u64, u8)>,
    pub last_progress: Option<Instant>,
    /// Never skip past this sequence number; it was received less than one
    /// gap timeout ago.
    pub last_skip_seq: u32,
    pub end_time: u32,
    pub end_offset: u64,
    pub tx_overflow_lost: u32,
    pub sd_overflow_lost: u32,
    pub lost_packets: u32,
    /// `last_no_data` value captured when the stop was requested; the stream
    /// is fully drained once the barrier moves past it.
    pub end_marker: Option<Instant>,
}

impl DecoderState {
    pub(crate) fn new() -> Self {
        DecoderState {
            active: false,
            time_us: 0,
            seq: 0,
            pending: Vec::new(),
            buffer: BTreeMap::new(),
            schedule: VecDeque::new(),
            last_progress: None,
            last_skip_seq: 0,
            end_time: 0,
            end_offset: 0,
            tx_overflow_lost: 0,
            sd_overflow_lost: 0,
            lost_packets: 0,
            end_marker: None,
        }
    }
}

/// Inserts a sampling entry, keeping the queue sorted non-strictly by due
/// time with ties after existing entries. This must match the node-side
/// scheduler exactly or the record stream demultiplexes wrong.
fn insert_schedule(queue: &mut VecDeque<(u64, u8)>, due_us: u64, sensor: u8) {
    let index = queue.partition_point(|&(t, _)| t <= due_us);
    queue.insert(index, (due_us, sensor));
}

impl Node {
    /// Starts a measurement on the node.
    ///
    /// `targets` selects the recording destinations (radio stream, SD card),
    /// `global_time` the radio-clock start time and `unix_time_ms` the wall
    /// clock corresponding to it. Dirty configuration pages are committed
    /// first so the node records what the host believes it configured.
    pub fn start_measurement(
        &self,
        targets: u8,
        global_time: u32,
        unix_time_ms: u64,
    ) -> Result<CmdReply, Error> {
        self.commit_sensor_attrs()?;
        {
            let mut m = util::lock(&self.measure);
            m.series_header = Default::default();
            let d = &mut m.decoder;
            d.active = true;
            d.time_us = unix_time_ms.saturating_mul(1000);
            d.seq = 0;
            d.pending.clear();
            d.buffer.clear();
            d.schedule.clear();
            // Generous grace period: the header burst may take a while.
            d.last_progress = Some(self.clock.now() + HEADER_GRACE);
            d.last_skip_seq = 0;
            d.end_time = 0;
            d.end_offset = u64::MAX;
            d.tx_overflow_lost = 0;
            d.sd_overflow_lost = 0;
            d.lost_packets = 0;
            d.end_marker = None;
        }
        let mut payload = [0u8; 12];
        payload[..4].copy_from_slice(&global_time.to_le_bytes());
        payload[4..].copy_from_slice(&unix_time_ms.to_le_bytes());
        self.cmd(MSG_START_MEASUREMENT, targets, &payload)
    }

    /// Requests the node to stop the running measurement and records the
    /// completion information for [`end_measurement`].
    ///
    /// [`end_measurement`]: #method.end_measurement
    pub fn stop_measurement(&self) -> Result<CmdReply, Error> {
        let reply = self.cmd(MSG_STOP_MEASUREMENT, 0, &[])?;
        if !util::lock(&self.measure).decoder.active {
            // Not our measurement; report the node's answer and move on.
            return Ok(reply);
        }
        // Once the no-data barrier moves past this point we know the node
        // has drained all measurement data.
        let marker = util::lock(&self.link).last_no_data;
        if reply.data.len() < 20 {
            return Err(Error::InvalidLength);
        }
        let mut m = util::lock(&self.measure);
        let d = &mut m.decoder;
        d.end_marker = marker;
        d.end_time = u32::from_le_bytes([reply.data[0], reply.data[1], reply.data[2], reply.data[3]]);
        d.end_offset = u64::from_le_bytes([
            reply.data[4],
            reply.data[5],
            reply.data[6],
            reply.data[7],
            reply.data[8],
            reply.data[9],
            reply.data[10],
            reply.data[11],
        ]);
        d.tx_overflow_lost = u32::from_le_bytes([
            reply.data[12],
            reply.data[13],
            reply.data[14],
            reply.data[15],
        ]);
        d.sd_overflow_lost = u32::from_le_bytes([
            reply.data[16],
            reply.data[17],
            reply.data[18],
            reply.data[19],
        ]);
        Ok(reply)
    }

    /// Waits for the stopped measurement's data to finish arriving, replays
    /// whatever is still buffered (zero-filling packets that will never
    /// come), and reports the completion summary.
    ///
    /// Returns `None` when no measurement started by this host is active.
    pub fn end_measurement(&self) -> Result<Option<MeasurementStats>, Error> {
        {
            let m = util::lock(&self.measure);
            if !m.decoder.active {
                return Ok(None);
            }
        }
        let marker = util::lock(&self.measure).decoder.end_marker;
        // Wait for the node's transmit buffer to become empty.
        loop {
            self.ensure_live()?;
            let no_data = util::lock(&self.link).last_no_data;
            if no_data != marker {
                break;
            }
            thread::sleep(END_POLL);
        }
        let mut m = util::lock(&self.measure);
        let m = &mut *m;
        m.decoder.active = false;
        // Whatever is missing now will never arrive.
        loop {
            if u64::from(m.decoder.seq) * PAGE_LEN as u64 >= m.decoder.end_offset {
                break;
            }
            let data = m
                .decoder
                .buffer
                .remove(&m.decoder.seq)
                .unwrap_or_else(|| vec![0; PAGE_LEN]);
            self.decode_packet(m, &data);
        }
        Ok(Some(MeasurementStats {
            duration_us: m.decoder.end_time,
            data_bytes: m.decoder.end_offset,
            packets: m.decoder.seq,
            lost_packets: m.decoder.lost_packets,
            tx_overflow_lost: m.decoder.tx_overflow_lost,
            sd_overflow_lost: m.decoder.sd_overflow_lost,
        }))
    }

    /// Accepts one (possibly out-of-order) measurement data packet.
    pub(crate) fn handle_data_packet(&self, frame: u16, seq32: u32, data: &[u8]) {
        if self.is_dropped() {
            return;
        }
        let raw_hook = util::read(&self.hooks).raw.clone();
        if let Some(hook) = raw_hook {
            hook.raw_data(&self.id, frame, seq32, data);
        }
        let mut m = util::lock(&self.measure);
        let m = &mut *m;
        if !m.decoder.active {
            return;
        }
        let now = self.clock.now();
        // Stuck waiting for a missing packet for longer than the gap
        // timeout? It will probably never arrive; catch up instead.
        let skip = m.decoder.last_progress.map_or(false, |p| {
            now.checked_duration_since(p)
                .map_or(false, |d| d > self.cfg.gap_timeout)
        });
        if seq32 == m.decoder.seq {
            self.decode_packet(m, data);
        } else if seq32 > m.decoder.seq {
            m.decoder.buffer.insert(seq32, data.to_vec());
        }
        // Drain the buffer; we might have just filled a gap.
        loop {
            if let Some(next) = m.decoder.buffer.remove(&m.decoder.seq) {
                self.decode_packet(m, &next);
                continue;
            }
            // The next required packet is missing. Stop unless we are
            // allowed to declare it lost: we must have stalled for the full
            // gap timeout, and must never skip past a packet that arrived
            // less than one timeout ago.
            if seq32 < m.decoder.seq || !skip || m.decoder.seq >= m.decoder.last_skip_seq {
                break;
            }
            info!(
                "lost data packet {} from device {} (received up to {})",
                m.decoder.seq, self.id, seq32
            );
            if m.decoder.seq < HEADER_PACKETS {
                warn!(
                    "lost series header packet {} for device {}, decoded data may be garbage",
                    m.decoder.seq, self.id
                );
            }
            self.decode_packet(m, &[0u8; PAGE_LEN]);
            m.decoder.lost_packets += 1;
        }
        if m.decoder.seq == seq32.wrapping_add(1) {
            // In sync with the just received packet.
            m.decoder.last_progress = Some(self.clock.now());
        }
        if skip {
            m.decoder.last_skip_seq = seq32;
            m.decoder.last_progress = Some(now);
        }
    }

    /// Decodes a single in-order packet (gaps already zero-filled).
    pub(in crate::node) fn decode_packet(&self, m: &mut MeasureState, data: &[u8]) {
        let seq = m.decoder.seq;
        let offset = u64::from(seq) * PAGE_LEN as u64;
        if offset >= m.decoder.end_offset {
            // Padding past the end of the measurement.
            return;
        }
        if (seq as usize) < SERIES_PAGES {
            let mut page = [0u8; PAGE_LEN];
            let n = data.len().min(PAGE_LEN);
            page[..n].copy_from_slice(&data[..n]);
            m.series_header[seq as usize] = Some(page);
        } else if seq < HEADER_PACKETS {
            let index = seq as usize - SERIES_PAGES;
            let (slot, page) = (index >> 2, index & 3);
            let n = data.len().min(PAGE_LEN);
            m.pages[slot][page][..n].copy_from_slice(&data[..n]);
            if seq == HEADER_PACKETS - 1 {
                self.apply_sensor_config(m);
            }
        } else if !m.decoder.schedule.is_empty() {
            let take = (m.decoder.end_offset - offset).min(data.len() as u64) as usize;
            m.decoder.pending.extend_from_slice(&data[..take]);
            self.drain_records(m);
        }
        m.decoder.seq += 1;
    }

    /// The configuration header is complete: apply it to the decoders,
    /// build the sampling schedule, and publish the effective attributes.
    fn apply_sensor_config(&self, m: &mut MeasureState) {
        let attr_hook = util::read(&self.hooks).attr.clone();
        let MeasureState {
            decoder,
            sensors,
            pages,
            ..
        } = m;
        for (sid, driver) in sensors.iter_mut() {
            let update_result = {
                let SensorDriver {
                    attrs,
                    decoder: format,
                    ..
                } = driver;
                let cfg = SensorConfig {
                    attrs,
                    pages: &pages[usize::from(*sid)],
                };
                format.update(&cfg)
            };
            if let Err(err) = update_result {
                warn!(
                    "applying configuration of sensor {} on device {} failed: {}",
                    sid, self.id, err
                );
                continue;
            }
            let sched = driver.decoder.schedule();
            if sched.interval_us > 0 && sched.record_bytes > 0 {
                insert_schedule(&mut decoder.schedule, decoder.time_us + sched.offset_us, *sid);
                if let Some(hook) = &attr_hook {
                    for (name, attribute) in driver.attrs.iter() {
                        match attribute.get(&pages[usize::from(*sid)]) {
                            Ok(value) => hook.attr_data(&self.id, &driver.info(), name, &value),
                            Err(err) => warn!(
                                "attribute {} of sensor {} on device {} unreadable: {}",
                                name, sid, self.id, err
                            ),
                        }
                    }
                }
            }
        }
    }

    /// Emits complete records from the accumulated stream bytes in schedule
    /// order.
    fn drain_records(&self, m: &mut MeasureState) {
        let decoded_hook = util::read(&self.hooks).decoded.clone();
        let MeasureState {
            decoder, sensors, ..
        } = m;
        loop {
            let (due_us, sid) = match decoder.schedule.front() {
                Some(&head) => head,
                None => break,
            };
            let driver = match sensors.get(&sid) {
                Some(driver) => driver,
                None => {
                    decoder.schedule.pop_front();
                    continue;
                }
            };
            let record_bytes = driver.decoder.schedule().record_bytes;
            if record_bytes == 0 || decoder.pending.len() < record_bytes {
                break;
            }
            decoder.schedule.pop_front();
            decoder.time_us = due_us;
            let record: Vec<u8> = decoder.pending.drain(..record_bytes).collect();
            let values = driver.decoder.decode(&record);
            if let Some(hook) = &decoded_hook {
                hook.decoded_data(
                    &self.id,
                    &driver.info(),
                    decoder.time_us as f64 / 1000.0,
                    &values,
                );
            }
            let next_due = decoder.time_us + driver.decoder.schedule().interval_us;
            insert_schedule(&mut decoder.schedule, next_due, sid);
        }
    }
}
