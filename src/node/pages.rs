//! Configuration-page I/O.
//!
//! Series-header pages are read and written one at a time; the sensor page
//! cache is loaded and committed in bulk. Bulk transfers are pipelined: up to
//! 16 commands are in flight at once, unanswered ones are retransmitted on
//! every pass, and the pass sleeps one poll interval while anything is still
//! running. Bulk reads fetch page 0 of every slot first and only follow up
//! with pages 1..3 where page 0 shows a present sensor.

use super::{CmdReply, Node};
use crate::sensor::{self, PAGES_PER_SENSOR, PAGE_LEN, SENSOR_SLOTS};
use crate::util;
use crate::Error;
use log::warn;
use std::collections::VecDeque;
use std::fmt::Write;
use std::thread;
use std::time::Duration;

const MSG_READ_HEADER_PAGE: u16 = 0x0102;
const MSG_WRITE_HEADER_PAGE: u16 = 0x0103;
const MSG_READ_SENSOR_PAGE: u16 = 0x0104;
const MSG_WRITE_SENSOR_PAGE: u16 = 0x0105;
const MSG_SAVE_HEADER: u16 = 0x0107;

/// Cap on concurrently running bulk transfers.
const IN_FLIGHT: usize = 16;

/// Pause between pipeline passes while transfers are running.
const PIPELINE_PAUSE: Duration = Duration::from_millis(10);

/// One queued bulk transfer.
pub struct Transfer<K> {
    pub key: K,
    pub cmd: u16,
    pub arg: u8,
    pub payload: Vec<u8>,
}

impl Node {
    /// Reads a single series-header page.
    pub fn read_series_header_page(&self, page: u8) -> Result<CmdReply, Error> {
        self.cmd(MSG_READ_HEADER_PAGE, page, &[])
    }

    /// Writes a single series-header page.
    pub fn write_series_header_page(&self, page: u8, data: &[u8]) -> Result<CmdReply, Error> {
        self.cmd(MSG_WRITE_HEADER_PAGE, page, data)
    }

    /// Commits dirty sensor pages and saves the series header to the node's
    /// non-volatile storage.
    pub fn save_series_header(&self) -> Result<CmdReply, Error> {
        self.commit_sensor_attrs()?;
        self.cmd(MSG_SAVE_HEADER, 0, &[])
    }

    /// Reads one sensor configuration page from the node, refreshing the
    /// cache.
    pub fn read_sensor_page(&self, sensor: u8, page: u8) -> Result<Vec<u8>, Error> {
        let reply = self.cmd(MSG_READ_SENSOR_PAGE, (sensor << 2) | page, &[])?;
        let reply = self.check(reply)?;
        self.install_page(sensor, page, &reply.data);
        Ok(reply.data)
    }

    /// Writes one sensor configuration page; the cache takes over whatever
    /// configuration the node reports as actually applied.
    pub fn write_sensor_page(&self, sensor: u8, page: u8, data: &[u8]) -> Result<Vec<u8>, Error> {
        let reply = self.cmd(MSG_WRITE_SENSOR_PAGE, (sensor << 2) | page, data)?;
        let reply = self.check(reply)?;
        self.install_page(sensor, page, &reply.data);
        Ok(reply.data)
    }

    fn install_page(&self, sensor: u8, page: u8, data: &[u8]) {
        let mut m = util::lock(&self.measure);
        let slot = usize::from(sensor) % SENSOR_SLOTS;
        let page = usize::from(page) % PAGES_PER_SENSOR;
        let n = data.len().min(PAGE_LEN);
        m.pages[slot][page][..n].copy_from_slice(&data[..n]);
        m.dirty[slot][page] = false;
    }

    /// (Re-)loads the sensor page cache from the node.
    pub fn reload_sensor_data(&self) -> Result<(), Error> {
        // Push local changes before overwriting the cache.
        if self.is_discovered() {
            self.commit_sensor_attrs()?;
        }
        let pending: VecDeque<Transfer<(u8, u8)>> = (0..SENSOR_SLOTS as u8)
            .map(|slot| Transfer {
                key: (slot, 0),
                cmd: MSG_READ_SENSOR_PAGE,
                arg: slot << 2,
                payload: Vec::new(),
            })
            .collect();
        self.pump_transfers(pending, &mut |(slot, page), reply, queue| {
            if reply.status != 0 {
                // Rejected for a transient reason; try again later.
                warn!(
                    "failed to get sensor {} page {} on device {}: status {:02X}",
                    slot, page, self.id, reply.status
                );
                queue.push_back(Transfer {
                    key: (slot, page),
                    cmd: MSG_READ_SENSOR_PAGE,
                    arg: (slot << 2) | page,
                    payload: Vec::new(),
                });
                return;
            }
            self.install_page(slot, page, &reply.data);
            if page == 0 {
                let present = {
                    let m = util::lock(&self.measure);
                    sensor::page_present(&m.pages[usize::from(slot)][0])
                };
                if present {
                    for next in 1..PAGES_PER_SENSOR as u8 {
                        queue.push_back(Transfer {
                            key: (slot, next),
                            cmd: MSG_READ_SENSOR_PAGE,
                            arg: (slot << 2) | next,
                            payload: Vec::new(),
                        });
                    }
                }
            }
        })
    }

    /// Writes every dirty sensor page back to the node.
    ///
    /// Individual rejections are collected; the commit keeps going and
    /// reports them all in one error.
    pub fn commit_sensor_attrs(&self) -> Result<(), Error> {
        let pending: VecDeque<Transfer<(u8, u8)>> = {
            let m = util::lock(&self.measure);
            let mut queue = VecDeque::new();
            for slot in 0..SENSOR_SLOTS {
                for page in 0..PAGES_PER_SENSOR {
                    if m.dirty[slot][page] {
                        queue.push_back(Transfer {
                            key: (slot as u8, page as u8),
                            cmd: MSG_WRITE_SENSOR_PAGE,
                            arg: ((slot as u8) << 2) | page as u8,
                            payload: m.pages[slot][page].to_vec(),
                        });
                    }
                }
            }
            queue
        };
        let mut errors = String::new();
        self.pump_transfers(pending, &mut |(slot, page), reply, _queue| {
            if reply.status != 0 {
                let _ = write!(
                    errors,
                    "\ncommitting sensor {} page {} failed: device returned status {:02X}",
                    slot, page, reply.status
                );
            } else {
                self.install_page(slot, page, &reply.data);
            }
        })?;
        if !errors.is_empty() {
            return Err(Error::CommitFailed {
                serial: self.id.serial,
                details: errors,
            });
        }
        Ok(())
    }

    /// Runs queued transfers with at most [`IN_FLIGHT`] outstanding. The
    /// callback sees every completed transfer and may enqueue follow-ups;
    /// infrastructure failures abort the pipeline after releasing all
    /// reserved sequence slots.
    pub(crate) fn pump_transfers<K: Copy>(
        &self,
        mut pending: VecDeque<Transfer<K>>,
        on_done: &mut dyn FnMut(K, &CmdReply, &mut VecDeque<Transfer<K>>),
    ) -> Result<(), Error> {
        let mut running: VecDeque<(K, u8)> = VecDeque::new();
        let result: Result<(), Error> = (|| {
            while !pending.is_empty() || !running.is_empty() {
                while running.len() < IN_FLIGHT {
                    let transfer = match pending.pop_front() {
                        Some(transfer) => transfer,
                        None => break,
                    };
                    let seq = self.async_cmd(transfer.cmd, transfer.arg, &transfer.payload)?;
                    running.push_back((transfer.key, seq));
                }
                for _ in 0..running.len() {
                    let (key, seq) = match running.pop_front() {
                        Some(entry) => entry,
                        None => break,
                    };
                    if self.is_cmd_done(seq)? {
                        let reply =
                            self.finish_cmd(seq, self.cfg.reply_timeout, self.cfg.max_attempts)?;
                        on_done(key, &reply, &mut pending);
                    } else {
                        // Not answered yet; retransmit and keep waiting.
                        self.cmd_attempt(seq)?;
                        running.push_back((key, seq));
                    }
                }
                if !running.is_empty() {
                    thread::sleep(PIPELINE_PAUSE);
                }
            }
            Ok(())
        })();
        if result.is_err() {
            for (_, seq) in running {
                self.cancel_cmd(seq);
            }
        }
        result
    }
}
