//! Firmware upload and upgrade.
//!
//! The node exposes a sector-oriented upload mode: 28-byte blocks fill a
//! 512-byte staging buffer which is then committed to a numbered SD-card
//! sector. A full upgrade streams the padded firmware image sector by
//! sector, stages the updater blob in RAM, and hands over with the image's
//! sector count and CRC-32; the updater verifies the checksum before
//! flashing. Afterwards the device reboots into the new firmware and has to
//! be re-discovered.

use super::{CmdReply, Node, Transfer};
use crate::crc;
use crate::Error;
use log::{error, info};
use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::Arc;
use std::thread;

const MSG_START_UPLOAD: u16 = 0x01F0;
const MSG_STOP_UPLOAD: u16 = 0x01F1;
const MSG_UPLOAD_BLOCK: u16 = 0x01F2;
const MSG_COMMIT_SECTOR: u16 = 0x01F3;
const MSG_APPLY_UPGRADE: u16 = 0x01F4;
const MSG_REBOOT: u16 = 0x01FF;

/// Upload block size; one staging buffer holds 512 bytes.
const BLOCK_LEN: usize = 28;

/// SD-card sector size.
pub const SECTOR_LEN: usize = 512;

/// Progress callback of a firmware upgrade; called with a fraction in
/// `0.0..=1.0`.
pub type ProgressFn = Box<dyn Fn(f64) + Send>;

impl Node {
    /// Enters firmware upload mode.
    pub fn start_upload(&self) -> Result<CmdReply, Error> {
        self.cmd(MSG_START_UPLOAD, 0, &[])
    }

    /// Leaves firmware upload mode without upgrading.
    pub fn stop_upload(&self) -> Result<CmdReply, Error> {
        self.cmd(MSG_STOP_UPLOAD, 0, &[])
    }

    /// Streams `data` into the node's staging buffer in 28-byte blocks,
    /// pipelined like the bulk page transfers. `subject` names the payload
    /// in error reports.
    pub fn upload_buffer(&self, subject: &str, data: &[u8]) -> Result<(), Error> {
        let pending: VecDeque<Transfer<usize>> = data
            .chunks(BLOCK_LEN)
            .enumerate()
            .map(|(block, chunk)| Transfer {
                key: block,
                cmd: MSG_UPLOAD_BLOCK,
                arg: block as u8,
                payload: chunk.to_vec(),
            })
            .collect();
        let mut errors = String::new();
        self.pump_transfers(pending, &mut |block, reply, _queue| {
            if reply.status != 0 {
                let _ = write!(
                    errors,
                    "\nupload block {} failed: device returned status {:02X}",
                    block, reply.status
                );
            }
        })?;
        if !errors.is_empty() {
            return Err(Error::UploadFailed {
                serial: self.id.serial,
                subject: subject.to_string(),
                details: errors,
            });
        }
        Ok(())
    }

    /// Uploads one 512-byte sector and commits it to the SD card.
    pub fn upload_sector(&self, sector: u32, data: &[u8]) -> Result<(), Error> {
        self.upload_buffer(&format!("sector {}", sector), data)?;
        let reply = self.cmd(MSG_COMMIT_SECTOR, 0, &sector.to_le_bytes())?;
        self.check(reply)?;
        Ok(())
    }

    /// Upgrades the node's firmware on a background worker.
    ///
    /// `updater` is the second-stage updater blob executed from RAM, `image`
    /// the firmware image (padded to whole sectors internally). `progress`
    /// is invoked after every sector and once more on completion. The device
    /// is dropped for re-discovery when the upgrade hands over.
    pub fn upgrade_firmware(
        self: &Arc<Self>,
        updater: Vec<u8>,
        image: Vec<u8>,
        progress: Option<ProgressFn>,
    ) {
        let node = self.clone();
        thread::Builder::new()
            .name(format!("upgrade-{:08X}", self.id.serial))
            .spawn(move || {
                if let Err(err) = node.run_upgrade(&updater, image, progress.as_ref()) {
                    error!("firmware upgrade of device {} failed: {}", node.id, err);
                }
            })
            .expect("spawning upgrade worker");
    }

    fn run_upgrade(
        &self,
        updater: &[u8],
        mut image: Vec<u8>,
        progress: Option<&ProgressFn>,
    ) -> Result<(), Error> {
        let reply = self.start_upload()?;
        self.check(reply)?;
        let sectors = (image.len() + SECTOR_LEN - 1) / SECTOR_LEN;
        image.resize(sectors * SECTOR_LEN, 0);
        let checksum = crc::image_crc32(&image);
        info!(
            "uploading {} sectors of firmware to device {}",
            sectors, self.id
        );
        for sector in 0..sectors {
            self.upload_sector(
                sector as u32,
                &image[sector * SECTOR_LEN..(sector + 1) * SECTOR_LEN],
            )?;
            if let Some(progress) = progress {
                progress(sector as f64 / (sectors as f64 + 1.0));
            }
        }
        self.upload_buffer("updater", updater)?;
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&(sectors as u32).to_le_bytes());
        payload[4..].copy_from_slice(&checksum.to_le_bytes());
        let reply = self.cmd(MSG_APPLY_UPGRADE, 0, &payload)?;
        self.check(reply)?;
        if let Some(progress) = progress {
            progress(1.0);
        }
        // The node reboots into the updater; whatever comes back needs a
        // fresh discovery pass.
        if let Some(router) = self.router.upgrade() {
            router.drop_device(&self.id);
        }
        Ok(())
    }

    /// Reboots the node immediately.
    ///
    /// The node resets before it can answer, so the command's response
    /// timeout is the expected outcome and is absorbed; any other failure
    /// propagates. The device is dropped for re-discovery either way.
    pub fn reboot(&self) -> Result<(), Error> {
        let result = self.cmd(MSG_REBOOT, 0, &[]);
        if let Some(router) = self.router.upgrade() {
            router.drop_device(&self.id);
        }
        match result {
            Ok(_) => Ok(()),
            Err(Error::CommandTimeout { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::time::SystemClock;
    use crate::util;
    use std::time::Duration;

    #[test]
    fn upload_buffer_splits_into_blocks() {
        let router = MockRouter::new();
        let node = test_node(&router, Arc::new(SystemClock));
        router.echo_ok();
        let data: Vec<u8> = (0..100u8).collect();
        node.upload_buffer("updater", &data).unwrap();

        let sent = util::lock(&router.sent);
        // Blocks 0..3: three full 28-byte chunks and a 16-byte tail.
        let mut blocks: Vec<(u8, usize)> = sent
            .iter()
            .map(|p| (p[2], p.len() - 4))
            .collect();
        blocks.sort_unstable();
        blocks.dedup();
        assert_eq!(blocks, vec![(0, 28), (1, 28), (2, 28), (3, 16)]);
    }

    #[test]
    fn upload_errors_name_the_subject() {
        let router = MockRouter::new();
        let node = test_node(&router, Arc::new(SystemClock));
        router.set_responder(|sent| Some((echo_response(sent, 9), Duration::from_millis(0))));
        match node.upload_buffer("sector 3", &[0u8; 56]) {
            Err(Error::UploadFailed {
                subject, details, ..
            }) => {
                assert_eq!(subject, "sector 3");
                assert!(details.contains("status 09"));
            }
            other => panic!("expected upload failure, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn upgrade_streams_sectors_and_hands_over() {
        let router = MockRouter::new();
        let node = test_node(&router, Arc::new(SystemClock));
        router.echo_ok();
        // 600 bytes pad to two sectors.
        let image = vec![0xEE; 600];
        let updater = vec![0x11; 30];
        let expected_crc = {
            let mut padded = image.clone();
            padded.resize(2 * SECTOR_LEN, 0);
            crate::crc::image_crc32(&padded)
        };
        node.run_upgrade(&updater, image, None).unwrap();

        let sent = util::lock(&router.sent);
        let cmd_of = |p: &Vec<u8>| u16::from_le_bytes([p[0], p[1]]);
        assert_eq!(cmd_of(&sent[0]), MSG_START_UPLOAD);
        // Two sector commits with ascending sector numbers.
        let commits: Vec<&Vec<u8>> = sent
            .iter()
            .filter(|p| cmd_of(p) == MSG_COMMIT_SECTOR)
            .collect();
        assert_eq!(commits.len(), 2);
        assert_eq!(&commits[0][4..8], &0u32.to_le_bytes());
        assert_eq!(&commits[1][4..8], &1u32.to_le_bytes());
        // The hand-over carries sector count and image checksum.
        let apply = sent
            .iter()
            .find(|p| cmd_of(p) == MSG_APPLY_UPGRADE)
            .expect("apply command");
        assert_eq!(&apply[4..8], &2u32.to_le_bytes());
        assert_eq!(&apply[8..12], &expected_crc.to_le_bytes());
        drop(sent);

        // The device was dropped for re-discovery.
        assert_eq!(util::lock(&router.dropped).as_slice(), &[test_id()]);
    }

    #[test]
    fn reboot_absorbs_the_expected_timeout() {
        let router = MockRouter::new();
        let mut cfg = crate::Config::default();
        cfg.reply_timeout = Duration::from_millis(5);
        cfg.max_attempts = 3;
        let node = test_node_with_config(&router, Arc::new(SystemClock), &cfg);
        // No responder: the reboot command times out, which is fine.
        node.reboot().unwrap();
        assert_eq!(util::lock(&router.dropped).as_slice(), &[test_id()]);
    }
}
