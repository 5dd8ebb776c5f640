//! USB framing transport.
//!
//! The base station exchanges fixed 64-byte packets with the host. Every
//! host-to-device packet starts with a common header:
//!
//! ```notrust
//! offset  0        2      3          4
//!         +--------+------+----------+------------------- - -
//!         | msg    | seq  | reserved | payload (60 bytes,
//!         | (u16)  | (u8) | (u8)     |  zero padded)
//!         +--------+------+----------+------------------- - -
//! ```
//!
//! Device-to-host packets begin identically; the top two bits of `msg`
//! classify them: `10` is a response to a command (carrying `result: u32` at
//! offset 4), `11` is an unsolicited notification, `00`/`01` are reserved.
//!
//! Commands that expect a response reserve one of 255 sequence numbers
//! (id 0 is never used) and install a reply mailbox under that id; the
//! processing worker completes the mailbox when the matching response
//! arrives. 63 ids are deliberately kept free at all times so that a stale
//! response to a cancelled command is unlikely to hit a live listener.

pub mod hw;

pub use self::hw::{InterfaceKind, UsbBulk, UsbDeviceIo};

use crate::config::Config;
use crate::mailbox::Mailbox;
use crate::util::{self, HexSlice};
use crate::Error;
use log::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

/// Fixed size of every USB packet.
pub const PACKET_LEN: usize = 64;

/// Maximum payload of one packet.
pub const MAX_PAYLOAD: usize = PACKET_LEN - 4;

/// Block bulk reads this long. Short timeouts lose data on some host USB
/// stacks, so the device ends transfers early with a zero-length packet
/// instead.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Size of one bulk IN transfer (1024 packets).
const READ_CHUNK: usize = 64 * 1024;

/// Timeout for a single bulk OUT transfer.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Keep at least 63 of the 255 usable sequence numbers unreserved.
const MAX_ACTIVE: usize = 192;

/// A decoded response packet.
#[derive(Clone, Debug)]
pub struct UsbReply {
    pub msg: u16,
    pub seq: u8,
    pub reserved: u8,
    /// Result code at payload offset 0.
    pub result: u32,
    /// Packet bytes after the result code.
    pub payload: Vec<u8>,
}

struct CommState {
    listeners: Vec<Option<Arc<Mailbox<UsbReply>>>>,
    next_seq: u8,
    active: usize,
}

struct Shared {
    io: Arc<dyn UsbBulk>,
    comm: Mutex<CommState>,
    cmd_finished: Condvar,
    notify: RwLock<Option<Box<dyn Fn(&[u8]) + Send + Sync>>>,
    dead: AtomicBool,
    acquire_timeout: Duration,
}

/// Packet transport to one USB device.
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// Creates a transport over the given endpoints and starts its receive
    /// and processing workers.
    pub fn new(io: Arc<dyn UsbBulk>, cfg: &Config) -> Transport {
        let shared = Arc::new(Shared {
            io,
            comm: Mutex::new(CommState {
                listeners: (0..256).map(|_| None).collect(),
                next_seq: 1,
                active: 0,
            }),
            cmd_finished: Condvar::new(),
            notify: RwLock::new(None),
            dead: AtomicBool::new(false),
            acquire_timeout: cfg.acquire_timeout,
        });

        let (tx, rx) = mpsc::channel();
        let weak = Arc::downgrade(&shared);
        thread::Builder::new()
            .name("usb-rx".into())
            .spawn(move || rx_worker(weak, tx))
            .expect("spawning usb-rx worker");
        let weak = Arc::downgrade(&shared);
        thread::Builder::new()
            .name("usb-proc".into())
            .spawn(move || proc_worker(weak, rx))
            .expect("spawning usb-proc worker");

        Transport { shared }
    }

    /// Installs the handler for notification packets. Called with the whole
    /// 64-byte packet from the processing worker.
    pub(crate) fn set_notify_handler(&self, handler: impl Fn(&[u8]) + Send + Sync + 'static) {
        *util::write(&self.shared.notify) = Some(Box::new(handler));
    }

    /// Whether the transport was torn down after a fatal transfer error.
    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::Relaxed)
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if self.is_dead() {
            Err(Error::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Sends one packet, padded to 64 bytes.
    fn send_packet(&self, msg: u16, seq: u8, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::InvalidLength);
        }
        self.ensure_live()?;
        let mut packet = [0u8; PACKET_LEN];
        packet[..2].copy_from_slice(&msg.to_le_bytes());
        packet[2] = seq;
        packet[4..4 + payload.len()].copy_from_slice(payload);
        trace!("usb >>> {:?}", HexSlice(&packet[..]));
        if self.shared.io.write_bulk(&packet, WRITE_TIMEOUT)? != PACKET_LEN {
            return Err(Error::WriteFailed);
        }
        Ok(())
    }

    /// Sends a command without reserving a sequence number; no response is
    /// expected or matched.
    pub fn send_noreply(&self, msg: u16, payload: &[u8]) -> Result<(), Error> {
        self.send_packet(msg, 0, payload)
    }

    /// Reserves a sequence number, installs a reply listener and transmits
    /// the command packet.
    pub(crate) fn async_command(&self, msg: u16, payload: &[u8]) -> Result<PendingReply, Error> {
        self.ensure_live()?;
        let (seq, mailbox) = {
            let mut comm = util::lock(&self.shared.comm);
            loop {
                while comm.active > MAX_ACTIVE {
                    let (guard, result) = self
                        .shared
                        .cmd_finished
                        .wait_timeout(comm, self.shared.acquire_timeout)
                        .unwrap_or_else(|e| e.into_inner());
                    comm = guard;
                    if result.timed_out() && comm.active > MAX_ACTIVE {
                        return Err(Error::SequenceExhausted);
                    }
                }
                let seq = comm.next_seq;
                comm.next_seq = comm.next_seq.wrapping_add(1);
                if comm.next_seq == 0 {
                    comm.next_seq = 1;
                }
                if comm.listeners[seq as usize].is_none() {
                    let mailbox = Arc::new(Mailbox::new());
                    comm.listeners[seq as usize] = Some(mailbox.clone());
                    comm.active += 1;
                    break (seq, mailbox);
                }
                // That sequence number is in use, try the next one.
            }
        };
        let pending = PendingReply {
            shared: self.shared.clone(),
            mailbox,
            seq,
        };
        // The slot bookkeeping lock is never held across the bulk write; a
        // failed transmission releases the slot through the guard.
        self.send_packet(msg, seq, payload)?;
        Ok(pending)
    }

    /// Synchronous command execution: reserves a sequence number, transmits,
    /// and waits up to `timeout` for the matching response.
    pub fn command(&self, msg: u16, payload: &[u8], timeout: Duration) -> Result<UsbReply, Error> {
        self.async_command(msg, payload)?.wait(timeout)
    }
}

/// A reserved sequence number with its reply listener.
///
/// Dropping releases the sequence number, whether or not a response arrived.
pub(crate) struct PendingReply {
    shared: Arc<Shared>,
    mailbox: Arc<Mailbox<UsbReply>>,
    seq: u8,
}

impl PendingReply {
    /// Waits for the response, consuming the reservation.
    pub fn wait(self, timeout: Duration) -> Result<UsbReply, Error> {
        self.mailbox.wait(timeout).ok_or(Error::ResponseTimeout)
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let mut comm = util::lock(&self.shared.comm);
        comm.listeners[self.seq as usize] = None;
        comm.active -= 1;
        self.shared.cmd_finished.notify_all();
    }
}

/// Receive worker: keeps a large bulk IN transfer posted and forwards
/// complete reads to the processing worker.
fn rx_worker(weak: Weak<Shared>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let shared = match weak.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        match shared.io.read_bulk(&mut buf, READ_TIMEOUT) {
            Ok(len) => {
                if tx.send(buf[..len].to_vec()).is_err() {
                    return;
                }
            }
            Err(Error::Usb(rusb::Error::Timeout)) => {}
            Err(err) => {
                log::error!("USB receive failed, shutting transport down: {}", err);
                shared.dead.store(true, Ordering::Relaxed);
                // Unblock anyone waiting for a free sequence number.
                shared.cmd_finished.notify_all();
                return;
            }
        }
    }
}

/// Processing worker: splits reads into packets and demultiplexes them to
/// reply listeners or the notification handler.
fn proc_worker(weak: Weak<Shared>, rx: mpsc::Receiver<Vec<u8>>) {
    while let Ok(data) = rx.recv() {
        let shared = match weak.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        if data.len() < PACKET_LEN {
            continue;
        }
        for packet in data.chunks_exact(PACKET_LEN) {
            trace!("usb <<< {:?}", HexSlice(packet));
            let msg = u16::from_le_bytes([packet[0], packet[1]]);
            let seq = packet[2];
            let reserved = packet[3];
            match msg >> 14 {
                2 => {
                    let mailbox = util::lock(&shared.comm).listeners[seq as usize].clone();
                    if let Some(mailbox) = mailbox {
                        let result =
                            u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]);
                        mailbox.put(UsbReply {
                            msg,
                            seq,
                            reserved,
                            result,
                            payload: packet[8..].to_vec(),
                        });
                    }
                }
                3 => {
                    let notify = util::read(&shared.notify);
                    if let Some(handler) = notify.as_ref() {
                        handler(packet);
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};

    /// In-memory endpoint pair: writes are captured, reads are fed by the
    /// test through a channel.
    pub(crate) struct MockUsb {
        pub written: Mutex<Vec<Vec<u8>>>,
        reads: Mutex<Receiver<Vec<u8>>>,
        feed: Mutex<Sender<Vec<u8>>>,
        wrote: Condvar,
    }

    impl MockUsb {
        pub fn new() -> Arc<MockUsb> {
            let (feed, reads) = mpsc::channel();
            Arc::new(MockUsb {
                written: Mutex::new(Vec::new()),
                reads: Mutex::new(reads),
                feed: Mutex::new(feed),
                wrote: Condvar::new(),
            })
        }

        /// Waits until `count` packets have been written.
        pub fn wait_written(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
            let mut written = util::lock(&self.written);
            let deadline = std::time::Instant::now() + timeout;
            while written.len() < count {
                let now = std::time::Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self
                    .wrote
                    .wait_timeout(written, deadline - now)
                    .unwrap_or_else(|e| e.into_inner());
                written = guard;
            }
            written.clone()
        }

        /// Feeds one 64-byte packet into the read stream.
        pub fn feed_packet(&self, packet: &[u8]) {
            let mut full = packet.to_vec();
            full.resize(PACKET_LEN, 0);
            util::lock(&self.feed).send(full).unwrap();
        }
    }

    impl UsbBulk for MockUsb {
        fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
            let reads = util::lock(&self.reads);
            match reads.recv_timeout(timeout.min(Duration::from_millis(50))) {
                Ok(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Err(RecvTimeoutError::Timeout) => Err(Error::Usb(rusb::Error::Timeout)),
                Err(RecvTimeoutError::Disconnected) => Err(Error::Usb(rusb::Error::NoDevice)),
            }
        }

        fn write_bulk(&self, data: &[u8], _timeout: Duration) -> Result<usize, Error> {
            self.written.lock().unwrap().push(data.to_vec());
            self.wrote.notify_all();
            Ok(data.len())
        }
    }

    fn response(msg: u16, seq: u8, result: u32, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; PACKET_LEN];
        packet[..2].copy_from_slice(&msg.to_le_bytes());
        packet[2] = seq;
        packet[4..8].copy_from_slice(&result.to_le_bytes());
        packet[8..8 + payload.len()].copy_from_slice(payload);
        packet
    }

    #[test]
    fn command_reply_roundtrip() {
        let io = MockUsb::new();
        let transport = Transport::new(io.clone(), &Config::default());
        let pending = transport.async_command(0x0100, &[]).unwrap();

        let written = io.wait_written(1, Duration::from_secs(5));
        assert_eq!(written.len(), 1);
        let packet = &written[0];
        assert_eq!(packet.len(), PACKET_LEN);
        assert_eq!(&packet[..2], &0x0100u16.to_le_bytes());
        let seq = packet[2];
        assert_ne!(seq, 0);

        io.feed_packet(&response(0x8100, seq, 7, b"stats"));
        let reply = pending.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(reply.msg, 0x8100);
        assert_eq!(reply.result, 7);
        assert_eq!(&reply.payload[..5], b"stats");
    }

    #[test]
    fn fire_and_forget_uses_seq_zero() {
        let io = MockUsb::new();
        let transport = Transport::new(io.clone(), &Config::default());
        transport.send_noreply(0x027e, &[1, 2, 3]).unwrap();
        let written = io.wait_written(1, Duration::from_secs(5));
        assert_eq!(written[0][2], 0);
        assert_eq!(&written[0][4..7], &[1, 2, 3]);
    }

    #[test]
    fn stale_response_is_ignored() {
        let io = MockUsb::new();
        let transport = Transport::new(io.clone(), &Config::default());
        let pending = transport.async_command(0x0100, &[]).unwrap();
        let seq = io.wait_written(1, Duration::from_secs(5))[0][2];
        drop(pending);

        // A late response to the cancelled command must not complete the
        // next command, which gets a different sequence number.
        io.feed_packet(&response(0x8100, seq, 0, &[]));
        let pending = transport.async_command(0x0101, &[]).unwrap();
        let seq2 = io.wait_written(2, Duration::from_secs(5))[1][2];
        assert_ne!(seq, seq2);
        assert!(pending.wait(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn sequence_numbers_rotate_and_skip_zero() {
        let io = MockUsb::new();
        let transport = Transport::new(io.clone(), &Config::default());
        // Run the cursor across the wrap point.
        for _ in 0..300 {
            let pending = transport.async_command(0x0100, &[]).unwrap();
            drop(pending);
        }
        let written = io.wait_written(300, Duration::from_secs(10));
        assert!(written.iter().all(|p| p[2] != 0));
        // The cursor rotates instead of reusing one id.
        assert_ne!(written[0][2], written[1][2]);
    }

    #[test]
    fn notifications_reach_the_handler() {
        let io = MockUsb::new();
        let transport = Transport::new(io.clone(), &Config::default());
        let (tx, rx) = mpsc::channel();
        transport.set_notify_handler(move |packet| {
            tx.send(packet.to_vec()).unwrap();
        });
        let mut notify = vec![0u8; PACKET_LEN];
        notify[..2].copy_from_slice(&0xC001u16.to_le_bytes());
        notify[4] = 0x34;
        io.feed_packet(&notify);
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got[4], 0x34);
    }
}
