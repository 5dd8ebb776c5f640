//! Host-side runtime for a 2.4 GHz time-slotted multi-sensor network.
//!
//! A fleet of battery-powered sensor nodes shares a radio channel owned by a
//! USB-attached base station. This crate turns the base station's raw USB byte
//! stream into reliable, ordered, per-device command/response and measurement
//! data flows:
//!
//! * [`usb`] frames the byte stream into fixed 64-byte packets and matches
//!   responses to commands through a 256-slot sequence-number pool.
//! * [`station`] drives the base station's radio: carrier control, node
//!   polling, slot ownership, and receiver-side telemetry.
//! * [`hub`] discovers nodes, assigns short radio addresses, ages them out,
//!   and routes inbound frames to the owning device.
//! * [`node`] implements the per-device reliable transport (32-entry
//!   sequence pool with retransmission and stale-reply avoidance), the
//!   measurement data-stream reassembler, configuration-page access, and
//!   firmware upload.
//! * [`sensor`] models per-sensor configuration as bit-field attributes and
//!   decodes the demultiplexed sample stream into physical quantities.
//!
//! The stack is hardware-agnostic at its seams: USB access sits behind
//! [`usb::UsbBulk`] and time behind [`time::Clock`], so everything above can
//! be exercised with mock implementations.
//!
//! [`usb`]: usb/index.html
//! [`station`]: station/index.html
//! [`hub`]: hub/index.html
//! [`node`]: node/index.html
//! [`sensor`]: sensor/index.html
//! [`usb::UsbBulk`]: usb/trait.UsbBulk.html
//! [`time::Clock`]: time/trait.Clock.html

pub mod bytes;
pub mod config;
mod crc;
mod device_id;
mod error;
pub mod hooks;
pub mod hub;
mod mailbox;
pub mod node;
pub mod record;
mod registry;
pub mod sensor;
mod stats;
pub mod station;
pub mod time;
pub mod usb;
mod util;

pub use self::config::Config;
pub use self::device_id::{DeviceId, DeviceInfo};
pub use self::error::Error;
