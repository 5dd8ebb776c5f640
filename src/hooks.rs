//! Extension points invoked from worker threads.
//!
//! Each hook is a single-method trait; an implementation is installed as an
//! `Arc<dyn ...>` and called from whichever worker produced the event (the
//! routing hub's dispatch thread for new devices, a device's packet path for
//! measurement data). Implementations must not block: they run on the hot
//! receive path and a slow hook stalls packet processing for every device on
//! the same base station.

use crate::device_id::DeviceId;
use crate::sensor::{AttrValue, SensorInfo};

/// Called by the routing hub when a previously unknown device requests an
/// address.
pub trait NewDeviceHook: Send + Sync {
    fn device_appeared(&self, id: &DeviceId);
}

/// Called by a base station for every received radio frame.
///
/// Installed by the routing hub; `payload` starts with the sender's node id.
pub trait PacketReceivedHook: Send + Sync {
    fn packet_received(&self, sof_count: u16, payload: &[u8]);
}

/// Called for every measurement data packet before reassembly.
///
/// `seq` is the reconstructed 32-bit stream sequence number.
pub trait RawDataHook: Send + Sync {
    fn raw_data(&self, device: &DeviceId, frame: u16, seq: u32, data: &[u8]);
}

/// Called once per sensor attribute when a measurement's configuration
/// header has been received.
pub trait AttrDataHook: Send + Sync {
    fn attr_data(&self, device: &DeviceId, sensor: &SensorInfo<'_>, attr: &str, value: &AttrValue);
}

/// Called for every decoded sample.
///
/// `time_ms` is the sample timestamp in milliseconds since the Unix epoch;
/// `values` holds one entry per component of the sensor, `NaN` for channels
/// that were not sampled.
pub trait DecodedDataHook: Send + Sync {
    fn decoded_data(&self, device: &DeviceId, sensor: &SensorInfo<'_>, time_ms: f64, values: &[f64]);
}
