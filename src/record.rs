//! Measurement record shapes and series helpers.
//!
//! Measurement consumers (a submission client, a file logger) receive three
//! kinds of JSON records — raw stream packets, effective sensor attributes,
//! and decoded samples — batched per series:
//!
//! ```json
//! {"series": "<uuid>", "data": [{"type": "decoded", ...}, ...]}
//! ```
//!
//! The batching and delivery loop is the consumer's business; this module
//! only pins down the shapes and the series-header encoding so every
//! consumer writes the same stream.

use crate::device_id::DeviceId;
use crate::node::Node;
use crate::sensor::{AttrValue, SensorInfo, PAGE_LEN};
use crate::util;
use crate::Error;
use rand::Rng;
use serde::Serialize;
use uuid::v1::{Context, Timestamp};
use uuid::Uuid;

/// One measurement record.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Record {
    /// A raw measurement stream packet, hex-encoded.
    Raw {
        device: String,
        frame: u16,
        seq: u32,
        /// Reception wall-clock time in ms since the Unix epoch.
        time: f64,
        data: String,
    },
    /// An effective sensor attribute at measurement start.
    Attr {
        device: String,
        sensor: u8,
        attr: String,
        value: AttrValue,
    },
    /// One decoded sample.
    Decoded {
        device: String,
        sensor: u8,
        /// Sample time in ms since the Unix epoch.
        time: f64,
        component: Vec<String>,
        unit: Vec<String>,
        value: Vec<f64>,
    },
}

impl Record {
    pub fn raw(device: &DeviceId, frame: u16, seq: u32, time_ms: f64, data: &[u8]) -> Record {
        Record::Raw {
            device: device.to_string(),
            frame,
            seq,
            time: time_ms,
            data: util::hex_string(data),
        }
    }

    pub fn attr(device: &DeviceId, sensor: &SensorInfo<'_>, attr: &str, value: &AttrValue) -> Record {
        Record::Attr {
            device: device.to_string(),
            sensor: sensor.id,
            attr: attr.to_string(),
            value: *value,
        }
    }

    pub fn decoded(
        device: &DeviceId,
        sensor: &SensorInfo<'_>,
        time_ms: f64,
        values: &[f64],
    ) -> Record {
        Record::Decoded {
            device: device.to_string(),
            sensor: sensor.id,
            time: time_ms,
            component: sensor.components.iter().map(|c| c.to_string()).collect(),
            unit: sensor.units.iter().map(|u| u.to_string()).collect(),
            value: values.to_vec(),
        }
    }
}

/// A batch of records belonging to one measurement series.
#[derive(Clone, Debug, Serialize)]
pub struct SeriesBatch {
    pub series: String,
    pub data: Vec<Record>,
}

impl SeriesBatch {
    pub fn new(series: &Uuid, data: Vec<Record>) -> SeriesBatch {
        SeriesBatch {
            series: series.to_string(),
            data,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Mints a fresh version-1 series id from the wall clock and a random node
/// id.
pub fn new_series_id() -> Uuid {
    let mut rng = rand::thread_rng();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let context = Context::new(rng.gen());
    let timestamp = Timestamp::from_unix(&context, now.as_secs(), now.subsec_nanos());
    let node_id: [u8; 6] = rng.gen();
    Uuid::new_v1(timestamp, &node_id).unwrap_or_else(|_| Uuid::nil())
}

/// The 16-byte little-endian field layout the nodes store series ids in.
fn uuid_bytes_le(uuid: &Uuid) -> [u8; 16] {
    let (d1, d2, d3, d4) = uuid.as_fields();
    let mut bytes = [0u8; 16];
    bytes[..4].copy_from_slice(&d1.to_le_bytes());
    bytes[4..6].copy_from_slice(&d2.to_le_bytes());
    bytes[6..8].copy_from_slice(&d3.to_le_bytes());
    bytes[8..].copy_from_slice(d4);
    bytes
}

/// Series-header page 1: 12 reserved zero bytes followed by the series id.
pub fn series_id_page(series: &Uuid) -> [u8; PAGE_LEN] {
    let mut page = [0u8; PAGE_LEN];
    page[12..].copy_from_slice(&uuid_bytes_le(series));
    page
}

/// Series-header page 2: the measurement name, UTF-8, truncated to the page
/// size.
pub fn series_name_page(name: &str) -> Vec<u8> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.truncate(PAGE_LEN);
    bytes
}

impl Node {
    /// Writes the series id and name into the node's series header.
    pub fn write_series_info(&self, series: &Uuid, name: &str) -> Result<(), Error> {
        let reply = self.write_series_header_page(1, &series_id_page(series))?;
        self.check(reply)?;
        let reply = self.write_series_header_page(2, &series_name_page(name))?;
        self.check(reply)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device() -> DeviceId {
        DeviceId {
            vendor: 0x5341_4149,
            product: 0x534D_5053,
            serial: 0x0000_00AB,
        }
    }

    #[test]
    fn record_shapes() {
        let sensor = SensorInfo {
            id: 3,
            name: "Force 3D Vector (MPU9250/MPU6250)",
            components: &["X", "Y", "Z"],
            units: &["g", "g", "g"],
        };
        let raw = Record::raw(&device(), 0x42, 7, 1234.5, &[0xDE, 0xAD]);
        assert_eq!(
            serde_json::to_value(&raw).unwrap(),
            json!({
                "type": "raw",
                "device": "53414149534D5053000000AB",
                "frame": 0x42,
                "seq": 7,
                "time": 1234.5,
                "data": "dead",
            })
        );

        let attr = Record::attr(&device(), &sensor, "fullScale", &AttrValue::Int(4));
        assert_eq!(
            serde_json::to_value(&attr).unwrap(),
            json!({
                "type": "attr",
                "device": "53414149534D5053000000AB",
                "sensor": 3,
                "attr": "fullScale",
                "value": 4,
            })
        );

        let decoded = Record::decoded(&device(), &sensor, 1001.0, &[0.5, 1.0, -0.25]);
        assert_eq!(
            serde_json::to_value(&decoded).unwrap(),
            json!({
                "type": "decoded",
                "device": "53414149534D5053000000AB",
                "sensor": 3,
                "time": 1001.0,
                "component": ["X", "Y", "Z"],
                "unit": ["g", "g", "g"],
                "value": [0.5, 1.0, -0.25],
            })
        );
    }

    #[test]
    fn batch_envelope() {
        let series = new_series_id();
        let batch = SeriesBatch::new(&series, vec![]);
        let value: serde_json::Value = serde_json::from_str(&batch.to_json().unwrap()).unwrap();
        assert_eq!(value["series"], series.to_string());
        assert!(value["data"].as_array().unwrap().is_empty());
    }

    #[test]
    fn series_ids_are_v1_and_unique() {
        let a = new_series_id();
        let b = new_series_id();
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 1);
    }

    #[test]
    fn header_pages() {
        let series = Uuid::from_fields(
            0x0102_0304,
            0x0506,
            0x0708,
            &[0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10],
        )
        .unwrap();
        let page = series_id_page(&series);
        assert!(page[..12].iter().all(|&b| b == 0));
        assert_eq!(
            &page[12..],
            &[
                0x04, 0x03, 0x02, 0x01, // d1, little endian
                0x06, 0x05, // d2
                0x08, 0x07, // d3
                0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10,
            ]
        );

        assert_eq!(series_name_page("Testmessung"), b"Testmessung".to_vec());
        let long = "x".repeat(40);
        assert_eq!(series_name_page(&long).len(), PAGE_LEN);
    }
}
