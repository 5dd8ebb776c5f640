//! Virtual telemetry sensor.
//!
//! Samples the node's radio link counters alongside the measurement so link
//! quality can be analyzed per sampling window.

use super::{AttrMap, Attribute, Decode, FieldKind, Schedule, SensorConfig};
use crate::Error;

const FIELD_NAMES: [&str; 8] = [
    "SOFReceived",
    "SOFTimingFailed",
    "SOFDiscontinuity",
    "TXAttemptCount",
    "TXACKCount",
    "RXCMDCount",
    "Reserved0",
    "Reserved1",
];

pub(crate) fn attrs(attrs: &mut AttrMap) {
    // Which channels of the sensor shall be sampled
    attrs.insert(
        "enableReserved1",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 7),
    );
    attrs.insert(
        "enableReserved0",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 6),
    );
    attrs.insert(
        "enableRXCMDCount",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 5),
    );
    attrs.insert(
        "enableTXACKCount",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 4),
    );
    attrs.insert(
        "enableTXAttemptCount",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 3),
    );
    attrs.insert(
        "enableSOFDiscontinuity",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 2),
    );
    attrs.insert(
        "enableSOFTimingFailed",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 1),
    );
    attrs.insert(
        "enableSOFReceived",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 0),
    );
}

pub(crate) struct TelemetryDecoder {
    sched: Schedule,
    components: Vec<&'static str>,
    units: Vec<&'static str>,
}

pub(crate) fn decoder() -> Box<dyn Decode> {
    Box::new(TelemetryDecoder {
        sched: Schedule::default(),
        components: Vec::new(),
        units: Vec::new(),
    })
}

impl Decode for TelemetryDecoder {
    fn update(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error> {
        self.sched.update(cfg)?;
        let enable_bits = cfg.byte(2, 27)?;
        self.components.clear();
        self.units.clear();
        for (bit, name) in FIELD_NAMES.iter().copied().enumerate() {
            if (enable_bits >> bit) & 1 != 0 {
                self.components.push(name);
                self.units.push("");
            }
        }
        Ok(())
    }

    fn schedule(&self) -> Schedule {
        self.sched
    }

    fn components(&self) -> &[&'static str] {
        &self.components
    }

    fn units(&self) -> &[&'static str] {
        &self.units
    }

    fn decode(&self, sample: &[u8]) -> Vec<f64> {
        sample
            .chunks_exact(2)
            .map(|c| f64::from(u16::from_le_bytes([c[0], c[1]])))
            .collect()
    }
}
