//! Virtual timing sensor.
//!
//! Samples the node's local and radio-master clocks; used to correlate the
//! data streams of different nodes after a measurement.

use super::{AttrMap, Attribute, Decode, FieldKind, Schedule, SensorConfig};
use crate::Error;

const FIELD_NAMES: [&str; 2] = ["LocalTime", "MasterTime"];

pub(crate) fn attrs(attrs: &mut AttrMap) {
    // Which channels of the sensor shall be sampled
    attrs.insert(
        "enableMasterTime",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 1),
    );
    attrs.insert(
        "enableLocalTime",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 0),
    );
}

pub(crate) struct TimingDecoder {
    sched: Schedule,
    components: Vec<&'static str>,
    units: Vec<&'static str>,
}

pub(crate) fn decoder() -> Box<dyn Decode> {
    Box::new(TimingDecoder {
        sched: Schedule::default(),
        components: Vec::new(),
        units: Vec::new(),
    })
}

impl Decode for TimingDecoder {
    fn update(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error> {
        self.sched.update(cfg)?;
        let enable_bits = cfg.byte(2, 27)?;
        self.components.clear();
        self.units.clear();
        for (bit, name) in FIELD_NAMES.iter().copied().enumerate() {
            if (enable_bits >> bit) & 1 != 0 {
                self.components.push(name);
                self.units.push("µs");
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

#[cfg(test)]
mod tests {
    use super::super::{generic_attrs, PAGES_PER_SENSOR, PAGE_LEN};
    use super::*;

    #[test]
    fn components_follow_enable_bits() {
        let mut pages = [[0u8; PAGE_LEN]; PAGES_PER_SENSOR];
        pages[2][27] = 0b10; // master time only
        let mut a = generic_attrs();
        attrs(&mut a);
        let cfg = SensorConfig {
            attrs: &a,
            pages: &pages,
        };
        let mut dec = TimingDecoder {
            sched: Schedule::default(),
            components: Vec::new(),
            units: Vec::new(),
        };
        dec.update(&cfg).unwrap();
        assert_eq!(dec.components(), &["MasterTime"]);
        assert_eq!(dec.decode(&[0x34, 0x12]), [f64::from(0x1234u16)]);
    }
}
