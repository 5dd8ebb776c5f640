//! Si7020/7021 hygrometer/thermometer driver.

use super::{AttrMap, AttrValue, Attribute, Decode, FieldKind, Schedule, SensorConfig};
use crate::Error;

static RESOLUTION: &[(i64, AttrValue)] = &[
    (0, AttrValue::Str("h12t14")),
    (1, AttrValue::Str("h8t12")),
    (2, AttrValue::Str("h10t13")),
    (3, AttrValue::Str("h11t11")),
];

pub(crate) fn attrs(attrs: &mut AttrMap) {
    attrs.insert(
        "resolution",
        Attribute::new(2, 0, FieldKind::U8).bits(3, 5).map(RESOLUTION),
    );
    attrs.insert("heaterOn", Attribute::new(2, 0, FieldKind::U8).bits(1, 4));
    attrs.insert(
        "heaterCurrent",
        Attribute::new(2, 0, FieldKind::U8).bits(15, 0),
    );
    // Which channels of the sensor shall be sampled
    attrs.insert(
        "enableTemperature",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 1),
    );
    attrs.insert(
        "enableHumidity",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 0),
    );
}

pub(crate) struct HumidityDecoder {
    sched: Schedule,
    enable_temp: bool,
    enable_hum: bool,
}

pub(crate) fn decoder() -> Box<dyn Decode> {
    Box::new(HumidityDecoder {
        sched: Schedule::default(),
        enable_temp: false,
        enable_hum: false,
    })
}

impl Decode for HumidityDecoder {
    fn update(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error> {
        self.sched.update(cfg)?;
        self.enable_temp = cfg.flag("enableTemperature")?;
        self.enable_hum = cfg.flag("enableHumidity")?;
        Ok(())
    }

    fn schedule(&self) -> Schedule {
        self.sched
    }

    fn components(&self) -> &[&'static str] {
        &["H", "Thyg"]
    }

    fn units(&self) -> &[&'static str] {
        &["%RH", "°C"]
    }

    fn decode(&self, mut sample: &[u8]) -> Vec<f64> {
        // Conversion formulas from the datasheet.
        let hum = if self.enable_hum && sample.len() >= 2 {
            let raw = u16::from_be_bytes([sample[0], sample[1]]);
            sample = &sample[2..];
            f64::from(raw) * 125.0 / 65536.0 - 6.0
        } else {
            f64::NAN
        };
        let temp = if self.enable_temp && sample.len() >= 2 {
            let raw = u16::from_be_bytes([sample[0], sample[1]]);
            f64::from(raw) * 175.72 / 65535.0 - 46.85
        } else {
            f64::NAN
        };
        vec![hum, temp]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humidity_only_record() {
        let dec = HumidityDecoder {
            sched: Schedule::default(),
            enable_temp: false,
            enable_hum: true,
        };
        let values = dec.decode(&[0x80, 0x00]);
        assert!((values[0] - (32768.0 * 125.0 / 65536.0 - 6.0)).abs() < 1e-9);
        assert!(values[1].is_nan());
    }

    #[test]
    fn both_channels() {
        let dec = HumidityDecoder {
            sched: Schedule::default(),
            enable_temp: true,
            enable_hum: true,
        };
        let values = dec.decode(&[0x00, 0x00, 0xFF, 0xFF]);
        assert!((values[0] + 6.0).abs() < 1e-9);
        assert!((values[1] - (175.72 - 46.85)).abs() < 1e-9);
    }
}
