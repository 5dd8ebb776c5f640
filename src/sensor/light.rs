//! APDS-9901 ambient light and proximity driver.

use super::{AttrMap, AttrValue, Attribute, Decode, FieldKind, Schedule, SensorConfig, Translator};
use crate::Error;

static WAIT_TIME_FACTOR: &[(i64, AttrValue)] = &[(0, AttrValue::Int(1)), (1, AttrValue::Int(12))];

static REFLECTED_PULSE_CURRENT: &[(i64, AttrValue)] = &[
    (0, AttrValue::Int(100)),
    (1, AttrValue::Int(50)),
    (2, AttrValue::Int(25)),
    (3, AttrValue::Float(12.5)),
];

static AMBIENT_SENSOR_GAIN: &[(i64, AttrValue)] = &[
    (0, AttrValue::Int(1)),
    (1, AttrValue::Int(8)),
    (2, AttrValue::Int(16)),
    (3, AttrValue::Int(120)),
];

/// 8-bit cycle counters: a raw value of n means (256 - n) cycles of 2720 µs.
const CYCLE_TIME: Translator = Translator {
    decode: |raw| AttrValue::Int((256 - raw) * 2720),
    encode: |value| (256.0 - value / 2720.0).max(0.0).min(255.0) as i64,
};

pub(crate) fn attrs(attrs: &mut AttrMap) {
    attrs.insert(
        "waitTimeFactor",
        Attribute::new(2, 0, FieldKind::U8)
            .bits(1, 1)
            .map(WAIT_TIME_FACTOR),
    );
    attrs.insert(
        "reflectedPulseCount",
        Attribute::new(2, 1, FieldKind::U8),
    );
    attrs.insert(
        "reflectedPulseCurrent",
        Attribute::new(2, 2, FieldKind::U8)
            .bits(3, 6)
            .map(REFLECTED_PULSE_CURRENT),
    );
    attrs.insert(
        "ambientSensorGain",
        Attribute::new(2, 2, FieldKind::U8)
            .bits(3, 0)
            .map(AMBIENT_SENSOR_GAIN),
    );
    attrs.insert(
        "ambientIntegrationTime",
        Attribute::new(2, 3, FieldKind::U8).translate(CYCLE_TIME),
    );
    attrs.insert(
        "reflectedIntegrationTime",
        Attribute::new(2, 4, FieldKind::U8).translate(CYCLE_TIME),
    );
    attrs.insert(
        "waitTime",
        Attribute::new(2, 5, FieldKind::U8).translate(CYCLE_TIME),
    );
    attrs.insert("enableWait", Attribute::new(2, 27, FieldKind::U8).bits(1, 3));
    // Which channels of the sensor shall be sampled
    attrs.insert(
        "enableReflected",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 2),
    );
    attrs.insert(
        "enableInfrared",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 1),
    );
    attrs.insert(
        "enableFullSpectrum",
        Attribute::new(2, 27, FieldKind::U8).bits(1, 0),
    );
}

pub(crate) struct IntensityDecoder {
    sched: Schedule,
    enable_full_spectrum: bool,
    enable_infrared: bool,
    enable_reflected: bool,
    factor: f64,
}

pub(crate) fn decoder() -> Box<dyn Decode> {
    Box::new(IntensityDecoder {
        sched: Schedule::default(),
        enable_full_spectrum: false,
        enable_infrared: false,
        enable_reflected: false,
        factor: 0.0,
    })
}

impl Decode for IntensityDecoder {
    fn update(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error> {
        self.sched.update(cfg)?;
        self.enable_full_spectrum = cfg.flag("enableFullSpectrum")?;
        self.enable_infrared = cfg.flag("enableInfrared")?;
        self.enable_reflected = cfg.flag("enableReflected")?;
        // Lux scale, see the datasheet.
        self.factor =
            24960.0 / cfg.float("ambientIntegrationTime")? / cfg.float("ambientSensorGain")?;
        Ok(())
    }

    fn schedule(&self) -> Schedule {
        self.sched
    }

    fn components(&self) -> &[&'static str] {
        &["ADfs", "ADir", "ADrf", "Ev"]
    }

    fn units(&self) -> &[&'static str] {
        &["counts", "counts", "counts", "lx"]
    }

    fn decode(&self, mut sample: &[u8]) -> Vec<f64> {
        let mut channel = |enabled: bool| {
            if enabled && sample.len() >= 2 {
                let raw = u16::from_le_bytes([sample[0], sample[1]]);
                sample = &sample[2..];
                f64::from(raw)
            } else {
                f64::NAN
            }
        };
        let adfs = channel(self.enable_full_spectrum);
        let adir = channel(self.enable_infrared);
        let adrf = channel(self.enable_reflected);
        // Two-segment lux approximation, see the datasheet.
        let lux = (adfs - 2.23 * adir).max(0.7 * adfs - 1.42 * adir) * self.factor;
        vec![adfs, adir, adrf, lux]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lux_from_counts() {
        let dec = IntensityDecoder {
            sched: Schedule::default(),
            enable_full_spectrum: true,
            enable_infrared: true,
            enable_reflected: false,
            factor: 1.0,
        };
        let mut sample = Vec::new();
        sample.extend_from_slice(&1000u16.to_le_bytes());
        sample.extend_from_slice(&100u16.to_le_bytes());
        let values = dec.decode(&sample);
        assert_eq!(values[0], 1000.0);
        assert_eq!(values[1], 100.0);
        assert!(values[2].is_nan());
        assert!((values[3] - (1000.0 - 2.23 * 100.0)).abs() < 1e-9);
    }
}
