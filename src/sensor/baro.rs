//! BMP-280 barometer driver.
//!
//! The chip reports raw pressure and temperature counts; compensation uses
//! the factory calibration words from page 1 and the floating-point formulas
//! from the datasheet.

use super::{AttrMap, AttrValue, Attribute, Decode, FieldKind, Schedule, SensorConfig};
use crate::Error;

static OVERSAMPLING: &[(i64, AttrValue)] = &[
    (0, AttrValue::Int(0)),
    (1, AttrValue::Int(1)),
    (2, AttrValue::Int(2)),
    (3, AttrValue::Int(4)),
    (4, AttrValue::Int(8)),
    (5, AttrValue::Int(16)),
];

static STANDBY_TIME: &[(i64, AttrValue)] = &[
    (0, AttrValue::Int(500)),
    (1, AttrValue::Int(62_500)),
    (2, AttrValue::Int(125_000)),
    (3, AttrValue::Int(250_000)),
    (4, AttrValue::Int(500_000)),
    (5, AttrValue::Int(1_000_000)),
    (6, AttrValue::Int(2_000_000)),
    (7, AttrValue::Int(4_000_000)),
];

static FILTER_WEIGHT: &[(i64, AttrValue)] = &[
    (0, AttrValue::Int(0)),
    (1, AttrValue::Int(1)),
    (2, AttrValue::Int(3)),
    (3, AttrValue::Int(7)),
    (4, AttrValue::Int(15)),
];

static RESOLUTION: &[(i64, AttrValue)] = &[(0, AttrValue::Int(16)), (1, AttrValue::Int(20))];

pub(crate) fn attrs(attrs: &mut AttrMap) {
    // Calibration values
    attrs.insert("calT1", Attribute::new(1, 0, FieldKind::U16Le));
    attrs.insert("calT2", Attribute::new(1, 2, FieldKind::I16Le));
    attrs.insert("calT3", Attribute::new(1, 4, FieldKind::I16Le));
    attrs.insert("calP1", Attribute::new(1, 6, FieldKind::U16Le));
    attrs.insert("calP2", Attribute::new(1, 8, FieldKind::I16Le));
    attrs.insert("calP3", Attribute::new(1, 10, FieldKind::I16Le));
    attrs.insert("calP4", Attribute::new(1, 12, FieldKind::I16Le));
    attrs.insert("calP5", Attribute::new(1, 14, FieldKind::I16Le));
    attrs.insert("calP6", Attribute::new(1, 16, FieldKind::I16Le));
    attrs.insert("calP7", Attribute::new(1, 18, FieldKind::I16Le));
    attrs.insert("calP8", Attribute::new(1, 20, FieldKind::I16Le));
    attrs.insert("calP9", Attribute::new(1, 22, FieldKind::I16Le));
    // Configuration
    attrs.insert(
        "temperatureOversampling",
        Attribute::new(2, 0, FieldKind::U8)
            .bits(7, 5)
            .map(OVERSAMPLING),
    );
    attrs.insert(
        "pressureOversampling",
        Attribute::new(2, 0, FieldKind::U8)
            .bits(7, 2)
            .map(OVERSAMPLING),
    );
    attrs.insert(
        "standbyTime",
        Attribute::new(2, 1, FieldKind::U8)
            .bits(7, 5)
            .map(STANDBY_TIME),
    );
    attrs.insert(
        "filterWeight",
        Attribute::new(2, 1, FieldKind::U8)
            .bits(7, 2)
            .map(FILTER_WEIGHT),
    );
    attrs.insert(
        "resolution",
        Attribute::new(2, 2, FieldKind::U8).bits(1, 0).map(RESOLUTION),
    );
}

pub(crate) struct PressureDecoder {
    sched: Schedule,
    t: [f64; 3],
    p: [f64; 9],
}

pub(crate) fn decoder() -> Box<dyn Decode> {
    Box::new(PressureDecoder {
        sched: Schedule::default(),
        t: [0.0; 3],
        p: [0.0; 9],
    })
}

impl Decode for PressureDecoder {
    fn update(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error> {
        self.sched.update(cfg)?;
        self.t = [
            cfg.float("calT1")?,
            cfg.float("calT2")?,
            cfg.float("calT3")?,
        ];
        for (i, cal) in self.p.iter_mut().enumerate() {
            *cal = cfg.float(&format!("calP{}", i + 1))?;
        }
        Ok(())
    }

    fn schedule(&self) -> Schedule {
        self.sched
    }

    fn components(&self) -> &[&'static str] {
        &["P", "Tbaro"]
    }

    fn units(&self) -> &[&'static str] {
        &["Pa", "°C"]
    }

    fn decode(&self, sample: &[u8]) -> Vec<f64> {
        if sample.len() < 4 {
            return vec![f64::NAN, f64::NAN];
        }
        let press = u16::from_be_bytes([sample[0], sample[1]]);
        let temp = u16::from_be_bytes([sample[2], sample[3]]);
        // In 20-bit resolution mode, the two LSB bytes for pressure and
        // temperature follow.
        let (press_low, temp_low) = if sample.len() >= 6 {
            (sample[4], sample[5])
        } else {
            (0, 0)
        };
        let press = f64::from((u32::from(press) << 4) | u32::from(press_low >> 4));
        let temp = f64::from((u32::from(temp) << 4) | u32::from(temp_low >> 4));

        // Compensate as specified by the datasheet.
        let temp = (temp / 16.0 - self.t[0]) / 1024.0;
        let temp = temp * self.t[1] + temp * temp / 64.0 * self.t[2];
        let var1 = (temp / 2.0) - 64000.0;
        let var2 = var1 * self.p[4] + var1 * var1 / 65536.0 * self.p[5] + self.p[3] * 131072.0;
        let var1 =
            (1.0 + (var1 * self.p[1] + var1 * var1 / 524288.0 * self.p[2]) / 524288.0 / 32768.0)
                * self.p[0];
        let press = if var1 != 0.0 {
            let press = ((1048576.0 - press) - (var2 / 8192.0)) * 6250.0 / var1;
            press
                + (press * self.p[7] / 32768.0
                    + press * press / 2147483648.0 * self.p[8]
                    + self.p[6])
                    / 16.0
        } else {
            f64::NAN
        };
        vec![press, temp / 5120.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_calibration_yields_nan_pressure() {
        let dec = PressureDecoder {
            sched: Schedule::default(),
            t: [0.0; 3],
            p: [0.0; 9],
        };
        let values = dec.decode(&[0x80, 0x00, 0x80, 0x00]);
        // calP1 == 0 makes the divisor vanish.
        assert!(values[0].is_nan());
        assert!(values[1].is_finite());
    }

    #[test]
    fn temperature_scale() {
        // With calT = [0, 1024*5120, 0] a raw count of 16 decodes to 1 °C.
        let dec = PressureDecoder {
            sched: Schedule::default(),
            t: [0.0, 1024.0 * 5120.0, 0.0],
            p: [1.0; 9],
        };
        let values = dec.decode(&[0x00, 0x00, 0x00, 0x01, 0x00, 0x00]);
        let expected = (f64::from(0x0010u16) / 16.0) / 1024.0 * 1024.0 * 5120.0 / 5120.0;
        assert!((values[1] - expected).abs() < 1e-6);
    }
}
