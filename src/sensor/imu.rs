//! MPU-9250/6050 inertial measurement unit drivers.
//!
//! The IMU exposes four logical sensors: accelerometer, gyroscope,
//! magnetometer (9250 only) and die temperature. Channel-enable flags and
//! full-scale settings live in page 2, factory calibration in page 1; see the
//! chip datasheet for the field meanings.

use super::{AttrMap, AttrValue, Attribute, Decode, FieldKind, Schedule, SensorConfig};
use crate::Error;

static ACCEL_FULL_SCALE: &[(i64, AttrValue)] = &[
    (0, AttrValue::Int(2)),
    (1, AttrValue::Int(4)),
    (2, AttrValue::Int(8)),
    (3, AttrValue::Int(16)),
];

static GYRO_FULL_SCALE: &[(i64, AttrValue)] = &[
    (0, AttrValue::Int(250)),
    (1, AttrValue::Int(500)),
    (2, AttrValue::Int(1000)),
    (3, AttrValue::Int(2000)),
];

pub(crate) fn accel_attrs(attrs: &mut AttrMap) {
    // Calibration values
    attrs.insert("stDataX", Attribute::new(1, 0, FieldKind::I8));
    attrs.insert("stDataY", Attribute::new(1, 1, FieldKind::I8));
    attrs.insert("stDataZ", Attribute::new(1, 2, FieldKind::I8));
    // Configuration
    attrs.insert("selfTestX", Attribute::new(2, 0, FieldKind::U8).bits(1, 7));
    attrs.insert("selfTestY", Attribute::new(2, 0, FieldKind::U8).bits(1, 6));
    attrs.insert("selfTestZ", Attribute::new(2, 0, FieldKind::U8).bits(1, 5));
    attrs.insert(
        "fullScale",
        Attribute::new(2, 0, FieldKind::U8)
            .bits(3, 3)
            .map(ACCEL_FULL_SCALE),
    );
    attrs.insert("fchoiceB", Attribute::new(2, 1, FieldKind::U8).bits(1, 3));
    attrs.insert("dlpfCfg", Attribute::new(2, 1, FieldKind::U8).bits(7, 0));
    // Which channels of the sensor shall be sampled
    attrs.insert("enableX", Attribute::new(2, 27, FieldKind::U8).bits(1, 2));
    attrs.insert("enableY", Attribute::new(2, 27, FieldKind::U8).bits(1, 1));
    attrs.insert("enableZ", Attribute::new(2, 27, FieldKind::U8).bits(1, 0));
}

pub(crate) fn gyro_attrs(attrs: &mut AttrMap) {
    // Calibration values
    attrs.insert("stDataX", Attribute::new(1, 0, FieldKind::I8));
    attrs.insert("stDataY", Attribute::new(1, 1, FieldKind::I8));
    attrs.insert("stDataZ", Attribute::new(1, 2, FieldKind::I8));
    // Configuration
    attrs.insert("offsetX", Attribute::new(2, 0, FieldKind::I16Be));
    attrs.insert("offsetY", Attribute::new(2, 2, FieldKind::I16Be));
    attrs.insert("offsetZ", Attribute::new(2, 4, FieldKind::I16Be));
    attrs.insert("sampleRateDiv", Attribute::new(2, 6, FieldKind::U8));
    attrs.insert("dlpfCfg", Attribute::new(2, 7, FieldKind::U8).bits(7, 0));
    attrs.insert("selfTestX", Attribute::new(2, 8, FieldKind::U8).bits(1, 7));
    attrs.insert("selfTestY", Attribute::new(2, 8, FieldKind::U8).bits(1, 6));
    attrs.insert("selfTestZ", Attribute::new(2, 8, FieldKind::U8).bits(1, 5));
    attrs.insert(
        "fullScale",
        Attribute::new(2, 8, FieldKind::U8)
            .bits(3, 3)
            .map(GYRO_FULL_SCALE),
    );
    attrs.insert("fchoiceB", Attribute::new(2, 8, FieldKind::U8).bits(3, 0));
    // Which channels of the sensor shall be sampled
    attrs.insert("enableX", Attribute::new(2, 27, FieldKind::U8).bits(1, 2));
    attrs.insert("enableY", Attribute::new(2, 27, FieldKind::U8).bits(1, 1));
    attrs.insert("enableZ", Attribute::new(2, 27, FieldKind::U8).bits(1, 0));
}

pub(crate) fn mag_attrs(attrs: &mut AttrMap) {
    // Calibration values
    attrs.insert("stDataX", Attribute::new(1, 0, FieldKind::I16Le));
    attrs.insert("stDataY", Attribute::new(1, 2, FieldKind::I16Le));
    attrs.insert("stDataZ", Attribute::new(1, 4, FieldKind::I16Le));
    attrs.insert("stOverflow", Attribute::new(1, 6, FieldKind::U8).bits(1, 3));
    attrs.insert("calScaleX", Attribute::new(1, 7, FieldKind::U8));
    attrs.insert("calScaleY", Attribute::new(1, 8, FieldKind::U8));
    attrs.insert("calScaleZ", Attribute::new(1, 9, FieldKind::U8));
    // Which channels of the sensor shall be sampled
    attrs.insert("enableX", Attribute::new(2, 27, FieldKind::U8).bits(1, 2));
    attrs.insert("enableY", Attribute::new(2, 27, FieldKind::U8).bits(1, 1));
    attrs.insert("enableZ", Attribute::new(2, 27, FieldKind::U8).bits(1, 0));
}

pub(crate) fn temp_attrs(_attrs: &mut AttrMap) {}

/// Decodes a 3-axis big-endian `i16` record with a common scale factor and
/// per-axis enable flags. Disabled axes are not present in the record and
/// decode to `NaN`.
struct VectorDecoder {
    sched: Schedule,
    enable: [bool; 3],
    factor: [f64; 3],
}

impl VectorDecoder {
    fn new() -> Self {
        VectorDecoder {
            sched: Schedule::default(),
            enable: [false; 3],
            factor: [0.0; 3],
        }
    }

    fn update_enables(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error> {
        self.sched.update(cfg)?;
        self.enable = [
            cfg.flag("enableX")?,
            cfg.flag("enableY")?,
            cfg.flag("enableZ")?,
        ];
        Ok(())
    }

    fn decode(&self, mut sample: &[u8]) -> Vec<f64> {
        let mut out = Vec::with_capacity(3);
        for axis in 0..3 {
            if self.enable[axis] && sample.len() >= 2 {
                let raw = i16::from_be_bytes([sample[0], sample[1]]);
                out.push(f64::from(raw) * self.factor[axis]);
                sample = &sample[2..];
            } else {
                out.push(f64::NAN);
            }
        }
        out
    }
}

pub(crate) struct AccelDecoder(VectorDecoder);

pub(crate) fn accel_decoder() -> Box<dyn Decode> {
    Box::new(AccelDecoder(VectorDecoder::new()))
}

impl Decode for AccelDecoder {
    fn update(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error> {
        self.0.update_enables(cfg)?;
        let factor = cfg.float("fullScale")? / 32767.0;
        self.0.factor = [factor; 3];
        Ok(())
    }

    fn schedule(&self) -> Schedule {
        self.0.sched
    }

    fn components(&self) -> &[&'static str] {
        &["X", "Y", "Z"]
    }

    fn units(&self) -> &[&'static str] {
        &["g", "g", "g"]
    }

    fn decode(&self, sample: &[u8]) -> Vec<f64> {
        self.0.decode(sample)
    }
}

pub(crate) struct GyroDecoder(VectorDecoder);

pub(crate) fn gyro_decoder() -> Box<dyn Decode> {
    Box::new(GyroDecoder(VectorDecoder::new()))
}

impl Decode for GyroDecoder {
    fn update(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error> {
        self.0.update_enables(cfg)?;
        let factor = cfg.float("fullScale")? / 32767.0;
        self.0.factor = [factor; 3];
        Ok(())
    }

    fn schedule(&self) -> Schedule {
        self.0.sched
    }

    fn components(&self) -> &[&'static str] {
        &["X", "Y", "Z"]
    }

    fn units(&self) -> &[&'static str] {
        &["°/s", "°/s", "°/s"]
    }

    fn decode(&self, sample: &[u8]) -> Vec<f64> {
        self.0.decode(sample)
    }
}

pub(crate) struct MagDecoder(VectorDecoder);

pub(crate) fn mag_decoder() -> Box<dyn Decode> {
    Box::new(MagDecoder(VectorDecoder::new()))
}

impl Decode for MagDecoder {
    fn update(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error> {
        self.0.update_enables(cfg)?;
        // Sensitivity adjustment per axis, see the AK8963 datasheet.
        self.0.factor = [
            0.15 * (0.5 + cfg.float("calScaleX")? / 256.0),
            0.15 * (0.5 + cfg.float("calScaleY")? / 256.0),
            0.15 * (0.5 + cfg.float("calScaleZ")? / 256.0),
        ];
        Ok(())
    }

    fn schedule(&self) -> Schedule {
        self.0.sched
    }

    fn components(&self) -> &[&'static str] {
        &["X", "Y", "Z"]
    }

    fn units(&self) -> &[&'static str] {
        &["µT", "µT", "µT"]
    }

    fn decode(&self, sample: &[u8]) -> Vec<f64> {
        self.0.decode(sample)
    }
}

pub(crate) struct TempDecoder {
    sched: Schedule,
}

pub(crate) fn temp_decoder() -> Box<dyn Decode> {
    Box::new(TempDecoder {
        sched: Schedule::default(),
    })
}

impl Decode for TempDecoder {
    fn update(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error> {
        self.sched.update(cfg)
    }

    fn schedule(&self) -> Schedule {
        self.sched
    }

    fn components(&self) -> &[&'static str] {
        &["Timu"]
    }

    fn units(&self) -> &[&'static str] {
        &["°C"]
    }

    fn decode(&self, sample: &[u8]) -> Vec<f64> {
        if sample.len() < 2 {
            return vec![f64::NAN];
        }
        let raw = i16::from_be_bytes([sample[0], sample[1]]);
        vec![f64::from(raw) / 333.87 + 21.0]
    }
}
