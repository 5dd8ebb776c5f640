//! Sensor configuration and measurement decoding.
//!
//! Every node carries up to 64 sensors. Each sensor owns four 28-byte
//! configuration pages; page 0 identifies the sensor and its record format,
//! pages 1..3 hold calibration and chip configuration. The host never
//! interprets page bytes directly — named [`Attribute`] descriptors define
//! how a value is packed into a page (byte range, endianness, bit field,
//! optional enumeration map or translator functions), and reads/writes go
//! through the node's page cache.
//!
//! Two registries map page-0 identifiers to drivers: the sensor type
//! `(vendor, product)` selects the attribute table and display name, the
//! record format `(formatVendor, formatType)` selects the [`Decode`]
//! implementation that turns raw records into physical quantities. Unknown
//! ids fall back to a driver with only the generic attributes and a decoder
//! that yields no components.
//!
//! [`Attribute`]: struct.Attribute.html
//! [`Decode`]: trait.Decode.html

pub(crate) mod baro;
pub(crate) mod hygro;
pub(crate) mod imu;
pub(crate) mod light;
pub(crate) mod telemetry;
pub(crate) mod timing;

use crate::Error;
use serde::ser::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Size of one configuration page in bytes.
pub const PAGE_LEN: usize = 28;

/// Number of configuration pages per sensor.
pub const PAGES_PER_SENSOR: usize = 4;

/// Number of sensor slots per node.
pub const SENSOR_SLOTS: usize = 64;

/// The four cached configuration pages of one sensor.
pub type SensorPages = [[u8; PAGE_LEN]; PAGES_PER_SENSOR];

/// A sensor slot is populated iff the identification bytes of its page 0 are
/// not all zero.
pub fn page_present(page0: &[u8; PAGE_LEN]) -> bool {
    page0[..12].iter().any(|&b| b != 0)
}

/// A decoded attribute value.
///
/// Attributes are integers on the wire; maps and translators can turn them
/// into enumeration strings or scaled numbers.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Str(&'static str),
}

impl AttrValue {
    /// Numeric view of the value; enumeration strings have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Float(v) => Some(*v),
            AttrValue::Str(_) => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::Str(v) => f.write_str(v),
        }
    }
}

impl Serialize for AttrValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AttrValue::Int(v) => serializer.serialize_i64(*v),
            AttrValue::Float(v) => serializer.serialize_f64(*v),
            AttrValue::Str(v) => serializer.serialize_str(v),
        }
    }
}

/// Storage format of an attribute's integer field within a page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    I8,
    U16Le,
    I16Le,
    I16Be,
    U32Le,
}

impl FieldKind {
    fn width(self) -> usize {
        match self {
            FieldKind::U8 | FieldKind::I8 => 1,
            FieldKind::U16Le | FieldKind::I16Le | FieldKind::I16Be => 2,
            FieldKind::U32Le => 4,
        }
    }
}

/// Pair of pure functions translating between raw field values and
/// non-linearly encoded attribute values.
#[derive(Copy, Clone)]
pub struct Translator {
    /// Raw field value to presented value.
    pub decode: fn(i64) -> AttrValue,
    /// Presented (numeric) value back to the raw field value.
    pub encode: fn(f64) -> i64,
}

/// Describes how a named attribute is packed into a configuration page.
///
/// Reading decodes the integer field, aligns it (`shift`), limits its width
/// (`mask`), and optionally applies the enumeration map or translator.
/// Writing reverses the chain with a read-modify-write on the cached page.
#[derive(Copy, Clone)]
pub struct Attribute {
    page: usize,
    offset: usize,
    kind: FieldKind,
    mask: i64,
    shift: u32,
    map: Option<&'static [(i64, AttrValue)]>,
    xlate: Option<Translator>,
}

impl Attribute {
    pub fn new(page: usize, offset: usize, kind: FieldKind) -> Self {
        Attribute {
            page,
            offset,
            kind,
            mask: 0,
            shift: 0,
            map: None,
            xlate: None,
        }
    }

    /// Limits the attribute to a bit field: `mask` bits starting `shift` bits
    /// into the decoded integer. A mask of 0 means the whole field.
    pub fn bits(mut self, mask: i64, shift: u32) -> Self {
        self.mask = mask;
        self.shift = shift;
        self
    }

    /// Attaches a bidirectional field-value → enumeration mapping.
    pub fn map(mut self, map: &'static [(i64, AttrValue)]) -> Self {
        self.map = Some(map);
        self
    }

    /// Attaches translator functions for non-linear fields.
    pub fn translate(mut self, xlate: Translator) -> Self {
        self.xlate = Some(xlate);
        self
    }

    fn read_raw(&self, pages: &SensorPages) -> Result<i64, Error> {
        let page = pages.get(self.page).ok_or(Error::InvalidValue)?;
        let end = self.offset + self.kind.width();
        let bytes = page.get(self.offset..end).ok_or(Error::Eof)?;
        Ok(match self.kind {
            FieldKind::U8 => i64::from(bytes[0]),
            FieldKind::I8 => i64::from(bytes[0] as i8),
            FieldKind::U16Le => i64::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            FieldKind::I16Le => i64::from(i16::from_le_bytes([bytes[0], bytes[1]])),
            FieldKind::I16Be => i64::from(i16::from_be_bytes([bytes[0], bytes[1]])),
            FieldKind::U32Le => i64::from(u32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])),
        })
    }

    fn write_raw(
        &self,
        pages: &mut SensorPages,
        dirty: &mut [bool; PAGES_PER_SENSOR],
        value: i64,
    ) -> Result<(), Error> {
        let page = pages.get_mut(self.page).ok_or(Error::InvalidValue)?;
        let end = self.offset + self.kind.width();
        let bytes = page.get_mut(self.offset..end).ok_or(Error::Eof)?;
        let mut buf = [0u8; 4];
        match self.kind {
            FieldKind::U8 | FieldKind::I8 => buf[0] = value as u8,
            FieldKind::U16Le | FieldKind::I16Le => {
                buf[..2].copy_from_slice(&(value as u16).to_le_bytes())
            }
            FieldKind::I16Be => buf[..2].copy_from_slice(&(value as u16).to_be_bytes()),
            FieldKind::U32Le => buf.copy_from_slice(&(value as u32).to_le_bytes()),
        }
        let encoded = &buf[..self.kind.width()];
        if bytes != encoded {
            bytes.copy_from_slice(encoded);
            dirty[self.page] = true;
        }
        Ok(())
    }

    /// Decodes the attribute from the cached pages.
    pub fn get(&self, pages: &SensorPages) -> Result<AttrValue, Error> {
        let mut value = self.read_raw(pages)?;
        if self.shift != 0 {
            value >>= self.shift;
        }
        if self.mask != 0 {
            value &= self.mask;
        }
        if let Some(map) = self.map {
            return map
                .iter()
                .find(|(raw, _)| *raw == value)
                .map(|(_, v)| *v)
                .ok_or(Error::InvalidValue);
        }
        if let Some(xlate) = &self.xlate {
            return Ok((xlate.decode)(value));
        }
        Ok(AttrValue::Int(value))
    }

    /// Encodes `input` and writes it into the cached pages, marking the page
    /// dirty when its contents actually change.
    pub fn set(
        &self,
        pages: &mut SensorPages,
        dirty: &mut [bool; PAGES_PER_SENSOR],
        input: &str,
    ) -> Result<(), Error> {
        let value = if let Some(xlate) = &self.xlate {
            let num: f64 = input.trim().parse().map_err(|_| Error::InvalidValue)?;
            (xlate.encode)(num)
        } else if let Some(map) = self.map {
            map.iter()
                .find(|(_, v)| v.to_string() == input.trim())
                .map(|(raw, _)| *raw)
                .ok_or(Error::InvalidValue)?
        } else {
            input.trim().parse().map_err(|_| Error::InvalidValue)?
        };
        let mut field = self.read_raw(pages)?;
        let mask = if self.mask != 0 { self.mask } else { -1 };
        field &= !(mask << self.shift);
        field |= (value & mask) << self.shift;
        self.write_raw(pages, dirty, field)
    }
}

/// Attribute table of one sensor, keyed by protocol name.
pub type AttrMap = BTreeMap<&'static str, Attribute>;

/// Read-only view of a sensor's attributes and cached pages, handed to
/// decoders when a measurement's configuration header arrives.
pub struct SensorConfig<'a> {
    pub attrs: &'a AttrMap,
    pub pages: &'a SensorPages,
}

impl SensorConfig<'_> {
    pub fn value(&self, name: &str) -> Result<AttrValue, Error> {
        self.attrs
            .get(name)
            .ok_or_else(|| Error::UnknownAttribute(name.to_string()))?
            .get(self.pages)
    }

    pub fn int(&self, name: &str) -> Result<i64, Error> {
        match self.value(name)? {
            AttrValue::Int(v) => Ok(v),
            AttrValue::Float(v) => Ok(v as i64),
            AttrValue::Str(_) => Err(Error::InvalidValue),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, Error> {
        self.value(name)?.as_f64().ok_or(Error::InvalidValue)
    }

    pub fn flag(&self, name: &str) -> Result<bool, Error> {
        Ok(self.int(name)? != 0)
    }

    /// Raw access for decoders that interpret a whole byte as a channel
    /// bit mask.
    pub fn byte(&self, page: usize, offset: usize) -> Result<u8, Error> {
        self.pages
            .get(page)
            .and_then(|p| p.get(offset))
            .copied()
            .ok_or(Error::Eof)
    }
}

/// Sampling parameters shared by every record format.
#[derive(Copy, Clone, Debug, Default)]
pub struct Schedule {
    /// First sampling time, µs after measurement start.
    pub offset_us: u64,
    /// Sampling interval in µs; 0 disables the sensor.
    pub interval_us: u64,
    /// Size of one record in bytes; 0 disables the sensor.
    pub record_bytes: usize,
}

impl Schedule {
    /// Reads the generic schedule attributes.
    pub fn update(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error> {
        self.offset_us = cfg.int("scheduleOffset")? as u64;
        self.interval_us = cfg.int("scheduleInterval")? as u64;
        self.record_bytes = (cfg.int("recordSize")? / 8) as usize;
        Ok(())
    }
}

/// A record-format decoder.
///
/// `update` is called once per measurement, after the configuration header
/// has been reassembled; it captures whatever calibration and channel-enable
/// state `decode` needs. `decode` is then called once per scheduled record
/// with exactly `schedule().record_bytes` bytes.
pub trait Decode: Send {
    fn update(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error>;

    fn schedule(&self) -> Schedule;

    /// Symbols of the components of each sample, eg. `["X", "Y", "Z"]`.
    fn components(&self) -> &[&'static str];

    /// Units matching [`components`].
    ///
    /// [`components`]: #tymethod.components
    fn units(&self) -> &[&'static str];

    /// Decodes one record into one value per component. Channels that were
    /// not sampled decode to `NaN`.
    fn decode(&self, sample: &[u8]) -> Vec<f64>;
}

/// Decoder for unknown record formats: keeps the schedule so the byte stream
/// stays demultiplexable, but yields no components.
#[derive(Default)]
pub struct OpaqueDecoder {
    sched: Schedule,
}

impl Decode for OpaqueDecoder {
    fn update(&mut self, cfg: &SensorConfig<'_>) -> Result<(), Error> {
        self.sched.update(cfg)
    }

    fn schedule(&self) -> Schedule {
        self.sched
    }

    fn components(&self) -> &[&'static str] {
        &[]
    }

    fn units(&self) -> &[&'static str] {
        &[]
    }

    fn decode(&self, _sample: &[u8]) -> Vec<f64> {
        Vec::new()
    }
}

/// One sensor slot of a node: display name, attribute table and decoder.
pub struct SensorDriver {
    pub id: u8,
    pub name: String,
    pub attrs: AttrMap,
    pub decoder: Box<dyn Decode>,
}

impl SensorDriver {
    /// Borrowed identification handed to hooks.
    pub fn info(&self) -> SensorInfo<'_> {
        SensorInfo {
            id: self.id,
            name: &self.name,
            components: self.decoder.components(),
            units: self.decoder.units(),
        }
    }

    pub fn attr_value(&self, pages: &SensorPages, name: &str) -> Result<AttrValue, Error> {
        self.attrs
            .get(name)
            .ok_or_else(|| Error::UnknownAttribute(name.to_string()))?
            .get(pages)
    }
}

/// What hooks get to know about a sensor.
pub struct SensorInfo<'a> {
    pub id: u8,
    pub name: &'a str,
    pub components: &'a [&'static str],
    pub units: &'a [&'static str],
}

/// Attributes shared by every sensor type: identification, record format and
/// sampling schedule, all in page 0.
pub(crate) fn generic_attrs() -> AttrMap {
    let mut attrs = AttrMap::new();
    attrs.insert("vendor", Attribute::new(0, 0, FieldKind::U32Le));
    attrs.insert("product", Attribute::new(0, 4, FieldKind::U32Le));
    attrs.insert("serial", Attribute::new(0, 8, FieldKind::U32Le));
    attrs.insert("formatVendor", Attribute::new(0, 12, FieldKind::U32Le));
    attrs.insert("formatType", Attribute::new(0, 16, FieldKind::U16Le));
    attrs.insert("formatVersion", Attribute::new(0, 18, FieldKind::U8));
    attrs.insert("recordSize", Attribute::new(0, 19, FieldKind::U8));
    attrs.insert("scheduleOffset", Attribute::new(0, 20, FieldKind::U32Le));
    attrs.insert("scheduleInterval", Attribute::new(0, 24, FieldKind::U32Le));
    attrs
}

struct SensorType {
    vendor: u32,
    product: u32,
    name: &'static str,
    attrs: fn(&mut AttrMap),
}

struct DataFormat {
    vendor: u32,
    format: u16,
    construct: fn() -> Box<dyn Decode>,
}

const VENDOR_SAI: u32 = 0x5341_4149;

static SENSOR_TYPES: &[SensorType] = &[
    SensorType {
        vendor: VENDOR_SAI,
        product: 0x4954_4956,
        name: "Timing (virtual)",
        attrs: timing::attrs,
    },
    SensorType {
        vendor: VENDOR_SAI,
        product: 0x4554_4956,
        name: "Telemetry (virtual)",
        attrs: telemetry::attrs,
    },
    SensorType {
        vendor: VENDOR_SAI,
        product: 0x4341_5092,
        name: "Force 3D Vector (MPU9250/MPU6250)",
        attrs: imu::accel_attrs,
    },
    SensorType {
        vendor: VENDOR_SAI,
        product: 0x5947_5092,
        name: "Angular Velocity 3D Vector (MPU9250/MPU6250)",
        attrs: imu::gyro_attrs,
    },
    SensorType {
        vendor: VENDOR_SAI,
        product: 0x474D_5092,
        name: "Magnetic Field 3D Vector (MPU9250/MPU6250)",
        attrs: imu::mag_attrs,
    },
    SensorType {
        vendor: VENDOR_SAI,
        product: 0x4D54_5092,
        name: "Temperature (MPU9250/MPU6250)",
        attrs: imu::temp_attrs,
    },
    SensorType {
        vendor: VENDOR_SAI,
        product: 0x5250_80B2,
        name: "Air Pressure (BMP280)",
        attrs: baro::attrs,
    },
    SensorType {
        vendor: VENDOR_SAI,
        product: 0x4D48_2170,
        name: "Relative Humidity (Si7021/Si7020)",
        attrs: hygro::attrs,
    },
    SensorType {
        vendor: VENDOR_SAI,
        product: 0x494C_0199,
        name: "Light Intensity (APDS-9901)",
        attrs: light::attrs,
    },
];

static DATA_FORMATS: &[DataFormat] = &[
    DataFormat {
        vendor: VENDOR_SAI,
        format: 0x4954,
        construct: timing::decoder,
    },
    DataFormat {
        vendor: VENDOR_SAI,
        format: 0x4554,
        construct: telemetry::decoder,
    },
    DataFormat {
        vendor: VENDOR_SAI,
        format: 0x5092,
        construct: imu::accel_decoder,
    },
    DataFormat {
        vendor: VENDOR_SAI,
        format: 0x5192,
        construct: imu::gyro_decoder,
    },
    DataFormat {
        vendor: VENDOR_SAI,
        format: 0x5292,
        construct: imu::mag_decoder,
    },
    DataFormat {
        vendor: VENDOR_SAI,
        format: 0x5392,
        construct: imu::temp_decoder,
    },
    DataFormat {
        vendor: VENDOR_SAI,
        format: 0x80B2,
        construct: baro::decoder,
    },
    DataFormat {
        vendor: VENDOR_SAI,
        format: 0x2170,
        construct: hygro::decoder,
    },
    DataFormat {
        vendor: VENDOR_SAI,
        format: 0x0199,
        construct: light::decoder,
    },
];

/// Builds the driver and decoder for the sensor identified by `page0`.
pub(crate) fn instantiate(id: u8, page0: &[u8; PAGE_LEN]) -> SensorDriver {
    let vendor = u32::from_le_bytes([page0[0], page0[1], page0[2], page0[3]]);
    let product = u32::from_le_bytes([page0[4], page0[5], page0[6], page0[7]]);
    let mut attrs = generic_attrs();
    let name = match SENSOR_TYPES
        .iter()
        .find(|t| t.vendor == vendor && t.product == product)
    {
        Some(ty) => {
            (ty.attrs)(&mut attrs);
            ty.name.to_string()
        }
        None => format!("UNKNOWN({:08X}:{:08X})", vendor, product),
    };

    let fmt_vendor = u32::from_le_bytes([page0[12], page0[13], page0[14], page0[15]]);
    let fmt_type = u16::from_le_bytes([page0[16], page0[17]]);
    let decoder = match DATA_FORMATS
        .iter()
        .find(|f| f.vendor == fmt_vendor && f.format == fmt_type)
    {
        Some(format) => (format.construct)(),
        None => Box::new(OpaqueDecoder::default()),
    };

    SensorDriver {
        id,
        name,
        attrs,
        decoder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages() -> SensorPages {
        [[0; PAGE_LEN]; PAGES_PER_SENSOR]
    }

    #[test]
    fn presence() {
        let mut p = pages();
        assert!(!page_present(&p[0]));
        p[0][11] = 1;
        assert!(page_present(&p[0]));
        let mut q = pages();
        // Bytes 12.. do not count towards presence.
        q[0][12] = 1;
        assert!(!page_present(&q[0]));
    }

    #[test]
    fn plain_field_get_set() {
        let mut p = pages();
        let mut dirty = [false; PAGES_PER_SENSOR];
        let attr = Attribute::new(0, 20, FieldKind::U32Le);
        attr.set(&mut p, &mut dirty, "1000").unwrap();
        assert!(dirty[0]);
        assert_eq!(p[0][20..24], [0xE8, 0x03, 0x00, 0x00]);
        assert_eq!(attr.get(&p).unwrap(), AttrValue::Int(1000));

        // Re-writing the same value leaves the dirty flag alone.
        let mut dirty = [false; PAGES_PER_SENSOR];
        attr.set(&mut p, &mut dirty, "1000").unwrap();
        assert!(!dirty[0]);
    }

    #[test]
    fn bit_field_preserves_neighbours() {
        let mut p = pages();
        let mut dirty = [false; PAGES_PER_SENSOR];
        p[2][0] = 0b1010_1111;
        let attr = Attribute::new(2, 0, FieldKind::U8).bits(3, 3);
        assert_eq!(attr.get(&p).unwrap(), AttrValue::Int(0b01));
        attr.set(&mut p, &mut dirty, "2").unwrap();
        assert_eq!(p[2][0], 0b1011_0111);
        assert!(dirty[2]);
    }

    #[test]
    fn signed_big_endian_field() {
        let mut p = pages();
        let mut dirty = [false; PAGES_PER_SENSOR];
        let attr = Attribute::new(2, 0, FieldKind::I16Be);
        attr.set(&mut p, &mut dirty, "-2").unwrap();
        assert_eq!(p[2][..2], [0xFF, 0xFE]);
        assert_eq!(attr.get(&p).unwrap(), AttrValue::Int(-2));
    }

    #[test]
    fn mapped_field() {
        static SCALE: &[(i64, AttrValue)] = &[
            (0, AttrValue::Int(2)),
            (1, AttrValue::Int(4)),
            (2, AttrValue::Int(8)),
            (3, AttrValue::Int(16)),
        ];
        let mut p = pages();
        let mut dirty = [false; PAGES_PER_SENSOR];
        let attr = Attribute::new(2, 0, FieldKind::U8).bits(3, 3).map(SCALE);
        attr.set(&mut p, &mut dirty, "8").unwrap();
        assert_eq!(p[2][0], 2 << 3);
        assert_eq!(attr.get(&p).unwrap(), AttrValue::Int(8));
        assert!(attr.set(&mut p, &mut dirty, "5").is_err());
    }

    #[test]
    fn translated_field() {
        let attr = Attribute::new(2, 3, FieldKind::U8).translate(Translator {
            decode: |raw| AttrValue::Int((256 - raw) * 2720),
            encode: |value| (256.0 - value / 2720.0).max(0.0).min(255.0) as i64,
        });
        let mut p = pages();
        let mut dirty = [false; PAGES_PER_SENSOR];
        attr.set(&mut p, &mut dirty, "2720").unwrap();
        assert_eq!(p[2][3], 255);
        assert_eq!(attr.get(&p).unwrap(), AttrValue::Int(2720));
    }

    #[test]
    fn instantiate_known_and_unknown() {
        let mut page0 = [0u8; PAGE_LEN];
        page0[..4].copy_from_slice(&VENDOR_SAI.to_le_bytes());
        page0[4..8].copy_from_slice(&0x4341_5092u32.to_le_bytes());
        page0[12..16].copy_from_slice(&VENDOR_SAI.to_le_bytes());
        page0[16..18].copy_from_slice(&0x5092u16.to_le_bytes());
        let driver = instantiate(3, &page0);
        assert_eq!(driver.name, "Force 3D Vector (MPU9250/MPU6250)");
        assert_eq!(driver.decoder.components(), &["X", "Y", "Z"]);
        assert!(driver.attrs.contains_key("fullScale"));
        assert!(driver.attrs.contains_key("scheduleInterval"));

        let mut other = [0u8; PAGE_LEN];
        other[0] = 1;
        let unknown = instantiate(9, &other);
        assert_eq!(unknown.name, "UNKNOWN(00000001:00000000)");
        assert!(unknown.decoder.components().is_empty());
        assert!(unknown.attrs.contains_key("recordSize"));
    }

    #[test]
    fn schedule_from_generic_attrs() {
        let mut p = pages();
        p[0][19] = 16; // recordSize bits
        p[0][20..24].copy_from_slice(&1000u32.to_le_bytes());
        p[0][24..28].copy_from_slice(&2000u32.to_le_bytes());
        let attrs = generic_attrs();
        let cfg = SensorConfig {
            attrs: &attrs,
            pages: &p,
        };
        let mut sched = Schedule::default();
        sched.update(&cfg).unwrap();
        assert_eq!(sched.offset_us, 1000);
        assert_eq!(sched.interval_us, 2000);
        assert_eq!(sched.record_bytes, 2);
    }
}
