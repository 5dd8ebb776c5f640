//! Device identities and protocol/firmware descriptors.

use byteorder::LittleEndian;
use zerocopy::byteorder::{U16, U32};

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::Error;
use std::fmt;

/// Unique hardware identity of a node, used for addressing.
///
/// Two identities refer to the same device iff all three fields match. Nodes
/// announce the triple in association requests and it is echoed back in every
/// address assignment.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub vendor: u32,
    pub product: u32,
    pub serial: u32,
}

impl DeviceId {
    /// Returns the 12-byte wire encoding (three LE `u32`s).
    pub fn to_wire(&self) -> [u8; 12] {
        let mut buf = [0; 12];
        let mut w = ByteWriter::new(&mut buf);
        // The buffer is exactly large enough.
        self.to_bytes(&mut w).expect("12-byte id encoding");
        buf
    }
}

impl ToBytes for DeviceId {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u32_le(self.vendor)?;
        writer.write_u32_le(self.product)?;
        writer.write_u32_le(self.serial)?;
        Ok(())
    }
}

impl<'a> FromBytes<'a> for DeviceId {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(DeviceId {
            vendor: bytes.read_u32_le()?,
            product: bytes.read_u32_le()?,
            serial: bytes.read_u32_le()?,
        })
    }
}

/// The canonical textual form is the 24-digit hex string used in measurement
/// records.
impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}{:08X}{:08X}",
            self.vendor, self.product, self.serial
        )
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}:{:08X}:{:08X}",
            self.vendor, self.product, self.serial
        )
    }
}

/// Protocol and firmware information announced alongside the identity.
///
/// Not required for addressing; a device only becomes visible to the listing
/// operations once this is known and matches a registered driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub proto_vendor: u32,
    pub proto_type: u16,
    pub proto_version: u16,
    pub fw_vendor: u32,
    pub fw_type: u16,
    pub fw_version: u16,
}

/// Wire layout of [`DeviceInfo`].
///
/// [`DeviceInfo`]: struct.DeviceInfo.html
#[derive(zerocopy::FromBytes, zerocopy::Unaligned)]
#[repr(C)]
struct RawDeviceInfo {
    proto_vendor: U32<LittleEndian>,
    proto_type: U16<LittleEndian>,
    proto_version: U16<LittleEndian>,
    fw_vendor: U32<LittleEndian>,
    fw_type: U16<LittleEndian>,
    fw_version: U16<LittleEndian>,
}

impl<'a> FromBytes<'a> for DeviceInfo {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let raw = bytes.read_obj::<RawDeviceInfo>()?;
        Ok(DeviceInfo {
            proto_vendor: raw.proto_vendor.get(),
            proto_type: raw.proto_type.get(),
            proto_version: raw.proto_version.get(),
            fw_vendor: raw.fw_vendor.get(),
            fw_type: raw.fw_type.get(),
            fw_version: raw.fw_version.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrip() {
        let id = DeviceId {
            vendor: 0x5341_4149,
            product: 0x534D_5053,
            serial: 0x1234_5678,
        };
        let wire = id.to_wire();
        assert_eq!(
            wire,
            [0x49, 0x41, 0x41, 0x53, 0x53, 0x50, 0x4D, 0x53, 0x78, 0x56, 0x34, 0x12]
        );
        let mut r = ByteReader::new(&wire);
        assert_eq!(DeviceId::from_bytes(&mut r).unwrap(), id);
        assert_eq!(id.to_string(), "53414149534D505312345678");
    }

    #[test]
    fn info_parse() {
        let data = [
            0x49, 0x41, 0x41, 0x53, // protoVendor
            0x53, 0x50, // protoType
            0x00, 0x00, // protoVersion
            0x49, 0x41, 0x41, 0x53, // fwVendor
            0x53, 0x50, // fwType
            0x01, 0x00, // fwVersion
        ];
        let mut r = ByteReader::new(&data);
        let info = DeviceInfo::from_bytes(&mut r).unwrap();
        assert_eq!(info.proto_vendor, 0x5341_4149);
        assert_eq!(info.proto_type, 0x5053);
        assert_eq!(info.proto_version, 0);
        assert_eq!(info.fw_version, 1);
        assert!(r.is_empty());

        let mut short = ByteReader::new(&data[..10]);
        assert!(DeviceInfo::from_bytes(&mut short).is_err());
    }
}
