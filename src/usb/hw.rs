//! USB hardware access.
//!
//! The transport only ever needs two operations — a blocking bulk read and a
//! blocking bulk write — so that is the whole [`UsbBulk`] trait. The libusb
//! implementation below handles device and interface selection; tests
//! substitute an in-memory implementation.
//!
//! [`UsbBulk`]: trait.UsbBulk.html

use crate::Error;
use rusb::UsbContext;
use std::time::Duration;

/// USB vendor id shared by all platform devices.
pub const VENDOR_ID: u16 = 0xF055;

/// USB product id shared by all platform devices.
pub const PRODUCT_ID: u16 = 0x5053;

/// Blocking bulk endpoint pair of one platform device.
pub trait UsbBulk: Send + Sync {
    /// Reads up to `buf.len()` bytes from the IN endpoint.
    ///
    /// A timeout surfaces as `Error::Usb(rusb::Error::Timeout)`; the receive
    /// worker treats it as "no data" and every other error as fatal.
    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error>;

    /// Writes `data` to the OUT endpoint, returning the transferred length.
    fn write_bulk(&self, data: &[u8], timeout: Duration) -> Result<usize, Error>;
}

/// Role of the selected vendor interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Radio base station (subclass 0x52).
    BaseStation,
    /// Directly attached sensor node (subclass 0x53).
    SensorNode,
    /// Some future platform device.
    Other(u8),
}

impl InterfaceKind {
    fn from_subclass(subclass: u8) -> Self {
        match subclass {
            0x52 => InterfaceKind::BaseStation,
            0x53 => InterfaceKind::SensorNode,
            other => InterfaceKind::Other(other),
        }
    }
}

/// libusb-backed endpoint pair.
pub struct UsbDeviceIo {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    ep_in: u8,
    ep_out: u8,
}

impl UsbDeviceIo {
    /// Finds the first attached platform device and claims its vendor
    /// interface.
    ///
    /// The selected interface is the first one with class `0xFF` whose
    /// subclass high nibble is `0x5`; its first bulk OUT and bulk IN
    /// endpoints carry the packet stream.
    pub fn open_first() -> Result<(UsbDeviceIo, InterfaceKind), Error> {
        let devices = rusb::GlobalContext::default().devices()?;
        let mut found_device = false;
        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            if desc.vendor_id() != VENDOR_ID || desc.product_id() != PRODUCT_ID {
                continue;
            }
            found_device = true;
            let config = device.active_config_descriptor()?;
            for interface in config.interfaces() {
                for idesc in interface.descriptors() {
                    if idesc.class_code() != 0xFF || idesc.sub_class_code() >> 4 != 0x5 {
                        continue;
                    }
                    let mut ep_out = None;
                    let mut ep_in = None;
                    for ep in idesc.endpoint_descriptors() {
                        if ep.transfer_type() != rusb::TransferType::Bulk {
                            continue;
                        }
                        match ep.direction() {
                            rusb::Direction::Out => {
                                if ep_out.is_none() {
                                    ep_out = Some(ep.address());
                                }
                            }
                            rusb::Direction::In => {
                                if ep_in.is_none() {
                                    ep_in = Some(ep.address());
                                }
                            }
                        }
                    }
                    if let (Some(ep_out), Some(ep_in)) = (ep_out, ep_in) {
                        let mut handle = device.open()?;
                        handle.claim_interface(idesc.interface_number())?;
                        let kind = InterfaceKind::from_subclass(idesc.sub_class_code());
                        return Ok((
                            UsbDeviceIo {
                                handle,
                                ep_in,
                                ep_out,
                            },
                            kind,
                        ));
                    }
                }
            }
        }
        if found_device {
            Err(Error::NoBulkInterface)
        } else {
            Err(Error::DeviceNotFound)
        }
    }
}

impl UsbBulk for UsbDeviceIo {
    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        Ok(self.handle.read_bulk(self.ep_in, buf, timeout)?)
    }

    fn write_bulk(&self, data: &[u8], timeout: Duration) -> Result<usize, Error> {
        Ok(self.handle.write_bulk(self.ep_out, data, timeout)?)
    }
}
