//! Device driver registry.
//!
//! Maps the protocol identification a node announces during association to
//! the driver constructor for it. Devices whose identification is unknown
//! (or missing) still participate in addressing through a protocol-agnostic
//! driver, but stay invisible to the listing operations until a matching
//! driver exists.

use crate::config::Config;
use crate::device_id::{DeviceId, DeviceInfo};
use crate::hub::Router;
use crate::node::Node;
use crate::time::Clock;
use std::sync::{Arc, Weak};

pub(crate) type DriverCtor =
    fn(Weak<dyn Router>, DeviceId, Option<DeviceInfo>, &Config, Arc<dyn Clock>) -> Arc<Node>;

pub(crate) struct DriverEntry {
    pub proto_vendor: u32,
    pub proto_type: u16,
    /// `None` matches every protocol version.
    pub proto_version: Option<u16>,
    pub construct: DriverCtor,
}

static DRIVERS: &[DriverEntry] = &[DriverEntry {
    proto_vendor: 0x5341_4149,
    proto_type: 0x5053,
    proto_version: Some(0),
    construct: Node::new_multisensor,
}];

/// Finds the driver for the announced identification, preferring an exact
/// protocol-version match over a version wildcard.
pub(crate) fn lookup(info: Option<&DeviceInfo>) -> Option<&'static DriverEntry> {
    let info = info?;
    let matches = |entry: &&DriverEntry| {
        entry.proto_vendor == info.proto_vendor && entry.proto_type == info.proto_type
    };
    DRIVERS
        .iter()
        .filter(&matches)
        .find(|entry| entry.proto_version == Some(info.proto_version))
        .or_else(|| {
            DRIVERS
                .iter()
                .filter(&matches)
                .find(|entry| entry.proto_version.is_none())
        })
}

/// Builds the driver for a newly discovered device.
pub(crate) fn instantiate(
    router: Weak<dyn Router>,
    id: DeviceId,
    info: Option<DeviceInfo>,
    cfg: &Config,
    clock: Arc<dyn Clock>,
) -> Arc<Node> {
    match lookup(info.as_ref()) {
        Some(entry) => (entry.construct)(router, id, info, cfg, clock),
        None => Node::new_basic(router, id, info, cfg, clock),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(vendor: u32, ty: u16, version: u16) -> DeviceInfo {
        DeviceInfo {
            proto_vendor: vendor,
            proto_type: ty,
            proto_version: version,
            fw_vendor: 0,
            fw_type: 0,
            fw_version: 0,
        }
    }

    #[test]
    fn multisensor_protocol_resolves() {
        assert!(lookup(Some(&info(0x5341_4149, 0x5053, 0))).is_some());
    }

    #[test]
    fn unknown_identification_resolves_to_nothing() {
        assert!(lookup(None).is_none());
        assert!(lookup(Some(&info(0x5341_4149, 0x5053, 9))).is_none());
        assert!(lookup(Some(&info(1, 2, 0))).is_none());
    }
}
