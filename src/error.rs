use thiserror::Error;

/// Errors returned by the runtime.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// This is returned when a packet codec tries to fit too much data into a
    /// fixed-size buffer, and also when reaching EOF prematurely while reading
    /// data from a buffer.
    #[error("end of buffer")]
    Eof,

    /// Packet specified an invalid length value or was too short.
    #[error("invalid length value specified")]
    InvalidLength,

    /// Invalid value supplied for field.
    #[error("invalid value for field")]
    InvalidValue,

    /// An operation on the underlying USB device failed.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// A bulk write transferred fewer bytes than requested.
    #[error("USB write failed")]
    WriteFailed,

    /// No USB device implementing the platform protocol is attached.
    #[error("cannot find any platform USB devices")]
    DeviceNotFound,

    /// The USB device exposes no vendor interface with bulk endpoints.
    #[error("failed to get platform bulk endpoints")]
    NoBulkInterface,

    /// The USB transport was torn down after a fatal transfer error.
    #[error("USB transport disconnected")]
    Disconnected,

    /// The device was dropped and is awaiting re-discovery.
    #[error("device {serial:08X} dropped")]
    DeviceDropped {
        /// Serial number of the affected device.
        serial: u32,
    },

    /// The device holds no live address on any base station.
    #[error("no route to device {serial:08X}")]
    NoRoute {
        /// Serial number of the affected device.
        serial: u32,
    },

    /// All usable command sequence numbers stayed busy for too long.
    #[error("timeout acquiring command sequence number")]
    SequenceExhausted,

    /// The base station did not answer a USB command in time.
    #[error("timeout waiting for base station response")]
    ResponseTimeout,

    /// A device did not answer a reliable command despite retransmissions.
    #[error("timeout waiting for command response from device {serial:08X}")]
    CommandTimeout {
        /// Serial number of the affected device.
        serial: u32,
    },

    /// A command completed with a non-zero result status.
    #[error("operation on device {serial:08X} returned status {status:02X}")]
    Status {
        /// Serial number of the affected device.
        serial: u32,
        /// Raw status byte from the response.
        status: u8,
    },

    /// No free node id is left on the base station's channel.
    #[error("no unused addresses available")]
    AddressesExhausted,

    /// One or more configuration page writes were rejected.
    #[error("errors while committing sensor attributes to device {serial:08X}:{details}")]
    CommitFailed {
        /// Serial number of the affected device.
        serial: u32,
        /// One line per failed page write.
        details: String,
    },

    /// One or more firmware upload blocks were rejected.
    #[error("errors while uploading {subject} to device {serial:08X}:{details}")]
    UploadFailed {
        /// Serial number of the affected device.
        serial: u32,
        /// What was being uploaded (a sector or the updater blob).
        subject: String,
        /// One line per failed block transfer.
        details: String,
    },

    /// The data stream sequence number jumped backwards further than packet
    /// reordering can explain, likely a wrapped 15-bit extension.
    #[error("data stream of device {serial:08X} moved backwards by {delta} packets")]
    StreamDesync {
        /// Serial number of the affected device.
        serial: u32,
        /// Magnitude of the backward jump.
        delta: u32,
    },

    /// The named attribute does not exist on this sensor.
    #[error("sensor has no attribute {0:?}")]
    UnknownAttribute(String),
}
