//! Runtime tunables.

use std::time::Duration;

/// Timing parameters of the protocol stack.
///
/// The defaults match the deployed node firmware; in particular
/// [`addr_timeout`] must stay in sync with the deassociation timeout burned
/// into the nodes, and [`gap_timeout`] trades decode latency against packet
/// loss on a congested channel.
///
/// [`addr_timeout`]: #structfield.addr_timeout
/// [`gap_timeout`]: #structfield.gap_timeout
#[derive(Debug, Clone)]
pub struct Config {
    /// How long an assigned node id stays valid without traffic from the
    /// node. After this the node is assumed to have forgotten the id.
    pub addr_timeout: Duration,

    /// How long the data-stream reassembler waits for a missing packet
    /// before zero-filling it and moving on.
    pub gap_timeout: Duration,

    /// Interval of the telemetry sampling task.
    pub telemetry_interval: Duration,

    /// Minimum spacing between two address-assignment attempts for the same
    /// device.
    pub assign_holdoff: Duration,

    /// Tick of the base-station poll-request worker.
    pub poll_interval: Duration,

    /// How long a reliable command waits for a response before
    /// retransmitting.
    pub reply_timeout: Duration,

    /// How many transmission attempts a reliable command makes before the
    /// timeout is surfaced.
    pub max_attempts: u32,

    /// How long a USB command may wait for a free sequence number.
    pub acquire_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr_timeout: Duration::from_secs(5),
            gap_timeout: Duration::from_secs(2),
            telemetry_interval: Duration::from_secs(1),
            assign_holdoff: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            reply_timeout: Duration::from_millis(100),
            max_attempts: 64,
            acquire_timeout: Duration::from_secs(1),
        }
    }
}
