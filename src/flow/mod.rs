//! Decoded flow records and the source that delivers them.
//!
//! Wire-level flow protocols are decoded by an external collector; this
//! module only accepts its decoded output and forwards records to the
//! aggregator over a bounded channel.

pub mod parse;
pub mod udp;

use std::net::IpAddr;

/// One decoded flow as reported by an exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRecord {
    /// Address of the exporting router.
    pub router: IpAddr,
    /// Input interface index on the exporter.
    pub in_if: u32,
    /// Output interface index on the exporter.
    pub out_if: u32,
    /// Sampled byte count.
    pub bytes: u64,
    /// Source autonomous system.
    pub src_as: u32,
    /// Destination autonomous system.
    pub dst_as: u32,
}
