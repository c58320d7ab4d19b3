use std::sync::Arc;

use crate::catalog::{FlowMatch, Interface};

/// Bucket identity for traffic accumulation.
///
/// Compared and hashed by value, including the interface, so two
/// observations with identical attributes land in the same bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrafficKey {
    pub iface: Arc<Interface>,
    pub remote_asn: u32,
    pub local_asn: u32,
    pub ingress: bool,
}

impl From<&FlowMatch> for TrafficKey {
    fn from(m: &FlowMatch) -> Self {
        Self {
            iface: Arc::clone(&m.iface),
            remote_asn: m.remote_asn,
            local_asn: m.local_asn,
            ingress: m.ingress,
        }
    }
}
