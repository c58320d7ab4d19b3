//! Static interface catalog.
//!
//! Maps `(exporter address, interface index)` to a named interface and its
//! sampling rate. Loaded once at startup and shared read-only afterwards.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::flow::FlowRecord;

/// A monitored interface on a flow exporter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Interface {
    pub name: String,
    pub host: IpAddr,
    pub id: u32,
    pub sample: u64,
}

/// Catalog entry as written in the interfaces file.
#[derive(Debug, Deserialize)]
struct InterfaceEntry {
    name: String,
    host: String,
    id: u32,
    sample: u64,
}

/// One way a flow record relates to a catalog interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMatch {
    pub iface: Arc<Interface>,
    pub ingress: bool,
    pub remote_asn: u32,
    pub local_asn: u32,
}

impl FlowMatch {
    /// Estimated bits on the wire for a sampled byte count.
    pub fn bits(&self, bytes: u64) -> u64 {
        bytes.saturating_mul(self.iface.sample).saturating_mul(8)
    }
}

/// Matches of a single flow record: at most one per direction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlowMatches {
    pub ingress: Option<FlowMatch>,
    pub egress: Option<FlowMatch>,
}

impl FlowMatches {
    pub fn is_empty(&self) -> bool {
        self.ingress.is_none() && self.egress.is_none()
    }

    pub fn len(&self) -> usize {
        usize::from(self.ingress.is_some()) + usize::from(self.egress.is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowMatch> {
        self.ingress.iter().chain(self.egress.iter())
    }
}

/// Immutable lookup from exporter host to its catalogued interfaces.
#[derive(Debug, Default)]
pub struct InterfaceCatalog {
    interfaces: Vec<Arc<Interface>>,
    by_host: HashMap<IpAddr, Vec<Arc<Interface>>>,
}

impl InterfaceCatalog {
    /// Load the catalog from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading interface catalog {}", path.display()))?;

        Self::from_yaml(&data)
            .with_context(|| format!("loading interface catalog {}", path.display()))
    }

    /// Parse and validate a catalog from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let entries: Vec<InterfaceEntry> =
            serde_yaml::from_str(data).context("parsing interface catalog YAML")?;

        let mut interfaces = Vec::with_capacity(entries.len());
        for (idx, entry) in entries.into_iter().enumerate() {
            let host: IpAddr = entry.host.trim().parse().with_context(|| {
                format!("entry {idx} ({}): invalid host {:?}", entry.name, entry.host)
            })?;
            interfaces.push(Interface {
                name: entry.name,
                // Exporters may report IPv4 hosts as ::ffff:a.b.c.d.
                host: host.to_canonical(),
                id: entry.id,
                sample: entry.sample,
            });
        }

        Self::new(interfaces)
    }

    /// Build a catalog from already-parsed interfaces.
    pub fn new(interfaces: Vec<Interface>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(interfaces.len());
        let mut catalog = Self::default();

        for iface in interfaces {
            if iface.name.is_empty() {
                bail!("interface {}#{} has an empty name", iface.host, iface.id);
            }
            if iface.sample == 0 {
                bail!("interface {} has a zero sample rate", iface.name);
            }
            if !seen.insert((iface.host, iface.id)) {
                bail!(
                    "interface {}#{} is listed more than once",
                    iface.host,
                    iface.id
                );
            }

            let iface = Arc::new(iface);
            catalog
                .by_host
                .entry(iface.host)
                .or_default()
                .push(Arc::clone(&iface));
            catalog.interfaces.push(iface);
        }

        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// All interfaces in file order.
    pub fn interfaces(&self) -> &[Arc<Interface>] {
        &self.interfaces
    }

    /// Find the interfaces a flow record entered and left through.
    ///
    /// Ingress matches report the flow source as the remote side; egress
    /// matches report the destination as remote. A record whose input and
    /// output index are the same interface matches it in both directions.
    pub fn matches(&self, flow: &FlowRecord) -> FlowMatches {
        let mut out = FlowMatches::default();

        let Some(candidates) = self.by_host.get(&flow.router) else {
            return out;
        };

        for iface in candidates {
            if iface.id == flow.in_if {
                out.ingress = Some(FlowMatch {
                    iface: Arc::clone(iface),
                    ingress: true,
                    remote_asn: flow.src_as,
                    local_asn: flow.dst_as,
                });
            }
            if iface.id == flow.out_if {
                out.egress = Some(FlowMatch {
                    iface: Arc::clone(iface),
                    ingress: false,
                    remote_asn: flow.dst_as,
                    local_asn: flow.src_as,
                });
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    const CATALOG: &str = r#"
- name: eth0
  host: 10.0.0.1
  id: 1
  sample: 100
- name: eth1
  host: 10.0.0.1
  id: 2
  sample: 10
- name: uplink
  host: 10.0.0.2
  id: 1
  sample: 1
"#;

    fn flow(router: [u8; 4], in_if: u32, out_if: u32) -> FlowRecord {
        FlowRecord {
            router: IpAddr::V4(Ipv4Addr::from(router)),
            in_if,
            out_if,
            bytes: 1000,
            src_as: 65001,
            dst_as: 65002,
        }
    }

    #[test]
    fn test_load_from_yaml() {
        let catalog = InterfaceCatalog::from_yaml(CATALOG).expect("valid catalog");
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.interfaces()[0].name, "eth0");
        assert_eq!(catalog.interfaces()[2].host, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(CATALOG.as_bytes()).expect("write");
        let catalog = InterfaceCatalog::load(file.path()).expect("load");
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = InterfaceCatalog::load(Path::new("/nonexistent/interfaces.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading interface catalog"));
    }

    #[test]
    fn test_ingress_match() {
        let catalog = InterfaceCatalog::from_yaml(CATALOG).expect("catalog");
        let m = catalog.matches(&flow([10, 0, 0, 1], 1, 99));
        assert_eq!(m.len(), 1);
        let ingress = m.ingress.expect("ingress match");
        assert_eq!(ingress.iface.name, "eth0");
        assert!(ingress.ingress);
        assert_eq!(ingress.remote_asn, 65001);
        assert_eq!(ingress.local_asn, 65002);
        assert_eq!(ingress.bits(1000), 800_000);
    }

    #[test]
    fn test_egress_match_swaps_asns() {
        let catalog = InterfaceCatalog::from_yaml(CATALOG).expect("catalog");
        let m = catalog.matches(&flow([10, 0, 0, 1], 99, 2));
        let egress = m.egress.expect("egress match");
        assert!(m.ingress.is_none());
        assert_eq!(egress.iface.name, "eth1");
        assert!(!egress.ingress);
        assert_eq!(egress.remote_asn, 65002);
        assert_eq!(egress.local_asn, 65001);
        assert_eq!(egress.bits(1000), 80_000);
    }

    #[test]
    fn test_both_directions_match() {
        let catalog = InterfaceCatalog::from_yaml(CATALOG).expect("catalog");
        let m = catalog.matches(&flow([10, 0, 0, 1], 1, 2));
        assert_eq!(m.len(), 2);
        let names: Vec<_> = m.iter().map(|x| x.iface.name.as_str()).collect();
        assert_eq!(names, vec!["eth0", "eth1"]);
    }

    #[test]
    fn test_same_interface_both_directions() {
        let catalog = InterfaceCatalog::from_yaml(CATALOG).expect("catalog");
        let m = catalog.matches(&flow([10, 0, 0, 2], 1, 1));
        assert_eq!(m.len(), 2);
        assert!(m.ingress.is_some() && m.egress.is_some());
    }

    #[test]
    fn test_no_match_for_unknown_host_or_id() {
        let catalog = InterfaceCatalog::from_yaml(CATALOG).expect("catalog");
        assert!(catalog.matches(&flow([10, 9, 9, 9], 1, 2)).is_empty());
        assert!(catalog.matches(&flow([10, 0, 0, 2], 5, 6)).is_empty());
    }

    #[test]
    fn test_mapped_ipv4_host_is_canonical() {
        let yaml = "- {name: eth0, host: \"::ffff:10.0.0.2\", id: 1, sample: 1}\n";
        let catalog = InterfaceCatalog::from_yaml(yaml).expect("catalog");
        assert_eq!(catalog.interfaces()[0].host, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(catalog.matches(&flow([10, 0, 0, 2], 1, 9)).len(), 1);
    }

    #[test]
    fn test_invalid_host_rejected() {
        let yaml = "- {name: eth0, host: router-a, id: 1, sample: 1}\n";
        let err = InterfaceCatalog::from_yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("invalid host"));
    }

    #[test]
    fn test_zero_sample_rejected() {
        let yaml = "- {name: eth0, host: 10.0.0.1, id: 1, sample: 0}\n";
        let err = InterfaceCatalog::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("zero sample rate"));
    }

    #[test]
    fn test_duplicate_interface_rejected() {
        let yaml = "- {name: a, host: 10.0.0.1, id: 1, sample: 1}\n- {name: b, host: 10.0.0.1, id: 1, sample: 1}\n";
        let err = InterfaceCatalog::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        assert!(InterfaceCatalog::from_yaml("- {name: eth0, id: one}").is_err());
    }

    #[test]
    fn test_bits_saturate() {
        let m = FlowMatch {
            iface: Arc::new(Interface {
                name: "x".to_string(),
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                id: 1,
                sample: u64::MAX,
            }),
            ingress: true,
            remote_asn: 0,
            local_asn: 0,
        };
        assert_eq!(m.bits(2), u64::MAX);
    }
}
