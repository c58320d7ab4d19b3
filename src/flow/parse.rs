//! Decoding of flow datagrams emitted by an external collector.
//!
//! Each datagram carries one or more newline-separated JSON objects using the
//! goflow2 field names. Older CamelCase producers are accepted through serde
//! aliases. Fields the importer does not need are ignored.

use std::net::IpAddr;

use serde::Deserialize;
use thiserror::Error;

use super::FlowRecord;

/// Errors that can occur while decoding a flow datagram.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,

    #[error("line {line}: invalid flow JSON: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: invalid exporter address {raw:?}")]
    InvalidRouter { line: usize, raw: String },
}

#[derive(Deserialize)]
struct RawFlow {
    #[serde(alias = "SamplerAddress", alias = "sampler_addr")]
    sampler_address: String,
    #[serde(default, alias = "InIf")]
    in_if: u32,
    #[serde(default, alias = "OutIf")]
    out_if: u32,
    #[serde(default, alias = "Bytes")]
    bytes: u64,
    #[serde(default, alias = "SrcAS", alias = "SrcAs")]
    src_as: u32,
    #[serde(default, alias = "DstAS", alias = "DstAs")]
    dst_as: u32,
}

/// Parse a single JSON flow object.
pub fn parse_flow(line: &str) -> Result<FlowRecord, ParseError> {
    parse_line(line, 1)
}

/// Parse every flow in a datagram.
///
/// Blank lines are skipped. The first malformed line aborts the datagram;
/// records already decoded from it are returned alongside the error so the
/// caller can keep them.
pub fn parse_datagram(data: &[u8]) -> (Vec<FlowRecord>, Option<ParseError>) {
    let Ok(text) = std::str::from_utf8(data) else {
        return (Vec::new(), Some(ParseError::NotUtf8));
    };

    let mut flows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_line(trimmed, line_no) {
            Ok(flow) => flows.push(flow),
            Err(e) => return (flows, Some(e)),
        }
    }

    (flows, None)
}

fn parse_line(line: &str, line_no: usize) -> Result<FlowRecord, ParseError> {
    let raw: RawFlow = serde_json::from_str(line).map_err(|source| ParseError::Json {
        line: line_no,
        source,
    })?;

    let router: IpAddr = raw
        .sampler_address
        .parse()
        .map_err(|_| ParseError::InvalidRouter {
            line: line_no,
            raw: raw.sampler_address.clone(),
        })?;

    Ok(FlowRecord {
        // Dual-stack collectors report IPv4 exporters as ::ffff:a.b.c.d.
        router: router.to_canonical(),
        in_if: raw.in_if,
        out_if: raw.out_if,
        bytes: raw.bytes,
        src_as: raw.src_as,
        dst_as: raw.dst_as,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const GOFLOW_LINE: &str = r#"{"type":"NETFLOW_V9","time_received_ns":1700000000000000000,"sampler_address":"10.0.0.1","bytes":1000,"packets":1,"in_if":1,"out_if":7,"src_as":65001,"dst_as":65002,"proto":"TCP"}"#;

    #[test]
    fn test_parse_goflow_line() {
        let flow = parse_flow(GOFLOW_LINE).expect("valid flow");
        assert_eq!(flow.router, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(flow.in_if, 1);
        assert_eq!(flow.out_if, 7);
        assert_eq!(flow.bytes, 1000);
        assert_eq!(flow.src_as, 65001);
        assert_eq!(flow.dst_as, 65002);
    }

    #[test]
    fn test_parse_camel_case_aliases() {
        let line = r#"{"SamplerAddress":"2001:db8::1","InIf":3,"OutIf":4,"Bytes":64,"SrcAS":1,"DstAS":2}"#;
        let flow = parse_flow(line).expect("valid flow");
        assert!(flow.router.is_ipv6());
        assert_eq!(flow.in_if, 3);
        assert_eq!(flow.out_if, 4);
        assert_eq!(flow.bytes, 64);
    }

    #[test]
    fn test_parse_ipv4_mapped_router_is_canonical() {
        let flow = parse_flow(r#"{"sampler_address":"::ffff:10.0.0.1","bytes":1}"#).expect("valid flow");
        assert_eq!(flow.router, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_parse_missing_counters_default_to_zero() {
        let flow = parse_flow(r#"{"sampler_address":"10.0.0.1"}"#).expect("valid flow");
        assert_eq!(flow.bytes, 0);
        assert_eq!(flow.in_if, 0);
    }

    #[test]
    fn test_parse_invalid_router() {
        let err = parse_flow(r#"{"sampler_address":"router-1","bytes":1}"#).unwrap_err();
        assert!(matches!(err, ParseError::InvalidRouter { line: 1, .. }));
    }

    #[test]
    fn test_parse_datagram_multiple_lines() {
        let data = format!("{GOFLOW_LINE}\n\n{GOFLOW_LINE}\n");
        let (flows, err) = parse_datagram(data.as_bytes());
        assert!(err.is_none());
        assert_eq!(flows.len(), 2);
    }

    #[test]
    fn test_parse_datagram_keeps_records_before_error() {
        let data = format!("{GOFLOW_LINE}\n{{not json\n{GOFLOW_LINE}");
        let (flows, err) = parse_datagram(data.as_bytes());
        assert_eq!(flows.len(), 1);
        assert!(matches!(err, Some(ParseError::Json { line: 2, .. })));
    }

    #[test]
    fn test_parse_datagram_not_utf8() {
        let (flows, err) = parse_datagram(&[0xff, 0xfe, 0x00]);
        assert!(flows.is_empty());
        assert!(matches!(err, Some(ParseError::NotUtf8)));
    }
}
