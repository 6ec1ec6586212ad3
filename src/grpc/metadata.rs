//! Metadata conversion for tunnel envelopes.
//!
//! Headers and trailers cross the tunnel as `map<string, Values>`. Binary
//! (`-bin`) entries travel in their base64 wire form so the map stays valid
//! UTF-8 and the receiving side can re-insert them verbatim.

use std::collections::HashMap;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tonic::metadata::MetadataMap;

/// Prefix of metadata keys consumed by the gateway hop.
pub const HOP_PREFIX: &str = "kas-hop-";

/// Target agent id for routed requests. Must be present exactly once.
pub const ROUTING_AGENT_ID_KEY: &str = "kas-hop-routing-agent-id";

/// Repeated string values of one metadata key.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Values {
    #[prost(string, repeated, tag = "1")]
    pub value: Vec<String>,
}

/// Keys owned by the transport. They are regenerated on every hop and must
/// never be copied from one stream onto another.
fn is_transport_key(key: &str) -> bool {
    key.starts_with(':')
        || key.starts_with("grpc-")
        || matches!(
            key,
            "content-type"
                | "content-length"
                | "te"
                | "user-agent"
                | "host"
                | "authorization"
                | "accept-encoding"
        )
}

/// Convert metadata into the envelope map, dropping transport keys.
pub fn to_values(md: &MetadataMap) -> HashMap<String, Values> {
    let headers = md.clone().into_headers();
    let mut out: HashMap<String, Values> = HashMap::new();
    for (name, value) in &headers {
        let key = name.as_str();
        if is_transport_key(key) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(key.to_string())
            .or_default()
            .value
            .push(value.to_string());
    }
    out
}

/// Convert an envelope map back into metadata. Invalid keys or values are skipped.
pub fn from_values(values: &HashMap<String, Values>) -> MetadataMap {
    let mut headers = HeaderMap::new();
    for (key, vals) in values {
        if is_transport_key(key) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            continue;
        };
        for v in &vals.value {
            if let Ok(value) = HeaderValue::from_str(v) {
                headers.append(name.clone(), value);
            }
        }
    }
    MetadataMap::from_headers(headers)
}

/// Copy metadata for forwarding to the next hop, dropping transport keys.
pub fn forwardable(md: &MetadataMap) -> MetadataMap {
    from_values(&to_values(md))
}

/// Remove every `kas-hop-*` key. Those are consumed by the gateway and must not
/// reach the agent.
pub fn remove_hop_meta(md: &MetadataMap) -> MetadataMap {
    let mut headers = md.clone().into_headers();
    let hop_keys: Vec<HeaderName> = headers
        .keys()
        .filter(|k| k.as_str().starts_with(HOP_PREFIX))
        .cloned()
        .collect();
    for key in hop_keys {
        headers.remove(key);
    }
    MetadataMap::from_headers(headers)
}

/// Merge `extra` into `md`, appending values.
pub fn merge(md: &mut MetadataMap, extra: MetadataMap) {
    let mut headers = std::mem::take(md).into_headers();
    for (name, value) in &extra.into_headers() {
        headers.append(name.clone(), value.clone());
    }
    *md = MetadataMap::from_headers(headers);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md(pairs: &[(&'static str, &'static str)]) -> MetadataMap {
        let mut m = MetadataMap::new();
        for (k, v) in pairs {
            m.append(*k, v.parse().unwrap());
        }
        m
    }

    #[test]
    fn test_to_values_groups_and_filters() {
        let m = md(&[
            ("key1", "a"),
            ("key1", "b"),
            ("content-type", "application/grpc"),
            ("grpc-timeout", "5S"),
            ("authorization", "Bearer x"),
        ]);
        let vals = to_values(&m);
        assert_eq!(vals.len(), 1);
        assert_eq!(vals["key1"].value, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_values_round_trip_with_binary() {
        let mut m = md(&[("key2", "value2")]);
        m.append_bin(
            "blob-bin",
            tonic::metadata::MetadataValue::from_bytes(&[0u8, 1, 2, 255]),
        );
        let back = from_values(&to_values(&m));
        assert_eq!(back.get("key2").unwrap(), "value2");
        assert_eq!(
            back.get_bin("blob-bin").unwrap().to_bytes().unwrap().as_ref(),
            &[0u8, 1, 2, 255]
        );
    }

    #[test]
    fn test_remove_hop_meta() {
        let m = md(&[
            (ROUTING_AGENT_ID_KEY, "42"),
            ("kas-hop-other", "x"),
            ("kas-keep", "y"),
        ]);
        let stripped = remove_hop_meta(&m);
        assert!(stripped.get(ROUTING_AGENT_ID_KEY).is_none());
        assert!(stripped.get("kas-hop-other").is_none());
        assert_eq!(stripped.get("kas-keep").unwrap(), "y");
        // input is untouched
        assert!(m.get(ROUTING_AGENT_ID_KEY).is_some());
    }

    #[test]
    fn test_merge_appends() {
        let mut a = md(&[("k", "1")]);
        merge(&mut a, md(&[("k", "2"), ("j", "3")]));
        assert_eq!(a.get_all("k").iter().count(), 2);
        assert_eq!(a.get("j").unwrap(), "3");
    }
}
