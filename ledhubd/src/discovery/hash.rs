use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::DiscoveredService;

/// Only stable fields take part: first_seen/last_seen move on every
/// re-announcement without the service itself changing.
#[derive(Serialize)]
struct HashView<'a> {
    service_type: &'a str,
    instance_name: &'a str,
    hostname: &'a str,
    resolved_address: Option<IpAddr>,
    port: Option<u16>,
    txt: BTreeMap<&'a str, &'a str>,
}

fn sorted_txt(txt: &HashMap<String, String>) -> BTreeMap<&str, &str> {
    txt.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

/// Computes a SHA-256 hash of the service list.
/// Services are sorted by type and instance name for deterministic output.
pub fn compute_hash(services: &[DiscoveredService]) -> String {
    let mut indices: Vec<usize> = (0..services.len()).collect();
    indices.sort_by(|&a, &b| {
        let (a, b) = (&services[a], &services[b]);
        (&a.service_type, &a.instance_name).cmp(&(&b.service_type, &b.instance_name))
    });

    let views: Vec<HashView<'_>> = indices
        .iter()
        .map(|&i| {
            let s = &services[i];
            HashView {
                service_type: &s.service_type,
                instance_name: &s.instance_name,
                hostname: &s.hostname,
                resolved_address: s.resolved_address,
                port: s.port,
                txt: sorted_txt(&s.txt),
            }
        })
        .collect();

    let json = serde_json::to_string(&views)
        .expect("Failed to serialize services for hashing");

    let hash = Sha256::digest(json.as_bytes());
    hex::encode(hash)
}
