//! Dataset uuid generation.
//!
//! A uuid is `ms_since_epoch * 1_000_000 + (node_id mod 99_999_999)`, where
//! the node id is derived from the first hardware address of the host.
//! Uuids issued by one process are strictly increasing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use tracing::debug;

const NODE_MODULUS: u64 = 99_999_999;
const MS_MULTIPLIER: i64 = 1_000_000;

static LAST_MS: AtomicI64 = AtomicI64::new(0);

lazy_static! {
    static ref HOST_NODE_ID: u64 = detect_node_id();
}

/// Generates a new uuid for this host.
pub fn generate_uuid(node_override: Option<u64>) -> i64 {
    let node = node_override.unwrap_or(*HOST_NODE_ID) % NODE_MODULUS;
    let ms = next_millis();
    ms * MS_MULTIPLIER + node as i64
}

/// Millisecond timestamp embedded in a uuid. Node ids above one million
/// spill into the millisecond digits, so this is exact only for small nodes.
pub fn uuid_millis(uuid: i64) -> i64 {
    uuid / MS_MULTIPLIER
}

fn next_millis() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let mut last = LAST_MS.load(Ordering::Acquire);
    loop {
        let candidate = if now > last { now } else { last + 1 };
        match LAST_MS.compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

fn detect_node_id() -> u64 {
    if let Some(mac) = first_mac_address() {
        debug!("Using hardware address {:012x} as node id", mac);
        return mac;
    }
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".into());
    let mut hasher = DefaultHasher::new();
    host.hash(&mut hasher);
    debug!("No hardware address found, hashing hostname '{}' for node id", host);
    hasher.finish()
}

fn first_mac_address() -> Option<u64> {
    let mut entries: Vec<_> = std::fs::read_dir("/sys/class/net").ok()?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    entries
        .iter()
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("address")).ok())
        .filter_map(|text| parse_mac(text.trim()))
        .find(|mac| *mac != 0)
}

fn parse_mac(text: &str) -> Option<u64> {
    let hex: String = text.split(':').collect();
    if hex.len() != 12 {
        return None;
    }
    u64::from_str_radix(&hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_layout() {
        let uuid = generate_uuid(Some(NODE_MODULUS + 123_456));
        assert_eq!(uuid % MS_MULTIPLIER, 123_456);
        assert!(uuid_millis(uuid) > 1_600_000_000_000);
    }

    #[test]
    fn test_uuids_are_monotonic() {
        let mut previous = generate_uuid(Some(7));
        for _ in 0..1000 {
            let next = generate_uuid(Some(7));
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(parse_mac("00:00:00:00:00:01"), Some(1));
        assert_eq!(parse_mac("ff:ff:ff:ff:ff:ff"), Some(0xffff_ffff_ffff));
        assert_eq!(parse_mac("garbage"), None);
    }
}
