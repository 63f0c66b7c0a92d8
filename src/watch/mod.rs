//! Change notification plumbing
//!
//! Watch streams carry one JSON object per line: `{"Start":true}` marks the
//! stream ready, `{"KV":{...}}` carries a mutation, `{"Err":"..."}` signals a
//! fatal stream error before close.

pub mod broadcast;

pub use broadcast::Broadcaster;

use serde::{Deserialize, Serialize};

use crate::store::KeyValue;

/// One frame of a watch stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "KV", default, skip_serializing_if = "Option::is_none")]
    pub kv: Option<KeyValue>,
    #[serde(rename = "Err", default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(rename = "Start", default, skip_serializing_if = "is_false")]
    pub start: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl WatchEvent {
    /// The stream-ready handshake marker.
    pub fn start() -> Self {
        Self {
            start: true,
            ..Default::default()
        }
    }

    pub fn kv(kv: KeyValue) -> Self {
        Self {
            kv: Some(kv),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            err: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Does the mutated key match a watch filter? A filter ending in `%` matches
/// by prefix, anything else matches exactly.
pub fn matches_key(filter: &str, key: &str) -> bool {
    match filter.strip_suffix('%') {
        Some(prefix) => key.starts_with(prefix),
        None => filter == key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_key() {
        assert!(matches_key("a/1", "a/1"));
        assert!(!matches_key("a/1", "a/12"));
        assert!(matches_key("a/%", "a/1"));
        assert!(matches_key("a/%", "a/"));
        assert!(!matches_key("a/%", "b/1"));
    }

    #[test]
    fn test_event_frames() {
        let start = serde_json::to_string(&WatchEvent::start()).unwrap();
        assert_eq!(start, r#"{"Start":true}"#);

        let err = serde_json::to_string(&WatchEvent::error("boom")).unwrap();
        assert_eq!(err, r#"{"Err":"boom"}"#);

        let frame: WatchEvent = serde_json::from_str(r#"{"Start":true}"#).unwrap();
        assert!(frame.start);
        assert!(frame.kv.is_none());
    }
}
