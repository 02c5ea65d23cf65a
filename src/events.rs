// Events that flow from the proxy to the sidecar
//
// A RawEvent is one observation of a loggable response. The proxy synthesizes
// it, the disk queue persists it, and the ingest client ships it to the
// sidecar as one JSON object per line. Field names on the wire are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One observed request/response pair, as shipped over the wire.
///
/// Exactly one of `set_cookie` and `uniq` is non-empty: `set_cookie` carries
/// the freshly minted visitor id on a first visit, `uniq` the confirmed or
/// returning id. `second_visit` marks the confirmation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default)]
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub referrer: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub set_cookie: String,
    #[serde(default)]
    pub uniq: String,
    #[serde(default)]
    pub second_visit: bool,
}

/// Mint a random v4 UUID in textual form (event ids, tracking cookies).
pub fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let evt = RawEvent {
            event_id: "e1".into(),
            timestamp: Utc::now(),
            host: "example.com".into(),
            path: "/".into(),
            query: String::new(),
            ip: "1.2.3.4".into(),
            user_agent: "curl/8.0".into(),
            referrer: String::new(),
            content_type: "text/html".into(),
            set_cookie: String::new(),
            uniq: "u1".into(),
            second_visit: true,
        };
        let json = serde_json::to_string(&evt).unwrap();
        for key in [
            "\"eventId\"",
            "\"timestamp\"",
            "\"userAgent\"",
            "\"contentType\"",
            "\"setCookie\"",
            "\"uniq\"",
            "\"secondVisit\"",
        ] {
            assert!(json.contains(key), "missing {} in {}", key, json);
        }
    }

    #[test]
    fn test_round_trip() {
        let evt = RawEvent {
            event_id: new_uuid(),
            timestamp: Utc::now(),
            host: "example.com".into(),
            path: "/a".into(),
            query: "q=1&r=2".into(),
            ip: "::1".into(),
            user_agent: "Mozilla/5.0".into(),
            referrer: "https://ref.example/".into(),
            content_type: "text/html; charset=utf-8".into(),
            set_cookie: "abc".into(),
            uniq: String::new(),
            second_visit: false,
        };
        let json = serde_json::to_string(&evt).unwrap();
        let back: RawEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_id, evt.event_id);
        assert_eq!(back.query, evt.query);
        assert_eq!(back.set_cookie, "abc");
        assert!(!back.second_visit);
    }

    #[test]
    fn test_new_uuid_shape() {
        let id = new_uuid();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('-').count(), 4);
    }
}
