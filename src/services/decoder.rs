//! Decoding of raw feed messages into [`VehiclePosition`] snapshots.
//!
//! This runs once per inbound message at feed-native frequency, so it does a
//! single JSON parse and a topic split and nothing else. A message without a
//! usable position is not an error: it is logged at debug level and dropped.

use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::models::{strip_operator_prefix, VehicleKind, VehiclePosition};

/// Zero-based topic segment (after the leading slash) carrying the route id.
///
/// This fixed offset is an assumption about the feed's topic layout. The
/// subscribe side covers a variant layout with an extra wildcard segment, but
/// concrete delivered topics carry the route here; decode parses only this
/// offset on purpose.
const ROUTE_SEGMENT_INDEX: usize = 8;

/// Topic segment carrying the journey headsign, when the topic is long
/// enough to include one.
const HEADSIGN_SEGMENT_INDEX: usize = 10;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "VP")]
    vp: Option<VpPayload>,
}

// Field names are fixed by the feed and must not be renamed.
#[derive(Debug, Deserialize)]
struct VpPayload {
    veh: Option<i64>,
    desi: Option<String>,
    lat: Option<f64>,
    #[serde(rename = "long")]
    lon: Option<f64>,
    hdg: Option<i32>,
    tsi: Option<f64>,
}

/// Extract the normalized route id from a topic path, if the path is long
/// enough to carry one.
pub fn route_id_from_topic(topic: &str) -> Option<String> {
    topic
        .trim_start_matches('/')
        .split('/')
        .nth(ROUTE_SEGMENT_INDEX)
        .filter(|s| !s.is_empty())
        .map(|s| strip_operator_prefix(s).to_string())
}

fn headsign_from_topic(topic: &str) -> Option<String> {
    topic
        .trim_start_matches('/')
        .split('/')
        .nth(HEADSIGN_SEGMENT_INDEX)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Decode one feed message into a position snapshot.
///
/// Returns `None` when the payload is malformed or missing the vehicle id,
/// display name, latitude or longitude. A missing timestamp defaults to the
/// current wall clock.
pub fn decode(topic: &str, payload: &[u8], kind: VehicleKind) -> Option<VehiclePosition> {
    let envelope: Envelope = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(topic, error = %e, "Dropping unparseable feed message");
            return None;
        }
    };

    let Some(vp) = envelope.vp else {
        debug!(topic, "Dropping feed message without VP envelope");
        return None;
    };

    let (Some(id), Some(line), Some(lat), Some(lon)) = (vp.veh, vp.desi, vp.lat, vp.lon) else {
        debug!(topic, "Dropping feed message without id or position");
        return None;
    };

    let timestamp = vp
        .tsi
        .map(|t| t as i64)
        .unwrap_or_else(|| Utc::now().timestamp());

    Some(VehiclePosition {
        id,
        kind,
        line,
        route_id: route_id_from_topic(topic),
        headsign: headsign_from_topic(topic),
        lat,
        lon,
        heading: vp.hdg,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "/hfp/v2/journey/ongoing/vp/bus/0018/01101/1065/1/It\u{e4}keskus/07:31/1455/3";

    fn vp_payload(fields: &str) -> Vec<u8> {
        format!(r#"{{"VP": {{{fields}}}}}"#).into_bytes()
    }

    // --- topic parsing tests ---

    #[test]
    fn route_id_is_ninth_segment() {
        assert_eq!(route_id_from_topic(TOPIC), Some("1065".to_string()));
    }

    #[test]
    fn route_id_strips_operator_prefix() {
        let topic = "/hfp/v2/journey/ongoing/vp/bus/0018/01101/HSL:1065/1/X/07:31/1455/3";
        assert_eq!(route_id_from_topic(topic), Some("1065".to_string()));
    }

    #[test]
    fn short_topic_has_no_route_id() {
        assert_eq!(route_id_from_topic("/hfp/v2/journey/ongoing/vp/bus"), None);
    }

    #[test]
    fn trailing_segments_do_not_shift_the_offset() {
        // Layouts with extra trailing segments still carry the route at the
        // same fixed offset.
        let long = format!("{TOPIC}/extra/segments/here");
        assert_eq!(route_id_from_topic(&long), Some("1065".to_string()));
    }

    // --- payload decoding tests ---

    #[test]
    fn decodes_full_message() {
        let payload =
            vp_payload(r#""veh": 42, "desi": "65", "lat": 60.17, "long": 24.94, "hdg": 90, "tsi": 1700000000"#);
        let position = decode(TOPIC, &payload, VehicleKind::Bus).unwrap();
        assert_eq!(position.id, 42);
        assert_eq!(position.line, "65");
        assert_eq!(position.route_id, Some("1065".to_string()));
        assert_eq!(position.headsign, Some("It\u{e4}keskus".to_string()));
        assert_eq!(position.lat, 60.17);
        assert_eq!(position.lon, 24.94);
        assert_eq!(position.heading, Some(90));
        assert_eq!(position.timestamp, 1_700_000_000);
        assert_eq!(position.kind, VehicleKind::Bus);
    }

    #[test]
    fn missing_lat_is_dropped() {
        let payload = vp_payload(r#""veh": 42, "desi": "65", "long": 24.94"#);
        assert!(decode(TOPIC, &payload, VehicleKind::Bus).is_none());
    }

    #[test]
    fn missing_display_name_is_dropped() {
        let payload = vp_payload(r#""veh": 42, "lat": 60.17, "long": 24.94"#);
        assert!(decode(TOPIC, &payload, VehicleKind::Bus).is_none());
    }

    #[test]
    fn missing_vehicle_id_is_dropped() {
        let payload = vp_payload(r#""desi": "65", "lat": 60.17, "long": 24.94"#);
        assert!(decode(TOPIC, &payload, VehicleKind::Bus).is_none());
    }

    #[test]
    fn malformed_json_is_dropped() {
        assert!(decode(TOPIC, b"{not json", VehicleKind::Bus).is_none());
        assert!(decode(TOPIC, br#"{"other": 1}"#, VehicleKind::Bus).is_none());
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let payload = vp_payload(r#""veh": 42, "desi": "65", "lat": 60.17, "long": 24.94"#);
        let position = decode(TOPIC, &payload, VehicleKind::Tram).unwrap();
        let now = Utc::now().timestamp();
        assert!((position.timestamp - now).abs() <= 2);
    }

    #[test]
    fn missing_heading_is_none() {
        let payload = vp_payload(r#""veh": 42, "desi": "65", "lat": 60.17, "long": 24.94"#);
        let position = decode(TOPIC, &payload, VehicleKind::Bus).unwrap();
        assert_eq!(position.heading, None);
    }
}
