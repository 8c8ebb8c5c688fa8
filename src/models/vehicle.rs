use serde::{Deserialize, Serialize};

/// Operator prefix carried by some upstream route ids (e.g. "HSL:2550").
/// Vehicle messages and parts of the topic tree report the bare id, so both
/// forms must be treated as the same route.
pub const OPERATOR_PREFIX: &str = "HSL:";

/// Strip the known operator prefix from a route id, if present.
pub fn strip_operator_prefix(id: &str) -> &str {
    id.strip_prefix(OPERATOR_PREFIX).unwrap_or(id)
}

/// Kind of tracked vehicle. Feed vehicle ids are only unique within a kind,
/// so every map key carries the kind alongside the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleKind {
    Bus,
    Tram,
}

impl VehicleKind {
    /// Topic-path prefix used by the feed for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleKind::Bus => "bus",
            VehicleKind::Tram => "tram",
        }
    }
}

/// Namespaced vehicle identity: feed id plus vehicle kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VehicleKey {
    pub kind: VehicleKind,
    pub id: i64,
}

/// A single vehicle position snapshot decoded from the feed.
///
/// Snapshots are immutable: a newer message for the same vehicle produces a
/// new value that supersedes the old one in the live map.
#[derive(Debug, Clone, Serialize)]
pub struct VehiclePosition {
    /// Feed-assigned vehicle id, unique only within `kind`
    pub id: i64,
    pub kind: VehicleKind,
    /// Line display name (e.g. "550")
    pub line: String,
    /// Normalized route id parsed from the message topic, if present
    pub route_id: Option<String>,
    pub headsign: Option<String>,
    pub lat: f64,
    pub lon: f64,
    /// Heading in degrees; `None` when the feed omits it
    pub heading: Option<i32>,
    /// Seconds since epoch when the position was reported
    pub timestamp: i64,
}

impl VehiclePosition {
    pub fn key(&self) -> VehicleKey {
        VehicleKey {
            kind: self.kind,
            id: self.id,
        }
    }

    /// Age of this snapshot relative to `now` (epoch seconds).
    pub fn age_secs(&self, now: i64) -> i64 {
        now - self.timestamp
    }
}

// Equality deliberately ignores `timestamp`: two snapshots that differ only
// in report time render identically, and the flush loop uses this comparison
// to suppress redundant downstream publishes.
impl PartialEq for VehiclePosition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.line == other.line
            && self.route_id == other.route_id
            && self.headsign == other.headsign
            && self.lat == other.lat
            && self.lon == other.lon
            && self.heading == other.heading
    }
}

/// A user-selected line to track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSelection {
    /// Opaque upstream route id; may or may not carry the operator prefix
    pub id: String,
    /// Normalized route id, when known
    pub route_id: Option<String>,
    /// Human line number (e.g. "550"), used as a fallback match key because
    /// the upstream id scheme is inconsistently normalized
    pub short_name: String,
}

impl RouteSelection {
    pub fn new(id: impl Into<String>, short_name: impl Into<String>) -> Self {
        let id = id.into();
        let route_id = Some(strip_operator_prefix(&id).to_string());
        Self {
            id,
            route_id,
            short_name: short_name.into(),
        }
    }

    /// All id forms this selection may appear under in topics and messages.
    pub fn candidate_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(3);
        if let Some(route_id) = &self.route_id {
            ids.push(route_id.clone());
        }
        if !ids.contains(&self.id) {
            ids.push(self.id.clone());
        }
        let stripped = strip_operator_prefix(&self.id).to_string();
        if !ids.contains(&stripped) {
            ids.push(stripped);
        }
        ids
    }

    /// Whether a decoded vehicle belongs to this selection: normalized route
    /// id match first, line short-name as fallback.
    pub fn matches_vehicle(&self, vehicle: &VehiclePosition) -> bool {
        if let Some(vehicle_route) = &vehicle.route_id {
            let stripped = strip_operator_prefix(&self.id);
            if vehicle_route == stripped {
                return true;
            }
            if let Some(route_id) = &self.route_id {
                if vehicle_route == route_id {
                    return true;
                }
            }
        }
        vehicle.line == self.short_name
    }
}
