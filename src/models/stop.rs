use serde::Serialize;

/// A stop along a tracked route, displayed as the stop layer of the map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopMarker {
    /// Upstream stop id (e.g. "HSL:1240103")
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub platform: Option<String>,
}
