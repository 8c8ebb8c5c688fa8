use serde::Serialize;

use super::vehicle::strip_operator_prefix;

/// A single upcoming (or past) departure derived from the query API.
///
/// Times are seconds since midnight of `service_day`, which is itself epoch
/// seconds at midnight; transit days run past 24h so `realtime` may exceed
/// 86400.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Departure {
    /// Line display name (e.g. "550")
    pub line: String,
    pub route_id: Option<String>,
    pub headsign: Option<String>,
    /// Scheduled departure, seconds since midnight of `service_day`
    pub scheduled: i64,
    /// Realtime-adjusted departure, seconds since midnight of `service_day`
    pub realtime: i64,
    /// Epoch seconds at midnight of the service day
    pub service_day: i64,
    pub platform: Option<String>,
}

impl Departure {
    /// Absolute departure instant in epoch seconds.
    pub fn departs_at(&self) -> i64 {
        self.service_day + self.realtime
    }

    /// Delay versus schedule in seconds; negative means early.
    pub fn delay_secs(&self) -> i64 {
        self.realtime - self.scheduled
    }
}

/// Filter applied to departure-board queries.
#[derive(Debug, Clone, Default)]
pub struct DepartureFilter {
    /// Restrict to these routes; empty means all routes pass
    pub routes: Vec<RouteMatcher>,
    /// Include departures whose instant is already in the past
    pub include_past: bool,
}

/// Route match key for a departure: exact id, prefix-stripped id, or line
/// short-name. Matching any one form satisfies inclusion.
#[derive(Debug, Clone)]
pub struct RouteMatcher {
    pub route_id: String,
    pub short_name: String,
}

impl RouteMatcher {
    fn matches(&self, departure: &Departure) -> bool {
        if departure.line == self.short_name {
            return true;
        }
        match &departure.route_id {
            Some(id) => {
                id == &self.route_id || strip_operator_prefix(id) == strip_operator_prefix(&self.route_id)
            }
            None => false,
        }
    }
}

impl DepartureFilter {
    /// Whether `departure` passes this filter at wall-clock `now` (epoch
    /// seconds).
    pub fn accepts(&self, departure: &Departure, now: i64) -> bool {
        if !self.include_past && departure.departs_at() < now {
            return false;
        }
        if self.routes.is_empty() {
            return true;
        }
        self.routes.iter().any(|r| r.matches(departure))
    }
}
