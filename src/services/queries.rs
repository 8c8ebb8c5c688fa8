//! Typed operations against the transit query API: route search, stops for a
//! route and departure boards. Each operation is a query+variables pair
//! executed through [`TransitQueryClient`], with response shapes kept
//! all-optional and skip-on-missing like the wire really behaves.

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::models::{Departure, DepartureFilter, RouteSelection, StopMarker, VehicleKind};
use crate::providers::graphql::{QueryError, TransitQueryClient};

const ROUTE_SEARCH_QUERY: &str = r#"
query RouteSearch($name: String, $modes: [Mode]) {
  routes(name: $name, transportModes: $modes) {
    gtfsId
    shortName
    longName
    mode
  }
}
"#;

const ROUTE_STOPS_QUERY: &str = r#"
query RouteStops($id: String!) {
  route(id: $id) {
    stops {
      gtfsId
      name
      lat
      lon
      platformCode
    }
  }
}
"#;

const STOP_DEPARTURES_QUERY: &str = r#"
query StopDepartures($id: String!, $n: Int!) {
  stop(id: $id) {
    stoptimesWithoutPatterns(numberOfDepartures: $n) {
      scheduledDeparture
      realtimeDeparture
      serviceDay
      headsign
      trip {
        route {
          gtfsId
          shortName
        }
      }
      stop {
        platformCode
      }
    }
  }
}
"#;

const STATION_DEPARTURES_QUERY: &str = r#"
query StationDepartures($id: String!, $n: Int!) {
  station(id: $id) {
    stoptimesWithoutPatterns(numberOfDepartures: $n) {
      scheduledDeparture
      realtimeDeparture
      serviceDay
      headsign
      trip {
        route {
          gtfsId
          shortName
        }
      }
      stop {
        platformCode
      }
    }
  }
}
"#;

/// A route found by name search.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSummary {
    pub id: String,
    pub short_name: String,
    pub long_name: Option<String>,
    pub kind: Option<VehicleKind>,
}

impl RouteSummary {
    pub fn into_selection(self) -> RouteSelection {
        RouteSelection::new(self.id, self.short_name)
    }
}

// Response shapes. Every field is optional on the wire.

#[derive(Debug, Deserialize)]
struct RoutesData {
    #[serde(default)]
    routes: Vec<RouteNode>,
}

#[derive(Debug, Deserialize)]
struct RouteNode {
    #[serde(rename = "gtfsId")]
    gtfs_id: Option<String>,
    #[serde(rename = "shortName")]
    short_name: Option<String>,
    #[serde(rename = "longName")]
    long_name: Option<String>,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RouteStopsData {
    route: Option<RouteStopsNode>,
}

#[derive(Debug, Deserialize)]
struct RouteStopsNode {
    #[serde(default)]
    stops: Vec<StopNode>,
}

#[derive(Debug, Deserialize)]
struct StopNode {
    #[serde(rename = "gtfsId")]
    gtfs_id: Option<String>,
    name: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(rename = "platformCode")]
    platform_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StopDeparturesData {
    stop: Option<StoptimesNode>,
}

#[derive(Debug, Deserialize)]
struct StationDeparturesData {
    station: Option<StoptimesNode>,
}

#[derive(Debug, Deserialize)]
struct StoptimesNode {
    #[serde(default, rename = "stoptimesWithoutPatterns")]
    stoptimes: Vec<StoptimeNode>,
}

#[derive(Debug, Deserialize)]
struct StoptimeNode {
    #[serde(rename = "scheduledDeparture")]
    scheduled_departure: Option<i64>,
    #[serde(rename = "realtimeDeparture")]
    realtime_departure: Option<i64>,
    #[serde(rename = "serviceDay")]
    service_day: Option<i64>,
    headsign: Option<String>,
    trip: Option<TripNode>,
    stop: Option<StoptimeStopNode>,
}

#[derive(Debug, Deserialize)]
struct TripNode {
    route: Option<RouteNode>,
}

#[derive(Debug, Deserialize)]
struct StoptimeStopNode {
    #[serde(rename = "platformCode")]
    platform_code: Option<String>,
}

fn mode_to_kind(mode: Option<&str>) -> Option<VehicleKind> {
    match mode {
        Some("BUS") => Some(VehicleKind::Bus),
        Some("TRAM") => Some(VehicleKind::Tram),
        _ => None,
    }
}

fn routes_from_nodes(nodes: Vec<RouteNode>) -> Vec<RouteSummary> {
    nodes
        .into_iter()
        .filter_map(|node| {
            let id = node.gtfs_id?;
            let short_name = node.short_name?;
            Some(RouteSummary {
                id,
                short_name,
                long_name: node.long_name,
                kind: mode_to_kind(node.mode.as_deref()),
            })
        })
        .collect()
}

fn stops_from_nodes(nodes: Vec<StopNode>) -> Vec<StopMarker> {
    nodes
        .into_iter()
        .filter_map(|node| {
            let id = node.gtfs_id?;
            let lat = node.lat?;
            let lon = node.lon?;
            Some(StopMarker {
                id,
                name: node.name.unwrap_or_default(),
                lat,
                lon,
                platform: node.platform_code,
            })
        })
        .collect()
}

/// Derive filtered, time-sorted departures from a stoptimes response.
fn departures_from_nodes(
    nodes: Vec<StoptimeNode>,
    filter: &DepartureFilter,
    now: i64,
) -> Vec<Departure> {
    let mut departures: Vec<Departure> = nodes
        .into_iter()
        .filter_map(|node| {
            let scheduled = node.scheduled_departure?;
            let service_day = node.service_day?;
            let route = node.trip.and_then(|t| t.route);
            let line = route.as_ref().and_then(|r| r.short_name.clone())?;
            Some(Departure {
                line,
                route_id: route.and_then(|r| r.gtfs_id),
                headsign: node.headsign,
                scheduled,
                realtime: node.realtime_departure.unwrap_or(scheduled),
                service_day,
                platform: node.stop.and_then(|s| s.platform_code),
            })
        })
        .filter(|departure| filter.accepts(departure, now))
        .collect();

    departures.sort_by_key(Departure::departs_at);
    departures
}

impl TransitQueryClient {
    /// Search routes by free-text name, optionally restricted to transport
    /// modes.
    pub async fn search_routes(
        &self,
        name: &str,
        modes: &[VehicleKind],
    ) -> Result<Vec<RouteSummary>, QueryError> {
        let modes: Vec<String> = modes
            .iter()
            .map(|kind| kind.as_str().to_uppercase())
            .collect();
        let variables = if modes.is_empty() {
            json!({ "name": name })
        } else {
            json!({ "name": name, "modes": modes })
        };

        let data: RoutesData = self.execute(ROUTE_SEARCH_QUERY, variables).await?;
        Ok(routes_from_nodes(data.routes))
    }

    /// Fetch the ordered stops of a route.
    pub async fn stops_for_route(&self, route_id: &str) -> Result<Vec<StopMarker>, QueryError> {
        let data: RouteStopsData = self
            .execute(ROUTE_STOPS_QUERY, json!({ "id": route_id }))
            .await?;
        Ok(stops_from_nodes(data.route.map(|r| r.stops).unwrap_or_default()))
    }

    /// Fetch the next departures for a single stop.
    pub async fn departures_for_stop(
        &self,
        stop_id: &str,
        limit: u32,
        filter: &DepartureFilter,
    ) -> Result<Vec<Departure>, QueryError> {
        let data: StopDeparturesData = self
            .execute(STOP_DEPARTURES_QUERY, json!({ "id": stop_id, "n": limit }))
            .await?;
        let nodes = data.stop.map(|s| s.stoptimes).unwrap_or_default();
        Ok(departures_from_nodes(nodes, filter, Utc::now().timestamp()))
    }

    /// Fetch the next departures for a station (a group of stops).
    pub async fn departures_for_station(
        &self,
        station_id: &str,
        limit: u32,
        filter: &DepartureFilter,
    ) -> Result<Vec<Departure>, QueryError> {
        let data: StationDeparturesData = self
            .execute(
                STATION_DEPARTURES_QUERY,
                json!({ "id": station_id, "n": limit }),
            )
            .await?;
        let nodes = data.station.map(|s| s.stoptimes).unwrap_or_default();
        Ok(departures_from_nodes(nodes, filter, Utc::now().timestamp()))
    }

    /// Fetch departures for several stops concurrently.
    pub async fn departures_for_stops_batch(
        &self,
        stop_ids: &[String],
        limit: u32,
        filter: &DepartureFilter,
    ) -> Vec<(String, Result<Vec<Departure>, QueryError>)> {
        let futures: Vec<_> = stop_ids
            .iter()
            .map(|id| {
                let id = id.clone();
                async move {
                    let result = self.departures_for_stop(&id, limit, filter).await;
                    (id, result)
                }
            })
            .collect();

        futures::future::join_all(futures).await
    }
}
