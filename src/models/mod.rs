//! Core data model shared across the ingestion pipeline and query layer.

mod departure;
mod stop;
mod vehicle;

pub use departure::{Departure, DepartureFilter, RouteMatcher};
pub use stop::StopMarker;
pub use vehicle::{strip_operator_prefix, RouteSelection, VehicleKey, VehicleKind, VehiclePosition};
