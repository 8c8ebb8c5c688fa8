//! Real-time public-transit tracking core.
//!
//! This crate implements the live-vehicle ingestion pipeline behind a transit
//! map client: an MQTT subscription to a high-frequency vehicle-position feed,
//! dynamic topic reconciliation as the selected lines change, a coalescing
//! update buffer, and a periodic merge that publishes a consistent, filtered,
//! sorted vehicle list. A retrying GraphQL query layer covers route search,
//! stops and departure boards.
//!
//! The presentation layer (map rendering, UI) consumes the `watch` channels
//! exposed by [`manager::VehicleManager`] and [`aggregate::MapStateManager`];
//! nothing in this crate draws anything.

pub mod aggregate;
pub mod config;
pub mod manager;
pub mod models;
pub mod providers;
pub mod services;

pub use aggregate::{MapEntry, MapStateManager};
pub use config::Config;
pub use manager::{FeedStatus, VehicleManager};
pub use models::{Departure, RouteSelection, StopMarker, VehicleKind, VehiclePosition};
