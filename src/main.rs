use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transit_live::aggregate::{MapEntry, MapStateManager};
use transit_live::config::{Config, LineConfig};
use transit_live::manager::VehicleManager;
use transit_live::models::{RouteSelection, VehicleKind};
use transit_live::providers::feed::MqttFeed;
use transit_live::providers::graphql::TransitQueryClient;
use transit_live::services::favorites::MemoryFavoritesStore;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rumqttc=warn".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    tracing::info!(lines = config.lines.len(), "Loaded configuration");

    let query_client = if config.api.key.is_empty() {
        tracing::info!("No API key configured, skipping route resolution");
        None
    } else {
        TransitQueryClient::new(
            config.api.url.clone(),
            config.api.key.clone(),
            Duration::from_secs(config.api.timeout_secs),
        )
        .map_err(|e| tracing::warn!(error = %e, "Query client unavailable"))
        .ok()
    };

    let favorites = Arc::new(MemoryFavoritesStore::new());
    let map_state = MapStateManager::new();
    let mut managers = Vec::new();

    for kind in [VehicleKind::Bus, VehicleKind::Tram] {
        let lines: Vec<&LineConfig> = config.lines.iter().filter(|l| l.kind == kind).collect();
        if lines.is_empty() {
            continue;
        }

        let mut selections = Vec::with_capacity(lines.len());
        for line in lines {
            selections.push(resolve_selection(query_client.as_ref(), line).await);
        }

        let feed = Arc::new(MqttFeed::new(config.feed.clone()));
        let manager =
            VehicleManager::new(kind, config.tracker.clone(), feed, favorites.clone());
        let _forwarder = map_state.attach_manager(&manager);
        manager.connect();
        manager.update_subscriptions(selections).await;
        managers.push(manager);
    }

    if managers.is_empty() {
        tracing::warn!("No lines configured, nothing to track");
        return;
    }

    // Stop layer for the first configured line, when the query API is usable.
    if let (Some(client), Some(line)) = (query_client.as_ref(), config.lines.first()) {
        match client.stops_for_route(&line.id).await {
            Ok(stops) => {
                tracing::info!(route = %line.id, stops = stops.len(), "Loaded stop layer");
                map_state.set_stops(stops);
            }
            Err(e) => tracing::warn!(route = %line.id, error = %e, "{}", e.user_message()),
        }
    }

    let mut entries = map_state.entries();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = entries.changed() => {
                if changed.is_err() {
                    break;
                }
                let list = entries.borrow_and_update().clone();
                let vehicles = list
                    .iter()
                    .filter(|entry| matches!(entry, MapEntry::Vehicle(_)))
                    .count();
                tracing::info!(
                    vehicles,
                    stops = list.len() - vehicles,
                    "Display list updated"
                );
            }
        }
    }

    tracing::info!("Shutting down");
    for manager in &managers {
        manager.shutdown().await;
    }
}

/// Resolve a configured line against the routing API, falling back to the
/// configured ids when the lookup fails or no client is available.
async fn resolve_selection(
    client: Option<&TransitQueryClient>,
    line: &LineConfig,
) -> RouteSelection {
    if let Some(client) = client {
        match client.search_routes(&line.short_name, &[line.kind]).await {
            Ok(routes) => {
                if let Some(route) = routes
                    .into_iter()
                    .find(|r| r.id == line.id || r.short_name == line.short_name)
                {
                    return route.into_selection();
                }
                tracing::warn!(line = %line.short_name, "Route not found upstream, using configured ids");
            }
            Err(e) => {
                tracing::warn!(line = %line.short_name, error = %e, "{}", e.user_message());
            }
        }
    }
    RouteSelection::new(line.id.clone(), line.short_name.clone())
}
