//! Aggregation of independent vehicle and stop sources into one
//! atomically-published, order-stable display list.
//!
//! Sources mutate their own cache at their own pace; a short single-shot
//! timer coalesces whatever arrived within one tick into a single rebuild,
//! and the rebuilt list is published only when it actually differs.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::manager::VehicleManager;
use crate::models::{StopMarker, VehicleKind, VehiclePosition};

/// Coalescing window between a cache mutation and the rebuild it triggers.
const REBUILD_DELAY: Duration = Duration::from_millis(32);

/// One entry of the aggregated display list.
#[derive(Debug, Clone, PartialEq)]
pub enum MapEntry {
    Vehicle(VehiclePosition),
    Stop(StopMarker),
}

struct MapCaches {
    buses: Vec<VehiclePosition>,
    trams: Vec<VehiclePosition>,
    stops: Vec<StopMarker>,
    rebuild_armed: bool,
}

struct MapStateInner {
    caches: Mutex<MapCaches>,
    entries_tx: watch::Sender<Arc<Vec<MapEntry>>>,
    rebuild_delay: Duration,
}

/// Merges per-kind vehicle lists and the stop layer into one display list.
///
/// Cheap to clone; all clones share the same caches. Must be used inside a
/// tokio runtime (rebuilds are scheduled as tasks).
#[derive(Clone)]
pub struct MapStateManager {
    inner: Arc<MapStateInner>,
}

impl MapStateManager {
    pub fn new() -> Self {
        Self::with_rebuild_delay(REBUILD_DELAY)
    }

    pub fn with_rebuild_delay(rebuild_delay: Duration) -> Self {
        let (entries_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(MapStateInner {
                caches: Mutex::new(MapCaches {
                    buses: Vec::new(),
                    trams: Vec::new(),
                    stops: Vec::new(),
                    rebuild_armed: false,
                }),
                entries_tx,
                rebuild_delay,
            }),
        }
    }

    /// The aggregated display list: bus layer, tram layer, stop layer, each
    /// sorted by id.
    pub fn entries(&self) -> watch::Receiver<Arc<Vec<MapEntry>>> {
        self.inner.entries_tx.subscribe()
    }

    /// Replace the vehicle cache for one kind. A no-op when the content is
    /// unchanged; otherwise arms the coalescing rebuild timer.
    pub fn set_vehicles(&self, kind: VehicleKind, vehicles: Vec<VehiclePosition>) {
        let mut caches = self.inner.caches.lock();
        let cache = match kind {
            VehicleKind::Bus => &mut caches.buses,
            VehicleKind::Tram => &mut caches.trams,
        };
        if *cache == vehicles {
            return;
        }
        *cache = vehicles;
        self.arm_rebuild(&mut caches);
    }

    /// Replace the stop layer. Same change detection and coalescing as the
    /// vehicle caches.
    pub fn set_stops(&self, stops: Vec<StopMarker>) {
        let mut caches = self.inner.caches.lock();
        if caches.stops == stops {
            return;
        }
        caches.stops = stops;
        self.arm_rebuild(&mut caches);
    }

    /// Forward a manager's published vehicle list into the matching cache.
    /// The task ends when the manager is dropped.
    pub fn attach_manager(&self, manager: &VehicleManager) -> JoinHandle<()> {
        let kind = manager.kind();
        let mut vehicles = manager.vehicle_list();
        let map = self.clone();
        tokio::spawn(async move {
            loop {
                let list = vehicles.borrow_and_update().as_ref().clone();
                map.set_vehicles(kind, list);
                if vehicles.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Arm the single-shot rebuild timer unless it is already armed, so any
    /// number of mutations within one window collapse into one rebuild.
    /// Mutations arriving while a rebuild runs find the flag cleared and arm
    /// the next window; nothing is dropped.
    fn arm_rebuild(&self, caches: &mut MapCaches) {
        if caches.rebuild_armed {
            return;
        }
        caches.rebuild_armed = true;

        let map = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(map.inner.rebuild_delay).await;
            map.rebuild();
        });
    }

    fn rebuild(&self) {
        let entries = {
            let mut caches = self.inner.caches.lock();
            caches.rebuild_armed = false;

            let mut buses = caches.buses.clone();
            let mut trams = caches.trams.clone();
            let mut stops = caches.stops.clone();
            buses.sort_by_key(|vehicle| vehicle.id);
            trams.sort_by_key(|vehicle| vehicle.id);
            stops.sort_by(|a, b| a.id.cmp(&b.id));

            let mut entries = Vec::with_capacity(buses.len() + trams.len() + stops.len());
            entries.extend(buses.into_iter().map(MapEntry::Vehicle));
            entries.extend(trams.into_iter().map(MapEntry::Vehicle));
            entries.extend(stops.into_iter().map(MapEntry::Stop));
            entries
        };

        // Publishing an identical list would only cause redundant downstream
        // work.
        let unchanged = *self.inner.entries_tx.borrow().as_ref() == entries;
        if unchanged {
            debug!("Skipping publish of unchanged display list");
            return;
        }
        self.inner.entries_tx.send_replace(Arc::new(entries));
    }
}

impl Default for MapStateManager {
    fn default() -> Self {
        Self::new()
    }
}
