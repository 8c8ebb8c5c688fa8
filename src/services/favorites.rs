//! Persistence seam for favorite lines.
//!
//! Actual on-disk storage lives in the surrounding app; the tracking core
//! only needs somewhere to load from at startup and write through on toggle.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::models::VehicleKind;

/// Storage for the per-kind ordered list of favorite line names.
pub trait FavoritesStore: Send + Sync {
    fn load(&self, kind: VehicleKind) -> Vec<String>;
    fn save(&self, kind: VehicleKind, lines: &[String]);
}

/// In-memory store, used by tests and the headless binary.
#[derive(Debug, Default)]
pub struct MemoryFavoritesStore {
    lines: Mutex<HashMap<VehicleKind, Vec<String>>>,
}

impl MemoryFavoritesStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FavoritesStore for MemoryFavoritesStore {
    fn load(&self, kind: VehicleKind) -> Vec<String> {
        self.lines.lock().get(&kind).cloned().unwrap_or_default()
    }

    fn save(&self, kind: VehicleKind, lines: &[String]) {
        self.lines.lock().insert(kind, lines.to_vec());
    }
}
