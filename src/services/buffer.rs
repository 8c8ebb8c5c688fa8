//! Coalescing mailbox between the feed read loop and the periodic flush.
//!
//! Producers deposit the latest known position per vehicle; the single
//! consumer drains the whole pending set atomically. Only the newest position
//! per vehicle matters, so an overwritten deposit is dropped silently.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::{VehicleKey, VehiclePosition};

/// Bounded-by-construction pending-update store: at most one entry per
/// tracked vehicle, plus generation-stamped removal intents used by the
/// display layer's exit handshake.
#[derive(Debug, Default)]
pub struct UpdateBuffer {
    pending: Mutex<HashMap<VehicleKey, VehiclePosition>>,
    removals: Mutex<HashMap<VehicleKey, u64>>,
    removal_generation: AtomicU64,
}

impl UpdateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest position for a vehicle, replacing any pending one.
    /// Safe to call concurrently from any number of producers.
    pub fn deposit(&self, position: VehiclePosition) {
        self.pending.lock().insert(position.key(), position);
    }

    /// Atomically take and return every pending update. Draining an empty
    /// buffer returns an empty map.
    pub fn drain_all(&self) -> HashMap<VehicleKey, VehiclePosition> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Register an intent to remove a vehicle from display, returning its
    /// generation stamp. A later `confirm_removal` applies only when the
    /// stamp still matches, so a vehicle that reappeared (and re-registered
    /// or cancelled) in the meantime keeps its annotation.
    pub fn begin_removal(&self, key: VehicleKey) -> u64 {
        let generation = self.removal_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.removals.lock().insert(key, generation);
        generation
    }

    /// Drop a pending removal intent, e.g. because the vehicle came back.
    pub fn cancel_removal(&self, key: &VehicleKey) {
        self.removals.lock().remove(key);
    }

    /// Complete a removal intent. Returns `true` and clears the intent only
    /// when `generation` matches the currently pending one; a stale or
    /// unknown stamp returns `false` and leaves state untouched.
    pub fn confirm_removal(&self, key: &VehicleKey, generation: u64) -> bool {
        let mut removals = self.removals.lock();
        match removals.get(key) {
            Some(current) if *current == generation => {
                removals.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Wipe all pending updates and removal intents.
    pub fn clear(&self) {
        self.pending.lock().clear();
        self.removals.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VehicleKind;
    use std::sync::Arc;

    fn make_position(id: i64, lat: f64) -> VehiclePosition {
        VehiclePosition {
            id,
            kind: VehicleKind::Bus,
            line: "550".to_string(),
            route_id: Some("2550".to_string()),
            headsign: None,
            lat,
            lon: 24.94,
            heading: None,
            timestamp: 1_700_000_000,
        }
    }

    // --- deposit/drain tests ---

    #[test]
    fn second_deposit_wins_for_same_vehicle() {
        let buffer = UpdateBuffer::new();
        buffer.deposit(make_position(1, 60.10));
        buffer.deposit(make_position(1, 60.20));

        let drained = buffer.drain_all();
        assert_eq!(drained.len(), 1);
        let entry = drained.values().next().unwrap();
        assert_eq!(entry.lat, 60.20);
    }

    #[test]
    fn drain_empties_the_buffer() {
        let buffer = UpdateBuffer::new();
        buffer.deposit(make_position(1, 60.10));
        buffer.deposit(make_position(2, 60.11));

        assert_eq!(buffer.drain_all().len(), 2);
        assert!(buffer.drain_all().is_empty());
        assert!(buffer.drain_all().is_empty());
    }

    #[test]
    fn vehicles_of_different_kinds_do_not_collide() {
        let buffer = UpdateBuffer::new();
        buffer.deposit(make_position(1, 60.10));
        buffer.deposit(VehiclePosition {
            kind: VehicleKind::Tram,
            ..make_position(1, 60.30)
        });
        assert_eq!(buffer.drain_all().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_deposits_all_land() {
        let buffer = Arc::new(UpdateBuffer::new());
        let mut handles = Vec::new();
        for id in 0..32 {
            let buffer = buffer.clone();
            handles.push(tokio::spawn(async move {
                for step in 0..50 {
                    buffer.deposit(make_position(id, 60.0 + step as f64));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let drained = buffer.drain_all();
        assert_eq!(drained.len(), 32);
        for entry in drained.values() {
            assert_eq!(entry.lat, 109.0);
        }
    }

    // --- removal handshake tests ---

    #[test]
    fn matching_generation_confirms_removal() {
        let buffer = UpdateBuffer::new();
        let key = make_position(1, 60.10).key();
        let generation = buffer.begin_removal(key);
        assert!(buffer.confirm_removal(&key, generation));
        // Already consumed.
        assert!(!buffer.confirm_removal(&key, generation));
    }

    #[test]
    fn superseded_removal_is_rejected() {
        let buffer = UpdateBuffer::new();
        let key = make_position(1, 60.10).key();
        let first = buffer.begin_removal(key);
        let second = buffer.begin_removal(key);
        assert!(!buffer.confirm_removal(&key, first));
        assert!(buffer.confirm_removal(&key, second));
    }

    #[test]
    fn cancelled_removal_is_rejected() {
        let buffer = UpdateBuffer::new();
        let key = make_position(1, 60.10).key();
        let generation = buffer.begin_removal(key);
        buffer.cancel_removal(&key);
        assert!(!buffer.confirm_removal(&key, generation));
    }

    #[test]
    fn clear_wipes_updates_and_removals() {
        let buffer = UpdateBuffer::new();
        let key = make_position(1, 60.10).key();
        buffer.deposit(make_position(1, 60.10));
        let generation = buffer.begin_removal(key);

        buffer.clear();
        assert!(buffer.drain_all().is_empty());
        assert!(!buffer.confirm_removal(&key, generation));
    }
}
