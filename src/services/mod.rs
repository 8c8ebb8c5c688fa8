//! Stream-processing services: wire decoding, subscription reconciliation,
//! the coalescing update buffer, typed query operations and the favorites
//! seam.

pub mod buffer;
pub mod decoder;
pub mod favorites;
pub mod queries;
pub mod subscriptions;

pub use buffer::UpdateBuffer;
pub use favorites::{FavoritesStore, MemoryFavoritesStore};
pub use queries::RouteSummary;
pub use subscriptions::{SubscriptionChange, SubscriptionReconciler};
