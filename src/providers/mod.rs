//! Network-facing clients: the GraphQL query API and the vehicle position
//! feed, plus the retry policy they share.

pub mod feed;
pub mod graphql;
pub mod retry;

pub use feed::{FeedError, FeedMessage, MqttFeed, VehicleFeed};
pub use graphql::{QueryError, TransitQueryClient};
pub use retry::RetryPolicy;
