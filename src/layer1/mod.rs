// Layer 1 - Connectors
// Inbound price feed and outbound signal delivery

pub mod feed_client;
pub mod signal_publisher;

// Re-export commonly used items for convenience
pub use feed_client::{FeedClient, FeedError, FeedHandler, FeedStats};
pub use signal_publisher::{
    EventBusSink, JsonLinesSink, PublishError, PublisherStats, SignalPublisher, SignalSink,
};
