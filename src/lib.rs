// src/lib.rs

pub mod client;
pub mod config;
pub mod core;

// Re-export
pub use crate::client::Client;
pub use crate::config::{ClientConfig, NodeAddress};
pub use crate::core::batch::{Batch, BatchOptions, BatchRetryStrategy};
pub use crate::core::commands::Cmd;
pub use crate::core::cluster::{ClusterScanCursor, ScanOptions};
pub use crate::core::errors::CitrineError;
pub use crate::core::protocol::Value;
pub use crate::core::pubsub::{PubSubChannelMode, PubSubMsg};
pub use crate::core::routing::RouteIntent;
