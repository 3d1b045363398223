#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use polybus::adapter::MemoryAdapter;
//! use polybus::conf::{Options, Settings};
//! use polybus::subscribe::{callback, Filters, Subscription};
//! use polybus::types::{Priority, PublishOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> polybus::Result<()> {
//!     let settings = Settings::new(Options::default())?;
//!     let _logger = polybus::logger::init_logger(&settings.log)?;
//!
//!     let mgr = polybus::PubSubManager::new(settings, Arc::new(MemoryAdapter::default()));
//!     mgr.connect().await?;
//!
//!     let sub = Subscription::new("order.created", callback(|msg| async move {
//!         log::info!("order {}", msg.payload["order_id"]);
//!         Ok(())
//!     }))
//!     .filters(Filters::compile([("region", json!("us-*"))])?);
//!     mgr.subscribe(sub).await?;
//!
//!     mgr.publish(
//!         "order.created",
//!         json!({"order_id": 1, "region": "us-east"}),
//!         PublishOptions::default().priority(Priority::High),
//!     );
//!     mgr.flush().await?;
//!     mgr.disconnect().await
//! }
//! ```

/// Orchestration
pub mod adapter; // Broker adapter contract and in-memory broker
pub mod manager; // Queue draining, inbound dispatch, background loops

/// Building Blocks
pub mod breaker; // Circuit breaker
pub mod handlers; // Built-in handlers and middleware
pub mod monitor; // Latency windows and broker metrics
pub mod pipeline; // Handler/middleware chain
pub mod queue; // Priority queues with dead-letter stores
pub mod retry; // Retry policy
pub mod subscribe; // Subscription registry and filters

/// Support
pub mod error;
pub mod logger;
pub mod stats;
pub mod types;

pub use error::{Error, Result};
pub use manager::PubSubManager;
pub use polybus_conf as conf;
pub use polybus_utils as utils;
