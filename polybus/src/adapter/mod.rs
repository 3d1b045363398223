//! Broker adapter contract
//!
//! An adapter translates the broker-agnostic [`Message`] to one concrete
//! broker. The orchestrator only ever talks to a broker through this trait and
//! assumes the adapter provides at-least-once delivery to the callbacks it is
//! given on subscribe.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::types::{Message, SubscribeOptions, Topic};
use crate::Result;

pub mod memory;

pub use memory::MemoryAdapter;

/// Called by the adapter for every message it receives on a subscription.
pub type DeliveryFn = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

#[inline]
pub fn delivery_fn<F, Fut>(f: F) -> DeliveryFn
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Adapter-side identity of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub topic: Topic,
    pub id: String,
}

#[async_trait]
pub trait Adapter: Sync + Send {
    ///Broker name, used as the metrics key prefix
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn publish(&self, topic: &str, msg: &Message) -> Result<()>;

    async fn subscribe(
        &self,
        topic: &str,
        delivery: DeliveryFn,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle>;

    ///Returns false when the handle is unknown
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<bool>;

    fn is_connected(&self) -> bool;

    ///Broker reported metrics, polled periodically by the orchestrator
    async fn metrics(&self) -> Option<Value> {
        None
    }
}
