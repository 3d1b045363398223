use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{Adapter, DeliveryFn, SubscriptionHandle};
use crate::types::{new_message_id, DashMap, Message, SubscribeOptions, Topic};
use crate::utils::Counter;
use crate::{Error, Result};

struct Subscriber {
    id: String,
    group: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
}

/// Loopback broker kept entirely in process.
///
/// Each subscription owns a delivery task fed through an unbounded channel,
/// so a subscriber sees messages in publish order. Subscribers of a topic that
/// share a queue group (or consumer group) receive its messages round-robin;
/// every other subscriber receives every message.
pub struct MemoryAdapter {
    name: String,
    connected: AtomicBool,
    topics: DashMap<Topic, Vec<Subscriber>>,
    cursors: DashMap<(Topic, String), usize>,
    published: Counter,
    delivered: Counter,
    subscriptions: Counter,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryAdapter {
    #[inline]
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            connected: AtomicBool::new(false),
            topics: DashMap::default(),
            cursors: DashMap::default(),
            published: Counter::new(),
            delivered: Counter::new(),
            subscriptions: Counter::new(),
        }
    }

    #[inline]
    fn check_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    #[inline]
    fn next_in_group(&self, topic: &str, group: &str, members: usize) -> usize {
        let mut cursor = self.cursors.entry((topic.to_owned(), group.to_owned())).or_insert(0);
        let idx = *cursor % members;
        *cursor = cursor.wrapping_add(1);
        idx
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        log::info!("{} adapter connected", self.name);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        //dropping the senders ends every delivery task
        self.topics.clear();
        self.cursors.clear();
        self.subscriptions.set(0);
        log::info!("{} adapter disconnected", self.name);
        Ok(())
    }

    async fn publish(&self, topic: &str, msg: &Message) -> Result<()> {
        self.check_connected()?;
        self.published.inc();
        let Some(subs) = self.topics.get(topic) else {
            log::debug!("{} adapter, no subscribers on topic {}", self.name, topic);
            return Ok(());
        };

        let mut targets = Vec::new();
        let mut groups: Vec<(&str, Vec<&Subscriber>)> = Vec::new();
        for sub in subs.iter() {
            match sub.group.as_deref() {
                None => targets.push(sub),
                Some(g) => match groups.iter_mut().find(|(name, _)| *name == g) {
                    Some((_, members)) => members.push(sub),
                    None => groups.push((g, vec![sub])),
                },
            }
        }
        for (group, members) in groups {
            let idx = self.next_in_group(topic, group, members.len());
            targets.push(members[idx]);
        }

        for sub in targets {
            if sub.tx.send(msg.clone()).is_err() {
                log::warn!("{} adapter, subscriber {} on topic {} is gone", self.name, sub.id, topic);
            } else {
                self.delivered.inc();
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        delivery: DeliveryFn,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        self.check_connected()?;
        let id = new_message_id();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                delivery(msg).await;
            }
        });
        self.topics.entry(topic.to_owned()).or_default().push(Subscriber {
            id: id.clone(),
            group: opts.group().map(ToOwned::to_owned),
            tx,
        });
        self.subscriptions.inc();
        Ok(SubscriptionHandle { topic: topic.to_owned(), id })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<bool> {
        let removed = match self.topics.get_mut(&handle.topic) {
            Some(mut subs) => {
                let len = subs.len();
                subs.retain(|s| s.id != handle.id);
                len != subs.len()
            }
            None => false,
        };
        self.topics.remove_if(&handle.topic, |_, subs| subs.is_empty());
        if removed {
            self.subscriptions.dec();
        }
        Ok(removed)
    }

    #[inline]
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn metrics(&self) -> Option<Value> {
        Some(json!({
            "published": self.published.count(),
            "delivered": self.delivered.count(),
            "subscriptions": self.subscriptions.count(),
            "topics": self.topics.len(),
        }))
    }
}
