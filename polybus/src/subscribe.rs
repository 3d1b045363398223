use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;

use crate::types::{new_message_id, DashMap, HashMap, Message, Priority, SubscribeOptions, SubscriptionId, Topic};
use crate::Result;

pub const WILDCARD: char = '*';

/// Subscriber callback, invoked after filters and the handler pipeline.
pub type Callback = Arc<dyn Fn(Arc<Message>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[inline]
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// One compiled filter value, resolved once when the subscription is built.
#[derive(Debug, Clone)]
pub enum FilterValue {
    Exact(Value),
    ///Wildcard pattern, `*` matches zero or more characters anywhere in the
    ///stringified candidate
    Pattern(Regex),
}

impl FilterValue {
    #[inline]
    pub fn pattern(pattern: &str) -> Result<Self> {
        let re = pattern.split(WILDCARD).map(regex::escape).collect::<Vec<_>>().join(".*");
        Ok(FilterValue::Pattern(Regex::new(&re)?))
    }

    ///String values containing a wildcard become patterns, anything else is exact
    #[inline]
    pub fn compile(v: Value) -> Result<Self> {
        match v {
            Value::String(s) if s.contains(WILDCARD) => Self::pattern(&s),
            v => Ok(FilterValue::Exact(v)),
        }
    }

    #[inline]
    pub fn matches(&self, candidate: &Value) -> bool {
        match self {
            FilterValue::Exact(v) => v == candidate,
            FilterValue::Pattern(re) => match candidate {
                Value::String(s) => re.is_match(s),
                other => re.is_match(&other.to_string()),
            },
        }
    }
}

/// AND-combined key/value filters over payload fields, falling back to metadata.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    items: Vec<(String, FilterValue)>,
}

impl Filters {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn compile<I, K>(filters: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let items = filters
            .into_iter()
            .map(|(k, v)| FilterValue::compile(v).map(|v| (k.into(), v)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { items })
    }

    #[inline]
    pub fn exact<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.items.push((key.into(), FilterValue::Exact(value)));
        self
    }

    #[inline]
    pub fn pattern<K: Into<String>>(mut self, key: K, pattern: &str) -> Result<Self> {
        self.items.push((key.into(), FilterValue::pattern(pattern)?));
        Ok(self)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn matches(&self, msg: &Message) -> bool {
        self.items.iter().all(|(key, fv)| msg.field(key).map(|candidate| fv.matches(candidate)).unwrap_or(false))
    }
}

pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: Topic,
    pub filters: Filters,
    pub callback: Callback,
    pub priority: Option<Priority>,
    pub opts: SubscribeOptions,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("filters", &self.filters)
            .field("priority", &self.priority)
            .field("opts", &self.opts)
            .finish()
    }
}

impl Subscription {
    #[inline]
    pub fn new<T: Into<Topic>>(topic: T, callback: Callback) -> Self {
        Self {
            id: new_message_id(),
            topic: topic.into(),
            filters: Filters::default(),
            callback,
            priority: None,
            opts: SubscribeOptions::default(),
        }
    }

    #[inline]
    pub fn id<S: Into<SubscriptionId>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    #[inline]
    pub fn filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    #[inline]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[inline]
    pub fn consumer_group<S: Into<String>>(mut self, group: S) -> Self {
        self.opts.consumer_group = Some(group.into());
        self
    }

    #[inline]
    pub fn queue_group<S: Into<String>>(mut self, group: S) -> Self {
        self.opts.queue_group = Some(group.into());
        self
    }

    #[inline]
    pub fn matches(&self, msg: &Message) -> bool {
        self.filters.matches(msg)
    }
}

/// topic → subscriptions index, bound to one orchestrator instance.
#[derive(Default)]
pub struct SubscriptionRegistry {
    topics: DashMap<Topic, HashMap<SubscriptionId, Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    ///A subscription whose id already exists under the topic replaces it
    #[inline]
    pub fn subscribe(&self, sub: Arc<Subscription>) -> Option<Arc<Subscription>> {
        let prev = self.topics.entry(sub.topic.clone()).or_default().insert(sub.id.clone(), sub.clone());
        if prev.is_some() {
            log::debug!("subscription {} on topic {} replaced", sub.id, sub.topic);
        }
        prev
    }

    #[inline]
    pub fn unsubscribe(&self, topic: &str, id: &str) -> bool {
        match self.topics.entry(topic.to_owned()) {
            Entry::Occupied(mut e) => {
                let removed = e.get_mut().remove(id).is_some();
                if e.get().is_empty() {
                    e.remove();
                }
                removed
            }
            Entry::Vacant(_) => false,
        }
    }

    #[inline]
    pub fn get(&self, topic: &str, id: &str) -> Option<Arc<Subscription>> {
        self.topics.get(topic).and_then(|subs| subs.get(id).cloned())
    }

    #[inline]
    pub fn subscriptions(&self, topic: &str) -> Vec<Arc<Subscription>> {
        self.topics.get(topic).map(|subs| subs.values().cloned().collect()).unwrap_or_default()
    }

    #[inline]
    pub fn topics(&self) -> Vec<Topic> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    #[inline]
    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.topics.iter().map(|e| e.len()).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[inline]
pub fn matches_filters(msg: &Message, filters: &Filters) -> bool {
    filters.matches(msg)
}
