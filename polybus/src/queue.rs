//! Outbound priority queues with per-topic dead-letter stores
//!
//! Every topic owns a bounded live queue kept in descending priority order
//! (FIFO inside a priority band) and an unbounded dead-letter store. A push
//! against a full live queue never fails towards the caller: the message is
//! diverted to the topic's dead-letter store instead.
//!
//! ## Concurrency
//! Topic entries live in a sharded `DashMap`; every mutation of a topic's
//! ordered structure happens while holding that entry's shard lock, so
//! concurrent enqueue/dequeue on one topic are serialized. No lock is held
//! across an `.await`.

use std::collections::VecDeque;

use crate::types::{DashMap, Message, Topic};

/// Where an enqueued message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    DeadLettered,
}

/// Bounded live queue of one topic, ordered by priority.
pub struct Queue {
    cap: usize,
    inner: VecDeque<Message>,
}

impl Queue {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap, inner: VecDeque::new() }
    }

    ///Inserts before the first entry with a strictly lower priority, hands the
    ///message back when the queue is full
    #[inline]
    pub fn push(&mut self, v: Message) -> Result<(), Message> {
        if self.inner.len() >= self.cap {
            return Err(v);
        }
        let priority = v.effective_priority();
        match self.inner.iter().position(|m| m.effective_priority() < priority) {
            Some(idx) => self.inner.insert(idx, v),
            None => self.inner.push_back(v),
        }
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Message> {
        self.inner.pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct TopicQueue {
    live: Queue,
    dead: Vec<Message>,
}

impl TopicQueue {
    fn new(cap: usize) -> Self {
        Self { live: Queue::new(cap), dead: Vec::new() }
    }
}

pub struct PriorityQueue {
    max_queue_size: usize,
    topics: DashMap<Topic, TopicQueue>,
}

impl PriorityQueue {
    #[inline]
    pub fn new(max_queue_size: usize) -> Self {
        Self { max_queue_size, topics: DashMap::default() }
    }

    #[inline]
    pub fn enqueue(&self, topic: &str, msg: Message) -> Enqueued {
        let mut entry = self.topics.entry(topic.to_owned()).or_insert_with(|| TopicQueue::new(self.max_queue_size));
        let tq = entry.value_mut();
        if let Err(msg) = tq.live.push(msg) {
            log::warn!(
                "queue is full, topic: {}, queue len is {}, message {} moved to dead-letter store",
                topic,
                tq.live.len(),
                msg.id
            );
            tq.dead.push(msg);
            Enqueued::DeadLettered
        } else {
            Enqueued::Queued
        }
    }

    #[inline]
    pub fn dequeue(&self, topic: &str) -> Option<Message> {
        let msg = self.topics.get_mut(topic).and_then(|mut tq| tq.live.pop());
        self.prune(topic);
        msg
    }

    #[inline]
    pub fn queue_size(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|tq| tq.live.len()).unwrap_or_default()
    }

    #[inline]
    pub fn dlq_messages(&self, topic: &str) -> Vec<Message> {
        self.topics.get(topic).map(|tq| tq.dead.clone()).unwrap_or_default()
    }

    ///Removes and returns a topic's dead letters, for external redrive
    #[inline]
    pub fn take_dlq_messages(&self, topic: &str) -> Vec<Message> {
        let dead = self.topics.get_mut(topic).map(|mut tq| std::mem::take(&mut tq.dead)).unwrap_or_default();
        self.prune(topic);
        dead
    }

    //drops the entry of a topic with nothing queued and nothing dead-lettered
    #[inline]
    fn prune(&self, topic: &str) {
        self.topics.remove_if(topic, |_, tq| tq.live.is_empty() && tq.dead.is_empty());
    }

    ///Topics that currently hold at least one live message
    #[inline]
    pub fn topics(&self) -> Vec<Topic> {
        self.topics.iter().filter(|e| !e.live.is_empty()).map(|e| e.key().clone()).collect()
    }

    #[inline]
    pub fn total_queued(&self) -> usize {
        self.topics.iter().map(|e| e.live.len()).sum()
    }

    #[inline]
    pub fn total_dead_lettered(&self) -> usize {
        self.topics.iter().map(|e| e.dead.len()).sum()
    }

    #[inline]
    pub fn clear(&self, topic: Option<&str>) {
        match topic {
            Some(topic) => {
                self.topics.remove(topic);
            }
            None => self.topics.clear(),
        }
    }
}
