//! Built-in handlers and middleware

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::pipeline::{Handler, Middleware, Next};
use crate::types::{DashSet, Message, MessageId};
use crate::{Error, Result};

/// Global handler that logs every message passing through the pipeline.
pub struct LoggingHandler {
    level: log::Level,
}

impl Default for LoggingHandler {
    fn default() -> Self {
        Self { level: log::Level::Info }
    }
}

impl LoggingHandler {
    #[inline]
    pub fn new(level: log::Level) -> Self {
        Self { level }
    }
}

#[async_trait]
impl Handler for LoggingHandler {
    async fn handle(&self, msg: Arc<Message>) -> Result<()> {
        log::log!(
            self.level,
            "message received, type: {}, id: {}, priority: {}",
            msg.typ,
            msg.id,
            msg.effective_priority()
        );
        Ok(())
    }
}

/// Rejects messages whose payload lacks any of the required fields.
pub struct ValidationHandler {
    required: Vec<String>,
}

impl ValidationHandler {
    #[inline]
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { required: required.into_iter().map(Into::into).collect() }
    }
}

#[async_trait]
impl Handler for ValidationHandler {
    async fn handle(&self, msg: Arc<Message>) -> Result<()> {
        let missing = self
            .required
            .iter()
            .filter(|f| msg.payload.get(f.as_str()).map(|v| v.is_null()).unwrap_or(true))
            .map(|f| f.as_str())
            .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "message {} of type {} is missing required fields: {}",
                msg.id,
                msg.typ,
                missing.join(", ")
            )))
        }
    }
}

#[derive(Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, msg: Arc<Message>, next: Next<'_>) -> Result<()> {
        let (id, typ) = (msg.id.clone(), msg.typ.clone());
        log::debug!("pipeline enter, type: {}, id: {}", typ, id);
        let res = next.run(msg).await;
        match &res {
            Ok(()) => log::debug!("pipeline done, type: {}, id: {}", typ, id),
            Err(e) => log::warn!("pipeline failed, type: {}, id: {}, {}", typ, id, e),
        }
        res
    }
}

/// Drops messages whose id was already seen within the last `window` ids.
pub struct DedupMiddleware {
    window: usize,
    seen: DashSet<MessageId>,
    order: Mutex<VecDeque<MessageId>>,
}

impl DedupMiddleware {
    #[inline]
    pub fn new(window: usize) -> Self {
        Self { window: window.max(1), seen: DashSet::default(), order: Mutex::new(VecDeque::new()) }
    }

    ///Returns false if the id is already inside the window
    #[inline]
    fn remember(&self, id: &str) -> bool {
        let mut order = self.order.lock();
        if !self.seen.insert(id.to_owned()) {
            return false;
        }
        order.push_back(id.to_owned());
        while order.len() > self.window {
            if let Some(old) = order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

#[async_trait]
impl Middleware for DedupMiddleware {
    async fn handle(&self, msg: Arc<Message>, next: Next<'_>) -> Result<()> {
        if self.remember(&msg.id) {
            next.run(msg).await
        } else {
            log::debug!("duplicate message dropped, type: {}, id: {}", msg.typ, msg.id);
            Ok(())
        }
    }
}
