use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;

use crate::types::{HashMap, Message, MessageType};
use crate::Result;

pub type HandlerPriority = i32;

#[async_trait]
pub trait Handler: Sync + Send {
    ///Handlers that return false are skipped for this message
    #[inline]
    fn can_handle(&self, _msg: &Message) -> bool {
        true
    }

    async fn handle(&self, msg: Arc<Message>) -> Result<()>;
}

/// A step in the middleware chain. Call `next.run(msg)` to continue, or
/// return without calling it to stop the message here.
#[async_trait]
pub trait Middleware: Sync + Send {
    async fn handle(&self, msg: Arc<Message>, next: Next<'_>) -> Result<()>;
}

#[derive(Clone)]
struct HandlerEntry {
    priority: HandlerPriority,
    handler: Arc<dyn Handler>,
}

///Snapshot of the pipeline taken when a message enters it
struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
    handlers: Vec<Arc<dyn Handler>>,
}

impl Chain {
    async fn dispatch(&self, msg: Arc<Message>) -> Result<()> {
        let mut tasks = self
            .handlers
            .iter()
            .filter(|h| h.can_handle(&msg))
            .map(|h| {
                let (h, msg) = (h.clone(), msg.clone());
                tokio::spawn(async move { h.handle(msg).await })
            })
            .collect::<FuturesUnordered<_>>();

        //dropping the remaining join handles detaches them, nothing is cancelled
        while let Some(res) = tasks.next().await {
            res??;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a Chain,
    index: usize,
}

impl<'a> Next<'a> {
    pub fn run(self, msg: Arc<Message>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self.chain.middlewares.get(self.index) {
                Some(mw) => mw.handle(msg, Next { chain: self.chain, index: self.index + 1 }).await,
                None => self.chain.dispatch(msg).await,
            }
        })
    }
}

#[derive(Default)]
pub struct Pipeline {
    typed: RwLock<HashMap<MessageType, Vec<HandlerEntry>>>,
    global: RwLock<Vec<HandlerEntry>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Pipeline {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn register<T: Into<MessageType>>(&self, typ: T, handler: Arc<dyn Handler>, priority: HandlerPriority) {
        let mut typed = self.typed.write();
        let entries = typed.entry(typ.into()).or_default();
        Self::insert(entries, HandlerEntry { priority, handler });
    }

    #[inline]
    pub fn register_global(&self, handler: Arc<dyn Handler>, priority: HandlerPriority) {
        Self::insert(&mut self.global.write(), HandlerEntry { priority, handler });
    }

    #[inline]
    pub fn add_middleware(&self, mw: Arc<dyn Middleware>) {
        self.middlewares.write().push(mw);
    }

    #[inline]
    fn insert(entries: &mut Vec<HandlerEntry>, entry: HandlerEntry) {
        entries.push(entry);
        //stable, equal priorities keep registration order
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    #[inline]
    fn chain(&self, typ: &str) -> Chain {
        let mut handlers = self.global.read().iter().map(|e| e.handler.clone()).collect::<Vec<_>>();
        if let Some(entries) = self.typed.read().get(typ) {
            handlers.extend(entries.iter().map(|e| e.handler.clone()));
        }
        Chain { middlewares: self.middlewares.read().clone(), handlers }
    }

    ///Runs the middleware chain, then every matching handler concurrently.
    ///The first handler failure is returned; handlers already started keep
    ///running to completion.
    pub async fn handle(&self, msg: Arc<Message>) -> Result<()> {
        let chain = self.chain(&msg.typ);
        Next { chain: &chain, index: 0 }.run(msg).await
    }

    #[inline]
    pub fn handlers_count(&self) -> usize {
        self.global.read().len() + self.typed.read().values().map(|v| v.len()).sum::<usize>()
    }

    #[inline]
    pub fn middlewares_count(&self) -> usize {
        self.middlewares.read().len()
    }
}
