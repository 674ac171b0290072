use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bot::Bot;
use crate::dispatch::{
    Action, ActionHandler, DeliveryContext, GROUP_SERVICE, HandlerRegistry, Recipient,
};

const OUTBOX_CAP: usize = 100;

/// One delivered action, as recorded by the outbox handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub timestamp_ms: u64,
    pub bot: String,
    pub service_name: String,
    pub user_id: String,
    pub action: String,
    pub reply: String,
}

/// Dev-mode message sink shared across bots, capped at the newest
/// `OUTBOX_CAP` deliveries.
#[derive(Default)]
pub struct Outbox {
    inner: RwLock<Vec<DeliveryRecord>>,
}

pub type SharedOutbox = Arc<Outbox>;

impl Outbox {
    pub fn new() -> SharedOutbox {
        Arc::new(Self::default())
    }

    pub fn push(&self, record: DeliveryRecord) {
        let mut guard = self.inner.write();
        guard.push(record);
        let len = guard.len();
        if len > OUTBOX_CAP {
            let excess = len - OUTBOX_CAP;
            guard.drain(0..excess);
        }
    }

    pub fn entries(&self) -> Vec<DeliveryRecord> {
        self.inner.read().clone()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

/// Handler kinds that can be bound to a service name in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Console,
    Outbox,
}

/// Renders the bot's reply and logs the delivery.
pub struct ConsoleHandler {
    bot: Arc<Bot>,
}

impl ActionHandler for ConsoleHandler {
    fn create_context(&self, recipient: &Recipient, action: &Action) -> DeliveryContext {
        DeliveryContext::new(recipient, action)
    }

    fn execute(&self, context: DeliveryContext) -> Result<String> {
        let reply = self.bot.reply_for(&context.action)?;
        info!(
            bot = %self.bot.name(),
            service = %context.service_name,
            user = %context.user_id,
            action = %context.action.name(),
            %reply,
            "action delivered"
        );
        Ok(reply)
    }
}

/// Renders the bot's reply and records the delivery in the shared outbox.
pub struct OutboxHandler {
    bot: Arc<Bot>,
    outbox: SharedOutbox,
}

impl ActionHandler for OutboxHandler {
    fn create_context(&self, recipient: &Recipient, action: &Action) -> DeliveryContext {
        DeliveryContext::new(recipient, action)
    }

    fn execute(&self, context: DeliveryContext) -> Result<String> {
        let reply = self.bot.reply_for(&context.action)?;
        self.outbox.push(DeliveryRecord {
            timestamp_ms: now_millis(),
            bot: self.bot.name().to_string(),
            service_name: context.service_name,
            user_id: context.user_id,
            action: context.action.name().to_string(),
            reply: reply.clone(),
        });
        Ok(reply)
    }
}

/// Handler lookup backed by a map assembled at startup.
#[derive(Default)]
pub struct MapRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry for MapRegistry {
    fn lookup(&self, service_name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(service_name).cloned()
    }
}

/// Build one bot's handler registry from its configured service bindings.
pub fn build_registry(
    bot: &Arc<Bot>,
    services: &HashMap<String, HandlerKind>,
    outbox: &SharedOutbox,
) -> Result<Arc<MapRegistry>> {
    let mut handlers: HashMap<String, Arc<dyn ActionHandler>> = HashMap::new();
    for (service_name, kind) in services {
        if service_name == GROUP_SERVICE {
            bail!(
                "bot {} binds a handler to the reserved service name {GROUP_SERVICE:?}",
                bot.name()
            );
        }
        let handler: Arc<dyn ActionHandler> = match kind {
            HandlerKind::Console => Arc::new(ConsoleHandler { bot: bot.clone() }),
            HandlerKind::Outbox => Arc::new(OutboxHandler {
                bot: bot.clone(),
                outbox: outbox.clone(),
            }),
        };
        handlers.insert(service_name.clone(), handler);
    }
    Ok(Arc::new(MapRegistry { handlers }))
}

pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
