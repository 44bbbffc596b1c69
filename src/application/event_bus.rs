//! Event Bus
//!
//! In-process typed fan-out for bot lifecycle events. Subscriptions filter
//! by user or by bot and hand back an idempotent unsubscribe handle. A
//! panicking handler is isolated: it is logged and the remaining handlers
//! still run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::domain::events::BotEvent;

pub type EventHandler = Arc<dyn Fn(&BotEvent) + Send + Sync>;

#[derive(Clone)]
enum Filter {
    User(String),
    Bot(String),
}

impl Filter {
    fn matches(&self, event: &BotEvent) -> bool {
        match self {
            Filter::User(user_id) => event.user_id == *user_id,
            Filter::Bot(bot_id) => event.bot_id == *bot_id,
        }
    }
}

struct Entry {
    filter: Filter,
    handler: EventHandler,
}

#[derive(Default)]
pub struct EventBus {
    entries: RwLock<HashMap<u64, Entry>>,
    next_id: AtomicU64,
}

/// Handle returned from a subscription; `unsubscribe` may be called any
/// number of times.
pub struct Subscription {
    bus: Arc<EventBus>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.bus.entries.write().unwrap().remove(&self.id);
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver only events belonging to `user_id`
    pub fn subscribe_user(
        self: &Arc<Self>,
        user_id: impl Into<String>,
        handler: EventHandler,
    ) -> Subscription {
        self.subscribe(Filter::User(user_id.into()), handler)
    }

    /// Deliver only events for `bot_id`
    pub fn subscribe_bot(
        self: &Arc<Self>,
        bot_id: impl Into<String>,
        handler: EventHandler,
    ) -> Subscription {
        self.subscribe(Filter::Bot(bot_id.into()), handler)
    }

    fn subscribe(self: &Arc<Self>, filter: Filter, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries
            .write()
            .unwrap()
            .insert(id, Entry { filter, handler });
        Subscription {
            bus: Arc::clone(self),
            id,
        }
    }

    /// Fan an event out to matching handlers. Safe to call from any task.
    pub fn emit(&self, event: &BotEvent) {
        let handlers: Vec<EventHandler> = {
            let entries = self.entries.read().unwrap();
            entries
                .values()
                .filter(|e| e.filter.matches(event))
                .map(|e| Arc::clone(&e.handler))
                .collect()
        };

        for handler in handlers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
            if result.is_err() {
                tracing::error!(
                    event = event.kind.name(),
                    bot_id = %event.bot_id,
                    "Event handler panicked; other handlers unaffected"
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Drop every subscription. Process-teardown and test hook.
    pub fn reset(&self) {
        self.entries.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::BotEventKind;
    use std::sync::Mutex;

    fn collector() -> (EventHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let handler: EventHandler = Arc::new(move |event: &BotEvent| {
            seen_clone.lock().unwrap().push(event.bot_id.clone());
        });
        (handler, seen)
    }

    #[test]
    fn test_user_filter() {
        let bus = Arc::new(EventBus::new());
        let (handler, seen) = collector();
        bus.subscribe_user("alice", handler);

        bus.emit(&BotEvent::new("bot-1", "alice", BotEventKind::EngineStarted));
        bus.emit(&BotEvent::new("bot-2", "bob", BotEventKind::EngineStarted));

        assert_eq!(seen.lock().unwrap().as_slice(), ["bot-1"]);
    }

    #[test]
    fn test_bot_filter() {
        let bus = Arc::new(EventBus::new());
        let (handler, seen) = collector();
        bus.subscribe_bot("bot-2", handler);

        bus.emit(&BotEvent::new("bot-1", "alice", BotEventKind::EngineStarted));
        bus.emit(&BotEvent::new("bot-2", "alice", BotEventKind::EngineStarted));

        assert_eq!(seen.lock().unwrap().as_slice(), ["bot-2"]);
    }

    #[test]
    fn test_unsubscribe_idempotent() {
        let bus = Arc::new(EventBus::new());
        let (handler, seen) = collector();
        let subscription = bus.subscribe_user("alice", handler);

        subscription.unsubscribe();
        subscription.unsubscribe();

        bus.emit(&BotEvent::new("bot-1", "alice", BotEventKind::EngineStarted));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_panic_isolated() {
        let bus = Arc::new(EventBus::new());
        let panicking: EventHandler = Arc::new(|_| panic!("boom"));
        bus.subscribe_user("alice", panicking);

        let (handler, seen) = collector();
        bus.subscribe_user("alice", handler);

        bus.emit(&BotEvent::new("bot-1", "alice", BotEventKind::EngineStarted));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_multiple_subscribers_all_receive() {
        let bus = Arc::new(EventBus::new());
        let (h1, s1) = collector();
        let (h2, s2) = collector();
        bus.subscribe_user("alice", h1);
        bus.subscribe_bot("bot-1", h2);

        bus.emit(&BotEvent::new("bot-1", "alice", BotEventKind::EngineStarted));

        assert_eq!(s1.lock().unwrap().len(), 1);
        assert_eq!(s2.lock().unwrap().len(), 1);
    }
}
